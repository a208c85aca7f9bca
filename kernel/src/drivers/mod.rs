//! Hardware drivers the core cannot run without: the 8259 interrupt
//! controller and the PIT timer. Everything else (keyboard, storage, PCI)
//! lives outside the kernel core.

pub mod pic;
pub mod timer;
