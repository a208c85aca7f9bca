// =============================================================================
// Helios — Physical Memory Manager (Bitmap Frame Allocator)
// =============================================================================
//
// The PMM tracks which physical page frames (4 KiB each) are free or in
// use across a single *managed window* of physical memory.
//
// MANAGED WINDOW:
//   At init the boot memory map is scanned for the largest USABLE region
//   whose base is at or above 1 MiB. The window is that region, clipped to
//   the capacity of the static bitmap (8 KiB of bitmap = 65536 frames =
//   256 MiB). Non-usable map entries overlapping the window are pre-marked
//   allocated, and so are the lowest 256 frames of the window, keeping
//   early allocations away from anything the bootloader may still own.
//
// BITMAP LAYOUT:
//   bit = 1 → frame is USED (allocated or reserved)
//   bit = 0 → frame is FREE
//   Bit i corresponds to physical address `base + i * 4096`.
//
// ALLOCATION STRATEGY:
//   Single frame: first-fit scan, u64-at-a-time so fully-used chunks are
//   skipped 64 frames per compare. A cursor remembers where the last
//   allocation ended and is pulled back on free, which preserves the
//   lowest-clear-bit-first ordering while avoiding rescans.
//   Contiguous N: linear scan for N consecutive zero bits; the lowest
//   qualifying address wins.
//
// ERROR POLICY:
//   Freeing an unaligned, out-of-window or already-free frame is a
//   recoverable error: it is logged and ignored. Allocation failure
//   returns None. Only a boot map with no usable region ≥ 1 MiB is fatal.
//
// THREAD SAFETY:
//   The global PMM state is protected by a SpinLock. All public functions
//   acquire the lock before touching the bitmap.
//
// =============================================================================

use crate::memory::address::{PAGE_SIZE, PhysAddr};
use crate::memory::{MemoryRegion, RegionKind};
use crate::sync::SpinLock;

/// Size of the static bitmap in u64 words: 1024 words = 8 KiB = 65536
/// frames = 256 MiB of managed physical memory.
const BITMAP_WORDS: usize = 1024;

/// Maximum number of frames the bitmap can track.
pub const MAX_FRAMES: usize = BITMAP_WORDS * 64;

/// Number of low frames of the window reserved unconditionally.
const LOW_RESERVED_FRAMES: usize = 256;

/// Managed windows must start at or above this physical address.
const MIN_WINDOW_BASE: u64 = 0x10_0000; // 1 MiB

// =============================================================================
// Public types
// =============================================================================

/// Static facts about the managed window.
#[derive(Debug, Clone, Copy)]
pub struct PmmInfo {
    /// First physical address of the window (page-aligned).
    pub base: u64,
    /// End of the window (exclusive).
    pub end: u64,
    /// Number of frames tracked.
    pub frames: usize,
    /// Frame size in bytes (always 4096).
    pub frame_size: u64,
}

/// Snapshot of usage statistics, for boot reporting and diagnostics.
#[derive(Debug, Clone, Copy)]
pub struct MemoryStats {
    pub total_frames: usize,
    pub used_frames: usize,
    pub free_frames: usize,
    pub total_allocations: u64,
    pub failed_allocations: u64,
}

/// Recoverable frame errors. Logged at the call site and otherwise ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// Address unaligned or outside the managed window.
    InvalidAddress,
    /// The frame was already free.
    DoubleFree,
}

// =============================================================================
// Allocator
// =============================================================================

/// The bitmap-based physical frame allocator over one managed window.
///
/// Public module functions wrap a global instance behind a spinlock;
/// the struct itself is also constructed directly by unit tests.
pub struct FrameAllocator {
    bitmap: [u64; BITMAP_WORDS],
    /// Window base physical address.
    base: u64,
    /// Number of frames actually managed (≤ MAX_FRAMES).
    frames: usize,
    used: usize,
    /// First-fit cursor: index below which everything is known used.
    search_start: usize,
    total_allocations: u64,
    failed_allocations: u64,
}

impl FrameAllocator {
    /// Builds an allocator from the boot memory map.
    ///
    /// Selects the managed window, pre-marks non-usable overlaps and the
    /// low reserved frames. Returns `None` when the map has no usable
    /// region of at least 1 MiB starting at or above 1 MiB — the caller
    /// treats that as fatal.
    pub fn new(memory_map: &[MemoryRegion]) -> Option<Self> {
        // Pick the largest usable region at or above 1 MiB.
        let mut window_base = 0u64;
        let mut window_len = 0u64;
        let mut total_usable = 0u64;
        for region in memory_map {
            if region.kind != RegionKind::Usable {
                continue;
            }
            total_usable += region.length;
            if region.base >= MIN_WINDOW_BASE && region.length > window_len {
                window_base = region.base;
                window_len = region.length;
            }
        }

        if window_len < 1024 * 1024 {
            log::error!("no usable memory region of at least 1 MiB above 1 MiB");
            return None;
        }

        let mut frames = (window_len / PAGE_SIZE) as usize;
        if frames > MAX_FRAMES {
            log::info!(
                "clipping managed window from {} to {} frames (bitmap capacity)",
                frames,
                MAX_FRAMES
            );
            frames = MAX_FRAMES;
        }
        let window_end = window_base + frames as u64 * PAGE_SIZE;

        let mut pmm = Self {
            bitmap: [0; BITMAP_WORDS],
            base: window_base,
            frames,
            used: 0,
            search_start: 0,
            total_allocations: 0,
            failed_allocations: 0,
        };

        // Pre-mark every non-usable map entry that overlaps the window.
        for region in memory_map {
            if region.kind == RegionKind::Usable {
                continue;
            }
            if region.base >= window_end || region.end() <= window_base {
                continue;
            }
            let start = region.base.max(window_base);
            let end = region.end().min(window_end);
            let first = ((start - window_base) / PAGE_SIZE) as usize;
            let last = ((end - window_base).div_ceil(PAGE_SIZE)) as usize;
            for frame in first..last.min(frames) {
                pmm.used += pmm.set_bit(frame);
            }
        }

        // Reserve the low frames of the window.
        for frame in 0..LOW_RESERVED_FRAMES.min(frames) {
            pmm.used += pmm.set_bit(frame);
        }

        log::info!(
            "managing {:#x}..{:#x} ({} MiB window, {} MiB usable total, {} frames reserved)",
            window_base,
            window_end,
            (window_end - window_base) / (1024 * 1024),
            total_usable / (1024 * 1024),
            pmm.used,
        );

        Some(pmm)
    }

    /// Sets the bit for `frame`; returns 1 if it was previously clear.
    /// The return value lets callers keep the used counter exact even when
    /// reserved ranges overlap.
    #[inline]
    fn set_bit(&mut self, frame: usize) -> usize {
        let word = frame / 64;
        let mask = 1u64 << (frame % 64);
        if self.bitmap[word] & mask == 0 {
            self.bitmap[word] |= mask;
            1
        } else {
            0
        }
    }

    #[inline]
    fn clear_bit(&mut self, frame: usize) {
        self.bitmap[frame / 64] &= !(1u64 << (frame % 64));
    }

    #[inline]
    fn bit_is_set(&self, frame: usize) -> bool {
        self.bitmap[frame / 64] & (1u64 << (frame % 64)) != 0
    }

    #[inline]
    fn frame_addr(&self, frame: usize) -> PhysAddr {
        PhysAddr::new(self.base + frame as u64 * PAGE_SIZE)
    }

    /// Converts a physical address to its frame index, verifying alignment
    /// and window membership.
    fn frame_index(&self, addr: PhysAddr) -> Result<usize, FrameError> {
        let raw = addr.as_u64();
        if !addr.is_page_aligned() || raw < self.base {
            return Err(FrameError::InvalidAddress);
        }
        let frame = ((raw - self.base) / PAGE_SIZE) as usize;
        if frame >= self.frames {
            return Err(FrameError::InvalidAddress);
        }
        Ok(frame)
    }

    /// Allocates a single frame: the lowest clear bit in the bitmap.
    pub fn alloc_frame(&mut self) -> Option<PhysAddr> {
        let start_word = self.search_start / 64;
        for word in start_word..BITMAP_WORDS {
            let chunk = self.bitmap[word];
            if chunk == u64::MAX {
                continue; // all 64 frames used, skip the whole word
            }
            let bit = (!chunk).trailing_zeros() as usize;
            let frame = word * 64 + bit;
            if frame >= self.frames {
                break;
            }
            self.bitmap[word] |= 1 << bit;
            self.used += 1;
            self.search_start = frame + 1;
            self.total_allocations += 1;
            return Some(self.frame_addr(frame));
        }
        self.failed_allocations += 1;
        log::warn!("out of physical memory");
        None
    }

    /// Allocates `count` physically contiguous frames and returns the base
    /// of the run. First fit: the lowest qualifying run wins.
    pub fn alloc_frames(&mut self, count: usize) -> Option<PhysAddr> {
        if count == 0 {
            return None;
        }
        if count == 1 {
            return self.alloc_frame();
        }

        let mut run_start = 0usize;
        let mut run_len = 0usize;
        for frame in 0..self.frames {
            if self.bit_is_set(frame) {
                run_len = 0;
                continue;
            }
            if run_len == 0 {
                run_start = frame;
            }
            run_len += 1;
            if run_len == count {
                for f in run_start..run_start + count {
                    self.bitmap[f / 64] |= 1 << (f % 64);
                }
                self.used += count;
                self.total_allocations += 1;
                return Some(self.frame_addr(run_start));
            }
        }
        self.failed_allocations += 1;
        log::warn!("no run of {} contiguous free frames", count);
        None
    }

    /// Frees a single frame. Unaligned, out-of-window and double frees are
    /// recoverable: logged and ignored.
    pub fn free_frame(&mut self, addr: PhysAddr) -> Result<(), FrameError> {
        let frame = match self.frame_index(addr) {
            Ok(f) => f,
            Err(e) => {
                log::warn!("ignoring free of invalid frame {}", addr);
                return Err(e);
            }
        };
        if !self.bit_is_set(frame) {
            log::warn!("double free of frame {}", addr);
            return Err(FrameError::DoubleFree);
        }
        self.clear_bit(frame);
        self.used -= 1;
        if frame < self.search_start {
            self.search_start = frame;
        }
        Ok(())
    }

    /// Frees `count` consecutive frames starting at `addr`. A range
    /// running past the window end is truncated with a warning.
    pub fn free_frames(&mut self, addr: PhysAddr, count: usize) {
        if count == 0 {
            return;
        }
        let mut count = count;
        let end = addr.as_u64() + count as u64 * PAGE_SIZE;
        let window_end = self.base + self.frames as u64 * PAGE_SIZE;
        if end > window_end {
            if addr.as_u64() >= window_end {
                log::warn!("free range {} entirely outside the window", addr);
                return;
            }
            count = ((window_end - addr.as_u64()) / PAGE_SIZE) as usize;
            log::warn!("free range past window end, truncating to {} frames", count);
        }
        for i in 0..count {
            let _ = self.free_frame(addr + i as u64 * PAGE_SIZE);
        }
    }

    /// Whether the frame at `addr` is currently free. Addresses outside
    /// the window report `false`.
    pub fn is_frame_free(&self, addr: PhysAddr) -> bool {
        match self.frame_index(addr) {
            Ok(frame) => !self.bit_is_set(frame),
            Err(_) => false,
        }
    }

    pub fn free_bytes(&self) -> u64 {
        (self.frames - self.used) as u64 * PAGE_SIZE
    }

    pub fn used_bytes(&self) -> u64 {
        self.used as u64 * PAGE_SIZE
    }

    pub fn info(&self) -> PmmInfo {
        PmmInfo {
            base: self.base,
            end: self.base + self.frames as u64 * PAGE_SIZE,
            frames: self.frames,
            frame_size: PAGE_SIZE,
        }
    }

    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            total_frames: self.frames,
            used_frames: self.used,
            free_frames: self.frames - self.used,
            total_allocations: self.total_allocations,
            failed_allocations: self.failed_allocations,
        }
    }
}

// =============================================================================
// Public API — module-level functions that acquire the spinlock
// =============================================================================

/// The global physical memory manager. `None` before `init`.
static PMM: SpinLock<Option<FrameAllocator>> = SpinLock::new(None);

/// Initializes the physical memory manager from the boot memory map.
///
/// Must be called exactly once during early boot, before any allocation.
///
/// # Panics
/// If no usable region of at least 1 MiB exists (the machine is unusable),
/// or if called twice.
pub fn init(memory_map: &[MemoryRegion]) {
    let allocator =
        FrameAllocator::new(memory_map).expect("PMM: no usable memory region of at least 1 MiB");
    let mut pmm = PMM.lock();
    assert!(pmm.is_none(), "PMM: init called more than once");
    *pmm = Some(allocator);
}

fn with_pmm<R>(f: impl FnOnce(&mut FrameAllocator) -> R) -> R {
    let mut pmm = PMM.lock();
    f(pmm.as_mut().expect("PMM: not initialized — call pmm::init() first"))
}

/// Allocates a single 4 KiB frame. The contents are **uninitialized**.
pub fn alloc_frame() -> Option<PhysAddr> {
    with_pmm(|p| p.alloc_frame())
}

/// Allocates `count` physically contiguous frames; returns the run base.
pub fn alloc_frames(count: usize) -> Option<PhysAddr> {
    with_pmm(|p| p.alloc_frames(count))
}

/// Frees a previously allocated frame. Invalid frees are logged and
/// ignored.
pub fn free_frame(addr: PhysAddr) {
    with_pmm(|p| {
        let _ = p.free_frame(addr);
    })
}

/// Frees `count` consecutive frames starting at `addr`.
pub fn free_frames(addr: PhysAddr, count: usize) {
    with_pmm(|p| p.free_frames(addr, count))
}

/// Whether the frame at `addr` is currently free.
#[allow(dead_code)]
pub fn is_frame_free(addr: PhysAddr) -> bool {
    with_pmm(|p| p.is_frame_free(addr))
}

/// Total free bytes in the managed window.
#[allow(dead_code)]
pub fn free_bytes() -> u64 {
    with_pmm(|p| p.free_bytes())
}

/// Total used bytes in the managed window.
#[allow(dead_code)]
pub fn used_bytes() -> u64 {
    with_pmm(|p| p.used_bytes())
}

/// Static facts about the managed window.
pub fn info() -> PmmInfo {
    with_pmm(|p| p.info())
}

/// Usage statistics snapshot.
pub fn stats() -> MemoryStats {
    with_pmm(|p| p.stats())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    /// 128 MiB usable at 2 MiB, with a reserved hole inside the window.
    fn small_map() -> [MemoryRegion; 3] {
        [
            MemoryRegion::new(0, 0x9F000, RegionKind::Usable),
            MemoryRegion::new(0x20_0000, 128 * MIB, RegionKind::Usable),
            MemoryRegion::new(0x40_0000, 0x4000, RegionKind::Reserved),
        ]
    }

    fn new_pmm(map: &[MemoryRegion]) -> Box<FrameAllocator> {
        Box::new(FrameAllocator::new(map).expect("map has a usable window"))
    }

    #[test]
    fn window_selection_and_accounting() {
        let pmm = new_pmm(&small_map());
        let info = pmm.info();
        assert_eq!(info.base, 0x20_0000);
        assert_eq!(info.end, 0x20_0000 + 128 * MIB);
        assert_eq!(info.frames, (128 * MIB / PAGE_SIZE) as usize);

        // free = window − low reserved (256 frames) − reserved hole (4 frames)
        let expected_used = 256 + 4;
        assert_eq!(pmm.stats().used_frames, expected_used);
        assert_eq!(pmm.free_bytes(), 128 * MIB - expected_used as u64 * PAGE_SIZE);
    }

    #[test]
    fn no_usable_region_is_rejected() {
        let map = [
            MemoryRegion::new(0, 0x9F000, RegionKind::Usable), // below 1 MiB
            MemoryRegion::new(0x10_0000, 0x4000, RegionKind::Reserved),
        ];
        assert!(FrameAllocator::new(&map).is_none());
    }

    #[test]
    fn alloc_returns_aligned_in_window_frames() {
        let mut pmm = new_pmm(&small_map());
        let info = pmm.info();
        for _ in 0..32 {
            let f = pmm.alloc_frame().expect("window has free frames");
            assert!(f.is_page_aligned());
            assert!(f.as_u64() >= info.base && f.as_u64() < info.end);
            // The bit transitioned 0→1 exactly at allocation time.
            assert!(!pmm.is_frame_free(f));
        }
    }

    #[test]
    fn first_fit_returns_lowest_clear_bit() {
        let mut pmm = new_pmm(&small_map());
        let first = pmm.alloc_frame().unwrap();
        // Low 256 frames are reserved, so the first allocation is frame 256.
        assert_eq!(first.as_u64(), 0x20_0000 + 256 * PAGE_SIZE);

        let second = pmm.alloc_frame().unwrap();
        assert_eq!(second.as_u64(), first.as_u64() + PAGE_SIZE);

        // Freeing the first frame makes it the lowest clear bit again.
        pmm.free_frame(first).unwrap();
        assert_eq!(pmm.alloc_frame().unwrap(), first);
    }

    #[test]
    fn contiguous_runs_are_disjoint() {
        let mut pmm = new_pmm(&small_map());
        let a = pmm.alloc_frames(8).unwrap();
        let b = pmm.alloc_frames(8).unwrap();
        let (a0, a1) = (a.as_u64(), a.as_u64() + 8 * PAGE_SIZE);
        let (b0, b1) = (b.as_u64(), b.as_u64() + 8 * PAGE_SIZE);
        assert!(a1 <= b0 || b1 <= a0, "runs overlap: {a:?} {b:?}");
        // Tie-break: lowest address wins, so a < b.
        assert!(a0 < b0);
    }

    #[test]
    fn contiguous_spanning_all_free_frames() {
        let mut pmm = new_pmm(&small_map());
        let free = pmm.stats().free_frames;
        // A run of every free frame fails while the reserved hole splits
        // the window...
        assert!(pmm.alloc_frames(free).is_none());
        // ...but the largest piece below the hole-free tail succeeds.
        let tail_frames = pmm.info().frames - (0x20_4000 / PAGE_SIZE as usize);
        let base = pmm.alloc_frames(tail_frames).unwrap();
        assert_eq!(base.as_u64(), 0x20_0000 + 0x20_4000 as u64);
        assert!(pmm.alloc_frames(tail_frames).is_none());
    }

    #[test]
    fn invalid_frees_are_recoverable() {
        let mut pmm = new_pmm(&small_map());
        assert_eq!(
            pmm.free_frame(PhysAddr::new(0x20_0123)),
            Err(FrameError::InvalidAddress)
        );
        assert_eq!(
            pmm.free_frame(PhysAddr::new(0x1000)),
            Err(FrameError::InvalidAddress)
        );
        let f = pmm.alloc_frame().unwrap();
        pmm.free_frame(f).unwrap();
        assert_eq!(pmm.free_frame(f), Err(FrameError::DoubleFree));
        // The allocator still works after every recoverable error.
        assert!(pmm.alloc_frame().is_some());
    }

    #[test]
    fn free_range_truncates_at_window_end() {
        let mut pmm = new_pmm(&small_map());
        let info = pmm.info();
        let used_before = pmm.stats().used_frames;
        // Allocate the top 4 frames of the window, then free "8" from there.
        let top = PhysAddr::new(info.end - 4 * PAGE_SIZE);
        for i in 0..4 {
            // The top of the window is free in this map; mark used by hand.
            let addr = top + i as u64 * PAGE_SIZE;
            let idx = pmm.frame_index(addr).unwrap();
            pmm.used += pmm.set_bit(idx);
        }
        assert_eq!(pmm.stats().used_frames, used_before + 4);
        pmm.free_frames(top, 8);
        assert_eq!(pmm.stats().used_frames, used_before);
    }

    #[test]
    fn stats_track_allocation_failures() {
        let mut pmm = new_pmm(&small_map());
        let free = pmm.stats().free_frames;
        for _ in 0..free {
            assert!(pmm.alloc_frame().is_some());
        }
        assert!(pmm.alloc_frame().is_none());
        let stats = pmm.stats();
        assert_eq!(stats.free_frames, 0);
        assert_eq!(stats.failed_allocations, 1);
        assert_eq!(stats.total_allocations, free as u64);
    }
}
