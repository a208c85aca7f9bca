fn main() {
    // The Limine linker script only applies to the bare-metal target.
    // Host builds (`cargo test`) must link normally.
    let target = std::env::var("TARGET").unwrap_or_default();
    if target == "x86_64-unknown-none" {
        println!(
            "cargo:rustc-link-arg=-T{}/linker.ld",
            env!("CARGO_MANIFEST_DIR")
        );
    }
    println!("cargo:rerun-if-changed=linker.ld");
}
