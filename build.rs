use std::env;

fn main() {
    // The linker script only applies to the bare-metal kernel build.
    // Host builds (unit tests, tooling) link normally.
    if env::var("CARGO_CFG_TARGET_OS").as_deref() == Ok("none") {
        println!("cargo:rustc-link-arg=-Tsrc/kernel/kernel.ld");
    }
    println!("cargo:rerun-if-changed=src/kernel/kernel.ld");
}
