//! Demo guest module for wasm-boot.
//!
//! Build with `cargo build -p demo-guest --target wasm32-unknown-unknown --release`
//! and run the result with `boot-run run target/wasm32-unknown-unknown/release/demo_guest.wasm`.
//!
//! Only meaningful on wasm32; on other targets the crate is empty.

#![cfg(target_arch = "wasm32")]

#[link(wasm_import_module = "env")]
unsafe extern "C" {
    fn log(ptr: *const u8, len: usize);
    fn now_ms() -> i64;
}

fn host_log(msg: &str) {
    // SAFETY: the host only reads `len` bytes starting at `ptr` from our memory.
    unsafe { log(msg.as_ptr(), msg.len()) }
}

/// Entry point the host calls once after instantiation.
#[unsafe(no_mangle)]
pub extern "C" fn run_app() {
    host_log("demo guest: entered run_app");

    // SAFETY: now_ms takes no arguments and touches no guest memory.
    let started = unsafe { now_ms() };
    host_log(&format!("demo guest: host clock reads {started} ms"));
}
