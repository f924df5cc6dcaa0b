//! WebAssembly bindings.
//!
//! This module provides JavaScript-friendly APIs using wasm-bindgen.
//! It exists alongside the C ABI in `lib.rs` rather than replacing it:
//! a `#[wasm_bindgen]` wrapper owns the emulator directly instead of
//! going through raw pointers, since wasm-bindgen already manages the
//! JS-side handle lifetime.

#[global_allocator]
static ALLOC: wee_alloc::WeeAlloc = wee_alloc::WeeAlloc::INIT;

use wasm_bindgen::prelude::*;

use crate::config::Config;
use crate::machine::{Machine, StopReason};

/// WASM-friendly wrapper around [`Machine`]. Unlike the C FFI, this
/// owns the machine directly without a raw pointer, since WASM is
/// single-threaded and wasm-bindgen already manages the JS-side handle.
#[wasm_bindgen]
pub struct WasmMachine {
    inner: Machine,
}

#[wasm_bindgen]
impl WasmMachine {
    #[wasm_bindgen(constructor)]
    pub fn new(skip_bios: bool) -> WasmMachine {
        console_error_panic_hook::set_once();
        WasmMachine {
            inner: Machine::new(Config { skip_bios, ..Config::default() }),
        }
    }

    /// Load ROM data, classify its backup variant, and reset.
    /// Returns 0 on success, a negative error code on failure.
    #[wasm_bindgen]
    pub fn load_rom(&mut self, data: &[u8]) -> i32 {
        match self.inner.load_rom(data.to_vec()) {
            Ok(()) => 0,
            Err(e) => e.into(),
        }
    }

    /// Load a 16 KiB BIOS image.
    /// Returns 0 on success, a negative error code on failure.
    #[wasm_bindgen]
    pub fn load_bios(&mut self, data: &[u8]) -> i32 {
        match self.inner.load_bios(data.to_vec()) {
            Ok(()) => 0,
            Err(e) => e.into(),
        }
    }

    #[wasm_bindgen]
    pub fn reset(&mut self) {
        self.inner.reset();
    }

    /// Run until `cycles` have been billed or a frame ends. Returns
    /// true if a frame ended.
    #[wasm_bindgen]
    pub fn run(&mut self, cycles: u64) -> bool {
        matches!(self.inner.run(cycles), StopReason::FrameEnd)
    }

    /// Update one or more keys' pressed state (bitmask per `keypad::keys`).
    #[wasm_bindgen]
    pub fn set_keys(&mut self, mask: u16, down: bool) {
        self.inner.set_keys(mask, down);
    }

    /// Current persisted save data for the active backup variant.
    #[wasm_bindgen]
    pub fn get_save(&self) -> Vec<u8> {
        self.inner.get_save()
    }

    /// Load persisted save data into the active backup variant.
    /// Returns 0 on success, a negative error code on failure.
    #[wasm_bindgen]
    pub fn load_save(&mut self, data: &[u8]) -> i32 {
        match self.inner.load_save(data) {
            Ok(()) => 0,
            Err(e) => e.into(),
        }
    }

    /// Encode a portable, versioned save-state blob.
    #[wasm_bindgen]
    pub fn encode_state(&self) -> Vec<u8> {
        self.inner.encode_state()
    }

    /// Decode a portable save-state blob produced by `encode_state`.
    /// Returns 0 on success, a negative error code on failure; the
    /// machine is left untouched if decoding fails.
    #[wasm_bindgen]
    pub fn decode_state(&mut self, data: &[u8]) -> i32 {
        match self.inner.decode_state(data) {
            Ok(()) => 0,
            Err(e) => e.into(),
        }
    }

    /// Current program counter, for host-side diagnostics overlays.
    #[wasm_bindgen]
    pub fn pc(&self) -> u32 {
        self.inner.pc()
    }

    #[wasm_bindgen]
    pub fn total_cycles(&self) -> u64 {
        self.inner.total_cycles()
    }
}
