//! Game Boy Advance CPU, memory, and timing core.
//!
//! This crate provides a platform-agnostic emulator core with a stable
//! C ABI. No OS APIs are used — all I/O is done through byte buffers.
//! It models the ARM7TDMI interpreter, system bus, scheduler, DMA,
//! timers, interrupt controller, cartridge backup, keypad, and display
//! timing well enough to run guest code and exchange save data with a
//! host. Pixel composition, audio mixing, and any host-facing frontend
//! are out of scope: a host wires its own renderer/mixer to the
//! [`machine::Machine`] callbacks and reads memory directly for VRAM.
//!
//! # Architecture
//!
//! - `memory`: flat BIOS/RAM/ROM region storage
//! - `bus`: address decoding, region dispatch, and I/O register routing
//! - `cpu`: the ARM7TDMI interpreter (dual ARM/Thumb decode tables)
//! - `scheduler`: cycle-deadline event queue driving every timed subsystem
//! - `dma`: the four prioritized DMA channels
//! - `timers`: the four 16-bit timer channels
//! - `interrupt`: IE/IF/IME aggregation
//! - `keypad`: REG_KEYINPUT/REG_KEYCNT
//! - `backup`: cartridge save-memory dispatch (SRAM/EEPROM/Flash)
//! - `ppu_timing`: scanline/HBlank/VBlank timing without pixel rendering
//! - `waitloop`: idle-loop fast-forward detection
//! - `machine`: the owning container tying all of the above together
//!
//! # Memory Map (32-bit address space)
//!
//! | Address Range           | Region                    |
//! |-------------------------|----------------------------|
//! | 0x0000_0000-0x0000_3FFF | BIOS (16 KiB)              |
//! | 0x0200_0000-0x0203_FFFF | EWRAM (256 KiB)            |
//! | 0x0300_0000-0x0300_7FFF | IWRAM (32 KiB)             |
//! | 0x0400_0000-0x0400_03FF | I/O registers              |
//! | 0x0500_0000-0x0500_03FF | Palette RAM                |
//! | 0x0600_0000-0x0601_7FFF | VRAM (96 KiB)              |
//! | 0x0700_0000-0x0700_03FF | OAM                        |
//! | 0x0800_0000-0x09FF_FFFF | Cartridge ROM (up to 32MB) |
//! | 0x0E00_0000-            | Cartridge backup           |

pub mod backup;
mod bitops;
pub mod bus;
pub mod config;
pub mod cpu;
pub mod dma;
pub mod error;
pub mod interrupt;
pub mod keypad;
pub mod machine;
pub mod memory;
pub mod ppu_timing;
pub mod scheduler;
mod shifter;
pub mod timers;
pub mod waitloop;

#[cfg(feature = "wasm")]
pub mod wasm;

use std::ptr;
use std::slice;

pub use config::Config;
pub use error::MachineError;
pub use machine::{Machine, StopReason};

/// Create a new machine instance with default configuration.
/// Returns null on allocation failure.
#[no_mangle]
pub extern "C" fn gba_create() -> *mut Machine {
    let machine = Box::new(Machine::default());
    Box::into_raw(machine)
}

/// Destroy a machine instance. Safe to call with a null pointer.
#[no_mangle]
pub extern "C" fn gba_destroy(machine: *mut Machine) {
    if !machine.is_null() {
        unsafe {
            drop(Box::from_raw(machine));
        }
    }
}

/// Load ROM data, classify its backup variant, and reset.
/// Returns 0 on success, a negative `MachineError` code on failure.
#[no_mangle]
pub extern "C" fn gba_load_rom(machine: *mut Machine, data: *const u8, len: usize) -> i32 {
    if machine.is_null() || data.is_null() {
        return -1;
    }
    let machine = unsafe { &mut *machine };
    let rom = unsafe { slice::from_raw_parts(data, len) }.to_vec();
    match machine.load_rom(rom) {
        Ok(()) => 0,
        Err(e) => e.into(),
    }
}

/// Load a 16 KiB BIOS image.
/// Returns 0 on success, a negative `MachineError` code on failure.
#[no_mangle]
pub extern "C" fn gba_load_bios(machine: *mut Machine, data: *const u8, len: usize) -> i32 {
    if machine.is_null() || data.is_null() {
        return -1;
    }
    let machine = unsafe { &mut *machine };
    let bios = unsafe { slice::from_raw_parts(data, len) }.to_vec();
    match machine.load_bios(bios) {
        Ok(()) => 0,
        Err(e) => e.into(),
    }
}

/// Reset to the configured boot path (BIOS entry, or post-BIOS state
/// if `skip_bios` was set at creation).
#[no_mangle]
pub extern "C" fn gba_reset(machine: *mut Machine) {
    if machine.is_null() {
        return;
    }
    unsafe { &mut *machine }.reset();
}

/// Run until `cycles` have been billed or a frame-end sentinel fires.
/// Returns 1 if a frame ended, 0 if the cycle budget was exhausted.
#[no_mangle]
pub extern "C" fn gba_run(machine: *mut Machine, cycles: u64) -> i32 {
    if machine.is_null() {
        return 0;
    }
    let machine = unsafe { &mut *machine };
    match machine.run(cycles) {
        StopReason::FrameEnd => 1,
        StopReason::CyclesComplete => 0,
    }
}

/// Update the pressed/released state of one or more keys (bitmask per
/// `keypad::keys`).
#[no_mangle]
pub extern "C" fn gba_set_keys(machine: *mut Machine, mask: u16, down: i32) {
    if machine.is_null() {
        return;
    }
    unsafe { &mut *machine }.set_keys(mask, down != 0);
}

/// Size in bytes of the active backup variant's persisted save data.
#[no_mangle]
pub extern "C" fn gba_save_size(machine: *const Machine) -> usize {
    if machine.is_null() {
        return 0;
    }
    unsafe { &*machine }.get_save().len()
}

/// Copy the active backup's persisted save data into `out`.
/// Returns the number of bytes written, or -1 if `cap` is too small.
#[no_mangle]
pub extern "C" fn gba_get_save(machine: *const Machine, out: *mut u8, cap: usize) -> i32 {
    if machine.is_null() || out.is_null() {
        return -1;
    }
    let machine = unsafe { &*machine };
    let save = machine.get_save();
    if save.len() > cap {
        return -1;
    }
    unsafe {
        ptr::copy_nonoverlapping(save.as_ptr(), out, save.len());
    }
    save.len() as i32
}

/// Load persisted save data into the active backup variant.
/// Returns 0 on success, a negative `MachineError` code on failure.
#[no_mangle]
pub extern "C" fn gba_load_save(machine: *mut Machine, data: *const u8, len: usize) -> i32 {
    if machine.is_null() || data.is_null() {
        return -1;
    }
    let machine = unsafe { &mut *machine };
    let bytes = unsafe { slice::from_raw_parts(data, len) };
    match machine.load_save(bytes) {
        Ok(()) => 0,
        Err(e) => e.into(),
    }
}

/// Size in bytes of the portable state-file format `gba_encode_state`
/// would currently produce.
#[no_mangle]
pub extern "C" fn gba_encode_state_size(machine: *const Machine) -> usize {
    if machine.is_null() {
        return 0;
    }
    unsafe { &*machine }.encode_state().len()
}

/// Encode a portable, versioned save-state blob into `out`.
/// Returns the number of bytes written, or -1 if `cap` is too small.
#[no_mangle]
pub extern "C" fn gba_encode_state(machine: *const Machine, out: *mut u8, cap: usize) -> i32 {
    if machine.is_null() || out.is_null() {
        return -1;
    }
    let machine = unsafe { &*machine };
    let bytes = machine.encode_state();
    if bytes.len() > cap {
        return -1;
    }
    unsafe {
        ptr::copy_nonoverlapping(bytes.as_ptr(), out, bytes.len());
    }
    bytes.len() as i32
}

/// Decode a portable save-state blob produced by `gba_encode_state`.
/// Returns 0 on success, a negative `MachineError` code on failure; the
/// machine is left untouched if decoding fails.
#[no_mangle]
pub extern "C" fn gba_decode_state(machine: *mut Machine, data: *const u8, len: usize) -> i32 {
    if machine.is_null() || data.is_null() {
        return -1;
    }
    let machine = unsafe { &mut *machine };
    let bytes = unsafe { slice::from_raw_parts(data, len) };
    match machine.decode_state(bytes) {
        Ok(()) => 0,
        Err(e) => e.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_destroy() {
        let machine = gba_create();
        assert!(!machine.is_null());
        gba_destroy(machine);
    }

    #[test]
    fn test_load_rom_then_run() {
        let machine = gba_create();
        let rom = vec![0u8; 0x1000];
        assert_eq!(gba_load_rom(machine, rom.as_ptr(), rom.len()), 0);
        let frame_ended = gba_run(machine, 500);
        assert_eq!(frame_ended, 0);
        gba_destroy(machine);
    }

    #[test]
    fn test_load_rom_rejects_empty() {
        let machine = gba_create();
        let code = gba_load_rom(machine, [].as_ptr(), 0);
        assert_eq!(code, i32::from(MachineError::RomEmpty));
        gba_destroy(machine);
    }

    #[test]
    fn test_key_input() {
        let machine = gba_create();
        gba_set_keys(machine, crate::keypad::keys::A, 1);
        gba_set_keys(machine, crate::keypad::keys::A, 0);
        gba_destroy(machine);
    }

    #[test]
    fn test_save_round_trip_through_c_abi() {
        let machine = gba_create();
        let mut rom = vec![0u8; 0x40];
        rom[0x10..0x16].copy_from_slice(b"SRAM_V");
        assert_eq!(gba_load_rom(machine, rom.as_ptr(), rom.len()), 0);

        let size = gba_save_size(machine);
        let mut save = vec![0xAAu8; size];
        assert_eq!(gba_load_save(machine, save.as_mut_ptr(), save.len()), 0);

        let mut out = vec![0u8; size];
        assert_eq!(gba_get_save(machine, out.as_mut_ptr(), out.len()), size as i32);
        assert_eq!(out, save);

        gba_destroy(machine);
    }

    #[test]
    fn test_encode_decode_state_through_c_abi() {
        let machine = gba_create();
        let size = gba_encode_state_size(machine);
        let mut buf = vec![0u8; size];
        let written = gba_encode_state(machine, buf.as_mut_ptr(), buf.len());
        assert_eq!(written, size as i32);
        assert_eq!(gba_decode_state(machine, buf.as_ptr(), buf.len()), 0);
        gba_destroy(machine);
    }
}
