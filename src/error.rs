//! Error taxonomy for the fallible host-facing boundary.
//!
//! Internal decode/execute paths are infallible by construction: an
//! undefined encoding is routed to the guest's undefined-instruction
//! vector rather than surfaced as a Rust `Err` (see `cpu::exceptions`).
//! `MachineError` exists only for the handful of host-facing calls that
//! can genuinely fail: loading a ROM, BIOS, save, or state blob.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MachineError {
    /// `load_rom` received more than 32 MiB.
    RomTooLarge { len: usize },
    /// `load_rom` received zero bytes.
    RomEmpty,
    /// `load_bios` received a buffer that isn't exactly 16 KiB.
    BiosSizeMismatch { expected: usize, got: usize },
    /// `load_save` received a buffer whose size doesn't match the
    /// active backup variant.
    BadSaveSize { expected: usize, got: usize },
    /// `load_state` failed magic/version/size/crc validation.
    CorruptState { reason: &'static str },
}

impl fmt::Display for MachineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RomTooLarge { len } => write!(f, "rom too large: {len} bytes (max 32 MiB)"),
            Self::RomEmpty => write!(f, "rom is empty"),
            Self::BiosSizeMismatch { expected, got } => {
                write!(f, "bios size mismatch: expected {expected}, got {got}")
            }
            Self::BadSaveSize { expected, got } => {
                write!(f, "save size mismatch: expected {expected}, got {got}")
            }
            Self::CorruptState { reason } => write!(f, "corrupt state file: {reason}"),
        }
    }
}

impl std::error::Error for MachineError {}

/// Stable C-ABI error codes. Negative, never zero, never overlapping.
impl From<MachineError> for i32 {
    fn from(e: MachineError) -> i32 {
        match e {
            MachineError::RomEmpty => -2,
            MachineError::RomTooLarge { .. } => -3,
            MachineError::BiosSizeMismatch { .. } => -4,
            MachineError::BadSaveSize { .. } => -5,
            MachineError::CorruptState { .. } => -6,
        }
    }
}
