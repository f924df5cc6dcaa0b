//! Flat memory regions backing the GBA address space.
//!
//! Each region (BIOS, EWRAM, IWRAM, ROM) is a lazily allocated `Vec<u8>`
//! with mirror-masked read/write, plus the load-time bookkeeping
//! `bus.rs` needs to decode addresses into them. The actual
//! address-range dispatch lives in `bus.rs`; these structs only store
//! bytes.

pub mod addr {
    pub const BIOS_START: u32 = 0x0000_0000;
    pub const BIOS_SIZE: usize = 16 * 1024;

    pub const EWRAM_START: u32 = 0x0200_0000;
    pub const EWRAM_SIZE: usize = 256 * 1024;
    pub const EWRAM_MIRROR_MASK: u32 = (EWRAM_SIZE as u32) - 1;

    pub const IWRAM_START: u32 = 0x0300_0000;
    pub const IWRAM_SIZE: usize = 32 * 1024;
    pub const IWRAM_MIRROR_MASK: u32 = (IWRAM_SIZE as u32) - 1;

    pub const IO_START: u32 = 0x0400_0000;
    pub const IO_SIZE: usize = 1024;

    pub const PRAM_START: u32 = 0x0500_0000;
    pub const PRAM_SIZE: usize = 1024;
    pub const PRAM_MIRROR_MASK: u32 = (PRAM_SIZE as u32) - 1;

    pub const VRAM_START: u32 = 0x0600_0000;
    pub const VRAM_SIZE: usize = 96 * 1024;
    /// VRAM's mirror isn't a clean power of two; it repeats every 128
    /// KiB with the top 32 KiB of each 128 KiB window re-showing the
    /// last 32 KiB of the 96 KiB bank.
    pub const VRAM_MIRROR_WINDOW: u32 = 128 * 1024;

    pub const OAM_START: u32 = 0x0700_0000;
    pub const OAM_SIZE: usize = 1024;
    pub const OAM_MIRROR_MASK: u32 = (OAM_SIZE as u32) - 1;

    pub const ROM_START: u32 = 0x0800_0000;
    pub const ROM_MIRROR_2_START: u32 = 0x0A00_0000;
    pub const ROM_MIRROR_3_START: u32 = 0x0C00_0000;
    pub const ROM_MAX_SIZE: usize = 32 * 1024 * 1024;

    pub const BACKUP_START: u32 = 0x0E00_0000;
    pub const BACKUP_MAX_SIZE: usize = 128 * 1024;

    pub const ADDR_MASK: u32 = 0x0FFF_FFFF;
}

/// BIOS ROM: 16 KiB, read-only to the guest once installed.
#[derive(Debug, Clone)]
pub struct Bios {
    data: Vec<u8>,
}

impl Bios {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn is_installed(&self) -> bool {
        !self.data.is_empty()
    }

    pub fn load(&mut self, bytes: &[u8]) {
        self.data = bytes.to_vec();
    }

    pub fn read_byte(&self, offset: usize) -> u8 {
        self.data.get(offset).copied().unwrap_or(0)
    }
}

impl Default for Bios {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

/// A plain power-of-two-sized RAM bank (EWRAM, IWRAM, PRAM, VRAM, OAM).
#[derive(Debug, Clone)]
pub struct Ram {
    data: Vec<u8>,
}

impl Ram {
    pub fn new(size: usize) -> Self {
        Self { data: vec![0u8; size] }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn read_byte(&self, offset: usize) -> u8 {
        self.data[offset % self.data.len()]
    }

    pub fn write_byte(&mut self, offset: usize, value: u8) {
        let len = self.data.len();
        self.data[offset % len] = value;
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn load(&mut self, bytes: &[u8]) {
        let n = bytes.len().min(self.data.len());
        self.data[..n].copy_from_slice(&bytes[..n]);
    }

    pub fn reset(&mut self) {
        self.data.iter_mut().for_each(|b| *b = 0);
    }
}

/// Cartridge ROM: up to 32 MiB, read-only.
#[derive(Debug, Clone)]
pub struct Rom {
    data: Vec<u8>,
}

impl Rom {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn load(&mut self, bytes: &[u8]) {
        self.data = bytes.to_vec();
    }

    pub fn read_byte(&self, offset: usize) -> u8 {
        self.data.get(offset).copied().unwrap_or(0)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }
}

impl Default for Rom {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ram_mirrors() {
        let mut r = Ram::new(256);
        r.write_byte(0, 0x42);
        assert_eq!(r.read_byte(256), 0x42);
    }

    #[test]
    fn test_rom_out_of_range_reads_zero() {
        let rom = Rom::new(Vec::new());
        assert_eq!(rom.read_byte(0), 0);
    }

    #[test]
    fn test_bios_not_installed_until_loaded() {
        let mut b = Bios::new(Vec::new());
        assert!(!b.is_installed());
        b.load(&[0u8; addr::BIOS_SIZE]);
        assert!(b.is_installed());
    }

    #[test]
    fn test_ram_load_truncates_to_capacity() {
        let mut r = Ram::new(4);
        r.load(&[1, 2, 3, 4, 5, 6]);
        assert_eq!(r.as_slice(), &[1, 2, 3, 4]);
    }
}
