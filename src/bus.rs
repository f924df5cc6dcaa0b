//! System bus for the Game Boy Advance.
//!
//! Routes every CPU access through address-region dispatch against the
//! GBA's memory map and its richer, width-sensitive I/O register block.
//!
//! This struct owns DMA, Timers, the interrupt controller, the keypad,
//! PPU timing, and cartridge backup as plain data — none of them hold a
//! reference back into the scheduler or CPU. Register writes that
//! require rearming a scheduler event (enabling a timer, triggering an
//! immediate DMA) are recorded in `pending`; the owning machine drains
//! that queue after every
//! write and performs the actual `Scheduler::add`/`remove` calls.

use crate::backup::{Backup, BackupKind};
use crate::dma::{Dma, TriggerMode};
use crate::interrupt::InterruptController;
use crate::keypad::Keypad;
use crate::memory::{addr, Bios, Ram, Rom};
use crate::ppu_timing::PpuTiming;
use crate::timers::{ScheduleAction, Timers};

/// A scheduler action the bus could not perform itself, queued for the
/// owning machine to apply after the triggering write returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingRequest {
    ArmTimer { channel: usize, delay_cycles: u64 },
    CancelTimer { channel: usize },
    TriggerDmaImmediate { channel: usize },
    Halt,
}

const IO_SIZE: usize = addr::IO_SIZE;

mod io {
    pub const DISPCNT: u32 = 0x000;
    pub const DISPSTAT: u32 = 0x004;
    pub const VCOUNT: u32 = 0x006;
    pub const DMA_BASE: u32 = 0x0B0;
    pub const DMA_STRIDE: u32 = 0x0C;
    pub const TIMER_BASE: u32 = 0x100;
    pub const TIMER_STRIDE: u32 = 0x04;
    pub const KEYINPUT: u32 = 0x130;
    pub const KEYCNT: u32 = 0x132;
    pub const IE: u32 = 0x200;
    pub const IF: u32 = 0x202;
    pub const WAITCNT: u32 = 0x204;
    pub const IME: u32 = 0x208;
    pub const HALTCNT: u32 = 0x301;
}

/// Plain-data snapshot of every byte-addressable region `Bus` owns
/// directly, for save states. DMA/Timers/InterruptController/Keypad/
/// PpuTiming/Backup have their own export/import pairs and are snapshot
/// separately by the owning machine.
#[derive(Clone)]
pub struct BusRamSnapshot {
    pub ewram: Ram,
    pub iwram: Ram,
    pub pram: Ram,
    pub vram: Ram,
    pub oam: Ram,
    pub io_shadow: [u8; IO_SIZE],
    pub open_bus: u32,
}

pub struct Bus {
    bios: Bios,
    ewram: Ram,
    iwram: Ram,
    pram: Ram,
    vram: Ram,
    oam: Ram,
    rom: Rom,
    backup: Backup,

    dma: Dma,
    timers: Timers,
    interrupts: InterruptController,
    keypad: Keypad,
    ppu: PpuTiming,

    /// Catch-all byte storage for I/O registers with no dedicated
    /// state above (sound, BG/window control, etc.) — out of this
    /// crate's scope to simulate, but still readable/writable so guest
    /// code that probes them doesn't see nonsense.
    io_shadow: [u8; IO_SIZE],

    /// Last value successfully read from mapped memory, returned for
    /// reads that land in an unmapped gap (open-bus behavior).
    open_bus: u32,

    /// Current cycle time, mirrored from the scheduler by the owning
    /// machine before each access so timer register reads can
    /// interpolate correctly without Bus holding a Scheduler reference.
    time: u64,

    pending: Vec<PendingRequest>,
}

impl Bus {
    pub const BIOS_CYCLES: u32 = 1;
    pub const EWRAM_CYCLES: u32 = 3;
    pub const IWRAM_CYCLES: u32 = 1;
    pub const IO_CYCLES: u32 = 1;
    pub const PRAM_CYCLES: u32 = 1;
    pub const VRAM_CYCLES: u32 = 1;
    pub const OAM_CYCLES: u32 = 1;
    pub const ROM_CYCLES: u32 = 5;
    pub const BACKUP_CYCLES: u32 = 5;
    pub const UNMAPPED_CYCLES: u32 = 1;

    pub fn new(bios: Bios, rom: Rom) -> Self {
        let kind = BackupKind::detect(rom.as_slice());
        Self {
            bios,
            ewram: Ram::new(addr::EWRAM_SIZE),
            iwram: Ram::new(addr::IWRAM_SIZE),
            pram: Ram::new(addr::PRAM_SIZE),
            vram: Ram::new(addr::VRAM_SIZE),
            oam: Ram::new(addr::OAM_SIZE),
            rom,
            backup: Backup::new(kind),
            dma: Dma::new(),
            timers: Timers::new(),
            interrupts: InterruptController::new(),
            keypad: Keypad::new(),
            ppu: PpuTiming::new(),
            io_shadow: [0; IO_SIZE],
            open_bus: 0,
            time: 0,
            pending: Vec::new(),
        }
    }

    pub fn reset(&mut self) {
        self.ewram.reset();
        self.iwram.reset();
        self.pram.reset();
        self.vram.reset();
        self.oam.reset();
        self.dma.reset();
        self.timers.reset();
        self.interrupts.reset();
        self.keypad.reset();
        self.ppu.reset();
        self.io_shadow = [0; IO_SIZE];
        self.open_bus = 0;
        self.time = 0;
        self.pending.clear();
    }

    pub fn set_time(&mut self, cycles: u64) {
        self.time = cycles;
    }

    pub fn take_pending(&mut self) -> Vec<PendingRequest> {
        std::mem::take(&mut self.pending)
    }

    pub fn dma(&self) -> &Dma {
        &self.dma
    }

    pub fn dma_mut(&mut self) -> &mut Dma {
        &mut self.dma
    }

    pub fn timers(&self) -> &Timers {
        &self.timers
    }

    pub fn timers_mut(&mut self) -> &mut Timers {
        &mut self.timers
    }

    pub fn interrupts(&self) -> &InterruptController {
        &self.interrupts
    }

    pub fn interrupts_mut(&mut self) -> &mut InterruptController {
        &mut self.interrupts
    }

    pub fn keypad(&self) -> &Keypad {
        &self.keypad
    }

    pub fn keypad_mut(&mut self) -> &mut Keypad {
        &mut self.keypad
    }

    pub fn ppu(&self) -> &PpuTiming {
        &self.ppu
    }

    pub fn ppu_mut(&mut self) -> &mut PpuTiming {
        &mut self.ppu
    }

    pub fn backup(&self) -> &Backup {
        &self.backup
    }

    pub fn backup_mut(&mut self) -> &mut Backup {
        &mut self.backup
    }

    /// Tell the EEPROM protocol state machine how wide its address
    /// field is, inferred from a DMA3 transfer's halfword count (GBA
    /// hardware has no other way to distinguish 512-byte from 8 KiB
    /// EEPROM chips).
    pub fn note_dma_to_eeprom(&mut self, halfwords: usize) {
        if let Backup::Eeprom(e) = &mut self.backup {
            e.set_width_from_dma_length(halfwords);
        }
    }

    /// Update the keypad shadow register and raise the keypad IRQ
    /// through the interrupt controller if its configured condition is
    /// now satisfied. Exists on `Bus` rather than `Keypad` itself since
    /// it needs both fields at once without a back-reference.
    pub fn set_keys(&mut self, mask: u16, down: bool) {
        self.keypad.set_keys(mask, down, &mut self.interrupts);
    }

    pub fn export_ram(&self) -> BusRamSnapshot {
        BusRamSnapshot {
            ewram: self.ewram.clone(),
            iwram: self.iwram.clone(),
            pram: self.pram.clone(),
            vram: self.vram.clone(),
            oam: self.oam.clone(),
            io_shadow: self.io_shadow,
            open_bus: self.open_bus,
        }
    }

    pub fn import_ram(&mut self, snap: BusRamSnapshot) {
        self.ewram = snap.ewram;
        self.iwram = snap.iwram;
        self.pram = snap.pram;
        self.vram = snap.vram;
        self.oam = snap.oam;
        self.io_shadow = snap.io_shadow;
        self.open_bus = snap.open_bus;
    }

    pub fn load_rom(&mut self, data: Vec<u8>) {
        let kind = BackupKind::detect(&data);
        self.rom = Rom::new(data);
        self.backup = Backup::new(kind);
    }

    pub fn load_bios(&mut self, data: Vec<u8>) {
        self.bios = Bios::new(data);
    }

    /// Perform one DMA transfer unit directly against memory, used by
    /// the machine's burst-execution loop (`Dma::burst_units` describes
    /// the addresses; this does the actual read/write).
    pub fn dma_copy_unit(&mut self, src: u32, dst: u32, width: crate::dma::TransferWidth) {
        match width {
            crate::dma::TransferWidth::Half => {
                let (v, _) = self.read16(src);
                self.write16(dst, v);
            }
            crate::dma::TransferWidth::Word => {
                let (v, _) = self.read32(src);
                self.write32(dst, v);
            }
        }
    }

    fn region_read(&mut self, addr: u32) -> (u8, u32) {
        let addr = addr & addr::ADDR_MASK;
        match addr {
            a if a < addr::EWRAM_START => {
                (self.bios.read_byte(a as usize), Self::BIOS_CYCLES)
            }
            a if a < addr::IWRAM_START => {
                let off = (a - addr::EWRAM_START) & addr::EWRAM_MIRROR_MASK;
                (self.ewram.read_byte(off as usize), Self::EWRAM_CYCLES)
            }
            a if a < addr::IO_START => {
                let off = (a - addr::IWRAM_START) & addr::IWRAM_MIRROR_MASK;
                (self.iwram.read_byte(off as usize), Self::IWRAM_CYCLES)
            }
            a if a < addr::PRAM_START => {
                let v = self.io_read8(a - addr::IO_START);
                (v, Self::IO_CYCLES)
            }
            a if a < addr::VRAM_START => {
                let off = (a - addr::PRAM_START) & addr::PRAM_MIRROR_MASK;
                (self.pram.read_byte(off as usize), Self::PRAM_CYCLES)
            }
            a if a < addr::OAM_START => {
                let off = vram_offset(a);
                (self.vram.read_byte(off as usize), Self::VRAM_CYCLES)
            }
            a if a < addr::ROM_START => {
                let off = (a - addr::OAM_START) & addr::OAM_MIRROR_MASK;
                (self.oam.read_byte(off as usize), Self::OAM_CYCLES)
            }
            a if a < addr::BACKUP_START => {
                let off = (a - addr::ROM_START) % (addr::ROM_MAX_SIZE as u32);
                (self.rom.read_byte(off as usize), Self::ROM_CYCLES)
            }
            _ => {
                let off = a - addr::BACKUP_START;
                (self.backup_read(off), Self::BACKUP_CYCLES)
            }
        }
    }

    fn region_write(&mut self, addr: u32, value: u8) -> u32 {
        let addr = addr & addr::ADDR_MASK;
        match addr {
            a if a < addr::EWRAM_START => Self::BIOS_CYCLES,
            a if a < addr::IWRAM_START => {
                let off = (a - addr::EWRAM_START) & addr::EWRAM_MIRROR_MASK;
                self.ewram.write_byte(off as usize, value);
                Self::EWRAM_CYCLES
            }
            a if a < addr::IO_START => {
                let off = (a - addr::IWRAM_START) & addr::IWRAM_MIRROR_MASK;
                self.iwram.write_byte(off as usize, value);
                Self::IWRAM_CYCLES
            }
            a if a < addr::PRAM_START => {
                self.io_write8(a - addr::IO_START, value);
                Self::IO_CYCLES
            }
            a if a < addr::VRAM_START => {
                let off = (a - addr::PRAM_START) & addr::PRAM_MIRROR_MASK;
                self.pram.write_byte(off as usize, value);
                Self::PRAM_CYCLES
            }
            a if a < addr::OAM_START => {
                let off = vram_offset(a);
                self.vram.write_byte(off as usize, value);
                Self::VRAM_CYCLES
            }
            a if a < addr::ROM_START => {
                let off = (a - addr::OAM_START) & addr::OAM_MIRROR_MASK;
                self.oam.write_byte(off as usize, value);
                Self::OAM_CYCLES
            }
            a if a < addr::BACKUP_START => Self::ROM_CYCLES,
            _ => {
                let off = a - addr::BACKUP_START;
                self.backup_write(off, value);
                Self::BACKUP_CYCLES
            }
        }
    }

    fn backup_read(&mut self, offset: u32) -> u8 {
        match &mut self.backup {
            Backup::None => 0xFF,
            Backup::Sram(s) => s.read(offset),
            Backup::Flash(f) => f.read(offset),
            Backup::Eeprom(e) => e.read_bit() as u8,
        }
    }

    fn backup_write(&mut self, offset: u32, value: u8) {
        match &mut self.backup {
            Backup::None => {}
            Backup::Sram(s) => s.write(offset, value),
            Backup::Flash(f) => f.write(offset, value),
            Backup::Eeprom(e) => e.write_bit(value as u32),
        }
    }

    pub fn read8(&mut self, addr: u32) -> (u8, u32) {
        let (v, cycles) = self.region_read(addr);
        self.open_bus = v as u32;
        (v, cycles)
    }

    pub fn write8(&mut self, addr: u32, value: u8) -> u32 {
        self.region_write(addr, value)
    }

    /// Halfword read. An odd address is rotated down to the containing
    /// aligned halfword and the result rotated right by 8.
    pub fn read16(&mut self, addr: u32) -> (u16, u32) {
        let aligned = addr & !1;
        let (lo, c0) = self.region_read(aligned);
        let (hi, c1) = self.region_read(aligned.wrapping_add(1));
        let mut v = (lo as u16) | ((hi as u16) << 8);
        if addr & 1 != 0 {
            v = v.rotate_right(8);
        }
        self.open_bus = v as u32;
        (v, c0.max(c1))
    }

    pub fn write16(&mut self, addr: u32, value: u16) -> u32 {
        let addr = addr & !1;
        let c0 = self.region_write(addr, value as u8);
        let c1 = self.region_write(addr.wrapping_add(1), (value >> 8) as u8);
        c0.max(c1)
    }

    /// Word read. A misaligned address is rotated down to the
    /// containing aligned word and the result rotated right by
    /// `(addr & 3) * 8`.
    pub fn read32(&mut self, addr: u32) -> (u32, u32) {
        let aligned = addr & !3;
        let (lo, c0) = self.region_read(aligned);
        let (b1, c1) = self.region_read(aligned.wrapping_add(1));
        let (b2, c2) = self.region_read(aligned.wrapping_add(2));
        let (b3, c3) = self.region_read(aligned.wrapping_add(3));
        let aligned_v =
            (lo as u32) | ((b1 as u32) << 8) | ((b2 as u32) << 16) | ((b3 as u32) << 24);
        let v = aligned_v.rotate_right((addr & 3) * 8);
        self.open_bus = v;
        (v, c0.max(c1).max(c2).max(c3))
    }

    pub fn write32(&mut self, addr: u32, value: u32) -> u32 {
        let addr = addr & !3;
        let c0 = self.write16(addr, value as u16);
        let c1 = self.write16(addr.wrapping_add(2), (value >> 16) as u16);
        c0.max(c1)
    }

    fn io_read8(&mut self, offset: u32) -> u8 {
        let (half, shift) = (offset & !1, (offset & 1) * 8);
        ((self.io_read16(half) >> shift) & 0xFF) as u8
    }

    fn io_write8(&mut self, offset: u32, value: u8) {
        if offset == io::HALTCNT {
            self.pending.push(PendingRequest::Halt);
        }
        let half = offset & !1;
        let current = self.io_read16(half);
        let new = if offset & 1 == 0 {
            (current & 0xFF00) | value as u16
        } else {
            (current & 0x00FF) | ((value as u16) << 8)
        };
        self.io_write16(half, new);
    }

    fn io_read16(&mut self, offset: u32) -> u16 {
        match offset {
            io::DISPSTAT => self.ppu.dispstat(),
            io::VCOUNT => self.ppu.vcount(),
            io::KEYINPUT => self.keypad_keyinput(),
            io::KEYCNT => self.keypad_keycnt(),
            io::IE => self.interrupts.ie(),
            io::IF => self.interrupts.iflag(),
            io::IME => self.interrupts.ime() as u16,
            o if is_dma_reg(o, 0) => self.io_read_dma(o, 0),
            o if is_dma_reg(o, 1) => self.io_read_dma(o, 1),
            o if is_dma_reg(o, 2) => self.io_read_dma(o, 2),
            o if is_dma_reg(o, 3) => self.io_read_dma(o, 3),
            o if is_timer_reg(o, 0) => self.io_read_timer(o, 0),
            o if is_timer_reg(o, 1) => self.io_read_timer(o, 1),
            o if is_timer_reg(o, 2) => self.io_read_timer(o, 2),
            o if is_timer_reg(o, 3) => self.io_read_timer(o, 3),
            _ => self.read_shadow16(offset),
        }
    }

    fn io_write16(&mut self, offset: u32, value: u16) {
        self.write_shadow16(offset, value);
        match offset {
            io::DISPSTAT => self.ppu.write_dispstat(value),
            io::KEYCNT => self.keypad.write_keycnt(value),
            io::IE => self.interrupts.set_ie(value),
            io::IF => self.interrupts.acknowledge(value),
            io::IME => self.interrupts.set_ime(value & 1 != 0),
            o if is_dma_reg(o, 0) => self.io_write_dma(o, 0, value),
            o if is_dma_reg(o, 1) => self.io_write_dma(o, 1, value),
            o if is_dma_reg(o, 2) => self.io_write_dma(o, 2, value),
            o if is_dma_reg(o, 3) => self.io_write_dma(o, 3, value),
            o if is_timer_reg(o, 0) => self.io_write_timer(o, 0, value),
            o if is_timer_reg(o, 1) => self.io_write_timer(o, 1, value),
            o if is_timer_reg(o, 2) => self.io_write_timer(o, 2, value),
            o if is_timer_reg(o, 3) => self.io_write_timer(o, 3, value),
            _ => {}
        }
    }

    fn read_shadow16(&self, offset: u32) -> u16 {
        let o = offset as usize;
        if o + 1 < IO_SIZE {
            (self.io_shadow[o] as u16) | ((self.io_shadow[o + 1] as u16) << 8)
        } else {
            0
        }
    }

    fn write_shadow16(&mut self, offset: u32, value: u16) {
        let o = offset as usize;
        if o + 1 < IO_SIZE {
            self.io_shadow[o] = value as u8;
            self.io_shadow[o + 1] = (value >> 8) as u8;
        }
    }

    fn keypad_keyinput(&self) -> u16 {
        self.keypad.keyinput()
    }

    fn keypad_keycnt(&self) -> u16 {
        self.keypad.keycnt()
    }

    fn io_read_dma(&mut self, offset: u32, channel: usize) -> u16 {
        let local = offset - (io::DMA_BASE + channel as u32 * io::DMA_STRIDE);
        match local {
            0x8 => self.dma.channel(channel).count as u16,
            0xA => dma_control_bits(&self.dma, channel),
            _ => self.read_shadow16(offset),
        }
    }

    fn io_write_dma(&mut self, offset: u32, channel: usize, value: u16) {
        let local = offset - (io::DMA_BASE + channel as u32 * io::DMA_STRIDE);
        match local {
            0x0 => {
                let cur = self.dma.channel(channel).src;
                self.dma.write_src(channel, (cur & 0xFFFF_0000) | value as u32);
            }
            0x2 => {
                let cur = self.dma.channel(channel).src;
                self.dma.write_src(channel, (cur & 0x0000_FFFF) | ((value as u32) << 16));
            }
            0x4 => {
                let cur = self.dma.channel(channel).dst;
                self.dma.write_dst(channel, (cur & 0xFFFF_0000) | value as u32);
            }
            0x6 => {
                let cur = self.dma.channel(channel).dst;
                self.dma.write_dst(channel, (cur & 0x0000_FFFF) | ((value as u32) << 16));
            }
            0x8 => self.dma.write_count(channel, value as u32),
            0xA => {
                let armed = self.dma.write_control(channel, value as u32);
                if armed && self.dma.channel(channel).mode == TriggerMode::Immediate {
                    self.pending.push(PendingRequest::TriggerDmaImmediate { channel });
                }
            }
            _ => {}
        }
    }

    fn io_read_timer(&mut self, offset: u32, channel: usize) -> u16 {
        let local = offset - (io::TIMER_BASE + channel as u32 * io::TIMER_STRIDE);
        match local {
            0x0 => self.timers.read_counter(channel, self.time),
            0x2 => self.timers.channel(channel).control_bits(),
            _ => 0,
        }
    }

    fn io_write_timer(&mut self, offset: u32, channel: usize, value: u16) {
        let local = offset - (io::TIMER_BASE + channel as u32 * io::TIMER_STRIDE);
        match local {
            0x0 => self.timers.write_reload(channel, value),
            0x2 => {
                let action = self.timers.write_control(channel, value, self.time);
                match action {
                    ScheduleAction::Arm { delay_cycles } => {
                        self.pending.push(PendingRequest::ArmTimer { channel, delay_cycles });
                    }
                    ScheduleAction::Cancel => {
                        self.pending.push(PendingRequest::CancelTimer { channel });
                    }
                    ScheduleAction::None => {}
                }
            }
            _ => {}
        }
    }
}

fn dma_control_bits(dma: &Dma, channel: usize) -> u16 {
    let ch = dma.channel(channel);
    ((ch.dst_control as u16) << 5)
        | ((ch.src_control as u16) << 7)
        | ((ch.repeat as u16) << 9)
        | ((matches!(ch.width, crate::dma::TransferWidth::Word) as u16) << 10)
        | ((ch.mode as u16) << 12)
        | ((ch.irq_on_completion as u16) << 14)
        | ((ch.enabled as u16) << 15)
}

fn is_dma_reg(offset: u32, channel: u32) -> bool {
    let start = io::DMA_BASE + channel * io::DMA_STRIDE;
    offset >= start && offset < start + io::DMA_STRIDE
}

fn is_timer_reg(offset: u32, channel: u32) -> bool {
    let start = io::TIMER_BASE + channel * io::TIMER_STRIDE;
    offset >= start && offset < start + io::TIMER_STRIDE
}

/// VRAM's 96 KiB bank mirrors every 128 KiB, with the top 32 KiB of
/// each window re-showing the bank's last 32 KiB.
fn vram_offset(addr: u32) -> u32 {
    let within_window = (addr - addr::VRAM_START) % addr::VRAM_MIRROR_WINDOW;
    if within_window as usize >= addr::VRAM_SIZE {
        within_window - (addr::VRAM_MIRROR_WINDOW - addr::VRAM_SIZE as u32)
    } else {
        within_window
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_bus() -> Bus {
        Bus::new(Bios::new(vec![0; addr::BIOS_SIZE]), Rom::new(vec![0u8; 0x200]))
    }

    #[test]
    fn test_ewram_read_write_roundtrip() {
        let mut bus = test_bus();
        bus.write32(addr::EWRAM_START + 4, 0xDEAD_BEEF);
        assert_eq!(bus.read32(addr::EWRAM_START + 4).0, 0xDEAD_BEEF);
    }

    #[test]
    fn test_iwram_mirrors() {
        let mut bus = test_bus();
        bus.write8(addr::IWRAM_START, 0x42);
        assert_eq!(bus.read8(addr::IWRAM_START + addr::IWRAM_SIZE as u32).0, 0x42);
    }

    #[test]
    fn test_vram_mirror_window() {
        let mut bus = test_bus();
        bus.write8(addr::VRAM_START, 0x11);
        assert_eq!(bus.read8(addr::VRAM_START + addr::VRAM_MIRROR_WINDOW).0, 0x11);
    }

    #[test]
    fn test_ie_if_ime_registers() {
        let mut bus = test_bus();
        bus.write16(io::IE as u32 + addr::IO_START, 0x3FFF);
        assert_eq!(bus.interrupts().ie(), 0x3FFF);
        bus.interrupts_mut().raise(crate::interrupt::sources::VBLANK);
        assert_eq!(bus.read16(io::IF as u32 + addr::IO_START).0, crate::interrupt::sources::VBLANK);
        bus.write16(io::IF as u32 + addr::IO_START, crate::interrupt::sources::VBLANK);
        assert_eq!(bus.interrupts().iflag(), 0);
    }

    #[test]
    fn test_dma_control_write_queues_immediate_trigger() {
        let mut bus = test_bus();
        bus.write32(addr::IO_START + io::DMA_BASE, 0x0200_0000);
        bus.write32(addr::IO_START + io::DMA_BASE + 4, 0x0300_0000);
        bus.write16(addr::IO_START + io::DMA_BASE + 8, 4);
        bus.write16(addr::IO_START + io::DMA_BASE + 0xA, 1 << 15);
        let pending = bus.take_pending();
        assert!(pending.contains(&PendingRequest::TriggerDmaImmediate { channel: 0 }));
    }

    #[test]
    fn test_timer_control_write_queues_arm() {
        let mut bus = test_bus();
        bus.write16(addr::IO_START + io::TIMER_BASE, 0xFFFE);
        bus.write16(addr::IO_START + io::TIMER_BASE + 2, 1 << 7);
        let pending = bus.take_pending();
        assert!(matches!(pending[0], PendingRequest::ArmTimer { channel: 0, delay_cycles: 2 }));
    }

    #[test]
    fn test_keyinput_defaults_all_released() {
        let mut bus = test_bus();
        assert_eq!(bus.read16(addr::IO_START + io::KEYINPUT).0, crate::keypad::keys::ALL);
    }

    #[test]
    fn test_rom_mirrors_at_wait_state_2_base() {
        let mut bus = test_bus();
        let data = vec![0xAB, 0xCD, 0xEF, 0x01];
        bus.load_rom(data);
        assert_eq!(bus.read8(addr::ROM_START).0, 0xAB);
    }

    #[test]
    fn test_sram_backup_detected_and_addressable() {
        let mut rom = vec![0u8; 0x100];
        rom[0x20..0x26].copy_from_slice(b"SRAM_V");
        let mut bus = test_bus();
        bus.load_rom(rom);
        bus.write8(addr::BACKUP_START, 0x77);
        assert_eq!(bus.read8(addr::BACKUP_START).0, 0x77);
    }
}
