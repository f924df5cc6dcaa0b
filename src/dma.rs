//! Four prioritized DMA channels.

use log::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMode {
    Immediate,
    VBlank,
    HBlank,
    Special,
}

impl TriggerMode {
    fn from_bits(bits: u32) -> Self {
        match bits & 0b11 {
            0 => TriggerMode::Immediate,
            1 => TriggerMode::VBlank,
            2 => TriggerMode::HBlank,
            3 => TriggerMode::Special,
            _ => unreachable!(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrControl {
    Increment,
    Decrement,
    Fixed,
    Reload,
}

impl AddrControl {
    fn from_bits(bits: u32) -> Self {
        match bits & 0b11 {
            0 => AddrControl::Increment,
            1 => AddrControl::Decrement,
            2 => AddrControl::Fixed,
            3 => AddrControl::Reload,
            _ => unreachable!(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferWidth {
    Half,
    Word,
}

/// Source/destination region masks per channel.
fn mask_source(channel: usize, addr: u32) -> u32 {
    match channel {
        0 => addr & 0x07FF_FFFF,
        _ => addr,
    }
}

fn mask_dest(channel: usize, addr: u32) -> u32 {
    match channel {
        0 | 1 | 2 => addr & 0x07FF_FFFF,
        _ => addr,
    }
}

#[derive(Debug, Clone)]
pub struct DmaChannel {
    pub src: u32,
    pub dst: u32,
    pub count: u32,
    pub src_control: AddrControl,
    pub dst_control: AddrControl,
    pub width: TransferWidth,
    pub mode: TriggerMode,
    pub repeat: bool,
    pub irq_on_completion: bool,
    pub enabled: bool,

    src_original: u32,
    dst_original: u32,
    count_original: u32,
}

impl DmaChannel {
    fn new() -> Self {
        Self {
            src: 0,
            dst: 0,
            count: 0,
            src_control: AddrControl::Increment,
            dst_control: AddrControl::Increment,
            width: TransferWidth::Half,
            mode: TriggerMode::Immediate,
            repeat: false,
            irq_on_completion: false,
            enabled: false,
            src_original: 0,
            dst_original: 0,
            count_original: 0,
        }
    }

    fn max_count(channel: usize) -> u32 {
        if channel == 3 { 0x1_0000 } else { 0x4000 }
    }

    /// Plain-data view of every field, including the private reload
    /// originals, for save states.
    pub fn snapshot(&self) -> DmaChannelSnapshot {
        DmaChannelSnapshot {
            src: self.src,
            dst: self.dst,
            count: self.count,
            src_control: self.src_control,
            dst_control: self.dst_control,
            width: self.width,
            mode: self.mode,
            repeat: self.repeat,
            irq_on_completion: self.irq_on_completion,
            enabled: self.enabled,
            src_original: self.src_original,
            dst_original: self.dst_original,
            count_original: self.count_original,
        }
    }

    pub fn restore(&mut self, s: DmaChannelSnapshot) {
        self.src = s.src;
        self.dst = s.dst;
        self.count = s.count;
        self.src_control = s.src_control;
        self.dst_control = s.dst_control;
        self.width = s.width;
        self.mode = s.mode;
        self.repeat = s.repeat;
        self.irq_on_completion = s.irq_on_completion;
        self.enabled = s.enabled;
        self.src_original = s.src_original;
        self.dst_original = s.dst_original;
        self.count_original = s.count_original;
    }
}

impl Default for DmaChannel {
    fn default() -> Self {
        Self::new()
    }
}

/// Byte-serializable view of [`DmaChannel`], for the machine's
/// save-state wire format.
#[derive(Debug, Clone, Copy)]
pub struct DmaChannelSnapshot {
    pub src: u32,
    pub dst: u32,
    pub count: u32,
    pub src_control: AddrControl,
    pub dst_control: AddrControl,
    pub width: TransferWidth,
    pub mode: TriggerMode,
    pub repeat: bool,
    pub irq_on_completion: bool,
    pub enabled: bool,
    pub src_original: u32,
    pub dst_original: u32,
    pub count_original: u32,
}

/// One transfer step's read-then-write addresses, handed to the bus by
/// the owning machine.
#[derive(Debug, Clone, Copy)]
pub struct TransferUnit {
    pub src: u32,
    pub dst: u32,
    pub width: TransferWidth,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BurstResult {
    pub irq: bool,
    pub rearmed: bool,
}

#[derive(Debug, Clone)]
pub struct Dma {
    channels: [DmaChannel; 4],
}

impl Dma {
    pub fn new() -> Self {
        Self {
            channels: [
                DmaChannel::new(),
                DmaChannel::new(),
                DmaChannel::new(),
                DmaChannel::new(),
            ],
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn channel(&self, index: usize) -> &DmaChannel {
        &self.channels[index]
    }

    pub fn channel_mut(&mut self, index: usize) -> &mut DmaChannel {
        &mut self.channels[index]
    }

    pub fn export(&self) -> [DmaChannel; 4] {
        self.channels.clone()
    }

    pub fn import(&mut self, channels: [DmaChannel; 4]) {
        self.channels = channels;
    }

    pub fn write_src(&mut self, index: usize, value: u32) {
        self.channels[index].src = value;
    }

    pub fn write_dst(&mut self, index: usize, value: u32) {
        self.channels[index].dst = value;
    }

    pub fn write_count(&mut self, index: usize, value: u32) {
        self.channels[index].count = value;
    }

    /// Apply a control-register write. Returns `true` if this is a
    /// rising edge on the enable bit that the caller should act on
    /// (immediate dispatch scheduling, or arming for later triggers).
    pub fn write_control(&mut self, index: usize, bits: u32) -> bool {
        let ch = &mut self.channels[index];
        let was_enabled = ch.enabled;
        ch.dst_control = AddrControl::from_bits(bits >> 5);
        ch.src_control = AddrControl::from_bits(bits >> 7);
        ch.repeat = (bits >> 9) & 1 != 0;
        ch.width = if (bits >> 10) & 1 != 0 { TransferWidth::Word } else { TransferWidth::Half };
        ch.mode = TriggerMode::from_bits(bits >> 12);
        ch.irq_on_completion = (bits >> 14) & 1 != 0;
        let enable = (bits >> 15) & 1 != 0;
        ch.enabled = enable;

        if enable && !was_enabled {
            ch.src_original = ch.src;
            ch.dst_original = ch.dst;
            ch.count_original = if ch.count == 0 { DmaChannel::max_count(index) } else { ch.count };
            ch.count = ch.count_original;
            trace!("dma{index}: armed, mode={:?}", ch.mode);
            true
        } else {
            false
        }
    }

    pub fn is_armed(&self, index: usize, mode: TriggerMode) -> bool {
        self.channels[index].enabled && self.channels[index].mode == mode
    }

    /// Build the ordered list of transfer units for a full burst of
    /// `index`, applying the per-unit address-increment and
    /// region-mask rules. Does not touch bus memory; the caller
    /// performs the actual reads/writes in order.
    pub fn burst_units(&self, index: usize) -> Vec<TransferUnit> {
        let ch = &self.channels[index];
        let unit_size: u32 = match ch.width {
            TransferWidth::Half => 2,
            TransferWidth::Word => 4,
        };
        let mut src = mask_source(index, ch.src);
        let mut dst = mask_dest(index, ch.dst);
        let mut units = Vec::with_capacity(ch.count as usize);
        for _ in 0..ch.count {
            units.push(TransferUnit { src, dst, width: ch.width });
            src = step_addr(src, ch.src_control, unit_size);
            dst = step_addr(dst, ch.dst_control, unit_size);
        }
        units
    }

    /// Complete a burst: handle repeat/reload on completion, or disarm
    /// the channel.
    pub fn complete_burst(&mut self, index: usize) -> BurstResult {
        let ch = &mut self.channels[index];
        let irq = ch.irq_on_completion;
        if ch.repeat && ch.mode != TriggerMode::Immediate {
            ch.count = ch.count_original;
            if ch.dst_control == AddrControl::Reload {
                ch.dst = ch.dst_original;
            }
            BurstResult { irq, rearmed: true }
        } else {
            ch.enabled = false;
            BurstResult { irq, rearmed: false }
        }
    }
}

impl Default for Dma {
    fn default() -> Self {
        Self::new()
    }
}

fn step_addr(addr: u32, control: AddrControl, unit_size: u32) -> u32 {
    match control {
        AddrControl::Increment | AddrControl::Reload => addr.wrapping_add(unit_size),
        AddrControl::Decrement => addr.wrapping_sub(unit_size),
        AddrControl::Fixed => addr,
    }
}

/// Channel priority order, highest first.
pub const PRIORITY_ORDER: [usize; 4] = [0, 1, 2, 3];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_count_means_max() {
        let mut d = Dma::new();
        d.write_count(0, 0);
        d.write_control(0, 1 << 15);
        assert_eq!(d.channel(0).count, 0x4000);
    }

    #[test]
    fn test_zero_count_channel3_is_64k() {
        let mut d = Dma::new();
        d.write_count(3, 0);
        d.write_control(3, 1 << 15);
        assert_eq!(d.channel(3).count, 0x1_0000);
    }

    #[test]
    fn test_immediate_burst_scenario() {
        // Boundary scenario 5.
        let mut d = Dma::new();
        d.write_src(0, 0x0200_0000);
        d.write_dst(0, 0x0300_0000);
        d.write_count(0, 4);
        let word = 1 << 10;
        d.write_control(0, word);
        let units = d.burst_units(0);
        assert_eq!(units.len(), 4);
        assert_eq!(units[0].src, 0x0200_0000);
        assert_eq!(units[1].src, 0x0200_0004);
        assert_eq!(units[3].dst, 0x0300_000C);
        let result = d.complete_burst(0);
        assert!(!result.rearmed);
        assert!(!d.channel(0).enabled);
    }

    #[test]
    fn test_repeat_reloads_count() {
        let mut d = Dma::new();
        d.write_count(1, 2);
        d.write_control(1, (1 << 9) | (1 << 12)); // repeat, vblank mode
        d.channels[1].count = 0;
        let result = d.complete_burst(1);
        assert!(result.rearmed);
        assert_eq!(d.channel(1).count, 2);
    }

    #[test]
    fn test_decrement_address() {
        assert_eq!(step_addr(100, AddrControl::Decrement, 4), 96);
    }

    #[test]
    fn test_fixed_address_unchanged() {
        assert_eq!(step_addr(100, AddrControl::Fixed, 4), 100);
    }

    #[test]
    fn test_source_region_mask_channel0() {
        assert_eq!(mask_source(0, 0x0900_0000), 0x0100_0000);
    }

    #[test]
    fn test_channel3_source_unmasked() {
        assert_eq!(mask_source(3, 0x0900_0000), 0x0900_0000);
    }
}
