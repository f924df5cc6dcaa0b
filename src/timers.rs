//! Four 16-bit timer channels: prescaler or cascade, overflow IRQ,
//! audio-FIFO tick driver.
//!
//! Counters are 16-bit, count up only, and are driven by the scheduler
//! rather than polled every CPU step. Each channel uses a
//! clock-divider-by-shift-amount (`1 << div_bits`) and a
//! byte-addressable register read/write shape, but counter values are
//! reconstructed by interpolation from the next scheduled overflow
//! rather than accumulated by a polled tick loop.

use log::trace;

pub const PRESCALER_CODES: [u16; 4] = [1, 64, 256, 1024];

#[derive(Debug, Clone, Copy)]
pub struct TimerChannel {
    reload: u16,
    /// Counter value as of `last_event_time`. For a running,
    /// non-cascade timer this is always the value at the most recent
    /// reload; reads interpolate forward from it.
    counter_at_last_event: u16,
    last_event_time: u64,
    prescaler_code: u8,
    cascade: bool,
    irq_enable: bool,
    enabled: bool,
}

impl TimerChannel {
    fn new() -> Self {
        Self {
            reload: 0,
            counter_at_last_event: 0,
            last_event_time: 0,
            prescaler_code: 0,
            cascade: false,
            irq_enable: false,
            enabled: false,
        }
    }

    fn prescaler(&self) -> u64 {
        PRESCALER_CODES[self.prescaler_code as usize] as u64
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_cascade(&self) -> bool {
        self.cascade
    }

    pub fn reload_value(&self) -> u16 {
        self.reload
    }

    pub fn control_bits(&self) -> u16 {
        (self.prescaler_code as u16)
            | ((self.cascade as u16) << 2)
            | ((self.irq_enable as u16) << 6)
            | ((self.enabled as u16) << 7)
    }

    /// Interpolated counter read.
    pub fn counter(&self, now: u64) -> u16 {
        if !self.enabled || self.cascade {
            return self.counter_at_last_event;
        }
        let elapsed = now.saturating_sub(self.last_event_time);
        let ticks = elapsed / self.prescaler();
        self.counter_at_last_event.wrapping_add(ticks as u16)
    }

    /// Cycles from `now` until this (non-cascade) channel's counter
    /// would reach 0x10000 and overflow.
    fn cycles_to_overflow(&self, now: u64) -> u64 {
        let remaining = 0x1_0000u32 - self.counter(now) as u32;
        remaining as u64 * self.prescaler()
    }

    /// Plain-data view of every field for save states.
    pub fn snapshot(&self) -> TimerChannelSnapshot {
        TimerChannelSnapshot {
            reload: self.reload,
            counter_at_last_event: self.counter_at_last_event,
            last_event_time: self.last_event_time,
            prescaler_code: self.prescaler_code,
            cascade: self.cascade,
            irq_enable: self.irq_enable,
            enabled: self.enabled,
        }
    }

    pub fn restore(&mut self, s: TimerChannelSnapshot) {
        self.reload = s.reload;
        self.counter_at_last_event = s.counter_at_last_event;
        self.last_event_time = s.last_event_time;
        self.prescaler_code = s.prescaler_code;
        self.cascade = s.cascade;
        self.irq_enable = s.irq_enable;
        self.enabled = s.enabled;
    }
}

/// Byte-serializable view of [`TimerChannel`], for the machine's
/// save-state wire format.
#[derive(Debug, Clone, Copy)]
pub struct TimerChannelSnapshot {
    pub reload: u16,
    pub counter_at_last_event: u16,
    pub last_event_time: u64,
    pub prescaler_code: u8,
    pub cascade: bool,
    pub irq_enable: bool,
    pub enabled: bool,
}

impl Default for TimerChannel {
    fn default() -> Self {
        Self::new()
    }
}

/// What the owning machine must do in response to a control-register
/// write: (re)arm an overflow event, or cancel one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleAction {
    None,
    Arm { delay_cycles: u64 },
    Cancel,
}

/// What the owning machine must do in response to a fired overflow
/// event.
#[derive(Debug, Clone, Copy, Default)]
pub struct OverflowOutcome {
    pub irq_mask: u16,
    /// Set for channel 0 or 1 when it is configured to drive the audio
    /// FIFO (the egress to the out-of-scope APU is just a notification
    /// hook).
    pub feeds_apu: Option<u8>,
    pub reschedule: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct Timers {
    channels: [TimerChannel; 4],
    apu_fifo_timer_select: [u8; 2],
}

impl Timers {
    pub fn new() -> Self {
        Self {
            channels: [TimerChannel::new(); 4],
            apu_fifo_timer_select: [0, 0],
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn channel(&self, index: usize) -> &TimerChannel {
        &self.channels[index]
    }

    pub fn channel_mut(&mut self, index: usize) -> &mut TimerChannel {
        &mut self.channels[index]
    }

    pub fn apu_fifo_timer_select(&self) -> [u8; 2] {
        self.apu_fifo_timer_select
    }

    pub fn export(&self) -> ([TimerChannel; 4], [u8; 2]) {
        (self.channels, self.apu_fifo_timer_select)
    }

    pub fn import(&mut self, channels: [TimerChannel; 4], apu_fifo_timer_select: [u8; 2]) {
        self.channels = channels;
        self.apu_fifo_timer_select = apu_fifo_timer_select;
    }

    pub fn set_apu_fifo_timer_select(&mut self, fifo: usize, timer: u8) {
        self.apu_fifo_timer_select[fifo] = timer;
    }

    pub fn read_reload(&self, index: usize) -> u16 {
        self.channels[index].reload
    }

    pub fn write_reload(&mut self, index: usize, value: u16) {
        self.channels[index].reload = value;
    }

    pub fn read_counter(&self, index: usize, now: u64) -> u16 {
        self.channels[index].counter(now)
    }

    /// Apply a control-register write; returns what the scheduler must
    /// do as a result.
    pub fn write_control(&mut self, index: usize, value: u16, now: u64) -> ScheduleAction {
        let was_enabled = self.channels[index].enabled;
        let ch = &mut self.channels[index];
        ch.prescaler_code = (value & 0x3) as u8;
        ch.cascade = value & (1 << 2) != 0;
        ch.irq_enable = value & (1 << 6) != 0;
        let enable = value & (1 << 7) != 0;

        if enable && !was_enabled {
            ch.counter_at_last_event = ch.reload;
            ch.last_event_time = now;
            ch.enabled = true;
            if ch.cascade {
                ScheduleAction::None
            } else {
                ScheduleAction::Arm { delay_cycles: ch.cycles_to_overflow(now) }
            }
        } else if !enable && was_enabled {
            ch.counter_at_last_event = ch.counter(now);
            ch.last_event_time = now;
            ch.enabled = false;
            ScheduleAction::Cancel
        } else if enable && ch.cascade {
            // Switching from prescaler mode to cascade mode (or vice
            // versa) while already enabled: freeze/reinterpret, caller
            // decides whether to cancel any pending event.
            ch.counter_at_last_event = ch.counter(now);
            ch.last_event_time = now;
            ScheduleAction::Cancel
        } else if enable {
            ch.counter_at_last_event = ch.counter(now);
            ch.last_event_time = now;
            ScheduleAction::Arm { delay_cycles: ch.cycles_to_overflow(now) }
        } else {
            ScheduleAction::None
        }
    }

    /// Handle a fired overflow for `index`, recursing into cascade
    /// successors that overflow as a result.
    pub fn handle_overflow(&mut self, index: usize, now: u64) -> OverflowOutcome {
        let mut outcome = OverflowOutcome::default();
        self.overflow_inner(index, now, &mut outcome);
        outcome
    }

    fn overflow_inner(&mut self, index: usize, now: u64, outcome: &mut OverflowOutcome) {
        if index >= self.channels.len() || !self.channels[index].enabled {
            return;
        }
        let reload = self.channels[index].reload;
        self.channels[index].counter_at_last_event = reload;
        self.channels[index].last_event_time = now;

        if self.channels[index].irq_enable {
            outcome.irq_mask |= irq_bit(index);
            trace!("timer {index}: overflow irq raised");
        }
        for (fifo, &sel) in self.apu_fifo_timer_select.iter().enumerate() {
            if sel as usize == index {
                outcome.feeds_apu = Some(fifo as u8);
            }
        }

        if !self.channels[index].cascade {
            outcome.reschedule = Some(self.channels[index].cycles_to_overflow(now));
        }

        if let Some(next) = self.channels.get_mut(index + 1) {
            if next.cascade && next.enabled {
                let (new_counter, overflowed) = next.counter_at_last_event.overflowing_add(1);
                next.counter_at_last_event = new_counter;
                next.last_event_time = now;
                if overflowed {
                    self.overflow_inner(index + 1, now, outcome);
                }
            }
        }
    }
}

impl Default for Timers {
    fn default() -> Self {
        Self::new()
    }
}

fn irq_bit(channel: usize) -> u16 {
    use crate::interrupt::sources;
    match channel {
        0 => sources::TIMER0,
        1 => sources::TIMER1,
        2 => sources::TIMER2,
        3 => sources::TIMER3,
        _ => unreachable!(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enable_arms_overflow() {
        let mut t = Timers::new();
        t.write_reload(0, 0xFFFE);
        let action = t.write_control(0, 1 << 7, 0);
        assert_eq!(action, ScheduleAction::Arm { delay_cycles: 2 });
    }

    #[test]
    fn test_counter_interpolates() {
        let mut t = Timers::new();
        t.write_reload(0, 0);
        t.write_control(0, 1 << 7, 0);
        assert_eq!(t.read_counter(0, 10), 10);
    }

    #[test]
    fn test_overflow_reloads_and_raises_irq() {
        let mut t = Timers::new();
        t.write_reload(0, 0xFFFE);
        t.write_control(0, (1 << 7) | (1 << 6), 0);
        let outcome = t.handle_overflow(0, 2);
        assert_eq!(outcome.irq_mask, crate::interrupt::sources::TIMER0);
        assert_eq!(t.read_counter(0, 2), 0xFFFE);
    }

    #[test]
    fn test_cascade_chain_scenario() {
        // Timer0 prescaler 1, reload 0xFFFE; timer1 cascade, reload
        // 0xFFFF. Each timer0 overflow bumps timer1 by one and, since
        // incrementing 0xFFFF by 1 always overflows, timer1 reloads to
        // 0xFFFF and raises its IRQ on every one of the 4 overflows
        // (real timer hardware reloads on every overflow, cascaded or
        // not, so a reload value equal to the pre-bump counter value
        // oscillates rather than drifting toward zero).
        let mut t = Timers::new();
        t.write_reload(0, 0xFFFE);
        t.write_control(0, (1 << 7) | (1 << 6), 0);
        t.write_reload(1, 0xFFFF);
        t.write_control(1, (1 << 7) | (1 << 6) | (1 << 2), 0);

        let mut now = 0u64;
        let mut timer1_irq_count = 0;
        for _ in 0..4 {
            now += 2;
            let outcome = t.handle_overflow(0, now);
            if outcome.irq_mask & crate::interrupt::sources::TIMER1 != 0 {
                timer1_irq_count += 1;
            }
        }
        assert_eq!(timer1_irq_count, 4);
        assert_eq!(t.read_counter(1, now), 0xFFFF);
    }

    #[test]
    fn test_disable_freezes_counter() {
        let mut t = Timers::new();
        t.write_reload(0, 0);
        t.write_control(0, 1 << 7, 0);
        let frozen = t.read_counter(0, 5);
        t.write_control(0, 0, 5);
        assert_eq!(t.read_counter(0, 100), frozen);
    }
}
