//! Monotonic cycle-counted event queue.
//!
//! A fixed-array `Scheduler` holds one slot per `EventId`, with inactive
//! slots flagged via a high bit of the timestamp. Rather than storing a
//! boxed callback per slot (which would force a back-pointer into the
//! owning machine), `fire()` simply returns the list of due `EventId`s
//! in deadline order; the owning `Machine` dispatches each to its
//! handler and may re-`add` the event before returning.

pub const INACTIVE_FLAG: u64 = 1 << 63;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum EventId {
    PpuPeriod = 0,
    Timer0Overflow = 1,
    Timer1Overflow = 2,
    Timer2Overflow = 3,
    Timer3Overflow = 4,
    Dma0Immediate = 5,
    Dma1Immediate = 6,
    Dma2Immediate = 7,
    Dma3Immediate = 8,
    ApuSample = 9,
    FrameEnd = 10,
    WaitloopWake = 11,
}

pub const EVENT_COUNT: usize = 12;

impl EventId {
    pub const ALL: [EventId; EVENT_COUNT] = [
        EventId::PpuPeriod,
        EventId::Timer0Overflow,
        EventId::Timer1Overflow,
        EventId::Timer2Overflow,
        EventId::Timer3Overflow,
        EventId::Dma0Immediate,
        EventId::Dma1Immediate,
        EventId::Dma2Immediate,
        EventId::Dma3Immediate,
        EventId::ApuSample,
        EventId::FrameEnd,
        EventId::WaitloopWake,
    ];

    fn index(self) -> usize {
        self as usize
    }

    pub fn timer_overflow(channel: usize) -> EventId {
        match channel {
            0 => EventId::Timer0Overflow,
            1 => EventId::Timer1Overflow,
            2 => EventId::Timer2Overflow,
            3 => EventId::Timer3Overflow,
            _ => unreachable!("timer channel out of range"),
        }
    }

    pub fn dma_immediate(channel: usize) -> EventId {
        match channel {
            0 => EventId::Dma0Immediate,
            1 => EventId::Dma1Immediate,
            2 => EventId::Dma2Immediate,
            3 => EventId::Dma3Immediate,
            _ => unreachable!("dma channel out of range"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct SchedItem {
    /// Absolute cycle deadline, or `INACTIVE_FLAG` set when unused.
    deadline: u64,
    /// Monotonically increasing insertion sequence, used to break ties
    /// in deadline order (first inserted wins).
    sequence: u64,
}

impl SchedItem {
    const INACTIVE: SchedItem = SchedItem { deadline: INACTIVE_FLAG, sequence: 0 };

    fn is_active(&self) -> bool {
        self.deadline & INACTIVE_FLAG == 0
    }
}

#[derive(Debug, Clone)]
pub struct Scheduler {
    items: [SchedItem; EVENT_COUNT],
    cycles: u64,
    next_sequence: u64,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            items: [SchedItem::INACTIVE; EVENT_COUNT],
            cycles: 0,
            next_sequence: 0,
        }
    }

    pub fn reset(&mut self) {
        self.items = [SchedItem::INACTIVE; EVENT_COUNT];
        self.cycles = 0;
        self.next_sequence = 0;
    }

    pub fn current_time(&self) -> u64 {
        self.cycles
    }

    /// Enqueue `event` to fire `delay_cycles` from now. Replaces any
    /// existing entry for the same event.
    pub fn add(&mut self, event: EventId, delay_cycles: u64) {
        let seq = self.next_sequence;
        self.next_sequence += 1;
        self.items[event.index()] = SchedItem {
            deadline: self.cycles + delay_cycles,
            sequence: seq,
        };
    }

    pub fn remove(&mut self, event: EventId) {
        self.items[event.index()] = SchedItem::INACTIVE;
    }

    pub fn is_active(&self, event: EventId) -> bool {
        self.items[event.index()].is_active()
    }

    /// Cycles remaining until `event` fires, or `None` if inactive.
    pub fn ticks_remaining(&self, event: EventId) -> Option<u64> {
        let item = self.items[event.index()];
        if item.is_active() {
            Some(item.deadline.saturating_sub(self.cycles))
        } else {
            None
        }
    }

    /// Bill `n` cycles to the global counter. Invariant: the minimum
    /// active deadline never precedes the resulting counter value, so
    /// callers must `fire()` promptly after advancing.
    pub fn advance(&mut self, n: u64) {
        self.cycles += n;
    }

    /// Cycles until the next scheduled event, or `None` if nothing is
    /// pending. Used by the idle-loop fast-forward path.
    pub fn cycles_to_next_event(&self) -> Option<u64> {
        self.items
            .iter()
            .filter(|i| i.is_active())
            .map(|i| i.deadline.saturating_sub(self.cycles))
            .min()
    }

    /// Drain and return every event whose deadline has passed, in
    /// (deadline, insertion-order) order. Does not re-arm them; a
    /// periodic event's handler is expected to call `add` again.
    /// Plain-data snapshot of every slot's (deadline, sequence) pair
    /// plus the clock itself, for save states.
    pub fn export(&self) -> ([(u64, u64); EVENT_COUNT], u64, u64) {
        let mut items = [(0u64, 0u64); EVENT_COUNT];
        for (i, item) in self.items.iter().enumerate() {
            items[i] = (item.deadline, item.sequence);
        }
        (items, self.cycles, self.next_sequence)
    }

    pub fn import(&mut self, items: [(u64, u64); EVENT_COUNT], cycles: u64, next_sequence: u64) {
        for (i, &(deadline, sequence)) in items.iter().enumerate() {
            self.items[i] = SchedItem { deadline, sequence };
        }
        self.cycles = cycles;
        self.next_sequence = next_sequence;
    }

    pub fn fire(&mut self) -> Vec<EventId> {
        let mut due: Vec<(u64, u64, EventId)> = Vec::new();
        for &id in EventId::ALL.iter() {
            let item = self.items[id.index()];
            if item.is_active() && item.deadline <= self.cycles {
                due.push((item.deadline, item.sequence, id));
            }
        }
        due.sort_unstable_by_key(|&(deadline, sequence, _)| (deadline, sequence));
        for &(_, _, id) in &due {
            self.items[id.index()] = SchedItem::INACTIVE;
        }
        due.into_iter().map(|(_, _, id)| id).collect()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_has_no_pending() {
        let s = Scheduler::new();
        assert_eq!(s.cycles_to_next_event(), None);
    }

    #[test]
    fn test_add_and_fire() {
        let mut s = Scheduler::new();
        s.add(EventId::PpuPeriod, 10);
        s.advance(10);
        let fired = s.fire();
        assert_eq!(fired, vec![EventId::PpuPeriod]);
        assert!(!s.is_active(EventId::PpuPeriod));
    }

    #[test]
    fn test_fire_nothing_before_deadline() {
        let mut s = Scheduler::new();
        s.add(EventId::FrameEnd, 100);
        s.advance(50);
        assert!(s.fire().is_empty());
    }

    #[test]
    fn test_replace_same_event() {
        let mut s = Scheduler::new();
        s.add(EventId::Timer0Overflow, 100);
        s.add(EventId::Timer0Overflow, 5);
        s.advance(5);
        assert_eq!(s.fire(), vec![EventId::Timer0Overflow]);
    }

    #[test]
    fn test_fifo_tie_break() {
        let mut s = Scheduler::new();
        s.add(EventId::Timer0Overflow, 10);
        s.add(EventId::Timer1Overflow, 10);
        s.advance(10);
        assert_eq!(s.fire(), vec![EventId::Timer0Overflow, EventId::Timer1Overflow]);
    }

    #[test]
    fn test_remove_cancels() {
        let mut s = Scheduler::new();
        s.add(EventId::ApuSample, 5);
        s.remove(EventId::ApuSample);
        s.advance(100);
        assert!(s.fire().is_empty());
    }

    #[test]
    fn test_cycles_to_next_event_min() {
        let mut s = Scheduler::new();
        s.add(EventId::Timer0Overflow, 50);
        s.add(EventId::Timer1Overflow, 20);
        assert_eq!(s.cycles_to_next_event(), Some(20));
    }

    #[test]
    fn test_ticks_remaining_after_advance() {
        let mut s = Scheduler::new();
        s.add(EventId::WaitloopWake, 30);
        s.advance(10);
        assert_eq!(s.ticks_remaining(EventId::WaitloopWake), Some(20));
    }
}
