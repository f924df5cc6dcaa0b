//! Exception vector entry: mode switch, SPSR save, LR computation, and
//! pipeline refill for all seven exception kinds.
//!
//! `cpu.pc` at call time already reflects the increment `Cpu::step`
//! applies before invoking a handler (or, for IRQ, the address of the
//! instruction about to be fetched), so every LR formula here is
//! expressed relative to that value rather than to the raw opcode's own
//! address.

use super::{flags, Cpu, ExceptionKind, Mode};
use crate::bus::Bus;

fn vector_and_mode(kind: ExceptionKind) -> (u32, Mode, bool) {
    match kind {
        ExceptionKind::Reset => (0x00, Mode::Supervisor, true),
        ExceptionKind::Undefined => (0x04, Mode::Undefined, false),
        ExceptionKind::SoftwareInterrupt => (0x08, Mode::Supervisor, false),
        ExceptionKind::PrefetchAbort => (0x0C, Mode::Abort, false),
        ExceptionKind::DataAbort => (0x10, Mode::Abort, false),
        ExceptionKind::Irq => (0x18, Mode::Irq, false),
        ExceptionKind::Fiq => (0x1C, Mode::Fiq, true),
    }
}

/// Return-address offset from `cpu.pc` at the moment the exception is
/// recognized. Reset has no meaningful return address.
fn lr_offset(kind: ExceptionKind) -> i64 {
    match kind {
        ExceptionKind::Reset => 0,
        ExceptionKind::Undefined | ExceptionKind::SoftwareInterrupt => 0,
        ExceptionKind::PrefetchAbort | ExceptionKind::DataAbort => 4,
        ExceptionKind::Irq | ExceptionKind::Fiq => 4,
    }
}

/// Enter `kind`: save CPSR to the target mode's SPSR, bank in the new
/// mode, set LR, force ARM state with IRQs masked (and FIQ too for
/// Reset/FIQ), and jump to the vector. Returns the cycle cost.
pub fn enter(cpu: &mut Cpu, bus: &mut Bus, kind: ExceptionKind) -> u32 {
    let (vector, mode, mask_fiq) = vector_and_mode(kind);
    let old_cpsr = cpu.cpsr;
    let lr_value = (cpu.pc as i64).wrapping_add(lr_offset(kind)) as u32;

    cpu.halted = false;
    cpu.set_mode(mode);
    cpu.set_spsr(old_cpsr);
    if kind != ExceptionKind::Reset {
        cpu.set_reg(14, lr_value);
    }

    cpu.cpsr &= !flags::T;
    cpu.cpsr |= flags::I;
    if mask_fiq {
        cpu.cpsr |= flags::F;
    }

    cpu.pc = vector;
    cpu.refill_pipeline(bus);
    3
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{Bios, Rom};

    fn test_bus() -> Bus {
        Bus::new(Bios::new(vec![0; 0x4000]), Rom::new(vec![0u8; 0x200]))
    }

    #[test]
    fn test_swi_enters_supervisor_and_sets_lr() {
        let mut cpu = Cpu::new();
        let mut bus = test_bus();
        cpu.cpsr = (cpu.cpsr & !flags::MODE_MASK) | Mode::User.bits();
        cpu.pc = 0x0800_0004;
        enter(&mut cpu, &mut bus, ExceptionKind::SoftwareInterrupt);
        assert_eq!(cpu.mode(), Mode::Supervisor);
        assert_eq!(cpu.reg(14), 0x0800_0004);
        assert_eq!(cpu.pc, 0x08);
        assert!(!cpu.thumb_state());
        assert_ne!(cpu.cpsr & flags::I, 0);
    }

    #[test]
    fn test_irq_saves_caller_cpsr_to_spsr() {
        let mut cpu = Cpu::new();
        let mut bus = test_bus();
        cpu.cpsr = (cpu.cpsr & !flags::MODE_MASK) | Mode::User.bits();
        cpu.cpsr |= flags::N;
        cpu.pc = 0x0800_0100;
        enter(&mut cpu, &mut bus, ExceptionKind::Irq);
        assert_eq!(cpu.mode(), Mode::Irq);
        assert_eq!(cpu.reg(14), 0x0800_0104);
        assert_eq!(cpu.pc, 0x18);
        assert_ne!(cpu.spsr() & flags::N, 0);
    }

    #[test]
    fn test_reset_masks_both_irq_and_fiq() {
        let mut cpu = Cpu::new();
        let mut bus = test_bus();
        enter(&mut cpu, &mut bus, ExceptionKind::Reset);
        assert_eq!(cpu.pc, 0);
        assert_ne!(cpu.cpsr & flags::I, 0);
        assert_ne!(cpu.cpsr & flags::F, 0);
    }
}
