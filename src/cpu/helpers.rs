//! Banked register access, condition evaluation, and ALU flag
//! primitives shared by the ARM and Thumb decoders.

use super::{flags, Cpu, Mode};
use crate::shifter::{shift_by_immediate, shift_by_register, ShiftOp, ShiftResult};

impl Cpu {
    /// Read general register `n`. R15 reads as `pc + 8` in ARM state or
    /// `pc + 4` in Thumb state, per the pipeline's look-ahead. `self.pc`
    /// already carries the one-instruction-width advance `Cpu::step`
    /// applies before calling into a handler, so only the remaining
    /// half of the look-ahead (4 in ARM, 2 in Thumb) is added here.
    pub fn reg(&self, n: u32) -> u32 {
        match n {
            0..=7 => self.reg_low[n as usize],
            8..=12 => {
                if self.mode() == Mode::Fiq {
                    self.fiq_mid[(n - 8) as usize]
                } else {
                    self.reg_mid[(n - 8) as usize]
                }
            }
            13 => self.banked_r13[self.mode().bank_index()],
            14 => self.banked_r14[self.mode().bank_index()],
            15 => self.pc.wrapping_add(if self.thumb_state() { 2 } else { 4 }),
            _ => unreachable!("register index out of range"),
        }
    }

    /// Write general register `n`. Writing R15 is a branch: the caller
    /// is responsible for noticing `pc` changed and flushing the
    /// pipeline (done centrally in [`Cpu::step`]).
    pub fn set_reg(&mut self, n: u32, value: u32) {
        match n {
            0..=7 => self.reg_low[n as usize] = value,
            8..=12 => {
                if self.mode() == Mode::Fiq {
                    self.fiq_mid[(n - 8) as usize] = value;
                } else {
                    self.reg_mid[(n - 8) as usize] = value;
                }
            }
            13 => self.banked_r13[self.mode().bank_index()] = value,
            14 => self.banked_r14[self.mode().bank_index()] = value,
            15 => {
                self.pc = if self.thumb_state() { value & !1 } else { value & !3 };
            }
            _ => unreachable!("register index out of range"),
        }
    }

    pub fn spsr(&self) -> u32 {
        let idx = self.mode().bank_index();
        self.banked_spsr[idx]
    }

    pub fn set_spsr(&mut self, value: u32) {
        let idx = self.mode().bank_index();
        if self.mode().has_spsr() {
            self.banked_spsr[idx] = value;
        }
    }

    /// Switch to `new_mode`, preserving the outgoing mode's banked
    /// R13/R14/SPSR (already disjoint storage, so nothing to copy)
    /// and, when entering a mode with its own SPSR, loading it with
    /// the caller-supplied value on exception entry only.
    pub fn set_mode(&mut self, new_mode: Mode) {
        self.cpsr = (self.cpsr & !flags::MODE_MASK) | new_mode.bits();
    }

    pub fn set_thumb(&mut self, thumb: bool) {
        if thumb {
            self.cpsr |= flags::T;
        } else {
            self.cpsr &= !flags::T;
        }
    }

    pub fn flag_n(&self) -> bool {
        self.cpsr & flags::N != 0
    }
    pub fn flag_z(&self) -> bool {
        self.cpsr & flags::Z != 0
    }
    pub fn flag_c(&self) -> bool {
        self.cpsr & flags::C != 0
    }
    pub fn flag_v(&self) -> bool {
        self.cpsr & flags::V != 0
    }

    pub fn set_nz(&mut self, result: u32) {
        self.cpsr &= !(flags::N | flags::Z);
        if result & 0x8000_0000 != 0 {
            self.cpsr |= flags::N;
        }
        if result == 0 {
            self.cpsr |= flags::Z;
        }
    }

    pub fn set_c(&mut self, carry: bool) {
        if carry {
            self.cpsr |= flags::C;
        } else {
            self.cpsr &= !flags::C;
        }
    }

    pub fn set_v(&mut self, overflow: bool) {
        if overflow {
            self.cpsr |= flags::V;
        } else {
            self.cpsr &= !flags::V;
        }
    }

    /// ADD with flags (used by ADD/ADC/CMN). Returns the 32-bit result.
    pub fn alu_add_flags(&mut self, a: u32, b: u32, carry_in: u32, set_flags: bool) -> u32 {
        let (r1, c1) = a.overflowing_add(b);
        let (result, c2) = r1.overflowing_add(carry_in);
        if set_flags {
            self.set_nz(result);
            self.set_c(c1 || c2);
            let overflow = ((a ^ result) & (b ^ result) & 0x8000_0000) != 0;
            self.set_v(overflow);
        }
        result
    }

    /// SUB with flags (used by SUB/SBC/CMP/RSB/RSC). Carry is set when
    /// no borrow occurs, matching ARM's inverted-borrow convention.
    pub fn alu_sub_flags(&mut self, a: u32, b: u32, borrow_in: u32, set_flags: bool) -> u32 {
        let not_b = !b;
        let (r1, c1) = a.overflowing_add(not_b);
        let (result, c2) = r1.overflowing_add(borrow_in);
        if set_flags {
            self.set_nz(result);
            self.set_c(c1 || c2);
            let overflow = ((a ^ b) & (a ^ result) & 0x8000_0000) != 0;
            self.set_v(overflow);
        }
        result
    }

    /// Evaluate the 4-bit condition field (bits 31:28) of an ARM
    /// opcode against the current flags.
    pub fn check_condition(&self, cond: u32) -> bool {
        match cond {
            0x0 => self.flag_z(),
            0x1 => !self.flag_z(),
            0x2 => self.flag_c(),
            0x3 => !self.flag_c(),
            0x4 => self.flag_n(),
            0x5 => !self.flag_n(),
            0x6 => self.flag_v(),
            0x7 => !self.flag_v(),
            0x8 => self.flag_c() && !self.flag_z(),
            0x9 => !self.flag_c() || self.flag_z(),
            0xA => self.flag_n() == self.flag_v(),
            0xB => self.flag_n() != self.flag_v(),
            0xC => !self.flag_z() && (self.flag_n() == self.flag_v()),
            0xD => self.flag_z() || (self.flag_n() != self.flag_v()),
            0xE => true,
            _ => false,
        }
    }

    /// Apply the register-specified or immediate shift in a data
    /// processing operand2, updating the carry flag when `set_flags`.
    pub fn eval_shift(
        &mut self,
        op: ShiftOp,
        value: u32,
        amount: u32,
        by_register: bool,
        set_flags: bool,
    ) -> u32 {
        let carry_in = self.flag_c();
        let ShiftResult { value: result, carry } = if by_register {
            shift_by_register(op, value, amount, carry_in)
        } else {
            shift_by_immediate(op, value, amount, carry_in)
        };
        if set_flags {
            self.set_c(carry);
        }
        result
    }
}

pub fn condition_passes(cpu: &Cpu, opcode: u32) -> bool {
    cpu.check_condition(opcode >> 28)
}
