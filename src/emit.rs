// Instruction emission: the bridge between slots and registers.
//
// Every emitter below follows the same discipline: materialise each
// operand slot into a physical register (borrowing a scratch register
// from the temp window when the slot is a constant, a ref, an upvalue,
// or lives too far up the frame), emit exactly one instruction paired
// with one source-map entry, write the result back through the slot's
// own path when asked to, then release whatever was borrowed.
//
// Forward jumps are emitted with a zero offset and patched when the
// target index is known; the offsets are instruction-relative.

use std::convert::TryFrom;

use tracing::trace;

use crate::compiler::{Compiler, Slot, SlotFlag};
use crate::opcode::{
    word, word_l, word_s, word_si, word_sl, word_ss, word_ssi, word_sss, word_ssu,
    word_su, Op,
};
use crate::regalloc::{RegTemp, TEMP_BASE};
use crate::value::Value;


impl<'e> Compiler<'e> {
    // Append one instruction and its mapping. The two streams stay the
    // same length at every point, including after errors, because this
    // is the only place either grows.
    pub(crate) fn emit(&mut self, instruction: u32) -> usize {
        if self.failed() {
            return self.buffer.len();
        }
        trace!(word = format_args!("{:08x}", instruction), "emit");
        self.buffer.push(instruction);
        self.mapbuffer.push(self.current_mapping);
        self.buffer.len() - 1
    }

    // ------------------------------------------------------------------
    // Constants into registers

    pub(crate) fn load_const(&mut self, value: &Value, reg: i32) {
        if self.failed() {
            return;
        }
        debug_assert!((0..=0xFF).contains(&reg));
        let reg = reg as u32;
        match value {
            Value::Nil => {
                self.emit(word_s(Op::LoadNil, reg));
            }
            Value::Boolean(true) => {
                self.emit(word_s(Op::LoadTrue, reg));
            }
            Value::Boolean(false) => {
                self.emit(word_s(Op::LoadFalse, reg));
            }
            Value::Integer(i) if i16::try_from(*i).is_ok() => {
                self.emit(word_si(Op::LoadInteger, reg, *i as i16));
            }
            Value::Number(n) if small_integral(*n) => {
                self.emit(word_si(Op::LoadInteger, reg, *n as i16));
            }
            _ => {
                let index = self.add_constant(value);
                self.emit(word_su(Op::LoadConstant, reg, index as u16));
            }
        }
    }

    // ------------------------------------------------------------------
    // Moves between slots and registers

    // Bring a slot's value into a near register.
    pub(crate) fn move_near(&mut self, dest: i32, src: &Slot) {
        if self.failed() {
            return;
        }
        debug_assert!((0..=0xFF).contains(&dest));
        if src.flags.intersects(SlotFlag::Constant | SlotFlag::Ref) {
            let value = src.constant.clone().expect("constant slot without a value");
            self.load_const(&value, dest);
            if src.flags.contains(SlotFlag::Ref) {
                // Deref the one-element cell in place.
                self.emit(word_ssu(Op::GetIndex, dest as u32, dest as u32, 0));
            }
        } else if src.envindex >= 0 {
            if src.index > 0xFF {
                self.cerror("upvalue slot index out of range".into());
                return;
            }
            self.emit(word_sss(
                Op::LoadUpvalue,
                dest as u32,
                src.envindex as u32,
                src.index as u32,
            ));
        } else if src.index != dest {
            self.emit(word_ss(Op::MoveNear, dest as u32, src.index as u32));
        }
    }

    // The dual: store a near register back through a slot.
    pub(crate) fn move_back(&mut self, dest: &Slot, src: i32) {
        if self.failed() {
            return;
        }
        if dest.flags.contains(SlotFlag::Ref) {
            let cell = dest.constant.clone().expect("ref slot without a cell");
            let near = self.near_source(src);
            let refreg = self.scope_mut().ra.alloc_temp(RegTemp::T3);
            self.load_const(&cell, refreg);
            self.emit(word_ssu(Op::PutIndex, refreg as u32, near as u32, 0));
            self.scope_mut().ra.free_temp(refreg, RegTemp::T3);
            self.release_near_source(src, near);
        } else if dest.envindex >= 0 {
            if dest.index > 0xFF {
                self.cerror("upvalue slot index out of range".into());
                return;
            }
            let near = self.near_source(src);
            self.emit(word_sss(
                Op::SetUpvalue,
                near as u32,
                dest.envindex as u32,
                dest.index as u32,
            ));
            self.release_near_source(src, near);
        } else if dest.index != src {
            let near = self.near_source(src);
            self.emit(word_ss(Op::MoveFar, near as u32, dest.index as u32));
            self.release_near_source(src, near);
        }
    }

    fn near_source(&mut self, src: i32) -> i32 {
        if src <= 0xFF {
            return src;
        }
        let temp = self.scope_mut().ra.alloc_temp(RegTemp::T6);
        self.emit(word_ss(Op::MoveNear, temp as u32, src as u32));
        temp
    }

    fn release_near_source(&mut self, src: i32, near: i32) {
        if near != src {
            self.scope_mut().ra.free_temp(near, RegTemp::T6);
        }
    }

    // Slot-to-slot copy, interposing a scratch register when neither
    // side is a plain near local.
    pub(crate) fn copy(&mut self, dest: &Slot, src: &Slot) {
        if self.failed() {
            return;
        }
        if plain_near_local(dest) {
            self.move_near(dest.index, src);
        } else if plain_near_local(src) {
            self.move_back(dest, src.index);
        } else {
            let temp = self.scope_mut().ra.alloc_temp(RegTemp::T4);
            self.move_near(temp, src);
            self.move_back(dest, temp);
            self.scope_mut().ra.free_temp(temp, RegTemp::T4);
        }
    }

    // ------------------------------------------------------------------
    // Register materialisation

    // An 8-bit register holding the slot's value. Plain near locals are
    // used in place; everything else goes through a scratch register.
    pub(crate) fn reg_near(&mut self, s: &Slot, tag: RegTemp) -> i32 {
        if plain_near_local(s) {
            return s.index;
        }
        let reg = self.scope_mut().ra.alloc_temp(tag);
        self.move_near(reg, s);
        reg
    }

    // A register for a 16-bit operand position. Any real local works;
    // a scratch that landed in the temp window is shifted out so a
    // nested emitter cannot clobber it before the consumer runs.
    pub(crate) fn reg_far(&mut self, s: &Slot, tag: RegTemp) -> i32 {
        if s.envindex < 0
            && s.index >= 0
            && !s.flags.intersects(SlotFlag::Constant | SlotFlag::Ref)
        {
            return s.index;
        }
        let reg = self.scope_mut().ra.alloc_temp(tag);
        self.move_near(reg, s);
        if reg >= TEMP_BASE && reg <= 0xFF {
            let far = self.scope_mut().ra.alloc_1();
            self.emit(word_ss(Op::MoveFar, reg as u32, far as u32));
            self.scope_mut().ra.free_temp(reg, tag);
            return far;
        }
        reg
    }

    // Release a register handed out by reg_near/reg_far.
    fn free_reg(&mut self, s: &Slot, reg: i32, tag: RegTemp) {
        if s.envindex < 0 && reg == s.index {
            return;
        }
        let ra = &mut self.scope_mut().ra;
        if ra.temp_claimed(tag) {
            ra.free_temp(reg, tag);
        } else {
            ra.free(reg);
        }
    }

    // ------------------------------------------------------------------
    // Shape emitters

    pub(crate) fn emit_s(&mut self, op: Op, s: &Slot, wr: bool) -> usize {
        if self.failed() {
            return 0;
        }
        let reg = self.reg_far(s, RegTemp::T0);
        let label = self.emit(word_s(op, reg as u32));
        if wr {
            self.move_back(s, reg);
        }
        self.free_reg(s, reg, RegTemp::T0);
        label
    }

    pub(crate) fn emit_ss(&mut self, op: Op, s1: &Slot, s2: &Slot, wr: bool) -> usize {
        if self.failed() {
            return 0;
        }
        let r1 = self.reg_near(s1, RegTemp::T0);
        let r2 = self.reg_far(s2, RegTemp::T1);
        let label = self.emit(word_ss(op, r1 as u32, r2 as u32));
        if wr {
            self.move_back(s1, r1);
        }
        self.free_reg(s2, r2, RegTemp::T1);
        self.free_reg(s1, r1, RegTemp::T0);
        label
    }

    pub(crate) fn emit_sss(
        &mut self,
        op: Op,
        s1: &Slot,
        s2: &Slot,
        s3: &Slot,
        wr: bool,
    ) -> usize {
        if self.failed() {
            return 0;
        }
        let r1 = self.reg_near(s1, RegTemp::T0);
        let r2 = self.reg_near(s2, RegTemp::T1);
        let r3 = self.reg_near(s3, RegTemp::T2);
        let label = self.emit(word_sss(op, r1 as u32, r2 as u32, r3 as u32));
        if wr {
            self.move_back(s1, r1);
        }
        self.free_reg(s3, r3, RegTemp::T2);
        self.free_reg(s2, r2, RegTemp::T1);
        self.free_reg(s1, r1, RegTemp::T0);
        label
    }

    pub(crate) fn emit_si(&mut self, op: Op, s: &Slot, imm: i16, wr: bool) -> usize {
        if self.failed() {
            return 0;
        }
        let reg = self.reg_near(s, RegTemp::T0);
        let label = self.emit(word_si(op, reg as u32, imm));
        if wr {
            self.move_back(s, reg);
        }
        self.free_reg(s, reg, RegTemp::T0);
        label
    }

    pub(crate) fn emit_su(&mut self, op: Op, s: &Slot, imm: u16, wr: bool) -> usize {
        if self.failed() {
            return 0;
        }
        let reg = self.reg_near(s, RegTemp::T0);
        let label = self.emit(word_su(op, reg as u32, imm));
        if wr {
            self.move_back(s, reg);
        }
        self.free_reg(s, reg, RegTemp::T0);
        label
    }

    pub(crate) fn emit_ssi(
        &mut self,
        op: Op,
        s1: &Slot,
        s2: &Slot,
        imm: i8,
        wr: bool,
    ) -> usize {
        if self.failed() {
            return 0;
        }
        let r1 = self.reg_near(s1, RegTemp::T0);
        let r2 = self.reg_near(s2, RegTemp::T1);
        let label = self.emit(word_ssi(op, r1 as u32, r2 as u32, imm));
        if wr {
            self.move_back(s1, r1);
        }
        self.free_reg(s2, r2, RegTemp::T1);
        self.free_reg(s1, r1, RegTemp::T0);
        label
    }

    pub(crate) fn emit_ssu(
        &mut self,
        op: Op,
        s1: &Slot,
        s2: &Slot,
        imm: u8,
        wr: bool,
    ) -> usize {
        if self.failed() {
            return 0;
        }
        let r1 = self.reg_near(s1, RegTemp::T0);
        let r2 = self.reg_near(s2, RegTemp::T1);
        let label = self.emit(word_ssu(op, r1 as u32, r2 as u32, imm));
        if wr {
            self.move_back(s1, r1);
        }
        self.free_reg(s2, r2, RegTemp::T1);
        self.free_reg(s1, r1, RegTemp::T0);
        label
    }

    // ------------------------------------------------------------------
    // Jumps

    // Conditional jump to a known (backward) target.
    pub(crate) fn emit_sl(&mut self, op: Op, s: &Slot, target: usize) -> usize {
        if self.failed() {
            return 0;
        }
        let reg = self.reg_near(s, RegTemp::T0);
        let offset = target as i64 - self.buffer.len() as i64;
        if i16::try_from(offset).is_err() {
            self.cerror("jump too far".into());
            return 0;
        }
        let label = self.emit(word_sl(op, reg as u32, offset as i16));
        self.free_reg(s, reg, RegTemp::T0);
        label
    }

    // Conditional jump forward, emitted with a zero offset; patch when
    // the target is reached. Materialising the operand may emit first,
    // so the placeholder's own index is only known afterwards.
    pub(crate) fn emit_jump_cond(&mut self, op: Op, s: &Slot) -> usize {
        if self.failed() {
            return 0;
        }
        let reg = self.reg_near(s, RegTemp::T0);
        let label = self.emit(word_sl(op, reg as u32, 0));
        self.free_reg(s, reg, RegTemp::T0);
        label
    }

    pub(crate) fn patch_jump_here(&mut self, label: usize) {
        if self.failed() {
            return;
        }
        let offset = self.buffer.len() as i64 - label as i64;
        if i16::try_from(offset).is_err() {
            self.cerror("jump too far".into());
            return;
        }
        self.buffer[label] |= (offset as i16 as u16 as u32) << 16;
    }

    // Unconditional jump forward, patched later.
    pub(crate) fn emit_jump(&mut self) -> usize {
        self.emit(word(Op::Jump))
    }

    pub(crate) fn emit_jump_back(&mut self, target: usize) {
        if self.failed() {
            return;
        }
        let offset = target as i64 - self.buffer.len() as i64;
        if offset < -0x80_0000 || offset >= 0x80_0000 {
            self.cerror("jump too far".into());
            return;
        }
        self.emit(word_l(Op::Jump, offset as i32));
    }

    pub(crate) fn patch_jump_far_here(&mut self, label: usize) {
        if self.failed() {
            return;
        }
        let offset = self.buffer.len() as i64 - label as i64;
        if offset >= 0x80_0000 {
            self.cerror("jump too far".into());
            return;
        }
        self.buffer[label] |= ((offset as i32 as u32) & 0xFF_FFFF) << 8;
    }

    // Resolve the placeholder jumps `break` left behind: every word in
    // the loop's range whose opcode byte carries the tag bit becomes a
    // plain jump to the current position (the loop exit).
    pub(crate) fn rewrite_breaks(&mut self, start: usize) {
        if self.failed() {
            return;
        }
        let end = self.buffer.len();
        for i in start..end {
            if self.buffer[i] & 0xFF == Op::Jump as u32 | 0x80 {
                let offset = (end - i) as i64;
                if offset >= 0x80_0000 {
                    self.cerror("jump too far".into());
                    return;
                }
                self.buffer[i] = word_l(Op::Jump, offset as i32);
            }
        }
    }
}


fn plain_near_local(s: &Slot) -> bool {
    s.envindex < 0
        && s.index >= 0
        && s.index <= 0xFF
        && !s.flags.intersects(SlotFlag::Constant | SlotFlag::Ref)
}

fn small_integral(n: f64) -> bool {
    n.fract() == 0.0
        && n >= i16::MIN as f64
        && n <= i16::MAX as f64
        && !(n == 0.0 && n.is_sign_negative())
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::cslot;
    use crate::env::Environment;
    use crate::opcode::{field_a, field_b, field_b_wide, field_imm16, opcode};
    use crate::value::Value;
    use enumflags2::BitFlags;

    fn with_compiler(f: impl FnOnce(&mut Compiler)) -> Vec<u32> {
        let mut env = Environment::new();
        let mut c = Compiler::new(&mut env, "emit-test");
        c.push_scope(
            crate::compiler::ScopeFlag::Function | crate::compiler::ScopeFlag::Top,
            None,
        );
        f(&mut c);
        assert!(c.error.is_none(), "emit failed: {:?}", c.error);
        assert_eq!(c.buffer.len(), c.mapbuffer.len());
        c.buffer.clone()
    }

    #[test]
    fn test_constant_materialisation() {
        let words = with_compiler(|c| {
            let s = cslot(&Value::Integer(9));
            let reg = c.reg_near(&s, RegTemp::T0);
            assert_eq!(reg, 0);
        });
        assert_eq!(opcode(words[0]), Some(Op::LoadInteger));
        assert_eq!(field_imm16(words[0]), 9);
    }

    #[test]
    fn test_ref_slot_reads_through_the_cell() {
        let words = with_compiler(|c| {
            let cell = Value::array(vec![Value::Nil]);
            let mut s = cslot(&cell);
            s.flags |= SlotFlag::Ref;
            let reg = c.reg_near(&s, RegTemp::T0);
            assert_eq!(reg, 0);
        });
        assert_eq!(opcode(words[0]), Some(Op::LoadConstant));
        assert_eq!(opcode(words[1]), Some(Op::GetIndex));
        assert_eq!(field_a(words[1]), 0);
        assert_eq!(field_b(words[1]), 0);
    }

    #[test]
    fn test_ref_slot_writes_through_the_cell() {
        let words = with_compiler(|c| {
            let cell = Value::array(vec![Value::Nil]);
            let mut dest = cslot(&cell);
            dest.flags |= SlotFlag::Ref;
            let src = c.farslot();
            c.move_back(&dest, src.index);
        });
        assert_eq!(opcode(words[0]), Some(Op::LoadConstant));
        assert_eq!(opcode(words[1]), Some(Op::PutIndex));
    }

    #[test]
    fn test_upvalue_moves() {
        let words = with_compiler(|c| {
            let upvalue = Slot {
                index: 2,
                envindex: 0,
                flags: BitFlags::empty(),
                types: crate::value::TypeSet::all(),
                constant: None,
            };
            let reg = c.reg_near(&upvalue, RegTemp::T0);
            assert_eq!(reg, 0);
            c.move_back(&upvalue, reg);
        });
        assert_eq!(opcode(words[0]), Some(Op::LoadUpvalue));
        assert_eq!(opcode(words[1]), Some(Op::SetUpvalue));
        // dest, envindex, index
        assert_eq!(field_a(words[0]), 0);
        assert_eq!(field_b(words[0]), 0);
        assert_eq!(words[0] >> 24, 2);
    }

    #[test]
    fn test_local_moves_elide_self_copies() {
        let words = with_compiler(|c| {
            let a = c.farslot();
            c.move_near(a.index, &a.clone());
            let b = c.farslot();
            c.copy(&b, &a);
        });
        // Only the real copy emits.
        assert_eq!(words.len(), 1);
        assert_eq!(opcode(words[0]), Some(Op::MoveNear));
        assert_eq!(field_a(words[0]), 1);
        assert_eq!(field_b_wide(words[0]), 0);
    }

    #[test]
    fn test_forward_jump_patching() {
        let words = with_compiler(|c| {
            let cond = c.farslot();
            let label = c.emit_jump_cond(Op::JumpIfNot, &cond);
            c.emit_s(Op::Return, &cond, false);
            c.patch_jump_here(label);
            c.emit(word(Op::ReturnNil));
        });
        assert_eq!(field_imm16(words[0]), 2);
    }

    #[test]
    fn test_backward_jump_offset() {
        let words = with_compiler(|c| {
            c.emit(word(Op::ReturnNil));
            c.emit_jump_back(0);
        });
        assert_eq!(opcode(words[1]), Some(Op::Jump));
        assert_eq!(crate::opcode::field_imm24(words[1]), -1);
    }

    #[test]
    fn test_emitters_release_their_temps() {
        with_compiler(|c| {
            let a = cslot(&Value::Integer(1));
            let b = cslot(&Value::Integer(2));
            let target = c.farslot();
            c.emit_sss(Op::Add, &target, &a, &b, true);
            // Temps are back; the next two allocations land right
            // after the target register.
            assert_eq!(c.scope_mut().ra.alloc_1(), 1);
            assert_eq!(c.scope_mut().ra.alloc_1(), 2);
        });
    }
}
