// The optimizer table: builtins the compiler can open-code.
//
// A call whose head is a constant function carrying a tag is looked up
// here; when the entry's check passes, the handler emits a primitive
// instruction sequence instead of an argument push and a call. Because
// recognition is by tag, not by name, an aliased or rebound builtin
// still collapses as long as its value is known at compile time.
//
// Handlers fold variadic applications left to right into the target
// register, pick immediate forms when an operand is a small constant,
// and use the slot type masks to choose numeric comparison forms.

use std::convert::TryFrom;

use enumflags2::BitFlags;

use crate::compiler::{cslot, CompileOpts, Compiler, Slot};
use crate::funcdef::FunTag;
use crate::opcode::Op;
use crate::value::{TypeTag, Value};


type CheckFn = fn(&CompileOpts, &[Slot]) -> bool;
type EmitFn = for<'a, 'e> fn(&'a mut Compiler<'e>, &CompileOpts, &[Slot]) -> Slot;

pub(crate) struct Inline {
    pub tag: FunTag,
    pub check: CheckFn,
    pub emit: EmitFn,
}

pub(crate) fn lookup(tag: FunTag) -> Option<&'static Inline> {
    INLINES.iter().find(|entry| entry.tag == tag)
}

static INLINES: &[Inline] = &[
    Inline { tag: FunTag::Add, check: always, emit: do_add },
    Inline { tag: FunTag::Subtract, check: always, emit: do_subtract },
    Inline { tag: FunTag::Multiply, check: always, emit: do_multiply },
    Inline { tag: FunTag::Divide, check: always, emit: do_divide },
    Inline { tag: FunTag::Band, check: always, emit: do_band },
    Inline { tag: FunTag::Bor, check: always, emit: do_bor },
    Inline { tag: FunTag::Bxor, check: always, emit: do_bxor },
    Inline { tag: FunTag::Bnot, check: arity1, emit: do_bnot },
    Inline { tag: FunTag::ShiftLeft, check: arity2, emit: do_shift_left },
    Inline { tag: FunTag::ShiftRight, check: arity2, emit: do_shift_right },
    Inline { tag: FunTag::ShiftRightUnsigned, check: arity2, emit: do_shift_right_unsigned },
    Inline { tag: FunTag::Eq, check: always, emit: do_equals },
    Inline { tag: FunTag::Lt, check: always, emit: do_less_than },
    Inline { tag: FunTag::Lte, check: always, emit: do_less_than_equal },
    Inline { tag: FunTag::Gt, check: always, emit: do_greater_than },
    Inline { tag: FunTag::Gte, check: always, emit: do_greater_than_equal },
    Inline { tag: FunTag::Get, check: arity2, emit: do_get },
    Inline { tag: FunTag::In, check: arity2, emit: do_in },
    Inline { tag: FunTag::Put, check: arity3, emit: do_put },
    Inline { tag: FunTag::Length, check: arity1, emit: do_length },
    Inline { tag: FunTag::Yield, check: arity_at_most_1, emit: do_yield },
    Inline { tag: FunTag::Debug, check: arity_at_most_1, emit: do_debug },
    Inline { tag: FunTag::Resume, check: arity_1_or_2, emit: do_resume },
    Inline { tag: FunTag::Error, check: arity1, emit: do_error },
];


fn always(_opts: &CompileOpts, _args: &[Slot]) -> bool {
    true
}

fn arity1(_opts: &CompileOpts, args: &[Slot]) -> bool {
    args.len() == 1
}

fn arity2(_opts: &CompileOpts, args: &[Slot]) -> bool {
    args.len() == 2
}

fn arity3(_opts: &CompileOpts, args: &[Slot]) -> bool {
    args.len() == 3
}

fn arity_at_most_1(_opts: &CompileOpts, args: &[Slot]) -> bool {
    args.len() <= 1
}

fn arity_1_or_2(_opts: &CompileOpts, args: &[Slot]) -> bool {
    !args.is_empty() && args.len() <= 2
}


// The compile-time literal behind a slot, if there is one.
fn constant_of(s: &Slot) -> Option<&Value> {
    if s.is_constant() {
        s.constant.as_ref()
    } else {
        None
    }
}

fn const_integer_i8(s: &Slot) -> Option<i8> {
    match constant_of(s) {
        Some(Value::Integer(i)) => i8::try_from(*i).ok(),
        _ => None,
    }
}

fn const_number_i8(s: &Slot) -> Option<i8> {
    match constant_of(s) {
        Some(Value::Number(n))
            if n.fract() == 0.0 && *n >= i8::MIN as f64 && *n <= i8::MAX as f64 =>
        {
            Some(*n as i8)
        }
        _ => None,
    }
}

// Can the slot's value only ever be numeric?
fn numeric_only(s: &Slot) -> bool {
    (TypeTag::Number | TypeTag::Integer).contains(s.types)
}

fn numeric_result(mut slot: Slot) -> Slot {
    slot.types = TypeTag::Number | TypeTag::Integer;
    slot
}

fn boolean_result(mut slot: Slot) -> Slot {
    slot.types = BitFlags::from_flag(TypeTag::Boolean);
    slot
}


// ----------------------------------------------------------------------
// Arithmetic

fn do_add(c: &mut Compiler, opts: &CompileOpts, args: &[Slot]) -> Slot {
    opreduce(c, opts, args, Op::Add, Value::Integer(0))
}

fn do_subtract(c: &mut Compiler, opts: &CompileOpts, args: &[Slot]) -> Slot {
    opreduce(c, opts, args, Op::Subtract, Value::Integer(0))
}

fn do_multiply(c: &mut Compiler, opts: &CompileOpts, args: &[Slot]) -> Slot {
    opreduce(c, opts, args, Op::Multiply, Value::Integer(1))
}

fn do_divide(c: &mut Compiler, opts: &CompileOpts, args: &[Slot]) -> Slot {
    opreduce(c, opts, args, Op::Divide, Value::Integer(1))
}

fn do_band(c: &mut Compiler, opts: &CompileOpts, args: &[Slot]) -> Slot {
    opreduce(c, opts, args, Op::Band, Value::Integer(-1))
}

fn do_bor(c: &mut Compiler, opts: &CompileOpts, args: &[Slot]) -> Slot {
    opreduce(c, opts, args, Op::Bor, Value::Integer(0))
}

fn do_bxor(c: &mut Compiler, opts: &CompileOpts, args: &[Slot]) -> Slot {
    opreduce(c, opts, args, Op::Bxor, Value::Integer(0))
}

fn do_bnot(c: &mut Compiler, opts: &CompileOpts, args: &[Slot]) -> Slot {
    let target = c.gettarget(opts);
    c.emit_ss(Op::Bnot, &target, &args[0], true);
    numeric_result(target)
}

fn do_shift_left(c: &mut Compiler, opts: &CompileOpts, args: &[Slot]) -> Slot {
    binop(c, opts, args, Op::ShiftLeft)
}

fn do_shift_right(c: &mut Compiler, opts: &CompileOpts, args: &[Slot]) -> Slot {
    binop(c, opts, args, Op::ShiftRight)
}

fn do_shift_right_unsigned(c: &mut Compiler, opts: &CompileOpts, args: &[Slot]) -> Slot {
    binop(c, opts, args, Op::ShiftRightUnsigned)
}

fn binop(c: &mut Compiler, opts: &CompileOpts, args: &[Slot], op: Op) -> Slot {
    let target = c.gettarget(opts);
    c.emit_sss(op, &target, &args[0], &args[1], true);
    numeric_result(target)
}

// Left-fold a variadic application into the target register. Zero
// arguments collapse to the identity; one argument applies the
// operator against the identity (negation, reciprocal).
fn opreduce(
    c: &mut Compiler,
    opts: &CompileOpts,
    args: &[Slot],
    op: Op,
    identity: Value,
) -> Slot {
    match args.len() {
        0 => cslot(&identity),
        1 => {
            let target = c.gettarget(opts);
            let id = cslot(&identity);
            c.emit_sss(op, &target, &id, &args[0], true);
            numeric_result(target)
        }
        _ => {
            let target = c.gettarget(opts);
            arith_step(c, op, &target, &args[0], &args[1]);
            for arg in &args[2..] {
                arith_step(c, op, &target, &target, arg);
            }
            numeric_result(target)
        }
    }
}

fn arith_step(c: &mut Compiler, op: Op, dest: &Slot, lhs: &Slot, rhs: &Slot) {
    if op == Op::Add {
        if let Some(imm) = const_integer_i8(rhs) {
            c.emit_ssi(Op::AddImmediate, dest, lhs, imm, true);
            return;
        }
        if let Some(imm) = const_integer_i8(lhs) {
            c.emit_ssi(Op::AddImmediate, dest, rhs, imm, true);
            return;
        }
    }
    c.emit_sss(op, dest, lhs, rhs, true);
}


// ----------------------------------------------------------------------
// Comparisons

#[derive(Clone, Copy, PartialEq)]
enum Compare {
    Equals,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
}

fn do_equals(c: &mut Compiler, opts: &CompileOpts, args: &[Slot]) -> Slot {
    compare_reduce(c, opts, args, Compare::Equals)
}

fn do_less_than(c: &mut Compiler, opts: &CompileOpts, args: &[Slot]) -> Slot {
    compare_reduce(c, opts, args, Compare::Less)
}

fn do_less_than_equal(c: &mut Compiler, opts: &CompileOpts, args: &[Slot]) -> Slot {
    compare_reduce(c, opts, args, Compare::LessEqual)
}

fn do_greater_than(c: &mut Compiler, opts: &CompileOpts, args: &[Slot]) -> Slot {
    compare_reduce(c, opts, args, Compare::Greater)
}

fn do_greater_than_equal(c: &mut Compiler, opts: &CompileOpts, args: &[Slot]) -> Slot {
    compare_reduce(c, opts, args, Compare::GreaterEqual)
}

// Pairwise comparison over the argument list, short-circuiting through
// the target register: once a pair fails, the false lands in the
// target and the rest is skipped.
fn compare_reduce(
    c: &mut Compiler,
    opts: &CompileOpts,
    args: &[Slot],
    kind: Compare,
) -> Slot {
    if args.len() < 2 {
        return cslot(&Value::Boolean(true));
    }
    let target = c.gettarget(opts);
    let mut pending = Vec::new();
    for i in 0..args.len() - 1 {
        compare_step(c, kind, &target, &args[i], &args[i + 1]);
        if i + 2 < args.len() {
            pending.push(c.emit_jump_cond(Op::JumpIfNot, &target));
        }
    }
    for label in pending {
        c.patch_jump_here(label);
    }
    boolean_result(target)
}

fn compare_step(c: &mut Compiler, kind: Compare, dest: &Slot, lhs: &Slot, rhs: &Slot) {
    match kind {
        Compare::Equals => {
            // Immediate forms keyed on the constant's type.
            for (value, other) in [(rhs, lhs), (lhs, rhs)] {
                if let Some(imm) = const_integer_i8(value) {
                    c.emit_ssi(Op::EqualsInteger, dest, other, imm, true);
                    return;
                }
                if let Some(imm) = const_number_i8(value) {
                    c.emit_ssi(Op::EqualsImmediate, dest, other, imm, true);
                    return;
                }
            }
            if numeric_only(lhs) && numeric_only(rhs) {
                c.emit_sss(Op::NumericEqual, dest, lhs, rhs, true);
            } else {
                c.emit_sss(Op::Equals, dest, lhs, rhs, true);
            }
        }
        Compare::Less => {
            if let Some(imm) = const_integer_i8(rhs) {
                c.emit_ssi(Op::LessThanImmediate, dest, lhs, imm, true);
                return;
            }
            c.emit_sss(Op::NumericLessThan, dest, lhs, rhs, true);
        }
        Compare::LessEqual => {
            c.emit_sss(Op::NumericLessThanEqual, dest, lhs, rhs, true);
        }
        Compare::Greater => {
            c.emit_sss(Op::NumericGreaterThan, dest, lhs, rhs, true);
        }
        Compare::GreaterEqual => {
            c.emit_sss(Op::NumericGreaterThanEqual, dest, lhs, rhs, true);
        }
    }
}


// ----------------------------------------------------------------------
// Data access and the rest

fn do_get(c: &mut Compiler, opts: &CompileOpts, args: &[Slot]) -> Slot {
    let target = c.gettarget(opts);
    if let Some(Value::Integer(i)) = constant_of(&args[1]) {
        if (0..=0xFF).contains(i) {
            c.emit_ssu(Op::GetIndex, &target, &args[0], *i as u8, true);
            return target;
        }
    }
    c.emit_sss(Op::Get, &target, &args[0], &args[1], true);
    target
}

fn do_in(c: &mut Compiler, opts: &CompileOpts, args: &[Slot]) -> Slot {
    let target = c.gettarget(opts);
    c.emit_sss(Op::In, &target, &args[0], &args[1], true);
    target
}

fn do_put(c: &mut Compiler, opts: &CompileOpts, args: &[Slot]) -> Slot {
    c.emit_sss(Op::Put, &args[0], &args[1], &args[2], false);
    if opts.is_drop() {
        Slot::sentinel()
    } else {
        let target = c.gettarget(opts);
        c.copy(&target, &args[2]);
        target
    }
}

fn do_length(c: &mut Compiler, opts: &CompileOpts, args: &[Slot]) -> Slot {
    let target = c.gettarget(opts);
    c.emit_ss(Op::Length, &target, &args[0], true);
    numeric_result(target)
}

fn do_yield(c: &mut Compiler, opts: &CompileOpts, args: &[Slot]) -> Slot {
    signal(c, opts, args, 3)
}

fn do_debug(c: &mut Compiler, opts: &CompileOpts, args: &[Slot]) -> Slot {
    signal(c, opts, args, 2)
}

fn signal(c: &mut Compiler, opts: &CompileOpts, args: &[Slot], which: u8) -> Slot {
    let target = c.gettarget(opts);
    let payload = args.first().cloned().unwrap_or_else(|| cslot(&Value::Nil));
    c.emit_ssu(Op::Signal, &target, &payload, which, true);
    target
}

fn do_resume(c: &mut Compiler, opts: &CompileOpts, args: &[Slot]) -> Slot {
    let target = c.gettarget(opts);
    let value = args.get(1).cloned().unwrap_or_else(|| cslot(&Value::Nil));
    c.emit_sss(Op::Resume, &target, &args[0], &value, true);
    target
}

fn do_error(c: &mut Compiler, _opts: &CompileOpts, args: &[Slot]) -> Slot {
    c.emit_s(Op::Error, &args[0], false);
    Slot::sentinel()
}
