// The special forms: everything a tuple can mean besides a call.
//
// Each handler gets the compiler, the result-position options, and the
// form's arguments (head already stripped). Handlers return the slot
// holding the form's value; tail-position returns are emitted by the
// dispatch wrapper, so a handler only deals with returns it creates
// itself (function bodies, break-as-return).
//
// Dispatch is a binary search over a name-sorted table, built once.

use std::cell::RefCell;
use std::rc::Rc;

use enumflags2::BitFlags;
use tracing::debug;

use crate::compiler::{
    cslot, CompileOpts, Compiler, ScopeFlag, Slot, SlotFlag,
};
use crate::env::EnvEntry;
use crate::funcdef::{DefFlag, FunTag, ARITY_UNBOUNDED};
use crate::opcode::{word, Op};
use crate::structs::Struct;
use crate::value::Value;


pub(crate) type SpecialFn =
    for<'a, 'e> fn(&'a mut Compiler<'e>, &CompileOpts, &[Value]) -> Slot;

lazy_static! {
    static ref SPECIALS: Vec<(&'static str, SpecialFn)> = {
        let mut table: Vec<(&'static str, SpecialFn)> = vec![
            ("break", special_break),
            ("def", special_def),
            ("do", special_do),
            ("fn", special_fn),
            ("if", special_if),
            ("quasiquote", special_quasiquote),
            ("quote", special_quote),
            ("set", special_set),
            ("splice", special_splice),
            ("unquote", special_unquote),
            ("upscope", special_upscope),
            ("var", special_var),
            ("while", special_while),
        ];
        table.sort_by_key(|entry| entry.0);
        table
    };
}

pub(crate) fn lookup_special(name: &str) -> Option<SpecialFn> {
    SPECIALS
        .binary_search_by(|entry| entry.0.cmp(name))
        .ok()
        .map(|i| SPECIALS[i].1)
}


// ----------------------------------------------------------------------
// quote family

fn special_quote(c: &mut Compiler, _opts: &CompileOpts, args: &[Value]) -> Slot {
    if args.len() != 1 {
        return c.cerror("expected 1 argument to quote".into());
    }
    cslot(&args[0])
}

fn special_splice(c: &mut Compiler, _opts: &CompileOpts, args: &[Value]) -> Slot {
    if args.len() != 1 {
        return c.cerror("expected 1 argument to splice".into());
    }
    let sub = CompileOpts::new();
    let mut slot = c.compile_value(&sub, &args[0]);
    slot.flags |= SlotFlag::Spliced;
    slot
}

fn special_unquote(c: &mut Compiler, _opts: &CompileOpts, _args: &[Value]) -> Slot {
    c.cerror("unquote outside of quasiquote".into())
}

const QUASIQUOTE_DEPTH_MAX: u32 = 64;

fn special_quasiquote(c: &mut Compiler, _opts: &CompileOpts, args: &[Value]) -> Slot {
    if args.len() != 1 {
        return c.cerror("expected 1 argument to quasiquote".into());
    }
    quasiquote(c, &args[0], QUASIQUOTE_DEPTH_MAX, 0)
}

// Walk the quoted template. Collections rebuild themselves from
// recursively produced slots (collapsing back to constants when
// nothing inside needed code); an unquote at level zero splices real
// compilation back in.
fn quasiquote(c: &mut Compiler, x: &Value, depth: u32, level: u32) -> Slot {
    if depth == 0 {
        return c.cerror("quasiquote too deeply nested".into());
    }
    match x {
        Value::Tuple(t) => {
            let mut level = level;
            if !t.bracketed {
                if let Some(Value::Symbol(head)) = t.elements.first() {
                    if &**head == "unquote" {
                        if t.elements.len() != 2 {
                            return c.cerror("expected 1 argument to unquote".into());
                        }
                        if level == 0 {
                            let sub = CompileOpts::new();
                            return c.compile_value(&sub, &t.elements[1]);
                        }
                        level -= 1;
                    } else if &**head == "quasiquote" {
                        level += 1;
                    }
                }
            }
            let slots = quasiquote_seq(c, &t.elements, depth, level);
            let op = if t.bracketed {
                Op::MakeBracketTuple
            } else {
                Op::MakeTuple
            };
            c.compile_constructor(&CompileOpts::new(), slots, op)
        }
        Value::Array(elements) => {
            let elements = elements.borrow().clone();
            let slots = quasiquote_seq(c, &elements, depth, level);
            c.compile_constructor(&CompileOpts::new(), slots, Op::MakeArray)
        }
        Value::Struct(s) => {
            let pairs: Vec<(Value, Value)> =
                s.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
            let slots = quasiquote_pairs(c, &pairs, depth, level);
            c.compile_constructor(&CompileOpts::new(), slots, Op::MakeStruct)
        }
        Value::Table(t) => {
            let pairs = t.borrow().entries.clone();
            let slots = quasiquote_pairs(c, &pairs, depth, level);
            c.compile_constructor(&CompileOpts::new(), slots, Op::MakeTable)
        }
        _ => cslot(x),
    }
}

fn quasiquote_seq(c: &mut Compiler, elements: &[Value], depth: u32, level: u32) -> Vec<Slot> {
    elements
        .iter()
        .map(|e| quasiquote(c, e, depth - 1, level))
        .collect()
}

fn quasiquote_pairs(
    c: &mut Compiler,
    pairs: &[(Value, Value)],
    depth: u32,
    level: u32,
) -> Vec<Slot> {
    let mut slots = Vec::new();
    for (k, v) in pairs {
        slots.push(quasiquote(c, k, depth - 1, level));
        slots.push(quasiquote(c, v, depth - 1, level));
    }
    slots
}


// ----------------------------------------------------------------------
// do / upscope

fn special_do(c: &mut Compiler, opts: &CompileOpts, args: &[Value]) -> Slot {
    c.push_scope(BitFlags::empty(), Some("do"));
    let result = compile_body(c, opts, args);
    c.pop_scope_keepslot(&result);
    result
}

// Same as do, without the scope: bindings leak into the caller.
fn special_upscope(c: &mut Compiler, opts: &CompileOpts, args: &[Value]) -> Slot {
    compile_body(c, opts, args)
}

fn compile_body(c: &mut Compiler, opts: &CompileOpts, forms: &[Value]) -> Slot {
    if forms.is_empty() {
        return cslot(&Value::Nil);
    }
    for form in &forms[..forms.len() - 1] {
        let sub = CompileOpts::dropped();
        let slot = c.compile_value(&sub, form);
        c.freeslot(&slot);
    }
    let last = CompileOpts {
        flags: opts.flags,
        hint: opts.hint.clone(),
    };
    c.compile_value(&last, &forms[forms.len() - 1])
}


// ----------------------------------------------------------------------
// def / var

#[derive(Clone, Copy, PartialEq)]
enum BindKind {
    Def,
    Var,
}

fn special_def(c: &mut Compiler, _opts: &CompileOpts, args: &[Value]) -> Slot {
    bind_form(c, args, BindKind::Def)
}

fn special_var(c: &mut Compiler, _opts: &CompileOpts, args: &[Value]) -> Slot {
    bind_form(c, args, BindKind::Var)
}

fn bind_form(c: &mut Compiler, args: &[Value], kind: BindKind) -> Slot {
    let (pattern, meta, rvalue) = match bind_head(c, args) {
        Some(parts) => parts,
        None => return Slot::sentinel(),
    };
    let sub = CompileOpts::new();
    let rhs = c.compile_value(&sub, &rvalue);
    destructure(c, &pattern, &rhs, kind, &meta)
}

// NAME ATTRS... VALUE: everything between the pattern and the value is
// binding metadata. Keywords become true-valued entries, strings
// become the docstring, structs merge wholesale.
fn bind_head(
    c: &mut Compiler,
    args: &[Value],
) -> Option<(Value, Option<Rc<Struct>>, Value)> {
    if args.len() < 2 {
        c.cerror("expected at least 2 arguments".into());
        return None;
    }
    let pattern = args[0].clone();
    let rvalue = args[args.len() - 1].clone();
    let mut meta: Vec<(Value, Value)> = Vec::new();
    for attr in &args[1..args.len() - 1] {
        match attr {
            Value::Keyword(_) => meta.push((attr.clone(), Value::Boolean(true))),
            Value::Str(_) => meta.push((Value::keyword("doc"), attr.clone())),
            Value::Struct(s) => {
                for (k, v) in s.iter() {
                    meta.push((k.clone(), v.clone()));
                }
            }
            _ => {
                c.cerror("could not add binding metadata".into());
                return None;
            }
        }
    }
    let meta = if meta.is_empty() {
        None
    } else {
        Some(Struct::of(meta))
    };
    Some((pattern, meta, rvalue))
}

// Pattern-match a value slot against a binding pattern, binding leaves
// as we go. Returns the slot standing for the whole right-hand side.
fn destructure(
    c: &mut Compiler,
    pattern: &Value,
    rhs: &Slot,
    kind: BindKind,
    meta: &Option<Rc<Struct>>,
) -> Slot {
    match pattern {
        Value::Symbol(name) => {
            let name = name.clone();
            bind_leaf(c, &name, rhs, kind, meta)
        }
        Value::Tuple(t) => {
            destructure_indexed(c, &t.elements.clone(), rhs, kind, meta);
            rhs.clone()
        }
        Value::Array(elements) => {
            let elements = elements.borrow().clone();
            destructure_indexed(c, &elements, rhs, kind, meta);
            rhs.clone()
        }
        Value::Struct(s) => {
            let pairs: Vec<(Value, Value)> =
                s.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
            destructure_keyed(c, &pairs, rhs, kind, meta);
            rhs.clone()
        }
        Value::Table(t) => {
            let pairs = t.borrow().entries.clone();
            destructure_keyed(c, &pairs, rhs, kind, meta);
            rhs.clone()
        }
        _ => c.cerror("unexpected type in destructuring pattern".into()),
    }
}

fn destructure_indexed(
    c: &mut Compiler,
    elements: &[Value],
    rhs: &Slot,
    kind: BindKind,
    meta: &Option<Rc<Struct>>,
) {
    let mut i = 0;
    while i < elements.len() {
        if let Value::Symbol(s) = &elements[i] {
            if &**s == "&" {
                if i + 2 != elements.len() {
                    c.cerror("expected a single binding after &".into());
                    return;
                }
                let rest_name = match &elements[i + 1] {
                    Value::Symbol(name) => name.clone(),
                    _ => {
                        c.cerror("expected symbol following & in pattern".into());
                        return;
                    }
                };
                let rest = gather_rest(c, rhs, i as i32);
                bind_leaf(c, &rest_name, &rest, kind, meta);
                return;
            }
        }
        let sub = c.farslot();
        if i <= 0xFF {
            c.emit_ssu(Op::GetIndex, &sub, rhs, i as u8, true);
        } else {
            let key = cslot(&Value::Integer(i as i32));
            c.emit_sss(Op::Get, &sub, rhs, &key, true);
        }
        destructure(c, &elements[i], &sub, kind, meta);
        c.freeslot(&sub);
        i += 1;
    }
}

fn destructure_keyed(
    c: &mut Compiler,
    pairs: &[(Value, Value)],
    rhs: &Slot,
    kind: BindKind,
    meta: &Option<Rc<Struct>>,
) {
    for (key, subpattern) in pairs {
        let key = cslot(key);
        let sub = c.farslot();
        c.emit_sss(Op::Get, &sub, rhs, &key, true);
        destructure(c, subpattern, &sub, kind, meta);
        c.freeslot(&sub);
    }
}

// Everything from index `start` onward, gathered into a fresh tuple.
// Test-at-the-bottom loop:
//
//   len = length rhs; i = start; goto check
//   loop: push rhs[i]; i += 1
//   check: if i < len goto loop
//   make-tuple
fn gather_rest(c: &mut Compiler, rhs: &Slot, start: i32) -> Slot {
    let len = c.farslot();
    c.emit_ss(Op::Length, &len, rhs, true);
    let idx = c.farslot();
    c.emit_si(Op::LoadInteger, &idx, start as i16, true);
    let entry = c.emit_jump();
    let loop_start = c.buffer.len();
    let element = c.farslot();
    c.emit_sss(Op::Get, &element, rhs, &idx, true);
    c.emit_s(Op::Push, &element, false);
    c.emit_ssi(Op::AddImmediate, &idx, &idx, 1, true);
    c.patch_jump_far_here(entry);
    let more = c.farslot();
    c.emit_sss(Op::NumericLessThan, &more, &idx, &len, true);
    c.emit_sl(Op::JumpIf, &more, loop_start);
    let rest = c.farslot();
    c.emit_s(Op::MakeTuple, &rest, true);
    c.freeslot(&more);
    c.freeslot(&element);
    c.freeslot(&idx);
    c.freeslot(&len);
    rest
}

fn bind_leaf(
    c: &mut Compiler,
    name: &Rc<str>,
    value: &Slot,
    kind: BindKind,
    meta: &Option<Rc<Struct>>,
) -> Slot {
    let top = c.scope().flags.contains(ScopeFlag::Top);
    match (kind, top) {
        (BindKind::Def, false) => c.namelocal(name, BitFlags::empty(), value),
        (BindKind::Var, false) => {
            // Mutable bindings live behind a one-element cell from the
            // start, so closures can share them without capture
            // plumbing; reads and writes go through the cell.
            let cell = Value::Array(Rc::new(RefCell::new(vec![Value::Nil])));
            let mut refslot = cslot(&cell);
            refslot.flags |= SlotFlag::Ref | SlotFlag::Mutable;
            c.copy(&refslot, value);
            c.nameslot(name, refslot.clone());
            refslot
        }
        (BindKind::Def, true) if value.is_constant() => {
            // A constant top-level def binds its value at compile
            // time; later forms resolve it as a constant, which keeps
            // builtin tags visible through aliases.
            let entry = EnvEntry {
                value: value.constant.clone(),
                ref_cell: None,
                mutable: false,
                meta: meta.clone(),
            };
            c.env.define(name, entry);
            value.clone()
        }
        (kind, true) => {
            // Top level: install an environment entry whose cell the
            // emitted code stores into.
            let mutable = kind == BindKind::Var;
            let entry = EnvEntry::of_ref(mutable, meta.clone());
            let cell = entry.ref_cell.clone().expect("fresh entry without cell");
            c.env.define(name, entry);
            let mut refslot = cslot(&cell);
            refslot.flags |= SlotFlag::Ref | SlotFlag::Named;
            if mutable {
                refslot.flags |= SlotFlag::Mutable;
            }
            c.copy(&refslot, value);
            if mutable {
                refslot
            } else {
                value.clone()
            }
        }
    }
}


// ----------------------------------------------------------------------
// set

fn special_set(c: &mut Compiler, _opts: &CompileOpts, args: &[Value]) -> Slot {
    if args.len() != 2 {
        return c.cerror("expected 2 arguments to set".into());
    }
    match &args[0] {
        Value::Symbol(name) => {
            let name = name.clone();
            let dest = c.resolve(&name);
            if !dest.flags.contains(SlotFlag::Mutable) {
                return c.cerror("cannot set constant".into());
            }
            let sub = CompileOpts::new();
            let result = c.compile_value(&sub, &args[1]);
            c.copy(&dest, &result);
            c.freeslot(&result);
            dest
        }
        Value::Tuple(t) if !t.bracketed && t.elements.len() == 2 => {
            // (set (ds key) value) writes through PUT.
            let sub = CompileOpts::new();
            let elements = t.elements.clone();
            let ds = c.compile_value(&sub, &elements[0]);
            let key = c.compile_value(&sub, &elements[1]);
            let value = c.compile_value(&sub, &args[1]);
            c.emit_sss(Op::Put, &ds, &key, &value, false);
            c.freeslot(&key);
            c.freeslot(&ds);
            value
        }
        _ => c.cerror("expected symbol or (ds key) target for set".into()),
    }
}


// ----------------------------------------------------------------------
// if

// (= nil X) and (not= nil X) conditions get dedicated nil-test jumps.
// Recognition is by the head's builtin tag, so aliased names work too.
fn match_nil_compare(c: &Compiler, form: &Value) -> Option<(Value, bool)> {
    let t = form.as_tuple()?;
    if t.bracketed || t.elements.len() != 3 {
        return None;
    }
    let head = match &t.elements[0] {
        Value::Symbol(s) => s,
        _ => return None,
    };
    if lookup_special(head).is_some() {
        return None;
    }
    let tag = match c.peek_constant(head)? {
        Value::Function(def) => def.tag,
        Value::CFunction(cfun) => cfun.tag,
        _ => None,
    }?;
    let negated = match tag {
        FunTag::Eq => false,
        FunTag::Neq => true,
        _ => return None,
    };
    let (a, b) = (&t.elements[1], &t.elements[2]);
    let operand = if matches!(a, Value::Nil) {
        b.clone()
    } else if matches!(b, Value::Nil) {
        a.clone()
    } else {
        return None;
    };
    Some((operand, negated))
}

// Compile a condition form; the returned opcode jumps when the
// condition fails.
fn compile_condition(c: &mut Compiler, form: &Value) -> (Slot, Op) {
    match match_nil_compare(c, form) {
        Some((operand, negated)) => {
            let sub = CompileOpts::new();
            let slot = c.compile_value(&sub, &operand);
            let op = if negated {
                Op::JumpIfNil
            } else {
                Op::JumpIfNotNil
            };
            (slot, op)
        }
        None => {
            let sub = CompileOpts::new();
            let slot = c.compile_value(&sub, form);
            (slot, Op::JumpIfNot)
        }
    }
}

// A constant condition's truth value, accounting for the nil tests.
fn constant_truth(slot: &Slot, exit_op: Op) -> Option<bool> {
    if !slot.is_constant() {
        return None;
    }
    let value = slot.constant.as_ref()?;
    Some(match exit_op {
        Op::JumpIfNotNil => matches!(value, Value::Nil),
        Op::JumpIfNil => !matches!(value, Value::Nil),
        _ => value.truthy(),
    })
}

fn branch_opts(opts: &CompileOpts, target: &Slot) -> CompileOpts {
    if opts.is_tail() {
        CompileOpts::tail()
    } else if opts.is_drop() {
        CompileOpts::dropped()
    } else {
        CompileOpts::with_hint(target.clone())
    }
}

fn special_if(c: &mut Compiler, opts: &CompileOpts, args: &[Value]) -> Slot {
    if args.len() < 2 || args.len() > 3 {
        return c.cerror("expected 2 or 3 arguments to if".into());
    }
    let then_form = args[1].clone();
    let else_form = args.get(2).cloned().unwrap_or(Value::Nil);

    let (cond, exit_op) = compile_condition(c, &args[0]);

    // A constant condition is one branch and no jumps at all.
    if let Some(truth) = constant_truth(&cond, exit_op) {
        let branch = if truth { then_form } else { else_form };
        c.push_scope(BitFlags::empty(), Some("if"));
        let sub = CompileOpts {
            flags: opts.flags,
            hint: opts.hint.clone(),
        };
        let slot = c.compile_value(&sub, &branch);
        c.pop_scope_keepslot(&slot);
        return slot;
    }

    let tail = opts.is_tail();
    let drop = opts.is_drop();
    let target = if tail || drop {
        Slot::sentinel()
    } else {
        c.gettarget(opts)
    };

    let to_else = c.emit_jump_cond(exit_op, &cond);
    c.freeslot(&cond);

    c.push_scope(BitFlags::empty(), Some("if-true"));
    let sub = branch_opts(opts, &target);
    let then_slot = c.compile_value(&sub, &then_form);
    if !tail && !drop {
        c.copy(&target, &then_slot);
    }
    c.freeslot(&then_slot);
    c.pop_scope();

    let over_else = if tail { None } else { Some(c.emit_jump()) };
    c.patch_jump_here(to_else);

    c.push_scope(BitFlags::empty(), Some("if-false"));
    let sub = branch_opts(opts, &target);
    let else_slot = c.compile_value(&sub, &else_form);
    if !tail && !drop {
        c.copy(&target, &else_slot);
    }
    c.freeslot(&else_slot);
    c.pop_scope();

    if let Some(label) = over_else {
        c.patch_jump_far_here(label);
    }

    if tail {
        let mut slot = Slot::sentinel();
        slot.flags |= SlotFlag::Returned;
        slot
    } else if drop {
        Slot::sentinel()
    } else {
        target
    }
}


// ----------------------------------------------------------------------
// while / break

fn special_while(c: &mut Compiler, _opts: &CompileOpts, args: &[Value]) -> Slot {
    if args.is_empty() {
        return c.cerror("expected at least 1 argument to while".into());
    }
    let cond_form = args[0].clone();
    let body = &args[1..];

    let loop_start = c.buffer.len();
    c.push_scope(ScopeFlag::While, Some("while"));

    let (cond, exit_op) = compile_condition(c, &cond_form);
    let truth = constant_truth(&cond, exit_op);
    if truth == Some(false) {
        // The body can never run; constants emitted no code.
        c.pop_scope();
        return cslot(&Value::Nil);
    }
    let infinite = truth == Some(true);

    let exit = if infinite {
        None
    } else {
        Some(c.emit_jump_cond(exit_op, &cond))
    };
    c.freeslot(&cond);

    for form in body {
        let sub = CompileOpts::dropped();
        let slot = c.compile_value(&sub, form);
        c.freeslot(&slot);
    }

    c.emit_jump_back(loop_start);
    if let Some(label) = exit {
        c.patch_jump_here(label);
    }
    c.rewrite_breaks(loop_start);

    // A closure compiled in the body captures this iteration's frame;
    // rerun the whole loop as a self-calling function so every
    // iteration gets a fresh one.
    if c.scope().flags.contains(ScopeFlag::Closure) {
        debug!("while body made a closure; recompiling as a self-call loop");
        c.scope_mut().flags |= ScopeFlag::Unused;
        c.pop_scope();
        c.buffer.truncate(loop_start);
        c.mapbuffer.truncate(loop_start);

        c.push_scope(ScopeFlag::Function, Some("while-iife"));
        let (cond, exit_op) = compile_condition(c, &cond_form);
        let infinite = constant_truth(&cond, exit_op) == Some(true);
        let exit = if infinite {
            None
        } else {
            Some(c.emit_jump_cond(exit_op, &cond))
        };
        c.freeslot(&cond);
        for form in body {
            let sub = CompileOpts::dropped();
            let slot = c.compile_value(&sub, form);
            c.freeslot(&slot);
        }
        // The back edge is a self tail call.
        let self_slot = c.farslot();
        c.emit_s(Op::LoadSelf, &self_slot, true);
        c.emit_s(Op::TailCall, &self_slot, false);
        c.freeslot(&self_slot);
        if let Some(label) = exit {
            c.patch_jump_here(label);
        }
        c.emit(word(Op::ReturnNil));

        let def = c.pop_funcdef();
        let index = c.add_funcdef(def);
        let closure = c.farslot();
        c.emit_su(Op::Closure, &closure, index as u16, true);
        c.emit_ss(Op::Call, &closure, &closure, true);
        c.freeslot(&closure);
        return cslot(&Value::Nil);
    }

    c.pop_scope();
    cslot(&Value::Nil)
}

fn special_break(c: &mut Compiler, _opts: &CompileOpts, args: &[Value]) -> Slot {
    if args.len() > 1 {
        return c.cerror("expected at most 1 argument to break".into());
    }
    // The nearest while or function scope decides what break means.
    let mut in_while = None;
    for si in (0..c.scopes.len()).rev() {
        let flags = c.scopes[si].flags;
        if flags.contains(ScopeFlag::While) {
            in_while = Some(true);
            break;
        }
        if flags.contains(ScopeFlag::Function) {
            in_while = Some(false);
            break;
        }
    }
    match in_while {
        Some(true) => {
            if let Some(value) = args.first() {
                let sub = CompileOpts::dropped();
                let slot = c.compile_value(&sub, value);
                c.freeslot(&slot);
            }
            // Tagged placeholder; the enclosing while rewrites it into
            // a jump to the loop exit.
            c.emit(Op::Jump as u32 | 0x80);
            Slot::sentinel()
        }
        Some(false) => {
            // Breaking out of a function body is a return.
            let value = args.first().cloned().unwrap_or(Value::Nil);
            let sub = CompileOpts::tail();
            c.compile_value(&sub, &value)
        }
        None => c.cerror("break must occur inside a loop or function".into()),
    }
}


// ----------------------------------------------------------------------
// fn

fn special_fn(c: &mut Compiler, opts: &CompileOpts, args: &[Value]) -> Slot {
    if args.is_empty() {
        return c.cerror("expected at least 1 argument to fn".into());
    }
    let mut parami = 0;
    let mut name: Option<Rc<str>> = None;
    if let Value::Symbol(s) = &args[0] {
        name = Some(s.clone());
        parami = 1;
    }
    if parami >= args.len() {
        return c.cerror("expected parameter list".into());
    }
    let params = match &args[parami] {
        Value::Tuple(t) => t.elements.clone(),
        _ => return c.cerror("expected parameters".into()),
    };
    let body = &args[parami + 1..];

    c.push_scope(ScopeFlag::Function, Some(name.as_deref().unwrap_or("fn")));

    // Parameters claim registers 0..n in declaration order.
    let mut arity = 0u32;
    let mut min_arity = 0u32;
    let mut vararg = false;
    let mut structarg = false;
    let mut optional = false;
    let mut i = 0;
    while i < params.len() {
        let marker = match &params[i] {
            Value::Symbol(s) => Some(&**s),
            _ => None,
        };
        match marker {
            Some("&") => {
                if i + 2 != params.len() {
                    return c.cerror("expected a single binding after &".into());
                }
                vararg = true;
                let pslot = c.farslot();
                bind_param(c, &params[i + 1], &pslot);
                i += 2;
            }
            Some("&opt") => {
                optional = true;
                i += 1;
            }
            Some("&keys") => {
                if i + 2 != params.len() {
                    return c.cerror("expected a single binding after &keys".into());
                }
                vararg = true;
                structarg = true;
                let pslot = c.farslot();
                bind_param(c, &params[i + 1], &pslot);
                i += 2;
            }
            Some("&named") => {
                // Sugar for a trailing keyword struct destructured by
                // parameter name.
                vararg = true;
                structarg = true;
                let pslot = c.farslot();
                for param in &params[i + 1..] {
                    let pname = match param {
                        Value::Symbol(s) => s.clone(),
                        _ => {
                            return c.cerror("expected symbol following &named".into())
                        }
                    };
                    let key = cslot(&Value::keyword(&pname));
                    let sub = c.farslot();
                    c.emit_sss(Op::Get, &sub, &pslot, &key, true);
                    c.nameslot(&pname, sub);
                }
                i = params.len();
            }
            _ => {
                let pslot = c.farslot();
                arity += 1;
                if !optional {
                    min_arity += 1;
                }
                bind_param(c, &params[i], &pslot);
                i += 1;
            }
        }
    }
    let max_arity = if vararg { ARITY_UNBOUNDED } else { arity };

    // A named function can call itself, unless a parameter shadows the
    // name.
    if let Some(n) = &name {
        let shadowed = params
            .iter()
            .any(|p| matches!(p, Value::Symbol(s) if s == n));
        if !shadowed {
            let self_slot = c.farslot();
            c.emit_s(Op::LoadSelf, &self_slot, true);
            c.nameslot(n, self_slot);
        }
    }

    if body.is_empty() {
        c.emit(word(Op::ReturnNil));
    } else {
        for form in &body[..body.len() - 1] {
            let sub = CompileOpts::dropped();
            let slot = c.compile_value(&sub, form);
            c.freeslot(&slot);
        }
        let sub = CompileOpts::tail();
        c.compile_value(&sub, &body[body.len() - 1]);
    }

    let mut def = c.pop_funcdef();
    def.arity = arity;
    def.min_arity = min_arity;
    def.max_arity = max_arity;
    if vararg {
        def.flags |= DefFlag::Vararg;
    }
    if structarg {
        def.flags |= DefFlag::StructArg;
    }
    def.name = name;
    let index = c.add_funcdef(def);

    let target = c.gettarget(opts);
    c.emit_su(Op::Closure, &target, index as u16, true);
    target
}

// A parameter is a symbol bound to its register directly, or a pattern
// destructured out of it.
fn bind_param(c: &mut Compiler, param: &Value, pslot: &Slot) {
    match param {
        Value::Symbol(name) => {
            let name = name.clone();
            c.nameslot(&name, pslot.clone());
        }
        pattern => {
            destructure(c, pattern, pslot, BindKind::Def, &None);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{compile, CompileError};
    use crate::disasm;
    use crate::env::Environment;
    use crate::funcdef::FuncDef;
    use crate::opcode::{
        field_a, field_a_wide, field_b, field_c, field_imm16, field_imm24, opcode,
    };

    fn sym(s: &str) -> Value {
        Value::symbol(s)
    }

    fn int(i: i32) -> Value {
        Value::Integer(i)
    }

    fn form(elements: Vec<Value>) -> Value {
        Value::tuple(elements)
    }

    fn test_env() -> Environment {
        let mut env = Environment::core();
        env.define("g", EnvEntry::of_ref(false, None));
        env.define("q", EnvEntry::of_ref(false, None));
        env.define("ok", EnvEntry::of_ref(false, None));
        env
    }

    fn compile_ok(value: Value) -> Rc<FuncDef> {
        let mut env = test_env();
        compile(&value, &mut env, "specials-test").expect("compilation failed")
    }

    fn compile_err(value: Value) -> CompileError {
        let mut env = test_env();
        compile(&value, &mut env, "specials-test").expect_err("should not compile")
    }

    fn ops(def: &FuncDef) -> Vec<Op> {
        def.bytecode
            .iter()
            .map(|&w| opcode(w).expect("undecodable instruction"))
            .collect()
    }

    fn count(def: &FuncDef, op: Op) -> usize {
        ops(def).iter().filter(|&&o| o == op).count()
    }

    // ------------------------------------------------------------------
    // if

    #[test]
    fn test_if_constant_condition_folds() {
        let def = compile_ok(form(vec![sym("if"), Value::Boolean(true), int(1), int(2)]));
        assert_eq!(ops(&def), vec![Op::LoadInteger, Op::Return]);
        assert_eq!(field_imm16(def.bytecode[0]), 1);

        let def = compile_ok(form(vec![sym("if"), Value::Nil, int(1), int(2)]));
        assert_eq!(ops(&def), vec![Op::LoadInteger, Op::Return]);
        assert_eq!(field_imm16(def.bytecode[0]), 2);
    }

    #[test]
    fn test_if_general_shape() {
        let def = compile_ok(form(vec![sym("if"), sym("q"), int(1), int(2)]));
        let found = ops(&def);
        assert_eq!(count(&def, Op::JumpIfNot), 1, "{}", disasm::listing(&def));
        // Both branches return in tail position; no join jump needed.
        assert_eq!(count(&def, Op::Jump), 0);
        assert_eq!(found.iter().filter(|&&o| o == Op::Return).count(), 2);
    }

    #[test]
    fn test_if_without_else_defaults_nil() {
        let def = compile_ok(form(vec![sym("if"), sym("q"), int(1)]));
        assert!(ops(&def).contains(&Op::ReturnNil));
    }

    #[test]
    fn test_if_nil_compare_uses_nil_jumps() {
        let def = compile_ok(form(vec![
            sym("if"),
            form(vec![sym("="), Value::Nil, sym("q")]),
            int(1),
            int(2),
        ]));
        assert_eq!(count(&def, Op::JumpIfNotNil), 1, "{}", disasm::listing(&def));
        assert_eq!(count(&def, Op::Equals), 0);

        let def = compile_ok(form(vec![
            sym("if"),
            form(vec![sym("not="), Value::Nil, sym("q")]),
            int(1),
            int(2),
        ]));
        assert_eq!(count(&def, Op::JumpIfNil), 1);
    }

    #[test]
    fn test_if_non_tail_joins_into_one_register() {
        // (g (if q 1 2)): the if is an argument, so both branches feed
        // one register and the then-branch jumps over the else.
        let def = compile_ok(form(vec![
            sym("g"),
            form(vec![sym("if"), sym("q"), int(1), int(2)]),
        ]));
        assert_eq!(count(&def, Op::JumpIfNot), 1);
        assert_eq!(count(&def, Op::Jump), 1);
        assert!(ops(&def).contains(&Op::TailCall));
    }

    // ------------------------------------------------------------------
    // do / upscope

    #[test]
    fn test_do_binds_and_computes() {
        // (do (def x 3) (+ x 1)): x aliases register 0 with a direct
        // load, no move; the addition uses the immediate form.
        let def = compile_ok(form(vec![
            sym("do"),
            form(vec![sym("def"), sym("x"), int(3)]),
            form(vec![sym("+"), sym("x"), int(1)]),
        ]));
        assert_eq!(
            ops(&def),
            vec![Op::LoadInteger, Op::AddImmediate, Op::Return],
            "{}",
            disasm::listing(&def)
        );
        assert_eq!(count(&def, Op::MoveNear), 0);
        assert_eq!(field_a(def.bytecode[0]), 0);
    }

    #[test]
    fn test_empty_do_is_nil() {
        let def = compile_ok(form(vec![sym("do")]));
        assert_eq!(ops(&def), vec![Op::ReturnNil]);
    }

    #[test]
    fn test_upscope_leaks_bindings() {
        let def = compile_ok(form(vec![
            sym("do"),
            form(vec![sym("upscope"), form(vec![sym("def"), sym("x"), int(1)])]),
            sym("x"),
        ]));
        assert!(ops(&def).contains(&Op::Return));
    }

    #[test]
    fn test_do_scopes_do_not_leak() {
        let err = compile_err(form(vec![
            sym("do"),
            form(vec![sym("do"), form(vec![sym("def"), sym("x"), int(1)])]),
            sym("x"),
        ]));
        assert!(err.message.contains("unknown symbol"));
    }

    // ------------------------------------------------------------------
    // def / var / set

    #[test]
    fn test_global_def_constant_binds_at_compile_time() {
        let mut env = test_env();
        let def = compile(
            &form(vec![sym("def"), sym("answer"), int(42)]),
            &mut env,
            "t",
        )
        .unwrap();
        let entry = env.get("answer").unwrap();
        assert!(!entry.mutable);
        assert_eq!(entry.value, Some(int(42)));
        // Nothing to store at runtime; the form just yields its value.
        assert_eq!(ops(&def), vec![Op::LoadInteger, Op::Return]);
    }

    #[test]
    fn test_global_def_runtime_value_writes_through_cell() {
        let mut env = test_env();
        let def = compile(
            &form(vec![sym("def"), sym("answer"), form(vec![sym("g")])]),
            &mut env,
            "t",
        )
        .unwrap();
        // The new entry exists, is immutable, and holds a cell the
        // emitted code stores into.
        let entry = env.get("answer").unwrap();
        assert!(!entry.mutable);
        assert!(entry.ref_cell.is_some());
        assert!(entry.value.is_none());
        assert_eq!(count(&def, Op::PutIndex), 1, "{}", disasm::listing(&def));
        assert!(ops(&def).contains(&Op::Call));
    }

    #[test]
    fn test_def_metadata_accumulates() {
        let mut env = test_env();
        compile(
            &form(vec![
                sym("def"),
                sym("documented"),
                Value::keyword("private"),
                Value::string("a docstring"),
                int(1),
            ]),
            &mut env,
            "t",
        )
        .unwrap();
        let meta = env.get("documented").unwrap().meta.clone().unwrap();
        assert_eq!(
            meta.get(&Value::keyword("private")),
            Some(Value::Boolean(true))
        );
        assert_eq!(
            meta.get(&Value::keyword("doc")),
            Some(Value::string("a docstring"))
        );
    }

    #[test]
    fn test_local_def_aliases_a_call_result_in_register_zero() {
        // (fn [] (def x (g)) x): the call's result lands in register 0
        // (first allocation in a fresh frame), and the binding aliases
        // it in place rather than copying it anywhere.
        let def = compile_ok(form(vec![
            sym("fn"),
            Value::bracket_tuple(vec![]),
            form(vec![sym("def"), sym("x"), form(vec![sym("g")])]),
            sym("x"),
        ]));
        let inner = &def.defs[0];
        assert_eq!(
            ops(inner),
            vec![Op::LoadConstant, Op::GetIndex, Op::Call, Op::Return],
            "{}",
            disasm::listing(inner)
        );
        assert_eq!(count(inner, Op::MoveNear), 0);
        assert_eq!(count(inner, Op::MoveFar), 0);
        // The call writes register 0 and the return reads it back.
        let call = inner.bytecode[2];
        assert_eq!(field_a(call), 0);
        let ret = inner.bytecode[3];
        assert_eq!(field_a_wide(ret), 0);
        // Register 0 plus the scratch the callee was materialised in;
        // a copy would have claimed a third slot.
        assert_eq!(inner.slot_count, 2);
    }

    #[test]
    fn test_set_on_def_is_an_error() {
        let err = compile_err(form(vec![
            sym("do"),
            form(vec![sym("def"), sym("x"), int(1)]),
            form(vec![sym("set"), sym("x"), int(2)]),
        ]));
        assert!(err.message.contains("cannot set constant"));
    }

    #[test]
    fn test_var_set_goes_through_the_cell() {
        let def = compile_ok(form(vec![
            sym("do"),
            form(vec![sym("var"), sym("x"), int(1)]),
            form(vec![sym("set"), sym("x"), int(2)]),
        ]));
        // One store for the initialiser, one for the set; the final
        // read for the return goes back through the cell.
        assert_eq!(count(&def, Op::PutIndex), 2, "{}", disasm::listing(&def));
        assert_eq!(count(&def, Op::GetIndex), 1);
        // The cell itself sits in the constant pool.
        assert!(def
            .constants
            .iter()
            .any(|v| matches!(v, Value::Array(_))));
    }

    #[test]
    fn test_set_data_structure_form() {
        let def = compile_ok(form(vec![
            sym("set"),
            form(vec![sym("q"), Value::keyword("k")]),
            int(2),
        ]));
        assert_eq!(count(&def, Op::Put), 1);
    }

    #[test]
    fn test_destructure_with_rest() {
        // (def [a & b] [1 2 3]) gathers the tail in an emitted loop.
        let def = compile_ok(form(vec![
            sym("def"),
            Value::bracket_tuple(vec![sym("a"), sym("&"), sym("b")]),
            Value::bracket_tuple(vec![int(1), int(2), int(3)]),
        ]));
        let found = ops(&def);
        for expected in [
            Op::GetIndex,
            Op::Length,
            Op::NumericLessThan,
            Op::Push,
            Op::AddImmediate,
            Op::MakeTuple,
        ] {
            assert!(found.contains(&expected), "missing {:?}: {}", expected, disasm::listing(&def));
        }
        // The gathering loop's back edge is a conditional jump.
        let back_jumps = def
            .bytecode
            .iter()
            .filter(|&&w| opcode(w) == Some(Op::JumpIf) && field_imm16(w) < 0)
            .count();
        assert_eq!(back_jumps, 1, "{}", disasm::listing(&def));
    }

    #[test]
    fn test_destructure_dictionary() {
        let pattern = Struct::of(vec![(Value::keyword("k"), sym("a"))]);
        let def = compile_ok(form(vec![
            sym("def"),
            Value::Struct(pattern),
            sym("q"),
        ]));
        assert_eq!(count(&def, Op::Get), 1);
    }

    #[test]
    fn test_destructure_rejects_bad_patterns() {
        let err = compile_err(form(vec![sym("def"), int(3), int(1)]));
        assert!(err.message.contains("destructuring"));
    }

    #[test]
    fn test_var_rejects_missing_value() {
        let err = compile_err(form(vec![sym("var"), sym("x")]));
        assert!(err.message.contains("expected at least 2"));
    }

    // ------------------------------------------------------------------
    // fn

    #[test]
    fn test_fn_two_params_adds_in_place() {
        let def = compile_ok(form(vec![
            sym("fn"),
            Value::bracket_tuple(vec![sym("x"), sym("y")]),
            form(vec![sym("+"), sym("x"), sym("y")]),
        ]));
        assert_eq!(ops(&def), vec![Op::Closure, Op::Return]);
        let inner = &def.defs[0];
        assert_eq!(inner.arity, 2);
        assert_eq!(inner.min_arity, 2);
        assert_eq!(inner.max_arity, 2);
        assert_eq!(ops(inner), vec![Op::Add, Op::Return]);
        let add = inner.bytecode[0];
        assert_eq!(field_a(add), 2);
        assert_eq!(field_b(add), 0);
        assert_eq!(field_c(add), 1);
        assert_eq!(inner.slot_count, 3);
    }

    #[test]
    fn test_fn_tail_call() {
        let def = compile_ok(form(vec![
            sym("fn"),
            Value::bracket_tuple(vec![sym("x")]),
            form(vec![sym("g"), sym("x")]),
        ]));
        let inner = &def.defs[0];
        let found = ops(inner);
        assert!(found.contains(&Op::TailCall), "{}", disasm::listing(inner));
        assert!(!found.contains(&Op::Call));
    }

    #[test]
    fn test_fn_vararg_flags() {
        let def = compile_ok(form(vec![
            sym("fn"),
            Value::bracket_tuple(vec![sym("x"), sym("&"), sym("rest")]),
            sym("rest"),
        ]));
        let inner = &def.defs[0];
        assert!(inner.flags.contains(DefFlag::Vararg));
        assert!(!inner.flags.contains(DefFlag::StructArg));
        assert_eq!(inner.arity, 1);
        assert_eq!(inner.min_arity, 1);
        assert_eq!(inner.max_arity, ARITY_UNBOUNDED);
    }

    #[test]
    fn test_fn_optional_params() {
        let def = compile_ok(form(vec![
            sym("fn"),
            Value::bracket_tuple(vec![sym("x"), sym("&opt"), sym("y")]),
            sym("x"),
        ]));
        let inner = &def.defs[0];
        assert_eq!(inner.min_arity, 1);
        assert_eq!(inner.arity, 2);
        assert_eq!(inner.max_arity, 2);
    }

    #[test]
    fn test_fn_keys_param() {
        let def = compile_ok(form(vec![
            sym("fn"),
            Value::bracket_tuple(vec![sym("&keys"), sym("options")]),
            sym("options"),
        ]));
        let inner = &def.defs[0];
        assert!(inner.flags.contains(DefFlag::Vararg));
        assert!(inner.flags.contains(DefFlag::StructArg));
    }

    #[test]
    fn test_fn_named_params_desugar() {
        let def = compile_ok(form(vec![
            sym("fn"),
            Value::bracket_tuple(vec![sym("&named"), sym("alpha"), sym("beta")]),
            sym("alpha"),
        ]));
        let inner = &def.defs[0];
        assert!(inner.flags.contains(DefFlag::StructArg));
        assert_eq!(count(inner, Op::Get), 2);
        assert!(inner.constants.contains(&Value::keyword("alpha")));
        assert!(inner.constants.contains(&Value::keyword("beta")));
    }

    #[test]
    fn test_fn_self_reference() {
        let def = compile_ok(form(vec![
            sym("fn"),
            sym("rec"),
            Value::bracket_tuple(vec![]),
            form(vec![sym("rec")]),
        ]));
        let inner = &def.defs[0];
        let found = ops(inner);
        assert!(found.contains(&Op::LoadSelf));
        assert!(found.contains(&Op::TailCall));
        assert_eq!(inner.name.as_deref(), Some("rec"));
    }

    #[test]
    fn test_fn_self_reference_shadowed_by_param() {
        let def = compile_ok(form(vec![
            sym("fn"),
            sym("x"),
            Value::bracket_tuple(vec![sym("x")]),
            sym("x"),
        ]));
        let inner = &def.defs[0];
        assert!(!ops(inner).contains(&Op::LoadSelf));
    }

    #[test]
    fn test_fn_empty_body_returns_nil() {
        let def = compile_ok(form(vec![sym("fn"), Value::bracket_tuple(vec![])]));
        let inner = &def.defs[0];
        assert_eq!(ops(inner), vec![Op::ReturnNil]);
    }

    #[test]
    fn test_fn_param_destructuring() {
        let def = compile_ok(form(vec![
            sym("fn"),
            Value::bracket_tuple(vec![Value::bracket_tuple(vec![sym("a"), sym("b")])]),
            sym("a"),
        ]));
        let inner = &def.defs[0];
        assert_eq!(count(inner, Op::GetIndex), 2);
        assert_eq!(inner.arity, 1);
    }

    #[test]
    fn test_upvalue_capture() {
        // (fn [] (def x 0) (fn [] x))
        let def = compile_ok(form(vec![
            sym("fn"),
            Value::bracket_tuple(vec![]),
            form(vec![sym("def"), sym("x"), int(0)]),
            form(vec![sym("fn"), Value::bracket_tuple(vec![]), sym("x")]),
        ]));
        let outer = &def.defs[0];
        assert!(outer.environments.is_empty());
        let inner = &outer.defs[0];
        assert_eq!(inner.environments, vec![0]);
        assert!(ops(inner).contains(&Op::LoadUpvalue), "{}", disasm::listing(inner));
    }

    #[test]
    fn test_upvalue_chain_through_two_levels() {
        // (fn [] (def x 0) (fn [] (fn [] x)))
        let def = compile_ok(form(vec![
            sym("fn"),
            Value::bracket_tuple(vec![]),
            form(vec![sym("def"), sym("x"), int(0)]),
            form(vec![
                sym("fn"),
                Value::bracket_tuple(vec![]),
                form(vec![sym("fn"), Value::bracket_tuple(vec![]), sym("x")]),
            ]),
        ]));
        let level1 = &def.defs[0];
        let level2 = &level1.defs[0];
        let level3 = &level2.defs[0];
        // The middle function forwards its parent's frame; the inner
        // one chains through the middle's entry 0.
        assert_eq!(level2.environments, vec![0]);
        assert_eq!(level3.environments, vec![1]);
        assert!(ops(level3).contains(&Op::LoadUpvalue));
    }

    #[test]
    fn test_mutable_capture_goes_through_cell() {
        // (fn [] (var x 0) (fn [] (set x 1)))
        let def = compile_ok(form(vec![
            sym("fn"),
            Value::bracket_tuple(vec![]),
            form(vec![sym("var"), sym("x"), int(0)]),
            form(vec![
                sym("fn"),
                Value::bracket_tuple(vec![]),
                form(vec![sym("set"), sym("x"), int(1)]),
            ]),
        ]));
        let outer = &def.defs[0];
        // The binding is a one-element array in the pool, stored to at
        // initialisation.
        assert!(outer
            .constants
            .iter()
            .any(|v| matches!(v, Value::Array(_))));
        assert!(ops(outer).contains(&Op::PutIndex));
        // The inner function writes through the same cell rather than
        // an upvalue.
        let inner = &outer.defs[0];
        assert!(ops(inner).contains(&Op::PutIndex));
        assert!(inner.environments.is_empty());
        assert!(!ops(inner).contains(&Op::SetUpvalue));
    }

    // ------------------------------------------------------------------
    // while / break

    #[test]
    fn test_while_loop_shape() {
        let def = compile_ok(form(vec![sym("while"), sym("ok"), form(vec![sym("g")])]));
        let found = ops(&def);
        assert_eq!(count(&def, Op::JumpIfNot), 1, "{}", disasm::listing(&def));
        assert!(found.contains(&Op::Call));
        assert!(found.contains(&Op::ReturnNil));
        let back_jumps = def
            .bytecode
            .iter()
            .filter(|&&w| opcode(w) == Some(Op::Jump) && field_imm24(w) < 0)
            .count();
        assert_eq!(back_jumps, 1);
    }

    #[test]
    fn test_while_constant_false_elides_everything() {
        let def = compile_ok(form(vec![sym("while"), Value::Nil, form(vec![sym("g")])]));
        assert_eq!(ops(&def), vec![Op::ReturnNil]);
    }

    #[test]
    fn test_while_constant_true_elides_condition() {
        let def = compile_ok(form(vec![
            sym("while"),
            Value::Boolean(true),
            form(vec![sym("g")]),
        ]));
        assert_eq!(count(&def, Op::JumpIfNot), 0);
        assert_eq!(count(&def, Op::Jump), 1);
    }

    #[test]
    fn test_while_nil_compare_condition() {
        let def = compile_ok(form(vec![
            sym("while"),
            form(vec![sym("not="), Value::Nil, sym("q")]),
            form(vec![sym("g")]),
        ]));
        assert_eq!(count(&def, Op::JumpIfNil), 1);
    }

    #[test]
    fn test_break_leaves_no_tagged_instructions() {
        let def = compile_ok(form(vec![
            sym("while"),
            sym("ok"),
            form(vec![sym("if"), sym("q"), form(vec![sym("break")])]),
            form(vec![sym("g")]),
        ]));
        for &word in def.bytecode.iter() {
            assert!(
                opcode(word).is_some(),
                "unresolved placeholder {:08x} in {}",
                word,
                disasm::listing(&def)
            );
        }
        // The break became a forward jump.
        let forward_jumps = def
            .bytecode
            .iter()
            .filter(|&&w| opcode(w) == Some(Op::Jump) && field_imm24(w) > 0)
            .count();
        assert!(forward_jumps >= 1);
    }

    #[test]
    fn test_break_in_function_returns() {
        let def = compile_ok(form(vec![
            sym("fn"),
            Value::bracket_tuple(vec![]),
            form(vec![sym("break"), int(3)]),
        ]));
        let inner = &def.defs[0];
        assert_eq!(ops(inner), vec![Op::LoadInteger, Op::Return]);
    }

    #[test]
    fn test_while_closure_recompiles_as_self_call() {
        // (while ok (def x 1) (g (fn [] x)))
        let def = compile_ok(form(vec![
            sym("while"),
            sym("ok"),
            form(vec![sym("def"), sym("x"), int(1)]),
            form(vec![
                sym("g"),
                form(vec![sym("fn"), Value::bracket_tuple(vec![]), sym("x")]),
            ]),
        ]));
        // The loop became: make closure, call it once.
        let found = ops(&def);
        assert!(found.contains(&Op::Closure), "{}", disasm::listing(&def));
        assert!(found.contains(&Op::Call));
        assert!(!found.contains(&Op::JumpIfNot));
        // The replacement function ends in a self tail call, and the
        // closure inside it captures the per-iteration frame.
        let iife = def
            .defs
            .iter()
            .find(|d| d.name.as_deref() == Some("while-iife"))
            .expect("missing self-call loop definition");
        let iife_ops = ops(iife);
        assert!(iife_ops.contains(&Op::LoadSelf));
        assert!(iife_ops.contains(&Op::TailCall));
        assert!(iife_ops.contains(&Op::ReturnNil));
        let captured = &iife.defs[0];
        assert_eq!(captured.environments, vec![0]);
    }

    // ------------------------------------------------------------------
    // quasiquote

    #[test]
    fn test_quasiquote_unquote_splices_code() {
        // (quasiquote (a (unquote (+ 1 2)) b))
        let def = compile_ok(form(vec![
            sym("quasiquote"),
            form(vec![
                sym("a"),
                form(vec![sym("unquote"), form(vec![sym("+"), int(1), int(2)])]),
                sym("b"),
            ]),
        ]));
        let found = ops(&def);
        assert_eq!(count(&def, Op::Push), 3, "{}", disasm::listing(&def));
        assert!(found.contains(&Op::MakeTuple));
        assert!(found.contains(&Op::AddImmediate) || found.contains(&Op::Add));
        // The symbols pass through as data.
        assert!(def.constants.contains(&sym("a")));
        assert!(def.constants.contains(&sym("b")));
    }

    #[test]
    fn test_quasiquote_without_unquote_is_constant() {
        let def = compile_ok(form(vec![
            sym("quasiquote"),
            form(vec![sym("a"), sym("b")]),
        ]));
        assert_eq!(ops(&def), vec![Op::LoadConstant, Op::Return]);
    }

    #[test]
    fn test_quasiquote_nesting_levels() {
        // The inner unquote sits at level 1, so it stays data.
        let def = compile_ok(form(vec![
            sym("quasiquote"),
            form(vec![
                sym("quasiquote"),
                form(vec![sym("unquote"), sym("undefined-symbol")]),
            ]),
        ]));
        assert_eq!(ops(&def), vec![Op::LoadConstant, Op::Return]);
    }

    #[test]
    fn test_unquote_outside_quasiquote_errors() {
        let err = compile_err(form(vec![sym("unquote"), int(1)]));
        assert!(err.message.contains("quasiquote"));
    }

    #[test]
    fn test_splice_expands_arguments() {
        let def = compile_ok(form(vec![
            sym("g"),
            form(vec![sym("splice"), sym("q")]),
            int(1),
        ]));
        assert_eq!(count(&def, Op::PushArray), 1);
        assert_eq!(count(&def, Op::Push), 1);
    }

    #[test]
    fn test_quote_is_data() {
        let def = compile_ok(form(vec![
            sym("quote"),
            form(vec![sym("undefined-symbol"), int(1)]),
        ]));
        assert_eq!(ops(&def), vec![Op::LoadConstant, Op::Return]);
    }
}
