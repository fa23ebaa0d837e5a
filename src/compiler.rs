// (C) 2020 Brandon Lewis
//
// The bytecode compiler: parsed values in, function definitions out.
//
// *Slots*
//
// Every compiled subform yields a slot: the compiler's handle on where
// the value will live at runtime. A slot is a constant awaiting a
// load, a local register of the current function, an upvalue reference
// into an enclosing function's frame, or a "ref" (a one-element array
// standing in for a mutable or global binding, addressed through its
// constant).
//
// *Scopes*
//
// Lexical scopes form a stack, pushed and popped in strict LIFO order.
// Function scopes own a register allocator, a constant pool, and the
// nested definitions compiled under them; plain scopes share the
// enclosing allocator state by cloning it, so their registers die with
// them and only the high-water mark survives.
//
// *Errors*
//
// There are no panics on bad input and no unwinding. The first error
// parks itself on the compiler with the source position that produced
// it; from then on every operation is a no-op returning a nil sentinel
// slot, and the entry point reports the parked error.

use std::rc::Rc;

use enumflags2::BitFlags;
use thiserror::Error;
use tracing::trace;

use crate::env::{EnvEntry, Environment};
use crate::funcdef::{FuncDef, SourceMapping};
use crate::opcode::{word, Op};
use crate::regalloc::{RegAlloc, REG_MAX};
use crate::value::{Tuple, TypeSet, Value};


// How many nested forms we compile before giving up on the input.
pub const RECURSION_GUARD: u32 = 1000;


#[derive(BitFlags, Copy, Clone, Debug, PartialEq)]
#[repr(u8)]
pub enum SlotFlag {
    // A literal to load on demand; no register holds it yet.
    Constant = 0b000001,
    // The binding has an entry in some scope's symbol table.
    Named = 0b000010,
    // Introduced by `var`; writable through `set`.
    Mutable = 0b000100,
    // The logical value lives in slot 0 of a one-element array.
    Ref = 0b001000,
    // A return was already emitted for this slot.
    Returned = 0b010000,
    // Expands into multiple arguments at the nearest call or
    // constructor.
    Spliced = 0b100000,
}


#[derive(BitFlags, Copy, Clone, Debug, PartialEq)]
#[repr(u8)]
pub enum ScopeFlag {
    // Owns a frame: registers, constants, nested defs.
    Function = 0b000001,
    // The frame is captured by some inner closure.
    Env = 0b000010,
    // The top-level scope; definitions here go to the environment.
    Top = 0b000100,
    // Emitted code for this scope is going to be discarded.
    Unused = 0b001000,
    // A closure was created while this scope was open.
    Closure = 0b010000,
    // A `while` body; `break` targets the nearest one of these.
    While = 0b100000,
}


#[derive(Clone, Debug)]
pub struct Slot {
    pub index: i32,
    pub envindex: i32,
    pub flags: BitFlags<SlotFlag>,
    pub types: TypeSet,
    pub constant: Option<Value>,
}

impl Slot {
    // What every operation returns once compilation has failed.
    pub fn sentinel() -> Slot {
        cslot(&Value::Nil)
    }

    // A compile-time literal. Refs also carry a constant (the cell's
    // address), but their logical value only exists at runtime.
    pub fn is_constant(&self) -> bool {
        self.flags.contains(SlotFlag::Constant) && !self.flags.contains(SlotFlag::Ref)
    }
}

// A constant slot: load this literal on demand.
pub fn cslot(value: &Value) -> Slot {
    Slot {
        index: -1,
        envindex: -1,
        flags: BitFlags::from_flag(SlotFlag::Constant),
        types: BitFlags::from_flag(value.get_type()),
        constant: Some(value.clone()),
    }
}


#[derive(BitFlags, Copy, Clone, Debug, PartialEq)]
#[repr(u8)]
pub enum OptFlag {
    // The result position is a tail position: calls become tail calls
    // and the value is returned rather than handed to the caller.
    Tail = 0b01,
    // The result is unused; the caller will free the slot.
    Drop = 0b10,
}

#[derive(Clone, Debug, Default)]
pub struct CompileOpts {
    pub flags: BitFlags<OptFlag>,
    pub hint: Option<Slot>,
}

impl CompileOpts {
    pub fn new() -> CompileOpts {
        CompileOpts::default()
    }

    pub fn tail() -> CompileOpts {
        CompileOpts {
            flags: BitFlags::from_flag(OptFlag::Tail),
            hint: None,
        }
    }

    pub fn dropped() -> CompileOpts {
        CompileOpts {
            flags: BitFlags::from_flag(OptFlag::Drop),
            hint: None,
        }
    }

    pub fn with_hint(hint: Slot) -> CompileOpts {
        CompileOpts {
            flags: BitFlags::empty(),
            hint: Some(hint),
        }
    }

    pub fn is_tail(&self) -> bool {
        self.flags.contains(OptFlag::Tail)
    }

    pub fn is_drop(&self) -> bool {
        self.flags.contains(OptFlag::Drop)
    }
}


#[derive(Debug, Clone)]
pub(crate) struct SymPair {
    pub sym: Rc<str>,
    pub slot: Slot,
}


#[derive(Debug)]
pub(crate) struct Scope {
    pub flags: BitFlags<ScopeFlag>,
    pub name: Option<Rc<str>>,
    pub syms: Vec<SymPair>,
    // Function scopes only.
    pub consts: Vec<Value>,
    pub defs: Vec<Rc<FuncDef>>,
    pub envs: Vec<u32>,
    pub ra: RegAlloc,
    pub bytecode_start: usize,
}


#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message} at {line}:{column}")]
pub struct CompileError {
    pub message: String,
    pub line: i32,
    pub column: i32,
    // Set when a macro failed while expanding; carries the fiber the
    // failure happened in for stack traces. The core compiler never
    // runs macros itself.
    pub fiber: Option<Value>,
}


pub struct Compiler<'e> {
    pub(crate) scopes: Vec<Scope>,
    pub(crate) buffer: Vec<u32>,
    pub(crate) mapbuffer: Vec<SourceMapping>,
    pub(crate) env: &'e mut Environment,
    pub(crate) source: Rc<str>,
    pub(crate) current_mapping: SourceMapping,
    pub(crate) recursion_guard: u32,
    pub(crate) error: Option<CompileError>,
}

impl<'e> Compiler<'e> {
    pub fn new(env: &'e mut Environment, source: &str) -> Compiler<'e> {
        Compiler {
            scopes: Vec::new(),
            buffer: Vec::new(),
            mapbuffer: Vec::new(),
            env,
            source: Rc::from(source),
            current_mapping: SourceMapping::none(),
            recursion_guard: RECURSION_GUARD,
            error: None,
        }
    }

    // ------------------------------------------------------------------
    // Errors

    pub(crate) fn failed(&self) -> bool {
        self.error.is_some()
    }

    // Park the first error with the position we were compiling at;
    // everything after it is a no-op.
    pub(crate) fn cerror(&mut self, message: String) -> Slot {
        if self.error.is_none() {
            self.error = Some(CompileError {
                message,
                line: self.current_mapping.line,
                column: self.current_mapping.column,
                fiber: None,
            });
        }
        Slot::sentinel()
    }

    pub(crate) fn set_source_mapping(&mut self, tuple: &Tuple) {
        if tuple.line >= 0 {
            self.current_mapping = SourceMapping {
                line: tuple.line,
                column: tuple.column,
            };
        }
    }

    // ------------------------------------------------------------------
    // Scopes

    pub(crate) fn push_scope(
        &mut self,
        flags: impl Into<BitFlags<ScopeFlag>>,
        name: Option<&str>,
    ) {
        let flags = flags.into();
        trace!(scope = name.unwrap_or(""), "push scope");
        let ra = if flags.contains(ScopeFlag::Function) {
            RegAlloc::new()
        } else {
            // Plain scopes share the enclosing allocator state, so
            // sibling scopes can reuse each other's dead registers.
            self.scopes
                .last()
                .map(|s| s.ra.clone())
                .unwrap_or_default()
        };
        self.scopes.push(Scope {
            flags,
            name: name.map(Rc::from),
            syms: Vec::new(),
            consts: Vec::new(),
            defs: Vec::new(),
            envs: Vec::new(),
            ra,
            bytecode_start: self.buffer.len(),
        });
    }

    pub(crate) fn pop_scope(&mut self) {
        let old = self.scopes.pop().expect("scope stack underflow");
        trace!(scope = old.name.as_deref().unwrap_or(""), "pop scope");
        if let Some(parent) = self.scopes.last_mut() {
            if !old.flags.intersects(ScopeFlag::Function | ScopeFlag::Unused) {
                parent.ra.raise_max(old.ra.max());
            }
        }
    }

    // Pop, but keep one slot's register reserved in the parent: the
    // result of a `do` body outlives the body's scope.
    pub(crate) fn pop_scope_keepslot(&mut self, keep: &Slot) {
        self.pop_scope();
        if keep.envindex < 0 && keep.index >= 0 {
            if let Some(parent) = self.scopes.last_mut() {
                parent.ra.touch(keep.index);
            }
        }
    }

    pub(crate) fn scope(&self) -> &Scope {
        self.scopes.last().expect("no current scope")
    }

    pub(crate) fn scope_mut(&mut self) -> &mut Scope {
        self.scopes.last_mut().expect("no current scope")
    }

    // Index of the function scope owning the scope at `idx`.
    fn owning_function(&self, idx: usize) -> usize {
        let mut i = idx;
        loop {
            if self.scopes[i].flags.contains(ScopeFlag::Function) {
                return i;
            }
            debug_assert!(i > 0, "scope chain with no function scope");
            i -= 1;
        }
    }

    pub(crate) fn fun_scope_idx(&self) -> usize {
        self.owning_function(self.scopes.len() - 1)
    }

    // ------------------------------------------------------------------
    // Registers and constants

    // A fresh register slot in the current scope. "Far" because the
    // result may exceed the 8-bit operand range.
    pub(crate) fn farslot(&mut self) -> Slot {
        let reg = self.scope_mut().ra.alloc_1();
        if reg > REG_MAX {
            return self.cerror("ran out of internal registers".into());
        }
        Slot {
            index: reg,
            envindex: -1,
            flags: BitFlags::empty(),
            types: TypeSet::all(),
            constant: None,
        }
    }

    // Where an expression should leave its result: the caller's hint
    // when it names a plain near register, a fresh register otherwise.
    pub(crate) fn gettarget(&mut self, opts: &CompileOpts) -> Slot {
        if let Some(hint) = &opts.hint {
            if hint.envindex < 0
                && hint.index >= 0
                && hint.index <= 0xFF
                && !hint.flags.intersects(SlotFlag::Constant | SlotFlag::Ref)
            {
                return hint.clone();
            }
        }
        self.farslot()
    }

    pub(crate) fn freeslot(&mut self, s: &Slot) {
        if s.flags.intersects(SlotFlag::Constant | SlotFlag::Named) {
            return;
        }
        if s.envindex >= 0 || s.index < 0 {
            return;
        }
        self.scope_mut().ra.free(s.index);
    }

    pub(crate) fn freeslots(&mut self, slots: &[Slot]) {
        for s in slots {
            self.freeslot(s);
        }
    }

    // Pool a constant on the nearest function scope, sharing an index
    // with any equal value already there.
    pub(crate) fn add_constant(&mut self, value: &Value) -> u32 {
        let fi = self.fun_scope_idx();
        let consts = &mut self.scopes[fi].consts;
        for (i, existing) in consts.iter().enumerate() {
            if existing == value {
                return i as u32;
            }
        }
        if consts.len() >= 0xFFFF {
            self.cerror("too many constants".into());
            return 0;
        }
        consts.push(value.clone());
        (consts.len() - 1) as u32
    }

    pub(crate) fn add_funcdef(&mut self, def: FuncDef) -> u32 {
        let fi = self.fun_scope_idx();
        let defs = &mut self.scopes[fi].defs;
        defs.push(Rc::new(def));
        (defs.len() - 1) as u32
    }

    // ------------------------------------------------------------------
    // The symbol table

    pub(crate) fn nameslot(&mut self, name: &Rc<str>, mut slot: Slot) {
        slot.flags |= SlotFlag::Named;
        self.scope_mut().syms.push(SymPair {
            sym: name.clone(),
            slot,
        });
    }

    // Bind a name, aliasing the value's register when it is a plain
    // anonymous local, copying into a fresh one otherwise.
    pub(crate) fn namelocal(
        &mut self,
        name: &Rc<str>,
        extra: BitFlags<SlotFlag>,
        value: &Slot,
    ) -> Slot {
        let aliasable = !value.flags.contains(SlotFlag::Named)
            && !value.flags.intersects(SlotFlag::Constant | SlotFlag::Ref)
            && value.envindex < 0
            && value.index >= 0;
        let mut bound = if aliasable {
            value.clone()
        } else {
            let local = self.farslot();
            self.copy(&local, value);
            local
        };
        bound.flags |= extra | SlotFlag::Named;
        self.nameslot(name, bound.clone());
        bound
    }

    // Walk outward looking for a binding; fall back to the global
    // environment. Crossing a function boundary turns the slot into an
    // upvalue and threads a capture entry through every intervening
    // function scope.
    pub(crate) fn resolve(&mut self, name: &str) -> Slot {
        let mut found: Option<(usize, Slot)> = None;
        let mut unused = false;
        'search: for si in (0..self.scopes.len()).rev() {
            let scope = &self.scopes[si];
            if scope.flags.contains(ScopeFlag::Unused) {
                unused = true;
            }
            for pair in scope.syms.iter().rev() {
                if &*pair.sym == name {
                    found = Some((si, pair.slot.clone()));
                    break 'search;
                }
            }
        }

        let (bind_idx, mut slot) = match found {
            Some(hit) => hit,
            None => return self.resolve_global(name),
        };
        slot.flags |= SlotFlag::Named;

        // Constants and refs travel anywhere without capture.
        if slot.flags.intersects(SlotFlag::Constant | SlotFlag::Ref) {
            return slot;
        }

        let owner = self.owning_function(bind_idx);
        let current = self.fun_scope_idx();
        if owner == current || unused {
            return slot;
        }

        // The binding's frame escapes; its register must survive to
        // the end of the owning function.
        self.scopes[owner].flags |= ScopeFlag::Env;
        for si in owner..=bind_idx {
            self.scopes[si].ra.touch(slot.index);
        }

        // Thread a capture entry through each function boundary from
        // the outside in. Entry value 0 is the parent frame itself;
        // n >= 1 points at entry n - 1 of the parent's own table.
        let mut previous: u32 = 0;
        let mut envindex = 0usize;
        for fi in owner + 1..self.scopes.len() {
            if !self.scopes[fi].flags.contains(ScopeFlag::Function) {
                continue;
            }
            let envs = &mut self.scopes[fi].envs;
            let idx = match envs.iter().position(|&e| e == previous) {
                Some(idx) => idx,
                None => {
                    envs.push(previous);
                    envs.len() - 1
                }
            };
            envindex = idx;
            previous = idx as u32 + 1;
        }

        slot.envindex = envindex as i32;
        slot
    }

    // The compile-time value a symbol would resolve to, if any, with
    // no side effects: no errors, no capture registration. Lets the
    // condition optimizer recognise tagged builtins without disturbing
    // the scope state.
    pub(crate) fn peek_constant(&self, name: &str) -> Option<Value> {
        for si in (0..self.scopes.len()).rev() {
            for pair in self.scopes[si].syms.iter().rev() {
                if &*pair.sym == name {
                    return if pair.slot.is_constant() {
                        pair.slot.constant.clone()
                    } else {
                        None
                    };
                }
            }
        }
        self.env.get(name).and_then(|entry| entry.value.clone())
    }

    fn resolve_global(&mut self, name: &str) -> Slot {
        let entry = match self.env.get(name) {
            Some(entry) => entry.clone(),
            None => return self.cerror(format!("unknown symbol {}", name)),
        };
        if let Some(cell) = &entry.ref_cell {
            let mut slot = cslot(cell);
            slot.flags |= SlotFlag::Ref | SlotFlag::Named;
            if entry.mutable {
                slot.flags |= SlotFlag::Mutable;
            }
            // The cell can hold anything at runtime.
            slot.types = TypeSet::all();
            return slot;
        }
        match &entry.value {
            Some(value) => cslot(value),
            None => self.cerror(format!("unknown symbol {}", name)),
        }
    }

    // ------------------------------------------------------------------
    // Value dispatch

    pub fn compile_value(&mut self, opts: &CompileOpts, x: &Value) -> Slot {
        if self.failed() {
            return Slot::sentinel();
        }
        if self.recursion_guard == 0 {
            return self.cerror("recursed too deeply".into());
        }
        self.recursion_guard -= 1;
        let mut slot = self.compile_value_inner(opts, x);
        if opts.is_tail() {
            slot = self.do_return(slot);
        }
        self.recursion_guard += 1;
        slot
    }

    fn compile_value_inner(&mut self, opts: &CompileOpts, x: &Value) -> Slot {
        match x {
            Value::Symbol(name) => {
                let name = name.clone();
                self.compile_symbol(opts, &name)
            }
            Value::Tuple(t) => {
                self.set_source_mapping(t);
                if t.bracketed {
                    let slots = self.toslots(&t.elements);
                    self.compile_constructor(opts, slots, Op::MakeBracketTuple)
                } else if t.elements.is_empty() {
                    cslot(x)
                } else {
                    self.compile_form(opts, &t.elements)
                }
            }
            Value::Array(elements) => {
                let elements = elements.borrow().clone();
                let slots = self.toslots(&elements);
                self.compile_constructor(opts, slots, Op::MakeArray)
            }
            Value::Struct(s) => {
                let slots = self.toslotskv(s.iter().map(|(k, v)| (k.clone(), v.clone())));
                self.compile_constructor(opts, slots, Op::MakeStruct)
            }
            Value::Table(t) => {
                let entries = t.borrow().entries.clone();
                let slots = self.toslotskv(entries.into_iter());
                self.compile_constructor(opts, slots, Op::MakeTable)
            }
            // Everything else is an atom.
            _ => cslot(x),
        }
    }

    // A paren tuple: special form or call.
    fn compile_form(&mut self, opts: &CompileOpts, elements: &[Value]) -> Slot {
        if let Value::Symbol(name) = &elements[0] {
            if let Some(handler) = crate::specials::lookup_special(name) {
                return handler(self, opts, &elements[1..]);
            }
        }
        self.compile_call(opts, elements)
    }

    fn compile_symbol(&mut self, opts: &CompileOpts, name: &Rc<str>) -> Slot {
        if is_multisym(name) {
            self.compile_multisym(opts, name)
        } else {
            self.resolve(name)
        }
    }

    // `a.b:c` sugar: resolve the head, then a GET per segment.
    fn compile_multisym(&mut self, _opts: &CompileOpts, name: &str) -> Slot {
        let parts = split_multisym(name);
        let (head, rest) = match parts.split_first() {
            Some(split) => split,
            None => return self.cerror(format!("invalid symbol {}", name)),
        };
        let mut current = self.resolve(&head.1);
        for (sep, text) in rest {
            if text.is_empty() {
                return self.cerror(format!("invalid symbol {}", name));
            }
            let key = cslot(&segment_value(*sep, text));
            let target = self.farslot();
            self.emit_sss(Op::Get, &target, &current, &key, true);
            self.freeslot(&current);
            current = target;
        }
        current
    }

    // ------------------------------------------------------------------
    // Calls and constructors

    pub(crate) fn toslots(&mut self, values: &[Value]) -> Vec<Slot> {
        let sub = CompileOpts::new();
        values
            .iter()
            .map(|v| self.compile_value(&sub, v))
            .collect()
    }

    pub(crate) fn toslotskv(
        &mut self,
        entries: impl Iterator<Item = (Value, Value)>,
    ) -> Vec<Slot> {
        let sub = CompileOpts::new();
        let mut slots = Vec::new();
        for (k, v) in entries {
            slots.push(self.compile_value(&sub, &k));
            slots.push(self.compile_value(&sub, &v));
        }
        slots
    }

    // Feed argument slots to the run-time argument stack. Spliced
    // slots expand through PUSH_ARRAY.
    pub(crate) fn pushslots(&mut self, slots: &[Slot]) {
        for slot in slots {
            if slot.flags.contains(SlotFlag::Spliced) {
                self.emit_s(Op::PushArray, slot, false);
            } else {
                self.emit_s(Op::Push, slot, false);
            }
        }
    }

    pub(crate) fn compile_call(&mut self, opts: &CompileOpts, elements: &[Value]) -> Slot {
        let sub = CompileOpts::new();
        let fun = self.compile_value(&sub, &elements[0]);
        let slots = self.toslots(&elements[1..]);
        let spliced = slots.iter().any(|s| s.flags.contains(SlotFlag::Spliced));

        // A constant callee with a recognised tag may collapse into a
        // primitive instruction instead of a call.
        let mut ret = None;
        if !spliced && fun.is_constant() {
            let tag = match fun.constant.as_ref() {
                Some(Value::Function(def)) => def.tag,
                Some(Value::CFunction(cfun)) => cfun.tag,
                _ => None,
            };
            if let Some(tag) = tag {
                if let Some(inline) = crate::inliner::lookup(tag) {
                    if (inline.check)(opts, &slots) {
                        ret = Some((inline.emit)(self, opts, &slots));
                    }
                }
            }
        }

        let ret = match ret {
            Some(slot) => slot,
            None => {
                self.pushslots(&slots);
                if opts.is_tail() {
                    self.emit_s(Op::TailCall, &fun, false);
                    let mut slot = Slot::sentinel();
                    slot.flags |= SlotFlag::Returned;
                    slot
                } else {
                    let target = self.gettarget(opts);
                    self.emit_ss(Op::Call, &target, &fun, true);
                    target
                }
            }
        };

        self.freeslots(&slots);
        self.freeslot(&fun);
        ret
    }

    // MAKE_* over pushed element slots. All-constant immutable
    // constructions fold to a compile-time value instead.
    pub(crate) fn compile_constructor(
        &mut self,
        opts: &CompileOpts,
        slots: Vec<Slot>,
        op: Op,
    ) -> Slot {
        if self.failed() {
            return Slot::sentinel();
        }
        if let Some(folded) = fold_constructor(op, &slots) {
            return cslot(&folded);
        }
        self.pushslots(&slots);
        self.freeslots(&slots);
        let target = self.gettarget(opts);
        self.emit_s(op, &target, true);
        target
    }

    // Emit the return for a tail position, unless one already exists.
    pub(crate) fn do_return(&mut self, slot: Slot) -> Slot {
        if self.failed() || slot.flags.contains(SlotFlag::Returned) {
            return slot;
        }
        let mut slot = slot;
        if slot.is_constant() && matches!(slot.constant, Some(Value::Nil)) {
            self.emit(word(Op::ReturnNil));
        } else {
            self.emit_s(Op::Return, &slot, false);
        }
        slot.flags |= SlotFlag::Returned;
        slot
    }

    // ------------------------------------------------------------------
    // Sealing a function

    // Close the current function scope into a definition. Arity and
    // flags are the caller's to fill in; the enclosing scope learns a
    // closure was made under it.
    pub(crate) fn pop_funcdef(&mut self) -> FuncDef {
        let scope = self.scopes.pop().expect("no function scope to pop");
        debug_assert!(scope.flags.contains(ScopeFlag::Function));
        let bytecode = self.buffer.split_off(scope.bytecode_start);
        let source_map = self.mapbuffer.split_off(scope.bytecode_start);
        if let Some(parent) = self.scopes.last_mut() {
            parent.flags |= ScopeFlag::Closure;
        }
        FuncDef {
            bytecode,
            constants: scope.consts,
            defs: scope.defs,
            environments: scope.envs,
            slot_count: (scope.ra.max() + 1) as u32,
            arity: 0,
            min_arity: 0,
            max_arity: 0,
            flags: BitFlags::empty(),
            tag: None,
            name: scope.name,
            source: Some(self.source.clone()),
            source_map: Some(source_map),
        }
    }
}


// ----------------------------------------------------------------------
// Multisym handling

// A symbol is sugar for a GET chain when a separator appears strictly
// inside it.
fn is_multisym(name: &str) -> bool {
    let bytes = name.as_bytes();
    if bytes.len() < 3 {
        return false;
    }
    bytes[1..bytes.len() - 1]
        .iter()
        .any(|&b| b == b'.' || b == b':')
}

// Split "a.b:c" into [('_', "a"), ('.', "b"), (':', "c")].
fn split_multisym(name: &str) -> Vec<(char, String)> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut sep = '_';
    for (i, ch) in name.chars().enumerate() {
        if (ch == '.' || ch == ':') && i > 0 {
            parts.push((sep, std::mem::take(&mut current)));
            sep = ch;
        } else {
            current.push(ch);
        }
    }
    parts.push((sep, current));
    parts
}

// Keys in a GET chain: `:` segments and plain segments become
// keywords, numeric segments index numerically.
fn segment_value(sep: char, text: &str) -> Value {
    if sep == ':' {
        return Value::keyword(text);
    }
    if let Ok(i) = text.parse::<i32>() {
        return Value::Integer(i);
    }
    if let Ok(n) = text.parse::<f64>() {
        return Value::Number(n);
    }
    Value::keyword(text)
}


// Immutable all-constant constructions become constants themselves.
fn fold_constructor(op: Op, slots: &[Slot]) -> Option<Value> {
    let foldable = matches!(op, Op::MakeTuple | Op::MakeBracketTuple | Op::MakeStruct);
    if !foldable {
        return None;
    }
    if !slots
        .iter()
        .all(|s| s.is_constant() && !s.flags.contains(SlotFlag::Spliced))
    {
        return None;
    }
    let consts: Vec<Value> = slots
        .iter()
        .map(|s| s.constant.clone().expect("constant slot without value"))
        .collect();
    match op {
        Op::MakeTuple => Some(Value::tuple(consts)),
        Op::MakeBracketTuple => Some(Value::bracket_tuple(consts)),
        Op::MakeStruct => {
            let mut builder = crate::structs::StructBuilder::begin(consts.len() / 2);
            let mut pairs = consts.chunks_exact(2);
            for pair in &mut pairs {
                builder.put(pair[0].clone(), pair[1].clone());
            }
            Some(Value::Struct(builder.end()))
        }
        _ => None,
    }
}


// ----------------------------------------------------------------------
// The public entry point

// Compile one top-level form against an environment. The result is the
// definition of a zero-argument thunk, or the first error with the
// position it was noticed at.
pub fn compile(
    value: &Value,
    env: &mut Environment,
    source: &str,
) -> Result<Rc<FuncDef>, CompileError> {
    let mut c = Compiler::new(env, source);
    c.push_scope(ScopeFlag::Function | ScopeFlag::Top, None);
    let opts = CompileOpts::tail();
    let _ = c.compile_value(&opts, value);
    let def = c.pop_funcdef();
    match c.error {
        Some(error) => Err(error),
        None => Ok(Rc::new(def)),
    }
}
