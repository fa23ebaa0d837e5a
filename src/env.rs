// The global environment: what top-level symbols resolve against.
//
// Each entry either carries a compile-time value (the pre-registered
// builtins; these resolve to constants, which is what lets the
// optimizer see their tags) or a "ref", a one-element array cell that
// the emitted program reads and writes at runtime. Top-level `def` and
// `var` both install refs, since their values don't exist until the
// compiled code runs; `def` entries just refuse `set`.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::funcdef::FunTag;
use crate::structs::Struct;
use crate::value::{CFun, Value};


#[derive(Clone, Debug)]
pub struct EnvEntry {
    pub value: Option<Value>,
    pub ref_cell: Option<Value>,
    pub mutable: bool,
    pub meta: Option<Rc<Struct>>,
}

impl EnvEntry {
    pub fn of_value(value: Value) -> EnvEntry {
        EnvEntry {
            value: Some(value),
            ref_cell: None,
            mutable: false,
            meta: None,
        }
    }

    // A fresh nil-holding cell, for bindings whose value only exists at
    // runtime.
    pub fn of_ref(mutable: bool, meta: Option<Rc<Struct>>) -> EnvEntry {
        let cell = Value::Array(Rc::new(RefCell::new(vec![Value::Nil])));
        EnvEntry {
            value: None,
            ref_cell: Some(cell),
            mutable,
            meta,
        }
    }
}


#[derive(Debug, Default)]
pub struct Environment {
    bindings: HashMap<Rc<str>, EnvEntry>,
}

impl Environment {
    pub fn new() -> Environment {
        Environment {
            bindings: HashMap::new(),
        }
    }

    // An environment with the tagged builtins bound, which is what the
    // optimizer table keys off. The interpreter swaps the placeholder
    // natives for real ones at startup; the tags are what matter here.
    pub fn core() -> Environment {
        let mut env = Environment::new();
        for &(name, tag) in CORE_BUILTINS {
            env.builtin(name, tag);
        }
        env
    }

    pub fn get(&self, name: &str) -> Option<&EnvEntry> {
        self.bindings.get(name)
    }

    pub fn define(&mut self, name: &str, entry: EnvEntry) {
        self.bindings.insert(Rc::from(name), entry);
    }

    pub fn define_value(&mut self, name: &str, value: Value) {
        self.define(name, EnvEntry::of_value(value));
    }

    fn builtin(&mut self, name: &str, tag: FunTag) {
        let cfun = Value::CFunction(Rc::new(CFun {
            name: Rc::from(name),
            tag: Some(tag),
        }));
        self.define_value(name, cfun);
    }
}


const CORE_BUILTINS: &[(&str, FunTag)] = &[
    ("+", FunTag::Add),
    ("-", FunTag::Subtract),
    ("*", FunTag::Multiply),
    ("/", FunTag::Divide),
    ("band", FunTag::Band),
    ("bor", FunTag::Bor),
    ("bxor", FunTag::Bxor),
    ("bnot", FunTag::Bnot),
    ("blshift", FunTag::ShiftLeft),
    ("brshift", FunTag::ShiftRight),
    ("brushift", FunTag::ShiftRightUnsigned),
    ("=", FunTag::Eq),
    ("not=", FunTag::Neq),
    ("<", FunTag::Lt),
    ("<=", FunTag::Lte),
    (">", FunTag::Gt),
    (">=", FunTag::Gte),
    ("get", FunTag::Get),
    ("in", FunTag::In),
    ("put", FunTag::Put),
    ("length", FunTag::Length),
    ("yield", FunTag::Yield),
    ("resume", FunTag::Resume),
    ("error", FunTag::Error),
    ("debug", FunTag::Debug),
];
