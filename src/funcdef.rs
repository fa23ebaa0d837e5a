// The compiled representation of a function: what the compiler hands
// to the interpreter and never touches again.

use std::rc::Rc;

use enumflags2::BitFlags;

use crate::value::Value;


#[derive(BitFlags, Copy, Clone, Debug, PartialEq)]
#[repr(u8)]
pub enum DefFlag {
    // Extra arguments collect into a tuple (or a struct, when
    // StructArg is also set).
    Vararg = 0b01,
    StructArg = 0b10,
}


// Identity tags for the builtins the optimizer recognises. A builtin
// keeps its tag through aliasing and rebinding because the tag lives on
// the function value, not on the name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunTag {
    Add,
    Subtract,
    Multiply,
    Divide,
    Band,
    Bor,
    Bxor,
    Bnot,
    ShiftLeft,
    ShiftRight,
    ShiftRightUnsigned,
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
    Get,
    In,
    Put,
    Length,
    Yield,
    Resume,
    Error,
    Debug,
}


// Source position of one emitted instruction. (-1, -1) when the input
// carried no position metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceMapping {
    pub line: i32,
    pub column: i32,
}

impl SourceMapping {
    pub fn none() -> SourceMapping {
        SourceMapping {
            line: -1,
            column: -1,
        }
    }
}


// Sentinel for max_arity when the parameter list is variadic.
pub const ARITY_UNBOUNDED: u32 = u32::MAX;

#[derive(Debug)]
pub struct FuncDef {
    pub bytecode: Vec<u32>,
    pub constants: Vec<Value>,
    pub defs: Vec<Rc<FuncDef>>,
    // Closure capture table. Entry 0 captures the enclosing function's
    // frame; entry n >= 1 copies entry n - 1 of the parent's own table.
    pub environments: Vec<u32>,
    pub slot_count: u32,
    // Declared positional parameter count, and the accepted range.
    pub arity: u32,
    pub min_arity: u32,
    pub max_arity: u32,
    pub flags: BitFlags<DefFlag>,
    pub tag: Option<FunTag>,
    pub name: Option<Rc<str>>,
    // File the function came from, for diagnostics.
    pub source: Option<Rc<str>>,
    // Parallel to bytecode when present.
    pub source_map: Option<Vec<SourceMapping>>,
}

impl FuncDef {
    pub fn is_vararg(&self) -> bool {
        self.flags.contains(DefFlag::Vararg)
    }
}
