// tern: a featherweight embeddable lisp.
//
// Copyright (C) 2020  Brandon Lewis
//
// This program is free software: you can redistribute it and/or
// modify it under the terms of the GNU Lesser General Public License
// as published by the Free Software Foundation, either version 3 of
// the License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public
// License along with this program.  If not, see
// <https://www.gnu.org/licenses/>.
//
// This crate is the compiler core: it turns parsed values into
// function definitions the interpreter can run. The parser in front of
// it and the interpreter behind it live elsewhere; the seams are
// `Value` on the way in and `FuncDef` on the way out.

#[macro_use]
extern crate lazy_static;

pub mod compiler;
pub mod disasm;
mod emit;
pub mod env;
pub mod funcdef;
mod inliner;
pub mod opcode;
pub mod regalloc;
mod specials;
pub mod structs;
pub mod value;
