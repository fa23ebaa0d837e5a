// Textual instruction listings, for the repl's disassemble builtin and
// for tests that assert on emitted code.

use std::fmt::Write;

use crate::funcdef::FuncDef;
use crate::opcode::{
    field_a, field_a_wide, field_b, field_b_wide, field_c, field_imm16, field_imm16u,
    field_imm24, field_imm8, opcode, Op, Shape,
};


// One instruction word, rendered as "name operands...". Words that
// don't decode (a stray break placeholder, garbage) render as raw hex.
pub fn describe(word: u32) -> String {
    let op = match opcode(word) {
        Some(op) => op,
        None => return format!("???? {:08x}", word),
    };
    let name = op.as_ref();
    match op.shape() {
        Shape::Zero => name.to_string(),
        Shape::S => format!("{} {}", name, field_a_wide(word)),
        Shape::L => format!("{} {}", name, field_imm24(word)),
        Shape::SS => format!("{} {} {}", name, field_a(word), field_b_wide(word)),
        Shape::SSS => format!(
            "{} {} {} {}",
            name,
            field_a(word),
            field_b(word),
            field_c(word)
        ),
        Shape::SI => format!("{} {} {}", name, field_a(word), field_imm16(word)),
        Shape::SU => format!("{} {} {}", name, field_a(word), field_imm16u(word)),
        Shape::SSI => format!(
            "{} {} {} {}",
            name,
            field_a(word),
            field_b(word),
            field_imm8(word)
        ),
        Shape::SSU => format!(
            "{} {} {} {}",
            name,
            field_a(word),
            field_b(word),
            field_c(word)
        ),
        Shape::SL => format!("{} {} {}", name, field_a(word), field_imm16(word)),
    }
}

// A whole definition: header, instructions with source positions,
// nested definitions indented beneath it.
pub fn listing(def: &FuncDef) -> String {
    let mut out = String::new();
    render(def, 0, &mut out);
    out
}

fn render(def: &FuncDef, depth: usize, out: &mut String) {
    let pad = "  ".repeat(depth);
    let name = def.name.as_deref().unwrap_or("<anonymous>");
    let _ = writeln!(
        out,
        "{}{} (arity {}, slots {}, constants {})",
        pad,
        name,
        def.arity,
        def.slot_count,
        def.constants.len()
    );
    for (i, &word) in def.bytecode.iter().enumerate() {
        let _ = write!(out, "{}  {:04}  {:<28}", pad, i, describe(word));
        if let Some(map) = &def.source_map {
            let mapping = map[i];
            if mapping.line >= 0 {
                let _ = write!(out, "; {}:{}", mapping.line, mapping.column);
            }
        }
        let _ = writeln!(out);
    }
    for inner in def.defs.iter() {
        render(inner, depth + 1, out);
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile;
    use crate::env::Environment;
    use crate::value::Value;

    #[test]
    fn test_describe_shapes() {
        let word = crate::opcode::word_sss(Op::Add, 2, 0, 1);
        assert_eq!(describe(word), "add 2 0 1");
        let word = crate::opcode::word_si(Op::LoadInteger, 0, -7);
        assert_eq!(describe(word), "load-integer 0 -7");
        let word = crate::opcode::word(Op::ReturnNil);
        assert_eq!(describe(word), "return-nil");
        assert!(describe(0xFFFF_FFFF).starts_with("????"));
    }

    #[test]
    fn test_listing_includes_nested_defs() {
        let mut env = Environment::core();
        let source = Value::tuple(vec![
            Value::symbol("fn"),
            Value::symbol("double"),
            Value::bracket_tuple(vec![Value::symbol("x")]),
            Value::tuple(vec![
                Value::symbol("+"),
                Value::symbol("x"),
                Value::symbol("x"),
            ]),
        ]);
        let def = compile(&source, &mut env, "disasm-test").unwrap();
        let text = listing(&def);
        assert!(text.contains("closure"));
        assert!(text.contains("double"));
        assert!(text.contains("add"));
        assert!(text.contains("return"));
    }
}
