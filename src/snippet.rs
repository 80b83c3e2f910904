//! Formats a small window of instructions around an index with a caret
//! marker on the centered line. Pure and allocation-light, mirroring the
//! teacher's small single-purpose formatting helpers.

use crate::bytecode::Instruction;

/// Renders `instructions[center.saturating_sub(radius)..=center+radius]`
/// (clamped to the slice bounds) as opcode/operand text lines, prefixing the
/// centered line with `>` and every other line with matching indentation.
/// Empty input yields an empty string; no trailing newline.
pub fn build_snippet(instructions: &[Instruction], center: usize, radius: usize) -> String {
    if instructions.is_empty() {
        return String::new();
    }

    let start = center.saturating_sub(radius);
    let end = (center + radius + 1).min(instructions.len());
    if start >= end {
        return String::new();
    }

    let mut lines = Vec::with_capacity(end - start);
    for idx in start..end {
        let marker = if idx == center { "> " } else { "  " };
        lines.push(format!("{marker}{}", format_instruction(&instructions[idx])));
    }
    lines.join("\n")
}

fn format_instruction(instr: &Instruction) -> String {
    format!("IL_{:04x}: {}", instr.offset, operand_text(instr))
}

fn operand_text(instr: &Instruction) -> String {
    use crate::bytecode::Operand;
    let mnemonic = mnemonic_of(instr);
    match &instr.operand {
        Operand::Method(m) => format!("{mnemonic} {m}"),
        Operand::Field(f) => format!("{mnemonic} {}.{}", f.declaring_type, f.name),
        Operand::Type(t) => format!("{mnemonic} {}", t.full_name),
        Operand::Token(_) => format!("{mnemonic} <token>"),
        Operand::Local(i) => format!("{mnemonic} V_{i}"),
        Operand::Arg(i) => format!("{mnemonic} arg_{i}"),
        Operand::String(s) => format!("{mnemonic} \"{s}\""),
        Operand::Int(i) => format!("{mnemonic} {i}"),
        Operand::SByte(i) => format!("{mnemonic} {i}"),
        Operand::None => mnemonic.to_string(),
    }
}

fn mnemonic_of(instr: &Instruction) -> &'static str {
    use crate::bytecode::Opcode;
    match &instr.opcode {
        Opcode::Call => "call",
        Opcode::CallVirt => "callvirt",
        Opcode::NewObj => "newobj",
        Opcode::LdStr => "ldstr",
        Opcode::LdcI4 => "ldc.i4",
        Opcode::LdNull => "ldnull",
        Opcode::LdLoc(_) => "ldloc",
        Opcode::StLoc(_) => "stloc",
        Opcode::LdArg(_) => "ldarg",
        Opcode::StArg(_) => "starg",
        Opcode::LdFld(_) => "ldfld",
        Opcode::StFld(_) => "stfld",
        Opcode::LdsFld(_) => "ldsfld",
        Opcode::StsFld(_) => "stsfld",
        Opcode::LdFtn(_) => "ldftn",
        Opcode::LdToken(_) => "ldtoken",
        Opcode::Box => "box",
        Opcode::Dup => "dup",
        Opcode::Pop => "pop",
        Opcode::Nop => "nop",
        Opcode::Other { mnemonic, .. } => mnemonic,
    }
}
