// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The link pass: walks parsed statements once, assigning every label an
//! address as it is encountered and emitting bytes as it goes. A forward
//! reference to a label not yet seen is encoded as
//! [`instruction::LABEL_PLACEHOLDER`] and recorded in a fixup list,
//! patched once the whole program has been walked and every label's
//! address is known.

use std::collections::HashMap;

use frost64_core::instruction::{self, Instruction, LABEL_PLACEHOLDER};
use frost64_core::operand::{ComplexOperand, ComplexValue, Immediate, OffsetValue, Operand};

use crate::ast::{DataValue, ImmValue, Item, OffsetTerm, ParsedInstruction, ParsedOperand, Statement};
use crate::error::AssembleError;

/// Which part of an instruction's encoded body a pending fixup lands in,
/// relative to the start of the operand's own body bytes.
enum Slot {
    /// The operand's entire body is the label value (register/memory/plain
    /// immediate operands, or the base/index slot of a complex one).
    Whole,
    Offset,
}

pub fn link(statements: &[Statement]) -> Result<Vec<u8>, AssembleError> {
    let mut symbols: HashMap<String, u64> = HashMap::new();
    let mut cur_label: Option<String> = None;
    let mut output: Vec<u8> = Vec::new();
    let mut fixups: Vec<(usize, String)> = Vec::new();

    for stmt in statements {
        match &stmt.item {
            Item::LabelDef(name) => {
                symbols.insert(name.clone(), output.len() as u64);
                cur_label = Some(name.clone());
            }
            Item::SubLabelDef(name) => {
                let parent = cur_label
                    .as_ref()
                    .ok_or_else(|| AssembleError::SublabelWithoutParent(stmt.location.clone(), name.clone()))?;
                symbols.insert(qualify(parent, name), output.len() as u64);
            }
            Item::Org(target) => {
                if (*target as usize) < output.len() {
                    return Err(AssembleError::OrgMovesBackward(stmt.location.clone(), *target, output.len() as u64));
                }
                output.resize(*target as usize, 0);
            }
            Item::Align(boundary) => {
                if *boundary == 0 || !boundary.is_power_of_two() {
                    return Err(AssembleError::BadAlignment(stmt.location.clone(), *boundary));
                }
                let rem = output.len() as u64 % boundary;
                if rem != 0 {
                    output.resize(output.len() + (boundary - rem) as usize, 0);
                }
            }
            Item::Data(values) => emit_data(values, &cur_label, &mut output, &mut fixups),
            Item::Instruction(instr) => emit_instruction(instr, &cur_label, &mut output, &mut fixups),
        }
    }

    for (offset, name) in fixups {
        let value = symbols.get(&name).ok_or_else(|| AssembleError::UndefinedLabel(name.clone()))?;
        output[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }
    Ok(output)
}

fn qualify(parent: &str, name: &str) -> String {
    format!("{parent}.{name}")
}

/// Resolves an `ImmValue` to a 64-bit value, returning the fully-qualified
/// label name to patch later if the value isn't known yet (it never is,
/// by construction: fixups are always recorded and patched at the end,
/// even for backward references, so there is exactly one code path).
fn resolve_imm(value: &ImmValue, cur_label: &Option<String>) -> (u64, Option<String>) {
    match value {
        ImmValue::Literal(v) => (*v, None),
        ImmValue::Label(name) => (LABEL_PLACEHOLDER, Some(name.clone())),
        ImmValue::SubLabel(name) => {
            let full = cur_label.as_ref().map(|p| qualify(p, name)).unwrap_or_else(|| name.clone());
            (LABEL_PLACEHOLDER, Some(full))
        }
    }
}

fn build_operand(po: &ParsedOperand, cur_label: &Option<String>) -> (Operand, Vec<(Slot, String)>) {
    match po {
        ParsedOperand::Register(r) => (Operand::Register(*r), Vec::new()),
        ParsedOperand::Immediate { size, value } => {
            let (v, label) = resolve_imm(value, cur_label);
            (Operand::Immediate(Immediate::from_u64(*size, v)), label.into_iter().map(|n| (Slot::Whole, n)).collect())
        }
        ParsedOperand::Memory(value) => {
            let (v, label) = resolve_imm(value, cur_label);
            (Operand::Memory(v), label.into_iter().map(|n| (Slot::Whole, n)).collect())
        }
        ParsedOperand::Complex { size, base, index, offset } => {
            let mut fixups = Vec::new();
            let offset = offset.as_ref().map(|term| match term {
                OffsetTerm::Register { reg, negative } => OffsetValue::Register { reg: *reg, negative: *negative },
                OffsetTerm::Immediate(value) => {
                    let (v, label) = resolve_imm(value, cur_label);
                    if let Some(name) = label {
                        fixups.push((Slot::Offset, name));
                    }
                    OffsetValue::Immediate(Immediate::Qword(v))
                }
            });
            let operand = Operand::Complex(ComplexOperand {
                size: *size,
                base: base.map(ComplexValue::Register),
                index: index.map(ComplexValue::Register),
                offset,
            });
            (operand, fixups)
        }
    }
}

fn emit_instruction(parsed: &ParsedInstruction, cur_label: &Option<String>, output: &mut Vec<u8>, fixups: &mut Vec<(usize, String)>) {
    let mut operand_fixups = Vec::with_capacity(parsed.operands.len());
    let mut operands = Vec::with_capacity(parsed.operands.len());
    for po in &parsed.operands {
        let (operand, slots) = build_operand(po, cur_label);
        operands.push(operand);
        operand_fixups.push(slots);
    }

    let instr_start = output.len();
    let encoded = instruction::encode(&Instruction { opcode: parsed.opcode, operands: operands.clone() });

    for (i, slots) in operand_fixups.into_iter().enumerate() {
        let body_start = instr_start + encoded.operand_body_offsets[i];
        for (slot, name) in slots {
            let sub_offset = match (&operands[i], slot) {
                (Operand::Complex(c), Slot::Offset) => complex_slot_width(c.base) + complex_slot_width(c.index),
                _ => 0,
            };
            fixups.push((body_start + sub_offset, name));
        }
    }
    output.extend_from_slice(&encoded.bytes);
}

fn complex_slot_width(slot: Option<ComplexValue>) -> usize {
    match slot {
        None => 0,
        Some(ComplexValue::Register(_)) => 1,
        Some(ComplexValue::Immediate(imm)) => imm.size().bytes(),
    }
}

fn emit_data(values: &[DataValue], cur_label: &Option<String>, output: &mut Vec<u8>, fixups: &mut Vec<(usize, String)>) {
    for value in values {
        match value {
            DataValue::Bytes(bytes) => output.extend_from_slice(bytes),
            DataValue::Number(size, imm) => {
                let (v, label) = resolve_imm(imm, cur_label);
                if let Some(name) = label {
                    fixups.push((output.len(), name));
                }
                let bytes = v.to_le_bytes();
                output.extend_from_slice(&bytes[..size.bytes()]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SourceLocation;
    use crate::lexer::lex_line;
    use crate::parser::parse_line;
    use frost64_core::instruction::SliceFetcher;

    fn assemble_source(src: &str) -> Vec<u8> {
        let loc = SourceLocation { file: "t.asm".into(), line: 1 };
        let mut statements = Vec::new();
        for line in src.lines() {
            let tokens = lex_line(line, &loc).unwrap();
            statements.extend(parse_line(&tokens, &loc).unwrap());
        }
        link(&statements).unwrap()
    }

    #[test]
    fn resolves_forward_jump_to_a_label() {
        let bytes = assemble_source("jmp skip\nhlt\nskip: nop\n");
        let mut fetcher = SliceFetcher::new(&bytes);
        let (jmp, jmp_len) = instruction::decode(&mut fetcher).unwrap();
        assert_eq!(jmp.opcode, frost64_core::opcode::Opcode::Jmp);
        match jmp.operands[0] {
            Operand::Immediate(imm) => assert_eq!(imm.as_u64(), (jmp_len + 1) as u64),
            other => panic!("expected immediate target, got {other:?}"),
        }
    }

    #[test]
    fn resolves_backward_jump_to_a_label() {
        let bytes = assemble_source("loop: nop\njmp loop\n");
        let mut fetcher = SliceFetcher::new(&bytes);
        let (_, nop_len) = instruction::decode(&mut fetcher).unwrap();
        let (jmp, _) = instruction::decode(&mut fetcher).unwrap();
        match jmp.operands[0] {
            Operand::Immediate(imm) => assert_eq!(imm.as_u64(), 0),
            other => panic!("expected immediate target, got {other:?}"),
        }
        assert_eq!(nop_len, 1);
    }

    #[test]
    fn undefined_label_is_rejected() {
        let loc = SourceLocation { file: "t.asm".into(), line: 1 };
        let tokens = lex_line("jmp nowhere", &loc).unwrap();
        let statements = parse_line(&tokens, &loc).unwrap();
        assert!(matches!(link(&statements), Err(AssembleError::UndefinedLabel(_))));
    }

    #[test]
    fn org_pads_with_zero_bytes() {
        let bytes = assemble_source("db 1\norg 4\ndb 2\n");
        assert_eq!(bytes, vec![1, 0, 0, 0, 2]);
    }

    #[test]
    fn align_pads_to_boundary() {
        let bytes = assemble_source("db 1\nalign 4\ndb 2\n");
        assert_eq!(bytes, vec![1, 0, 0, 0, 2]);
    }

    #[test]
    fn sublabel_resolves_within_its_parent() {
        let bytes = assemble_source("outer: nop\n.inner: nop\njmp .inner\n");
        let mut fetcher = SliceFetcher::new(&bytes);
        let (_, _) = instruction::decode(&mut fetcher).unwrap();
        let (_, _) = instruction::decode(&mut fetcher).unwrap();
        let (jmp, _) = instruction::decode(&mut fetcher).unwrap();
        match jmp.operands[0] {
            Operand::Immediate(imm) => assert_eq!(imm.as_u64(), 1),
            other => panic!("expected immediate target, got {other:?}"),
        }
    }
}
