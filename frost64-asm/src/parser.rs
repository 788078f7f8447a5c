// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Turns a line's tokens into zero or more [`ast::Item`]s. A line can
//! carry a label definition and an instruction together (`loop: inc r0`),
//! so parsing a line can yield more than one statement.

use frost64_core::opcode::Opcode;
use frost64_core::operand::Size;
use frost64_core::register::RegisterId;

use crate::ast::{DataValue, ImmValue, Item, OffsetTerm, ParsedInstruction, ParsedOperand, Statement};
use crate::error::{AssembleError, SourceLocation};
use crate::lexer::{SizeWord, Token};

pub fn parse_line(tokens: &[Token], loc: &SourceLocation) -> Result<Vec<Statement>, AssembleError> {
    let mut statements = Vec::new();
    let mut i = 0;
    while i < tokens.len() {
        match &tokens[i] {
            Token::LabelDef(name) => {
                statements.push(Statement { item: Item::LabelDef(name.clone()), location: loc.clone() });
                i += 1;
            }
            Token::SubLabelDef(name) => {
                statements.push(Statement { item: Item::SubLabelDef(name.clone()), location: loc.clone() });
                i += 1;
            }
            Token::Instruction(mnemonic) => {
                let (instr, consumed) = parse_instruction(mnemonic, &tokens[i + 1..], loc)?;
                statements.push(Statement { item: Item::Instruction(instr), location: loc.clone() });
                i += 1 + consumed;
            }
            Token::Directive(name) => {
                let (item, consumed) = parse_directive(name, &tokens[i + 1..], loc)?;
                statements.push(Statement { item, location: loc.clone() });
                i += 1 + consumed;
            }
            _ => return Err(AssembleError::UnexpectedToken(loc.clone(), "a label, directive or instruction")),
        }
    }
    Ok(statements)
}

fn opcode_for_mnemonic(mnemonic: &str) -> Option<Opcode> {
    use Opcode::*;
    Some(match mnemonic {
        "add" => Add, "mul" => Mul, "sub" => Sub, "div" => Div,
        "or" => Or, "xor" => Xor, "nor" => Nor, "and" => And, "nand" => Nand,
        "not" => Not, "cmp" => Cmp, "inc" => Inc, "dec" => Dec, "shl" => Shl, "shr" => Shr,
        "ret" => Ret, "call" => Call, "jmp" => Jmp, "jc" => Jc, "jnc" => Jnc, "jz" => Jz, "jnz" => Jnz,
        "syscall" => Syscall, "sysret" => Sysret, "enteruser" => Enteruser,
        "inb" => Inb, "inw" => Inw, "ind" => Ind, "inq" => Inq,
        "outb" => Outb, "outw" => Outw, "outd" => Outd, "outq" => Outq,
        "mov" => Mov, "nop" => Nop, "hlt" => Hlt, "push" => Push, "pop" => Pop,
        "pusha" => Pusha, "popa" => Popa, "int" => Int, "lidt" => Lidt, "iret" => Iret,
        _ => return None,
    })
}

fn parse_instruction(mnemonic: &str, rest: &[Token], loc: &SourceLocation) -> Result<(ParsedInstruction, usize), AssembleError> {
    let opcode = opcode_for_mnemonic(mnemonic).ok_or_else(|| AssembleError::UnknownMnemonic(loc.clone(), mnemonic.to_string()))?;
    let (operands, consumed) = parse_operand_list(rest, loc)?;
    if operands.len() != opcode.arg_count() as usize {
        return Err(AssembleError::WrongOperandCount(loc.clone(), mnemonic.to_string(), opcode.arg_count(), operands.len()));
    }
    Ok((ParsedInstruction { opcode, mnemonic: mnemonic.to_string(), operands }, consumed))
}

/// Parses operands until the token stream runs out (operands always run
/// to the end of the line; there is nothing after them to delimit).
fn parse_operand_list(tokens: &[Token], loc: &SourceLocation) -> Result<(Vec<ParsedOperand>, usize), AssembleError> {
    let mut operands = Vec::new();
    let mut i = 0;
    if tokens.is_empty() {
        return Ok((operands, 0));
    }
    loop {
        let (operand, consumed) = parse_operand(&tokens[i..], loc)?;
        operands.push(operand);
        i += consumed;
        match tokens.get(i) {
            Some(Token::Comma) => i += 1,
            None => break,
            Some(_) => return Err(AssembleError::UnexpectedToken(loc.clone(), "',' or end of line")),
        }
    }
    Ok((operands, i))
}

fn convert_size(word: SizeWord) -> Size {
    match word {
        SizeWord::Byte => Size::Byte,
        SizeWord::Word => Size::Word,
        SizeWord::Dword => Size::Dword,
        SizeWord::Qword => Size::Qword,
    }
}

fn infer_size(v: i128) -> Size {
    if v >= -(1i128 << 7) && v < (1i128 << 8) {
        Size::Byte
    } else if v >= -(1i128 << 15) && v < (1i128 << 16) {
        Size::Word
    } else if v >= -(1i128 << 31) && v < (1i128 << 32) {
        Size::Dword
    } else {
        Size::Qword
    }
}

fn register_id(name: &str) -> RegisterId {
    match name {
        "scp" => RegisterId::SCP,
        "sbp" => RegisterId::SBP,
        "stp" => RegisterId::STP,
        "sts" => RegisterId::STS,
        "ip" => RegisterId::IP,
        n if n.starts_with("cr") => RegisterId::control(n[2..].parse().expect("lexer only emits cr0..cr7")),
        n if n.starts_with('r') => RegisterId::R[n[1..].parse::<usize>().expect("lexer only emits r0..r15")],
        _ => unreachable!("lexer only emits known register spellings"),
    }
}

fn parse_operand(tokens: &[Token], loc: &SourceLocation) -> Result<(ParsedOperand, usize), AssembleError> {
    match tokens.first() {
        Some(Token::Register(name)) => Ok((ParsedOperand::Register(register_id(name)), 1)),
        Some(Token::Size(word)) => {
            let size = convert_size(*word);
            match tokens.get(1) {
                Some(Token::Number(v)) => Ok((ParsedOperand::Immediate { size, value: ImmValue::Literal(*v as u64) }, 2)),
                Some(Token::LabelRef(_)) | Some(Token::SubLabelRef(_)) => Err(AssembleError::LabelSizePrefix(loc.clone())),
                Some(Token::LBracket) => {
                    let (operand, consumed) = parse_memory_operand(&tokens[1..], size, loc)?;
                    Ok((operand, 1 + consumed))
                }
                _ => Err(AssembleError::UnexpectedToken(loc.clone(), "a number or memory operand after a size keyword")),
            }
        }
        Some(Token::Number(v)) => Ok((ParsedOperand::Immediate { size: infer_size(*v), value: ImmValue::Literal(*v as u64) }, 1)),
        Some(Token::LabelRef(name)) => Ok((ParsedOperand::Immediate { size: Size::Qword, value: ImmValue::Label(name.clone()) }, 1)),
        Some(Token::SubLabelRef(name)) => Ok((ParsedOperand::Immediate { size: Size::Qword, value: ImmValue::SubLabel(name.clone()) }, 1)),
        Some(Token::LBracket) => {
            let (operand, consumed) = parse_memory_operand(&tokens[1..], Size::Qword, loc)?;
            Ok((operand, 1 + consumed))
        }
        _ => Err(AssembleError::UnexpectedToken(loc.clone(), "an operand")),
    }
}

enum Term {
    Reg(RegisterId),
    Const(u64),
    Label(String),
    SubLabel(String),
}

/// Parses the contents of `[...]`, `tokens` starting right after the `[`.
/// Returns the operand and how many tokens (including the closing `]`)
/// were consumed.
fn parse_memory_operand(tokens: &[Token], size: Size, loc: &SourceLocation) -> Result<(ParsedOperand, usize), AssembleError> {
    let mut terms: Vec<(i8, Term)> = Vec::new();
    let mut i = 0;
    let mut pending_sign = 1i8;
    loop {
        match tokens.get(i) {
            Some(Token::RBracket) => { i += 1; break; }
            Some(Token::Operator('+')) => { pending_sign = 1; i += 1; }
            Some(Token::Operator('-')) => { pending_sign = -1; i += 1; }
            Some(Token::Register(name)) => {
                terms.push((pending_sign, Term::Reg(register_id(name))));
                pending_sign = 1;
                i += 1;
            }
            Some(Token::Number(v)) => {
                let mut value = *v;
                let mut consumed = 1;
                while tokens.get(i + consumed) == Some(&Token::Operator('*')) {
                    match tokens.get(i + consumed + 1) {
                        Some(Token::Number(factor)) => { value *= factor; consumed += 2; }
                        _ => return Err(AssembleError::UnexpectedToken(loc.clone(), "a number after '*'")),
                    }
                }
                terms.push((pending_sign, Term::Const(value as u64)));
                pending_sign = 1;
                i += consumed;
            }
            Some(Token::LabelRef(name)) => { terms.push((pending_sign, Term::Label(name.clone()))); pending_sign = 1; i += 1; }
            Some(Token::SubLabelRef(name)) => { terms.push((pending_sign, Term::SubLabel(name.clone()))); pending_sign = 1; i += 1; }
            _ => return Err(AssembleError::UnexpectedToken(loc.clone(), "a register, number or ']'")),
        }
    }

    if terms.is_empty() {
        return Err(AssembleError::EmptyMemoryOperand(loc.clone()));
    }

    let mut registers: Vec<(i8, RegisterId)> = Vec::new();
    let mut constant: u64 = 0;
    let mut symbol: Option<(i8, ImmValue)> = None;
    let mut has_offset_content = false;
    for (sign, term) in terms {
        match term {
            Term::Reg(reg) => registers.push((sign, reg)),
            Term::Const(v) => {
                constant = constant.wrapping_add(if sign < 0 { v.wrapping_neg() } else { v });
                has_offset_content = true;
            }
            Term::Label(name) => {
                if symbol.is_some() {
                    return Err(AssembleError::ConflictingOffset(loc.clone()));
                }
                symbol = Some((sign, ImmValue::Label(name)));
                has_offset_content = true;
            }
            Term::SubLabel(name) => {
                if symbol.is_some() {
                    return Err(AssembleError::ConflictingOffset(loc.clone()));
                }
                symbol = Some((sign, ImmValue::SubLabel(name)));
                has_offset_content = true;
            }
        }
    }
    if symbol.is_some() && constant != 0 {
        return Err(AssembleError::ConflictingOffset(loc.clone()));
    }

    if registers.is_empty() {
        let value = match symbol {
            Some((sign, ImmValue::Label(_) | ImmValue::SubLabel(_))) if sign < 0 => return Err(AssembleError::ConflictingOffset(loc.clone())),
            Some((_, v)) => v,
            None => ImmValue::Literal(constant),
        };
        return Ok((ParsedOperand::Memory(value), i));
    }

    let negative_registers = registers.iter().filter(|(sign, _)| *sign < 0).count();
    if negative_registers > 0 {
        if registers.len() != 1 || has_offset_content {
            return Err(AssembleError::ConflictingOffset(loc.clone()));
        }
        let (_, reg) = registers[0];
        return Ok((
            ParsedOperand::Complex { size, base: None, index: None, offset: Some(OffsetTerm::Register { reg, negative: true }) },
            i,
        ));
    }
    if registers.len() > 2 {
        return Err(AssembleError::TooManyRegisters(loc.clone()));
    }

    let base = registers.first().map(|(_, r)| *r);
    let index = registers.get(1).map(|(_, r)| *r);
    let offset = match symbol {
        Some((_, v)) => Some(OffsetTerm::Immediate(v)),
        None if constant != 0 => Some(OffsetTerm::Immediate(ImmValue::Literal(constant))),
        None => None,
    };
    Ok((ParsedOperand::Complex { size, base, index, offset }, i))
}

fn parse_directive(name: &str, rest: &[Token], loc: &SourceLocation) -> Result<(Item, usize), AssembleError> {
    match name {
        "org" => {
            let (value, consumed) = expect_number(rest, loc)?;
            Ok((Item::Org(value as u64), consumed))
        }
        "align" => {
            let (value, consumed) = expect_number(rest, loc)?;
            Ok((Item::Align(value as u64), consumed))
        }
        "ascii" | "asciiz" => {
            let mut bytes = match rest.first() {
                Some(Token::StringLit(b)) => b.clone(),
                _ => return Err(AssembleError::UnexpectedToken(loc.clone(), "a string literal")),
            };
            if name == "asciiz" {
                bytes.push(0);
            }
            Ok((Item::Data(vec![DataValue::Bytes(bytes)]), 1))
        }
        "db" | "dw" | "dd" | "dq" => {
            let size = match name {
                "db" => Size::Byte,
                "dw" => Size::Word,
                "dd" => Size::Dword,
                _ => Size::Qword,
            };
            let mut values = Vec::new();
            let mut i = 0;
            loop {
                match rest.get(i) {
                    Some(Token::StringLit(bytes)) => { values.push(DataValue::Bytes(bytes.clone())); i += 1; }
                    Some(Token::Number(v)) => { values.push(DataValue::Number(size, ImmValue::Literal(*v as u64))); i += 1; }
                    Some(Token::LabelRef(n)) => { values.push(DataValue::Number(Size::Qword, ImmValue::Label(n.clone()))); i += 1; }
                    Some(Token::SubLabelRef(n)) => { values.push(DataValue::Number(Size::Qword, ImmValue::SubLabel(n.clone()))); i += 1; }
                    _ => return Err(AssembleError::UnexpectedToken(loc.clone(), "a value")),
                }
                match rest.get(i) {
                    Some(Token::Comma) => i += 1,
                    _ => break,
                }
            }
            if values.is_empty() {
                return Err(AssembleError::EmptyDirective(loc.clone(), name.to_string()));
            }
            Ok((Item::Data(values), i))
        }
        _ => Err(AssembleError::UnknownDirective(loc.clone(), name.to_string())),
    }
}

fn expect_number(tokens: &[Token], loc: &SourceLocation) -> Result<(i128, usize), AssembleError> {
    match tokens.first() {
        Some(Token::Number(v)) => Ok((*v, 1)),
        _ => Err(AssembleError::UnexpectedToken(loc.clone(), "a number")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::lex_line;

    fn loc() -> SourceLocation {
        SourceLocation { file: "t.asm".into(), line: 1 }
    }

    #[test]
    fn parses_simple_instruction() {
        let tokens = lex_line("add r0, 5", &loc()).unwrap();
        let statements = parse_line(&tokens, &loc()).unwrap();
        assert_eq!(statements.len(), 1);
        match &statements[0].item {
            Item::Instruction(i) => {
                assert_eq!(i.opcode, Opcode::Add);
                assert_eq!(i.operands.len(), 2);
            }
            _ => panic!("expected instruction"),
        }
    }

    #[test]
    fn parses_label_and_instruction_on_one_line() {
        let tokens = lex_line("loop: inc r0", &loc()).unwrap();
        let statements = parse_line(&tokens, &loc()).unwrap();
        assert_eq!(statements.len(), 2);
        assert_eq!(statements[0].item, Item::LabelDef("loop".into()));
    }

    #[test]
    fn parses_complex_memory_operand_with_base_and_index() {
        let tokens = lex_line("mov r0, [r1 + r2 + 8]", &loc()).unwrap();
        let statements = parse_line(&tokens, &loc()).unwrap();
        match &statements[0].item {
            Item::Instruction(i) => match &i.operands[1] {
                ParsedOperand::Complex { base: Some(_), index: Some(_), offset: Some(_), .. } => {}
                other => panic!("unexpected operand {other:?}"),
            },
            _ => panic!("expected instruction"),
        }
    }

    #[test]
    fn parses_negative_register_offset() {
        let tokens = lex_line("mov [r1 - r2], r0", &loc()).unwrap();
        let statements = parse_line(&tokens, &loc()).unwrap();
        match &statements[0].item {
            Item::Instruction(i) => match &i.operands[0] {
                ParsedOperand::Complex { offset: Some(OffsetTerm::Register { negative: true, .. }), .. } => {}
                other => panic!("unexpected operand {other:?}"),
            },
            _ => panic!("expected instruction"),
        }
    }

    #[test]
    fn parses_absolute_memory_operand_as_memory_not_complex() {
        let tokens = lex_line("outb [0xE0000000], byte 0x41", &loc()).unwrap();
        let statements = parse_line(&tokens, &loc()).unwrap();
        match &statements[0].item {
            Item::Instruction(i) => {
                assert_eq!(i.opcode, Opcode::Outb);
                assert!(matches!(i.operands[0], ParsedOperand::Memory(_)));
                assert_eq!(i.operands[1], ParsedOperand::Immediate { size: Size::Byte, value: ImmValue::Literal(0x41) });
            }
            _ => panic!("expected instruction"),
        }
    }

    #[test]
    fn rejects_wrong_operand_count() {
        let tokens = lex_line("hlt r0", &loc()).unwrap();
        assert!(parse_line(&tokens, &loc()).is_err());
    }

    #[test]
    fn parses_db_directive_list() {
        let tokens = lex_line("db 1, 2, 3", &loc()).unwrap();
        let statements = parse_line(&tokens, &loc()).unwrap();
        assert_eq!(statements.len(), 1);
        match &statements[0].item {
            Item::Data(values) => assert_eq!(values.len(), 3),
            _ => panic!("expected data"),
        }
    }
}
