// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The parser's output: one item per source line, with every operand
//! still carrying symbolic label references rather than resolved
//! addresses. [`crate::assemble`] walks these items once, assigning
//! label addresses and emitting bytes together, and patches any
//! forward references once the whole program has been walked.

use frost64_core::opcode::Opcode;
use frost64_core::operand::Size;
use frost64_core::register::RegisterId;

use crate::error::SourceLocation;

/// A literal value or a symbolic reference resolved at link time.
#[derive(Clone, Debug, PartialEq)]
pub enum ImmValue {
    Literal(u64),
    Label(String),
    SubLabel(String),
}

#[derive(Clone, Debug, PartialEq)]
pub enum OffsetTerm {
    Register { reg: RegisterId, negative: bool },
    Immediate(ImmValue),
}

#[derive(Clone, Debug, PartialEq)]
pub enum ParsedOperand {
    Register(RegisterId),
    Immediate { size: Size, value: ImmValue },
    /// A purely absolute address with no base/index register, e.g. `[0x1000]`.
    Memory(ImmValue),
    /// `[base + index + offset]`. Base and index are always plain
    /// registers: the grammar only ever routes constants and labels into
    /// the offset slot (see `parser::parse_memory_operand`).
    Complex {
        size: Size,
        base: Option<RegisterId>,
        index: Option<RegisterId>,
        offset: Option<OffsetTerm>,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct ParsedInstruction {
    pub opcode: Opcode,
    pub mnemonic: String,
    pub operands: Vec<ParsedOperand>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum DataValue {
    Number(Size, ImmValue),
    Bytes(Vec<u8>),
}

#[derive(Clone, Debug, PartialEq)]
pub enum Item {
    Instruction(ParsedInstruction),
    Data(Vec<DataValue>),
    Org(u64),
    Align(u64),
    LabelDef(String),
    SubLabelDef(String),
}

pub struct Statement {
    pub item: Item,
    pub location: SourceLocation,
}
