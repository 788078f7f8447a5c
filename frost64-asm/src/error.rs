// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Diagnostics for every stage of the assembler pipeline, each one
//! carrying the source file and line it was raised against.

use std::fmt;
use std::path::PathBuf;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceLocation {
    pub file: String,
    pub line: usize,
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AssembleError {
    #[error("{0}: cannot open included file {1}: {2}")]
    Include(SourceLocation, PathBuf, std::io::Error),
    #[error("{0}: include nesting too deep (possible %include cycle)")]
    IncludeDepth(SourceLocation),
    #[error("{0}: unterminated string literal")]
    UnterminatedString(SourceLocation),
    #[error("{0}: unterminated character literal")]
    UnterminatedChar(SourceLocation),
    #[error("{0}: invalid escape sequence '\\{1}'")]
    BadEscape(SourceLocation, char),
    #[error("{0}: invalid numeric literal '{1}'")]
    BadNumber(SourceLocation, String),
    #[error("{0}: unrecognised token '{1}'")]
    UnknownToken(SourceLocation, String),
    #[error("{0}: unexpected token, expected {1}")]
    UnexpectedToken(SourceLocation, &'static str),
    #[error("{0}: unknown mnemonic '{1}'")]
    UnknownMnemonic(SourceLocation, String),
    #[error("{0}: unknown directive '{1}'")]
    UnknownDirective(SourceLocation, String),
    #[error("{0}: {1} takes {2} operand(s), got {3}")]
    WrongOperandCount(SourceLocation, String, u8, usize),
    #[error("{0}: a label address is always qword-sized, drop the size prefix")]
    LabelSizePrefix(SourceLocation),
    #[error("{0}: complex operand cannot hold more than one base and one index register")]
    TooManyRegisters(SourceLocation),
    #[error("{0}: a negative register offset cannot combine with another offset term")]
    ConflictingOffset(SourceLocation),
    #[error("{0}: empty memory operand '[]'")]
    EmptyMemoryOperand(SourceLocation),
    #[error("{0}: sublabel '.{1}' used before any top-level label was defined")]
    SublabelWithoutParent(SourceLocation, String),
    #[error("undefined label '{0}'")]
    UndefinedLabel(String),
    #[error("{0}: 'org' target {1:#x} is behind the current position {2:#x}")]
    OrgMovesBackward(SourceLocation, u64, u64),
    #[error("{0}: 'align' boundary must be a non-zero power of two, got {1}")]
    BadAlignment(SourceLocation, u64),
    #[error("{0}: directive '{1}' needs at least one operand")]
    EmptyDirective(SourceLocation, String),
}
