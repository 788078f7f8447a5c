// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The Frost64 opcode space: a closed enum partitioned into four groups,
//! ALU (0x00-0x0F), control-flow (0x10-0x1F), I/O (0x20-0x2F) and other
//! (0x30-0x3F), each opcode carrying a fixed argument count.

use crate::exception::Exception;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpcodeGroup {
    Alu,
    ControlFlow,
    Io,
    Other,
}

macro_rules! opcodes {
    ($($name:ident = $value:expr => $group:ident, $argc:expr;)*) => {
        #[derive(Clone, Copy, Debug, PartialEq, Eq)]
        #[repr(u8)]
        pub enum Opcode {
            $($name = $value,)*
        }

        impl Opcode {
            pub const fn from_byte(byte: u8) -> Result<Opcode, Exception> {
                match byte {
                    $($value => Ok(Opcode::$name),)*
                    _ => Err(Exception::InvalidInstruction),
                }
            }

            pub const fn group(self) -> OpcodeGroup {
                match self {
                    $(Opcode::$name => OpcodeGroup::$group,)*
                }
            }

            pub const fn arg_count(self) -> u8 {
                match self {
                    $(Opcode::$name => $argc,)*
                }
            }
        }
    };
}

opcodes! {
    // ALU (0x00-0x0F)
    Add  = 0x00 => Alu, 2;
    Mul  = 0x01 => Alu, 2;
    Sub  = 0x02 => Alu, 2;
    Div  = 0x03 => Alu, 2;
    Or   = 0x04 => Alu, 2;
    Xor  = 0x05 => Alu, 2;
    Nor  = 0x06 => Alu, 2;
    And  = 0x07 => Alu, 2;
    Nand = 0x08 => Alu, 2;
    Not  = 0x09 => Alu, 1;
    Cmp  = 0x0A => Alu, 2;
    Inc  = 0x0B => Alu, 1;
    Dec  = 0x0C => Alu, 1;
    Shl  = 0x0D => Alu, 2;
    Shr  = 0x0E => Alu, 2;

    // Control flow (0x10-0x1F)
    Ret       = 0x10 => ControlFlow, 0;
    Call      = 0x11 => ControlFlow, 1;
    Jmp       = 0x12 => ControlFlow, 1;
    Jc        = 0x13 => ControlFlow, 1;
    Jnc       = 0x14 => ControlFlow, 1;
    Jz        = 0x15 => ControlFlow, 1;
    Jnz       = 0x16 => ControlFlow, 1;
    Syscall   = 0x17 => ControlFlow, 0;
    Sysret    = 0x18 => ControlFlow, 0;
    Enteruser = 0x19 => ControlFlow, 1;

    // I/O (0x20-0x2F)
    Inb  = 0x20 => Io, 1;
    Inw  = 0x21 => Io, 1;
    Ind  = 0x22 => Io, 1;
    Inq  = 0x23 => Io, 1;
    Outb = 0x24 => Io, 2;
    Outw = 0x25 => Io, 2;
    Outd = 0x26 => Io, 2;
    Outq = 0x27 => Io, 2;

    // Other (0x30-0x3F)
    Mov  = 0x30 => Other, 2;
    Nop  = 0x31 => Other, 0;
    Hlt  = 0x32 => Other, 0;
    Push = 0x33 => Other, 1;
    Pop  = 0x34 => Other, 1;
    Pusha = 0x35 => Other, 0;
    Popa  = 0x36 => Other, 0;
    Int  = 0x37 => Other, 1;
    Lidt = 0x38 => Other, 1;
    Iret = 0x39 => Other, 0;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn groups_match_ranges() {
        assert_eq!(Opcode::from_byte(0x00).unwrap().group(), OpcodeGroup::Alu);
        assert_eq!(Opcode::from_byte(0x0E).unwrap().group(), OpcodeGroup::Alu);
        assert_eq!(Opcode::from_byte(0x10).unwrap().group(), OpcodeGroup::ControlFlow);
        assert_eq!(Opcode::from_byte(0x20).unwrap().group(), OpcodeGroup::Io);
        assert_eq!(Opcode::from_byte(0x30).unwrap().group(), OpcodeGroup::Other);
    }

    #[test]
    fn unknown_opcode_is_invalid_instruction() {
        assert_eq!(Opcode::from_byte(0x0F).unwrap_err(), Exception::InvalidInstruction);
        assert_eq!(Opcode::from_byte(0xFF).unwrap_err(), Exception::InvalidInstruction);
    }

    #[test]
    fn arg_counts_are_bounded() {
        for byte in 0u16..=0xFF {
            if let Ok(op) = Opcode::from_byte(byte as u8) {
                assert!(op.arg_count() <= 2);
            }
        }
    }
}
