// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Property: `decode(encode(ins)) == ins` for the register/immediate
//! shapes the ALU and MOV opcodes accept, across the full value range of
//! every operand size.

use frost64_core::instruction::{self, Instruction, SliceFetcher};
use frost64_core::opcode::Opcode;
use frost64_core::operand::{Immediate, Operand};
use frost64_core::register::RegisterId;
use proptest::prelude::*;

fn register_strategy() -> impl Strategy<Value = RegisterId> {
    (0..16usize).prop_map(|i| RegisterId::R[i])
}

fn immediate_strategy() -> impl Strategy<Value = Immediate> {
    prop_oneof![
        any::<u8>().prop_map(Immediate::Byte),
        any::<u16>().prop_map(Immediate::Word),
        any::<u32>().prop_map(Immediate::Dword),
        any::<u64>().prop_map(Immediate::Qword),
    ]
}

proptest! {
    #[test]
    fn mov_register_immediate_round_trips(dst in register_strategy(), imm in immediate_strategy()) {
        let ins = Instruction { opcode: Opcode::Mov, operands: vec![Operand::Register(dst), Operand::Immediate(imm)] };
        let encoded = instruction::encode(&ins);
        let mut fetcher = SliceFetcher::new(&encoded.bytes);
        let (decoded, len) = instruction::decode(&mut fetcher).unwrap();
        prop_assert_eq!(len, encoded.bytes.len());
        prop_assert_eq!(decoded, ins);
    }

    #[test]
    fn add_register_register_round_trips(dst in register_strategy(), src in register_strategy()) {
        let ins = Instruction { opcode: Opcode::Add, operands: vec![Operand::Register(dst), Operand::Register(src)] };
        let encoded = instruction::encode(&ins);
        let mut fetcher = SliceFetcher::new(&encoded.bytes);
        let (decoded, len) = instruction::decode(&mut fetcher).unwrap();
        prop_assert_eq!(len, encoded.bytes.len());
        prop_assert_eq!(decoded, ins);
    }
}
