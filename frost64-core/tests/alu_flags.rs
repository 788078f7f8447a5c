// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Property: after `ADD r0, qword b` (r0 pre-loaded with `a`), the low 3
//! bits of STS match a reference model computed in 64-bit arithmetic.

use frost64_core::cpu::StsFlags;
use frost64_core::instruction::{self, Instruction};
use frost64_core::opcode::Opcode;
use frost64_core::operand::{Immediate, Operand};
use frost64_core::register::RegisterId;
use frost64_core::Cpu;
use proptest::prelude::*;

fn run_add(a: u64, b: u64) -> u64 {
    let mov = instruction::encode(&Instruction {
        opcode: Opcode::Mov,
        operands: vec![Operand::Register(RegisterId::R[0]), Operand::Immediate(Immediate::Qword(a))],
    })
    .bytes;
    let add = instruction::encode(&Instruction {
        opcode: Opcode::Add,
        operands: vec![Operand::Register(RegisterId::R[0]), Operand::Immediate(Immediate::Qword(b))],
    })
    .bytes;
    let hlt = instruction::encode(&Instruction { opcode: Opcode::Hlt, operands: vec![] }).bytes;

    let mut image = Vec::new();
    image.extend(mov);
    image.extend(add);
    image.extend(hlt);

    let mut cpu = Cpu::new(1 << 16);
    cpu.load_image(&image).unwrap();
    cpu.run_until_halt().unwrap();
    cpu.registers().sts.get()
}

proptest! {
    #[test]
    fn add_flags_match_a_64_bit_reference_model(a: u64, b: u64) {
        let sts = run_add(a, b);
        let (sum, carry) = a.overflowing_add(b);

        prop_assert_eq!(sts & StsFlags::CARRY.bits() != 0, carry);
        prop_assert_eq!(sts & StsFlags::ZERO.bits() != 0, sum == 0);
        prop_assert_eq!(sts & StsFlags::SIGN.bits() != 0, sum & (1u64 << 63) != 0);
    }
}
