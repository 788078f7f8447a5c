// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end scenario: `OUTB [0xE000_0000], byte 0x41; HLT` writes one
//! byte to the device at the console's bus address. `ConsoleDevice` itself
//! writes to real stdout, which a test can't observe, so this captures the
//! same bus write through a small test-only sink device at the same base.

use std::sync::{Arc, Mutex};

use frost64_core::exception::Exception;
use frost64_core::instruction::{self, Instruction};
use frost64_core::io::{IoBus, IoDevice, IoEffect};
use frost64_core::memory::PhysicalMmu;
use frost64_core::opcode::Opcode;
use frost64_core::operand::{Immediate, Operand};
use frost64_core::Cpu;

#[derive(Debug)]
struct CapturingSink(Arc<Mutex<Vec<u8>>>);

impl IoDevice for CapturingSink {
    fn size_registers(&self) -> u64 {
        1
    }

    fn read(&mut self, _offset: u64, buf: &mut [u8]) -> Result<(), Exception> {
        buf.fill(0);
        Ok(())
    }

    fn write(&mut self, _offset: u64, buf: &[u8]) -> Result<IoEffect, Exception> {
        if buf.len() == 1 {
            self.0.lock().unwrap().push(buf[0]);
        }
        Ok(IoEffect::None)
    }

    fn complete_effect(&mut self, _phys: &mut PhysicalMmu) -> Result<(), Exception> {
        Ok(())
    }
}

#[test]
fn outb_to_the_console_address_delivers_the_byte() {
    let captured = Arc::new(Mutex::new(Vec::new()));
    let mut bus = IoBus::new();
    bus.add_device(0, Box::new(CapturingSink(captured.clone()))).unwrap();

    let outb = instruction::encode(&Instruction {
        opcode: Opcode::Outb,
        operands: vec![Operand::Memory(0xE000_0000), Operand::Immediate(Immediate::Byte(0x41))],
    })
    .bytes;
    let hlt = instruction::encode(&Instruction { opcode: Opcode::Hlt, operands: vec![] }).bytes;

    let mut image = Vec::new();
    image.extend(outb);
    image.extend(hlt);

    let mut cpu = Cpu::with_io_bus(1 << 16, bus);
    cpu.load_image(&image).unwrap();
    cpu.run_until_halt().unwrap();

    assert_eq!(*captured.lock().unwrap(), vec![0x41]);
}
