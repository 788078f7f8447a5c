// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The Frost64 CPU: register file, physical/virtual MMU, IDT and I/O bus
//! tied together behind a fetch-decode-execute loop (spec.md §4.2).
//!
//! There is exactly one Frost64 CPU variant, so unlike a dispatcher built
//! to share code across several historical parts, `Cpu` is a concrete
//! struct rather than a type generic over a CPU-details trait.

use crate::event::{Event, EventQueue};
use crate::exception::Exception;
use crate::instruction::{self, Instruction};
use crate::interrupt;
use crate::io::IoBus;
use crate::memory::{
    ActiveMmu, InstructionFetcher, MemoryRegion, MemoryView, PagingConfig, PhysicalMmu,
    RegionKind, StackView, VirtualMmu,
};
use crate::opcode::{Opcode, OpcodeGroup};
use crate::operand::{ComplexOperand, ComplexValue, Immediate, OffsetValue, Operand, Size};
use crate::register::{RegisterFile, RegisterId, RegisterKind};
use crate::stack::Stack;
use crate::utils::CarryingOps;

/// Top of standard RAM / start of the I/O bus (spec.md §6.1).
const IO_BASE: u64 = 0xE000_0000;
const IO_LEN: u64 = 0x1000_0000;
/// Start of the BIOS region the loaded image lands in.
const BIOS_BASE: u64 = 0xF000_0000;
const BIOS_LEN: u64 = 0x1000_0000;
/// Where RAM continues once the requested size exceeds the low range.
const HIGH_RAM_BASE: u64 = 0x1_0000_0000;

bitflags::bitflags! {
    /// Low 3 bits of STS, rewritten by every ALU operation (spec.md §4.2).
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct StsFlags: u64 {
        const CARRY = 1 << 0;
        const ZERO  = 1 << 1;
        const SIGN  = 1 << 2;
    }
}

/// Host-level failure loading a program image, distinct from the
/// guest-visible [`Exception`] faults (spec.md §7's two strata).
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum LoadError {
    #[error("program image is empty")]
    Empty,
    #[error("program image exceeds the BIOS region's reserved size")]
    TooLarge,
}

/// The Frost64 machine: register file, physical memory (with an optional
/// virtual MMU in front of it), the IDT cache, and the pending-event queue.
pub struct Cpu {
    regs: RegisterFile,
    phys: PhysicalMmu,
    vmmu: Option<VirtualMmu>,
    idt: interrupt::Idt,
    events: EventQueue,
    /// Not a register: the original models this as a bare global bool
    /// (`g_isInUserMode`), so it lives on `Cpu` directly rather than in
    /// `RegisterFile`.
    user_mode: bool,
    halted: bool,
}

impl Cpu {
    /// Builds a machine with `ram_bytes` of RAM and no I/O devices attached
    /// (the I/O bus is still mapped; reads/writes into it are simply no-ops
    /// until a device is registered).
    pub fn new(ram_bytes: u64) -> Self {
        Self::build(ram_bytes, IoBus::new())
    }

    /// Builds a machine with devices already registered on `io_bus`.
    pub fn with_io_bus(ram_bytes: u64, io_bus: IoBus) -> Self {
        Self::build(ram_bytes, io_bus)
    }

    fn build(ram_bytes: u64, io_bus: IoBus) -> Self {
        let mut phys = PhysicalMmu::new();
        let low_ram = ram_bytes.min(IO_BASE);
        if low_ram > 0 {
            phys.add_region(MemoryRegion::ram(0, low_ram));
        }
        phys.add_region(MemoryRegion::io(IO_BASE, IO_LEN, io_bus));
        phys.add_region(MemoryRegion::bios(BIOS_BASE, BIOS_LEN, &[]));
        if ram_bytes > IO_BASE {
            phys.add_region(MemoryRegion::ram(HIGH_RAM_BASE, ram_bytes - IO_BASE));
        }

        let mut regs = RegisterFile::default();
        regs.force_write(RegisterId::IP, BIOS_BASE);

        Cpu { regs, phys, vmmu: None, idt: interrupt::Idt::new(), events: EventQueue::new(), user_mode: false, halted: false }
    }

    /// Copies `image` into the BIOS region and resets IP to its base
    /// (spec.md §6.1: image must be `1..=0x1000_0000` bytes).
    pub fn load_image(&mut self, image: &[u8]) -> Result<(), LoadError> {
        if image.is_empty() {
            return Err(LoadError::Empty);
        }
        if image.len() as u64 > BIOS_LEN {
            return Err(LoadError::TooLarge);
        }
        self.phys.remove_region_at(BIOS_BASE);
        self.phys.add_region(MemoryRegion::bios(BIOS_BASE, BIOS_LEN, image));
        self.regs.force_write(RegisterId::IP, BIOS_BASE);
        Ok(())
    }

    pub fn halted(&self) -> bool {
        self.halted
    }

    /// The architectural register file, for front-ends that want to dump
    /// state on a crash (spec.md §7) rather than just propagate the error.
    pub fn registers(&self) -> &RegisterFile {
        &self.regs
    }

    /// Runs instructions until `HLT` or a crash-class fault
    /// (`TwiceUnhandledInterrupt`).
    pub fn run_until_halt(&mut self) -> Result<(), Exception> {
        while !self.halted {
            self.step()?;
        }
        Ok(())
    }

    /// Fetches, decodes and executes exactly one instruction.
    pub fn step(&mut self) -> Result<(), Exception> {
        let ip = self.regs.ip.get();
        let user_mode = self.user_mode;
        let decoded = {
            let view = self.view();
            let mut fetcher = InstructionFetcher { view, pc: ip, user_mode };
            instruction::decode(&mut fetcher)
        };

        let new_ip = match decoded {
            Ok((instr, len)) => {
                let next_ip = ip.wrapping_add(len as u64);
                match self.dispatch(&instr, ip, next_ip) {
                    Ok(target) => target,
                    Err(exc) => self.handle_exception(exc, next_ip)?,
                }
            }
            Err(exc) => self.handle_exception(exc, ip)?,
        };
        self.regs.force_write(RegisterId::IP, new_ip);

        self.drain_events();
        if let Some(vector) = self.poll_io()? {
            let saved_ip = self.regs.ip.get();
            self.raise_interrupt(vector, saved_ip)?;
        }
        Ok(())
    }

    fn handle_exception(&mut self, exc: Exception, saved_ip: u64) -> Result<u64, Exception> {
        match exc.vector() {
            Some(vector) => {
                self.raise_interrupt(vector, saved_ip)?;
                Ok(self.regs.ip.get())
            }
            None => Err(exc),
        }
    }

    fn drain_events(&mut self) {
        while let Some(event) = self.events.pop() {
            log::trace!("dispatch event: {event:?}");
        }
    }

    /// Drains one deferred device transfer, if any, detaching the I/O
    /// region first so the device can freely touch the rest of physical
    /// memory (same pattern as `PhysicalMmu::write_io_region`).
    fn poll_io(&mut self) -> Result<Option<u8>, Exception> {
        let Some(mut region) = self.phys.remove_region_at(IO_BASE) else { return Ok(None) };
        let result = match region.kind_mut() {
            RegionKind::Io(bus) => bus.run_pending_transfers(&mut self.phys),
            _ => unreachable!("the region at IO_BASE is always Io"),
        };
        self.phys.add_region(region);
        result
    }

    fn dispatch(&mut self, instr: &Instruction, _ip: u64, next_ip: u64) -> Result<u64, Exception> {
        match instr.opcode.group() {
            OpcodeGroup::Alu => {
                self.dispatch_alu(instr.opcode, &instr.operands)?;
                Ok(next_ip)
            }
            OpcodeGroup::ControlFlow => self.dispatch_control_flow(instr.opcode, &instr.operands, next_ip),
            OpcodeGroup::Io => {
                self.dispatch_io(instr.opcode, &instr.operands)?;
                Ok(next_ip)
            }
            OpcodeGroup::Other => self.dispatch_other(instr.opcode, &instr.operands, next_ip),
        }
    }

    // ---- ALU group (spec.md §4.2) ----

    fn dispatch_alu(&mut self, op: Opcode, operands: &[Operand]) -> Result<(), Exception> {
        match op {
            Opcode::Not | Opcode::Inc | Opcode::Dec => self.alu_unary(op, &operands[0]),
            _ => self.alu_binary(op, &operands[0], &operands[1]),
        }
    }

    fn alu_binary(&mut self, op: Opcode, dst: &Operand, src: &Operand) -> Result<(), Exception> {
        let size = dst.size();
        let a = self.read_operand(dst)?;
        let b = self.read_operand(src)?;
        let (result, carry) = alu_compute(op, size, a, b)?;
        self.set_flags(size, result, carry);
        if op != Opcode::Cmp {
            self.write_operand(dst, result)?;
        }
        Ok(())
    }

    fn alu_unary(&mut self, op: Opcode, operand: &Operand) -> Result<(), Exception> {
        let size = operand.size();
        let a = self.read_operand(operand)?;
        let (result, carry) = match op {
            Opcode::Not => alu_compute(Opcode::Xor, size, a, mask_for(size))?,
            Opcode::Inc => alu_compute(Opcode::Add, size, a, 1)?,
            Opcode::Dec => alu_compute(Opcode::Sub, size, a, 1)?,
            _ => unreachable!("alu_unary only called for NOT/INC/DEC"),
        };
        self.set_flags(size, result, carry);
        self.write_operand(operand, result)
    }

    fn set_flags(&mut self, size: Size, result: u64, carry: bool) {
        let masked = result & mask_for(size);
        let sign_bit = size.bytes() as u32 * 8 - 1;
        let mut flags = StsFlags::empty();
        flags.set(StsFlags::CARRY, carry);
        flags.set(StsFlags::ZERO, masked == 0);
        flags.set(StsFlags::SIGN, masked & (1u64 << sign_bit) != 0);
        let sts = (self.regs.sts.get() & !StsFlags::all().bits()) | flags.bits();
        self.regs.force_write(RegisterId::STS, sts);
    }

    fn sts_carry(&self) -> bool {
        self.regs.sts.get() & StsFlags::CARRY.bits() != 0
    }

    fn sts_zero(&self) -> bool {
        self.regs.sts.get() & StsFlags::ZERO.bits() != 0
    }

    // ---- Control-flow group ----

    fn dispatch_control_flow(&mut self, op: Opcode, operands: &[Operand], next_ip: u64) -> Result<u64, Exception> {
        match op {
            Opcode::Ret => self.pop_stack(),
            Opcode::Call => {
                let target = self.read_operand(&operands[0])?;
                self.push_stack(next_ip)?;
                Ok(target)
            }
            Opcode::Jmp => self.read_operand(&operands[0]),
            Opcode::Jc => {
                let take = self.sts_carry();
                self.conditional_jump(&operands[0], next_ip, take)
            }
            Opcode::Jnc => {
                let take = !self.sts_carry();
                self.conditional_jump(&operands[0], next_ip, take)
            }
            Opcode::Jz => {
                let take = self.sts_zero();
                self.conditional_jump(&operands[0], next_ip, take)
            }
            Opcode::Jnz => {
                let take = !self.sts_zero();
                self.conditional_jump(&operands[0], next_ip, take)
            }
            Opcode::Syscall => {
                self.syscall(next_ip);
                self.events.push(Event::SwitchToIp);
                Ok(self.regs.ip.get())
            }
            Opcode::Sysret => {
                self.sysret();
                self.events.push(Event::SwitchToIp);
                Ok(self.regs.ip.get())
            }
            Opcode::Enteruser => {
                let target = self.read_operand(&operands[0])?;
                self.enteruser(target);
                self.events.push(Event::SwitchToIp);
                Ok(self.regs.ip.get())
            }
            _ => unreachable!("dispatch_control_flow only called for ControlFlow-group opcodes"),
        }
    }

    fn conditional_jump(&mut self, target: &Operand, next_ip: u64, take: bool) -> Result<u64, Exception> {
        if take {
            self.read_operand(target)
        } else {
            Ok(next_ip)
        }
    }

    /// `ExitUserMode`: transitions supervisor -> user is the wrong
    /// direction; this is the user -> supervisor transition. Saves the
    /// return IP in R14, jumps to the address latched in CR2, swaps SCP
    /// with R15 and STS with CR1 (grounded on the original `ExitUserMode`).
    fn syscall(&mut self, next_ip: u64) {
        self.user_mode = false;
        self.swap_sts_cr1();
        self.regs.force_write(RegisterId::R[14], next_ip);
        let target = self.regs.cr[2].get();
        self.regs.force_write(RegisterId::IP, target);
        let scp = self.regs.scp.get();
        self.regs.force_write(RegisterId::R[15], scp);
    }

    /// `EnterUserMode()` (no address): returns to user mode at the IP saved
    /// in R14 by the matching `SYSCALL`.
    fn sysret(&mut self) {
        self.swap_sts_cr1();
        let target = self.regs.gp[14].get();
        self.regs.force_write(RegisterId::IP, target);
        let r15 = self.regs.gp[15].get();
        self.regs.force_write(RegisterId::SCP, r15);
        self.user_mode = true;
    }

    /// `EnterUserMode(address)`: forces STS to 0 and jumps directly, with
    /// no STS/CR1 shadow swap (the original only swaps on the `SYSCALL`/
    /// no-arg-`EnterUserMode` pair).
    fn enteruser(&mut self, target: u64) {
        self.regs.force_write(RegisterId::STS, 0);
        self.regs.force_write(RegisterId::IP, target);
        self.user_mode = true;
    }

    fn swap_sts_cr1(&mut self) {
        let sts = self.regs.sts.get();
        let cr1 = self.regs.cr[1].get();
        self.regs.force_write(RegisterId::STS, cr1);
        self.regs.force_write(RegisterId::control(1), sts);
    }

    // ---- I/O group ----

    /// `INB/INW/IND/INQ`/`OUTB/OUTW/OUTD/OUTQ` are ordinary sized accesses
    /// into the I/O range; `IN`'s single operand supplies the address and
    /// receives the result (mirroring the ALU convention of writing a
    /// result back through the operand it was read from), `OUT`'s first
    /// operand is the address and its second the value (spec.md §8
    /// scenario 6: `OUTB [0xE000_0000], byte 0x41`).
    fn dispatch_io(&mut self, op: Opcode, operands: &[Operand]) -> Result<(), Exception> {
        if self.user_mode_protected() {
            return Err(Exception::UserModeViolation);
        }
        let size = match op {
            Opcode::Inb | Opcode::Outb => Size::Byte,
            Opcode::Inw | Opcode::Outw => Size::Word,
            Opcode::Ind | Opcode::Outd => Size::Dword,
            Opcode::Inq | Opcode::Outq => Size::Qword,
            _ => unreachable!("dispatch_io only called for Io-group opcodes"),
        };
        let user_mode = self.user_mode;
        match op {
            Opcode::Inb | Opcode::Inw | Opcode::Ind | Opcode::Inq => {
                let addr = self.operand_address(&operands[0])?;
                let value = {
                    let mut view = self.view();
                    view.read_sized(addr, size, user_mode)?
                };
                self.write_operand(&operands[0], value)
            }
            Opcode::Outb | Opcode::Outw | Opcode::Outd | Opcode::Outq => {
                let addr = self.operand_address(&operands[0])?;
                let value = self.read_operand(&operands[1])?;
                let mut view = self.view();
                view.write_sized(addr, size, value, user_mode)
            }
            _ => unreachable!(),
        }
    }

    // ---- Other group ----

    fn dispatch_other(&mut self, op: Opcode, operands: &[Operand], next_ip: u64) -> Result<u64, Exception> {
        match op {
            Opcode::Mov => {
                let value = self.read_operand(&operands[1])?;
                self.write_operand(&operands[0], value)?;
                Ok(next_ip)
            }
            Opcode::Nop => Ok(next_ip),
            Opcode::Hlt => {
                self.halted = true;
                Ok(next_ip)
            }
            Opcode::Push => {
                let value = self.read_operand(&operands[0])?;
                self.push_stack(value)?;
                Ok(next_ip)
            }
            Opcode::Pop => {
                let value = self.pop_stack()?;
                self.write_operand(&operands[0], value)?;
                Ok(next_ip)
            }
            Opcode::Pusha => {
                self.pusha()?;
                Ok(next_ip)
            }
            Opcode::Popa => {
                self.popa()?;
                Ok(next_ip)
            }
            Opcode::Int => {
                let vector = self.read_operand(&operands[0])? as u8;
                self.raise_interrupt(vector, next_ip)?;
                Ok(self.regs.ip.get())
            }
            Opcode::Lidt => {
                let value = self.read_operand(&operands[0])?;
                self.idt.set_idtr(value);
                Ok(next_ip)
            }
            Opcode::Iret => {
                self.do_iret()?;
                Ok(self.regs.ip.get())
            }
            _ => unreachable!("dispatch_other only called for Other-group opcodes"),
        }
    }

    fn pusha(&mut self) -> Result<(), Exception> {
        for id in RegisterId::R {
            let value = self.regs.read(id, self.user_mode_protected())?;
            self.push_stack(value)?;
        }
        Ok(())
    }

    fn popa(&mut self) -> Result<(), Exception> {
        for id in RegisterId::R.into_iter().rev() {
            let value = self.pop_stack()?;
            self.regs.force_write(id, value);
        }
        Ok(())
    }

    // ---- Operand access ----

    fn read_operand(&mut self, op: &Operand) -> Result<u64, Exception> {
        match op {
            Operand::Register(id) => self.regs.read(*id, self.user_mode_protected()),
            Operand::Immediate(imm) => Ok(imm.as_u64()),
            Operand::Memory(addr) => {
                let user_mode = self.user_mode;
                let size = op.size();
                let mut view = self.view();
                view.read_sized(*addr, size, user_mode)
            }
            Operand::Complex(c) => {
                let addr = self.effective_address(c)?;
                let user_mode = self.user_mode;
                let size = op.size();
                let mut view = self.view();
                view.read_sized(addr, size, user_mode)
            }
        }
    }

    fn write_operand(&mut self, op: &Operand, value: u64) -> Result<(), Exception> {
        match op {
            Operand::Register(id) => self.write_register(*id, value),
            // Writing to an immediate operand is a no-op, matching the
            // silent-drop convention for non-writable registers.
            Operand::Immediate(_) => Ok(()),
            Operand::Memory(addr) => {
                let user_mode = self.user_mode;
                let size = op.size();
                let mut view = self.view();
                view.write_sized(*addr, size, value, user_mode)
            }
            Operand::Complex(c) => {
                let addr = self.effective_address(c)?;
                let user_mode = self.user_mode;
                let size = op.size();
                let mut view = self.view();
                view.write_sized(addr, size, value, user_mode)
            }
        }
    }

    /// The address `IN`'s single operand both reads from and writes back
    /// to, or `OUT`'s destination operand.
    fn operand_address(&self, op: &Operand) -> Result<u64, Exception> {
        match op {
            Operand::Register(id) => self.regs.read(*id, self.user_mode_protected()),
            Operand::Immediate(imm) => Ok(imm.as_u64()),
            Operand::Memory(addr) => Ok(*addr),
            Operand::Complex(c) => self.effective_address(c),
        }
    }

    fn effective_address(&self, c: &ComplexOperand) -> Result<u64, Exception> {
        let mut addr = 0u64;
        if let Some(base) = &c.base {
            addr = addr.wrapping_add(self.complex_value(base)?);
        }
        if let Some(index) = &c.index {
            addr = addr.wrapping_add(self.complex_value(index)?);
        }
        if let Some(offset) = &c.offset {
            addr = match offset {
                OffsetValue::Register { reg, negative } => {
                    let v = self.regs.read(*reg, self.user_mode_protected())?;
                    if *negative { addr.wrapping_sub(v) } else { addr.wrapping_add(v) }
                }
                // The wire format gives immediates no separate sign bit
                // (unlike the register-offset slot), so a negative offset
                // can only be expressed as a two's-complement bit pattern.
                OffsetValue::Immediate(imm) => addr.wrapping_add(sign_extend_immediate(*imm)),
            };
        }
        Ok(addr)
    }

    fn complex_value(&self, v: &ComplexValue) -> Result<u64, Exception> {
        match v {
            ComplexValue::Register(id) => self.regs.read(*id, self.user_mode_protected()),
            ComplexValue::Immediate(imm) => Ok(imm.as_u64()),
        }
    }

    fn write_register(&mut self, id: RegisterId, value: u64) -> Result<(), Exception> {
        if id.kind == RegisterKind::Control && self.user_mode_protected() {
            return Err(Exception::UserModeViolation);
        }
        match (id.kind, id.index) {
            (RegisterKind::Control, 0) => self.write_cr0(value),
            (RegisterKind::Control, 3) => self.write_cr3(value),
            _ => {
                self.regs.write(id, value, self.user_mode_protected())?;
                Ok(())
            }
        }
    }

    /// Bit 0 toggles protected mode (read directly off CR0 elsewhere, no
    /// side effect here); bit 1 toggles paging. On a 0->1 transition, CR0
    /// is left completely unchanged if the requested page size/level
    /// combination is rejected (spec.md §9's dirty-bit bug, fixed).
    fn write_cr0(&mut self, value: u64) -> Result<(), Exception> {
        let was_paging = self.regs.cr[0].get() & 0b10 != 0;
        let now_paging = value & 0b10 != 0;

        if !was_paging && now_paging {
            let config = PagingConfig::from_cr0(value)?;
            let root = self.regs.cr[3].get();
            self.vmmu = Some(VirtualMmu::new(config, root));
            self.events.push(Event::NewMmu);
        } else if was_paging && !now_paging {
            self.vmmu = None;
            self.events.push(Event::NewMmu);
        }

        self.regs.force_write(RegisterId::control(0), value);
        Ok(())
    }

    /// Updates the live virtual MMU's root in place; no rebuild, no event.
    fn write_cr3(&mut self, value: u64) -> Result<(), Exception> {
        if let Some(vmmu) = &mut self.vmmu {
            vmmu.root = value;
        }
        self.regs.force_write(RegisterId::control(3), value);
        Ok(())
    }

    fn user_mode_protected(&self) -> bool {
        self.user_mode && self.regs.cr[0].get() & 1 != 0
    }

    /// Borrows the active MMU (physical, or virtual bound to physical)
    /// fresh for a single access.
    fn view(&mut self) -> MemoryView<'_, '_> {
        let user_mode_protected = self.user_mode_protected();
        let active = match &self.vmmu {
            Some(vmmu) => ActiveMmu::Virtual(vmmu),
            None => ActiveMmu::Physical,
        };
        MemoryView { phys: &mut self.phys, active, user_mode_protected }
    }

    // ---- Stack ----

    fn stack_triple(&self) -> (u64, u64, u64) {
        (self.regs.sbp.get(), self.regs.stp.get(), self.regs.scp.get())
    }

    /// Constructs a `Stack` from the live SBP/STP/SCP registers, runs `f`,
    /// then writes the (possibly advanced) pointer back to SCP. `Stack`
    /// never persists between instructions in this port — `RegisterFile`
    /// is the only source of truth, so there is nothing else to reconcile.
    fn with_stack<R>(&mut self, f: impl FnOnce(&mut Stack, &mut StackView) -> Result<R, Exception>) -> Result<R, Exception> {
        let (mut base, mut top, mut pointer) = self.stack_triple();
        let user_mode = self.user_mode;
        let view = self.view();
        let mut mem = StackView { view, user_mode };
        let mut stack = Stack::new(&mut base, &mut top, &mut pointer);
        let result = f(&mut stack, &mut mem);
        self.regs.force_write(RegisterId::SCP, pointer);
        result
    }

    fn push_stack(&mut self, value: u64) -> Result<(), Exception> {
        self.with_stack(|stack, mem| stack.push(mem, value))
    }

    fn pop_stack(&mut self) -> Result<u64, Exception> {
        self.with_stack(|stack, mem| stack.pop(mem))
    }

    // ---- Interrupts ----

    fn raise_interrupt(&mut self, vector: u8, saved_ip: u64) -> Result<(), Exception> {
        let (mut base, mut top, mut pointer) = self.stack_triple();
        let user_mode = self.user_mode;
        let user_mode_protected = self.user_mode_protected();
        let active = match &self.vmmu {
            Some(vmmu) => ActiveMmu::Virtual(vmmu),
            None => ActiveMmu::Physical,
        };
        let view = MemoryView { phys: &mut self.phys, active, user_mode_protected };
        let mut mem = StackView { view, user_mode };
        let mut stack = Stack::new(&mut base, &mut top, &mut pointer);
        let result = interrupt::raise_interrupt(vector, saved_ip, &mut self.idt, &mut self.regs, &mut stack, &mut mem);
        self.regs.force_write(RegisterId::SCP, pointer);
        result
    }

    fn do_iret(&mut self) -> Result<(), Exception> {
        let (mut base, mut top, mut pointer) = self.stack_triple();
        let user_mode = self.user_mode;
        let user_mode_protected = self.user_mode_protected();
        let active = match &self.vmmu {
            Some(vmmu) => ActiveMmu::Virtual(vmmu),
            None => ActiveMmu::Physical,
        };
        let view = MemoryView { phys: &mut self.phys, active, user_mode_protected };
        let mut mem = StackView { view, user_mode };
        let mut stack = Stack::new(&mut base, &mut top, &mut pointer);
        let result = interrupt::iret(&mut self.regs, &mut stack, &mut mem);
        self.regs.force_write(RegisterId::SCP, pointer);
        result
    }
}

const fn mask_for(size: Size) -> u64 {
    match size {
        Size::Byte => u8::MAX as u64,
        Size::Word => u16::MAX as u64,
        Size::Dword => u32::MAX as u64,
        Size::Qword => u64::MAX,
    }
}

fn sign_extend_immediate(imm: Immediate) -> u64 {
    match imm {
        Immediate::Byte(v) => v as i8 as i64 as u64,
        Immediate::Word(v) => v as i16 as i64 as u64,
        Immediate::Dword(v) => v as i32 as i64 as u64,
        Immediate::Qword(v) => v,
    }
}

/// Computes one binary ALU op at `size`, returning the (wrapped) result and
/// its carry/borrow/overflow bit. `Cmp` shares `Sub`'s computation; the
/// caller decides whether to write the result back.
fn alu_compute(op: Opcode, size: Size, a: u64, b: u64) -> Result<(u64, bool), Exception> {
    macro_rules! width {
        ($t:ty) => {{
            let av = a as $t;
            let bv = b as $t;
            let (result, carry): ($t, bool) = match op {
                Opcode::Add => av.carrying_add(bv, false),
                Opcode::Sub | Opcode::Cmp => av.borrowing_sub(bv, false),
                Opcode::Mul => av.overflowing_mul(bv),
                Opcode::Div => {
                    if bv == 0 {
                        return Err(Exception::DivByZero);
                    }
                    (av.wrapping_div(bv), false)
                }
                Opcode::Or => (av | bv, false),
                Opcode::Xor => (av ^ bv, false),
                Opcode::Nor => (!(av | bv), false),
                Opcode::And => (av & bv, false),
                Opcode::Nand => (!(av & bv), false),
                Opcode::Shl => {
                    let shift = (bv as u32) % <$t>::BITS;
                    let carry = shift > 0 && (av >> (<$t>::BITS - shift)) & 1 != 0;
                    (av.wrapping_shl(shift), carry)
                }
                Opcode::Shr => {
                    let shift = (bv as u32) % <$t>::BITS;
                    let carry = shift > 0 && (av >> (shift - 1)) & 1 != 0;
                    (av.wrapping_shr(shift), carry)
                }
                _ => unreachable!("alu_compute only called for binary ALU opcodes"),
            };
            (result as u64, carry)
        }};
    }

    Ok(match size {
        Size::Byte => width!(u8),
        Size::Word => width!(u16),
        Size::Dword => width!(u32),
        Size::Qword => width!(u64),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcode::Opcode;

    fn assemble(instrs: &[Instruction]) -> Vec<u8> {
        instrs.iter().flat_map(|i| instruction::encode(i).bytes).collect()
    }

    #[test]
    fn add_immediate_updates_register_and_clears_zero_flag() {
        let image = assemble(&[
            Instruction {
                opcode: Opcode::Add,
                operands: vec![Operand::Register(RegisterId::R[0]), Operand::Immediate(Immediate::Byte(5))],
            },
            Instruction { opcode: Opcode::Hlt, operands: vec![] },
        ]);
        let mut cpu = Cpu::new(1 << 16);
        cpu.load_image(&image).unwrap();
        cpu.run_until_halt().unwrap();
        assert_eq!(cpu.regs.gp[0].get(), 5);
        assert!(!cpu.sts_zero());
    }

    #[test]
    fn conditional_jump_reaches_second_hlt_when_zero_flag_set() {
        let mov = instruction::encode(&Instruction {
            opcode: Opcode::Mov,
            operands: vec![Operand::Register(RegisterId::R[0]), Operand::Immediate(Immediate::Byte(0))],
        })
        .bytes;
        let cmp = instruction::encode(&Instruction {
            opcode: Opcode::Cmp,
            operands: vec![Operand::Register(RegisterId::R[0]), Operand::Immediate(Immediate::Byte(0))],
        })
        .bytes;
        let hlt = instruction::encode(&Instruction { opcode: Opcode::Hlt, operands: vec![] }).bytes;
        let jz_probe_len = instruction::encode(&Instruction {
            opcode: Opcode::Jz,
            operands: vec![Operand::Immediate(Immediate::Qword(0))],
        })
        .bytes
        .len();

        let offset_to_second_hlt = mov.len() + cmp.len() + jz_probe_len + hlt.len();
        let target = BIOS_BASE + offset_to_second_hlt as u64;
        let jz = instruction::encode(&Instruction {
            opcode: Opcode::Jz,
            operands: vec![Operand::Immediate(Immediate::Qword(target))],
        })
        .bytes;
        assert_eq!(jz.len(), jz_probe_len);

        let mut image = Vec::new();
        image.extend(mov);
        image.extend(cmp);
        image.extend(jz);
        image.extend(&hlt); // skipped
        image.extend(&hlt); // landed on

        let mut cpu = Cpu::new(1 << 16);
        cpu.load_image(&image).unwrap();
        cpu.run_until_halt().unwrap();
        assert!(cpu.sts_zero());
        assert_eq!(cpu.regs.ip.get(), target + hlt.len() as u64);
    }

    #[test]
    fn push_then_pop_roundtrips_through_scp() {
        let image = assemble(&[
            Instruction { opcode: Opcode::Push, operands: vec![Operand::Immediate(Immediate::Qword(0xDEAD_BEEF))] },
            Instruction { opcode: Opcode::Pop, operands: vec![Operand::Register(RegisterId::R[1])] },
            Instruction { opcode: Opcode::Hlt, operands: vec![] },
        ]);
        let mut cpu = Cpu::new(1 << 16);
        cpu.regs.force_write(RegisterId::SBP, 0x100);
        cpu.regs.force_write(RegisterId::STP, 0x200);
        cpu.regs.force_write(RegisterId::SCP, 0x100);
        cpu.load_image(&image).unwrap();
        cpu.run_until_halt().unwrap();
        assert_eq!(cpu.regs.gp[1].get(), 0xDEAD_BEEF);
        assert_eq!(cpu.regs.scp.get(), 0x100);
    }

    #[test]
    fn double_unhandled_interrupt_crashes_the_vm() {
        let image = assemble(&[Instruction { opcode: Opcode::Int, operands: vec![Operand::Immediate(Immediate::Byte(9))] }]);
        let mut cpu = Cpu::new(1 << 16);
        cpu.load_image(&image).unwrap();
        let err = cpu.run_until_halt().unwrap_err();
        assert_eq!(err, Exception::TwiceUnhandledInterrupt);
    }

    #[test]
    fn enabling_paging_with_an_absent_root_pte_raises_paging_violation_on_next_fetch() {
        let mut cpu = Cpu::new(1 << 20);
        let root = 0x10000u64;
        cpu.regs.force_write(RegisterId::control(3), root);
        let cr0 = 0b0000_0011u64; // protected + paging, 4KiB pages, 3 levels, root PTE left zeroed
        cpu.write_register(RegisterId::control(0), cr0).unwrap();

        let err = cpu.step().unwrap_err();
        assert!(matches!(err, Exception::PagingViolation(code) if code.execute && !code.present));
    }

    #[test]
    fn rejected_paging_combination_leaves_cr0_untouched() {
        let mut cpu = Cpu::new(1 << 16);
        cpu.regs.force_write(RegisterId::control(0), 0x42);
        let invalid = 0b11_11_10u64; // paging + 64KiB pages + 5 levels: rejected combination
        let err = cpu.write_register(RegisterId::control(0), invalid).unwrap_err();
        assert_eq!(err, Exception::InvalidInstruction);
        assert_eq!(cpu.regs.cr[0].get(), 0x42);
    }

    #[test]
    fn load_image_rejects_empty_and_oversized_images() {
        let mut cpu = Cpu::new(1 << 16);
        assert_eq!(cpu.load_image(&[]).unwrap_err(), LoadError::Empty);
        let oversized = vec![0u8; (BIOS_LEN + 1) as usize];
        assert_eq!(cpu.load_image(&oversized).unwrap_err(), LoadError::TooLarge);
    }
}
