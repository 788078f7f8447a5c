// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The Frost64 register file: general purpose, stack, control, status and
//! instruction-pointer registers, addressed by an 8-bit packed register ID.

use crate::exception::Exception;

/// Kind of a register, packed into the top nibble of a [`RegisterId`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegisterKind {
    GeneralPurpose,
    Stack,
    Control,
    Status,
    Instruction,
}

/// A decoded register reference: its kind plus its index within that kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegisterId {
    pub kind: RegisterKind,
    pub index: u8,
}

impl RegisterId {
    pub const R: [RegisterId; 16] = {
        let mut ids = [RegisterId { kind: RegisterKind::GeneralPurpose, index: 0 }; 16];
        let mut i = 0;
        while i < 16 {
            ids[i] = RegisterId { kind: RegisterKind::GeneralPurpose, index: i as u8 };
            i += 1;
        }
        ids
    };
    pub const SCP: RegisterId = RegisterId { kind: RegisterKind::Stack, index: 0 };
    pub const SBP: RegisterId = RegisterId { kind: RegisterKind::Stack, index: 1 };
    pub const STP: RegisterId = RegisterId { kind: RegisterKind::Stack, index: 2 };
    pub const STS: RegisterId = RegisterId { kind: RegisterKind::Status, index: 0 };
    pub const IP: RegisterId = RegisterId { kind: RegisterKind::Instruction, index: 0 };

    pub const fn control(index: u8) -> RegisterId {
        RegisterId { kind: RegisterKind::Control, index }
    }

    /// Decodes the wire encoding used by the instruction codec: top nibble
    /// selects the kind, bottom nibble the index within that kind.
    pub fn decode(byte: u8) -> Result<RegisterId, Exception> {
        let kind_bits = byte >> 4;
        let index = byte & 0x0F;
        let kind = match (kind_bits, index) {
            (0x0, _) => RegisterKind::GeneralPurpose,
            (0x1, 0..=2) => RegisterKind::Stack,
            (0x2, 0..=7) => RegisterKind::Control,
            (0x2, 8) => RegisterKind::Status,
            (0x2, 9) => RegisterKind::Instruction,
            _ => return Err(Exception::InvalidInstruction),
        };
        Ok(RegisterId { kind, index })
    }

    /// Encodes back to the wire byte (inverse of [`Self::decode`]).
    pub fn encode(self) -> u8 {
        match self.kind {
            RegisterKind::GeneralPurpose => self.index,
            RegisterKind::Stack => 0x10 | self.index,
            RegisterKind::Control => 0x20 | self.index,
            RegisterKind::Status => 0x28,
            RegisterKind::Instruction => 0x29,
        }
    }

    pub fn name(self) -> &'static str {
        match (self.kind, self.index) {
            (RegisterKind::GeneralPurpose, i) => GP_NAMES[i as usize],
            (RegisterKind::Stack, 0) => "scp",
            (RegisterKind::Stack, 1) => "sbp",
            (RegisterKind::Stack, 2) => "stp",
            (RegisterKind::Control, i) => CR_NAMES[i as usize],
            (RegisterKind::Status, _) => "sts",
            (RegisterKind::Instruction, _) => "ip",
            _ => "unknown",
        }
    }
}

const GP_NAMES: [&str; 16] = [
    "r0", "r1", "r2", "r3", "r4", "r5", "r6", "r7",
    "r8", "r9", "r10", "r11", "r12", "r13", "r14", "r15",
];
const CR_NAMES: [&str; 8] = ["cr0", "cr1", "cr2", "cr3", "cr4", "cr5", "cr6", "cr7"];

/// A single 64-bit architectural register with dirty tracking.
///
/// `writable` gates ordinary instruction writes (e.g. an operand naming STS
/// or IP as its destination); the core itself always writes through
/// [`Register::force_set`], which bypasses `writable`.
#[derive(Clone, Copy, Debug, Default)]
pub struct Register {
    value: u64,
    writable: bool,
    dirty: bool,
}

impl Register {
    pub const fn new(writable: bool) -> Self {
        Register { value: 0, writable, dirty: false }
    }

    pub const fn get(&self) -> u64 {
        self.value
    }

    /// Writes the register if it is instruction-writable. Returns whether
    /// the write took effect (mirrors the original architecture's silent
    /// no-op when a guest instruction targets a read-only register).
    pub fn set(&mut self, value: u64) -> bool {
        if !self.writable {
            return false;
        }
        self.value = value;
        self.dirty = true;
        true
    }

    /// Writes unconditionally; only the core (dispatcher, ALU writeback,
    /// register-sync pass) is allowed to call this.
    pub fn force_set(&mut self, value: u64) {
        self.value = value;
        self.dirty = true;
    }

    pub const fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }
}

/// The complete Frost64 register file.
#[derive(Clone, Debug)]
pub struct RegisterFile {
    pub gp: [Register; 16],
    pub scp: Register,
    pub sbp: Register,
    pub stp: Register,
    pub cr: [Register; 8],
    pub sts: Register,
    pub ip: Register,
}

impl Default for RegisterFile {
    fn default() -> Self {
        RegisterFile {
            gp: [Register::new(true); 16],
            scp: Register::new(true),
            sbp: Register::new(true),
            stp: Register::new(true),
            cr: [Register::new(true); 8],
            sts: Register::new(false),
            ip: Register::new(false),
        }
    }
}

impl RegisterFile {
    /// Reads a register by ID, enforcing that control registers are
    /// inaccessible from user mode while protected mode is enabled.
    pub fn read(&self, id: RegisterId, user_mode_protected: bool) -> Result<u64, Exception> {
        if id.kind == RegisterKind::Control && user_mode_protected {
            return Err(Exception::UserModeViolation);
        }
        Ok(self.get_raw(id))
    }

    /// Writes a register by ID through the instruction-level write path
    /// (honours `writable`, so STS/IP writes are silently dropped).
    pub fn write(&mut self, id: RegisterId, value: u64, user_mode_protected: bool) -> Result<(), Exception> {
        if id.kind == RegisterKind::Control && user_mode_protected {
            return Err(Exception::UserModeViolation);
        }
        self.get_raw_mut(id).set(value);
        Ok(())
    }

    /// Unconditional core-internal write, bypassing `writable` and the
    /// user/protected-mode gate. Used for ALU writeback of STS, IP
    /// advancement, and the mode machine's register-sync pass.
    pub fn force_write(&mut self, id: RegisterId, value: u64) {
        self.get_raw_mut(id).force_set(value);
    }

    fn get_raw(&self, id: RegisterId) -> u64 {
        match id.kind {
            RegisterKind::GeneralPurpose => self.gp[id.index as usize].get(),
            RegisterKind::Stack => match id.index {
                0 => self.scp.get(),
                1 => self.sbp.get(),
                _ => self.stp.get(),
            },
            RegisterKind::Control => self.cr[id.index as usize].get(),
            RegisterKind::Status => self.sts.get(),
            RegisterKind::Instruction => self.ip.get(),
        }
    }

    fn get_raw_mut(&mut self, id: RegisterId) -> &mut Register {
        match id.kind {
            RegisterKind::GeneralPurpose => &mut self.gp[id.index as usize],
            RegisterKind::Stack => match id.index {
                0 => &mut self.scp,
                1 => &mut self.sbp,
                _ => &mut self.stp,
            },
            RegisterKind::Control => &mut self.cr[id.index as usize],
            RegisterKind::Status => &mut self.sts,
            RegisterKind::Instruction => &mut self.ip,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_general_purpose() {
        let id = RegisterId::decode(0x0A).unwrap();
        assert_eq!(id.kind, RegisterKind::GeneralPurpose);
        assert_eq!(id.index, 10);
        assert_eq!(id.encode(), 0x0A);
    }

    #[test]
    fn decode_stack_registers() {
        assert_eq!(RegisterId::decode(0x10).unwrap(), RegisterId::SCP);
        assert_eq!(RegisterId::decode(0x11).unwrap(), RegisterId::SBP);
        assert_eq!(RegisterId::decode(0x12).unwrap(), RegisterId::STP);
    }

    #[test]
    fn decode_control_status_instruction() {
        assert_eq!(RegisterId::decode(0x20).unwrap(), RegisterId::control(0));
        assert_eq!(RegisterId::decode(0x28).unwrap(), RegisterId::STS);
        assert_eq!(RegisterId::decode(0x29).unwrap(), RegisterId::IP);
    }

    #[test]
    fn decode_invalid_is_invalid_instruction() {
        assert_eq!(RegisterId::decode(0x13).unwrap_err(), Exception::InvalidInstruction);
        assert_eq!(RegisterId::decode(0x2A).unwrap_err(), Exception::InvalidInstruction);
        assert_eq!(RegisterId::decode(0x30).unwrap_err(), Exception::InvalidInstruction);
    }

    #[test]
    fn status_and_instruction_are_not_instruction_writable() {
        let mut regs = RegisterFile::default();
        assert!(!regs.sts.set(42));
        assert!(!regs.ip.set(42));
        regs.force_write(RegisterId::STS, 42);
        assert_eq!(regs.sts.get(), 42);
    }

    #[test]
    fn control_register_access_gated_by_user_protected_mode() {
        let regs = RegisterFile::default();
        assert!(regs.read(RegisterId::control(0), true).is_err());
        assert!(regs.read(RegisterId::control(0), false).is_ok());
    }
}
