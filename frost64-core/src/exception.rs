// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Guest-visible faults.
//!
//! Every operation the guest program can make fail returns
//! `Result<_, Exception>` rather than panicking. The dispatcher converts a
//! returned `Exception` into an interrupt via [`crate::interrupt`].

/// A Frost64 guest fault, with a fixed numeric mapping to the low 6 bits of
/// its interrupt vector.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Exception {
    #[error("division by zero")]
    DivByZero,
    #[error("physical memory violation")]
    PhysMemViolation,
    #[error("unhandled interrupt")]
    UnhandledInterrupt,
    #[error("invalid instruction")]
    InvalidInstruction,
    #[error("stack violation")]
    StackViolation,
    #[error("user mode violation")]
    UserModeViolation,
    #[error("supervisor mode violation")]
    SupervisorModeViolation,
    #[error("paging violation: {0:?}")]
    PagingViolation(PagingErrorCode),
    /// Synthetic vector: raised only when `UnhandledInterrupt` itself fails
    /// to dispatch. Not a real interrupt vector; crashes the VM.
    #[error("unhandled interrupt while handling an unhandled interrupt")]
    TwiceUnhandledInterrupt,
}

impl Exception {
    /// The vector number used to index the IDT, for exceptions that have one.
    pub const fn vector(self) -> Option<u8> {
        match self {
            Exception::DivByZero => Some(0),
            Exception::PhysMemViolation => Some(1),
            Exception::UnhandledInterrupt => Some(2),
            Exception::InvalidInstruction => Some(3),
            Exception::StackViolation => Some(4),
            Exception::UserModeViolation => Some(5),
            Exception::SupervisorModeViolation => Some(6),
            Exception::PagingViolation(_) => Some(7),
            Exception::TwiceUnhandledInterrupt => None,
        }
    }

    /// Reconstructs an exception from a raw vector number. `PagingViolation`
    /// carries no error-code information on this path; it is only used to
    /// classify which vector fired (e.g. while raising `INT imm`), not to
    /// recover a paging fault's original error code.
    pub const fn from_vector(vector: u8) -> Option<Exception> {
        match vector {
            0 => Some(Exception::DivByZero),
            1 => Some(Exception::PhysMemViolation),
            2 => Some(Exception::UnhandledInterrupt),
            3 => Some(Exception::InvalidInstruction),
            4 => Some(Exception::StackViolation),
            5 => Some(Exception::UserModeViolation),
            6 => Some(Exception::SupervisorModeViolation),
            7 => Some(Exception::PagingViolation(PagingErrorCode { read: false, write: false, execute: false, user: false, present: false })),
            _ => None,
        }
    }
}

/// Which permission class a paging violation failed on, and whether the
/// faulting access originated from user mode. Encoded into the error code
/// delivered alongside `Exception::PagingViolation`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PagingErrorCode {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
    pub user: bool,
    pub present: bool,
}

impl PagingErrorCode {
    pub const fn to_bits(self) -> u32 {
        (self.read as u32)
            | (self.write as u32) << 1
            | (self.execute as u32) << 2
            | (self.user as u32) << 3
            | (self.present as u32) << 4
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vector_roundtrip() {
        for v in 0u8..8 {
            let ex = Exception::from_vector(v).unwrap();
            assert_eq!(ex.vector(), Some(v));
        }
    }

    #[test]
    fn twice_unhandled_has_no_vector() {
        assert_eq!(Exception::TwiceUnhandledInterrupt.vector(), None);
    }
}
