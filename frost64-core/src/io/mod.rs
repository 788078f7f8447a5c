// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Memory-mapped I/O: the bus that routes `[0xE000_0000, 0xF000_0000)`
//! accesses to devices, and the three concrete devices spec.md §4.6 names.

mod bus;
mod console;
mod storage;
mod video;

pub use bus::IoBus;
pub use console::ConsoleDevice;
pub use storage::StorageDevice;
pub use video::{NullVideoBackend, VideoBackend, VideoDevice, VideoMode};

use crate::exception::Exception;
use crate::memory::PhysicalMmu;

/// A device-produced side effect that needs physical memory access to
/// finish processing. `write()` itself never receives a `PhysicalMmu`
/// reference (it is invoked while the bus's own region is still borrowed
/// out of the MMU's region list); instead it returns this marker, and the
/// MMU detaches the I/O region, hands the device a free `&mut PhysicalMmu`
/// via [`IoDevice::complete_effect`], then reattaches the region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoEffect {
    /// No further work: the register write was self-contained.
    None,
    /// The device that produced this latched a command register and needs
    /// physical memory access to finish handling it (descriptor reads,
    /// response writes, framebuffer region carving).
    Command,
}

/// A single memory-mapped device on the bus. Offsets passed to `read`/
/// `write` are relative to the device's own base address, in bytes;
/// `size_registers` advertises the device's span in 8-byte registers, the
/// unit the bus uses for overlap and range checks (spec.md §4.6: "device
/// sizes are given in registers").
pub trait IoDevice: std::fmt::Debug {
    fn size_registers(&self) -> u64;

    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), Exception>;

    fn write(&mut self, offset: u64, buf: &[u8]) -> Result<IoEffect, Exception>;

    /// Completes an [`IoEffect::Command`] previously returned from `write`,
    /// with full access to physical memory. Devices that never return a
    /// non-`None` effect can leave this at its default no-op.
    fn complete_effect(&mut self, phys: &mut PhysicalMmu) -> Result<(), Exception> {
        let _ = phys;
        Ok(())
    }

    /// Polled once per instruction by the dispatcher's event-processing
    /// step. Devices with a deferred transfer (`StorageDevice`) perform it
    /// here and return the interrupt vector to raise, if any.
    fn run_pending_transfer(&mut self, phys: &mut PhysicalMmu) -> Result<Option<u8>, Exception> {
        let _ = phys;
        Ok(None)
    }
}

/// Copies the low `buf.len()` bytes of `value`, little-endian, into `buf`.
/// Implements spec.md §6.2's "reads below qword width access the low bits
/// of the register".
pub(crate) fn write_low_bytes(buf: &mut [u8], value: u64) {
    let bytes = value.to_le_bytes();
    let n = buf.len().min(8);
    buf[..n].copy_from_slice(&bytes[..n]);
}

/// Inverse of [`write_low_bytes`]: assembles a u64 from up to 8 bytes,
/// zero-extending if the access was narrower than a full register.
pub(crate) fn read_low_bytes(buf: &[u8]) -> u64 {
    let mut bytes = [0u8; 8];
    let n = buf.len().min(8);
    bytes[..n].copy_from_slice(&buf[..n]);
    u64::from_le_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn low_bytes_roundtrip_narrow_access() {
        let mut buf = [0u8; 2];
        write_low_bytes(&mut buf, 0x1122_3344_5566_7788);
        assert_eq!(buf, [0x88, 0x77]);
        assert_eq!(read_low_bytes(&buf), 0x7788);
    }
}
