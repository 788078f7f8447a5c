// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::exception::Exception;
use crate::memory::PhysicalMmu;
use super::{IoDevice, IoEffect};

/// The I/O bus backing `RegionKind::Io`. Ports devices at a byte-addressed
/// base (a multiple of 8) and routes accesses to whichever device's range
/// contains the target address, grounded on the original `IOBus::FindDevice`
/// linear scan (`base <= addr < base + size`) — with `size` now consistently
/// in registers (`size_registers() * 8` bytes), fixing the unit mismatch
/// between device construction and bus range checks.
#[derive(Debug, Default)]
pub struct IoBus {
    devices: Vec<(u64, Box<dyn IoDevice>)>,
    /// Set by the last `write()` call that returned `IoEffect::Command`, so
    /// `complete_effect` below knows which device to hand the `PhysicalMmu`
    /// reference to.
    pending_command_device: Option<usize>,
}

impl IoBus {
    pub fn new() -> Self {
        IoBus { devices: Vec::new(), pending_command_device: None }
    }

    /// Registers `device` at `base_address` (bytes). Rejects overlap with
    /// an already-registered device's `[base, base + size*8)` span.
    pub fn add_device(&mut self, base_address: u64, device: Box<dyn IoDevice>) -> Result<(), &'static str> {
        let new_end = base_address + device.size_registers() * 8;
        for (base, existing) in &self.devices {
            let end = base + existing.size_registers() * 8;
            if base_address < end && *base < new_end {
                return Err("overlapping I/O device range");
            }
        }
        self.devices.push((base_address, device));
        Ok(())
    }

    fn find_device_index(&self, addr: u64) -> Option<usize> {
        self.devices.iter().position(|(base, dev)| {
            *base <= addr && addr < base + dev.size_registers() * 8
        })
    }

    pub fn read(&mut self, addr: u64, buf: &mut [u8], user_mode_protected: bool) -> Result<(), Exception> {
        if user_mode_protected {
            return Err(Exception::UserModeViolation);
        }
        let Some(idx) = self.find_device_index(addr) else { return Ok(()) };
        let (base, device) = &mut self.devices[idx];
        device.read(addr - *base, buf)
    }

    pub fn write(&mut self, addr: u64, buf: &[u8], user_mode_protected: bool) -> Result<IoEffect, Exception> {
        if user_mode_protected {
            return Err(Exception::UserModeViolation);
        }
        let Some(idx) = self.find_device_index(addr) else { return Ok(IoEffect::None) };
        let (base, device) = &mut self.devices[idx];
        let effect = device.write(addr - *base, buf)?;
        if effect != IoEffect::None {
            self.pending_command_device = Some(idx);
        }
        Ok(effect)
    }

    /// Called by `PhysicalMmu` once this bus has been detached from the
    /// region list, so the device can freely touch the rest of physical
    /// memory without aliasing its own containing region.
    pub fn complete_effect(&mut self, phys: &mut PhysicalMmu) -> Result<(), Exception> {
        let Some(idx) = self.pending_command_device.take() else { return Ok(()) };
        self.devices[idx].1.complete_effect(phys)
    }

    /// Polls every device for a deferred transfer and runs the first one
    /// found, returning the interrupt vector to raise if the device
    /// requested one.
    pub fn run_pending_transfers(&mut self, phys: &mut PhysicalMmu) -> Result<Option<u8>, Exception> {
        for (_, device) in &mut self.devices {
            if let Some(vector) = device.run_pending_transfer(phys)? {
                return Ok(Some(vector));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::ConsoleDevice;

    #[test]
    fn overlapping_devices_rejected() {
        let mut bus = IoBus::new();
        bus.add_device(0, Box::new(ConsoleDevice::new())).unwrap();
        let err = bus.add_device(0, Box::new(ConsoleDevice::new())).unwrap_err();
        assert_eq!(err, "overlapping I/O device range");
    }

    #[test]
    fn non_overlapping_devices_accepted() {
        let mut bus = IoBus::new();
        bus.add_device(0, Box::new(ConsoleDevice::new())).unwrap();
        bus.add_device(16, Box::new(ConsoleDevice::new())).unwrap();
    }

    #[test]
    fn read_from_unmapped_address_is_a_no_op() {
        let mut bus = IoBus::new();
        let mut buf = [0xFFu8; 8];
        bus.read(0x1000, &mut buf, false).unwrap();
        assert_eq!(buf, [0xFF; 8]);
    }

    #[test]
    fn protected_user_mode_raises_user_mode_violation() {
        let mut bus = IoBus::new();
        bus.add_device(0, Box::new(ConsoleDevice::new())).unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(bus.read(0, &mut buf, true).unwrap_err(), Exception::UserModeViolation);
    }
}
