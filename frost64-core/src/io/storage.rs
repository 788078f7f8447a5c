// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use crate::exception::Exception;
use crate::memory::PhysicalMmu;
use super::{read_low_bytes, write_low_bytes, IoDevice, IoEffect};

const SECTOR_SIZE: u64 = 512;

/// The interrupt vector storage completion raises. The original hardcodes
/// vector 0, which collides with `DIV_BY_ZERO`'s exception vector; this
/// picks a vector outside the fixed exception range instead.
pub const STORAGE_INTERRUPT_VECTOR: u8 = 32;

bitflags::bitflags! {
    /// STATUS register bits (spec.md §6.2).
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct StorageStatus: u8 {
        const EN   = 1 << 0;
        const ERR  = 1 << 1;
        const RDY  = 1 << 2;
        const TRN  = 1 << 3;
        const INTE = 1 << 4;
        const INTP = 1 << 5;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
enum StorageCommand {
    Configure = 0,
    GetDeviceInfo = 1,
    Read = 2,
    Write = 3,
}

impl StorageCommand {
    fn from_u64(value: u64) -> Option<StorageCommand> {
        match value {
            0 => Some(StorageCommand::Configure),
            1 => Some(StorageCommand::GetDeviceInfo),
            2 => Some(StorageCommand::Read),
            3 => Some(StorageCommand::Write),
            _ => None,
        }
    }
}

/// One node's decoded items from the guest-assembled physical-region list:
/// `{start, size_in_sectors}` pairs chained by a `next` pointer, terminated
/// after the requested node count (spec.md §6.2).
struct PrlItem {
    start: u64,
    size_sectors: u64,
}

fn parse_physical_region_list(phys: &mut PhysicalMmu, list_start: u64, node_count: u64, expected_size: u64) -> Option<Vec<PrlItem>> {
    let mut items = Vec::new();
    let mut node_start = list_start;
    let mut total = 0u64;

    for _ in 0..node_count {
        if !phys.validate_read(node_start, 8) {
            return None;
        }
        let item_count = phys.read64(node_start).ok()?;
        node_start += 8;
        for _ in 0..item_count {
            if !phys.validate_read(node_start, 16) {
                return None;
            }
            let start = phys.read64(node_start).ok()?;
            let size_sectors = phys.read64(node_start + 8).ok()?;
            total += size_sectors * SECTOR_SIZE;
            items.push(PrlItem { start, size_sectors });
            node_start += 16;
        }
        if !phys.validate_read(node_start, 8) {
            return None;
        }
        node_start = phys.read64(node_start).ok()?;
    }

    (total == expected_size).then_some(items)
}

fn scatter_to_guest(phys: &mut PhysicalMmu, items: &[PrlItem], mut src: &[u8]) -> Result<(), Exception> {
    for item in items {
        let len = (item.size_sectors * SECTOR_SIZE) as usize;
        let n = len.min(src.len());
        phys.write_buffer(item.start, &src[..n], false)?;
        src = &src[n..];
    }
    Ok(())
}

fn gather_from_guest(phys: &mut PhysicalMmu, items: &[PrlItem], dst: &mut [u8]) -> Result<(), Exception> {
    let mut remaining = dst;
    for item in items {
        let len = (item.size_sectors * SECTOR_SIZE) as usize;
        let n = len.min(remaining.len());
        let (head, tail) = remaining.split_at_mut(n);
        phys.read_buffer(item.start, head, false)?;
        remaining = tail;
    }
    Ok(())
}

#[derive(Debug)]
struct PendingTransfer {
    lba: u64,
    count: u64,
    prls: u64,
    prlnc: u64,
    write: bool,
    raise_interrupt: bool,
}

/// Block storage device: COMMAND/STATUS/DATA registers backed by a host
/// file, grounded on the original `StorageDevice`/`PhysicalRegionListBuffer`
/// pair. Fixes the read/write direction so a READ command always copies
/// disk -> guest and a WRITE command always copies guest -> disk (spec.md
/// §9 design note).
#[derive(Debug)]
pub struct StorageDevice {
    command: u64,
    status: StorageStatus,
    data: u64,
    file: File,
    pending: Option<PendingTransfer>,
}

impl StorageDevice {
    pub fn new(file: File) -> Self {
        StorageDevice { command: 0, status: StorageStatus::RDY, data: 0, file, pending: None }
    }

    fn sector_count(&self) -> std::io::Result<u64> {
        Ok(self.file.metadata()?.len() / SECTOR_SIZE)
    }

    fn handle_configure(&mut self) {
        self.status.remove(StorageStatus::RDY);
        let en = self.data & 1 != 0;
        let inte = (self.data >> 1) & 1 != 0;
        self.status.set(StorageStatus::EN, en);
        self.status.set(StorageStatus::INTE, inte);
        self.status.remove(StorageStatus::ERR);
        self.status.insert(StorageStatus::RDY);
    }

    fn handle_get_device_info(&mut self, phys: &mut PhysicalMmu) -> Result<(), Exception> {
        self.status.remove(StorageStatus::RDY);
        let addr = self.data;
        if !phys.validate_write(addr, 16) {
            self.status.insert(StorageStatus::ERR);
            self.status.insert(StorageStatus::RDY);
            return Ok(());
        }
        let size = self.file.metadata().map(|m| m.len()).unwrap_or(0);
        let mut bytes = [0u8; 16];
        bytes[0..8].copy_from_slice(&size.to_le_bytes());
        bytes[8..16].copy_from_slice(&(size / SECTOR_SIZE).to_le_bytes());
        phys.write_buffer(addr, &bytes, false)?;
        self.status.remove(StorageStatus::ERR);
        self.status.insert(StorageStatus::RDY);
        Ok(())
    }

    fn handle_transfer_command(&mut self, phys: &mut PhysicalMmu, write: bool) -> Result<(), Exception> {
        self.status.remove(StorageStatus::RDY);
        self.status.remove(StorageStatus::TRN);
        let addr = self.data;

        if !phys.validate_read(addr, 40) {
            self.status.insert(StorageStatus::ERR);
            self.status.insert(StorageStatus::RDY);
            return Ok(());
        }
        let lba = phys.read64(addr)?;
        let count = phys.read64(addr + 8)?;
        let prls = phys.read64(addr + 16)?;
        let prlnc = phys.read64(addr + 24)?;
        let flags = phys.read64(addr + 32)?;
        let want_interrupt = flags & 1 != 0;

        let total_sectors = self.sector_count().unwrap_or(0);
        let fail = (want_interrupt && !self.status.contains(StorageStatus::INTE)) || count == 0 || lba + count > total_sectors;
        if fail {
            self.status.insert(StorageStatus::ERR);
            self.status.insert(StorageStatus::RDY);
            return Ok(());
        }

        self.status.insert(StorageStatus::TRN);
        self.status.remove(StorageStatus::ERR);
        self.pending = Some(PendingTransfer { lba, count, prls, prlnc, write, raise_interrupt: want_interrupt });
        Ok(())
    }
}

impl IoDevice for StorageDevice {
    fn size_registers(&self) -> u64 {
        3
    }

    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), Exception> {
        let value = match offset / 8 {
            0 => self.command,
            1 => self.status.bits() as u64,
            2 => self.data,
            _ => 0,
        };
        write_low_bytes(buf, value);
        Ok(())
    }

    fn write(&mut self, offset: u64, buf: &[u8]) -> Result<IoEffect, Exception> {
        let value = read_low_bytes(buf);
        match offset / 8 {
            0 => {
                self.command = value;
                return Ok(IoEffect::Command);
            }
            1 => self.status = StorageStatus::from_bits_truncate(value as u8),
            2 => self.data = value,
            _ => {}
        }
        Ok(IoEffect::None)
    }

    fn complete_effect(&mut self, phys: &mut PhysicalMmu) -> Result<(), Exception> {
        match StorageCommand::from_u64(self.command) {
            Some(StorageCommand::Configure) => {
                self.handle_configure();
                Ok(())
            }
            Some(StorageCommand::GetDeviceInfo) => self.handle_get_device_info(phys),
            Some(StorageCommand::Read) => self.handle_transfer_command(phys, false),
            Some(StorageCommand::Write) => self.handle_transfer_command(phys, true),
            None => {
                self.status.insert(StorageStatus::ERR);
                Ok(())
            }
        }
    }

    fn run_pending_transfer(&mut self, phys: &mut PhysicalMmu) -> Result<Option<u8>, Exception> {
        let Some(pending) = self.pending.take() else { return Ok(None) };

        let size = (pending.count * SECTOR_SIZE) as usize;
        let Some(items) = parse_physical_region_list(phys, pending.prls, pending.prlnc, size as u64) else {
            self.status.insert(StorageStatus::ERR);
            self.status.remove(StorageStatus::TRN);
            self.status.insert(StorageStatus::RDY);
            return Ok(None);
        };

        let offset = pending.lba * SECTOR_SIZE;
        if pending.write {
            let mut buf = vec![0u8; size];
            gather_from_guest(phys, &items, &mut buf)?;
            self.file.seek(SeekFrom::Start(offset)).map_err(|_| Exception::PhysMemViolation)?;
            self.file.write_all(&buf).map_err(|_| Exception::PhysMemViolation)?;
        } else {
            let mut buf = vec![0u8; size];
            self.file.seek(SeekFrom::Start(offset)).map_err(|_| Exception::PhysMemViolation)?;
            self.file.read_exact(&mut buf).map_err(|_| Exception::PhysMemViolation)?;
            scatter_to_guest(phys, &items, &buf)?;
        }

        self.status.remove(StorageStatus::TRN);
        self.status.remove(StorageStatus::ERR);
        self.status.insert(StorageStatus::RDY);

        if pending.raise_interrupt {
            self.status.insert(StorageStatus::INTP);
            Ok(Some(STORAGE_INTERRUPT_VECTOR))
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryRegion;
    use std::io::Write as _;

    fn device_with_backing(sectors: u64) -> (StorageDevice, PhysicalMmu) {
        let mut tmp = tempfile::tempfile().unwrap();
        tmp.write_all(&vec![0xAAu8; (sectors * SECTOR_SIZE) as usize]).unwrap();
        tmp.seek(SeekFrom::Start(0)).unwrap();
        let mut phys = PhysicalMmu::new();
        phys.add_region(MemoryRegion::ram(0, 0x10_0000));
        (StorageDevice::new(tmp), phys)
    }

    fn write_prl(phys: &mut PhysicalMmu, list_start: u64, item_start: u64, item_sectors: u64) {
        phys.write64(list_start, 1).unwrap(); // one item in this node
        phys.write64(list_start + 8, item_start).unwrap();
        phys.write64(list_start + 16, item_sectors).unwrap();
        phys.write64(list_start + 24, 0).unwrap(); // no next node needed (node_count = 1)
    }

    #[test]
    fn read_command_copies_disk_into_guest() {
        let (mut dev, mut phys) = device_with_backing(4);

        let prl_addr = 0x2000u64;
        let dest_addr = 0x3000u64;
        write_prl(&mut phys, prl_addr, dest_addr, 2);

        let req_addr = 0x1000u64;
        phys.write64(req_addr, 0).unwrap(); // LBA
        phys.write64(req_addr + 8, 2).unwrap(); // COUNT
        phys.write64(req_addr + 16, prl_addr).unwrap(); // PRLS
        phys.write64(req_addr + 24, 1).unwrap(); // PRLNC
        phys.write64(req_addr + 32, 0).unwrap(); // FLAGS

        dev.write(16, &req_addr.to_le_bytes()).unwrap(); // DATA
        dev.write(0, &2u64.to_le_bytes()).unwrap(); // COMMAND = READ
        dev.complete_effect(&mut phys).unwrap();
        assert!(dev.status.contains(StorageStatus::TRN));

        let vector = dev.run_pending_transfer(&mut phys).unwrap();
        assert_eq!(vector, None);
        assert!(!dev.status.contains(StorageStatus::TRN));
        assert!(!dev.status.contains(StorageStatus::ERR));

        let mut buf = [0u8; 16];
        phys.read_buffer(dest_addr, &mut buf, false).unwrap();
        assert_eq!(buf, [0xAA; 16]);
    }

    #[test]
    fn write_command_copies_guest_into_disk() {
        let (mut dev, mut phys) = device_with_backing(4);
        phys.write_buffer(0x3000, &[0x55; 16], false).unwrap();

        let prl_addr = 0x2000u64;
        write_prl(&mut phys, prl_addr, 0x3000, 2);

        let req_addr = 0x1000u64;
        phys.write64(req_addr, 0).unwrap();
        phys.write64(req_addr + 8, 2).unwrap();
        phys.write64(req_addr + 16, prl_addr).unwrap();
        phys.write64(req_addr + 24, 1).unwrap();
        phys.write64(req_addr + 32, 0).unwrap();

        dev.write(16, &req_addr.to_le_bytes()).unwrap();
        dev.write(0, &3u64.to_le_bytes()).unwrap(); // COMMAND = WRITE
        dev.complete_effect(&mut phys).unwrap();
        dev.run_pending_transfer(&mut phys).unwrap();

        let mut disk_bytes = [0u8; 16];
        dev.file.seek(SeekFrom::Start(0)).unwrap();
        dev.file.read_exact(&mut disk_bytes).unwrap();
        assert_eq!(disk_bytes, [0x55; 16]);
    }

    #[test]
    fn zero_count_is_rejected() {
        let (mut dev, mut phys) = device_with_backing(4);
        let req_addr = 0x1000u64;
        phys.write64(req_addr, 0).unwrap();
        phys.write64(req_addr + 8, 0).unwrap(); // COUNT = 0
        phys.write64(req_addr + 16, 0).unwrap();
        phys.write64(req_addr + 24, 0).unwrap();
        phys.write64(req_addr + 32, 0).unwrap();

        dev.write(16, &req_addr.to_le_bytes()).unwrap();
        dev.write(0, &2u64.to_le_bytes()).unwrap();
        dev.complete_effect(&mut phys).unwrap();
        assert!(dev.status.contains(StorageStatus::ERR));
        assert!(dev.pending.is_none());
    }
}
