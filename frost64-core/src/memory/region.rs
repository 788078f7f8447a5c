// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::exception::Exception;
use crate::io::IoBus;

/// What a [`MemoryRegion`] is backed by.
pub enum RegionKind {
    /// Plain read/write RAM.
    Ram(Vec<u8>),
    /// The loaded program image. Backed the same way as RAM, but
    /// `real_size` (the length of the image actually copied in) is kept
    /// alongside the full reserved span for register-dump purposes.
    Bios { data: Vec<u8>, real_size: usize },
    /// Delegates reads/writes to the I/O bus, offset-relative to the
    /// region's own start.
    Io(IoBus),
}

/// A `[start, end)` byte range of the physical address space, owned by
/// exactly one [`super::PhysicalMmu`]. Regions never overlap.
pub struct MemoryRegion {
    start: u64,
    end: u64,
    kind: RegionKind,
}

impl MemoryRegion {
    pub fn ram(start: u64, len: u64) -> Self {
        MemoryRegion { start, end: start + len, kind: RegionKind::Ram(vec![0; len as usize]) }
    }

    /// A RAM region backed by pre-existing bytes, e.g. a slice carved out of
    /// another region by [`super::PhysicalMmu::remove_region_segment`].
    pub fn ram_with_data(start: u64, data: Vec<u8>) -> Self {
        let end = start + data.len() as u64;
        MemoryRegion { start, end, kind: RegionKind::Ram(data) }
    }

    pub fn bios(start: u64, reserved_len: u64, image: &[u8]) -> Self {
        let mut data = vec![0u8; reserved_len as usize];
        data[..image.len()].copy_from_slice(image);
        MemoryRegion { start, end: start + reserved_len, kind: RegionKind::Bios { data, real_size: image.len() } }
    }

    pub fn io(start: u64, len: u64, bus: IoBus) -> Self {
        MemoryRegion { start, end: start + len, kind: RegionKind::Io(bus) }
    }

    pub const fn start(&self) -> u64 {
        self.start
    }

    pub const fn end(&self) -> u64 {
        self.end
    }

    pub const fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }

    pub const fn kind(&self) -> &RegionKind {
        &self.kind
    }

    pub(crate) fn kind_mut(&mut self) -> &mut RegionKind {
        &mut self.kind
    }

    pub(crate) fn into_parts(self) -> (u64, u64, RegionKind) {
        (self.start, self.end, self.kind)
    }

    /// Bytes actually meaningful for a dump: the whole backing store for
    /// RAM, or just the loaded image for BIOS.
    pub fn dump_bytes(&self) -> &[u8] {
        match &self.kind {
            RegionKind::Ram(data) => data,
            RegionKind::Bios { data, real_size } => &data[..*real_size],
            RegionKind::Io(_) => &[],
        }
    }

    /// `user_mode_protected` gates I/O bus access the same way it gates
    /// control-register access in [`crate::register`]: true when protected
    /// mode is on and the CPU is currently in user mode.
    pub fn read(&mut self, addr: u64, buf: &mut [u8], user_mode_protected: bool) -> Result<(), Exception> {
        let offset = (addr - self.start) as usize;
        match &mut self.kind {
            RegionKind::Ram(data) | RegionKind::Bios { data, .. } => {
                buf.copy_from_slice(&data[offset..offset + buf.len()]);
                Ok(())
            }
            RegionKind::Io(bus) => bus.read(offset as u64, buf, user_mode_protected),
        }
    }

    pub fn write(&mut self, addr: u64, buf: &[u8], user_mode_protected: bool) -> Result<(), Exception> {
        let offset = (addr - self.start) as usize;
        match &mut self.kind {
            RegionKind::Ram(data) | RegionKind::Bios { data, .. } => {
                data[offset..offset + buf.len()].copy_from_slice(buf);
                Ok(())
            }
            RegionKind::Io(bus) => bus.write(offset as u64, buf, user_mode_protected).map(|_| ()),
        }
    }
}
