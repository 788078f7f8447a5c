// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::exception::Exception;
use crate::memory::PhysicalMmu;
use super::{read_low_bytes, write_low_bytes, IoDevice, IoEffect};

/// One advertised display mode. `NATIVE` is the mode the backend starts in;
/// spec.md §6.2 names it plus four fixed alternates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VideoMode {
    pub width: u32,
    pub height: u32,
    pub refresh_hz: u16,
    pub bpp: u16,
    pub pitch: u32,
}

impl VideoMode {
    pub const NATIVE: VideoMode = VideoMode { width: 1024, height: 768, refresh_hz: 60, bpp: 32, pitch: 1024 * 4 };

    const fn new(width: u32, height: u32) -> VideoMode {
        VideoMode { width, height, refresh_hz: 60, bpp: 32, pitch: width * 4 }
    }
}

fn default_modes() -> Vec<VideoMode> {
    vec![
        VideoMode::NATIVE,
        VideoMode::new(640, 480),
        VideoMode::new(800, 600),
        VideoMode::new(1280, 720),
        VideoMode::new(1920, 1080),
    ]
}

/// Host-side display sink the device drives through mode changes.
/// Framebuffer pixels themselves are not pushed through this trait: the
/// guest writes them as ordinary RAM (the carved-out segment described by
/// `VideoDevice::framebuffer`), and a render thread on the host side polls
/// that range directly, per spec.md §5's single-writer/single-reader
/// framebuffer model. This trait only covers backend lifecycle.
pub trait VideoBackend: std::fmt::Debug {
    fn init(&mut self);
    fn set_mode(&mut self, mode: VideoMode);
}

/// No-op backend selected by `-d none`.
#[derive(Debug, Default)]
pub struct NullVideoBackend;

impl VideoBackend for NullVideoBackend {
    fn init(&mut self) {}
    fn set_mode(&mut self, _mode: VideoMode) {}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
enum VideoCommand {
    Initialise = 0,
    GetScreenInfo = 1,
    GetMode = 2,
    SetMode = 3,
}

impl VideoCommand {
    fn from_u64(value: u64) -> Option<VideoCommand> {
        match value {
            0 => Some(VideoCommand::Initialise),
            1 => Some(VideoCommand::GetScreenInfo),
            2 => Some(VideoCommand::GetMode),
            3 => Some(VideoCommand::SetMode),
            _ => None,
        }
    }
}

/// Bus base 16, 3 registers: COMMAND, DATA, STATUS (spec.md §6.2).
#[derive(Debug)]
pub struct VideoDevice {
    command: u64,
    data: u64,
    status: u64,
    initialised: bool,
    modes: Vec<VideoMode>,
    current_mode_index: u64,
    /// `(start, end)` of the RAM segment currently carved out as the
    /// framebuffer, if a mode has been set.
    framebuffer: Option<(u64, u64)>,
    backend: Box<dyn VideoBackend>,
}

impl VideoDevice {
    pub fn new(backend: Box<dyn VideoBackend>) -> Self {
        VideoDevice {
            command: 0,
            data: 0,
            status: 0,
            initialised: false,
            modes: Vec::new(),
            current_mode_index: 0,
            framebuffer: None,
            backend,
        }
    }

    /// The physical range currently claimed as the framebuffer, if any.
    pub fn framebuffer_range(&self) -> Option<(u64, u64)> {
        self.framebuffer
    }

    fn handle_initialise(&mut self) {
        if self.initialised {
            return;
        }
        self.modes = default_modes();
        self.backend.init();
        self.current_mode_index = 0;
        self.initialised = true;
        self.status = 0;
    }

    fn handle_get_screen_info(&mut self, phys: &mut PhysicalMmu) -> Result<(), Exception> {
        if !self.initialised {
            self.status = 1;
            return Ok(());
        }
        let mode = VideoMode::NATIVE;
        let mut bytes = [0u8; 16];
        bytes[0..4].copy_from_slice(&mode.width.to_le_bytes());
        bytes[4..8].copy_from_slice(&mode.height.to_le_bytes());
        bytes[8..10].copy_from_slice(&mode.refresh_hz.to_le_bytes());
        bytes[10..12].copy_from_slice(&mode.bpp.to_le_bytes());
        bytes[12..14].copy_from_slice(&(self.modes.len() as u16).to_le_bytes());
        bytes[14..16].copy_from_slice(&(self.current_mode_index as u16).to_le_bytes());

        if !phys.validate_read(self.data, bytes.len() as u64) {
            self.status = 1;
            return Ok(());
        }
        phys.write_buffer(self.data, &bytes, false)?;
        self.status = 0;
        Ok(())
    }

    fn handle_get_mode(&mut self, phys: &mut PhysicalMmu) -> Result<(), Exception> {
        if !self.initialised {
            self.status = 1;
            return Ok(());
        }
        if !phys.validate_read(self.data, 10) {
            self.status = 1;
            return Ok(());
        }
        let address = phys.read64(self.data)?;
        let index = phys.read16(self.data + 8)? as usize;
        let Some(mode) = self.modes.get(index) else {
            self.status = 1;
            return Ok(());
        };

        let mut bytes = [0u8; 16];
        bytes[0..4].copy_from_slice(&mode.width.to_le_bytes());
        bytes[4..8].copy_from_slice(&mode.height.to_le_bytes());
        bytes[8..10].copy_from_slice(&mode.bpp.to_le_bytes());
        bytes[10..14].copy_from_slice(&mode.pitch.to_le_bytes());
        bytes[14..16].copy_from_slice(&mode.refresh_hz.to_le_bytes());

        if !phys.validate_read(address, bytes.len() as u64) {
            self.status = 1;
            return Ok(());
        }
        phys.write_buffer(address, &bytes, false)?;
        self.status = 0;
        Ok(())
    }

    fn handle_set_mode(&mut self, phys: &mut PhysicalMmu) -> Result<(), Exception> {
        if !self.initialised {
            self.status = 1;
            return Ok(());
        }
        if !phys.validate_read(self.data, 10) {
            self.status = 1;
            return Ok(());
        }
        let address = phys.read64(self.data)?;
        let mode_index = phys.read16(self.data + 8)? as usize;
        let Some(&mode) = self.modes.get(mode_index) else {
            self.status = 1;
            return Ok(());
        };

        if let Some((start, data)) = self.framebuffer.take().and_then(|(start, end)| {
            let len = end - start;
            Some((start, vec![0u8; len as usize]))
        }) {
            phys.readd_region_segment(start, data);
        }

        let size = mode.pitch as u64 * mode.height as u64;
        let Some(_removed) = phys.remove_region_segment(address, address + size) else {
            self.status = 1;
            return Ok(());
        };
        self.framebuffer = Some((address, address + size));
        self.backend.set_mode(mode);
        self.current_mode_index = mode_index as u64;
        self.status = 0;
        Ok(())
    }
}

impl IoDevice for VideoDevice {
    fn size_registers(&self) -> u64 {
        3
    }

    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), Exception> {
        let value = match offset / 8 {
            1 => self.data,
            2 => self.status,
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
            1 => self.data = value,
            _ => {}
        }
        Ok(IoEffect::None)
    }

    fn complete_effect(&mut self, phys: &mut PhysicalMmu) -> Result<(), Exception> {
        match VideoCommand::from_u64(self.command) {
            Some(VideoCommand::Initialise) => {
                self.handle_initialise();
                Ok(())
            }
            Some(VideoCommand::GetScreenInfo) => self.handle_get_screen_info(phys),
            Some(VideoCommand::GetMode) => self.handle_get_mode(phys),
            Some(VideoCommand::SetMode) => self.handle_set_mode(phys),
            None => {
                self.status = 1;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryRegion;

    fn device_with_ram() -> (VideoDevice, PhysicalMmu) {
        let mut phys = PhysicalMmu::new();
        phys.add_region(MemoryRegion::ram(0, 0x10_0000));
        (VideoDevice::new(Box::new(NullVideoBackend)), phys)
    }

    #[test]
    fn initialise_populates_modes() {
        let (mut dev, mut phys) = device_with_ram();
        dev.write(0, &0u64.to_le_bytes()).unwrap();
        dev.complete_effect(&mut phys).unwrap();
        assert_eq!(dev.modes.len(), 5);
        assert!(dev.initialised);
    }

    #[test]
    fn get_screen_info_before_init_sets_error_status() {
        let (mut dev, mut phys) = device_with_ram();
        dev.write(8, &0x100u64.to_le_bytes()).unwrap(); // DATA
        dev.write(0, &1u64.to_le_bytes()).unwrap(); // COMMAND = GET_SCREEN_INFO
        dev.complete_effect(&mut phys).unwrap();
        let mut status = [0u8; 8];
        dev.read(16, &mut status).unwrap();
        assert_eq!(u64::from_le_bytes(status), 1);
    }

    #[test]
    fn set_mode_carves_framebuffer_segment() {
        let (mut dev, mut phys) = device_with_ram();
        dev.write(0, &0u64.to_le_bytes()).unwrap();
        dev.complete_effect(&mut phys).unwrap(); // INITIALISE

        let request_addr = 0x1000u64;
        phys.write64(request_addr, 0x2000).unwrap(); // target address for framebuffer
        phys.write16(request_addr + 8, 1).unwrap(); // mode index 1 = 640x480

        dev.write(8, &request_addr.to_le_bytes()).unwrap(); // DATA
        dev.write(0, &3u64.to_le_bytes()).unwrap(); // COMMAND = SET_MODE
        dev.complete_effect(&mut phys).unwrap();

        let (start, end) = dev.framebuffer_range().unwrap();
        assert_eq!(start, 0x2000);
        assert_eq!(end - start, 640 * 4 * 480);
    }
}
