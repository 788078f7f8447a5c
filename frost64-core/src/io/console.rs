// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::io::{Read, Write};

use crate::exception::Exception;
use super::{write_low_bytes, IoDevice, IoEffect};

/// Single-register console at bus base 0 (spec.md §4.6): a byte-width read
/// blocks on stdin, a byte-width write emits to stdout. Wider accesses are
/// defined to be no-ops, matching the original `ConsoleDevice`.
#[derive(Debug, Default)]
pub struct ConsoleDevice;

impl ConsoleDevice {
    pub fn new() -> Self {
        ConsoleDevice
    }
}

impl IoDevice for ConsoleDevice {
    fn size_registers(&self) -> u64 {
        1
    }

    fn read(&mut self, _offset: u64, buf: &mut [u8]) -> Result<(), Exception> {
        if buf.len() == 1 {
            let mut byte = [0u8; 1];
            // A stdin read failure (EOF, closed pipe) surfaces as a byte
            // of zero rather than a guest-visible fault; the bus has no
            // vector for host I/O errors.
            let _ = std::io::stdin().lock().read_exact(&mut byte);
            buf[0] = byte[0];
        } else {
            write_low_bytes(buf, 0);
        }
        Ok(())
    }

    fn write(&mut self, _offset: u64, buf: &[u8]) -> Result<IoEffect, Exception> {
        if buf.len() == 1 {
            let _ = std::io::stdout().lock().write_all(&buf[..1]);
            let _ = std::io::stdout().lock().flush();
        }
        Ok(IoEffect::None)
    }
}
