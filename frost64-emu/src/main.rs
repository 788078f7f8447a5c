// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! CLI entry point: loads a flat Frost64 binary image, wires up the
//! console/video/storage devices, and runs it to completion.

use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use frost64_core::io::{ConsoleDevice, IoBus, NullVideoBackend, StorageDevice, VideoDevice};
use frost64_core::register::RegisterId;
use frost64_core::Cpu;

const DEFAULT_RAM_BYTES: u64 = 1 << 20;
const CONSOLE_BASE: u64 = 0;
const VIDEO_BASE: u64 = 16;
const STORAGE_BASE: u64 = 40;

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
enum VideoBackendKind {
    Sdl,
    None,
}

/// Runs a Frost64 program as a virtual machine.
#[derive(Parser)]
#[command(name = "frost64-emu", version, about)]
struct Cli {
    /// Flat binary image to load into the BIOS region.
    #[arg(short = 'p', long = "program")]
    program: PathBuf,

    /// RAM size in bytes.
    #[arg(short = 'm', long = "memory", default_value_t = DEFAULT_RAM_BYTES)]
    ram_bytes: u64,

    /// Video backend. The SDL backend is not carried by this crate; both
    /// values currently select the no-op backend.
    #[arg(short = 'd', long = "display", value_enum, default_value = "none")]
    display: VideoBackendKind,

    /// Backing file for the storage device. Without this flag, no storage
    /// device is registered on the I/O bus.
    #[arg(short = 'D', long = "drive")]
    drive: Option<PathBuf>,
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    if cli.display == VideoBackendKind::Sdl {
        log::warn!("SDL video backend is not available in this build; falling back to no-op display");
    }

    let image = match fs::read(&cli.program) {
        Ok(bytes) => bytes,
        Err(e) => {
            log::error!("cannot read {}: {e}", cli.program.display());
            return ExitCode::FAILURE;
        }
    };

    let mut bus = IoBus::new();
    if let Err(e) = bus.add_device(CONSOLE_BASE, Box::new(ConsoleDevice::new())) {
        log::error!("cannot register console device: {e}");
        return ExitCode::FAILURE;
    }
    if let Err(e) = bus.add_device(VIDEO_BASE, Box::new(VideoDevice::new(Box::new(NullVideoBackend)))) {
        log::error!("cannot register video device: {e}");
        return ExitCode::FAILURE;
    }
    if let Some(drive_path) = &cli.drive {
        let file = match fs::OpenOptions::new().read(true).write(true).open(drive_path) {
            Ok(f) => f,
            Err(e) => {
                log::error!("cannot open drive image {}: {e}", drive_path.display());
                return ExitCode::FAILURE;
            }
        };
        if let Err(e) = bus.add_device(STORAGE_BASE, Box::new(StorageDevice::new(file))) {
            log::error!("cannot register storage device: {e}");
            return ExitCode::FAILURE;
        }
    }

    let mut cpu = Cpu::with_io_bus(cli.ram_bytes, bus);
    if let Err(e) = cpu.load_image(&image) {
        log::error!("cannot load {}: {e}", cli.program.display());
        return ExitCode::FAILURE;
    }

    match cpu.run_until_halt() {
        Ok(()) => ExitCode::SUCCESS,
        Err(exc) => {
            log::error!("VM crashed: {exc}");
            dump_registers(&cpu);
            ExitCode::FAILURE
        }
    }
}

/// Crash diagnostic: every architectural register's value.
fn dump_registers(cpu: &Cpu) {
    let regs = cpu.registers();
    for id in RegisterId::R {
        log::error!("{:>4} = {:#018x}", id.name(), regs.read(id, false).unwrap());
    }
    for name_id in [RegisterId::SCP, RegisterId::SBP, RegisterId::STP, RegisterId::STS, RegisterId::IP] {
        log::error!("{:>4} = {:#018x}", name_id.name(), regs.read(name_id, false).unwrap());
    }
    for i in 0..8 {
        let id = RegisterId::control(i);
        log::error!("{:>4} = {:#018x}", id.name(), regs.read(id, false).unwrap());
    }
}
