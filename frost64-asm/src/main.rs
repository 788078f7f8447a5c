// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! CLI entry point: reads an assembly source file, assembles it, and
//! writes the resulting flat binary image.

use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

/// Assembles a Frost64 source file into a flat binary image.
#[derive(Parser)]
#[command(name = "frost64-asm", version, about)]
struct Cli {
    /// Assembly source file to compile.
    input: PathBuf,

    /// Where to write the assembled image.
    #[arg(short, long, default_value = "a.bin")]
    output: PathBuf,
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    let source = match fs::read_to_string(&cli.input) {
        Ok(s) => s,
        Err(e) => {
            log::error!("cannot read {}: {e}", cli.input.display());
            return ExitCode::FAILURE;
        }
    };

    let file_name = cli.input.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_else(|| cli.input.display().to_string());
    let include_dir = cli.input.parent().map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."));

    let image = match frost64_asm::assemble(&source, &file_name, &include_dir) {
        Ok(image) => image,
        Err(e) => {
            log::error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = fs::write(&cli.output, &image) {
        log::error!("cannot write {}: {e}", cli.output.display());
        return ExitCode::FAILURE;
    }

    log::info!("wrote {} bytes to {}", image.len(), cli.output.display());
    ExitCode::SUCCESS
}
