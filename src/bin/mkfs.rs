//! `mkfs [-s sector_size] [-c sectors_per_cluster] [-n label] size device`
//!
//! Creates a zero-filled image of the requested size and formats it.
//! Sizes take K/M/G suffixes (powers of 1024).

use std::process::ExitCode;

use clap::Parser;

use skinnyfat::device::FileDevice;
use skinnyfat::mkfs::{format, parse_size, FormatOptions};

#[derive(Parser, Debug)]
#[command(name = "mkfs", about = "Create a FAT / Skinny28 file system")]
struct Args {
    /// Sector size in bytes
    #[arg(short = 's', default_value_t = 512)]
    sector_size: u16,

    /// Sectors per cluster (chosen from the size tables when omitted)
    #[arg(short = 'c')]
    sectors_per_cluster: Option<u8>,

    /// Volume label
    #[arg(short = 'n')]
    label: Option<String>,

    /// Volume size, with an optional K/M/G suffix
    size: String,

    /// Image file or device node to create
    device: String,
}

fn run(args: &Args) -> Result<(), String> {
    let size = parse_size(&args.size).ok_or_else(|| format!("bad size {:?}", args.size))?;

    let options = FormatOptions {
        sector_size: args.sector_size,
        sectors_per_cluster: args.sectors_per_cluster,
        label: args.label.clone(),
    };

    let device = FileDevice::create(&args.device, size)
        .map_err(|e| format!("{}: {e}", args.device))?;
    format(&device, &options).map_err(|e| format!("{}: {e}", args.device))?;

    println!("Sector Size: {} Bytes", args.sector_size);
    println!("Size: {size} Bytes");
    println!("Formatted {}", args.device);
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("mkfs: {message}");
            ExitCode::FAILURE
        }
    }
}
