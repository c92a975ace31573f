//! mkfs.rfs - format a backing image file as an rfs-core filesystem.
//!
//! Usage:
//!   mkfs.rfs --image disk.img --bsize 4 --bsord K --mft 4 --mftord K
//!   mkfs.rfs --image disk.img --bsize 4 --bsord K --mft 4 --mftord K --sbo 512 --trace

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use rfs_core::device::{BlockDevice, FileDevice};
use rfs_core::fs::{mkfs, FormatOptions};

/// Block sizes and MFT block counts must be one of these before a size
/// order is applied.
const VALID_COUNTS: [u32; 10] = [1, 2, 4, 8, 16, 32, 64, 128, 256, 512];

#[derive(Parser)]
#[command(name = "mkfs.rfs")]
#[command(about = "Format a backing image file as an rfs-core filesystem")]
struct Args {
    /// Backing image file to format; must already exist at its target size.
    #[arg(long)]
    image: PathBuf,

    /// Block size, as a count in {1,2,4,...,512} to be multiplied by `bsord`.
    #[arg(long)]
    bsize: u32,

    /// Order applied to `bsize`: K (KiB), M (MiB), or * (bytes, unscaled).
    #[arg(long)]
    bsord: String,

    /// MFT block count, as a count in {1,2,4,...,512} to be multiplied by `mftord`.
    #[arg(long)]
    mft: u32,

    /// Order applied to `mft`: K (KiB-equivalent blocks), M, or * (unscaled).
    #[arg(long)]
    mftord: String,

    /// Byte offset of the superblock within the image.
    #[arg(long, default_value_t = 0)]
    sbo: u64,

    /// Raise the log filter to trace level.
    #[arg(long)]
    trace: bool,
}

fn order_multiplier(order: &str) -> Result<u32, String> {
    match order {
        "K" => Ok(1024),
        "M" => Ok(1024 * 1024),
        "*" => Ok(1),
        other => Err(format!("invalid order {:?}; expected one of K, M, *", other)),
    }
}

fn scaled_count(name: &str, n: u32, order: &str) -> Result<u32, String> {
    if !VALID_COUNTS.contains(&n) {
        return Err(format!("{} must be a power of two in 1..=512, got {}", name, n));
    }
    let mult = order_multiplier(order)?;
    n.checked_mul(mult).ok_or_else(|| format!("{} overflows after applying order {:?}", name, order))
}

fn run(args: Args) -> Result<(), String> {
    let filter = if args.trace { log::LevelFilter::Trace } else { log::LevelFilter::Info };
    env_logger::Builder::from_default_env().filter_level(filter).init();

    let block_size = scaled_count("bsize", args.bsize, &args.bsord)?;
    let mft_blocks = scaled_count("mft", args.mft, &args.mftord)?;

    if !args.image.exists() {
        return Err(format!("image {} does not exist; create it at its target size first", args.image.display()));
    }

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&args.image)
        .map_err(|e| format!("opening {}: {}", args.image.display(), e))?;
    let device = FileDevice::open(file).map_err(|e| format!("opening {}: {}", args.image.display(), e))?;

    let image_len = device.len();
    if args.sbo + rfs_core::superblock::SUPERBLOCK_SIZE as u64 > image_len {
        return Err(format!("superblock offset {} does not fit in a {}-byte image", args.sbo, image_len));
    }

    let opts = FormatOptions { sbo: args.sbo, block_size, mft_blocks, dir_seg_size: 4096 };

    println!("Formatting {} ({} bytes) with block size {} and {} MFT block(s)...", args.image.display(), image_len, block_size, mft_blocks);

    let fs = mkfs(device, opts).map_err(|e| format!("mkfs failed: {}", e))?;
    let sb = fs.superblock();
    println!("Done. {} blocks total, root directory at {:?}.", sb.block_count, fs.root_dir());

    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(msg) => {
            eprintln!("mkfs.rfs: {}", msg);
            ExitCode::FAILURE
        }
    }
}
