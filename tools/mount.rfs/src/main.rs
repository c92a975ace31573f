//! mount.rfs - open an rfs-core image, validate its superblock, and report
//! the root directory's contents plus basic filesystem statistics.
//!
//! This is a smoke-test surface over the core library, not a real OS mount:
//! there is no kernel-side VFS bridge here, so `--mount` only labels the
//! report rather than attaching anything to the system's namespace.
//!
//! Usage:
//!   mount.rfs --image disk.img --mount /mnt/rfs

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use rfs_core::device::FileDevice;
use rfs_core::fs::Filesystem;
use rfs_core::mft::FileType;

#[derive(Parser)]
#[command(name = "mount.rfs")]
#[command(about = "Inspect an rfs-core image: superblock, root directory, and free-space stats")]
struct Args {
    /// Backing image file to open.
    #[arg(long)]
    image: PathBuf,

    /// Label for the report; not an actual OS mount point.
    #[arg(long)]
    mount: String,

    /// Byte offset of the superblock within the image.
    #[arg(long, default_value_t = 0)]
    sbo: u64,

    /// Raise the log filter to debug level.
    #[arg(long)]
    debug: bool,
}

fn type_name(file_type: u8) -> &'static str {
    match FileType::from_u8(file_type) {
        Some(FileType::File) => "file",
        Some(FileType::Dir) => "dir",
        Some(FileType::Fifo) => "fifo",
        Some(FileType::Metadata) => "metadata",
        None => "unknown",
    }
}

fn run(args: Args) -> Result<(), String> {
    let filter = if args.debug { log::LevelFilter::Debug } else { log::LevelFilter::Info };
    env_logger::Builder::from_default_env().filter_level(filter).init();

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&args.image)
        .map_err(|e| format!("opening {}: {}", args.image.display(), e))?;
    let device = FileDevice::open(file).map_err(|e| format!("opening {}: {}", args.image.display(), e))?;

    let mut fs = Filesystem::load(device, args.sbo).map_err(|e| format!("loading {}: {}", args.image.display(), e))?;

    let sb = fs.superblock();
    println!("rfs image {} mounted read-only at {}", args.image.display(), args.mount);
    println!("  block size:   {} bytes", sb.block_size);
    println!("  block count:  {}", sb.block_count);
    println!("  disk serial:  {:#018x}", sb.disk_serial);
    println!("  dir seg size: {} bytes", sb.dir_seg_size);

    let free = fs.free_blocks().map_err(|e| format!("scanning bitmap: {}", e))?;
    println!("  free blocks:  {} / {}", free, sb.block_count);

    let root = fs.root_dir();
    println!("\n{}:", args.mount);
    let mut entries = Vec::new();
    fs.dir_list(root, |name, value| {
        entries.push((name.to_string(), value));
        true
    })
    .map_err(|e| format!("listing root directory: {}", e))?;
    if entries.is_empty() {
        println!("  (empty)");
    }
    for (name, value) in entries {
        println!("  {:<24} {:<8} ({}, {})", name, type_name(value.file_type), value.file_table, value.file_slot);
    }

    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(msg) => {
            eprintln!("mount.rfs: {}", msg);
            ExitCode::FAILURE
        }
    }
}
