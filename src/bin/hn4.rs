use std::fs::OpenOptions;
use std::path::PathBuf;

use clap::{ArgEnum, Parser, Subcommand};

use hn4::chronicle::LogSink;
use hn4::config::Config;
use hn4::device::DeviceType;
use hn4::hal::{FileHal, HwFlags};
use hn4::io;
use hn4::volume::Volume;

const DEFAULT_IMAGE_BLOCKS: u64 = 1 << 16; // 32MiB at 512-byte blocks
const BLOCK_SIZE: u32 = 512;

#[derive(Debug, Clone, Copy, ArgEnum)]
enum DeviceTypeArg {
    Ssd,
    Hdd,
    Zns,
    Tape,
    Usb,
    Pico,
}

impl From<DeviceTypeArg> for DeviceType {
    fn from(v: DeviceTypeArg) -> Self
    {
        match v {
            DeviceTypeArg::Ssd => DeviceType::Ssd,
            DeviceTypeArg::Hdd => DeviceType::Hdd,
            DeviceTypeArg::Zns => DeviceType::Zns,
            DeviceTypeArg::Tape => DeviceType::Tape,
            DeviceTypeArg::Usb => DeviceType::Usb,
            DeviceTypeArg::Pico => DeviceType::Pico,
        }
    }
}

/// Mounts (or formats) an HN4 volume backed by a plain file and runs one
/// operation against it.
#[derive(Debug, Parser)]
#[clap(name = "hn4", about = "Ballistic-placement block storage demo")]
struct Args {
    /// Backing image path
    #[clap(short, long, parse(from_os_str), value_name = "IMAGE")]
    drive: PathBuf,

    /// Format a fresh volume before running the command (truncates the
    /// image to a fixed demo size if it does not already exist)
    #[clap(long)]
    format: bool,

    /// Device profile to format/mount with
    #[clap(short = 't', long = "type", arg_enum, value_name = "TYPE", default_value = "ssd")]
    device_type: DeviceTypeArg,

    /// Set verbosity of the output (can be used multiple times)
    #[clap(short, long, parse(from_occurrences))]
    verbose: u32,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Creates an empty anchor
    Create { name: String },
    /// Writes a single block's worth of text to logical index 0
    Write { name: String, text: String },
    /// Reads logical index 0 back as UTF-8 (lossy)
    Read { name: String },
    /// Soft-deletes an anchor by name
    Delete { name: String },
    /// Recovers a soft-deleted anchor by name
    Undelete { name: String },
}

fn main() -> anyhow::Result<()>
{
    let args = Args::parse();

    let level = match args.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        _ => log::LevelFilter::Debug,
    };
    env_logger::Builder::new().filter_level(level).init();

    let is_new = args.format && !args.drive.exists();

    let file = OpenOptions::new().create(args.format).read(true).write(true).open(&args.drive)?;

    if is_new {
        file.set_len(DEFAULT_IMAGE_BLOCKS * BLOCK_SIZE as u64)?;
    }

    let hal = FileHal::new(file, BLOCK_SIZE, HwFlags::default());
    let cfg = Config::default_for(args.device_type.into()).with_chronicle(std::sync::Arc::new(LogSink));

    let volume = if args.format {
        Volume::format_and_mount(Box::new(hal), &cfg)?.value
    } else {
        Volume::mount(Box::new(hal), &cfg)?.value
    };

    match args.command {
        Command::Create { name } => {
            let index = volume.create_file(&name)?;
            println!("created '{name}' at anchor slot {index}");
        }
        Command::Write { name, text } => {
            let index = volume.find_file(&name).ok_or(hn4::Error::NotFound)?;
            io::atomic_write(&volume, index, 0, text.as_bytes())?;
            println!("wrote {} bytes to '{name}'", text.len());
        }
        Command::Read { name } => {
            let index = volume.find_file(&name).ok_or(hn4::Error::NotFound)?;
            let anchor = volume.cortex().get(index).ok_or(hn4::Error::NotFound)?;
            let data = io::atomic_read(&volume, &anchor, 0)?.value;
            println!("{}", String::from_utf8_lossy(&data));
        }
        Command::Delete { name } => {
            let index = volume.find_file(&name).ok_or(hn4::Error::NotFound)?;
            volume.delete_file(index)?;
            println!("deleted '{name}'");
        }
        Command::Undelete { name } => {
            io::undelete(&volume, &name)?;
            println!("undeleted '{name}'");
        }
    }

    volume.unmount()?;
    Ok(())
}
