use std::{path::PathBuf, process::ExitCode};

use clap::{Args, Parser, Subcommand};
use clap_num::maybe_hex;
use parse_size::parse_size;

use dfu::{
    DfuDevice, DfuError, DfuInterface, DfuseOptions, TransportError,
    find_dfu_devices,
};
use dfufile::{ID_WILDCARD, Prefix, PrefixKind, SuffixIds};
use error::CliError;
use list::*;

mod detach;
mod download;
mod error;
mod file;
mod list;
mod progress;
mod upload;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// print protocol details (same as RUST_LOG=debug)
    #[clap(long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Args, Clone, Copy)]
struct DeviceArgs {
    /// vendor ID (ex: "0483")
    #[clap(short, long, value_parser=hex_u16)]
    vendor: Option<u16>,
    /// product ID (ex: "df11")
    #[clap(short, long, value_parser=hex_u16)]
    product: Option<u16>,
}

#[derive(Args)]
struct TransferArgs {
    #[command(flatten)]
    device: DeviceArgs,
    /// alternate setting, by number or by name (ex: "0", "Internal Flash")
    #[clap(short, long, value_parser=parse_alt)]
    alt: Option<AltSetting>,
    /// bytes per control transfer, defaults to wTransferSize
    #[clap(short, long, value_parser=maybe_hex::<u16>, default_value_t = 0)]
    transfer_size: u16,
    /// DfuSe options: address[:leave][:mass-erase][:unprotect][:will-reset][:force][:length]
    #[clap(short = 's', long = "dfuse-address", value_parser=parse_dfuse)]
    dfuse: Option<DfuseOptions>,
}

#[derive(Subcommand)]
enum Commands {
    /// list DFU devices
    List {
        #[command(flatten)]
        device: DeviceArgs,
    },
    /// switch a device from run-time to DFU mode
    Detach {
        #[command(flatten)]
        device: DeviceArgs,
        /// detach timeout in milliseconds
        #[clap(short, long, default_value_t = 1000)]
        timeout: u16,
        /// issue a USB reset after the detach request
        #[clap(short, long)]
        reset: bool,
        /// wait for the device to come back in DFU mode
        #[clap(short, long)]
        wait: bool,
    },
    /// write firmware to device
    Download {
        /// firmware file (raw binary or DfuSe image, with optional DFU suffix)
        file: PathBuf,
        #[command(flatten)]
        args: TransferArgs,
        /// reset the device when it waits for one after the download
        #[clap(short = 'R', long)]
        reset: bool,
    },
    /// read firmware from device
    Upload {
        /// file to create
        file: PathBuf,
        #[command(flatten)]
        args: TransferArgs,
        /// length (ex: 64K, 2MB)
        #[clap(short, long, value_parser=parse_length)]
        length: Option<u32>,
        /// append a DFU suffix with the device identity
        #[clap(long)]
        suffix: bool,
    },
    /// USB reset of the device
    Reset {
        #[command(flatten)]
        device: DeviceArgs,
    },
    /// check, add or remove the DFU suffix of a file
    Suffix {
        #[command(subcommand)]
        command: SuffixCommand,
    },
    /// check, add or remove the prefix of a file
    Prefix {
        #[command(subcommand)]
        command: PrefixCommand,
    },
}

#[derive(Subcommand)]
enum SuffixCommand {
    /// print the DFU suffix
    Check { file: PathBuf },
    /// add a DFU suffix
    Add {
        file: PathBuf,
        /// vendor ID, ffff matches any
        #[clap(short, long, value_parser=hex_u16, default_value = "ffff")]
        vendor: u16,
        /// product ID, ffff matches any
        #[clap(short, long, value_parser=hex_u16, default_value = "ffff")]
        product: u16,
        /// device release number (bcdDevice)
        #[clap(short, long, value_parser=hex_u16, default_value = "ffff")]
        device: u16,
        /// DFU specification number (bcdDFU, "11a" for DfuSe)
        #[clap(short = 'S', long, value_parser=hex_u16, default_value = "0100")]
        spec: u16,
        /// replace an existing suffix
        #[clap(long)]
        force: bool,
    },
    /// remove the DFU suffix
    Remove { file: PathBuf },
}

#[derive(Subcommand)]
enum PrefixCommand {
    /// print the prefix
    Check {
        file: PathBuf,
        /// expected prefix kind
        #[clap(long, value_parser=parse_prefix_kind)]
        kind: Option<PrefixKind>,
    },
    /// add a TI Stellaris prefix (with an address) or an NXP LPC prefix
    Add {
        file: PathBuf,
        /// flash address of a TI Stellaris image
        #[clap(
            long,
            value_parser=maybe_hex::<u32>,
            conflicts_with = "lpc",
            required_unless_present = "lpc"
        )]
        lmdfu_address: Option<u32>,
        /// NXP LPC prefix
        #[clap(long)]
        lpc: bool,
    },
    /// remove the prefix
    Remove { file: PathBuf },
}

impl Default for Commands {
    fn default() -> Self {
        Commands::List {
            device: DeviceArgs {
                vendor: None,
                product: None,
            },
        }
    }
}

/// Alternate setting selected on the command line
#[derive(Clone)]
pub(crate) enum AltSetting {
    Number(u8),
    Name(String),
}

fn hex_u16(s: &str) -> Result<u16, String> {
    <u16>::from_str_radix(s, 16).map_err(|e| format!("{e}"))
}

fn parse_length(s: &str) -> Result<u32, String> {
    let len = parse_size(s).map_err(|e| format!("{e}"))?;
    len.try_into().map_err(|e| format!("{e}"))
}

fn parse_alt(s: &str) -> Result<AltSetting, String> {
    Ok(match s.parse() {
        Ok(alt) => AltSetting::Number(alt),
        Err(_) => AltSetting::Name(s.to_string()),
    })
}

fn parse_dfuse(s: &str) -> Result<DfuseOptions, String> {
    s.parse().map_err(|e| format!("{e}"))
}

fn parse_prefix_kind(s: &str) -> Result<PrefixKind, String> {
    match s {
        "lmdfu" | "stellaris" => Ok(PrefixKind::Lmdfu),
        "lpc" => Ok(PrefixKind::Lpc),
        other => Err(format!("unknown prefix '{other}'")),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    env_logger::Builder::new()
        .filter_level(if cli.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Warn
        })
        .parse_default_env()
        .init();

    if let Err(err) = run(cli.command.unwrap_or_default()) {
        eprintln!("Error: {err}");
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn run(command: Commands) -> Result<(), CliError> {
    match command {
        Commands::List { device } => {
            list_dfu_devices(device.vendor, device.product)
        }
        Commands::Detach {
            device,
            timeout,
            reset,
            wait,
        } => detach::detach(get_dfu_device(device)?, timeout, reset, wait),
        Commands::Download { file, args, reset } => download::download(
            &file,
            &get_dfu_device(args.device)?,
            args.alt.as_ref(),
            args.transfer_size,
            args.dfuse.as_ref(),
            reset,
        ),
        Commands::Upload {
            file,
            args,
            length,
            suffix,
        } => upload::upload(
            &file,
            &get_dfu_device(args.device)?,
            args.alt.as_ref(),
            args.transfer_size,
            args.dfuse.as_ref(),
            length,
            suffix,
        ),
        Commands::Reset { device } => reset(get_dfu_device(device)?),
        Commands::Suffix { command } => match command {
            SuffixCommand::Check { file } => file::check_suffix(&file),
            SuffixCommand::Add {
                file,
                vendor,
                product,
                device,
                spec,
                force,
            } => {
                let ids = SuffixIds::new(vendor, product, device)
                    .with_dfu_version(spec);
                file::add_suffix(&file, ids, force)
            }
            SuffixCommand::Remove { file } => file::remove_suffix(&file),
        },
        Commands::Prefix { command } => match command {
            PrefixCommand::Check { file, kind } => {
                file::check_prefix(&file, kind)
            }
            PrefixCommand::Add {
                file, lmdfu_address, ..
            } => {
                let prefix = match lmdfu_address {
                    Some(address) => Prefix::Lmdfu { address },
                    None => Prefix::Lpc,
                };
                file::add_prefix(&file, prefix)
            }
            PrefixCommand::Remove { file } => file::remove_prefix(&file),
        },
    }
}

fn get_dfu_device(args: DeviceArgs) -> Result<DfuDevice, CliError> {
    let vendor = args.vendor.filter(|&id| id != ID_WILDCARD);
    let product = args.product.filter(|&id| id != ID_WILDCARD);
    let mut devices = find_dfu_devices(vendor, product)?;
    if devices.len() > 1 {
        return Err(CliError::ManyDFUDevices);
    }
    devices.pop().ok_or(CliError::NoDFUDevice)
}

/// Interface to use: the requested alternate setting, the one whose memory
/// holds `range`, or the first one.
pub(crate) fn select_interface<'a>(
    device: &'a DfuDevice,
    alt: Option<&AltSetting>,
    range: Option<(u32, u32)>,
) -> Result<&'a DfuInterface, CliError> {
    let intf = match (alt, range) {
        (Some(AltSetting::Number(n)), _) => {
            device.find_interface(Some(*n), None)
        }
        (Some(AltSetting::Name(name)), _) => {
            device.find_interface(None, Some(name))
        }
        (None, Some((start, end))) => {
            match device.find_interface_segments(start, end) {
                Ok(found) => {
                    device.find_interface(Some(found.alt_setting()), None)
                }
                Err(err) => {
                    log::warn!("{err}, using the first alternate setting");
                    device.find_interface(None, None)
                }
            }
        }
        (None, None) => device.find_interface(None, None),
    }?;
    println!(
        "Using interface {}, alternate setting {} ({})",
        intf.interface(),
        intf.alt_setting(),
        intf.name().unwrap_or("UNKNOWN")
    );
    Ok(intf)
}

fn reset(device: DfuDevice) -> Result<(), CliError> {
    let intf = device.find_interface(None, None)?;
    let mut conn = device.connect(intf.interface(), intf.alt_setting(), 0)?;
    println!("Resetting USB...");
    match conn.usb_reset() {
        Ok(()) | Err(DfuError::Transport(TransportError::Disconnected)) => Ok(()),
        Err(err) => Err(err.into()),
    }
}
