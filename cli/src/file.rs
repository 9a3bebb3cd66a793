use std::{fs, path::Path};

use dfufile::{FirmwareFile, Prefix, PrefixKind, SuffixIds, SuffixState};

use crate::CliError;

fn open(path: &Path) -> Result<(fs::File, FirmwareFile), CliError> {
    let mut store = fs::OpenOptions::new().read(true).write(true).open(path)?;
    let file = FirmwareFile::load(path.display().to_string(), &mut store)?;
    Ok((store, file))
}

fn print_suffix_state(file: &FirmwareFile) {
    match file.suffix_state() {
        SuffixState::Valid => {}
        SuffixState::Absent => println!("No DFU suffix"),
        SuffixState::BadCrc { expected, computed } => println!(
            "DFU suffix CRC mismatch: file 0x{expected:08x}, computed 0x{computed:08x}"
        ),
        SuffixState::Unsupported(len) => {
            println!("Unsupported DFU suffix length {len}")
        }
    }
}

pub(crate) fn check_suffix(path: &Path) -> Result<(), CliError> {
    let (_, file) = open(path)?;
    print_suffix_state(&file);
    let suffix = file.check_suffix()?;
    println!("The file {} contains a DFU suffix:", file.name());
    println!("  BCD device:  0x{:04X}", suffix.ids.bcd_device);
    println!("  Product ID:  0x{:04X}", suffix.ids.id_product);
    println!("  Vendor ID:   0x{:04X}", suffix.ids.id_vendor);
    println!("  BCD DFU:     0x{:04X}", suffix.ids.bcd_dfu);
    println!("  Length:      {}", suffix.length);
    println!("  CRC:         0x{:08X}", suffix.crc);
    Ok(())
}

pub(crate) fn add_suffix(
    path: &Path,
    ids: SuffixIds,
    overwrite: bool,
) -> Result<(), CliError> {
    let (mut store, mut file) = open(path)?;
    let crc = file.add_suffix(ids, overwrite)?.crc;
    file.store(&mut store)?;
    println!("Suffix with CRC 0x{crc:08X} written to {}", file.name());
    Ok(())
}

pub(crate) fn remove_suffix(path: &Path) -> Result<(), CliError> {
    let (mut store, mut file) = open(path)?;
    file.remove_suffix()?;
    file.store(&mut store)?;
    println!("Suffix removed from {}", file.name());
    Ok(())
}

pub(crate) fn check_prefix(
    path: &Path,
    kind: Option<PrefixKind>,
) -> Result<(), CliError> {
    let (_, file) = open(path)?;
    match file.check_prefix(kind)? {
        Prefix::Lmdfu { address } => println!(
            "The file {} contains a TI Stellaris prefix, address 0x{address:08x}",
            file.name()
        ),
        Prefix::Lpc => {
            println!("The file {} contains an NXP LPC prefix", file.name())
        }
    }
    Ok(())
}

pub(crate) fn add_prefix(path: &Path, prefix: Prefix) -> Result<(), CliError> {
    let (mut store, mut file) = open(path)?;
    file.add_prefix(prefix)?;
    file.store(&mut store)?;
    println!("{:?} prefix written to {}", prefix.kind(), file.name());
    Ok(())
}

pub(crate) fn remove_prefix(path: &Path) -> Result<(), CliError> {
    let (mut store, mut file) = open(path)?;
    let prefix = file.remove_prefix()?;
    file.store(&mut store)?;
    println!("{:?} prefix removed from {}", prefix.kind(), file.name());
    Ok(())
}
