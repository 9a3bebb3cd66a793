use std::{fs, path::Path};

use dfu::{
    DfuDevice, DfuseOptions, Manifestation,
    transfer::{self, check_file_identity},
};
use dfufile::{FileError, FirmwareFile, Trailer};

use crate::{AltSetting, CliError, progress::ProgressBar, select_interface};

pub(crate) fn download(
    path: &Path,
    device: &DfuDevice,
    alt: Option<&AltSetting>,
    transfer_size: u16,
    dfuse: Option<&DfuseOptions>,
    reset: bool,
) -> Result<(), CliError> {
    if device.is_runtime() {
        return Err(CliError::RuntimeMode);
    }

    let mut store = fs::File::open(path)?;
    let file = FirmwareFile::load(path.display().to_string(), &mut store)?;
    match file.check_suffix() {
        Ok(suffix) => println!(
            "DFU suffix: {:04x}:{:04x}, version {:04x}",
            suffix.ids.id_vendor, suffix.ids.id_product, suffix.ids.bcd_dfu
        ),
        Err(FileError::NotFound(Trailer::Suffix)) => {
            println!("Warning: {} has no DFU suffix", file.name())
        }
        Err(err) => return Err(err.into()),
    }
    let dfuse = dfuse
        .cloned()
        .or_else(|| device.is_dfuse().then(DfuseOptions::default));
    let dfuse = dfuse.as_ref();
    let force = dfuse.is_some_and(|o| o.force);
    check_file_identity(&file, device.identity(), force)?;

    let end = dfuse
        .and_then(|o| o.address)
        .map(|a| (a, a.saturating_add(file.payload().len() as u32)));
    let intf = select_interface(device, alt, end)?;
    let mut conn =
        device.connect(intf.interface(), intf.alt_setting(), transfer_size)?;
    let layouts = device.layouts(intf.interface());

    let mut progress = ProgressBar::default();
    match transfer::download_file(
        &mut conn,
        &file,
        dfuse,
        &layouts,
        intf.alt_setting(),
        &mut progress,
    )? {
        Some(Manifestation::Complete) => println!("Download done."),
        Some(Manifestation::WaitReset) => {
            println!("Download done, device needs a reset to run the new firmware.");
            if reset {
                println!("Resetting USB...");
                if let Err(err) = conn.usb_reset() {
                    log::debug!("Reset after download: {err}");
                }
            }
        }
        None => println!("Download done, device stays in DFU mode."),
    }
    Ok(())
}
