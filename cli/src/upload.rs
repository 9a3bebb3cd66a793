use std::{fs, path::Path};

use dfu::{
    DfuConnection, DfuDevice, DfuInterface, Dfuse, DfuseOptions, transfer,
};
use dfufile::{FirmwareFile, SuffixIds};

use crate::{AltSetting, CliError, progress::ProgressBar, select_interface};

pub(crate) fn upload(
    path: &Path,
    device: &DfuDevice,
    alt: Option<&AltSetting>,
    transfer_size: u16,
    dfuse: Option<&DfuseOptions>,
    length: Option<u32>,
    add_suffix: bool,
) -> Result<(), CliError> {
    if device.is_runtime() {
        return Err(CliError::RuntimeMode);
    }
    // never overwrite an existing file
    let mut store = fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(path)?;

    // DfuSe devices always need the DfuSe upload sequence
    let dfuse = dfuse
        .cloned()
        .or_else(|| device.is_dfuse().then(DfuseOptions::default));
    let dfuse = dfuse.as_ref();
    let length = length.or(dfuse.and_then(|o| o.length));
    let range = dfuse
        .and_then(|o| o.address)
        .map(|a| (a, a.saturating_add(length.unwrap_or(1))));
    let intf = select_interface(device, alt, range)?;
    let mut conn =
        device.connect(intf.interface(), intf.alt_setting(), transfer_size)?;
    let mut progress = ProgressBar::default();

    let result =
        read_device(&mut conn, device, intf, dfuse, length, &mut progress);
    let data = match result {
        Ok(data) => data,
        Err(err) => {
            drop(store);
            if let Err(e) = fs::remove_file(path) {
                log::warn!("Removing {}: {e}", path.display());
            }
            return Err(err);
        }
    };

    let mut file = FirmwareFile::from_payload(path.display().to_string(), data);
    if add_suffix {
        let identity = device.identity();
        let ids = SuffixIds::new(
            identity.vendor_id,
            identity.product_id,
            identity.bcd_device,
        );
        file.add_suffix(ids, false)?;
    }
    file.store(&mut store)?;
    println!("Upload done, {} bytes written to {}", file.size(), file.name());
    Ok(())
}

fn read_device(
    conn: &mut DfuConnection,
    device: &DfuDevice,
    intf: &DfuInterface,
    dfuse: Option<&DfuseOptions>,
    length: Option<u32>,
    progress: &mut ProgressBar,
) -> Result<Vec<u8>, CliError> {
    let data = match dfuse {
        Some(options) => {
            conn.reset_state()?;
            let mut session = Dfuse::new(
                conn,
                device.layouts(intf.interface()),
                intf.alt_setting(),
                options.clone(),
            );
            session.upload(length, progress)?
        }
        None => transfer::upload(
            conn,
            length.map(|l| l as usize),
            progress,
        )?,
    };
    Ok(data)
}
