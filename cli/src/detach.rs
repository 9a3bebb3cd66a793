use std::{
    thread,
    time::{Duration, Instant},
};

use dfu::{DfuDevice, Quirks, find_dfu_devices};

use crate::CliError;

const RECONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const RECONNECT_POLL: Duration = Duration::from_millis(500);

/// Switch a run-time device to DFU mode. With `wait`, returns once the
/// device is back in DFU mode.
pub(crate) fn detach(
    device: DfuDevice,
    timeout_ms: u16,
    reset: bool,
    wait: bool,
) -> Result<(), CliError> {
    if !device.is_runtime() {
        println!("Device is already in DFU mode");
        return Ok(());
    }

    let intf = device
        .interfaces()
        .first()
        .ok_or(CliError::NoDFUDevice)?;
    let desc = device.dfu_descriptor();
    let timeout_ms = timeout_ms.min(desc.detach_timeout().max(1));

    let mut conn = device.connect(intf.interface(), intf.alt_setting(), 0)?;
    println!("Detaching...");
    // devices without bitWillDetach wait for a bus reset
    conn.detach(timeout_ms, reset || !desc.will_detach())?;
    drop(conn);

    if wait {
        let pid = device
            .quirks()
            .contains(Quirks::NO_PID_CHANGE)
            .then_some(device.product_id());
        reconnect(device.vendor_id(), pid)?;
    }
    Ok(())
}

fn reconnect(vid: u16, pid: Option<u16>) -> Result<DfuDevice, CliError> {
    println!("Waiting for device to reconnect...");
    let start = Instant::now();
    loop {
        let device = find_dfu_devices(Some(vid), pid)?
            .into_iter()
            .find(|dev| !dev.is_runtime());
        if let Some(device) = device {
            println!("Reconnected in {:?}", start.elapsed());
            return Ok(device);
        }
        if start.elapsed() >= RECONNECT_TIMEOUT {
            return Err(CliError::ReconnectTimeout);
        }
        thread::sleep(RECONNECT_POLL);
    }
}
