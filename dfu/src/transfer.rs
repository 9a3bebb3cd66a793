//! Chunked transfers on top of the protocol engine
//!
//! Splits firmware into transfer size chunks, hands them to the plain DFU
//! engine or to the DfuSe layer and reports progress after every chunk.
//! Nothing is rolled back when a transfer fails half way.

use dfufile::{DfuseImage, FirmwareFile};

use crate::{
    DfuConnection, DfuError, DfuState, Manifestation,
    dfuse::{Dfuse, DfuseOptions, Layouts},
    quirks::DeviceIdentity,
    transport::DfuTransport,
};

/// What a [Progress] reporter is currently counting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Pages erased
    Erase,
    /// Bytes sent to the device
    Download,
    /// Bytes read from the device
    Upload,
}

/// Receives progress updates between chunks
pub trait Progress {
    /// A new phase begins. `total` is 0 when unknown.
    fn start(&mut self, _phase: Phase, _total: usize) {}

    /// Units done so far in the current phase, never decreasing
    fn update(&mut self, done: usize);

    fn finish(&mut self) {}

    /// Polled before every chunk, a `true` stops the transfer with
    /// [DfuError::Cancelled].
    fn cancelled(&self) -> bool {
        false
    }
}

impl<F: FnMut(usize)> Progress for F {
    fn update(&mut self, done: usize) {
        self(done)
    }
}

/// Discards all updates
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl Progress for NoProgress {
    fn update(&mut self, _done: usize) {}
}

pub fn chunk_count(size: usize, transfer_size: usize) -> usize {
    size.div_ceil(transfer_size.max(1))
}

pub fn chunks(data: &[u8], transfer_size: usize) -> std::slice::Chunks<'_, u8> {
    data.chunks(transfer_size.max(1))
}

pub(crate) fn check_cancelled(progress: &dyn Progress) -> Result<(), DfuError> {
    if progress.cancelled() {
        log::warn!("Transfer cancelled");
        Err(DfuError::Cancelled)
    } else {
        Ok(())
    }
}

/// Plain DFU download of `data`, block numbers starting at 0.
pub fn download<T: DfuTransport>(
    conn: &mut DfuConnection<T>,
    data: &[u8],
    progress: &mut dyn Progress,
) -> Result<Manifestation, DfuError> {
    let xfer_size = conn.transfer_size() as usize;
    log::info!(
        "Downloading {} bytes in {} blocks of {xfer_size}",
        data.len(),
        chunk_count(data.len(), xfer_size)
    );

    progress.start(Phase::Download, data.len());
    let mut block: u16 = 0;
    let mut done = 0;
    for chunk in chunks(data, xfer_size) {
        check_cancelled(progress)?;
        conn.download_block(block, chunk)?;
        block = block.wrapping_add(1);
        done += chunk.len();
        progress.update(done);
    }
    progress.finish();

    conn.finish_download(block)
}

/// Plain DFU upload, block numbers starting at 0.
///
/// Stops at the first short read or once `limit` bytes are read.
pub fn upload<T: DfuTransport>(
    conn: &mut DfuConnection<T>,
    limit: Option<usize>,
    progress: &mut dyn Progress,
) -> Result<Vec<u8>, DfuError> {
    let data = upload_blocks(conn, 0, limit, progress)?;
    if conn.state() == Some(DfuState::DfuUploadIdle) {
        conn.abort_to_idle()?;
    }
    Ok(data)
}

pub(crate) fn upload_blocks<T: DfuTransport>(
    conn: &mut DfuConnection<T>,
    first_block: u16,
    limit: Option<usize>,
    progress: &mut dyn Progress,
) -> Result<Vec<u8>, DfuError> {
    let xfer_size = conn.transfer_size() as usize;
    let mut data = Vec::new();
    let mut block = first_block;

    progress.start(Phase::Upload, limit.unwrap_or(0));
    loop {
        let length = match limit {
            Some(limit) => (limit - data.len()).min(xfer_size),
            None => xfer_size,
        };
        if length == 0 {
            break;
        }
        check_cancelled(progress)?;

        // length fits, it is bounded by the u16 transfer size
        let chunk = conn.upload_block(block, length as u16)?;
        let short = chunk.len() < length;
        data.extend_from_slice(&chunk);
        progress.update(data.len());
        if short {
            break;
        }
        block = block.wrapping_add(1);
    }
    progress.finish();

    log::info!("Received {} bytes", data.len());
    Ok(data)
}

/// Refuse a file whose suffix names another device, unless `force` is set.
pub fn check_file_identity(
    file: &FirmwareFile,
    device: &DeviceIdentity,
    force: bool,
) -> Result<(), DfuError> {
    if file.matches_device(device.vendor_id, device.product_id) {
        return Ok(());
    }
    let ids = file.identity();
    let msg = format!(
        "{} is for {:04x}:{:04x}, device is {:04x}:{:04x}",
        file.name(),
        ids.id_vendor,
        ids.id_product,
        device.vendor_id,
        device.product_id
    );
    if force {
        log::warn!("{msg}");
        Ok(())
    } else {
        Err(DfuError::WrongDevice(msg))
    }
}

/// Download a firmware file, with DfuSe when options are given or the file
/// is a DfuSe container.
///
/// Returns `None` when a DfuSe device stays in DFU mode.
pub fn download_file<T: DfuTransport>(
    conn: &mut DfuConnection<T>,
    file: &FirmwareFile,
    options: Option<&DfuseOptions>,
    layouts: &Layouts,
    alt_setting: u8,
    progress: &mut dyn Progress,
) -> Result<Option<Manifestation>, DfuError> {
    let options = match options {
        None if !file.is_dfuse() => {
            conn.reset_state()?;
            return download(conn, file.payload(), progress).map(Some);
        }
        options => options.cloned().unwrap_or_default(),
    };

    conn.reset_state()?;
    let address = options.address;
    let mut dfuse = Dfuse::new(conn, layouts.clone(), alt_setting, options);

    if dfuse.options().unprotect {
        dfuse.unprotect()?;
        return Ok(Some(Manifestation::WaitReset));
    }

    if address.is_some() {
        dfuse.download_raw(file.payload(), progress)
    } else if file.is_dfuse() {
        let image = DfuseImage::parse(file.payload())?;
        dfuse.download_image(&image, progress)
    } else if dfuse.options().mass_erase {
        dfuse.mass_erase()?;
        Ok(None)
    } else {
        Err(DfuError::InvalidOption(
            "a raw binary needs a DfuSe address".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use dfufile::{DfuseElement, DfuseTarget, SuffixIds};

    use super::*;
    use crate::{
        Quirks,
        clock::MockClock,
        memory::parse_memory_layout,
        transport::mock::{MockTransport, Request},
    };

    fn connect(mock: MockTransport, xfer_size: u16) -> DfuConnection<MockTransport> {
        DfuConnection::new(mock, xfer_size, Quirks::empty())
            .with_clock(MockClock::default())
    }

    #[test]
    fn test_chunking() {
        for (size, xfer) in [(0, 64), (1, 64), (64, 64), (65, 64), (1000, 7)] {
            let data = vec![0u8; size];
            let sizes: Vec<usize> = chunks(&data, xfer).map(|c| c.len()).collect();
            assert_eq!(sizes.len(), chunk_count(size, xfer));
            assert_eq!(sizes.len(), size.div_ceil(xfer));
            assert_eq!(sizes.iter().sum::<usize>(), size);
        }
    }

    #[test]
    fn test_download() {
        let data: Vec<u8> = (0..150).map(|i| i as u8).collect();
        let mut conn = connect(MockTransport::new(), 64);
        let mut updates = Vec::new();
        let result = download(&mut conn, &data, &mut |done: usize| updates.push(done));

        assert_eq!(result.unwrap(), Manifestation::Complete);
        assert_eq!(updates, vec![64, 128, 150]);
        assert_eq!(conn.transport().downloaded, data);
        assert_eq!(
            conn.transport().data_blocks(),
            vec![(0, 64), (1, 64), (2, 22), (3, 0)]
        );
    }

    #[test]
    fn test_download_stops_on_error() {
        let mut mock = MockTransport::new();
        mock.busy_polls = 0;
        mock.status_queue.extend([
            Ok(crate::DfuStatus::new(
                crate::DfuStatusCode::Ok,
                0,
                DfuState::DfuDnloadIdle,
            )),
            Ok(crate::DfuStatus::new(
                crate::DfuStatusCode::ErrProg,
                0,
                DfuState::DfuError,
            )),
        ]);
        let mut conn = connect(mock, 16);
        let err = download(&mut conn, &[0; 64], &mut NoProgress).unwrap_err();
        assert!(matches!(
            err,
            DfuError::Device {
                status: crate::DfuStatusCode::ErrProg,
                ..
            }
        ));
        // no further blocks after the failing one
        assert_eq!(conn.transport().data_blocks(), vec![(0, 16), (1, 16)]);
    }

    struct Cancel(usize);

    impl Progress for Cancel {
        fn update(&mut self, done: usize) {
            self.0 = done;
        }

        fn cancelled(&self) -> bool {
            self.0 >= 32
        }
    }

    #[test]
    fn test_cancel_between_chunks() {
        let mut conn = connect(MockTransport::new(), 16);
        let err = download(&mut conn, &[0; 64], &mut Cancel(0)).unwrap_err();
        assert!(matches!(err, DfuError::Cancelled));
        assert_eq!(conn.transport().data_blocks().len(), 2);
    }

    #[test]
    fn test_upload_empty_first_read() {
        let mut conn = connect(MockTransport::new(), 64);
        let mut updates = Vec::new();
        let data = upload(&mut conn, None, &mut |done: usize| updates.push(done)).unwrap();
        assert!(data.is_empty());
        assert_eq!(updates, vec![0]);
        assert_eq!(
            conn.transport().log,
            vec![Request::Upload { block: 0, length: 64 }]
        );
    }

    #[test]
    fn test_upload_limit() {
        let mut mock = MockTransport::new();
        mock.upload_data = (0..200).map(|i| i as u8).collect();
        let mut conn = connect(mock, 64);
        let data = upload(&mut conn, Some(100), &mut NoProgress).unwrap();
        assert_eq!(data, (0..100).map(|i| i as u8).collect::<Vec<_>>());
        assert_eq!(
            conn.transport().requests(|r| matches!(r, Request::Upload { .. })),
            vec![
                &Request::Upload { block: 0, length: 64 },
                &Request::Upload { block: 1, length: 36 },
            ]
        );
        assert_eq!(conn.transport().state, DfuState::DfuIdle);
    }

    #[test]
    fn test_file_identity() {
        let device = DeviceIdentity::new(0x0483, 0xdf11, 0x2200);
        let mut file = FirmwareFile::from_payload("fw.bin", vec![0; 16]);
        check_file_identity(&file, &device, false).unwrap();

        file.add_suffix(SuffixIds::new(0x1209, 0x4711, 0), false)
            .unwrap();
        assert!(matches!(
            check_file_identity(&file, &device, false),
            Err(DfuError::WrongDevice(_))
        ));
        check_file_identity(&file, &device, true).unwrap();
    }

    fn stm32_layouts() -> Layouts {
        let layout =
            parse_memory_layout("@Internal Flash  /0x08000000/4*1Ka,12*1Kg")
                .unwrap();
        BTreeMap::from([(0, layout)])
    }

    #[test]
    fn test_download_dfuse_file() {
        let image = DfuseImage {
            targets: vec![DfuseTarget {
                alt_setting: 0,
                name: Some("ST...".into()),
                elements: vec![DfuseElement::new(0x0800_1000, vec![0x5a; 100])],
            }],
        };
        let mut file =
            FirmwareFile::from_payload("fw.dfu", image.encode().unwrap());
        file.add_suffix(
            SuffixIds::new(0x0483, 0xdf11, 0x2200)
                .with_dfu_version(dfufile::DFUSE_VERSION),
            false,
        )
        .unwrap();

        let mut conn = connect(MockTransport::dfuse(), 64);
        let result = download_file(
            &mut conn,
            &file,
            None,
            &stm32_layouts(),
            0,
            &mut NoProgress,
        )
        .unwrap();
        assert_eq!(result, None);

        let mock = conn.transport();
        assert_eq!(mock.erased, vec![0x0800_1000]);
        assert_eq!(
            mock.written,
            vec![(0x0800_1000, vec![0x5a; 64]), (0x0800_1040, vec![0x5a; 36])]
        );
        assert_eq!(mock.address, 0x0800_1000);
    }

    #[test]
    fn test_raw_binary_needs_address() {
        let file = FirmwareFile::from_payload("fw.bin", vec![0; 16]);
        let mut conn = connect(MockTransport::dfuse(), 64);
        let options = DfuseOptions::default();
        assert!(matches!(
            download_file(
                &mut conn,
                &file,
                Some(&options),
                &stm32_layouts(),
                0,
                &mut NoProgress
            ),
            Err(DfuError::InvalidOption(_))
        ));
        assert!(conn.transport().data_blocks().is_empty());
    }
}
