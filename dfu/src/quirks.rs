use std::{fmt, ops::BitOr, time::Duration};

use crate::DfuMemory;

/// Poll timeout used when a device reports bogus `bwPollTimeout` values
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(5);

const GD32VF103_FLASH_BASE: u32 = 0x0800_0000;
const GD32VF103_PAGE_SIZE: u32 = 1024;

/// Set of device specific protocol deviations
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Quirks(u32);

impl Quirks {
    /// Device returns bogus `bwPollTimeout` values
    pub const IGNORE_POLL_TIMEOUT: Quirks = Quirks(1 << 0);
    /// Device reports a wrong DFU version in its functional descriptor
    pub const FORCE_DFU11: Quirks = Quirks(1 << 1);
    /// Serial number string is UTF-8 instead of UTF-16
    pub const UTF8_SERIAL: Quirks = Quirks(1 << 2);
    /// DfuSe memory layout string is wrong and gets corrected
    pub const DFUSE_LAYOUT: Quirks = Quirks(1 << 3);
    /// Device leaves DFU mode without answering `DFU_GETSTATUS`
    pub const DFUSE_LEAVE: Quirks = Quirks(1 << 4);
    /// Control transfers must fit in a single packet
    pub const FORCE_SHORT_CONTROL: Quirks = Quirks(1 << 5);
    /// Product id does not change between run-time and DFU mode
    pub const NO_PID_CHANGE: Quirks = Quirks(1 << 6);
    /// `DFU_DETACH` must be followed by a USB reset
    pub const DETACH_RESET: Quirks = Quirks(1 << 7);
    /// Erase commands keep the device busy beyond the default wait budget
    pub const SLOW_ERASE: Quirks = Quirks(1 << 8);

    const NAMES: [(Quirks, &'static str); 9] = [
        (Quirks::IGNORE_POLL_TIMEOUT, "ignore-poll-timeout"),
        (Quirks::FORCE_DFU11, "force-dfu11"),
        (Quirks::UTF8_SERIAL, "utf8-serial"),
        (Quirks::DFUSE_LAYOUT, "dfuse-layout"),
        (Quirks::DFUSE_LEAVE, "dfuse-leave"),
        (Quirks::FORCE_SHORT_CONTROL, "force-short-control"),
        (Quirks::NO_PID_CHANGE, "no-pid-change"),
        (Quirks::DETACH_RESET, "detach-reset"),
        (Quirks::SLOW_ERASE, "slow-erase"),
    ];

    pub const fn empty() -> Self {
        Quirks(0)
    }

    pub const fn union(self, other: Quirks) -> Self {
        Quirks(self.0 | other.0)
    }

    pub fn contains(&self, other: Quirks) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn bits(&self) -> u32 {
        self.0
    }
}

impl BitOr for Quirks {
    type Output = Quirks;

    fn bitor(self, rhs: Quirks) -> Quirks {
        self.union(rhs)
    }
}

impl fmt::Display for Quirks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = Self::NAMES
            .iter()
            .filter(|(q, _)| self.contains(*q))
            .map(|(_, name)| *name)
            .collect();
        if names.is_empty() {
            write!(f, "none")
        } else {
            write!(f, "{}", names.join(","))
        }
    }
}

/// Identity of a USB device, used for quirk lookup and suffix matching
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeviceIdentity {
    pub vendor_id: u16,
    pub product_id: u16,
    pub bcd_device: u16,
    pub serial: Option<String>,
}

impl DeviceIdentity {
    pub fn new(vendor_id: u16, product_id: u16, bcd_device: u16) -> Self {
        DeviceIdentity {
            vendor_id,
            product_id,
            bcd_device,
            serial: None,
        }
    }

    pub fn with_serial(mut self, serial: impl Into<String>) -> Self {
        self.serial = Some(serial.into());
        self
    }
}

/// One table entry: product range and `bcdDevice` range, both inclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuirkRule {
    pub vendor: u16,
    pub product_first: u16,
    pub product_last: u16,
    pub bcd_min: u16,
    pub bcd_max: u16,
    pub quirks: Quirks,
}

impl QuirkRule {
    pub const fn product(vendor: u16, product: u16, quirks: Quirks) -> Self {
        QuirkRule {
            vendor,
            product_first: product,
            product_last: product,
            bcd_min: 0,
            bcd_max: u16::MAX,
            quirks,
        }
    }

    pub const fn products(
        vendor: u16,
        first: u16,
        last: u16,
        quirks: Quirks,
    ) -> Self {
        QuirkRule {
            product_first: first,
            product_last: last,
            ..QuirkRule::product(vendor, first, quirks)
        }
    }

    pub const fn revision(self, bcd_device: u16) -> Self {
        QuirkRule {
            bcd_min: bcd_device,
            bcd_max: bcd_device,
            ..self
        }
    }

    pub fn matches(&self, vendor: u16, product: u16, bcd_device: u16) -> bool {
        self.vendor == vendor
            && (self.product_first..=self.product_last).contains(&product)
            && (self.bcd_min..=self.bcd_max).contains(&bcd_device)
    }
}

const VENDOR_OPENMOKO: u16 = 0x1d50;
const VENDOR_VOTI: u16 = 0x16c0;
const VENDOR_LEAFLABS: u16 = 0x1eaf;
const VENDOR_SIEMENS: u16 = 0x0908;
const VENDOR_MIDIMAN: u16 = 0x0763;
const VENDOR_GIGADEVICE: u16 = 0x28e9;

const PRODUCT_FREERUNNER_FIRST: u16 = 0x5117;
const PRODUCT_FREERUNNER_LAST: u16 = 0x5126;
const PRODUCT_SIMTRACE: u16 = 0x0762;
const PRODUCT_OPENPCD: u16 = 0x076b;
const PRODUCT_OPENPICC: u16 = 0x076c;
const PRODUCT_MAPLE3: u16 = 0x0003;
const PRODUCT_PXM40: u16 = 0x02c4;
const PRODUCT_PXM50: u16 = 0x02c5;
const PRODUCT_TRANSIT: u16 = 0x2806;
const PRODUCT_GD32: u16 = 0x0189;

const BUILTIN_RULES: &[QuirkRule] = &[
    QuirkRule::products(
        VENDOR_OPENMOKO,
        PRODUCT_FREERUNNER_FIRST,
        PRODUCT_FREERUNNER_LAST,
        Quirks::IGNORE_POLL_TIMEOUT,
    ),
    QuirkRule::product(VENDOR_VOTI, PRODUCT_OPENPCD, Quirks::IGNORE_POLL_TIMEOUT),
    QuirkRule::product(VENDOR_VOTI, PRODUCT_SIMTRACE, Quirks::IGNORE_POLL_TIMEOUT),
    QuirkRule::product(VENDOR_VOTI, PRODUCT_OPENPICC, Quirks::IGNORE_POLL_TIMEOUT),
    // rev 3 and 5 boards report DFU 1.0 in their descriptor
    QuirkRule::product(VENDOR_LEAFLABS, PRODUCT_MAPLE3, Quirks::FORCE_DFU11)
        .revision(0x0200),
    QuirkRule::products(
        VENDOR_SIEMENS,
        PRODUCT_PXM40,
        PRODUCT_PXM50,
        Quirks::IGNORE_POLL_TIMEOUT,
    )
    .revision(0),
    QuirkRule::product(VENDOR_MIDIMAN, PRODUCT_TRANSIT, Quirks::IGNORE_POLL_TIMEOUT),
    QuirkRule::product(
        VENDOR_GIGADEVICE,
        PRODUCT_GD32,
        Quirks::UTF8_SERIAL
            .union(Quirks::DFUSE_LAYOUT)
            .union(Quirks::DFUSE_LEAVE)
            .union(Quirks::SLOW_ERASE),
    ),
];

/// Immutable mapping from device identity to quirks
#[derive(Debug, Clone, Copy)]
pub struct QuirkTable {
    rules: &'static [QuirkRule],
}

impl QuirkTable {
    pub const fn new(rules: &'static [QuirkRule]) -> Self {
        QuirkTable { rules }
    }

    /// Table of the devices known to need workarounds
    pub const fn builtin() -> Self {
        QuirkTable::new(BUILTIN_RULES)
    }

    pub fn rules(&self) -> &'static [QuirkRule] {
        self.rules
    }

    /// Union of the quirks of every matching rule. Unknown devices get
    /// an empty set.
    pub fn lookup(&self, vendor: u16, product: u16, bcd_device: u16) -> Quirks {
        self.rules
            .iter()
            .filter(|rule| rule.matches(vendor, product, bcd_device))
            .fold(Quirks::empty(), |acc, rule| acc | rule.quirks)
    }

    pub fn lookup_identity(&self, identity: &DeviceIdentity) -> Quirks {
        self.lookup(identity.vendor_id, identity.product_id, identity.bcd_device)
    }
}

impl Default for QuirkTable {
    fn default() -> Self {
        QuirkTable::builtin()
    }
}

/// Correct the flash layout reported by GD32VF103 parts, whose real size is
/// encoded in the serial number.
pub fn fixup_dfuse_layout(
    identity: &DeviceIdentity,
    alt_setting: u8,
    layout: &mut DfuMemory,
) {
    let serial = match identity.serial.as_deref() {
        Some(serial) => serial.as_bytes(),
        None => return,
    };
    if identity.vendor_id != VENDOR_GIGADEVICE
        || identity.product_id != PRODUCT_GD32
        || alt_setting != 0
        || serial.len() != 4
        || serial[0] != b'3'
        || serial[3] != b'J'
    {
        return;
    }

    log::info!("Found GD32VF103, which reports a bad page size and count for its internal memory");

    let count = match serial[2] {
        b'B' => 128,
        b'8' => 64,
        b'6' => 32,
        b'4' => 16,
        other => {
            log::warn!(
                "Unknown flash size '{}' in part number, defaulting to 128KB",
                other as char
            );
            128
        }
    };

    match layout.find_segment_mut(GD32VF103_FLASH_BASE) {
        Some(segment) => {
            segment.resize(GD32VF103_PAGE_SIZE, count);
            log::info!(
                "Fixed layout based on part number: page size {GD32VF103_PAGE_SIZE}, count {count}"
            );
        }
        None => log::error!(
            "Could not fix GD32VF103 layout, no segment at 0x{GD32VF103_FLASH_BASE:08x}"
        ),
    }
}
