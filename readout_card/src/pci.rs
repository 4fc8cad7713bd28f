// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Access to real cards through sysfs: BAR mapping and device probing.

#![cfg(target_os = "linux")]

use crate::bar::BarIo;
use crate::bar::SharedBar;
use crate::channel::CardDescriptor;
use crate::error::Error;
use crate::error::Result;
use crate::parameters::CardId;
use crate::parameters::CardType;
use crate::parameters::PciAddress;
use anyhow::Context;
use std::ffi::c_void;
use std::fs::File;
use std::os::fd::AsRawFd;
use std::path::Path;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

/// PCI vendor/device identities of the supported cards.
const ID_TABLE: &[(u32, u32, CardType)] = &[
    // CERN C-RORC.
    (0x10dc, 0x0033, CardType::Crorc),
    // Intel/Altera-based CRU.
    (0x1172, 0xe001, CardType::Cru),
];

fn sysfs_device_dir(address: PciAddress) -> PathBuf {
    Path::new("/sys/bus/pci/devices").join(address.to_string())
}

fn read_sysfs_hex(path: &Path) -> anyhow::Result<u32> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let text = text.trim().trim_start_matches("0x");
    u32::from_str_radix(text, 16).with_context(|| format!("malformed value in {}", path.display()))
}

/// A `resource<N>` file mapped into the process.
pub struct ResourceBar {
    index: u8,
    base: *mut c_void,
    len: usize,
}

// SAFETY: MMIO mappings are safe to share amongst threads; all accesses are
// volatile.
unsafe impl Send for ResourceBar {}
// SAFETY: see above.
unsafe impl Sync for ResourceBar {}

impl ResourceBar {
    pub fn map(address: PciAddress, index: u8) -> anyhow::Result<Self> {
        let path = sysfs_device_dir(address).join(format!("resource{index}"));
        let file = File::options()
            .read(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        let len = file
            .metadata()
            .with_context(|| format!("failed to stat {}", path.display()))?
            .len() as usize;
        // SAFETY: mapping a resource file we own for its full length; the
        // result is validated.
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(std::io::Error::last_os_error())
                .with_context(|| format!("failed to map {}", path.display()));
        }
        Ok(Self { index, base, len })
    }
}

impl Drop for ResourceBar {
    fn drop(&mut self) {
        // SAFETY: self contains a valid mmap result.
        unsafe {
            libc::munmap(self.base, self.len);
        }
    }
}

impl BarIo for ResourceBar {
    fn index(&self) -> u8 {
        self.index
    }

    fn read(&self, offset: u32) -> u32 {
        assert_eq!(offset % 4, 0);
        assert!((offset as usize) + 4 <= self.len);
        // SAFETY: in bounds of the mapping, aligned.
        unsafe { std::ptr::read_volatile(self.base.cast::<u8>().add(offset as usize).cast()) }
    }

    fn write(&self, offset: u32, value: u32) {
        assert_eq!(offset % 4, 0);
        assert!((offset as usize) + 4 <= self.len);
        // SAFETY: in bounds of the mapping, aligned.
        unsafe {
            std::ptr::write_volatile(
                self.base.cast::<u8>().add(offset as usize).cast(),
                value,
            )
        }
    }
}

/// A probed card with its register windows mapped.
pub struct RocDevice {
    pub descriptor: CardDescriptor,
    pub bar0: SharedBar,
    pub bar2: Option<SharedBar>,
}

impl RocDevice {
    /// Finds the card named by `card_id` and maps its BARs.
    pub fn open(card_id: CardId) -> Result<Self> {
        let address = match card_id {
            CardId::Address(address) => address,
            CardId::Serial(serial) => find_by_serial(serial)?,
        };
        let card_type = probe_card_type(address)?.ok_or_else(|| {
            Error::Parameter(format!("device at {address} is not a supported readout card"))
        })?;

        let bar0: SharedBar = Arc::new(
            ResourceBar::map(address, 0)
                .map_err(|err| Error::DmaSetup(format!("BAR 0 mapping: {err:#}")))?,
        );
        // The CRU keeps card management on BAR 2; the C-RORC has only BAR 0.
        let bar2: Option<SharedBar> = match card_type {
            CardType::Cru => Some(Arc::new(
                ResourceBar::map(address, 2)
                    .map_err(|err| Error::DmaSetup(format!("BAR 2 mapping: {err:#}")))?,
            )),
            CardType::Crorc => None,
        };

        let serial = match card_type {
            CardType::Crorc => crate::crorc::Crorc::new(bar0.clone()).serial(),
            CardType::Cru => crate::cru::CruBar::new(bar0.clone(), bar2.clone()).serial(),
        };

        tracing::info!(%address, %card_type, ?serial, "opened readout card");
        Ok(Self {
            descriptor: CardDescriptor {
                card_type,
                pci_address: address,
                serial,
            },
            bar0,
            bar2,
        })
    }
}

fn probe_card_type(address: PciAddress) -> Result<Option<CardType>> {
    let dir = sysfs_device_dir(address);
    let vendor = read_sysfs_hex(&dir.join("vendor"))
        .map_err(|err| Error::Parameter(format!("{err:#}")))?;
    let device = read_sysfs_hex(&dir.join("device"))
        .map_err(|err| Error::Parameter(format!("{err:#}")))?;
    Ok(ID_TABLE
        .iter()
        .find(|(v, d, _)| *v == vendor && *d == device)
        .map(|(_, _, card_type)| *card_type))
}

/// Scans the bus for a supported card carrying `serial`.
fn find_by_serial(serial: i32) -> Result<PciAddress> {
    let entries = std::fs::read_dir("/sys/bus/pci/devices")
        .map_err(|err| Error::Parameter(format!("failed to scan the PCI bus: {err}")))?;
    for entry in entries.flatten() {
        let Some(name) = entry.file_name().to_str().map(String::from) else {
            continue;
        };
        let Ok(address) = PciAddress::from_str(&name) else {
            continue;
        };
        let Ok(Some(card_type)) = probe_card_type(address) else {
            continue;
        };
        let found = match card_type {
            CardType::Crorc => ResourceBar::map(address, 0)
                .ok()
                .and_then(|bar| crate::crorc::Crorc::new(Arc::new(bar)).serial()),
            CardType::Cru => ResourceBar::map(address, 2).ok().and_then(|bar2| {
                match bar2.read(crate::cru::regs::bar2::SERIAL) {
                    0 | u32::MAX => None,
                    serial => Some(serial as i32),
                }
            }),
        };
        if found == Some(serial) {
            return Ok(address);
        }
    }
    Err(Error::Parameter(format!(
        "no supported card with serial {serial} found"
    )))
}
