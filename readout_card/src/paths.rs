// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Filesystem locations for a channel's persisted state.

use crate::parameters::PciAddress;
use std::path::PathBuf;

/// Default root of the per-channel state tree. Overridable with
/// `ROC_STATE_DIR` (picked up by [`ChannelPaths::new`]).
pub const DEFAULT_STATE_DIR: &str = "/var/run/readout_card";

/// Derives the paths a channel keeps its lock, internal FIFO and status
/// files under, keyed by `(PCI address, channel number)`.
#[derive(Debug, Clone)]
pub struct ChannelPaths {
    base: PathBuf,
}

impl ChannelPaths {
    pub fn new(pci_address: PciAddress, channel_number: u32) -> Self {
        let root = std::env::var_os("ROC_STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_DIR));
        Self::with_root(root, pci_address, channel_number)
    }

    pub fn with_root(root: PathBuf, pci_address: PciAddress, channel_number: u32) -> Self {
        Self {
            base: root.join(format!("{pci_address}_chan{channel_number}")),
        }
    }

    /// The interprocess lock file.
    pub fn lock(&self) -> PathBuf {
        self.base.join("lock")
    }

    /// Backing file for the C-RORC's host-resident ready FIFO. Its size
    /// equals the FIFO structure size.
    pub fn fifo(&self) -> PathBuf {
        self.base.join("ready_fifo")
    }

    /// Directory for small status files.
    pub fn state(&self) -> PathBuf {
        self.base.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_are_keyed_by_address_and_channel() {
        let address = "42:0.0".parse().unwrap();
        let paths = ChannelPaths::with_root(PathBuf::from("/tmp/roc"), address, 3);
        assert_eq!(paths.lock(), PathBuf::from("/tmp/roc/0000:42:00.0_chan3/lock"));
        assert_eq!(
            paths.fifo(),
            PathBuf::from("/tmp/roc/0000:42:00.0_chan3/ready_fifo")
        );
    }
}
