// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Typed view of the host-resident array the card writes completion status
//! into.

use super::regs::ddl;
use crate::memory::MemoryBlock;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// Upper bound on descriptors the card-visible free FIFO can hold; the ready
/// FIFO has one entry per descriptor slot.
pub const MAX_SUPERPAGE_DESCRIPTORS: usize = 128;

/// Value both words of an entry are reset to between uses.
pub const ENTRY_SENTINEL: u32 = u32::MAX;

/// One completion record. The card writes `length` (in 32-bit words) and a
/// status word; the driver resets both to [`ENTRY_SENTINEL`].
#[derive(Debug, Copy, Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct ReadyFifoEntry {
    pub length: u32,
    pub status: u32,
}

/// Size in bytes of the whole FIFO structure; the backing file must be
/// exactly this large.
pub const READY_FIFO_SIZE: usize =
    MAX_SUPERPAGE_DESCRIPTORS * std::mem::size_of::<ReadyFifoEntry>();

/// Classification of a descriptor slot's completion state.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DataArrivalStatus {
    NoneArrived,
    PartArrived,
    WholeArrived,
}

/// View of the ready FIFO over card-shared memory. All accesses are
/// volatile; the card writes entries while the driver polls them.
pub struct ReadyFifo {
    mem: MemoryBlock,
}

impl ReadyFifo {
    pub fn new(mem: MemoryBlock) -> Self {
        assert!(mem.len() >= READY_FIFO_SIZE);
        Self { mem }
    }

    fn entry_offset(index: usize) -> usize {
        assert!(index < MAX_SUPERPAGE_DESCRIPTORS);
        index * std::mem::size_of::<ReadyFifoEntry>()
    }

    pub fn entry(&self, index: usize) -> ReadyFifoEntry {
        let offset = Self::entry_offset(index);
        ReadyFifoEntry {
            length: self.mem.read_u32(offset),
            status: self.mem.read_u32(offset + 4),
        }
    }

    /// Returns the slot to the not-yet-written state.
    pub fn reset_entry(&self, index: usize) {
        let offset = Self::entry_offset(index);
        self.mem.write_u32(offset, ENTRY_SENTINEL);
        self.mem.write_u32(offset + 4, ENTRY_SENTINEL);
    }

    /// Resets every slot.
    pub fn reset(&self) {
        for index in 0..MAX_SUPERPAGE_DESCRIPTORS {
            self.reset_entry(index);
        }
    }

    pub fn bus_address(&self) -> Option<u64> {
        self.mem.bus_address(0)
    }
}

impl ReadyFifoEntry {
    /// Interprets the status word. `None` means the word matches no known
    /// shape and the caller must fail the scan.
    ///
    /// The card writes completions strictly in submission order, so a
    /// not-yet-arrived slot means no later slot can be complete either.
    pub fn arrival(&self) -> Option<DataArrivalStatus> {
        if self.status == ENTRY_SENTINEL {
            Some(DataArrivalStatus::NoneArrived)
        } else if self.status == 0 {
            Some(DataArrivalStatus::PartArrived)
        } else if self.status & 0xff == ddl::DTSW {
            // In internal loopback the event length also rides in the upper
            // status bits (e.g. 0x400082 for 4 KiB events).
            Some(DataArrivalStatus::WholeArrived)
        } else {
            None
        }
    }

    pub fn has_error_bit(&self) -> bool {
        self.status & (1 << 31) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_status_words() {
        let entry = |status| ReadyFifoEntry { length: 0, status };
        assert_eq!(
            entry(ENTRY_SENTINEL).arrival(),
            Some(DataArrivalStatus::NoneArrived)
        );
        assert_eq!(entry(0).arrival(), Some(DataArrivalStatus::PartArrived));
        assert_eq!(
            entry(0x0040_0082).arrival(),
            Some(DataArrivalStatus::WholeArrived)
        );
        assert_eq!(entry(0x0000_0055).arrival(), None);
        assert!(entry(0x8000_0082).has_error_bit());
        assert!(!entry(0x0040_0082).has_error_bit());
    }
}
