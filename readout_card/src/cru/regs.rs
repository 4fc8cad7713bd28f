// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! CRU register map. DMA lives on BAR 0, card management on BAR 2. Offsets
//! in bytes.

use bitfield_struct::bitfield;

/// BAR 0, global DMA block.
pub mod reg {
    /// Bit 0 enables DMA.
    pub const DMA_CONTROL: u32 = 0x000;
    /// See [`super::data_source`].
    pub const DATA_SOURCE_SELECT: u32 = 0x004;
    /// Bit 0 enables the data generator.
    pub const DATA_GENERATOR_CONTROL: u32 = 0x008;
    pub const DATA_GENERATOR_INJECT_ERROR: u32 = 0x00c;
    /// Write 0x1 for a full card reset, 0x2 to reset the generator counter.
    pub const RESET_CONTROL: u32 = 0x010;
    /// Bit 0 enables data taking; bits 16..=27 hold the CRU id.
    pub const BSP_USER_CONTROL: u32 = 0x014;
    /// 0x0 for endpoint 0, 0x11111111 for endpoint 1.
    pub const ENDPOINT_ID: u32 = 0x018;
    pub const FIRMWARE_FEATURES: u32 = 0x01c;

    /// Free-running clock counter per wrapper; reads twice differing means
    /// the wrapper is alive.
    pub fn wrapper_clock_counter(wrapper: u32) -> u32 {
        0x040 + wrapper * 0x10
    }

    /// Bits 24..=31: links served by this wrapper.
    pub fn wrapper_config(wrapper: u32) -> u32 {
        0x044 + wrapper * 0x10
    }

    pub fn links_enable(wrapper: u32) -> u32 {
        0x048 + wrapper * 0x10
    }

    pub fn trigger_window_size(wrapper: u32) -> u32 {
        0x04c + wrapper * 0x10
    }

    pub fn dropped_packets(wrapper: u32) -> u32 {
        0x060 + wrapper * 0x4
    }

    pub fn total_packets_per_second(wrapper: u32) -> u32 {
        0x068 + wrapper * 0x4
    }
}

/// BAR 0, per-link superpage block.
pub mod link {
    const BASE: u32 = 0x200;
    const STRIDE: u32 = 0x20;

    fn at(link: u32, offset: u32) -> u32 {
        BASE + link * STRIDE + offset
    }

    /// Descriptor pushes latch the address high/low...
    pub fn superpage_address_high(link: u32) -> u32 {
        at(link, 0x00)
    }

    pub fn superpage_address_low(link: u32) -> u32 {
        at(link, 0x04)
    }

    /// ...and the write of the page count pushes the descriptor into the
    /// link's FIFO.
    pub fn superpage_pages(link: u32) -> u32 {
        at(link, 0x08)
    }

    /// Completed superpages since DMA start.
    pub fn superpage_count(link: u32) -> u32 {
        at(link, 0x0c)
    }

    /// Size FIFO: a dummy write advances it, a read returns a
    /// [`super::SuperpageSizeWord`].
    pub fn superpage_size(link: u32) -> u32 {
        at(link, 0x10)
    }
}

/// Values for [`reg::DATA_SOURCE_SELECT`].
pub mod data_source {
    /// The optical link (front-end).
    pub const GBT: u32 = 0x0;
    /// Internal datapath emulator.
    pub const INTERNAL: u32 = 0x1;
    /// Firmware data generator.
    pub const DDG: u32 = 0x2;
}

/// BAR 2, management block.
pub mod bar2 {
    /// 10-bit raw temperature reading.
    pub const TEMPERATURE: u32 = 0x00;
    pub const SERIAL: u32 = 0x04;
    pub const FIRMWARE_GIT_HASH: u32 = 0x08;
    pub const FIRMWARE_DATE: u32 = 0x0c;
    pub const FIRMWARE_TIME: u32 = 0x10;
    pub const FPGA_CHIP_HIGH: u32 = 0x14;
    pub const FPGA_CHIP_LOW: u32 = 0x18;
}

/// The number of links a single endpoint can serve.
pub const MAX_LINKS: u32 = 12;

/// Value written to the size FIFO register to make the firmware publish the
/// next entry.
pub const SUPERPAGE_SIZE_FIFO_POKE: u32 = 0xbadcafe;

/// One entry of the per-link superpage size FIFO.
#[bitfield(u32)]
pub struct SuperpageSizeWord {
    /// Superpage fill in bytes; 0 on firmware without a size FIFO.
    #[bits(24)]
    pub size: u32,
    /// Rolling entry index, for detecting stale reads.
    pub index: u8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_word_fields() {
        let word = SuperpageSizeWord::from((3u32 << 24) | 0x2_0000);
        assert_eq!(word.index(), 3);
        assert_eq!(word.size(), 0x2_0000);
    }

    #[test]
    fn link_blocks_do_not_overlap() {
        assert!(link::superpage_size(0) < link::superpage_address_high(1));
        assert_eq!(link::superpage_address_high(2) - link::superpage_address_high(1), 0x20);
    }
}
