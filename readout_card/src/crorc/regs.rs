// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! C-RORC register map and wire constants. All offsets are BAR 0, in bytes.

use bitfield_struct::bitfield;

/// Channel control/command block.
pub mod reg {
    /// Reset command register. Write a mask of [`super::reset`] bits.
    pub const RESET: u32 = 0x00;
    /// Operation/link status. See [`super::status`].
    pub const STATUS: u32 = 0x04;
    /// DIU hardware version.
    pub const DIU_VERSION: u32 = 0x08;
    /// Loopback control. See [`super::loopback`].
    pub const LOOPBACK: u32 = 0x0c;

    /// Outgoing DDL command: `(destination << 8) | opcode`.
    pub const DDL_COMMAND: u32 = 0x10;
    /// Incoming DDL status word, valid while bit 0 of
    /// [`DDL_STATUS_VALID`] is set.
    pub const DDL_STATUS: u32 = 0x14;
    pub const DDL_STATUS_VALID: u32 = 0x18;

    /// RX free-FIFO push: latch the buffer bus address...
    pub const RXFF_BUS_LOW: u32 = 0x20;
    pub const RXFF_BUS_HIGH: u32 = 0x24;
    /// ...then write `(word count << 8) | slot` to push the descriptor.
    pub const RXFF_PUSH: u32 = 0x28;
    /// Bit 0 set when the free FIFO holds no descriptors.
    pub const RXFF_STATUS: u32 = 0x2c;

    /// Bus address the card writes completion status to.
    pub const READY_FIFO_BUS_LOW: u32 = 0x30;
    pub const READY_FIFO_BUS_HIGH: u32 = 0x34;
    /// Bit 0 enables the data receiver.
    pub const RECEIVER_CONTROL: u32 = 0x38;

    /// Bit 0 runs the on-card data generator.
    pub const GEN_CONTROL: u32 = 0x40;
    /// Pattern code, see [`super::gen_pattern`].
    pub const GEN_PATTERN: u32 = 0x44;
    /// Generated event length in 32-bit words.
    pub const GEN_EVENT_LEN: u32 = 0x48;

    pub const SERIAL: u32 = 0x70;
    pub const FIRMWARE_VERSION: u32 = 0x74;
}

/// Bits of the [`reg::RESET`] mask.
pub mod reset {
    pub const RORC: u32 = 1 << 0;
    pub const DIU: u32 = 1 << 1;
    pub const SIU: u32 = 1 << 2;
    /// Free FIFO.
    pub const FF: u32 = 1 << 3;
    /// All other FIFOs.
    pub const FIFOS: u32 = 1 << 4;
    pub const ERROR: u32 = 1 << 5;
    pub const COUNTERS: u32 = 1 << 6;
}

/// Bits of [`reg::STATUS`].
pub mod status {
    pub const LINK_UP: u32 = 1 << 0;
    /// Set while a reset sequence is still settling.
    pub const RESET_IN_PROGRESS: u32 = 1 << 1;
}

/// Bits of [`reg::RXFF_STATUS`].
pub mod rxff_status {
    pub const EMPTY: u32 = 1 << 0;
}

/// Values for [`reg::LOOPBACK`].
pub mod loopback {
    pub const OFF: u32 = 0x0;
    pub const INTERNAL: u32 = 0x1;
    pub const DIU: u32 = 0x2;
    pub const SIU: u32 = 0x3;
}

/// Generator pattern codes for [`reg::GEN_PATTERN`].
pub mod gen_pattern {
    pub const INCREMENTAL: u32 = 0x1;
    pub const ALTERNATING: u32 = 0x2;
    pub const CONSTANT: u32 = 0x3;
}

/// DDL protocol constants.
pub mod ddl {
    /// Destination field of [`super::reg::DDL_COMMAND`].
    pub const DEST_DIU: u32 = 0x1;
    pub const DEST_SIU: u32 = 0x2;
    pub const DEST_FEE: u32 = 0x3;

    /// Read-and-clear interface status.
    pub const RAND_CIFST: u32 = 0x11;
    /// Interface loopback toggle.
    pub const IFLOOP: u32 = 0x15;

    /// Data-transmission status word marker: a whole block has arrived when
    /// the low byte of the ready-FIFO status equals this.
    pub const DTSW: u32 = 0x82;

    /// How long an endpoint may take to answer a DDL read, in microseconds.
    pub const RESPONSE_TIME_USEC: u64 = 1000;

    /// DIU status field (bits 15..=17) value meaning no signal on the line.
    pub const STATE_NO_SIGNAL: u32 = 0x6;
}

/// Front-end trigger command opcodes, sent with destination
/// [`ddl::DEST_FEE`].
pub mod fee {
    /// Begin streaming, card-paced.
    pub const RDYRX: u32 = 0x14;
    /// Begin streaming, host-paced block reads.
    pub const STBRD: u32 = 0x1a;
    /// End of block transfer.
    pub const EOBTR: u32 = 0x0b;
}

/// A DDL status word as read back from [`reg::DDL_STATUS`].
#[bitfield(u32)]
pub struct StWord {
    /// Transmission status marker; [`ddl::DTSW`] on a completed block.
    pub code: u8,
    /// Endpoint-specific payload. For DIU status reads, bits 7..=9 of this
    /// field (bits 15..=17 of the word) carry the line state.
    #[bits(23)]
    pub info: u32,
    pub error: bool,
}

impl StWord {
    /// Line-state field of a DIU status read.
    pub fn diu_state(&self) -> u32 {
        (u32::from(*self) >> 15) & 0x7
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stword_fields() {
        // A whole-arrived status for a 4 KiB event in internal loopback.
        let word = StWord::from(0x0040_0082);
        assert_eq!(word.code(), 0x82);
        assert!(!word.error());

        let word = StWord::from(0x8000_0082);
        assert!(word.error());
    }

    #[test]
    fn diu_state_extraction() {
        let word = StWord::from(0x6 << 15);
        assert_eq!(word.diu_state(), ddl::STATE_NO_SIGNAL);
    }
}
