// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! C-RORC command primitives. Each is atomic at the driver level; callers
//! serialize per channel.

use super::regs::ddl;
use super::regs::fee;
use super::regs::loopback;
use super::regs::reg;
use super::regs::rxff_status;
use super::regs::status;
use super::regs::StWord;
use crate::bar::SharedBar;
use crate::error::DdlEndpoint;
use crate::error::Hardware;
use crate::error::Result;
use crate::parameters::GeneratorPattern;
use std::time::Duration;
use std::time::Instant;

/// Hardware settle time inserted between reset/arm stages. The firmware has
/// never documented a required value; this one is known to work.
pub const RESET_SETTLE_WAIT: Duration = Duration::from_millis(100);

/// Link calibration derived at arm time.
#[derive(Debug, Copy, Clone)]
pub struct DiuConfig {
    pub diu_version: u32,
    /// How many register reads fit in a microsecond; paces DDL status polls.
    pub pci_loop_per_usec: u64,
}

/// Typed front-end for a C-RORC channel's BAR 0.
pub struct Crorc {
    bar: SharedBar,
}

impl Crorc {
    pub fn new(bar: SharedBar) -> Self {
        assert_eq!(bar.index(), 0);
        Self { bar }
    }

    pub fn bar(&self) -> &SharedBar {
        &self.bar
    }

    /// Reads the DIU version and calibrates the register-read pacing loop.
    pub fn init_diu_version(&self) -> DiuConfig {
        let diu_version = self.bar.read(reg::DIU_VERSION);
        const CALIBRATION_READS: u64 = 1000;
        let start = Instant::now();
        for _ in 0..CALIBRATION_READS {
            self.bar.read(reg::STATUS);
        }
        let elapsed_usec = start.elapsed().as_micros().max(1) as u64;
        DiuConfig {
            diu_version,
            pci_loop_per_usec: (CALIBRATION_READS / elapsed_usec).max(1),
        }
    }

    /// Issues a reset over the given mask of card stages and waits for the
    /// card to report the sequence settled.
    pub fn reset_command(&self, mask: u32, diu: &DiuConfig) -> Result<()> {
        tracing::debug!(mask = format_args!("{mask:#x}"), "reset command");
        self.bar.write(reg::RESET, mask);
        self.wait_reset_settled(diu)
    }

    fn wait_reset_settled(&self, diu: &DiuConfig) -> Result<()> {
        let loops = ddl::RESPONSE_TIME_USEC * diu.pci_loop_per_usec;
        for _ in 0..loops {
            if self.bar.read(reg::STATUS) & status::RESET_IN_PROGRESS == 0 {
                return Ok(());
            }
        }
        Err(Hardware::ResetTimeout.into())
    }

    /// Reset step used while arming the DDL; identical wire format to
    /// [`Self::reset_command`] but callers follow it with link checks.
    pub fn arm_ddl(&self, mask: u32, diu: &DiuConfig) -> Result<()> {
        self.reset_command(mask, diu)
    }

    pub fn arm_data_generator(&self, pattern: GeneratorPattern, event_size: usize) {
        use super::regs::gen_pattern;
        let code = match pattern {
            GeneratorPattern::Incremental => gen_pattern::INCREMENTAL,
            GeneratorPattern::Alternating => gen_pattern::ALTERNATING,
            GeneratorPattern::Constant => gen_pattern::CONSTANT,
        };
        self.bar.write(reg::GEN_PATTERN, code);
        self.bar.write(reg::GEN_EVENT_LEN, (event_size / 4) as u32);
    }

    pub fn start_data_generator(&self) {
        self.bar.write(reg::GEN_CONTROL, 1);
    }

    pub fn stop_data_generator(&self) {
        self.bar.write(reg::GEN_CONTROL, 0);
    }

    /// Points the card at the host ready FIFO and enables the receiver.
    pub fn start_data_receiver(&self, ready_fifo_bus: u64) {
        self.bar
            .write(reg::READY_FIFO_BUS_LOW, ready_fifo_bus as u32);
        self.bar
            .write(reg::READY_FIFO_BUS_HIGH, (ready_fifo_bus >> 32) as u32);
        self.bar.write(reg::RECEIVER_CONTROL, 1);
    }

    pub fn stop_data_receiver(&self) {
        self.bar.write(reg::RECEIVER_CONTROL, 0);
    }

    pub fn set_loopback_on(&self) {
        self.bar.write(reg::LOOPBACK, loopback::INTERNAL);
    }

    pub fn set_loopback_off(&self) {
        self.bar.write(reg::LOOPBACK, loopback::OFF);
    }

    /// Puts the SIU in interface-loopback mode.
    pub fn set_siu_loopback(&self, diu: &DiuConfig) -> Result<StWord> {
        self.bar.write(reg::LOOPBACK, loopback::SIU);
        self.siu_command(ddl::IFLOOP, diu)
    }

    /// Puts the DIU in interface-loopback mode.
    pub fn set_diu_loopback(&self, diu: &DiuConfig) -> Result<StWord> {
        self.bar.write(reg::LOOPBACK, loopback::DIU);
        self.diu_command(ddl::IFLOOP, diu)
    }

    /// Sends `opcode` to the SIU and reads back its status.
    pub fn siu_command(&self, opcode: u32, diu: &DiuConfig) -> Result<StWord> {
        self.ddl_send(ddl::DEST_SIU, opcode);
        self.ddl_read_siu(ddl::RESPONSE_TIME_USEC, diu)
    }

    /// Sends `opcode` to the DIU and reads back its status.
    pub fn diu_command(&self, opcode: u32, diu: &DiuConfig) -> Result<StWord> {
        self.ddl_send(ddl::DEST_DIU, opcode);
        self.ddl_read_diu(ddl::RESPONSE_TIME_USEC, diu)
    }

    /// Sends the front-end the begin-streaming command (RDYRX or STBRD).
    pub fn start_trigger(&self, diu: &DiuConfig, command: u32) -> Result<()> {
        debug_assert!(command == fee::RDYRX || command == fee::STBRD);
        self.ddl_send(ddl::DEST_FEE, command);
        // The front-end acknowledges on the DIU side.
        self.ddl_read_diu(ddl::RESPONSE_TIME_USEC, diu)?;
        Ok(())
    }

    /// Sends the front-end an end-of-block-transfer.
    pub fn stop_trigger(&self, diu: &DiuConfig) -> Result<()> {
        self.ddl_send(ddl::DEST_FEE, fee::EOBTR);
        self.ddl_read_diu(ddl::RESPONSE_TIME_USEC, diu)?;
        Ok(())
    }

    pub fn assert_link_up(&self) -> Result<()> {
        if self.bar.read(reg::STATUS) & status::LINK_UP == 0 {
            return Err(Hardware::LinkDown.into());
        }
        Ok(())
    }

    pub fn assert_free_fifo_empty(&self) -> Result<()> {
        if self.bar.read(reg::RXFF_STATUS) & rxff_status::EMPTY == 0 {
            return Err(Hardware::FreeFifoNotEmpty.into());
        }
        Ok(())
    }

    /// Pushes one descriptor into the card's RX free FIFO: buffer bus
    /// address, block length in 32-bit words, and the ready-FIFO slot the
    /// completion must land in.
    pub fn push_rx_free_fifo(&self, bus_address: u64, length_words: u32, slot: u32) {
        debug_assert!(length_words < 1 << 24);
        debug_assert!(slot < 0x100);
        self.bar.write(reg::RXFF_BUS_LOW, bus_address as u32);
        self.bar.write(reg::RXFF_BUS_HIGH, (bus_address >> 32) as u32);
        self.bar.write(reg::RXFF_PUSH, (length_words << 8) | slot);
    }

    /// Reads the DIU's pending status word, failing with an explicit
    /// timeout when it does not answer in `timeout_usec`.
    pub fn ddl_read_diu(&self, timeout_usec: u64, diu: &DiuConfig) -> Result<StWord> {
        self.ddl_read(DdlEndpoint::Diu, timeout_usec, diu)
    }

    /// Same for the SIU.
    pub fn ddl_read_siu(&self, timeout_usec: u64, diu: &DiuConfig) -> Result<StWord> {
        self.ddl_read(DdlEndpoint::Siu, timeout_usec, diu)
    }

    fn ddl_send(&self, destination: u32, opcode: u32) {
        self.bar
            .write(reg::DDL_COMMAND, (destination << 8) | (opcode & 0xff));
    }

    fn ddl_read(&self, endpoint: DdlEndpoint, timeout_usec: u64, diu: &DiuConfig) -> Result<StWord> {
        let loops = timeout_usec * diu.pci_loop_per_usec;
        for _ in 0..loops {
            if self.bar.read(reg::DDL_STATUS_VALID) & 1 != 0 {
                return Ok(StWord::from(self.bar.read(reg::DDL_STATUS)));
            }
        }
        Err(Hardware::DdlTimeout {
            endpoint,
            timeout_usec,
        }
        .into())
    }

    pub fn serial(&self) -> Option<i32> {
        match self.bar.read(reg::SERIAL) {
            0 | u32::MAX => None,
            serial => Some(serial as i32),
        }
    }

    pub fn firmware_info(&self) -> Option<String> {
        match self.bar.read(reg::FIRMWARE_VERSION) {
            0 | u32::MAX => None,
            version => Some(format!("{:x}.{:x}", version >> 16, version & 0xffff)),
        }
    }
}
