// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The C-RORC superpage transfer state machine.

use super::card::Crorc;
use super::card::DiuConfig;
use super::card::RESET_SETTLE_WAIT;
use super::regs::ddl;
use super::regs::fee;
use super::regs::reset;
use super::ready_fifo::DataArrivalStatus;
use super::ready_fifo::ReadyFifo;
use super::ready_fifo::ReadyFifoEntry;
use super::ready_fifo::MAX_SUPERPAGE_DESCRIPTORS;
use super::ready_fifo::READY_FIFO_SIZE;
use crate::bar::SharedBar;
use crate::channel::CardDescriptor;
use crate::channel::ChannelState;
use crate::error::Error;
use crate::error::Result;
use crate::interprocess::InterprocessLock;
use crate::memory::DmaBufferView;
use crate::memory::DmaClient;
use crate::parameters::CardType;
use crate::parameters::DataSource;
use crate::parameters::GeneratorPattern;
use crate::parameters::Parameters;
use crate::parameters::ResetLevel;
use crate::paths::ChannelPaths;
use crate::superpage::Superpage;
use std::collections::VecDeque;
use std::sync::Arc;

/// The only transport unit the C-RORC firmware supports.
pub const DMA_PAGE_SIZE: usize = 8192;

/// Bound on in-flight superpages. One software twin per on-card descriptor.
pub const TRANSFER_QUEUE_CAPACITY: usize = MAX_SUPERPAGE_DESCRIPTORS;
pub const READY_QUEUE_CAPACITY: usize = MAX_SUPERPAGE_DESCRIPTORS;

/// One DMA channel of a C-RORC. All methods must be called from a single
/// thread; the hot path neither allocates nor blocks.
pub struct CrorcDmaChannel {
    descriptor: CardDescriptor,
    channel_number: u32,
    card: Crorc,
    _lock: InterprocessLock,
    ready_fifo: ReadyFifo,
    ready_fifo_bus: u64,
    buffer: DmaBufferView,
    page_size: usize,
    data_source: DataSource,
    generator_enabled: bool,
    generator_pattern: GeneratorPattern,
    generator_data_size: usize,
    rdyrx: bool,
    stbrd: bool,
    initial_reset_level: ResetLevel,
    diu_config: DiuConfig,
    state: ChannelState,
    pending_dma_start: bool,
    free_fifo_front: usize,
    free_fifo_back: usize,
    free_fifo_size: usize,
    transfer_queue: VecDeque<Superpage>,
    ready_queue: VecDeque<Superpage>,
}

impl CrorcDmaChannel {
    pub fn allowed_channels() -> std::ops::RangeInclusive<u32> {
        0..=5
    }

    pub fn new(
        descriptor: CardDescriptor,
        bar: SharedBar,
        buffer: DmaBufferView,
        dma_client: &Arc<dyn DmaClient>,
        paths: &ChannelPaths,
        parameters: &Parameters,
    ) -> Result<Self> {
        if parameters.dma_page_size != DMA_PAGE_SIZE {
            return Err(Error::Parameter(format!(
                "CRORC only supports {DMA_PAGE_SIZE} byte DMA pages, got {}",
                parameters.dma_page_size
            )));
        }
        if parameters.data_source == DataSource::Ddg {
            return Err(Error::Parameter(
                "CRORC does not support the DDG data source".into(),
            ));
        }
        if !Self::allowed_channels().contains(&parameters.channel_number) {
            return Err(Error::Parameter(format!(
                "CRORC channel number {} outside {:?}",
                parameters.channel_number,
                Self::allowed_channels()
            )));
        }

        let lock = InterprocessLock::acquire(&paths.lock())?;

        // Internal loopback by default; the generator is off only when the
        // front-end is the source.
        let generator_enabled = parameters.data_source != DataSource::Fee;
        let stbrd = parameters.stbrd_enabled;
        let rdyrx = !generator_enabled && !stbrd;

        tracing::debug!("initializing ready FIFO DMA buffer");
        let fifo_mem = dma_client
            .allocate_dma_buffer(READY_FIFO_SIZE)
            .map_err(|err| Error::DmaSetup(format!("ready FIFO allocation: {err:#}")))?;
        let first_entry_len = fifo_mem
            .scatter_gather()
            .first()
            .map(|entry| entry.length)
            .unwrap_or(0);
        if first_entry_len < READY_FIFO_SIZE {
            return Err(Error::DmaSetup(
                "scatter/gather entry for internal FIFO too small".into(),
            ));
        }
        let ready_fifo_bus = fifo_mem.bus_address(0).ok_or_else(|| {
            Error::DmaSetup("ready FIFO has no bus address".into())
        })?;
        let ready_fifo = ReadyFifo::new(fifo_mem);
        ready_fifo.reset();

        let card = Crorc::new(bar);
        let diu_config = card.init_diu_version();

        let mut channel = Self {
            descriptor,
            channel_number: parameters.channel_number,
            card,
            _lock: lock,
            ready_fifo,
            ready_fifo_bus,
            buffer,
            page_size: parameters.dma_page_size,
            data_source: parameters.data_source,
            generator_enabled,
            generator_pattern: parameters.generator_pattern,
            generator_data_size: parameters.generator_data_size,
            rdyrx,
            stbrd,
            initial_reset_level: ResetLevel::Internal,
            diu_config,
            state: ChannelState::Created,
            pending_dma_start: false,
            free_fifo_front: 0,
            free_fifo_back: 0,
            free_fifo_size: 0,
            transfer_queue: VecDeque::with_capacity(TRANSFER_QUEUE_CAPACITY),
            ready_queue: VecDeque::with_capacity(READY_QUEUE_CAPACITY),
        };

        // A fresh channel always gets at least an internal reset.
        channel.device_reset_channel(channel.initial_reset_level)?;
        channel.state = ChannelState::Reset;
        Ok(channel)
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn card_type(&self) -> CardType {
        CardType::Crorc
    }

    pub fn serial(&self) -> Option<i32> {
        self.descriptor.serial.or_else(|| self.card.serial())
    }

    pub fn firmware_info(&self) -> Option<String> {
        self.card.firmware_info()
    }

    pub fn temperature(&self) -> Option<f32> {
        None
    }

    pub fn card_id(&self) -> Option<String> {
        None
    }

    pub fn dropped_packets(&self) -> i32 {
        tracing::warn!("no support for dropped packets on the CRORC");
        -1
    }

    pub fn reset_channel(&mut self, level: ResetLevel) -> Result<()> {
        if matches!(
            self.state,
            ChannelState::PendingStart | ChannelState::Running
        ) {
            return Err(Error::Parameter(
                "cannot reset a channel while DMA is active".into(),
            ));
        }
        self.device_reset_channel(level)?;
        self.state = ChannelState::Reset;
        Ok(())
    }

    /// Arms the link and the receiver, then defers the actual DMA start
    /// until the first superpage is pushed: arming the generator or trigger
    /// before a receive buffer exists would drop data.
    pub fn start_dma(&mut self) -> Result<()> {
        if matches!(
            self.state,
            ChannelState::PendingStart | ChannelState::Running
        ) {
            tracing::warn!("DMA already started");
            return Ok(());
        }

        self.diu_config = self.card.init_diu_version();

        let arm_level = match self.data_source {
            DataSource::Siu | DataSource::Fee => ResetLevel::InternalDiuSiu,
            DataSource::Diu => ResetLevel::InternalDiu,
            _ => ResetLevel::Internal,
        };
        self.arm_ddl(arm_level)?;
        self.state = ChannelState::Armed;

        self.card.start_data_receiver(self.ready_fifo_bus);

        tracing::info!("DMA start deferred until superpages are available");
        self.free_fifo_front = 0;
        self.free_fifo_back = 0;
        self.free_fifo_size = 0;
        self.transfer_queue.clear();
        self.ready_queue.clear();
        self.pending_dma_start = true;
        self.state = ChannelState::PendingStart;
        Ok(())
    }

    pub fn stop_dma(&mut self) -> Result<()> {
        if self.state == ChannelState::Stopped {
            tracing::warn!("DMA already stopped");
            return Ok(());
        }
        self.state = ChannelState::Stopping;
        if self.generator_enabled {
            self.card.stop_data_generator();
        } else if self.rdyrx || self.stbrd {
            self.card.stop_trigger(&self.diu_config)?;
        }
        self.card.stop_data_receiver();
        self.pending_dma_start = false;
        self.state = ChannelState::Stopped;
        Ok(())
    }

    pub fn push_superpage(&mut self, superpage: Superpage) -> Result<()> {
        self.check_superpage(&superpage)?;

        if self.transfer_queue.len() >= TRANSFER_QUEUE_CAPACITY {
            return Err(Error::QueueFull);
        }
        if self.free_fifo_size >= MAX_SUPERPAGE_DESCRIPTORS {
            // Cannot happen while the transfer queue bound holds.
            tracing::error!("firmware queue full with transfer queue slots free");
            return Err(Error::QueueFull);
        }

        let bus_address = self.buffer.bus_address(superpage.offset)?;
        let bus_end = self.buffer.bus_address(superpage.offset + superpage.size - 1)?;
        if bus_end != bus_address + (superpage.size - 1) as u64 {
            return Err(Error::DmaSetup(
                "superpage crosses a scatter/gather boundary".into(),
            ));
        }

        self.card.push_rx_free_fifo(
            bus_address,
            (superpage.size / 4) as u32,
            self.free_fifo_front as u32,
        );
        self.free_fifo_size += 1;
        self.free_fifo_front = (self.free_fifo_front + 1) % MAX_SUPERPAGE_DESCRIPTORS;

        self.transfer_queue.push_back(superpage);
        debug_assert!(self.transfer_queue.len() >= self.free_fifo_size);
        Ok(())
    }

    /// Sweeps completed descriptors into the ready queue, starting the
    /// deferred DMA on the first call that sees work queued.
    pub fn fill_superpages(&mut self) -> Result<()> {
        if self.pending_dma_start {
            if self.transfer_queue.is_empty() {
                // Waiting on enough superpages to start DMA.
                return Ok(());
            }
            self.start_pending_dma()?;
        }
        if self.state != ChannelState::Running {
            return Ok(());
        }

        while self.free_fifo_size > 0 {
            let slot = self.free_fifo_back;
            let entry = self.ready_fifo.entry(slot);
            match entry.arrival() {
                Some(DataArrivalStatus::WholeArrived) => {
                    if entry.has_error_bit() {
                        return Err(self.data_arrival_error(
                            "data arrival status word contains error bits",
                            &entry,
                            slot,
                        ));
                    }
                    // Take the length before the slot is recycled.
                    let received = entry.length as usize * 4;
                    self.ready_fifo.reset_entry(slot);
                    self.free_fifo_size -= 1;
                    self.free_fifo_back = (slot + 1) % MAX_SUPERPAGE_DESCRIPTORS;

                    let Some(mut superpage) = self.transfer_queue.pop_front() else {
                        debug_assert!(false, "descriptor completed without a software twin");
                        break;
                    };
                    superpage.set_received(received.min(superpage.size));
                    superpage.set_ready(true);
                    self.ready_queue.push_back(superpage);
                }
                // Completions land in submission order: if this slot has not
                // finished, no later slot has either.
                Some(DataArrivalStatus::NoneArrived | DataArrivalStatus::PartArrived) => break,
                None => {
                    return Err(self.data_arrival_error(
                        "unrecognized data arrival status word",
                        &entry,
                        slot,
                    ));
                }
            }
        }

        debug_assert_eq!(
            self.free_fifo_size % MAX_SUPERPAGE_DESCRIPTORS,
            (self.free_fifo_front + MAX_SUPERPAGE_DESCRIPTORS - self.free_fifo_back)
                % MAX_SUPERPAGE_DESCRIPTORS
        );
        Ok(())
    }

    pub fn get_superpage(&self) -> Result<Superpage> {
        self.ready_queue.front().copied().ok_or(Error::QueueEmpty)
    }

    pub fn pop_superpage(&mut self) -> Result<Superpage> {
        self.ready_queue.pop_front().ok_or(Error::QueueEmpty)
    }

    pub fn transfer_queue_available(&self) -> usize {
        TRANSFER_QUEUE_CAPACITY - self.transfer_queue.len()
    }

    pub fn transfer_queue_capacity(&self) -> usize {
        TRANSFER_QUEUE_CAPACITY
    }

    pub fn ready_queue_size(&self) -> usize {
        self.ready_queue.len()
    }

    pub fn channel_number(&self) -> u32 {
        self.channel_number
    }

    fn check_superpage(&self, superpage: &Superpage) -> Result<()> {
        if !matches!(
            self.state,
            ChannelState::PendingStart | ChannelState::Running
        ) {
            return Err(Error::Parameter("DMA is not started".into()));
        }
        if superpage.size == 0 || superpage.size % self.page_size != 0 {
            return Err(Error::Parameter(format!(
                "superpage size {} is not a positive multiple of the {} byte page size",
                superpage.size, self.page_size
            )));
        }
        if superpage.offset % self.page_size != 0 {
            return Err(Error::Parameter(format!(
                "superpage offset {:#x} is not page aligned",
                superpage.offset
            )));
        }
        if superpage.offset + superpage.size > self.buffer.size() {
            return Err(Error::Parameter(format!(
                "superpage [{:#x}, {:#x}) outside the {} byte buffer",
                superpage.offset,
                superpage.offset + superpage.size,
                self.buffer.size()
            )));
        }
        Ok(())
    }

    fn start_pending_dma(&mut self) -> Result<()> {
        tracing::info!("starting pending DMA");
        if self.generator_enabled {
            tracing::debug!("starting data generator");
            self.start_data_generator()?;
        } else if self.rdyrx || self.stbrd {
            tracing::debug!("starting trigger");
            // Clear SIU/DIU status before the trigger goes out.
            self.card.assert_link_up()?;
            self.card.siu_command(ddl::RAND_CIFST, &self.diu_config)?;
            self.card.diu_command(ddl::RAND_CIFST, &self.diu_config)?;
            let command = if self.rdyrx { fee::RDYRX } else { fee::STBRD };
            self.card.start_trigger(&self.diu_config, command)?;
        }

        std::thread::sleep(RESET_SETTLE_WAIT);
        self.pending_dma_start = false;
        self.state = ChannelState::Running;
        tracing::info!("DMA started");
        Ok(())
    }

    fn start_data_generator(&mut self) -> Result<()> {
        self.card
            .arm_data_generator(self.generator_pattern, self.generator_data_size);

        match self.data_source {
            DataSource::Internal => {
                self.card.set_loopback_on();
                std::thread::sleep(RESET_SETTLE_WAIT);
            }
            DataSource::Siu => {
                self.card.set_siu_loopback(&self.diu_config)?;
                std::thread::sleep(RESET_SETTLE_WAIT);
                self.card.assert_link_up()?;
                self.card.siu_command(ddl::RAND_CIFST, &self.diu_config)?;
                self.card.diu_command(ddl::RAND_CIFST, &self.diu_config)?;
            }
            DataSource::Diu => {
                self.card.set_diu_loopback(&self.diu_config)?;
                std::thread::sleep(RESET_SETTLE_WAIT);
                self.card.diu_command(ddl::RAND_CIFST, &self.diu_config)?;
            }
            _ => {}
        }

        self.card.start_data_generator();
        Ok(())
    }

    /// The reset ladder. Each level performs the work of the levels below
    /// it; re-entry at the same level is safe.
    fn device_reset_channel(&mut self, level: ResetLevel) -> Result<()> {
        if level == ResetLevel::Nothing {
            return Ok(());
        }
        self.diu_config = self.card.init_diu_version();

        tracing::info!(?level, "resetting CRORC");
        self.card.reset_command(
            reset::RORC | reset::FF | reset::FIFOS | reset::ERROR | reset::COUNTERS,
            &self.diu_config,
        )?;

        if level >= ResetLevel::InternalDiu {
            tracing::debug!("resetting DIU");
            self.card.reset_command(reset::DIU, &self.diu_config)?;
        }

        if level >= ResetLevel::InternalDiuSiu {
            tracing::debug!("switching off CRORC loopback");
            self.card.set_loopback_off();
            std::thread::sleep(RESET_SETTLE_WAIT);

            tracing::debug!("resetting DIU");
            self.card.reset_command(reset::DIU, &self.diu_config)?;
            std::thread::sleep(RESET_SETTLE_WAIT);

            tracing::debug!("resetting SIU");
            self.card.reset_command(reset::SIU, &self.diu_config)?;
            std::thread::sleep(RESET_SETTLE_WAIT);

            let status = self
                .card
                .ddl_read_diu(ddl::RESPONSE_TIME_USEC, &self.diu_config)?;
            if status.diu_state() == ddl::STATE_NO_SIGNAL {
                return Err(crate::error::Hardware::SiuNoSignal.into());
            }
            // A timeout here is reported by the read itself.
            self.card
                .ddl_read_siu(ddl::RESPONSE_TIME_USEC, &self.diu_config)?;
        }
        Ok(())
    }

    fn arm_ddl(&mut self, level: ResetLevel) -> Result<()> {
        if level == ResetLevel::Nothing {
            return Ok(());
        }
        let result = self.arm_ddl_inner(level);
        if let Err(err) = &result {
            tracing::error!(
                ?level,
                data_source = ?self.data_source,
                error = err as &dyn std::error::Error,
                "arming the DDL failed"
            );
        }
        // Let the card settle after the reset storm.
        std::thread::sleep(RESET_SETTLE_WAIT);
        result
    }

    fn arm_ddl_inner(&mut self, level: ResetLevel) -> Result<()> {
        let diu = self.diu_config;
        let external = self.data_source.is_external();
        let with_siu = level == ResetLevel::InternalDiuSiu && self.data_source != DataSource::Diu;

        self.card.reset_command(reset::RORC, &diu)?;

        if external && level != ResetLevel::Internal {
            self.card.arm_ddl(reset::DIU, &diu)?;

            if with_siu {
                // The SIU needs a beat between the DIU and SIU stages.
                std::thread::sleep(RESET_SETTLE_WAIT);
                self.card.arm_ddl(reset::SIU, &diu)?;
                self.card.arm_ddl(reset::DIU, &diu)?;
            }

            self.card.arm_ddl(reset::RORC, &diu)?;
            std::thread::sleep(RESET_SETTLE_WAIT);

            if with_siu {
                self.card.assert_link_up()?;
                self.card.siu_command(ddl::RAND_CIFST, &diu)?;
            }
            self.card.diu_command(ddl::RAND_CIFST, &diu)?;
            std::thread::sleep(RESET_SETTLE_WAIT);
        }

        self.card.reset_command(reset::FF, &diu)?;
        // Give the card time to clear the free FIFO.
        std::thread::sleep(RESET_SETTLE_WAIT);
        self.card.assert_free_fifo_empty()?;
        Ok(())
    }

    fn data_arrival_error(
        &self,
        message: &'static str,
        entry: &ReadyFifoEntry,
        slot: usize,
    ) -> Error {
        Error::DataArrival {
            message,
            status: entry.status,
            length: entry.length,
            slot,
            reset_level: self.initial_reset_level,
            data_source: self.data_source,
        }
    }
}
