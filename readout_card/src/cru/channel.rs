// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The CRU superpage transfer state machine.
//!
//! Same pipeline shape as the C-RORC's, but the descriptor ring lives in
//! firmware: pushes go through per-link FIFO registers and completions are
//! observed through the link's superpage count and size FIFO.

use super::card::CruBar;
use super::card::CruConfig;
use super::regs::MAX_LINKS;
use crate::bar::SharedBar;
use crate::channel::CardDescriptor;
use crate::channel::ChannelState;
use crate::crorc::card::RESET_SETTLE_WAIT;
use crate::error::Error;
use crate::error::Result;
use crate::interprocess::InterprocessLock;
use crate::memory::DmaBufferView;
use crate::parameters::CardType;
use crate::parameters::DataSource;
use crate::parameters::Parameters;
use crate::parameters::ResetLevel;
use crate::paths::ChannelPaths;
use crate::superpage::Superpage;
use std::collections::VecDeque;

/// Depth of a link's firmware descriptor FIFO.
pub const MAX_SUPERPAGE_DESCRIPTORS: usize = 128;

pub const TRANSFER_QUEUE_CAPACITY: usize = MAX_SUPERPAGE_DESCRIPTORS;
pub const READY_QUEUE_CAPACITY: usize = MAX_SUPERPAGE_DESCRIPTORS;

/// One DMA channel (= one link) of a CRU. Single-threaded, allocation-free
/// on the hot path.
pub struct CruDmaChannel {
    descriptor: CardDescriptor,
    link: u32,
    card: CruBar,
    _lock: InterprocessLock,
    buffer: DmaBufferView,
    page_size: usize,
    data_source: DataSource,
    generator_enabled: bool,
    config: CruConfig,
    state: ChannelState,
    pending_dma_start: bool,
    /// Completions consumed from the link's superpage count so far.
    superpages_consumed: u32,
    transfer_queue: VecDeque<Superpage>,
    ready_queue: VecDeque<Superpage>,
}

impl CruDmaChannel {
    pub fn allowed_channels() -> std::ops::Range<u32> {
        0..MAX_LINKS
    }

    pub fn new(
        descriptor: CardDescriptor,
        bar0: SharedBar,
        bar2: Option<SharedBar>,
        buffer: DmaBufferView,
        paths: &ChannelPaths,
        parameters: &Parameters,
    ) -> Result<Self> {
        if !parameters.dma_page_size.is_power_of_two() || parameters.dma_page_size == 0 {
            return Err(Error::Parameter(format!(
                "DMA page size {} is not a power of two",
                parameters.dma_page_size
            )));
        }
        if matches!(parameters.data_source, DataSource::Siu | DataSource::Diu) {
            return Err(Error::Parameter(format!(
                "CRU does not support the {:?} data source",
                parameters.data_source
            )));
        }
        if !Self::allowed_channels().contains(&parameters.channel_number) {
            return Err(Error::Parameter(format!(
                "CRU channel number {} outside {:?}",
                parameters.channel_number,
                Self::allowed_channels()
            )));
        }

        let lock = InterprocessLock::acquire(&paths.lock())?;
        let card = CruBar::new(bar0, bar2);

        let link = parameters.channel_number;
        let config = CruConfig {
            data_source: parameters.data_source,
            links_enabled: [
                if link < 6 { 1 << link } else { 0 },
                if link >= 6 { 1 << (link - 6) } else { 0 },
            ],
            ..Default::default()
        };

        let mut channel = Self {
            descriptor,
            link,
            card,
            _lock: lock,
            buffer,
            page_size: parameters.dma_page_size,
            data_source: parameters.data_source,
            generator_enabled: parameters.data_source != DataSource::Fee,
            config,
            state: ChannelState::Created,
            pending_dma_start: false,
            superpages_consumed: 0,
            transfer_queue: VecDeque::with_capacity(TRANSFER_QUEUE_CAPACITY),
            ready_queue: VecDeque::with_capacity(READY_QUEUE_CAPACITY),
        };

        channel.device_reset_channel(ResetLevel::Internal);
        channel.state = ChannelState::Reset;
        Ok(channel)
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn card_type(&self) -> CardType {
        CardType::Cru
    }

    pub fn serial(&self) -> Option<i32> {
        self.descriptor.serial.or_else(|| self.card.serial())
    }

    pub fn firmware_info(&self) -> Option<String> {
        self.card.firmware_info()
    }

    pub fn temperature(&self) -> Option<f32> {
        self.card.temperature()
    }

    pub fn card_id(&self) -> Option<String> {
        self.card.chip_id()
    }

    pub fn dropped_packets(&self) -> i32 {
        let wrapper = self.card.endpoint_number().max(0) as u32;
        self.card.dropped_packets(wrapper) as i32
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
        self.device_reset_channel(level);
        self.state = ChannelState::Reset;
        Ok(())
    }

    pub fn start_dma(&mut self) -> Result<()> {
        if matches!(
            self.state,
            ChannelState::PendingStart | ChannelState::Running
        ) {
            tracing::warn!("DMA already started");
            return Ok(());
        }

        self.card.reconfigure(&self.config)?;
        self.card.set_data_source(self.data_source)?;
        self.card.reset_data_generator_counter();
        self.state = ChannelState::Armed;

        tracing::info!("DMA start deferred until superpages are available");
        self.superpages_consumed = self.card.superpage_count(self.link);
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
            self.card.set_data_emulator_enabled(false);
        }
        self.card.disable_data_taking();
        self.pending_dma_start = false;
        self.state = ChannelState::Stopped;
        Ok(())
    }

    pub fn push_superpage(&mut self, superpage: Superpage) -> Result<()> {
        self.check_superpage(&superpage)?;

        if self.transfer_queue.len() >= TRANSFER_QUEUE_CAPACITY {
            return Err(Error::QueueFull);
        }

        let bus_address = self.buffer.bus_address(superpage.offset)?;
        let bus_end = self.buffer.bus_address(superpage.offset + superpage.size - 1)?;
        if bus_end != bus_address + (superpage.size - 1) as u64 {
            return Err(Error::DmaSetup(
                "superpage crosses a scatter/gather boundary".into(),
            ));
        }

        let pages = (superpage.size / self.page_size) as u32;
        self.card
            .push_superpage_descriptor(self.link, pages, bus_address);
        self.transfer_queue.push_back(superpage);
        Ok(())
    }

    pub fn fill_superpages(&mut self) -> Result<()> {
        if self.pending_dma_start {
            if self.transfer_queue.is_empty() {
                // Waiting on enough superpages to start DMA.
                return Ok(());
            }
            self.start_pending_dma();
        }
        if self.state != ChannelState::Running {
            return Ok(());
        }

        let completed = self.card.superpage_count(self.link);
        while self.superpages_consumed != completed && !self.transfer_queue.is_empty() {
            let reported = self.card.superpage_size(self.link) as usize;
            let Some(mut superpage) = self.transfer_queue.pop_front() else {
                break;
            };
            // Firmware without a size FIFO reports 0; those builds always
            // fill the whole superpage.
            let received = if reported == 0 {
                superpage.size
            } else {
                reported.min(superpage.size)
            };
            superpage.set_received(received);
            superpage.set_ready(true);
            self.ready_queue.push_back(superpage);
            self.superpages_consumed = self.superpages_consumed.wrapping_add(1);
        }
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
        self.link
    }

    /// Direct access to the card primitives, for configuration tooling.
    pub fn card_mut(&mut self) -> &mut CruBar {
        &mut self.card
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

    fn start_pending_dma(&mut self) {
        tracing::info!("starting pending DMA");
        if self.generator_enabled {
            self.card.set_data_emulator_enabled(true);
        }
        self.card.enable_data_taking();
        std::thread::sleep(RESET_SETTLE_WAIT);
        self.pending_dma_start = false;
        self.state = ChannelState::Running;
        tracing::info!("DMA started");
    }

    fn device_reset_channel(&mut self, level: ResetLevel) {
        if level == ResetLevel::Nothing {
            return;
        }
        // The CRU has no DIU/SIU stages; every level above Nothing is a full
        // card reset.
        tracing::info!("resetting CRU");
        self.card.reset_card();
        self.card.reset_data_generator_counter();
        std::thread::sleep(RESET_SETTLE_WAIT);
    }
}
