// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The family-independent channel surface.

use crate::bar::SharedBar;
use crate::crorc::CrorcDmaChannel;
use crate::cru::CruDmaChannel;
use crate::error::Result;
use crate::memory::DmaBufferView;
use crate::memory::DmaClient;
use crate::parameters::CardType;
use crate::parameters::Parameters;
use crate::parameters::PciAddress;
use crate::parameters::ResetLevel;
use crate::paths::ChannelPaths;
use crate::superpage::Superpage;
use std::sync::Arc;

/// Lifecycle of a channel's transfer pipeline.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ChannelState {
    Created,
    Reset,
    Armed,
    /// Armed, with the actual DMA start held back until the first superpage
    /// is available.
    PendingStart,
    Running,
    Stopping,
    Stopped,
}

/// Identity of a probed card.
#[derive(Debug, Copy, Clone)]
pub struct CardDescriptor {
    pub card_type: CardType,
    pub pci_address: PciAddress,
    pub serial: Option<i32>,
}

/// A DMA channel of either card family. The variant is picked once, at
/// construction; everything downstream goes through this one contract.
pub enum CardChannel {
    Crorc(CrorcDmaChannel),
    Cru(CruDmaChannel),
}

impl CardChannel {
    /// Builds the channel for `descriptor`'s family.
    ///
    /// `bar0` carries the DMA register block; `bar2` (CRU only) the
    /// management block. `buffer` is the client's DMA-registered buffer and
    /// `dma_client` allocates the channel's small internal structures.
    pub fn open(
        descriptor: CardDescriptor,
        bar0: SharedBar,
        bar2: Option<SharedBar>,
        buffer: DmaBufferView,
        dma_client: &Arc<dyn DmaClient>,
        parameters: &Parameters,
    ) -> Result<Self> {
        let paths = ChannelPaths::new(descriptor.pci_address, parameters.channel_number);
        Self::open_with_paths(descriptor, bar0, bar2, buffer, dma_client, parameters, &paths)
    }

    /// Like [`Self::open`] with the state paths picked by the caller.
    pub fn open_with_paths(
        descriptor: CardDescriptor,
        bar0: SharedBar,
        bar2: Option<SharedBar>,
        buffer: DmaBufferView,
        dma_client: &Arc<dyn DmaClient>,
        parameters: &Parameters,
        paths: &ChannelPaths,
    ) -> Result<Self> {
        match descriptor.card_type {
            CardType::Crorc => Ok(CardChannel::Crorc(CrorcDmaChannel::new(
                descriptor, bar0, buffer, dma_client, paths, parameters,
            )?)),
            CardType::Cru => Ok(CardChannel::Cru(CruDmaChannel::new(
                descriptor, bar0, bar2, buffer, paths, parameters,
            )?)),
        }
    }

    pub fn state(&self) -> ChannelState {
        match self {
            CardChannel::Crorc(channel) => channel.state(),
            CardChannel::Cru(channel) => channel.state(),
        }
    }

    pub fn start_dma(&mut self) -> Result<()> {
        match self {
            CardChannel::Crorc(channel) => channel.start_dma(),
            CardChannel::Cru(channel) => channel.start_dma(),
        }
    }

    pub fn stop_dma(&mut self) -> Result<()> {
        match self {
            CardChannel::Crorc(channel) => channel.stop_dma(),
            CardChannel::Cru(channel) => channel.stop_dma(),
        }
    }

    pub fn reset_channel(&mut self, level: ResetLevel) -> Result<()> {
        match self {
            CardChannel::Crorc(channel) => channel.reset_channel(level),
            CardChannel::Cru(channel) => channel.reset_channel(level),
        }
    }

    pub fn push_superpage(&mut self, superpage: Superpage) -> Result<()> {
        match self {
            CardChannel::Crorc(channel) => channel.push_superpage(superpage),
            CardChannel::Cru(channel) => channel.push_superpage(superpage),
        }
    }

    pub fn fill_superpages(&mut self) -> Result<()> {
        match self {
            CardChannel::Crorc(channel) => channel.fill_superpages(),
            CardChannel::Cru(channel) => channel.fill_superpages(),
        }
    }

    pub fn get_superpage(&self) -> Result<Superpage> {
        match self {
            CardChannel::Crorc(channel) => channel.get_superpage(),
            CardChannel::Cru(channel) => channel.get_superpage(),
        }
    }

    pub fn pop_superpage(&mut self) -> Result<Superpage> {
        match self {
            CardChannel::Crorc(channel) => channel.pop_superpage(),
            CardChannel::Cru(channel) => channel.pop_superpage(),
        }
    }

    pub fn transfer_queue_available(&self) -> usize {
        match self {
            CardChannel::Crorc(channel) => channel.transfer_queue_available(),
            CardChannel::Cru(channel) => channel.transfer_queue_available(),
        }
    }

    pub fn transfer_queue_capacity(&self) -> usize {
        match self {
            CardChannel::Crorc(channel) => channel.transfer_queue_capacity(),
            CardChannel::Cru(channel) => channel.transfer_queue_capacity(),
        }
    }

    pub fn ready_queue_size(&self) -> usize {
        match self {
            CardChannel::Crorc(channel) => channel.ready_queue_size(),
            CardChannel::Cru(channel) => channel.ready_queue_size(),
        }
    }

    pub fn card_type(&self) -> CardType {
        match self {
            CardChannel::Crorc(channel) => channel.card_type(),
            CardChannel::Cru(channel) => channel.card_type(),
        }
    }

    pub fn serial(&self) -> Option<i32> {
        match self {
            CardChannel::Crorc(channel) => channel.serial(),
            CardChannel::Cru(channel) => channel.serial(),
        }
    }

    pub fn firmware_info(&self) -> Option<String> {
        match self {
            CardChannel::Crorc(channel) => channel.firmware_info(),
            CardChannel::Cru(channel) => channel.firmware_info(),
        }
    }

    pub fn temperature(&self) -> Option<f32> {
        match self {
            CardChannel::Crorc(channel) => channel.temperature(),
            CardChannel::Cru(channel) => channel.temperature(),
        }
    }

    pub fn card_id(&self) -> Option<String> {
        match self {
            CardChannel::Crorc(channel) => channel.card_id(),
            CardChannel::Cru(channel) => channel.card_id(),
        }
    }

    pub fn dropped_packets(&self) -> i32 {
        match self {
            CardChannel::Crorc(channel) => channel.dropped_packets(),
            CardChannel::Cru(channel) => channel.dropped_packets(),
        }
    }
}
