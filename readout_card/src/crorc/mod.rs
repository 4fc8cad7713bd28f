// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Support for the legacy C-RORC readout card.

pub mod card;
pub mod channel;
pub mod ready_fifo;
pub mod regs;

pub use card::Crorc;
pub use card::DiuConfig;
pub use channel::CrorcDmaChannel;
pub use channel::DMA_PAGE_SIZE;
pub use ready_fifo::MAX_SUPERPAGE_DESCRIPTORS;
