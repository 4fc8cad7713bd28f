// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::channel::CardDescriptor;
use crate::channel::ChannelState;
use crate::crorc::CrorcDmaChannel;
use crate::cru::CruConfig;
use crate::cru::CruDmaChannel;
use crate::emulated::BusSpace;
use crate::emulated::EmulatedCrorc;
use crate::emulated::EmulatedCru;
use crate::emulated::EmulatedCruBar2;
use crate::emulated::HeapDmaClient;
use crate::error::Error;
use crate::memory::DmaBufferView;
use crate::memory::MemoryBlock;
use crate::parameters::CardId;
use crate::parameters::CardType;
use crate::parameters::GeneratorPattern;
use crate::parameters::Parameters;
use crate::parameters::PciAddress;
use crate::parameters::ResetLevel;
use crate::paths::ChannelPaths;
use crate::superpage::Superpage;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;

const PAGE: usize = 8192;
const SUPERPAGE: usize = 128 * 1024;

fn test_address() -> PciAddress {
    "42:0.0".parse().unwrap()
}

fn test_paths(name: &str) -> ChannelPaths {
    static NEXT: AtomicU32 = AtomicU32::new(0);
    let unique = NEXT.fetch_add(1, Relaxed);
    let root = std::env::temp_dir().join(format!(
        "readout_card_test_{name}_{}_{unique}",
        std::process::id()
    ));
    ChannelPaths::with_root(root, test_address(), 0)
}

struct CrorcRig {
    card: Arc<EmulatedCrorc>,
    channel: CrorcDmaChannel,
    buffer: MemoryBlock,
}

fn crorc_rig(name: &str, buffer_size: usize) -> CrorcRig {
    crorc_rig_with(name, buffer_size, GeneratorPattern::Incremental)
}

fn crorc_rig_with(name: &str, buffer_size: usize, pattern: GeneratorPattern) -> CrorcRig {
    let bus = BusSpace::new();
    let card = Arc::new(EmulatedCrorc::new(bus.clone()));
    let buffer = bus.allocate(buffer_size);
    let dma_client = HeapDmaClient::new(bus);
    let descriptor = CardDescriptor {
        card_type: CardType::Crorc,
        pci_address: test_address(),
        serial: None,
    };
    let parameters = Parameters::new(CardId::Address(test_address()), 0)
        .with_generator_pattern(pattern)
        .with_generator_data_size(PAGE);
    let channel = CrorcDmaChannel::new(
        descriptor,
        card.clone(),
        DmaBufferView::new(buffer.clone()),
        &dma_client,
        &test_paths(name),
        &parameters,
    )
    .unwrap();
    CrorcRig {
        card,
        channel,
        buffer,
    }
}

struct CruRig {
    card: Arc<EmulatedCru>,
    channel: CruDmaChannel,
}

fn cru_rig(name: &str, buffer_size: usize) -> CruRig {
    let bus = BusSpace::new();
    let card = Arc::new(EmulatedCru::new(bus.clone()));
    let bar2: crate::bar::SharedBar = Arc::new(EmulatedCruBar2::new(317));
    let buffer = bus.allocate(buffer_size);
    let descriptor = CardDescriptor {
        card_type: CardType::Cru,
        pci_address: test_address(),
        serial: None,
    };
    let parameters = Parameters::new(CardId::Address(test_address()), 0);
    let channel = CruDmaChannel::new(
        descriptor,
        card.clone(),
        Some(bar2),
        DmaBufferView::new(buffer),
        &test_paths(name),
        &parameters,
    )
    .unwrap();
    CruRig { card, channel }
}

#[test]
fn crorc_smoke() {
    let mut rig = crorc_rig_with("crorc_smoke", 16 * 1024 * 1024, GeneratorPattern::Constant);
    let channel = &mut rig.channel;
    channel.start_dma().unwrap();

    let count = 16 * 1024 * 1024 / SUPERPAGE;
    assert_eq!(count, 128);
    for i in 0..count {
        channel.push_superpage(Superpage::new(i * SUPERPAGE, SUPERPAGE)).unwrap();
    }
    channel.fill_superpages().unwrap();

    let mut total = 0;
    for i in 0..count {
        let superpage = channel.pop_superpage().unwrap();
        assert_eq!(superpage.offset, i * SUPERPAGE);
        assert!(superpage.is_ready());
        assert_eq!(superpage.received(), SUPERPAGE);
        assert_eq!(superpage.received() % 4, 0);
        total += superpage.received();
    }
    assert_eq!(total, 128 * 131072);
    assert!(matches!(channel.pop_superpage(), Err(Error::QueueEmpty)));

    // Constant pattern: payload words carry the fixed value, word 0 the
    // event counter.
    assert_eq!(rig.buffer.read_u32(0), 0);
    assert_eq!(rig.buffer.read_u32(8 * 4), 0x12345678);
    assert_eq!(rig.buffer.read_u32(PAGE), 1);

    channel.stop_dma().unwrap();
    assert_eq!(channel.state(), ChannelState::Stopped);
}

#[test]
fn crorc_deferred_start() {
    let mut rig = crorc_rig("deferred_start", 2 * 1024 * 1024);
    let channel = &mut rig.channel;
    channel.start_dma().unwrap();
    assert_eq!(channel.state(), ChannelState::PendingStart);

    channel.fill_superpages().unwrap();
    channel.fill_superpages().unwrap();
    assert_eq!(channel.state(), ChannelState::PendingStart);

    channel.push_superpage(Superpage::new(0, SUPERPAGE)).unwrap();
    channel.fill_superpages().unwrap();
    assert_eq!(channel.state(), ChannelState::Running);
}

#[test]
fn crorc_order_preservation() {
    let mut rig = crorc_rig("order", 2 * 1024 * 1024);
    rig.card.set_auto_complete(false);
    let channel = &mut rig.channel;
    channel.start_dma().unwrap();

    let offsets = [0, SUPERPAGE, 2 * SUPERPAGE, 3 * SUPERPAGE];
    for &offset in &offsets {
        channel.push_superpage(Superpage::new(offset, SUPERPAGE)).unwrap();
    }
    channel.fill_superpages().unwrap();
    assert_eq!(channel.ready_queue_size(), 0);

    rig.card.complete_next(offsets.len());
    channel.fill_superpages().unwrap();
    assert_eq!(channel.ready_queue_size(), offsets.len());
    for &offset in &offsets {
        assert_eq!(channel.pop_superpage().unwrap().offset, offset);
    }
}

#[test]
fn crorc_scan_stops_at_first_incomplete() {
    let mut rig = crorc_rig("partial_scan", 2 * 1024 * 1024);
    rig.card.set_auto_complete(false);
    let channel = &mut rig.channel;
    channel.start_dma().unwrap();

    for i in 0..3 {
        channel.push_superpage(Superpage::new(i * SUPERPAGE, SUPERPAGE)).unwrap();
    }
    rig.card.complete_next(1);
    channel.fill_superpages().unwrap();
    assert_eq!(channel.ready_queue_size(), 1);
    assert_eq!(channel.transfer_queue_available(), 128 - 2);

    rig.card.complete_next(2);
    channel.fill_superpages().unwrap();
    assert_eq!(channel.ready_queue_size(), 3);
}

#[test]
fn crorc_full_descriptor_ring() {
    let mut rig = crorc_rig("full_ring", 32 * 1024 * 1024);
    rig.card.set_auto_complete(false);
    let channel = &mut rig.channel;
    channel.start_dma().unwrap();

    // 128 in flight fills both the transfer queue and the descriptor ring.
    for i in 0..128 {
        channel.push_superpage(Superpage::new(i * SUPERPAGE, SUPERPAGE)).unwrap();
    }
    assert_eq!(channel.transfer_queue_available(), 0);
    let err = channel
        .push_superpage(Superpage::new(129 * SUPERPAGE, SUPERPAGE))
        .unwrap_err();
    assert!(matches!(err, Error::QueueFull));
    assert_eq!(channel.transfer_queue_available(), 0);

    rig.card.complete_next(1);
    channel.fill_superpages().unwrap();
    channel.pop_superpage().unwrap();
    channel
        .push_superpage(Superpage::new(129 * SUPERPAGE, SUPERPAGE))
        .unwrap();
}

#[test]
fn crorc_stop_with_superpages_in_flight() {
    let mut rig = crorc_rig("stop_in_flight", 32 * 1024 * 1024);
    rig.card.set_auto_complete(false);
    let channel = &mut rig.channel;
    channel.start_dma().unwrap();

    for i in 0..64 {
        channel.push_superpage(Superpage::new(i * SUPERPAGE, SUPERPAGE)).unwrap();
    }
    assert_eq!(channel.transfer_queue_available(), 128 - 64);

    channel.stop_dma().unwrap();
    assert_eq!(channel.state(), ChannelState::Stopped);
    // The undelivered superpages are still accounted for.
    assert_eq!(channel.transfer_queue_available(), 128 - 64);
    assert_eq!(channel.ready_queue_size(), 0);
}

#[test]
fn crorc_rejects_invalid_superpages() {
    let mut rig = crorc_rig("invalid_superpage", 2 * 1024 * 1024);
    let channel = &mut rig.channel;
    channel.start_dma().unwrap();

    // Not a page multiple.
    assert!(matches!(
        channel.push_superpage(Superpage::new(0, PAGE + 100)),
        Err(Error::Parameter(_))
    ));
    // Zero size.
    assert!(matches!(
        channel.push_superpage(Superpage::new(0, 0)),
        Err(Error::Parameter(_))
    ));
    // Outside the buffer.
    assert!(matches!(
        channel.push_superpage(Superpage::new(2 * 1024 * 1024, SUPERPAGE)),
        Err(Error::Parameter(_))
    ));
    // Misaligned offset.
    assert!(matches!(
        channel.push_superpage(Superpage::new(100, SUPERPAGE)),
        Err(Error::Parameter(_))
    ));
    assert_eq!(channel.transfer_queue_available(), 128);
}

#[test]
fn crorc_push_requires_started_dma() {
    let mut rig = crorc_rig("push_not_started", 2 * 1024 * 1024);
    assert!(matches!(
        rig.channel.push_superpage(Superpage::new(0, SUPERPAGE)),
        Err(Error::Parameter(_))
    ));
}

#[test]
fn crorc_error_bit_surfaces_as_data_arrival_error() {
    let mut rig = crorc_rig("error_bit", 2 * 1024 * 1024);
    let channel = &mut rig.channel;
    channel.start_dma().unwrap();

    rig.card.inject_error_bit();
    channel.push_superpage(Superpage::new(0, SUPERPAGE)).unwrap();
    // First fill starts the DMA; the completion then lands with the error
    // bit set.
    let result = channel
        .fill_superpages()
        .and_then(|()| channel.fill_superpages());
    match result {
        Err(Error::DataArrival { status, slot, .. }) => {
            assert_ne!(status & (1 << 31), 0);
            assert_eq!(slot, 0);
        }
        other => panic!("expected a data arrival error, got {other:?}"),
    }
}

#[test]
fn crorc_reset_is_idempotent() {
    let mut rig = crorc_rig("reset_idempotent", 2 * 1024 * 1024);
    let channel = &mut rig.channel;
    channel.reset_channel(ResetLevel::Internal).unwrap();
    channel.reset_channel(ResetLevel::Internal).unwrap();
    assert_eq!(channel.state(), ChannelState::Reset);

    // The channel still starts and transfers after repeated resets.
    channel.start_dma().unwrap();
    channel.push_superpage(Superpage::new(0, SUPERPAGE)).unwrap();
    channel.fill_superpages().unwrap();
    assert_eq!(channel.pop_superpage().unwrap().received(), SUPERPAGE);
}

#[test]
fn crorc_rejects_wrong_page_size() {
    let bus = BusSpace::new();
    let card = Arc::new(EmulatedCrorc::new(bus.clone()));
    let buffer = bus.allocate(2 * 1024 * 1024);
    let dma_client = HeapDmaClient::new(bus);
    let descriptor = CardDescriptor {
        card_type: CardType::Crorc,
        pci_address: test_address(),
        serial: None,
    };
    let parameters =
        Parameters::new(CardId::Address(test_address()), 0).with_dma_page_size(4096);
    let result = CrorcDmaChannel::new(
        descriptor,
        card,
        DmaBufferView::new(buffer),
        &dma_client,
        &test_paths("wrong_page_size"),
        &parameters,
    );
    assert!(matches!(result, Err(Error::Parameter(_))));
}

#[test]
fn cru_smoke() {
    let mut rig = cru_rig("cru_smoke", 8 * 1024 * 1024);
    let channel = &mut rig.channel;
    channel.start_dma().unwrap();

    let count = 32;
    for i in 0..count {
        channel.push_superpage(Superpage::new(i * SUPERPAGE, SUPERPAGE)).unwrap();
    }
    channel.fill_superpages().unwrap();

    for i in 0..count {
        let superpage = channel.pop_superpage().unwrap();
        assert_eq!(superpage.offset, i * SUPERPAGE);
        assert!(superpage.is_ready());
        assert_eq!(superpage.received(), SUPERPAGE);
    }
    channel.stop_dma().unwrap();
}

#[test]
fn cru_deferred_start() {
    let mut rig = cru_rig("cru_deferred", 2 * 1024 * 1024);
    let channel = &mut rig.channel;
    channel.start_dma().unwrap();
    channel.fill_superpages().unwrap();
    assert_eq!(channel.state(), ChannelState::PendingStart);

    channel.push_superpage(Superpage::new(0, SUPERPAGE)).unwrap();
    channel.fill_superpages().unwrap();
    assert_eq!(channel.state(), ChannelState::Running);
    assert_eq!(channel.ready_queue_size(), 1);
}

#[test]
fn cru_reconfigure_same_config_is_a_noop() {
    let mut rig = cru_rig("cru_reconfigure", 2 * 1024 * 1024);
    let channel = &mut rig.channel;
    channel.start_dma().unwrap();

    let config = CruConfig {
        data_source: crate::parameters::DataSource::Internal,
        links_enabled: [0x1, 0x0],
        ..Default::default()
    };
    let writes_before = rig.card.register_writes();
    channel.card_mut().reconfigure(&config).unwrap();
    assert_eq!(rig.card.register_writes(), writes_before);
}

#[test]
fn cru_rejects_link_data_sources() {
    let bus = BusSpace::new();
    let card = Arc::new(EmulatedCru::new(bus.clone()));
    let buffer = bus.allocate(2 * 1024 * 1024);
    let descriptor = CardDescriptor {
        card_type: CardType::Cru,
        pci_address: test_address(),
        serial: None,
    };
    let parameters = Parameters::new(CardId::Address(test_address()), 0)
        .with_data_source(crate::parameters::DataSource::Siu);
    let result = CruDmaChannel::new(
        descriptor,
        card,
        None,
        DmaBufferView::new(buffer),
        &test_paths("cru_bad_source"),
        &parameters,
    );
    assert!(matches!(result, Err(Error::Parameter(_))));
}

#[test]
fn cru_management_reads() {
    let rig = cru_rig("cru_management", 2 * 1024 * 1024);
    assert_eq!(rig.channel.serial(), Some(317));
    let temperature = rig.channel.temperature().unwrap();
    assert!((0.0..120.0).contains(&temperature));
    assert!(rig.channel.firmware_info().is_some());
    assert!(rig.channel.card_id().is_some());
}

#[test]
fn channel_lock_is_exclusive() {
    let bus = BusSpace::new();
    let card = Arc::new(EmulatedCrorc::new(bus.clone()));
    let buffer = bus.allocate(2 * 1024 * 1024);
    let dma_client = HeapDmaClient::new(bus);
    let descriptor = CardDescriptor {
        card_type: CardType::Crorc,
        pci_address: test_address(),
        serial: None,
    };
    let parameters = Parameters::new(CardId::Address(test_address()), 0);
    let paths = test_paths("lock_exclusive");

    let first = CrorcDmaChannel::new(
        descriptor,
        card.clone(),
        DmaBufferView::new(buffer.clone()),
        &dma_client,
        &paths,
        &parameters,
    )
    .unwrap();
    let second = CrorcDmaChannel::new(
        descriptor,
        card,
        DmaBufferView::new(buffer),
        &dma_client,
        &paths,
        &parameters,
    );
    assert!(matches!(second, Err(Error::Lock { .. })));
    drop(first);
}
