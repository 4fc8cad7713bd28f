// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Register-level models of both card families, for driving the transfer
//! state machines without hardware.
//!
//! The models implement [`BarIo`] and move real pattern data through a
//! shared bus-address space, so completion scanning, ordering and error
//! paths behave as they do against a card.

use crate::bar::BarIo;
use crate::crorc::regs as crorc_regs;
use crate::cru::regs as cru_regs;
use crate::memory::DmaClient;
use crate::memory::MappedDmaTarget;
use crate::memory::MemoryBlock;
use crate::memory::ScatterGatherEntry;
use parking_lot::Mutex;
use std::alloc::Layout;
use std::collections::VecDeque;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;

/// Where emulated allocations start in the fake bus address space.
const BUS_BASE: u64 = 0x1000_0000;

struct HeapMemory {
    ptr: *mut u8,
    layout: Layout,
    sg: Vec<ScatterGatherEntry>,
}

// SAFETY: the allocation is owned and only freed on drop.
unsafe impl Send for HeapMemory {}
// SAFETY: access goes through volatile reads/writes.
unsafe impl Sync for HeapMemory {}

// SAFETY: the heap allocation stays mapped for the lifetime and the single
// scatter/gather entry covers it exactly.
unsafe impl MappedDmaTarget for HeapMemory {
    fn base(&self) -> *const u8 {
        self.ptr
    }

    fn len(&self) -> usize {
        self.layout.size()
    }

    fn scatter_gather(&self) -> &[ScatterGatherEntry] {
        &self.sg
    }
}

impl Drop for HeapMemory {
    fn drop(&mut self) {
        // SAFETY: allocated with this layout in BusSpace::allocate.
        unsafe { std::alloc::dealloc(self.ptr, self.layout) }
    }
}

struct BusRegion {
    bus: u64,
    len: usize,
    block: MemoryBlock,
}

/// A fake bus address space shared by an emulated card and the memory the
/// driver registers with it.
#[derive(Default)]
pub struct BusSpace {
    regions: Mutex<Vec<BusRegion>>,
}

impl BusSpace {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Allocates zeroed, page-aligned memory and maps it into the bus space.
    pub fn allocate(&self, len: usize) -> MemoryBlock {
        let layout = Layout::from_size_align(len.max(4), 4096).unwrap();
        // SAFETY: non-zero size, valid alignment.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        assert!(!ptr.is_null(), "emulated DMA allocation failed");

        let mut regions = self.regions.lock();
        let bus = regions
            .last()
            .map(|r| (r.bus + r.len as u64).next_multiple_of(4096))
            .unwrap_or(BUS_BASE);
        let block = MemoryBlock::new(HeapMemory {
            ptr,
            layout,
            sg: vec![ScatterGatherEntry {
                user_offset: 0,
                bus_address: bus,
                length: len,
            }],
        });
        regions.push(BusRegion {
            bus,
            len,
            block: block.clone(),
        });
        block
    }

    /// Resolves a bus address to the backing block and the offset within it.
    fn resolve(&self, bus: u64) -> Option<(MemoryBlock, usize)> {
        let regions = self.regions.lock();
        let region = regions
            .iter()
            .find(|r| bus >= r.bus && bus < r.bus + r.len as u64)?;
        Some((region.block.clone(), (bus - region.bus) as usize))
    }
}

/// [`DmaClient`] backed by a [`BusSpace`].
pub struct HeapDmaClient {
    bus: Arc<BusSpace>,
}

impl HeapDmaClient {
    pub fn new(bus: Arc<BusSpace>) -> Arc<dyn DmaClient> {
        Arc::new(Self { bus })
    }
}

impl DmaClient for HeapDmaClient {
    fn allocate_dma_buffer(&self, len: usize) -> anyhow::Result<MemoryBlock> {
        Ok(self.bus.allocate(len))
    }
}

#[derive(Debug, Copy, Clone)]
struct FreeFifoDescriptor {
    bus: u64,
    words: u32,
    slot: u32,
}

struct CrorcModel {
    regs: [u32; 64],
    rxff_bus_low: u32,
    rxff_bus_high: u32,
    free_fifo: VecDeque<FreeFifoDescriptor>,
    ready_fifo_bus: u64,
    receiver_on: bool,
    generator_on: bool,
    pattern: u32,
    event_len_words: u32,
    event_counter: u32,
    auto_complete: bool,
    error_bit_next: bool,
}

impl Default for CrorcModel {
    fn default() -> Self {
        Self {
            regs: [0; 64],
            rxff_bus_low: 0,
            rxff_bus_high: 0,
            free_fifo: VecDeque::new(),
            ready_fifo_bus: 0,
            receiver_on: false,
            generator_on: false,
            pattern: crorc_regs::gen_pattern::INCREMENTAL,
            event_len_words: 2048,
            event_counter: 0,
            auto_complete: true,
            error_bit_next: false,
        }
    }
}

/// An emulated C-RORC channel.
pub struct EmulatedCrorc {
    bus: Arc<BusSpace>,
    state: Mutex<CrorcModel>,
    serial: i32,
}

impl EmulatedCrorc {
    pub fn new(bus: Arc<BusSpace>) -> Self {
        Self {
            bus,
            state: Mutex::new(CrorcModel::default()),
            serial: 20121,
        }
    }

    /// When off, descriptors queue up until [`Self::complete_next`].
    pub fn set_auto_complete(&self, auto_complete: bool) {
        self.state.lock().auto_complete = auto_complete;
    }

    /// Completes up to `limit` pending descriptors, in submission order.
    pub fn complete_next(&self, limit: usize) {
        let mut state = self.state.lock();
        for _ in 0..limit {
            if !Self::complete_one(&self.bus, &mut state) {
                break;
            }
        }
    }

    pub fn pending_descriptors(&self) -> usize {
        self.state.lock().free_fifo.len()
    }

    /// Sets the error bit in the next completion's status word.
    pub fn inject_error_bit(&self) {
        self.state.lock().error_bit_next = true;
    }

    fn service(bus: &Arc<BusSpace>, state: &mut CrorcModel) {
        if !state.auto_complete {
            return;
        }
        while state.generator_on && state.receiver_on && Self::complete_one(bus, state) {}
    }

    fn complete_one(bus: &Arc<BusSpace>, state: &mut CrorcModel) -> bool {
        let Some(descriptor) = state.free_fifo.pop_front() else {
            return false;
        };
        let Some((block, base)) = bus.resolve(descriptor.bus) else {
            return false;
        };

        let page_words = state.event_len_words as usize;
        let total_words = descriptor.words as usize;
        let pages = total_words / page_words.max(1);
        for page in 0..pages.max(1) {
            let page_base = base + page * page_words * 4;
            let counter = state.event_counter;
            for i in 0..page_words.min(total_words) {
                let value = if i == 0 {
                    counter
                } else if i < 8 {
                    // Start-of-data header filler; readout skips it.
                    0
                } else {
                    match state.pattern {
                        crorc_regs::gen_pattern::ALTERNATING => 0xa5a5a5a5,
                        crorc_regs::gen_pattern::CONSTANT => 0x12345678,
                        _ => i as u32 - 1,
                    }
                };
                block.write_u32(page_base + i * 4, value);
            }
            state.event_counter = state.event_counter.wrapping_add(1);
        }

        // Completion record: length in words plus a transmission status word.
        if let Some((fifo, fifo_base)) = bus.resolve(state.ready_fifo_bus) {
            let entry = fifo_base + descriptor.slot as usize * 8;
            let mut status =
                crorc_regs::ddl::DTSW | ((descriptor.words << 8) & 0x7fff_ff00);
            if std::mem::take(&mut state.error_bit_next) {
                status |= 1 << 31;
            }
            fifo.write_u32(entry, descriptor.words);
            fifo.write_u32(entry + 4, status);
        }
        true
    }
}

impl BarIo for EmulatedCrorc {
    fn index(&self) -> u8 {
        0
    }

    fn read(&self, offset: u32) -> u32 {
        assert_eq!(offset % 4, 0);
        let state = self.state.lock();
        match offset {
            crorc_regs::reg::STATUS => crorc_regs::status::LINK_UP,
            crorc_regs::reg::DIU_VERSION => 0x21,
            crorc_regs::reg::DDL_STATUS_VALID => 1,
            // A healthy endpoint status word; never in the no-signal state.
            crorc_regs::reg::DDL_STATUS => crorc_regs::ddl::DTSW,
            crorc_regs::reg::RXFF_STATUS => {
                if state.free_fifo.is_empty() {
                    crorc_regs::rxff_status::EMPTY
                } else {
                    0
                }
            }
            crorc_regs::reg::SERIAL => self.serial as u32,
            crorc_regs::reg::FIRMWARE_VERSION => 0x0002_000a,
            _ => state.regs[offset as usize / 4],
        }
    }

    fn write(&self, offset: u32, value: u32) {
        assert_eq!(offset % 4, 0);
        let mut state = self.state.lock();
        match offset {
            crorc_regs::reg::RESET => {
                if value & crorc_regs::reset::FF != 0 {
                    state.free_fifo.clear();
                }
                if value & crorc_regs::reset::COUNTERS != 0 {
                    state.event_counter = 0;
                }
            }
            crorc_regs::reg::RXFF_BUS_LOW => state.rxff_bus_low = value,
            crorc_regs::reg::RXFF_BUS_HIGH => state.rxff_bus_high = value,
            crorc_regs::reg::RXFF_PUSH => {
                let descriptor = FreeFifoDescriptor {
                    bus: ((state.rxff_bus_high as u64) << 32) | state.rxff_bus_low as u64,
                    words: value >> 8,
                    slot: value & 0xff,
                };
                state.free_fifo.push_back(descriptor);
                Self::service(&self.bus, &mut state);
            }
            crorc_regs::reg::READY_FIFO_BUS_LOW => {
                state.ready_fifo_bus =
                    (state.ready_fifo_bus & !0xffff_ffff) | value as u64;
            }
            crorc_regs::reg::READY_FIFO_BUS_HIGH => {
                state.ready_fifo_bus =
                    (state.ready_fifo_bus & 0xffff_ffff) | ((value as u64) << 32);
            }
            crorc_regs::reg::RECEIVER_CONTROL => {
                state.receiver_on = value & 1 != 0;
            }
            crorc_regs::reg::GEN_CONTROL => {
                state.generator_on = value & 1 != 0;
                Self::service(&self.bus, &mut state);
            }
            crorc_regs::reg::GEN_PATTERN => state.pattern = value,
            crorc_regs::reg::GEN_EVENT_LEN => state.event_len_words = value,
            crorc_regs::reg::DDL_COMMAND => {}
            _ => state.regs[offset as usize / 4] = value,
        }
    }
}

const CRU_LINKS: usize = cru_regs::MAX_LINKS as usize;

struct CruModel {
    regs: Vec<u32>,
    address_high: [u32; CRU_LINKS],
    address_low: [u32; CRU_LINKS],
    descriptors: [VecDeque<(u64, u32)>; CRU_LINKS],
    counts: [u32; CRU_LINKS],
    size_fifo: [VecDeque<u32>; CRU_LINKS],
    size_index_next: [u8; CRU_LINKS],
    size_visible: [u32; CRU_LINKS],
    clock_counter: u32,
    event_counter: u32,
    page_size: usize,
    auto_complete: bool,
    corrupt_next_page: bool,
}

impl Default for CruModel {
    fn default() -> Self {
        Self {
            regs: vec![0; 0x400],
            address_high: [0; CRU_LINKS],
            address_low: [0; CRU_LINKS],
            descriptors: Default::default(),
            counts: [0; CRU_LINKS],
            size_fifo: Default::default(),
            size_index_next: [0; CRU_LINKS],
            size_visible: [0; CRU_LINKS],
            clock_counter: 0,
            event_counter: 0,
            page_size: 8192,
            auto_complete: true,
            corrupt_next_page: false,
        }
    }
}

/// An emulated CRU endpoint (BAR 0). One live wrapper serving
/// [`cru_regs::MAX_LINKS`] links.
pub struct EmulatedCru {
    bus: Arc<BusSpace>,
    state: Mutex<CruModel>,
    register_writes: AtomicU64,
}

impl EmulatedCru {
    pub fn new(bus: Arc<BusSpace>) -> Self {
        Self {
            bus,
            state: Mutex::new(CruModel::default()),
            register_writes: AtomicU64::new(0),
        }
    }

    /// The page size the emulated stream is cut into.
    pub fn set_page_size(&self, page_size: usize) {
        self.state.lock().page_size = page_size;
    }

    pub fn set_auto_complete(&self, auto_complete: bool) {
        self.state.lock().auto_complete = auto_complete;
    }

    pub fn complete_next(&self, limit: usize) {
        let mut state = self.state.lock();
        for _ in 0..limit {
            let mut any = false;
            for link in 0..CRU_LINKS {
                if Self::complete_one(&self.bus, &mut state, link) {
                    any = true;
                    break;
                }
            }
            if !any {
                break;
            }
        }
    }

    /// Total writes seen; configuration no-ops leave this unchanged.
    pub fn register_writes(&self) -> u64 {
        self.register_writes.load(Relaxed)
    }

    fn dma_running(state: &CruModel) -> bool {
        let dma_on = state.regs[cru_regs::reg::DMA_CONTROL as usize / 4] & 1 != 0;
        let taking = state.regs[cru_regs::reg::BSP_USER_CONTROL as usize / 4] & 1 != 0;
        dma_on && taking
    }

    fn service(bus: &Arc<BusSpace>, state: &mut CruModel) {
        if !state.auto_complete || !Self::dma_running(state) {
            return;
        }
        for link in 0..CRU_LINKS {
            while Self::dma_running(state) && Self::complete_one(bus, state, link) {}
        }
    }

    fn complete_one(bus: &Arc<BusSpace>, state: &mut CruModel, link: usize) -> bool {
        let Some((bus_address, pages)) = state.descriptors[link].pop_front() else {
            return false;
        };
        let Some((block, base)) = bus.resolve(bus_address) else {
            return false;
        };

        let page_words = state.page_size / 4;
        for page in 0..pages as usize {
            let page_base = base + page * state.page_size;
            let counter = state.event_counter;
            // The emulator writes every 8th 32-bit word.
            for i in (0..page_words).step_by(8) {
                let mut value = counter.wrapping_mul(256) + (i as u32) / 8;
                if i == 8 && std::mem::take(&mut state.corrupt_next_page) {
                    value ^= 0x1;
                }
                block.write_u32(page_base + i * 4, value);
            }
            state.event_counter = state.event_counter.wrapping_add(1);
        }

        let bytes = pages as usize * state.page_size;
        state.size_fifo[link].push_back(bytes as u32);
        state.counts[link] = state.counts[link].wrapping_add(1);
        true
    }

    fn link_of(offset: u32) -> Option<(usize, u32)> {
        if !(0x200..0x200 + CRU_LINKS as u32 * 0x20).contains(&offset) {
            return None;
        }
        Some((((offset - 0x200) / 0x20) as usize, (offset - 0x200) % 0x20))
    }
}

impl BarIo for EmulatedCru {
    fn index(&self) -> u8 {
        0
    }

    fn read(&self, offset: u32) -> u32 {
        assert_eq!(offset % 4, 0);
        let mut state = self.state.lock();
        if let Some((link, sub)) = Self::link_of(offset) {
            return match sub {
                0x0c => state.counts[link],
                0x10 => state.size_visible[link],
                _ => 0,
            };
        }
        match offset {
            o if o == cru_regs::reg::wrapper_clock_counter(0) => {
                // Wrapper 0 is alive: the counter runs.
                state.clock_counter = state.clock_counter.wrapping_add(1);
                state.clock_counter
            }
            o if o == cru_regs::reg::wrapper_clock_counter(1) => 0,
            o if o == cru_regs::reg::wrapper_config(0) => (CRU_LINKS as u32) << 24,
            o if o == cru_regs::reg::wrapper_config(1) => 0,
            _ => state.regs[offset as usize / 4],
        }
    }

    fn write(&self, offset: u32, value: u32) {
        assert_eq!(offset % 4, 0);
        self.register_writes.fetch_add(1, Relaxed);
        let mut state = self.state.lock();
        if let Some((link, sub)) = Self::link_of(offset) {
            match sub {
                0x00 => state.address_high[link] = value,
                0x04 => state.address_low[link] = value,
                0x08 => {
                    let bus =
                        ((state.address_high[link] as u64) << 32) | state.address_low[link] as u64;
                    state.descriptors[link].push_back((bus, value));
                    Self::service(&self.bus, &mut state);
                }
                0x10 => {
                    // A dummy write advances the size FIFO into the visible
                    // register.
                    if let Some(size) = state.size_fifo[link].pop_front() {
                        let index = state.size_index_next[link];
                        state.size_index_next[link] = index.wrapping_add(1);
                        state.size_visible[link] = ((index as u32) << 24) | (size & 0xff_ffff);
                    } else {
                        state.size_visible[link] = 0;
                    }
                }
                _ => {}
            }
            return;
        }
        match offset {
            cru_regs::reg::RESET_CONTROL => {
                if value & 0x1 != 0 {
                    for link in 0..CRU_LINKS {
                        state.descriptors[link].clear();
                        state.size_fifo[link].clear();
                        state.counts[link] = 0;
                        state.size_index_next[link] = 0;
                        state.size_visible[link] = 0;
                    }
                    state.event_counter = 0;
                }
                if value & 0x2 != 0 {
                    state.event_counter = 0;
                }
            }
            cru_regs::reg::DATA_GENERATOR_INJECT_ERROR => {
                state.corrupt_next_page = true;
            }
            _ => {
                state.regs[offset as usize / 4] = value;
                Self::service(&self.bus, &mut state);
            }
        }
    }
}

/// An emulated CRU management window (BAR 2).
pub struct EmulatedCruBar2 {
    serial: i32,
}

impl EmulatedCruBar2 {
    pub fn new(serial: i32) -> Self {
        Self { serial }
    }
}

impl BarIo for EmulatedCruBar2 {
    fn index(&self) -> u8 {
        2
    }

    fn read(&self, offset: u32) -> u32 {
        match offset {
            cru_regs::bar2::TEMPERATURE => 512,
            cru_regs::bar2::SERIAL => self.serial as u32,
            cru_regs::bar2::FIRMWARE_GIT_HASH => 0x1234_abcd,
            cru_regs::bar2::FIRMWARE_DATE => 0x2024_0131,
            cru_regs::bar2::FIRMWARE_TIME => 0x0015_3000,
            cru_regs::bar2::FPGA_CHIP_HIGH => 0x0123_4567,
            cru_regs::bar2::FPGA_CHIP_LOW => 0x89ab_cdef,
            _ => 0,
        }
    }

    fn write(&self, _offset: u32, _value: u32) {}
}
