// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! On-the-fly verification of generated data against the expected pattern.

use readout_card::CardType;
use readout_card::GeneratorPattern;
use readout_card::MemoryBlock;
use std::fmt::Write as _;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;

/// Max amount of errors that are recorded into the error stream.
pub const MAX_RECORDED_ERRORS: i64 = 1000;

/// The CRU data emulator writes to every 8th 32-bit word.
const CRU_PATTERN_STRIDE: usize = 8;

pub struct PatternChecker {
    card_type: CardType,
    pattern: GeneratorPattern,
    resync_counter: bool,
    /// Event counter the generator is believed to be at; -1 until seeded
    /// from the first page.
    counter: i64,
    error_count: Arc<AtomicI64>,
    error_stream: String,
}

impl PatternChecker {
    pub fn new(
        card_type: CardType,
        pattern: GeneratorPattern,
        resync_counter: bool,
        error_count: Arc<AtomicI64>,
    ) -> Self {
        Self {
            card_type,
            pattern,
            resync_counter,
            counter: -1,
            error_count,
            error_stream: String::new(),
        }
    }

    /// Verifies one page at `offset` within the readout buffer.
    pub fn check_page(
        &mut self,
        buffer: &MemoryBlock,
        offset: usize,
        page_size: usize,
        event_number: i64,
    ) {
        if self.counter == -1 {
            // The first page seeds the counter.
            self.counter = self.counter_from_page(buffer, offset);
        }

        let has_error = match self.card_type {
            CardType::Crorc => self.check_page_crorc(buffer, offset, page_size, event_number),
            CardType::Cru => self.check_page_cru(buffer, offset, page_size, event_number),
        };
        if has_error && self.resync_counter {
            // Re-seed so one lost page does not cascade into thousands of
            // spurious errors.
            self.counter = self.counter_from_page(buffer, offset);
        }
        self.counter += 1;
    }

    pub fn error_count(&self) -> i64 {
        self.error_count.load(Relaxed)
    }

    /// The shared counter this checker reports into.
    pub fn error_counter(&self) -> Arc<AtomicI64> {
        self.error_count.clone()
    }

    /// The recorded error lines, one per discrepancy, capped at
    /// [`MAX_RECORDED_ERRORS`].
    pub fn error_stream(&self) -> &str {
        &self.error_stream
    }

    fn counter_from_page(&self, buffer: &MemoryBlock, offset: usize) -> i64 {
        let event_number = buffer.read_u32(offset);
        match self.card_type {
            CardType::Crorc => event_number as i64,
            CardType::Cru => (event_number / 256) as i64,
        }
    }

    fn check_page_cru(
        &mut self,
        buffer: &MemoryBlock,
        offset: usize,
        page_size: usize,
        event_number: i64,
    ) -> bool {
        let counter = self.counter as u32;
        let pattern = self.pattern;
        let expected = move |i: usize| -> u32 {
            match pattern {
                GeneratorPattern::Incremental => counter.wrapping_mul(256) + (i as u32) / 8,
                GeneratorPattern::Alternating => 0xa5a5a5a5,
                GeneratorPattern::Constant => 0x12345678,
            }
        };
        for i in (0..page_size / 4).step_by(CRU_PATTERN_STRIDE) {
            let actual = buffer.read_u32(offset + i * 4);
            if actual != expected(i) {
                self.add_error(event_number, i, counter, expected(i), actual);
                return true;
            }
        }
        false
    }

    fn check_page_crorc(
        &mut self,
        buffer: &MemoryBlock,
        offset: usize,
        page_size: usize,
        event_number: i64,
    ) -> bool {
        let counter = self.counter as u32;
        let first = buffer.read_u32(offset);
        if first != counter {
            self.add_error(event_number, 0, counter, counter, first);
        }

        let pattern = self.pattern;
        let expected = move |i: usize| -> u32 {
            match pattern {
                GeneratorPattern::Incremental => i as u32 - 1,
                GeneratorPattern::Alternating => 0xa5a5a5a5,
                GeneratorPattern::Constant => 0x12345678,
            }
        };
        // Words 1..8 are the start-of-data header; skip them.
        for i in 8..page_size / 4 {
            let actual = buffer.read_u32(offset + i * 4);
            if actual != expected(i) {
                self.add_error(event_number, i, counter, expected(i), actual);
                return true;
            }
        }
        false
    }

    fn add_error(&mut self, event_number: i64, i: usize, counter: u32, expected: u32, actual: u32) {
        let count = self.error_count.fetch_add(1, Relaxed);
        if count < MAX_RECORDED_ERRORS {
            let _ = writeln!(
                self.error_stream,
                "event:{event_number} i:{i} cnt:{counter} exp:{expected:#x} val:{actual:#x}"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use readout_card::emulated::BusSpace;

    const PAGE: usize = 8192;

    fn checker(card_type: CardType, pattern: GeneratorPattern) -> PatternChecker {
        PatternChecker::new(card_type, pattern, true, Arc::new(AtomicI64::new(0)))
    }

    fn write_crorc_page(buffer: &MemoryBlock, offset: usize, counter: u32) {
        buffer.write_u32(offset, counter);
        for i in 1..PAGE / 4 {
            let value = if i < 8 { 0 } else { i as u32 - 1 };
            buffer.write_u32(offset + i * 4, value);
        }
    }

    fn write_cru_page(buffer: &MemoryBlock, offset: usize, counter: u32) {
        for i in (0..PAGE / 4).step_by(8) {
            buffer.write_u32(offset + i * 4, counter * 256 + i as u32 / 8);
        }
    }

    #[test]
    fn clean_crorc_stream_has_no_errors() {
        let bus = BusSpace::new();
        let buffer = bus.allocate(PAGE * 16);
        let mut checker = checker(CardType::Crorc, GeneratorPattern::Incremental);
        for page in 0..16 {
            write_crorc_page(&buffer, page * PAGE, page as u32);
        }
        for page in 0..16 {
            checker.check_page(&buffer, page * PAGE, PAGE, page as i64);
        }
        assert_eq!(checker.error_count(), 0);
        assert!(checker.error_stream().is_empty());
    }

    #[test]
    fn corrupted_page_resyncs_after_one_error() {
        let bus = BusSpace::new();
        let buffer = bus.allocate(PAGE * 128);
        let mut checker = checker(CardType::Crorc, GeneratorPattern::Incremental);
        for page in 0..110 {
            write_crorc_page(&buffer, page * PAGE, page as u32);
        }
        // One corrupted word in the 10th page.
        buffer.write_u32(9 * PAGE + 20 * 4, 0xbad);

        for page in 0..110 {
            checker.check_page(&buffer, page * PAGE, PAGE, page as i64);
        }
        // Exactly one recorded error; the following 100 pages are clean.
        assert_eq!(checker.error_count(), 1);
        assert_eq!(checker.error_stream().lines().count(), 1);
        assert!(checker.error_stream().starts_with("event:9 i:20"));
    }

    #[test]
    fn counter_seeds_from_the_first_page() {
        let bus = BusSpace::new();
        let buffer = bus.allocate(PAGE * 4);
        let mut checker = checker(CardType::Crorc, GeneratorPattern::Incremental);
        // The stream starts mid-run, at event 40.
        for page in 0..4 {
            write_crorc_page(&buffer, page * PAGE, 40 + page as u32);
        }
        for page in 0..4 {
            checker.check_page(&buffer, page * PAGE, PAGE, page as i64);
        }
        assert_eq!(checker.error_count(), 0);
    }

    #[test]
    fn lost_page_without_resync_cascades() {
        let bus = BusSpace::new();
        let buffer = bus.allocate(PAGE * 8);
        let error_count = Arc::new(AtomicI64::new(0));
        let mut checker = PatternChecker::new(
            CardType::Crorc,
            GeneratorPattern::Incremental,
            false,
            error_count.clone(),
        );
        // Page 2 was dropped by the card: the counters jump.
        let counters = [0u32, 1, 3, 4, 5, 6, 7, 8];
        for (page, &counter) in counters.iter().enumerate() {
            write_crorc_page(&buffer, page * PAGE, counter);
        }
        for page in 0..8 {
            checker.check_page(&buffer, page * PAGE, PAGE, page as i64);
        }
        // Every page from the gap onwards mismatches its expected counter.
        assert_eq!(error_count.load(Relaxed), 6);
    }

    #[test]
    fn cru_incremental_stream_checks_clean() {
        let bus = BusSpace::new();
        let buffer = bus.allocate(PAGE * 8);
        let mut checker = checker(CardType::Cru, GeneratorPattern::Incremental);
        for page in 0..8 {
            write_cru_page(&buffer, page * PAGE, page as u32);
        }
        for page in 0..8 {
            checker.check_page(&buffer, page * PAGE, PAGE, page as i64);
        }
        assert_eq!(checker.error_count(), 0);
    }

    #[test]
    fn error_recording_is_capped() {
        let bus = BusSpace::new();
        let buffer = bus.allocate(PAGE);
        let error_count = Arc::new(AtomicI64::new(MAX_RECORDED_ERRORS));
        let mut checker = PatternChecker::new(
            CardType::Crorc,
            GeneratorPattern::Incremental,
            true,
            error_count,
        );
        buffer.write_u32(0, 99);
        checker.check_page(&buffer, 0, PAGE, 0);
        assert!(checker.error_stream().is_empty());
        assert!(checker.error_count() > MAX_RECORDED_ERRORS);
    }
}
