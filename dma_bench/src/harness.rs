// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The three-thread benchmark dataflow: a pusher feeding the channel, a
//! reader verifying filled superpages, and a low-priority monitor.
//!
//! The channel itself is single-threaded and owned by the pusher; the reader
//! only ever sees superpage offsets, handed over through two lock-free
//! single-producer/single-consumer queues.

use crate::pattern::PatternChecker;
use anyhow::Context;
use crossbeam_queue::ArrayQueue;
use readout_card::CardChannel;
use readout_card::MemoryBlock;
use readout_card::Superpage;
use std::io::Write as _;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

/// Interval for low priority tasks (display updates, stop polling).
const LOW_PRIORITY_INTERVAL: Duration = Duration::from_millis(10);
/// Resting time if the push thread has nothing to do.
const RESTING_TIME_PUSH_THREAD: Duration = Duration::from_micros(1);
/// Resting time if the readout thread has nothing to do.
const RESTING_TIME_READOUT_THREAD: Duration = Duration::from_micros(10);
/// Buffer value to reset pages to when `--page-reset` is given.
const BUFFER_DEFAULT_VALUE: u32 = 0xCcccCccc;

pub struct BenchOptions {
    /// Pages to transfer; 0 for infinite.
    pub max_pages: i64,
    pub superpage_size: usize,
    pub page_size: usize,
    pub max_superpages: usize,
    pub error_check: bool,
    pub page_reset: bool,
    pub random_pause: bool,
    /// Print the status table while running.
    pub verbose: bool,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FileDumpFormat {
    Ascii,
    Bin,
}

/// Raw page dump requested with `--to-file-ascii`/`--to-file-bin`.
pub struct FileDump {
    format: FileDumpFormat,
    writer: std::io::BufWriter<std::fs::File>,
}

impl FileDump {
    pub fn create(format: FileDumpFormat) -> anyhow::Result<Self> {
        let path = match format {
            FileDumpFormat::Ascii => "readout_data.txt",
            FileDumpFormat::Bin => "readout_data.bin",
        };
        let file = std::fs::File::create(path)
            .with_context(|| format!("failed to create {path}"))?;
        Ok(Self {
            format,
            writer: std::io::BufWriter::new(file),
        })
    }

    fn write_page(
        &mut self,
        buffer: &MemoryBlock,
        offset: usize,
        page_size: usize,
        number: i64,
    ) -> std::io::Result<()> {
        match self.format {
            FileDumpFormat::Ascii => {
                writeln!(self.writer, "Event #{number}")?;
                for line in (0..page_size / 4).step_by(8) {
                    for word in line..(line + 8).min(page_size / 4) {
                        write!(self.writer, "{} ", buffer.read_u32(offset + word * 4))?;
                    }
                    writeln!(self.writer)?;
                }
                writeln!(self.writer)
            }
            FileDumpFormat::Bin => {
                let mut page = vec![0u8; page_size];
                buffer.read_at(offset, &mut page);
                self.writer.write_all(&page)
            }
        }
    }
}

pub struct BenchReport {
    pub pages: i64,
    pub bytes: i64,
    pub seconds: f64,
    pub error_count: i64,
    pub error_stream: String,
    /// Superpages still sitting in the transfer queue after the drain.
    pub superpages_remaining: usize,
}

struct Shared {
    stop: AtomicBool,
    push_count: AtomicI64,
    readout_count: AtomicI64,
    error_count: Arc<AtomicI64>,
    free_queue: ArrayQueue<usize>,
    readout_queue: ArrayQueue<usize>,
}

/// Pseudo-random pauses in the 10 ms..2 s / 1..500 ms ranges, xorshift-fed.
struct RandomPauses {
    rng: u64,
    next: Instant,
    length: Duration,
}

impl RandomPauses {
    fn new() -> Self {
        Self {
            rng: 0x9e3779b97f4a7c15 ^ std::process::id() as u64,
            next: Instant::now(),
            length: Duration::ZERO,
        }
    }

    fn rand_range(&mut self, min: u64, max: u64) -> u64 {
        self.rng ^= self.rng << 13;
        self.rng ^= self.rng >> 7;
        self.rng ^= self.rng << 17;
        min + self.rng % (max - min)
    }

    fn pause_if_needed(&mut self) {
        if Instant::now() >= self.next {
            std::thread::sleep(self.length);
            self.next = Instant::now() + Duration::from_millis(self.rand_range(10, 2000));
            self.length = Duration::from_millis(self.rand_range(1, 500));
        }
    }
}

/// Drives the channel at saturating rate until the page limit or a stop
/// signal, then drains and stops DMA.
pub fn run(
    mut channel: CardChannel,
    buffer: MemoryBlock,
    mut checker: PatternChecker,
    mut dump: Option<FileDump>,
    options: &BenchOptions,
    is_sigint: Box<dyn Fn() -> bool + Send>,
) -> anyhow::Result<BenchReport> {
    let error_count = checker.error_counter();
    let shared = Arc::new(Shared {
        stop: AtomicBool::new(false),
        push_count: AtomicI64::new(0),
        readout_count: AtomicI64::new(0),
        error_count: error_count.clone(),
        // Usable size is (capacity - 1), so add 1.
        free_queue: ArrayQueue::new(options.max_superpages + 1),
        readout_queue: ArrayQueue::new(options.max_superpages + 1),
    });
    for i in 0..options.max_superpages {
        shared
            .free_queue
            .push(i * options.superpage_size)
            .map_err(|_| anyhow::anyhow!("free queue too small for the buffer"))?;
    }

    let infinite = options.max_pages <= 0;
    let temperature = channel.temperature();
    let start = Instant::now();

    let ((mut channel, push_result), reader_result) = std::thread::scope(|scope| {
        let pusher = scope.spawn(|| push_loop(channel, options, &shared, infinite));
        let monitor = scope.spawn(|| {
            monitor_loop(&shared, options, temperature, start, is_sigint);
        });

        // The readout loop runs on the calling thread.
        let reader_result =
            readout_loop(&buffer, &mut checker, &mut dump, options, &shared, infinite);
        shared.stop.store(true, Relaxed);

        let pusher = pusher.join().expect("push thread panicked");
        monitor.join().expect("monitor thread panicked");
        (pusher, reader_result)
    });
    let elapsed = start.elapsed();

    // Drain already-submitted superpages, then stop.
    let popped = free_excess_pages(&mut channel, Duration::from_millis(10), options.page_size);
    tracing::info!(popped, "popped excess pages");
    let superpages_remaining =
        channel.transfer_queue_capacity() - channel.transfer_queue_available();
    channel.stop_dma().context("failed to stop DMA")?;

    push_result?;
    reader_result?;

    let pages = shared.readout_count.load(Relaxed);
    Ok(BenchReport {
        pages,
        bytes: pages * options.page_size as i64,
        seconds: elapsed.as_secs_f64(),
        error_count: error_count.load(Relaxed),
        error_stream: checker.error_stream().to_owned(),
        superpages_remaining,
    })
}

fn push_loop(
    mut channel: CardChannel,
    options: &BenchOptions,
    shared: &Shared,
    infinite: bool,
) -> (CardChannel, anyhow::Result<()>) {
    let result = (|| -> anyhow::Result<()> {
        let mut pauses = RandomPauses::new();
        let mut current_superpage_pages_counted: i64 = 0;

        while !shared.stop.load(Relaxed) {
            // A page limit stops pushing once the in-progress superpage is
            // fully accounted.
            if !infinite
                && shared.push_count.load(Relaxed) >= options.max_pages
                && current_superpage_pages_counted == 0
            {
                break;
            }
            if options.random_pause {
                pauses.pause_if_needed();
            }

            channel.fill_superpages().context("fill_superpages failed")?;

            // Keep the driver's queue filled.
            while channel.transfer_queue_available() != 0 {
                if let Some(offset) = shared.free_queue.pop() {
                    let superpage = Superpage::new(offset, options.superpage_size);
                    channel
                        .push_superpage(superpage)
                        .context("push_superpage failed")?;
                } else {
                    std::thread::sleep(RESTING_TIME_PUSH_THREAD);
                    break;
                }
            }

            // Account arrived pages and move full superpages to readout.
            // Partial updates keep the display smooth with large superpages.
            if channel.ready_queue_size() > 0 {
                let superpage = channel.get_superpage()?;
                let pages = (superpage.received() / options.page_size) as i64;
                let pages_to_count = pages - current_superpage_pages_counted;
                shared.push_count.fetch_add(pages_to_count, Relaxed);
                current_superpage_pages_counted += pages_to_count;

                if superpage.is_ready()
                    && shared.readout_queue.push(superpage.offset).is_ok()
                {
                    current_superpage_pages_counted = 0;
                    channel.pop_superpage()?;
                } else {
                    // Readout is backed up.
                    std::thread::sleep(RESTING_TIME_PUSH_THREAD);
                }
            }
        }
        Ok(())
    })();
    if result.is_err() {
        shared.stop.store(true, Relaxed);
    }
    (channel, result)
}

fn readout_loop(
    buffer: &MemoryBlock,
    checker: &mut PatternChecker,
    dump: &mut Option<FileDump>,
    options: &BenchOptions,
    shared: &Shared,
    infinite: bool,
) -> anyhow::Result<()> {
    let result = (|| -> anyhow::Result<()> {
        let mut pauses = RandomPauses::new();
        let pages_per_superpage = options.superpage_size / options.page_size;

        while !shared.stop.load(Relaxed) {
            if !infinite && shared.readout_count.load(Relaxed) >= options.max_pages {
                break;
            }
            if options.random_pause {
                pauses.pause_if_needed();
            }

            let Some(offset) = shared.readout_queue.pop() else {
                std::thread::sleep(RESTING_TIME_READOUT_THREAD);
                continue;
            };
            for i in 0..pages_per_superpage {
                let page_offset = offset + i * options.page_size;
                let readout_count = shared.readout_count.fetch_add(1, Relaxed);
                if let Some(dump) = dump {
                    dump.write_page(buffer, page_offset, options.page_size, readout_count)
                        .context("page dump failed")?;
                }
                if options.error_check {
                    checker.check_page(buffer, page_offset, options.page_size, readout_count);
                }
                if options.page_reset {
                    for word in (0..options.page_size).step_by(4) {
                        buffer.write_u32(page_offset + word, BUFFER_DEFAULT_VALUE);
                    }
                }
            }

            // The superpage is read out; recycle it.
            shared
                .free_queue
                .push(offset)
                .map_err(|_| anyhow::anyhow!("free queue overflow"))?;
        }
        Ok(())
    })();
    if result.is_err() {
        shared.stop.store(true, Relaxed);
    }
    result
}

fn monitor_loop(
    shared: &Shared,
    options: &BenchOptions,
    temperature: Option<f32>,
    start: Instant,
    is_sigint: Box<dyn Fn() -> bool + Send>,
) {
    let mut header_printed = false;
    let mut newline_pending = false;
    let mut next = Instant::now();

    while !shared.stop.load(Relaxed) {
        if is_sigint() {
            // Finish the readout cleanly: stop pushing, let the queues
            // drain.
            shared.stop.store(true, Relaxed);
            return;
        }

        // Hold the table back until DMA has actually started.
        if options.verbose && shared.push_count.load(Relaxed) != 0 {
            if !header_printed {
                println!(
                    "\n  {:<8}   {:<12}  {:<12}  {:<12}  {:<5}",
                    "Time", "Pushed", "Read", "Errors", "°C"
                );
                header_printed = true;
            }
            let elapsed = start.elapsed().as_secs();
            let errors = if options.error_check {
                shared.error_count.load(Relaxed).to_string()
            } else {
                "n/a".to_owned()
            };
            let temperature = temperature.map_or("n/a".to_owned(), |t| format!("{t:.1}"));
            print!(
                "\r  {:02}:{:02}:{:02}   {:<12}  {:<12}  {:<12}  {:<5}",
                elapsed / 3600,
                (elapsed / 60) % 60,
                elapsed % 60,
                shared.push_count.load(Relaxed),
                shared.readout_count.load(Relaxed),
                errors,
                temperature,
            );
            let _ = std::io::stdout().flush();

            // Add a line to the scrollback once a minute.
            if elapsed % 60 == 0 {
                if newline_pending {
                    println!();
                    newline_pending = false;
                }
            } else {
                newline_pending = true;
            }
        }

        next += LOW_PRIORITY_INTERVAL;
        if let Some(wait) = next.checked_duration_since(Instant::now()) {
            std::thread::sleep(wait);
        }
    }
}

/// Pops superpages that were pushed in excess of the page limit, giving
/// in-flight DMA up to `timeout` to complete.
pub fn free_excess_pages(channel: &mut CardChannel, timeout: Duration, page_size: usize) -> i64 {
    let start = Instant::now();
    let mut popped = 0;
    while start.elapsed() < timeout {
        let _ = channel.fill_superpages();
        if channel.ready_queue_size() > 0 {
            if let Ok(superpage) = channel.get_superpage() {
                if superpage.is_filled() {
                    let _ = channel.pop_superpage();
                    popped += (superpage.received() / page_size) as i64;
                }
            }
        }
    }
    popped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::PatternChecker;
    use readout_card::channel::CardDescriptor;
    use readout_card::crorc::CrorcDmaChannel;
    use readout_card::emulated::BusSpace;
    use readout_card::emulated::EmulatedCrorc;
    use readout_card::emulated::HeapDmaClient;
    use readout_card::paths::ChannelPaths;
    use readout_card::CardId;
    use readout_card::CardType;
    use readout_card::DmaBufferView;
    use readout_card::GeneratorPattern;
    use readout_card::Parameters;

    #[test]
    fn benchmark_loop_transfers_and_verifies() {
        const PAGE: usize = 8192;
        const SUPERPAGE: usize = 128 * 1024;
        const BUFFER: usize = 4 * 1024 * 1024;

        let address = "42:0.0".parse().unwrap();
        let bus = BusSpace::new();
        let card = std::sync::Arc::new(EmulatedCrorc::new(bus.clone()));
        let buffer = bus.allocate(BUFFER);
        let dma_client = HeapDmaClient::new(bus);
        let paths = ChannelPaths::with_root(
            std::env::temp_dir().join(format!("dma_bench_test_{}", std::process::id())),
            address,
            0,
        );
        let parameters = Parameters::new(CardId::Address(address), 0)
            .with_generator_pattern(GeneratorPattern::Incremental)
            .with_generator_data_size(PAGE);
        let mut channel = CrorcDmaChannel::new(
            CardDescriptor {
                card_type: CardType::Crorc,
                pci_address: address,
                serial: None,
            },
            card,
            DmaBufferView::new(buffer.clone()),
            &dma_client,
            &paths,
            &parameters,
        )
        .unwrap();
        channel.start_dma().unwrap();

        let max_pages = (BUFFER / PAGE) as i64 * 4;
        let options = BenchOptions {
            max_pages,
            superpage_size: SUPERPAGE,
            page_size: PAGE,
            max_superpages: BUFFER / SUPERPAGE,
            error_check: true,
            page_reset: false,
            random_pause: false,
            verbose: false,
        };
        let error_count = std::sync::Arc::new(AtomicI64::new(0));
        let checker = PatternChecker::new(
            CardType::Crorc,
            GeneratorPattern::Incremental,
            true,
            error_count,
        );

        let report = run(
            CardChannel::Crorc(channel),
            buffer,
            checker,
            None,
            &options,
            Box::new(|| false),
        )
        .unwrap();

        assert!(report.pages >= max_pages);
        assert_eq!(report.error_count, 0);
        assert_eq!(report.bytes, report.pages * PAGE as i64);
        assert!(report.error_stream.is_empty());
    }
}
