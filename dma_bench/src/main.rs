// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! DMA benchmark for the C-RORC and CRU readout cards.

mod harness;
mod pattern;

use anyhow::Context;
use clap::Parser;
use harness::BenchOptions;
use harness::FileDump;
use harness::FileDumpFormat;
use pattern::PatternChecker;
use readout_card::hugepage::FileDmaClient;
use readout_card::hugepage::MemoryMappedFile;
use readout_card::interprocess;
use readout_card::memory::DmaClient;
use readout_card::paths::ChannelPaths;
use readout_card::pci::RocDevice;
use readout_card::CardChannel;
use readout_card::CardId;
use readout_card::DataSource;
use readout_card::DmaBufferView;
use readout_card::Error;
use readout_card::GeneratorPattern;
use readout_card::MemoryBlock;
use readout_card::Parameters;
use readout_card::ReadoutMode;
use readout_card::ResetLevel;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;

/// Path for the error log.
const READOUT_ERRORS_PATH: &str = "readout_errors.txt";

const SIZE_2MIB: usize = 2 * 1024 * 1024;
const SIZE_1GIB: usize = 1024 * 1024 * 1024;

#[derive(Parser)]
#[clap(about = "Test readout card DMA performance")]
#[clap(long_about = r#"
Test readout card DMA performance.

Example:
  dma-bench --id=42:0.0 --channel=0 --reset --pages=1M --buffer-size=1Gi --superpage-size=128Ki
"#)]
struct Options {
    /// Card to use: a decimal serial number or a PCI address.
    #[clap(long = "id")]
    card_id: String,

    /// Channel number.
    #[clap(long)]
    channel: u32,

    /// Amount of pages to transfer. Give 0 for infinite.
    #[clap(long, default_value = "10k", value_parser = parse_size)]
    pages: u64,

    /// Buffer size in bytes. Must be a 2 MiB multiple; a 1 GiB multiple
    /// tries 1 GiB hugepages first.
    #[clap(long = "buffer-size", default_value = "10Mi", value_parser = parse_size)]
    buffer_size: u64,

    /// Superpage size in bytes. Can't be larger than the buffer.
    #[clap(long = "superpage-size", default_value = "1Mi", value_parser = parse_size)]
    superpage_size: u64,

    /// DMA page size in bytes.
    #[clap(long = "dma-page-size", default_value = "8Ki", value_parser = parse_size)]
    dma_page_size: u64,

    /// Reset the channel during initialization.
    #[clap(long)]
    reset: bool,

    /// Data source [INTERNAL, FEE, SIU, DIU, DDG].
    #[clap(long = "data-source", default_value = "INTERNAL")]
    data_source: DataSource,

    /// Error check with the given pattern [INCREMENTAL, ALTERNATING,
    /// CONSTANT].
    #[clap(long, default_value = "INCREMENTAL")]
    pattern: GeneratorPattern,

    /// Set the readout mode [CONTINUOUS].
    #[clap(long = "readout-mode")]
    readout_mode: Option<ReadoutMode>,

    /// Skip error checking.
    #[clap(long = "no-errorcheck")]
    no_error_check: bool,

    /// Disable counter resync after an error.
    #[clap(long = "no-resync")]
    no_resync: bool,

    /// Reset pages to default values after readout (slow).
    #[clap(long = "page-reset")]
    page_reset: bool,

    /// Randomly pause readout.
    #[clap(long = "random-pause")]
    random_pause: bool,

    /// Read out to file in ASCII format.
    #[clap(long = "to-file-ascii")]
    file_output_ascii: bool,

    /// Read out to file in binary format (raw page data only).
    #[clap(long = "to-file-bin")]
    file_output_bin: bool,

    /// Remove the buffer file after the benchmark completes.
    #[clap(long = "rm-pages-file")]
    remove_pages_file: bool,

    /// Use STBRD instead of RDYRX to trigger the front-end (CRORC only).
    #[clap(long)]
    stbrd: bool,
}

static SIGINT: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_sigint(_: libc::c_int) {
    SIGINT.store(true, Relaxed);
}

fn install_sigint_handler() {
    // SAFETY: the handler only touches an atomic.
    unsafe {
        libc::signal(libc::SIGINT, handle_sigint as usize);
    }
}

/// Parses a size with an optional decimal (k/M/G) or binary (Ki/Mi/Gi)
/// suffix.
fn parse_size(text: &str) -> Result<u64, String> {
    let (digits, multiplier) = match text {
        _ if text.ends_with("Ki") => (&text[..text.len() - 2], 1024),
        _ if text.ends_with("Mi") => (&text[..text.len() - 2], 1024 * 1024),
        _ if text.ends_with("Gi") => (&text[..text.len() - 2], 1024 * 1024 * 1024),
        _ if text.ends_with(['k', 'K']) => (&text[..text.len() - 1], 1000),
        _ if text.ends_with('M') => (&text[..text.len() - 1], 1_000_000),
        _ if text.ends_with('G') => (&text[..text.len() - 1], 1_000_000_000),
        _ => (text, 1),
    };
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("malformed size '{text}'"))?;
    Ok(value * multiplier)
}

fn init_tracing() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = if let Ok(filter) = std::env::var("ROC_LOG") {
        tracing_subscriber::EnvFilter::new(filter)
    } else {
        tracing_subscriber::EnvFilter::default()
            .add_directive(tracing::metadata::LevelFilter::INFO.into())
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn main() {
    let options = Options::parse();
    init_tracing();
    install_sigint_handler();

    if let Err(err) = run(&options) {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

/// Creates the hugepage-backed buffer file, preferring 1 GiB pages when the
/// size allows and falling back to 2 MiB pages.
fn create_buffer(options: &Options) -> anyhow::Result<MemoryBlock> {
    let buffer_size = options.buffer_size as usize;
    let file_name = format!(
        "roc-dma-bench_id={}_chan={}_pages",
        options.card_id, options.channel
    );
    let create = |page_dir: &str| -> anyhow::Result<MemoryBlock> {
        let path = PathBuf::from("/var/lib/hugetlbfs/global")
            .join(page_dir)
            .join(&file_name);
        let file = MemoryMappedFile::new(&path, buffer_size, options.remove_pages_file)?;
        tracing::info!(path = %file.path().display(), "using buffer file");
        Ok(MemoryBlock::new(file))
    };

    if buffer_size % SIZE_1GIB == 0 {
        match create("pagesize-1GB") {
            Ok(block) => return Ok(block),
            Err(err) => {
                tracing::warn!(
                    error = format_args!("{err:#}"),
                    "failed to allocate 1 GiB hugepages, falling back to 2 MiB"
                );
            }
        }
    }
    create("pagesize-2MB")
}

fn run(options: &Options) -> anyhow::Result<()> {
    let card_id: CardId = options.card_id.parse()?;
    let buffer_size = options.buffer_size as usize;
    let superpage_size = options.superpage_size as usize;
    let page_size = options.dma_page_size as usize;

    if options.file_output_ascii && options.file_output_bin {
        anyhow::bail!("file output can't be both ASCII and binary");
    }
    if buffer_size % SIZE_2MIB != 0 {
        anyhow::bail!("buffer size not a multiple of 2 MiB");
    }
    if superpage_size % page_size != 0 {
        anyhow::bail!("superpage size not a multiple of page size");
    }
    if buffer_size < superpage_size {
        anyhow::bail!("buffer size smaller than superpage size");
    }
    // Without an IOMMU a superpage that straddles hugepages would hand the
    // card a torn bus address range; keep superpages within one hugepage.
    if SIZE_2MIB % superpage_size != 0 && superpage_size % SIZE_2MIB != 0 {
        anyhow::bail!("hugepage size is not a multiple of superpage size");
    }

    let buffer = create_buffer(options)?;
    let max_superpages = buffer_size / superpage_size;
    tracing::info!(
        buffer_size,
        superpage_size,
        page_size,
        max_superpages,
        pages_per_superpage = superpage_size / page_size,
        "benchmark geometry"
    );

    let device = RocDevice::open(card_id)?;
    let parameters = Parameters::new(card_id, options.channel)
        .with_dma_page_size(page_size)
        .with_data_source(options.data_source)
        .with_generator_pattern(options.pattern)
        .with_generator_data_size(page_size)
        .with_stbrd_enabled(options.stbrd);
    let parameters = match options.readout_mode {
        Some(mode) => parameters.with_readout_mode(mode),
        None => parameters,
    };

    let paths = ChannelPaths::new(device.descriptor.pci_address, options.channel);
    let dma_client: Arc<dyn DmaClient> = Arc::new(FileDmaClient::new(paths.fifo()));
    let view = DmaBufferView::new(buffer.clone());

    let mut channel = match CardChannel::open_with_paths(
        device.descriptor,
        device.bar0.clone(),
        device.bar2.clone(),
        view.clone(),
        &dma_client,
        &parameters,
        &paths,
    ) {
        Err(Error::Lock { path, source }) => {
            // This process is known not to hold the lock, so removing the
            // dead holder's name is safe. Retry exactly once.
            tracing::warn!(
                error = %source,
                "failed to acquire channel lock, attempting cleanup and retry"
            );
            interprocess::remove_stale(&path).context("stale lock removal failed")?;
            CardChannel::open_with_paths(
                device.descriptor,
                device.bar0.clone(),
                device.bar2.clone(),
                view,
                &dma_client,
                &parameters,
                &paths,
            )?
        }
        other => other?,
    };

    tracing::info!(
        card_type = %channel.card_type(),
        firmware = channel.firmware_info().unwrap_or_else(|| "unknown".into()),
        "channel open"
    );

    if options.reset {
        tracing::info!("resetting channel");
        channel.reset_channel(ResetLevel::Internal)?;
    }

    tracing::info!("starting benchmark");
    channel.start_dma()?;

    let error_count = Arc::new(AtomicI64::new(0));
    let checker = PatternChecker::new(
        channel.card_type(),
        options.pattern,
        !options.no_resync,
        error_count,
    );
    let dump = if options.file_output_ascii {
        Some(FileDump::create(FileDumpFormat::Ascii)?)
    } else if options.file_output_bin {
        Some(FileDump::create(FileDumpFormat::Bin)?)
    } else {
        None
    };

    let bench_options = BenchOptions {
        max_pages: options.pages as i64,
        superpage_size,
        page_size,
        max_superpages,
        error_check: !options.no_error_check,
        page_reset: options.page_reset,
        random_pause: options.random_pause,
        verbose: true,
    };
    let report = harness::run(
        channel,
        buffer,
        checker,
        dump,
        &bench_options,
        Box::new(|| SIGINT.load(Relaxed)),
    )?;

    output_errors(&report.error_stream)?;
    output_stats(&report, options.no_error_check);
    tracing::info!("benchmark complete");
    Ok(())
}

fn output_errors(error_stream: &str) -> anyhow::Result<()> {
    if !error_stream.is_empty() {
        const MAX_CHARS: usize = 2000;
        println!("Errors:");
        println!("{}", &error_stream[..error_stream.len().min(MAX_CHARS)]);
        if error_stream.len() > MAX_CHARS {
            println!("... more follow ({} characters)", error_stream.len() - MAX_CHARS);
        }
    }
    std::fs::write(READOUT_ERRORS_PATH, error_stream)
        .with_context(|| format!("failed to write {READOUT_ERRORS_PATH}"))
}

fn output_stats(report: &harness::BenchReport, no_error_check: bool) {
    let put = |label: &str, value: String| println!("  {label:<10}  {value:<10}");
    println!();
    put("Seconds", format!("{:.3}", report.seconds));
    put("Pages", report.pages.to_string());
    if report.bytes > 0 {
        let gb = report.bytes as f64 / 1e9;
        put("Bytes", report.bytes.to_string());
        put("GB", format!("{gb:.3}"));
        put("GB/s", format!("{:.3}", gb / report.seconds));
        put("Gb/s", format!("{:.3}", gb * 8.0 / report.seconds));
        if no_error_check {
            put("Errors", "n/a".to_owned());
        } else {
            put("Errors", report.error_count.to_string());
        }
    }
    if report.superpages_remaining > 0 {
        put(
            "In flight",
            format!("{} superpages not drained", report.superpages_remaining),
        );
    }
    println!();
}
