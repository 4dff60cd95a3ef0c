//! Cartographer command-line interface
//!
//! `cartographer crawl` runs a crawl into an Atlas directory;
//! `cartographer verify` re-derives every hash of an existing archive.
//!
//! Exit codes: 0 success, 2 configuration error, 3 fatal I/O, 4 error
//! budget exceeded, 5 cancelled, 10 internal invariant violation.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use cartographer::{
    CancelHandle, CrawlConfig, CrawlError, CrawlEvent, CrawlEventBus, CrawlOptions, FetchMode,
    crawl_with,
};

#[derive(Parser, Debug)]
#[command(name = "cartographer")]
#[command(version)]
#[command(about = "Site-wide crawl and archival engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Crawl seed URLs into an Atlas archive
    Crawl(CrawlArgs),
    /// Verify the integrity of an existing Atlas archive
    Verify {
        /// Archive directory to verify
        #[arg(long, value_name = "PATH")]
        atlas: PathBuf,
    },
}

#[derive(clap::Args, Debug)]
struct CrawlArgs {
    /// Comma-separated seed URLs
    #[arg(long, value_delimiter = ',', required = true)]
    seeds: Vec<String>,

    /// Output directory for the Atlas archive
    #[arg(long, value_name = "PATH")]
    out: PathBuf,

    /// Fetch mode: raw, prerender, or full
    #[arg(long, default_value = "raw")]
    mode: FetchMode,

    /// Stop after this many page records
    #[arg(long, value_name = "N")]
    max_pages: Option<usize>,

    /// Maximum link depth from the seeds
    #[arg(long, value_name = "N", default_value_t = 3)]
    max_depth: u32,

    /// Global concurrency cap
    #[arg(long, value_name = "N", default_value_t = 8)]
    parallel: usize,

    /// Error rate over the sliding window that aborts the crawl
    #[arg(long, value_name = "RATE", default_value_t = 0.5)]
    error_budget: f64,

    /// Resume from the checkpoint in the output directory
    #[arg(long)]
    resume: bool,

    /// Suppress progress output
    #[arg(long, short)]
    quiet: bool,

    /// Append logs to this file instead of stderr
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,

    /// Also crawl off-site URLs discovered via links
    #[arg(long)]
    follow_external: bool,
}

fn init_logging(quiet: bool, log_file: Option<&PathBuf>) {
    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if quiet { "warn" } else { "info" }),
    );
    if let Some(path) = log_file {
        match std::fs::OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => {
                builder.target(env_logger::Target::Pipe(Box::new(file)));
            }
            Err(e) => {
                eprintln!("cannot open log file {}: {e}", path.display());
                std::process::exit(2);
            }
        }
    }
    builder.init();
}

/// Progress printer subscribed to the event bus
fn subscribe_progress(events: &CrawlEventBus) {
    let last_reported = AtomicU64::new(0);
    events.subscribe(move |event| match event {
        CrawlEvent::CrawlStarted { seeds, out_dir, .. } => {
            eprintln!("crawling {} seed(s) into {}", seeds.len(), out_dir.display());
        }
        CrawlEvent::Progress {
            counters,
            frontier_pending,
            in_flight,
            ..
        } => {
            // One line every ten pages keeps long crawls readable.
            let done = counters.pages_done;
            if done > 0
                && done % 10 == 0
                && last_reported.swap(done, Ordering::Relaxed) != done
            {
                eprintln!(
                    "{done} pages done, {} errors, {frontier_pending} pending, {in_flight} in flight",
                    counters.errors_total
                );
            }
        }
        CrawlEvent::CheckpointWritten { pages_done, .. } => {
            eprintln!("checkpoint written at {pages_done} pages");
        }
        CrawlEvent::CrawlFinished { counters, duration, .. } => {
            eprintln!(
                "finished: {} pages, {} errors in {duration:?}",
                counters.pages_done, counters.errors_total
            );
        }
        CrawlEvent::CrawlError { url, kind, .. } => {
            eprintln!("error [{kind}] {url}");
        }
    });
}

async fn run_crawl(args: CrawlArgs) -> i32 {
    init_logging(args.quiet, args.log_file.as_ref());

    let config = CrawlConfig::builder()
        .out_dir(args.out)
        .mode(args.mode)
        .max_depth(args.max_depth)
        .parallel(args.parallel)
        .max_error_rate(args.error_budget)
        .follow_external(args.follow_external)
        .seeds(args.seeds);
    let config = match args.max_pages {
        Some(limit) => config.max_pages(limit),
        None => config,
    };
    let config = match config.build() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return 2;
        }
    };

    let events = Arc::new(CrawlEventBus::new());
    if !args.quiet {
        subscribe_progress(&events);
    }

    let cancel = CancelHandle::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("interrupt received, draining (checkpoint will be written)");
                cancel.cancel();
            }
        });
    }

    let options = CrawlOptions {
        resume: args.resume,
    };
    match crawl_with(config, options, events, cancel).await {
        Ok(summary) => {
            if let Some(manifest) = &summary.manifest {
                println!(
                    "{} pages, {} errors, audit {}",
                    summary.counters.pages_done, summary.counters.errors_total, manifest.audit_hash
                );
            }
            0
        }
        Err(e) => {
            eprintln!("{e}");
            e.exit_code()
        }
    }
}

fn run_verify(atlas: &PathBuf) -> i32 {
    init_logging(false, None);
    match cartographer::AtlasReader::open(atlas) {
        Ok(reader) => match reader.verify() {
            Ok(()) => {
                println!(
                    "archive verified: {} parts, audit {}",
                    reader.manifest().parts.len(),
                    reader.manifest().audit_hash
                );
                0
            }
            Err(e) => {
                eprintln!("verification failed: {e}");
                3
            }
        },
        Err(e) => {
            eprintln!("cannot open archive: {e}");
            3
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = match cli.command {
        Command::Crawl(args) => run_crawl(args).await,
        Command::Verify { atlas } => run_verify(&atlas),
    };
    std::process::exit(code);
}
