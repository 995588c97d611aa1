//! logduck - Buffered JSON log loader for DuckDB
//!
//! Entry point for the CLI application.

use anyhow::{Context, Result};
use clap::Parser;
use console::style;
use logduck::config::{CliArgs, SinkConfig};
use logduck::{DuckSink, Event, EventTime, Record, SinkError, StatsSnapshot};
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// Lines read from the input
#[derive(Debug, Default)]
struct InputStats {
    lines: u64,
    skipped: u64,
    interrupted: bool,
}

fn run() -> Result<()> {
    let args = CliArgs::parse();

    setup_logging(args.verbose)?;

    let config = SinkConfig::from_args(&args).context("Invalid configuration")?;
    let location = config.location.to_string();
    let table = config.layout.table.clone();

    let sink = DuckSink::start(config).context("Failed to start sink")?;

    // Setup signal handler; the final flush still runs after an interrupt
    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown_flag);
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupt received, flushing and shutting down...");
        flag.store(true, Ordering::SeqCst);
    })
    .context("Failed to set signal handler")?;

    let reader: Box<dyn BufRead> = match &args.input {
        Some(path) => {
            let file = File::open(path)
                .with_context(|| format!("Failed to open input '{}'", path.display()))?;
            Box::new(BufReader::new(file))
        }
        None => Box::new(BufReader::new(io::stdin())),
    };

    let start = Instant::now();
    let handle = sink.handle();
    let mut input = InputStats::default();

    for line in reader.lines() {
        if shutdown_flag.load(Ordering::SeqCst) {
            input.interrupted = true;
            break;
        }

        let line = line.context("Failed to read input")?;
        input.lines += 1;
        if line.trim().is_empty() {
            continue;
        }

        let record: Record = match serde_json::from_str(&line) {
            Ok(record) => record,
            Err(e) => {
                warn!(line = input.lines, error = %e, "Skipping line that is not JSON");
                input.skipped += 1;
                continue;
            }
        };

        let time = event_time(&record, args.time_key.as_deref(), input.lines);
        match handle.emit(Event::new(time, &args.tag, record)) {
            Ok(_) => {}
            Err(SinkError::Encoding(e)) => {
                warn!(line = input.lines, error = %e, "Skipping record that cannot be encoded");
                input.skipped += 1;
            }
            Err(e) => return Err(e).context("Write failed"),
        }
    }

    let stats = sink.finish().context("Final flush failed")?;

    if input.interrupted {
        info!("Input was interrupted before end of stream");
    }

    print_summary(&stats, &input, start.elapsed(), &location, &table);
    Ok(())
}

/// Event time from `--time-key`, falling back to now
fn event_time(record: &Record, time_key: Option<&str>, line: u64) -> EventTime {
    let Some(key) = time_key else {
        return EventTime::now();
    };

    match record.get(key).and_then(|v| v.as_str()) {
        Some(text) => EventTime::parse_rfc3339(text).unwrap_or_else(|e| {
            warn!(line, error = %e, "Using current time for unparseable timestamp");
            EventTime::now()
        }),
        None => EventTime::now(),
    }
}

fn print_summary(
    stats: &StatsSnapshot,
    input: &InputStats,
    duration: Duration,
    location: &str,
    table: &str,
) {
    let duration_secs = duration.as_secs_f64();
    let rate = if duration_secs > 0.0 {
        stats.rows_written as f64 / duration_secs
    } else {
        0.0
    };

    println!();
    println!("{}", style("Load Complete").green().bold());
    println!("{}", style("─".repeat(50)).dim());
    println!("  {} {}", style("Lines read:").bold(), input.lines);
    println!("  {} {}", style("Rows written:").bold(), stats.rows_written);
    println!("  {} {}", style("Batches:").bold(), stats.batches_committed);
    println!(
        "  {} {:.1}s ({:.0} rows/sec)",
        style("Duration:").bold(),
        duration_secs,
        rate
    );
    if stats.rows_duplicate > 0 {
        println!("  {} {}", style("Duplicates skipped:").bold(), stats.rows_duplicate);
    }
    if input.skipped > 0 {
        println!("  {} {}", style("Skipped lines:").yellow().bold(), input.skipped);
    }
    if stats.flush_failures > 0 {
        println!(
            "  {} {} ({} rows discarded)",
            style("Failed flushes:").yellow().bold(),
            stats.flush_failures,
            stats.rows_discarded
        );
    }
    println!("  {} {} ({})", style("Output:").bold(), location, table);
}

fn setup_logging(verbose: bool) -> Result<()> {
    let filter = if verbose {
        EnvFilter::new("logduck=debug,warn")
    } else {
        EnvFilter::new("logduck=info,warn")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(io::stderr)
        .init();

    Ok(())
}
