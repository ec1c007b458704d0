//! streamfs: browse MPEG-TS tables and DSM-CC carousels as a
//! filesystem tree.
//!
//! Reads a transport-stream capture, demultiplexes the watched PIDs
//! into complete sections, integrates them through the core, and
//! renders the resulting versioned tree. Reconstructed carousel
//! objects land in the spill directory as real files.

use std::path::PathBuf;

use clap::Parser;
use log::info;

use streamfs_core::{Demux, DemuxOptions};

mod config;
mod logging;
mod render;
mod ts;

/// streamfs - browse MPEG-TS tables and DSM-CC carousels as a filesystem
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Transport stream capture to read
    input: PathBuf,

    /// Directory where reconstructed carousel objects are written
    #[arg(short, long)]
    tmpdir: Option<PathBuf>,

    /// Identity cache capacity
    #[arg(long)]
    cache_capacity: Option<usize>,

    /// Default carousel block size when no DII has been seen
    #[arg(long)]
    block_size: Option<u16>,

    /// PID carrying DSM-CC sections (hex accepted); may repeat
    #[arg(short = 'p', long = "carousel-pid", value_parser = parse_pid)]
    carousel_pids: Vec<u16>,

    /// Configuration file path
    #[arg(short = 'f', long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Directory where log files are stored
    #[arg(long, default_value = "logs")]
    log_dir: PathBuf,

    /// Number of days to keep log files
    #[arg(long, default_value = "7")]
    log_retention_days: u64,

    /// Suppress the tree dump after the feed
    #[arg(short, long)]
    quiet: bool,
}

fn parse_pid(value: &str) -> Result<u16, String> {
    let parsed = if let Some(hex) = value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        u16::from_str_radix(hex, 16)
    } else {
        value.parse()
    };
    parsed
        .map_err(|e| e.to_string())
        .and_then(|pid| {
            if pid <= 0x1FFF {
                Ok(pid)
            } else {
                Err(format!("PID {:#x} out of range", pid))
            }
        })
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let file = config::load(args.config.as_deref())?;

    let log_dir = file.logging.log_dir.unwrap_or_else(|| args.log_dir.clone());
    let retention = file.logging.retention_days.unwrap_or(args.log_retention_days);
    logging::init_logging(&log_dir, retention, args.verbose)?;

    let defaults = DemuxOptions::default();
    let options = DemuxOptions {
        tmpdir: args
            .tmpdir
            .or(file.demux.tmpdir)
            .unwrap_or(defaults.tmpdir),
        cache_capacity: args
            .cache_capacity
            .or(file.demux.cache_capacity)
            .unwrap_or(defaults.cache_capacity),
        default_block_size: args
            .block_size
            .or(file.demux.block_size)
            .unwrap_or(defaults.default_block_size),
    };
    let mut carousel_pids = args.carousel_pids.clone();
    carousel_pids.extend(&file.demux.carousel_pids);

    info!(
        "reading {:?} (spill dir {:?}, watching {} carousel PIDs)",
        args.input,
        options.tmpdir,
        carousel_pids.len()
    );

    let demux = Demux::new(options);
    let data = std::fs::read(&args.input)?;
    let mut feeder = ts::Feeder::new(&demux, carousel_pids);
    let stats = feeder.feed(&data)?;

    info!(
        "processed {} packets: {} sections, {} integrated, {} discarded",
        stats.packets, stats.sections, stats.handled, stats.discarded
    );

    if !args.quiet {
        render::dump_tree(demux.root());
    }
    Ok(())
}
