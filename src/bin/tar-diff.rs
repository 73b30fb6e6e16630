//! tar-diff - generate a delta between two tar archives

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use tracing_subscriber::EnvFilter;

use tar_delta::{diff, DiffOptions};

/// Generate a binary delta between two tar archives
#[derive(Parser)]
#[command(name = "tar-diff")]
#[command(version)]
#[command(about = "Generate a binary delta between two tar archives", long_about = None)]
struct Cli {
    /// zstd compression level for the delta stream
    #[arg(long, default_value_t = 3, value_name = "N")]
    compression_level: i32,

    /// Largest file size in MB still diffed with bsdiff (0 removes the limit)
    #[arg(long, default_value_t = 192, value_name = "MB")]
    max_bsdiff_size: u64,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    quiet: bool,

    /// Old (source) tar archive
    old: PathBuf,

    /// New (target) tar archive
    new: PathBuf,

    /// Delta file to create
    output: PathBuf,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    let mut old = File::open(&cli.old)
        .with_context(|| format!("Unable to open {}", cli.old.display()))?;
    let mut new = File::open(&cli.new)
        .with_context(|| format!("Unable to open {}", cli.new.display()))?;
    let output = File::create(&cli.output)
        .with_context(|| format!("Unable to create {}", cli.output.display()))?;

    let options = DiffOptions {
        compression_level: cli.compression_level,
        max_bsdiff_size: cli.max_bsdiff_size * 1024 * 1024,
    };

    let mut writer = BufWriter::new(output);
    diff(&mut old, &mut new, &mut writer, &options)
        .with_context(|| "Error generating delta")?;
    writer.flush()?;

    if !cli.quiet {
        print_summary(&cli.old, &cli.new, &cli.output);
    }

    Ok(())
}

fn init_logging(verbose: u8, quiet: bool) {
    let filter = match verbose {
        0 if quiet => "error",
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn print_summary(old: &Path, new: &Path, delta: &Path) {
    let old_size = std::fs::metadata(old).map(|m| m.len()).unwrap_or(0);
    let new_size = std::fs::metadata(new).map(|m| m.len()).unwrap_or(0);
    let delta_size = std::fs::metadata(delta).map(|m| m.len()).unwrap_or(0);

    let savings = if new_size > 0 {
        100.0 - (delta_size as f64 / new_size as f64 * 100.0)
    } else {
        0.0
    };

    println!("  {}: {}", "Old archive".cyan(), format_size(old_size));
    println!("  {}: {}", "New archive".cyan(), format_size(new_size));
    println!("  {}: {}", "Delta".cyan(), format_size(delta_size));
    println!("  {}: {:.1}%", "Size savings".cyan(), savings);

    if savings < 10.0 {
        println!();
        println!(
            "{} Delta provides minimal savings ({:.1}%). Consider shipping the full archive instead.",
            "Note:".yellow().bold(),
            savings
        );
    }
}

/// Format file size as human-readable string
fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
