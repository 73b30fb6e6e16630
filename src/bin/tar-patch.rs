//! tar-patch - reconstruct a tar archive from a delta

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use tar_delta::{apply, DirSourceProvider};

/// Apply a delta to the extracted contents of the old archive
#[derive(Parser)]
#[command(name = "tar-patch")]
#[command(version)]
#[command(about = "Reconstruct a tar archive from a delta", long_about = None)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    quiet: bool,

    /// Delta file produced by tar-diff
    delta: PathBuf,

    /// Directory holding the extracted old archive
    content_dir: PathBuf,

    /// Output tar file, or `-` for stdout
    output: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    let delta = File::open(&cli.delta)
        .with_context(|| format!("Unable to open {}", cli.delta.display()))?;
    let provider = DirSourceProvider::new(&cli.content_dir);

    let mut output: Box<dyn Write> = if cli.output == "-" {
        Box::new(io::stdout().lock())
    } else {
        let file = File::create(&cli.output)
            .with_context(|| format!("Unable to create {}", cli.output))?;
        Box::new(BufWriter::new(file))
    };

    apply(BufReader::new(delta), &provider, &mut output)
        .with_context(|| "Error applying delta")?;
    output.flush()?;

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
