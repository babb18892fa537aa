//! bootlink CLI - flash firmware images over a serial bootloader link.
//!
//! Environment variables:
//!   BOOTLINK_PORT - default serial port
//!   BOOTLINK_BAUD - default baud rate (default: 115200)

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use console::style;
use env_logger::Env;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, warn};

use bootlink::{
    HexFile, NativePort, NativePortEnumerator, PortEnumerator, ProgressSink, SerialConfig,
    UpdateConfig, UpdateOutcome, Updater,
};

/// Set by the Ctrl-C handler; polled by the updater at step boundaries.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// bootlink - update firmware over a message-framed serial bootloader.
#[derive(Parser)]
#[command(name = "bootlink")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Serial port to use (auto-selected when exactly one is present).
    #[arg(short, long, global = true, env = "BOOTLINK_PORT")]
    port: Option<String>,

    /// Baud rate.
    #[arg(
        short,
        long,
        global = true,
        default_value = "115200",
        env = "BOOTLINK_BAUD"
    )]
    baud: u32,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Flash an Intel HEX firmware image.
    Flash {
        /// Path to the firmware image (.hex).
        image: PathBuf,

        /// First flash sector to erase.
        #[arg(long)]
        first_sector: Option<u32>,

        /// Number of sectors to erase.
        #[arg(long)]
        sectors: Option<u32>,

        /// Do not ask a running application shell to reset first.
        #[arg(long)]
        no_reset: bool,
    },

    /// List available serial ports.
    Ports,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging based on verbosity
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    ctrlc::set_handler(|| INTERRUPTED.store(true, Ordering::Relaxed))
        .context("failed to install Ctrl-C handler")?;

    debug!("bootlink v{}", env!("CARGO_PKG_VERSION"));

    match &cli.command {
        Commands::Flash {
            image,
            first_sector,
            sectors,
            no_reset,
        } => cmd_flash(&cli, image, *first_sector, *sectors, *no_reset),
        Commands::Ports => cmd_ports(),
    }
}

/// Progress sink coupling the progress bar with the Ctrl-C flag.
struct BarSink {
    bar: ProgressBar,
}

impl ProgressSink for BarSink {
    fn report(&mut self, percent: u8, status: &str) {
        self.bar.set_position(u64::from(percent));
        self.bar.set_message(status.to_string());
    }

    fn cancelled(&self) -> bool {
        INTERRUPTED.load(Ordering::Relaxed)
    }
}

fn cmd_flash(
    cli: &Cli,
    image: &Path,
    first_sector: Option<u32>,
    sectors: Option<u32>,
    no_reset: bool,
) -> Result<()> {
    if !cli.quiet {
        eprintln!("{} Loading {}", style("→").cyan(), image.display());
    }
    let hex = HexFile::from_file(image)
        .with_context(|| format!("failed to load {}", image.display()))?;
    let Some(section) = hex.sections.first() else {
        bail!("{} contains no data records", image.display());
    };
    if hex.sections.len() > 1 {
        warn!(
            "image has {} sections; only the first ({} bytes at {:#010x}) will be flashed",
            hex.sections.len(),
            section.data.len(),
            section.start
        );
    }
    if !cli.quiet {
        eprintln!(
            "{} {} bytes at {:#010x}",
            style("✓").green(),
            section.data.len(),
            section.start
        );
    }

    let port_name = resolve_port(cli)?;
    if !cli.quiet {
        eprintln!(
            "{} Using {} at {} baud",
            style("→").cyan(),
            port_name,
            cli.baud
        );
    }
    let port = NativePort::open(&SerialConfig::new(&port_name, cli.baud))
        .with_context(|| format!("failed to open {port_name}"))?;

    let mut config = UpdateConfig::default().with_reset_request(!no_reset);
    if let Some(first) = first_sector {
        config.first_sector = first;
    }
    if let Some(count) = sectors {
        config.sector_count = count;
    }

    let bar = if cli.quiet {
        ProgressBar::hidden()
    } else {
        let bar = ProgressBar::new(100);
        #[allow(clippy::unwrap_used)] // Static template string
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}% {msg}")
                .unwrap()
                .progress_chars("#>-"),
        );
        bar.set_draw_target(indicatif::ProgressDrawTarget::stderr());
        bar
    };

    let mut updater = Updater::with_config(port, config);
    let mut sink = BarSink { bar: bar.clone() };

    match updater.update(section, &mut sink) {
        Ok(UpdateOutcome::Done) => {
            bar.finish_with_message("Done");
            if !cli.quiet {
                eprintln!("\n{} Update complete", style("✓").green().bold());
            }
            Ok(())
        }
        Ok(UpdateOutcome::Cancelled) => {
            bar.abandon_with_message("Cancelled");
            if !cli.quiet {
                eprintln!("\n{} Update cancelled", style("⚠").yellow().bold());
            }
            Ok(())
        }
        Err(err) => {
            bar.abandon();
            Err(err).context("update failed")
        }
    }
}

/// Pick the serial port: an explicit flag wins, otherwise exactly one
/// detected port is accepted.
fn resolve_port(cli: &Cli) -> Result<String> {
    if let Some(port) = &cli.port {
        return Ok(port.clone());
    }
    let ports =
        NativePortEnumerator::list_ports().context("failed to enumerate serial ports")?;
    match ports.as_slice() {
        [] => bail!("no serial ports found; specify one with --port"),
        [only] => Ok(only.name.clone()),
        many => {
            let names: Vec<&str> = many.iter().map(|p| p.name.as_str()).collect();
            bail!(
                "multiple serial ports found ({}); specify one with --port",
                names.join(", ")
            );
        }
    }
}

fn cmd_ports() -> Result<()> {
    let ports =
        NativePortEnumerator::list_ports().context("failed to enumerate serial ports")?;
    if ports.is_empty() {
        eprintln!("No serial ports found.");
        return Ok(());
    }
    for port in ports {
        let mut line = port.name.clone();
        if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
            line.push_str(&format!(" [{vid:04x}:{pid:04x}]"));
        }
        if let Some(product) = &port.product {
            line.push_str(&format!(" {product}"));
        }
        println!("{line}");
    }
    Ok(())
}
