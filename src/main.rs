//! httptap - passive HTTP/1.x traffic observation
//!
//! This is the command line entrypoint: it reads configuration from a file,
//! flags, and environment, starts the capture pipeline, and writes completed
//! message records as line-delimited JSON.

use anyhow::{Context, Result};
use clap::Parser;
use httptap::config::TapConfig;
use httptap::utils::logger;
use httptap::Sniffer;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::{mpsc, Arc, Mutex};
use tracing::{error, info, warn, Level};

/// Command line arguments for httptap.
#[derive(Parser, Debug)]
#[clap(version, about = "Passive HTTP/1.x traffic observer")]
struct Args {
    /// Path to the configuration file
    #[clap(short, long, default_value = "config/httptap.toml")]
    config: String,

    /// Interface to capture packets from; host default if omitted
    #[clap(short, long, env = "HTTPTAP_INTERFACE")]
    interface: Option<String>,

    /// TCP ports to observe, comma separated
    #[clap(short, long, env = "HTTPTAP_PORTS", value_delimiter = ',')]
    ports: Vec<u16>,

    /// JSONL output file; stdout if omitted
    #[clap(short, long, env = "HTTPTAP_OUTPUT")]
    output: Option<String>,

    /// Verbose output
    #[clap(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config: TapConfig = if Path::new(&args.config).exists() {
        TapConfig::from_file(&args.config)
            .with_context(|| format!("failed to load configuration from {}", args.config))?
    } else {
        TapConfig::default()
    };

    // Override configuration with command line arguments
    if let Some(interface) = args.interface {
        config.capture.interface = interface;
    }
    if !args.ports.is_empty() {
        config.capture.ports = args.ports;
    }
    if args.output.is_some() {
        config.output.file = args.output;
    }

    config.validate()?;

    // Initialize logging
    let log_level = match args.verbose {
        0 => config
            .logging
            .log_level
            .parse::<Level>()
            .unwrap_or(Level::INFO),
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    logger::init_logging(log_level);

    // Message sink: line-delimited JSON on stdout or an append-only file.
    let sink: Arc<Mutex<Box<dyn Write + Send>>> = match &config.output.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open output file {}", path))?;
            Arc::new(Mutex::new(Box::new(file)))
        }
        None => Arc::new(Mutex::new(Box::new(std::io::stdout()))),
    };

    let sniffer = Sniffer::new();
    let writer = Arc::clone(&sink);
    sniffer.start(
        config.capture.clone(),
        move |message| match serde_json::to_string(&message) {
            Ok(line) => {
                let mut out = writer.lock().unwrap();
                let _ = writeln!(out, "{}", line);
            }
            Err(e) => warn!(error = %e, "failed to serialize message"),
        },
        |fatal| {
            error!(code = %fatal.code, message = %fatal.message, "capture terminated");
        },
    )?;

    info!("httptap started");

    // Wait for Ctrl+C
    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.send(());
    })
    .context("failed to set Ctrl-C handler")?;

    let _ = shutdown_rx.recv();
    info!("shutting down");

    if let Some(stats) = sniffer.stop() {
        info!(
            packets_received = stats.packets_received,
            packets_dropped = stats.packets_dropped,
            packets_if_dropped = stats.packets_if_dropped,
            "capture statistics"
        );
    }

    let metrics = sniffer.metrics();
    info!(
        frames = metrics.frames_seen(),
        messages = metrics.messages_emitted(),
        dropped = metrics.sink_overflow(),
        "pipeline totals"
    );

    Ok(())
}
