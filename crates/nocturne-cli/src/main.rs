//! Nocturne - generative MIDI engine.
//!
//! The binary wires the engine core to real MIDI ports:
//!
//! - a midir input adapter feeding the router, which turns raw
//!   notes/CCs into semantic events per the config's mapping section
//! - a midir output sink receiving note-ons, note-offs, and CCs
//!
//! Run with `nocturne --config nocturne.toml`; `--list-ports` shows
//! what is available.

mod midi_in;
mod midi_out;
mod router;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::RecvTimeoutError;

use nocturne_core::{Config, Engine, MidiSink, NullSink};

use midi_in::MidiInputManager;
use midi_out::MidirSink;
use router::Router;

/// Generative MIDI engine
#[derive(Parser, Debug)]
#[command(name = "nocturne")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Real-time generative music engine driven by a MIDI controller", long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "nocturne.toml")]
    config: PathBuf,

    /// Override log level (trace/debug/info/warn/error)
    #[arg(long)]
    log_level: Option<String>,

    /// List MIDI ports and exit
    #[arg(long)]
    list_ports: bool,

    /// Run without MIDI output (log only)
    #[arg(long)]
    no_output: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = cli.log_level.as_deref().unwrap_or("info");
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_millis()
        .init();

    if cli.list_ports {
        return list_ports();
    }

    let config = Config::load_or_default(&cli.config)
        .with_context(|| format!("loading config from {:?}", cli.config))?;
    config.validate().context("invalid configuration")?;

    log::info!("nocturne v{} starting", env!("CARGO_PKG_VERSION"));
    log::info!(
        "sequencer bpm={} length={} direction={}",
        config.sequencer.bpm,
        config.sequencer.sequence_length,
        config.sequencer.direction_pattern
    );

    // Output sink: real port, or the null sink when disabled.
    let sink: Arc<dyn MidiSink> = if cli.no_output || config.midi.output_port.is_empty() {
        log::info!("midi output disabled");
        Arc::new(NullSink)
    } else {
        Arc::new(MidirSink::open(&config.midi.output_port)?)
    };

    // Input adapter and router.
    let (mut input, midi_rx) = MidiInputManager::new();
    let router = Router::new(&config)?;
    if config.midi.input_port.is_empty() {
        log::warn!("midi input disabled; the engine will run generatively only");
    } else if let Err(e) = input.open(&config.midi.input_port) {
        log::warn!("midi input unavailable: {e}");
    }

    let engine = Arc::new(Engine::new(config, sink)?);
    engine.start();

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        ctrlc::set_handler(move || {
            log::info!("shutdown signal received");
            running.store(false, Ordering::SeqCst);
        })
        .context("installing signal handler")?;
    }

    // Input thread work happens here on the main thread: drain parsed
    // MIDI, route it, hand semantic events to the engine.
    while running.load(Ordering::SeqCst) {
        match midi_rx.recv_timeout(Duration::from_millis(200)) {
            Ok(msg) => {
                if let Some(event) = router.route(&msg) {
                    log::debug!("semantic kind={:?} value={}", event.kind, event.value);
                    engine.handle_event(&event);
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                log::warn!("midi input channel closed");
                std::thread::sleep(Duration::from_millis(200));
            }
        }
    }

    engine.shutdown();
    input.close();
    log::info!("nocturne stopped");
    Ok(())
}

fn list_ports() -> Result<()> {
    println!("MIDI input ports:");
    for name in MidiInputManager::list_ports()? {
        println!("  {name}");
    }
    println!("MIDI output ports:");
    for name in MidirSink::list_ports()? {
        println!("  {name}");
    }
    Ok(())
}
