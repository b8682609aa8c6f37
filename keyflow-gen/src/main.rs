//! keyflow-gen - headless player
//!
//! Loads the tokenizer, vocabulary and model, starts a generation session
//! from the given prompt and plays it back against the wall clock: every
//! tick the playback position advances, the pipeline window follows it and
//! notes are logged as they come due.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use keyflow_common::config::{ConfigResolver, TomlConfig};
use keyflow_common::events::{EventBus, GenerationEvent, NoteBlock};
use keyflow_gen::{BigramModel, Pipeline, PipelineSettings, ResourcePaths};
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line arguments for keyflow-gen
#[derive(Parser, Debug)]
#[command(name = "keyflow-gen")]
#[command(about = "Streaming note generator with a headless player")]
#[command(version)]
struct Args {
    /// Config file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Space-separated prompt tokens; empty starts from scratch
    #[arg(short, long, default_value = "", env = "KEYFLOW_PROMPT")]
    prompt: String,

    /// Stop after this many seconds of playback (runs until Ctrl+C otherwise)
    #[arg(short, long, env = "KEYFLOW_DURATION_SECS")]
    duration_secs: Option<f64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = ConfigResolver::new(args.config.clone()).resolve();
    let config = TomlConfig::load_or_default(config_path.as_deref())
        .context("Failed to load configuration")?;

    // RUST_LOG wins over the configured level
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_filter(&config.logging.level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting keyflow-gen v{}", env!("CARGO_PKG_VERSION"));
    match &config_path {
        Some(path) => info!("Config: {}", path.display()),
        None => info!("Config: built-in defaults"),
    }

    let bus = EventBus::default();
    let mut events = bus.subscribe();
    let pipeline = Arc::new(Pipeline::<BigramModel>::new(
        PipelineSettings::from_config(&config),
        bus,
    ));

    pipeline
        .load(&ResourcePaths::from_config(&config))
        .await
        .context("Failed to load resources")?;

    let run_id = pipeline
        .start(&args.prompt)
        .await
        .context("Failed to start generation")?;
    info!(run_id = %run_id, "Playing");

    let mut player = Player::new(config.pacing.lookbehind_secs, config.pacing.lookahead_secs);
    let clock = Instant::now();
    let mut ticker = tokio::time::interval(Duration::from_millis(config.pacing.tick_interval_ms));

    let shutdown = shutdown_signal(args.duration_secs);
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => {
                let position = clock.elapsed().as_secs_f64();
                let (min, max) = player.window(position);
                pipeline.update_window(min, max);
                for note in player.advance(position) {
                    info!(
                        pitch = note.pitch,
                        velocity = note.velocity,
                        start = note.start_time,
                        duration = ?note.duration,
                        "Note"
                    );
                }
            }
            event = events.recv() => match event {
                Ok(GenerationEvent::Notes { notes, notes_total_time, .. }) => {
                    debug!(notes = notes.len(), notes_total_time, "Timeline updated");
                    player.set_notes(notes);
                }
                Ok(GenerationEvent::RunStopped { run_id, reason, .. }) => {
                    info!(run_id = %run_id, ?reason, "Generation stopped");
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Player lagged behind the event bus, skipped {} events", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    if let Some(timeline) = pipeline.stop().await.context("Failed to stop session")? {
        info!(
            notes = timeline.note_count(),
            total_time = timeline.notes_total_time(),
            "Shutdown complete"
        );
    }
    Ok(())
}

/// Bare levels apply to both crates; anything else is a full directive
fn log_filter(level: &str) -> String {
    if level.contains('=') || level.contains(',') {
        level.to_string()
    } else {
        format!("keyflow_gen={level},keyflow_common={level}")
    }
}

/// Resolve on Ctrl+C, SIGTERM or after `duration_secs`
async fn shutdown_signal(duration_secs: Option<f64>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let deadline = async {
        match duration_secs {
            Some(secs) => tokio::time::sleep(Duration::from_secs_f64(secs.max(0.0))).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received terminate signal, shutting down"),
        _ = deadline => info!("Playback duration reached, shutting down"),
    }
}

/// Playback cursor over the latest timeline snapshot
struct Player {
    lookbehind: f64,
    lookahead: f64,
    notes: Vec<NoteBlock>,
    played_until: f64,
}

impl Player {
    fn new(lookbehind: f64, lookahead: f64) -> Self {
        Self {
            lookbehind,
            lookahead,
            notes: Vec::new(),
            played_until: f64::NEG_INFINITY,
        }
    }

    /// Watermarks for a playback position
    fn window(&self, position: f64) -> (f64, f64) {
        (position - self.lookbehind, position + self.lookahead)
    }

    fn set_notes(&mut self, notes: Vec<NoteBlock>) {
        self.notes = notes;
    }

    /// Notes starting in `(previous position, position]`, in start order
    fn advance(&mut self, position: f64) -> Vec<NoteBlock> {
        let from = self.played_until;
        let mut due: Vec<NoteBlock> = self
            .notes
            .iter()
            .filter(|n| n.start_time > from && n.start_time <= position)
            .cloned()
            .collect();
        due.sort_by(|a, b| a.start_time.total_cmp(&b.start_time));
        self.played_until = position;
        due
    }
}
