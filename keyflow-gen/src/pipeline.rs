//! Pipeline facade
//!
//! Owns the loaded resources, the generator and the active session (one
//! producer run plus the pacing task consuming it). Hosts drive it with
//! three commands: [`Pipeline::start`], [`Pipeline::stop`] and
//! [`Pipeline::update_window`], and observe it through the [`EventBus`].

use crate::assembler::NoteAssembler;
use crate::error::{Error, Result};
use crate::generator::{EventReceiver, GenerationSettings, Generator, GeneratorStatus};
use crate::model::{BigramModel, SequenceModel};
use crate::pacing::{notes_event, PacingController, PacingSettings, Watermarks};
use crate::types::SemanticEvent;
use crate::vocab::{VocabDecoder, WordLevelTokenizer};
use chrono::Utc;
use keyflow_common::config::TomlConfig;
use keyflow_common::events::{EventBus, GenerationEvent};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Publish a snapshot every this many replayed prompt tokens
const PROMPT_SNAPSHOT_EVERY: usize = 10;

/// Files the pipeline loads its resources from
#[derive(Debug, Clone)]
pub struct ResourcePaths {
    pub tokenizer: PathBuf,
    pub vocab_config: PathBuf,
    pub model: PathBuf,
}

impl ResourcePaths {
    pub fn from_config(config: &TomlConfig) -> Self {
        Self {
            tokenizer: config.tokenizer_path.clone(),
            vocab_config: config.vocab_config_path.clone(),
            model: config.model_path.clone(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PipelineSettings {
    pub generation: GenerationSettings,
    pub pacing: PacingSettings,

    /// Watermarks before the host first calls `update_window`
    pub initial_window: Option<Watermarks>,
}

impl PipelineSettings {
    pub fn from_config(config: &TomlConfig) -> Self {
        Self {
            generation: GenerationSettings::from_config(&config.generation),
            pacing: PacingSettings::from_config(&config.pacing),
            initial_window: Some(Watermarks::new(0.0, config.pacing.lookahead_secs)),
        }
    }
}

struct Session {
    run_id: Uuid,
    stop: CancellationToken,
    handle: JoinHandle<NoteAssembler>,
}

pub struct Pipeline<M: SequenceModel> {
    settings: PipelineSettings,
    bus: EventBus,
    generator: RwLock<Option<Arc<Generator<M>>>>,
    window: watch::Sender<Watermarks>,
    session: Mutex<Option<Session>>,
}

impl<M: SequenceModel> Pipeline<M> {
    pub fn new(settings: PipelineSettings, bus: EventBus) -> Self {
        let initial = settings
            .initial_window
            .unwrap_or_else(|| Watermarks::new(0.0, 0.0));
        let (window, _) = watch::channel(initial);
        Self {
            settings,
            bus,
            generator: RwLock::new(None),
            window,
            session: Mutex::new(None),
        }
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.bus
    }

    pub async fn is_loaded(&self) -> bool {
        self.generator.read().await.is_some()
    }

    /// Install already-loaded resources
    ///
    /// Replaces any previously installed resources; stop the session first.
    pub async fn install(&self, tokenizer: WordLevelTokenizer, decoder: VocabDecoder, model: M) {
        let generator = Generator::new(
            Arc::new(tokenizer),
            Arc::new(decoder),
            model,
            self.settings.generation.clone(),
        );
        *self.generator.write().await = Some(Arc::new(generator));
    }

    /// Generator status, `Idle` when nothing is loaded
    pub async fn status(&self) -> GeneratorStatus {
        match self.generator.read().await.as_ref() {
            Some(generator) => generator.status(),
            None => GeneratorStatus::Idle,
        }
    }

    /// Current watermarks
    pub fn window(&self) -> Watermarks {
        *self.window.borrow()
    }

    /// Move the playback window; picked up on the next pacing tick
    pub fn update_window(&self, min: f64, max: f64) {
        self.window.send_replace(Watermarks::new(min, max));
    }

    /// Start a new session, stopping the live one first
    ///
    /// The prompt is replayed into a fresh timeline, then used as the seed
    /// of a new generation run.
    ///
    /// # Returns
    /// The run id of the new generation run
    pub async fn start(&self, prompt: &str) -> Result<Uuid> {
        let generator = self
            .generator
            .read()
            .await
            .clone()
            .ok_or(Error::NotLoaded("pipeline resources are not loaded"))?;

        // Reject bad prompts before touching the live session or the bus
        generator.tokenizer().encode(prompt)?;
        let prompt_events = generator
            .tokenizer()
            .tokenize(prompt)
            .into_iter()
            .map(|token| generator.decoder().token_to_event(token))
            .collect::<Result<Vec<_>>>()?;
        let hold_timeout = generator.decoder().hold_timeout()?;

        let mut session = self.session.lock().await;
        if let Some(active) = session.take() {
            info!(run_id = %active.run_id, "Preempting running session");
            shutdown(active).await?;
        }

        let mut assembler = NoteAssembler::new(hold_timeout);
        self.bus.emit_lossy(notes_event(&assembler));
        self.replay_prompt(&mut assembler, prompt_events);

        let (run_id, events) = generator.start(prompt).await?;
        self.bus.emit_lossy(GenerationEvent::RunStarted {
            run_id,
            timestamp: Utc::now(),
        });

        let controller = PacingController::new(
            assembler,
            self.window.subscribe(),
            self.settings.pacing.max_total_notes,
        );
        let stop = CancellationToken::new();
        let handle = tokio::spawn(run_session(
            Arc::clone(&generator),
            controller,
            events,
            self.bus.clone(),
            stop.clone(),
            self.settings.pacing.tick_interval,
        ));

        *session = Some(Session {
            run_id,
            stop,
            handle,
        });
        info!(run_id = %run_id, prompt_tokens = prompt.split_whitespace().count(), "Session started");
        Ok(run_id)
    }

    /// Stop the session and its generation run
    ///
    /// # Returns
    /// The final timeline, or `None` if no session was running
    pub async fn stop(&self) -> Result<Option<NoteAssembler>> {
        let Some(active) = self.session.lock().await.take() else {
            return Ok(None);
        };
        let run_id = active.run_id;
        let assembler = shutdown(active).await?;
        info!(run_id = %run_id, notes = assembler.note_count(), "Session stopped");
        Ok(Some(assembler))
    }

    /// Apply the decoded prompt to the timeline
    fn replay_prompt(&self, assembler: &mut NoteAssembler, events: Vec<SemanticEvent>) {
        let count = events.len();
        for (i, event) in events.into_iter().enumerate() {
            assembler.apply(event);
            if i % PROMPT_SNAPSHOT_EVERY == 0 {
                self.bus.emit_lossy(notes_event(assembler));
            }
        }
        assembler.mark_prompt_end();
        self.bus.emit_lossy(notes_event(assembler));

        debug!(
            tokens = count,
            prompt_end_time = assembler.prompt_end_time(),
            "Replayed prompt"
        );
    }
}

impl Pipeline<BigramModel> {
    /// Load tokenizer, vocabulary and model from disk, once
    ///
    /// Publishes `Loading` then `Loaded`. A no-op when already loaded.
    pub async fn load(&self, paths: &ResourcePaths) -> Result<()> {
        if self.is_loaded().await {
            return Ok(());
        }

        self.bus.emit_lossy(GenerationEvent::Loading {
            timestamp: Utc::now(),
        });
        info!(
            "Loading resources (tokenizer={}, vocab={}, model={})",
            paths.tokenizer.display(),
            paths.vocab_config.display(),
            paths.model.display()
        );

        let mut decoder = VocabDecoder::new();
        let (tokenizer, model, ()) = tokio::try_join!(
            WordLevelTokenizer::load(&paths.tokenizer),
            BigramModel::load(&paths.model),
            decoder.load(&paths.vocab_config),
        )?;

        if model.vocab_size() < tokenizer.vocab_size() {
            return Err(Error::Config(format!(
                "model vocab_size {} is smaller than tokenizer vocabulary {}",
                model.vocab_size(),
                tokenizer.vocab_size()
            )));
        }

        self.install(tokenizer, decoder, model).await;
        self.bus.emit_lossy(GenerationEvent::Loaded {
            timestamp: Utc::now(),
        });
        info!("Resources loaded");
        Ok(())
    }
}

async fn shutdown(session: Session) -> Result<NoteAssembler> {
    session.stop.cancel();
    session
        .handle
        .await
        .map_err(|e| Error::Internal(format!("session task failed: {}", e)))
}

/// Consumer task: pace events into the timeline until stopped
async fn run_session<M: SequenceModel>(
    generator: Arc<Generator<M>>,
    mut controller: PacingController,
    mut events: EventReceiver,
    bus: EventBus,
    stop: CancellationToken,
    tick_interval: Duration,
) -> NoteAssembler {
    let mut ticker = tokio::time::interval(tick_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut run_reaped = false;

    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if controller.tick(&mut events) {
            bus.emit_lossy(notes_event(controller.assembler()));
        }

        // The run ended on its own (decode fault, model error); the
        // timeline stays live for eviction until the session is stopped
        if !run_reaped && events.is_finished() {
            run_reaped = true;
            finish_run(&generator, &bus).await;
        }
    }

    if !run_reaped {
        finish_run(&generator, &bus).await;
    }
    controller.into_assembler()
}

async fn finish_run<M: SequenceModel>(generator: &Generator<M>, bus: &EventBus) {
    match generator.cancel().await {
        Ok(Some((run_id, reason))) => {
            bus.emit_lossy(GenerationEvent::RunStopped {
                run_id,
                reason,
                timestamp: Utc::now(),
            });
        }
        Ok(None) => {}
        Err(e) => error!("Failed to stop generation run: {}", e),
    }
}
