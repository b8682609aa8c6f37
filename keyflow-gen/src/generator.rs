//! Generation loop (producer)
//!
//! Runs the model step by step on a background task and pushes decoded
//! [`SemanticEvent`]s into a bounded channel.
//!
//! **Lifecycle:** `Idle -> Running -> (Cancelling) -> Idle`. Only one run may
//! be active; `start` while running fails with [`Error::AlreadyGenerating`].
//!
//! **Backpressure:** the channel send suspends the loop while the queue is
//! full. Events are never dropped or overwritten while the run is live.
//!
//! **Cancellation:** cooperative, via [`CancellationToken`]. The loop checks
//! it before each model step and while blocked on a full queue; an in-flight
//! model call is never interrupted. [`Generator::cancel`] awaits the task, so
//! once it returns no further events can appear.
//!
//! **Model steps:** each `forward` call runs on the blocking pool, with the
//! model and its state moved in and back out, so a slow step never stalls
//! the async workers.
//!
//! **Run exit:** whatever the reason, the queue is drained: the
//! [`EventReceiver`] discards anything still buffered and reports the stream
//! as finished. The model is handed back so the next run reuses it.

use crate::error::{Error, Result};
use crate::model::SequenceModel;
use crate::sampling::{sample, RepetitionPenalty, RepetitionWindow, SampleOptions};
use crate::types::{SemanticEvent, TokenId, END_ID, PAD_ID};
use crate::vocab::{VocabDecoder, WordLevelTokenizer};
use keyflow_common::config::GenerationConfig;
use keyflow_common::events::StopReason;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::ops::Range;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// Token string that must never be generated mid-stream
pub const PAD_TOKEN: &str = "<pad>";

/// Producer state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratorStatus {
    Idle,
    Running,
    Cancelling,
}

/// Fixed generation parameters (not user input)
#[derive(Debug, Clone)]
pub struct GenerationSettings {
    /// Bounded queue capacity
    pub queue_capacity: usize,
    pub temperature: f32,
    pub top_p: f32,
    pub view_length: usize,
    pub penalty: RepetitionPenalty,
    /// Id ranges zeroed before sampling (clamped to the vocabulary)
    pub blocked_ranges: Vec<Range<usize>>,
    pub seed: Option<u64>,
}

impl GenerationSettings {
    pub fn from_config(config: &GenerationConfig) -> Self {
        let exclude_ids = config
            .penalty_exclude_ranges
            .iter()
            .flat_map(|[start, end]| *start..*end)
            .collect();

        Self {
            queue_capacity: config.queue_capacity,
            temperature: config.temperature,
            top_p: config.top_p,
            view_length: config.repetition_view_length,
            penalty: RepetitionPenalty {
                penalty: config.repetition_penalty,
                max_penalty: config.max_penalty,
                decay_factor: config.decay_factor,
                exclude_ids,
            },
            blocked_ranges: config
                .blocked_ranges
                .iter()
                .map(|[start, end]| *start as usize..*end as usize)
                .collect(),
            seed: config.seed,
        }
    }
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self::from_config(&GenerationConfig::default())
    }
}

/// Consumer end of the bounded event queue
///
/// Once the producing run has ended, buffered events are discarded and every
/// receive returns `None`.
pub struct EventReceiver {
    rx: mpsc::Receiver<SemanticEvent>,
    finished: CancellationToken,
}

impl EventReceiver {
    /// Pop the next event without waiting
    pub fn try_recv(&mut self) -> Option<SemanticEvent> {
        if self.finished.is_cancelled() {
            self.drain();
            return None;
        }
        self.rx.try_recv().ok()
    }

    /// Wait for the next event; `None` once the run has ended
    pub async fn recv(&mut self) -> Option<SemanticEvent> {
        tokio::select! {
            biased;
            _ = self.finished.cancelled() => {}
            event = self.rx.recv() => return event,
        }
        self.drain();
        None
    }

    /// True once the producing run has ended
    pub fn is_finished(&self) -> bool {
        self.finished.is_cancelled()
    }

    fn drain(&mut self) {
        self.rx.close();
        while self.rx.try_recv().is_ok() {}
    }
}

struct ActiveRun<M: SequenceModel> {
    run_id: Uuid,
    cancel: CancellationToken,
    handle: JoinHandle<(Option<M>, StopReason)>,
}

/// Single-run generation loop owner
pub struct Generator<M: SequenceModel> {
    tokenizer: Arc<WordLevelTokenizer>,
    decoder: Arc<VocabDecoder>,
    settings: GenerationSettings,

    /// `None` while a run owns the model
    model: Mutex<Option<M>>,

    run: Mutex<Option<ActiveRun<M>>>,
    status: Arc<watch::Sender<GeneratorStatus>>,
}

impl<M: SequenceModel> Generator<M> {
    pub fn new(
        tokenizer: Arc<WordLevelTokenizer>,
        decoder: Arc<VocabDecoder>,
        model: M,
        settings: GenerationSettings,
    ) -> Self {
        let (status, _) = watch::channel(GeneratorStatus::Idle);
        Self {
            tokenizer,
            decoder,
            settings,
            model: Mutex::new(Some(model)),
            run: Mutex::new(None),
            status: Arc::new(status),
        }
    }

    pub fn tokenizer(&self) -> &Arc<WordLevelTokenizer> {
        &self.tokenizer
    }

    pub fn decoder(&self) -> &Arc<VocabDecoder> {
        &self.decoder
    }

    pub fn status(&self) -> GeneratorStatus {
        *self.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<GeneratorStatus> {
        self.status.subscribe()
    }

    /// Start a run seeded with `prompt` (empty prompt seeds with the pad id)
    ///
    /// # Returns
    /// The run id and the consumer end of the event queue
    ///
    /// # Errors
    /// - [`Error::AlreadyGenerating`] if a run is active
    /// - [`Error::NotLoaded`] if the tokenizer or vocabulary is not loaded
    /// - [`Error::Tokenizer`] if the prompt contains unknown tokens
    pub async fn start(&self, prompt: &str) -> Result<(Uuid, EventReceiver)> {
        let mut run = self.run.lock().await;
        if let Some(active) = run.as_ref() {
            if !active.handle.is_finished() {
                return Err(Error::AlreadyGenerating);
            }
        }
        if let Some(finished) = run.take() {
            self.reap(finished).await?;
        }

        self.decoder.config()?;
        let seed: Vec<TokenId> = if prompt.trim().is_empty() {
            vec![PAD_ID]
        } else {
            self.tokenizer.encode(prompt)?
        };

        let model = self
            .model
            .lock()
            .await
            .take()
            .ok_or(Error::NotLoaded("sequence model is not loaded"))?;

        let rng = match self.settings.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let run_id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.settings.queue_capacity);
        let cancel = CancellationToken::new();
        let finished = CancellationToken::new();

        let task = GenerationTask {
            run_id,
            vocab_size: model.vocab_size(),
            model: Some(model),
            tokenizer: Arc::clone(&self.tokenizer),
            decoder: Arc::clone(&self.decoder),
            settings: self.settings.clone(),
            rng,
            tx,
            cancel: cancel.clone(),
            finished: finished.clone(),
            status: Arc::clone(&self.status),
        };

        self.status.send_replace(GeneratorStatus::Running);
        let handle = tokio::spawn(task.run(seed));

        *run = Some(ActiveRun {
            run_id,
            cancel,
            handle,
        });

        Ok((run_id, EventReceiver { rx, finished }))
    }

    /// Stop the active run and wait until it has fully exited
    ///
    /// Also reaps a run that already ended on its own. Returns the run id
    /// and why it stopped, or `None` if there was no run.
    pub async fn cancel(&self) -> Result<Option<(Uuid, StopReason)>> {
        let mut run = self.run.lock().await;
        let Some(active) = run.take() else {
            return Ok(None);
        };

        if !active.handle.is_finished() {
            debug!(run_id = %active.run_id, "Cancelling generation run");
            self.status.send_replace(GeneratorStatus::Cancelling);
            active.cancel.cancel();
        }

        let run_id = active.run_id;
        let reason = self.reap(active).await?;
        Ok(Some((run_id, reason)))
    }

    /// Join a run's task and take the model back
    async fn reap(&self, active: ActiveRun<M>) -> Result<StopReason> {
        let joined = active.handle.await;
        self.status.send_replace(GeneratorStatus::Idle);
        let (model, reason) = joined
            .map_err(|e| Error::Internal(format!("generation task failed: {}", e)))?;
        match model {
            Some(model) => *self.model.lock().await = Some(model),
            None => error!(run_id = %active.run_id, "Model lost in a failed step, reload required"),
        }
        Ok(reason)
    }
}

/// State owned by the background task for one run
struct GenerationTask<M: SequenceModel> {
    run_id: Uuid,

    /// Lent to the blocking pool for the duration of each step
    model: Option<M>,
    vocab_size: usize,
    tokenizer: Arc<WordLevelTokenizer>,
    decoder: Arc<VocabDecoder>,
    settings: GenerationSettings,
    rng: StdRng,
    tx: mpsc::Sender<SemanticEvent>,
    cancel: CancellationToken,
    finished: CancellationToken,
    status: Arc<watch::Sender<GeneratorStatus>>,
}

impl<M: SequenceModel> GenerationTask<M> {
    async fn run(mut self, seed: Vec<TokenId>) -> (Option<M>, StopReason) {
        info!(run_id = %self.run_id, seed_len = seed.len(), "Generation run started");

        let reason = self.generate(seed).await;

        self.finished.cancel();
        self.status.send_replace(GeneratorStatus::Idle);
        info!(run_id = %self.run_id, ?reason, "Generation run stopped");

        (self.model, reason)
    }

    async fn generate(&mut self, seed: Vec<TokenId>) -> StopReason {
        let vocab_size = self.vocab_size;
        let blocked: Vec<Range<usize>> = self
            .settings
            .blocked_ranges
            .iter()
            .map(|r| r.start.min(vocab_size)..r.end.min(vocab_size))
            .filter(|r| !r.is_empty())
            .collect();
        let block_ranges = move |probs: &mut [f32]| {
            for range in &blocked {
                let end = range.end.min(probs.len());
                let start = range.start.min(end);
                probs[start..end].fill(0.0);
            }
        };

        let mut window = RepetitionWindow::new(self.settings.view_length);
        window.seed(&seed);

        let mut context = seed;
        let mut state: Option<M::State> = None;
        let mut step = 0u64;

        loop {
            if self.cancel.is_cancelled() {
                return StopReason::Cancelled;
            }

            let (mut logits, next_state) = match self.step(std::mem::take(&mut context), state.take()).await {
                Ok(output) => output,
                Err(e) => {
                    error!(run_id = %self.run_id, step, "Model step failed: {}", e);
                    return StopReason::ModelError(e.to_string());
                }
            };
            state = Some(next_state);

            let id = {
                let options = SampleOptions {
                    temperature: self.settings.temperature,
                    top_p: self.settings.top_p,
                    repetition_penalty: Some((&self.settings.penalty, &window)),
                    pre_process: Some(&block_ranges),
                    ..Default::default()
                };
                sample(&mut logits, &options, &mut self.rng)
            };

            if id == PAD_ID || id == END_ID {
                state = None;
            }
            window.push(id);
            context.push(id);

            let event = match self.decode(id) {
                Ok(event) => event,
                Err(reason) => return reason,
            };

            trace!(run_id = %self.run_id, step, id, ?event, "Generated event");
            step += 1;

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return StopReason::Cancelled,
                sent = self.tx.send(event) => {
                    if sent.is_err() {
                        return StopReason::ConsumerGone;
                    }
                }
            }
        }
    }

    /// Run one model step on the blocking pool
    ///
    /// The model moves into the blocking task and back, so async workers
    /// (and the pacing task) keep running while it computes.
    async fn step(
        &mut self,
        context: Vec<TokenId>,
        state: Option<M::State>,
    ) -> Result<(Vec<f32>, M::State)> {
        let mut model = self
            .model
            .take()
            .ok_or_else(|| Error::Internal("model missing from run".to_string()))?;
        let (model, output) = tokio::task::spawn_blocking(move || {
            let output = model.forward(&context, state);
            (model, output)
        })
        .await
        .map_err(|e| Error::Model(format!("model step panicked: {}", e)))?;
        self.model = Some(model);
        output
    }

    fn decode(&self, id: TokenId) -> std::result::Result<SemanticEvent, StopReason> {
        let token = self.tokenizer.decode(id).map_err(|e| {
            warn!(run_id = %self.run_id, id, "Undecodable token id: {}", e);
            StopReason::DecodeFault
        })?;
        if token == PAD_TOKEN {
            warn!(run_id = %self.run_id, id, "Pad token generated mid-stream, terminating run");
            return Err(StopReason::DecodeFault);
        }
        self.decoder.token_to_event(token).map_err(|e| {
            warn!(run_id = %self.run_id, token, "Malformed token: {}", e);
            StopReason::DecodeFault
        })
    }
}
