//! Generation loop: backpressure, cancellation, run exits, state resets

mod common;

use keyflow_common::events::StopReason;
use keyflow_gen::types::{SemanticEvent, TokenId};
use keyflow_gen::{
    Error, GenerationSettings, Generator, GeneratorStatus, Result, SequenceModel, VocabDecoder,
    WordLevelTokenizer,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{sleep, timeout};

/// Plays back a fixed id script, recording whether each call got a state
struct ScriptedModel {
    script: Vec<TokenId>,
    step: usize,
    fail_at: Option<usize>,
    states_seen: Arc<Mutex<Vec<bool>>>,
}

impl ScriptedModel {
    fn new(script: Vec<TokenId>) -> Self {
        Self {
            script,
            step: 0,
            fail_at: None,
            states_seen: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl SequenceModel for ScriptedModel {
    type State = usize;

    fn vocab_size(&self) -> usize {
        11
    }

    fn forward(&mut self, ids: &[TokenId], state: Option<usize>) -> Result<(Vec<f32>, usize)> {
        assert!(!ids.is_empty());
        self.states_seen.lock().unwrap().push(state.is_some());
        if self.fail_at == Some(self.step) {
            return Err(Error::Model("weights exploded".to_string()));
        }

        let next = self.script[self.step % self.script.len()];
        self.step += 1;

        let mut logits = vec![-50.0; 11];
        logits[next as usize] = 50.0;
        Ok((logits, state.unwrap_or(0) + 1))
    }
}

fn resources() -> (Arc<WordLevelTokenizer>, Arc<VocabDecoder>) {
    let tokenizer = WordLevelTokenizer::from_json(common::TOKENIZER_JSON.as_bytes()).unwrap();
    let config = serde_json::from_str(common::VOCAB_JSON).unwrap();
    (Arc::new(tokenizer), Arc::new(VocabDecoder::with_config(config)))
}

fn generator(model: ScriptedModel, capacity: usize) -> Generator<ScriptedModel> {
    let (tokenizer, decoder) = resources();
    let settings = GenerationSettings {
        queue_capacity: capacity,
        seed: Some(3),
        ..GenerationSettings::default()
    };
    Generator::new(tokenizer, decoder, model, settings)
}

fn drain_now(events: &mut keyflow_gen::EventReceiver) -> usize {
    let mut count = 0;
    while events.try_recv().is_some() {
        count += 1;
    }
    count
}

/// Receive until the run ends; returns how many events arrived
async fn drain_until_finished(events: &mut keyflow_gen::EventReceiver) -> usize {
    let mut count = 0;
    while timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("run did not finish")
        .is_some()
    {
        count += 1;
    }
    count
}

#[tokio::test]
async fn test_queue_holds_at_most_capacity() {
    // t1 forever
    let generator = generator(ScriptedModel::new(vec![3]), 4);
    let (_run, mut events) = generator.start("").await.unwrap();

    sleep(Duration::from_millis(50)).await;
    // Single-threaded runtime: the producer cannot refill while we drain
    assert_eq!(drain_now(&mut events), 4);
    assert_eq!(generator.status(), GeneratorStatus::Running);

    // Producer resumes once there is room
    sleep(Duration::from_millis(50)).await;
    assert_eq!(drain_now(&mut events), 4);

    generator.cancel().await.unwrap();
}

#[tokio::test]
async fn test_events_arrive_in_order() {
    // on(60) t1 off(60) t10
    let generator = generator(ScriptedModel::new(vec![5, 3, 6, 4]), 8);
    let (_run, mut events) = generator.start("").await.unwrap();

    let mut received = Vec::new();
    for _ in 0..4 {
        received.push(timeout(Duration::from_secs(5), events.recv()).await.unwrap().unwrap());
    }
    assert_eq!(received[0], SemanticEvent::note(60, 1.0));
    assert!(matches!(received[1], SemanticEvent::TimeAdvance(dt) if (dt - 0.1).abs() < 1e-12));
    assert!(received[2].is_note_off());
    assert_eq!(received[3], SemanticEvent::TimeAdvance(1.0));

    generator.cancel().await.unwrap();
}

#[tokio::test]
async fn test_no_events_after_cancel() {
    let generator = generator(ScriptedModel::new(vec![3]), 4);
    let (run_id, mut events) = generator.start("").await.unwrap();
    sleep(Duration::from_millis(20)).await;

    let (stopped_id, reason) = generator.cancel().await.unwrap().unwrap();
    assert_eq!(stopped_id, run_id);
    assert_eq!(reason, StopReason::Cancelled);
    assert_eq!(generator.status(), GeneratorStatus::Idle);

    // Buffered events were discarded
    assert!(events.is_finished());
    assert_eq!(events.try_recv(), None);
    assert_eq!(events.recv().await, None);
    sleep(Duration::from_millis(20)).await;
    assert_eq!(events.try_recv(), None);
}

#[tokio::test]
async fn test_model_error_ends_run_and_drains() {
    let mut model = ScriptedModel::new(vec![3]);
    model.fail_at = Some(2);
    let generator = generator(model, 8);

    let (_run, mut events) = generator.start("").await.unwrap();
    // Two steps succeed before the failure; the stream then ends
    assert!(drain_until_finished(&mut events).await <= 2);
    assert!(events.is_finished());
    assert_eq!(events.try_recv(), None);

    let (_, reason) = generator.cancel().await.unwrap().unwrap();
    assert!(matches!(reason, StopReason::ModelError(msg) if msg.contains("weights exploded")));

    // The model came back; a new run starts
    let (_run, _events) = generator.start("").await.unwrap();
    generator.cancel().await.unwrap();
}

#[tokio::test]
async fn test_pad_and_end_reset_model_state() {
    // t1 <end> t1 t1 <end>
    let model = ScriptedModel::new(vec![3, 2, 3, 3, 2]);
    let states_seen = Arc::clone(&model.states_seen);
    let generator = generator(model, 16);

    let (_run, mut events) = generator.start("<start> t1").await.unwrap();
    for _ in 0..5 {
        timeout(Duration::from_secs(5), events.recv()).await.unwrap().unwrap();
    }
    generator.cancel().await.unwrap();

    let seen = states_seen.lock().unwrap().clone();
    // Fresh state first, reset after <end>
    assert_eq!(&seen[..5], &[false, true, false, true, true]);
}

#[tokio::test]
async fn test_finished_run_is_reaped_on_next_start() {
    // Pad is blocked by default; unblock it so the script can emit it
    let (tokenizer, decoder) = resources();
    let settings = GenerationSettings {
        queue_capacity: 4,
        blocked_ranges: vec![],
        ..GenerationSettings::default()
    };
    let generator = Generator::new(tokenizer, decoder, ScriptedModel::new(vec![3, 0]), settings);

    let (_run, mut events) = generator.start("").await.unwrap();
    assert!(drain_until_finished(&mut events).await <= 1);
    assert_eq!(generator.status(), GeneratorStatus::Idle);

    // Starting again reaps the faulted run without an explicit cancel
    let (_run, mut events) = generator.start("").await.unwrap();
    assert!(drain_until_finished(&mut events).await <= 1);
    let (_, reason) = generator.cancel().await.unwrap().unwrap();
    assert_eq!(reason, StopReason::DecodeFault);
}

/// Takes `delay` per step, like a real network forward pass
struct SlowModel {
    delay: Duration,
}

impl SequenceModel for SlowModel {
    type State = ();

    fn vocab_size(&self) -> usize {
        11
    }

    fn forward(&mut self, _ids: &[TokenId], _state: Option<()>) -> Result<(Vec<f32>, ())> {
        std::thread::sleep(self.delay);
        let mut logits = vec![-50.0; 11];
        logits[3] = 50.0;
        Ok((logits, ()))
    }
}

#[tokio::test]
async fn test_slow_model_step_does_not_stall_runtime() {
    let (tokenizer, decoder) = resources();
    let generator = Generator::new(
        tokenizer,
        decoder,
        SlowModel {
            delay: Duration::from_millis(300),
        },
        GenerationSettings::default(),
    );
    let (_run, mut events) = generator.start("").await.unwrap();

    // The runtime has one thread; other tasks must keep running mid-step
    for _ in 0..3 {
        let before = std::time::Instant::now();
        sleep(Duration::from_millis(10)).await;
        assert!(
            before.elapsed() < Duration::from_millis(200),
            "runtime blocked for {:?}",
            before.elapsed()
        );
    }

    let first = timeout(Duration::from_secs(5), events.recv()).await.unwrap();
    assert!(matches!(first, Some(SemanticEvent::TimeAdvance(_))));

    // Cancel lands after the in-flight step completes
    let (_, reason) = generator.cancel().await.unwrap().unwrap();
    assert_eq!(reason, StopReason::Cancelled);
}
