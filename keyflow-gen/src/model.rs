//! Sequence model collaborator
//!
//! The generator only sees [`SequenceModel`]: feed a context of ids plus the
//! carried recurrent state, get back next-token logits and the new state.
//! The network itself lives behind this trait.
//!
//! [`BigramModel`] is a table-driven implementation loaded from JSON
//! transition counts, used by the `keyflow-gen` binary and the tests.

use crate::error::{Error, Result};
use crate::types::TokenId;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

/// Opaque `(context, state) -> (logits, state)` step function
///
/// `state = None` asks the model to start from a freshly initialized state.
/// The model is moved into the generation task for the duration of a run and
/// handed back afterwards.
pub trait SequenceModel: Send + 'static {
    /// Recurrent memory carried between calls
    type State: Send + 'static;

    /// Length of the logit vectors returned by [`forward`](Self::forward)
    fn vocab_size(&self) -> usize;

    /// Consume `ids` in order and return logits for the next token
    ///
    /// An empty context is an error.
    fn forward(
        &mut self,
        ids: &[TokenId],
        state: Option<Self::State>,
    ) -> Result<(Vec<f32>, Self::State)>;
}

/// Recurrent state of a [`BigramModel`]: the last consumed id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BigramState {
    pub last: TokenId,

    /// Ids consumed since the state was created
    pub steps: u64,
}

#[derive(Debug, Deserialize)]
struct BigramFile {
    vocab_size: usize,

    /// previous id -> (next id -> count)
    #[serde(default)]
    transitions: HashMap<TokenId, HashMap<TokenId, f32>>,

    /// Fallback counts when the previous id has no row
    #[serde(default)]
    unigram: HashMap<TokenId, f32>,

    #[serde(default = "default_smoothing")]
    smoothing: f32,
}

fn default_smoothing() -> f32 {
    1e-3
}

/// Bigram transition table
///
/// Logits are `ln(count + smoothing)`, taken from the row of the previous
/// id, backing off to the unigram row, then to uniform.
#[derive(Debug, Clone)]
pub struct BigramModel {
    vocab_size: usize,
    transitions: HashMap<TokenId, Vec<f32>>,
    unigram: Vec<f32>,
}

impl BigramModel {
    /// Build from sparse count tables
    pub fn new(
        vocab_size: usize,
        transitions: HashMap<TokenId, HashMap<TokenId, f32>>,
        unigram: HashMap<TokenId, f32>,
        smoothing: f32,
    ) -> Result<Self> {
        if vocab_size == 0 {
            return Err(Error::Model("vocab_size must be > 0".to_string()));
        }
        if smoothing <= 0.0 {
            return Err(Error::Model("smoothing must be > 0".to_string()));
        }

        let dense = |row: &HashMap<TokenId, f32>| -> Result<Vec<f32>> {
            let mut counts = vec![0.0f32; vocab_size];
            for (&id, &count) in row {
                let slot = counts.get_mut(id as usize).ok_or_else(|| {
                    Error::Model(format!("token id {} outside vocabulary", id))
                })?;
                *slot = count.max(0.0);
            }
            Ok(counts.into_iter().map(|c| (c + smoothing).ln()).collect())
        };

        let transitions = transitions
            .iter()
            .map(|(&prev, row)| Ok((prev, dense(row)?)))
            .collect::<Result<HashMap<_, _>>>()?;
        let unigram = dense(&unigram)?;

        Ok(Self {
            vocab_size,
            transitions,
            unigram,
        })
    }

    pub fn from_json(data: &[u8]) -> Result<Self> {
        let file: BigramFile = serde_json::from_slice(data)?;
        Self::new(file.vocab_size, file.transitions, file.unigram, file.smoothing)
    }

    /// Load a bigram model JSON file
    pub async fn load(path: &Path) -> Result<Self> {
        let data = tokio::fs::read(path).await.map_err(|e| {
            Error::Model(format!("Failed to read model {}: {}", path.display(), e))
        })?;
        let model = Self::from_json(&data)?;
        debug!(
            "Loaded bigram model {} (vocab_size={}, rows={})",
            path.display(),
            model.vocab_size,
            model.transitions.len()
        );
        Ok(model)
    }
}

impl SequenceModel for BigramModel {
    type State = BigramState;

    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn forward(
        &mut self,
        ids: &[TokenId],
        state: Option<BigramState>,
    ) -> Result<(Vec<f32>, BigramState)> {
        if ids.is_empty() {
            return Err(Error::Model("context must not be empty".to_string()));
        }

        let mut state = state.unwrap_or(BigramState { last: 0, steps: 0 });
        for &id in ids {
            if id as usize >= self.vocab_size {
                return Err(Error::Model(format!("token id {} outside vocabulary", id)));
            }
            state.last = id;
            state.steps += 1;
        }

        let logits = self
            .transitions
            .get(&state.last)
            .unwrap_or(&self.unigram)
            .clone();
        Ok((logits, state))
    }
}
