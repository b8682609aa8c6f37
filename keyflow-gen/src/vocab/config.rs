//! Vocabulary decoding constants
//!
//! Loaded from the JSON file that accompanies a trained model, e.g.
//!
//! ```json
//! {
//!   "wait_events": 125,
//!   "max_wait_time": 1000,
//!   "velocity_events": 128,
//!   "velocity_bins": 12,
//!   "velocity_exp": 0.5,
//!   "decode_end_held_note_delay": 5.0,
//!   "decode_fix_repeated_notes": true
//! }
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VocabConfig {
    /// Number of distinct wait tokens
    pub wait_events: u32,

    /// Longest wait a single token can express (milliseconds)
    pub max_wait_time: f64,

    /// Velocity resolution before binning (MIDI: 128)
    pub velocity_events: u32,

    /// Number of velocity bins in the vocabulary
    pub velocity_bins: u32,

    /// Bin curve exponent (1.0 = linear)
    pub velocity_exp: f64,

    /// Open notes older than this are force-closed (seconds, 0 = default)
    #[serde(default = "default_held_note_delay")]
    pub decode_end_held_note_delay: f64,

    /// Carried for parity with the training config; not consulted when decoding
    #[serde(default)]
    pub decode_fix_repeated_notes: bool,
}

fn default_held_note_delay() -> f64 {
    8.0
}

impl VocabConfig {
    /// Read and validate a vocabulary config file
    pub async fn load(path: &Path) -> Result<Self> {
        let data = tokio::fs::read(path).await.map_err(|e| {
            Error::Config(format!("Failed to read vocab config {}: {}", path.display(), e))
        })?;
        let config: VocabConfig = serde_json::from_slice(&data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.wait_events == 0 {
            return Err(Error::Config("wait_events must be > 0".to_string()));
        }
        if self.velocity_bins < 2 {
            return Err(Error::Config("velocity_bins must be >= 2".to_string()));
        }
        if self.velocity_events < 2 {
            return Err(Error::Config("velocity_events must be >= 2".to_string()));
        }
        if self.velocity_exp <= 0.0 {
            return Err(Error::Config("velocity_exp must be > 0".to_string()));
        }
        Ok(())
    }

    /// Open-note hold timeout (seconds); non-positive values mean the default
    pub fn held_note_delay(&self) -> f64 {
        if self.decode_end_held_note_delay > 0.0 {
            self.decode_end_held_note_delay
        } else {
            default_held_note_delay()
        }
    }
}
