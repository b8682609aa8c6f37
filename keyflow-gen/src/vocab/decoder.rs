//! Token string → semantic event
//!
//! Token grammar:
//! - `<end>`: long gap (5 s) that lets every held note run out
//! - `<...>`: other control tokens, no-op time advance
//! - `t<n>`: wait of `n * max_wait_time / wait_events` milliseconds
//! - `<instrument>:<pitch hex>:<velocity bin hex>`: note on/off

use super::config::VocabConfig;
use crate::error::{Error, Result};
use crate::types::SemanticEvent;
use std::path::Path;

/// Time advance produced by `<end>` (seconds)
pub const END_TOKEN_GAP: f64 = 5.0;

/// Decodes token strings using a loaded [`VocabConfig`]
///
/// Every decode method fails with [`Error::NotLoaded`] until a config has
/// been supplied.
#[derive(Debug, Clone, Default)]
pub struct VocabDecoder {
    config: Option<VocabConfig>,
}

impl VocabDecoder {
    /// Create an unloaded decoder
    pub fn new() -> Self {
        Self { config: None }
    }

    pub fn with_config(config: VocabConfig) -> Self {
        Self {
            config: Some(config),
        }
    }

    /// Load the vocabulary config from a JSON file
    pub async fn load(&mut self, path: &Path) -> Result<()> {
        self.config = Some(VocabConfig::load(path).await?);
        Ok(())
    }

    pub fn is_loaded(&self) -> bool {
        self.config.is_some()
    }

    pub fn config(&self) -> Result<&VocabConfig> {
        self.config
            .as_ref()
            .ok_or(Error::NotLoaded("vocab config is not loaded"))
    }

    /// Open-note hold timeout used by the assembler (seconds)
    pub fn hold_timeout(&self) -> Result<f64> {
        Ok(self.config()?.held_note_delay())
    }

    /// Map a velocity bin back to a normalized velocity
    ///
    /// Bin 0 maps to exactly 0.0 and the top bin to exactly 1.0.
    pub fn bin_to_velocity(&self, bin: u32) -> Result<f32> {
        let cfg = self.config()?;
        let events = cfg.velocity_events as f64;
        let binsize = events / (cfg.velocity_bins as f64 - 1.0);
        let bin = bin as f64;

        let level = if cfg.velocity_exp == 1.0 {
            (bin * binsize - 1.0).ceil()
        } else {
            let scaled = ((cfg.velocity_exp - 1.0) * binsize * bin) / events + 1.0;
            (events * (scaled.ln() / cfg.velocity_exp.ln()) - 1.0).ceil()
        };

        let velocity = level.max(0.0) / (events - 1.0);
        Ok(velocity.clamp(0.0, 1.0) as f32)
    }

    /// Seconds expressed by a `t<n>` token
    pub fn wait_token_to_delta(&self, token: &str) -> Result<f64> {
        let cfg = self.config()?;
        let steps: u32 = token
            .get(1..)
            .and_then(|digits| digits.parse().ok())
            .ok_or_else(|| Error::Decode(format!("invalid wait token '{}'", token)))?;
        Ok(cfg.max_wait_time / cfg.wait_events as f64 * steps as f64 / 1000.0)
    }

    /// Decode `<instrument>:<pitch hex>:<velocity bin hex>`
    ///
    /// The instrument field is split off but always reported as instrument 0.
    pub fn note_token_to_event(&self, token: &str) -> Result<SemanticEvent> {
        self.config()?;
        let mut fields = token.trim().split(':');
        let (Some(_instrument), Some(pitch), Some(velocity), None) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            return Err(Error::Decode(format!("invalid note token '{}'", token)));
        };

        let pitch = u8::from_str_radix(pitch, 16)
            .map_err(|e| Error::Decode(format!("invalid pitch in '{}': {}", token, e)))?;
        let bin = u32::from_str_radix(velocity, 16)
            .map_err(|e| Error::Decode(format!("invalid velocity in '{}': {}", token, e)))?;

        Ok(SemanticEvent::NoteSignal {
            pitch,
            velocity: self.bin_to_velocity(bin)?,
            instrument: 0,
        })
    }

    /// Decode any token string
    pub fn token_to_event(&self, token: &str) -> Result<SemanticEvent> {
        self.config()?;
        if token == "<end>" {
            Ok(SemanticEvent::TimeAdvance(END_TOKEN_GAP))
        } else if token.starts_with('<') {
            Ok(SemanticEvent::TimeAdvance(0.0))
        } else if token.starts_with('t') {
            Ok(SemanticEvent::TimeAdvance(self.wait_token_to_delta(token)?))
        } else {
            self.note_token_to_event(token)
        }
    }
}
