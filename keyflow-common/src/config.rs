//! Bootstrap configuration loaded from TOML
//!
//! # Settings Sources Priority
//!
//! 1. Command-line argument (`--config`)
//! 2. Environment variable (`KEYFLOW_CONFIG`)
//! 3. Per-user config file (`<config_dir>/keyflow/config.toml`)
//! 4. Built-in defaults (code constants)
//!
//! Every field has a built-in default, so an empty file (or no file at all)
//! yields a runnable configuration.

use crate::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Environment variable consulted when no `--config` argument is given
pub const CONFIG_ENV_VAR: &str = "KEYFLOW_CONFIG";

/// Bootstrap configuration
///
/// Paths are interpreted relative to the directory containing the config
/// file (see [`TomlConfig::resolve_paths`]).
#[derive(Debug, Clone, Deserialize)]
pub struct TomlConfig {
    /// Word-level tokenizer JSON (`{"model": {"vocab": {...}}}`)
    #[serde(default = "default_tokenizer_path")]
    pub tokenizer_path: PathBuf,

    /// Vocabulary decoding constants JSON
    #[serde(default = "default_vocab_config_path")]
    pub vocab_config_path: PathBuf,

    /// Sequence model weights (bigram table JSON)
    #[serde(default = "default_model_path")]
    pub model_path: PathBuf,

    /// Logging configuration (optional)
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Producer settings
    #[serde(default)]
    pub generation: GenerationConfig,

    /// Consumer settings
    #[serde(default)]
    pub pacing: PacingConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level or full `EnvFilter` directive (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// Generation loop settings
///
/// Fixed for the lifetime of the process; never taken from user input at
/// `start` time.
#[derive(Debug, Clone, Deserialize)]
pub struct GenerationConfig {
    /// Capacity of the bounded event queue between producer and consumer
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Nucleus cutoff (0 disables)
    #[serde(default = "default_top_p")]
    pub top_p: f32,

    /// Number of recent token ids remembered by the repetition penalty
    #[serde(default = "default_repetition_view_length")]
    pub repetition_view_length: usize,

    #[serde(default = "default_repetition_penalty")]
    pub repetition_penalty: f32,

    #[serde(default = "default_max_penalty")]
    pub max_penalty: f32,

    #[serde(default = "default_decay_factor")]
    pub decay_factor: f32,

    /// Half-open id ranges never penalized for repetition
    #[serde(default = "default_penalty_exclude_ranges")]
    pub penalty_exclude_ranges: Vec<[u32; 2]>,

    /// Half-open id ranges whose probability is zeroed before sampling
    #[serde(default = "default_blocked_ranges")]
    pub blocked_ranges: Vec<[u32; 2]>,

    /// Fixed RNG seed; entropy-seeded when absent
    #[serde(default)]
    pub seed: Option<u64>,
}

/// Pacing controller settings
#[derive(Debug, Clone, Deserialize)]
pub struct PacingConfig {
    /// Consumer re-evaluation interval
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Upper bound on open + completed notes retained in the timeline
    #[serde(default = "default_max_total_notes")]
    pub max_total_notes: usize,

    /// How far past the playback position generation may run (seconds)
    #[serde(default = "default_lookahead_secs")]
    pub lookahead_secs: f64,

    /// How long completed notes stay in the timeline after playback passes them (seconds)
    #[serde(default = "default_lookbehind_secs")]
    pub lookbehind_secs: f64,
}

fn default_tokenizer_path() -> PathBuf {
    PathBuf::from("tokenizer.json")
}

fn default_vocab_config_path() -> PathBuf {
    PathBuf::from("vocab_config.json")
}

fn default_model_path() -> PathBuf {
    PathBuf::from("model.json")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_queue_capacity() -> usize {
    64
}

fn default_temperature() -> f32 {
    1.0
}

fn default_top_p() -> f32 {
    0.8
}

fn default_repetition_view_length() -> usize {
    128
}

fn default_repetition_penalty() -> f32 {
    1.1
}

fn default_max_penalty() -> f32 {
    1.5
}

fn default_decay_factor() -> f32 {
    0.99
}

fn default_penalty_exclude_ranges() -> Vec<[u32; 2]> {
    // Control and wait tokens
    vec![[3, 128]]
}

fn default_blocked_ranges() -> Vec<[u32; 2]> {
    vec![[0, 1], [128, 270], [1680, 2175]]
}

fn default_tick_interval_ms() -> u64 {
    100
}

fn default_max_total_notes() -> usize {
    256
}

fn default_lookahead_secs() -> f64 {
    10.0
}

fn default_lookbehind_secs() -> f64 {
    5.0
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            repetition_view_length: default_repetition_view_length(),
            repetition_penalty: default_repetition_penalty(),
            max_penalty: default_max_penalty(),
            decay_factor: default_decay_factor(),
            penalty_exclude_ranges: default_penalty_exclude_ranges(),
            blocked_ranges: default_blocked_ranges(),
            seed: None,
        }
    }
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            max_total_notes: default_max_total_notes(),
            lookahead_secs: default_lookahead_secs(),
            lookbehind_secs: default_lookbehind_secs(),
        }
    }
}

impl Default for TomlConfig {
    fn default() -> Self {
        Self {
            tokenizer_path: default_tokenizer_path(),
            vocab_config_path: default_vocab_config_path(),
            model_path: default_model_path(),
            logging: LoggingConfig::default(),
            generation: GenerationConfig::default(),
            pacing: PacingConfig::default(),
        }
    }
}

impl TomlConfig {
    /// Parse and validate a config file, resolving relative paths against its directory
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let mut config: TomlConfig = toml::from_str(&content)?;
        config.validate()?;
        if let Some(base) = path.parent() {
            config.resolve_paths(base);
        }
        Ok(config)
    }

    /// Load the resolved config file, or fall back to built-in defaults
    ///
    /// A missing file is not an error: a warning is logged and defaults are
    /// used. A file that exists but fails to parse is an error.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) if path.exists() => {
                info!("Loading config from {}", path.display());
                Self::load(path)
            }
            Some(path) => {
                warn!("Config file {} not found, using defaults", path.display());
                Ok(Self::default())
            }
            None => {
                info!("No config file, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Make relative data paths relative to `base`
    pub fn resolve_paths(&mut self, base: &Path) {
        for path in [
            &mut self.tokenizer_path,
            &mut self.vocab_config_path,
            &mut self.model_path,
        ] {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
    }

    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        let generation = &self.generation;
        if generation.queue_capacity == 0 {
            return Err(Error::Config("generation.queue_capacity must be > 0".to_string()));
        }
        if generation.temperature <= 0.0 {
            return Err(Error::Config("generation.temperature must be > 0".to_string()));
        }
        if !(0.0..=1.0).contains(&generation.top_p) {
            return Err(Error::Config("generation.top_p must be within [0, 1]".to_string()));
        }
        if generation.repetition_view_length == 0 {
            return Err(Error::Config(
                "generation.repetition_view_length must be > 0".to_string(),
            ));
        }
        if generation.max_penalty < 1.0 {
            return Err(Error::Config("generation.max_penalty must be >= 1".to_string()));
        }
        if self.pacing.tick_interval_ms == 0 {
            return Err(Error::Config("pacing.tick_interval_ms must be > 0".to_string()));
        }
        if self.pacing.max_total_notes == 0 {
            return Err(Error::Config("pacing.max_total_notes must be > 0".to_string()));
        }
        Ok(())
    }
}

/// Config file path resolution
pub struct ConfigResolver {
    cli_arg: Option<PathBuf>,
}

impl ConfigResolver {
    pub fn new(cli_arg: Option<PathBuf>) -> Self {
        Self { cli_arg }
    }

    /// Resolve the config file path following the priority order
    ///
    /// Returns `None` when nothing was specified and no per-user file exists.
    pub fn resolve(&self) -> Option<PathBuf> {
        // Priority 1: Command-line argument
        if let Some(path) = &self.cli_arg {
            return Some(path.clone());
        }

        // Priority 2: Environment variable
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            if !path.is_empty() {
                return Some(PathBuf::from(path));
            }
        }

        // Priority 3: per-user config file
        dirs::config_dir()
            .map(|d| d.join("keyflow").join("config.toml"))
            .filter(|p| p.exists())
    }
}
