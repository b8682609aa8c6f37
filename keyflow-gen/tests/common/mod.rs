//! Shared fixtures: a tiny vocabulary and a deterministic bigram model
//!
//! The model cycles through
//! `on(60) t1 off(60) t10 on(64) t5 off(64) t2 on(60) ...`
//! so one cycle spans 1.8 s of timeline with a 0.1 s note at pitch 60 and a
//! 0.5 s note at pitch 64.

#![allow(dead_code)]

use keyflow_gen::pacing::{PacingSettings, Watermarks};
use keyflow_gen::{GenerationSettings, PipelineSettings, ResourcePaths};
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

pub const TOKENIZER_JSON: &str = r#"{
    "model": {
        "type": "WordLevel",
        "vocab": {
            "<pad>": 0, "<start>": 1, "<end>": 2,
            "t1": 3, "t10": 4,
            "p:3c:b": 5, "p:3c:0": 6, "p:40:b": 7, "p:40:0": 8,
            "t5": 9, "t2": 10
        }
    }
}"#;

pub const VOCAB_JSON: &str = r#"{
    "wait_events": 10,
    "max_wait_time": 1000,
    "velocity_events": 128,
    "velocity_bins": 12,
    "velocity_exp": 1.0,
    "decode_end_held_note_delay": 8.0,
    "decode_fix_repeated_notes": false
}"#;

pub const MODEL_JSON: &str = r#"{
    "vocab_size": 11,
    "transitions": {
        "0": { "5": 1000 },
        "1": { "5": 1000 },
        "5": { "3": 1000 },
        "3": { "6": 1000 },
        "6": { "4": 1000 },
        "4": { "7": 1000 },
        "7": { "9": 1000 },
        "9": { "8": 1000 },
        "8": { "10": 1000 },
        "10": { "5": 1000 }
    },
    "unigram": { "5": 1 }
}"#;

/// Write the fixture files into a fresh temp dir
pub fn write_fixtures() -> (TempDir, ResourcePaths) {
    let dir = tempfile::tempdir().unwrap();
    let paths = ResourcePaths {
        tokenizer: write(dir.path(), "tokenizer.json", TOKENIZER_JSON),
        vocab_config: write(dir.path(), "vocab.json", VOCAB_JSON),
        model: write(dir.path(), "model.json", MODEL_JSON),
    };
    (dir, paths)
}

fn write(dir: &Path, name: &str, content: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, content).unwrap();
    path
}

/// Fast ticks, fixed seed, small queue
pub fn test_settings(max: f64) -> PipelineSettings {
    PipelineSettings {
        generation: GenerationSettings {
            queue_capacity: 8,
            seed: Some(42),
            ..GenerationSettings::default()
        },
        pacing: PacingSettings {
            tick_interval: Duration::from_millis(5),
            max_total_notes: 256,
        },
        initial_window: Some(Watermarks::new(0.0, max)),
    }
}
