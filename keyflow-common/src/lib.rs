//! # keyflow Common Library
//!
//! Shared code for the keyflow generator:
//! - Error types
//! - TOML bootstrap configuration and path resolution
//! - Generation event types and the `EventBus`

pub mod config;
pub mod error;
pub mod events;

pub use error::{Error, Result};
pub use events::{EventBus, GenerationEvent, NoteBlock};
