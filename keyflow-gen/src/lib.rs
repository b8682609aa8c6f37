//! # keyflow-gen
//!
//! Streaming note generator: a sequence model emits tokens one at a time,
//! tokens are decoded into musical events, and events are folded into a
//! timeline of notes paced to a playback window.
//!
//! ```text
//! SequenceModel --sample--> token --decode--> SemanticEvent
//!     --bounded queue--> PacingController --> NoteAssembler --> Notes event
//! ```

pub mod assembler;
pub mod error;
pub mod generator;
pub mod model;
pub mod pacing;
pub mod pipeline;
pub mod sampling;
pub mod types;
pub mod vocab;

pub use assembler::{CompleteNote, NoteAssembler, PartialNote, MIN_NOTE_DURATION};
pub use error::{Error, Result};
pub use generator::{EventReceiver, GenerationSettings, Generator, GeneratorStatus};
pub use model::{BigramModel, SequenceModel};
pub use pacing::{PacingController, PacingSettings, Watermarks};
pub use pipeline::{Pipeline, PipelineSettings, ResourcePaths};
pub use types::{SemanticEvent, TokenId};
pub use vocab::{VocabConfig, VocabDecoder, WordLevelTokenizer};
