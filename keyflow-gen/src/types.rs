//! Token and event types shared across modules

/// Index into the model's vocabulary (and into its logit vector)
pub type TokenId = u32;

/// `<pad>`: resets recurrent state; decoding it mid-stream is a fault
pub const PAD_ID: TokenId = 0;

/// `<end>`: resets recurrent state
pub const END_ID: TokenId = 2;

/// Velocities at or below this are note-off signals
pub const NOTE_OFF_VELOCITY: f32 = 0.01;

/// Musically meaningful decoding of one token
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SemanticEvent {
    /// Advance the virtual clock (seconds)
    TimeAdvance(f64),

    /// Note on (velocity > 0.01) or note off (velocity <= 0.01)
    NoteSignal {
        pitch: u8,
        /// Normalized 0.0-1.0
        velocity: f32,
        instrument: u8,
    },
}

impl SemanticEvent {
    /// Convenience constructor for a note-on/off with instrument 0
    pub fn note(pitch: u8, velocity: f32) -> Self {
        SemanticEvent::NoteSignal {
            pitch,
            velocity,
            instrument: 0,
        }
    }

    pub fn is_note_off(&self) -> bool {
        matches!(self, SemanticEvent::NoteSignal { velocity, .. } if *velocity <= NOTE_OFF_VELOCITY)
    }
}
