//! Note assembler
//!
//! Folds [`SemanticEvent`]s into a timeline of notes on a virtual clock.
//!
//! - `TimeAdvance(dt)` moves the clock forward, then force-closes every open
//!   note held for at least the hold timeout.
//! - A note-on for an already sounding pitch closes the old note at the
//!   current time and opens a new one (re-trigger).
//! - A note-off closes the open note only if time has passed since it opened.
//!
//! Closed notes never last less than [`MIN_NOTE_DURATION`].

use crate::types::SemanticEvent;
use keyflow_common::events::NoteBlock;
use std::collections::BTreeMap;
use tracing::trace;

/// Floor applied to every closed note (seconds)
pub const MIN_NOTE_DURATION: f64 = 0.1;

/// Seconds of timeline per full turn of the color wheel
const HUE_PERIOD_SECS: f64 = 30.0;

/// Display color for a note starting at `time`
pub fn note_color(time: f64) -> String {
    format!("hsl({}, 50%, 50%)", time * 360.0 / HUE_PERIOD_SECS)
}

/// A note that has started but not ended
#[derive(Debug, Clone, PartialEq)]
pub struct PartialNote {
    pub pitch: u8,
    pub velocity: f32,
    pub start_time: f64,
    pub color: String,
}

/// A note with a known duration
#[derive(Debug, Clone, PartialEq)]
pub struct CompleteNote {
    pub pitch: u8,
    pub velocity: f32,
    pub start_time: f64,
    pub duration: f64,
    pub color: String,
}

impl CompleteNote {
    pub fn end_time(&self) -> f64 {
        self.start_time + self.duration
    }
}

impl From<&PartialNote> for NoteBlock {
    fn from(note: &PartialNote) -> Self {
        NoteBlock {
            pitch: note.pitch,
            velocity: note.velocity,
            start_time: note.start_time,
            duration: None,
            color: note.color.clone(),
        }
    }
}

impl From<&CompleteNote> for NoteBlock {
    fn from(note: &CompleteNote) -> Self {
        NoteBlock {
            pitch: note.pitch,
            velocity: note.velocity,
            start_time: note.start_time,
            duration: Some(note.duration),
            color: note.color.clone(),
        }
    }
}

/// Timeline state: virtual clock, open notes keyed by pitch, closed notes
#[derive(Debug, Clone)]
pub struct NoteAssembler {
    hold_timeout: f64,
    notes_total_time: f64,
    prompt_end_time: f64,
    open: BTreeMap<u8, PartialNote>,
    completed: Vec<CompleteNote>,
}

impl NoteAssembler {
    /// # Arguments
    /// * `hold_timeout` - Seconds after which an open note is force-closed
    pub fn new(hold_timeout: f64) -> Self {
        Self {
            hold_timeout,
            notes_total_time: 0.0,
            prompt_end_time: 0.0,
            open: BTreeMap::new(),
            completed: Vec::new(),
        }
    }

    /// Virtual clock (seconds since session start)
    pub fn notes_total_time(&self) -> f64 {
        self.notes_total_time
    }

    /// Clock value once the prompt had been replayed
    pub fn prompt_end_time(&self) -> f64 {
        self.prompt_end_time
    }

    pub fn hold_timeout(&self) -> f64 {
        self.hold_timeout
    }

    /// Record the current clock as the end of the prompt
    pub fn mark_prompt_end(&mut self) {
        self.prompt_end_time = self.notes_total_time;
    }

    pub fn open_notes(&self) -> impl Iterator<Item = &PartialNote> {
        self.open.values()
    }

    pub fn completed_notes(&self) -> &[CompleteNote] {
        &self.completed
    }

    /// Open plus closed notes
    pub fn note_count(&self) -> usize {
        self.open.len() + self.completed.len()
    }

    /// Apply one event
    pub fn apply(&mut self, event: SemanticEvent) {
        match event {
            SemanticEvent::TimeAdvance(dt) => self.advance(dt),
            SemanticEvent::NoteSignal {
                pitch, velocity, ..
            } => {
                if event.is_note_off() {
                    self.note_off(pitch);
                } else {
                    self.note_on(pitch, velocity);
                }
            }
        }
    }

    fn advance(&mut self, dt: f64) {
        self.notes_total_time += dt.max(0.0);

        let now = self.notes_total_time;
        let expired: Vec<u8> = self
            .open
            .values()
            .filter(|note| now - note.start_time >= self.hold_timeout)
            .map(|note| note.pitch)
            .collect();
        for pitch in expired {
            trace!(pitch, time = now, "Force-closing held note");
            self.close(pitch);
        }
    }

    fn note_on(&mut self, pitch: u8, velocity: f32) {
        if self.open.contains_key(&pitch) {
            self.close(pitch);
        }
        self.open.insert(
            pitch,
            PartialNote {
                pitch,
                velocity,
                start_time: self.notes_total_time,
                color: note_color(self.notes_total_time),
            },
        );
    }

    fn note_off(&mut self, pitch: u8) {
        let elapsed = match self.open.get(&pitch) {
            Some(note) => self.notes_total_time - note.start_time,
            None => return,
        };
        if elapsed > 0.0 {
            self.close(pitch);
        }
    }

    /// Close the open note at `pitch` at the current clock
    fn close(&mut self, pitch: u8) {
        if let Some(note) = self.open.remove(&pitch) {
            let duration = (self.notes_total_time - note.start_time).max(MIN_NOTE_DURATION);
            self.completed.push(CompleteNote {
                pitch: note.pitch,
                velocity: note.velocity,
                start_time: note.start_time,
                duration,
                color: note.color,
            });
        }
    }

    /// Drop closed notes that ended before `min`
    ///
    /// Open notes are kept. Returns how many notes were dropped.
    pub fn evict_before(&mut self, min: f64) -> usize {
        let before = self.completed.len();
        self.completed.retain(|note| note.end_time() >= min);
        before - self.completed.len()
    }

    /// Back to an empty timeline at time zero
    pub fn reset(&mut self) {
        self.notes_total_time = 0.0;
        self.prompt_end_time = 0.0;
        self.open.clear();
        self.completed.clear();
    }

    /// Closed notes in completion order, then open notes by pitch
    pub fn snapshot(&self) -> Vec<NoteBlock> {
        self.completed
            .iter()
            .map(NoteBlock::from)
            .chain(self.open.values().map(NoteBlock::from))
            .collect()
    }
}
