//! Pacing controller (consumer)
//!
//! Pulls events from the generation queue into the [`NoteAssembler`] only
//! as fast as the playback window needs them. The host publishes a
//! `(min, max)` pair of timeline watermarks; each tick the controller:
//!
//! 1. evicts notes that ended before `min`, if `min` moved
//! 2. applies events while the clock is behind `max` and the timeline holds
//!    fewer than `max_total_notes` notes
//! 3. reports whether anything visible changed
//!
//! Events left in the queue stay there; the generation loop blocks on the
//! full queue, which is what keeps generation paced to playback.

use crate::assembler::NoteAssembler;
use crate::generator::EventReceiver;
use crate::types::SemanticEvent;
use chrono::Utc;
use keyflow_common::config::PacingConfig;
use keyflow_common::events::GenerationEvent;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

/// Timeline window supplied by the playback host (seconds)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Watermarks {
    /// Notes ending before this are no longer needed
    pub min: f64,

    /// Assemble notes up to this time
    pub max: f64,
}

impl Watermarks {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }
}

#[derive(Debug, Clone)]
pub struct PacingSettings {
    pub tick_interval: Duration,
    pub max_total_notes: usize,
}

impl PacingSettings {
    pub fn from_config(config: &PacingConfig) -> Self {
        Self {
            tick_interval: Duration::from_millis(config.tick_interval_ms),
            max_total_notes: config.max_total_notes,
        }
    }
}

impl Default for PacingSettings {
    fn default() -> Self {
        Self::from_config(&PacingConfig::default())
    }
}

/// Non-blocking source of semantic events
pub trait EventSource {
    fn next_event(&mut self) -> Option<SemanticEvent>;
}

impl EventSource for EventReceiver {
    fn next_event(&mut self) -> Option<SemanticEvent> {
        self.try_recv()
    }
}

impl EventSource for VecDeque<SemanticEvent> {
    fn next_event(&mut self) -> Option<SemanticEvent> {
        self.pop_front()
    }
}

/// Build a `Notes` event from the current timeline
pub fn notes_event(assembler: &NoteAssembler) -> GenerationEvent {
    GenerationEvent::Notes {
        notes: assembler.snapshot(),
        notes_total_time: assembler.notes_total_time(),
        prompt_end_time: assembler.prompt_end_time(),
        timestamp: Utc::now(),
    }
}

pub struct PacingController {
    assembler: NoteAssembler,
    window: watch::Receiver<Watermarks>,
    max_total_notes: usize,
    last_min: f64,
    last_total_time: f64,
}

impl PacingController {
    /// # Arguments
    /// * `assembler` - Timeline to feed (may already hold prompt notes)
    /// * `window` - Watermarks written by the host
    /// * `max_total_notes` - Cap on open plus complete notes
    pub fn new(
        assembler: NoteAssembler,
        window: watch::Receiver<Watermarks>,
        max_total_notes: usize,
    ) -> Self {
        let last_min = window.borrow().min;
        let last_total_time = assembler.notes_total_time();
        Self {
            assembler,
            window,
            max_total_notes,
            last_min,
            last_total_time,
        }
    }

    pub fn assembler(&self) -> &NoteAssembler {
        &self.assembler
    }

    pub fn into_assembler(self) -> NoteAssembler {
        self.assembler
    }

    /// Run one pacing step
    ///
    /// # Returns
    /// `true` if the timeline changed and a snapshot should be published
    pub fn tick<S: EventSource + ?Sized>(&mut self, events: &mut S) -> bool {
        let Watermarks { min, max } = *self.window.borrow();
        let mut modified = false;

        if min != self.last_min {
            let evicted = self.assembler.evict_before(min);
            if evicted > 0 {
                debug!(evicted, min, "Evicted notes behind playback");
            }
            self.last_min = min;
            modified = true;
        }

        let mut applied = 0usize;
        while self.assembler.notes_total_time() < max
            && self.assembler.note_count() < self.max_total_notes
        {
            let Some(event) = events.next_event() else {
                break;
            };
            self.assembler.apply(event);
            applied += 1;

            if self.assembler.notes_total_time() != self.last_total_time {
                self.last_total_time = self.assembler.notes_total_time();
                modified = true;
            }
        }

        if applied > 0 {
            debug!(
                applied,
                total_time = self.assembler.notes_total_time(),
                notes = self.assembler.note_count(),
                "Pacing tick"
            );
        }
        modified
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(min: f64, max: f64, cap: usize) -> (PacingController, watch::Sender<Watermarks>) {
        let (tx, rx) = watch::channel(Watermarks::new(min, max));
        (PacingController::new(NoteAssembler::new(8.0), rx, cap), tx)
    }

    fn queue(events: &[SemanticEvent]) -> VecDeque<SemanticEvent> {
        events.iter().copied().collect()
    }

    #[test]
    fn test_stops_at_high_watermark() {
        let (mut pacing, _tx) = controller(0.0, 1.0, 256);
        let mut events = queue(&[
            SemanticEvent::note(60, 0.8),
            SemanticEvent::TimeAdvance(0.6),
            SemanticEvent::TimeAdvance(0.6),
            SemanticEvent::TimeAdvance(0.6),
        ]);

        assert!(pacing.tick(&mut events));
        // Clock passed 1.0 after the second advance; the third stays queued
        assert_eq!(pacing.assembler().notes_total_time(), 1.2);
        assert_eq!(events.len(), 1);

        assert!(!pacing.tick(&mut events));
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_note_cap_limits_growth() {
        let (mut pacing, _tx) = controller(0.0, 100.0, 2);
        let mut events = queue(&[
            SemanticEvent::note(60, 0.8),
            SemanticEvent::note(62, 0.8),
            SemanticEvent::note(64, 0.8),
        ]);
        pacing.tick(&mut events);
        assert_eq!(pacing.assembler().note_count(), 2);
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_note_only_events_do_not_mark_modified() {
        let (mut pacing, _tx) = controller(0.0, 100.0, 256);
        let mut events = queue(&[SemanticEvent::note(60, 0.8)]);
        assert!(!pacing.tick(&mut events));
        assert_eq!(pacing.assembler().note_count(), 1);
    }

    #[test]
    fn test_min_change_evicts() {
        let (mut pacing, tx) = controller(0.0, 2.0, 256);
        let mut events = queue(&[
            SemanticEvent::note(60, 0.8),
            SemanticEvent::TimeAdvance(0.5),
            SemanticEvent::note(60, 0.0),
            SemanticEvent::TimeAdvance(1.0),
        ]);
        pacing.tick(&mut events);
        assert_eq!(pacing.assembler().completed_notes().len(), 1);

        // Same min, nothing to do
        assert!(!pacing.tick(&mut events));

        tx.send_replace(Watermarks::new(1.0, 2.0));
        assert!(pacing.tick(&mut events));
        assert_eq!(pacing.assembler().note_count(), 0);
    }

    #[test]
    fn test_notes_event_carries_timeline() {
        let mut assembler = NoteAssembler::new(8.0);
        assembler.apply(SemanticEvent::TimeAdvance(1.5));
        assembler.mark_prompt_end();
        assembler.apply(SemanticEvent::note(60, 0.8));

        match notes_event(&assembler) {
            GenerationEvent::Notes {
                notes,
                notes_total_time,
                prompt_end_time,
                ..
            } => {
                assert_eq!(notes.len(), 1);
                assert_eq!(notes_total_time, 1.5);
                assert_eq!(prompt_end_time, 1.5);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
