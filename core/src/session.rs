//! Trial session sinks
//! The connection reports everything a trial produces through this interface;
//! recording, publishing or ignoring the data is the collaborator's business.

use std::sync::{Arc, Mutex};

use crate::trial::{EventOccurrence, StateOccurrence, Trial};

/// Observer for trial output.
///
/// All hooks default to no-ops so implementors only write what they care
/// about. Hooks are invoked on the thread running the trial loop.
pub trait SessionSink {
    /// A trial finished (completed, cancelled or failed with a synthetic
    /// end record).
    fn on_trial(&mut self, _trial: &Trial) {}

    /// A state was entered and left (or never visited, with NaN bounds).
    fn on_state(&mut self, _state: &StateOccurrence) {}

    /// An input event occurred.
    fn on_event(&mut self, _event: &EventOccurrence) {}

    /// The controller requested host action.
    fn on_softcode(&mut self, _code: u8) {}

    /// Free-form progress notes (handshake results, warnings).
    fn on_info(&mut self, _message: &str) {}
}

/// Sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSession;

impl SessionSink for NullSession {}

/// A session can be shared between the connection and the application by
/// wrapping it in `Arc<Mutex<_>>`; a poisoned lock silently drops records.
impl<S: SessionSink> SessionSink for Arc<Mutex<S>> {
    fn on_trial(&mut self, trial: &Trial) {
        if let Ok(mut session) = self.lock() {
            session.on_trial(trial);
        }
    }

    fn on_state(&mut self, state: &StateOccurrence) {
        if let Ok(mut session) = self.lock() {
            session.on_state(state);
        }
    }

    fn on_event(&mut self, event: &EventOccurrence) {
        if let Ok(mut session) = self.lock() {
            session.on_event(event);
        }
    }

    fn on_softcode(&mut self, code: u8) {
        if let Ok(mut session) = self.lock() {
            session.on_softcode(code);
        }
    }

    fn on_info(&mut self, message: &str) {
        if let Ok(mut session) = self.lock() {
            session.on_info(message);
        }
    }
}

/// Sink that appends everything to in-memory lists.
#[derive(Debug, Default)]
pub struct MemorySession {
    pub trials: Vec<Trial>,
    pub states: Vec<StateOccurrence>,
    pub events: Vec<EventOccurrence>,
    pub softcodes: Vec<u8>,
    pub infos: Vec<String>,
}

impl MemorySession {
    pub fn new() -> Self {
        Self::default()
    }

    /// The most recent completed trial, if any.
    pub fn current_trial(&self) -> Option<&Trial> {
        self.trials.last()
    }
}

impl SessionSink for MemorySession {
    fn on_trial(&mut self, trial: &Trial) {
        self.trials.push(trial.clone());
    }

    fn on_state(&mut self, state: &StateOccurrence) {
        self.states.push(state.clone());
    }

    fn on_event(&mut self, event: &EventOccurrence) {
        self.events.push(event.clone());
    }

    fn on_softcode(&mut self, code: u8) {
        self.softcodes.push(code);
    }

    fn on_info(&mut self, message: &str) {
        self.infos.push(message.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_session_records_everything() {
        let mut session = MemorySession::new();
        session.on_softcode(7);
        session.on_info("connected");
        session.on_state(&StateOccurrence {
            name: "A".into(),
            start: 0.0,
            end: 1.0,
        });
        assert_eq!(session.softcodes, vec![7]);
        assert_eq!(session.infos, vec!["connected"]);
        assert_eq!(session.states.len(), 1);
        assert!(session.current_trial().is_none());
    }
}
