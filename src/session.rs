use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;

use crate::models::{LedRecord, Roi};

#[derive(Debug, Error)]
#[error("a mapping session is already running")]
pub struct SessionConflict;

/// In-progress mapping state. Mutated only by the engine worker, read
/// concurrently through [SessionStore] snapshots; immutable once `done`.
#[derive(Debug, Clone)]
pub struct MappingSession {
    pub running: bool,
    pub done: bool,
    pub aborted: bool,
    pub roi: Option<Roi>,
    pub width: u32,
    pub height: u32,
    pub current_led: Option<usize>,
    pub total_leds: usize,
    pub consecutive_failures: u32,
    pub records: Vec<LedRecord>,
}

impl Default for MappingSession {
    fn default() -> Self {
        Self {
            running: false,
            done: true,
            aborted: false,
            roi: None,
            width: 0,
            height: 0,
            current_led: None,
            total_leds: 0,
            consecutive_failures: 0,
            records: Vec::new(),
        }
    }
}

/// Shared session state behind one mutex. `apply` mutations are O(1) field
/// assignments or appends, so the illumination loop never waits on readers
/// for long; readers always observe a complete snapshot, never a torn one.
#[derive(Clone)]
pub struct SessionStore(Arc<Mutex<MappingSession>>);

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(MappingSession::default())))
    }

    fn lock(&self) -> MutexGuard<'_, MappingSession> {
        // The state is plain data; keep serving it even after a panic
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim the single running slot and install a fresh session seeded with
    /// the given records. The check-and-set happens under the state mutex,
    /// so two workers can never be active at once; a conflict leaves the
    /// running session untouched.
    pub fn try_start(&self, roi: Option<Roi>, seed: Vec<LedRecord>) -> Result<(), SessionConflict> {
        let mut session = self.lock();

        if session.running {
            return Err(SessionConflict);
        }

        let total_leds = seed.len();
        *session = MappingSession {
            running: true,
            done: false,
            aborted: false,
            roi,
            width: 0,
            height: 0,
            current_led: None,
            total_leds,
            consecutive_failures: 0,
            records: seed,
        };

        Ok(())
    }

    pub fn apply<F: FnOnce(&mut MappingSession)>(&self, mutate: F) {
        mutate(&mut self.lock());
    }

    pub fn snapshot(&self) -> MappingSession {
        self.lock().clone()
    }

    /// Terminal transition; the session record must not be mutated after
    /// this.
    pub fn finish(&self, aborted: bool) {
        let mut session = self.lock();
        session.running = false;
        session.done = true;
        session.aborted = aborted;
        session.current_led = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_is_single_flight() {
        let store = SessionStore::new();
        store.try_start(None, Vec::new()).unwrap();

        store.apply(|session| {
            session.records.push(LedRecord::Found { x: 0.5, y: 0.5 });
            session.total_leds = 1;
        });

        // A second start is rejected and the running session's progress is
        // untouched
        assert!(store.try_start(None, Vec::new()).is_err());
        let snapshot = store.snapshot();
        assert!(snapshot.running);
        assert_eq!(snapshot.total_leds, 1);
        assert_eq!(snapshot.records.len(), 1);

        store.finish(false);
        assert!(store.try_start(None, Vec::new()).is_ok());
    }

    #[test]
    fn snapshots_are_consistent_copies() {
        let store = SessionStore::new();
        store.try_start(None, Vec::new()).unwrap();

        store.apply(|session| {
            session.records.push(LedRecord::NotFound);
            session.total_leds = 1;
            session.consecutive_failures = 1;
        });

        let snapshot = store.snapshot();
        assert_eq!(snapshot.records.len(), snapshot.total_leds);

        // Later mutations do not leak into an existing snapshot
        store.apply(|session| {
            session.records.push(LedRecord::Found { x: 0.1, y: 0.2 });
            session.total_leds = 2;
        });
        assert_eq!(snapshot.total_leds, 1);
    }

    #[test]
    fn seeded_start_preserves_prior_records() {
        let seed = vec![
            LedRecord::Found { x: 0.1, y: 0.1 },
            LedRecord::NotFound,
            LedRecord::Found { x: 0.2, y: 0.3 },
        ];

        let store = SessionStore::new();
        store.try_start(None, seed.clone()).unwrap();

        let snapshot = store.snapshot();
        assert_eq!(snapshot.records, seed);
        assert_eq!(snapshot.total_leds, 3);
        assert_eq!(snapshot.consecutive_failures, 0);
    }

    #[test]
    fn finish_marks_the_session_immutable_terminal_state() {
        let store = SessionStore::new();
        store.try_start(None, Vec::new()).unwrap();
        store.finish(true);

        let snapshot = store.snapshot();
        assert!(!snapshot.running);
        assert!(snapshot.done);
        assert!(snapshot.aborted);
        assert_eq!(snapshot.current_led, None);
    }
}
