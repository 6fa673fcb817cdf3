//! Append-only conversation log

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::ParleyError;
use crate::types::Turn;

/// Read-only view of the transcript at some point in time
pub type Snapshot = Vec<Arc<Turn>>;

/// The ordered log of every turn in one session.
///
/// Turns can only be appended, never mutated or removed, so any snapshot is a
/// prefix of every later snapshot. Readers never block on each other; a
/// second writer racing an in-progress append is rejected with
/// [`ParleyError::Ordering`].
#[derive(Default)]
pub struct Transcript {
    turns: RwLock<Vec<Arc<Turn>>>,
    appending: AtomicBool,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a turn. Its `seq` must equal the current length.
    pub fn append(&self, turn: Turn) -> Result<(), ParleyError> {
        if self.appending.swap(true, Ordering::AcqRel) {
            return Err(ParleyError::Ordering(
                "concurrent append without serialization".into(),
            ));
        }

        let result = {
            let mut turns = self.turns.write();
            if turn.seq != turns.len() {
                Err(ParleyError::Ordering(format!(
                    "turn seq {} appended at position {}",
                    turn.seq,
                    turns.len()
                )))
            } else {
                turns.push(Arc::new(turn));
                Ok(())
            }
        };

        self.appending.store(false, Ordering::Release);
        result
    }

    pub fn snapshot(&self) -> Snapshot {
        self.turns.read().clone()
    }

    pub fn len(&self) -> usize {
        self.turns.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.read().is_empty()
    }

    pub fn last(&self) -> Option<Arc<Turn>> {
        self.turns.read().last().cloned()
    }
}
