//! Single-slot mailbox carrying the latest registration sample.

use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard};

use super::AffineTransform;

/// One completed optimizer iteration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProgressSample {
    /// Metric value after the iteration
    pub value: f64,
    /// 1-based iteration index
    pub iteration: u64,
    /// Transform reached by the iteration
    pub transform: AffineTransform,
}

/// What a non-blocking read sees
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressReading {
    pub value: f64,
    pub iteration: u64,
    /// False until the first publish
    pub has_result: bool,
}

/// Latest-value-wins handoff from the worker thread to readers.
///
/// Publishing replaces the whole sample under a short lock, so readers see
/// one publish or the next, never a mix. Samples a slow reader misses are
/// gone.
#[derive(Debug, Default)]
pub struct ProgressChannel {
    slot: Mutex<Option<ProgressSample>>,
}

impl ProgressChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the slot contents.
    pub fn publish(&self, sample: ProgressSample) {
        *self.lock() = Some(sample);
    }

    /// Read the slot without waiting on the writer beyond its critical section.
    pub fn try_read(&self) -> ProgressReading {
        match *self.lock() {
            Some(sample) => ProgressReading {
                value: sample.value,
                iteration: sample.iteration,
                has_result: true,
            },
            None => ProgressReading {
                value: f64::NAN,
                iteration: 0,
                has_result: false,
            },
        }
    }

    /// Full copy of the latest sample, if any
    pub fn latest(&self) -> Option<ProgressSample> {
        *self.lock()
    }

    // The slot is overwritten whole, so a poisoned lock still holds a
    // complete sample.
    fn lock(&self) -> MutexGuard<'_, Option<ProgressSample>> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
