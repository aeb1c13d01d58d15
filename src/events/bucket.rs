//! Deduplicating container for pending notifications.
//!
//! Observers are expensive to notify, so a batching scope collects the
//! notifications it wants to fire here first. A notification that is
//! already covered by a pending entry is dropped.

use std::fmt;

use super::{EventKind, SourceId};

/// A pending notification: an event class plus the object that fired it.
///
/// A `None` source is a wildcard when querying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventRecord {
    kind: EventKind,
    source: Option<SourceId>,
}

impl EventRecord {
    pub fn new(kind: EventKind, source: Option<SourceId>) -> Self {
        Self { kind, source }
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn source(&self) -> Option<SourceId> {
        self.source
    }

    /// Whether this stored record answers a query for `kind` from `source`.
    ///
    /// The stored kind must be the queried kind or a more specific one, and
    /// the sources must agree unless the query leaves the source open.
    pub fn matches(&self, kind: EventKind, source: Option<SourceId>) -> bool {
        self.kind.is_a(kind) && (source.is_none() || source == self.source)
    }
}

/// Set of pending notifications with no two equivalent entries.
///
/// Buckets hold a handful of entries per batching scope, so lookups are a
/// linear scan.
#[derive(Debug, Default)]
pub struct EventBucket {
    entries: Vec<EventRecord>,
}

impl EventBucket {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a notification unless an equivalent one is already pending.
    pub fn put_event(&mut self, kind: EventKind, source: Option<SourceId>) {
        if !self.has_event(kind, source) {
            self.entries.push(EventRecord::new(kind, source));
        }
    }

    /// True if a pending entry matches the query.
    pub fn has_event(&self, kind: EventKind, source: Option<SourceId>) -> bool {
        self.entries.iter().any(|entry| entry.matches(kind, source))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Drop every pending entry. Safe to call on an empty bucket.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Empty the bucket, handing back its entries for flushing.
    pub fn drain(&mut self) -> impl Iterator<Item = EventRecord> + '_ {
        self.entries.drain(..)
    }
}

impl fmt::Display for EventBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventBucket[")?;
        for (i, entry) in self.entries.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match entry.source {
                Some(source) => write!(f, "{}({})", entry.kind, source)?,
                None => write!(f, "{}(null)", entry.kind)?,
            }
        }
        write!(f, "]")
    }
}
