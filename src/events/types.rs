//! Event type definitions for wizard notifications.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::registration::WorkerState;

/// Notification classes fired by the wizard model.
///
/// Kinds form a tree rooted at [`EventKind::ModelUpdate`]; a kind is also an
/// instance of every ancestor, so a `ValueChange` is a `StateChange` too.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// Anything about the model changed
    ModelUpdate,
    /// The model moved to a different state
    StateChange,
    /// A value exposed by the model changed
    ValueChange,
    /// The set of allowed values for a property changed
    DomainChange,
    /// The selected file format changed
    FormatChange,
    /// Registration mode, metric or initialization changed
    RegistrationSettingsChange,
    /// An image finished loading
    ImageLoaded,
    /// The registration worker made progress
    RegistrationProgress,
}

impl EventKind {
    /// The kind this one specializes, or `None` for the root.
    pub fn parent(self) -> Option<EventKind> {
        match self {
            EventKind::ModelUpdate => None,
            EventKind::StateChange => Some(EventKind::ModelUpdate),
            EventKind::ValueChange => Some(EventKind::StateChange),
            EventKind::DomainChange => Some(EventKind::StateChange),
            EventKind::FormatChange => Some(EventKind::ValueChange),
            EventKind::RegistrationSettingsChange => Some(EventKind::ValueChange),
            EventKind::ImageLoaded => Some(EventKind::StateChange),
            EventKind::RegistrationProgress => Some(EventKind::ModelUpdate),
        }
    }

    /// True if `self` is `other` or a more specific case of it.
    pub fn is_a(self, other: EventKind) -> bool {
        let mut current = Some(self);
        while let Some(kind) = current {
            if kind == other {
                return true;
            }
            current = kind.parent();
        }
        false
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EventKind::ModelUpdate => "ModelUpdateEvent",
            EventKind::StateChange => "StateChangeEvent",
            EventKind::ValueChange => "ValueChangedEvent",
            EventKind::DomainChange => "DomainChangedEvent",
            EventKind::FormatChange => "FormatChangeEvent",
            EventKind::RegistrationSettingsChange => "RegistrationSettingsChangeEvent",
            EventKind::ImageLoaded => "ImageLoadedEvent",
            EventKind::RegistrationProgress => "RegistrationProgressEvent",
        };
        write!(f, "{}", name)
    }
}

/// Identity of an object that fires events.
///
/// Only compared for equality; it never keeps the object alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceId(Uuid);

impl SourceId {
    /// Allocate a fresh identity
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SourceId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for SourceId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Messages sent from background work to the foreground
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    /// Registration worker events
    Registration(RegistrationEvent),
}

impl Event {
    /// The notification class this message turns into on the foreground
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Registration(RegistrationEvent::Progress { .. }) => {
                EventKind::RegistrationProgress
            }
            Event::Registration(RegistrationEvent::Finished { .. }) => EventKind::StateChange,
        }
    }

    /// The object that produced this message
    pub fn source(&self) -> SourceId {
        match self {
            Event::Registration(RegistrationEvent::Progress { run_id, .. })
            | Event::Registration(RegistrationEvent::Finished { run_id, .. }) => {
                SourceId::from(*run_id)
            }
        }
    }
}

/// Markers emitted by a registration run.
///
/// They carry no metric values; readers fetch the latest sample from the
/// run's progress channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RegistrationEvent {
    /// At least one iteration completed since the last marker
    Progress { run_id: Uuid, iteration: u64 },
    /// The run reached a terminal state
    Finished { run_id: Uuid, state: WorkerState },
}
