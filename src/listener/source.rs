//! The capabilities a managed system must expose for the listener to
//! observe it. The core consumes these and never implements them;
//! hosts wrap whatever event API their system has (push
//! subscriptions, or only a state-dump call for the polling
//! variant).

use chrono::{DateTime, Local};
use kstring::KString;

pub type EntityId = KString;
pub type AttributeKey = KString;
/// Which classes of managed entity to watch, e.g. "vm", "host".
pub type EntityKind = KString;

/// Last-known-value record for one `(entity, key)` pair.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    pub entity: EntityId,
    pub key: AttributeKey,
    pub value: KString,
    pub timestamp: DateTime<Local>,
}

impl EventRecord {
    pub fn now(entity: &str, key: &str, value: &str) -> Self {
        Self {
            entity: KString::from_ref(entity),
            key: KString::from_ref(key),
            value: KString::from_ref(value),
            timestamp: Local::now(),
        }
    }
}

/// One entity's changed attributes as delivered by a push stream.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityChange {
    pub entity: EntityId,
    pub attributes: Vec<(AttributeKey, KString)>,
}

/// Why a stream read did not produce an event. `EventsLost` is the
/// remote's way of saying the subscription fell behind and missed
/// deliveries; the listener reacts by re-running its registration
/// protocol, never by giving up.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("event stream reports lost events")]
    EventsLost,
    #[error("event stream failed: {0}")]
    Other(#[from] anyhow::Error),
}

/// A live subscription. Dropping the stream is the unsubscribe.
pub trait EventStream: Send {
    /// Blocks until the next event arrives or the stream fails.
    fn next_event(&mut self) -> Result<EntityChange, StreamError>;
}

pub trait EventSource: Send {
    /// Opens a push subscription for the given entity kinds. Sources
    /// for systems without push events may return an error here; such
    /// sources are only usable with the polling listener variant.
    fn subscribe(&mut self, kinds: &[EntityKind]) -> anyhow::Result<Box<dyn EventStream>>;

    /// A full dump of the current state of all matching entities.
    /// Used right after subscribing (state a subscription was created
    /// too late to see) and as the sole mechanism of the polling
    /// variant.
    fn poll_snapshot(&mut self, kinds: &[EntityKind]) -> anyhow::Result<Vec<EventRecord>>;
}
