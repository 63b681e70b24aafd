//! The retained-record index: latest known value per `(entity, key)`,
//! kept until an explicit reset. One mutex-guarded map written only
//! by the listener's session routine and read by arbitrary caller
//! routines; the paired condvar wakes `wait_for` callers on every
//! write.

use std::{
    collections::HashMap,
    sync::{Condvar, Mutex, MutexGuard},
    time::{Duration, Instant},
};

use chrono::{DateTime, Local};
use kstring::KString;

use super::source::{AttributeKey, EntityChange, EntityId, EventRecord};

/// Outcome of a bounded wait. A timeout is a normal, expected value
/// the caller must handle, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Observed,
    TimedOut,
}

#[derive(Debug, Clone, PartialEq)]
struct Retained {
    value: KString,
    timestamp: DateTime<Local>,
}

#[derive(Debug, Default)]
pub struct EventIndex {
    records: Mutex<HashMap<(EntityId, AttributeKey), Retained>>,
    changed: Condvar,
}

impl EventIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<(EntityId, AttributeKey), Retained>> {
        self.records.lock().unwrap()
    }

    /// A newer record for the same `(entity, key)` supersedes the old
    /// one; no history is retained.
    pub fn apply(&self, record: EventRecord) {
        let EventRecord {
            entity,
            key,
            value,
            timestamp,
        } = record;
        self.lock().insert((entity, key), Retained { value, timestamp });
        self.changed.notify_all();
    }

    pub fn apply_all(&self, records: impl IntoIterator<Item = EventRecord>) {
        let mut guard = self.lock();
        for record in records {
            let EventRecord {
                entity,
                key,
                value,
                timestamp,
            } = record;
            guard.insert((entity, key), Retained { value, timestamp });
        }
        drop(guard);
        self.changed.notify_all();
    }

    pub fn apply_change(&self, change: EntityChange) {
        let EntityChange { entity, attributes } = change;
        let timestamp = Local::now();
        let mut guard = self.lock();
        for (key, value) in attributes {
            guard.insert(
                (entity.clone(), key),
                Retained { value, timestamp },
            );
        }
        drop(guard);
        self.changed.notify_all();
    }

    /// Forgets everything observed so far. Records racing with the
    /// reset are resolved in favor of the records: the mutex
    /// serializes, and whatever is applied after the clear is
    /// retained.
    pub fn reset(&self) {
        self.lock().clear();
        self.changed.notify_all();
    }

    pub fn latest(&self, entity: &str, key: &str) -> Option<(KString, DateTime<Local>)> {
        self.lock()
            .get(&(KString::from_ref(entity), KString::from_ref(key)))
            .map(|retained| (retained.value.clone(), retained.timestamp))
    }

    /// True iff the latest retained record for `(entity, key)` equals
    /// `value`; false when nothing was observed yet.
    pub fn has_event(&self, entity: &str, key: &str, value: &str) -> bool {
        self.latest(entity, key)
            .is_some_and(|(retained, _)| retained == value)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Blocks until `has_event` holds or the timeout elapses,
    /// checking at most every `step` (the condvar wakes early on
    /// writes, so matches are usually seen immediately; the step is
    /// the guard against busy-spinning on spurious wakeups).
    pub fn wait_for_value(
        &self,
        entity: &str,
        key: &str,
        value: &str,
        timeout: Duration,
        step: Duration,
    ) -> WaitOutcome {
        let wanted = (KString::from_ref(entity), KString::from_ref(key));
        let deadline = Instant::now() + timeout;
        let mut guard = self.lock();
        loop {
            if guard
                .get(&wanted)
                .is_some_and(|retained| retained.value == value)
            {
                return WaitOutcome::Observed;
            }
            let now = Instant::now();
            if now >= deadline {
                return WaitOutcome::TimedOut;
            }
            let wait = step.min(deadline - now);
            (guard, _) = self.changed.wait_timeout(guard, wait).unwrap();
        }
    }
}
