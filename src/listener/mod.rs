//! Watching the managed system's live state. One background session
//! routine per listener keeps the retained-record index current;
//! callers ask `has_event` / `wait_for` and never talk to the stream
//! themselves.
//!
//! The session protocol: subscribe, then apply a full state snapshot
//! (a subscription created "too late" would otherwise miss state that
//! changed just before it), then read events forever. A "lost events"
//! signal from the stream, or any unexpected stream failure, sends
//! the session back to registration; only `stop` ends it. Systems
//! without a push capability get the polling variant, which has the
//! identical caller-visible contract apart from timing.

pub mod index;
pub mod source;

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Condvar, Mutex,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use rand::Rng;

use crate::info;

pub use index::{EventIndex, WaitOutcome};
pub use source::{
    AttributeKey, EntityChange, EntityId, EntityKind, EventRecord, EventSource, EventStream,
    StreamError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum ListenerPhase {
    Idle,
    Registering,
    Listening,
    Stopped,
}

/// Contract violations; distinct from timeouts, which are ordinary
/// `WaitOutcome` values.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ListenError {
    #[error(
        "wait_for called before the listening session ever became live; \
         wait for the Listening phase first"
    )]
    NeverListening,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ListenerOpts {
    /// Entity kinds passed to `subscribe` / `poll_snapshot`.
    pub kinds: Vec<EntityKind>,
    /// Minimum sleep increment between `wait_for` checks (the guard
    /// against busy-spinning).
    pub wait_step: Duration,
    /// Polling variant only: how often to take a snapshot.
    pub poll_interval: Duration,
    /// Base pause before re-registering after an *unexpected* failure
    /// (a jitter of up to half of this is added). Lost-events signals
    /// re-register immediately.
    pub reregister_backoff: Duration,
}

impl Default for ListenerOpts {
    fn default() -> Self {
        Self {
            kinds: Vec::new(),
            wait_step: Duration::from_millis(100),
            poll_interval: Duration::from_secs(1),
            reregister_backoff: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Default)]
struct Shared {
    index: EventIndex,
    phase: Mutex<Option<ListenerPhase>>,
    phase_changed: Condvar,
    stop: AtomicBool,
    ever_listening: AtomicBool,
    registrations: AtomicU64,
}

impl Shared {
    fn set_phase(&self, phase: ListenerPhase) {
        *self.phase.lock().unwrap() = Some(phase);
        self.phase_changed.notify_all();
    }

    fn phase(&self) -> ListenerPhase {
        self.phase.lock().unwrap().unwrap_or(ListenerPhase::Idle)
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }
}

/// Handle to one listening session. All methods are cheap; the work
/// happens on the background routine.
#[derive(Debug)]
pub struct EventListener {
    shared: Arc<Shared>,
    wait_step: Duration,
    thread: Option<JoinHandle<()>>,
}

impl EventListener {
    /// Starts a push-event session; returns immediately.
    pub fn spawn_push(source: impl EventSource + 'static, opts: ListenerOpts) -> Self {
        let wait_step = opts.wait_step;
        Self::spawn(wait_step, move |shared| push_session(source, opts, shared))
    }

    /// Starts a polling session for systems without push events;
    /// callers cannot distinguish the variants except through timing.
    pub fn spawn_polling(source: impl EventSource + 'static, opts: ListenerOpts) -> Self {
        let wait_step = opts.wait_step;
        Self::spawn(wait_step, move |shared| polling_session(source, opts, shared))
    }

    fn spawn(wait_step: Duration, body: impl FnOnce(Arc<Shared>) + Send + 'static) -> Self {
        let shared = Arc::new(Shared::default());
        shared.set_phase(ListenerPhase::Idle);
        let thread_shared = shared.clone();
        let thread = std::thread::spawn(move || body(thread_shared));
        Self {
            shared,
            wait_step,
            thread: Some(thread),
        }
    }

    pub fn phase(&self) -> ListenerPhase {
        self.shared.phase()
    }

    /// How many registration cycles have completed (the initial one
    /// included). Grows by one per recovery from a lost-events signal
    /// or an unexpected stream failure.
    pub fn registration_count(&self) -> u64 {
        self.shared.registrations.load(Ordering::Relaxed)
    }

    /// Blocks until the session reaches `Listening` (true) or the
    /// timeout elapses (false). Useful right after spawning.
    pub fn wait_until_listening(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.shared.phase.lock().unwrap();
        loop {
            if *guard == Some(ListenerPhase::Listening) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            (guard, _) = self
                .shared
                .phase_changed
                .wait_timeout(guard, deadline - now)
                .unwrap();
        }
    }

    /// Forgets all retained records; takes effect for subsequently
    /// observed ones (a record racing with the reset is kept).
    pub fn reset(&self) {
        self.shared.index.reset();
    }

    pub fn has_event(&self, entity: &str, key: &str, value: &str) -> bool {
        self.shared.index.has_event(entity, key, value)
    }

    pub fn latest(&self, entity: &str, key: &str) -> Option<kstring::KString> {
        self.shared.index.latest(entity, key).map(|(value, _)| value)
    }

    /// Blocks until the latest record for `(entity, key)` equals
    /// `value` or the timeout elapses. Calling this before the
    /// session ever reached `Listening` is a programming mistake (the
    /// wait could never succeed) and fails loudly instead of
    /// reporting a timeout.
    pub fn wait_for(
        &self,
        entity: &str,
        key: &str,
        value: &str,
        timeout: Duration,
    ) -> Result<WaitOutcome, ListenError> {
        if !self.shared.ever_listening.load(Ordering::Relaxed) {
            return Err(ListenError::NeverListening);
        }
        Ok(self
            .shared
            .index
            .wait_for_value(entity, key, value, timeout, self.wait_step))
    }

    /// Signals the session to end. Best-effort: a push session parked
    /// inside the collaborator's blocking read ends at its next
    /// event, error, or lost-events signal; the polling variant ends
    /// within one poll interval.
    pub fn stop(&mut self) {
        self.shared.stop.store(true, Ordering::Relaxed);
        self.shared.phase_changed.notify_all();
        // Deliberately not joining: see above.
        drop(self.thread.take());
    }
}

impl Drop for EventListener {
    fn drop(&mut self) {
        self.stop();
    }
}

fn backoff_sleep(base: Duration) {
    if base.is_zero() {
        return;
    }
    let base_ms = base.as_millis() as u64;
    let jitter = rand::thread_rng().gen_range(0..=base_ms / 2);
    std::thread::sleep(base + Duration::from_millis(jitter));
}

/// Sleeps `total`, but wakes up early when the listener is stopped.
fn sleep_checking_stop(shared: &Shared, total: Duration) {
    let deadline = Instant::now() + total;
    loop {
        if shared.stopped() {
            return;
        }
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        std::thread::sleep((deadline - now).min(Duration::from_millis(50)));
    }
}

fn push_session(mut source: impl EventSource, opts: ListenerOpts, shared: Arc<Shared>) {
    let ListenerOpts {
        kinds,
        reregister_backoff,
        ..
    } = opts;
    'session: while !shared.stopped() {
        shared.set_phase(ListenerPhase::Registering);
        let mut stream = match source.subscribe(&kinds) {
            Ok(stream) => stream,
            Err(e) => {
                info!("event listener: subscribing failed, will retry: {e:#}");
                backoff_sleep(reregister_backoff);
                continue 'session;
            }
        };
        match source.poll_snapshot(&kinds) {
            Ok(records) => shared.index.apply_all(records),
            Err(e) => {
                info!("event listener: post-subscribe snapshot failed, re-registering: {e:#}");
                backoff_sleep(reregister_backoff);
                continue 'session;
            }
        }
        shared.registrations.fetch_add(1, Ordering::Relaxed);
        shared.ever_listening.store(true, Ordering::Relaxed);
        shared.set_phase(ListenerPhase::Listening);
        loop {
            if shared.stopped() {
                break 'session;
            }
            match stream.next_event() {
                Ok(change) => shared.index.apply_change(change),
                Err(StreamError::EventsLost) => {
                    info!("event listener: stream lost events, re-registering");
                    // Dropping the stream is the unsubscribe.
                    continue 'session;
                }
                Err(StreamError::Other(e)) => {
                    info!("event listener: stream failed, re-registering: {e:#}");
                    backoff_sleep(reregister_backoff);
                    continue 'session;
                }
            }
        }
    }
    shared.set_phase(ListenerPhase::Stopped);
}

fn polling_session(mut source: impl EventSource, opts: ListenerOpts, shared: Arc<Shared>) {
    let ListenerOpts {
        kinds,
        poll_interval,
        ..
    } = opts;
    let mut live = false;
    shared.set_phase(ListenerPhase::Registering);
    while !shared.stopped() {
        match source.poll_snapshot(&kinds) {
            Ok(records) => {
                shared.index.apply_all(records);
                if !live {
                    live = true;
                    shared.registrations.fetch_add(1, Ordering::Relaxed);
                    shared.ever_listening.store(true, Ordering::Relaxed);
                    shared.set_phase(ListenerPhase::Listening);
                }
            }
            Err(e) => {
                info!("event listener: state poll failed, will retry: {e:#}");
                live = false;
                shared.set_phase(ListenerPhase::Registering);
            }
        }
        sleep_checking_stop(&shared, poll_interval);
    }
    shared.set_phase(ListenerPhase::Stopped);
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use kstring::KString;
    use std::sync::mpsc;

    /// Snapshot-only source reading whatever the test put into the
    /// shared cell; `subscribe` is not available.
    struct SnapshotSource {
        cell: Arc<Mutex<Vec<EventRecord>>>,
    }

    impl EventSource for SnapshotSource {
        fn subscribe(&mut self, _kinds: &[EntityKind]) -> anyhow::Result<Box<dyn EventStream>> {
            Err(anyhow!("no push capability"))
        }

        fn poll_snapshot(&mut self, _kinds: &[EntityKind]) -> anyhow::Result<Vec<EventRecord>> {
            Ok(self.cell.lock().unwrap().clone())
        }
    }

    fn fast_opts() -> ListenerOpts {
        ListenerOpts {
            wait_step: Duration::from_millis(10),
            poll_interval: Duration::from_millis(10),
            reregister_backoff: Duration::from_millis(5),
            ..ListenerOpts::default()
        }
    }

    #[test]
    fn t_polling_listener_observes_and_resets() {
        let cell = Arc::new(Mutex::new(vec![EventRecord::now(
            "vm1",
            "power_state",
            "Running",
        )]));
        let mut listener = EventListener::spawn_polling(SnapshotSource { cell: cell.clone() }, fast_opts());
        assert!(listener.wait_until_listening(Duration::from_secs(5)));
        assert_eq!(
            listener.wait_for("vm1", "power_state", "Running", Duration::from_secs(5)),
            Ok(WaitOutcome::Observed)
        );
        assert!(listener.has_event("vm1", "power_state", "Running"));
        assert!(!listener.has_event("vm1", "power_state", "Halted"));

        // stop delivering, then reset: stays forgotten until a fresh
        // record arrives
        cell.lock().unwrap().clear();
        std::thread::sleep(Duration::from_millis(50));
        listener.reset();
        assert!(!listener.has_event("vm1", "power_state", "Running"));
        std::thread::sleep(Duration::from_millis(50));
        assert!(!listener.has_event("vm1", "power_state", "Running"));

        *cell.lock().unwrap() = vec![EventRecord::now("vm1", "power_state", "Running")];
        assert_eq!(
            listener.wait_for("vm1", "power_state", "Running", Duration::from_secs(5)),
            Ok(WaitOutcome::Observed)
        );
        listener.stop();
    }

    #[test]
    fn t_wait_for_before_listening_is_loud() {
        // subscribe always fails, so the session never becomes live
        struct NeverUp;
        impl EventSource for NeverUp {
            fn subscribe(&mut self, _: &[EntityKind]) -> anyhow::Result<Box<dyn EventStream>> {
                Err(anyhow!("unreachable backend"))
            }
            fn poll_snapshot(&mut self, _: &[EntityKind]) -> anyhow::Result<Vec<EventRecord>> {
                Err(anyhow!("unreachable backend"))
            }
        }
        let mut listener = EventListener::spawn_push(NeverUp, fast_opts());
        assert_eq!(
            listener.wait_for("vm1", "power_state", "Running", Duration::from_millis(10)),
            Err(ListenError::NeverListening)
        );
        listener.stop();
    }

    /// Push source scripted to report "events lost" on the first
    /// `lost` streams, then deliver one change and park until the
    /// test ends.
    struct LossySource {
        lost_remaining: usize,
        park: Option<mpsc::Receiver<()>>,
    }

    enum LossyStream {
        Lost,
        Deliver {
            sent: bool,
            park: Option<mpsc::Receiver<()>>,
        },
    }

    impl EventStream for LossyStream {
        fn next_event(&mut self) -> Result<EntityChange, StreamError> {
            match self {
                LossyStream::Lost => Err(StreamError::EventsLost),
                LossyStream::Deliver { sent, park } => {
                    if !*sent {
                        *sent = true;
                        return Ok(EntityChange {
                            entity: KString::from_static("vm1"),
                            attributes: vec![(
                                KString::from_static("power_state"),
                                KString::from_static("Running"),
                            )],
                        });
                    }
                    // park until the test drops the sender
                    if let Some(park) = park {
                        let _ = park.recv();
                    }
                    Err(StreamError::Other(anyhow!("stream closed")))
                }
            }
        }
    }

    impl EventSource for LossySource {
        fn subscribe(&mut self, _: &[EntityKind]) -> anyhow::Result<Box<dyn EventStream>> {
            if self.lost_remaining > 0 {
                self.lost_remaining -= 1;
                Ok(Box::new(LossyStream::Lost))
            } else {
                Ok(Box::new(LossyStream::Deliver {
                    sent: false,
                    park: self.park.take(),
                }))
            }
        }

        fn poll_snapshot(&mut self, _: &[EntityKind]) -> anyhow::Result<Vec<EventRecord>> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn t_lost_events_reregisters_exactly_n_times() {
        const LOST: usize = 3;
        let (keep_alive, park) = mpsc::channel();
        let mut listener = EventListener::spawn_push(
            LossySource {
                lost_remaining: LOST,
                park: Some(park),
            },
            fast_opts(),
        );
        assert!(listener.wait_until_listening(Duration::from_secs(5)));
        assert_eq!(
            listener.wait_for("vm1", "power_state", "Running", Duration::from_secs(5)),
            Ok(WaitOutcome::Observed)
        );
        // initial registration + one per lost-events signal, session
        // still alive
        assert_eq!(listener.registration_count(), (LOST + 1) as u64);
        assert_eq!(listener.phase(), ListenerPhase::Listening);
        listener.stop();
        drop(keep_alive);
    }
}
