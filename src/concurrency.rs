//! Bounding how many slow remote operations are in flight at once.
//! The managed system's operations (VM power-on, guest login) take
//! tens of seconds each and dominate a sweep's runtime; the
//! controller keeps a fixed number of them overlapping instead of
//! running them back to back, while keeping the number predictable.
//!
//! Cancellation is best-effort throughout: `join_all` reports workers
//! that outlive the timeout as timed out and raises their
//! cancellation flag, but never kills them; the shared abort-further
//! flag is only consulted at worker-start boundaries.

use std::{
    num::NonZeroUsize,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex, MutexGuard,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use anyhow::Result;

use crate::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcurrencyOpts {
    /// With a window, at most this many workers run at once and
    /// starts happen as slots free up. Without one, all workers are
    /// launched immediately, each beginning after `index *
    /// start_delay` so start order is preserved in time.
    pub window_size: Option<NonZeroUsize>,
    pub start_delay: Duration,
}

impl Default for ConcurrencyOpts {
    fn default() -> Self {
        Self {
            window_size: None,
            start_delay: Duration::ZERO,
        }
    }
}

/// How one worker ended. Timeouts are reported values, not panics or
/// errors of the controller itself.
#[derive(Debug)]
pub enum WorkerOutcome {
    Completed,
    Failed(anyhow::Error),
    /// Still running when `join_all`'s deadline passed; its
    /// cancellation flag has been raised but the thread was left
    /// alone.
    TimedOut,
    /// Never started because the abort-further flag was set first.
    NotStarted,
}

#[derive(Debug)]
pub struct WorkerReport {
    pub label: String,
    pub outcome: WorkerOutcome,
}

impl WorkerReport {
    pub fn is_completed(&self) -> bool {
        matches!(self.outcome, WorkerOutcome::Completed)
    }
}

/// Passed to each worker; the only channel back into the controller.
pub struct WorkerHandle {
    cancel: Arc<AtomicBool>,
    abort: Arc<AtomicBool>,
}

impl WorkerHandle {
    /// True once `join_all` gave up on this worker. Long-running
    /// workers should poll this at convenient boundaries.
    pub fn cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// Prevents any not-yet-started sibling from starting, e.g.
    /// because a dependency installation failed. Already-running
    /// workers run to completion.
    pub fn abort_further(&self) {
        self.abort.store(true, Ordering::Relaxed);
    }
}

#[derive(Debug)]
enum SlotState {
    Pending,
    Running,
    Finished(Result<()>),
    NotStarted,
    Taken,
}

struct Inner {
    states: Vec<SlotState>,
    in_flight: usize,
}

struct SetShared {
    inner: Mutex<Inner>,
    changed: Condvar,
}

impl SetShared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    fn finish(&self, index: usize, marked_in_flight: bool, result: Result<()>) {
        let mut inner = self.lock();
        if marked_in_flight {
            inner.in_flight -= 1;
        }
        inner.states[index] = SlotState::Finished(result);
        drop(inner);
        self.changed.notify_all();
    }

    fn mark_not_started(&self, index: usize) {
        self.lock().states[index] = SlotState::NotStarted;
        self.changed.notify_all();
    }
}

/// The workers launched by one `run_bounded` call. Consume with
/// `join_all`.
pub struct WorkerSet {
    shared: Arc<SetShared>,
    abort: Arc<AtomicBool>,
    labels: Vec<String>,
    cancels: Vec<Arc<AtomicBool>>,
    handles: Vec<Option<JoinHandle<()>>>,
}

#[derive(Debug, Clone, Default)]
pub struct ConcurrencyController {
    opts: ConcurrencyOpts,
}

impl ConcurrencyController {
    pub fn new(opts: ConcurrencyOpts) -> Self {
        Self { opts }
    }

    pub fn opts(&self) -> &ConcurrencyOpts {
        &self.opts
    }

    /// Launches one worker per `(label, item)`. With a window
    /// configured this blocks until the last worker has been started
    /// (or starting was aborted); without one it returns after
    /// spawning everything. Workers report success/failure
    /// independently; one failure does not cancel the others.
    pub fn run_bounded<T, F>(&self, items: Vec<(String, T)>, worker: F) -> WorkerSet
    where
        T: Send + 'static,
        F: Fn(usize, T, &WorkerHandle) -> Result<()> + Send + Sync + 'static,
    {
        let count = items.len();
        let shared = Arc::new(SetShared {
            inner: Mutex::new(Inner {
                states: (0..count).map(|_| SlotState::Pending).collect(),
                in_flight: 0,
            }),
            changed: Condvar::new(),
        });
        let abort = Arc::new(AtomicBool::new(false));
        let worker = Arc::new(worker);
        let mut labels = Vec::with_capacity(count);
        let mut cancels = Vec::with_capacity(count);
        let mut handles = Vec::with_capacity(count);

        for (index, (label, item)) in items.into_iter().enumerate() {
            let cancel = Arc::new(AtomicBool::new(false));
            labels.push(label);
            cancels.push(cancel.clone());

            if let Some(window) = self.opts.window_size {
                // window gate: wait for a slot, then account for the
                // worker before its thread even runs, so the bound
                // holds at every instant
                let mut inner = shared.lock();
                while inner.in_flight >= window.get() && !abort.load(Ordering::Relaxed) {
                    inner = shared.changed.wait(inner).unwrap();
                }
                if abort.load(Ordering::Relaxed) {
                    inner.states[index] = SlotState::NotStarted;
                    drop(inner);
                    handles.push(None);
                    continue;
                }
                inner.states[index] = SlotState::Running;
                inner.in_flight += 1;
                drop(inner);

                let shared = shared.clone();
                let abort = abort.clone();
                let worker = worker.clone();
                handles.push(Some(std::thread::spawn(move || {
                    let handle = WorkerHandle { cancel, abort };
                    let result = worker(index, item, &handle);
                    shared.finish(index, true, result);
                })));
            } else {
                let initial_delay = self.opts.start_delay * index as u32;
                let shared = shared.clone();
                let abort = abort.clone();
                let worker = worker.clone();
                handles.push(Some(std::thread::spawn(move || {
                    if !initial_delay.is_zero() {
                        std::thread::sleep(initial_delay);
                    }
                    // begin boundary: the only place the abort flag
                    // is honored
                    if abort.load(Ordering::Relaxed) {
                        shared.mark_not_started(index);
                        return;
                    }
                    shared.lock().states[index] = SlotState::Running;
                    let handle = WorkerHandle { cancel, abort };
                    let result = worker(index, item, &handle);
                    shared.finish(index, false, result);
                })));
            }
        }

        WorkerSet {
            shared,
            abort,
            labels,
            cancels,
            handles,
        }
    }
}

impl WorkerSet {
    /// Sets the shared abort-further flag; no new workers will start.
    pub fn abort_further(&self) {
        self.abort.store(true, Ordering::Relaxed);
        self.shared.changed.notify_all();
    }

    pub fn aborted(&self) -> bool {
        self.abort.load(Ordering::Relaxed)
    }

    /// Waits for all outstanding workers until the deadline. Workers
    /// still running then are reported `TimedOut` and signalled to
    /// cancel, but not killed.
    pub fn join_all(mut self, timeout: Duration) -> Vec<WorkerReport> {
        let deadline = Instant::now() + timeout;
        {
            let mut inner = self.shared.lock();
            while inner
                .states
                .iter()
                .any(|state| matches!(state, SlotState::Pending | SlotState::Running))
            {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                (inner, _) = self
                    .shared
                    .changed
                    .wait_timeout(inner, deadline - now)
                    .unwrap();
            }
        }

        let mut finished = Vec::with_capacity(self.labels.len());
        {
            let mut inner = self.shared.lock();
            for (index, state) in inner.states.iter_mut().enumerate() {
                let outcome = match std::mem::replace(state, SlotState::Taken) {
                    SlotState::Finished(Ok(())) => WorkerOutcome::Completed,
                    SlotState::Finished(Err(e)) => WorkerOutcome::Failed(e),
                    SlotState::NotStarted => WorkerOutcome::NotStarted,
                    SlotState::Pending | SlotState::Running => {
                        self.cancels[index].store(true, Ordering::Relaxed);
                        info!(
                            "worker {:?} exceeded the join timeout, \
                             reporting as timed out and leaving it behind",
                            self.labels[index]
                        );
                        WorkerOutcome::TimedOut
                    }
                    SlotState::Taken => unreachable!("states are taken exactly once"),
                };
                finished.push(outcome);
            }
        }

        let mut reports = Vec::with_capacity(self.labels.len());
        let labels = std::mem::take(&mut self.labels);
        let handles = std::mem::take(&mut self.handles);
        for ((label, outcome), handle) in labels.into_iter().zip(finished).zip(handles) {
            // reap the threads that are done; detach the timed-out
            // ones
            if !matches!(outcome, WorkerOutcome::TimedOut) {
                if let Some(handle) = handle {
                    let _ = handle.join();
                }
            }
            reports.push(WorkerReport { label, outcome });
        }
        reports
    }
}
