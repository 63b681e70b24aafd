//! The explicit context handed to every handler invocation. Owns the
//! pieces handlers coordinate through (listener, controller,
//! measurement, the cross-worker map); there is no process-wide
//! mutable state anywhere in the engine.

use kstring::KString;

use crate::{
    concurrency::ConcurrencyController, listener::EventListener, measure::Measurement,
    utillib::shared_map::SharedMap,
};

pub struct SweepContext {
    /// Absent when the sweep does not observe live state (then
    /// `wait_for`-style coordination is the handlers' own business).
    pub listener: Option<EventListener>,
    pub controller: ConcurrencyController,
    pub measurement: Measurement,
    /// For data one worker routine produces and others consume, e.g.
    /// guest name to reported address.
    pub shared: SharedMap<KString, KString>,
}

impl SweepContext {
    pub fn new(measurement: Measurement, controller: ConcurrencyController) -> Self {
        Self {
            listener: None,
            controller,
            measurement,
            shared: SharedMap::new(),
        }
    }

    pub fn with_listener(mut self, listener: EventListener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Ends the listening session. Called by the driver when the run
    /// finishes, on the fatal path included.
    pub(crate) fn shutdown(&mut self) {
        if let Some(listener) = &mut self.listener {
            listener.stop();
        }
    }
}
