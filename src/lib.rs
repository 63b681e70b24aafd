//! A configuration-sweep experiment orchestrator: enumerate every
//! combination of named configuration dimensions, visit them in an
//! order that keeps expensive-to-change dimensions stable for as long
//! as possible, announce each change to per-dimension handlers, and
//! give those handlers the tools the long-running parts need--timing
//! with a calibration circuit breaker, a bounded worker window for
//! slow remote operations, and a listener on the managed system's
//! live state-change stream that survives disconnects.
//!
//! The crate is a library: hosts supply the dimension handlers and
//! the collaborator capabilities (`EventSource`, `Reporter`) and call
//! `ExperimentDriver::run`.

pub mod concurrency;
pub mod config_file;
pub mod dimension;
pub mod listener;
pub mod measure;
pub mod point;
pub mod report;
pub mod sweep;
pub mod utillib;

pub use concurrency::{
    ConcurrencyController, ConcurrencyOpts, WorkerHandle, WorkerOutcome, WorkerReport, WorkerSet,
};
pub use dimension::{ConfigurationError, DimValue, Dimension, DimensionName, DimensionSpace};
pub use listener::{
    EventListener, EventRecord, EventSource, EventStream, ListenError, ListenerOpts,
    ListenerPhase, StreamError, WaitOutcome,
};
pub use measure::{Measurement, MeasurementOpts, MeasurementSample};
pub use point::{CoordinateDiff, Point, PointEnumerator};
pub use report::{FileReporter, MemoryReporter, Reporter};
pub use sweep::{
    config::SweepConfig,
    context::SweepContext,
    driver::{DriverPhase, ExperimentDriver, FailureRecord, RunError, RunSummary},
    handler::{DimensionHandler, FnHandler, HandlerError, HandlerRegistry, HandlerResult},
};
