//! The top-level sweep loop: walk the enumerated points, announce
//! each changed dimension to its handler, and give every entered
//! dimension a final exit notification after the last point. A
//! single pass, no re-entrancy, no pause/resume.

use crate::{
    dimension::{ConfigurationError, DimValue, DimensionName, DimensionSpace},
    info,
    point::{CoordinateDiff, Point, PointEnumerator},
};

use super::{
    context::SweepContext,
    handler::{HandlerError, HandlerRegistry},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum DriverPhase {
    NotStarted,
    Running,
    Finished,
}

/// One recoverable handler failure, kept so a run that limps through
/// still reports which configuration points it wrote off.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct FailureRecord {
    pub dimension: DimensionName,
    /// The value being entered or exited when the handler failed.
    pub value: DimValue,
    pub point: String,
    pub message: String,
}

#[derive(Debug, Default, serde::Serialize)]
pub struct RunSummary {
    pub points_visited: usize,
    pub failures: Vec<FailureRecord>,
}

impl RunSummary {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error("fatal failure in dimension {dimension}, value {value}, at point [{point}]: {cause:#}")]
    Fatal {
        dimension: DimensionName,
        value: DimValue,
        point: String,
        cause: anyhow::Error,
    },
}

pub struct ExperimentDriver {
    enumerator: PointEnumerator,
    handlers: HandlerRegistry,
    cx: SweepContext,
    phase: DriverPhase,
}

impl ExperimentDriver {
    pub fn new(space: &DimensionSpace, handlers: HandlerRegistry, cx: SweepContext) -> Self {
        Self {
            enumerator: PointEnumerator::from_space(space),
            handlers,
            cx,
            phase: DriverPhase::NotStarted,
        }
    }

    pub fn phase(&self) -> DriverPhase {
        self.phase
    }

    pub fn context(&self) -> &SweepContext {
        &self.cx
    }

    pub fn context_mut(&mut self) -> &mut SweepContext {
        &mut self.cx
    }

    /// Runs the whole sweep: enumerate, dispatch every diff, then the
    /// teardown pass. Recoverable handler failures are logged,
    /// recorded in the summary and skipped over; a fatal one stops
    /// the run immediately (the summary so far is lost to the caller,
    /// the listener session is still shut down cleanly).
    pub fn run(&mut self) -> Result<RunSummary, RunError> {
        if self.phase != DriverPhase::NotStarted {
            return Err(ConfigurationError::AlreadyRan.into());
        }
        self.handlers.check_covers(self.enumerator.active_order())?;
        self.phase = DriverPhase::Running;

        let mut summary = RunSummary::default();
        let result = self.run_points(&mut summary);
        // also on the fatal path: never leave the session thread
        // behind
        self.cx.shutdown();
        self.phase = DriverPhase::Finished;
        result.map(|()| summary)
    }

    fn run_points(&mut self, summary: &mut RunSummary) -> Result<(), RunError> {
        let points = self.enumerator.points();
        info!(
            "sweeping {} points over dimensions [{}]",
            points.len(),
            self.enumerator
                .active_order()
                .iter()
                .map(|name| name.as_str())
                .collect::<Vec<_>>()
                .join(", "),
        );
        let mut prev: Option<&Point> = None;
        for point in &points {
            let diffs = match prev {
                None => self.enumerator.entering(point),
                Some(prev) => {
                    let diffs = self.enumerator.diff(prev, point);
                    self.enumerator.widen_to_leftmost_changed(diffs, prev, point)
                }
            };
            self.dispatch(&diffs, point, summary)?;
            summary.points_visited += 1;
            prev = Some(point);
        }
        if let Some(last) = points.last() {
            // teardown: every dimension gets a final exit
            // notification, innermost first
            let diffs = self.enumerator.exiting(last);
            self.dispatch(&diffs, last, summary)?;
        }
        Ok(())
    }

    /// Announces one diff list in order. For each entry the old value
    /// (when present) is exited before the new one (when present) is
    /// entered.
    fn dispatch(
        &mut self,
        diffs: &[CoordinateDiff],
        point: &Point,
        summary: &mut RunSummary,
    ) -> Result<(), RunError> {
        for diff in diffs {
            if let Some(prev_value) = &diff.prev {
                self.invoke(diff, prev_value, point, summary, true)?;
            }
            if let Some(next_value) = &diff.next {
                self.invoke(diff, next_value, point, summary, false)?;
            }
        }
        Ok(())
    }

    fn invoke(
        &mut self,
        diff: &CoordinateDiff,
        value: &DimValue,
        point: &Point,
        summary: &mut RunSummary,
        exiting: bool,
    ) -> Result<(), RunError> {
        let Some(handler) = self.handlers.get_mut(&diff.name) else {
            // can't happen after check_covers; diffs only name active
            // dimensions
            return Ok(());
        };
        let result = if exiting {
            handler.exit(value, point, &mut self.cx)
        } else {
            handler.enter(value, point, &mut self.cx)
        };
        match result {
            Ok(()) => Ok(()),
            Err(HandlerError::Recoverable(e)) => {
                info!(
                    "dimension {} {} value {} at point [{point}] failed, continuing: {e:#}",
                    diff.name,
                    if exiting { "exiting" } else { "entering" },
                    value,
                );
                summary.failures.push(FailureRecord {
                    dimension: diff.name.clone(),
                    value: value.clone(),
                    point: point.coordinate_string(),
                    message: format!("{e:#}"),
                });
                Ok(())
            }
            Err(HandlerError::Fatal(cause)) => Err(RunError::Fatal {
                dimension: diff.name.clone(),
                value: value.clone(),
                point: point.coordinate_string(),
                cause,
            }),
        }
    }
}
