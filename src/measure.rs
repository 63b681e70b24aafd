//! Timing named operations per sweep point, the append-only sample
//! log, and the base-measurement circuit breaker.
//!
//! The breaker is a numeric policy, not a statistical one: the
//! innermost dimension's first value calibrates (exactly one sample),
//! every later sample is compared against `threshold_multiplier *
//! base`, and one sample over the line clears the base. While the
//! base is absent, `measuring_enabled` is false and handlers are
//! expected to skip the expensive work the measurement guards; only a
//! deliberate recalibration (the first value coming around again)
//! arms it anew.

use std::{
    collections::{BTreeMap, HashMap},
    time::{Duration, Instant},
};

use anyhow::{bail, Result};
use chrono::Local;
use itertools::Itertools;
use kstring::KString;

use crate::{
    dimension::{ConfigurationError, DimensionName},
    info,
    point::Point,
    report::Reporter,
};

/// Column separator of the measurement log rows.
const DELIMITER: char = '\t';

#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementSample {
    /// `Point::coordinate_string()` of the point the sample was taken
    /// at.
    pub coords: String,
    pub label: KString,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MeasurementOpts {
    /// The metric columns of the report, in column order. A row is
    /// flushed once every label has a sample for its point.
    pub labels: Vec<KString>,
    /// A later sample farther than this factor above the calibration
    /// sample trips the breaker. Must be finite and >= 1.0.
    pub threshold_multiplier: f64,
}

impl Default for MeasurementOpts {
    fn default() -> Self {
        Self {
            labels: vec![KString::from_static("elapsed")],
            threshold_multiplier: 3.0,
        }
    }
}

impl MeasurementOpts {
    pub fn check(&self) -> Result<(), ConfigurationError> {
        let value = self.threshold_multiplier;
        if !value.is_finite() || value < 1.0 {
            return Err(ConfigurationError::InvalidThresholdMultiplier { value });
        }
        Ok(())
    }
}

struct PendingRow {
    coordinate_values: Vec<KString>,
    cells: BTreeMap<KString, Duration>,
}

pub struct Measurement {
    labels: Vec<KString>,
    dimension_names: Vec<DimensionName>,
    threshold_multiplier: f64,
    reporter: Box<dyn Reporter>,
    header_written: bool,
    starts: HashMap<String, Instant>,
    pending: HashMap<String, PendingRow>,
    samples: Vec<MeasurementSample>,
    base: Option<Duration>,
}

impl std::fmt::Debug for Measurement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Measurement")
            .field("labels", &self.labels)
            .field("base", &self.base)
            .field("samples", &self.samples.len())
            .finish_non_exhaustive()
    }
}

impl Measurement {
    pub fn new(
        dimension_names: Vec<DimensionName>,
        opts: MeasurementOpts,
        reporter: Box<dyn Reporter>,
    ) -> Result<Self, ConfigurationError> {
        opts.check()?;
        let MeasurementOpts {
            labels,
            threshold_multiplier,
        } = opts;
        Ok(Self {
            labels,
            dimension_names,
            threshold_multiplier,
            reporter,
            header_written: false,
            starts: HashMap::new(),
            pending: HashMap::new(),
            samples: Vec::new(),
            base: None,
        })
    }

    /// False while the circuit breaker is tripped (or before the
    /// first calibration); handlers must then skip the work the
    /// measurement guards.
    pub fn measuring_enabled(&self) -> bool {
        self.base.is_some()
    }

    pub fn base(&self) -> Option<Duration> {
        self.base
    }

    pub fn samples(&self) -> &[MeasurementSample] {
        &self.samples
    }

    /// Records the start time for `point`. Exactly one `stop` (or
    /// `stop_calibrating`) consumes it; starting twice without
    /// stopping is a programming mistake and reported as an error.
    pub fn start(&mut self, point: &Point) -> Result<()> {
        let key = point.coordinate_string();
        if self.starts.contains_key(&key) {
            bail!("start called twice without stop for point {key:?}")
        }
        self.starts.insert(key, Instant::now());
        Ok(())
    }

    /// Elapsed time since the matching `start`; appends the sample,
    /// feeds the circuit breaker, and contributes to the point's
    /// report row.
    pub fn stop(&mut self, point: &Point, label: &str) -> Result<Duration> {
        let elapsed = self.take_start(point)?;
        self.record(point, label, elapsed)?;
        Ok(elapsed)
    }

    /// Like `stop`, but the result becomes the calibration sample.
    /// Only the handler for the innermost dimension's *first* value
    /// calls this; that is the deliberate recalibration event that
    /// re-arms a tripped breaker.
    pub fn stop_calibrating(&mut self, point: &Point, label: &str) -> Result<Duration> {
        let elapsed = self.take_start(point)?;
        self.record_calibration(point, label, elapsed)?;
        Ok(elapsed)
    }

    fn take_start(&mut self, point: &Point) -> Result<Duration> {
        let key = point.coordinate_string();
        match self.starts.remove(&key) {
            Some(start) => Ok(start.elapsed()),
            None => bail!("stop called without a matching start for point {key:?}"),
        }
    }

    /// Accepts an externally measured duration, e.g. one reported by
    /// the remote system itself.
    pub fn record(&mut self, point: &Point, label: &str, elapsed: Duration) -> Result<()> {
        if let Some(base) = self.base {
            if elapsed.as_secs_f64() > self.threshold_multiplier * base.as_secs_f64() {
                self.base = None;
                info!(
                    "measurement circuit breaker tripped at point {}: \
                     {label} took {elapsed:?}, more than {} x the base {base:?}",
                    point.coordinate_string(),
                    self.threshold_multiplier,
                );
            }
        }
        self.append(point, label, elapsed)
    }

    pub fn record_calibration(
        &mut self,
        point: &Point,
        label: &str,
        elapsed: Duration,
    ) -> Result<()> {
        self.base = Some(elapsed);
        self.append(point, label, elapsed)
    }

    fn append(&mut self, point: &Point, label: &str, elapsed: Duration) -> Result<()> {
        if !self.labels.iter().any(|l| l == label) {
            let valid = self.labels.iter().map(|l| format!("{l:?}")).join(", ");
            bail!("unknown measurement label {label:?} (valid are: {valid})")
        }
        let label = KString::from_ref(label);
        self.write_header_if_needed()?;
        let coords = point.coordinate_string();
        self.samples.push(MeasurementSample {
            coords: coords.clone(),
            label: label.clone(),
            elapsed,
        });
        let row = self.pending.entry(coords.clone()).or_insert_with(|| PendingRow {
            coordinate_values: point
                .values()
                .iter()
                .map(|value| KString::from_ref(value.as_str()))
                .collect(),
            cells: BTreeMap::new(),
        });
        row.cells.insert(label, elapsed);
        if row.cells.len() == self.labels.len() {
            self.write_row(&coords)?;
        }
        Ok(())
    }

    /// Writes the (possibly partial) report row for `point` if any
    /// samples were taken there. Normally rows are written as soon as
    /// every label has a value; this is for handlers that measured
    /// only a subset before moving on.
    pub fn flush(&mut self, point: &Point) -> Result<()> {
        let coords = point.coordinate_string();
        if self.pending.contains_key(&coords) {
            self.write_row(&coords)?;
        }
        Ok(())
    }

    fn write_header_if_needed(&mut self) -> Result<()> {
        if self.header_written {
            return Ok(());
        }
        let header = std::iter::once("TIMESTAMP")
            .chain(self.labels.iter().map(|label| label.as_str()))
            .chain(self.dimension_names.iter().map(|name| name.as_str()))
            .join(&DELIMITER.to_string());
        self.reporter.log_measurement(&header)?;
        self.header_written = true;
        Ok(())
    }

    fn write_row(&mut self, coords: &str) -> Result<()> {
        let Some(row) = self.pending.remove(coords) else {
            return Ok(());
        };
        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S%.3f").to_string();
        let line = std::iter::once(timestamp)
            .chain(self.labels.iter().map(|label| {
                row.cells
                    .get(label)
                    .map(|elapsed| format!("{:.6}", elapsed.as_secs_f64()))
                    .unwrap_or_default()
            }))
            .chain(row.coordinate_values.iter().map(|value| value.to_string()))
            .join(&DELIMITER.to_string());
        self.reporter.log_measurement(&line)
    }
}
