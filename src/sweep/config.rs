//! Direct representation of a sweep config file, plus the checks
//! that turn a parsed file into something the driver accepts.

use std::{num::NonZeroUsize, path::PathBuf, time::Duration};

use anyhow::Result;
use kstring::KString;

use crate::{
    concurrency::ConcurrencyOpts,
    config_file::LoadConfigFile,
    dimension::{ConfigurationError, Dimension, DimensionName, DimensionSpace},
    listener::ListenerOpts,
    measure::MeasurementOpts,
};

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_wait_step_ms() -> u64 {
    100
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SweepConfig {
    /// Declaration order is traversal order: first = slowest-varying
    /// (most expensive to change), last = fastest-varying.
    pub dimensions: Vec<Dimension>,

    /// The coarse dimension whose handler is re-invoked whenever
    /// anything beneath it changes. At most one; the tie-break
    /// between several coarse axes is deliberately unsupported.
    #[serde(default)]
    pub marker_dimension: Option<DimensionName>,

    #[serde(default)]
    pub measurement: MeasurementOpts,

    /// At most this many workers in flight per `run_bounded` call;
    /// absent means start everything, staggered by
    /// `worker_start_delay_ms`.
    #[serde(default)]
    pub worker_window: Option<NonZeroUsize>,

    #[serde(default)]
    pub worker_start_delay_ms: u64,

    /// Polling listener variant only.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Minimum sleep increment between `wait_for` checks.
    #[serde(default = "default_wait_step_ms")]
    pub wait_step_ms: u64,

    /// Entity kinds the listener subscribes to / polls for.
    #[serde(default)]
    pub entity_kinds: Vec<KString>,
}

impl SweepConfig {
    pub fn check(&self) -> Result<(), ConfigurationError> {
        if self.wait_step_ms == 0 {
            return Err(ConfigurationError::ZeroWaitStep);
        }
        self.measurement.check()?;
        // dimension and marker consistency
        let _ = self.space()?;
        Ok(())
    }

    pub fn space(&self) -> Result<DimensionSpace, ConfigurationError> {
        DimensionSpace::new(self.dimensions.clone(), self.marker_dimension.clone())
    }

    pub fn concurrency_opts(&self) -> ConcurrencyOpts {
        ConcurrencyOpts {
            window_size: self.worker_window,
            start_delay: Duration::from_millis(self.worker_start_delay_ms),
        }
    }

    pub fn listener_opts(&self) -> ListenerOpts {
        ListenerOpts {
            kinds: self.entity_kinds.clone(),
            wait_step: Duration::from_millis(self.wait_step_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            ..ListenerOpts::default()
        }
    }
}

impl LoadConfigFile for SweepConfig {
    fn default_config_path_without_suffix() -> Result<Option<PathBuf>> {
        // A library has no business guessing a location; the host
        // passes an explicit path or builds the config in code.
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_file::json5_from_str;

    const CONFIG: &str = r#"
        {
            dimensions: [
                { name: "host", values: ["h1", "h2"] },
                { name: "storage", values: ["lvm", "ext"] },
                { name: "vms", values: ["1", "5", "10"] },
            ],
            marker_dimension: "host",
            worker_window: 2,
            entity_kinds: ["vm"],
        }
    "#;

    #[test]
    fn t_load_and_defaults() {
        let config: SweepConfig = json5_from_str(CONFIG).unwrap();
        config.check().unwrap();
        assert_eq!(config.poll_interval_ms, 1000);
        assert_eq!(config.wait_step_ms, 100);
        assert_eq!(config.measurement, MeasurementOpts::default());
        let space = config.space().unwrap();
        assert_eq!(space.active_order().len(), 3);
        assert_eq!(
            config.concurrency_opts().window_size,
            Some(NonZeroUsize::new(2).unwrap())
        );
    }

    #[test]
    fn t_unknown_field_is_rejected() {
        let err = json5_from_str::<SweepConfig>(r#"{ dimensions: [], queue_depth: 3 }"#)
            .err()
            .unwrap();
        assert!(format!("{err}").contains("queue_depth"), "got: {err}");
    }

    #[test]
    fn t_check_rejects_bad_knobs() {
        let mut config: SweepConfig = json5_from_str(CONFIG).unwrap();
        config.wait_step_ms = 0;
        assert_eq!(config.check(), Err(ConfigurationError::ZeroWaitStep));

        let mut config: SweepConfig = json5_from_str(CONFIG).unwrap();
        config.measurement.threshold_multiplier = 0.5;
        assert!(matches!(
            config.check(),
            Err(ConfigurationError::InvalidThresholdMultiplier { .. })
        ));

        let mut config: SweepConfig = json5_from_str(CONFIG).unwrap();
        config.marker_dimension = Some("nope".parse().unwrap());
        assert!(matches!(
            config.check(),
            Err(ConfigurationError::UnknownMarkerDimension { .. })
        ));
    }

    #[test]
    fn t_load_config_explicit_path_and_fallback() {
        let dir =
            std::env::temp_dir().join(format!("sweeprun-config-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("sweep.json5");
        std::fs::write(&path, CONFIG).unwrap();
        let config = SweepConfig::load_config(Some(&path), |_| unreachable!()).unwrap();
        assert_eq!(config.dimensions.len(), 3);

        // without a path there is no default location either; the
        // fallback decides
        let fallback = SweepConfig::load_config(None::<&std::path::Path>, |message| {
            assert!(message.contains("no default"), "got: {message}");
            json5_from_str(CONFIG)
        })
        .unwrap();
        assert_eq!(fallback, config);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn t_ron_dump_roundtrips_nothing_lost() {
        let config: SweepConfig = json5_from_str(CONFIG).unwrap();
        let dump = crate::config_file::ron_to_string_pretty(&config).unwrap();
        assert!(dump.contains("marker_dimension"));
    }
}
