//! End-to-end sweep over a small simulated cluster: two hosts times
//! three guest counts, booted through the worker window, observed
//! through the polling listener, timed and reported. Wired up the
//! way a host process would do it, starting from a config file.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::anyhow;
use kstring::KString;
use sweeprun::{
    config_file::json5_from_str,
    listener::{EntityKind, EventRecord, EventSource, EventStream},
    ConcurrencyController, EventListener, ExperimentDriver, FnHandler, HandlerError,
    HandlerRegistry, ListenerPhase, Measurement, MemoryReporter, RunError, SweepConfig,
    SweepContext, WaitOutcome,
};

/// The "managed system": guests appear here when a boot worker is
/// done with them. The listener only ever sees it through snapshots.
type ClusterState = Arc<Mutex<BTreeMap<(String, String), String>>>;

struct ClusterSource {
    state: ClusterState,
}

impl EventSource for ClusterSource {
    fn subscribe(&mut self, _kinds: &[EntityKind]) -> anyhow::Result<Box<dyn EventStream>> {
        Err(anyhow!("this cluster has no push events"))
    }

    fn poll_snapshot(&mut self, _kinds: &[EntityKind]) -> anyhow::Result<Vec<EventRecord>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .iter()
            .map(|((entity, key), value)| EventRecord::now(entity, key, value))
            .collect())
    }
}

const CONFIG: &str = r#"
    {
        dimensions: [
            { name: "host", values: ["h1", "h2"] },
            { name: "vms", values: ["1", "2", "3"] },
        ],
        marker_dimension: "host",
        measurement: { labels: ["boot"], threshold_multiplier: 50 },
        worker_window: 2,
        poll_interval_ms: 10,
        wait_step_ms: 10,
        entity_kinds: ["vm"],
    }
"#;

#[test]
fn t_full_sweep_over_simulated_cluster() {
    let config: SweepConfig = json5_from_str(CONFIG).unwrap();
    config.check().unwrap();
    let space = config.space().unwrap();

    let cluster: ClusterState = Default::default();
    let listener = EventListener::spawn_polling(
        ClusterSource {
            state: cluster.clone(),
        },
        config.listener_opts(),
    );
    assert!(listener.wait_until_listening(Duration::from_secs(5)));

    let reporter = MemoryReporter::new();
    let measurement = Measurement::new(
        space.active_order(),
        config.measurement.clone(),
        Box::new(reporter.clone()),
    )
    .unwrap();
    let controller = ConcurrencyController::new(config.concurrency_opts());
    let cx = SweepContext::new(measurement, controller).with_listener(listener);

    let host_log: Arc<Mutex<Vec<String>>> = Default::default();
    let skipped: Arc<Mutex<Vec<String>>> = Default::default();

    let mut registry = HandlerRegistry::new();
    {
        let enter_log = host_log.clone();
        let exit_log = host_log.clone();
        registry
            .register(
                "host".parse().unwrap(),
                FnHandler::new(move |value, _point, cx| {
                    // a fresh listening window and address map per
                    // host visit
                    cx.listener.as_ref().unwrap().reset();
                    cx.shared.clear();
                    enter_log.lock().unwrap().push(format!("prepare {value}"));
                    Ok(())
                })
                .with_exit(move |value, _point, _cx| {
                    exit_log.lock().unwrap().push(format!("teardown {value}"));
                    Ok(())
                }),
            )
            .unwrap();
    }
    {
        let cluster = cluster.clone();
        let skipped = skipped.clone();
        registry
            .register(
                "vms".parse().unwrap(),
                FnHandler::new(move |value, point, cx| {
                    let n: usize = value
                        .as_str()
                        .parse()
                        .map_err(|e| HandlerError::fatal(anyhow!("bad vms value: {e}")))?;
                    let host = point.get(0).unwrap().as_str().to_string();
                    let calibrating = value.as_str() == "1";
                    if !calibrating && !cx.measurement.measuring_enabled() {
                        skipped.lock().unwrap().push(point.coordinate_string());
                        return Ok(());
                    }
                    cx.measurement.start(point).map_err(HandlerError::fatal)?;

                    let items: Vec<(String, String)> = (0..n)
                        .map(|i| {
                            let guest = format!("{host}-vm{i}");
                            (guest.clone(), guest)
                        })
                        .collect();
                    let set = {
                        let cluster = cluster.clone();
                        let addresses = cx.shared.clone();
                        cx.controller.run_bounded(items, move |index, guest, _handle| {
                            // the slow remote operation
                            std::thread::sleep(Duration::from_millis(5));
                            addresses.insert(
                                KString::from_string(guest.clone()),
                                KString::from_string(format!("10.0.0.{index}")),
                            );
                            cluster
                                .lock()
                                .unwrap()
                                .insert((guest, "power_state".into()), "Running".into());
                            Ok(())
                        })
                    };
                    let reports = set.join_all(Duration::from_secs(10));
                    if !reports.iter().all(|report| report.is_completed()) {
                        return Err(HandlerError::recoverable(anyhow!(
                            "a boot worker failed on host {host}"
                        )));
                    }

                    let listener = cx.listener.as_ref().unwrap();
                    for i in 0..n {
                        let guest = format!("{host}-vm{i}");
                        match listener
                            .wait_for(&guest, "power_state", "Running", Duration::from_secs(5))
                            .map_err(HandlerError::fatal)?
                        {
                            WaitOutcome::Observed => {}
                            WaitOutcome::TimedOut => {
                                return Err(HandlerError::recoverable(anyhow!(
                                    "guest {guest} never reported Running"
                                )))
                            }
                        }
                        // the boot worker shares the address it saw
                        if cx.shared.get(&KString::from_ref(&guest)).is_none() {
                            return Err(HandlerError::recoverable(anyhow!(
                                "guest {guest} reported no address"
                            )));
                        }
                    }

                    if calibrating {
                        cx.measurement
                            .stop_calibrating(point, "boot")
                            .map_err(HandlerError::fatal)?;
                    } else {
                        cx.measurement
                            .stop(point, "boot")
                            .map_err(HandlerError::fatal)?;
                    }
                    Ok(())
                }),
            )
            .unwrap();
    }

    let mut driver = ExperimentDriver::new(&space, registry, cx);
    let summary = driver.run().unwrap();

    assert_eq!(summary.points_visited, 6);
    assert!(summary.is_clean(), "failures: {:?}", summary.failures);
    assert!(skipped.lock().unwrap().is_empty());

    // marker widening re-announces the host on every guest-count
    // change
    let calls = host_log.lock().unwrap().clone();
    assert_eq!(
        calls,
        [
            "prepare h1",
            "teardown h1",
            "prepare h1",
            "teardown h1",
            "prepare h1",
            "teardown h1",
            "prepare h2",
            "teardown h2",
            "prepare h2",
            "teardown h2",
            "prepare h2",
            "teardown h2",
        ]
    );

    // header first, then one row per point
    let lines = reporter.measurement_lines();
    assert_eq!(lines.len(), 1 + 6);
    assert_eq!(lines[0], "TIMESTAMP\tboot\thost\tvms");
    let last_cells: Vec<&str> = lines[6].split('\t').collect();
    assert_eq!(&last_cells[2..], &["h2", "3"]);

    // every guest of the biggest configuration came up
    let cluster = cluster.lock().unwrap();
    for host in ["h1", "h2"] {
        for i in 0..3 {
            assert_eq!(
                cluster.get(&(format!("{host}-vm{i}"), "power_state".into())),
                Some(&"Running".to_string())
            );
        }
    }
}

#[test]
fn t_fatal_failure_still_stops_listener_session() {
    let config: SweepConfig = json5_from_str(CONFIG).unwrap();
    let space = config.space().unwrap();

    let cluster: ClusterState = Default::default();
    let listener = EventListener::spawn_polling(
        ClusterSource {
            state: cluster.clone(),
        },
        config.listener_opts(),
    );
    assert!(listener.wait_until_listening(Duration::from_secs(5)));

    let reporter = MemoryReporter::new();
    let measurement = Measurement::new(
        space.active_order(),
        config.measurement.clone(),
        Box::new(reporter.clone()),
    )
    .unwrap();
    let cx = SweepContext::new(measurement, ConcurrencyController::default())
        .with_listener(listener);

    let mut registry = HandlerRegistry::new();
    registry
        .register("host".parse().unwrap(), FnHandler::new(|_, _, _| Ok(())))
        .unwrap();
    registry
        .register(
            "vms".parse().unwrap(),
            FnHandler::new(|value, _point, _cx| {
                if value.as_str() == "2" {
                    Err(HandlerError::fatal(anyhow!("storage backend wedged")))
                } else {
                    Ok(())
                }
            }),
        )
        .unwrap();

    let mut driver = ExperimentDriver::new(&space, registry, cx);
    let err = driver.run().err().unwrap();
    assert!(matches!(err, RunError::Fatal { .. }));

    // cleanup on the fatal path: the session thread winds down
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    loop {
        let phase = driver.context().listener.as_ref().unwrap().phase();
        if phase == ListenerPhase::Stopped {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "listener still in phase {phase}"
        );
        std::thread::sleep(Duration::from_millis(10));
    }
}
