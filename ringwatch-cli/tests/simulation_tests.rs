#![allow(missing_docs)]
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::time::Duration;

use ringwatch_cli::config::{SimulationConfig, TransportKind};
use ringwatch_cli::simulation::run_simulation;
use ringwatch_core::MembershipConfig;

fn fast_membership() -> MembershipConfig {
    let mut config = MembershipConfig::default();
    config.probe.interval = Duration::from_millis(100);
    config.probe.timeout = Duration::from_millis(50);
    config.probe.miss_window = Duration::from_secs(2);
    config.gossip.interval = Duration::from_millis(50);
    config.table.refresh_interval = Duration::from_millis(500);
    config
}

#[tokio::test(start_paused = true)]
async fn local_simulation_reports_the_killed_silo() {
    let settings = SimulationConfig {
        silos: 4,
        ..SimulationConfig::default()
    };
    let report = run_simulation(&MembershipConfig::default(), &settings, 2)
        .await
        .expect("simulation");

    assert_eq!(report.transport, TransportKind::Local);
    assert_eq!(report.victim.endpoint.port(), settings.base_port + 2);
    assert_eq!(report.survivors.len(), 3);
    assert!(!report.survivors.contains(&report.victim));
    assert_eq!(report.gateways.len(), 3);
    assert!(report.gateways.iter().all(|entry| entry.silo != report.victim));
    assert!(report.detection_time < settings.detection_timeout);
}

#[tokio::test(start_paused = true)]
async fn two_silo_cluster_still_detects_a_crash() {
    let settings = SimulationConfig {
        silos: 2,
        base_port: 41_100,
        ..SimulationConfig::default()
    };
    let report = run_simulation(&MembershipConfig::default(), &settings, 0)
        .await
        .expect("simulation");
    assert_eq!(report.survivors.len(), 1);
    assert_eq!(report.gateways.len(), 1);
}

#[tokio::test]
async fn out_of_range_victim_is_rejected() {
    let settings = SimulationConfig::default();
    let err = run_simulation(&MembershipConfig::default(), &settings, settings.silos)
        .await
        .expect_err("kill index past the cluster");
    assert!(err.to_string().contains("cannot kill silo"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial_test::serial]
async fn udp_simulation_detects_a_silent_silo() {
    let settings = SimulationConfig {
        silos: 3,
        base_port: 41_200,
        transport: TransportKind::Udp,
        settle_timeout: Duration::from_secs(10),
        detection_timeout: Duration::from_secs(20),
    };
    let report = run_simulation(&fast_membership(), &settings, 1)
        .await
        .expect("simulation");
    assert_eq!(report.transport, TransportKind::Udp);
    assert_eq!(report.survivors.len(), 2);
    assert!(report.gateways.iter().all(|entry| entry.silo != report.victim));
}
