use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::time::Duration;

use agentvisor::{DesiredState, PortsConfig, ProcessParams, Status, Supervisor, SupervisorConfig};
use tempfile::TempDir;

const EXPORTER: &str = r#"#!/bin/sh
if [ "$1" = "--version" ]; then
    echo "fake_exporter, version 1.2.3 (branch: HEAD)"
    exit 0
fi
exec /bin/sleep 100
"#;

#[tokio::test]
async fn exporter_version_is_reported_with_status_and_list() {
    let tmp = TempDir::new().unwrap();
    let bin = tmp.path().join("fake_exporter");
    std::fs::write(&bin, EXPORTER).unwrap();
    std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755)).unwrap();

    let cfg = SupervisorConfig {
        ports: PortsConfig {
            min: 65080,
            max: 65089,
            reserved: Vec::new(),
        },
        running_after: Duration::from_millis(200),
        kill_after: Duration::from_secs(2),
        start_wait: Duration::from_secs(5),
        temp_dir: tmp.path().join("tmp"),
        exec_paths: HashMap::from([("fake".to_string(), bin.clone())]),
        version_patterns: HashMap::from([(
            "fake".to_string(),
            "fake_exporter, version ([!-~]*)".to_string(),
        )]),
        ..SupervisorConfig::default()
    };
    let (sup, mut outlet) = Supervisor::builder(cfg).build();

    let desired = DesiredState {
        processes: HashMap::from([(
            "p1".to_string(),
            ProcessParams {
                kind: "fake".into(),
                ..ProcessParams::default()
            },
        )]),
        ..DesiredState::default()
    };
    let report = sup.set_state(desired).await.unwrap();
    assert!(report.is_ok(), "{:?}", report.failed);

    let ev = tokio::time::timeout(Duration::from_secs(10), outlet.changes.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ev.status, Status::Starting);
    assert_eq!(ev.version.as_deref(), Some("1.2.3"));

    let list = sup.workers_list().await;
    assert_eq!(list[0].version.as_deref(), Some("1.2.3"));

    sup.shutdown();
    sup.wait_stopped().await;
}
