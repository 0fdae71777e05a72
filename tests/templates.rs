//! Demo templates rebuilt, checked and run in-process.

use rust_daq_protocol::config::EngineConfig;
use rust_daq_protocol::database::TaskDatabase;
use rust_daq_protocol::instrument::{DriverRegistry, InstrumentPool};
use rust_daq_protocol::monitor::{link_monitor, MonitorRule, TextMonitor};
use rust_daq_protocol::preferences::{load_template, save_template};
use rust_daq_protocol::tasks::{CheckOptions, RootContext, RootTask, TaskRegistry};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;

fn demo(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("demos").join(name)
}

fn demo_config() -> EngineConfig {
    let text = std::fs::read_to_string(demo("engine.toml")).expect("demo config");
    EngineConfig::from_toml(&text).expect("valid config")
}

fn build(template: &str, database: Arc<TaskDatabase>) -> RootTask {
    let config = demo_config();
    let instruments = Arc::new(InstrumentPool::new(
        Arc::new(DriverRegistry::new()),
        config.profiles,
    ));
    let context = Arc::new(RootContext::new(database, instruments));
    let template = load_template(&demo(template)).expect("demo template");
    TaskRegistry::new()
        .build_root(&template.preferences, context)
        .expect("tree")
}

#[test]
fn test_voltage_sweep_reads_back_last_value() {
    let database = Arc::new(TaskDatabase::new());
    let root = build("voltage_sweep.toml", database.clone());

    let report = root.check(&CheckOptions {
        test_instruments: true,
    });
    assert!(report.is_ok(), "{}", report);

    root.perform().expect("run");
    assert_eq!(database.get_value("root", "setup_max").unwrap(), json!(2.0));
    assert_eq!(database.get_value("root", "sweep_index").unwrap(), json!(4));
    assert_eq!(
        database.get_value("root/sweep", "read_value").unwrap(),
        json!(2.0)
    );
    assert!(!database.is_running());
}

#[test]
fn test_sequence_template_survives_save() {
    let database = Arc::new(TaskDatabase::new());
    let root = build("sequence.toml", database);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("copy.toml");
    save_template(&path, &root.preferences(), "Copy of the sequence demo.").unwrap();

    let copy = load_template(&path).unwrap();
    assert_eq!(copy.doc, "Copy of the sequence demo.");
    let rebuilt = TaskRegistry::new()
        .build_root(&copy.preferences, Arc::new(RootContext::default()))
        .unwrap();
    assert_eq!(rebuilt.preferences(), root.preferences());
}

#[test]
fn test_monitor_follows_in_process_run() {
    let database = Arc::new(TaskDatabase::new());
    let monitor = TextMonitor::with_rules(vec![
        MonitorRule::reject("loop counters", &["_index"]),
        MonitorRule::format(
            "readback",
            &["apply_value", "read_value"],
            "summary",
            "{apply_value} V -> {read_value} V",
            true,
        ),
    ])
    .into_handle();
    let root = build("voltage_sweep.toml", database.clone());
    link_monitor(&database, monitor.clone());

    root.perform().expect("run");

    let monitor = monitor.lock();
    assert!(!monitor.is_displayed("root/sweep_index"));
    assert!(monitor.is_displayed("root/sweep_value"));
    assert_eq!(
        monitor.entry("root/sweep/summary").expect("combined").value(),
        "2.0 V -> 2.0 V"
    );
}
