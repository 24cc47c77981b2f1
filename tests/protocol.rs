use chrono::Utc;
use pretty_assertions::assert_eq;
use signal_sync_bot::audit::MemoryAuditSink;
use signal_sync_bot::bus::{BusHead, DataBus, FileBus};
use signal_sync_bot::engine::demo::StaticAlpha;
use signal_sync_bot::engine::{AlphaRunner, TaskInput};
use signal_sync_bot::execution::PaperOrderSubsystem;
use signal_sync_bot::gateway::{CycleOutcome, ExecutionGateway, GatewayConfig, GatewayState};
use signal_sync_bot::metrics::SyncMetrics;
use signal_sync_bot::record::{SignalRecord, TargetRow};
use signal_sync_bot::state::StateStore;
use signal_sync_bot::types::{InstrumentId, Version};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

fn rows(rows: &[(&str, f64)]) -> Vec<TargetRow> {
    rows.iter().map(|(id, t)| TargetRow::new(*id, *t)).collect()
}

fn holdings(rows: &[(&str, f64)]) -> BTreeMap<InstrumentId, f64> {
    rows.iter().map(|(id, q)| (InstrumentId::from(*id), *q)).collect()
}

async fn publish(bus: &Arc<FileBus>, payload: &[(&str, f64)]) -> Version {
    let runner = AlphaRunner::new(
        Arc::new(StaticAlpha(rows(payload))),
        bus.clone(),
        Arc::new(MemoryAuditSink::default()),
        Arc::new(SyncMetrics::new()),
    );
    runner.run(TaskInput::now()).await.expect("publish").version
}

fn gateway(bus: &Arc<FileBus>, orders: &Arc<PaperOrderSubsystem>) -> ExecutionGateway {
    ExecutionGateway::new(bus.clone(), orders.clone(), GatewayConfig::default())
}

fn open_bus(dir: &Path) -> Arc<FileBus> {
    Arc::new(FileBus::open(dir.join("bus"), 3).unwrap())
}

#[tokio::test]
async fn end_to_end_rebalance_over_file_bus() {
    let dir = tempfile::tempdir().unwrap();
    let bus = open_bus(dir.path());
    let orders = Arc::new(PaperOrderSubsystem::new());
    let gateway = gateway(&bus, &orders);

    assert_eq!(gateway.on_tick().await, CycleOutcome::NoChange);

    assert_eq!(publish(&bus, &[("AAA", 0.6), ("BBB", 0.4)]).await, Version(1));
    assert_eq!(gateway.on_tick().await.applied_version(), Some(Version(1)));
    let state = gateway.execution_state().await;
    assert_eq!(state.last_applied_version, Some(Version(1)));
    assert_eq!(state.current_holdings, holdings(&[("AAA", 0.6), ("BBB", 0.4)]));

    assert_eq!(publish(&bus, &[("AAA", 0.3), ("CCC", 0.7)]).await, Version(2));
    let CycleOutcome::Applied { intents, .. } = gateway.on_tick().await else {
        panic!("version 2 was not applied");
    };
    let instruments: Vec<&str> = intents.iter().map(|i| i.instrument.as_str()).collect();
    assert_eq!(instruments, vec!["AAA", "BBB", "CCC"]);
    assert!((intents[0].delta + 0.3).abs() < 1e-12);
    assert!((intents[1].delta + 0.4).abs() < 1e-12);
    assert!((intents[2].delta - 0.7).abs() < 1e-12);

    let state = gateway.execution_state().await;
    assert_eq!(state.last_applied_version, Some(Version(2)));
    assert_eq!(state.current_holdings, holdings(&[("AAA", 0.3), ("CCC", 0.7)]));
    assert_eq!(orders.submitted().len(), 5);
}

#[tokio::test]
async fn skips_to_latest_version() {
    let dir = tempfile::tempdir().unwrap();
    let bus = open_bus(dir.path());
    let orders = Arc::new(PaperOrderSubsystem::new());
    let gateway = gateway(&bus, &orders);

    publish(&bus, &[("AAA", 1.0)]).await;
    publish(&bus, &[("BBB", 1.0)]).await;
    publish(&bus, &[("CCC", 1.0)]).await;

    assert_eq!(gateway.on_tick().await.applied_version(), Some(Version(3)));
    assert_eq!(gateway.on_tick().await, CycleOutcome::NoChange);
    let touched: Vec<String> = orders
        .submitted()
        .iter()
        .map(|i| format!("{}@{}", i.instrument, i.version))
        .collect();
    assert_eq!(touched, vec!["CCC@v3"]);
}

#[tokio::test]
async fn versions_applied_are_monotonic_and_unique() {
    let dir = tempfile::tempdir().unwrap();
    let bus = open_bus(dir.path());
    let orders = Arc::new(PaperOrderSubsystem::new());
    let gateway = gateway(&bus, &orders);

    let mut applied = Vec::new();
    for round in 0..6u32 {
        if round % 2 == 0 {
            publish(&bus, &[("AAA", f64::from(round) + 1.0)]).await;
        }
        for _ in 0..3 {
            if let Some(v) = gateway.on_tick().await.applied_version() {
                applied.push(v);
            }
        }
    }
    assert_eq!(applied, vec![Version(1), Version(2), Version(3)]);
}

/// Writes a `latest.json` entry by hand, the way a broken producer would.
fn write_tampered_entry(bus_dir: &Path, version: u64) {
    let mut record = SignalRecord::new(Version(version), Utc::now(), rows(&[("AAA", 0.2)]));
    record.payload[0].target = 0.8;
    let head = serde_json::to_string(&BusHead::of(&record)).unwrap();
    let body = serde_json::to_string(&record).unwrap();
    std::fs::write(bus_dir.join("latest.json"), format!("{head}\n{body}\n")).unwrap();
}

#[tokio::test]
async fn checksum_mismatch_is_retried_not_accepted() {
    let dir = tempfile::tempdir().unwrap();
    let bus = open_bus(dir.path());
    let orders = Arc::new(PaperOrderSubsystem::new());
    let gateway = gateway(&bus, &orders);

    publish(&bus, &[("AAA", 1.0)]).await;
    gateway.on_tick().await;

    write_tampered_entry(bus.dir(), 2);
    for _ in 0..3 {
        let outcome = gateway.on_tick().await;
        assert!(
            matches!(outcome, CycleOutcome::DetectFailed { version: Some(Version(2)), .. }),
            "unexpected {outcome:?}"
        );
    }
    let state = gateway.execution_state().await;
    assert_eq!(state.last_applied_version, Some(Version(1)));
    assert_eq!(state.current_holdings, holdings(&[("AAA", 1.0)]));

    // A valid republish supersedes the corrupt entry.
    assert_eq!(publish(&bus, &[("AAA", 0.5)]).await, Version(3));
    assert_eq!(gateway.on_tick().await.applied_version(), Some(Version(3)));
}

#[tokio::test]
async fn garbage_head_is_replaced_by_the_next_publish() {
    let dir = tempfile::tempdir().unwrap();
    let bus = open_bus(dir.path());
    let orders = Arc::new(PaperOrderSubsystem::new());
    let gateway = gateway(&bus, &orders);

    publish(&bus, &[("AAA", 1.0)]).await;
    publish(&bus, &[("AAA", 0.5), ("BBB", 0.5)]).await;
    assert_eq!(gateway.on_tick().await.applied_version(), Some(Version(2)));

    std::fs::write(bus.dir().join("latest.json"), "garbage\n").unwrap();
    for _ in 0..2 {
        let outcome = gateway.on_tick().await;
        assert!(
            matches!(outcome, CycleOutcome::DetectFailed { version: None, .. }),
            "unexpected {outcome:?}"
        );
    }
    assert_eq!(gateway.state(), GatewayState::Idle);

    // A fresh producer process keeps numbering above the last good entry.
    assert_eq!(publish(&bus, &[("CCC", 1.0)]).await, Version(3));
    assert_eq!(gateway.on_tick().await.applied_version(), Some(Version(3)));
    assert_eq!(
        gateway.execution_state().await.current_holdings,
        holdings(&[("CCC", 1.0)])
    );
}

#[tokio::test]
async fn rejected_leg_is_retried_until_confirmed() {
    let dir = tempfile::tempdir().unwrap();
    let bus = open_bus(dir.path());
    let orders = Arc::new(PaperOrderSubsystem::new());
    let gateway = gateway(&bus, &orders);
    orders.reject("BBB");

    publish(&bus, &[("AAA", 0.5), ("BBB", 0.5)]).await;
    for _ in 0..3 {
        assert!(matches!(
            gateway.on_tick().await,
            CycleOutcome::PartiallyApplied { version: Version(1), .. }
        ));
    }
    assert_eq!(gateway.watermark().await, None);

    orders.accept("BBB");
    assert_eq!(gateway.on_tick().await.applied_version(), Some(Version(1)));
    assert_eq!(gateway.on_tick().await, CycleOutcome::NoChange);
    let aaa_orders = orders
        .submitted()
        .iter()
        .filter(|i| i.instrument.as_str() == "AAA")
        .count();
    assert_eq!(aaa_orders, 1);
}

#[tokio::test]
async fn restart_resumes_from_persisted_state() {
    let dir = tempfile::tempdir().unwrap();
    let bus = open_bus(dir.path());
    let orders = Arc::new(PaperOrderSubsystem::new());
    let store = StateStore::new(dir.path().join("state").join("execution.json"));

    {
        let gateway = gateway(&bus, &orders).with_store(store.clone()).unwrap();
        publish(&bus, &[("AAA", 0.6), ("BBB", 0.4)]).await;
        assert_eq!(gateway.on_tick().await.applied_version(), Some(Version(1)));
    }

    let restarted = gateway(&bus, &orders).with_store(store).unwrap();
    assert_eq!(restarted.on_tick().await, CycleOutcome::NoChange);
    assert_eq!(
        restarted.execution_state().await.current_holdings,
        holdings(&[("AAA", 0.6), ("BBB", 0.4)])
    );

    publish(&bus, &[("AAA", 1.0)]).await;
    let CycleOutcome::Applied { intents, .. } = restarted.on_tick().await else {
        panic!("version 2 was not applied after restart");
    };
    let instruments: Vec<&str> = intents.iter().map(|i| i.instrument.as_str()).collect();
    assert_eq!(instruments, vec!["AAA", "BBB"]);
    assert_eq!(orders.submitted().len(), 4);
}

#[tokio::test]
async fn history_keeps_superseded_records() {
    let dir = tempfile::tempdir().unwrap();
    let bus = open_bus(dir.path());
    for target in [0.1, 0.2, 0.3, 0.4, 0.5] {
        publish(&bus, &[("AAA", target)]).await;
    }
    assert_eq!(bus.peek_version().unwrap(), Some(Version(5)));
    let v4 = bus.read_version(Version(4)).unwrap().expect("v4 archived");
    assert_eq!(v4.payload, rows(&[("AAA", 0.4)]));
    assert!(bus.read_version(Version(1)).unwrap().is_none());
}
