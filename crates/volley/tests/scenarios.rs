//! End-to-end scenarios over the dummy driver.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};

use volley_core::closed::ClosedWorkload;
use volley_core::open::OpenWorkload;
use volley_core::{
    BaseWorkload, DummyNib, Nib, NibMaker, PayloadItem, Status, StringIndex, WorkerConf,
    WorkloadLevel,
};

fn dummy_maker() -> NibMaker {
    Arc::new(|| Box::new(DummyNib) as Box<dyn Nib>)
}

fn level(start: f64, end: f64, ms: u64) -> WorkloadLevel {
    WorkloadLevel {
        level_start: start,
        level_end: end,
        duration: Duration::from_millis(ms),
    }
}

/// Feed payload items until the engine stops reading, pacing them by
/// `gap` (closed workloads are paced by payload arrival).
fn spawn_feeder(gap: Duration) -> mpsc::Receiver<PayloadItem> {
    let (tx, rx) = mpsc::channel(1);
    tokio::spawn(async move {
        let mut i: u64 = 0;
        loop {
            let item = PayloadItem {
                label: format!("label#{}", i % 3),
                payload: b"data".to_vec(),
                ..Default::default()
            };
            if tx.send(item).await.is_err() {
                return;
            }
            i += 1;
            if !gap.is_zero() {
                tokio::time::sleep(gap).await;
            }
        }
    });
    rx
}

#[tokio::test(flavor = "multi_thread")]
async fn open_scenario_with_dummy_driver() {
    let status = Arc::new(Status::new());
    let (out_tx, mut out_rx) = mpsc::channel(4096);
    let strindex = Arc::new(StringIndex::new(None, true).unwrap());
    let conf = WorkerConf::default();

    let base = BaseWorkload::with_injection(
        dummy_maker(),
        out_tx,
        spawn_feeder(Duration::ZERO),
        &conf,
        Arc::clone(&status),
        strindex,
    );

    // 0 to 10 rps over 5s integrates to 25 requests
    let (_tx, interrupt) = watch::channel(false);
    let driver = OpenWorkload::new(base, vec![level(0.0, 10.0, 5000)], 1, 100, interrupt);

    let began = Instant::now();
    driver.run().await.unwrap();
    let took = began.elapsed();

    let mut results = Vec::new();
    while let Some(res) = out_rx.recv().await {
        results.push(res);
    }

    assert!(
        (23..=28).contains(&results.len()),
        "expected ~25 results, got {}",
        results.len()
    );
    assert!(took >= Duration::from_secs(4), "run ended early: {took:?}");
    for res in &results {
        assert_eq!(res.status, 200);
        assert!(res.error.is_none());
    }

    // all counters return to zero once the schedule closes
    assert_eq!(status.busy(), 0);
    assert_eq!(status.working(), 0);
    assert_eq!(status.sleeping(), 0);
    assert_eq!(status.waiting(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn closed_scenario_with_dummy_driver() {
    let status = Arc::new(Status::new());
    let (out_tx, mut out_rx) = mpsc::channel(65536);
    let strindex = Arc::new(StringIndex::new(None, true).unwrap());
    let conf = WorkerConf::default();

    let base = BaseWorkload::with_injection(
        dummy_maker(),
        out_tx,
        spawn_feeder(Duration::from_millis(10)),
        &conf,
        Arc::clone(&status),
        strindex,
    );

    // ramp to 3 workers over 900ms, hold for 600ms
    let (_tx, interrupt) = watch::channel(false);
    let driver = ClosedWorkload::new(
        base,
        vec![level(0.0, 3.0, 900), level(3.0, 3.0, 600)],
        interrupt,
    );

    let began = Instant::now();
    driver.run().await.unwrap();
    let took = began.elapsed();

    let mut results = Vec::new();
    while let Some(res) = out_rx.recv().await {
        results.push(res);
    }

    assert!(!results.is_empty());
    let workers: HashSet<u32> = results.iter().map(|r| r.worker).collect();
    assert_eq!(workers.len(), 3, "all three workers should produce results");
    assert!(took >= Duration::from_millis(1400), "stopped early: {took:?}");
    assert!(took < Duration::from_secs(5), "did not stop: {took:?}");

    assert_eq!(status.busy(), 0);
    assert_eq!(status.working(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn closed_scenario_interrupts_promptly() {
    let status = Arc::new(Status::new());
    let (out_tx, mut out_rx) = mpsc::channel(65536);
    let strindex = Arc::new(StringIndex::new(None, true).unwrap());
    let conf = WorkerConf::default();

    let base = BaseWorkload::with_injection(
        dummy_maker(),
        out_tx,
        spawn_feeder(Duration::from_millis(5)),
        &conf,
        status,
        strindex,
    );

    let (tx, interrupt) = watch::channel(false);
    let driver = ClosedWorkload::new(base, vec![level(2.0, 2.0, 60_000)], interrupt);

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        let _ = tx.send(true);
    });

    let began = Instant::now();
    driver.run().await.unwrap();
    assert!(
        began.elapsed() < Duration::from_secs(5),
        "interrupt must cut the hold phase short"
    );

    while out_rx.recv().await.is_some() {}
}
