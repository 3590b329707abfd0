//! Worker: the per-iteration loop tying schedule, payload, driver and
//! output together.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};

use crate::item::{epoch_secs, OutputItem, PayloadItem};
use crate::nib::Nib;
use crate::status::Status;
use crate::strindex::StringIndex;
use crate::values::{self, ReplaceCache, ValMap};
use crate::workload::SharedRx;

/// One executor: consumes a schedule slot and a payload per
/// iteration, punches the driver and publishes the result.
pub struct Worker {
    /// Human-readable name for logs
    pub name: String,
    /// Stable worker index stamped onto results
    pub index: u32,
    /// Protocol driver bound to this worker
    pub nib: Box<dyn Nib>,
    /// Result channel into the output pipeline
    pub output: mpsc::Sender<OutputItem>,
    /// Payload channel (shared or per-worker)
    pub payloads: SharedRx<PayloadItem>,
    /// Schedule channel competed over with the other workers
    pub schedule: SharedRx<Duration>,
    /// Shared counters
    pub status: Arc<Status>,
    /// Index for lazy label/address resolution
    pub strindex: Arc<StringIndex>,
    /// Run start; offsets are relative to it
    pub start_time: Instant,
    /// Worker-private variable state
    pub values: ValMap,
    /// Cooperative stop signal
    pub stop: watch::Receiver<bool>,
}

impl Worker {
    /// Run iterations until stopped or the input is exhausted.
    pub async fn run(mut self) {
        let mut cache = ReplaceCache::default();
        let mut iterations = 0u64;
        loop {
            if *self.stop.borrow() {
                tracing::debug!("Aborting worker: {}", self.name);
                break;
            }
            if self.iteration(&mut cache).await {
                break;
            }
            iterations += 1;
        }
        tracing::debug!("Worker finished: {} after {} iterations", self.name, iterations);
    }

    /// One iteration; returns true when the worker should stop.
    async fn iteration(&mut self, cache: &mut ReplaceCache) -> bool {
        self.status.inc_waiting();

        let offset = {
            let mut sched = self.schedule.lock().await;
            tokio::select! {
                o = sched.recv() => o,
                _ = self.stop.changed() => None,
            }
        };
        let Some(offset) = offset else {
            self.status.dec_waiting();
            return true;
        };

        let item = {
            let mut payloads = self.payloads.lock().await;
            tokio::select! {
                i = payloads.recv() => i,
                _ = self.stop.changed() => None,
            }
        };
        let Some(mut item) = item else {
            self.status.dec_waiting();
            return true;
        };

        values::replace_values(&mut item, &self.values, cache);
        self.status.dec_waiting();

        if let Err(e) = item.resolve(&self.strindex) {
            tracing::warn!("[{}] skipping payload with bad string ids: {}", self.name, e);
            return false;
        }

        self.status.inc_working();
        let expected_start = self.start_time + offset;
        if expected_start > Instant::now() {
            tracing::debug!("[{}] sleeping until scheduled start", self.name);
            self.status.inc_sleeping();
            tokio::select! {
                _ = tokio::time::sleep_until(expected_start.into()) => {}
                _ = self.stop.changed() => {}
            }
            self.status.dec_sleeping();
        }

        if *self.stop.borrow() {
            self.status.dec_working();
            return true;
        }

        self.status.inc_busy();
        let mut res = self.nib.punch(&mut item).await;
        res.start_ts = epoch_secs(res.start_wall);
        res.worker = self.index;
        res.req_bytes = item.payload.clone();
        res.concurrency = self.status.busy() as u32;
        self.status.dec_busy();

        values::extract_values(&item.extractors, &res.resp_bytes, &mut self.values);
        let resp_bytes = res.resp_bytes.clone();
        values::assert_response(&item.asserts, &resp_bytes, &mut res);

        // the driver may have produced its own label
        if !item.label.is_empty() {
            res.label = item.label.clone();
            res.label_idx = item.label_idx;
        }

        let missed = res.start.saturating_duration_since(expected_start).as_nanos() as i64
            - expected_start.saturating_duration_since(res.start).as_nanos() as i64;
        self.status.report_miss(missed);

        let published = self.output.send(res).await.is_ok();
        self.status.dec_working();
        !published
    }
}
