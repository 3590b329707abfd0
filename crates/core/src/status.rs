//! Shared worker-state counters and the periodic reporter.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;

#[derive(Default)]
struct MissAccum {
    missed_ns: i64,
    count: u64,
}

/// Process-wide counters shared by workers and workload drivers.
///
/// `busy` counts in-flight protocol calls, `working` the span between
/// schedule receipt and result publish, `sleeping` scheduled delays
/// and `waiting` blocks on the schedule channel. The miss accumulator
/// tracks the drift between scheduled and actual start times.
#[derive(Default)]
pub struct Status {
    busy: AtomicI64,
    working: AtomicI64,
    sleeping: AtomicI64,
    waiting: AtomicI64,
    miss: Mutex<MissAccum>,
}

macro_rules! counter {
    ($inc:ident, $dec:ident, $get:ident, $field:ident) => {
        /// Increment the counter.
        pub fn $inc(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }

        /// Decrement the counter. Going negative is a programming bug.
        pub fn $dec(&self) {
            let prev = self.$field.fetch_sub(1, Ordering::Relaxed);
            if prev <= 0 {
                panic!("counter {} cannot be negative", stringify!($field));
            }
        }

        /// Read the current value.
        pub fn $get(&self) -> i64 {
            self.$field.load(Ordering::Relaxed)
        }
    };
}

impl Status {
    /// Create a zeroed counter block.
    pub fn new() -> Self {
        Self::default()
    }

    counter!(inc_busy, dec_busy, busy, busy);
    counter!(inc_working, dec_working, working, working);
    counter!(inc_sleeping, dec_sleeping, sleeping, sleeping);
    counter!(inc_waiting, dec_waiting, waiting, waiting);

    /// Record the difference between scheduled and actual start.
    pub fn report_miss(&self, missed_ns: i64) {
        let mut acc = self.miss.lock().unwrap();
        acc.missed_ns += missed_ns;
        acc.count += 1;
    }

    /// Average miss over the accumulated interval, resetting it.
    fn take_avg_miss(&self) -> Duration {
        let mut acc = self.miss.lock().unwrap();
        let avg = if acc.count > 0 {
            (acc.missed_ns / acc.count as i64).max(0)
        } else {
            0
        };
        acc.missed_ns = 0;
        acc.count = 0;
        Duration::from_nanos(avg as u64)
    }

    /// Spawn the 1 Hz reporter task.
    pub fn start_reporter(self: &Arc<Self>) -> JoinHandle<()> {
        let status = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            tick.tick().await; // first tick fires immediately
            loop {
                tick.tick().await;
                tracing::info!(
                    "Workers: waiting: {}, working: {}, sleeping: {}, busy: {}, avg miss: {:?}",
                    status.waiting(),
                    status.working(),
                    status.sleeping(),
                    status.busy(),
                    status.take_avg_miss(),
                );
            }
        })
    }
}
