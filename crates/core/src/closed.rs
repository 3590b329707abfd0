//! Closed workload: a scheduled number of concurrent workers, each
//! issuing its next request as soon as the previous one finishes.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};

use crate::input::InputError;
use crate::workload::{total_duration, BaseWorkload, SharedRx, WorkloadLevel};

/// Offsets since run start at which one more worker is spawned.
///
/// A step `(start, end, duration)` jumps to `start` workers instantly
/// at step entry and then ramps linearly to `end`: one spawn every
/// `duration / (end - start)`. Shrinking pools are not supported.
pub fn spawn_schedule(levels: &[WorkloadLevel]) -> Vec<Duration> {
    let mut offsets = Vec::new();
    let mut cur = Duration::ZERO;
    let mut have: i64 = 0;

    for level in levels {
        let start = level.level_start.round() as i64;
        let end = level.level_end.round() as i64;

        for _ in have..start {
            offsets.push(cur);
        }
        have = have.max(start);

        let ramp = end - have;
        if ramp < 0 {
            tracing::warn!(
                "Decreasing worker count {} to {} is not supported",
                have,
                end
            );
        } else if ramp > 0 {
            let k = level.duration / ramp as u32;
            for i in 1..=ramp {
                offsets.push(cur + k * i as u32);
            }
            have = end;
        }

        cur += level.duration;
    }
    offsets
}

/// Driver for the closed model: spawns workers along the schedule,
/// lets payload arrival pace them, and stops everything at the end of
/// the scenario.
pub struct ClosedWorkload {
    base: BaseWorkload,
    levels: Vec<WorkloadLevel>,
    interrupt: watch::Receiver<bool>,
}

impl ClosedWorkload {
    /// Build the driver around prepared worker state.
    pub fn new(
        base: BaseWorkload,
        levels: Vec<WorkloadLevel>,
        interrupt: watch::Receiver<bool>,
    ) -> Self {
        Self {
            base,
            levels,
            interrupt,
        }
    }

    /// Run the spawn schedule, hold until the scenario ends or an
    /// interrupt arrives, then stop and join the workers.
    pub async fn run(mut self) -> Result<(), InputError> {
        tracing::debug!("Starting closed workload scenario");

        // workers in a closed model punch immediately; their own
        // response latency sets the pace
        let (zero_tx, zero_rx) = mpsc::channel::<Duration>(1);
        let schedule: SharedRx<Duration> = Arc::new(Mutex::new(zero_rx));
        let feeder = tokio::spawn(async move {
            while zero_tx.send(Duration::ZERO).await.is_ok() {}
        });

        let offsets = spawn_schedule(&self.levels);
        let first = offsets.first().copied().unwrap_or_default();
        let start = self.base.start_time;

        for offset in &offsets {
            // the lead-in before the first spawn is dead air: shift
            // the whole schedule so the run begins immediately
            let due = start + offset.saturating_sub(first);
            tokio::select! {
                _ = tokio::time::sleep_until(due.into()) => {}
                _ = self.interrupt.changed() => {
                    tracing::info!("Interrupted while ramping workers");
                    break;
                }
            }
            if *self.interrupt.borrow() {
                break;
            }
            self.base.spawn_worker(Arc::clone(&schedule))?;
        }

        if !*self.interrupt.borrow() {
            let finish = start + total_duration(&self.levels);
            tokio::select! {
                _ = tokio::time::sleep_until(finish.into()) => {}
                _ = self.interrupt.changed() => {
                    tracing::info!("Interrupted, stopping the scenario early");
                }
            }
        }

        self.base.stop();
        self.base.join_all().await;
        drop(schedule);
        let _ = feeder.await;
        Ok(())
    }
}
