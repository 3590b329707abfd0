//! Open workload: request start times fixed by a rate schedule.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch, Mutex};

use crate::input::InputError;
use crate::workload::{total_duration, BaseWorkload, SharedRx, WorkloadLevel};

/// Allowed drift past the scheduled total duration before the run is
/// aborted (10%).
const DRIFT_FACTOR: f64 = 1.1;

/// Lazy generator of the open-workload schedule: a finite,
/// single-shot, forward-only sequence of strictly non-decreasing
/// offsets since run start.
///
/// Within a step of duration `D` from rate `r0` to `r1`, the interval
/// to the next emission is `1/r` where `r = sqrt(r0^2 + 2*k*(n-1/2))`
/// with `k = (r1 - r0)/D` and `n` counting emissions since the step
/// began: the instantaneous rate at the inverse of the integrated
/// ramp, evaluated at the midpoint so that emission counts match the
/// step integral. Flat steps use `r = r1`. The step advances once
/// the accumulated offset passes its end.
pub struct OpenSchedule {
    levels: Vec<WorkloadLevel>,
    cur_step: usize,
    /// Cumulative offset in seconds; the value emitted.
    accum: f64,
    /// Sum of durations of the finished steps, in seconds.
    finished: f64,
    /// Emissions since the current step began.
    cnt: u64,
}

impl OpenSchedule {
    /// Build the generator for a level sequence.
    pub fn new(levels: &[WorkloadLevel]) -> Self {
        Self {
            levels: levels.to_vec(),
            cur_step: 0,
            accum: 0.0,
            finished: 0.0,
            cnt: 0,
        }
    }
}

impl Iterator for OpenSchedule {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        loop {
            let step = self.levels.get(self.cur_step)?;
            let dur = step.duration.as_secs_f64();
            if self.accum >= self.finished + dur {
                self.finished += dur;
                self.cur_step += 1;
                self.cnt = 0;
                continue;
            }

            let k = (step.level_end - step.level_start) / dur;
            let rate = if k == 0.0 {
                step.level_end
            } else {
                self.cnt += 1;
                let n = self.cnt as f64 - 0.5;
                (step.level_start * step.level_start + 2.0 * k * n).max(0.0).sqrt()
            };

            if rate <= 0.0 {
                // a zero-rate stretch is a pause: jump to the step end
                self.accum = self.finished + dur;
                continue;
            }

            self.accum += 1.0 / rate;
            return Some(Duration::from_secs_f64(self.accum));
        }
    }
}

/// Driver for the open model: feeds the generated schedule to a pool
/// of workers, growing the pool when offsets find nobody ready.
pub struct OpenWorkload {
    base: BaseWorkload,
    levels: Vec<WorkloadLevel>,
    starting_workers: usize,
    max_workers: usize,
    interrupt: watch::Receiver<bool>,
}

impl OpenWorkload {
    /// Build the driver around prepared worker state.
    pub fn new(
        base: BaseWorkload,
        levels: Vec<WorkloadLevel>,
        starting_workers: usize,
        max_workers: usize,
        interrupt: watch::Receiver<bool>,
    ) -> Self {
        Self {
            base,
            levels,
            starting_workers,
            max_workers,
            interrupt,
        }
    }

    /// Run the schedule to completion or interrupt, then stop and
    /// join the workers.
    pub async fn run(mut self) -> Result<(), InputError> {
        tracing::debug!("Starting open workload scenario");

        let (tx, rx) = mpsc::channel::<Duration>(1);
        let schedule: SharedRx<Duration> = Arc::new(Mutex::new(rx));

        let initial = self.starting_workers.min(self.max_workers).max(1);
        for _ in 0..initial {
            self.base.spawn_worker(Arc::clone(&schedule))?;
        }

        let cutoff = self.base.start_time
            + Duration::from_secs_f64(total_duration(&self.levels).as_secs_f64() * DRIFT_FACTOR);

        let mut aborted = false;
        let mut last = Duration::ZERO;
        for offset in OpenSchedule::new(&self.levels) {
            assert!(offset >= last, "schedule offsets must not decrease");
            last = offset;

            if *self.interrupt.borrow() {
                tracing::info!("Interrupted, closing the schedule");
                aborted = true;
                break;
            }
            if Instant::now() > cutoff {
                tracing::warn!("Aborting the run: more than 10% past the scheduled duration");
                aborted = true;
                break;
            }

            match tx.try_send(offset) {
                Ok(()) => continue,
                Err(mpsc::error::TrySendError::Closed(_)) => break,
                Err(mpsc::error::TrySendError::Full(offset)) => {
                    let status = self.base.status();
                    let working = status.working();
                    let sleeping = status.sleeping();
                    tracing::info!(
                        "Working: {}, sleeping: {}, busy: {}",
                        working,
                        sleeping,
                        status.busy()
                    );

                    if self.base.worker_count() < self.max_workers
                        && working >= self.base.worker_count() as i64
                        && sleeping < 1
                    {
                        self.base.spawn_worker(Arc::clone(&schedule))?;
                    }

                    // the offset must not be dropped: hand it off for real
                    if !self.handoff(&tx, offset, cutoff).await {
                        aborted = true;
                        break;
                    }
                }
            }
        }

        drop(tx); // closes the schedule channel
        if aborted {
            // cut scheduled sleeps short; a normal end lets workers
            // drain the offsets they already hold
            self.base.stop();
        }
        self.base.join_all().await;
        Ok(())
    }

    /// Blocking handoff that still notices dead workers, interrupts
    /// and the drift cutoff. Returns false when the loop should end.
    async fn handoff(
        &mut self,
        tx: &mpsc::Sender<Duration>,
        offset: Duration,
        cutoff: Instant,
    ) -> bool {
        let mut pending = offset;
        loop {
            match tx.send_timeout(pending, Duration::from_secs(1)).await {
                Ok(()) => return true,
                Err(mpsc::error::SendTimeoutError::Closed(_)) => return false,
                Err(mpsc::error::SendTimeoutError::Timeout(v)) => {
                    pending = v;
                    if *self.interrupt.borrow() {
                        return false;
                    }
                    if Instant::now() > cutoff {
                        tracing::warn!(
                            "Aborting the run: more than 10% past the scheduled duration"
                        );
                        return false;
                    }
                    if self.base.all_finished() {
                        tracing::warn!("All workers finished with schedule remaining");
                        return false;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn level(start: f64, end: f64, secs: f64) -> WorkloadLevel {
        WorkloadLevel {
            level_start: start,
            level_end: end,
            duration: Duration::from_secs_f64(secs),
        }
    }

    #[test]
    fn test_ramp_emission_count_matches_integral() {
        // 0 to 10 rps over 5s integrates to 25 requests
        let offsets: Vec<_> = OpenSchedule::new(&[level(0.0, 10.0, 5.0)]).collect();
        assert!(
            (23..=27).contains(&offsets.len()),
            "expected ~25 offsets, got {}",
            offsets.len()
        );
    }

    #[test]
    fn test_flat_emission_count_matches_integral() {
        let offsets: Vec<_> = OpenSchedule::new(&[level(10.0, 10.0, 2.0)]).collect();
        assert!(
            (19..=21).contains(&offsets.len()),
            "expected ~20 offsets, got {}",
            offsets.len()
        );
    }

    #[test]
    fn test_ramp_with_nonzero_start_matches_integral() {
        // 10 to 20 rps over 5s integrates to 75 requests
        let offsets: Vec<_> = OpenSchedule::new(&[level(10.0, 20.0, 5.0)]).collect();
        assert!(
            (73..=77).contains(&offsets.len()),
            "expected ~75 offsets, got {}",
            offsets.len()
        );
    }

    #[test]
    fn test_decreasing_ramp_matches_integral() {
        // 10 down to 2 rps over 4s integrates to 24 requests
        let offsets: Vec<_> = OpenSchedule::new(&[level(10.0, 2.0, 4.0)]).collect();
        assert!(
            (22..=26).contains(&offsets.len()),
            "expected ~24 offsets, got {}",
            offsets.len()
        );
    }

    #[test]
    fn test_offsets_strictly_non_decreasing() {
        let sched = OpenSchedule::new(&[
            level(0.0, 10.0, 5.0),
            level(10.0, 10.0, 3.0),
            level(10.0, 2.0, 4.0),
        ]);
        let mut last = Duration::ZERO;
        let mut count = 0;
        for offset in sched {
            assert!(offset >= last, "{offset:?} < {last:?}");
            last = offset;
            count += 1;
        }
        assert!(count > 0);
        // the generator is single-shot and finite
        assert!(last >= Duration::from_secs(12));
    }

    #[test]
    fn test_multi_step_counts() {
        // 0 to 10 over 5s (25) then flat 10 for 5s (50)
        let offsets: Vec<_> =
            OpenSchedule::new(&[level(0.0, 10.0, 5.0), level(10.0, 10.0, 5.0)]).collect();
        assert!(
            (70..=80).contains(&offsets.len()),
            "expected ~75 offsets, got {}",
            offsets.len()
        );
    }

    #[test]
    fn test_zero_rate_step_pauses() {
        let offsets: Vec<_> =
            OpenSchedule::new(&[level(0.0, 0.0, 3.0), level(5.0, 5.0, 1.0)]).collect();
        assert!((4..=6).contains(&offsets.len()));
        assert!(offsets[0] > Duration::from_secs(3));
    }
}
