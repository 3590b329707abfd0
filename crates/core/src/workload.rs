//! Worker lifecycle shared by the workload drivers.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::config::{InputConf, WorkerConf};
use crate::input::{self, InputError};
use crate::item::{OutputItem, PayloadItem};
use crate::nib::NibMaker;
use crate::status::Status;
use crate::strindex::StringIndex;
use crate::values::ValMap;
use crate::worker::Worker;

/// Channel receiver competed over by multiple workers.
pub type SharedRx<T> = Arc<Mutex<mpsc::Receiver<T>>>;

/// One piecewise-linear segment of the workload: rate per second for
/// the open model, worker count for the closed model.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct WorkloadLevel {
    /// Level at segment entry
    #[serde(rename = "LevelStart")]
    pub level_start: f64,

    /// Level at segment exit
    #[serde(rename = "LevelEnd")]
    pub level_end: f64,

    /// Segment length
    #[serde(rename = "Duration", with = "humantime_serde")]
    pub duration: Duration,
}

/// Workload model selector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkloadMode {
    /// Request start times fixed by a rate schedule
    #[default]
    Open,
    /// Fixed number of concurrent workers
    Closed,
}

/// Sum of the segment durations.
pub fn total_duration(levels: &[WorkloadLevel]) -> Duration {
    levels.iter().map(|l| l.duration).sum()
}

enum InputMode {
    /// One payload channel competed over by every worker
    Shared(SharedRx<PayloadItem>),
    /// A fresh payload reader per worker (extractor-fed values)
    PerWorker(InputConf, Arc<StringIndex>),
}

/// Worker bookkeeping common to the open and closed drivers.
pub struct BaseWorkload {
    nib_maker: NibMaker,
    output: mpsc::Sender<OutputItem>,
    status: Arc<Status>,
    strindex: Arc<StringIndex>,
    /// Instant the run started; schedule offsets are relative to it.
    pub start_time: Instant,
    values: ValMap,
    input: InputMode,
    stop: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
    cnt: u32,
}

impl BaseWorkload {
    /// Assemble the shared worker state from configuration.
    pub fn new(
        nib_maker: NibMaker,
        output: mpsc::Sender<OutputItem>,
        input_conf: &InputConf,
        worker_conf: &WorkerConf,
        status: Arc<Status>,
        strindex: Arc<StringIndex>,
    ) -> Result<Self, InputError> {
        let input = if input_conf.enable_regexes {
            InputMode::PerWorker(input_conf.clone(), Arc::clone(&strindex))
        } else {
            let rx = input::start_file_input(input_conf, Arc::clone(&strindex))?;
            InputMode::Shared(Arc::new(Mutex::new(rx)))
        };

        Ok(Self::with_input(nib_maker, output, input, worker_conf, status, strindex))
    }

    /// Assemble with an injection payload channel (tests, dry runs).
    pub fn with_injection(
        nib_maker: NibMaker,
        output: mpsc::Sender<OutputItem>,
        payloads: mpsc::Receiver<PayloadItem>,
        worker_conf: &WorkerConf,
        status: Arc<Status>,
        strindex: Arc<StringIndex>,
    ) -> Self {
        Self::with_input(
            nib_maker,
            output,
            InputMode::Shared(Arc::new(Mutex::new(payloads))),
            worker_conf,
            status,
            strindex,
        )
    }

    fn with_input(
        nib_maker: NibMaker,
        output: mpsc::Sender<OutputItem>,
        input: InputMode,
        worker_conf: &WorkerConf,
        status: Arc<Status>,
        strindex: Arc<StringIndex>,
    ) -> Self {
        let values = worker_conf
            .values
            .iter()
            .map(|(k, v)| (k.clone(), v.as_bytes().to_vec()))
            .collect();

        Self {
            nib_maker,
            output,
            status,
            strindex,
            start_time: Instant::now(),
            values,
            input,
            stop: watch::channel(false).0,
            handles: Vec::new(),
            cnt: 0,
        }
    }

    /// Shared status counters.
    pub fn status(&self) -> &Arc<Status> {
        &self.status
    }

    /// Spawn one worker consuming the given schedule channel.
    pub fn spawn_worker(&mut self, schedule: SharedRx<Duration>) -> Result<(), InputError> {
        self.cnt += 1;
        tracing::info!("Spawning worker: #{}", self.cnt);

        let payloads = match &self.input {
            InputMode::Shared(rx) => Arc::clone(rx),
            InputMode::PerWorker(conf, index) => {
                let rx = input::start_file_input(conf, Arc::clone(index))?;
                Arc::new(Mutex::new(rx))
            }
        };

        let worker = Worker {
            name: format!("worker#{}", self.cnt),
            index: self.cnt,
            nib: (self.nib_maker)(),
            output: self.output.clone(),
            payloads,
            schedule,
            status: Arc::clone(&self.status),
            strindex: Arc::clone(&self.strindex),
            start_time: self.start_time,
            values: self.values.clone(),
            stop: self.stop.subscribe(),
        };
        self.handles.push(tokio::spawn(worker.run()));
        Ok(())
    }

    /// Number of workers spawned so far.
    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }

    /// True once every spawned worker has finished.
    pub fn all_finished(&self) -> bool {
        self.handles.iter().all(|h| h.is_finished())
    }

    /// Tell workers to stop at the next iteration boundary.
    pub fn stop(&self) {
        tracing::info!("Telling workers to not continue...");
        let _ = self.stop.send(true);
    }

    /// Wait for every worker to finish.
    pub async fn join_all(&mut self) {
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_total_duration_sums_levels() {
        let levels = [
            WorkloadLevel {
                level_start: 0.0,
                level_end: 10.0,
                duration: Duration::from_secs(5),
            },
            WorkloadLevel {
                level_start: 10.0,
                level_end: 10.0,
                duration: Duration::from_secs(7),
            },
        ];
        assert_eq!(total_duration(&levels), Duration::from_secs(12));
    }
}
