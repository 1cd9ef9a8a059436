//! Periodic pipeline scheduler
//!
//! Submits a preset pipeline on a fixed cadence with bounded jitter. A tick
//! is skipped while the previously scheduled pipeline is still live, so a
//! schedule never has more than one pipeline in flight. Pause, resume and
//! reschedule are accepted at runtime.

use crate::pipeline::Orchestrator;
use pulse_common::{PipelineRequest, TaskId};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Debug)]
enum Command {
    Pause,
    Resume,
    Reschedule(Duration),
    Shutdown,
}

/// Handle to a running schedule
pub struct Scheduler {
    tx: mpsc::Sender<Command>,
    handle: JoinHandle<()>,
}

impl Scheduler {
    /// Start the tick loop; the first submission happens one jittered
    /// interval after start, not immediately.
    pub fn start(
        orchestrator: Arc<Orchestrator>,
        interval: Duration,
        jitter_frac: f64,
        preset: PipelineRequest,
    ) -> Self {
        let (tx, rx) = mpsc::channel(8);
        let handle = tokio::spawn(run_loop(orchestrator, interval, jitter_frac, preset, rx));
        Self { tx, handle }
    }

    pub async fn pause(&self) {
        let _ = self.tx.send(Command::Pause).await;
    }

    pub async fn resume(&self) {
        let _ = self.tx.send(Command::Resume).await;
    }

    pub async fn reschedule(&self, interval: Duration) {
        let _ = self.tx.send(Command::Reschedule(interval)).await;
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown).await;
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn run_loop(
    orchestrator: Arc<Orchestrator>,
    mut interval: Duration,
    jitter_frac: f64,
    preset: PipelineRequest,
    mut rx: mpsc::Receiver<Command>,
) {
    let mut paused = false;
    let mut last_pipeline: Option<TaskId> = None;
    info!(?interval, jitter_frac, "scheduler started");

    loop {
        let delay = jittered(interval, jitter_frac);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {
                if paused {
                    continue;
                }
                if let Some(id) = last_pipeline {
                    let still_live = orchestrator
                        .registry()
                        .get(id)
                        .map(|t| !t.state.is_terminal())
                        .unwrap_or(false);
                    if still_live {
                        info!(pipeline_id = %id, "previous scheduled pipeline still running, skipping tick");
                        continue;
                    }
                }
                match orchestrator.submit(preset.clone()) {
                    Ok(id) => {
                        info!(pipeline_id = %id, "scheduled pipeline submitted");
                        last_pipeline = Some(id);
                    }
                    Err(e) => warn!(error = %e, "scheduled pipeline submission failed"),
                }
            }
            command = rx.recv() => match command {
                Some(Command::Pause) => {
                    info!("scheduler paused");
                    paused = true;
                }
                Some(Command::Resume) => {
                    info!("scheduler resumed");
                    paused = false;
                }
                Some(Command::Reschedule(new_interval)) => {
                    info!(?new_interval, "scheduler rescheduled");
                    interval = new_interval;
                }
                Some(Command::Shutdown) | None => {
                    info!("scheduler stopped");
                    return;
                }
            },
        }
    }
}

/// Interval with a symmetric random offset bounded by `jitter_frac`
fn jittered(interval: Duration, jitter_frac: f64) -> Duration {
    if jitter_frac <= 0.0 {
        return interval;
    }
    let jitter = interval.as_secs_f64() * jitter_frac;
    let offset = rand::thread_rng().gen_range(-jitter..=jitter);
    Duration::from_secs_f64((interval.as_secs_f64() + offset).max(0.001))
}
