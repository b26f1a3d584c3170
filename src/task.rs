// ⏱️ Background runs - trigger now, poll later
//
// A run executes on its own thread with its own SQLite connection. Callers
// keep a RunHandle and read the status whenever they like; the status cell is
// the only state shared with the worker.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;
use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::pipeline::{Pipeline, RunReport};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running { started_at: DateTime<Utc> },
    Succeeded { report: RunReport },
    Failed { error: String, report: RunReport },
}

impl RunStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, RunStatus::Succeeded { .. } | RunStatus::Failed { .. })
    }
}

pub struct RunHandle {
    run_id: String,
    status: Arc<RwLock<RunStatus>>,
    thread: Option<JoinHandle<()>>,
}

impl RunHandle {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Snapshot of the current status.
    pub fn status(&self) -> RunStatus {
        read_status(&self.status)
    }

    pub fn is_finished(&self) -> bool {
        self.status().is_finished()
    }

    /// Block until the run ends and return its final status.
    pub fn wait(mut self) -> RunStatus {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                let report = match self.status() {
                    RunStatus::Failed { report, .. } => report,
                    _ => RunReport::default(),
                };
                write_status(
                    &self.status,
                    RunStatus::Failed {
                        error: "run thread panicked".to_string(),
                        report,
                    },
                );
            }
        }
        self.status()
    }
}

fn read_status(cell: &RwLock<RunStatus>) -> RunStatus {
    match cell.read() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

fn write_status(cell: &RwLock<RunStatus>, status: RunStatus) {
    match cell.write() {
        Ok(mut guard) => *guard = status,
        Err(poisoned) => *poisoned.into_inner() = status,
    }
}

/// Start a run in the background and return immediately.
///
/// Configuration problems are reported here, before any thread starts.
pub fn spawn_run(config: PipelineConfig) -> Result<RunHandle, PipelineError> {
    let pipeline = Pipeline::new(config)?;
    let run_id = uuid::Uuid::new_v4().to_string();
    let status = Arc::new(RwLock::new(RunStatus::Pending));

    let worker_status = Arc::clone(&status);
    let worker_run_id = run_id.clone();
    let thread = std::thread::Builder::new()
        .name(format!("fp-run-{}", &run_id[..8]))
        .spawn(move || {
            write_status(
                &worker_status,
                RunStatus::Running {
                    started_at: Utc::now(),
                },
            );

            let final_status = match pipeline.run_in_database(&worker_run_id) {
                Ok(report) => RunStatus::Succeeded { report },
                Err(failure) => {
                    warn!(run_id = %worker_run_id, "background run failed: {}", failure.error);
                    RunStatus::Failed {
                        error: failure.error.to_string(),
                        report: failure.report,
                    }
                }
            };
            write_status(&worker_status, final_status);
        })
        .map_err(|e| PipelineError::Spawn(e.to_string()))?;

    info!(run_id = %run_id, "background run started");
    Ok(RunHandle {
        run_id,
        status,
        thread: Some(thread),
    })
}
