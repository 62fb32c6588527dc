//! Background job pool for pipeline stages.
//!
//! Controller operations are synchronous and often long (delineation,
//! WEPP runs). The [`JobPool`] runs them on the blocking thread pool,
//! bounded by a semaphore, and hands back a [`JobHandle`] for status
//! queries and completion waits:
//!
//! ```ignore
//! let pool = JobPool::new(Arc::clone(&registry), 4);
//! let handle = pool.submit("little-salmon", BuildLanduseJob::new(bus));
//! let status = handle.wait().await;
//! assert!(status.is_success());
//! ```
//!
//! [`JobPool::submit_after`] chains a job behind others; the batch
//! completion job uses it to fire once every child pipeline is terminal.
//! Shutdown is signalled through a [`CancellationToken`]: queued jobs are
//! cancelled, in-flight jobs finish.

use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::{watch, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::nodb::Registry;

/// Unique identifier of a submitted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(Uuid);

impl JobId {
    fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Failure of a job body.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("{0}")]
    Failed(String),

    #[error("job cancelled")]
    Cancelled,
}

impl JobError {
    /// Wraps any error into a job failure.
    pub fn failed(err: impl std::fmt::Display) -> Self {
        Self::Failed(err.to_string())
    }
}

/// Execution environment handed to a running job.
pub struct JobContext {
    pub registry: Arc<Registry>,
    pub runid: String,
    cancel: CancellationToken,
}

impl JobContext {
    /// Whether shutdown was requested; long jobs poll this between steps.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// A unit of background work.
///
/// Jobs are synchronous; the pool runs them on the blocking thread pool.
pub trait Job: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn run(&self, ctx: &JobContext) -> Result<(), JobError>;
}

/// Job execution status.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum JobStatus {
    /// Queued, or waiting on dependencies or a permit.
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Running => write!(f, "Running"),
            Self::Succeeded => write!(f, "Succeeded"),
            Self::Failed => write!(f, "Failed"),
            Self::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// Handle to a submitted job.
///
/// Cloneable; all clones observe the same job.
#[derive(Clone)]
pub struct JobHandle {
    id: JobId,
    name: String,
    status_rx: watch::Receiver<JobStatus>,
    error: Arc<Mutex<Option<JobError>>>,
}

impl JobHandle {
    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Most recent status, without waiting.
    pub fn status(&self) -> JobStatus {
        *self.status_rx.borrow()
    }

    /// Waits until the job reaches a terminal state and returns it.
    pub async fn wait(&self) -> JobStatus {
        let mut rx = self.status_rx.clone();
        loop {
            let status = *rx.borrow();
            if status.is_terminal() {
                return status;
            }
            if rx.changed().await.is_err() {
                return *rx.borrow();
            }
        }
    }

    /// The failure recorded for a `Failed` job, consumed on read.
    pub fn take_error(&self) -> Option<JobError> {
        self.error.lock().unwrap().take()
    }
}

impl std::fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("status", &self.status())
            .finish()
    }
}

/// Semaphore-bounded pool running jobs on the blocking thread pool.
pub struct JobPool {
    registry: Arc<Registry>,
    semaphore: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl JobPool {
    pub fn new(registry: Arc<Registry>, max_concurrency: usize) -> Self {
        Self {
            registry,
            semaphore: Arc::new(Semaphore::new(max_concurrency.max(1))),
            shutdown: CancellationToken::new(),
        }
    }

    /// Submits a job for the given run.
    pub fn submit(&self, runid: &str, job: impl Job) -> JobHandle {
        self.submit_after(Vec::new(), runid, job)
    }

    /// Submits a job that starts only after every dependency is terminal.
    ///
    /// Dependencies are waited on regardless of their outcome; the job
    /// body decides what a failed dependency means for it.
    pub fn submit_after(&self, deps: Vec<JobHandle>, runid: &str, job: impl Job) -> JobHandle {
        let id = JobId::generate();
        let name = job.name().to_string();
        let (status_tx, status_rx) = watch::channel(JobStatus::Pending);
        let error: Arc<Mutex<Option<JobError>>> = Arc::new(Mutex::new(None));
        let handle = JobHandle {
            id,
            name: name.clone(),
            status_rx,
            error: Arc::clone(&error),
        };

        if self.shutdown.is_cancelled() {
            let _ = status_tx.send(JobStatus::Cancelled);
            return handle;
        }

        let ctx = JobContext {
            registry: Arc::clone(&self.registry),
            runid: runid.to_string(),
            cancel: self.shutdown.clone(),
        };
        let semaphore = Arc::clone(&self.semaphore);
        let shutdown = self.shutdown.clone();
        let job: Arc<dyn Job> = Arc::new(job);

        tokio::spawn(async move {
            for dep in &deps {
                dep.wait().await;
            }

            let permit = tokio::select! {
                _ = shutdown.cancelled() => {
                    let _ = status_tx.send(JobStatus::Cancelled);
                    return;
                }
                permit = semaphore.acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        let _ = status_tx.send(JobStatus::Cancelled);
                        return;
                    }
                },
            };

            let _ = status_tx.send(JobStatus::Running);
            tracing::debug!(job = %id, name = %name, "job started");

            let outcome = tokio::task::spawn_blocking(move || {
                let result = job.run(&ctx);
                drop(permit);
                result
            })
            .await;

            match outcome {
                Ok(Ok(())) => {
                    tracing::debug!(job = %id, name = %name, "job succeeded");
                    let _ = status_tx.send(JobStatus::Succeeded);
                }
                Ok(Err(JobError::Cancelled)) => {
                    let _ = status_tx.send(JobStatus::Cancelled);
                }
                Ok(Err(err)) => {
                    tracing::warn!(job = %id, name = %name, error = %err, "job failed");
                    *error.lock().unwrap() = Some(err);
                    let _ = status_tx.send(JobStatus::Failed);
                }
                Err(join_err) => {
                    tracing::warn!(job = %id, name = %name, error = %join_err, "job panicked");
                    *error.lock().unwrap() = Some(JobError::Failed(join_err.to_string()));
                    let _ = status_tx.send(JobStatus::Failed);
                }
            }
        });

        handle
    }

    /// Stops intake: queued jobs become `Cancelled`, in-flight jobs run
    /// to completion.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}
