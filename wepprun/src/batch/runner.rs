//! Batch fan-out over the job pool.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use crate::executor::{Job, JobContext, JobError, JobHandle, JobPool};
use crate::nodb::Registry;
use crate::rundir;
use crate::status::EventKind;
use crate::trigger::TriggerEvent;

use super::template::{self, BatchTemplate};
use super::BatchError;

/// Pipeline body executed inside each child run.
///
/// The closure receives the child's [`JobContext`]; the child working
/// directory is `ctx.registry.wd_for(&ctx.runid)`.
pub type PipelineFn = Arc<dyn Fn(&JobContext) -> Result<(), JobError> + Send + Sync>;

/// A named batch: dataset, template, and the canonical run to clone.
#[derive(Debug, Clone)]
pub struct Batch {
    pub name: String,
    pub geojson: PathBuf,
    pub template: BatchTemplate,
    /// Fully prepared run directory cloned for every child.
    pub template_dir: PathBuf,
}

/// Handles for a running batch.
#[derive(Debug)]
pub struct BatchHandles {
    pub children: Vec<JobHandle>,
    pub completion: JobHandle,
}

struct ChildJob {
    runid: String,
    pipeline: PipelineFn,
}

impl Job for ChildJob {
    fn name(&self) -> &str {
        &self.runid
    }

    fn run(&self, ctx: &JobContext) -> Result<(), JobError> {
        (self.pipeline)(ctx)
    }
}

/// Fires `BATCH_RUN_COMPLETED` once all children are terminal.
struct CompletionJob {
    batch: String,
}

impl Job for CompletionJob {
    fn name(&self) -> &str {
        &self.batch
    }

    fn run(&self, ctx: &JobContext) -> Result<(), JobError> {
        ctx.registry.platform().status.publish(
            &ctx.runid,
            "batch",
            EventKind::Trigger,
            TriggerEvent::BatchRunCompleted.tag(),
        );
        Ok(())
    }
}

/// Materializes and schedules child runs for a batch.
pub struct BatchRunner {
    registry: Arc<Registry>,
    pool: Arc<JobPool>,
}

impl BatchRunner {
    pub fn new(registry: Arc<Registry>, pool: Arc<JobPool>) -> Self {
        Self { registry, pool }
    }

    /// Clones one child run per feature and schedules the pipeline in
    /// each, plus the completion job behind all of them.
    ///
    /// Refuses to touch the filesystem when the dataset no longer
    /// matches the template's pinned checksum.
    pub fn enqueue(&self, batch: &Batch, pipeline: PipelineFn) -> Result<BatchHandles, BatchError> {
        let stored = match (&batch.template.state, &batch.template.resource_checksum) {
            (super::TemplateState::Ok, Some(checksum)) => checksum,
            _ => {
                return Err(BatchError::NotValidated {
                    name: batch.name.clone(),
                })
            }
        };

        let bytes = fs::read(&batch.geojson).map_err(|e| BatchError::Io {
            path: batch.geojson.clone(),
            source: e,
        })?;
        if template::resource_checksum(&bytes) != *stored {
            return Err(BatchError::ChecksumMismatch {
                path: batch.geojson.clone(),
            });
        }

        let runids = template::expand_features(&batch.template.pattern, &bytes)?;
        tracing::info!(batch = %batch.name, children = runids.len(), "batch fan-out");

        let mut children = Vec::with_capacity(runids.len());
        for runid in &runids {
            let child_wd = self.registry.wd_for(runid);
            rundir::clone_run_dir(&batch.template_dir, &child_wd, Some(runid))?;
            children.push(self.pool.submit(
                runid,
                ChildJob {
                    runid: runid.clone(),
                    pipeline: Arc::clone(&pipeline),
                },
            ));
        }

        let completion = self.pool.submit_after(
            children.clone(),
            &batch.name,
            CompletionJob {
                batch: batch.name.clone(),
            },
        );
        Ok(BatchHandles {
            children,
            completion,
        })
    }
}
