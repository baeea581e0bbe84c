//! Dependency scheduler.
//!
//! Periodic passes over the store:
//! - create and enqueue tasks for nodes that became ready;
//! - promote matured retry entries to the ready list;
//! - re-enqueue PENDING/RETRY tasks whose queue reference was lost;
//! - delete runs that finished longer ago than the retention window.
//!
//! Every pass tolerates other scheduler instances running the same pass at
//! the same time: task creation is insert-if-absent and a delayed entry is
//! only promoted by the caller that managed to remove it.

use chrono::Duration as ChronoDuration;
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use db::models::{RunRow, RunStatus};

use crate::{
    EngineContext, EngineError,
    completion::close_run_if_complete,
    dag::{ready_nodes, seed_input, tasks_by_node},
    spawn::spawn_task,
};

/// Counters from one scheduling tick.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerReport {
    pub runs_scanned: usize,
    pub tasks_created: usize,
    pub retries_promoted: usize,
    pub stale_requeued: usize,
}

#[derive(Clone)]
pub struct DependencyScheduler {
    ctx: EngineContext,
}

impl DependencyScheduler {
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    /// Create tasks for every ready node of every RUNNING run.
    ///
    /// A failure on one run is logged and the pass moves on.
    #[instrument(skip(self))]
    pub async fn schedule_ready_tasks(&self) -> Result<(usize, usize), EngineError> {
        let runs = self.ctx.store.list_runs_by_status(RunStatus::Running).await?;
        let mut created = 0;
        for run in &runs {
            match self.schedule_run(run).await {
                Ok(n) => created += n,
                Err(err) => error!(run_id = %run.id, error = %err, "failed to schedule run"),
            }
        }
        if created > 0 {
            info!(runs = runs.len(), created, "scheduled ready tasks");
        }
        Ok((runs.len(), created))
    }

    async fn schedule_run(&self, run: &RunRow) -> Result<usize, EngineError> {
        let workflow = self.ctx.load_workflow(run.workflow_id).await?;
        let tasks = self.ctx.store.list_tasks_for_run(run.id).await?;
        let index = tasks_by_node(&tasks);

        let mut created = 0;
        for node in ready_nodes(&workflow, &tasks) {
            let input = seed_input(&workflow, &node.id, &run.input, &index);
            if spawn_task(&self.ctx, run, node, input).await?.is_some() {
                created += 1;
            }
        }
        if created == 0 {
            // Covers a worker that died between finishing a task and
            // closing the run.
            close_run_if_complete(&self.ctx, run.id).await?;
        }
        Ok(created)
    }

    /// Move matured delayed entries onto the ready list.
    #[instrument(skip(self))]
    pub async fn process_retry_queue(&self) -> Result<usize, EngineError> {
        let now = self.ctx.clock.now();
        let matured = self.ctx.queue.take_matured(now, None).await?;
        let mut promoted = 0;
        for msg in matured {
            match self.ctx.queue.enqueue(msg.task_id).await {
                Ok(()) => promoted += 1,
                Err(err) => warn!(task_id = %msg.task_id, error = %err, "failed to promote retry"),
            }
        }
        if promoted > 0 {
            debug!(promoted, "promoted matured retries");
        }
        Ok(promoted)
    }

    /// Re-enqueue PENDING/RETRY tasks of running runs that have not been
    /// touched for `stale_task_after`.  A duplicate reference is harmless:
    /// only one claim can win.
    #[instrument(skip(self))]
    pub async fn recover_stale_tasks(&self) -> Result<usize, EngineError> {
        let stale_after = ChronoDuration::from_std(self.ctx.config.stale_task_after)
            .unwrap_or_else(|_| ChronoDuration::minutes(5));
        let cutoff = self.ctx.clock.now() - stale_after;
        let stale = self.ctx.store.list_stale_tasks(cutoff).await?;

        let mut requeued = 0;
        for task in &stale {
            self.ctx.store.touch_task(task.id).await?;
            self.ctx.queue.enqueue(task.id).await?;
            requeued += 1;
        }
        if requeued > 0 {
            warn!(requeued, "re-enqueued stale tasks");
        }
        Ok(requeued)
    }

    /// Delete runs (with tasks and logs) that finished before the retention
    /// window.
    #[instrument(skip(self))]
    pub async fn cleanup_completed_runs(&self) -> Result<usize, EngineError> {
        let retention = ChronoDuration::from_std(self.ctx.config.retention)
            .unwrap_or_else(|_| ChronoDuration::hours(24));
        let cutoff = self.ctx.clock.now() - retention;
        let runs = self.ctx.store.list_runs_completed_before(cutoff).await?;

        let mut deleted = 0;
        for run in &runs {
            match self.ctx.store.delete_run(run.id).await {
                Ok(()) => deleted += 1,
                // another instance got there first
                Err(err) if err.is_not_found() => {}
                Err(err) => error!(run_id = %run.id, error = %err, "failed to delete run"),
            }
        }
        if deleted > 0 {
            info!(deleted, "cleaned up completed runs");
        }
        Ok(deleted)
    }

    /// One scheduling tick: retry promotion, ready-task creation and stale
    /// recovery.  Each step's failure is logged without skipping the others.
    pub async fn run_once(&self) -> SchedulerReport {
        let mut report = SchedulerReport::default();

        match self.process_retry_queue().await {
            Ok(n) => report.retries_promoted = n,
            Err(err) => error!(error = %err, "retry promotion failed"),
        }
        match self.schedule_ready_tasks().await {
            Ok((runs, created)) => {
                report.runs_scanned = runs;
                report.tasks_created = created;
            }
            Err(err) => error!(error = %err, "scheduling pass failed"),
        }
        match self.recover_stale_tasks().await {
            Ok(n) => report.stale_requeued = n,
            Err(err) => error!(error = %err, "stale-task recovery failed"),
        }
        report
    }

    /// Tick every `scheduler_interval` and clean up every `cleanup_interval`
    /// until `shutdown` fires.  Both first ticks happen immediately.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut schedule = tokio::time::interval(self.ctx.config.scheduler_interval);
        schedule.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut cleanup = tokio::time::interval(self.ctx.config.cleanup_interval);
        cleanup.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            interval_secs = self.ctx.config.scheduler_interval.as_secs(),
            cleanup_secs = self.ctx.config.cleanup_interval.as_secs(),
            "scheduler started"
        );
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = schedule.tick() => {
                    self.run_once().await;
                }
                _ = cleanup.tick() => {
                    if let Err(err) = self.cleanup_completed_runs().await {
                        error!(error = %err, "cleanup pass failed");
                    }
                }
            }
        }
        info!("scheduler stopped");
    }
}
