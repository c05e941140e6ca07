//! Worker pool: tokio tasks pulling jobs from the durable queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, error, info};
use tokio::task::JoinHandle;

use crate::db::queue_repo;
use crate::worker::runner::{process_claimed_job, WorkerContext};

pub struct WorkerPool {
    shutdown: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `worker_count` claim-and-process loops plus one stale-claim
    /// sweeper.
    ///
    /// # Panics
    /// Panics if `worker_count` is 0.
    pub fn start(ctx: WorkerContext, worker_count: usize) -> Self {
        assert!(worker_count > 0, "worker_count must be > 0");
        let shutdown = Arc::new(AtomicBool::new(false));

        let mut handles = Vec::with_capacity(worker_count + 1);
        for worker_id in 0..worker_count {
            let worker_ctx = ctx.clone();
            let flag = Arc::clone(&shutdown);
            handles.push(tokio::spawn(async move {
                run_worker(worker_id, worker_ctx, flag).await;
            }));
        }

        let sweeper_ctx = ctx.clone();
        let flag = Arc::clone(&shutdown);
        handles.push(tokio::spawn(async move {
            run_sweeper(sweeper_ctx, flag).await;
        }));

        info!("Started {} fiscal workers", worker_count);
        Self { shutdown, handles }
    }

    /// Signals all workers to stop after their current job.
    pub fn shutdown(&self) {
        info!("Shutting down worker pool...");
        self.shutdown.store(true, Ordering::Relaxed);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Waits for every worker to exit. Call [`shutdown`](Self::shutdown)
    /// first, or this waits forever.
    pub async fn wait(&mut self) {
        for (i, handle) in self.handles.drain(..).enumerate() {
            if let Err(e) = handle.await {
                error!("Worker task {} panicked: {}", i, e);
            } else {
                debug!("Worker task {} finished", i);
            }
        }
        info!("All workers have stopped");
    }
}

async fn run_worker(worker_id: usize, ctx: WorkerContext, shutdown: Arc<AtomicBool>) {
    let claimant = format!("worker-{}", worker_id);
    debug!("Worker {} started", claimant);

    while !shutdown.load(Ordering::Relaxed) {
        match queue_repo::claim(&ctx.db, &claimant) {
            Ok(Some(job)) => {
                ctx.broadcaster.publish_job(&job);
                if let Err(e) = process_claimed_job(&ctx, job).await {
                    error!("Worker {}: job processing error: {}", claimant, e);
                }
                // Immediately look for the next job; only idle workers sleep.
            }
            Ok(None) => {
                tokio::time::sleep(ctx.settings.poll_interval).await;
            }
            Err(e) => {
                error!("Worker {}: claim failed: {}", claimant, e);
                tokio::time::sleep(ctx.settings.poll_interval).await;
            }
        }
    }

    debug!("Worker {} exited", claimant);
}

/// Periodically returns orphaned processing claims to the queue so a
/// crashed worker cannot strand a job forever.
async fn run_sweeper(ctx: WorkerContext, shutdown: Arc<AtomicBool>) {
    let stale_after = chrono::Duration::from_std(ctx.settings.stale_after)
        .unwrap_or_else(|_| chrono::Duration::seconds(120));
    // Sweep a few times per staleness window.
    let interval = ctx
        .settings
        .stale_after
        .checked_div(4)
        .unwrap_or(ctx.settings.poll_interval)
        .max(ctx.settings.poll_interval);

    while !shutdown.load(Ordering::Relaxed) {
        tokio::time::sleep(interval).await;

        match queue_repo::sweep_stale(&ctx.db, stale_after) {
            Ok(affected) => {
                for job in &affected {
                    log::warn!("Reclaimed stale job {} (now {})", job.id, job.status);
                    ctx.broadcaster.publish_job(job);
                }
            }
            Err(e) => error!("Stale sweep failed: {}", e),
        }
    }
}
