use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use codeflux_cache::InvalidationEngine;
use codeflux_core::{
    AnalysisResult, Analyzer, EventBus, Job, JobOrigin, PipelineConfig, PipelineEvent, Priority,
    Repository, Result,
};
use codeflux_scheduler::{Scheduler, SchedulerHandle};
use codeflux_watch::{BatchAccumulator, ChangeSource};

const RECORD_CHANNEL_CAPACITY: usize = 1024;
const BATCH_CHANNEL_CAPACITY: usize = 64;
const JOB_CHANNEL_CAPACITY: usize = 256;

/// The assembled pipeline: change source → batch accumulator → invalidation
/// engine → scheduler, one task per stage, all collaborators injected at
/// construction. Owns every task and the watch handle for its lifetime.
pub struct Pipeline {
    handle: SchedulerHandle,
    events: EventBus,
    watch_guard: Option<codeflux_watch::WatchGuard>,
    scheduler_task: JoinHandle<()>,
    stage_tasks: Vec<JoinHandle<()>>,
}

impl Pipeline {
    /// Wire up and start every stage. With `index_on_start` set, the watched
    /// roots are enumerated and enqueued so a cold start converges to a
    /// complete index.
    pub async fn start(
        roots: Vec<PathBuf>,
        config: PipelineConfig,
        analyzer: Arc<dyn Analyzer>,
        repository: Arc<dyn Repository>,
    ) -> Result<Self> {
        let config = config.validated()?;
        let events = EventBus::new();
        let mut stage_tasks = Vec::new();

        let (scheduler, handle) = Scheduler::new(analyzer, events.clone(), &config);
        let scheduler_task = tokio::spawn(scheduler.run());

        let (job_tx, job_rx) = mpsc::channel(JOB_CHANNEL_CAPACITY);
        stage_tasks.push(tokio::spawn(handle.clone().pump_jobs(job_rx)));

        let engine = InvalidationEngine::new(repository, job_tx);
        let (batch_tx, batch_rx) = mpsc::channel(BATCH_CHANNEL_CAPACITY);
        stage_tasks.push(tokio::spawn(engine.run(batch_rx)));

        let (record_tx, record_rx) = mpsc::channel(RECORD_CHANNEL_CAPACITY);
        let accumulator = BatchAccumulator::new(&config, events.clone(), batch_tx);
        stage_tasks.push(tokio::spawn(accumulator.run(record_rx)));

        let source = ChangeSource::new(roots.clone(), &config, events.clone())?;
        let tracked = source.scan_tracked_files().await?;
        debug!(files = tracked.len(), "initial scan complete");

        // Watch-handle faults land on the bus; mirror them into the
        // scheduler so it can close its intake while the queue drains.
        stage_tasks.push(tokio::spawn(Self::relay_ingestion_faults(
            events.subscribe(),
            handle.clone(),
        )));

        let watch_guard = source.spawn(record_tx)?;
        events.emit(PipelineEvent::WatchingStart {
            started_at: Utc::now(),
        });
        info!(roots = ?roots, "watching for changes");

        if config.index_on_start && !tracked.is_empty() {
            handle.set_total_expected(tracked.len()).await?;
            for path in tracked {
                handle
                    .enqueue(Job::new(path, Priority::Medium, JobOrigin::OnDemand))
                    .await?;
            }
        }

        Ok(Self {
            handle,
            events,
            watch_guard: Some(watch_guard),
            scheduler_task,
            stage_tasks,
        })
    }

    async fn relay_ingestion_faults(
        mut rx: broadcast::Receiver<PipelineEvent>,
        handle: SchedulerHandle,
    ) {
        loop {
            match rx.recv().await {
                Ok(PipelineEvent::Error { cause }) => {
                    if handle.notify_ingestion_failed(cause).await.is_err() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "fault relay lagged behind the event bus");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    pub fn handle(&self) -> SchedulerHandle {
        self.handle.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    /// Convenience wrapper over the scheduler's on-demand wait.
    pub async fn analyze_and_wait(
        &self,
        path: impl Into<PathBuf>,
        timeout: Duration,
    ) -> Result<AnalysisResult> {
        self.handle.analyze_and_wait(path, timeout).await
    }

    /// Stop observation and intake, let queued work drain, and wait for the
    /// scheduler to finalize and exit before tearing the stages down.
    pub async fn shutdown(mut self) -> Result<()> {
        self.watch_guard.take();
        self.handle.shutdown().await?;
        let _ = self.scheduler_task.await;
        for task in self.stage_tasks.drain(..) {
            task.abort();
        }
        Ok(())
    }
}
