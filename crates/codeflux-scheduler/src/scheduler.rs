use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use codeflux_core::{
    AnalysisResult, Analyzer, ConvergenceMark, EventBus, FluxError, Job, JobOrigin,
    PipelineConfig, PipelineEvent, Priority, Result, SchedulerState,
};

use crate::convergence;
use crate::queue::JobQueue;

const COMMAND_CHANNEL_CAPACITY: usize = 256;
const COMPLETION_CHANNEL_CAPACITY: usize = 64;

enum Command {
    Enqueue(Job),
    AnalyzeAndWait {
        path: PathBuf,
        reply: oneshot::Sender<Result<AnalysisResult>>,
    },
    SetTotalExpected(usize),
    IngestionFailed {
        cause: String,
    },
    Shutdown,
}

struct JobOutcome {
    job: Job,
    result: Result<AnalysisResult>,
}

/// Cheap clonable front door to the scheduler task.
#[derive(Clone)]
pub struct SchedulerHandle {
    cmd_tx: mpsc::Sender<Command>,
}

impl SchedulerHandle {
    pub async fn enqueue(&self, job: Job) -> Result<()> {
        self.cmd_tx
            .send(Command::Enqueue(job))
            .await
            .map_err(|_| FluxError::ChannelClosed("scheduler command channel".into()))
    }

    /// Queue `path` at critical priority (or raise it there) and wait for
    /// its next completed analysis. A timeout abandons only this wait: the
    /// job itself stays queued or in flight.
    pub async fn analyze_and_wait(
        &self,
        path: impl Into<PathBuf>,
        timeout: Duration,
    ) -> Result<AnalysisResult> {
        let path = path.into();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::AnalyzeAndWait {
                path: path.clone(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| FluxError::ChannelClosed("scheduler command channel".into()))?;

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(FluxError::ChannelClosed("analysis waiter dropped".into())),
            Err(_) => Err(FluxError::AnalysisWaitTimeout {
                path,
                waited: timeout,
            }),
        }
    }

    /// Declare how many analyses a bounded run is expected to complete;
    /// completion fires as soon as that many jobs have finished.
    pub async fn set_total_expected(&self, total: usize) -> Result<()> {
        self.cmd_tx
            .send(Command::SetTotalExpected(total))
            .await
            .map_err(|_| FluxError::ChannelClosed("scheduler command channel".into()))
    }

    /// Tell the scheduler the ingestion side died. New watch work is
    /// rejected from here on; queued jobs keep draining.
    pub async fn notify_ingestion_failed(&self, cause: impl Into<String>) -> Result<()> {
        self.cmd_tx
            .send(Command::IngestionFailed {
                cause: cause.into(),
            })
            .await
            .map_err(|_| FluxError::ChannelClosed("scheduler command channel".into()))
    }

    /// Stop intake and let the queue drain; the scheduler task exits once
    /// idle, finalizing if it has not already.
    pub async fn shutdown(&self) -> Result<()> {
        self.cmd_tx
            .send(Command::Shutdown)
            .await
            .map_err(|_| FluxError::ChannelClosed("scheduler command channel".into()))
    }

    /// Forward jobs from a channel (e.g. the invalidation engine's output)
    /// into the scheduler until the channel closes.
    pub async fn pump_jobs(self, mut rx: mpsc::Receiver<Job>) {
        while let Some(job) = rx.recv().await {
            if self.enqueue(job).await.is_err() {
                break;
            }
        }
    }
}

/// The orchestrator: one task owning every piece of scheduling state. All
/// mutation happens here between await points; the bounded analysis tasks
/// only ever talk back through the completion channel.
pub struct Scheduler {
    state: SchedulerState,
    queue: JobQueue,
    in_flight: HashSet<PathBuf>,
    /// Jobs popped while their path was in flight; retried when it lands.
    deferred: HashMap<PathBuf, Job>,
    waiters: HashMap<PathBuf, Vec<oneshot::Sender<Result<AnalysisResult>>>>,
    marks: HashMap<PathBuf, ConvergenceMark>,
    results: HashMap<PathBuf, AnalysisResult>,
    refinement_passes: usize,
    confidence_threshold: f32,
    accepting: bool,
    draining: bool,
    finalized: bool,
    analyzer: Arc<dyn Analyzer>,
    events: EventBus,
    cmd_rx: mpsc::Receiver<Command>,
    completion_tx: mpsc::Sender<JobOutcome>,
    completion_rx: mpsc::Receiver<JobOutcome>,
}

impl Scheduler {
    pub fn new(
        analyzer: Arc<dyn Analyzer>,
        events: EventBus,
        config: &PipelineConfig,
    ) -> (Self, SchedulerHandle) {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (completion_tx, completion_rx) = mpsc::channel(COMPLETION_CHANNEL_CAPACITY);
        let scheduler = Self {
            state: SchedulerState::new(config.max_concurrent_analyses, config.max_iterations),
            queue: JobQueue::new(),
            in_flight: HashSet::new(),
            deferred: HashMap::new(),
            waiters: HashMap::new(),
            marks: HashMap::new(),
            results: HashMap::new(),
            refinement_passes: 0,
            confidence_threshold: config.confidence_threshold,
            accepting: true,
            draining: false,
            finalized: false,
            analyzer,
            events,
            cmd_rx,
            completion_tx,
            completion_rx,
        };
        (scheduler, SchedulerHandle { cmd_tx })
    }

    pub async fn run(mut self) {
        let mut commands_open = true;
        loop {
            tokio::select! {
                Some(outcome) = self.completion_rx.recv() => {
                    self.on_outcome(outcome);
                    self.fill_slots();
                    self.maybe_converge();
                }
                cmd = self.cmd_rx.recv(), if commands_open => {
                    match cmd {
                        Some(cmd) => {
                            self.on_command(cmd);
                            self.fill_slots();
                        }
                        None => {
                            commands_open = false;
                            self.draining = true;
                            self.maybe_converge();
                        }
                    }
                }
            }

            if self.draining && self.idle() {
                self.maybe_converge();
                break;
            }
        }
        debug!("scheduler task exiting");
    }

    fn idle(&self) -> bool {
        self.queue.is_empty() && self.in_flight.is_empty()
    }

    fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Enqueue(job) => self.enqueue(job),
            Command::AnalyzeAndWait { path, reply } => {
                if !self.in_flight.contains(&path) {
                    self.enqueue(Job::new(&path, Priority::Critical, JobOrigin::OnDemand));
                }
                self.waiters.entry(path).or_default().push(reply);
            }
            Command::SetTotalExpected(total) => {
                self.state.total_expected = Some(total);
            }
            Command::IngestionFailed { cause } => {
                // The ingestion layer already surfaced the fault on the bus;
                // here it only closes the intake. Queued jobs keep draining.
                warn!("ingestion failed, rejecting further watch work: {}", cause);
                self.accepting = false;
            }
            Command::Shutdown => {
                self.accepting = false;
                self.draining = true;
            }
        }
    }

    fn enqueue(&mut self, job: Job) {
        if !self.accepting && job.origin == JobOrigin::Watch {
            warn!(
                "intake stopped, dropping watch job for {:?}",
                job.file_path
            );
            return;
        }
        let path = job.file_path.clone();
        let effective = self.queue.push(job);
        self.events.emit(PipelineEvent::JobQueued {
            path: path.to_string_lossy().into_owned(),
            priority: effective,
        });
    }

    /// Dispatch until every slot is used or the queue is exhausted.
    fn fill_slots(&mut self) {
        while self.state.has_free_slot() {
            let Some(job) = self.queue.pop() else { break };
            if self.in_flight.contains(&job.file_path) {
                // Path already running: hold the job until it lands instead
                // of running the same file twice at once.
                match self.deferred.get_mut(&job.file_path) {
                    Some(held) => held.priority = held.priority.max(job.priority),
                    None => {
                        self.deferred.insert(job.file_path.clone(), job);
                    }
                }
                continue;
            }
            self.dispatch(job);
        }
    }

    fn dispatch(&mut self, job: Job) {
        self.in_flight.insert(job.file_path.clone());
        self.state.active_jobs += 1;
        self.events.emit(PipelineEvent::JobProgress {
            path: job.file_path.to_string_lossy().into_owned(),
            percent: 0,
        });
        debug!(
            path = ?job.file_path,
            priority = %job.priority,
            active = self.state.active_jobs,
            "dispatching analysis"
        );

        let analyzer = self.analyzer.clone();
        let completion_tx = self.completion_tx.clone();
        tokio::spawn(async move {
            let result = analyzer.analyze(&job).await;
            let _ = completion_tx.send(JobOutcome { job, result }).await;
        });
    }

    fn on_outcome(&mut self, outcome: JobOutcome) {
        let path = outcome.job.file_path.clone();
        self.state.active_jobs = self.state.active_jobs.saturating_sub(1);
        self.in_flight.remove(&path);
        self.state.processed_count += 1;

        // A job that arrived for this path mid-flight becomes eligible now.
        if let Some(held) = self.deferred.remove(&path) {
            self.queue.push(held);
        }

        match outcome.result {
            Ok(result) => {
                let mark = self.marks.entry(path.clone()).or_default();
                mark.suggestions = result.suggestions.clone();
                self.results.insert(path.clone(), result.clone());

                let path_str = path.to_string_lossy().into_owned();
                self.events.emit(PipelineEvent::JobProgress {
                    path: path_str.clone(),
                    percent: 100,
                });
                self.events.emit(PipelineEvent::JobComplete {
                    path: path_str,
                    result: result.clone(),
                });
                self.resolve_waiters(&path, &Ok(result));
            }
            Err(e) => {
                let message = e.to_string();
                warn!("analysis failed for {:?}: {}", path, message);
                self.events.emit(PipelineEvent::JobError {
                    path: path.to_string_lossy().into_owned(),
                    error: message.clone(),
                });
                self.resolve_waiters(&path, &Err(message));
            }
        }

        if let Some(total) = self.state.total_expected {
            if self.state.processed_count >= total {
                self.finalize();
            }
        }
    }

    fn resolve_waiters(
        &mut self,
        path: &PathBuf,
        outcome: &std::result::Result<AnalysisResult, String>,
    ) {
        let Some(waiters) = self.waiters.remove(path) else {
            return;
        };
        for waiter in waiters {
            let response = match outcome {
                Ok(result) => Ok(result.clone()),
                Err(message) => Err(FluxError::Analysis {
                    path: path.clone(),
                    message: message.clone(),
                }),
            };
            let _ = waiter.send(response);
        }
    }

    /// Queue drained and nothing in flight: run one convergence evaluation.
    /// Faults here reset the iteration flag and stop the loop, nothing more.
    fn maybe_converge(&mut self) {
        if self.finalized || !self.idle() {
            return;
        }
        if self.draining {
            self.finalize();
            return;
        }
        if let Err(e) = self.converge_step() {
            warn!("convergence pass failed, stopping iteration: {}", e);
            self.state.is_iterating = false;
        }
    }

    fn converge_step(&mut self) -> Result<()> {
        if self.state.iteration >= self.state.max_iterations {
            self.finalize();
            return Ok(());
        }

        let selected = convergence::select_candidates(&self.marks, self.confidence_threshold);
        if selected.is_empty() {
            // Nothing left to refine: pin the loop shut so a later unrelated
            // queue drain cannot restart it.
            self.state.iteration = self.state.max_iterations;
            self.finalize();
            return Ok(());
        }

        self.state.iteration += 1;
        self.refinement_passes += 1;
        self.state.is_iterating = true;
        info!(
            pass = self.state.iteration,
            files = selected.len(),
            "starting refinement pass"
        );

        for path in selected {
            if let Some(mark) = self.marks.get_mut(&path) {
                mark.iteration_refined = true;
            }
            self.enqueue(Job::new(
                path,
                Priority::High,
                JobOrigin::IterativeRefinement,
            ));
        }
        self.fill_slots();
        Ok(())
    }

    fn finalize(&mut self) {
        if self.finalized {
            return;
        }
        self.finalized = true;
        self.state.is_iterating = false;

        let issues = convergence::aggregate_issues(&self.results);
        info!(
            iterations = self.refinement_passes,
            total_files = self.results.len(),
            issues = issues.len(),
            "analysis complete"
        );
        self.events.emit(PipelineEvent::AnalysisComplete {
            iterations: self.refinement_passes,
            total_files: self.results.len(),
            issues,
        });
    }
}
