use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use codeflux_core::{
    AnalysisResult, Analyzer, ConnectionSuggestion, EventBus, FluxError, Job, JobOrigin,
    PipelineConfig, PipelineEvent, Priority, Result,
};
use codeflux_scheduler::{Scheduler, SchedulerHandle};

/// Analyzer double: fixed latency, per-path scripted confidence/failures,
/// and bookkeeping to check concurrency bounds and per-path exclusion.
struct MockAnalyzer {
    delay: Duration,
    active: AtomicUsize,
    max_active: AtomicUsize,
    per_path_active: Mutex<HashMap<PathBuf, usize>>,
    overlap_seen: AtomicBool,
    calls: Mutex<Vec<(PathBuf, JobOrigin)>>,
    fail_paths: Mutex<HashSet<PathBuf>>,
    confidence: Mutex<HashMap<PathBuf, f32>>,
}

impl MockAnalyzer {
    fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            per_path_active: Mutex::new(HashMap::new()),
            overlap_seen: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
            fail_paths: Mutex::new(HashSet::new()),
            confidence: Mutex::new(HashMap::new()),
        })
    }

    fn fail_on(&self, path: &str) {
        self.fail_paths.lock().insert(PathBuf::from(path));
    }

    fn suggest_with_confidence(&self, path: &str, confidence: f32) {
        self.confidence.lock().insert(PathBuf::from(path), confidence);
    }

    fn calls(&self) -> Vec<(PathBuf, JobOrigin)> {
        self.calls.lock().clone()
    }

    fn calls_for(&self, path: &str) -> usize {
        let path = PathBuf::from(path);
        self.calls.lock().iter().filter(|(p, _)| *p == path).count()
    }
}

#[async_trait]
impl Analyzer for MockAnalyzer {
    async fn analyze(&self, job: &Job) -> Result<AnalysisResult> {
        self.calls
            .lock()
            .push((job.file_path.clone(), job.origin));
        {
            let mut per_path = self.per_path_active.lock();
            let count = per_path.entry(job.file_path.clone()).or_insert(0);
            *count += 1;
            if *count > 1 {
                self.overlap_seen.store(true, Ordering::SeqCst);
            }
        }
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);

        tokio::time::sleep(self.delay).await;

        self.active.fetch_sub(1, Ordering::SeqCst);
        if let Some(count) = self.per_path_active.lock().get_mut(&job.file_path) {
            *count -= 1;
        }

        if self.fail_paths.lock().contains(&job.file_path) {
            return Err(FluxError::Analysis {
                path: job.file_path.clone(),
                message: "enrichment backend unavailable".into(),
            });
        }

        let mut result = AnalysisResult::empty(&job.file_path);
        if let Some(confidence) = self.confidence.lock().get(&job.file_path) {
            result.suggestions.push(ConnectionSuggestion {
                from: job.file_path.clone(),
                to: "resolved::target".into(),
                confidence: *confidence,
                resolved: false,
            });
        }
        Ok(result)
    }
}

fn start_scheduler(
    analyzer: Arc<MockAnalyzer>,
    config: PipelineConfig,
) -> (SchedulerHandle, EventBus) {
    let events = EventBus::new();
    let (scheduler, handle) = Scheduler::new(analyzer, events.clone(), &config);
    tokio::spawn(scheduler.run());
    (handle, events)
}

fn watch_job(path: &str) -> Job {
    Job::new(path, Priority::Medium, JobOrigin::Watch)
}

async fn wait_for_analysis_complete(
    rx: &mut broadcast::Receiver<PipelineEvent>,
    timeout: Duration,
) -> (usize, usize) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .expect("timed out waiting for completion event");
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Ok(PipelineEvent::AnalysisComplete {
                iterations,
                total_files,
                ..
            })) => return (iterations, total_files),
            Ok(Ok(_)) => continue,
            Ok(Err(e)) => panic!("event bus closed: {e:?}"),
            Err(_) => panic!("timed out waiting for completion event"),
        }
    }
}

#[tokio::test]
async fn bounded_concurrency_dispatches_third_job_after_a_completion() {
    // Scenario: maxConcurrent = 2, three jobs enqueued.
    let analyzer = MockAnalyzer::with_delay(Duration::from_millis(300));
    let config = PipelineConfig {
        max_concurrent_analyses: 2,
        ..Default::default()
    };
    let (handle, _events) = start_scheduler(analyzer.clone(), config);

    for path in ["one.rs", "two.rs", "three.rs"] {
        handle.enqueue(watch_job(path)).await.unwrap();
    }

    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(analyzer.calls().len(), 2, "only two may start immediately");

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(analyzer.calls().len(), 3, "third starts after a completion");
    assert!(analyzer.max_active.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn active_jobs_never_exceed_configured_cap() {
    let analyzer = MockAnalyzer::with_delay(Duration::from_millis(60));
    let config = PipelineConfig {
        max_concurrent_analyses: 3,
        ..Default::default()
    };
    let (handle, _events) = start_scheduler(analyzer.clone(), config);

    for i in 0..12 {
        handle.enqueue(watch_job(&format!("src/f{i}.rs"))).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(600)).await;

    assert_eq!(analyzer.calls().len(), 12);
    assert!(
        analyzer.max_active.load(Ordering::SeqCst) <= 3,
        "observed {} concurrent analyses",
        analyzer.max_active.load(Ordering::SeqCst)
    );
}

#[tokio::test]
async fn same_path_never_runs_twice_at_once() {
    let analyzer = MockAnalyzer::with_delay(Duration::from_millis(200));
    let (handle, _events) = start_scheduler(analyzer.clone(), PipelineConfig::default());

    handle.enqueue(watch_job("hot.rs")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    // Re-submitted while the first run is still in flight.
    handle
        .enqueue(Job::new("hot.rs", Priority::Critical, JobOrigin::OnDemand))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(analyzer.calls_for("hot.rs"), 1, "second run must wait");

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(analyzer.calls_for("hot.rs"), 2, "second run follows the first");
    assert!(
        !analyzer.overlap_seen.load(Ordering::SeqCst),
        "a path overlapped with itself"
    );
}

#[tokio::test]
async fn analyze_and_wait_returns_the_result() {
    let analyzer = MockAnalyzer::with_delay(Duration::from_millis(40));
    let (handle, _events) = start_scheduler(analyzer, PipelineConfig::default());

    let result = handle
        .analyze_and_wait("src/wanted.rs", Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(result.path, PathBuf::from("src/wanted.rs"));
}

#[tokio::test]
async fn analyze_and_wait_timeout_is_distinct_and_abandons_only_the_wait() {
    let analyzer = MockAnalyzer::with_delay(Duration::from_millis(400));
    let (handle, events) = start_scheduler(analyzer.clone(), PipelineConfig::default());
    let mut rx = events.subscribe();

    let err = handle
        .analyze_and_wait("src/slow.rs", Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(
        matches!(err, FluxError::AnalysisWaitTimeout { ref path, .. } if path == &PathBuf::from("src/slow.rs")),
        "unexpected error: {err:?}"
    );

    // The underlying job was not cancelled; it still completes.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .expect("job never completed after wait abandonment");
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Ok(PipelineEvent::JobComplete { path, .. })) if path == "src/slow.rs" => break,
            Ok(Ok(_)) => continue,
            other => panic!("unexpected: {other:?}"),
        }
    }
    assert_eq!(analyzer.calls_for("src/slow.rs"), 1);
}

#[tokio::test]
async fn analyze_and_wait_surfaces_job_failure() {
    let analyzer = MockAnalyzer::with_delay(Duration::from_millis(20));
    analyzer.fail_on("src/broken.rs");
    let (handle, _events) = start_scheduler(analyzer, PipelineConfig::default());

    let err = handle
        .analyze_and_wait("src/broken.rs", Duration::from_secs(2))
        .await
        .unwrap_err();
    assert!(matches!(err, FluxError::Analysis { .. }), "got {err:?}");
}

#[tokio::test]
async fn failing_job_frees_its_slot_for_the_rest() {
    let analyzer = MockAnalyzer::with_delay(Duration::from_millis(30));
    analyzer.fail_on("src/bad.rs");
    let config = PipelineConfig {
        max_concurrent_analyses: 1,
        ..Default::default()
    };
    let (handle, events) = start_scheduler(analyzer.clone(), config);
    let mut rx = events.subscribe();

    for path in ["src/bad.rs", "src/good1.rs", "src/good2.rs"] {
        handle.enqueue(watch_job(path)).await.unwrap();
    }

    let mut errors = 0;
    let mut completions = 0;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while errors + completions < 3 {
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .expect("pipeline stalled after a job failure");
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Ok(PipelineEvent::JobError { .. })) => errors += 1,
            Ok(Ok(PipelineEvent::JobComplete { .. })) => completions += 1,
            Ok(Ok(_)) => continue,
            other => panic!("unexpected: {other:?}"),
        }
    }
    assert_eq!(errors, 1);
    assert_eq!(completions, 2);
    assert_eq!(analyzer.calls().len(), 3);
}

#[tokio::test]
async fn confident_suggestion_triggers_exactly_one_refinement_pass() {
    // Scenario: a suggestion at 0.95 selects the file once; the refinement
    // flag then blocks re-selection.
    let analyzer = MockAnalyzer::with_delay(Duration::from_millis(20));
    analyzer.suggest_with_confidence("src/linked.rs", 0.95);
    let config = PipelineConfig {
        max_iterations: 3,
        ..Default::default()
    };
    let (handle, events) = start_scheduler(analyzer.clone(), config);
    let mut rx = events.subscribe();

    handle.enqueue(watch_job("src/linked.rs")).await.unwrap();

    let (iterations, total_files) =
        wait_for_analysis_complete(&mut rx, Duration::from_secs(3)).await;
    assert_eq!(iterations, 1);
    assert_eq!(total_files, 1);

    let calls = analyzer.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].1, JobOrigin::Watch);
    assert_eq!(calls[1].1, JobOrigin::IterativeRefinement);
}

#[tokio::test]
async fn low_confidence_results_stop_the_loop_immediately() {
    let analyzer = MockAnalyzer::with_delay(Duration::from_millis(20));
    analyzer.suggest_with_confidence("src/vague.rs", 0.4);
    let (handle, events) = start_scheduler(analyzer.clone(), PipelineConfig::default());
    let mut rx = events.subscribe();

    handle.enqueue(watch_job("src/vague.rs")).await.unwrap();

    let (iterations, _) = wait_for_analysis_complete(&mut rx, Duration::from_secs(3)).await;
    assert_eq!(iterations, 0);
    assert_eq!(analyzer.calls().len(), 1, "no refinement for weak suggestions");
}

#[tokio::test]
async fn iteration_cap_of_zero_disables_refinement() {
    let analyzer = MockAnalyzer::with_delay(Duration::from_millis(20));
    analyzer.suggest_with_confidence("src/capped.rs", 0.99);
    let config = PipelineConfig {
        max_iterations: 0,
        ..Default::default()
    };
    let (handle, events) = start_scheduler(analyzer.clone(), config);
    let mut rx = events.subscribe();

    handle.enqueue(watch_job("src/capped.rs")).await.unwrap();

    let (iterations, _) = wait_for_analysis_complete(&mut rx, Duration::from_secs(3)).await;
    assert_eq!(iterations, 0);
    assert_eq!(analyzer.calls().len(), 1);
}

#[tokio::test]
async fn completion_signal_fires_exactly_once() {
    let analyzer = MockAnalyzer::with_delay(Duration::from_millis(20));
    let (handle, events) = start_scheduler(analyzer, PipelineConfig::default());
    let mut rx = events.subscribe();

    handle.enqueue(watch_job("src/only.rs")).await.unwrap();
    wait_for_analysis_complete(&mut rx, Duration::from_secs(3)).await;

    // A later drain must not re-run the loop or re-emit completion.
    handle.enqueue(watch_job("src/later.rs")).await.unwrap();

    let mut extra_completions = 0;
    let deadline = tokio::time::Instant::now() + Duration::from_millis(600);
    loop {
        let Some(remaining) = deadline.checked_duration_since(tokio::time::Instant::now()) else {
            break;
        };
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Ok(PipelineEvent::AnalysisComplete { .. })) => extra_completions += 1,
            Ok(Ok(_)) => continue,
            _ => break,
        }
    }
    assert_eq!(extra_completions, 0, "completion emitted a second time");
}

#[tokio::test]
async fn bounded_total_finalizes_when_every_expected_job_landed() {
    let analyzer = MockAnalyzer::with_delay(Duration::from_millis(20));
    let (handle, events) = start_scheduler(analyzer, PipelineConfig::default());
    let mut rx = events.subscribe();

    handle.set_total_expected(2).await.unwrap();
    handle.enqueue(watch_job("src/a.rs")).await.unwrap();
    handle.enqueue(watch_job("src/b.rs")).await.unwrap();

    let (iterations, total_files) =
        wait_for_analysis_complete(&mut rx, Duration::from_secs(3)).await;
    assert_eq!(iterations, 0);
    assert_eq!(total_files, 2);
}

#[tokio::test]
async fn ingestion_failure_stops_watch_intake_but_drains_queue() {
    let analyzer = MockAnalyzer::with_delay(Duration::from_millis(150));
    let config = PipelineConfig {
        max_concurrent_analyses: 1,
        ..Default::default()
    };
    let (handle, _events) = start_scheduler(analyzer.clone(), config);

    handle.enqueue(watch_job("src/queued.rs")).await.unwrap();
    handle
        .notify_ingestion_failed("watch handle lost")
        .await
        .unwrap();
    handle.enqueue(watch_job("src/rejected.rs")).await.unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(analyzer.calls_for("src/queued.rs"), 1, "queued job drains");
    assert_eq!(analyzer.calls_for("src/rejected.rs"), 0, "new watch work rejected");

    // On-demand work is still served.
    let result = handle
        .analyze_and_wait("src/ondemand.rs", Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(result.path, PathBuf::from("src/ondemand.rs"));
}

#[tokio::test]
async fn deferred_resubmission_runs_after_current_flight_lands() {
    // Queue a path, let it dispatch, queue it again, then fill the pool:
    // the held job must still run exactly once more.
    let analyzer = MockAnalyzer::with_delay(Duration::from_millis(100));
    let config = PipelineConfig {
        max_concurrent_analyses: 2,
        ..Default::default()
    };
    let (handle, _events) = start_scheduler(analyzer.clone(), config);

    handle.enqueue(watch_job("src/repeat.rs")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    handle.enqueue(watch_job("src/repeat.rs")).await.unwrap();
    handle.enqueue(watch_job("src/other.rs")).await.unwrap();

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(analyzer.calls_for("src/repeat.rs"), 2);
    assert_eq!(analyzer.calls_for("src/other.rs"), 1);
    assert!(!analyzer.overlap_seen.load(Ordering::SeqCst));
}
