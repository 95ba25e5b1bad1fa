use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Instant;
use uuid::Uuid;

pub type JobId = Uuid;

/// Normalized kind of a filesystem change. Raw watcher kinds that do not map
/// onto one of these are dropped at normalization time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChangeKind::Created => "created",
            ChangeKind::Modified => "modified",
            ChangeKind::Deleted => "deleted",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for ChangeKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "created" => Ok(ChangeKind::Created),
            "modified" => Ok(ChangeKind::Modified),
            "deleted" => Ok(ChangeKind::Deleted),
            other => Err(format!("unknown change kind: {}", other)),
        }
    }
}

/// A single normalized filesystem change. Immutable once created; while
/// buffered, a later record for the same path supersedes the earlier one.
#[derive(Debug, Clone)]
pub struct ChangeRecord {
    pub path: PathBuf,
    pub kind: ChangeKind,
    pub observed_at: Instant,
    /// Original path for records synthesized from a rename.
    pub raw_source_path: Option<PathBuf>,
}

impl ChangeRecord {
    pub fn new(path: impl Into<PathBuf>, kind: ChangeKind) -> Self {
        Self {
            path: path.into(),
            kind,
            observed_at: Instant::now(),
            raw_source_path: None,
        }
    }

    pub fn renamed_from(path: impl Into<PathBuf>, kind: ChangeKind, source: PathBuf) -> Self {
        Self {
            path: path.into(),
            kind,
            observed_at: Instant::now(),
            raw_source_path: Some(source),
        }
    }
}

/// A set of change records released together once they aged past the
/// debounce window, ordered deleted → created → modified.
#[derive(Debug, Clone, Default)]
pub struct ReleasedBatch {
    pub records: Vec<ChangeRecord>,
    /// True when the release was large enough to have tripped mass-change
    /// handling upstream.
    pub mass: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Critical => "critical",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobOrigin {
    Watch,
    OnDemand,
    IterativeRefinement,
}

/// A scheduled unit of analysis work for one file path. The queue holds at
/// most one job per path; re-submission raises the existing entry's priority
/// instead of inserting a second one.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub file_path: PathBuf,
    pub priority: Priority,
    pub enqueued_at: Instant,
    pub origin: JobOrigin,
}

impl Job {
    pub fn new(file_path: impl Into<PathBuf>, priority: Priority, origin: JobOrigin) -> Self {
        Self {
            id: Uuid::new_v4(),
            file_path: file_path.into(),
            priority,
            enqueued_at: Instant::now(),
            origin,
        }
    }
}

/// Category of derived state invalidated when a file changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InvalidationCategory {
    IndexFacts,
    RiskScores,
    ImpactMaps,
}

impl InvalidationCategory {
    pub const ALL: [InvalidationCategory; 3] = [
        InvalidationCategory::IndexFacts,
        InvalidationCategory::RiskScores,
        InvalidationCategory::ImpactMaps,
    ];
}

/// A semantic connection proposed by the enrichment step, with the
/// analyzer's confidence in it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSuggestion {
    pub from: PathBuf,
    pub to: String,
    pub confidence: f32,
    pub resolved: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IssueSeverity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexIssue {
    pub path: PathBuf,
    pub message: String,
    pub severity: IssueSeverity,
}

/// Output of one analysis call for one file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub path: PathBuf,
    pub suggestions: Vec<ConnectionSuggestion>,
    pub issues: Vec<IndexIssue>,
    /// Whether a previously ambiguous orphan/connection for this file was
    /// resolved by this pass.
    pub orphan_resolved: bool,
}

impl AnalysisResult {
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            suggestions: Vec::new(),
            issues: Vec::new(),
            orphan_resolved: false,
        }
    }
}

/// Per-file refinement bookkeeping for the convergence loop.
#[derive(Debug, Clone, Default)]
pub struct ConvergenceMark {
    pub iteration_refined: bool,
    pub suggestions: Vec<ConnectionSuggestion>,
}

/// Counters owned by the scheduler task. Mutated only on job-start,
/// job-complete and job-error transitions.
#[derive(Debug, Clone)]
pub struct SchedulerState {
    pub active_jobs: usize,
    pub max_concurrent: usize,
    pub processed_count: usize,
    pub total_expected: Option<usize>,
    pub iteration: usize,
    pub max_iterations: usize,
    pub is_iterating: bool,
}

impl SchedulerState {
    pub fn new(max_concurrent: usize, max_iterations: usize) -> Self {
        Self {
            active_jobs: 0,
            max_concurrent,
            processed_count: 0,
            total_expected: None,
            iteration: 0,
            max_iterations,
            is_iterating: false,
        }
    }

    pub fn has_free_slot(&self) -> bool {
        self.active_jobs < self.max_concurrent
    }
}
