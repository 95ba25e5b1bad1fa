use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use codeflux_core::{
    ChangeKind, ChangeRecord, InvalidationCategory, Job, JobOrigin, Priority, ReleasedBatch,
    Repository,
};

/// Follow-up decided for one change record after invalidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowUp {
    /// First-time analysis of a newly created file.
    FullAnalysis,
    /// Re-analysis of a file whose content actually changed.
    Analyze,
    /// Content hash unchanged; nothing to re-analyze.
    Skip,
    /// Deleted file: index entries removed, no job for the path itself.
    Cleanup,
}

/// Applies each released change to the repository's derived state: drops
/// cached entries for the path, cascades the drop to transitive dependents,
/// and decides what analysis work (if any) the change requires. Resulting
/// jobs go out on the job channel toward the scheduler.
pub struct InvalidationEngine {
    repository: Arc<dyn Repository>,
    /// Content hash recorded the last time each path was slated for
    /// analysis; the unchanged-content check compares against this.
    last_hashes: HashMap<PathBuf, String>,
    job_tx: mpsc::Sender<Job>,
}

impl InvalidationEngine {
    pub fn new(repository: Arc<dyn Repository>, job_tx: mpsc::Sender<Job>) -> Self {
        Self {
            repository,
            last_hashes: HashMap::new(),
            job_tx,
        }
    }

    /// Seed the last-seen hash for a path, e.g. from a startup scan.
    pub fn prime_hash(&mut self, path: impl Into<PathBuf>, hash: impl Into<String>) {
        self.last_hashes.insert(path.into(), hash.into());
    }

    pub async fn run(mut self, mut rx: mpsc::Receiver<ReleasedBatch>) {
        while let Some(batch) = rx.recv().await {
            self.process_batch(batch).await;
        }
        debug!("batch channel closed, invalidation engine stopping");
    }

    /// Handle one released batch in its given order. A fault on one path is
    /// logged and leaves that path conservatively stale; it never stops the
    /// remaining records of the batch.
    pub async fn process_batch(&mut self, batch: ReleasedBatch) -> Vec<(PathBuf, FollowUp)> {
        let mut verdicts = Vec::with_capacity(batch.records.len());
        let mut direct: Vec<PathBuf> = Vec::new();
        let mut direct_set: HashSet<PathBuf> = HashSet::new();
        let mut affected: Vec<PathBuf> = Vec::new();
        let mut affected_set: HashSet<PathBuf> = HashSet::new();

        for record in &batch.records {
            let dependents = self.invalidate_with_dependents(&record.path).await;
            let verdict = self.decide(record).await;
            verdicts.push((record.path.clone(), verdict));

            match verdict {
                FollowUp::FullAnalysis | FollowUp::Analyze => {
                    if direct_set.insert(record.path.clone()) {
                        direct.push(record.path.clone());
                    }
                }
                FollowUp::Skip => {
                    // Dependents were already invalidated above, but an
                    // unchanged file propagates no re-analysis.
                    continue;
                }
                FollowUp::Cleanup => {}
            }

            for dependent in dependents {
                if dependent == record.path {
                    continue;
                }
                if affected_set.insert(dependent.clone()) {
                    affected.push(dependent);
                }
            }
        }

        for path in &direct {
            self.submit(path, Priority::Medium).await;
        }
        for path in &affected {
            if direct_set.contains(path) {
                continue;
            }
            self.submit(path, Priority::Low).await;
        }

        verdicts
    }

    /// Step 1 and 2: drop derived entries for the path itself, then for
    /// every transitive dependent the repository knows about.
    async fn invalidate_with_dependents(&self, path: &Path) -> HashSet<PathBuf> {
        self.invalidate_path(path).await;

        let dependents = match self.repository.get_dependents(path).await {
            Ok(dependents) => dependents,
            Err(e) => {
                warn!("dependent lookup failed for {:?}: {}", path, e);
                HashSet::new()
            }
        };
        for dependent in &dependents {
            self.invalidate_path(dependent).await;
        }
        dependents
    }

    async fn invalidate_path(&self, path: &Path) {
        for category in InvalidationCategory::ALL {
            if let Err(e) = self.repository.invalidate(path, category).await {
                // Left-over entries are staleness, not corruption; the path
                // gets retried on its next change.
                warn!(
                    "invalidation of {:?} for {:?} failed: {}",
                    category, path, e
                );
            }
        }
    }

    async fn decide(&mut self, record: &ChangeRecord) -> FollowUp {
        match record.kind {
            ChangeKind::Created => {
                match self.repository.content_hash(&record.path).await {
                    Ok(hash) => {
                        self.last_hashes.insert(record.path.clone(), hash);
                    }
                    Err(e) => debug!("no content hash for new {:?}: {}", record.path, e),
                }
                FollowUp::FullAnalysis
            }
            ChangeKind::Modified => match self.repository.content_hash(&record.path).await {
                Ok(hash) => {
                    if self.last_hashes.get(&record.path) == Some(&hash) {
                        debug!("content unchanged for {:?}, skipping", record.path);
                        FollowUp::Skip
                    } else {
                        self.last_hashes.insert(record.path.clone(), hash);
                        FollowUp::Analyze
                    }
                }
                Err(e) => {
                    // Can't prove the content unchanged, so analyze.
                    warn!("content hash failed for {:?}: {}", record.path, e);
                    FollowUp::Analyze
                }
            },
            ChangeKind::Deleted => {
                self.last_hashes.remove(&record.path);
                if let Err(e) = self.repository.remove_index_entry(&record.path).await {
                    warn!("index removal failed for {:?}: {}", record.path, e);
                }
                FollowUp::Cleanup
            }
        }
    }

    async fn submit(&self, path: &Path, priority: Priority) {
        let job = Job::new(path, priority, JobOrigin::Watch);
        if self.job_tx.send(job).await.is_err() {
            warn!("job channel closed, dropping analysis for {:?}", path);
        }
    }
}
