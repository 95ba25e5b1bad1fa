use crate::{AnalysisResult, InvalidationCategory, Job, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// External analysis step. May call into a slow enrichment service; the
/// scheduler only ever sees completion or failure.
#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(&self, job: &Job) -> Result<AnalysisResult>;
}

/// Persistent store of indexed facts and the dependency graph. The pipeline
/// reads dependents and invalidates derived entries; the only mutation it
/// performs is removing entries for deleted paths.
#[async_trait]
pub trait Repository: Send + Sync {
    async fn invalidate(&self, path: &Path, category: InvalidationCategory) -> Result<()>;

    /// Files whose indexed facts were derived partly from `path`.
    async fn get_dependents(&self, path: &Path) -> Result<HashSet<PathBuf>>;

    async fn remove_index_entry(&self, path: &Path) -> Result<()>;

    /// Hash of the path's current content, for unchanged-content detection.
    async fn content_hash(&self, path: &Path) -> Result<String>;
}
