use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use notify::{
    event::{ModifyKind, RenameMode},
    Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use codeflux_core::{
    ChangeKind, ChangeRecord, EventBus, FluxError, PipelineConfig, PipelineEvent, Result,
};

/// Directory components never worth watching: version control, build output,
/// editor state and the pipeline's own data directory.
const EXCLUDED_DIRS: &[&str] = &[
    ".git",
    ".hg",
    ".svn",
    "target",
    "node_modules",
    "dist",
    "build",
    ".idea",
    ".vscode",
    ".codeflux",
];

fn default_extensions() -> HashSet<String> {
    [
        "rs", "ts", "tsx", "js", "jsx", "py", "go", "java", "cpp", "cc", "hpp", "h", "c",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Observes the filesystem and turns raw watch events into a stream of
/// normalized [`ChangeRecord`]s, filtered down to relevant source files.
pub struct ChangeSource {
    roots: Vec<PathBuf>,
    extensions: HashSet<String>,
    include_globs: Option<GlobSet>,
    ignore_matchers: Vec<(PathBuf, Gitignore)>,
    /// path -> content hash; distinguishes first-seen paths from real
    /// modifications when the OS reports ambiguous event kinds.
    registry: Arc<DashMap<PathBuf, String>>,
    events: EventBus,
}

/// Keeps the underlying watch handle and the normalization task alive.
/// Dropping it stops observation; the record channel closes with it.
pub struct WatchGuard {
    _watcher: RecommendedWatcher,
    forwarder: JoinHandle<()>,
}

impl Drop for WatchGuard {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

impl ChangeSource {
    pub fn new(
        roots: impl IntoIterator<Item = PathBuf>,
        config: &PipelineConfig,
        events: EventBus,
    ) -> Result<Self> {
        let roots: Vec<PathBuf> = roots.into_iter().collect();

        let include_globs = if config.include_globs.is_empty() {
            None
        } else {
            let mut builder = GlobSetBuilder::new();
            for pattern in &config.include_globs {
                let glob = Glob::new(pattern)
                    .map_err(|e| FluxError::Watch(format!("bad include glob {pattern:?}: {e}")))?;
                builder.add(glob);
            }
            Some(
                builder
                    .build()
                    .map_err(|e| FluxError::Watch(format!("glob set: {e}")))?,
            )
        };

        let mut ignore_matchers = Vec::new();
        for root in &roots {
            let gi_path = root.join(".gitignore");
            if gi_path.exists() {
                let mut builder = GitignoreBuilder::new(root);
                builder.add(gi_path);
                match builder.build() {
                    Ok(gi) => ignore_matchers.push((root.clone(), gi)),
                    Err(e) => warn!("failed to load .gitignore for {:?}: {:?}", root, e),
                }
            }
        }

        Ok(Self {
            roots,
            extensions: default_extensions(),
            include_globs,
            ignore_matchers,
            registry: Arc::new(DashMap::new()),
            events,
        })
    }

    pub fn is_relevant(&self, path: &Path) -> bool {
        if path.components().any(|comp| {
            comp.as_os_str()
                .to_str()
                .is_some_and(|c| EXCLUDED_DIRS.contains(&c))
        }) {
            return false;
        }
        for (_, matcher) in &self.ignore_matchers {
            if matcher.matched_path_or_any_parents(path, false).is_ignore() {
                return false;
            }
        }
        if let Some(globs) = &self.include_globs {
            return globs.is_match(path);
        }
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| self.extensions.contains(ext))
    }

    /// Walk the roots and prime the registry, returning every relevant file.
    /// Used for the startup full-index pass.
    pub async fn scan_tracked_files(&self) -> Result<Vec<PathBuf>> {
        let mut found = Vec::new();
        let mut stack: Vec<PathBuf> = self.roots.clone();

        while let Some(dir) = stack.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if path.is_dir() {
                    let excluded = path
                        .file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| EXCLUDED_DIRS.contains(&n));
                    if !excluded {
                        stack.push(path);
                    }
                } else if self.is_relevant(&path) {
                    match hash_file(&path).await {
                        Ok(hash) => {
                            self.registry.insert(path.clone(), hash);
                            found.push(path);
                        }
                        Err(e) => debug!("skipping unreadable file {:?}: {:?}", path, e),
                    }
                }
            }
        }

        Ok(found)
    }

    /// Start observing. Emits normalized records on `tx` until the guard is
    /// dropped. Watch-handle faults surface on the event bus as
    /// [`PipelineEvent::Error`]; the record stream itself never restarts.
    pub fn spawn(self, tx: mpsc::Sender<ChangeRecord>) -> Result<WatchGuard> {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel::<Event>();
        let error_bus = self.events.clone();

        let mut watcher = notify::recommended_watcher(
            move |result: std::result::Result<Event, notify::Error>| match result {
                Ok(event) => {
                    let _ = raw_tx.send(event);
                }
                Err(e) => {
                    error!("watch handle fault: {:?}", e);
                    error_bus.emit(PipelineEvent::Error {
                        cause: format!("watch handle fault: {e}"),
                    });
                }
            },
        )
        .map_err(|e| FluxError::Watch(e.to_string()))?;

        for root in &self.roots {
            watcher
                .watch(root, RecursiveMode::Recursive)
                .map_err(|e| FluxError::Watch(format!("watch {:?}: {e}", root)))?;
        }

        let forwarder = tokio::spawn(self.forward_events(raw_rx, tx));

        Ok(WatchGuard {
            _watcher: watcher,
            forwarder,
        })
    }

    async fn forward_events(
        self,
        mut raw_rx: mpsc::UnboundedReceiver<Event>,
        tx: mpsc::Sender<ChangeRecord>,
    ) {
        while let Some(event) = raw_rx.recv().await {
            for record in self.normalize(event).await {
                if tx.send(record).await.is_err() {
                    debug!("record channel closed, stopping normalization");
                    return;
                }
            }
        }
    }

    /// Map one raw watch event onto zero or more normalized records. Renames
    /// become a delete of the old path plus a create of the new one.
    async fn normalize(&self, event: Event) -> Vec<ChangeRecord> {
        let mut records = Vec::new();

        match &event.kind {
            EventKind::Modify(ModifyKind::Name(
                RenameMode::Both | RenameMode::From | RenameMode::To,
            )) if event.paths.len() == 2 => {
                let from = event.paths[0].clone();
                let to = event.paths[1].clone();
                if self.is_relevant(&from) {
                    self.registry.remove(&from);
                    records.push(ChangeRecord::new(from.clone(), ChangeKind::Deleted));
                }
                if self.is_relevant(&to) {
                    if let Ok(hash) = hash_file(&to).await {
                        self.registry.insert(to.clone(), hash);
                        records.push(ChangeRecord::renamed_from(to, ChangeKind::Created, from));
                    }
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
                for path in event.paths.iter().filter(|p| self.is_relevant(p)) {
                    self.registry.remove(path.as_path());
                    records.push(ChangeRecord::new(path.clone(), ChangeKind::Deleted));
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::To)) | EventKind::Create(_) => {
                for path in event.paths.iter().filter(|p| self.is_relevant(p)) {
                    match hash_file(path).await {
                        Ok(hash) => {
                            self.registry.insert(path.clone(), hash);
                            records.push(ChangeRecord::new(path.clone(), ChangeKind::Created));
                        }
                        Err(e) => debug!("transient create for {:?}: {:?}", path, e),
                    }
                }
            }
            EventKind::Modify(
                ModifyKind::Data(_) | ModifyKind::Any | ModifyKind::Metadata(_),
            ) => {
                for path in event.paths.iter().filter(|p| self.is_relevant(p)) {
                    match hash_file(path).await {
                        Ok(hash) => {
                            let kind = if self.registry.contains_key(path.as_path()) {
                                ChangeKind::Modified
                            } else {
                                // First sighting of this path, treat as creation.
                                ChangeKind::Created
                            };
                            self.registry.insert(path.clone(), hash);
                            records.push(ChangeRecord::new(path.clone(), kind));
                        }
                        Err(e) => debug!("transient modify for {:?}: {:?}", path, e),
                    }
                }
            }
            EventKind::Remove(_) => {
                for path in event.paths.iter().filter(|p| self.is_relevant(p)) {
                    self.registry.remove(path.as_path());
                    records.push(ChangeRecord::new(path.clone(), ChangeKind::Deleted));
                }
            }
            EventKind::Access(_) => {}
            other => {
                warn!("dropping unrecognized watch event kind {:?}", other);
            }
        }

        records
    }
}

async fn hash_file(path: &Path) -> Result<String> {
    let content = fs::read(path).await?;
    let mut hasher = Sha256::new();
    hasher.update(&content);
    Ok(format!("{:x}", hasher.finalize()))
}
