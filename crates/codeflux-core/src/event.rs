use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast::{self, Receiver, Sender};

use crate::{AnalysisResult, ChangeKind, IndexIssue, Priority};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Signals the pipeline emits for external subscribers (tool-serving layer,
/// CLI progress, tests). The core never consumes these itself.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload")]
pub enum PipelineEvent {
    ChangeQueued {
        path: String,
        kind: ChangeKind,
    },
    JobQueued {
        path: String,
        priority: Priority,
    },
    JobProgress {
        path: String,
        percent: u8,
    },
    JobComplete {
        path: String,
        result: AnalysisResult,
    },
    JobError {
        path: String,
        error: String,
    },
    AnalysisComplete {
        iterations: usize,
        total_files: usize,
        issues: Vec<IndexIssue>,
    },
    WatchingStart {
        started_at: DateTime<Utc>,
    },
    Error {
        cause: String,
    },
}

/// Broadcast fan-out for [`PipelineEvent`]s. Cloning shares the underlying
/// channel; sends with no live receivers are dropped silently.
#[derive(Clone, Debug)]
pub struct EventBus {
    sender: Sender<PipelineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn emit(&self, event: PipelineEvent) {
        if self.sender.send(event).is_err() {
            // No receivers subscribed; nothing to deliver to.
        }
    }

    pub fn subscribe(&self) -> Receiver<PipelineEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
