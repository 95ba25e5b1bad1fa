use std::cmp::Reverse;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use priority_queue::PriorityQueue;

use codeflux_core::{Job, Priority};

/// Ranking inside the queue: priority strictly dominates, then insertion
/// order (older first) within a priority band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct JobRank {
    priority: Priority,
    order: Reverse<u64>,
}

/// Priority queue holding at most one job per file path. Pushing a path that
/// is already queued raises the existing entry to the higher of the two
/// priorities; it never creates a second entry and never lowers one.
pub struct JobQueue {
    pq: PriorityQueue<PathBuf, JobRank>,
    jobs: HashMap<PathBuf, Job>,
    seq: u64,
}

impl JobQueue {
    pub fn new() -> Self {
        Self {
            pq: PriorityQueue::new(),
            jobs: HashMap::new(),
            seq: 0,
        }
    }

    /// Insert or reprioritize. Returns the effective priority of the queued
    /// entry after the push.
    pub fn push(&mut self, job: Job) -> Priority {
        if let Some(&existing) = self.pq.get_priority(&job.file_path) {
            let raised = existing.priority.max(job.priority);
            if raised > existing.priority {
                self.pq.change_priority(
                    &job.file_path,
                    JobRank {
                        priority: raised,
                        order: existing.order,
                    },
                );
                if let Some(queued) = self.jobs.get_mut(&job.file_path) {
                    queued.priority = raised;
                }
            }
            return raised;
        }

        self.seq += 1;
        let rank = JobRank {
            priority: job.priority,
            order: Reverse(self.seq),
        };
        let priority = job.priority;
        self.pq.push(job.file_path.clone(), rank);
        self.jobs.insert(job.file_path.clone(), job);
        priority
    }

    /// Highest-priority, oldest-enqueued job.
    pub fn pop(&mut self) -> Option<Job> {
        let (path, rank) = self.pq.pop()?;
        let mut job = self.jobs.remove(&path)?;
        job.priority = rank.priority;
        Some(job)
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.jobs.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.pq.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pq.is_empty()
    }
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}
