use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use codeflux_core::{
    ChangeKind, ChangeRecord, EventBus, PipelineConfig, PipelineEvent, ReleasedBatch,
};

/// Accumulator phase. Idle until a burst trips mass-change handling; a large
/// release is followed by a cooldown so residual events cannot immediately
/// re-trigger another one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchWindow {
    Idle,
    Accumulating,
    Processing,
    Cooldown,
}

const RATE_WINDOW: Duration = Duration::from_secs(1);

/// Buffers change records per path and releases them in well-spaced batches.
/// The debounce window grows with buffer size so bursts are shed as a few
/// large releases instead of many tiny ones.
pub struct BatchAccumulator {
    buffer: HashMap<PathBuf, ChangeRecord>,
    arrivals: VecDeque<Instant>,
    state: BatchWindow,
    cooldown_until: Option<Instant>,
    base_window: Duration,
    max_window: Duration,
    cooldown: Duration,
    mass_change_threshold: usize,
    tick: Duration,
    events: EventBus,
    batch_tx: mpsc::Sender<ReleasedBatch>,
}

impl BatchAccumulator {
    pub fn new(
        config: &PipelineConfig,
        events: EventBus,
        batch_tx: mpsc::Sender<ReleasedBatch>,
    ) -> Self {
        let base_window = Duration::from_millis(config.debounce_ms);
        Self {
            buffer: HashMap::new(),
            arrivals: VecDeque::new(),
            state: BatchWindow::Idle,
            cooldown_until: None,
            base_window,
            max_window: Duration::from_millis(config.max_window_ms),
            cooldown: base_window * 2,
            mass_change_threshold: config.mass_change_threshold,
            tick: Duration::from_millis(config.batch_delay_ms),
            events,
            batch_tx,
        }
    }

    pub fn state(&self) -> BatchWindow {
        self.state
    }

    /// Drive the accumulator until the record channel closes, then flush
    /// whatever is still buffered.
    pub async fn run(mut self, mut rx: mpsc::Receiver<ChangeRecord>) {
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                record = rx.recv() => match record {
                    Some(record) => self.ingest(record, Instant::now()),
                    None => break,
                },
                _ = ticker.tick() => {
                    if let Some(batch) = self.release_ready(Instant::now()) {
                        if self.batch_tx.send(batch).await.is_err() {
                            warn!("batch channel closed, stopping accumulator");
                            return;
                        }
                    }
                }
            }
        }

        if let Some(batch) = self.flush() {
            let _ = self.batch_tx.send(batch).await;
        }
    }

    /// Buffer one record. A newer record for an already-buffered path
    /// supersedes the old one outright; the newest kind and timestamp win.
    fn ingest(&mut self, record: ChangeRecord, now: Instant) {
        self.note_arrival(now);

        self.events.emit(PipelineEvent::ChangeQueued {
            path: record.path.to_string_lossy().into_owned(),
            kind: record.kind,
        });
        trace!(path = ?record.path, kind = %record.kind, "buffered change");
        self.buffer.insert(record.path.clone(), record);
    }

    fn note_arrival(&mut self, now: Instant) {
        self.arrivals.push_back(now);
        while self
            .arrivals
            .front()
            .is_some_and(|t| now.duration_since(*t) > RATE_WINDOW)
        {
            self.arrivals.pop_front();
        }
        if self.arrivals.len() > self.mass_change_threshold
            && matches!(self.state, BatchWindow::Idle)
        {
            debug!(
                rate = self.arrivals.len(),
                threshold = self.mass_change_threshold,
                "mass change detected, widening batch window"
            );
            self.state = BatchWindow::Accumulating;
        }
    }

    /// Window currently applied to buffered records. Grows stepwise with
    /// buffer size; pinned at the ceiling while a burst is being absorbed.
    fn current_window(&self) -> Duration {
        if self.state == BatchWindow::Accumulating {
            return self.max_window;
        }
        let scaled = match self.buffer.len() {
            0..=4 => self.base_window,
            5..=19 => self.base_window * 2,
            _ => self.base_window * 5,
        };
        scaled.min(self.max_window)
    }

    /// Release every record that has aged past the current window, grouped
    /// by kind in the fixed order deleted → created → modified.
    fn release_ready(&mut self, now: Instant) -> Option<ReleasedBatch> {
        if self.state == BatchWindow::Cooldown {
            match self.cooldown_until {
                Some(until) if now < until => return None,
                _ => {
                    self.state = BatchWindow::Idle;
                    self.cooldown_until = None;
                }
            }
        }

        let window = self.current_window();
        let ready: Vec<PathBuf> = self
            .buffer
            .iter()
            .filter(|(_, rec)| now.duration_since(rec.observed_at) >= window)
            .map(|(path, _)| path.clone())
            .collect();

        if ready.is_empty() {
            return None;
        }

        self.state = BatchWindow::Processing;
        let records: Vec<ChangeRecord> = ready
            .iter()
            .filter_map(|path| self.buffer.remove(path))
            .collect();
        let batch = Self::group(records, self.mass_change_threshold);

        if batch.mass {
            debug!(size = batch.records.len(), "mass batch released, cooling down");
            self.state = BatchWindow::Cooldown;
            self.cooldown_until = Some(now + self.cooldown);
        } else {
            self.state = BatchWindow::Idle;
        }

        Some(batch)
    }

    /// Release everything regardless of age. Used on shutdown.
    fn flush(&mut self) -> Option<ReleasedBatch> {
        if self.buffer.is_empty() {
            return None;
        }
        let records: Vec<ChangeRecord> = self.buffer.drain().map(|(_, rec)| rec).collect();
        Some(Self::group(records, self.mass_change_threshold))
    }

    fn group(records: Vec<ChangeRecord>, mass_threshold: usize) -> ReleasedBatch {
        let mut deleted = Vec::new();
        let mut created = Vec::new();
        let mut modified = Vec::new();
        for record in records {
            match record.kind {
                ChangeKind::Deleted => deleted.push(record),
                ChangeKind::Created => created.push(record),
                ChangeKind::Modified => modified.push(record),
            }
        }

        let mut ordered = deleted;
        ordered.extend(created);
        ordered.extend(modified);
        let mass = ordered.len() >= mass_threshold;
        ReleasedBatch {
            records: ordered,
            mass,
        }
    }
}
