//! View counting.
//!
//! Listing a post records a view event on a bounded channel. A single flush task
//! owns the pending buffer and periodically writes it out as one batch: each
//! (post, account) pair is stored once, while every impression still counts
//! towards the aggressive view total.

use log::{debug, info, warn};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::store::ContentStore;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ViewEvent {
    pub post_id: i64,
    pub account_id: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ViewBatch {
    /// Distinct (post, account) pairs.
    pub unique: Vec<ViewEvent>,
    /// Raw impression count per post, duplicates included.
    pub impressions: BTreeMap<i64, i64>,
}

impl ViewBatch {
    pub fn from_events(events: &[ViewEvent]) -> Self {
        let unique: BTreeSet<ViewEvent> = events.iter().copied().collect();
        let mut impressions = BTreeMap::new();
        for event in events {
            *impressions.entry(event.post_id).or_insert(0) += 1;
        }
        Self {
            unique: unique.into_iter().collect(),
            impressions,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.impressions.is_empty()
    }
}

#[derive(Clone)]
pub struct ViewRecorder {
    tx: mpsc::Sender<ViewEvent>,
    dropped: Arc<AtomicU64>,
}

impl ViewRecorder {
    /// Queues one view per post for `account`. Never waits; overflow is dropped.
    pub fn record(&self, account: i64, post_ids: &[i64]) {
        let mut dropped = 0;
        for &post_id in post_ids {
            let event = ViewEvent {
                post_id,
                account_id: account,
            };
            if self.tx.try_send(event).is_err() {
                dropped += 1;
            }
        }
        if dropped > 0 {
            self.dropped.fetch_add(dropped, Ordering::Relaxed);
            warn!("View queue saturated, dropped {} view events", dropped);
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

struct ViewFlusher {
    rx: mpsc::Receiver<ViewEvent>,
    store: Arc<dyn ContentStore>,
    pending: Vec<ViewEvent>,
    max_pending: usize,
}

impl ViewFlusher {
    async fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let batch = ViewBatch::from_events(&self.pending);
        match self.store.apply_view_batch(&batch).await {
            Ok(()) => {
                debug!(
                    "Flushed {} view events ({} unique) for {} posts",
                    self.pending.len(),
                    batch.unique.len(),
                    batch.impressions.len()
                );
                self.pending.clear();
            }
            Err(e) => {
                warn!("Failed to flush view batch, keeping it for the next run: {}", e);
                if self.pending.len() > self.max_pending {
                    let excess = self.pending.len() - self.max_pending;
                    self.pending.drain(..excess);
                    warn!("Discarded {} oldest view events", excess);
                }
            }
        }
    }

    async fn run(mut self, every: Duration, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    while let Ok(event) = self.rx.try_recv() {
                        self.pending.push(event);
                    }
                    break;
                }
                event = self.rx.recv() => match event {
                    Some(event) => {
                        self.pending.push(event);
                        if self.pending.len() >= self.max_pending {
                            self.flush().await;
                        }
                    }
                    None => break,
                },
                _ = interval.tick() => self.flush().await,
            }
        }
        self.flush().await;
        info!("View flusher stopped");
    }
}

/// Starts the flush task. Pending views are written on every interval, when
/// the buffer reaches `capacity`, and once more on shutdown.
pub fn spawn_view_flusher(
    store: Arc<dyn ContentStore>,
    capacity: usize,
    every: Duration,
    shutdown: CancellationToken,
) -> (ViewRecorder, JoinHandle<()>) {
    let capacity = capacity.max(1);
    let (tx, rx) = mpsc::channel(capacity);
    let flusher = ViewFlusher {
        rx,
        store,
        pending: Vec::new(),
        max_pending: capacity,
    };
    let handle = tokio::spawn(flusher.run(every, shutdown));
    (
        ViewRecorder {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        },
        handle,
    )
}
