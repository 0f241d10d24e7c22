//! Canonical test-record state.
//!
//! [`TestStateStore`] holds the reconciled view of every known test and owns
//! the merge rules. [`StoreHandle`] wraps it in a single-owner task so that the
//! event ingestor, history poller and log tailer can feed it concurrently while
//! merges still apply one at a time.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::debug;

use crate::config::STORE_COMMAND_CAPACITY;
use crate::model::{TestRecord, TestUpdate};

/// Producer that delivered an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateSource {
    Event,
    Poll,
    Log,
    Ack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Created,
    Updated,
    Unchanged,
}

impl MergeOutcome {
    pub fn changed(self) -> bool {
        self != MergeOutcome::Unchanged
    }
}

/// Immutable, render-safe view of the store.
pub type Snapshot = Arc<Vec<TestRecord>>;

struct Entry {
    record: TestRecord,
    touched: u64,
    last_source: UpdateSource,
}

#[derive(Default)]
pub struct TestStateStore {
    records: HashMap<String, Entry>,
    clock: u64,
}

impl TestStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, test_id: &str) -> Option<TestRecord> {
        self.records.get(test_id).map(|e| e.record.clone())
    }

    pub fn last_source(&self, test_id: &str) -> Option<UpdateSource> {
        self.records.get(test_id).map(|e| e.last_source)
    }

    pub fn merge(&mut self, update: &TestUpdate, source: UpdateSource) -> MergeOutcome {
        self.clock += 1;
        let tick = self.clock;
        self.merge_at(update, source, tick)
    }

    /// Merge a batch under one clock tick; changed records tie on recency.
    pub fn merge_batch<'a>(
        &mut self,
        updates: impl IntoIterator<Item = &'a TestUpdate>,
        source: UpdateSource,
    ) -> usize {
        self.clock += 1;
        let tick = self.clock;
        updates
            .into_iter()
            .filter(|update| self.merge_at(update, source, tick).changed())
            .count()
    }

    fn merge_at(&mut self, update: &TestUpdate, source: UpdateSource, tick: u64) -> MergeOutcome {
        match self.records.get_mut(&update.test_id) {
            Some(entry) => {
                if !apply_update(&mut entry.record, update) {
                    return MergeOutcome::Unchanged;
                }
                entry.touched = tick;
                entry.last_source = source;
                MergeOutcome::Updated
            }
            None => {
                let mut record = TestRecord::new(update.test_id.clone());
                apply_update(&mut record, update);
                self.records.insert(
                    update.test_id.clone(),
                    Entry {
                        record,
                        touched: tick,
                        last_source: source,
                    },
                );
                MergeOutcome::Created
            }
        }
    }

    pub fn remove(&mut self, test_id: &str) -> Option<TestRecord> {
        self.records.remove(test_id).map(|e| e.record)
    }

    /// All records, most recently updated first, ties by test id.
    pub fn snapshot(&self) -> Vec<TestRecord> {
        let mut entries: Vec<&Entry> = self.records.values().collect();
        entries.sort_by(|a, b| {
            b.touched
                .cmp(&a.touched)
                .then_with(|| a.record.test_id.cmp(&b.record.test_id))
        });
        entries.into_iter().map(|e| e.record.clone()).collect()
    }
}

/// Field-wise overwrite with a forward-only status. Returns whether anything changed.
fn apply_update(record: &mut TestRecord, update: &TestUpdate) -> bool {
    let before = record.clone();

    if let Some(status) = update.status {
        if record.status.accepts(status) {
            record.status = status;
        } else if status != record.status {
            debug!(
                test_id = %record.test_id,
                current = %record.status,
                incoming = %status,
                "Ignoring non-forward status transition"
            );
        }
    }
    if let Some(campaign) = &update.campaign {
        record.campaign.clone_from(campaign);
    }
    if let Some(v) = update.num_clients {
        record.num_clients = v;
    }
    if let Some(v) = update.num_requests {
        record.num_requests = v;
    }
    if let Some(v) = update.success {
        record.success = v;
    }
    if let Some(v) = update.failures {
        record.failures = v;
    }
    if let Some(v) = update.duration {
        record.duration = v;
    }
    if let Some(v) = update.throughput {
        record.throughput = v;
    }
    if update.timestamp.is_some() {
        record.timestamp = update.timestamp;
    }

    *record != before
}

// --- Single-owner task ---

#[derive(Debug, thiserror::Error)]
#[error("test state store has shut down")]
pub struct StoreClosed;

enum StoreCommand {
    Merge {
        update: TestUpdate,
        source: UpdateSource,
        reply: oneshot::Sender<MergeOutcome>,
    },
    MergeBatch {
        updates: Vec<TestUpdate>,
        source: UpdateSource,
        reply: oneshot::Sender<usize>,
    },
    Remove {
        test_id: String,
        reply: oneshot::Sender<Option<TestRecord>>,
    },
}

/// Cloneable handle to the store task. The only way producers touch state.
#[derive(Clone)]
pub struct StoreHandle {
    tx: mpsc::Sender<StoreCommand>,
    snapshot_rx: watch::Receiver<Snapshot>,
}

impl StoreHandle {
    /// Move `store` onto its own task. The task exits once every handle is dropped.
    pub fn spawn(store: TestStateStore) -> (Self, tokio::task::JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(STORE_COMMAND_CAPACITY);
        let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(store.snapshot()));
        let task = tokio::spawn(run_store(store, rx, snapshot_tx));
        (Self { tx, snapshot_rx }, task)
    }

    pub async fn merge(
        &self,
        update: TestUpdate,
        source: UpdateSource,
    ) -> Result<MergeOutcome, StoreClosed> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(StoreCommand::Merge {
                update,
                source,
                reply,
            })
            .await
            .map_err(|_| StoreClosed)?;
        rx.await.map_err(|_| StoreClosed)
    }

    pub async fn merge_batch(
        &self,
        updates: Vec<TestUpdate>,
        source: UpdateSource,
    ) -> Result<usize, StoreClosed> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(StoreCommand::MergeBatch {
                updates,
                source,
                reply,
            })
            .await
            .map_err(|_| StoreClosed)?;
        rx.await.map_err(|_| StoreClosed)
    }

    pub async fn remove(&self, test_id: impl Into<String>) -> Result<Option<TestRecord>, StoreClosed> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(StoreCommand::Remove {
                test_id: test_id.into(),
                reply,
            })
            .await
            .map_err(|_| StoreClosed)?;
        rx.await.map_err(|_| StoreClosed)
    }

    /// Latest published snapshot.
    pub fn snapshot(&self) -> Snapshot {
        self.snapshot_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.snapshot_rx.clone()
    }
}

async fn run_store(
    mut store: TestStateStore,
    mut rx: mpsc::Receiver<StoreCommand>,
    snapshot_tx: watch::Sender<Snapshot>,
) {
    // Publish before replying so a caller that awaited its reply sees its change.
    let publish = |store: &TestStateStore| {
        snapshot_tx.send_replace(Arc::new(store.snapshot()));
    };

    while let Some(command) = rx.recv().await {
        match command {
            StoreCommand::Merge {
                update,
                source,
                reply,
            } => {
                let outcome = store.merge(&update, source);
                if outcome.changed() {
                    publish(&store);
                }
                let _ = reply.send(outcome);
            }
            StoreCommand::MergeBatch {
                updates,
                source,
                reply,
            } => {
                let changed = store.merge_batch(&updates, source);
                if changed > 0 {
                    publish(&store);
                }
                let _ = reply.send(changed);
            }
            StoreCommand::Remove { test_id, reply } => {
                let removed = store.remove(&test_id);
                if removed.is_some() {
                    publish(&store);
                }
                let _ = reply.send(removed);
            }
        }
    }
    debug!("Test state store task finished");
}
