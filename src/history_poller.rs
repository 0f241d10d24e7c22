use chrono::Utc;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::backend::BackendError;
use crate::model::TestUpdate;
use crate::state::SharedState;
use crate::store::UpdateSource;

/// Decode history records one by one. Malformed records are logged and skipped.
pub fn decode_history(raw: Vec<serde_json::Value>) -> Vec<TestUpdate> {
    raw.into_iter()
        .enumerate()
        .filter_map(|(i, value)| match serde_json::from_value::<TestUpdate>(value) {
            Ok(update) if !update.test_id.is_empty() => Some(update),
            Ok(_) => {
                warn!("Skipping history record {} without a testId", i);
                None
            }
            Err(e) => {
                warn!("Skipping malformed history record {}: {}", i, e);
                None
            }
        })
        .collect()
}

/// Fetch the backend's test history once and merge it into the store.
///
/// A failed fetch leaves the store untouched and marks the backend
/// unreachable until the next successful poll. Malformed records are
/// skipped without affecting the rest of the batch.
pub async fn poll_once(state: &SharedState) -> Result<usize, BackendError> {
    let history = match state.backend.fetch_history().await {
        Ok(history) => history,
        Err(e) => {
            let mut status = state.backend_status.write().await;
            status.reachable = false;
            status.last_error = Some(e.to_string());
            return Err(e);
        }
    };

    let received = history.len();
    let history = decode_history(history);
    let skipped = received - history.len();
    let changed = match state.store.merge_batch(history, UpdateSource::Poll).await {
        Ok(changed) => changed,
        Err(e) => {
            warn!("Store unavailable, dropping history poll: {}", e);
            0
        }
    };

    {
        let mut status = state.backend_status.write().await;
        status.reachable = true;
        status.last_error = None;
        status.last_poll_at = Some(Utc::now());
    }

    debug!(
        "History poll: {} records, {} skipped, {} changed",
        received, skipped, changed
    );
    Ok(changed)
}

/// Spawn the history poller. It also polls right away whenever
/// `state.poll_notify` fires.
pub fn spawn_history_poller(
    state: SharedState,
    mut stop: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            "History poller started (every {:?})",
            state.config.poll_interval
        );
        let mut ticker = interval(state.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {},
                _ = state.poll_notify.notified() => {
                    debug!("History poll requested");
                },
                _ = stop.changed() => break,
            }
            if *stop.borrow() {
                break;
            }

            if let Err(e) = poll_once(&state).await {
                warn!("History poll failed: {}", e);
            }
        }
        info!("History poller stopped");
    })
}
