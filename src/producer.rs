//! Lifecycle of the background producers that feed the store.

use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::PRODUCER_STOP_TIMEOUT_MS;
use crate::event_ingestor::spawn_event_ingestor;
use crate::history_poller::spawn_history_poller;
use crate::log_tailer::spawn_log_tailer;
use crate::state::SharedState;

/// A running producer task plus the switch that stops it.
pub struct ProducerHandle {
    name: &'static str,
    stop_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl ProducerHandle {
    /// Spawn a producer. `start` receives the stop signal it must honour.
    pub fn spawn<F>(name: &'static str, start: F) -> Self
    where
        F: FnOnce(watch::Receiver<bool>) -> JoinHandle<()>,
    {
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = start(stop_rx);
        debug!("Producer {} spawned", name);
        Self {
            name,
            stop_tx,
            task: Some(task),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Signal the producer and wait briefly for it to exit, aborting it if
    /// it does not. Safe to call more than once.
    pub async fn stop(&mut self) {
        self.stop_tx.send_replace(true);
        let Some(mut task) = self.task.take() else {
            return;
        };

        let grace = Duration::from_millis(PRODUCER_STOP_TIMEOUT_MS);
        match tokio::time::timeout(grace, &mut task).await {
            Ok(Ok(())) => debug!("Producer {} stopped", self.name),
            Ok(Err(e)) if e.is_panic() => warn!("Producer {} panicked: {}", self.name, e),
            Ok(Err(_)) => debug!("Producer {} was cancelled", self.name),
            Err(_) => {
                warn!(
                    "Producer {} did not stop within {:?}, aborting",
                    self.name, grace
                );
                task.abort();
            }
        }
    }
}

impl Drop for ProducerHandle {
    fn drop(&mut self) {
        self.stop_tx.send_replace(true);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// All producers of one dashboard instance.
#[derive(Default)]
pub struct Producers {
    handles: Vec<ProducerHandle>,
}

impl Producers {
    /// Start the history poller, the log tailer and, when enabled, the
    /// event ingestor.
    pub fn start(state: &SharedState) -> Self {
        let mut handles = Vec::with_capacity(3);

        if state.config.events_enabled {
            let s = state.clone();
            handles.push(ProducerHandle::spawn("event_ingestor", move |stop| {
                spawn_event_ingestor(s, stop)
            }));
        } else {
            info!("Event stream disabled, relying on history polls");
        }

        let s = state.clone();
        handles.push(ProducerHandle::spawn("history_poller", move |stop| {
            spawn_history_poller(s, stop)
        }));

        let s = state.clone();
        handles.push(ProducerHandle::spawn("log_tailer", move |stop| {
            spawn_log_tailer(s, stop)
        }));

        Self { handles }
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.handles.iter().map(|h| h.name()).collect()
    }

    pub async fn shutdown(&mut self) {
        for handle in &mut self.handles {
            handle.stop().await;
        }
        info!("All producers stopped");
    }
}
