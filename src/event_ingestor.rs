use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::model::TestUpdate;
use crate::state::SharedState;
use crate::store::UpdateSource;

/// One dispatched server-sent event.
#[derive(Debug, Clone, PartialEq)]
pub struct SseMessage {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental `text/event-stream` decoder. Chunks may split lines or UTF-8
/// sequences anywhere.
#[derive(Debug, Default)]
pub struct SseDecoder {
    pending: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseMessage> {
        self.pending.extend_from_slice(chunk);
        let mut messages = Vec::new();

        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw[..raw.len() - 1]);
            let line = line.strip_suffix('\r').unwrap_or(&line);
            if let Some(message) = self.process_line(line) {
                messages.push(message);
            }
        }
        messages
    }

    fn process_line(&mut self, line: &str) -> Option<SseMessage> {
        if line.is_empty() {
            if self.data.is_empty() {
                self.event = None;
                return None;
            }
            return Some(SseMessage {
                event: self.event.take(),
                data: std::mem::take(&mut self.data).join("\n"),
            });
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "data" => self.data.push(value.to_string()),
            "event" => self.event = Some(value.to_string()),
            _ => {} // id / retry are not used
        }
        None
    }
}

#[derive(Debug, Deserialize)]
struct EventEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: serde_json::Value,
}

/// Decode one stream message into a store update. Malformed and
/// non-status messages yield `None`.
pub fn decode_status_event(data: &str) -> Option<TestUpdate> {
    let envelope: EventEnvelope = match serde_json::from_str(data) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!("Dropping malformed stream message: {}", e);
            return None;
        }
    };

    if envelope.kind != "status" {
        debug!("Ignoring stream message of type {:?}", envelope.kind);
        return None;
    }

    match serde_json::from_value::<TestUpdate>(envelope.payload) {
        Ok(update) if !update.test_id.is_empty() => Some(update),
        Ok(_) => {
            warn!("Dropping status message without a testId");
            None
        }
        Err(e) => {
            warn!("Dropping status message with invalid payload: {}", e);
            None
        }
    }
}

/// Why a connected stream stopped delivering.
enum StreamEnd {
    /// Backend side ended the stream after delivering `received` messages.
    Closed { received: usize },
    Stopped,
}

/// Spawn the event ingestor: one persistent stream connection, reconnecting
/// with bounded exponential backoff.
pub fn spawn_event_ingestor(
    state: SharedState,
    mut stop: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        info!("Event ingestor started");
        let policy = state.config.reconnect;
        let mut attempt: u32 = 0;

        loop {
            if *stop.borrow() {
                break;
            }

            match state.backend.open_event_stream().await {
                Ok(resp) => {
                    info!("Event stream connected");
                    state.backend_status.write().await.stream_connected = true;

                    let end = consume_stream(&state, resp, &mut stop).await;
                    state.backend_status.write().await.stream_connected = false;
                    match end {
                        StreamEnd::Stopped => break,
                        // A connection only counts as healthy once it delivered something.
                        StreamEnd::Closed { received } if received > 0 => {
                            attempt = 0;
                            warn!("Event stream closed by backend after {} messages", received);
                        }
                        StreamEnd::Closed { .. } => {
                            warn!("Event stream closed by backend before any message");
                        }
                    }
                }
                Err(e) => {
                    warn!("Event stream connection failed: {}", e);
                }
            }

            attempt += 1;
            if policy.exhausted(attempt) {
                error!(
                    "Event stream unavailable after {} attempts, continuing on history polls only",
                    policy.max_attempts
                );
                break;
            }

            let delay = policy.delay(attempt);
            debug!("Reconnecting event stream in {:?} (attempt {})", delay, attempt);
            tokio::select! {
                _ = sleep(delay) => {},
                _ = stop.changed() => break,
            }
        }

        state.backend_status.write().await.stream_connected = false;
        info!("Event ingestor stopped");
    })
}

async fn consume_stream(
    state: &SharedState,
    resp: reqwest::Response,
    stop: &mut watch::Receiver<bool>,
) -> StreamEnd {
    let mut body = resp.bytes_stream();
    let mut decoder = SseDecoder::new();
    let mut received = 0usize;

    loop {
        let chunk = tokio::select! {
            chunk = body.next() => chunk,
            _ = stop.changed() => return StreamEnd::Stopped,
        };

        match chunk {
            Some(Ok(bytes)) => {
                for message in decoder.feed(&bytes) {
                    received += 1;
                    let Some(update) = decode_status_event(&message.data) else {
                        continue;
                    };
                    let test_id = update.test_id.clone();
                    match state.store.merge(update, UpdateSource::Event).await {
                        Ok(outcome) => debug!(test_id = %test_id, ?outcome, "Applied status event"),
                        Err(e) => {
                            warn!("Store unavailable, dropping status event: {}", e);
                            return StreamEnd::Stopped;
                        }
                    }
                }
            }
            Some(Err(e)) => {
                warn!("Error reading event stream: {}", e);
                return StreamEnd::Closed { received };
            }
            None => return StreamEnd::Closed { received },
        }
    }
}
