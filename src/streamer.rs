//! Push-update consumer.
//!
//! The stream carries change signals only: every `create`/`patch` triggers an authoritative
//! re-fetch of the named entity, which is then written into the [`Repository`].
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use futures::StreamExt;
use serde::Deserialize;
use tokio::{sync::watch, task::JoinHandle};

use crate::{
    api::{ByteStream, ClientApi},
    backoff::backoff_delay,
    event_bus::{EventBus, SdkEvent},
    sdk_codes::SdkCode,
    Error, Repository, Result,
};

/// Configuration for [`Streamer`].
#[derive(Debug, Clone)]
pub struct StreamerConfig {
    /// Delay before the first reconnect attempt.
    ///
    /// Defaults to [`StreamerConfig::DEFAULT_MIN_RETRY_DELAY`].
    pub min_retry_delay: Duration,
    /// Upper bound of the reconnect delay.
    ///
    /// Defaults to [`StreamerConfig::DEFAULT_MAX_RETRY_DELAY`].
    pub max_retry_delay: Duration,
}

impl StreamerConfig {
    /// Default value for [`StreamerConfig::min_retry_delay`].
    pub const DEFAULT_MIN_RETRY_DELAY: Duration = Duration::from_secs(1);
    /// Default value for [`StreamerConfig::max_retry_delay`].
    pub const DEFAULT_MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

    /// Create a new `StreamerConfig` using default configuration.
    pub fn new() -> StreamerConfig {
        StreamerConfig::default()
    }

    /// Update delay before the first reconnect attempt.
    pub fn with_min_retry_delay(mut self, delay: Duration) -> StreamerConfig {
        self.min_retry_delay = delay;
        self
    }

    /// Update upper bound of the reconnect delay.
    pub fn with_max_retry_delay(mut self, delay: Duration) -> StreamerConfig {
        self.max_retry_delay = delay;
        self
    }
}

impl Default for StreamerConfig {
    fn default() -> StreamerConfig {
        StreamerConfig {
            min_retry_delay: StreamerConfig::DEFAULT_MIN_RETRY_DELAY,
            max_retry_delay: StreamerConfig::DEFAULT_MAX_RETRY_DELAY,
        }
    }
}

/// Connection state of the [`Streamer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum StreamState {
    Closed,
    Connecting,
    Connected,
    Retrying,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum StreamEvent {
    Create,
    Patch,
    Delete,
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct StreamMessage {
    event: StreamEvent,
    domain: String,
    identifier: String,
    #[serde(default)]
    version: i64,
}

const FLAG_DOMAIN: &str = "flag";
const SEGMENT_DOMAIN: &str = "target-segment";

/// Longest line kept while waiting for its terminating newline. The remainder of a longer line is
/// discarded.
const MAX_LINE_LENGTH: usize = 64 * 1024;

struct Inner {
    api: Arc<dyn ClientApi>,
    repository: Arc<Repository>,
    bus: EventBus,
    environment: String,
    config: StreamerConfig,
    state: watch::Sender<StreamState>,
}

/// Long-lived push-update consumer with automatic reconnect.
pub struct Streamer {
    inner: Arc<Inner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Streamer {
    /// Create a closed streamer. Call [`Streamer::start`] to connect.
    pub fn new(
        api: Arc<dyn ClientApi>,
        repository: Arc<Repository>,
        bus: EventBus,
        environment: impl Into<String>,
        config: StreamerConfig,
    ) -> Streamer {
        let (state, _) = watch::channel(StreamState::Closed);
        Streamer {
            inner: Arc::new(Inner {
                api,
                repository,
                bus,
                environment: environment.into(),
                config,
                state,
            }),
            task: Mutex::new(None),
        }
    }

    /// Connect and keep reconnecting until closed. Does nothing if already started. Must be called
    /// from within a Tokio runtime.
    pub fn start(&self) {
        let mut task = self
            .task
            .lock()
            .expect("thread holding streamer task lock should not panic");
        if task.is_some() {
            return;
        }
        *task = Some(tokio::spawn(run(self.inner.clone())));
    }

    /// Abort the connection and stop reconnecting. Idempotent.
    pub fn close(&self) {
        let task = self
            .task
            .lock()
            .expect("thread holding streamer task lock should not panic")
            .take();
        if let Some(task) = task {
            task.abort();
            log::info!(target: "ff", "{}", SdkCode::StreamStopped);
        }
        self.inner.state.send_replace(StreamState::Closed);
    }

    /// Current connection state.
    pub fn state(&self) -> StreamState {
        *self.inner.state.borrow()
    }
}

impl Drop for Streamer {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run(inner: Arc<Inner>) {
    let mut attempt: u32 = 0;
    loop {
        inner.state.send_replace(StreamState::Connecting);
        match inner.api.open_stream().await {
            Ok(stream) => {
                attempt = 0;
                inner.state.send_replace(StreamState::Connected);
                log::info!(target: "ff", "{}", SdkCode::StreamConnected);
                inner.bus.publish(SdkEvent::StreamConnected);

                let result = inner.consume(stream).await;
                match result {
                    Ok(()) => {
                        log::info!(target: "ff", "{} stream ended", SdkCode::StreamDisconnected);
                    }
                    Err(err) => {
                        log::warn!(target: "ff", "{} {err}", SdkCode::StreamDisconnected);
                        inner.bus.publish(SdkEvent::StreamError(err));
                    }
                }
                inner.bus.publish(SdkEvent::StreamDisconnected);
            }
            Err(Error::Unauthorized) => {
                log::error!(target: "ff", "{} unauthorized", SdkCode::StreamStopped);
                inner.bus.publish(SdkEvent::StreamError(Error::Unauthorized));
                inner.state.send_replace(StreamState::Closed);
                return;
            }
            Err(err) => {
                log::warn!(target: "ff", "failed to connect stream: {err}");
                inner.bus.publish(SdkEvent::StreamError(err));
            }
        }

        attempt = attempt.saturating_add(1);
        let delay = backoff_delay(
            attempt,
            inner.config.min_retry_delay,
            inner.config.max_retry_delay,
        );
        inner.state.send_replace(StreamState::Retrying);
        log::info!(target: "ff", attempt; "{} {}ms", SdkCode::StreamRetrying, delay.as_millis());
        inner.bus.publish(SdkEvent::StreamRetrying(attempt));
        tokio::time::sleep(delay).await;
    }
}

impl Inner {
    /// Read frames until the stream ends. Only transport errors end the connection; a message
    /// that fails to process is logged and dropped.
    async fn consume(&self, mut stream: ByteStream) -> Result<()> {
        let mut buffer: Vec<u8> = Vec::new();
        // Set while skipping the tail of an oversized line.
        let mut oversized = false;
        while let Some(chunk) = stream.next().await {
            buffer.extend_from_slice(&chunk?);

            while let Some(newline) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=newline).collect();
                if oversized {
                    oversized = false;
                    continue;
                }
                let line = String::from_utf8_lossy(&line);
                let Some(message) = parse_line(&line) else {
                    continue;
                };

                log::info!(target: "ff", "{} {}", SdkCode::StreamEvent, line.trim());
                if let Err(err) = self.handle_message(&message).await {
                    log::warn!(target: "ff",
                               domain = message.domain.as_str(),
                               identifier = message.identifier.as_str();
                               "failed to process stream event: {err}");
                }
            }

            if buffer.len() > MAX_LINE_LENGTH {
                log::warn!(target: "ff", length = buffer.len() as u64; "discarding oversized stream line");
                buffer.clear();
                oversized = true;
            }
        }
        Ok(())
    }

    async fn handle_message(&self, message: &StreamMessage) -> Result<()> {
        let identifier = message.identifier.as_str();
        match (message.domain.as_str(), message.event) {
            (_, StreamEvent::Other) => {}
            (FLAG_DOMAIN, StreamEvent::Delete) => {
                self.repository.delete_flag(identifier).await?;
            }
            (FLAG_DOMAIN, _) => {
                let stored = self.repository.get_flag(identifier, false).await?;
                if is_up_to_date(stored.map(|flag| flag.version), message.version) {
                    log::debug!(target: "ff", identifier; "flag already up to date");
                    return Ok(());
                }
                let flag = self
                    .api
                    .get_feature_config(identifier, &self.environment)
                    .await?;
                self.repository.set_flag(identifier, flag).await?;
            }
            (SEGMENT_DOMAIN, StreamEvent::Delete) => {
                self.repository.delete_segment(identifier).await?;
            }
            (SEGMENT_DOMAIN, _) => {
                let stored = self.repository.get_segment(identifier, false).await?;
                if is_up_to_date(stored.map(|segment| segment.version), message.version) {
                    log::debug!(target: "ff", identifier; "segment already up to date");
                    return Ok(());
                }
                let segment = self.api.get_segment(identifier, &self.environment).await?;
                self.repository.set_segment(identifier, segment).await?;
            }
            (domain, _) => {
                log::debug!(target: "ff", domain; "ignoring stream event for unknown domain");
            }
        }
        Ok(())
    }
}

fn is_up_to_date(stored: Option<i64>, incoming: i64) -> bool {
    incoming > 0 && stored.is_some_and(|stored| stored >= incoming)
}

/// Parse a `data:` line. Anything else (heartbeats, comments, other SSE fields) yields `None`.
fn parse_line(line: &str) -> Option<StreamMessage> {
    let payload = line.trim_end_matches(['\r', '\n']).strip_prefix("data:")?.trim();
    if payload.is_empty() {
        return None;
    }
    match serde_json::from_str(payload) {
        Ok(message) => Some(message),
        Err(err) => {
            log::debug!(target: "ff", "ignoring malformed stream frame: {err}");
            None
        }
    }
}
