//! Wiring between the poller, the streamer and the client.
//!
//! The coordinator is a single task draining its own [`EventBus`] subscription. It pauses the
//! poller while the stream is connected, resumes it when the stream drops, aggregates readiness,
//! and turns repository writes into per-flag `Changed` notifications.
use std::sync::Arc;

use tokio::{
    sync::{broadcast, broadcast::error::RecvError, watch},
    task::JoinHandle,
};

use crate::{
    event_bus::{EventBus, SdkEvent},
    poller::Poller,
    sdk_codes::SdkCode,
    streamer::{StreamState, Streamer},
    Error, Repository,
};

/// Initialization state of the client.
#[derive(Debug, Clone)]
pub enum InitState {
    /// Waiting for the first refresh.
    Pending,
    /// All enabled processors are ready.
    Ready,
    /// Initialization failed; defaults are served.
    Failed(Error),
}

/// Processors that still have to report ready.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Awaiting {
    pub poller: bool,
    pub stream: bool,
    pub metrics: bool,
}

impl Awaiting {
    fn is_done(&self) -> bool {
        !(self.poller || self.stream || self.metrics)
    }
}

pub(crate) struct Coordinator {
    bus: EventBus,
    repository: Arc<Repository>,
    poller: Arc<Poller>,
    streamer: Option<Arc<Streamer>>,
    init: Arc<watch::Sender<InitState>>,
    awaiting: Awaiting,
}

impl Coordinator {
    pub(crate) fn new(
        bus: EventBus,
        repository: Arc<Repository>,
        poller: Arc<Poller>,
        streamer: Option<Arc<Streamer>>,
        init: Arc<watch::Sender<InitState>>,
        awaiting: Awaiting,
    ) -> Coordinator {
        Coordinator {
            bus,
            repository,
            poller,
            streamer,
            init,
            awaiting,
        }
    }

    /// Run on a new task. `events` must be subscribed before any processor is started so that no
    /// readiness signal is missed.
    pub(crate) fn spawn(self, events: broadcast::Receiver<SdkEvent>) -> JoinHandle<()> {
        tokio::spawn(self.run(events))
    }

    async fn run(mut self, mut events: broadcast::Receiver<SdkEvent>) {
        loop {
            match events.recv().await {
                Ok(event) => self.handle(event).await,
                Err(RecvError::Lagged(skipped)) => {
                    log::warn!(target: "ff", skipped; "coordinator lagged behind, change notifications were lost");
                    self.resync();
                }
                Err(RecvError::Closed) => return,
            }
        }
    }

    async fn handle(&mut self, event: SdkEvent) {
        match event {
            SdkEvent::PollerReady => {
                self.awaiting.poller = false;
                self.update_readiness();
            }
            SdkEvent::StreamConnected => {
                self.poller.stop();
                self.awaiting.stream = false;
                self.update_readiness();
            }
            SdkEvent::StreamRetrying(_) | SdkEvent::StreamDisconnected => {
                self.poller.resume();
            }
            SdkEvent::MetricsReady => {
                self.awaiting.metrics = false;
                self.update_readiness();
            }
            SdkEvent::PollerError(Error::Unauthorized) | SdkEvent::StreamError(Error::Unauthorized) => {
                self.fail(Error::Unauthorized);
            }
            SdkEvent::FlagStored(identifier) | SdkEvent::FlagDeleted(identifier) => {
                self.bus.publish(SdkEvent::Changed(identifier));
            }
            SdkEvent::SegmentStored(segment) | SdkEvent::SegmentDeleted(segment) => {
                match self.repository.find_flags_by_segment(&segment).await {
                    Ok(flags) => {
                        for flag in flags {
                            self.bus.publish(SdkEvent::Changed(flag));
                        }
                    }
                    Err(err) => {
                        log::warn!(target: "ff", segment = segment.as_str(); "failed to find flags depending on segment: {err}");
                    }
                }
            }
            _ => {}
        }
    }

    /// Recover pause/resume and readiness after missed events.
    fn resync(&mut self) {
        let connected = self
            .streamer
            .as_ref()
            .is_some_and(|streamer| streamer.state() == StreamState::Connected);
        if connected {
            self.poller.stop();
            self.awaiting.stream = false;
        } else {
            self.poller.resume();
        }
        if self.poller.is_ready() {
            self.awaiting.poller = false;
        }
        self.update_readiness();
    }

    fn update_readiness(&self) {
        if !self.awaiting.is_done() {
            return;
        }
        let changed = self.init.send_if_modified(|state| {
            if matches!(state, InitState::Pending) {
                *state = InitState::Ready;
                true
            } else {
                false
            }
        });
        if changed {
            log::info!(target: "ff", "{}", SdkCode::InitOk);
        }
    }

    fn fail(&self, err: Error) {
        let changed = self.init.send_if_modified(|state| {
            if matches!(state, InitState::Pending) {
                *state = InitState::Failed(err);
                true
            } else {
                false
            }
        });
        if changed {
            log::warn!(target: "ff", "{}", SdkCode::InitAuthFailed);
        }
    }
}
