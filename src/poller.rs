//! A background poller task that periodically fetches all flags and segments and stores them in
//! the [`Repository`].
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use tokio::{sync::watch, task::JoinHandle, time::Instant};

use crate::{
    api::ClientApi,
    backoff::{jitter, with_retries},
    event_bus::{EventBus, SdkEvent},
    sdk_codes::SdkCode,
    Error, Repository, Result,
};

/// Configuration for [`Poller`].
// Not implementing `Copy` as we may add non-copyable fields in the future.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Interval to wait between requests for configuration.
    ///
    /// Defaults to [`PollerConfig::DEFAULT_POLL_INTERVAL`].
    pub interval: Duration,
    /// Jitter applies a randomized duration to wait between requests for configuration. This helps
    /// to avoid multiple server instances synchronizing and producing spiky network load.
    ///
    /// Defaults to [`PollerConfig::DEFAULT_POLL_JITTER`].
    pub jitter: Duration,
    /// Retries of each fetch within one cycle before the cycle is reported as failed.
    pub max_retries: u32,
    /// Base delay between fetch retries.
    pub retry_delay: Duration,
}

impl PollerConfig {
    /// Default value for [`PollerConfig::interval`].
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);
    /// Default value for [`PollerConfig::jitter`].
    pub const DEFAULT_POLL_JITTER: Duration = Duration::ZERO;
    /// Default value for [`PollerConfig::max_retries`].
    pub const DEFAULT_MAX_RETRIES: u32 = 3;
    /// Default value for [`PollerConfig::retry_delay`].
    pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

    /// Create a new `PollerConfig` using default configuration.
    pub fn new() -> PollerConfig {
        PollerConfig::default()
    }

    /// Update poll interval with `interval`.
    pub fn with_interval(mut self, interval: Duration) -> PollerConfig {
        self.interval = interval;
        self
    }

    /// Update poll interval jitter with `jitter`.
    pub fn with_jitter(mut self, jitter: Duration) -> PollerConfig {
        self.jitter = jitter;
        self
    }

    /// Update number of fetch retries per cycle.
    pub fn with_max_retries(mut self, max_retries: u32) -> PollerConfig {
        self.max_retries = max_retries;
        self
    }

    /// Update base delay between fetch retries.
    pub fn with_retry_delay(mut self, retry_delay: Duration) -> PollerConfig {
        self.retry_delay = retry_delay;
        self
    }
}

impl Default for PollerConfig {
    fn default() -> PollerConfig {
        PollerConfig {
            interval: PollerConfig::DEFAULT_POLL_INTERVAL,
            jitter: PollerConfig::DEFAULT_POLL_JITTER,
            max_retries: PollerConfig::DEFAULT_MAX_RETRIES,
            retry_delay: PollerConfig::DEFAULT_RETRY_DELAY,
        }
    }
}

/// Scheduling state of the [`Poller`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerState {
    /// Not scheduling cycles. Can be resumed.
    Stopped,
    /// Scheduling cycles.
    Running,
    /// Closed for good.
    Closed,
}

struct Inner {
    api: Arc<dyn ClientApi>,
    repository: Arc<Repository>,
    bus: EventBus,
    environment: String,
    config: PollerConfig,
    state: watch::Sender<PollerState>,
    ready: AtomicBool,
}

/// Periodic full refresh of the [`Repository`].
///
/// Cycles are paced by [`PollerConfig::interval`] measured from the start of the previous cycle,
/// so fetch latency does not shift the cadence. A cycle is never started less than one interval
/// after the previous one, including right after [`Poller::resume`].
pub struct Poller {
    inner: Arc<Inner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Poller {
    /// Create a stopped poller. Call [`Poller::start`] to begin polling.
    pub fn new(
        api: Arc<dyn ClientApi>,
        repository: Arc<Repository>,
        bus: EventBus,
        environment: impl Into<String>,
        config: PollerConfig,
    ) -> Poller {
        let (state, _) = watch::channel(PollerState::Stopped);
        Poller {
            inner: Arc::new(Inner {
                api,
                repository,
                bus,
                environment: environment.into(),
                config,
                state,
                ready: AtomicBool::new(false),
            }),
            task: Mutex::new(None),
        }
    }

    /// Start polling. The first cycle runs immediately.
    ///
    /// Does nothing if the poller is already started or has been closed. Must be called from
    /// within a Tokio runtime.
    pub fn start(&self) {
        let mut task = self
            .task
            .lock()
            .expect("thread holding poller task lock should not panic");
        if task.is_some() || self.state() == PollerState::Closed {
            return;
        }

        self.inner.state.send_replace(PollerState::Running);
        log::info!(target: "ff", "{} {}ms", SdkCode::PollingStarted, self.inner.config.interval.as_millis());
        *task = Some(tokio::spawn(run(self.inner.clone())));
    }

    /// Pause polling. Scheduling state is kept, so polling can be resumed.
    pub fn stop(&self) {
        let stopped = self.inner.state.send_if_modified(|state| {
            if *state == PollerState::Running {
                *state = PollerState::Stopped;
                true
            } else {
                false
            }
        });
        if stopped {
            log::info!(target: "ff", "{} stream connected", SdkCode::PollingStopped);
        }
    }

    /// Resume polling after [`Poller::stop`]. If a full interval has passed since the last cycle,
    /// a cycle runs immediately.
    pub fn resume(&self) {
        let resumed = self.inner.state.send_if_modified(|state| {
            if *state == PollerState::Stopped {
                *state = PollerState::Running;
                true
            } else {
                false
            }
        });
        if resumed {
            log::info!(target: "ff", "{} {}ms", SdkCode::PollingStarted, self.inner.config.interval.as_millis());
        }
    }

    /// Stop polling permanently and abort any in-flight cycle. Idempotent.
    pub fn close(&self) {
        let previous = self.inner.state.send_replace(PollerState::Closed);
        if let Some(task) = self
            .task
            .lock()
            .expect("thread holding poller task lock should not panic")
            .take()
        {
            task.abort();
        }
        if previous != PollerState::Closed {
            log::info!(target: "ff", "{} closed", SdkCode::PollingStopped);
        }
    }

    /// Current scheduling state.
    pub fn state(&self) -> PollerState {
        *self.inner.state.borrow()
    }

    /// Whether a cycle has completed successfully.
    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::SeqCst)
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run(inner: Arc<Inner>) {
    let mut state = inner.state.subscribe();
    // The first cycle is due immediately.
    let mut next_due = Instant::now();
    let mut initial = true;
    let mut last_completed: Option<Instant> = None;
    let mut paused = false;

    loop {
        // Wait until running.
        loop {
            match *state.borrow_and_update() {
                PollerState::Running => break,
                // Readiness depends on the initial cycle, so a stop that races it is ignored.
                PollerState::Stopped if initial => break,
                PollerState::Closed => return,
                PollerState::Stopped => paused = true,
            }
            if state.changed().await.is_err() {
                return;
            }
        }

        // After a pause the next cycle is also held back until one interval past the last completion.
        if std::mem::take(&mut paused) {
            if let Some(completed) = last_completed {
                next_due = next_due.max(completed + inner.config.interval);
            }
        }

        if Instant::now() < next_due {
            tokio::select! {
                _ = tokio::time::sleep_until(next_due) => {}
                changed = state.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
            // Re-check state before starting a cycle.
            continue;
        }

        initial = false;
        let started = Instant::now();
        next_due = started + jitter(inner.config.interval, inner.config.jitter);

        log::debug!(target: "ff", "fetching flags and segments");
        let result = inner.poll_once().await;
        last_completed = Some(Instant::now());
        match result {
            Ok(()) => {
                log::debug!(target: "ff", elapsed_ms = started.elapsed().as_millis() as u64; "poll cycle completed");
                if !inner.ready.swap(true, Ordering::SeqCst) {
                    inner.bus.publish(SdkEvent::PollerReady);
                }
            }
            Err(Error::Unauthorized) => {
                log::error!(target: "ff", "{} unauthorized", SdkCode::PollingStopped);
                inner.bus.publish(SdkEvent::PollerError(Error::Unauthorized));
                inner.state.send_replace(PollerState::Closed);
                return;
            }
            Err(err) => {
                log::warn!(target: "ff", "poll cycle failed: {err}");
                inner.bus.publish(SdkEvent::PollerError(err));
            }
        }
    }
}

impl Inner {
    /// Fetch flags and segments concurrently and store whatever succeeded. Returns the first
    /// error.
    async fn poll_once(&self) -> Result<()> {
        let retries = self.config.max_retries;
        let delay = self.config.retry_delay;
        let (flags, segments) = tokio::join!(
            with_retries(retries, delay, || self.api.get_feature_configs(&self.environment)),
            with_retries(retries, delay, || self.api.get_segments(&self.environment)),
        );

        // Segments first: flag change listeners may re-evaluate against them.
        let segments = match segments {
            Ok(segments) => self.store_segments(segments).await,
            Err(err) => Err(err),
        };
        let flags = match flags {
            Ok(flags) => self.store_flags(flags).await,
            Err(err) => Err(err),
        };
        segments.and(flags)
    }

    async fn store_flags(&self, flags: Vec<crate::FeatureConfig>) -> Result<()> {
        for flag in flags {
            let identifier = flag.feature.clone();
            self.repository.set_flag(&identifier, flag).await?;
        }
        Ok(())
    }

    async fn store_segments(&self, segments: Vec<crate::Segment>) -> Result<()> {
        for segment in segments {
            let identifier = segment.identifier.clone();
            self.repository.set_segment(&identifier, segment).await?;
        }
        Ok(())
    }
}
