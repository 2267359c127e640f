use std::{sync::Arc, time::Duration};

use crate::{
    cache::{AsyncKeyValueStore, InMemoryCache, KeyValueCache},
    http_api::DEFAULT_BASE_URL,
    metrics::{MetricsProcessor, NoopMetricsProcessor},
    Client, PollerConfig, Result, StreamerConfig,
};

/// Configuration for [`Client`].
///
/// # Examples
/// ```no_run
/// # async fn example() -> ff_server_sdk::Result<()> {
/// # use std::time::Duration;
/// # use ff_server_sdk::ClientConfig;
/// let client = ClientConfig::from_api_key("api-key")
///     .poll_interval(Duration::from_secs(30))
///     .enable_stream(false)
///     .to_client()?;
/// client.wait_for_initialization().await?;
/// # Ok(())
/// # }
/// ```
pub struct ClientConfig {
    pub(crate) api_key: String,
    pub(crate) base_url: String,
    pub(crate) poll_interval: Duration,
    pub(crate) poll_jitter: Duration,
    pub(crate) enable_stream: bool,
    pub(crate) enable_analytics: bool,
    pub(crate) request_timeout: Duration,
    pub(crate) fetch_retries: u32,
    pub(crate) auth_retries: u32,
    pub(crate) retry_delay: Duration,
    pub(crate) stream_min_retry_delay: Duration,
    pub(crate) stream_max_retry_delay: Duration,
    pub(crate) cache: Arc<dyn KeyValueCache>,
    pub(crate) store: Option<Arc<dyn AsyncKeyValueStore>>,
    pub(crate) metrics_processor: Arc<dyn MetricsProcessor>,
}

impl ClientConfig {
    /// Default base URL for API calls.
    pub const DEFAULT_BASE_URL: &'static str = DEFAULT_BASE_URL;
    /// Default interval between full refreshes.
    pub const DEFAULT_POLL_INTERVAL: Duration = PollerConfig::DEFAULT_POLL_INTERVAL;
    /// Smallest accepted poll interval.
    pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);
    /// Default timeout of a single API request.
    pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
    /// Default number of authentication retries before serving defaults.
    pub const DEFAULT_AUTH_RETRIES: u32 = 3;

    /// Create a default configuration using the specified server SDK key.
    ///
    /// ```
    /// # use ff_server_sdk::ClientConfig;
    /// ClientConfig::from_api_key("api-key");
    /// ```
    pub fn from_api_key(api_key: impl Into<String>) -> Self {
        ClientConfig {
            api_key: api_key.into(),
            base_url: ClientConfig::DEFAULT_BASE_URL.to_owned(),
            poll_interval: ClientConfig::DEFAULT_POLL_INTERVAL,
            poll_jitter: PollerConfig::DEFAULT_POLL_JITTER,
            enable_stream: true,
            enable_analytics: true,
            request_timeout: ClientConfig::DEFAULT_REQUEST_TIMEOUT,
            fetch_retries: PollerConfig::DEFAULT_MAX_RETRIES,
            auth_retries: ClientConfig::DEFAULT_AUTH_RETRIES,
            retry_delay: PollerConfig::DEFAULT_RETRY_DELAY,
            stream_min_retry_delay: StreamerConfig::DEFAULT_MIN_RETRY_DELAY,
            stream_max_retry_delay: StreamerConfig::DEFAULT_MAX_RETRY_DELAY,
            cache: Arc::new(InMemoryCache::new()),
            store: None,
            metrics_processor: Arc::new(NoopMetricsProcessor),
        }
    }

    /// Override base URL for API calls. Clients should use the default setting in most cases.
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Set interval between full refreshes. Values below [`ClientConfig::MIN_POLL_INTERVAL`] are
    /// replaced with [`ClientConfig::DEFAULT_POLL_INTERVAL`].
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        if interval < ClientConfig::MIN_POLL_INTERVAL {
            log::warn!(target: "ff",
                       requested_ms = interval.as_millis() as u64;
                       "poll interval below minimum, using default of {}s",
                       ClientConfig::DEFAULT_POLL_INTERVAL.as_secs());
            self.poll_interval = ClientConfig::DEFAULT_POLL_INTERVAL;
        } else {
            self.poll_interval = interval;
        }
        self
    }

    /// Set randomized jitter subtracted from each poll interval.
    pub fn poll_jitter(mut self, jitter: Duration) -> Self {
        self.poll_jitter = jitter;
        self
    }

    /// Enable or disable push updates. When disabled, the client relies on polling only.
    pub fn enable_stream(mut self, enable: bool) -> Self {
        self.enable_stream = enable;
        self
    }

    /// Enable or disable passing evaluations to the metrics processor.
    pub fn enable_analytics(mut self, enable: bool) -> Self {
        self.enable_analytics = enable;
        self
    }

    /// Set timeout of a single API request.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set number of retries of each fetch within a poll cycle.
    pub fn fetch_retries(mut self, retries: u32) -> Self {
        self.fetch_retries = retries;
        self
    }

    /// Set number of authentication retries before the client serves defaults.
    pub fn auth_retries(mut self, retries: u32) -> Self {
        self.auth_retries = retries;
        self
    }

    /// Set base delay between authentication and fetch retries.
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Set bounds of the stream reconnect delay.
    pub fn stream_retry_delay(mut self, min: Duration, max: Duration) -> Self {
        self.stream_min_retry_delay = min;
        self.stream_max_retry_delay = max.max(min);
        self
    }

    /// Replace the fast in-process cache.
    pub fn cache(mut self, cache: impl KeyValueCache + 'static) -> Self {
        self.cache = Arc::new(cache);
        self
    }

    /// Add a durable store. Writes go through to it and the fast cache is repopulated from it.
    pub fn store(mut self, store: impl AsyncKeyValueStore + 'static) -> Self {
        self.store = Some(Arc::new(store));
        self
    }

    /// Set metrics processor receiving every successful evaluation.
    pub fn metrics_processor(mut self, processor: impl MetricsProcessor + 'static) -> Self {
        self.metrics_processor = Arc::new(processor);
        self
    }

    pub(crate) fn poller_config(&self) -> PollerConfig {
        PollerConfig::new()
            .with_interval(self.poll_interval)
            .with_jitter(self.poll_jitter)
            .with_max_retries(self.fetch_retries)
            .with_retry_delay(self.retry_delay)
    }

    pub(crate) fn streamer_config(&self) -> StreamerConfig {
        StreamerConfig::new()
            .with_min_retry_delay(self.stream_min_retry_delay)
            .with_max_retry_delay(self.stream_max_retry_delay)
    }

    /// Create a new [`Client`] using the specified configuration. Must be called from within a
    /// Tokio runtime.
    pub fn to_client(self) -> Result<Client> {
        Client::new(self)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::ClientConfig;

    #[test]
    fn poll_interval_below_minimum_resets_to_default() {
        let config = ClientConfig::from_api_key("key").poll_interval(Duration::from_millis(500));
        assert_eq!(config.poll_interval, ClientConfig::DEFAULT_POLL_INTERVAL);

        let config = ClientConfig::from_api_key("key").poll_interval(Duration::from_secs(1));
        assert_eq!(config.poll_interval, Duration::from_secs(1));
    }

    #[test]
    fn builds_processor_configs() {
        let config = ClientConfig::from_api_key("key")
            .poll_interval(Duration::from_secs(10))
            .poll_jitter(Duration::from_secs(2))
            .fetch_retries(7)
            .stream_retry_delay(Duration::from_secs(5), Duration::from_secs(1));

        let poller = config.poller_config();
        assert_eq!(poller.interval, Duration::from_secs(10));
        assert_eq!(poller.jitter, Duration::from_secs(2));
        assert_eq!(poller.max_retries, 7);

        let streamer = config.streamer_config();
        assert_eq!(streamer.min_retry_delay, Duration::from_secs(5));
        assert_eq!(streamer.max_retry_delay, Duration::from_secs(5));
    }

    #[test]
    fn defaults() {
        let config = ClientConfig::from_api_key("key");
        assert_eq!(config.base_url, "https://config.ff.harness.io/api/1.0");
        assert!(config.enable_stream);
        assert!(config.enable_analytics);
        assert!(config.store.is_none());
    }
}
