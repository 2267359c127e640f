use std::sync::{Arc, Mutex};

use tokio::{
    runtime::Handle,
    sync::{broadcast, watch},
    task::JoinHandle,
};

use crate::{
    api::ClientApi,
    backoff::with_retries,
    coordinator::{Awaiting, Coordinator, InitState},
    evaluator::{Evaluator, OnEvaluation},
    event_bus::{EventBus, SdkEvent},
    metrics::MetricsProcessor,
    sdk_codes::SdkCode,
    ClientConfig, Error, FeatureConfig, HttpClientApi, Poller, PollerConfig, Repository, Result,
    Streamer, StreamerConfig, Target, Variation,
};

/// A feature-flag client.
///
/// The client keeps a local copy of all flags and segments of the environment, refreshed by
/// polling and push updates, and evaluates flags locally.
///
/// # Examples
/// ```no_run
/// # async fn example() -> ff_server_sdk::Result<()> {
/// use ff_server_sdk::{ClientConfig, Target};
///
/// let client = ClientConfig::from_api_key("api-key").to_client()?;
/// client.wait_for_initialization().await?;
///
/// let target = Target::new("user-1").with_attribute("email", "user@example.com");
/// if client.bool_variation("new-checkout", &target, false).await {
///     println!("new checkout enabled");
/// }
///
/// client.close().await;
/// # Ok(())
/// # }
/// ```
pub struct Client {
    shared: Arc<Shared>,
    evaluator: Evaluator,
    on_evaluation: Box<dyn Fn(&FeatureConfig, &Target, &Variation) + Send + Sync>,
}

struct Shared {
    bus: EventBus,
    repository: Arc<Repository>,
    init: Arc<watch::Sender<InitState>>,
    metrics: Arc<dyn MetricsProcessor>,
    enable_stream: bool,
    enable_analytics: bool,
    poller_config: PollerConfig,
    streamer_config: StreamerConfig,
    processors: Mutex<Processors>,
}

#[derive(Default)]
struct Processors {
    closed: bool,
    startup: Option<JoinHandle<()>>,
    poller: Option<Arc<Poller>>,
    streamer: Option<Arc<Streamer>>,
    coordinator: Option<JoinHandle<()>>,
}

impl Client {
    /// Create a new `Client` and start fetching flags in the background.
    ///
    /// Authentication failures do not fail construction: the client serves defaults and
    /// [`Client::wait_for_initialization`] reports the error.
    ///
    /// # Errors
    ///
    /// - [`Error::NoRuntime`] if called outside of a Tokio runtime.
    /// - [`Error::InvalidBaseUrl`] if the configured base URL cannot be parsed.
    pub fn new(config: ClientConfig) -> Result<Client> {
        let runtime = Handle::try_current().map_err(|_| Error::NoRuntime)?;
        let api = Arc::new(HttpClientApi::new(
            &config.base_url,
            config.api_key.clone(),
            config.request_timeout,
        )?);
        let auth_retries = config.auth_retries;
        let retry_delay = config.retry_delay;
        let api_key_missing = config.api_key.is_empty();
        let client = Client::from_config(config);

        if api_key_missing {
            log::warn!(target: "ff", "{}", SdkCode::InitMissingKey);
            client.shared.fail(Error::MissingApiKey);
            return Ok(client);
        }

        log::info!(target: "ff", "{}", SdkCode::InitWaiting);
        let shared = client.shared.clone();
        let startup = runtime.spawn(async move {
            match with_retries(auth_retries, retry_delay, || api.authenticate()).await {
                Ok(auth) => shared.start_processors(api, auth.environment),
                Err(err) => {
                    if err.is_retriable() {
                        log::error!(target: "ff", "{} {err}", SdkCode::AuthRetriesExceeded);
                    } else {
                        log::error!(target: "ff", "{} {err}", SdkCode::AuthFailed);
                    }
                    log::warn!(target: "ff", "{}", SdkCode::InitAuthFailed);
                    shared.fail(err);
                }
            }
        });
        client.shared.lock_processors().startup = Some(startup);

        Ok(client)
    }

    /// Create a client over a custom [`ClientApi`] for an already known `environment`. Processors
    /// start immediately; no authentication is performed.
    ///
    /// # Errors
    ///
    /// - [`Error::NoRuntime`] if called outside of a Tokio runtime.
    pub fn with_api(
        config: ClientConfig,
        api: Arc<dyn ClientApi>,
        environment: impl Into<String>,
    ) -> Result<Client> {
        Handle::try_current().map_err(|_| Error::NoRuntime)?;
        let client = Client::from_config(config);
        client.shared.start_processors(api, environment.into());
        Ok(client)
    }

    fn from_config(config: ClientConfig) -> Client {
        let bus = EventBus::new();
        let repository = Arc::new(Repository::new(
            config.cache.clone(),
            config.store.clone(),
            Some(bus.clone()),
        ));
        let (init, _) = watch::channel(InitState::Pending);
        let metrics = config.metrics_processor.clone();

        let on_evaluation = {
            let metrics = metrics.clone();
            Box::new(
                move |flag: &FeatureConfig, target: &Target, variation: &Variation| {
                    metrics.enqueue(target, flag, variation);
                },
            )
        };

        Client {
            evaluator: Evaluator::new(repository.clone()),
            on_evaluation,
            shared: Arc::new(Shared {
                poller_config: config.poller_config(),
                streamer_config: config.streamer_config(),
                bus,
                repository,
                init: Arc::new(init),
                metrics,
                enable_stream: config.enable_stream,
                enable_analytics: config.enable_analytics,
                processors: Mutex::new(Processors::default()),
            }),
        }
    }

    fn on_success(&self) -> Option<OnEvaluation<'_>> {
        self.shared
            .enable_analytics
            .then_some(&*self.on_evaluation as OnEvaluation<'_>)
    }

    /// Evaluate a boolean flag. Returns `default` if the flag cannot be evaluated.
    pub async fn bool_variation(&self, identifier: &str, target: &Target, default: bool) -> bool {
        self.evaluator
            .bool_variation(identifier, target, default, self.on_success())
            .await
    }

    /// Evaluate a string flag. Returns `default` if the flag cannot be evaluated.
    pub async fn string_variation(
        &self,
        identifier: &str,
        target: &Target,
        default: impl Into<String>,
    ) -> String {
        self.evaluator
            .string_variation(identifier, target, default.into(), self.on_success())
            .await
    }

    /// Evaluate a number flag. Returns `default` if the flag cannot be evaluated.
    pub async fn number_variation(&self, identifier: &str, target: &Target, default: f64) -> f64 {
        self.evaluator
            .number_variation(identifier, target, default, self.on_success())
            .await
    }

    /// Evaluate a JSON flag. Returns `default` if the flag cannot be evaluated.
    pub async fn json_variation(
        &self,
        identifier: &str,
        target: &Target,
        default: serde_json::Value,
    ) -> serde_json::Value {
        self.evaluator
            .json_variation(identifier, target, default, self.on_success())
            .await
    }

    /// Wait until the first refresh of every enabled processor has completed.
    ///
    /// # Errors
    ///
    /// Returns the error that put the client into serve-defaults mode, e.g.,
    /// [`Error::Unauthorized`] or [`Error::MissingApiKey`].
    pub async fn wait_for_initialization(&self) -> Result<()> {
        let mut init = self.shared.init.subscribe();
        let state = init
            .wait_for(|state| !matches!(state, InitState::Pending))
            .await
            .map_err(|_| Error::Closed)?
            .clone();
        match state {
            InitState::Failed(err) => Err(err),
            InitState::Ready | InitState::Pending => Ok(()),
        }
    }

    /// Current initialization state.
    pub fn init_state(&self) -> InitState {
        self.shared.init.borrow().clone()
    }

    /// Subscribe to SDK events. [`SdkEvent::Changed`] is published with the flag identifier
    /// whenever a flag, or a segment it depends on, changes.
    pub fn subscribe(&self) -> broadcast::Receiver<SdkEvent> {
        self.shared.bus.subscribe()
    }

    /// Stop polling, abort the stream and flush metrics. A second call is a no-op.
    pub async fn close(&self) {
        let processors = {
            let mut processors = self.shared.lock_processors();
            if processors.closed {
                return;
            }
            let taken = std::mem::take(&mut *processors);
            processors.closed = true;
            taken
        };

        log::info!(target: "ff", "{}", SdkCode::CloseStarted);
        processors.shutdown();
        if self.shared.enable_analytics {
            self.shared.metrics.close().await;
        }
        log::info!(target: "ff", "{}", SdkCode::CloseOk);
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        let mut processors = self.shared.lock_processors();
        let taken = std::mem::take(&mut *processors);
        processors.closed = true;
        taken.shutdown();
    }
}

impl Shared {
    fn lock_processors(&self) -> std::sync::MutexGuard<'_, Processors> {
        self.processors
            .lock()
            .expect("thread holding processors lock should not panic")
    }

    fn start_processors(&self, api: Arc<dyn ClientApi>, environment: String) {
        let events = self.bus.subscribe();
        let poller = Arc::new(Poller::new(
            api.clone(),
            self.repository.clone(),
            self.bus.clone(),
            environment.clone(),
            self.poller_config.clone(),
        ));
        let streamer = self.enable_stream.then(|| {
            Arc::new(Streamer::new(
                api,
                self.repository.clone(),
                self.bus.clone(),
                environment,
                self.streamer_config.clone(),
            ))
        });
        let awaiting = Awaiting {
            poller: true,
            stream: streamer.is_some(),
            metrics: self.enable_analytics,
        };

        let mut processors = self.lock_processors();
        if processors.closed {
            return;
        }

        processors.coordinator = Some(
            Coordinator::new(
                self.bus.clone(),
                self.repository.clone(),
                poller.clone(),
                streamer.clone(),
                self.init.clone(),
                awaiting,
            )
            .spawn(events),
        );
        poller.start();
        if let Some(streamer) = &streamer {
            streamer.start();
        }
        if self.enable_analytics {
            self.metrics.start();
            log::info!(target: "ff", "{}", SdkCode::MetricsStarted);
            self.bus.publish(SdkEvent::MetricsReady);
        }

        processors.poller = Some(poller);
        processors.streamer = streamer;
    }

    fn fail(&self, err: Error) {
        self.init.send_if_modified(|state| {
            if matches!(state, InitState::Pending) {
                *state = InitState::Failed(err);
                true
            } else {
                false
            }
        });
    }
}

impl Processors {
    /// Stop the poll timer, then abort the stream connection.
    fn shutdown(self) {
        if let Some(startup) = self.startup {
            startup.abort();
        }
        if let Some(poller) = self.poller {
            poller.close();
        }
        if let Some(streamer) = self.streamer {
            streamer.close();
        }
        if let Some(coordinator) = self.coordinator {
            coordinator.abort();
        }
    }
}
