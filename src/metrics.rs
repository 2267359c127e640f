use async_trait::async_trait;

use crate::{FeatureConfig, Target, Variation};

/// Receives every successful evaluation, e.g., to batch and post analytics.
///
/// Closures taking `(target, flag, variation)` implement this trait.
///
/// ```
/// # use ff_server_sdk::ClientConfig;
/// let config = ClientConfig::from_api_key("api-key")
///     .metrics_processor(|target: &ff_server_sdk::Target,
///                         flag: &ff_server_sdk::FeatureConfig,
///                         variation: &ff_server_sdk::Variation| {
///         println!("{} got {} of {}", target.identifier, variation.identifier, flag.feature);
///     });
/// ```
#[async_trait]
pub trait MetricsProcessor: Send + Sync {
    /// Called once when the client starts its processors.
    fn start(&self) {}

    /// Record one evaluation. Must not block.
    fn enqueue(&self, target: &Target, flag: &FeatureConfig, variation: &Variation);

    /// Flush pending data. Called once when the client is closed.
    async fn close(&self) {}
}

pub(crate) struct NoopMetricsProcessor;

impl MetricsProcessor for NoopMetricsProcessor {
    fn enqueue(&self, _target: &Target, _flag: &FeatureConfig, _variation: &Variation) {}
}

impl<T: Fn(&Target, &FeatureConfig, &Variation) + Send + Sync> MetricsProcessor for T {
    fn enqueue(&self, target: &Target, flag: &FeatureConfig, variation: &Variation) {
        self(target, flag, variation);
    }
}
