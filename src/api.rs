//! Transport seam between the synchronization layer and the remote service.
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::{FeatureConfig, Result, Segment};

/// Raw body of the push-update stream, as received from the transport.
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// Remote API consumed by the poller and the streamer.
///
/// [`HttpClientApi`](crate::HttpClientApi) is the production implementation.
#[async_trait]
pub trait ClientApi: Send + Sync {
    /// Fetch all flag definitions of the environment.
    async fn get_feature_configs(&self, environment: &str) -> Result<Vec<FeatureConfig>>;

    /// Fetch all segment definitions of the environment.
    async fn get_segments(&self, environment: &str) -> Result<Vec<Segment>>;

    /// Fetch a single flag definition.
    async fn get_feature_config(&self, identifier: &str, environment: &str)
        -> Result<FeatureConfig>;

    /// Fetch a single segment definition.
    async fn get_segment(&self, identifier: &str, environment: &str) -> Result<Segment>;

    /// Open the push-update stream. The returned stream yields newline-delimited frames; the
    /// connection is considered dropped when the stream ends or yields an error.
    async fn open_stream(&self) -> Result<ByteStream>;
}
