//! An HTTP client for the feature-flag service.
use std::{sync::RwLock, time::Duration};

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use futures::{StreamExt, TryStreamExt};
use reqwest::{header::ACCEPT, StatusCode, Url};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{
    api::{ByteStream, ClientApi},
    sdk_codes::SdkCode,
    Error, FeatureConfig, Result, Segment,
};

/// Default address of the feature-flag service.
pub const DEFAULT_BASE_URL: &str = "https://config.ff.harness.io/api/1.0";

const DEFAULT_CLUSTER: &str = "1";

/// Identity of the environment the API key belongs to, as returned by authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthInfo {
    /// Environment identifier. Passed to every fetch.
    pub environment: String,
    /// Cluster the environment is served from.
    pub cluster: String,
}

#[derive(Debug, Clone)]
struct Session {
    token: String,
    cluster: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AuthRequest<'a> {
    api_key: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthResponse {
    auth_token: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Claims {
    environment: String,
    #[serde(default)]
    cluster_identifier: Option<String>,
}

/// [`ClientApi`] over HTTP.
///
/// Call [`HttpClientApi::authenticate`] before any other request.
pub struct HttpClientApi {
    // Client holds a connection pool internally, so we're reusing the client between requests.
    client: reqwest::Client,
    base_url: Url,
    api_key: String,
    /// Timeout of JSON requests. The stream connection is long-lived and has none.
    timeout: Duration,
    session: RwLock<Option<Session>>,
}

impl HttpClientApi {
    /// Create a client for the service at `base_url`.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidBaseUrl`] if `base_url` cannot be parsed.
    pub fn new(base_url: &str, api_key: impl Into<String>, timeout: Duration) -> Result<HttpClientApi> {
        let base_url = Url::parse(base_url).map_err(Error::InvalidBaseUrl)?;
        if base_url.cannot_be_a_base() {
            return Err(Error::InvalidBaseUrl(url::ParseError::RelativeUrlWithCannotBeABaseBase));
        }
        Ok(HttpClientApi {
            client: reqwest::Client::new(),
            base_url,
            api_key: api_key.into(),
            timeout,
            session: RwLock::new(None),
        })
    }

    /// Exchange the API key for a session token.
    ///
    /// # Errors
    ///
    /// - [`Error::MissingApiKey`] if the API key is empty.
    /// - [`Error::Unauthorized`] if the server rejects the key.
    /// - [`Error::InvalidToken`] if the token does not carry the environment claims.
    pub async fn authenticate(&self) -> Result<AuthInfo> {
        if self.api_key.is_empty() {
            return Err(Error::MissingApiKey);
        }

        let url = self.endpoint(&["client", "auth"], &[])?;
        log::debug!(target: "ff", "authenticating");
        let response = self
            .client
            .post(url)
            .json(&AuthRequest {
                api_key: &self.api_key,
            })
            .timeout(self.timeout)
            .send()
            .await?;
        let response: AuthResponse = check_status(response, "auth")?.json().await?;

        let claims = decode_claims(&response.auth_token)?;
        let cluster = claims
            .cluster_identifier
            .filter(|cluster| !cluster.is_empty())
            .unwrap_or_else(|| DEFAULT_CLUSTER.to_owned());

        *self
            .session
            .write()
            .expect("thread holding session lock should not panic") = Some(Session {
            token: response.auth_token,
            cluster: cluster.clone(),
        });

        log::info!(target: "ff", environment = claims.environment.as_str(), cluster = cluster.as_str(); "{}", SdkCode::AuthOk);
        Ok(AuthInfo {
            environment: claims.environment,
            cluster,
        })
    }

    fn session(&self) -> Result<Session> {
        self.session
            .read()
            .expect("thread holding session lock should not panic")
            .clone()
            .ok_or(Error::Unauthorized)
    }

    fn endpoint(&self, path: &[&str], query: &[(&str, &str)]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| Error::InvalidBaseUrl(url::ParseError::RelativeUrlWithCannotBeABaseBase))?
            .pop_if_empty()
            .extend(path);
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        Ok(url)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &[&str], query: &[(&str, &str)]) -> Result<T> {
        let session = self.session()?;
        let mut query = query.to_vec();
        query.push(("cluster", &session.cluster));
        let url = self.endpoint(path, &query)?;

        log::debug!(target: "ff", path = url.path(); "fetching");
        let response = self
            .client
            .get(url)
            .bearer_auth(&session.token)
            .timeout(self.timeout)
            .send()
            .await?;

        let what = path.join("/");
        Ok(check_status(response, &what)?.json().await?)
    }
}

#[async_trait]
impl ClientApi for HttpClientApi {
    async fn get_feature_configs(&self, environment: &str) -> Result<Vec<FeatureConfig>> {
        self.get_json(&["client", "env", environment, "feature-configs"], &[])
            .await
    }

    async fn get_segments(&self, environment: &str) -> Result<Vec<Segment>> {
        self.get_json(
            &["client", "env", environment, "target-segments"],
            &[("rules", "v2")],
        )
        .await
    }

    async fn get_feature_config(
        &self,
        identifier: &str,
        environment: &str,
    ) -> Result<FeatureConfig> {
        self.get_json(
            &["client", "env", environment, "feature-configs", identifier],
            &[],
        )
        .await
    }

    async fn get_segment(&self, identifier: &str, environment: &str) -> Result<Segment> {
        self.get_json(
            &["client", "env", environment, "target-segments", identifier],
            &[("rules", "v2")],
        )
        .await
    }

    async fn open_stream(&self) -> Result<ByteStream> {
        let session = self.session()?;
        let url = self.endpoint(&["stream"], &[("cluster", &session.cluster)])?;

        log::debug!(target: "ff", "opening stream");
        let response = self
            .client
            .get(url)
            .bearer_auth(&session.token)
            .header("API-Key", &self.api_key)
            .header(ACCEPT, "text/event-stream")
            .send()
            .await?;

        let response = check_status(response, "stream")?;
        Ok(response.bytes_stream().map_err(Error::from).boxed())
    }
}

fn check_status(response: reqwest::Response, what: &str) -> Result<reqwest::Response> {
    match response.status() {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            log::warn!(target: "ff", "client is not authorized. Check your API key");
            Err(Error::Unauthorized)
        }
        StatusCode::NOT_FOUND => Err(Error::NotFound(what.to_owned())),
        _ => response.error_for_status().map_err(|err| {
            log::warn!(target: "ff", "received non-200 response: {:?}", err);
            Error::from(err)
        }),
    }
}

/// Decode the JWT payload. The signature is not verified: the token is only used to discover the
/// environment and is validated by the server on every request.
fn decode_claims(token: &str) -> Result<Claims> {
    let payload = token
        .split('.')
        .nth(1)
        .ok_or_else(|| Error::InvalidToken("expected three dot-separated parts".to_owned()))?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|err| Error::InvalidToken(err.to_string()))?;
    serde_json::from_slice(&bytes).map_err(|err| Error::InvalidToken(err.to_string()))
}
