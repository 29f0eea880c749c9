use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::AUTHORIZATION;
use http::{HeaderValue, Request};
use http_body_util::Full;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, instrument, warn, Level};

use crate::config::{resolve_project_id, Config, Environment, ServiceConfig};
use crate::resolver::{resolve, CredentialsLoadingStrategy, ResolvedCredentials};
use crate::types::{self, Transport};
use crate::{Error, TokenProvider};

/// Sends API requests authenticated with tokens from a [`TokenProvider`]
///
/// Every request gets a current token attached as `Authorization: Bearer`. The client keeps
/// no state of its own besides the project it works against; token caching is left to the
/// provider.
pub struct ServiceClient {
    provider: Arc<dyn TokenProvider>,
    transport: Arc<dyn Transport>,
    project_id: Option<Arc<str>>,
    timeout: Duration,
}

impl ServiceClient {
    /// Create a client using `provider` for tokens and the project from `config`, if any
    pub fn new(
        provider: Arc<dyn TokenProvider>,
        transport: Arc<dyn Transport>,
        config: &Config,
    ) -> Self {
        Self {
            provider,
            transport,
            project_id: config.project_id.as_deref().map(Arc::from),
            timeout: config.request_timeout,
        }
    }

    /// Work against `project_id` instead of asking the provider
    pub fn with_project_id(mut self, project_id: impl Into<Arc<str>>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    /// Wrap resolved credentials in the matching provider and settle the project
    ///
    /// See [`resolve_project_id`] for how the project is chosen.
    pub fn from_resolved(
        credentials: ResolvedCredentials,
        scopes: &[&str],
        service: &ServiceConfig,
        config: &Config,
        env: &Environment,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, Error> {
        let project_id = resolve_project_id(env, &credentials, service, config)?;
        let provider = credentials.into_provider(scopes, config, transport.clone())?;
        Ok(Self {
            provider,
            transport,
            project_id,
            timeout: config.request_timeout,
        })
    }

    /// Resolve credentials according to `strategy`, then behave like [`ServiceClient::from_resolved`]
    pub async fn from_strategy(
        strategy: CredentialsLoadingStrategy,
        scopes: &[&str],
        service: &ServiceConfig,
        config: &Config,
        env: &Environment,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, Error> {
        let credentials = resolve(strategy, env, config).await?;
        Self::from_resolved(credentials, scopes, service, config, env, transport)
    }

    /// The project this client works against
    ///
    /// Falls back to the provider, which for compute engine asks the metadata server.
    pub async fn project_id(&self) -> Result<Arc<str>, Error> {
        match &self.project_id {
            Some(project_id) => Ok(project_id.clone()),
            None => self.provider.project_id().await,
        }
    }

    /// The token provider behind this client
    pub fn provider(&self) -> &Arc<dyn TokenProvider> {
        &self.provider
    }

    /// Send `request` with a bearer token and decode the JSON response
    ///
    /// Non-2xx responses become [`Error::Api`] when they carry the Google API error body,
    /// [`Error::Server`] otherwise.
    #[instrument(level = Level::DEBUG, skip_all, fields(uri = %request.uri()))]
    pub async fn send<T: DeserializeOwned>(
        &self,
        mut request: Request<Full<Bytes>>,
    ) -> Result<T, Error> {
        let token = self.provider.token().await?;
        let mut value = HeaderValue::from_str(&format!("Bearer {}", token.as_str()))
            .map_err(|_| Error::Str("access token is not a valid header value"))?;
        value.set_sensitive(true);
        request.headers_mut().insert(AUTHORIZATION, value);

        let response = types::send(&*self.transport, request, self.timeout).await?;
        let status = response.status();
        if !status.is_success() {
            warn!(?status, "API request failed");
            return Err(match serde_json::from_slice::<ErrorEnvelope>(response.body()) {
                Ok(envelope) => Error::Api(envelope.error),
                Err(_) => Error::Server(status, String::from_utf8_lossy(response.body()).into_owned()),
            });
        }

        debug!(?status, "API request succeeded");
        serde_json::from_slice(response.body())
            .map_err(|err| Error::Json("failed to deserialize API response", err))
    }
}

impl fmt::Debug for ServiceClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceClient")
            .field("transport", &self.transport)
            .field("project_id", &self.project_id)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// The error object of a Google API response
///
/// See <https://cloud.google.com/apis/design/errors#http_mapping>.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct ApiError {
    /// HTTP status code
    pub code: u16,
    /// Developer-facing error message
    pub message: String,
    /// Canonical status name, such as `PERMISSION_DENIED`
    #[serde(default)]
    pub status: Option<String>,
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.message)?;
        if let Some(status) = &self.status {
            write!(f, " ({status})")?;
        }
        Ok(())
    }
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ApiError,
}
