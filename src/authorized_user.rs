use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::Full;
use hyper::header::CONTENT_TYPE;
use hyper::Request;
use tracing::{debug, instrument, Level};
use url::form_urlencoded;

use crate::cache::TokenCache;
use crate::config::Config;
use crate::credentials::{Credential, CredentialType, GCloudCredentials};
use crate::types::{self, HttpClient, Token, Transport};
use crate::{Error, TokenProvider};

/// A token provider that exchanges a gcloud refresh token for access tokens
///
/// The credentials are usually found in `.config/gcloud/application_default_credentials.json`,
/// written by `gcloud auth application-default login`.
#[derive(Debug)]
pub struct AuthorizedUser {
    transport: Arc<dyn Transport>,
    credentials: GCloudCredentials,
    token_endpoint: String,
    timeout: Duration,
    cache: TokenCache,
}

impl AuthorizedUser {
    /// Create a provider for the given credentials
    pub fn new(
        credentials: GCloudCredentials,
        config: &Config,
        transport: Arc<dyn Transport>,
    ) -> Self {
        debug!(project = ?credentials.quota_project_id, client = %credentials.client_id, "found user credentials");
        Self {
            transport,
            credentials,
            token_endpoint: config.token_endpoint.clone(),
            timeout: config.request_timeout,
            cache: TokenCache::new(config.margins.authorized_user),
        }
    }

    /// Read user credentials from the given JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        match Credential::from_file(path, CredentialType::GCloud)? {
            Credential::GCloud(credentials) => Ok(Self::new(
                credentials,
                &Config::default(),
                Arc::new(HttpClient::new()?),
            )),
            Credential::ServiceAccount(_) => Err(Error::Str("expected gcloud user credentials")),
        }
    }

    /// Fetch a new token even if the cached one is still fresh
    ///
    /// If the exchange fails, the cached token is left as it was.
    pub async fn refresh(&self) -> Result<Arc<Token>, Error> {
        self.cache.refresh(|| self.fetch_token()).await
    }

    #[instrument(level = Level::DEBUG, skip(self))]
    async fn fetch_token(&self) -> Result<Token, Error> {
        let body = form_urlencoded::Serializer::new(String::new())
            .extend_pairs(&[
                ("client_id", self.credentials.client_id.as_str()),
                ("client_secret", self.credentials.client_secret.as_str()),
                ("refresh_token", self.credentials.refresh_token.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .finish();

        let mut request = Request::post(self.token_endpoint.as_str())
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded");
        if let Some(project) = &self.credentials.quota_project_id {
            request = request.header(QUOTA_PROJECT_HEADER, &**project);
        }

        let request = request
            .body(Full::from(Bytes::from(body)))
            .map_err(|err| Error::Other("failed to build token request", Box::new(err)))?;

        types::request_token(&*self.transport, request, self.timeout, "AuthorizedUser").await
    }
}

#[async_trait]
impl TokenProvider for AuthorizedUser {
    async fn token(&self) -> Result<Arc<Token>, Error> {
        self.cache.get(|| self.fetch_token()).await
    }

    async fn project_id(&self) -> Result<Arc<str>, Error> {
        self.credentials
            .quota_project_id
            .clone()
            .ok_or(Error::Str("no project ID in user credentials"))
    }
}

const QUOTA_PROJECT_HEADER: &str = "X-Goog-User-Project";
