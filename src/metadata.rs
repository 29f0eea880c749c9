use std::str;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{Response, StatusCode};
use http_body_util::Full;
use hyper::{Method, Request};
use tokio::sync::OnceCell;
use tracing::{debug, instrument, warn, Level};
use url::form_urlencoded;

use crate::cache::TokenCache;
use crate::config::Config;
use crate::types::{self, Token, Transport};
use crate::{Error, TokenProvider};

/// A token provider that queries the GCP instance metadata server for access tokens
///
/// Works on Compute Engine, GKE, Cloud Run and App Engine flexible. The instance's default
/// service account is used unless another one is chosen with [`MetadataServiceAccount::with_account`].
///
/// See <https://cloud.google.com/compute/docs/metadata/predefined-metadata-keys> for details.
#[derive(Debug)]
pub struct MetadataServiceAccount {
    transport: Arc<dyn Transport>,
    metadata_base: String,
    account: String,
    scopes: Vec<String>,
    timeout: Duration,
    cache: TokenCache,
    project_id: OnceCell<Arc<str>>,
}

impl MetadataServiceAccount {
    /// Create a provider talking to the metadata server at `metadata_base`
    pub fn new(
        metadata_base: impl Into<String>,
        scopes: &[&str],
        config: &Config,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            transport,
            metadata_base: metadata_base.into(),
            account: DEFAULT_ACCOUNT.to_owned(),
            scopes: scopes.iter().map(|s| s.to_string()).collect(),
            timeout: config.request_timeout,
            cache: TokenCache::new(config.margins.metadata),
            project_id: OnceCell::new(),
        }
    }

    /// Use the named service account attached to the instance instead of `default`
    pub fn with_account(mut self, account: impl Into<String>) -> Self {
        self.account = account.into();
        self
    }

    /// Fetch a new token even if the cached one is still fresh
    ///
    /// If the request fails, the cached token is left as it was.
    pub async fn refresh(&self) -> Result<Arc<Token>, Error> {
        self.cache.refresh(|| self.fetch_token()).await
    }

    fn token_uri(&self) -> String {
        let mut uri = format!(
            "{}{TOKEN_PATH}/{}/token",
            self.metadata_base, self.account
        );
        if !self.scopes.is_empty() {
            let query = form_urlencoded::Serializer::new(String::new())
                .append_pair("scopes", &self.scopes.join(","))
                .finish();
            uri.push('?');
            uri.push_str(&query);
        }
        uri
    }

    #[instrument(level = Level::DEBUG, skip(self))]
    async fn fetch_token(&self) -> Result<Token, Error> {
        let request = metadata_request(&self.token_uri())?;
        types::request_token(
            &*self.transport,
            request,
            self.timeout,
            "MetadataServiceAccount",
        )
        .await
    }

    async fn fetch_project_id(&self) -> Result<Arc<str>, Error> {
        debug!("getting project ID from GCP instance metadata server");
        let request = metadata_request(&format!("{}{PROJECT_ID_PATH}", self.metadata_base))?;
        let response = types::send(&*self.transport, request, self.timeout).await?;
        if !response.status().is_success() {
            warn!(status = ?response.status(), "project ID request failed");
            return Err(server_error(response));
        }

        match str::from_utf8(response.body()) {
            Ok(s) if !s.trim().is_empty() => Ok(Arc::from(s.trim())),
            Ok(_) => Err(Error::Str(
                "empty project ID from GCP instance metadata server",
            )),
            Err(_) => Err(Error::Str(
                "received invalid UTF-8 project ID from GCP instance metadata server",
            )),
        }
    }
}

#[async_trait]
impl TokenProvider for MetadataServiceAccount {
    async fn token(&self) -> Result<Arc<Token>, Error> {
        self.cache.get(|| self.fetch_token()).await
    }

    async fn project_id(&self) -> Result<Arc<str>, Error> {
        self.project_id
            .get_or_try_init(|| self.fetch_project_id())
            .await
            .cloned()
    }
}

/// A GET request carrying the `Metadata-Flavor: Google` header
pub(crate) fn metadata_request(uri: &str) -> Result<Request<Full<Bytes>>, Error> {
    Request::builder()
        .method(Method::GET)
        .uri(uri)
        .header(METADATA_FLAVOR, METADATA_GOOGLE)
        .body(Full::from(Bytes::new()))
        .map_err(|err| Error::Other("failed to build metadata request", Box::new(err)))
}

/// Whether a response came from a real metadata server
///
/// Some networks answer every request, so only the echoed flavor header counts.
pub(crate) fn is_metadata_response(response: &Response<Bytes>) -> bool {
    response
        .headers()
        .get(METADATA_FLAVOR)
        .is_some_and(|value| value.as_bytes() == METADATA_GOOGLE.as_bytes())
}

fn server_error(response: Response<Bytes>) -> Error {
    let status: StatusCode = response.status();
    Error::Server(status, String::from_utf8_lossy(response.body()).into_owned())
}

pub(crate) const METADATA_FLAVOR: &str = "Metadata-Flavor";
pub(crate) const METADATA_GOOGLE: &str = "Google";
const DEFAULT_ACCOUNT: &str = "default";
// https://cloud.google.com/compute/docs/metadata/predefined-metadata-keys
const TOKEN_PATH: &str = "/computeMetadata/v1/instance/service-accounts";
const PROJECT_ID_PATH: &str = "/computeMetadata/v1/project/project-id";
