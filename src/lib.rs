//! Credential resolution and OAuth 2.0 token lifecycle for Google Cloud REST clients
//!
//! A client for a Google service is built from a [`CredentialsLoadingStrategy`]. The
//! [`resolve()`] function turns the strategy into [`ResolvedCredentials`]:
//!
//! 1. [`CredentialsLoadingStrategy::FilePath`] reads gcloud user or service account
//!    credentials from the given JSON file.
//! 2. [`CredentialsLoadingStrategy::Environment`] reads the file named by the
//!    `GOOGLE_APPLICATION_CREDENTIALS` environment variable, falling back to
//!    `.config/gcloud/application_default_credentials.json` in the home directory. This file
//!    can be created by invoking `gcloud auth application-default login`.
//! 3. [`CredentialsLoadingStrategy::ComputeEngine`] probes the GCP instance metadata server
//!    and uses the instance's service account. Setting `NO_GCE_CHECK` disables the probe.
//!
//! The resolved credentials are wrapped in a [`TokenProvider`]. A provider handles caching
//! tokens for their lifetime; it will not make a request if an appropriate token is already
//! cached. Therefore, the caller should not cache tokens.
//!
//! ## Simple usage
//!
//! ```rust,no_run
//! # async fn get_token() -> Result<(), gcp_credentials::Error> {
//! use gcp_credentials::CredentialsLoadingStrategy;
//!
//! let scopes = &["https://www.googleapis.com/auth/cloud-platform"];
//! let provider = gcp_credentials::provider(CredentialsLoadingStrategy::Environment, scopes).await?;
//! let token = provider.token().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Authenticated requests
//!
//! [`ServiceClient`] attaches a current token to every request and decodes Google API errors:
//!
//! ```rust,no_run
//! # async fn list() -> Result<(), gcp_credentials::Error> {
//! use std::sync::Arc;
//!
//! use gcp_credentials::{
//!     Config, CredentialsLoadingStrategy, Environment, HttpClient, ServiceClient, ServiceConfig,
//! };
//!
//! let env = Environment::from_process();
//! let config = Config::from_environment(&env);
//! let client = ServiceClient::from_strategy(
//!     CredentialsLoadingStrategy::Environment,
//!     &["https://www.googleapis.com/auth/devstorage.read_only"],
//!     &ServiceConfig::default(),
//!     &config,
//!     &env,
//!     Arc::new(HttpClient::new()?),
//! )
//! .await?;
//!
//! let project = client.project_id().await?;
//! let request = http::Request::get(format!(
//!     "https://storage.googleapis.com/storage/v1/b?project={project}"
//! ))
//! .body(http_body_util::Full::new(bytes::Bytes::new()))
//! .expect("valid request");
//! let buckets: serde_json::Value = client.send(request).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Getting tokens in multi-thread or async environments
//!
//! Using a `OnceCell` makes it easy to reuse the [`TokenProvider`] across different
//! threads or async tasks.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tokio::sync::OnceCell;
//! use gcp_credentials::{CredentialsLoadingStrategy, TokenProvider};
//!
//! static TOKEN_PROVIDER: OnceCell<Arc<dyn TokenProvider>> = OnceCell::const_new();
//!
//! async fn token_provider() -> &'static Arc<dyn TokenProvider> {
//!     TOKEN_PROVIDER
//!         .get_or_init(|| async {
//!             gcp_credentials::provider(CredentialsLoadingStrategy::Environment, &[])
//!                 .await
//!                 .expect("unable to initialize token provider")
//!         })
//!         .await
//! }
//! ```

#![warn(unreachable_pub)]

use std::path::PathBuf;
use std::sync::Arc;
use std::{error, io};

use async_trait::async_trait;
use hyper::StatusCode;
use thiserror::Error;
use tracing::{debug, instrument, Level};

mod authorized_user;
pub use authorized_user::AuthorizedUser;

mod cache;

mod config;
pub use config::{
    resolve_project_id, Config, Environment, Margins, ServiceConfig, AUTHORIZED_USER_MARGIN,
    DEFAULT_METADATA_BASE, DEFAULT_TOKEN_ENDPOINT, METADATA_MARGIN, PROBE_ATTEMPTS,
    PROBE_TIMEOUT, REQUEST_TIMEOUT, SERVICE_ACCOUNT_MARGIN,
};

mod credentials;
pub use credentials::{
    Credential, CredentialType, FileLoadError, GCloudCredentials, ServiceAccountCredentials,
};

mod iam;
pub use iam::{IamCredentials, SignedJwt};

mod jwt;
pub use jwt::{Claims, JWT_LIFETIME};

mod metadata;
pub use metadata::MetadataServiceAccount;

mod request;
pub use request::{ApiError, ServiceClient};

mod resolver;
pub use resolver::{resolve, CredentialsLoadingStrategy, ResolvedCredentials};

mod service_account;
pub use service_account::CustomServiceAccount;

#[cfg(test)]
mod testing;

mod types;
pub use types::{HttpClient, OAuthError, Signer, Token, Transport};

/// Resolve credentials according to `strategy` and build the matching token provider
///
/// The process environment is read once, here. Token requests go through the transport of a
/// [`CredentialsLoadingStrategy::ComputeEngine`] strategy, or a new [`HttpClient`] otherwise.
#[instrument(level = Level::DEBUG, skip(strategy))]
pub async fn provider(
    strategy: CredentialsLoadingStrategy,
    scopes: &[&str],
) -> Result<Arc<dyn TokenProvider>, Error> {
    debug!("initializing gcp_credentials");
    let env = Environment::from_process();
    let config = Config::from_environment(&env);
    let transport: Arc<dyn Transport> = match &strategy {
        CredentialsLoadingStrategy::ComputeEngine(transport) => transport.clone(),
        _ => Arc::new(HttpClient::new()?),
    };

    resolve(strategy, &env, &config)
        .await?
        .into_provider(scopes, &config, transport)
}

/// A trait for an authentication context that can provide tokens
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Get a valid token
    ///
    /// Tokens are cached until shortly before they expire, so this method will only fetch a
    /// fresh token once the current token has turned stale. Concurrent callers share a single
    /// refresh.
    async fn token(&self) -> Result<Arc<Token>, Error>;

    /// Get the project ID for the authentication context
    async fn project_id(&self) -> Result<Arc<str>, Error>;
}

/// Enumerates all possible errors returned by this library.
#[derive(Error, Debug)]
pub enum Error {
    /// A credentials file could not be read or decoded
    #[error("failed to load credentials from {}", .0.display())]
    FileLoad(PathBuf, #[source] FileLoadError),

    /// No project ID was found in the environment, the credentials, or the configuration
    #[error("no project ID configured")]
    ProjectIdMissing,

    /// The `NO_GCE_CHECK` environment variable forbids probing the metadata server
    #[error("metadata server check disabled by NO_GCE_CHECK")]
    ComputeEngineCheckDisabled,

    /// No GCP instance metadata server answered the probe
    ///
    /// The metadata server is only available on GCP services.
    #[error("GCP instance metadata server not available")]
    ComputeEngineNotAvailable,

    /// A token endpoint returned an OAuth 2.0 error
    #[error("token request failed with {status}: {error}")]
    OAuth {
        /// HTTP status of the response
        status: StatusCode,
        /// Decoded error body
        error: OAuthError,
    },

    /// A Google API returned an error
    #[error("API error: {0}")]
    Api(ApiError),

    /// A server returned an error status with a body that could not be decoded
    #[error("server responded with {0}: {1}")]
    Server(StatusCode, String),

    /// A request ran out of time
    #[error("{0}")]
    Timeout(&'static str),

    /// The JWT claim set has expired
    #[error("JWT claims have expired")]
    TokenExpired,

    /// Could not connect to server
    #[error("{0}: {1}")]
    Http(&'static str, #[source] hyper::Error),

    /// Represents all other cases of `std::io::Error`.
    #[error("{0}: {1}")]
    Io(&'static str, #[source] io::Error),

    /// Could not serialize or deserialize JSON
    #[error("{0}: {1}")]
    Json(&'static str, #[source] serde_json::error::Error),

    /// Any other failure, with context
    #[error("{0}: {1}")]
    Other(
        &'static str,
        #[source] Box<dyn error::Error + Send + Sync + 'static>,
    ),

    /// A failure described by its message alone
    #[error("{0}")]
    Str(&'static str),
}
