use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, TimeDelta, Utc};
use http::{Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper_rustls::HttpsConnectorBuilder;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use ring::rand::SystemRandom;
use ring::signature::{RsaKeyPair, RSA_PKCS1_SHA256};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::PrivateKeyDer;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::Error;

/// Sends a single HTTP request and buffers the response body
///
/// Every network call made by this crate goes through a [`Transport`]; [`HttpClient`] is the
/// default implementation. Implementations must enforce the given timeout and report it as
/// [`Error::Timeout`].
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Send `request`, failing if no complete response arrives within `timeout`
    async fn send(
        &self,
        request: Request<Full<Bytes>>,
        timeout: Duration,
    ) -> Result<Response<Bytes>, Error>;
}

/// A hyper client speaking HTTP/1 and HTTP/2 over rustls
#[derive(Clone, Debug)]
pub struct HttpClient {
    inner: Client<
        hyper_rustls::HttpsConnector<hyper_util::client::legacy::connect::HttpConnector>,
        Full<Bytes>,
    >,
}

impl HttpClient {
    /// Build a client using the TLS roots selected by the crate features
    pub fn new() -> Result<Self, Error> {
        #[cfg(feature = "webpki-roots")]
        let https = HttpsConnectorBuilder::new().with_webpki_roots();
        #[cfg(not(feature = "webpki-roots"))]
        let https = HttpsConnectorBuilder::new()
            .with_native_roots()
            .map_err(|err| {
                Error::Io("failed to load native TLS root certificates for HTTPS", err)
            })?;

        Ok(Self {
            inner: Client::builder(TokioExecutor::new())
                .build(https.https_or_http().enable_http2().build()),
        })
    }
}

#[async_trait]
impl Transport for HttpClient {
    async fn send(
        &self,
        request: Request<Full<Bytes>>,
        timeout: Duration,
    ) -> Result<Response<Bytes>, Error> {
        let exchange = async {
            let (parts, body) = self
                .inner
                .request(request)
                .await
                .map_err(|err| Error::Other("HTTP request failed", Box::new(err)))?
                .into_parts();

            let body = body
                .collect()
                .await
                .map_err(|err| Error::Http("failed to read HTTP response body", err))?
                .to_bytes();

            Ok(Response::from_parts(parts, body))
        };

        tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| Error::Timeout("HTTP request timed out"))?
    }
}

/// Send `request` through `transport`, giving up after `timeout` even if the transport does not
pub(crate) async fn send(
    transport: &dyn Transport,
    request: Request<Full<Bytes>>,
    timeout: Duration,
) -> Result<Response<Bytes>, Error> {
    tokio::time::timeout(timeout, transport.send(request, timeout))
        .await
        .map_err(|_| Error::Timeout("request timed out"))?
}

/// Send a token request and decode the token, or the OAuth error, from the response
pub(crate) async fn request_token(
    transport: &dyn Transport,
    request: Request<Full<Bytes>>,
    timeout: Duration,
    provider: &'static str,
) -> Result<Token, Error> {
    debug!(url = ?request.uri(), provider, "requesting token");
    let response = send(transport, request, timeout).await?;
    let status = response.status();
    if !status.is_success() {
        warn!(?status, provider, "token request failed");
        return Err(OAuthError::from_response(status, response.body()));
    }

    Token::from_response(response.body(), Utc::now())
}

/// Represents an access token that can be used as a bearer token in HTTP requests
///
/// Tokens should not be cached by the caller, the [`TokenProvider`] handles caching already.
///
/// The token does not implement [`Display`] to avoid accidentally printing the token in log
/// files, likewise [`Debug`] does not expose the token value itself which is only available
/// using the [`Token::as_str`] method.
///
/// [`TokenProvider`]: crate::TokenProvider
/// [`Display`]: fmt::Display
#[derive(Clone)]
pub struct Token {
    access_token: String,
    token_type: String,
    expires_in: Duration,
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl Token {
    /// Create a token that was issued at `issued_at` and is valid for `expires_in`
    ///
    /// An expiry beyond what [`DateTime`] can represent is clamped to [`DateTime::MAX_UTC`].
    pub fn new(
        access_token: String,
        token_type: String,
        expires_in: Duration,
        issued_at: DateTime<Utc>,
    ) -> Self {
        Self {
            access_token,
            token_type,
            expires_in,
            issued_at,
            expires_at: expiry(issued_at, expires_in).unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    pub(crate) fn from_response(body: &[u8], issued_at: DateTime<Utc>) -> Result<Self, Error> {
        let response = serde_json::from_slice::<TokenResponse>(body)
            .map_err(|err| Error::Json("failed to deserialize token from response", err))?;

        let expires_in = Duration::from_secs(response.expires_in);
        Ok(Self {
            access_token: response.access_token,
            token_type: response.token_type,
            expires_in,
            issued_at,
            expires_at: expiry(issued_at, expires_in)
                .ok_or(Error::Str("token expiry out of range"))?,
        })
    }

    /// The instant from which this token must no longer be handed out
    ///
    /// This is the server-side expiry minus `margin`, so that a token is not used while it
    /// expires during a slow request.
    pub fn stale_at(&self, margin: Duration) -> DateTime<Utc> {
        TimeDelta::from_std(margin)
            .ok()
            .and_then(|margin| self.expires_at.checked_sub_signed(margin))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Whether the token is stale at `now`, given a safety `margin`
    pub fn is_stale_at(&self, margin: Duration, now: DateTime<Utc>) -> bool {
        now >= self.stale_at(margin)
    }

    /// Whether the server-side expiry has passed
    pub fn has_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }

    /// Get str representation of the token.
    pub fn as_str(&self) -> &str {
        &self.access_token
    }

    /// The token type reported by the server, usually `Bearer`
    pub fn token_type(&self) -> &str {
        &self.token_type
    }

    /// Lifetime of the token as issued
    pub fn expires_in(&self) -> Duration {
        self.expires_in
    }

    /// When the token was received
    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    /// Server-side expiry of the token
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }
}

fn expiry(issued_at: DateTime<Utc>, expires_in: Duration) -> Option<DateTime<Utc>> {
    let expires_in = TimeDelta::try_seconds(i64::try_from(expires_in.as_secs()).ok()?)?;
    issued_at.checked_add_signed(expires_in)
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("access_token", &"****")
            .field("token_type", &self.token_type)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Token data as returned by the server
#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "bearer")]
    token_type: String,
    expires_in: u64,
}

fn bearer() -> String {
    "Bearer".to_owned()
}

/// Error body returned by OAuth 2.0 token endpoints
///
/// See <https://datatracker.ietf.org/doc/html/rfc6749#section-5.2>.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct OAuthError {
    /// Error code, such as `invalid_grant`
    pub error: String,
    /// Human-readable description
    #[serde(default)]
    pub error_description: Option<String>,
    /// Page with more information about the error
    #[serde(default)]
    pub error_uri: Option<String>,
}

impl OAuthError {
    pub(crate) fn from_response(status: StatusCode, body: &[u8]) -> Error {
        match serde_json::from_slice::<OAuthError>(body) {
            Ok(error) => Error::OAuth { status, error },
            Err(_) => Error::Server(status, String::from_utf8_lossy(body).into_owned()),
        }
    }
}

impl fmt::Display for OAuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.error)?;
        if let Some(description) = &self.error_description {
            write!(f, ": {description}")?;
        }
        if let Some(uri) = &self.error_uri {
            write!(f, " ({uri})")?;
        }
        Ok(())
    }
}

/// An RSA PKCS1 SHA256 signer
pub struct Signer {
    key: Arc<RsaKeyPair>,
    rng: SystemRandom,
}

impl Signer {
    /// Parse a PEM-encoded RSA private key in PKCS#8 or PKCS#1 form
    pub fn new(pem: &str) -> Result<Self, Error> {
        let key = PrivateKeyDer::from_pem_slice(pem.as_bytes())
            .map_err(|_| Error::Str("no private key found in credentials private key data"))?;

        let key = match &key {
            PrivateKeyDer::Pkcs8(der) => RsaKeyPair::from_pkcs8(der.secret_pkcs8_der()),
            PrivateKeyDer::Pkcs1(der) => RsaKeyPair::from_der(der.secret_pkcs1_der()),
            _ => return Err(Error::Str("credentials private key is not an RSA key")),
        }
        .map_err(|_| Error::Str("invalid private key in credentials"))?;

        Ok(Signer {
            key: Arc::new(key),
            rng: SystemRandom::new(),
        })
    }

    /// Sign the input message and return the signature
    pub fn sign(&self, input: &[u8]) -> Result<Vec<u8>, Error> {
        let mut signature = vec![0; self.key.public().modulus_len()];
        self.key
            .sign(&RSA_PKCS1_SHA256, &self.rng, input, &mut signature)
            .map_err(|_| Error::Str("failed to sign with credentials key"))?;
        Ok(signature)
    }
}

impl fmt::Debug for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signer").finish()
    }
}
