use std::path::Path;
use std::sync::Arc;
use std::{fmt, fs, io};

use serde::Deserialize;
use serde_json::error::Category;
use tracing::debug;

use crate::config::{Environment, DEFAULT_TOKEN_ENDPOINT};
use crate::Error;

/// Which credential schema to decode a file with
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CredentialType {
    /// `gcloud auth application-default login` user credentials
    GCloud,
    /// A service account JSON key
    ServiceAccount,
}

/// Credential material decoded from a JSON file
#[derive(Clone, Debug)]
pub enum Credential {
    /// Authorized user credentials holding a refresh token
    GCloud(GCloudCredentials),
    /// A service account key
    ServiceAccount(ServiceAccountCredentials),
}

impl Credential {
    /// Read credentials of the given type from a JSON file
    pub fn from_file(path: impl AsRef<Path>, kind: CredentialType) -> Result<Self, Error> {
        let path = path.as_ref();
        let text = read(path)?;
        decode(&text, kind).map_err(|err| Error::FileLoad(path.into(), FileLoadError::Decode(err)))
    }

    /// Decode credentials of the given type from a JSON string
    pub fn from_json(s: &str, kind: CredentialType) -> Result<Self, Error> {
        decode(s, kind).map_err(|err| Error::Json("failed to deserialize credentials", err))
    }

    /// Find and decode application default credentials
    ///
    /// Reads the file named by `GOOGLE_APPLICATION_CREDENTIALS`, falling back to the
    /// gcloud default credentials file in the home directory. The file is decoded as gcloud
    /// user credentials first; only if that fails because a field is missing is it decoded as
    /// a service account key.
    pub fn detect(env: &Environment) -> Result<Self, Error> {
        let path = match &env.application_credentials {
            Some(path) => {
                debug!(
                    ?path,
                    "reading credentials file from GOOGLE_APPLICATION_CREDENTIALS env var"
                );
                path.clone()
            }
            None => {
                let path = env
                    .default_credentials_path()
                    .ok_or(Error::Str("home directory not found"))?;
                debug!(?path, "reading default credentials file");
                path
            }
        };

        let text = read(&path)?;
        let credential = match decode(&text, CredentialType::GCloud) {
            Ok(credential) => credential,
            Err(err) if is_missing_field(&err) => {
                debug!(%err, "not user credentials, trying service account key");
                decode(&text, CredentialType::ServiceAccount)
                    .map_err(|err| Error::FileLoad(path.clone(), FileLoadError::Decode(err)))?
            }
            Err(err) => return Err(Error::FileLoad(path, FileLoadError::Decode(err))),
        };

        Ok(credential)
    }
}

fn read(path: &Path) -> Result<String, Error> {
    fs::read_to_string(path).map_err(|err| Error::FileLoad(path.into(), FileLoadError::Read(err)))
}

fn decode(s: &str, kind: CredentialType) -> Result<Credential, serde_json::Error> {
    Ok(match kind {
        CredentialType::GCloud => Credential::GCloud(serde_json::from_str(s)?),
        CredentialType::ServiceAccount => Credential::ServiceAccount(serde_json::from_str(s)?),
    })
}

// serde_json has no dedicated category for absent fields; its derive error message is the
// only signal. `missing_field_falls_through_to_service_account` pins the wording.
fn is_missing_field(err: &serde_json::Error) -> bool {
    err.classify() == Category::Data && err.to_string().starts_with("missing field")
}

/// Why a credentials file could not be loaded
#[derive(Debug, thiserror::Error)]
pub enum FileLoadError {
    /// The file could not be read as UTF-8 text
    #[error("failed to read credentials file")]
    Read(#[source] io::Error),
    /// The file contents do not match the expected schema
    #[error("failed to decode credentials file")]
    Decode(#[source] serde_json::Error),
}

/// User credentials written by `gcloud auth application-default login`
#[derive(Clone, Deserialize)]
pub struct GCloudCredentials {
    /// Client id
    pub client_id: String,
    /// Client secret
    pub client_secret: String,
    /// Project billed for API usage
    #[serde(default)]
    pub quota_project_id: Option<Arc<str>>,
    /// Refresh Token
    pub refresh_token: String,
    /// Type, `authorized_user`
    #[serde(rename = "type", default = "authorized_user")]
    pub kind: String,
}

impl fmt::Debug for GCloudCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GCloudCredentials")
            .field("client_id", &self.client_id)
            .field("quota_project_id", &self.quota_project_id)
            .finish_non_exhaustive()
    }
}

/// A service account JSON key
#[derive(Clone, Deserialize)]
pub struct ServiceAccountCredentials {
    /// Type, `service_account`
    #[serde(rename = "type", default = "service_account")]
    pub kind: String,
    /// Project owning the service account
    #[serde(default)]
    pub project_id: Option<Arc<str>>,
    /// Identifier of the key
    #[serde(default)]
    pub private_key_id: Option<String>,
    /// PEM-encoded RSA private key
    pub private_key: String,
    /// Service account email, used as JWT issuer
    pub client_email: String,
    /// Client id
    #[serde(default)]
    pub client_id: Option<String>,
    /// OAuth authorization endpoint
    #[serde(default)]
    pub auth_uri: Option<String>,
    /// Endpoint the JWT assertion is exchanged at
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
    /// Google's certificate URL
    #[serde(default)]
    pub auth_provider_x509_cert_url: Option<String>,
    /// Certificate URL of this service account
    #[serde(default)]
    pub client_x509_cert_url: Option<String>,
}

impl fmt::Debug for ServiceAccountCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceAccountCredentials")
            .field("client_email", &self.client_email)
            .field("project_id", &self.project_id)
            .field("token_uri", &self.token_uri)
            .finish_non_exhaustive()
    }
}

fn authorized_user() -> String {
    "authorized_user".to_owned()
}

fn service_account() -> String {
    "service_account".to_owned()
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_ENDPOINT.to_owned()
}

impl From<GCloudCredentials> for Credential {
    fn from(credentials: GCloudCredentials) -> Self {
        Self::GCloud(credentials)
    }
}

impl From<ServiceAccountCredentials> for Credential {
    fn from(credentials: ServiceAccountCredentials) -> Self {
        Self::ServiceAccount(credentials)
    }
}
