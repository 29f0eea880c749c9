use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, instrument, warn, Level};

use crate::authorized_user::AuthorizedUser;
use crate::config::{Config, Environment};
use crate::credentials::{Credential, CredentialType, GCloudCredentials, ServiceAccountCredentials};
use crate::metadata::{self, MetadataServiceAccount};
use crate::service_account::CustomServiceAccount;
use crate::types::{self, Transport};
use crate::{Error, TokenProvider};

/// How to find the identity a client should authenticate as
#[derive(Debug)]
pub enum CredentialsLoadingStrategy {
    /// Read credentials of the given type from a file
    FilePath(PathBuf, CredentialType),
    /// `GOOGLE_APPLICATION_CREDENTIALS`, then the gcloud default credentials file
    Environment,
    /// Use the metadata server, after checking that it is reachable
    ComputeEngine(Arc<dyn Transport>),
}

/// The identity chosen by [`resolve`]
#[derive(Clone, Debug)]
pub enum ResolvedCredentials {
    /// gcloud user credentials
    GCloud(GCloudCredentials),
    /// A service account key
    ServiceAccount(ServiceAccountCredentials),
    /// The instance identity supplied by the metadata server at `metadata_base`
    ComputeEngine {
        /// Base URL of the metadata server
        metadata_base: String,
    },
}

impl ResolvedCredentials {
    /// Build the token provider matching these credentials
    pub fn into_provider(
        self,
        scopes: &[&str],
        config: &Config,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<dyn TokenProvider>, Error> {
        let provider: Arc<dyn TokenProvider> = match self {
            Self::GCloud(credentials) => {
                debug!("using AuthorizedUser");
                Arc::new(AuthorizedUser::new(credentials, config, transport))
            }
            Self::ServiceAccount(credentials) => {
                debug!("using CustomServiceAccount");
                Arc::new(CustomServiceAccount::new(
                    credentials,
                    scopes,
                    config,
                    transport,
                )?)
            }
            Self::ComputeEngine { metadata_base } => {
                debug!("using MetadataServiceAccount");
                Arc::new(MetadataServiceAccount::new(
                    metadata_base,
                    scopes,
                    config,
                    transport,
                ))
            }
        };
        Ok(provider)
    }
}

impl From<Credential> for ResolvedCredentials {
    fn from(credential: Credential) -> Self {
        match credential {
            Credential::GCloud(credentials) => Self::GCloud(credentials),
            Credential::ServiceAccount(credentials) => Self::ServiceAccount(credentials),
        }
    }
}

/// Decide which identity to use according to `strategy`
#[instrument(level = Level::DEBUG, skip(env, config))]
pub async fn resolve(
    strategy: CredentialsLoadingStrategy,
    env: &Environment,
    config: &Config,
) -> Result<ResolvedCredentials, Error> {
    match strategy {
        CredentialsLoadingStrategy::FilePath(path, kind) => {
            Ok(Credential::from_file(path, kind)?.into())
        }
        CredentialsLoadingStrategy::Environment => Ok(Credential::detect(env)?.into()),
        CredentialsLoadingStrategy::ComputeEngine(transport) => {
            probe_metadata_server(&*transport, env, config).await
        }
    }
}

/// Check that a metadata server answers before committing to compute engine credentials
///
/// Attempts are made back-to-back, each cut off after [`Config::probe_timeout`] whether or not
/// the transport enforces it.
async fn probe_metadata_server(
    transport: &dyn Transport,
    env: &Environment,
    config: &Config,
) -> Result<ResolvedCredentials, Error> {
    if env.gce_check_disabled() {
        debug!("metadata server check disabled by NO_GCE_CHECK");
        return Err(Error::ComputeEngineCheckDisabled);
    }

    let metadata_base = env
        .metadata_base()
        .unwrap_or_else(|| config.metadata_base.clone());

    for attempt in 1..=config.probe_attempts {
        let request = metadata::metadata_request(&metadata_base)?;
        match types::send(transport, request, config.probe_timeout).await {
            Ok(response) if metadata::is_metadata_response(&response) => {
                debug!(attempt, %metadata_base, "found GCP instance metadata server");
                return Ok(ResolvedCredentials::ComputeEngine { metadata_base });
            }
            Ok(response) => warn!(
                attempt,
                status = ?response.status(),
                "response without Metadata-Flavor header, not a metadata server"
            ),
            Err(err) => warn!(attempt, ?err, "metadata server probe failed"),
        }
    }

    Err(Error::ComputeEngineNotAvailable)
}
