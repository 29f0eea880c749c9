use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::resolver::ResolvedCredentials;
use crate::Error;

/// Google's OAuth 2.0 token endpoint
pub const DEFAULT_TOKEN_ENDPOINT: &str = "https://oauth2.googleapis.com/token";
/// Base URL of the GCE metadata server
pub const DEFAULT_METADATA_BASE: &str = "http://metadata.google.internal";

/// Safety margin for tokens obtained with a gcloud refresh token
pub const AUTHORIZED_USER_MARGIN: Duration = Duration::from_secs(300);
/// Safety margin for tokens obtained with a service account JWT assertion
pub const SERVICE_ACCOUNT_MARGIN: Duration = Duration::from_secs(300);
/// Safety margin for tokens obtained from the metadata server
///
/// The metadata server itself caches tokens until shortly before they expire, so a large
/// margin would make every request miss the cache.
pub const METADATA_MARGIN: Duration = Duration::from_secs(30);

/// Timeout for a single metadata server probe
pub const PROBE_TIMEOUT: Duration = Duration::from_millis(500);
/// How many times to probe the metadata server before giving up
pub const PROBE_ATTEMPTS: u8 = 5;
/// Timeout for token exchanges and API calls
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) const USER_CREDENTIALS_PATH: &str =
    ".config/gcloud/application_default_credentials.json";

/// Library-wide settings passed to the resolver and token providers
#[derive(Clone, Debug)]
pub struct Config {
    /// Token endpoint used for the refresh token grant
    pub token_endpoint: String,
    /// Metadata server used when `GCE_METADATA_HOST` is not set
    pub metadata_base: String,
    /// Per-provider token safety margins
    pub margins: Margins,
    /// Timeout for token exchanges and API calls
    pub request_timeout: Duration,
    /// Timeout for each metadata server probe
    pub probe_timeout: Duration,
    /// Number of metadata server probes
    pub probe_attempts: u8,
    /// Fallback project ID, lowest priority in [`resolve_project_id`]
    pub project_id: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            token_endpoint: DEFAULT_TOKEN_ENDPOINT.to_owned(),
            metadata_base: DEFAULT_METADATA_BASE.to_owned(),
            margins: Margins::default(),
            request_timeout: REQUEST_TIMEOUT,
            probe_timeout: PROBE_TIMEOUT,
            probe_attempts: PROBE_ATTEMPTS,
            project_id: None,
        }
    }
}

impl Config {
    /// Defaults, with the metadata server taken from `GCE_METADATA_HOST` when set
    pub fn from_environment(env: &Environment) -> Self {
        let mut config = Self::default();
        if let Some(base) = env.metadata_base() {
            config.metadata_base = base;
        }
        config
    }
}

/// How long before its expiry a token is considered stale, per provider type
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Margins {
    /// See [`AUTHORIZED_USER_MARGIN`]
    pub authorized_user: Duration,
    /// See [`SERVICE_ACCOUNT_MARGIN`]
    pub service_account: Duration,
    /// See [`METADATA_MARGIN`]
    pub metadata: Duration,
}

impl Default for Margins {
    fn default() -> Self {
        Self {
            authorized_user: AUTHORIZED_USER_MARGIN,
            service_account: SERVICE_ACCOUNT_MARGIN,
            metadata: METADATA_MARGIN,
        }
    }
}

/// Settings specific to one service client
#[derive(Clone, Debug, Default)]
pub struct ServiceConfig {
    /// Project configured for this service
    pub project_id: Option<String>,
}

/// The environment variables consulted during credential resolution
///
/// [`Environment::from_process`] takes a snapshot once; the resolver and project ID logic only
/// ever look at the snapshot.
#[derive(Clone, Debug, Default)]
pub struct Environment {
    /// `GOOGLE_APPLICATION_CREDENTIALS`
    pub application_credentials: Option<PathBuf>,
    /// `PROJECT_ID`
    pub project_id: Option<String>,
    /// `GOOGLE_PROJECT_ID`
    pub google_project_id: Option<String>,
    /// `NO_GCE_CHECK`
    pub no_gce_check: Option<String>,
    /// `GCE_METADATA_HOST`
    pub gce_metadata_host: Option<String>,
    /// The user's home directory
    pub home_dir: Option<PathBuf>,
}

impl Environment {
    /// Read the current process environment
    pub fn from_process() -> Self {
        Self {
            application_credentials: env::var_os("GOOGLE_APPLICATION_CREDENTIALS")
                .filter(|path| !path.is_empty())
                .map(PathBuf::from),
            project_id: var("PROJECT_ID"),
            google_project_id: var("GOOGLE_PROJECT_ID"),
            no_gce_check: env::var("NO_GCE_CHECK").ok(),
            gce_metadata_host: var("GCE_METADATA_HOST"),
            home_dir: home::home_dir(),
        }
    }

    /// Whether `NO_GCE_CHECK` forbids probing the metadata server
    pub(crate) fn gce_check_disabled(&self) -> bool {
        self.no_gce_check
            .as_deref()
            .is_some_and(|value| !value.eq_ignore_ascii_case("false"))
    }

    /// Metadata server base URL from `GCE_METADATA_HOST`, if set
    pub(crate) fn metadata_base(&self) -> Option<String> {
        let host = self.gce_metadata_host.as_deref()?.trim_end_matches('/');
        if host.starts_with("http://") || host.starts_with("https://") {
            Some(host.to_owned())
        } else {
            Some(format!("http://{host}"))
        }
    }

    pub(crate) fn default_credentials_path(&self) -> Option<PathBuf> {
        self.home_dir
            .as_ref()
            .map(|home| home.join(USER_CREDENTIALS_PATH))
    }

    fn project_override(&self) -> Option<&str> {
        self.project_id
            .as_deref()
            .or(self.google_project_id.as_deref())
    }
}

fn var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.is_empty())
}

/// Determine the project a service client works against
///
/// In order of priority: `PROJECT_ID`, `GOOGLE_PROJECT_ID`, the project embedded in a service
/// account key, the service configuration, the general configuration.
///
/// Compute engine credentials return `Ok(None)` when nothing is configured, leaving the
/// project to be looked up from the metadata server. Other credentials fail with
/// [`Error::ProjectIdMissing`].
pub fn resolve_project_id(
    env: &Environment,
    credentials: &ResolvedCredentials,
    service: &ServiceConfig,
    config: &Config,
) -> Result<Option<Arc<str>>, Error> {
    let embedded = match credentials {
        ResolvedCredentials::ServiceAccount(credentials) => credentials.project_id.as_deref(),
        _ => None,
    };

    let project = env
        .project_override()
        .or(embedded)
        .or(service.project_id.as_deref())
        .or(config.project_id.as_deref());

    match (project, credentials) {
        (Some(project), _) => {
            debug!(project, "resolved project ID");
            Ok(Some(Arc::from(project)))
        }
        (None, ResolvedCredentials::ComputeEngine { .. }) => Ok(None),
        (None, _) => Err(Error::ProjectIdMissing),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{Credential, CredentialType};
    use crate::testing::{service_account_json, AUTHORIZED_USER_JSON};

    fn service_account(project_id: Option<&str>) -> ResolvedCredentials {
        Credential::from_json(&service_account_json(project_id), CredentialType::ServiceAccount)
            .unwrap()
            .into()
    }

    #[test]
    fn env_project_wins_over_credentials() {
        let env = Environment {
            project_id: Some("envproj".into()),
            ..Environment::default()
        };

        let project = resolve_project_id(
            &env,
            &service_account(Some("credproj")),
            &ServiceConfig::default(),
            &Config::default(),
        )
        .unwrap();
        assert_eq!(project.as_deref(), Some("envproj"));
    }

    #[test]
    fn project_id_env_wins_over_google_project_id() {
        let env = Environment {
            project_id: Some("first".into()),
            google_project_id: Some("second".into()),
            ..Environment::default()
        };

        let project = resolve_project_id(
            &env,
            &service_account(None),
            &ServiceConfig::default(),
            &Config::default(),
        )
        .unwrap();
        assert_eq!(project.as_deref(), Some("first"));
    }

    #[test]
    fn configured_projects_in_order() {
        let service = ServiceConfig {
            project_id: Some("service".into()),
        };
        let config = Config {
            project_id: Some("general".into()),
            ..Config::default()
        };
        let env = Environment::default();

        let project = resolve_project_id(&env, &service_account(Some("cred")), &service, &config);
        assert_eq!(project.unwrap().as_deref(), Some("cred"));

        let project = resolve_project_id(&env, &service_account(None), &service, &config);
        assert_eq!(project.unwrap().as_deref(), Some("service"));

        let service = ServiceConfig::default();
        let project = resolve_project_id(&env, &service_account(None), &service, &config);
        assert_eq!(project.unwrap().as_deref(), Some("general"));
    }

    #[test]
    fn missing_project() {
        let gcloud = Credential::from_json(AUTHORIZED_USER_JSON, CredentialType::GCloud)
            .unwrap()
            .into();
        let err = resolve_project_id(
            &Environment::default(),
            &gcloud,
            &ServiceConfig::default(),
            &Config::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::ProjectIdMissing));

        let compute = ResolvedCredentials::ComputeEngine {
            metadata_base: DEFAULT_METADATA_BASE.into(),
        };
        let project = resolve_project_id(
            &Environment::default(),
            &compute,
            &ServiceConfig::default(),
            &Config::default(),
        );
        assert_eq!(project.unwrap(), None);
    }

    #[test]
    fn no_gce_check_values() {
        let mut env = Environment::default();
        assert!(!env.gce_check_disabled());

        env.no_gce_check = Some("FALSE".into());
        assert!(!env.gce_check_disabled());

        env.no_gce_check = Some("true".into());
        assert!(env.gce_check_disabled());

        env.no_gce_check = Some("1".into());
        assert!(env.gce_check_disabled());
    }

    #[test]
    fn config_from_environment() {
        let env = Environment {
            gce_metadata_host: Some("127.0.0.1:9000".into()),
            ..Environment::default()
        };
        assert_eq!(Config::from_environment(&env).metadata_base, "http://127.0.0.1:9000");
        assert_eq!(
            Config::from_environment(&Environment::default()).metadata_base,
            DEFAULT_METADATA_BASE
        );
    }

    #[test]
    fn metadata_host_gets_scheme() {
        let mut env = Environment::default();
        assert_eq!(env.metadata_base(), None);

        env.gce_metadata_host = Some("169.254.169.254".into());
        assert_eq!(env.metadata_base().as_deref(), Some("http://169.254.169.254"));

        env.gce_metadata_host = Some("http://localhost:8080/".into());
        assert_eq!(env.metadata_base().as_deref(), Some("http://localhost:8080"));
    }
}
