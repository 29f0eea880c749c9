use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::Request;
use http_body_util::Full;
use serde::{Deserialize, Serialize};
use tracing::{instrument, Level};

use crate::request::ServiceClient;
use crate::Error;

const IAM_CREDENTIALS_BASE: &str = "https://iamcredentials.googleapis.com/v1";

/// Client for the IAM Service Account Credentials API
///
/// Lets a caller holding any credentials with `iam.serviceAccounts.signJwt` permission sign
/// JWTs as a service account whose private key it does not have.
#[derive(Debug)]
pub struct IamCredentials {
    client: ServiceClient,
    base: String,
}

impl IamCredentials {
    /// Call the public endpoint through `client`
    pub fn new(client: ServiceClient) -> Self {
        Self {
            client,
            base: IAM_CREDENTIALS_BASE.to_owned(),
        }
    }

    /// Send requests to `base` instead of the public endpoint
    pub fn with_endpoint(mut self, base: impl Into<String>) -> Self {
        self.base = base.into().trim_end_matches('/').to_owned();
        self
    }

    /// Have Google sign `claims` with a system-managed key of `service_account`
    ///
    /// See <https://cloud.google.com/iam/docs/reference/credentials/rest/v1/projects.serviceAccounts/signJwt>.
    #[instrument(level = Level::DEBUG, skip(self, claims))]
    pub async fn sign_jwt(
        &self,
        service_account: &str,
        claims: &impl Serialize,
    ) -> Result<SignedJwt, Error> {
        let payload = serde_json::to_string(claims)
            .map_err(|err| Error::Json("failed to serialize JWT claims", err))?;
        let body = serde_json::to_vec(&SignJwtRequest { payload: &payload })
            .map_err(|err| Error::Json("failed to serialize signJwt request", err))?;

        let request = Request::post(format!(
            "{}/projects/-/serviceAccounts/{service_account}:signJwt",
            self.base
        ))
        .header(CONTENT_TYPE, "application/json")
        .body(Full::from(Bytes::from(body)))
        .map_err(|err| Error::Other("failed to build signJwt request", Box::new(err)))?;

        self.client.send(request).await
    }
}

#[derive(Serialize)]
struct SignJwtRequest<'a> {
    payload: &'a str,
}

/// A JWT signed by the IAM Service Account Credentials API
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedJwt {
    /// ID of the key used to sign the JWT
    pub key_id: String,
    /// The signed JWT in compact serialization
    pub signed_jwt: String,
}
