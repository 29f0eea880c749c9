use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::types::Signer;
use crate::Error;

pub(crate) const GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const GOOGLE_RS256_HEAD: &str = r#"{"alg":"RS256","typ":"JWT"}"#;

/// Validity of an assertion; Google rejects anything longer than an hour
pub const JWT_LIFETIME: Duration = Duration::from_secs(3600);

/// Claims of a JWT asserting a service account's identity
///
/// See <https://developers.google.com/identity/protocols/OAuth2ServiceAccount#authorizingrequests>.
///
/// These claims are only ever produced locally for outbound signing, so [`Claims::verify`]
/// checks nothing but the expiry.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Claims<'a> {
    iss: &'a str,
    aud: &'a str,
    exp: i64,
    iat: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    sub: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    scope: Option<String>,
}

impl<'a> Claims<'a> {
    /// Claims issued by `iss` for `aud`, valid for [`JWT_LIFETIME`] from `iat`
    pub fn new(iss: &'a str, aud: &'a str, iat: DateTime<Utc>) -> Self {
        let iat = iat.timestamp();
        Claims {
            iss,
            aud,
            exp: iat + JWT_LIFETIME.as_secs() as i64,
            iat,
            sub: None,
            scope: None,
        }
    }

    /// Request the given scopes, space-separated in the `scope` claim
    pub fn with_scopes(mut self, scopes: &[&str]) -> Self {
        self.scope = (!scopes.is_empty()).then(|| scopes.join(" "));
        self
    }

    /// Act on behalf of `sub`, for domain-wide delegation
    pub fn with_subject(mut self, sub: &'a str) -> Self {
        self.sub = Some(sub);
        self
    }

    /// Issued-at claim, seconds since the epoch
    pub fn issued_at(&self) -> i64 {
        self.iat
    }

    /// Expiry claim, seconds since the epoch
    pub fn expires_at(&self) -> i64 {
        self.exp
    }

    /// Fail with [`Error::TokenExpired`] if the expiry has passed
    pub fn verify(&self) -> Result<(), Error> {
        self.verify_at(Utc::now())
    }

    /// Like [`Claims::verify`], at a given instant
    pub fn verify_at(&self, now: DateTime<Utc>) -> Result<(), Error> {
        if now.timestamp() >= self.exp {
            return Err(Error::TokenExpired);
        }

        Ok(())
    }

    /// Encode and sign the claims as a compact RS256 JWT
    pub fn to_jwt(&self, signer: &Signer) -> Result<String, Error> {
        let claims = serde_json::to_string(self)
            .map_err(|err| Error::Json("failed to serialize JWT claims", err))?;

        let mut jwt = String::new();
        URL_SAFE_NO_PAD.encode_string(GOOGLE_RS256_HEAD, &mut jwt);
        jwt.push('.');
        URL_SAFE_NO_PAD.encode_string(claims, &mut jwt);

        let signature = signer.sign(jwt.as_bytes())?;
        jwt.push('.');
        URL_SAFE_NO_PAD.encode_string(signature, &mut jwt);
        Ok(jwt)
    }
}
