//! ID token verification against a provider's JWKS.
//!
//! [`JwksCache`] fetches and caches the provider's JSON Web Key Set and
//! refreshes it when a token names an unknown `kid` (key rotation).
//! [`IdTokenVerifier`] validates signature, issuer, audience and expiry.

use std::sync::Arc;
use std::time::Duration;

use jsonwebtoken::jwk::{Jwk, JwkSet, KeyAlgorithm, PublicKeyUse};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::time::Instant;
use url::Url;

use super::error::IdpError;

/// Errors that can occur during JWKS operations.
#[derive(Debug, thiserror::Error)]
pub enum JwksError {
    /// A network error occurred while fetching the JWKS.
    #[error("Network error: {0}")]
    Network(String),

    /// The HTTP request returned a non-success status code.
    #[error("HTTP error: status {0}")]
    Http(u16),

    /// The JWKS response could not be parsed as JSON.
    #[error("Failed to parse JWKS: {0}")]
    Parse(String),

    /// The requested key was not found in the JWKS.
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    /// No signing keys were found in the JWKS.
    #[error("No signing keys found in JWKS")]
    NoSigningKeys,

    /// The JWKS URI scheme is not allowed (must be HTTPS in production).
    #[error("Invalid URL scheme: only HTTPS is allowed")]
    InvalidScheme,
}

struct CachedJwks {
    jwks: JwkSet,
    expires_at: Instant,
}

/// Cache for one provider's JWKS document.
pub struct JwksCache {
    http: reqwest::Client,
    jwks_uri: Url,
    ttl: Duration,
    allow_http: bool,
    cached: RwLock<Option<CachedJwks>>,
}

impl JwksCache {
    #[must_use]
    pub fn new(http: reqwest::Client, jwks_uri: Url, ttl: Duration, allow_http: bool) -> Self {
        Self {
            http,
            jwks_uri,
            ttl,
            allow_http,
            cached: RwLock::new(None),
        }
    }

    /// Returns decoding keys matching `kid`, or every signing key when the
    /// token carries no `kid`.
    ///
    /// A fresh document is fetched when the cache is empty, stale, or does
    /// not contain the requested `kid`.
    ///
    /// # Errors
    ///
    /// Returns an error if the JWKS cannot be fetched or has no usable key.
    pub async fn keys_for(
        &self,
        kid: Option<&str>,
    ) -> Result<Vec<(DecodingKey, Option<Algorithm>)>, JwksError> {
        if let Some(keys) = self.cached_keys(kid).await
            && !keys.is_empty()
        {
            return Ok(keys);
        }

        tracing::debug!(jwks_uri = %self.jwks_uri, kid = ?kid, "JWKS cache miss");
        self.refresh().await?;

        match self.cached_keys(kid).await {
            Some(keys) if !keys.is_empty() => Ok(keys),
            _ => match kid {
                Some(kid) => Err(JwksError::KeyNotFound(kid.to_string())),
                None => Err(JwksError::NoSigningKeys),
            },
        }
    }

    async fn cached_keys(&self, kid: Option<&str>) -> Option<Vec<(DecodingKey, Option<Algorithm>)>> {
        let guard = self.cached.read().await;
        let cached = guard.as_ref()?;
        if Instant::now() >= cached.expires_at {
            return None;
        }

        Some(
            cached
                .jwks
                .keys
                .iter()
                .filter(|k| !matches!(k.common.public_key_use, Some(PublicKeyUse::Encryption)))
                .filter(|k| kid.is_none() || k.common.key_id.as_deref() == kid)
                .filter_map(|jwk| {
                    DecodingKey::from_jwk(jwk)
                        .ok()
                        .map(|dk| (dk, jwk_algorithm(jwk)))
                })
                .collect(),
        )
    }

    /// Fetches the JWKS document and replaces the cached copy.
    ///
    /// # Errors
    ///
    /// Returns an error if the URI scheme is not allowed, the request fails,
    /// or the body is not a JWKS document.
    pub async fn refresh(&self) -> Result<(), JwksError> {
        if self.jwks_uri.scheme() != "https" && !(self.allow_http && self.jwks_uri.scheme() == "http")
        {
            return Err(JwksError::InvalidScheme);
        }

        let response = self
            .http
            .get(self.jwks_uri.as_str())
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| JwksError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(JwksError::Http(response.status().as_u16()));
        }

        let jwks: JwkSet = response
            .json()
            .await
            .map_err(|e| JwksError::Parse(e.to_string()))?;

        tracing::debug!(
            jwks_uri = %self.jwks_uri,
            keys = jwks.keys.len(),
            "cached JWKS"
        );

        *self.cached.write().await = Some(CachedJwks {
            jwks,
            expires_at: Instant::now() + self.ttl,
        });
        Ok(())
    }

    /// Drops the cached document.
    pub async fn clear(&self) {
        *self.cached.write().await = None;
    }

    /// Returns `true` if a non-expired document is cached.
    pub async fn is_cached(&self) -> bool {
        self.cached
            .read()
            .await
            .as_ref()
            .is_some_and(|c| Instant::now() < c.expires_at)
    }
}

fn jwk_algorithm(jwk: &Jwk) -> Option<Algorithm> {
    jwk.common.key_algorithm.as_ref().and_then(|alg| match alg {
        KeyAlgorithm::HS256 => Some(Algorithm::HS256),
        KeyAlgorithm::RS256 => Some(Algorithm::RS256),
        KeyAlgorithm::RS384 => Some(Algorithm::RS384),
        KeyAlgorithm::RS512 => Some(Algorithm::RS512),
        KeyAlgorithm::ES256 => Some(Algorithm::ES256),
        KeyAlgorithm::ES384 => Some(Algorithm::ES384),
        KeyAlgorithm::PS256 => Some(Algorithm::PS256),
        KeyAlgorithm::PS384 => Some(Algorithm::PS384),
        KeyAlgorithm::PS512 => Some(Algorithm::PS512),
        KeyAlgorithm::EdDSA => Some(Algorithm::EdDSA),
        _ => None,
    })
}

/// Standard OIDC ID token claims used to build [`UserInfo`](crate::types::UserInfo).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdTokenClaims {
    pub iss: String,
    pub sub: String,
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_verified: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_username: Option<String>,
}

/// Verifies ID tokens issued by one provider.
pub struct IdTokenVerifier {
    jwks: Arc<JwksCache>,
    client_id: String,
    issuer: Option<String>,
    leeway: Duration,
}

impl IdTokenVerifier {
    /// Creates a verifier. With `issuer = None` the `iss` claim is not
    /// checked (multi-tenant issuers such as Entra ID `common`).
    #[must_use]
    pub fn new(
        jwks: Arc<JwksCache>,
        client_id: impl Into<String>,
        issuer: Option<String>,
        leeway: Duration,
    ) -> Self {
        Self {
            jwks,
            client_id: client_id.into(),
            issuer,
            leeway,
        }
    }

    /// Validates the token and returns its claims.
    ///
    /// # Errors
    ///
    /// Returns an error if no JWKS key verifies the signature or if the
    /// issuer, audience or expiry checks fail.
    pub async fn verify(&self, id_token: &str) -> Result<IdTokenClaims, IdpError> {
        let header = decode_header(id_token)?;
        let keys = self.jwks.keys_for(header.kid.as_deref()).await?;

        let mut last_error = None;
        for (key, key_alg) in keys {
            let alg = key_alg.unwrap_or(header.alg);
            if alg != header.alg {
                continue;
            }

            let mut validation = Validation::new(alg);
            validation.set_audience(&[&self.client_id]);
            if let Some(issuer) = &self.issuer {
                validation.set_issuer(&[issuer.trim_end_matches('/')]);
            }
            validation.leeway = self.leeway.as_secs();

            match decode::<IdTokenClaims>(id_token, &key, &validation) {
                Ok(data) => {
                    tracing::debug!(iss = %data.claims.iss, "validated ID token");
                    return Ok(data.claims);
                }
                Err(e) => last_error = Some(e),
            }
        }

        Err(match last_error {
            Some(e) => IdpError::Jwt(e),
            None => IdpError::IdTokenInvalid(format!(
                "no key in JWKS matches algorithm {:?}",
                header.alg
            )),
        })
    }

    /// The underlying JWKS cache.
    #[must_use]
    pub fn jwks(&self) -> &JwksCache {
        &self.jwks
    }
}
