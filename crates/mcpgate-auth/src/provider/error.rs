//! Errors raised while talking to an external identity provider.
//!
//! These never reach HTTP clients directly: [`IdpError::into_auth_error`]
//! logs the upstream detail with provider context and returns a generic
//! `server_error` so response bodies from the IdP are not leaked.

use crate::error::AuthError;
use crate::types::ProviderType;

use super::id_token::JwksError;

/// Errors that can occur during IdP calls.
#[derive(Debug, thiserror::Error)]
pub enum IdpError {
    /// A network error occurred.
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// The IdP answered with an OAuth error object.
    #[error("OAuth error from IdP: {error} - {description}")]
    OAuth {
        /// The OAuth error code.
        error: String,
        /// Optional error description.
        description: String,
    },

    /// The IdP answered with an unexpected HTTP status.
    #[error("Unexpected HTTP status {status} from {endpoint}")]
    UnexpectedStatus {
        /// Which endpoint was called (token, userinfo, ...).
        endpoint: &'static str,
        /// HTTP status code.
        status: u16,
    },

    /// The IdP response could not be parsed.
    #[error("Invalid response from {endpoint}: {message}")]
    InvalidResponse {
        endpoint: &'static str,
        message: String,
    },

    /// The ID token failed validation.
    #[error("ID token validation failed: {0}")]
    IdTokenInvalid(String),

    /// JWT decoding or validation error.
    #[error("JWT error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    /// Failed to fetch or use the provider's JWKS.
    #[error("JWKS error: {0}")]
    Jwks(#[from] JwksError),

    /// Failed to parse a URL.
    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),

    /// The provider does not support the operation.
    #[error("Operation not supported: {0}")]
    Unsupported(&'static str),
}

impl IdpError {
    /// Creates an `OAuth` error from an IdP error response.
    #[must_use]
    pub fn oauth_error(error: impl Into<String>, description: impl Into<String>) -> Self {
        Self::OAuth {
            error: error.into(),
            description: description.into(),
        }
    }

    /// Creates an `InvalidResponse` error.
    #[must_use]
    pub fn invalid_response(endpoint: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidResponse {
            endpoint,
            message: message.into(),
        }
    }

    /// Returns `true` if this is a token validation error.
    #[must_use]
    pub fn is_validation_error(&self) -> bool {
        matches!(self, Self::IdTokenInvalid(_) | Self::Jwt(_))
    }

    /// Returns `true` if the IdP could not be reached or misbehaved.
    #[must_use]
    pub fn is_external_error(&self) -> bool {
        matches!(
            self,
            Self::Network(_)
                | Self::OAuth { .. }
                | Self::UnexpectedStatus { .. }
                | Self::InvalidResponse { .. }
                | Self::Jwks(_)
        )
    }

    /// Logs the failure and converts it into a client-safe [`AuthError`].
    #[must_use]
    pub fn into_auth_error(self, provider: &ProviderType, operation: &str) -> AuthError {
        tracing::warn!(
            provider = %provider,
            operation,
            error = %self,
            "identity provider call failed"
        );
        let message = match &self {
            Self::Network(_) => "identity provider is unreachable",
            Self::IdTokenInvalid(_) | Self::Jwt(_) | Self::Jwks(_) => {
                "identity token could not be verified"
            }
            Self::Unsupported(_) => "operation not supported by identity provider",
            _ => "identity provider rejected the request",
        };
        AuthError::identity_provider(provider.as_str(), format!("{operation}: {message}"))
    }
}
