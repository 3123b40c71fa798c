//! PKCE (Proof Key for Code Exchange, RFC 7636), S256 only.
//!
//! Providers either generate a verifier/challenge pair themselves or accept
//! a client-supplied challenge (pass-through flow). In both cases the
//! identity provider is always asked for `code_challenge_method=S256`.
//!
//! ```
//! use mcpgate_auth::pkce::{PkceChallenge, PkceVerifier};
//!
//! let verifier = PkceVerifier::generate();
//! let challenge = PkceChallenge::from_verifier(&verifier);
//! assert!(challenge.verify(&verifier).is_ok());
//! ```

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use sha2::{Digest, Sha256};

use crate::error::AuthError;

/// Errors that can occur during PKCE operations.
#[derive(Debug, thiserror::Error)]
pub enum PkceError {
    /// Verifier length is outside the valid range (43-128 characters).
    #[error("Invalid verifier length: must be 43-128 characters, got {0}")]
    InvalidVerifierLength(usize),

    /// Verifier contains invalid characters.
    #[error("Invalid verifier characters: must be URL-safe ([A-Za-z0-9-._~])")]
    InvalidVerifierCharacters,

    /// Challenge is not valid base64url.
    #[error("Invalid challenge format: must be valid base64url")]
    InvalidChallengeFormat,

    /// Unsupported challenge method (only S256 is supported).
    #[error("Unsupported challenge method: {0}. Only S256 is supported.")]
    UnsupportedMethod(String),

    /// The verifier does not match the challenge.
    #[error("PKCE verification failed: verifier does not match challenge")]
    VerificationFailed,
}

impl PkceError {
    /// Returns `true` if this is a verifier validation error.
    #[must_use]
    pub fn is_verifier_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidVerifierLength(_) | Self::InvalidVerifierCharacters
        )
    }

    /// Returns `true` if this is a challenge validation error.
    #[must_use]
    pub fn is_challenge_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidChallengeFormat | Self::UnsupportedMethod(_)
        )
    }

    /// Get the OAuth 2.0 error code for this error.
    #[must_use]
    pub fn oauth_error_code(&self) -> &'static str {
        match self {
            Self::VerificationFailed => "invalid_grant",
            _ => "invalid_request",
        }
    }
}

impl From<PkceError> for AuthError {
    fn from(err: PkceError) -> Self {
        match err {
            PkceError::VerificationFailed => AuthError::PkceVerificationFailed,
            other => AuthError::invalid_request(other.to_string()),
        }
    }
}

/// PKCE challenge method. Only S256 is accepted; `plain` is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PkceChallengeMethod {
    /// SHA-256 hash.
    #[default]
    S256,
}

impl PkceChallengeMethod {
    /// Parse challenge method from string.
    ///
    /// # Errors
    ///
    /// Returns `PkceError::UnsupportedMethod` for anything other than `S256`.
    pub fn parse(method: &str) -> Result<Self, PkceError> {
        match method {
            "S256" => Ok(Self::S256),
            "plain" => Err(PkceError::UnsupportedMethod(
                "plain (forbidden by OAuth 2.1)".to_string(),
            )),
            other => Err(PkceError::UnsupportedMethod(other.to_string())),
        }
    }

    /// Get the method as a string.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::S256 => "S256",
        }
    }
}

impl std::fmt::Display for PkceChallengeMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// PKCE code verifier: 43-128 unreserved characters.
#[derive(Debug, Clone)]
pub struct PkceVerifier(String);

impl PkceVerifier {
    /// Create a verifier from a client-supplied string.
    ///
    /// # Errors
    ///
    /// Returns an error if the length is not 43-128 or if it contains
    /// characters outside `[A-Za-z0-9-._~]`.
    pub fn new(verifier: impl Into<String>) -> Result<Self, PkceError> {
        let verifier = verifier.into();
        let len = verifier.len();

        if !(43..=128).contains(&len) {
            return Err(PkceError::InvalidVerifierLength(len));
        }

        if !verifier
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_' || c == '~')
        {
            return Err(PkceError::InvalidVerifierCharacters);
        }

        Ok(Self(verifier))
    }

    /// Generate a random verifier (32 random bytes, base64url, 43 characters).
    #[must_use]
    pub fn generate() -> Self {
        Self(crate::types::random_token())
    }

    /// Get the verifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume the verifier and return the inner string.
    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

/// PKCE code challenge: `BASE64URL(SHA256(ASCII(code_verifier)))`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PkceChallenge(String);

impl PkceChallenge {
    /// Derive the S256 challenge for a verifier.
    #[must_use]
    pub fn from_verifier(verifier: &PkceVerifier) -> Self {
        let hash = Sha256::digest(verifier.0.as_bytes());
        Self(URL_SAFE_NO_PAD.encode(hash))
    }

    /// Wrap a challenge received from a client.
    ///
    /// # Errors
    ///
    /// Returns `PkceError::InvalidChallengeFormat` if the string is not
    /// valid base64url.
    pub fn new(challenge: impl Into<String>) -> Result<Self, PkceError> {
        let challenge = challenge.into();
        if challenge.is_empty() || URL_SAFE_NO_PAD.decode(&challenge).is_err() {
            return Err(PkceError::InvalidChallengeFormat);
        }
        Ok(Self(challenge))
    }

    /// Verify that a verifier matches this challenge.
    ///
    /// # Errors
    ///
    /// Returns `PkceError::VerificationFailed` on mismatch.
    pub fn verify(&self, verifier: &PkceVerifier) -> Result<(), PkceError> {
        if Self::from_verifier(verifier).0 == self.0 {
            Ok(())
        } else {
            Err(PkceError::VerificationFailed)
        }
    }

    /// Get the challenge as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume the challenge and return the inner string.
    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verifier_generation() {
        let verifier = PkceVerifier::generate();
        assert_eq!(verifier.as_str().len(), 43);
        assert!(PkceVerifier::new(verifier.as_str()).is_ok());
        assert_ne!(
            PkceVerifier::generate().as_str(),
            PkceVerifier::generate().as_str()
        );
    }

    #[test]
    fn test_verifier_length_bounds() {
        assert!(matches!(
            PkceVerifier::new("a".repeat(42)),
            Err(PkceError::InvalidVerifierLength(42))
        ));
        assert!(PkceVerifier::new("a".repeat(43)).is_ok());
        assert!(PkceVerifier::new("a".repeat(128)).is_ok());
        assert!(matches!(
            PkceVerifier::new("a".repeat(129)),
            Err(PkceError::InvalidVerifierLength(129))
        ));
    }

    #[test]
    fn test_verifier_invalid_characters() {
        let invalid = format!("{}!@#", "a".repeat(44));
        assert!(matches!(
            PkceVerifier::new(invalid),
            Err(PkceError::InvalidVerifierCharacters)
        ));
    }

    #[test]
    fn test_challenge_verification() {
        let verifier = PkceVerifier::generate();
        let other = PkceVerifier::generate();
        let challenge = PkceChallenge::from_verifier(&verifier);

        assert_eq!(challenge.as_str().len(), 43);
        assert!(challenge.verify(&verifier).is_ok());
        assert!(matches!(
            challenge.verify(&other),
            Err(PkceError::VerificationFailed)
        ));
    }

    #[test]
    fn test_challenge_new_rejects_garbage() {
        assert!(PkceChallenge::new("E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM").is_ok());
        assert!(matches!(
            PkceChallenge::new("not valid base64url!!!"),
            Err(PkceError::InvalidChallengeFormat)
        ));
        assert!(PkceChallenge::new("").is_err());
    }

    #[test]
    fn test_challenge_method_parse() {
        assert_eq!(
            PkceChallengeMethod::parse("S256").unwrap(),
            PkceChallengeMethod::S256
        );
        let err = PkceChallengeMethod::parse("plain").unwrap_err();
        assert!(err.is_challenge_error());
        assert!(err.to_string().contains("plain"));
        assert!(PkceChallengeMethod::parse("S512").is_err());
    }

    #[test]
    fn test_rfc7636_appendix_b_test_vector() {
        let verifier = PkceVerifier::new("dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk").unwrap();
        let challenge = PkceChallenge::from_verifier(&verifier);
        assert_eq!(
            challenge.as_str(),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
    }

    #[test]
    fn test_into_auth_error() {
        let err: AuthError = PkceError::VerificationFailed.into();
        assert!(matches!(err, AuthError::PkceVerificationFailed));

        let err: AuthError = PkceError::InvalidChallengeFormat.into();
        assert_eq!(err.oauth_error_code(), "invalid_request");
    }
}
