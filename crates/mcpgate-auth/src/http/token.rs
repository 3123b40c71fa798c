//! Universal token endpoint and RFC 7009 revocation.
//!
//! Neither endpoint is bound to a provider: the grant or token is routed to
//! the provider whose store namespace holds it, in registration order.
//!
//! # Request Format
//!
//! ```text
//! POST /auth/token
//! Content-Type: application/x-www-form-urlencoded
//!
//! grant_type=authorization_code&code=...&code_verifier=...
//! grant_type=refresh_token&refresh_token=...
//! ```

use axum::{
    Form, Json,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Deserialize;

use super::AuthHttpState;
use crate::error::AuthError;
use crate::provider::CodeExchangeRequest;

/// Form parameters of the token endpoint.
///
/// `client_id` and `redirect_uri` are accepted and ignored: public clients
/// are bound to their grant by PKCE alone.
#[derive(Debug, Default, Deserialize)]
pub struct TokenForm {
    #[serde(default)]
    pub grant_type: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub code_verifier: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

fn required(value: Option<String>, name: &str) -> Result<String, AuthError> {
    value
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AuthError::invalid_request(format!("missing '{name}' parameter")))
}

/// `POST /token`.
///
/// Parameters are validated before any store or IdP call.
pub async fn token_handler(
    State(state): State<AuthHttpState>,
    Form(form): Form<TokenForm>,
) -> Result<Response, AuthError> {
    let grant_type = required(form.grant_type, "grant_type")?;

    let record = match grant_type.as_str() {
        "authorization_code" => {
            let code = required(form.code, "code")?;
            state
                .registry
                .exchange_code(CodeExchangeRequest {
                    code,
                    code_verifier: form.code_verifier.filter(|v| !v.is_empty()),
                })
                .await?
        }
        "refresh_token" => {
            let refresh_token = required(form.refresh_token, "refresh_token")?;
            state.registry.refresh_token(&refresh_token).await?
        }
        other => return Err(AuthError::unsupported_grant_type(other)),
    };

    tracing::debug!(grant_type = %grant_type, provider = %record.provider_type, "token issued");
    Ok((
        [
            (header::CACHE_CONTROL, "no-store"),
            (header::PRAGMA, "no-cache"),
        ],
        Json(record.to_response()),
    )
        .into_response())
}

/// Form parameters of the revocation endpoint.
#[derive(Debug, Default, Deserialize)]
pub struct RevocationForm {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub token_type_hint: Option<String>,
}

/// `POST /revoke`.
///
/// Answers 200 for any well-formed request, whether or not the token was
/// known (RFC 7009 section 2.2). A store or IdP failure is reported as such
/// (section 2.2.1) so the client does not assume the token is dead.
pub async fn revoke_handler(
    State(state): State<AuthHttpState>,
    Form(form): Form<RevocationForm>,
) -> Result<StatusCode, AuthError> {
    let token = required(form.token, "token")?;
    let hint = form.token_type_hint.as_deref().unwrap_or("none");

    match state.registry.revoke_token(&token).await {
        Ok(()) => Ok(StatusCode::OK),
        Err(e) if e.is_server_error() => {
            tracing::warn!(error = %e, hint, "token revocation failed");
            Err(e)
        }
        Err(e) => {
            tracing::debug!(error = %e, hint, "token revocation ignored");
            Ok(StatusCode::OK)
        }
    }
}
