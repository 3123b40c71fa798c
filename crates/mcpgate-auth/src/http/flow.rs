//! Per-provider authorization endpoints.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Redirect, Response},
};
use serde::Deserialize;

use super::AuthHttpState;
use super::bearer::bearer_token;
use crate::AuthResult;
use crate::error::AuthError;
use crate::provider::{AuthorizationRequest, CallbackOutcome, CallbackParams, OAuthProvider};

/// Query parameters of `GET /{provider}`.
#[derive(Debug, Default, Deserialize)]
pub struct StartQuery {
    #[serde(default)]
    pub redirect_uri: Option<String>,
    #[serde(default)]
    pub code_challenge: Option<String>,
    #[serde(default)]
    pub code_challenge_method: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    /// Space-separated scopes.
    #[serde(default)]
    pub scope: Option<String>,
}

impl From<StartQuery> for AuthorizationRequest {
    fn from(query: StartQuery) -> Self {
        Self {
            client_redirect_uri: query.redirect_uri.filter(|s| !s.is_empty()),
            code_challenge: query.code_challenge.filter(|s| !s.is_empty()),
            code_challenge_method: query.code_challenge_method,
            client_state: query.state,
            scopes: query
                .scope
                .map(|s| s.split_whitespace().map(str::to_string).collect()),
        }
    }
}

fn lookup(state: &AuthHttpState, name: &str) -> AuthResult<Arc<dyn OAuthProvider>> {
    state
        .registry
        .get_by_name(name)
        .ok_or_else(|| AuthError::provider_not_found(name))
}

/// `GET /{provider}` - starts an authorization with the identity provider.
pub async fn start_handler(
    State(state): State<AuthHttpState>,
    Path(name): Path<String>,
    Query(query): Query<StartQuery>,
) -> Result<Redirect, AuthError> {
    let provider = lookup(&state, &name)?;
    let redirect = provider.handle_authorization_request(query.into()).await?;
    Ok(Redirect::to(redirect.url.as_str()))
}

/// `GET /{provider}/callback` - completes the authorization.
///
/// Direct flows answer with the token response; pass-through flows send
/// the user agent back to the client with the authorization code.
pub async fn callback_handler(
    State(state): State<AuthHttpState>,
    Path(name): Path<String>,
    Query(params): Query<CallbackParams>,
) -> Result<Response, AuthError> {
    let provider = lookup(&state, &name)?;
    match provider.handle_authorization_callback(params).await? {
        CallbackOutcome::Tokens(record) => Ok((
            [(header::CACHE_CONTROL, "no-store")],
            Json(record.to_response()),
        )
            .into_response()),
        CallbackOutcome::Redirect(url) => Ok(Redirect::to(url.as_str()).into_response()),
    }
}

/// `POST /{provider}/logout` - revokes the bearer token, if any.
pub async fn logout_handler(
    State(state): State<AuthHttpState>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, AuthError> {
    let provider = lookup(&state, &name)?;
    provider.handle_logout(bearer_token(&headers)).await?;
    Ok(StatusCode::NO_CONTENT)
}
