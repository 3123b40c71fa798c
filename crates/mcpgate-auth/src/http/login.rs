//! Provider picker and the generic authorize redirect.

use axum::{
    Json,
    extract::{RawQuery, State},
    http::{HeaderMap, header},
    response::{Html, IntoResponse, Redirect, Response},
};
use serde::Serialize;

use super::AuthHttpState;
use crate::error::AuthError;

#[derive(Debug, Serialize)]
struct ProviderLink {
    #[serde(rename = "type")]
    provider_type: String,
    name: String,
    url: String,
}

#[derive(Debug, Serialize)]
struct LoginPage {
    providers: Vec<ProviderLink>,
}

fn with_query(path: String, query: Option<&str>) -> String {
    match query {
        Some(q) if !q.is_empty() => format!("{path}?{q}"),
        _ => path,
    }
}

fn wants_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|accept| accept.contains("application/json"))
}

fn escape_html(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// `GET /login` - lists the registered providers.
///
/// The incoming query string is forwarded to each provider link so a
/// client's `redirect_uri`, `code_challenge` and `state` survive the hop.
pub async fn login_handler(
    State(state): State<AuthHttpState>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Response {
    let providers: Vec<ProviderLink> = state
        .registry
        .providers()
        .map(|p| ProviderLink {
            provider_type: p.provider_type().to_string(),
            name: p.display_name().to_string(),
            url: with_query(
                state.path(&format!("/{}", p.provider_type())),
                query.as_deref(),
            ),
        })
        .collect();

    if wants_json(&headers) {
        return Json(LoginPage { providers }).into_response();
    }

    let mut items = String::new();
    for link in &providers {
        items.push_str(&format!(
            "      <li><a href=\"{}\">Sign in with {}</a></li>\n",
            escape_html(&link.url),
            escape_html(&link.name)
        ));
    }
    if providers.is_empty() {
        items.push_str("      <li>No identity providers are configured.</li>\n");
    }

    Html(format!(
        "<!DOCTYPE html>\n<html>\n  <head>\n    <meta charset=\"utf-8\">\n    <title>Sign in</title>\n  </head>\n  <body>\n    <h1>Sign in</h1>\n    <ul>\n{items}    </ul>\n  </body>\n</html>\n"
    ))
    .into_response()
}

/// `GET /authorize` - routes a generic authorization request.
///
/// With a `provider` parameter the user agent goes straight to that
/// provider; with exactly one registered provider it goes to that one;
/// otherwise to the picker. The remaining query string is preserved.
pub async fn authorize_handler(
    State(state): State<AuthHttpState>,
    RawQuery(query): RawQuery,
) -> Result<Redirect, AuthError> {
    let raw = query.unwrap_or_default();
    let mut provider = None;
    let mut rest = url::form_urlencoded::Serializer::new(String::new());
    for (key, value) in url::form_urlencoded::parse(raw.as_bytes()) {
        if key == "provider" {
            provider = Some(value.into_owned());
        } else {
            rest.append_pair(&key, &value);
        }
    }
    let rest = rest.finish();

    if let Some(name) = provider {
        let provider = state
            .registry
            .get_by_name(&name)
            .ok_or_else(|| AuthError::provider_not_found(name))?;
        let target = state.path(&format!("/{}", provider.provider_type()));
        return Ok(Redirect::to(&with_query(target, Some(&rest))));
    }

    if state.registry.is_empty() {
        return Err(AuthError::configuration("no identity providers configured"));
    }

    if state.registry.len() == 1
        && let Some(only) = state.registry.providers().next()
    {
        let target = state.path(&format!("/{}", only.provider_type()));
        return Ok(Redirect::to(&with_query(target, Some(&rest))));
    }

    Ok(Redirect::to(&with_query(state.path("/login"), Some(&rest))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_query() {
        assert_eq!(with_query("/auth/login".into(), None), "/auth/login");
        assert_eq!(with_query("/auth/login".into(), Some("")), "/auth/login");
        assert_eq!(
            with_query("/auth/github".into(), Some("state=x")),
            "/auth/github?state=x"
        );
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(
            escape_html("<a href=\"x\">&'"),
            "&lt;a href=&quot;x&quot;&gt;&amp;&#39;"
        );
    }

    #[test]
    fn test_wants_json() {
        let mut headers = HeaderMap::new();
        assert!(!wants_json(&headers));
        headers.insert(header::ACCEPT, "application/json".parse().unwrap());
        assert!(wants_json(&headers));
    }
}
