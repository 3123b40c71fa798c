//! Microsoft identity platform (Entra ID), v2.0 endpoints.

use async_trait::async_trait;
use url::Url;

use super::backend::{Endpoints, IdentityBackend, json_string};
use super::error::IdpError;
use crate::config::ProviderConfig;
use crate::types::{ProviderType, UserInfo};

const LOGIN_BASE: &str = "https://login.microsoftonline.com";
const GRAPH_ME: &str = "https://graph.microsoft.com/v1.0/me";
const DEFAULT_TENANT: &str = "common";

/// Microsoft identity platform.
///
/// The tenant selects the endpoint set. Multi-tenant values (`common`,
/// `organizations`, `consumers`) issue ID tokens whose `iss` embeds the
/// user's home tenant, so the issuer check is only enforced for a
/// specific tenant. Access tokens are verified through Graph `/me`.
#[derive(Debug, Clone)]
pub struct MicrosoftBackend {
    endpoints: Endpoints,
    tenant: String,
    display_name: String,
}

impl MicrosoftBackend {
    /// Creates the backend from provider configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the tenant yields an invalid URL or an endpoint
    /// override is not a valid URL.
    pub fn new(config: &ProviderConfig) -> Result<Self, url::ParseError> {
        let tenant = config
            .tenant_id
            .clone()
            .unwrap_or_else(|| DEFAULT_TENANT.to_string());
        let base = format!("{LOGIN_BASE}/{tenant}");

        let issuer = (!is_multi_tenant(&tenant)).then(|| format!("{base}/v2.0"));
        let endpoints = Endpoints {
            authorization: Url::parse(&format!("{base}/oauth2/v2.0/authorize"))?,
            token: Url::parse(&format!("{base}/oauth2/v2.0/token"))?,
            userinfo: Some(Url::parse(GRAPH_ME)?),
            introspection: None,
            revocation: None,
            jwks_uri: Some(Url::parse(&format!("{base}/discovery/v2.0/keys"))?),
            issuer,
        }
        .with_overrides(config)?;

        Ok(Self {
            endpoints,
            tenant,
            display_name: config
                .display_name
                .clone()
                .unwrap_or_else(|| "Microsoft".to_string()),
        })
    }

    /// The configured tenant.
    #[must_use]
    pub fn tenant(&self) -> &str {
        &self.tenant
    }
}

fn is_multi_tenant(tenant: &str) -> bool {
    matches!(tenant, "common" | "organizations" | "consumers")
}

#[async_trait]
impl IdentityBackend for MicrosoftBackend {
    fn provider_type(&self) -> ProviderType {
        ProviderType::MICROSOFT
    }

    fn display_name(&self) -> &str {
        &self.display_name
    }

    fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    fn default_scopes(&self) -> Vec<String> {
        vec![
            "openid".into(),
            "email".into(),
            "profile".into(),
            "offline_access".into(),
            "User.Read".into(),
        ]
    }

    /// Graph `/me` shape: `id`, `mail`, `userPrincipalName`, `displayName`.
    fn map_user_info(&self, value: &serde_json::Value) -> Result<UserInfo, IdpError> {
        let sub = value
            .get("id")
            .or_else(|| value.get("sub"))
            .and_then(json_string)
            .ok_or_else(|| IdpError::invalid_response("me", "missing 'id'"))?;
        Ok(UserInfo {
            sub,
            email: value
                .get("mail")
                .and_then(json_string)
                .or_else(|| value.get("userPrincipalName").and_then(json_string)),
            name: value.get("displayName").and_then(json_string),
            provider: ProviderType::MICROSOFT,
        })
    }
}
