//! OAuth2 client-credentials flow for Azure AD.

use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, error};

use super::secure::SecureString;
use crate::config::Config;
use crate::error::AuthError;

/// HTTP request timeout.
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
/// HTTP connection timeout.
const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Environment variable holding the application's client secret.
pub const CLIENT_SECRET_VAR: &str = "AZURE_CLIENT_SECRET";

/// Resource an access token is issued for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Audience {
    /// Microsoft Graph (directory roles, policies, access reviews).
    Graph,
    /// Azure Resource Manager (resource roles).
    Management,
}

impl Audience {
    /// The `.default` scope requested for this audience.
    pub fn scope(self) -> &'static str {
        match self {
            Self::Graph => "https://graph.microsoft.com/.default",
            Self::Management => "https://management.azure.com/.default",
        }
    }
}

/// OAuth2 client for app-only Azure AD authentication.
pub struct OAuth2Client {
    client_id: String,
    token_url: String,
    client_secret: SecureString,
    http_client: reqwest::Client,
}

impl OAuth2Client {
    /// Create a new OAuth2 client from configuration and a client secret.
    pub fn new(config: &Config, client_secret: SecureString) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .connect_timeout(HTTP_CONNECT_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client_id: config.oauth.client_id.clone(),
            token_url: config.token_url(),
            client_secret,
            http_client,
        })
    }

    /// Request an app-only token for `audience`.
    pub async fn client_credentials_token(
        &self,
        audience: Audience,
    ) -> Result<TokenResponse, AuthError> {
        let params = [
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("grant_type", "client_credentials"),
            ("scope", audience.scope()),
        ];

        debug!("Requesting {:?} token", audience);

        let response = self
            .http_client
            .post(&self.token_url)
            .form(&params)
            .send()
            .await
            .map_err(|e| AuthError::RequestFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            // Log error details for debugging; the error itself carries only the status.
            let error_body = response.text().await.unwrap_or_default();
            error!("Token request failed: HTTP {} - {}", status, error_body);
            return match status.as_u16() {
                400 | 401 | 403 => Err(AuthError::Rejected(format!("HTTP {}", status.as_u16()))),
                _ => Err(AuthError::RequestFailed(format!("HTTP {}", status.as_u16()))),
            };
        }

        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| AuthError::RequestFailed(e.to_string()))
    }
}

/// Read the client secret from the environment.
pub fn read_client_secret() -> Result<SecureString, AuthError> {
    match env::var(CLIENT_SECRET_VAR) {
        Ok(secret) if !secret.is_empty() => Ok(SecureString::new(secret)),
        _ => Err(AuthError::MissingClientSecret),
    }
}

/// Token response from Azure AD.
#[derive(Deserialize)]
pub struct TokenResponse {
    pub access_token: SecureString,
    pub token_type: String,
    pub expires_in: u64,
}
