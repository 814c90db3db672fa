//! Secret-provider seam.
//!
//! The pipeline needs exactly one secret per run (the GoAudits bearer
//! token), read fresh each time; nothing is cached across runs. The vault
//! implementation authenticates with a token from the runtime's ambient
//! identity endpoint. Secret values are never logged.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde_json::Value;

#[async_trait]
pub trait SecretProvider: Send + Sync {
    async fn get_secret(&self, name: &str) -> Result<String>;
}

/// Managed-identity metadata endpoint used when `IDENTITY_ENDPOINT` is not
/// injected by the runtime.
const DEFAULT_IDENTITY_ENDPOINT: &str = "http://169.254.169.254/metadata/identity/oauth2/token";
const VAULT_RESOURCE: &str = "https://vault.azure.net";
const VAULT_API_VERSION: &str = "7.4";

/// Key-vault backed provider.
pub struct VaultSecretProvider {
    base: String,
    identity_endpoint: String,
    http: reqwest::Client,
}

impl VaultSecretProvider {
    pub fn new(secret_uri: impl Into<String>) -> Result<Self> {
        let identity_endpoint = std::env::var("IDENTITY_ENDPOINT")
            .unwrap_or_else(|_| DEFAULT_IDENTITY_ENDPOINT.to_string());
        Ok(Self {
            base: secret_uri.into().trim_end_matches('/').to_string(),
            identity_endpoint,
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .context("secret client build failed")?,
        })
    }

    async fn identity_token(&self) -> Result<String> {
        let resp = self
            .http
            .get(&self.identity_endpoint)
            .header("Metadata", "true")
            .query(&[("resource", VAULT_RESOURCE), ("api-version", "2019-08-01")])
            .send()
            .await
            .context("identity endpoint unreachable")?
            .error_for_status()
            .context("identity endpoint rejected the request")?;
        let body: Value = resp.json().await.context("identity response not JSON")?;
        body["access_token"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| anyhow!("identity response missing access_token"))
    }
}

#[async_trait]
impl SecretProvider for VaultSecretProvider {
    async fn get_secret(&self, name: &str) -> Result<String> {
        let token = self.identity_token().await?;
        let url = format!(
            "{}/secrets/{}?api-version={}",
            self.base, name, VAULT_API_VERSION
        );
        let resp = self
            .http
            .get(&url)
            .bearer_auth(token)
            .send()
            .await
            .with_context(|| format!("secret store unreachable for '{name}'"))?
            .error_for_status()
            .with_context(|| format!("secret store rejected read of '{name}'"))?;
        let body: Value = resp.json().await.context("secret response not JSON")?;
        body["value"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| anyhow!("secret '{name}' has no string value"))
    }
}

/// Short-lived database access token from the ambient identity endpoint.
/// Used as the password slot when no full connection URL is configured, so
/// the worker never holds a static database password.
pub async fn ambient_database_token() -> Result<String> {
    const DB_RESOURCE: &str = "https://ossrdbms-aad.database.windows.net";
    let endpoint = std::env::var("IDENTITY_ENDPOINT")
        .unwrap_or_else(|_| DEFAULT_IDENTITY_ENDPOINT.to_string());
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .context("token client build failed")?;
    let resp = http
        .get(&endpoint)
        .header("Metadata", "true")
        .query(&[("resource", DB_RESOURCE), ("api-version", "2019-08-01")])
        .send()
        .await
        .context("identity endpoint unreachable")?
        .error_for_status()
        .context("identity endpoint rejected the request")?;
    let body: Value = resp.json().await.context("identity response not JSON")?;
    body["access_token"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| anyhow!("identity response missing access_token"))
}

/// Environment-backed provider for tests and local development.
/// `goaudits-bearer-token` reads from `GAW_SECRET_GOAUDITS_BEARER_TOKEN`.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvSecretProvider;

impl EnvSecretProvider {
    pub fn env_key(name: &str) -> String {
        let mut key = String::with_capacity(name.len() + 11);
        key.push_str("GAW_SECRET_");
        for ch in name.chars() {
            if ch.is_ascii_alphanumeric() {
                key.push(ch.to_ascii_uppercase());
            } else {
                key.push('_');
            }
        }
        key
    }
}

#[async_trait]
impl SecretProvider for EnvSecretProvider {
    async fn get_secret(&self, name: &str) -> Result<String> {
        let key = Self::env_key(name);
        std::env::var(&key).with_context(|| format!("secret '{name}' not set (env {key})"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_key_mangling() {
        assert_eq!(
            EnvSecretProvider::env_key("goaudits-bearer-token"),
            "GAW_SECRET_GOAUDITS_BEARER_TOKEN"
        );
        assert_eq!(EnvSecretProvider::env_key("a.b c"), "GAW_SECRET_A_B_C");
    }
}
