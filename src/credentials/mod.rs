//! Credential Provider: fetches DB credentials from a secret store on
//! startup and on explicit refresh request.

pub mod secrets_manager;

use std::fmt;

use async_trait::async_trait;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::errors::CredentialError;

/// Wraps the password so `Debug`/`Display` never print it — only a
/// length-and-hash fingerprint is ever logged.
#[derive(Clone, Deserialize)]
pub struct SecretString(String);

impl SecretString {
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.0.as_bytes());
        let digest = hex::encode(hasher.finalize());
        format!("len={} sha256={}", self.0.len(), &digest[..12])
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretString({})", self.fingerprint())
    }
}

impl From<String> for SecretString {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct Credential {
    pub username: String,
    pub password: SecretString,
    pub host: String,
    pub port: u16,
    pub database: String,
}

impl Credential {
    pub fn connection_url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.username,
            self.password.expose(),
            self.host,
            self.port,
            self.database
        )
    }
}

#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn fetch(&self, secret_name: &str) -> Result<Credential, CredentialError>;
}

/// Exponential-backoff startup retry, same shape as the DB Pool's
/// `with_retry`, generalized to any fallible async fetch.
pub async fn fetch_with_retry(
    source: &dyn CredentialSource,
    secret_name: &str,
    initial_backoff_ms: u64,
    max_backoff_ms: u64,
    max_attempts: u32,
) -> Result<Credential, CredentialError> {
    let mut backoff_ms = initial_backoff_ms;
    let mut attempt = 0;

    loop {
        attempt += 1;
        match source.fetch(secret_name).await {
            Ok(credential) => {
                tracing::info!(
                    attempt,
                    fingerprint = %credential.password.fingerprint(),
                    "fetched database credential"
                );
                return Ok(credential);
            }
            Err(err) => {
                if attempt >= max_attempts {
                    tracing::error!(attempt, error = %err, "exhausted credential fetch retries");
                    return Err(err);
                }
                tracing::warn!(attempt, error = %err, backoff_ms, "credential fetch failed, retrying");
                tokio::time::sleep(std::time::Duration::from_millis(backoff_ms)).await;
                backoff_ms = (backoff_ms * 2).min(max_backoff_ms);
            }
        }
    }
}

/// Test-only in-memory credential source.
pub struct StaticCredentialSource {
    credential: Credential,
}

impl StaticCredentialSource {
    pub fn new(credential: Credential) -> Self {
        Self { credential }
    }
}

#[async_trait]
impl CredentialSource for StaticCredentialSource {
    async fn fetch(&self, _secret_name: &str) -> Result<Credential, CredentialError> {
        Ok(self.credential.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_never_contains_the_password() {
        let secret = SecretString::from("hunter2".to_string());
        assert!(!format!("{secret:?}").contains("hunter2"));
    }

    #[tokio::test]
    async fn retry_gives_up_after_max_attempts() {
        struct AlwaysFails;

        #[async_trait]
        impl CredentialSource for AlwaysFails {
            async fn fetch(&self, _secret_name: &str) -> Result<Credential, CredentialError> {
                Err(CredentialError::Transport("down".into()))
            }
        }

        let result = fetch_with_retry(&AlwaysFails, "db/primary", 1, 2, 3).await;
        assert!(result.is_err());
    }
}
