//! Stage credentials and the session-layer seam used for renewal
//!
//! A [`StageCredentials`] map is what the session layer hands out for a
//! stage: provider-specific field names to secret values. Values are kept in
//! [`SecretString`] so they never show up in logs or `Debug` output.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use std::collections::BTreeMap;
use std::fmt;

/// Credential field names, as issued by the session layer
pub mod keys {
    pub const AWS_KEY_ID: &str = "AWS_KEY_ID";
    pub const AWS_SECRET_KEY: &str = "AWS_SECRET_KEY";
    pub const AWS_TOKEN: &str = "AWS_TOKEN";
    pub const AZURE_SAS_TOKEN: &str = "AZURE_SAS_TOKEN";
    pub const GCS_ACCESS_TOKEN: &str = "GCS_ACCESS_TOKEN";
    pub const MEMORY_TOKEN: &str = "MEMORY_TOKEN";
}

/// Error type returned by session implementations
pub type SessionError = Box<dyn std::error::Error + Send + Sync>;

/// Credential map for one stage
#[derive(Default)]
pub struct StageCredentials {
    values: BTreeMap<String, SecretString>,
}

impl StageCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values
            .insert(key.into(), SecretString::new(value.into().into_boxed_str()));
    }

    /// Value of a field, if present and non-empty
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .get(key)
            .map(|v| v.expose_secret())
            .filter(|v| !v.is_empty())
    }

    /// Value of a required field
    pub fn require(&self, key: &str) -> Result<&str, MissingCredential> {
        self.get(key).ok_or_else(|| MissingCredential(key.to_string()))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl Clone for StageCredentials {
    fn clone(&self) -> Self {
        let values = self
            .values
            .iter()
            .map(|(k, v)| (k.clone(), SecretString::new(v.expose_secret().to_string().into_boxed_str())))
            .collect();
        Self { values }
    }
}

impl fmt::Debug for StageCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.values.keys().map(|k| (k, "[REDACTED]")))
            .finish()
    }
}

impl<K, V> FromIterator<(K, V)> for StageCredentials
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut credentials = StageCredentials::new();
        for (k, v) in iter {
            credentials.insert(k, v);
        }
        credentials
    }
}

/// A required credential field was absent
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("missing credential field {0}")]
pub struct MissingCredential(pub String);

/// What the storage client needs from the owning session
#[async_trait]
pub trait StageSession: Send + Sync {
    /// Identifier used to correlate log lines with the session
    fn session_id(&self) -> &str;

    /// Ask the session layer for freshly issued stage credentials
    async fn fresh_credentials(&self, command: &str) -> Result<StageCredentials, SessionError>;
}

/// Session that always hands out the same credentials
///
/// Used by the CLI, where credentials come from the environment and cannot
/// be reissued, and by tests.
#[derive(Debug, Clone)]
pub struct StaticSession {
    id: String,
    credentials: StageCredentials,
}

impl StaticSession {
    pub fn new(id: impl Into<String>, credentials: StageCredentials) -> Self {
        Self {
            id: id.into(),
            credentials,
        }
    }

    /// Read the well-known credential fields from environment variables
    pub fn from_env(id: impl Into<String>) -> Self {
        let credentials = [
            keys::AWS_KEY_ID,
            keys::AWS_SECRET_KEY,
            keys::AWS_TOKEN,
            keys::AZURE_SAS_TOKEN,
            keys::GCS_ACCESS_TOKEN,
            keys::MEMORY_TOKEN,
        ]
        .into_iter()
        .filter_map(|key| std::env::var(key).ok().map(|value| (key, value)))
        .collect();
        Self::new(id, credentials)
    }

    pub fn credentials(&self) -> &StageCredentials {
        &self.credentials
    }
}

#[async_trait]
impl StageSession for StaticSession {
    fn session_id(&self) -> &str {
        &self.id
    }

    async fn fresh_credentials(&self, _command: &str) -> Result<StageCredentials, SessionError> {
        Ok(self.credentials.clone())
    }
}
