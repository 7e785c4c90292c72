//! Provider-agnostic stage storage client
//!
//! [`StorageClient`] drives every operation through the same retry loop:
//! attempt on a snapshot of the provider handle, classify the failure, then
//! renew credentials, back off, or give up. Providers only ever see single
//! primitive calls.
//!
//! # Example
//!
//! ```no_run
//! # use cloud_stage::{ClientConfig, StorageClient, StaticSession};
//! # use std::sync::Arc;
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let session = Arc::new(StaticSession::from_env("cli"));
//! let config = ClientConfig::default();
//! let client = StorageClient::connect(&config, session.credentials(), session.clone()).await?;
//!
//! for summary in client.list_objects("my-bucket", "data/").await? {
//!     println!("{} {}", summary.key, summary.size);
//! }
//! client.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod download;
mod upload;

pub use download::DownloadRequest;
pub use upload::UploadRequest;

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ClientConfig, ConfigError, TransferConfig};
use crate::credentials::{StageCredentials, StageSession};
use crate::crypto::EncryptionMaterial;
use crate::error::{
    Cause, ErrorKind, Operation, ProviderError, ProviderResult, StorageError, StorageResult,
};
use crate::metadata::{ObjectMetadata, ObjectSummaryCollection};
use crate::provider::{self, ProviderKind, StorageProvider};
use crate::retry::{RetryDecision, RetryPolicy, RetryState};

/// Counters reported by a finished transfer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferSummary {
    /// Bytes moved over the wire (ciphertext when encrypting)
    pub bytes: u64,

    /// Ranges or parts transferred; 1 for a single request
    pub parts: usize,

    pub attempts: u32,
    pub retries: u32,
    pub renewals: u32,
}

impl TransferSummary {
    fn new(bytes: u64, parts: usize, state: &RetryState) -> Self {
        Self {
            bytes,
            parts,
            attempts: state.attempts,
            retries: state.retries,
            renewals: state.renewals,
        }
    }
}

/// Current provider plus a counter bumped on every swap
#[derive(Clone)]
struct ProviderHandle {
    provider: Arc<dyn StorageProvider>,
    generation: u64,
}

/// Storage client for one stage
pub struct StorageClient {
    handle: RwLock<ProviderHandle>,
    renewal: tokio::sync::Mutex<()>,
    /// Held shared by each multipart upload until it completes or aborts
    uploads: tokio::sync::RwLock<()>,
    session: Arc<dyn StageSession>,
    policy: RetryPolicy,
    transfer: TransferConfig,
    encryption: Option<EncryptionMaterial>,
    closed: AtomicBool,
}

impl std::fmt::Debug for StorageClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageClient")
            .field("provider", &self.provider_kind())
            .field("session", &self.session.session_id())
            .field("policy", &self.policy)
            .field("encrypting", &self.is_encrypting())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl StorageClient {
    /// Wrap an already built provider
    pub fn new(
        config: &ClientConfig,
        provider: Arc<dyn StorageProvider>,
        session: Arc<dyn StageSession>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let encryption = config
            .encryption
            .as_ref()
            .map(EncryptionMaterial::from_config)
            .transpose()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        Ok(Self {
            handle: RwLock::new(ProviderHandle {
                provider,
                generation: 0,
            }),
            renewal: tokio::sync::Mutex::new(()),
            uploads: tokio::sync::RwLock::new(()),
            session,
            policy: RetryPolicy::from_config(&config.retry),
            transfer: config.transfer.clone(),
            encryption,
            closed: AtomicBool::new(false),
        })
    }

    /// Build the configured provider from `credentials` and wrap it
    pub async fn connect(
        config: &ClientConfig,
        credentials: &StageCredentials,
        session: Arc<dyn StageSession>,
    ) -> StorageResult<Self> {
        let command = "connect";
        let provider = provider::connect(&config.provider, credentials)
            .await
            .map_err(|e| {
                let kind = match e.kind_hint {
                    Some(ErrorKind::Malformed) => ErrorKind::Malformed,
                    _ => ErrorKind::Fatal,
                };
                StorageError::new(kind, Operation::Connect, command, 1, e)
            })?;

        info!(
            provider = %provider.kind(),
            session = session.session_id(),
            "Connected storage client"
        );

        Self::new(config, provider, session).map_err(|e| {
            StorageError::new(
                ErrorKind::Malformed,
                Operation::Connect,
                command,
                0,
                Cause::Message(e.to_string()),
            )
        })
    }

    pub fn max_retries(&self) -> u32 {
        self.policy.max_retries()
    }

    pub fn retry_backoff_max_exponent(&self) -> u32 {
        self.policy.max_exponent()
    }

    pub fn retry_backoff_min(&self) -> Duration {
        self.policy.backoff_min()
    }

    pub fn is_encrypting(&self) -> bool {
        self.encryption.is_some()
    }

    /// Key size in bits, when encrypting
    pub fn encryption_key_size(&self) -> Option<u32> {
        self.encryption.as_ref().map(EncryptionMaterial::key_size)
    }

    pub fn provider_kind(&self) -> ProviderKind {
        self.snapshot().provider.kind()
    }

    pub fn session_id(&self) -> &str {
        self.session.session_id()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn snapshot(&self) -> ProviderHandle {
        self.handle
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn generation(&self) -> u64 {
        self.handle
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .generation
    }

    fn ensure_open(&self, operation: Operation, command: &str) -> StorageResult<()> {
        if self.is_closed() {
            Err(StorageError::closed(operation, command))
        } else {
            Ok(())
        }
    }

    /// Replace the provider handle with one built from `credentials`
    ///
    /// Configuration (encryption, retry, transfer tuning) is untouched.
    ///
    /// # Errors
    ///
    /// `Malformed` when a required credential field is missing or the
    /// provider rejects the credentials outright; `Closed` after shutdown.
    #[tracing::instrument(
        skip(self, credentials),
        fields(otel.kind = "client", provider = %self.provider_kind())
    )]
    pub async fn renew(&self, credentials: &StageCredentials) -> StorageResult<()> {
        let command = "renew";
        self.ensure_open(Operation::Renew, command)?;
        let _guard = self.renewal.lock().await;
        self.install(credentials, Operation::Renew, command, 0).await
    }

    /// Build a replacement provider and swap it in; caller holds the renewal lock
    async fn install(
        &self,
        credentials: &StageCredentials,
        operation: Operation,
        command: &str,
        attempts: u32,
    ) -> StorageResult<()> {
        let current = self.snapshot();
        let kind = current.provider.kind();
        if let Some(missing) = kind
            .required_credentials()
            .iter()
            .find(|key| !credentials.contains(key))
        {
            let err = ProviderError::missing_credential(kind.as_str(), missing);
            return Err(StorageError::new(ErrorKind::Malformed, operation, command, attempts, err));
        }
        let replacement = current.provider.renewed(credentials).await.map_err(|e| {
            StorageError::new(ErrorKind::Malformed, operation, command, attempts, e)
        })?;

        if self.is_closed() {
            replacement.shutdown().await;
            return Err(StorageError::closed(operation, command).with_attempts(attempts));
        }

        let generation = {
            let mut handle = self.handle.write().unwrap_or_else(PoisonError::into_inner);
            handle.provider = replacement;
            handle.generation += 1;
            handle.generation
        };
        info!(generation, "Installed renewed credentials");
        Ok(())
    }

    /// Renew from the session unless another task already did
    async fn renew_from_session(
        &self,
        observed_generation: u64,
        operation: Operation,
        command: &str,
        attempts: u32,
    ) -> StorageResult<()> {
        let _guard = self.renewal.lock().await;
        if self.generation() != observed_generation {
            debug!(observed_generation, "Credentials already renewed by another task");
            return Ok(());
        }

        let credentials = self
            .session
            .fresh_credentials(command)
            .await
            .map_err(|e| {
                error!(error = %e, "Session failed to issue fresh credentials");
                StorageError::new(
                    ErrorKind::Fatal,
                    operation,
                    command,
                    attempts,
                    Cause::Message(format!("credential renewal failed: {}", e)),
                )
            })?;

        self.install(&credentials, operation, command, attempts).await
    }

    /// Release provider resources; calling it again is a no-op
    #[tracing::instrument(skip(self), fields(otel.kind = "client"))]
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            debug!("Storage client already shut down");
            return;
        }
        // Multipart uploads still running abort on the live provider first
        let _uploads = self.uploads.write().await;
        let _renewal = self.renewal.lock().await;
        let handle = self.snapshot();
        handle.provider.shutdown().await;
        info!(provider = %handle.provider.kind(), "Storage client shut down");
    }

    /// List every object under `prefix`, following pagination to the end
    #[tracing::instrument(
        skip(self),
        fields(otel.kind = "client", provider = %self.provider_kind(), session = self.session_id())
    )]
    pub async fn list_objects(
        &self,
        location: &str,
        prefix: &str,
    ) -> StorageResult<ObjectSummaryCollection> {
        let command = format!("LIST {}/{}", location, prefix);
        self.ensure_open(Operation::ListObjects, &command)?;

        let cancel = CancellationToken::new();
        let mut total = RetryState::new();
        let mut summaries = Vec::new();
        let mut token: Option<String> = None;

        loop {
            let mut state = RetryState::new();
            let current = token.clone();
            let page = self
                .run_with_retry(Operation::ListObjects, &command, &cancel, &mut state, move |p| {
                    let current = current.clone();
                    async move { p.list_page(location, prefix, current.as_deref()).await }
                })
                .await
                .map_err(|e| {
                    let attempts = total.attempts + e.attempts();
                    e.with_attempts(attempts)
                })?;
            total.absorb(&state);

            summaries.extend(page.summaries);
            match page.next_token {
                Some(next) if token.as_deref() == Some(next.as_str()) => {
                    let err = ProviderError::new(
                        self.provider_kind().as_str(),
                        format!("listing returned the continuation token {} twice", next),
                    );
                    return Err(StorageError::new(
                        ErrorKind::Fatal,
                        Operation::ListObjects,
                        command,
                        total.attempts,
                        err,
                    ));
                }
                Some(next) => token = Some(next),
                None => break,
            }
        }

        debug!(
            objects = summaries.len(),
            attempts = total.attempts,
            "Listing complete"
        );
        Ok(ObjectSummaryCollection::new(summaries))
    }

    /// Read one object's metadata
    #[tracing::instrument(
        skip(self),
        fields(otel.kind = "client", provider = %self.provider_kind(), session = self.session_id())
    )]
    pub async fn get_object_metadata(
        &self,
        location: &str,
        key: &str,
    ) -> StorageResult<ObjectMetadata> {
        let command = format!("HEAD {}/{}", location, key);
        self.ensure_open(Operation::GetObjectMetadata, &command)?;
        let mut state = RetryState::new();
        self.run_with_retry(
            Operation::GetObjectMetadata,
            &command,
            &CancellationToken::new(),
            &mut state,
            move |p| async move { p.head_object(location, key).await },
        )
        .await
    }

    /// Run `attempt` until it succeeds or the retry policy gives up
    ///
    /// Each attempt runs on one snapshot of the provider handle.
    async fn run_with_retry<T, F, Fut>(
        &self,
        operation: Operation,
        command: &str,
        cancel: &CancellationToken,
        state: &mut RetryState,
        attempt: F,
    ) -> StorageResult<T>
    where
        F: FnMut(Arc<dyn StorageProvider>) -> Fut,
        Fut: Future<Output = ProviderResult<T>>,
    {
        self.attempt_loop(operation, command, cancel, state, true, attempt)
            .await
    }

    /// Retry loop for cleanup that must reach the provider during shutdown
    async fn run_cleanup_with_retry<T, F, Fut>(
        &self,
        operation: Operation,
        command: &str,
        state: &mut RetryState,
        attempt: F,
    ) -> StorageResult<T>
    where
        F: FnMut(Arc<dyn StorageProvider>) -> Fut,
        Fut: Future<Output = ProviderResult<T>>,
    {
        let cancel = CancellationToken::new();
        self.attempt_loop(operation, command, &cancel, state, false, attempt)
            .await
    }

    async fn attempt_loop<T, F, Fut>(
        &self,
        operation: Operation,
        command: &str,
        cancel: &CancellationToken,
        state: &mut RetryState,
        fail_when_closed: bool,
        mut attempt: F,
    ) -> StorageResult<T>
    where
        F: FnMut(Arc<dyn StorageProvider>) -> Fut,
        Fut: Future<Output = ProviderResult<T>>,
    {
        loop {
            if fail_when_closed && self.is_closed() {
                return Err(StorageError::closed(operation, command).with_attempts(state.attempts));
            }
            if cancel.is_cancelled() {
                return Err(StorageError::cancelled(operation, command, state.attempts));
            }

            let handle = self.snapshot();
            state.attempts += 1;
            debug!(
                operation = %operation,
                attempt = state.attempts,
                generation = handle.generation,
                "Starting attempt"
            );

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(StorageError::cancelled(operation, command, state.attempts));
                }
                result = attempt(Arc::clone(&handle.provider)) => result,
            };

            match result {
                Ok(value) => return Ok(value),
                Err(err) => {
                    self.handle_storage_exception(operation, command, cancel, state, &handle, err)
                        .await?
                }
            }
        }
    }

    /// Decide what follows a failed attempt
    ///
    /// `Ok(())` means try again; anything terminal comes back as the error.
    async fn handle_storage_exception(
        &self,
        operation: Operation,
        command: &str,
        cancel: &CancellationToken,
        state: &mut RetryState,
        handle: &ProviderHandle,
        err: ProviderError,
    ) -> StorageResult<()> {
        let kind = handle.provider.classify(&err);

        match self.policy.evaluate(kind, state) {
            RetryDecision::Renew => {
                warn!(
                    operation = %operation,
                    renewal = state.renewals + 1,
                    error = %err,
                    "Credentials expired, renewing"
                );
                self.renew_from_session(handle.generation, operation, command, state.attempts)
                    .await?;
                state.renewals += 1;
                Ok(())
            }
            RetryDecision::Backoff(delay) => {
                warn!(
                    operation = %operation,
                    retry = state.retries + 1,
                    max_retries = self.policy.max_retries(),
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Retrying after backoff"
                );
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        return Err(StorageError::cancelled(operation, command, state.attempts));
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
                state.retries += 1;
                state.total_backoff += delay;
                Ok(())
            }
            RetryDecision::Fail => {
                let surfaced = if kind.is_recoverable() {
                    ErrorKind::Fatal
                } else {
                    kind
                };
                let failure = StorageError::new(surfaced, operation, command, state.attempts, err);
                if surfaced == ErrorKind::NotFound {
                    debug!(error = %failure, "Object not found");
                } else {
                    error!(
                        classified = %kind,
                        retries = state.retries,
                        renewals = state.renewals,
                        error = %failure,
                        "Operation failed"
                    );
                }
                Err(failure)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderConfig;
    use crate::credentials::{keys, StaticSession};
    use crate::provider::{Fault, FaultPoint, MemoryProvider};

    fn client_with(provider: &MemoryProvider, max_retries: u32) -> StorageClient {
        let config = ClientConfig::builder()
            .max_retries(max_retries)
            .retry_backoff_min(Duration::from_millis(1))
            .jitter(false)
            .build()
            .unwrap();
        let session = Arc::new(StaticSession::new(
            "test",
            StageCredentials::new().with(keys::MEMORY_TOKEN, provider.token()),
        ));
        StorageClient::new(&config, Arc::new(provider.clone()), session).unwrap()
    }

    #[tokio::test]
    async fn test_getters_reflect_config() {
        let provider = MemoryProvider::new("t0");
        let client = client_with(&provider, 7);
        assert_eq!(client.max_retries(), 7);
        assert_eq!(client.retry_backoff_min(), Duration::from_millis(1));
        assert_eq!(client.retry_backoff_max_exponent(), 4);
        assert!(!client.is_encrypting());
        assert_eq!(client.encryption_key_size(), None);
        assert_eq!(client.provider_kind(), ProviderKind::Memory);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let provider = MemoryProvider::new("t0");
        provider.put_raw("bucket", "a", "x");
        provider.inject(FaultPoint::Head, Fault::Throttled, 2);
        let client = client_with(&provider, 3);

        let metadata = client.get_object_metadata("bucket", "a").await.unwrap();
        assert_eq!(metadata.content_length, 1);
        assert_eq!(provider.attempts(FaultPoint::Head), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_surface_fatal() {
        let provider = MemoryProvider::new("t0");
        provider.inject_always(FaultPoint::Head, Fault::Transient);
        let client = client_with(&provider, 2);

        let err = client.get_object_metadata("bucket", "a").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Fatal);
        assert_eq!(err.attempts(), 3);
        assert_eq!(err.operation(), Operation::GetObjectMetadata);
        assert_eq!(err.command(), "HEAD bucket/a");
    }

    #[tokio::test]
    async fn test_not_found_is_not_retried() {
        let provider = MemoryProvider::new("t0");
        let client = client_with(&provider, 5);

        let err = client.get_object_metadata("bucket", "missing").await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(err.attempts(), 1);
    }

    #[tokio::test]
    async fn test_renew_swaps_provider() {
        let provider = MemoryProvider::new("t0");
        provider.put_raw("bucket", "a", "x");
        provider.revoke_token("t0");
        let client = client_with(&provider, 0);

        client
            .renew(&StageCredentials::new().with(keys::MEMORY_TOKEN, "t1"))
            .await
            .unwrap();
        assert_eq!(client.generation(), 1);
        assert!(client.get_object_metadata("bucket", "a").await.is_ok());
    }

    #[tokio::test]
    async fn test_renew_without_token_is_malformed() {
        let provider = MemoryProvider::new("t0");
        let client = client_with(&provider, 0);

        let err = client.renew(&StageCredentials::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Malformed);
        assert_eq!(client.generation(), 0);
    }

    #[tokio::test]
    async fn test_connect_rejects_missing_credentials() {
        let config = ClientConfig::builder()
            .provider(ProviderConfig::Memory)
            .build()
            .unwrap();
        let session = Arc::new(StaticSession::new("test", StageCredentials::new()));
        let err = StorageClient::connect(&config, &StageCredentials::new(), session)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Malformed);
        assert_eq!(err.operation(), Operation::Connect);
    }
}
