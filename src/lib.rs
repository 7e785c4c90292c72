/*!
 * cloud-stage - provider-agnostic stage storage client
 *
 * Moves files between a database driver and remote object storage:
 * - One client API over Amazon S3, Azure Blob Storage, Google Cloud Storage
 *   and an in-memory store
 * - Retries with capped exponential backoff and credential renewal
 * - Parallel ranged downloads and multipart uploads
 * - Client-side AES encryption with per-object file keys
 * - Provider-neutral object metadata and listings
 */

pub mod classify;
pub mod client;
pub mod config;
pub mod credentials;
pub mod crypto;
pub mod error;
pub mod logging;
pub mod metadata;
pub mod provider;
pub mod retry;
pub mod source;

// Re-export commonly used types
pub use client::{DownloadRequest, StorageClient, TransferSummary, UploadRequest};
pub use config::{ClientConfig, EncryptionConfig, ProviderConfig, RetryConfig, TransferConfig};
pub use credentials::{StageCredentials, StageSession, StaticSession};
pub use error::{ErrorKind, Operation, ProviderError, StorageError, StorageResult};
pub use metadata::{ObjectMetadata, ObjectSummary, ObjectSummaryCollection};
pub use provider::{ProviderKind, StorageProvider};
pub use retry::{RetryDecision, RetryPolicy};
pub use source::FileBackedStream;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(VERSION, env!("CARGO_PKG_VERSION"));
    }
}
