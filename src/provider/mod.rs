//! Storage provider abstraction
//!
//! A [`StorageProvider`] supplies only primitives: one listing page, a head
//! request, a ranged get, a single put and the multipart calls. Retry,
//! renewal, encryption and parallelism all live in [`crate::StorageClient`],
//! so every provider gets the same behaviour.
//!
//! Credentials are baked into a provider when it is built. Renewal never
//! mutates a provider; [`StorageProvider::renewed`] builds a replacement that
//! the client swaps in.
//!
//! # Implementations
//!
//! - [`S3Provider`] (feature `s3-native`): Amazon S3 via `aws-sdk-s3`
//! - [`ObjectStoreProvider`] (features `azure-native`, `gcs-native`): Azure
//!   Blob Storage and Google Cloud Storage via `object_store`
//! - [`MemoryProvider`]: in-process store with fault injection

pub mod memory;

#[cfg(feature = "s3-native")]
pub mod s3;

#[cfg(any(feature = "azure-native", feature = "gcs-native"))]
pub mod store;

pub use memory::{Fault, FaultPoint, MemoryProvider};

#[cfg(feature = "s3-native")]
pub use s3::S3Provider;

#[cfg(any(feature = "azure-native", feature = "gcs-native"))]
pub use store::ObjectStoreProvider;

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use crate::classify;
use crate::config::ProviderConfig;
use crate::credentials::{keys, StageCredentials};
use crate::error::{ErrorKind, ProviderError, ProviderResult};
use crate::metadata::{ObjectMetadata, ObjectSummary};

/// Which cloud a provider talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    S3,
    Azure,
    Gcs,
    Memory,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::S3 => "s3",
            ProviderKind::Azure => "azure",
            ProviderKind::Gcs => "gcs",
            ProviderKind::Memory => "memory",
        }
    }

    /// Credential fields a provider of this kind cannot be built without
    pub fn required_credentials(&self) -> &'static [&'static str] {
        match self {
            ProviderKind::S3 => &[keys::AWS_KEY_ID, keys::AWS_SECRET_KEY],
            ProviderKind::Azure => &[keys::AZURE_SAS_TOKEN],
            ProviderKind::Gcs => &[keys::GCS_ACCESS_TOKEN],
            ProviderKind::Memory => &[keys::MEMORY_TOKEN],
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optional primitives a provider supports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// `get_range` honours byte ranges, so downloads may be split
    pub ranged_get: bool,

    /// The multipart primitives are implemented
    pub multipart: bool,

    /// `create_multipart` persists the metadata it is given
    pub multipart_metadata: bool,
}

impl Capabilities {
    pub const FULL: Capabilities = Capabilities {
        ranged_get: true,
        multipart: true,
        multipart_metadata: true,
    };

    /// Whether an object with `metadata` can go up in parts
    pub fn multipart_for(&self, metadata: &ObjectMetadata) -> bool {
        self.multipart && (self.multipart_metadata || !metadata.has_stored_fields())
    }
}

/// One page of a listing
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub summaries: Vec<ObjectSummary>,

    /// Token for the next page; `None` on the last page
    pub next_token: Option<String>,
}

/// A part accepted by the provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    /// 1-based part number
    pub part_number: u32,
    pub etag: String,
}

/// Primitive operations of one object storage service
///
/// Implementors must be `Send + Sync`; one provider instance serves every
/// concurrent part of a transfer.
#[async_trait]
pub trait StorageProvider: Send + Sync + fmt::Debug {
    fn kind(&self) -> ProviderKind;

    fn capabilities(&self) -> Capabilities;

    /// Build a replacement provider carrying fresh credentials
    ///
    /// # Errors
    ///
    /// Returns an error hinted `Malformed` when a required credential field
    /// is missing or the credentials are rejected outright.
    async fn renewed(
        &self,
        credentials: &StageCredentials,
    ) -> ProviderResult<Arc<dyn StorageProvider>>;

    /// Fetch one listing page of `location` under `prefix`
    ///
    /// # Arguments
    ///
    /// * `location` - Bucket or container
    /// * `prefix` - Key prefix; empty lists everything
    /// * `token` - Continuation token from the previous page
    async fn list_page(
        &self,
        location: &str,
        prefix: &str,
        token: Option<&str>,
    ) -> ProviderResult<ListPage>;

    /// Read the metadata of one object
    async fn head_object(&self, location: &str, key: &str) -> ProviderResult<ObjectMetadata>;

    /// Fetch an object or a byte range of it (`range.end` exclusive)
    async fn get_range(
        &self,
        location: &str,
        key: &str,
        range: Option<Range<u64>>,
    ) -> ProviderResult<Bytes>;

    /// Store a whole object in one request
    async fn put_object(
        &self,
        location: &str,
        key: &str,
        data: Bytes,
        metadata: &ObjectMetadata,
    ) -> ProviderResult<()>;

    /// Start a multipart upload and return its upload id
    async fn create_multipart(
        &self,
        location: &str,
        key: &str,
        metadata: &ObjectMetadata,
    ) -> ProviderResult<String> {
        let _ = (location, key, metadata);
        Err(ProviderError::unsupported(self.kind().as_str(), "create_multipart"))
    }

    /// Upload one part of a multipart upload
    async fn upload_part(
        &self,
        location: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> ProviderResult<CompletedPart> {
        let _ = (location, key, upload_id, part_number, data);
        Err(ProviderError::unsupported(self.kind().as_str(), "upload_part"))
    }

    /// Assemble the uploaded parts, which must be sorted by part number
    async fn complete_multipart(
        &self,
        location: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> ProviderResult<()> {
        let _ = (location, key, upload_id, parts);
        Err(ProviderError::unsupported(self.kind().as_str(), "complete_multipart"))
    }

    /// Discard a multipart upload and its parts
    async fn abort_multipart(
        &self,
        location: &str,
        key: &str,
        upload_id: &str,
    ) -> ProviderResult<()> {
        let _ = (location, key, upload_id);
        Err(ProviderError::unsupported(self.kind().as_str(), "abort_multipart"))
    }

    /// Map a failure of this provider onto the retry taxonomy
    fn classify(&self, error: &ProviderError) -> ErrorKind {
        classify::classify(error)
    }

    /// Release connections and other resources
    async fn shutdown(&self) {}
}

/// Build the provider a configuration names, using the given credentials
pub async fn connect(
    config: &ProviderConfig,
    credentials: &StageCredentials,
) -> ProviderResult<Arc<dyn StorageProvider>> {
    match config {
        #[cfg(feature = "s3-native")]
        ProviderConfig::S3 {
            region,
            endpoint,
            force_path_style,
        } => {
            let provider = S3Provider::connect(
                s3::S3Settings {
                    region: region.clone(),
                    endpoint: endpoint.clone(),
                    force_path_style: *force_path_style,
                },
                credentials,
            )
            .await?;
            Ok(Arc::new(provider))
        }

        #[cfg(feature = "azure-native")]
        ProviderConfig::Azure { account, endpoint } => {
            let provider = ObjectStoreProvider::azure(account, endpoint.clone(), credentials)?;
            Ok(Arc::new(provider))
        }

        #[cfg(feature = "gcs-native")]
        ProviderConfig::Gcs { endpoint } => {
            let provider = ObjectStoreProvider::gcs(endpoint.clone(), credentials)?;
            Ok(Arc::new(provider))
        }

        ProviderConfig::Memory => {
            let token = credentials
                .require(keys::MEMORY_TOKEN)
                .map_err(|e| ProviderError::missing_credential("memory", &e.0))?;
            Ok(Arc::new(MemoryProvider::new(token)))
        }

        #[allow(unreachable_patterns)]
        other => Err(ProviderError::new(
            "config",
            format!("provider {:?} is not compiled into this build", other),
        )
        .with_hint(ErrorKind::Malformed)),
    }
}
