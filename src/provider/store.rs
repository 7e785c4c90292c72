//! Azure Blob Storage and Google Cloud Storage via `object_store`
//!
//! `object_store` builders are bound to one bucket or container, so stores are
//! built lazily per location and cached for the lifetime of the provider.
//! Renewal builds a fresh provider with an empty cache.
//!
//! Multipart uploads use [`MultipartStore`], which addresses parts by index so
//! a part can be retried, and an upload id stays valid across a credential
//! swap. Those calls cannot attach attributes, so objects carrying metadata
//! are stored with a single put instead.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use object_store::multipart::{MultipartStore, PartId};
use object_store::path::Path as ObjectPath;
use object_store::{
    Attribute, AttributeValue, Attributes, GetOptions, ObjectMeta, ObjectStore, PutOptions,
    PutPayload,
};
use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::ops::Range;
use std::sync::{Arc, Mutex, PoisonError};

use super::{Capabilities, CompletedPart, ListPage, ProviderKind, StorageProvider};
use crate::classify::status_in_message;
use crate::credentials::{keys, StageCredentials};
use crate::error::{ErrorKind, ProviderError, ProviderResult};
use crate::metadata::{ObjectMetadata, ObjectSummary};

const LIST_PAGE_SIZE: usize = 1000;

/// Error codes that show up in `object_store` error bodies
const KNOWN_CODES: &[&str] = &[
    "AuthenticationFailed",
    "InvalidAuthenticationInfo",
    "ExpiredToken",
    "BlobNotFound",
    "ContainerNotFound",
    "ServerBusy",
    "OperationTimedOut",
    "InternalError",
];

/// One bucket or container, seen through both store traits
#[derive(Clone)]
struct Stores {
    objects: Arc<dyn ObjectStore>,
    multipart: Arc<dyn MultipartStore>,
}

impl Stores {
    fn new<S: ObjectStore + MultipartStore>(store: S) -> Self {
        Self::shared(Arc::new(store))
    }

    fn shared<S: ObjectStore + MultipartStore>(store: Arc<S>) -> Self {
        Self {
            objects: Arc::clone(&store) as Arc<dyn ObjectStore>,
            multipart: store,
        }
    }
}

#[derive(Clone)]
enum Backend {
    #[cfg(feature = "azure-native")]
    Azure {
        account: String,
        endpoint: Option<String>,
        sas: Vec<(String, String)>,
    },

    #[cfg(feature = "gcs-native")]
    Gcs { token: String },

    /// A caller-supplied store serving every location
    Fixed(Stores),
}

/// Provider over an `object_store` backend
pub struct ObjectStoreProvider {
    kind: ProviderKind,
    backend: Backend,
    page_size: usize,
    stores: Mutex<HashMap<String, Stores>>,
}

impl fmt::Debug for ObjectStoreProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectStoreProvider")
            .field("kind", &self.kind)
            .field("page_size", &self.page_size)
            .finish()
    }
}

impl ObjectStoreProvider {
    fn with_backend(kind: ProviderKind, backend: Backend) -> Self {
        Self {
            kind,
            backend,
            page_size: LIST_PAGE_SIZE,
            stores: Mutex::new(HashMap::new()),
        }
    }

    /// Azure Blob Storage, authenticated with the stage SAS token
    #[cfg(feature = "azure-native")]
    pub fn azure(
        account: &str,
        endpoint: Option<String>,
        credentials: &StageCredentials,
    ) -> ProviderResult<Self> {
        let sas = credentials
            .require(keys::AZURE_SAS_TOKEN)
            .map_err(|e| ProviderError::missing_credential("azure", &e.0))?;
        let sas = parse_sas(sas);
        if sas.is_empty() {
            return Err(ProviderError::new("azure", "SAS token has no query pairs")
                .with_hint(ErrorKind::Malformed));
        }
        Ok(Self::with_backend(
            ProviderKind::Azure,
            Backend::Azure {
                account: account.to_string(),
                endpoint,
                sas,
            },
        ))
    }

    /// Google Cloud Storage, authenticated with the stage access token
    #[cfg(feature = "gcs-native")]
    pub fn gcs(endpoint: Option<String>, credentials: &StageCredentials) -> ProviderResult<Self> {
        if let Some(endpoint) = endpoint {
            return Err(ProviderError::new(
                "gcs",
                format!("custom GCS endpoint {} is not supported", endpoint),
            )
            .with_hint(ErrorKind::Malformed));
        }
        let token = credentials
            .require(keys::GCS_ACCESS_TOKEN)
            .map_err(|e| ProviderError::missing_credential("gcs", &e.0))?;
        Ok(Self::with_backend(
            ProviderKind::Gcs,
            Backend::Gcs {
                token: token.to_string(),
            },
        ))
    }

    /// Wrap an existing store; every location maps to it
    pub fn from_store<S: ObjectStore + MultipartStore>(kind: ProviderKind, store: Arc<S>) -> Self {
        Self::with_backend(kind, Backend::Fixed(Stores::shared(store)))
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn name(&self) -> &'static str {
        self.kind.as_str()
    }

    fn store(&self, location: &str) -> ProviderResult<Arc<dyn ObjectStore>> {
        Ok(self.stores_for(location)?.objects)
    }

    fn multipart_store(&self, location: &str) -> ProviderResult<Arc<dyn MultipartStore>> {
        Ok(self.stores_for(location)?.multipart)
    }

    fn stores_for(&self, location: &str) -> ProviderResult<Stores> {
        if let Backend::Fixed(stores) = &self.backend {
            return Ok(stores.clone());
        }

        let mut cache = self.stores.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(stores) = cache.get(location) {
            return Ok(stores.clone());
        }
        let stores = self.build_store(location)?;
        cache.insert(location.to_string(), stores.clone());
        Ok(stores)
    }

    fn build_store(&self, location: &str) -> ProviderResult<Stores> {
        let no_retry = object_store::RetryConfig {
            max_retries: 0,
            ..Default::default()
        };

        match &self.backend {
            #[cfg(feature = "azure-native")]
            Backend::Azure {
                account,
                endpoint,
                sas,
            } => {
                let mut builder = object_store::azure::MicrosoftAzureBuilder::new()
                    .with_account(account)
                    .with_container_name(location)
                    .with_sas_authorization(sas.clone())
                    .with_retry(no_retry);
                if let Some(endpoint) = endpoint {
                    builder = builder.with_endpoint(endpoint.clone());
                }
                let store = builder.build().map_err(|e| self.build_error(location, e))?;
                Ok(Stores::new(store))
            }

            #[cfg(feature = "gcs-native")]
            Backend::Gcs { token } => {
                let credential = object_store::gcp::GcpCredential {
                    bearer: token.clone(),
                };
                let store = object_store::gcp::GoogleCloudStorageBuilder::new()
                    .with_bucket_name(location)
                    .with_credentials(Arc::new(object_store::StaticCredentialProvider::new(
                        credential,
                    )))
                    .with_retry(no_retry)
                    .build()
                    .map_err(|e| self.build_error(location, e))?;
                Ok(Stores::new(store))
            }

            Backend::Fixed(stores) => Ok(stores.clone()),
        }
    }

    fn build_error(&self, location: &str, error: object_store::Error) -> ProviderError {
        ProviderError::new(
            self.name(),
            format!("failed to build client for {}: {}", location, error),
        )
        .with_hint(ErrorKind::Malformed)
        .with_source(error)
    }

    /// Convert an `object_store` failure, recovering status and code from its text
    fn store_error(&self, error: object_store::Error) -> ProviderError {
        let message = error.to_string();
        let mut converted = ProviderError::new(self.name(), message.clone());
        if let Some(status) = status_in_message(&message) {
            converted = converted.with_status(status);
        }
        if let Some(code) = KNOWN_CODES.iter().find(|code| message.contains(*code)) {
            converted = converted.with_code(*code);
        }

        let hint = match &error {
            object_store::Error::NotFound { .. } => Some(ErrorKind::NotFound),
            object_store::Error::NotSupported { .. } | object_store::Error::NotImplemented => {
                Some(ErrorKind::Fatal)
            }
            // An expired SAS token is reported as 403
            _ if self.kind == ProviderKind::Azure && converted.status == Some(403) => {
                Some(ErrorKind::ExpiredCredentials)
            }
            _ => None,
        };
        if let Some(hint) = hint {
            converted = converted.with_hint(hint);
        }
        converted.with_source(error)
    }
}

/// Split a SAS token into decoded query pairs
fn parse_sas(sas: &str) -> Vec<(String, String)> {
    url::form_urlencoded::parse(sas.trim().trim_start_matches('?').as_bytes())
        .into_owned()
        .filter(|(k, _)| !k.is_empty())
        .collect()
}

/// `object_store` part indices start at 0
fn part_index(provider: &'static str, part_number: u32) -> ProviderResult<usize> {
    match part_number.checked_sub(1) {
        Some(index) => Ok(index as usize),
        None => Err(ProviderError::new(provider, "part numbers start at 1")
            .with_hint(ErrorKind::Malformed)),
    }
}

fn to_summary(location: &str, meta: ObjectMeta) -> ObjectSummary {
    ObjectSummary {
        location: location.to_string(),
        key: meta.location.to_string(),
        size: meta.size as u64,
        last_modified: Some(meta.last_modified),
        etag: meta.e_tag,
    }
}

#[async_trait]
impl StorageProvider for ObjectStoreProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            ranged_get: true,
            multipart: true,
            multipart_metadata: false,
        }
    }

    async fn renewed(
        &self,
        credentials: &StageCredentials,
    ) -> ProviderResult<Arc<dyn StorageProvider>> {
        let renewed = match &self.backend {
            #[cfg(feature = "azure-native")]
            Backend::Azure {
                account, endpoint, ..
            } => Self::azure(account, endpoint.clone(), credentials)?,

            #[cfg(feature = "gcs-native")]
            Backend::Gcs { .. } => Self::gcs(None, credentials)?,

            Backend::Fixed(stores) => {
                let _ = credentials;
                Self::with_backend(self.kind, Backend::Fixed(stores.clone()))
            }
        };
        Ok(Arc::new(renewed.with_page_size(self.page_size)))
    }

    async fn list_page(
        &self,
        location: &str,
        prefix: &str,
        token: Option<&str>,
    ) -> ProviderResult<ListPage> {
        let store = self.store(location)?;

        // object_store prefixes match whole path segments; list the enclosing
        // directory and filter on the raw prefix
        let directory = prefix
            .rfind('/')
            .map(|i| &prefix[..i])
            .filter(|d| !d.is_empty())
            .map(ObjectPath::from);

        let stream = match token {
            Some(token) => store.list_with_offset(directory.as_ref(), &ObjectPath::from(token)),
            None => store.list(directory.as_ref()),
        };
        let mut metas: Vec<ObjectMeta> = stream
            .try_filter(|meta| futures::future::ready(meta.location.as_ref().starts_with(prefix)))
            .take(self.page_size + 1)
            .try_collect()
            .await
            .map_err(|e| self.store_error(e))?;

        let more = metas.len() > self.page_size;
        metas.truncate(self.page_size);
        let summaries: Vec<ObjectSummary> = metas
            .into_iter()
            .map(|meta| to_summary(location, meta))
            .collect();
        let next_token = if more {
            summaries.last().map(|s| s.key.clone())
        } else {
            None
        };
        Ok(ListPage {
            summaries,
            next_token,
        })
    }

    async fn head_object(&self, location: &str, key: &str) -> ProviderResult<ObjectMetadata> {
        let store = self.store(location)?;
        let options = GetOptions {
            head: true,
            ..Default::default()
        };
        let result = store
            .get_opts(&ObjectPath::from(key), options)
            .await
            .map_err(|e| self.store_error(e))?;

        let mut content_type = None;
        let mut content_encoding = None;
        let mut user = BTreeMap::new();
        for (attribute, value) in result.attributes.iter() {
            match attribute {
                Attribute::ContentType => content_type = Some(value.to_string()),
                Attribute::ContentEncoding => content_encoding = Some(value.to_string()),
                Attribute::Metadata(name) => {
                    user.insert(name.to_string(), value.to_string());
                }
                _ => {}
            }
        }
        let (user_metadata, encryption) = ObjectMetadata::split_user_metadata(user)
            .map_err(|e| ProviderError::new(self.name(), e).with_hint(ErrorKind::Fatal))?;

        Ok(ObjectMetadata {
            content_length: result.meta.size as u64,
            content_type,
            content_encoding,
            user_metadata,
            encryption,
            etag: result.meta.e_tag.clone(),
            last_modified: Some(result.meta.last_modified),
        })
    }

    async fn get_range(
        &self,
        location: &str,
        key: &str,
        range: Option<Range<u64>>,
    ) -> ProviderResult<Bytes> {
        let store = self.store(location)?;
        let path = ObjectPath::from(key);
        match range {
            Some(range) => store
                .get_range(&path, range.start as usize..range.end as usize)
                .await
                .map_err(|e| self.store_error(e)),
            None => {
                let result = store.get(&path).await.map_err(|e| self.store_error(e))?;
                result.bytes().await.map_err(|e| self.store_error(e))
            }
        }
    }

    async fn put_object(
        &self,
        location: &str,
        key: &str,
        data: Bytes,
        metadata: &ObjectMetadata,
    ) -> ProviderResult<()> {
        let store = self.store(location)?;

        let mut attributes = Attributes::new();
        if let Some(content_type) = &metadata.content_type {
            attributes.insert(Attribute::ContentType, content_type.clone().into());
        }
        if let Some(encoding) = &metadata.content_encoding {
            attributes.insert(Attribute::ContentEncoding, encoding.clone().into());
        }
        for (name, value) in metadata.blob_user_metadata() {
            attributes.insert(Attribute::Metadata(Cow::Owned(name)), AttributeValue::from(value));
        }
        let options = PutOptions {
            attributes,
            ..Default::default()
        };

        store
            .put_opts(&ObjectPath::from(key), PutPayload::from(data), options)
            .await
            .map_err(|e| self.store_error(e))?;
        Ok(())
    }

    async fn create_multipart(
        &self,
        location: &str,
        key: &str,
        metadata: &ObjectMetadata,
    ) -> ProviderResult<String> {
        if metadata.has_stored_fields() {
            return Err(ProviderError::new(
                self.name(),
                format!("multipart upload of {} cannot carry object metadata", key),
            )
            .with_hint(ErrorKind::Fatal));
        }
        self.multipart_store(location)?
            .create_multipart(&ObjectPath::from(key))
            .await
            .map_err(|e| self.store_error(e))
    }

    async fn upload_part(
        &self,
        location: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> ProviderResult<CompletedPart> {
        let index = part_index(self.name(), part_number)?;
        let part = self
            .multipart_store(location)?
            .put_part(
                &ObjectPath::from(key),
                &upload_id.to_string(),
                index,
                PutPayload::from(data),
            )
            .await
            .map_err(|e| self.store_error(e))?;
        Ok(CompletedPart {
            part_number,
            etag: part.content_id,
        })
    }

    async fn complete_multipart(
        &self,
        location: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> ProviderResult<()> {
        for (expected, part) in (1..).zip(parts) {
            if part.part_number != expected {
                return Err(ProviderError::new(
                    self.name(),
                    format!("part {} is missing from upload {}", expected, upload_id),
                )
                .with_hint(ErrorKind::Fatal));
            }
        }
        let ids = parts
            .iter()
            .map(|part| PartId {
                content_id: part.etag.clone(),
            })
            .collect();
        self.multipart_store(location)?
            .complete_multipart(&ObjectPath::from(key), &upload_id.to_string(), ids)
            .await
            .map_err(|e| self.store_error(e))?;
        Ok(())
    }

    async fn abort_multipart(
        &self,
        location: &str,
        key: &str,
        upload_id: &str,
    ) -> ProviderResult<()> {
        self.multipart_store(location)?
            .abort_multipart(&ObjectPath::from(key), &upload_id.to_string())
            .await
            .map_err(|e| self.store_error(e))
    }

    async fn shutdown(&self) {
        let mut stores = self.stores.lock().unwrap_or_else(PoisonError::into_inner);
        tracing::debug!(provider = self.name(), stores = stores.len(), "Dropping cached stores");
        stores.clear();
    }
}
