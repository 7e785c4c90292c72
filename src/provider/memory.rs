//! In-memory storage provider
//!
//! Stores objects in a shared map so tests and local runs can exercise the
//! full client without a cloud account. Clones (including the ones
//! [`StorageProvider::renewed`] hands out) share one store, which lets a test
//! keep a handle for fault injection and inspection while the client owns
//! another.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::ops::Range;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::{Capabilities, CompletedPart, ListPage, ProviderKind, StorageProvider};
use crate::credentials::{keys, StageCredentials};
use crate::error::{ProviderError, ProviderResult};
use crate::metadata::{ObjectMetadata, ObjectSummary};

const PROVIDER: &str = "memory";
const DEFAULT_PAGE_SIZE: usize = 1000;

/// A primitive that faults can be attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    ListPage,
    Head,
    GetRange,
    PutObject,
    CreateMultipart,
    /// A specific 1-based part number
    UploadPart(u32),
    CompleteMultipart,
    AbortMultipart,
}

/// Failure returned by an injected fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// `SlowDown`, HTTP 503
    Throttled,
    /// Connection reset, no code or status
    Transient,
    /// `ExpiredToken`, HTTP 400
    ExpiredToken,
    /// `AccessDenied`, HTTP 403
    Fatal,
    /// `NoSuchKey`, HTTP 404
    NotFound,
}

impl Fault {
    fn to_error(self, point: FaultPoint) -> ProviderError {
        let message = format!("injected fault at {:?}", point);
        match self {
            Fault::Throttled => ProviderError::new(PROVIDER, format!("{message}: slow down"))
                .with_code("SlowDown")
                .with_status(503),
            Fault::Transient => {
                ProviderError::new(PROVIDER, format!("{message}: connection reset by peer"))
            }
            Fault::ExpiredToken => ProviderError::new(PROVIDER, message)
                .with_code("ExpiredToken")
                .with_status(400),
            Fault::Fatal => ProviderError::new(PROVIDER, message)
                .with_code("AccessDenied")
                .with_status(403),
            Fault::NotFound => ProviderError::new(PROVIDER, message)
                .with_code("NoSuchKey")
                .with_status(404),
        }
    }
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    metadata: ObjectMetadata,
    etag: String,
    last_modified: DateTime<Utc>,
}

#[derive(Debug)]
struct PendingUpload {
    location: String,
    key: String,
    metadata: ObjectMetadata,
    parts: BTreeMap<u32, (String, Bytes)>,
}

#[derive(Debug)]
struct ArmedFault {
    point: FaultPoint,
    fault: Fault,
    remaining: u32,
}

#[derive(Debug)]
struct MemoryState {
    objects: BTreeMap<(String, String), StoredObject>,
    uploads: HashMap<String, PendingUpload>,
    revoked: HashSet<String>,
    faults: Vec<ArmedFault>,
    attempts: HashMap<FaultPoint, u32>,
    page_size: usize,
    latency: Duration,
    capabilities: Capabilities,
    next_upload_id: u64,
    next_etag: u64,
    renewals: u32,
    shutdowns: u32,
}

impl Default for MemoryState {
    fn default() -> Self {
        Self {
            objects: BTreeMap::new(),
            uploads: HashMap::new(),
            revoked: HashSet::new(),
            faults: Vec::new(),
            attempts: HashMap::new(),
            page_size: DEFAULT_PAGE_SIZE,
            latency: Duration::ZERO,
            capabilities: Capabilities::FULL,
            next_upload_id: 1,
            next_etag: 1,
            renewals: 0,
            shutdowns: 0,
        }
    }
}

/// In-memory provider with fault injection
///
/// # Example
///
/// ```
/// use cloud_stage::provider::{Fault, FaultPoint, MemoryProvider};
///
/// let provider = MemoryProvider::new("token-1");
/// provider.put_raw("bucket", "a.csv", b"1,2,3".to_vec());
/// // First two heads are throttled, the third succeeds
/// provider.inject(FaultPoint::Head, Fault::Throttled, 2);
/// ```
#[derive(Clone)]
pub struct MemoryProvider {
    state: Arc<Mutex<MemoryState>>,
    token: String,
}

impl fmt::Debug for MemoryProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryProvider")
            .field("token", &"[REDACTED]")
            .finish()
    }
}

impl MemoryProvider {
    /// Create an empty store whose requests carry `token`
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            token: token.into(),
        }
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Token this handle authenticates with
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Maximum summaries per listing page
    pub fn set_page_size(&self, page_size: usize) {
        self.state().page_size = page_size.max(1);
    }

    /// Delay applied to every primitive
    pub fn set_latency(&self, latency: Duration) {
        self.state().latency = latency;
    }

    pub fn set_capabilities(&self, capabilities: Capabilities) {
        self.state().capabilities = capabilities;
    }

    /// Fail the next `times` calls of `point` with `fault`
    pub fn inject(&self, point: FaultPoint, fault: Fault, times: u32) {
        self.state().faults.push(ArmedFault {
            point,
            fault,
            remaining: times,
        });
    }

    /// Fail every call of `point` with `fault`
    pub fn inject_always(&self, point: FaultPoint, fault: Fault) {
        self.inject(point, fault, u32::MAX);
    }

    pub fn clear_faults(&self) {
        self.state().faults.clear();
    }

    /// Treat `token` as expired from now on
    pub fn revoke_token(&self, token: &str) {
        self.state().revoked.insert(token.to_string());
    }

    /// Calls made to `point` so far, faulted ones included
    pub fn attempts(&self, point: FaultPoint) -> u32 {
        self.state().attempts.get(&point).copied().unwrap_or(0)
    }

    /// Calls made to every upload part
    pub fn part_attempts(&self) -> u32 {
        self.state()
            .attempts
            .iter()
            .filter(|(point, _)| matches!(point, FaultPoint::UploadPart(_)))
            .map(|(_, count)| *count)
            .sum()
    }

    /// Replacement providers built through `renewed`
    pub fn renewals(&self) -> u32 {
        self.state().renewals
    }

    /// Times `shutdown` ran on any handle of this store
    pub fn shutdown_count(&self) -> u32 {
        self.state().shutdowns
    }

    /// Multipart uploads created and neither completed nor aborted
    pub fn pending_uploads(&self) -> usize {
        self.state().uploads.len()
    }

    /// Store an object directly, bypassing faults and tokens
    pub fn put_raw(&self, location: &str, key: &str, data: impl Into<Bytes>) {
        self.put_raw_with_metadata(location, key, data, ObjectMetadata::new());
    }

    pub fn put_raw_with_metadata(
        &self,
        location: &str,
        key: &str,
        data: impl Into<Bytes>,
        metadata: ObjectMetadata,
    ) {
        let mut state = self.state();
        let etag = next_etag(&mut state);
        state.objects.insert(
            (location.to_string(), key.to_string()),
            StoredObject {
                data: data.into(),
                metadata,
                etag,
                last_modified: Utc::now(),
            },
        );
    }

    /// Stored bytes of an object
    pub fn object(&self, location: &str, key: &str) -> Option<Bytes> {
        self.state()
            .objects
            .get(&(location.to_string(), key.to_string()))
            .map(|o| o.data.clone())
    }

    /// Stored metadata of an object
    pub fn object_metadata(&self, location: &str, key: &str) -> Option<ObjectMetadata> {
        self.state()
            .objects
            .get(&(location.to_string(), key.to_string()))
            .map(|o| o.metadata.clone())
    }

    /// Count the call, then fail it if the token is revoked or a fault is armed
    async fn enter(&self, point: FaultPoint) -> ProviderResult<()> {
        let latency = {
            let mut state = self.state();
            *state.attempts.entry(point).or_insert(0) += 1;
            state.latency
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state();
        if state.revoked.contains(&self.token) {
            return Err(ProviderError::new(PROVIDER, "the provided token has expired")
                .with_code("ExpiredToken")
                .with_status(400));
        }
        if let Some(index) = state.faults.iter().position(|f| f.point == point) {
            let armed = &mut state.faults[index];
            let fault = armed.fault;
            armed.remaining = armed.remaining.saturating_sub(1);
            if armed.remaining == 0 {
                state.faults.remove(index);
            }
            return Err(fault.to_error(point));
        }
        Ok(())
    }
}

fn next_etag(state: &mut MemoryState) -> String {
    let etag = format!("\"{:08x}\"", state.next_etag);
    state.next_etag += 1;
    etag
}

fn not_found(location: &str, key: &str) -> ProviderError {
    ProviderError::new(PROVIDER, format!("{location}/{key} does not exist"))
        .with_code("NoSuchKey")
        .with_status(404)
}

fn no_such_upload(upload_id: &str) -> ProviderError {
    ProviderError::new(PROVIDER, format!("upload {upload_id} does not exist"))
        .with_code("NoSuchUpload")
        .with_status(404)
}

#[async_trait]
impl StorageProvider for MemoryProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Memory
    }

    fn capabilities(&self) -> Capabilities {
        self.state().capabilities
    }

    async fn renewed(
        &self,
        credentials: &StageCredentials,
    ) -> ProviderResult<Arc<dyn StorageProvider>> {
        let token = credentials
            .require(keys::MEMORY_TOKEN)
            .map_err(|e| ProviderError::missing_credential(PROVIDER, &e.0))?;
        self.state().renewals += 1;
        Ok(Arc::new(MemoryProvider {
            state: Arc::clone(&self.state),
            token: token.to_string(),
        }))
    }

    async fn list_page(
        &self,
        location: &str,
        prefix: &str,
        token: Option<&str>,
    ) -> ProviderResult<ListPage> {
        self.enter(FaultPoint::ListPage).await?;
        let state = self.state();

        let mut matching = state
            .objects
            .iter()
            .filter(|((loc, key), _)| loc == location && key.starts_with(prefix))
            .filter(|((_, key), _)| token.map_or(true, |t| key.as_str() > t));

        let mut summaries = Vec::new();
        for ((loc, key), object) in matching.by_ref().take(state.page_size) {
            summaries.push(ObjectSummary {
                location: loc.clone(),
                key: key.clone(),
                size: object.data.len() as u64,
                last_modified: Some(object.last_modified),
                etag: Some(object.etag.clone()),
            });
        }
        let next_token = match matching.next() {
            Some(_) => summaries.last().map(|s| s.key.clone()),
            None => None,
        };
        Ok(ListPage {
            summaries,
            next_token,
        })
    }

    async fn head_object(&self, location: &str, key: &str) -> ProviderResult<ObjectMetadata> {
        self.enter(FaultPoint::Head).await?;
        let state = self.state();
        let object = state
            .objects
            .get(&(location.to_string(), key.to_string()))
            .ok_or_else(|| not_found(location, key))?;

        let mut metadata = object.metadata.clone();
        metadata.content_length = object.data.len() as u64;
        metadata.etag = Some(object.etag.clone());
        metadata.last_modified = Some(object.last_modified);
        Ok(metadata)
    }

    async fn get_range(
        &self,
        location: &str,
        key: &str,
        range: Option<Range<u64>>,
    ) -> ProviderResult<Bytes> {
        self.enter(FaultPoint::GetRange).await?;
        let state = self.state();
        let object = state
            .objects
            .get(&(location.to_string(), key.to_string()))
            .ok_or_else(|| not_found(location, key))?;

        let len = object.data.len() as u64;
        match range {
            None => Ok(object.data.clone()),
            Some(range) if range.start < range.end && range.start < len => {
                let end = range.end.min(len);
                Ok(object.data.slice(range.start as usize..end as usize))
            }
            Some(range) => Err(ProviderError::new(
                PROVIDER,
                format!("range {}..{} not satisfiable for {} bytes", range.start, range.end, len),
            )
            .with_code("InvalidRange")
            .with_status(416)),
        }
    }

    async fn put_object(
        &self,
        location: &str,
        key: &str,
        data: Bytes,
        metadata: &ObjectMetadata,
    ) -> ProviderResult<()> {
        self.enter(FaultPoint::PutObject).await?;
        let mut state = self.state();
        let etag = next_etag(&mut state);
        state.objects.insert(
            (location.to_string(), key.to_string()),
            StoredObject {
                data,
                metadata: metadata.clone(),
                etag,
                last_modified: Utc::now(),
            },
        );
        Ok(())
    }

    async fn create_multipart(
        &self,
        location: &str,
        key: &str,
        metadata: &ObjectMetadata,
    ) -> ProviderResult<String> {
        self.enter(FaultPoint::CreateMultipart).await?;
        let mut state = self.state();
        if !state.capabilities.multipart {
            return Err(ProviderError::unsupported(PROVIDER, "create_multipart"));
        }
        let upload_id = format!("upload-{}", state.next_upload_id);
        state.next_upload_id += 1;
        state.uploads.insert(
            upload_id.clone(),
            PendingUpload {
                location: location.to_string(),
                key: key.to_string(),
                metadata: metadata.clone(),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        _location: &str,
        _key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> ProviderResult<CompletedPart> {
        self.enter(FaultPoint::UploadPart(part_number)).await?;
        let mut state = self.state();
        let etag = next_etag(&mut state);
        let upload = state
            .uploads
            .get_mut(upload_id)
            .ok_or_else(|| no_such_upload(upload_id))?;
        upload.parts.insert(part_number, (etag.clone(), data));
        Ok(CompletedPart { part_number, etag })
    }

    async fn complete_multipart(
        &self,
        _location: &str,
        _key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> ProviderResult<()> {
        self.enter(FaultPoint::CompleteMultipart).await?;
        let mut state = self.state();
        let upload = state
            .uploads
            .remove(upload_id)
            .ok_or_else(|| no_such_upload(upload_id))?;

        let mut data = BytesMut::new();
        let mut previous = 0;
        for part in parts {
            let stored = upload.parts.get(&part.part_number);
            let valid = part.part_number > previous
                && stored.is_some_and(|(etag, _)| *etag == part.etag);
            if !valid {
                // Completion failed; the upload stays open for an abort
                let number = part.part_number;
                state.uploads.insert(upload_id.to_string(), upload);
                return Err(ProviderError::new(
                    PROVIDER,
                    format!("part {number} is missing, out of order or has a stale etag"),
                )
                .with_code("InvalidPart")
                .with_status(400));
            }
            if let Some((_, bytes)) = stored {
                data.extend_from_slice(bytes);
            }
            previous = part.part_number;
        }

        let etag = next_etag(&mut state);
        state.objects.insert(
            (upload.location, upload.key),
            StoredObject {
                data: data.freeze(),
                metadata: upload.metadata,
                etag,
                last_modified: Utc::now(),
            },
        );
        Ok(())
    }

    async fn abort_multipart(
        &self,
        _location: &str,
        _key: &str,
        upload_id: &str,
    ) -> ProviderResult<()> {
        self.enter(FaultPoint::AbortMultipart).await?;
        self.state()
            .uploads
            .remove(upload_id)
            .map(|_| ())
            .ok_or_else(|| no_such_upload(upload_id))
    }

    async fn shutdown(&self) {
        self.state().shutdowns += 1;
    }
}
