//! Uploads: single put or multipart, with abort on failure

use bytes::Bytes;
use futures::stream::{self, StreamExt, TryStreamExt};
use std::io;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{StorageClient, TransferSummary};
use crate::crypto;
use crate::error::{Cause, ErrorKind, Operation, StorageError, StorageResult};
use crate::metadata::ObjectMetadata;
use crate::provider::CompletedPart;
use crate::retry::RetryState;
use crate::source::{FileBackedStream, InputStream, Payload, UploadSource};

/// A request to store one object
///
/// Exactly one source must be set: `src_file` when `upload_from_stream` is
/// false, otherwise one of `input_stream` or `spill_stream`.
pub struct UploadRequest {
    /// Command text the session layer issued, used in errors and logs
    pub command: String,

    /// Parts in flight at once; must be at least 1
    pub parallelism: usize,

    pub upload_from_stream: bool,

    /// Bucket or container
    pub location: String,

    pub src_file: Option<PathBuf>,

    pub dest_key: String,

    pub input_stream: Option<InputStream>,

    pub spill_stream: Option<FileBackedStream>,

    /// Metadata stored with the object; encryption entries are filled in
    pub metadata: ObjectMetadata,

    pub region: Option<String>,

    pub cancel: CancellationToken,
}

impl std::fmt::Debug for UploadRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadRequest")
            .field("command", &self.command)
            .field("parallelism", &self.parallelism)
            .field("upload_from_stream", &self.upload_from_stream)
            .field("location", &self.location)
            .field("src_file", &self.src_file)
            .field("dest_key", &self.dest_key)
            .field("input_stream", &self.input_stream.is_some())
            .field("spill_stream", &self.spill_stream)
            .finish()
    }
}

impl UploadRequest {
    fn empty(command: String, location: String, dest_key: String) -> Self {
        Self {
            command,
            parallelism: 1,
            upload_from_stream: false,
            location,
            src_file: None,
            dest_key,
            input_stream: None,
            spill_stream: None,
            metadata: ObjectMetadata::new(),
            region: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Upload a local file
    pub fn from_file(
        command: impl Into<String>,
        location: impl Into<String>,
        dest_key: impl Into<String>,
        src_file: impl Into<PathBuf>,
    ) -> Self {
        let mut request = Self::empty(command.into(), location.into(), dest_key.into());
        request.src_file = Some(src_file.into());
        request
    }

    /// Upload whatever `stream` yields until EOF
    pub fn from_stream(
        command: impl Into<String>,
        location: impl Into<String>,
        dest_key: impl Into<String>,
        stream: InputStream,
    ) -> Self {
        let mut request = Self::empty(command.into(), location.into(), dest_key.into());
        request.upload_from_stream = true;
        request.input_stream = Some(stream);
        request
    }

    /// Upload the contents of a filled spill stream
    pub fn from_spill(
        command: impl Into<String>,
        location: impl Into<String>,
        dest_key: impl Into<String>,
        spill: FileBackedStream,
    ) -> Self {
        let mut request = Self::empty(command.into(), location.into(), dest_key.into());
        request.upload_from_stream = true;
        request.spill_stream = Some(spill);
        request
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    pub fn with_metadata(mut self, metadata: ObjectMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// One planned multipart part
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PartPlan {
    pub number: u32,
    pub offset: u64,
    pub len: usize,
}

/// Split `len` bytes into 1-based parts of at most `part_size`
pub(crate) fn plan_parts(len: u64, part_size: usize) -> Vec<PartPlan> {
    let part_size = part_size.max(1) as u64;
    let mut parts = Vec::new();
    let mut offset = 0;
    let mut number = 1;
    while offset < len {
        let size = part_size.min(len - offset);
        parts.push(PartPlan {
            number,
            offset,
            len: size as usize,
        });
        offset += size;
        number += 1;
    }
    parts
}

fn source_error(op: Operation, command: &str, err: io::Error) -> StorageError {
    let kind = match err.kind() {
        io::ErrorKind::NotFound | io::ErrorKind::InvalidInput => ErrorKind::Malformed,
        _ => ErrorKind::Fatal,
    };
    StorageError::new(kind, op, command, 0, Cause::Io(err))
}

/// Uploads in flight, tracked so a failure can abort them
struct MultipartUpload<'a> {
    location: &'a str,
    key: &'a str,
    upload_id: String,
}

impl StorageClient {
    /// Upload one object
    ///
    /// The payload is encrypted first when the client carries a key. Payloads
    /// above the multipart threshold go up as parts on providers that support
    /// it; a failed or cancelled multipart upload is aborted before the error
    /// surfaces.
    ///
    /// # Errors
    ///
    /// `Malformed` for a bad request or unreadable source, `Cancelled`,
    /// `Closed`, or `Fatal` for everything else.
    #[tracing::instrument(
        skip(self, request),
        fields(
            otel.kind = "client",
            provider = %self.provider_kind(),
            session = self.session_id(),
            location = %request.location,
            key = %request.dest_key,
            parallelism = request.parallelism
        )
    )]
    pub async fn upload(&self, request: UploadRequest) -> StorageResult<TransferSummary> {
        let op = Operation::Upload;
        let UploadRequest {
            command,
            parallelism,
            upload_from_stream,
            location,
            src_file,
            dest_key,
            input_stream,
            spill_stream,
            metadata,
            region,
            cancel,
        } = request;
        let command = command.as_str();

        self.ensure_open(op, command)?;
        if parallelism == 0 {
            return Err(StorageError::malformed(op, command, "parallelism must be at least 1"));
        }
        if location.is_empty() || dest_key.is_empty() {
            return Err(StorageError::malformed(
                op,
                command,
                "remote location and destination key are required",
            ));
        }
        if let Some(region) = &region {
            debug!(region = %region, "Stage region");
        }

        let source = UploadSource::resolve(upload_from_stream, src_file, input_stream, spill_stream)
            .map_err(|msg| StorageError::malformed(op, command, msg))?;
        debug!(source = ?source, "Resolved upload source");

        let payload = source
            .into_payload(self.transfer.spill_threshold)
            .await
            .map_err(|e| source_error(op, command, e))?;

        let (payload, metadata) = self.prepare(payload, metadata, command).await?;
        let len = payload.len();

        let multipart = self.snapshot().provider.capabilities().multipart_for(&metadata)
            && len > self.transfer.multipart_threshold as u64;

        let mut total = RetryState::new();
        let parts = if multipart {
            self.upload_multipart(
                command,
                &location,
                &dest_key,
                &payload,
                &metadata,
                parallelism,
                &cancel,
                &mut total,
            )
            .await?
        } else {
            let data = payload
                .read_all()
                .await
                .map_err(|e| source_error(op, command, e))?;
            let (location, key, metadata) = (location.as_str(), dest_key.as_str(), &metadata);
            self.run_with_retry(op, command, &cancel, &mut total, move |p| {
                let data = data.clone();
                async move { p.put_object(location, key, data, metadata).await }
            })
            .await?;
            1
        };

        info!(
            bytes = len,
            parts,
            multipart,
            encrypted = metadata.is_encrypted(),
            attempts = total.attempts,
            "Upload complete"
        );
        Ok(TransferSummary::new(len, parts, &total))
    }

    /// Encrypt the payload when configured and fix up the metadata
    async fn prepare(
        &self,
        payload: Payload,
        mut metadata: ObjectMetadata,
        command: &str,
    ) -> StorageResult<(Payload, ObjectMetadata)> {
        let op = Operation::Upload;
        let payload = match &self.encryption {
            Some(material) => {
                let plaintext = payload
                    .read_all()
                    .await
                    .map_err(|e| source_error(op, command, e))?;
                let (ciphertext, encryption) = crypto::encrypt(material, &plaintext)
                    .map_err(|e| StorageError::new(ErrorKind::Fatal, op, command, 0, e))?;
                debug!(
                    plaintext = plaintext.len(),
                    ciphertext = ciphertext.len(),
                    key_size = encryption.key_size(),
                    "Encrypted payload"
                );
                metadata.encryption = Some(encryption);
                Payload::Memory(Bytes::from(ciphertext))
            }
            None => {
                metadata.encryption = None;
                payload
            }
        };
        metadata.content_length = payload.len();
        Ok((payload, metadata))
    }

    /// Create, upload parts, complete; abort on any failure
    #[allow(clippy::too_many_arguments)]
    async fn upload_multipart(
        &self,
        command: &str,
        location: &str,
        key: &str,
        payload: &Payload,
        metadata: &ObjectMetadata,
        parallelism: usize,
        cancel: &CancellationToken,
        total: &mut RetryState,
    ) -> StorageResult<usize> {
        let op = Operation::Upload;
        // Shutdown waits for this guard, so the abort below reaches the provider
        let _inflight = self.uploads.read().await;
        self.ensure_open(op, command)?;

        let mut state = RetryState::new();
        let upload_id = self
            .run_with_retry(op, command, cancel, &mut state, move |p| async move {
                p.create_multipart(location, key, metadata).await
            })
            .await?;
        total.absorb(&state);

        let upload = MultipartUpload {
            location,
            key,
            upload_id,
        };
        let plan = plan_parts(payload.len(), self.transfer.part_size);
        let count = plan.len();
        debug!(upload_id = %upload.upload_id, parts = count, "Started multipart upload");

        match self
            .upload_parts(command, &upload, payload, plan, parallelism, cancel, total)
            .await
        {
            Ok(()) => Ok(count),
            Err(err) => {
                self.abort(command, &upload).await;
                Err(err.with_attempts(total.attempts))
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn upload_parts(
        &self,
        command: &str,
        upload: &MultipartUpload<'_>,
        payload: &Payload,
        plan: Vec<PartPlan>,
        parallelism: usize,
        cancel: &CancellationToken,
        total: &mut RetryState,
    ) -> StorageResult<()> {
        let op = Operation::Upload;
        let results: Vec<(CompletedPart, RetryState)> = stream::iter(
            plan.into_iter()
                .map(|part| self.upload_one_part(command, upload, payload, part, cancel)),
        )
        .buffer_unordered(parallelism)
        .try_collect()
        .await?;

        let mut completed = Vec::with_capacity(results.len());
        for (part, state) in results {
            total.absorb(&state);
            completed.push(part);
        }
        completed.sort_by_key(|part| part.part_number);

        let (location, key, upload_id) = (upload.location, upload.key, upload.upload_id.as_str());
        let completed = &completed;
        let mut state = RetryState::new();
        let result = self
            .run_with_retry(op, command, cancel, &mut state, move |p| async move {
                p.complete_multipart(location, key, upload_id, completed).await
            })
            .await;
        total.absorb(&state);
        result
    }

    async fn upload_one_part(
        &self,
        command: &str,
        upload: &MultipartUpload<'_>,
        payload: &Payload,
        part: PartPlan,
        cancel: &CancellationToken,
    ) -> StorageResult<(CompletedPart, RetryState)> {
        let op = Operation::Upload;
        let data = payload
            .read_range(part.offset, part.len)
            .await
            .map_err(|e| StorageError::new(ErrorKind::Fatal, op, command, 0, Cause::Io(e)))?;

        let (location, key, upload_id) = (upload.location, upload.key, upload.upload_id.as_str());
        let mut state = RetryState::new();
        let completed = self
            .run_with_retry(op, command, cancel, &mut state, move |p| {
                let data = data.clone();
                async move {
                    p.upload_part(location, key, upload_id, part.number, data)
                        .await
                }
            })
            .await?;
        debug!(part = part.number, attempts = state.attempts, "Uploaded part");
        Ok((completed, state))
    }

    /// Best-effort abort; runs even when the caller cancelled or the client closed
    async fn abort(&self, command: &str, upload: &MultipartUpload<'_>) {
        let (location, key, upload_id) = (upload.location, upload.key, upload.upload_id.as_str());
        let mut state = RetryState::new();
        let result = self
            .run_cleanup_with_retry(Operation::Upload, command, &mut state, move |p| async move {
                p.abort_multipart(location, key, upload_id).await
            })
            .await;
        match result {
            Ok(()) => warn!(upload_id, "Aborted multipart upload"),
            Err(e) => warn!(upload_id, error = %e, "Failed to abort multipart upload"),
        }
    }
}
