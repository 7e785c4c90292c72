//! Downloads: metadata first, then one whole-object fetch or ordered ranges

use bytes::Bytes;
use futures::stream::{self, StreamExt};
use std::io;
use std::ops::Range;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{StorageClient, TransferSummary};
use crate::crypto::{self, CryptoError};
use crate::error::{Cause, ErrorKind, Operation, StorageError, StorageResult};
use crate::metadata::ObjectMetadata;
use crate::retry::RetryState;

/// A request to fetch one remote object into a local directory
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    /// Command text the session layer issued, used in errors and logs
    pub command: String,

    pub local_dir: PathBuf,

    /// File name inside `local_dir`
    pub dest_file_name: String,

    /// Ranges in flight at once; must be at least 1
    pub parallelism: usize,

    /// Bucket or container
    pub location: String,

    pub key: String,

    /// Region the stage lives in, when known
    pub region: Option<String>,

    pub cancel: CancellationToken,
}

impl DownloadRequest {
    /// Download `location/key` into `local_dir`, named after the last key segment
    pub fn new(
        command: impl Into<String>,
        location: impl Into<String>,
        key: impl Into<String>,
        local_dir: impl Into<PathBuf>,
    ) -> Self {
        let key = key.into();
        let dest_file_name = key.rsplit('/').next().unwrap_or_default().to_string();
        Self {
            command: command.into(),
            local_dir: local_dir.into(),
            dest_file_name,
            parallelism: 1,
            location: location.into(),
            key,
            region: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_dest_file_name(mut self, name: impl Into<String>) -> Self {
        self.dest_file_name = name.into();
        self
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
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

    pub fn local_path(&self) -> PathBuf {
        self.local_dir.join(&self.dest_file_name)
    }

    fn validate(&self) -> Result<(), String> {
        if self.parallelism == 0 {
            return Err("parallelism must be at least 1".to_string());
        }
        if self.location.is_empty() || self.key.is_empty() {
            return Err("remote location and key are required".to_string());
        }
        let name = self.dest_file_name.as_str();
        if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
            return Err(format!("invalid destination file name '{}'", name));
        }
        Ok(())
    }
}

/// Split `len` bytes into contiguous ranges of at most `range_size`
pub(crate) fn plan_ranges(len: u64, range_size: u64) -> Vec<Range<u64>> {
    let range_size = range_size.max(1);
    let mut ranges = Vec::new();
    let mut start = 0;
    while start < len {
        let end = (start + range_size).min(len);
        ranges.push(start..end);
        start = end;
    }
    ranges
}

impl StorageClient {
    /// Download one object to `request.local_path()`
    ///
    /// Objects larger than the configured range size are fetched as ranges
    /// when `parallelism > 1` and the provider can serve them; bytes land in
    /// the file in remote order either way. A failed or cancelled download
    /// leaves whatever was at the destination untouched.
    ///
    /// # Errors
    ///
    /// `Malformed` for a bad request, `NotFound` for a missing object,
    /// `Cancelled`, `Closed`, or `Fatal` for everything else.
    #[tracing::instrument(
        skip(self, request),
        fields(
            otel.kind = "client",
            provider = %self.provider_kind(),
            session = self.session_id(),
            location = %request.location,
            key = %request.key,
            parallelism = request.parallelism
        )
    )]
    pub async fn download(&self, request: DownloadRequest) -> StorageResult<TransferSummary> {
        let op = Operation::Download;
        let command = request.command.as_str();
        self.ensure_open(op, command)?;
        request
            .validate()
            .map_err(|msg| StorageError::malformed(op, command, msg))?;
        match tokio::fs::metadata(&request.local_dir).await {
            Ok(meta) if meta.is_dir() => {}
            _ => {
                return Err(StorageError::malformed(
                    op,
                    command,
                    format!("{} is not a directory", request.local_dir.display()),
                ))
            }
        }
        if let Some(region) = &request.region {
            debug!(region = %region, "Stage region");
        }

        let mut total = RetryState::new();
        let mut state = RetryState::new();
        let location = request.location.as_str();
        let key = request.key.as_str();
        let metadata = self
            .run_with_retry(op, command, &request.cancel, &mut state, move |p| async move {
                p.head_object(location, key).await
            })
            .await?;
        total.absorb(&state);

        if self.is_encrypting() && metadata.encryption.is_none() {
            return Err(StorageError::new(
                ErrorKind::Fatal,
                op,
                command,
                total.attempts,
                CryptoError::MissingMetadata,
            ));
        }
        if !self.is_encrypting() && metadata.is_encrypted() {
            warn!("Object carries encryption metadata but the client has no key; storing ciphertext");
        }

        let path = request.local_path();
        // Bytes land in a sibling temp file that only replaces `path` on success
        let staging = tempfile::Builder::new()
            .prefix(&format!(".{}.", request.dest_file_name))
            .suffix(".part")
            .tempfile_in(&request.local_dir)
            .map_err(|e| {
                StorageError::new(ErrorKind::Fatal, op, command, total.attempts, Cause::Io(e))
            })?
            .into_temp_path();

        let parts = match self
            .fetch_to_file(&request, &metadata, &staging, &mut total)
            .await
        {
            Ok(parts) => parts,
            Err(err) => {
                debug!(staging = %staging.display(), "Discarding partial download");
                return Err(err.with_attempts(total.attempts));
            }
        };
        staging.persist(&path).map_err(|e| {
            StorageError::new(ErrorKind::Fatal, op, command, total.attempts, Cause::Io(e.error))
        })?;

        info!(
            path = %path.display(),
            bytes = metadata.content_length,
            parts,
            attempts = total.attempts,
            "Download complete"
        );
        Ok(TransferSummary::new(metadata.content_length, parts, &total))
    }

    /// Fetch the object and write it to `path`, returning the number of parts
    async fn fetch_to_file(
        &self,
        request: &DownloadRequest,
        metadata: &ObjectMetadata,
        path: &Path,
        total: &mut RetryState,
    ) -> StorageResult<usize> {
        let op = Operation::Download;
        let command = request.command.as_str();
        let len = metadata.content_length;
        let range_size = self.transfer.range_size as u64;
        let ranged = request.parallelism > 1
            && self.snapshot().provider.capabilities().ranged_get
            && len > range_size;

        let ranges: Vec<Option<Range<u64>>> = if ranged {
            plan_ranges(len, range_size).into_iter().map(Some).collect()
        } else {
            vec![None]
        };
        let parts = ranges.len();
        debug!(parts, ranged, "Planned download");

        let io_err = |e: io::Error, attempts: u32| {
            StorageError::new(ErrorKind::Fatal, op, command, attempts, Cause::Io(e))
        };

        let mut fetched = stream::iter(
            ranges
                .into_iter()
                .map(|range| self.fetch_range(request, range)),
        )
        .buffered(request.parallelism);

        if let Some(material) = &self.encryption {
            let mut ciphertext = Vec::with_capacity(len as usize);
            while let Some(chunk) = fetched.next().await {
                let (bytes, state) = chunk?;
                total.absorb(&state);
                ciphertext.extend_from_slice(&bytes);
            }
            check_length(ciphertext.len() as u64, len).map_err(|msg| {
                StorageError::new(ErrorKind::Fatal, op, command, total.attempts, Cause::Message(msg))
            })?;

            let plaintext = metadata
                .encryption
                .as_ref()
                .ok_or(CryptoError::MissingMetadata)
                .and_then(|enc| crypto::decrypt(material, enc, &ciphertext))
                .map_err(|e| StorageError::new(ErrorKind::Fatal, op, command, total.attempts, e))?;
            tokio::fs::write(path, &plaintext)
                .await
                .map_err(|e| io_err(e, total.attempts))?;
            return Ok(parts);
        }

        let mut file = tokio::fs::File::create(path)
            .await
            .map_err(|e| io_err(e, total.attempts))?;
        let mut written = 0u64;
        while let Some(chunk) = fetched.next().await {
            let (bytes, state) = chunk?;
            total.absorb(&state);
            file.write_all(&bytes)
                .await
                .map_err(|e| io_err(e, total.attempts))?;
            written += bytes.len() as u64;
        }
        file.flush().await.map_err(|e| io_err(e, total.attempts))?;
        check_length(written, len).map_err(|msg| {
            StorageError::new(ErrorKind::Fatal, op, command, total.attempts, Cause::Message(msg))
        })?;
        Ok(parts)
    }

    /// Fetch one range (or the whole object) under its own retry loop
    async fn fetch_range(
        &self,
        request: &DownloadRequest,
        range: Option<Range<u64>>,
    ) -> StorageResult<(Bytes, RetryState)> {
        let op = Operation::Download;
        let command = request.command.as_str();
        let location = request.location.as_str();
        let key = request.key.as_str();
        let mut state = RetryState::new();

        let bytes = self
            .run_with_retry(op, command, &request.cancel, &mut state, |p| {
                let range = range.clone();
                async move { p.get_range(location, key, range).await }
            })
            .await?;

        if let Some(range) = &range {
            let expected = range.end - range.start;
            check_length(bytes.len() as u64, expected).map_err(|msg| {
                StorageError::new(ErrorKind::Fatal, op, command, state.attempts, Cause::Message(msg))
            })?;
        }
        Ok((bytes, state))
    }
}

fn check_length(actual: u64, expected: u64) -> Result<(), String> {
    if actual == expected {
        Ok(())
    } else {
        Err(format!("received {} bytes, expected {}", actual, expected))
    }
}
