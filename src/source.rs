//! Upload sources and the payloads they resolve to
//!
//! An upload names its bytes in one of three ways: a local file, an arbitrary
//! async reader, or a [`FileBackedStream`] the caller filled beforehand. All
//! three end up as a [`Payload`] that parts can read ranges from concurrently.

use bytes::Bytes;
use std::fmt;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempPath;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Byte sink that keeps data in memory up to a threshold, then spills to a
/// temporary file
pub struct FileBackedStream {
    threshold: usize,
    memory: Vec<u8>,
    spill: Option<Spill>,
    len: u64,
}

struct Spill {
    file: tokio::fs::File,
    path: TempPath,
}

impl FileBackedStream {
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold,
            memory: Vec::new(),
            spill: None,
            len: 0,
        }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether the data has moved to a temporary file
    pub fn is_spilled(&self) -> bool {
        self.spill.is_some()
    }

    pub async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        if self.spill.is_none() && self.memory.len() + data.len() > self.threshold {
            self.spill_to_disk().await?;
        }
        match &mut self.spill {
            Some(spill) => spill.file.write_all(data).await?,
            None => self.memory.extend_from_slice(data),
        }
        self.len += data.len() as u64;
        Ok(())
    }

    /// Drain a reader into the stream, returning the number of bytes copied
    pub async fn fill_from<R>(&mut self, reader: &mut R) -> io::Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
        let mut copied = 0u64;
        loop {
            let n = reader.read(&mut buffer).await?;
            if n == 0 {
                break;
            }
            self.write_all(&buffer[..n]).await?;
            copied += n as u64;
        }
        Ok(copied)
    }

    async fn spill_to_disk(&mut self) -> io::Result<()> {
        let (file, path) = tempfile::NamedTempFile::new()?.into_parts();
        let mut file = tokio::fs::File::from_std(file);
        file.write_all(&self.memory).await?;
        self.memory = Vec::new();
        tracing::debug!(path = %path.display(), bytes = self.len, "Spilling stream to disk");
        self.spill = Some(Spill { file, path });
        Ok(())
    }

    /// Finish writing and expose the collected bytes as a payload
    pub async fn into_payload(self) -> io::Result<Payload> {
        match self.spill {
            Some(mut spill) => {
                spill.file.flush().await?;
                spill.file.sync_all().await?;
                Ok(Payload::File {
                    path: spill.path.to_path_buf(),
                    len: self.len,
                    temp: Some(Arc::new(spill.path)),
                })
            }
            None => Ok(Payload::Memory(Bytes::from(self.memory))),
        }
    }
}

impl fmt::Debug for FileBackedStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileBackedStream")
            .field("threshold", &self.threshold)
            .field("len", &self.len)
            .field("spilled", &self.is_spilled())
            .finish()
    }
}

/// Boxed reader accepted as an upload input stream
pub type InputStream = Box<dyn AsyncRead + Send + Unpin>;

/// Where an upload's bytes come from
pub enum UploadSource {
    File(PathBuf),
    Stream(InputStream),
    Spill(FileBackedStream),
}

impl fmt::Debug for UploadSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadSource::File(path) => f.debug_tuple("File").field(path).finish(),
            UploadSource::Stream(_) => f.write_str("Stream"),
            UploadSource::Spill(stream) => f.debug_tuple("Spill").field(stream).finish(),
        }
    }
}

impl UploadSource {
    /// Pick the single source an upload request names
    ///
    /// With `from_stream` unset exactly a file must be given; with it set,
    /// exactly one of the input stream or the spill stream, and no file.
    pub fn resolve(
        from_stream: bool,
        file: Option<PathBuf>,
        stream: Option<InputStream>,
        spill: Option<FileBackedStream>,
    ) -> Result<Self, String> {
        if !from_stream {
            if stream.is_some() || spill.is_some() {
                return Err("stream given for a file upload".to_string());
            }
            return file
                .map(UploadSource::File)
                .ok_or_else(|| "no source file given".to_string());
        }

        if file.is_some() {
            return Err("source file given for a stream upload".to_string());
        }
        match (stream, spill) {
            (Some(stream), None) => Ok(UploadSource::Stream(stream)),
            (None, Some(spill)) => Ok(UploadSource::Spill(spill)),
            (Some(_), Some(_)) => {
                Err("both an input stream and a spill stream were given".to_string())
            }
            (None, None) => Err("no input stream given".to_string()),
        }
    }

    /// Materialize the bytes; readers are drained through a spill stream
    pub async fn into_payload(self, spill_threshold: usize) -> io::Result<Payload> {
        match self {
            UploadSource::File(path) => Payload::from_file(&path).await,
            UploadSource::Stream(mut reader) => {
                let mut spill = FileBackedStream::new(spill_threshold);
                spill.fill_from(&mut reader).await?;
                spill.into_payload().await
            }
            UploadSource::Spill(spill) => spill.into_payload().await,
        }
    }
}

/// Bytes ready to upload, readable by range from several tasks at once
#[derive(Clone)]
pub enum Payload {
    Memory(Bytes),
    File {
        path: PathBuf,
        len: u64,
        /// Keeps a spilled temporary file alive until the last clone drops
        temp: Option<Arc<TempPath>>,
    },
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Memory(bytes) => f.debug_tuple("Memory").field(&bytes.len()).finish(),
            Payload::File { path, len, .. } => f
                .debug_struct("File")
                .field("path", path)
                .field("len", len)
                .finish(),
        }
    }
}

impl Payload {
    pub async fn from_file(path: &Path) -> io::Result<Self> {
        let metadata = tokio::fs::metadata(path).await?;
        if !metadata.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", path.display()),
            ));
        }
        Ok(Payload::File {
            path: path.to_path_buf(),
            len: metadata.len(),
            temp: None,
        })
    }

    pub fn len(&self) -> u64 {
        match self {
            Payload::Memory(bytes) => bytes.len() as u64,
            Payload::File { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read `len` bytes starting at `offset`
    pub async fn read_range(&self, offset: u64, len: usize) -> io::Result<Bytes> {
        let end = offset
            .checked_add(len as u64)
            .filter(|end| *end <= self.len())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("range {}+{} beyond payload of {} bytes", offset, len, self.len()),
                )
            })?;

        match self {
            Payload::Memory(bytes) => Ok(bytes.slice(offset as usize..end as usize)),
            Payload::File { path, .. } => {
                let mut file = tokio::fs::File::open(path).await?;
                file.seek(SeekFrom::Start(offset)).await?;
                let mut buffer = vec![0u8; len];
                file.read_exact(&mut buffer).await?;
                Ok(Bytes::from(buffer))
            }
        }
    }

    pub async fn read_all(&self) -> io::Result<Bytes> {
        match self {
            Payload::Memory(bytes) => Ok(bytes.clone()),
            Payload::File { path, .. } => Ok(Bytes::from(tokio::fs::read(path).await?)),
        }
    }
}
