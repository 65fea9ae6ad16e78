//! Local byte sources and upload targets

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};

/// Random-access byte source of known, stable length
#[async_trait]
pub trait ByteSource: Send + Sync {
    /// Total length in bytes
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stable identifier a resume record is bound to
    fn identity(&self) -> &str;

    /// Read up to `buf.len()` bytes at absolute `offset`.
    ///
    /// Returns fewer bytes only when the end of the source is reached.
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;
}

/// A file on the local disk
///
/// Each read opens the file, seeks and reads, so no handle is held between
/// chunks and concurrent readers never share a cursor.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
    identity: String,
    len: u64,
}

impl FileSource {
    /// Open `path`, capturing its canonical location and current length
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let metadata = tokio::fs::metadata(path).await?;
        if !metadata.is_file() {
            return Err(Error::InvalidInput(format!(
                "Not a regular file: {}",
                path.display()
            )));
        }
        let canonical = tokio::fs::canonicalize(path).await?;
        Ok(Self {
            identity: canonical.to_string_lossy().into_owned(),
            path: canonical,
            len: metadata.len(),
        })
    }

    /// Same as [`FileSource::open`], for blocking threads such as a directory walk
    pub fn open_blocking(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let metadata = std::fs::metadata(path)?;
        if !metadata.is_file() {
            return Err(Error::InvalidInput(format!(
                "Not a regular file: {}",
                path.display()
            )));
        }
        let canonical = std::fs::canonicalize(path)?;
        Ok(Self {
            identity: canonical.to_string_lossy().into_owned(),
            path: canonical,
            len: metadata.len(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ByteSource for FileSource {
    fn len(&self) -> u64 {
        self.len
    }

    fn identity(&self) -> &str {
        &self.identity
    }

    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let mut file = File::open(&self.path).await?;
        file.seek(SeekFrom::Start(offset)).await?;

        let mut filled = 0;
        while filled < buf.len() {
            let n = file.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }
}

/// One file to upload: a byte source and its logical destination
#[derive(Clone)]
pub struct UploadTarget {
    pub source: Arc<dyn ByteSource>,
    /// `/`-separated logical path below the drive root
    pub destination: String,
}

impl UploadTarget {
    pub fn new(source: impl ByteSource + 'static, destination: impl Into<String>) -> Self {
        Self {
            source: Arc::new(source),
            destination: destination.into(),
        }
    }

    /// Identifier used in statistics and resume records
    pub fn identity(&self) -> &str {
        self.source.identity()
    }

    pub fn len(&self) -> u64 {
        self.source.len()
    }

    pub fn is_empty(&self) -> bool {
        self.source.is_empty()
    }
}

impl fmt::Debug for UploadTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadTarget")
            .field("source", &self.identity())
            .field("len", &self.len())
            .field("destination", &self.destination)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_file_source_read_at() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"0123456789").unwrap();

        let source = FileSource::open(file.path()).await.unwrap();
        assert_eq!(source.len(), 10);

        let mut buf = [0u8; 4];
        assert_eq!(source.read_at(3, &mut buf).await.unwrap(), 4);
        assert_eq!(&buf, b"3456");

        // short read at the end
        assert_eq!(source.read_at(8, &mut buf).await.unwrap(), 2);
        assert_eq!(&buf[..2], b"89");
    }

    #[tokio::test]
    async fn test_file_source_identity_is_canonical() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.bin");
        std::fs::write(&path, b"x").unwrap();

        let direct = FileSource::open(&path).await.unwrap();
        let dotted = FileSource::open(dir.path().join(".").join("a.bin")).await.unwrap();
        assert_eq!(direct.identity(), dotted.identity());
    }

    #[tokio::test]
    async fn test_file_source_rejects_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(FileSource::open(dir.path()).await.is_err());
    }
}
