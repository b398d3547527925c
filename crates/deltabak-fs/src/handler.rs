use std::pin::Pin;

use tokio::io::AsyncRead;

use crate::{FsError, Result};

pub type BoxedAsyncRead = Pin<Box<dyn AsyncRead + Send>>;
pub type BoxedFile = Box<dyn FileHandle>;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OpenMode {
    Read,
    ReadWrite,
}

/// Options for [`Handler::list`].
#[derive(Clone, Copy, Default)]
pub struct ListOptions<'a> {
    /// Keep only entries whose name matches.
    pub filter: Option<&'a (dyn Fn(&str) -> bool + Send + Sync)>,
    /// Return `dir/name` instead of bare names.
    pub prepend_dir: bool,
}

impl<'a> ListOptions<'a> {
    pub fn prepend_dir() -> Self {
        Self {
            filter: None,
            prepend_dir: true,
        }
    }

    pub fn with_filter(mut self, filter: &'a (dyn Fn(&str) -> bool + Send + Sync)) -> Self {
        self.filter = Some(filter);
        self
    }
}

/// Random-access view of a single file.
///
/// Reads past the end of the file fail with [`FsError::OutOfBounds`]; writes past the end grow
/// the file.
#[async_trait::async_trait]
pub trait FileHandle: Send {
    async fn len(&mut self) -> Result<u64>;

    async fn set_len(&mut self, len: u64) -> Result<()>;

    async fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;

    async fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Make every previous write durable.
    async fn sync_all(&mut self) -> Result<()>;
}

#[async_trait::async_trait]
impl<F: FileHandle + ?Sized> FileHandle for Box<F> {
    async fn len(&mut self) -> Result<u64> {
        (**self).len().await
    }

    async fn set_len(&mut self, len: u64) -> Result<()> {
        (**self).set_len(len).await
    }

    async fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read_at(offset, buf).await
    }

    async fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        (**self).write_at(offset, buf).await
    }

    async fn sync_all(&mut self) -> Result<()> {
        (**self).sync_all().await
    }
}

/// Remote storage abstraction consumed by the VHD engine.
///
/// Implementations must report missing paths as [`FsError::NotFound`] from every operation.
#[async_trait::async_trait]
pub trait Handler: Send + Sync {
    /// List the entries of `dir`, sorted by name.
    async fn list(&self, dir: &str, options: ListOptions<'_>) -> Result<Vec<String>>;

    async fn read_file(&self, path: &str) -> Result<Vec<u8>>;

    /// Create or replace `path`, creating missing parent directories.
    async fn output_file(&self, path: &str, data: &[u8]) -> Result<()>;

    async fn unlink(&self, path: &str) -> Result<()>;

    /// Move `from` to `to`, replacing `to` if it exists.
    async fn rename(&self, from: &str, to: &str) -> Result<()>;

    async fn get_size(&self, path: &str) -> Result<u64>;

    async fn mkdir_all(&self, dir: &str) -> Result<()>;

    /// Open an existing file for random access. [`OpenMode::ReadWrite`] creates the file when it
    /// does not exist.
    async fn open_file(&self, path: &str, mode: OpenMode) -> Result<BoxedFile>;

    /// Stream the content of `path` starting at byte `start`.
    async fn create_read_stream(&self, path: &str, start: u64) -> Result<BoxedAsyncRead>;

    /// [`Handler::unlink`] that treats a missing path as success. Returns whether a file was
    /// removed.
    async fn unlink_if_exists(&self, path: &str) -> Result<bool> {
        match self.unlink(path).await {
            Ok(()) => Ok(true),
            Err(FsError::NotFound { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        match self.get_size(path).await {
            Ok(_) => Ok(true),
            Err(FsError::NotFound { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }
}

pub(crate) fn check_read_range(offset: u64, len: usize, size: u64) -> Result<()> {
    let end = offset
        .checked_add(len as u64)
        .ok_or(FsError::OffsetOverflow)?;
    if end > size {
        return Err(FsError::OutOfBounds { offset, len, size });
    }
    Ok(())
}
