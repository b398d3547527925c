use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::debug;

use crate::handler::check_read_range;
use crate::path::normalize;
use crate::{BoxedAsyncRead, BoxedFile, FileHandle, FsError, Handler, ListOptions, OpenMode, Result};

/// [`Handler`] backed by a host directory.
///
/// Handler paths are normalized before being joined to `root`, so `..` can never reach outside
/// of it.
#[derive(Debug, Clone)]
pub struct LocalHandler {
    root: PathBuf,
}

impl LocalHandler {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn host_path(&self, path: &str) -> PathBuf {
        let normalized = normalize(path);
        let relative = normalized.trim_start_matches('/');
        if relative.is_empty() {
            self.root.clone()
        } else {
            self.root.join(relative)
        }
    }
}

#[async_trait::async_trait]
impl Handler for LocalHandler {
    async fn list(&self, dir: &str, options: ListOptions<'_>) -> Result<Vec<String>> {
        let host = self.host_path(dir);
        let mut entries = fs::read_dir(&host)
            .await
            .map_err(|err| FsError::from_io(err, dir))?;

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(filter) = options.filter {
                if !filter(&name) {
                    continue;
                }
            }
            names.push(name);
        }
        names.sort();

        if options.prepend_dir {
            let dir = normalize(dir);
            return Ok(names
                .into_iter()
                .map(|name| crate::path::join(&dir, &name))
                .collect());
        }
        Ok(names)
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        fs::read(self.host_path(path))
            .await
            .map_err(|err| FsError::from_io(err, path))
    }

    async fn output_file(&self, path: &str, data: &[u8]) -> Result<()> {
        let host = self.host_path(path);
        if let Some(parent) = host.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&host, data)
            .await
            .map_err(|err| FsError::from_io(err, path))
    }

    async fn unlink(&self, path: &str) -> Result<()> {
        fs::remove_file(self.host_path(path))
            .await
            .map_err(|err| FsError::from_io(err, path))?;
        debug!(path, "unlinked");
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let target = self.host_path(to);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(self.host_path(from), target)
            .await
            .map_err(|err| FsError::from_io(err, from))?;
        debug!(from, to, "renamed");
        Ok(())
    }

    async fn get_size(&self, path: &str) -> Result<u64> {
        let meta = fs::metadata(self.host_path(path))
            .await
            .map_err(|err| FsError::from_io(err, path))?;
        Ok(meta.len())
    }

    async fn mkdir_all(&self, dir: &str) -> Result<()> {
        fs::create_dir_all(self.host_path(dir)).await?;
        Ok(())
    }

    async fn open_file(&self, path: &str, mode: OpenMode) -> Result<BoxedFile> {
        let host = self.host_path(path);
        let mut options = fs::OpenOptions::new();
        options.read(true);
        if mode == OpenMode::ReadWrite {
            if let Some(parent) = host.parent() {
                fs::create_dir_all(parent).await?;
            }
            options.write(true).create(true);
        }
        let file = options
            .open(&host)
            .await
            .map_err(|err| FsError::from_io(err, path))?;
        Ok(Box::new(LocalFile {
            file,
            path: normalize(path),
            writable: mode == OpenMode::ReadWrite,
        }))
    }

    async fn create_read_stream(&self, path: &str, start: u64) -> Result<BoxedAsyncRead> {
        let mut file = fs::File::open(self.host_path(path))
            .await
            .map_err(|err| FsError::from_io(err, path))?;
        file.seek(SeekFrom::Start(start)).await?;
        Ok(Box::pin(file))
    }
}

/// Random-access file opened through [`LocalHandler`].
#[derive(Debug)]
pub struct LocalFile {
    file: fs::File,
    path: String,
    writable: bool,
}

impl LocalFile {
    fn ensure_writable(&self) -> Result<()> {
        if !self.writable {
            return Err(FsError::ReadOnly {
                path: self.path.clone(),
            });
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl FileHandle for LocalFile {
    async fn len(&mut self) -> Result<u64> {
        Ok(self.file.metadata().await?.len())
    }

    async fn set_len(&mut self, len: u64) -> Result<()> {
        self.ensure_writable()?;
        self.file.set_len(len).await?;
        Ok(())
    }

    async fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let size = self.len().await?;
        check_read_range(offset, buf.len(), size)?;
        self.file.seek(SeekFrom::Start(offset)).await?;
        self.file.read_exact(buf).await?;
        Ok(())
    }

    async fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        self.ensure_writable()?;
        if buf.is_empty() {
            return Ok(());
        }
        offset
            .checked_add(buf.len() as u64)
            .ok_or(FsError::OffsetOverflow)?;
        self.file.seek(SeekFrom::Start(offset)).await?;
        self.file.write_all(buf).await?;
        // tokio completes writes in the background; `metadata()` does not wait for them.
        self.file.flush().await?;
        Ok(())
    }

    async fn sync_all(&mut self) -> Result<()> {
        if self.writable {
            self.file.flush().await?;
            self.file.sync_all().await?;
        }
        Ok(())
    }
}
