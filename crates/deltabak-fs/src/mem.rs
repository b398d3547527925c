use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::handler::check_read_range;
use crate::path::{join, normalize};
use crate::{BoxedAsyncRead, BoxedFile, FileHandle, FsError, Handler, ListOptions, OpenMode, Result};

type FileData = Arc<Mutex<Vec<u8>>>;

/// In-memory [`Handler`].
///
/// Directories are implicit: a directory exists as long as at least one file lives below it
/// (or it was created with [`Handler::mkdir_all`]). Open [`MemFile`]s keep referring to the same
/// bytes across renames, like an open descriptor on a POSIX filesystem.
#[derive(Debug, Clone, Default)]
pub struct MemHandler {
    inner: Arc<Mutex<MemTree>>,
}

#[derive(Debug, Default)]
struct MemTree {
    files: BTreeMap<String, FileData>,
    dirs: BTreeSet<String>,
}

impl MemHandler {
    pub fn new() -> Self {
        Self::default()
    }

    fn tree(&self) -> MutexGuard<'_, MemTree> {
        // A poisoned lock only means a panic happened while holding it; the map itself is
        // still structurally valid.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Every file path currently stored, sorted. Intended for assertions.
    pub fn paths(&self) -> Vec<String> {
        self.tree().files.keys().cloned().collect()
    }

    /// Snapshot of every file and its content, sorted by path.
    pub fn snapshot(&self) -> BTreeMap<String, Vec<u8>> {
        self.tree()
            .files
            .iter()
            .map(|(path, data)| (path.clone(), lock_data(data).clone()))
            .collect()
    }
}

impl MemTree {
    fn dir_exists(&self, dir: &str) -> bool {
        if dir == "/" || self.dirs.contains(dir) {
            return true;
        }
        let prefix = format!("{dir}/");
        self.files.keys().any(|path| path.starts_with(&prefix))
            || self.dirs.iter().any(|path| path.starts_with(&prefix))
    }
}

fn lock_data(data: &FileData) -> MutexGuard<'_, Vec<u8>> {
    data.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait::async_trait]
impl Handler for MemHandler {
    async fn list(&self, dir: &str, options: ListOptions<'_>) -> Result<Vec<String>> {
        let dir = normalize(dir);
        let tree = self.tree();
        if !tree.dir_exists(&dir) {
            return Err(FsError::NotFound { path: dir });
        }

        let prefix = if dir == "/" {
            "/".to_string()
        } else {
            format!("{dir}/")
        };
        let mut names = BTreeSet::new();
        for path in tree.files.keys().chain(tree.dirs.iter()) {
            let Some(rest) = path.strip_prefix(&prefix) else {
                continue;
            };
            let name = rest.split('/').next().unwrap_or(rest);
            if !name.is_empty() {
                names.insert(name.to_string());
            }
        }
        drop(tree);

        Ok(names
            .into_iter()
            .filter(|name| options.filter.map_or(true, |filter| filter(name)))
            .map(|name| {
                if options.prepend_dir {
                    join(&dir, &name)
                } else {
                    name
                }
            })
            .collect())
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let path = normalize(path);
        let tree = self.tree();
        let data = tree
            .files
            .get(&path)
            .ok_or_else(|| FsError::NotFound { path: path.clone() })?;
        let bytes = lock_data(data).clone();
        Ok(bytes)
    }

    async fn output_file(&self, path: &str, data: &[u8]) -> Result<()> {
        let path = normalize(path);
        self.tree()
            .files
            .insert(path, Arc::new(Mutex::new(data.to_vec())));
        Ok(())
    }

    async fn unlink(&self, path: &str) -> Result<()> {
        let path = normalize(path);
        match self.tree().files.remove(&path) {
            Some(_) => Ok(()),
            None => Err(FsError::NotFound { path }),
        }
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let from = normalize(from);
        let to = normalize(to);
        let mut tree = self.tree();
        let data = tree
            .files
            .remove(&from)
            .ok_or_else(|| FsError::NotFound { path: from.clone() })?;
        tree.files.insert(to, data);
        Ok(())
    }

    async fn get_size(&self, path: &str) -> Result<u64> {
        let path = normalize(path);
        let tree = self.tree();
        let data = tree
            .files
            .get(&path)
            .ok_or_else(|| FsError::NotFound { path: path.clone() })?;
        let len = lock_data(data).len() as u64;
        Ok(len)
    }

    async fn mkdir_all(&self, dir: &str) -> Result<()> {
        self.tree().dirs.insert(normalize(dir));
        Ok(())
    }

    async fn open_file(&self, path: &str, mode: OpenMode) -> Result<BoxedFile> {
        let path = normalize(path);
        let mut tree = self.tree();
        let existing = tree.files.get(&path).cloned();
        let data = match (existing, mode) {
            (Some(data), _) => data,
            (None, OpenMode::ReadWrite) => {
                let data: FileData = Arc::new(Mutex::new(Vec::new()));
                tree.files.insert(path.clone(), data.clone());
                data
            }
            (None, OpenMode::Read) => return Err(FsError::NotFound { path }),
        };
        Ok(Box::new(MemFile {
            data,
            path,
            writable: mode == OpenMode::ReadWrite,
        }))
    }

    async fn create_read_stream(&self, path: &str, start: u64) -> Result<BoxedAsyncRead> {
        let bytes = self.read_file(path).await?;
        let start = usize::try_from(start)
            .map_err(|_| FsError::OffsetOverflow)?
            .min(bytes.len());
        Ok(Box::pin(std::io::Cursor::new(bytes[start..].to_vec())))
    }
}

/// Random-access file opened through [`MemHandler`].
#[derive(Debug)]
pub struct MemFile {
    data: FileData,
    path: String,
    writable: bool,
}

impl MemFile {
    /// Empty writable file that belongs to no handler.
    pub fn detached() -> Self {
        Self {
            data: FileData::default(),
            path: String::new(),
            writable: true,
        }
    }

    /// Copy of the current content.
    pub fn contents(&self) -> Vec<u8> {
        lock_data(&self.data).clone()
    }

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
impl FileHandle for MemFile {
    async fn len(&mut self) -> Result<u64> {
        Ok(lock_data(&self.data).len() as u64)
    }

    async fn set_len(&mut self, len: u64) -> Result<()> {
        self.ensure_writable()?;
        let len = usize::try_from(len).map_err(|_| FsError::OffsetOverflow)?;
        lock_data(&self.data).resize(len, 0);
        Ok(())
    }

    async fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let data = lock_data(&self.data);
        check_read_range(offset, buf.len(), data.len() as u64)?;
        let start = offset as usize;
        buf.copy_from_slice(&data[start..start + buf.len()]);
        Ok(())
    }

    async fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        self.ensure_writable()?;
        let start = usize::try_from(offset).map_err(|_| FsError::OffsetOverflow)?;
        let end = start
            .checked_add(buf.len())
            .ok_or(FsError::OffsetOverflow)?;
        let mut data = lock_data(&self.data);
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(buf);
        Ok(())
    }

    async fn sync_all(&mut self) -> Result<()> {
        Ok(())
    }
}
