use thiserror::Error;

pub type Result<T> = std::result::Result<T, FsError>;

/// Errors surfaced by [`crate::Handler`] and [`crate::FileHandle`] implementations.
///
/// Missing paths always map to [`FsError::NotFound`] so callers can treat `ENOENT` as
/// "already absent" without inspecting platform error codes.
#[derive(Debug, Error)]
pub enum FsError {
    #[error("no such file or directory: {path}")]
    NotFound { path: String },

    #[error("out of bounds: offset={offset} len={len} size={size}")]
    OutOfBounds { offset: u64, len: usize, size: u64 },

    #[error("invalid path: {0:?}")]
    InvalidPath(String),

    #[error("file is opened read-only: {path}")]
    ReadOnly { path: String },

    #[error("integer overflow while computing byte offsets")]
    OffsetOverflow,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl FsError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, FsError::NotFound { .. })
    }

    pub(crate) fn from_io(err: std::io::Error, path: &str) -> Self {
        // Listing a regular file as a directory means the directory does not exist.
        if matches!(
            err.kind(),
            std::io::ErrorKind::NotFound | std::io::ErrorKind::NotADirectory
        ) {
            FsError::NotFound {
                path: path.to_string(),
            }
        } else {
            FsError::Io(err)
        }
    }
}
