use deltabak_fs::FsError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, VhdError>;

/// Errors produced while decoding or mutating a VHD.
///
/// [`VhdError::CorruptFormat`] is never repaired silently: callers decide whether the offending
/// file gets deleted.
#[derive(Debug, Error)]
pub enum VhdError {
    #[error("corrupt vhd: {0}")]
    CorruptFormat(&'static str),

    #[error("unsupported vhd feature: {0}")]
    Unsupported(&'static str),

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("block {0} is not allocated")]
    BlockNotAllocated(u32),

    #[error("out of bounds: offset={offset} len={len} capacity={capacity}")]
    OutOfBounds {
        offset: u64,
        len: usize,
        capacity: u64,
    },

    #[error("integer overflow while computing byte offsets")]
    OffsetOverflow,

    #[error(transparent)]
    Fs(#[from] FsError),
}

impl VhdError {
    pub fn is_corrupt(&self) -> bool {
        matches!(self, VhdError::CorruptFormat(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, VhdError::Fs(err) if err.is_not_found())
    }
}
