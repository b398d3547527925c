use deltabak_fs::FsError;
use deltabak_vhd::VhdError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ChainError>;

/// Errors raised while walking, merging or reconciling VHD chains.
///
/// Variants carrying paths describe a single artifact; the reconciler turns them into report
/// entries instead of aborting the whole pass.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("broken vhd {path}: {source}")]
    CorruptFormat { path: String, source: VhdError },

    #[error("parent {parent} of {child} is missing or invalid")]
    MissingParent { child: String, parent: String },

    #[error("{parent} has more than one child: {child1} and {child2}")]
    MultipleChildren {
        parent: String,
        child1: String,
        child2: String,
    },

    #[error("merge of {child} into {parent} stopped partway: {source}")]
    PartialMerge {
        parent: String,
        child: String,
        source: Box<ChainError>,
    },

    #[error("a chain needs at least a parent and a child")]
    ChainTooShort,

    #[error("cannot merge {child} into {parent}: {reason}")]
    ParentMismatch {
        parent: String,
        child: String,
        reason: &'static str,
    },

    #[error("invalid backup metadata {path}: {source}")]
    InvalidMetadata {
        path: String,
        source: serde_json::Error,
    },

    #[error("invalid merge state {path}: {source}")]
    InvalidMergeState {
        path: String,
        source: serde_json::Error,
    },

    #[error(transparent)]
    Vhd(#[from] VhdError),

    #[error(transparent)]
    Fs(#[from] FsError),
}

impl ChainError {
    pub fn is_not_found(&self) -> bool {
        match self {
            ChainError::Vhd(err) => err.is_not_found(),
            ChainError::Fs(err) => err.is_not_found(),
            _ => false,
        }
    }
}
