//! Chain management for incremental VM backups stored as VHD differencing images.
//!
//! A VM backup directory holds full backups (`*.xva` plus optional `*.xva.checksum`),
//! backup metadata (`*.json`) and delta disks under `vdis/<job>/<vdi>/*.vhd`. Each delta
//! backup adds a differencing VHD on top of the previous one; once the metadata of old
//! backups is gone their disks are either deleted or merged into the oldest disk still in
//! use.
//!
//! - [`walk_vhds`]: opens every VHD and builds the parent/child adjacency, detecting broken
//!   files, orphans and branches without touching anything
//! - [`merge_vhd`] / [`merge_chain`]: coalesce a child into its parent, resumable through a
//!   merge-state sidecar and serialized per chain by [`ChainLocks`]
//! - [`clean_vm`]: the reconciliation pass combining both with the backup metadata
//!
//! Nothing is deleted or merged unless [`CleanVmOptions`] asks for it.

mod clean_vm;
mod config;
mod error;
mod locks;
mod merge;
pub mod merge_state;
mod metadata;
mod report;
mod walker;
mod xva;

pub use clean_vm::clean_vm;
pub use config::{CleanVmOptions, DEFAULT_CONCURRENCY, DEFAULT_PROGRESS_INTERVAL_SECS};
pub use error::{ChainError, Result};
pub use locks::{ChainGuard, ChainLocks};
pub use merge::{
    coalesce_vhd, merge_chain, merge_vhd, Chain, MergeJob, MergeOptions, MergeOutcome,
    MergeProgress, MergeSummary, ProgressFn,
};
pub use merge_state::MergeState;
pub use metadata::BackupMetadata;
pub use report::{CleanVmReport, Finding, ItemOutcome, LogFn, ReportEntry};
pub use walker::{
    list_vhds, walk_vhds, Branch, ChainNode, ChainWalk, VhdListing, WalkOptions,
};
pub use xva::{check_xva, XvaCheck};
