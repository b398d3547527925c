//! VHD (Microsoft Virtual Hard Disk) codec used for incremental VM backups.
//!
//! Backups are stored as chains of differencing VHDs: each export only contains the sectors
//! that changed since its parent. This crate reads and writes the on-disk structures of a
//! single VHD and exposes the block-level operations needed to coalesce a chain:
//!
//! - [`Footer`] / [`Header`]: fixed-size structures with self-checking checksums
//! - [`VhdFile`]: block allocation table, per-block sector bitmaps, block reads/writes,
//!   [`VhdFile::write_data`], BAT growth and footer/header rewriting
//! - [`VhdChain`]: read-through view of a leaf VHD and all of its ancestors
//! - [`create_dynamic`] / [`create_fixed`]: new empty images
//!
//! All I/O goes through [`deltabak_fs::FileHandle`], so the codec works the same on a local
//! directory and on the in-memory handler used by tests.

mod bitmap;
mod chain;
mod create;
mod error;
mod footer;
mod geometry;
mod header;
mod util;
mod vhd;
mod write;

pub use bitmap::{sector_runs, test_bit};
pub use chain::VhdChain;
pub use create::{create_dynamic, create_fixed, CreateOptions};
pub use error::{Result, VhdError};
pub use footer::{DiskGeometry, DiskType, Footer};
pub use geometry::{compute_geometry, timestamp_now};
pub use header::{Header, ParentLocator};
pub use vhd::{open_vhd, open_vhd_with, Block, OpenOptions, VhdFile};

pub const SECTOR_SIZE: usize = 512;
pub const FOOTER_SIZE: usize = 512;
pub const HEADER_SIZE: usize = 1024;

/// BAT entry of a block that has never been written.
pub const BLOCK_UNUSED: u32 = u32::MAX;

/// Block size used by Hyper-V, XenServer and qemu for dynamic disks.
pub const DEFAULT_BLOCK_SIZE: u32 = 2 * 1024 * 1024;
