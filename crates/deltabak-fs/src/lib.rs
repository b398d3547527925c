//! Storage handler contract used by the deltabak VHD engine.
//!
//! Backup artifacts live on a "remote": a local directory, an NFS/SMB mount, or anything else
//! that can list, read, write, rename and unlink named paths. The VHD codec additionally needs
//! random-access reads and writes, which are exposed through [`FileHandle`].
//!
//! - [`Handler`]: async remote abstraction (`list`, `read_file`, `output_file`, `unlink`, ...)
//! - [`LocalHandler`]: `tokio::fs` implementation rooted at a host directory
//! - [`MemHandler`]: in-memory implementation (tests, dry runs)
//!
//! Paths are `/`-separated and relative to the handler root; see [`path`].

mod error;
mod handler;
mod local;
mod mem;
pub mod path;

pub use error::{FsError, Result};
pub use handler::{BoxedAsyncRead, BoxedFile, FileHandle, Handler, ListOptions, OpenMode};
pub use local::{LocalFile, LocalHandler};
pub use mem::{MemFile, MemHandler};
