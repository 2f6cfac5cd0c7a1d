//! # Content-addressed object store for filesystem trees
//!
//! This crate stores snapshots of POSIX directory hierarchies as immutable
//! objects keyed by SHA-256, links snapshots through commit objects, and
//! exposes a lazy read-only filesystem view over any committed snapshot.

// See https://doc.rust-lang.org/rustc/lints/listing/allowed-by-default.html
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![deny(unsafe_code)]
#![forbid(unused_must_use)]

/// Our generic catchall fatal error, expected to be converted
/// to a string to output to a terminal or logs.
pub type Result<T> = anyhow::Result<T>;

mod async_util;
pub mod checkout;
pub mod checksum;
pub mod cli;
pub mod diff;
pub mod fsck;
pub mod ingest;
mod objects;
mod pack;
pub mod pull;
mod refs;
pub mod repo;
mod serialize;
pub mod tar;
pub mod vfs;

pub use async_util::checksum_file_async;
pub use checksum::{Checksum, ObjectType};
pub use objects::{Commit, DirMeta, DirTree, FileHeader, MetaDict, MetaValue, Xattrs};
pub use pack::{PackCompression, RepackOptions, RepackStats, repack};
pub use repo::{Repo, RepoMode};

/// The semantic failure classes of this crate.  Instances are attached to
/// [`anyhow::Error`] chains at the point of failure, so callers that need
/// to distinguish e.g. a tolerated absence from a hard miss can downcast.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// An object, ref or path does not exist.
    #[error("No such file or directory: {0}")]
    NotFound(String),
    /// A checksum string that is not 64 lowercase hex characters.
    #[error("Invalid checksum string '{0}'")]
    InvalidChecksum(String),
    /// Malformed caller input (bad rev, absolute path in ingest, `..`, ...).
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    /// Stored bytes disagree with their storage key, or a header/structure
    /// failed validation.
    #[error("Corrupted object: {0}")]
    Corrupted(String),
    /// A directory was found where a non-directory was required.
    #[error("Is a directory: {0}")]
    IsDirectory(String),
    /// A non-directory was found where a directory was required.
    #[error("Not a directory: {0}")]
    NotDirectory(String),
    /// The target already exists (e.g. a checkout destination).
    #[error("Already exists: {0}")]
    AlreadyExists(String),
    /// The requested functionality is not available.
    #[error("Not supported: {0}")]
    Unsupported(String),
    /// The caller cancelled the operation.
    #[error("Operation was cancelled")]
    Cancelled,
}

impl Error {
    /// Whether `err` (or anything in its chain) is [`Error::NotFound`].
    pub fn is_not_found(err: &anyhow::Error) -> bool {
        err.chain()
            .any(|e| matches!(e.downcast_ref(), Some(Error::NotFound(_))))
    }
}

pub(crate) fn check_cancelled(token: Option<&tokio_util::sync::CancellationToken>) -> Result<()> {
    match token {
        Some(t) if t.is_cancelled() => Err(Error::Cancelled.into()),
        _ => Ok(()),
    }
}
