//! Error taxonomy shared by every subsystem.
//!
//! Each variant corresponds to one entry in the failure taxonomy of the
//! design (`spec.md` §7). Callers match on variants rather than strings;
//! internal plumbing still gets ergonomic `?`-propagation via the `#[from]`
//! conversions.

use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid path: {0}")]
    InvalidPath(PathBuf),

    #[error("path escapes project root: {0}")]
    PathEscape(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse error at {path}:{line}:{column}: {message}")]
    ParseError {
        path: PathBuf,
        line: usize,
        column: usize,
        message: String,
    },

    #[error("toolchain missing: {0}")]
    ToolchainMissing(String),

    #[error("toolchain timed out after {0:?}")]
    ToolchainTimeout(std::time::Duration),

    #[error("compile error: {stderr}")]
    CompileError { stderr: String },

    #[error("cache entry corrupt: {0}")]
    CacheCorrupt(String),

    #[error("over capacity: {0}")]
    OverCapacity(&'static str),

    #[error("rate limited: {0}")]
    RateLimited(&'static str),

    #[error("origin rejected: {0}")]
    OriginRejected(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("duplicate component: {name} already registered from {existing_path}")]
    DuplicateComponent { name: String, existing_path: PathBuf },

    #[error("file watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("channel closed")]
    ChannelClosed,
}
