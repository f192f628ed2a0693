//! Error types surfaced by the VFD cache.
//!
//! Most plumbing returns `anyhow::Result` with `.context(...)` breadcrumbs,
//! following the teacher's usage throughout `buffered_repository.rs` and
//! `cplane_api.rs`. The handful of error kinds a caller needs to match on
//! by value are collected here instead, so they survive the `anyhow`
//! erasure intact.

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum VfdError {
    #[error("no real file descriptors available (nfile+allocated >= max_safe_fds and the LRU ring is empty)")]
    DescriptorsExhausted,

    #[error("insufficient file descriptors available to start up (max_safe_fds {max_safe_fds} < MIN_FREE)")]
    InsufficientDescriptorsFatal { max_safe_fds: i32 },

    #[error("DFS truncate did not stick: expected length {expected}, observed {observed} after reopen")]
    TruncateMismatch { expected: u64, observed: u64 },

    #[error("DFS write open requires O_APPEND")]
    WriteOpenWithoutAppend,

    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error("allocated-descriptor registry is full ({0} entries)")]
    AllocatedDescsExhausted(usize),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, VfdError>;
