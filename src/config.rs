//! Configuration and tunable constants for the VFD cache.
//!
//! Mirrors the handful of GUCs that `fd.c` consults: a cap on the number of
//! real descriptors the process may hold, whether fsync is enabled, which
//! syscall implements it, and where temporary files live.

use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Number of descriptors this module never hands out, reserved for
/// sockets, libpq, and anything else opened outside of it.
pub const RESERVED: i32 = 10;

/// If the probe leaves fewer than this many descriptors free, startup
/// aborts rather than run in a state that can starve the rest of the
/// process.
pub const MIN_FREE: i32 = 10;

/// Capacity of the allocated-descriptor registry (`AllocateFile`/`AllocateDir`).
pub const MAX_ALLOCATED_DESCS: usize = 32;

/// Prefix used for all files created through `OpenTemporary`, and the
/// marker the startup sweep looks for.
pub const PG_TEMP_FILE_PREFIX: &str = "pgsql_tmp";

/// Name of the per-database subdirectory the startup sweep walks.
pub const PG_TEMP_FILES_DIR: &str = "pgsql_tmp";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMethod {
    Fsync,
    FsyncWritethrough,
    Fdatasync,
}

impl Default for SyncMethod {
    fn default() -> Self {
        // matches the platform default `fd.c` picks when fdatasync exists
        SyncMethod::Fdatasync
    }
}

impl FromStr for SyncMethod {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fsync" => Ok(SyncMethod::Fsync),
            "fsync_writethrough" => Ok(SyncMethod::FsyncWritethrough),
            "fdatasync" => Ok(SyncMethod::Fdatasync),
            other => anyhow::bail!("unrecognized sync_method {other:?}"),
        }
    }
}

/// Process-wide configuration, set once at `InitFileAccess` time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Upper bound the probe is not allowed to exceed, regardless of how
    /// many descriptors the kernel will actually let us hold.
    pub max_files_per_process: i32,

    /// Whether `FileSync` should call down into the kernel at all.
    pub fsync_enabled: bool,

    /// Which syscall `FileSync` issues when `fsync_enabled` is set.
    pub sync_method: SyncMethod,

    /// Directory under which `OpenTemporary` creates its `pgsql_tmp/`
    /// subdirectory.
    pub temp_tablespace_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_files_per_process: 1000,
            fsync_enabled: true,
            sync_method: SyncMethod::default(),
            temp_tablespace_path: PathBuf::from("."),
        }
    }
}

impl Config {
    /// Directory temp files of this process live in: `<base>/pgsql_tmp`.
    pub fn temp_dir(&self) -> PathBuf {
        self.temp_tablespace_path.join(PG_TEMP_FILES_DIR)
    }
}
