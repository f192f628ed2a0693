//! Test doubles for the DFS client collaborator (spec §1: "named only by
//! interface"). Used throughout this crate's `#[cfg(test)]` modules,
//! including the end-to-end scenarios in `manager.rs`/`xact.rs`/`sweep.rs`.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use once_cell::sync::OnceCell;

use crate::dfs::{DfsClient, DfsConnHandle, DfsFileHandle};
use crate::slot::OpenSpec;

static TRACING_INIT: OnceCell<()> = OnceCell::new();

/// Install a `tracing` subscriber that prints to stderr, gated so repeat
/// calls across many tests don't fight over the global default. Tests
/// that want to see the cache's `debug!`/`warn!` output while under
/// development can call this first; it's never required for correctness.
pub fn init_test_tracing() {
    TRACING_INIT.get_or_init(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A `DfsClient` that errors on every call. Useful for tests that only
/// exercise the local back end and want a guarantee that the DFS path is
/// never taken.
pub struct NullDfsClient;

impl DfsClient for NullDfsClient {
    fn connect(&self, _host: &str, _port: u16) -> Result<DfsConnHandle> {
        bail!("NullDfsClient: no DFS configured")
    }
    fn open(&self, _c: DfsConnHandle, _p: &str, _f: &OpenSpec, _r: Option<u32>) -> Result<DfsFileHandle> {
        bail!("NullDfsClient: no DFS configured")
    }
    fn read(&self, _h: DfsFileHandle, _b: &mut [u8]) -> Result<usize> {
        bail!("NullDfsClient: no DFS configured")
    }
    fn write(&self, _h: DfsFileHandle, _b: &[u8]) -> Result<usize> {
        bail!("NullDfsClient: no DFS configured")
    }
    fn seek(&self, _h: DfsFileHandle, _p: u64) -> Result<()> {
        bail!("NullDfsClient: no DFS configured")
    }
    fn tell(&self, _h: DfsFileHandle) -> Result<u64> {
        bail!("NullDfsClient: no DFS configured")
    }
    fn sync(&self, _h: DfsFileHandle) -> Result<()> {
        bail!("NullDfsClient: no DFS configured")
    }
    fn chmod(&self, _c: DfsConnHandle, _p: &str, _m: u32) -> Result<()> {
        bail!("NullDfsClient: no DFS configured")
    }
    fn close(&self, _h: DfsFileHandle) -> Result<()> {
        bail!("NullDfsClient: no DFS configured")
    }
    fn raw_truncate(&self, _c: DfsConnHandle, _p: &str, _l: u64) -> Result<()> {
        bail!("NullDfsClient: no DFS configured")
    }
    fn delete(&self, _c: DfsConnHandle, _p: &str) -> Result<()> {
        bail!("NullDfsClient: no DFS configured")
    }
    fn mkdir(&self, _c: DfsConnHandle, _p: &str) -> Result<()> {
        bail!("NullDfsClient: no DFS configured")
    }
    fn listdir(&self, _c: DfsConnHandle, _p: &str) -> Result<Vec<String>> {
        bail!("NullDfsClient: no DFS configured")
    }
    fn path_info_size(&self, _c: DfsConnHandle, _p: &str) -> Result<u64> {
        bail!("NullDfsClient: no DFS configured")
    }
}

struct MemFile {
    path: String,
    data: Vec<u8>,
    pos: u64,
    append: bool,
}

/// An in-memory fake of a distributed filesystem, sufficient to exercise
/// the DFS back end's append-only-write, non-atomic-truncate, and
/// listdir behaviors in tests without a real remote dependency.
#[derive(Default)]
pub struct InMemoryDfsClient {
    files: Mutex<HashMap<String, Vec<u8>>>,
    handles: Mutex<HashMap<u64, MemFile>>,
    next_handle: Mutex<u64>,
}

impl InMemoryDfsClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn alloc_handle(&self) -> u64 {
        let mut n = self.next_handle.lock().unwrap();
        *n += 1;
        *n
    }
}

impl DfsClient for InMemoryDfsClient {
    fn connect(&self, _host: &str, _port: u16) -> Result<DfsConnHandle> {
        Ok(1) // single fake endpoint
    }

    fn open(
        &self,
        _conn: DfsConnHandle,
        path: &str,
        flags: &OpenSpec,
        _replica: Option<u32>,
    ) -> Result<DfsFileHandle> {
        let mut files = self.files.lock().unwrap();
        if flags.create || flags.create_new {
            files.entry(path.to_string()).or_insert_with(Vec::new);
            if flags.truncate {
                files.insert(path.to_string(), Vec::new());
            }
        }
        let data = files
            .get(path)
            .cloned()
            .with_context(|| format!("no such DFS file: {path}"))?;
        let pos = if flags.append { data.len() as u64 } else { 0 };
        let handle = self.alloc_handle();
        self.handles.lock().unwrap().insert(
            handle,
            MemFile {
                path: path.to_string(),
                data,
                pos,
                append: flags.append,
            },
        );
        Ok(handle)
    }

    fn read(&self, handle: DfsFileHandle, buf: &mut [u8]) -> Result<usize> {
        let mut handles = self.handles.lock().unwrap();
        let f = handles.get_mut(&handle).context("bad DFS handle")?;
        let avail = &f.data[(f.pos as usize).min(f.data.len())..];
        let n = avail.len().min(buf.len());
        buf[..n].copy_from_slice(&avail[..n]);
        f.pos += n as u64;
        Ok(n)
    }

    fn write(&self, handle: DfsFileHandle, buf: &[u8]) -> Result<usize> {
        let mut handles = self.handles.lock().unwrap();
        let f = handles.get_mut(&handle).context("bad DFS handle")?;
        if f.append {
            f.pos = f.data.len() as u64;
        }
        let pos = f.pos as usize;
        if pos + buf.len() > f.data.len() {
            f.data.resize(pos + buf.len(), 0);
        }
        f.data[pos..pos + buf.len()].copy_from_slice(buf);
        f.pos += buf.len() as u64;
        self.files.lock().unwrap().insert(f.path.clone(), f.data.clone());
        Ok(buf.len())
    }

    fn seek(&self, handle: DfsFileHandle, pos: u64) -> Result<()> {
        let mut handles = self.handles.lock().unwrap();
        let f = handles.get_mut(&handle).context("bad DFS handle")?;
        f.pos = pos;
        Ok(())
    }

    fn tell(&self, handle: DfsFileHandle) -> Result<u64> {
        let handles = self.handles.lock().unwrap();
        Ok(handles.get(&handle).context("bad DFS handle")?.pos)
    }

    fn sync(&self, _handle: DfsFileHandle) -> Result<()> {
        Ok(())
    }

    fn chmod(&self, _conn: DfsConnHandle, _path: &str, _mode: u32) -> Result<()> {
        Ok(())
    }

    fn close(&self, handle: DfsFileHandle) -> Result<()> {
        self.handles.lock().unwrap().remove(&handle);
        Ok(())
    }

    fn raw_truncate(&self, _conn: DfsConnHandle, path: &str, len: u64) -> Result<()> {
        let mut files = self.files.lock().unwrap();
        let data = files.get_mut(path).context("no such DFS file")?;
        data.resize(len as usize, 0);
        Ok(())
    }

    fn delete(&self, _conn: DfsConnHandle, path: &str) -> Result<()> {
        self.files.lock().unwrap().remove(path);
        Ok(())
    }

    fn mkdir(&self, _conn: DfsConnHandle, _path: &str) -> Result<()> {
        Ok(())
    }

    fn listdir(&self, _conn: DfsConnHandle, path: &str) -> Result<Vec<String>> {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let files = self.files.lock().unwrap();
        Ok(files
            .keys()
            .filter_map(|k| k.strip_prefix(&prefix))
            .filter(|rest| !rest.contains('/'))
            .map(|s| s.to_string())
            .collect())
    }

    fn path_info_size(&self, _conn: DfsConnHandle, path: &str) -> Result<u64> {
        let files = self.files.lock().unwrap();
        Ok(files.get(path).map(|d| d.len() as u64).unwrap_or(0))
    }
}
