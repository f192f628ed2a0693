//! The manager ties the table, LRU ring, back ends, temp-file lifecycle,
//! and allocated-descriptor pool into the single owning object described
//! in spec §9 ("Global mutable state"). It is process-local and
//! single-threaded (spec §5) — no internal locking.

use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::allocated::{AllocatedDesc, AllocatedDescs, AllocatedKind};
use crate::config::Config;
use crate::dfs::{self, parse_dfs_path, DfsClient, DfsHandles, DfsPath, EndpointCache};
use crate::error::{Result, VfdError};
use crate::local;
use crate::slot::{Kind, OpenSpec, RealFd, SeekPos};
use crate::table::VfdTable;
use crate::temp::{temp_file_path, TempFileCounter};

/// A user-facing handle. Never 0 (spec §9: "never let callers receive
/// handle 0").
pub type Vfd = usize;

pub struct VfdCache {
    table: VfdTable,
    nfile: i32,
    max_safe_fds: i32,
    allocated: AllocatedDescs,
    endpoints: EndpointCache,
    temp_counter: TempFileCounter,
    config: Config,
    dfs_client: Arc<dyn DfsClient>,
    pid: u32,
}

impl VfdCache {
    /// `InitFileAccess` (spec §4.A/§6): probes the descriptor budget and
    /// constructs the owning object. Call exactly once per process.
    pub fn init(config: Config, dfs_client: Arc<dyn DfsClient>) -> Result<Self> {
        let max_safe_fds = crate::budget::set_max_safe_fds(&config)?;
        Ok(VfdCache {
            table: VfdTable::new(),
            nfile: 0,
            max_safe_fds,
            allocated: AllocatedDescs::new(),
            endpoints: EndpointCache::new(),
            temp_counter: TempFileCounter::new(),
            config,
            dfs_client,
            pid: std::process::id(),
        })
    }

    pub fn nfile(&self) -> i32 {
        self.nfile
    }

    pub fn allocated_desc_count(&self) -> usize {
        self.allocated.len()
    }

    pub fn max_safe_fds(&self) -> i32 {
        self.max_safe_fds
    }

    fn over_budget(&self) -> bool {
        self.nfile + self.allocated.len() as i32 >= self.max_safe_fds
    }

    // ---- §4.C: LRU ring / ReleaseLru ---------------------------------

    /// Evict the least-recently-used physically open local slot. Only
    /// local slots are ring members, so this never touches DFS handles.
    /// Returns `Ok(false)` if the ring was empty ("nothing to release").
    pub fn release_lru(&mut self) -> Result<bool> {
        let idx = match self.table.ring_lru() {
            Some(idx) => idx,
            None => return Ok(false),
        };

        // Step 1: save the current logical position.
        let saved_pos = {
            let slot = self.table.get_mut(idx);
            match &mut slot.real_fd {
                RealFd::Local(file) => match local::seek_syscall(file, SeekFrom::Current(0)) {
                    Ok(p) => p,
                    Err(e) => {
                        return Err(VfdError::InvariantViolation(format!(
                            "failed to save seek position before eviction: {e}"
                        )))
                    }
                },
                RealFd::Closed => {
                    return Err(VfdError::InvariantViolation(
                        "ring member with closed real_fd".into(),
                    ))
                }
            }
        };

        // Step 2: close the real descriptor. On failure, leave
        // accounting unchanged so a retry is safe (spec §4.C).
        {
            let slot = self.table.get_mut(idx);
            let file = match std::mem::replace(&mut slot.real_fd, RealFd::Closed) {
                RealFd::Local(f) => f,
                RealFd::Closed => unreachable!(),
            };
            drop(file); // std::fs::File::drop already retries EINTR.
        }

        let slot = self.table.get_mut(idx);
        slot.seek_pos = SeekPos::Known(saved_pos);
        self.table.ring_delete(idx);
        self.nfile -= 1;
        debug!(vfd = idx, pos = saved_pos, "released LRU descriptor");
        Ok(true)
    }

    /// Call `release_lru` until there's headroom or the ring is empty.
    fn make_room(&mut self) -> Result<()> {
        while self.over_budget() {
            if !self.release_lru()? {
                break;
            }
        }
        Ok(())
    }

    // ---- §4.C: Reopen --------------------------------------------------

    /// Transition a logically-open slot back to physically open.
    fn reopen(&mut self, idx: Vfd) -> Result<()> {
        self.make_room()?;

        let (kind, name, open_spec, saved_pos) = {
            let slot = self.table.get(idx);
            (
                slot.kind(),
                slot.name.clone().expect("reopen on a non-logically-open slot"),
                slot.open_spec,
                slot.seek_pos,
            )
        };

        match kind {
            Kind::Local => self.reopen_local(idx, &name, open_spec, saved_pos)?,
            Kind::Dfs => self.reopen_dfs(idx, &name, open_spec, saved_pos)?,
        }
        Ok(())
    }

    fn reopen_local(
        &mut self,
        idx: Vfd,
        name: &str,
        open_spec: OpenSpec,
        saved_pos: SeekPos,
    ) -> Result<()> {
        let path = Path::new(name);
        let mut file = open_with_emfile_retry(self, path, open_spec)?;
        if let SeekPos::Known(pos) = saved_pos {
            if pos != 0 {
                local::seek_syscall(&mut file, SeekFrom::Start(pos))?;
            }
        }
        let slot = self.table.get_mut(idx);
        slot.real_fd = RealFd::Local(file);
        self.nfile += 1;
        self.table.ring_insert(idx);
        Ok(())
    }

    fn reopen_dfs(
        &mut self,
        idx: Vfd,
        name: &str,
        open_spec: OpenSpec,
        saved_pos: SeekPos,
    ) -> Result<()> {
        let dfs_path = parse_dfs_path(name)
            .ok_or_else(|| VfdError::InvariantViolation(format!("not a DFS path: {name}")))?
            .map_err(|e| VfdError::InvariantViolation(e.to_string()))?;
        let conn = self
            .endpoints
            .get_or_connect(self.dfs_client.as_ref(), &dfs_path.host, dfs_path.port)
            .map_err(|e| VfdError::InvariantViolation(e.to_string()))?;

        let (handle, _stripped) = dfs::dfs_open(self.dfs_client.as_ref(), conn, &dfs_path, open_spec, 0o644)
            .map_err(|e| VfdError::InvariantViolation(e.to_string()))?;

        if open_spec.write {
            // Write reopens are append-only; the restored handle's length
            // must equal seek_pos exactly (spec §4.C).
            let len = self
                .dfs_client
                .path_info_size(conn, &dfs_path.abspath)
                .map_err(|e| VfdError::InvariantViolation(e.to_string()))?;
            let expected = saved_pos.known().unwrap_or(0);
            if len != expected {
                let _ = self.dfs_client.close(handle);
                return Err(VfdError::TruncateMismatch {
                    expected,
                    observed: len,
                });
            }
        } else if let SeekPos::Known(pos) = saved_pos {
            self.dfs_client
                .seek(handle, pos)
                .map_err(|e| VfdError::InvariantViolation(e.to_string()))?;
        }

        let slot = self.table.get_mut(idx);
        slot.dfs_handles = Some(DfsHandles {
            conn,
            file: Some(handle),
            protocol: dfs_path.protocol.clone(),
        });
        // DFS slots are never ring members (spec §3 invariant 2).
        Ok(())
    }

    // ---- §4.C: FileAccess ----------------------------------------------

    /// The preamble for every data operation: ensure the slot is
    /// physically open, and for local slots, move it to the
    /// most-recently-used end of the ring.
    fn file_access(&mut self, idx: Vfd) -> Result<()> {
        if !self.table.get(idx).is_physically_open() {
            return self.reopen(idx);
        }
        if self.table.get(idx).kind() == Kind::Local && !self.table.ring_is_most_recent(idx) {
            self.table.ring_delete(idx);
            self.table.ring_insert(idx);
        }
        Ok(())
    }

    // ---- §6: path-taking operations -------------------------------------

    /// `PathNameOpen`.
    pub fn path_name_open(&mut self, path: &Path, spec: OpenSpec) -> Result<Vfd> {
        let path_str = path.to_string_lossy().to_string();
        if let Some(parsed) = parse_dfs_path(&path_str) {
            let dfs_path = parsed.map_err(|e| VfdError::InvariantViolation(e.to_string()))?;
            self.open_dfs_new(&path_str, &dfs_path, spec)
        } else {
            self.open_local_new(&path_str, spec)
        }
    }

    /// `FileNameOpen`: opens a relative name under the session's temp
    /// directory.
    pub fn file_name_open(&mut self, relname: &str, spec: OpenSpec) -> Result<Vfd> {
        let path = self.config.temp_dir().join(relname);
        self.path_name_open(&path, spec)
    }

    fn open_local_new(&mut self, path_str: &str, spec: OpenSpec) -> Result<Vfd> {
        self.make_room()?;
        let path = Path::new(path_str);
        let file = open_with_emfile_retry(self, path, spec)?;
        let idx = self.table.alloc();
        {
            let slot = self.table.get_mut(idx);
            slot.name = Some(path_str.to_string());
            slot.open_spec = spec.for_reopen();
            slot.real_fd = RealFd::Local(file);
            slot.seek_pos = SeekPos::Known(0);
        }
        self.nfile += 1;
        self.table.ring_insert(idx);
        Ok(idx)
    }

    fn open_dfs_new(&mut self, path_str: &str, dfs_path: &DfsPath, spec: OpenSpec) -> Result<Vfd> {
        let conn = self
            .endpoints
            .get_or_connect(self.dfs_client.as_ref(), &dfs_path.host, dfs_path.port)
            .map_err(|e| VfdError::InvariantViolation(e.to_string()))?;
        let (handle, stripped) = dfs::dfs_open(self.dfs_client.as_ref(), conn, dfs_path, spec, 0o644)
            .map_err(|e| match e.downcast::<VfdError>() {
                Ok(v) => v,
                Err(e) => VfdError::InvariantViolation(e.to_string()),
            })?;

        let idx = self.table.alloc();
        let slot = self.table.get_mut(idx);
        slot.name = Some(path_str.to_string());
        slot.open_spec = stripped;
        slot.seek_pos = SeekPos::Known(0);
        slot.dfs_handles = Some(DfsHandles {
            conn,
            file: Some(handle),
            protocol: dfs_path.protocol.clone(),
        });
        Ok(idx)
    }

    /// `OpenTemporary` (spec §4.G).
    #[allow(clippy::too_many_arguments)]
    pub fn open_temporary(
        &mut self,
        name: &str,
        seq: u32,
        unique: bool,
        create: bool,
        del_on_close: bool,
        close_at_eoxact: bool,
        create_subid: u32,
    ) -> Result<Vfd> {
        let counter = self.temp_counter.next();
        let path = temp_file_path(&self.config, name, seq, unique, self.pid, counter);

        let mut spec = OpenSpec {
            read: true,
            write: true,
            ..Default::default()
        };
        if create {
            spec.create = true;
            spec.truncate = true;
        }

        let idx = match self.open_local_new(&path.to_string_lossy(), spec) {
            Ok(idx) => idx,
            Err(VfdError::Io(io_err)) if create && io_err.kind() == std::io::ErrorKind::NotFound => {
                // ENOENT of the temp directory: create it (ignore EEXIST)
                // and retry once (spec §4.G).
                let dir = self.config.temp_dir();
                if let Err(e) = local::mkdir(&dir) {
                    if e.kind() != std::io::ErrorKind::AlreadyExists {
                        return Err(e.into());
                    }
                }
                self.open_local_new(&path.to_string_lossy(), spec)?
            }
            Err(e) => return Err(e),
        };

        let slot = self.table.get_mut(idx);
        if del_on_close {
            slot.state |= crate::slot::state_bits::TEMPORARY;
        }
        if close_at_eoxact {
            slot.state |= crate::slot::state_bits::CLOSE_AT_EOXACT;
            slot.create_subid = create_subid;
        }
        Ok(idx)
    }

    // ---- §6: handle-taking operations -----------------------------------

    pub fn file_read(&mut self, vfd: Vfd, buf: &mut [u8]) -> Result<usize> {
        self.file_access(vfd)?;
        let start = self.table.get(vfd).seek_pos.known();
        let dfs_handle = match self.table.get(vfd).kind() {
            Kind::Dfs => {
                let h = self.table.get(vfd).dfs_handles.as_ref().expect("physically open");
                Some(h.file.expect("physically open"))
            }
            Kind::Local => None,
        };

        let result = if let Some(handle) = dfs_handle {
            self.dfs_client
                .read(handle, buf)
                .map_err(|e| VfdError::InvariantViolation(e.to_string()))
        } else {
            match &mut self.table.get_mut(vfd).real_fd {
                RealFd::Local(file) => local::read(file, buf).map_err(VfdError::from),
                RealFd::Closed => unreachable!("file_access guarantees physical openness"),
            }
        };

        let slot = self.table.get_mut(vfd);
        match (&result, start) {
            (Ok(n), Some(pos)) => slot.seek_pos = SeekPos::Known(pos + *n as u64),
            _ => slot.seek_pos = SeekPos::Unknown,
        }
        result
    }

    pub fn file_write(&mut self, vfd: Vfd, buf: &[u8]) -> Result<usize> {
        self.file_access(vfd)?;
        let start = self.table.get(vfd).seek_pos.known();
        let dfs_handle = match self.table.get(vfd).kind() {
            Kind::Dfs => {
                let h = self.table.get(vfd).dfs_handles.as_ref().expect("physically open");
                Some(h.file.expect("physically open"))
            }
            Kind::Local => None,
        };

        let result = if let Some(handle) = dfs_handle {
            self.dfs_client
                .write(handle, buf)
                .map_err(|e| VfdError::InvariantViolation(e.to_string()))
        } else {
            match &mut self.table.get_mut(vfd).real_fd {
                RealFd::Local(file) => local::write(file, buf).map_err(VfdError::from),
                RealFd::Closed => unreachable!("file_access guarantees physical openness"),
            }
        };

        let slot = self.table.get_mut(vfd);
        match (&result, start) {
            (Ok(n), Some(pos)) => slot.seek_pos = SeekPos::Known(pos + *n as u64),
            _ => slot.seek_pos = SeekPos::Unknown,
        }
        result
    }

    pub fn file_seek(&mut self, vfd: Vfd, whence: SeekFrom) -> Result<u64> {
        let kind = self.table.get(vfd).kind();
        match kind {
            Kind::Local => self.file_seek_local(vfd, whence),
            Kind::Dfs => self.file_seek_dfs(vfd, whence),
        }
    }

    fn file_seek_local(&mut self, vfd: Vfd, whence: SeekFrom) -> Result<u64> {
        let physically_open = self.table.get(vfd).is_physically_open();
        let cached = self.table.get(vfd).seek_pos;

        if physically_open && local::seek_needs_syscall(whence, cached) {
            self.file_access(vfd)?;
            let slot = self.table.get_mut(vfd);
            let pos = match &mut slot.real_fd {
                RealFd::Local(file) => local::seek_syscall(file, whence)?,
                RealFd::Closed => unreachable!(),
            };
            slot.seek_pos = SeekPos::Known(pos);
            return Ok(pos);
        }

        if matches!(whence, SeekFrom::End(_)) {
            // SEEK_END always forces a physical open, even if not
            // currently open.
            self.file_access(vfd)?;
            let slot = self.table.get_mut(vfd);
            let pos = match &mut slot.real_fd {
                RealFd::Local(file) => local::seek_syscall(file, whence)?,
                RealFd::Closed => unreachable!(),
            };
            slot.seek_pos = SeekPos::Known(pos);
            return Ok(pos);
        }

        // Offline fold: update the cached position without opening.
        let pos = local::fold_seek_offline(whence, cached)?;
        self.table.get_mut(vfd).seek_pos = SeekPos::Known(pos);
        Ok(pos)
    }

    fn file_seek_dfs(&mut self, vfd: Vfd, whence: SeekFrom) -> Result<u64> {
        self.file_access(vfd)?;
        let slot = self.table.get(vfd);
        let handles = slot.dfs_handles.as_ref().expect("dfs slot");
        let handle = handles.file.expect("physically open");
        let conn = handles.conn;
        let dfs_path = parse_dfs_path(slot.name.as_ref().unwrap())
            .unwrap()
            .map_err(|e| VfdError::InvariantViolation(e.to_string()))?;

        let target = match whence {
            SeekFrom::Start(off) => off,
            SeekFrom::Current(delta) => {
                let base = slot.seek_pos.known().unwrap_or(0);
                (base as i128 + delta as i128).max(0) as u64
            }
            SeekFrom::End(delta) => {
                let size = self
                    .dfs_client
                    .path_info_size(conn, &dfs_path.abspath)
                    .map_err(|e| VfdError::InvariantViolation(e.to_string()))?;
                (size as i128 + delta as i128).max(0) as u64
            }
        };

        self.dfs_client
            .seek(handle, target)
            .map_err(|e| VfdError::InvariantViolation(e.to_string()))?;
        self.table.get_mut(vfd).seek_pos = SeekPos::Known(target);
        Ok(target)
    }

    pub fn file_sync(&mut self, vfd: Vfd) -> Result<()> {
        self.file_access(vfd)?;
        let enabled = self.config.fsync_enabled;
        let method = self.config.sync_method;
        let slot = self.table.get(vfd);
        match &slot.real_fd {
            RealFd::Local(file) => local::sync(file, enabled, method).map_err(VfdError::from),
            RealFd::Closed => {
                let h = slot.dfs_handles.as_ref().expect("dfs slot");
                self.dfs_client
                    .sync(h.file.expect("open"))
                    .map_err(|e| VfdError::InvariantViolation(e.to_string()))
            }
        }
    }

    pub fn file_truncate(&mut self, vfd: Vfd, offset: u64) -> Result<()> {
        self.file_access(vfd)?;
        let kind = self.table.get(vfd).kind();
        match kind {
            Kind::Local => {
                let slot = self.table.get_mut(vfd);
                let result = match &slot.real_fd {
                    RealFd::Local(file) => local::truncate(file, offset).map_err(VfdError::from),
                    RealFd::Closed => unreachable!(),
                };
                slot.seek_pos = SeekPos::Unknown;
                result
            }
            Kind::Dfs => {
                let (conn, handle, open_spec, name) = {
                    let slot = self.table.get(vfd);
                    let h = slot.dfs_handles.as_ref().unwrap();
                    (conn_of(h), h.file.unwrap(), slot.open_spec, slot.name.clone().unwrap())
                };
                let dfs_path = parse_dfs_path(&name)
                    .unwrap()
                    .map_err(|e| VfdError::InvariantViolation(e.to_string()))?;
                let new_handle = dfs::dfs_truncate(
                    self.dfs_client.as_ref(),
                    conn,
                    &dfs_path,
                    handle,
                    open_spec,
                    offset,
                )
                .map_err(|e| match e.downcast::<VfdError>() {
                    Ok(v) => v,
                    Err(e) => VfdError::InvariantViolation(e.to_string()),
                })?;
                let slot = self.table.get_mut(vfd);
                slot.dfs_handles.as_mut().unwrap().file = Some(new_handle);
                slot.seek_pos = SeekPos::Known(offset);
                Ok(())
            }
        }
    }

    /// `FileClose`.
    pub fn file_close(&mut self, vfd: Vfd) -> Result<()> {
        self.close_internal(vfd)
    }

    fn close_internal(&mut self, vfd: Vfd) -> Result<()> {
        let temporary = self.table.get(vfd).state & crate::slot::state_bits::TEMPORARY != 0;
        let name = self.table.get(vfd).name.clone();

        let close_result = self.physically_close(vfd);

        if temporary {
            // Clear the bit before unlink, so an interrupt can't leave
            // the bit set without the file (spec §4.G / §5 Reentrancy).
            self.table.get_mut(vfd).state &= !crate::slot::state_bits::TEMPORARY;
            if let Some(name) = &name {
                if let Err(e) = local::remove(Path::new(name)) {
                    warn!(file = %name, error = %e, "temp file unlink failed on close");
                }
            }
        }

        self.table.free(vfd);
        close_result
    }

    /// Close the real descriptor/handle without freeing the slot or
    /// touching the `TEMPORARY` bit. Used by close and by the
    /// end-of-transaction hooks. The slot's in-memory state is always
    /// cleared, even on failure (spec §9 "FileInvalidate-style defensive
    /// clear") — only local close failures are surfaced to the caller
    /// (spec §7: "Close errors: for local files, elevated to error");
    /// DFS close failures are logged and swallowed, matching
    /// `AtXactCancel`'s existing best-effort DFS cleanup.
    fn physically_close(&mut self, vfd: Vfd) -> Result<()> {
        let kind = self.table.get(vfd).kind();
        match kind {
            Kind::Local => {
                if let RealFd::Local(file) = std::mem::replace(&mut self.table.get_mut(vfd).real_fd, RealFd::Closed) {
                    self.table.ring_delete(vfd);
                    self.nfile -= 1;
                    local::close_checked(file)?;
                }
                Ok(())
            }
            Kind::Dfs => {
                if let Some(handles) = self.table.get_mut(vfd).dfs_handles.take() {
                    if let Some(handle) = handles.file {
                        if let Err(e) = self.dfs_client.close(handle) {
                            warn!(error = %e, "DFS close failed");
                        }
                    }
                }
                Ok(())
            }
        }
    }

    // ---- §6: path-taking maintenance ops --------------------------------

    pub fn remove_path(&mut self, path: &Path, _recursive: bool) -> Result<()> {
        let path_str = path.to_string_lossy().to_string();
        if let Some(parsed) = parse_dfs_path(&path_str) {
            let dfs_path = parsed.map_err(|e| VfdError::InvariantViolation(e.to_string()))?;
            let conn = self
                .endpoints
                .get_or_connect(self.dfs_client.as_ref(), &dfs_path.host, dfs_path.port)
                .map_err(|e| VfdError::InvariantViolation(e.to_string()))?;
            self.dfs_client
                .delete(conn, &dfs_path.abspath)
                .map_err(|e| VfdError::InvariantViolation(e.to_string()))
        } else {
            local::remove(path).map_err(VfdError::from)
        }
    }

    pub fn make_directory(&mut self, path: &Path, _mode: u32) -> Result<()> {
        let path_str = path.to_string_lossy().to_string();
        if let Some(parsed) = parse_dfs_path(&path_str) {
            let dfs_path = parsed.map_err(|e| VfdError::InvariantViolation(e.to_string()))?;
            let conn = self
                .endpoints
                .get_or_connect(self.dfs_client.as_ref(), &dfs_path.host, dfs_path.port)
                .map_err(|e| VfdError::InvariantViolation(e.to_string()))?;
            self.dfs_client
                .mkdir(conn, &dfs_path.abspath)
                .map_err(|e| VfdError::InvariantViolation(e.to_string()))
        } else {
            local::mkdir(path).map_err(VfdError::from)
        }
    }

    // ---- §4.H: allocated-descriptor pool ---------------------------------

    pub fn allocate_file(&mut self, path: &Path, spec: OpenSpec) -> Result<usize> {
        self.ensure_allocated_headroom()?;
        let file = open_with_emfile_retry(self, path, spec)?;
        self.allocated.push(AllocatedDesc {
            kind: AllocatedKind::File(file),
            create_subid: 0,
        })
    }

    pub fn allocate_dir(&mut self, path: &Path) -> Result<usize> {
        self.ensure_allocated_headroom()?;
        let path_str = path.to_string_lossy().to_string();
        if let Some(parsed) = parse_dfs_path(&path_str) {
            let dfs_path = parsed.map_err(|e| VfdError::InvariantViolation(e.to_string()))?;
            let conn = self
                .endpoints
                .get_or_connect(self.dfs_client.as_ref(), &dfs_path.host, dfs_path.port)
                .map_err(|e| VfdError::InvariantViolation(e.to_string()))?;
            let entries = self
                .dfs_client
                .listdir(conn, &dfs_path.abspath)
                .map_err(|e| VfdError::InvariantViolation(e.to_string()))?;
            let idx = self.allocated.push(AllocatedDesc {
                kind: AllocatedKind::RemoteDirListing { entries, cursor: 0 },
                create_subid: 0,
            })?;
            Ok(idx)
        } else {
            let rd = open_dir_with_emfile_retry(self, path)?;
            self.allocated.push(AllocatedDesc {
                kind: AllocatedKind::LocalDir(rd),
                create_subid: 0,
            })
        }
    }

    fn ensure_allocated_headroom(&mut self) -> Result<()> {
        if self.nfile + self.allocated.len() as i32 >= self.max_safe_fds - 1 {
            self.make_room()?;
        }
        Ok(())
    }

    pub fn free_file(&mut self, idx: usize) -> Result<()> {
        let desc = self.allocated.remove(idx);
        if let AllocatedKind::File(file) = desc.kind {
            drop(file);
        }
        Ok(())
    }

    pub fn free_dir(&mut self, idx: usize) -> Result<()> {
        self.allocated.remove(idx);
        Ok(())
    }

    pub fn read_dir(&mut self, idx: usize) -> Result<Option<String>> {
        let desc = self.allocated.get_mut(idx);
        match &mut desc.kind {
            AllocatedKind::LocalDir(rd) => match rd.next() {
                Some(Ok(entry)) => Ok(Some(entry.file_name().to_string_lossy().to_string())),
                Some(Err(e)) => Err(e.into()),
                None => Ok(None),
            },
            AllocatedKind::RemoteDirListing { entries, cursor } => {
                Ok(crate::allocated::read_remote_dir_entry(entries, cursor))
            }
            AllocatedKind::File(_) => Err(VfdError::InvariantViolation(
                "read_dir called on a file descriptor".into(),
            )),
        }
    }

    // exposed for the xact module, which lives in its own file but needs
    // access to private fields.
    pub(crate) fn table_mut(&mut self) -> &mut VfdTable {
        &mut self.table
    }

    pub(crate) fn table(&self) -> &VfdTable {
        &self.table
    }

    pub(crate) fn allocated_mut(&mut self) -> &mut AllocatedDescs {
        &mut self.allocated
    }

    pub(crate) fn dfs_client(&self) -> &dyn DfsClient {
        self.dfs_client.as_ref()
    }

    pub(crate) fn close_slot(&mut self, vfd: Vfd) -> Result<()> {
        self.close_internal(vfd)
    }

    pub(crate) fn physically_close_slot(&mut self, vfd: Vfd) -> Result<()> {
        self.physically_close(vfd)
    }
}

fn conn_of(h: &DfsHandles) -> crate::dfs::DfsConnHandle {
    h.conn
}

/// `open(2)` with the `EMFILE`/`ENFILE` retry-once-after-ReleaseLru rule
/// (spec §4.D / §7).
fn open_with_emfile_retry(cache: &mut VfdCache, path: &Path, spec: OpenSpec) -> Result<std::fs::File> {
    match local::open(path, spec) {
        Ok(f) => Ok(f),
        Err(e) if is_fd_exhaustion(&e) => {
            if cache.release_lru()? {
                local::open(path, spec).map_err(VfdError::from)
            } else {
                Err(VfdError::DescriptorsExhausted)
            }
        }
        Err(e) => Err(e.into()),
    }
}

/// `opendir(3)` with the same EMFILE/ENFILE retry-once-after-`ReleaseLru`
/// rule as `open_with_emfile_retry` (spec §4.H / §5: `AllocateDir`-local
/// gets the same retry as `AllocateFile`).
fn open_dir_with_emfile_retry(cache: &mut VfdCache, path: &Path) -> Result<std::fs::ReadDir> {
    match std::fs::read_dir(path) {
        Ok(rd) => Ok(rd),
        Err(e) if is_fd_exhaustion(&e) => {
            if cache.release_lru()? {
                std::fs::read_dir(path).map_err(VfdError::from)
            } else {
                Err(VfdError::DescriptorsExhausted)
            }
        }
        Err(e) => Err(e.into()),
    }
}

fn is_fd_exhaustion(e: &std::io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(code) if code == libc::EMFILE || code == libc::ENFILE
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{InMemoryDfsClient, NullDfsClient};

    fn local_cache(dir: &Path) -> VfdCache {
        let cfg = Config {
            temp_tablespace_path: dir.to_path_buf(),
            ..Config::default()
        };
        VfdCache::init(cfg, Arc::new(NullDfsClient)).unwrap()
    }

    fn rw_spec() -> OpenSpec {
        OpenSpec {
            read: true,
            write: true,
            create: true,
            truncate: true,
            ..Default::default()
        }
    }

    #[test]
    fn open_write_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = local_cache(dir.path());
        let path = dir.path().join("a");

        let vfd = cache.path_name_open(&path, rw_spec()).unwrap();
        cache.file_write(vfd, b"xy").unwrap();
        cache.file_seek(vfd, SeekFrom::Start(0)).unwrap();
        let mut buf = [0u8; 2];
        let n = cache.file_read(vfd, &mut buf).unwrap();
        assert_eq!(n, 2);
        assert_eq!(&buf, b"xy");
    }

    #[test]
    fn close_and_reopen_preserves_seek_pos() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = local_cache(dir.path());
        let path = dir.path().join("b");

        let vfd = cache.path_name_open(&path, rw_spec()).unwrap();
        cache.file_write(vfd, b"hello").unwrap();
        cache.file_seek(vfd, SeekFrom::Start(2)).unwrap();

        // Force an eviction/reopen cycle.
        cache.release_lru().unwrap();
        assert_eq!(cache.nfile(), 0);

        let mut buf = [0u8; 3];
        let n = cache.file_read(vfd, &mut buf).unwrap();
        assert_eq!(n, 3);
        assert_eq!(&buf, b"llo");
    }

    #[test]
    fn eviction_under_pressure_scenario() {
        // Scenario 1 from spec §8: max_safe_fds = 3, open A,B,C,D, write
        // "xy" to each, then read 2 bytes from A.
        let dir = tempfile::tempdir().unwrap();
        let mut cache = local_cache(dir.path());
        cache.max_safe_fds = 3;

        let mut vfds = Vec::new();
        for name in ["A", "B", "C", "D"] {
            let path = dir.path().join(name);
            let vfd = cache.path_name_open(&path, rw_spec()).unwrap();
            cache.file_write(vfd, b"xy").unwrap();
            assert!(cache.nfile() <= 3);
            vfds.push(vfd);
        }

        cache.file_seek(vfds[0], SeekFrom::Start(0)).unwrap();
        let mut buf = [0u8; 2];
        let n = cache.file_read(vfds[0], &mut buf).unwrap();
        assert_eq!(n, 2);
        assert_eq!(&buf, b"xy");
        assert!(cache.nfile() <= 3);
        assert!(cache.table().ring_is_most_recent(vfds[0]));
    }

    #[test]
    fn open_temporary_delete_on_close_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = local_cache(dir.path());
        let vfd = cache
            .open_temporary("sort", 1, true, true, true, false, 0)
            .unwrap();
        cache.file_write(vfd, b"data").unwrap();
        let path = cache.table().get(vfd).name.clone().unwrap();
        cache.file_close(vfd).unwrap();
        assert!(!Path::new(&path).exists());
    }

    #[test]
    fn dfs_write_open_requires_append() {
        let cache_client = Arc::new(InMemoryDfsClient::new());
        let cfg = Config::default();
        let mut cache = VfdCache::init(cfg, cache_client).unwrap();

        let spec = OpenSpec {
            write: true,
            create: true,
            ..Default::default()
        };
        let err = cache
            .path_name_open(Path::new("dfs://h:1/f"), spec)
            .unwrap_err();
        assert!(matches!(err, VfdError::WriteOpenWithoutAppend));
    }

    #[test]
    fn dfs_non_atomic_truncate_roundtrip() {
        // Scenario 4 from spec §8: write 10 bytes append, truncate(4),
        // tell returns 4.
        let client = Arc::new(InMemoryDfsClient::new());
        let cfg = Config::default();
        let mut cache = VfdCache::init(cfg, client).unwrap();

        let spec = OpenSpec {
            write: true,
            append: true,
            create: true,
            ..Default::default()
        };
        let vfd = cache.path_name_open(Path::new("dfs://h:1/f"), spec).unwrap();
        cache.file_write(vfd, b"0123456789").unwrap();
        cache.file_truncate(vfd, 4).unwrap();
        assert_eq!(cache.table().get(vfd).seek_pos.known(), Some(4));
    }

    #[test]
    fn many_files_survive_eviction_in_random_access_order() {
        // Mirrors the teacher's own virtual-file stress test: open far
        // more files than the descriptor budget allows, then read them
        // back in shuffled order and confirm every one still reads the
        // content it was given, regardless of how many evictions it took.
        use rand::seq::SliceRandom;
        use rand::thread_rng;

        let dir = tempfile::tempdir().unwrap();
        let mut cache = local_cache(dir.path());
        cache.max_safe_fds = 8;

        let mut vfds = Vec::new();
        for i in 0..40 {
            let path = dir.path().join(format!("f{i}"));
            let vfd = cache.path_name_open(&path, rw_spec()).unwrap();
            cache.file_write(vfd, format!("payload-{i}").as_bytes()).unwrap();
            vfds.push((vfd, i));
        }
        assert!(cache.nfile() <= 8);

        vfds.as_mut_slice().shuffle(&mut thread_rng());
        for (vfd, i) in &vfds {
            cache.file_seek(*vfd, SeekFrom::Start(0)).unwrap();
            let mut buf = vec![0u8; format!("payload-{i}").len()];
            cache.file_read(*vfd, &mut buf).unwrap();
            assert_eq!(buf, format!("payload-{i}").into_bytes());
            assert!(cache.nfile() <= 8);
        }
    }

    #[test]
    fn allocate_file_respects_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = local_cache(dir.path());
        let path = dir.path().join("allocated");
        std::fs::write(&path, b"hi").unwrap();

        let idx = cache
            .allocate_file(&path, OpenSpec { read: true, ..Default::default() })
            .unwrap();
        assert_eq!(cache.allocated_desc_count(), 1);
        cache.free_file(idx).unwrap();
        assert_eq!(cache.allocated_desc_count(), 0);
    }
}
