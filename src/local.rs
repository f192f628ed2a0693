//! The local back end (§4.D): operations against the host filesystem.
//!
//! These are free functions operating on a real `std::fs::File`/path, with
//! no knowledge of the VFD table — the retry-on-`EMFILE`/`ENFILE` dance
//! that needs to call `ReleaseLru` lives one layer up, in the manager,
//! since only it can reach the table. This mirrors the division in the
//! teacher's `virtual_file.rs`, where `with_file` (the table-aware layer)
//! wraps a plain `File` method call.

use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind, Read, Seek, SeekFrom, Write};
use std::os::unix::io::{IntoRawFd, RawFd};
use std::path::Path;

use tracing::warn;

use crate::config::SyncMethod;
use crate::slot::{OpenSpec, SeekPos};

/// `open(2)`. Callers retry once after `ReleaseLru` on `EMFILE`/`ENFILE`;
/// this function itself makes no retry decision, it just reports the
/// raw error so the caller can classify it.
pub fn open(path: &Path, spec: OpenSpec) -> io::Result<File> {
    spec.to_std().open(path)
}

/// Read with `EINTR` retried unconditionally (spec allows the caller to
/// request retry; this module always retries since the underlying
/// `std::fs::File::read` via a raw fd plumbs `EINTR` back as
/// `ErrorKind::Interrupted`, and there's never a reason to hand that to
/// the caller instead of retrying).
///
/// On success, returns the number of bytes read. On failure, the caller
/// is responsible for marking `seek_pos` unknown.
pub fn read(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        match file.read(buf) {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Write, synthesizing `ENOSPC` on a short write with `errno == 0`
/// (spec §4.D), and retrying unconditionally on `EINTR`.
pub fn write(file: &mut File, buf: &[u8]) -> io::Result<usize> {
    loop {
        match file.write(buf) {
            Ok(n) if n < buf.len() && n > 0 => {
                // Short write that didn't itself report an error: treat as
                // out of space, the same synthetic failure fd.c raises.
                return Err(io::Error::from_raw_os_error(libc::ENOSPC));
            }
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Decide whether a logical seek needs a real `lseek` syscall, given the
/// slot's cached position. Returns `None` when the cached position can
/// just be updated without touching the kernel (spec §4.D: avoid no-op
/// syscalls for `SEEK_SET` to current position and `SEEK_CUR(0)` when
/// the position is already known). `SEEK_END` always forces a physical
/// open/seek.
pub fn seek_needs_syscall(whence: SeekFrom, cached: SeekPos) -> bool {
    match whence {
        SeekFrom::End(_) => true,
        SeekFrom::Start(target) => cached.known() != Some(target),
        SeekFrom::Current(0) => cached.known().is_none(),
        SeekFrom::Current(_) => true,
    }
}

/// Apply a seek whose target is already known without touching the
/// kernel. Caller must have already established via
/// `seek_needs_syscall` that this is safe.
pub fn fold_seek_offline(whence: SeekFrom, cached: SeekPos) -> io::Result<u64> {
    match whence {
        SeekFrom::Start(target) => Ok(target),
        SeekFrom::Current(delta) => {
            let base = cached.known().ok_or_else(|| {
                io::Error::new(ErrorKind::Other, "seek_pos unknown, cannot fold offline")
            })?;
            let new_pos = base as i128 + delta as i128;
            if new_pos < 0 || new_pos > u64::MAX as i128 {
                return Err(io::Error::new(ErrorKind::InvalidInput, "seek out of range"));
            }
            Ok(new_pos as u64)
        }
        SeekFrom::End(_) => unreachable!("SEEK_END always needs a syscall"),
    }
}

/// Issue a real seek against the kernel.
pub fn seek_syscall(file: &mut File, whence: SeekFrom) -> io::Result<u64> {
    file.seek(whence)
}

/// `fsync`/`fdatasync`/write-through, per the configured `SyncMethod`,
/// or a no-op when fsync is disabled by configuration. Supplements the
/// spec's "delegate to the host policy" with the concrete dispatch the
/// original `pg_fsync`/`pg_fsync_writethrough`/`pg_fdatasync` implement.
pub fn sync(file: &File, enabled: bool, method: SyncMethod) -> io::Result<()> {
    if !enabled {
        return Ok(());
    }
    match method {
        SyncMethod::Fsync | SyncMethod::FsyncWritethrough => file.sync_all(),
        SyncMethod::Fdatasync => file.sync_data(),
    }
}

/// `ftruncate`.
pub fn truncate(file: &File, offset: u64) -> io::Result<()> {
    file.set_len(offset)
}

/// The `gp_retry_close` retry-on-`EINTR` loop (spec §4.D "Close (retry)"),
/// shared by both callers that need the raw result and callers that only
/// want a best-effort close.
fn close_raw(fd: RawFd) -> io::Result<()> {
    loop {
        let rc = unsafe { libc::close(fd) };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Best-effort raw-fd close for fds this module manages outside of
/// `std::fs::File` (whose own `Drop` closes once and swallows the
/// result, the way the standard library always has — retrying a
/// `close()` after `EINTR` risks closing a fd some other thread has
/// since reopened). Used by the descriptor budget probe to release its
/// `dup`'d fds (spec §9 supplement).
pub fn retry_close_raw(fd: RawFd) {
    if let Err(err) = close_raw(fd) {
        warn!(?err, fd, "close() failed");
    }
}

/// `Close` for a local VFD (spec §7: "Close errors: for local files,
/// elevated to error"), matching `LocalFileClose`'s `gp_retry_close` +
/// `elog(ERROR, ...)` on failure in the original. Takes ownership of the
/// `File` so its `Drop` never runs a second, silent close underneath us.
pub fn close_checked(file: File) -> io::Result<()> {
    close_raw(file.into_raw_fd())
}

pub fn remove(path: &Path) -> io::Result<()> {
    std::fs::remove_file(path)
}

pub fn mkdir(path: &Path) -> io::Result<()> {
    std::fs::create_dir(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn seek_set_to_current_is_elided() {
        assert!(!seek_needs_syscall(SeekFrom::Start(5), SeekPos::Known(5)));
        assert!(seek_needs_syscall(SeekFrom::Start(6), SeekPos::Known(5)));
    }

    #[test]
    fn seek_current_zero_known_is_elided() {
        assert!(!seek_needs_syscall(SeekFrom::Current(0), SeekPos::Known(5)));
        assert!(seek_needs_syscall(SeekFrom::Current(0), SeekPos::Unknown));
    }

    #[test]
    fn seek_end_always_needs_syscall() {
        assert!(seek_needs_syscall(SeekFrom::End(0), SeekPos::Known(5)));
    }

    #[test]
    fn fold_offline_handles_current_and_start() {
        assert_eq!(fold_seek_offline(SeekFrom::Start(9), SeekPos::Unknown).unwrap(), 9);
        assert_eq!(
            fold_seek_offline(SeekFrom::Current(3), SeekPos::Known(4)).unwrap(),
            7
        );
        assert!(fold_seek_offline(SeekFrom::Current(-10), SeekPos::Known(4)).is_err());
    }

    #[test]
    fn read_write_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        let mut f = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .unwrap();
        write(&mut f, b"hello").unwrap();
        f.flush().unwrap();
        seek_syscall(&mut f, SeekFrom::Start(0)).unwrap();
        let mut buf = [0u8; 5];
        let n = read(&mut f, &mut buf).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf, b"hello");
    }
}
