//! The VFD slot: one entry in the table, described in spec §3.

use std::fs::File;

use crate::dfs::DfsHandles;

/// Bits of `Slot::state`.
pub mod state_bits {
    /// Delete the underlying file when the VFD is closed.
    pub const TEMPORARY: u8 = 1 << 0;
    /// Close (but don't necessarily delete) at end of (sub)transaction.
    pub const CLOSE_AT_EOXACT: u8 = 1 << 1;
}

/// Logical seek position, or "unknown" after a failed I/O (§3).
///
/// A known position is always representable in a `u64`; `Unknown` is a
/// distinct state rather than a sentinel value so that accidentally reading
/// it as a number is a compile error, not a silent `u64::MAX`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekPos {
    Known(u64),
    Unknown,
}

impl SeekPos {
    pub fn known(self) -> Option<u64> {
        match self {
            SeekPos::Known(p) => Some(p),
            SeekPos::Unknown => None,
        }
    }
}

/// Which back end a slot's `name` resolves against. Determined, per §3,
/// entirely by whether `dfs_handles` is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Local,
    Dfs,
}

/// Open flags/mode preserved across a reopen. `O_CREAT|O_TRUNC|O_EXCL`
/// are stripped after the first successful open (§3), matching the
/// `reopen_options` stripping in the teacher's `open_with_options`.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenSpec {
    pub read: bool,
    pub write: bool,
    pub append: bool,
    pub create: bool,
    pub truncate: bool,
    pub create_new: bool,
}

impl OpenSpec {
    /// Strip the one-shot creation flags, leaving only what's needed to
    /// reopen an already-existing file the same way.
    pub fn for_reopen(mut self) -> Self {
        self.create = false;
        self.create_new = false;
        self.truncate = false;
        self
    }

    pub fn to_std(self) -> std::fs::OpenOptions {
        let mut o = std::fs::OpenOptions::new();
        o.read(self.read)
            .write(self.write)
            .append(self.append)
            .create(self.create)
            .truncate(self.truncate)
            .create_new(self.create_new);
        o
    }
}

/// Either a real kernel descriptor/File or the closed sentinel.
pub enum RealFd {
    Closed,
    Local(File),
}

impl RealFd {
    pub fn is_closed(&self) -> bool {
        matches!(self, RealFd::Closed)
    }
}

/// One entry in the VFD table. Slot 0 is the sentinel (never logically or
/// physically open); all fields on it stay at their default.
pub struct Slot {
    pub real_fd: RealFd,
    pub name: Option<String>,
    pub open_spec: OpenSpec,
    pub seek_pos: SeekPos,
    pub state: u8,
    pub create_subid: u32,
    pub dfs_handles: Option<DfsHandles>,

    /// Ring links; meaningful only when physically open (or for slot 0,
    /// which anchors the ring).
    pub lru_more_recent: usize,
    pub lru_less_recent: usize,

    /// Freelist link; meaningful only when `name.is_none()`.
    pub next_free: usize,
}

impl Slot {
    pub fn new_unused() -> Self {
        Slot {
            real_fd: RealFd::Closed,
            name: None,
            open_spec: OpenSpec::default(),
            seek_pos: SeekPos::Known(0),
            state: 0,
            create_subid: 0,
            dfs_handles: None,
            lru_more_recent: 0,
            lru_less_recent: 0,
            next_free: 0,
        }
    }

    pub fn kind(&self) -> Kind {
        if self.dfs_handles.is_some() {
            Kind::Dfs
        } else {
            Kind::Local
        }
    }

    pub fn is_logically_open(&self) -> bool {
        self.name.is_some()
    }

    pub fn is_physically_open(&self) -> bool {
        match self.kind() {
            Kind::Local => !self.real_fd.is_closed(),
            Kind::Dfs => self.dfs_handles.as_ref().is_some_and(|h| h.is_open()),
        }
    }

    pub fn reset(&mut self) {
        *self = Slot::new_unused();
    }
}
