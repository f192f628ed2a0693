//! Transaction and process-exit hooks (§4.I).

use tracing::warn;

use crate::error::Result;
use crate::manager::{Vfd, VfdCache};
use crate::slot::{state_bits, Kind};

impl VfdCache {
    /// `AtEOSubXact(commit, mine, parent)`: every slot with
    /// `CLOSE_AT_EOXACT` and `create_subid == mine` is reassigned to
    /// `parent` on commit, or closed (unlinking if `TEMPORARY`) on
    /// abort. The allocated-descriptor registry follows the same rule.
    /// Freeing while iterating uses the swap-remove re-examine pattern
    /// (spec §4.I / §4.H).
    pub fn at_eo_subxact(&mut self, commit: bool, mine: u32, parent: u32) -> Result<()> {
        let candidates: Vec<Vfd> = {
            let table = self.table();
            (0..table.len())
                .filter(|&idx| {
                    idx != crate::table::SENTINEL
                        && table.get(idx).is_logically_open()
                        && table.get(idx).state & state_bits::CLOSE_AT_EOXACT != 0
                        && table.get(idx).create_subid == mine
                })
                .collect()
        };

        for idx in candidates {
            if commit {
                self.table_mut().get_mut(idx).create_subid = parent;
            } else {
                self.close_slot(idx)?;
            }
        }

        // Allocated descriptors: re-examine the current index after each
        // removal, since `remove` swaps the last entry into the freed
        // slot (spec §4.H).
        loop {
            let next = self
                .allocated_mut()
                .indices_with_subid(mine)
                .into_iter()
                .next();
            let idx = match next {
                Some(idx) => idx,
                None => break,
            };
            if commit {
                self.allocated_mut().get_mut(idx).create_subid = parent;
                // Reassigned entries no longer match `mine`; to avoid an
                // infinite loop we must not revisit them. Since
                // `indices_with_subid` recomputes from scratch, and this
                // entry's subid is now `parent`, it won't be returned
                // again.
            } else {
                self.allocated_mut().remove(idx);
            }
        }
        Ok(())
    }

    /// `AtEOXact`: close every slot with `CLOSE_AT_EOXACT` and every
    /// allocated descriptor.
    pub fn at_eoxact(&mut self) -> Result<()> {
        let candidates: Vec<Vfd> = {
            let table = self.table();
            (0..table.len())
                .filter(|&idx| {
                    idx != crate::table::SENTINEL
                        && table.get(idx).is_logically_open()
                        && table.get(idx).state & state_bits::CLOSE_AT_EOXACT != 0
                })
                .collect()
        };
        for idx in candidates {
            self.close_slot(idx)?;
        }

        for idx in self.allocated_mut().all_indices().into_iter().rev() {
            self.free_allocated_any(idx);
        }
        Ok(())
    }

    /// `AtXactCancel`: close every physically-open DFS slot, best-effort
    /// (errors logged as warnings, never propagated) — severs any
    /// half-written remote state before normal cleanup runs.
    pub fn at_xact_cancel(&mut self) {
        let candidates: Vec<Vfd> = {
            let table = self.table();
            (0..table.len())
                .filter(|&idx| {
                    idx != crate::table::SENTINEL
                        && table.get(idx).kind() == Kind::Dfs
                        && table.get(idx).is_physically_open()
                })
                .collect()
        };
        for idx in candidates {
            if let Err(e) = self.physically_close_slot(idx) {
                warn!(vfd = idx, error = %e, "failed to close DFS slot during xact cancel");
            }
        }
    }

    /// `AtProcExit`: close every `TEMPORARY` slot (unlinking them) and
    /// drain the allocated-descriptor registry.
    pub fn at_proc_exit(&mut self) {
        let candidates: Vec<Vfd> = {
            let table = self.table();
            (0..table.len())
                .filter(|&idx| {
                    idx != crate::table::SENTINEL
                        && table.get(idx).is_logically_open()
                        && table.get(idx).state & state_bits::TEMPORARY != 0
                })
                .collect()
        };
        for idx in candidates {
            if let Err(e) = self.close_slot(idx) {
                warn!(vfd = idx, error = %e, "failed to close temp file at process exit");
            }
        }

        for idx in self.allocated_mut().all_indices().into_iter().rev() {
            self.free_allocated_any(idx);
        }
    }

    fn free_allocated_any(&mut self, idx: usize) {
        let _ = self.allocated_mut().remove(idx);
    }
}

#[cfg(test)]
mod tests {
    use crate::config::Config;
    use crate::manager::VfdCache;
    use crate::testing::NullDfsClient;
    use std::sync::Arc;

    fn test_cache(dir: &std::path::Path) -> VfdCache {
        let cfg = Config {
            temp_tablespace_path: dir.to_path_buf(),
            ..Config::default()
        };
        VfdCache::init(cfg, Arc::new(NullDfsClient)).unwrap()
    }

    #[test]
    fn subxact_abort_removes_temp_file_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = test_cache(dir.path());

        let vfd = cache
            .open_temporary("scen2", 1, true, true, true, true, 7)
            .unwrap();
        cache.file_write(vfd, b"hello").unwrap();

        cache.at_eo_subxact(false, 7, 3).unwrap();

        // The temp directory should contain no leftover file.
        let tmp = dir.path().join("pgsql_tmp");
        let remaining: Vec<_> = std::fs::read_dir(&tmp).unwrap().collect();
        assert!(remaining.is_empty());
    }

    #[test]
    fn subxact_commit_reassigns_create_subid() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = test_cache(dir.path());

        let vfd = cache
            .open_temporary("scen3", 1, true, true, true, true, 7)
            .unwrap();
        cache.file_write(vfd, b"hello").unwrap();

        cache.at_eo_subxact(true, 7, 3).unwrap();

        assert!(cache.table().get(vfd).is_logically_open());
        assert_eq!(cache.table().get(vfd).create_subid, 3);
    }

    #[test]
    fn proc_exit_removes_temporary_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = test_cache(dir.path());
        let vfd = cache
            .open_temporary("exit", 1, true, true, true, false, 0)
            .unwrap();
        cache.file_write(vfd, b"x").unwrap();

        cache.at_proc_exit();

        let tmp = dir.path().join("pgsql_tmp");
        let remaining: Vec<_> = std::fs::read_dir(&tmp).unwrap().collect();
        assert!(remaining.is_empty());
    }
}
