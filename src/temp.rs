//! Temp-file lifecycle (§4.G): unique-name generation, delete-on-close,
//! close-at-end-of-transaction.

use std::path::PathBuf;

use crate::config::{Config, PG_TEMP_FILE_PREFIX};

/// Composes the path for a temp file. `unique` picks between the
/// per-process-unique naming (`_<pid>_<seq>.<counter>`) and the shared
/// naming (`.<seq>`) schemes from spec §4.G.
pub fn temp_file_path(cfg: &Config, name: &str, seq: u32, unique: bool, pid: u32, counter: u64) -> PathBuf {
    let base = format!("{}_{}", PG_TEMP_FILE_PREFIX, name);
    let suffix = if unique {
        format!("_{pid}_{seq}.{counter}")
    } else {
        format!(".{seq}")
    };
    cfg.temp_dir().join(format!("{base}{suffix}"))
}

/// Process-local monotonic counter feeding the `unique` naming scheme
/// (spec §4.G `counter++`).
#[derive(Default)]
pub struct TempFileCounter(u64);

impl TempFileCounter {
    pub fn new() -> Self {
        TempFileCounter(0)
    }

    pub fn next(&mut self) -> u64 {
        let v = self.0;
        self.0 += 1;
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_name_includes_pid_seq_counter() {
        let cfg = Config::default();
        let p = temp_file_path(&cfg, "sortheap", 3, true, 4242, 7);
        assert_eq!(
            p.file_name().unwrap().to_str().unwrap(),
            "pgsql_tmp_sortheap_4242_3.7"
        );
    }

    #[test]
    fn shared_name_uses_seq_only() {
        let cfg = Config::default();
        let p = temp_file_path(&cfg, "sortheap", 3, false, 4242, 7);
        assert_eq!(
            p.file_name().unwrap().to_str().unwrap(),
            "pgsql_tmp_sortheap.3"
        );
    }

    #[test]
    fn counter_is_monotonic() {
        let mut c = TempFileCounter::new();
        assert_eq!(c.next(), 0);
        assert_eq!(c.next(), 1);
        assert_eq!(c.next(), 2);
    }
}
