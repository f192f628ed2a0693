//! Startup sweep (§4.J): remove stale temp files from prior sessions.

use std::path::Path;

use tracing::{info, warn};

use crate::config::{PG_TEMP_FILES_DIR, PG_TEMP_FILE_PREFIX};

/// `RemovePgTempFiles`: cycle through the `pgsql_tmp` directory of every
/// per-database directory under `<base_dir>/base`, plus `<base_dir>`'s own
/// top-level `pgsql_tmp` (the original's `EXEC_BACKEND` case, where a
/// shared-across-databases temp directory also exists), removing stale
/// temp files from each (spec §4.J; `original_source/.../fd.c:2057-2087`).
pub fn remove_pg_temp_files(base_dir: &Path) {
    let db_root = base_dir.join("base");
    match std::fs::read_dir(&db_root) {
        Ok(entries) => {
            for entry in entries {
                let entry = match entry {
                    Ok(e) => e,
                    Err(e) => {
                        warn!(error = %e, "error reading database directory entry");
                        continue;
                    }
                };
                if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                    continue;
                }
                remove_pg_temp_files_in_dir(&entry.path().join(PG_TEMP_FILES_DIR));
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(dir = %db_root.display(), error = %e, "could not scan database directory"),
    }

    remove_pg_temp_files_in_dir(&base_dir.join(PG_TEMP_FILES_DIR));
}

/// `RemovePgTempFilesInDir`: remove any file in `tmpdir` whose basename
/// starts with `PG_TEMP_FILE_PREFIX`. Unexpected files are logged and
/// preserved. Errors other than "not found" are logged; the sweep always
/// proceeds to the next entry (spec §4.J).
fn remove_pg_temp_files_in_dir(tmpdir: &Path) {
    let entries = match std::fs::read_dir(tmpdir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
        Err(e) => {
            warn!(dir = %tmpdir.display(), error = %e, "could not scan temp directory");
            return;
        }
    };

    for entry in entries {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "error reading temp directory entry");
                continue;
            }
        };
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !name.starts_with(PG_TEMP_FILE_PREFIX) {
            warn!(file = %name, "unexpected file in pgsql_tmp, leaving in place");
            continue;
        }
        match std::fs::remove_file(entry.path()) {
            Ok(()) => info!(file = %name, "removed stale temp file"),
            Err(e) => warn!(file = %name, error = %e, "failed to remove stale temp file"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn removes_temp_files_and_preserves_others() {
        let dir = tempfile::tempdir().unwrap();
        let tmp = dir.path().join(PG_TEMP_FILES_DIR);
        std::fs::create_dir(&tmp).unwrap();
        std::fs::write(tmp.join("pgsql_tmp_foo"), b"x").unwrap();
        std::fs::write(tmp.join("README"), b"keep me").unwrap();

        remove_pg_temp_files(dir.path());

        assert!(!tmp.join("pgsql_tmp_foo").exists());
        assert!(tmp.join("README").exists());
    }

    #[test]
    fn sweeps_every_per_database_directory() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("base");
        for db in ["16384", "16385"] {
            let tmp = base.join(db).join(PG_TEMP_FILES_DIR);
            std::fs::create_dir_all(&tmp).unwrap();
            std::fs::write(tmp.join(format!("pgsql_tmp_{db}")), b"x").unwrap();
        }

        remove_pg_temp_files(dir.path());

        for db in ["16384", "16385"] {
            let tmp = base.join(db).join(PG_TEMP_FILES_DIR);
            assert!(!tmp.join(format!("pgsql_tmp_{db}")).exists());
        }
    }

    #[test]
    fn missing_directory_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        // Should not panic.
        remove_pg_temp_files(dir.path());
    }
}
