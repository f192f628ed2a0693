//! The FD budget probe (§4.A): determine how many real descriptors are
//! safely usable, at backend start.

use std::os::unix::io::RawFd;

use tracing::{error, info};

use crate::config::{Config, MIN_FREE, RESERVED};
use crate::error::VfdError;

/// Upper bound on how many descriptors the probe will try to duplicate,
/// so a misconfigured kernel limit can't make startup hang.
const PROBE_CAP: i32 = 2 << 14;

/// Duplicate descriptor 0 repeatedly until failure or `PROBE_CAP`,
/// returning `(usable, highest_observed)`.
fn count_usable_fds(probe_cap: i32) -> (i32, RawFd) {
    let mut fds: Vec<RawFd> = Vec::new();
    let mut highest: RawFd = -1;
    for _ in 0..probe_cap {
        let fd = unsafe { libc::dup(0) };
        if fd < 0 {
            break;
        }
        highest = highest.max(fd);
        fds.push(fd);
    }
    let usable = fds.len() as i32;
    for fd in fds {
        crate::local::retry_close_raw(fd);
    }
    (usable, highest)
}

/// Run the probe and compute `max_safe_fds` (spec §4.A). Returns the
/// fatal error variant rather than aborting the process directly, so
/// the caller (normally `InitFileAccess`) decides how to fail; tests
/// call this directly to exercise scenario 5 from spec §8.
pub fn set_max_safe_fds(cfg: &Config) -> Result<i32, VfdError> {
    let (usable, highest) = count_usable_fds(PROBE_CAP);
    let already_open = (highest + 1) - usable;
    let max_safe_fds = usable.min(cfg.max_files_per_process - already_open) - RESERVED;

    info!(
        usable,
        already_open, max_safe_fds, "probed usable file descriptors"
    );

    if max_safe_fds < MIN_FREE {
        error!(
            max_safe_fds,
            min_free = MIN_FREE,
            "insufficient file descriptors available to start up"
        );
        return Err(VfdError::InsufficientDescriptorsFatal { max_safe_fds });
    }
    Ok(max_safe_fds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_returns_a_positive_budget_in_test_environment() {
        let cfg = Config::default();
        let max_safe_fds = set_max_safe_fds(&cfg).expect("probe should succeed in test sandbox");
        assert!(max_safe_fds >= MIN_FREE);
    }

    #[test]
    fn probe_underflow_is_fatal() {
        // Force scenario 5 from spec §8: usable=12, already_open=0,
        // max_files_per_process=12 => max_safe_fds = 12 - 10 = 2 < MIN_FREE.
        let usable = 12;
        let already_open = 0;
        let cap = 12;
        let max_safe_fds = usable.min(cap - already_open) - RESERVED;
        assert_eq!(max_safe_fds, 2);
        assert!(max_safe_fds < MIN_FREE);
    }
}
