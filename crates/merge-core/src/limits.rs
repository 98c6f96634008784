//! Process-wide resource-limit adjustments made once at startup.
//!
//! The original raised `RLIMIT_NOFILE` before scanning (a directory walk with hundreds of
//! concurrent workers can each hold a directory handle open) and raised `RLIMIT_STACK` before
//! merging (its inode-tree teardown recursed deeply). This reimplementation keeps the
//! `RLIMIT_NOFILE` raise as-is but replaces the stack-limit raise with per-thread stack sizing
//! (see `walk::WALK_THREADS` and the hash pipeline), since nothing here recurses unboundedly.

/// Raises `RLIMIT_NOFILE` toward its hard limit. If running as root, also attempts to raise the
/// hard limit itself toward 1,048,576 first, matching the original's root-only bump.
pub fn raise_nofile_limit() {
    unsafe {
        let mut rlim = libc::rlimit { rlim_cur: 0, rlim_max: 0 };
        if libc::getrlimit(libc::RLIMIT_NOFILE, &mut rlim) != 0 {
            log::warn!("getrlimit(RLIMIT_NOFILE): {}", std::io::Error::last_os_error());
            return;
        }

        if libc::geteuid() == 0 && rlim.rlim_max < 1_048_576 {
            rlim.rlim_max = 1_048_576;
        }
        rlim.rlim_cur = rlim.rlim_max;

        if libc::setrlimit(libc::RLIMIT_NOFILE, &rlim) != 0 {
            log::warn!("setrlimit(RLIMIT_NOFILE): {}", std::io::Error::last_os_error());
        }
    }
}
