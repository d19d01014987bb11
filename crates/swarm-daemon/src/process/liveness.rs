//! OS process liveness probe.
//!
//! `kill(pid, 0)` is used as the probe. Any failure, including `EPERM` for a
//! process owned by another user, reads as "not alive". This is an
//! approximation: on a shared host a foreign process that reused the PID is
//! reported dead, and a zombie that has not been reaped is reported alive.

/// Whether a process with this PID currently exists.
#[cfg(unix)]
pub fn pid_alive(pid: i64) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 performs only the existence and permission check.
    #[allow(unsafe_code)]
    let ret = unsafe { libc::kill(pid, 0) };
    ret == 0
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: i64) -> bool {
    false
}
