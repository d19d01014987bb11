//! Graceful termination signal.

/// Send SIGTERM to `pid`.
#[cfg(unix)]
pub fn send_terminate(pid: u32) -> std::io::Result<()> {
    let pid = i32::try_from(pid)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid out of range"))?;
    // SAFETY: kill(2) has no memory-safety preconditions; pid comes from a
    // child we spawned.
    #[allow(unsafe_code)]
    let ret = unsafe { libc::kill(pid, libc::SIGTERM) };
    if ret == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// No graceful signal outside unix; the caller falls through to a hard kill.
#[cfg(not(unix))]
pub fn send_terminate(_pid: u32) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "graceful termination is unix-only",
    ))
}
