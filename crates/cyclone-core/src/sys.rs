//! Process liveness and termination helpers.

/// Check whether `pid` names a live process.
///
/// On Unix this sends signal 0; `EPERM` still means the process exists.
#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    // SAFETY: kill with signal 0 performs only the permission and existence check.
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if rc == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Liveness cannot be probed cheaply here; trust the record.
#[cfg(not(unix))]
pub fn process_alive(pid: u32) -> bool {
    pid != 0
}

/// Ask `pid` to terminate without waiting for it to exit.
#[cfg(unix)]
pub fn terminate(pid: u32) -> std::io::Result<()> {
    if pid == 0 || pid > i32::MAX as u32 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("invalid pid {}", pid),
        ));
    }
    // SAFETY: plain signal delivery to a single pid.
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
pub fn terminate(pid: u32) -> std::io::Result<()> {
    std::process::Command::new("taskkill")
        .arg("/PID")
        .arg(pid.to_string())
        .arg("/T")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
        .map(|_| ())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_own_process_is_alive() {
        assert!(process_alive(std::process::id()));
    }

    #[test]
    fn test_invalid_pids_are_dead() {
        assert!(!process_alive(0));
        assert!(!process_alive(u32::MAX));
    }

    #[test]
    fn test_reaped_child_is_dead() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        assert!(!process_alive(pid));
    }

    #[test]
    fn test_terminate_rejects_zero() {
        assert!(terminate(0).is_err());
    }
}
