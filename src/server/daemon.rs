use crate::error::{MuxError, Result};

/// Fork into the background: detach from the controlling terminal and
/// point stdio at /dev/null. Must run before any event loop state exists.
pub fn daemonize() -> Result<()> {
    use nix::unistd::{fork, setsid, ForkResult};

    match unsafe { fork() }.map_err(|e| MuxError::System(format!("fork failed: {e}")))? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }

    setsid().map_err(|e| MuxError::System(format!("setsid failed: {e}")))?;

    // Do not pin whatever directory the client was launched from.
    let _ = std::env::set_current_dir("/");

    unsafe {
        let fd = libc::open(c"/dev/null".as_ptr(), libc::O_RDWR);
        if fd >= 0 {
            libc::dup2(fd, 0);
            libc::dup2(fd, 1);
            libc::dup2(fd, 2);
            if fd > 2 {
                libc::close(fd);
            }
        }
    }

    Ok(())
}
