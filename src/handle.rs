use std::io;
use std::os::fd::{AsRawFd, IntoRawFd, RawFd};

/// A raw file descriptor with explicit ownership.
///
/// Owned handles close the descriptor on drop; weak handles (stdin, stdout)
/// leave it alone. All reads and writes retry transparently on `EINTR`.
pub struct Handle {
    fd: RawFd,
    owned: bool,
}

impl Handle {
    pub fn owned(fd: RawFd) -> Self {
        Handle { fd, owned: true }
    }

    /// Wrap a descriptor without taking ownership; drop will not close it.
    pub fn weak(fd: RawFd) -> Self {
        Handle { fd, owned: false }
    }

    pub fn from_io<T: IntoRawFd>(io: T) -> Self {
        Handle::owned(io.into_raw_fd())
    }

    pub fn raw(&self) -> RawFd {
        self.fd
    }

    pub fn is_valid(&self) -> bool {
        self.fd >= 0
    }

    pub fn set_nonblocking(&self, on: bool) -> io::Result<()> {
        let flags = unsafe { libc::fcntl(self.fd, libc::F_GETFL) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        let flags = if on {
            flags | libc::O_NONBLOCK
        } else {
            flags & !libc::O_NONBLOCK
        };
        if unsafe { libc::fcntl(self.fd, libc::F_SETFL, flags) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn set_cloexec(&self, on: bool) -> io::Result<()> {
        let flags = unsafe { libc::fcntl(self.fd, libc::F_GETFD) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        let flags = if on {
            flags | libc::FD_CLOEXEC
        } else {
            flags & !libc::FD_CLOEXEC
        };
        if unsafe { libc::fcntl(self.fd, libc::F_SETFD, flags) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let n = unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        loop {
            let n = unsafe { libc::write(self.fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    /// Write the whole buffer, retrying short writes. Meant for blocking
    /// descriptors such as the client's stdout.
    pub fn write_all(&self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            let n = self.write(buf)?;
            if n == 0 {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "wrote zero bytes"));
            }
            buf = &buf[n..];
        }
        Ok(())
    }

    /// The soft limit on open descriptors for this process.
    pub fn max_handles() -> usize {
        let mut lim = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut lim) } == 0 {
            lim.rlim_cur as usize
        } else {
            1024
        }
    }
}

impl AsRawFd for Handle {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        if self.owned && self.fd >= 0 {
            unsafe {
                libc::close(self.fd);
            }
        }
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("fd", &self.fd)
            .field("owned", &self.owned)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe() -> (Handle, Handle) {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        (Handle::owned(fds[0]), Handle::owned(fds[1]))
    }

    #[test]
    fn read_write_roundtrip() {
        let (r, w) = pipe();
        w.write_all(b"hello").unwrap();
        let mut buf = [0u8; 16];
        let n = r.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[test]
    fn nonblocking_read_would_block() {
        let (r, _w) = pipe();
        r.set_nonblocking(true).unwrap();
        let mut buf = [0u8; 4];
        let err = r.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn weak_handle_does_not_close() {
        let (r, w) = pipe();
        {
            let _weak = Handle::weak(w.raw());
        }
        // The write end must still be usable after the weak wrapper dropped.
        w.write_all(b"x").unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(r.read(&mut buf).unwrap(), 1);
    }

    #[test]
    fn max_handles_is_sane() {
        assert!(Handle::max_handles() >= 16);
    }
}
