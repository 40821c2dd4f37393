use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{MuxError, Result};
use crate::handle::Handle;

/// Attempts before a blocking connect gives up.
const MAX_CONNECT_TRIES: usize = 4;
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// The server's listening UNIX-domain socket. The socket file is removed
/// when the listener is dropped.
pub struct ListenSocket {
    listener: UnixListener,
    path: PathBuf,
}

impl ListenSocket {
    /// Bind at `path`. A stale socket file left behind by a dead server is
    /// removed; a live server answering on it is an error.
    pub fn bind(path: &Path) -> Result<Self> {
        if path.exists() {
            if UnixStream::connect(path).is_ok() {
                return Err(MuxError::System(format!(
                    "another server is already listening on {}",
                    path.display()
                )));
            }
            debug!(path = %path.display(), "removing stale socket file");
            std::fs::remove_file(path)?;
        }

        let listener = UnixListener::bind(path).map_err(|e| {
            MuxError::System(format!("binding {} failed: {e}", path.display()))
        })?;
        listener.set_nonblocking(true)?;
        Ok(ListenSocket {
            listener,
            path: path.to_path_buf(),
        })
    }

    pub fn raw(&self) -> std::os::fd::RawFd {
        use std::os::fd::AsRawFd;
        self.listener.as_raw_fd()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept one pending connection; `None` when none is queued. The
    /// returned handle is non-blocking and close-on-exec.
    pub fn accept(&self) -> Result<Option<Handle>> {
        match self.listener.accept() {
            Ok((stream, _)) => {
                let handle = Handle::from_io(stream);
                handle.set_nonblocking(true)?;
                handle.set_cloexec(true)?;
                Ok(Some(handle))
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(MuxError::Io(e)),
        }
    }
}

impl Drop for ListenSocket {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Connect to the server socket. With `block` set the call retries a
/// bounded number of times, one second apart, before reporting failure.
pub fn connect(path: &Path, block: bool) -> Result<Handle> {
    let mut tries = 0;
    loop {
        tries += 1;
        match UnixStream::connect(path) {
            Ok(stream) => {
                let handle = Handle::from_io(stream);
                handle.set_cloexec(true)?;
                return Ok(handle);
            }
            Err(e) => {
                if !block || tries >= MAX_CONNECT_TRIES {
                    return Err(MuxError::System(format!(
                        "failed to connect to {}: {e}",
                        path.display()
                    )));
                }
                warn!(path = %path.display(), error = %e, "connect failed, retrying");
                std::thread::sleep(CONNECT_RETRY_DELAY);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_accept_connect() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.sock");
        let listener = ListenSocket::bind(&path).unwrap();
        assert!(listener.accept().unwrap().is_none());

        let client = connect(&path, false).unwrap();
        let server_side = listener.accept().unwrap().expect("connection pending");

        client.write(b"ping").unwrap();
        let mut buf = [0u8; 8];
        let mut n = 0;
        for _ in 0..100 {
            match server_side.read(&mut buf) {
                Ok(got) => {
                    n = got;
                    break;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(e) => panic!("read: {e}"),
            }
        }
        assert_eq!(&buf[..n], b"ping");
    }

    #[test]
    fn stale_socket_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale.sock");
        {
            let _first = ListenSocket::bind(&path).unwrap();
        }
        // Dropping removed the file; simulate a stale leftover.
        std::fs::write(&path, b"").unwrap();
        let _second = ListenSocket::bind(&path).unwrap();
    }

    #[test]
    fn live_socket_refuses_second_bind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("live.sock");
        let _first = ListenSocket::bind(&path).unwrap();
        assert!(ListenSocket::bind(&path).is_err());
    }

    #[test]
    fn connect_to_missing_socket_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope.sock");
        assert!(connect(&path, false).is_err());
    }

    #[test]
    fn socket_file_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone.sock");
        {
            let _listener = ListenSocket::bind(&path).unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }
}
