pub mod client;
pub mod daemon;
pub mod dispatch;
pub mod fd_index;
pub mod session;

use std::collections::HashMap;
use std::fmt::Write as _;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use crate::error::{MuxError, Result};
use crate::handle::Handle;
use crate::ipc::codec;
use crate::ipc::message::{
    ConnectionNotification, DisconnectNotification, KickNotification, MessageKind, Payload,
    ServerShutdownNotification, SessionExitNotification,
};
use crate::poll::{PollSet, SIGNAL_TOKEN};
use crate::signals::{self, SignalSource, SIGCHLD, SIGHUP, SIGINT, SIGTERM};
use crate::socket::ListenSocket;

use client::ClientRegistry;
use fd_index::{FdIndex, FdTag};
use session::SessionRegistry;

/// A bounded poll timeout keeps nonce expiry and child reaping moving even
/// on an idle server.
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Descriptors held back so `accept` and the PTY of a new session always
/// have room.
const FD_KEEP_SPARE: usize = 8;

const EVENT_CAPACITY: usize = 1 << 10;

/// Handler invoked for a control frame: the server, the sending client's
/// id, and the raw payload.
pub type Handler = Arc<dyn Fn(&mut Server, u64, &[u8]) + Send + Sync>;

/// The multiplexer daemon: owns the listening socket, all client and
/// session records, and the readiness loop that moves bytes between them.
///
/// Message handling is table-driven; embedders may override any kind with
/// [`Server::register_handler`] before calling [`Server::run`].
pub struct Server {
    listener: ListenSocket,
    started_at: SystemTime,
    pub(crate) clients: ClientRegistry,
    pub(crate) sessions: SessionRegistry,
    fd_index: FdIndex,
    poll: PollSet,
    dispatch: HashMap<u16, Handler>,
    terminate: Arc<AtomicBool>,
    exit_on_last_session: bool,
    pub(crate) session_ever_created: bool,
}

/// Cloneable flag for interrupting the loop from another context, e.g. a
/// signal handler or a controlling thread.
#[derive(Clone)]
pub struct InterruptHandle {
    flag: Arc<AtomicBool>,
}

impl InterruptHandle {
    pub fn interrupt(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }
}

impl Server {
    pub fn new(listener: ListenSocket) -> Result<Self> {
        let mut server = Server {
            listener,
            started_at: SystemTime::now(),
            clients: ClientRegistry::new(),
            sessions: SessionRegistry::new(),
            fd_index: FdIndex::new(),
            poll: PollSet::new(EVENT_CAPACITY)?,
            dispatch: HashMap::new(),
            terminate: Arc::new(AtomicBool::new(false)),
            exit_on_last_session: false,
            session_ever_created: false,
        };
        dispatch::install_defaults(&mut server);
        Ok(server)
    }

    pub fn socket_path(&self) -> &std::path::Path {
        self.listener.path()
    }

    pub fn when_started(&self) -> SystemTime {
        self.started_at
    }

    /// When set, the loop ends once the last session is gone (and at least
    /// one was ever created).
    pub fn set_exit_if_no_more_sessions(&mut self, exit: bool) {
        self.exit_on_last_session = exit;
    }

    /// Override the handler for a message kind.
    pub fn register_handler(&mut self, kind: MessageKind, handler: Handler) {
        self.dispatch.insert(kind.as_u16(), handler);
    }

    /// Ask the loop to stop. Safe to call any number of times; the first
    /// request wins and the following shutdown runs once.
    pub fn interrupt(&self) {
        self.terminate.store(true, Ordering::SeqCst);
    }

    pub fn interrupted(&self) -> bool {
        self.terminate.load(Ordering::SeqCst)
    }

    /// A handle that can interrupt the loop from outside it.
    pub fn interrupt_handle(&self) -> InterruptHandle {
        InterruptHandle {
            flag: Arc::clone(&self.terminate),
        }
    }

    /// The blocking event loop. Returns when interrupted or when the
    /// exit-on-last-session condition triggers; the caller then runs
    /// [`Server::shutdown`].
    pub fn run(&mut self) -> Result<()> {
        signals::ignore_sigpipe();
        let mut signal_source = SignalSource::new(&[SIGCHLD, SIGINT, SIGTERM, SIGHUP])?;
        signal_source.register(&mut self.poll)?;
        self.poll.listen(self.listener.raw(), true, false)?;
        info!(socket = %self.listener.path().display(), "server listening");

        while !self.interrupted() {
            let batch = self.poll.wait(Some(POLL_TIMEOUT))?;
            for event in batch {
                if event.token == SIGNAL_TOKEN {
                    for signo in signal_source.pending() {
                        if signo == SIGCHLD {
                            self.sessions.collect_dead_children();
                        } else {
                            info!(signo, "received termination signal");
                            self.interrupt();
                        }
                    }
                    continue;
                }

                let fd = event.token as RawFd;
                if fd == self.listener.raw() {
                    self.accept_pending();
                    continue;
                }

                match self.fd_index.get(fd).cloned() {
                    Some(FdTag::Session(name)) => {
                        if event.readable {
                            self.session_data_callback(&name);
                        }
                        if event.writable {
                            self.flush_session(&name);
                        }
                        if let Some(s) = self.sessions.get_mut(&name) {
                            s.channel.try_free_resources();
                        }
                    }
                    Some(FdTag::ClientData(id)) => {
                        if event.readable {
                            self.dispatch_data(id);
                        }
                        if event.writable {
                            self.flush_client_data(id);
                        }
                        if let Some(c) = self.clients.get_mut(id) {
                            if let Some(d) = c.data.as_mut() {
                                d.try_free_resources();
                            }
                        }
                    }
                    Some(FdTag::ClientControl(id)) => {
                        if event.readable {
                            self.dispatch_control(id);
                        }
                        if event.writable {
                            self.flush_client_control(id);
                        }
                        if let Some(c) = self.clients.get_mut(id) {
                            c.control.try_free_resources();
                        }
                    }
                    None => {
                        debug!(fd, "event for descriptor without an entity");
                    }
                }
            }

            self.expire_nonces();
            self.reap_dead_children();
        }
        Ok(())
    }

    /// Graceful teardown: notify clients, close their connections, hang up
    /// each session's child and reap what exits promptly.
    pub fn shutdown(&mut self) {
        if !self.clients.is_empty() {
            info!("detaching all clients");
        }
        for id in self.clients.ids() {
            self.send_control(id, &ServerShutdownNotification {});
            if let Some(c) = self.clients.get_mut(id) {
                let _ = c.control.flush();
            }
            self.client_exit(id);
        }

        if !self.sessions.is_empty() {
            info!("terminating all sessions");
        }
        for name in self.sessions.names() {
            if let Some(s) = self.sessions.get(&name) {
                s.signal(SIGHUP);
            }
        }
        for _ in 0..20 {
            if self.sessions.is_empty() {
                break;
            }
            self.sessions.collect_dead_children();
            for (name, code) in self.sessions.drain_dead_children() {
                self.destroy_session(&name, code);
            }
            std::thread::sleep(Duration::from_millis(25));
        }
        for name in self.sessions.names() {
            self.destroy_session(&name, 0);
        }
    }

    fn accept_pending(&mut self) {
        loop {
            match self.listener.accept() {
                Ok(Some(handle)) => self.admit_client(handle),
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    fn admit_client(&mut self, handle: Handle) {
        let id = {
            let client = self.clients.accept(handle);
            client.id()
        };

        // A full client costs two descriptors and accept needs headroom.
        let max = Handle::max_handles().saturating_sub(FD_KEEP_SPARE);
        if self.fd_index.len() + FD_KEEP_SPARE >= max {
            warn!(
                client = id,
                allocated = self.fd_index.len(),
                "descriptor table nearly full, rejecting client"
            );
            if let Some(c) = self.clients.get_mut(id) {
                let _ = codec::send_message(
                    &mut c.control,
                    &ConnectionNotification {
                        accepted: false,
                        reason: "not enough file descriptors left on server".into(),
                    },
                );
                let _ = c.control.flush();
            }
            self.clients.remove(id);
            return;
        }

        let fd = match self.clients.get(id) {
            Some(c) => c.control.raw(),
            None => return,
        };
        if let Err(e) = self.poll.listen(fd, true, false) {
            warn!(client = id, error = %e, "registering client failed");
            self.clients.remove(id);
            return;
        }
        self.fd_index.insert(fd, FdTag::ClientControl(id));
        info!(client = id, "client connected");
        self.send_control(
            id,
            &ConnectionNotification {
                accepted: true,
                reason: String::new(),
            },
        );
    }

    /// Control connection readiness: buffer what arrived, then pop and
    /// dispatch every complete frame.
    fn dispatch_control(&mut self, id: u64) {
        let mut broken = false;
        if let Some(c) = self.clients.get_mut(id) {
            let chunk = c.control.optimal_read_size();
            match c.control.load(chunk) {
                Ok(_) => {}
                Err(e) => {
                    debug!(client = id, error = %e, "error reading control connection");
                    broken = true;
                }
            }
            if c.control.failed() {
                broken = true;
            }
        } else {
            return;
        }
        if broken {
            self.client_exit(id);
            return;
        }

        loop {
            let frame = {
                let Some(c) = self.clients.get_mut(id) else { return };
                match codec::pop_frame(&mut c.control) {
                    Ok(Some(frame)) => frame,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(client = id, error = %e, "malformed control frame");
                        self.client_exit(id);
                        return;
                    }
                }
            };
            match self.dispatch.get(&frame.kind).cloned() {
                Some(handler) => handler(self, id, &frame.payload),
                None => {
                    debug!(client = id, kind = frame.kind, "unknown message kind, dropping");
                }
            }
            // The handler may have destroyed or repurposed the client.
            if !self.clients.contains(id) {
                return;
            }
        }
    }

    /// Data connection readiness: forward the client's bytes into the PTY
    /// of its attached session.
    fn dispatch_data(&mut self, id: u64) {
        let mut overflowed = false;
        let mut broken = false;
        let mut bytes = Vec::new();
        let mut target = None;

        if let Some(c) = self.clients.get_mut(id) {
            let Some(data) = c.data.as_mut() else { return };
            let chunk = data.optimal_read_size();
            match data.read(chunk) {
                Ok(b) => bytes = b,
                Err(MuxError::ChannelOverflow { size, .. }) => {
                    warn!(client = id, pending = size, "data connection read overflow");
                    overflowed = true;
                }
                Err(e) => {
                    debug!(client = id, error = %e, "error reading data connection");
                }
            }
            broken = c.data.as_ref().is_some_and(|d| d.failed());
            if !bytes.is_empty() {
                c.activity();
            }
            target = c.attached.clone();
        } else {
            return;
        }

        if overflowed {
            self.kick_client(id, "overflow when reading data connection");
            return;
        }

        if !bytes.is_empty() {
            if let Some(name) = target {
                let mut session_broken = false;
                if let Some(s) = self.sessions.get_mut(&name) {
                    match s.channel.write(&bytes) {
                        Ok(_) => {
                            let fd = s.channel.raw();
                            let buffered = s.channel.has_buffered_write();
                            let _ = self.poll.update(fd, true, buffered);
                        }
                        Err(e) => {
                            warn!(session = %name, error = %e, "writing to session failed");
                            session_broken = true;
                        }
                    }
                }
                if session_broken {
                    self.hangup_session(&name);
                }
            }
        }

        if broken {
            self.disconnect_client(id, "data connection lost");
        }
    }

    /// Session PTY readiness: drain the master and fan the bytes out to
    /// every attached client's data channel.
    fn session_data_callback(&mut self, name: &str) {
        let mut bytes = Vec::new();
        let mut session_eof = false;
        let attached: Vec<u64>;

        if let Some(s) = self.sessions.get_mut(name) {
            let chunk = s.channel.optimal_read_size();
            match s.channel.read(chunk) {
                Ok(b) => bytes = b,
                Err(e) => {
                    debug!(session = %name, error = %e, "error reading session PTY");
                }
            }
            if s.channel.failed() {
                session_eof = true;
            }
            if !bytes.is_empty() {
                s.activity();
            }
            if s.channel.has_buffered_read() {
                // More is parked in the ring than this pass consumed.
                self.poll.schedule(s.channel.raw() as usize, true, false);
            }
            attached = s.attached_clients.iter().copied().collect();
        } else {
            return;
        }

        if !bytes.is_empty() {
            for id in attached {
                self.forward_to_client(id, &bytes);
            }
        }

        if session_eof {
            // Stop polling the dead master; the reap pass destroys the
            // session once the child's exit status is known.
            if let Some(s) = self.sessions.get(name) {
                let fd = s.master_fd();
                let _ = self.poll.stop(fd);
                self.fd_index.remove(fd);
            }
        }
    }

    /// Write one fan-out chunk to a client, kicking it on overflow.
    fn forward_to_client(&mut self, id: u64, bytes: &[u8]) {
        let mut overflowed = false;
        let mut broken = false;
        if let Some(c) = self.clients.get_mut(id) {
            let Some(data) = c.data.as_mut() else { return };
            match data.write(bytes) {
                Ok(_) => {
                    let fd = data.raw();
                    let buffered = data.has_buffered_write();
                    let _ = self.poll.update(fd, true, buffered);
                }
                Err(MuxError::ChannelOverflow { size, .. }) => {
                    warn!(client = id, pending = size, "client too slow, write overflow");
                    overflowed = true;
                }
                Err(e) => {
                    debug!(client = id, error = %e, "error writing to client data connection");
                    broken = data.failed();
                }
            }
        } else {
            return;
        }

        if overflowed {
            self.kick_client(id, "overflow when sending session output");
        } else if broken {
            self.client_exit(id);
        }
    }

    fn flush_session(&mut self, name: &str) {
        let mut broken = false;
        if let Some(s) = self.sessions.get_mut(name) {
            match s.channel.flush() {
                Ok(_) => {
                    let fd = s.channel.raw();
                    let buffered = s.channel.has_buffered_write();
                    let _ = self.poll.update(fd, true, buffered);
                }
                Err(e) => {
                    debug!(session = %name, error = %e, "flushing session writer failed");
                    broken = true;
                }
            }
        }
        if broken {
            self.hangup_session(name);
        }
    }

    fn flush_client_data(&mut self, id: u64) {
        let mut broken = false;
        if let Some(c) = self.clients.get_mut(id) {
            if let Some(data) = c.data.as_mut() {
                match data.flush() {
                    Ok(_) => {
                        let fd = data.raw();
                        let buffered = data.has_buffered_write();
                        let _ = self.poll.update(fd, true, buffered);
                    }
                    Err(_) => broken = true,
                }
            }
        }
        if broken {
            self.disconnect_client(id, "data connection lost");
        }
    }

    fn flush_client_control(&mut self, id: u64) {
        let mut broken = false;
        if let Some(c) = self.clients.get_mut(id) {
            match c.control.flush() {
                Ok(_) => {
                    let fd = c.control.raw();
                    let buffered = c.control.has_buffered_write();
                    let _ = self.poll.update(fd, true, buffered);
                }
                Err(_) => broken = true,
            }
        }
        if broken {
            self.client_exit(id);
        }
    }

    /// Send a control message to a client; unsent bytes arm write interest.
    pub(crate) fn send_control<T: Payload>(&mut self, id: u64, msg: &T) {
        if let Some(c) = self.clients.get_mut(id) {
            let fd = c.control.raw();
            match codec::send_message(&mut c.control, msg) {
                Ok(_) => {
                    let buffered = c.control.has_buffered_write();
                    let _ = self.poll.update(fd, true, buffered);
                }
                Err(e) => {
                    debug!(client = id, error = %e, "sending control message failed");
                }
            }
        }
    }

    /// Send a control-plane message over the data channel. Only used for
    /// the final handshake acknowledgement.
    pub(crate) fn send_on_data<T: Payload>(&mut self, id: u64, msg: &T) {
        if let Some(c) = self.clients.get_mut(id) {
            if let Some(data) = c.data.as_mut() {
                let fd = data.raw();
                match codec::send_message(data, msg) {
                    Ok(_) => {
                        let buffered = data.has_buffered_write();
                        let _ = self.poll.update(fd, true, buffered);
                    }
                    Err(e) => {
                        debug!(client = id, error = %e, "sending on data channel failed");
                    }
                }
            }
        }
    }

    /// Re-tag the requester's connection as `main_id`'s data channel and
    /// drop the transient client record.
    pub(crate) fn turn_into_data_socket(&mut self, main_id: u64, requester_id: u64) -> bool {
        match self.clients.promote_to_data(main_id, requester_id) {
            Some(fd) => {
                self.fd_index.insert(fd, FdTag::ClientData(main_id));
                debug!(
                    client = main_id,
                    transient = requester_id,
                    "data connection established"
                );
                true
            }
            None => false,
        }
    }

    pub(crate) fn attach_client(&mut self, id: u64, name: &str) -> bool {
        if self.clients.get(id).is_none() || !self.sessions.contains(name) {
            return false;
        }
        if let Some(previous) = self.clients.get(id).and_then(|c| c.attached.clone()) {
            self.detach_client(id, &previous);
        }
        let window = {
            let c = self.clients.get_mut(id).unwrap();
            c.attached = Some(name.to_string());
            c.window
        };
        let s = self.sessions.get_mut(name).unwrap();
        s.attached_clients.insert(id);
        if window != (0, 0) {
            let _ = s.resize(window.0, window.1);
        }
        info!(client = id, session = %name, "client attached");
        true
    }

    pub(crate) fn detach_client(&mut self, id: u64, name: &str) {
        if let Some(c) = self.clients.get_mut(id) {
            if c.attached.as_deref() == Some(name) {
                c.attached = None;
            }
        }
        if let Some(s) = self.sessions.get_mut(name) {
            s.attached_clients.remove(&id);
        }
        info!(client = id, session = %name, "client detached");
    }

    /// Remove a client entirely: poll entries, index tags, attach set.
    pub(crate) fn client_exit(&mut self, id: u64) {
        let Some(client) = self.clients.remove(id) else { return };
        info!(client = id, "client exited");

        if let Some(data) = &client.data {
            let fd = data.raw();
            let _ = self.poll.stop(fd);
            self.fd_index.remove(fd);
        }
        let fd = client.control.raw();
        let _ = self.poll.stop(fd);
        self.fd_index.remove(fd);

        if let Some(name) = &client.attached {
            if let Some(s) = self.sessions.get_mut(name) {
                s.attached_clients.remove(&id);
            }
        }
    }

    /// Drop a client whose data channel broke while control still works,
    /// telling it why.
    pub(crate) fn disconnect_client(&mut self, id: u64, reason: &str) {
        self.send_control(
            id,
            &DisconnectNotification {
                reason: reason.to_string(),
            },
        );
        if let Some(c) = self.clients.get_mut(id) {
            let _ = c.control.flush();
        }
        self.client_exit(id);
    }

    /// Disconnect a misbehaving client with a reason.
    pub(crate) fn kick_client(&mut self, id: u64, reason: &str) {
        self.send_control(
            id,
            &KickNotification {
                reason: reason.to_string(),
            },
        );
        if let Some(c) = self.clients.get_mut(id) {
            let _ = c.control.flush();
        }
        self.client_exit(id);
    }

    /// Tear down a session whose PTY channel broke while the child may
    /// still be alive.
    fn hangup_session(&mut self, name: &str) {
        if let Some(s) = self.sessions.get(name) {
            s.signal(SIGHUP);
        }
        self.destroy_session(name, 0);
    }

    /// Remove a session and notify every attached client exactly once.
    pub(crate) fn destroy_session(&mut self, name: &str, exit_code: i32) {
        let Some(session) = self.sessions.remove(name) else { return };
        info!(session = %name, exit_code, "session exited");

        let fd = session.master_fd();
        let _ = self.poll.stop(fd);
        self.fd_index.remove(fd);

        let attached: Vec<u64> = session.attached_clients.iter().copied().collect();
        for id in attached {
            if let Some(c) = self.clients.get_mut(id) {
                c.attached = None;
            }
            self.send_control(
                id,
                &SessionExitNotification {
                    name: name.to_string(),
                    code: exit_code,
                },
            );
        }

        if self.sessions.is_empty() && self.exit_on_last_session && self.session_ever_created {
            info!("last session gone, leaving the loop");
            self.interrupt();
        }
    }

    fn expire_nonces(&mut self) {
        for c in self.clients.iter_mut() {
            c.expire_nonce();
        }
    }

    fn reap_dead_children(&mut self) {
        for (name, code) in self.sessions.drain_dead_children() {
            self.destroy_session(&name, code);
        }
        // A PTY that hit EOF before SIGCHLD was seen parks the session with
        // a failed channel; poll its child directly.
        let stale: Vec<String> = self
            .sessions
            .iter()
            .filter(|s| s.channel.failed())
            .map(|s| s.name().to_string())
            .collect();
        for name in stale {
            let code = self.sessions.get_mut(&name).and_then(|s| s.try_reap());
            if let Some(code) = code {
                self.destroy_session(&name, code);
            }
        }
    }

    /// Human-readable diagnostic dump; not machine-parseable.
    pub fn statistics(&self) -> String {
        let mut out = String::new();
        let started = self
            .started_at
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let _ = writeln!(out, "MonoMux server on '{}'", self.listener.path().display());
        let _ = writeln!(out, "  started at (unix) : {started}");
        let _ = writeln!(out, "  connected clients : {}", self.clients.len());
        let _ = writeln!(out, "  running sessions  : {}", self.sessions.len());
        let _ = writeln!(out, "  open descriptors  : {}", self.fd_index.len());

        for s in self.sessions.iter() {
            let _ = writeln!(out, "session '{}'", s.name());
            let _ = writeln!(out, "  created (unix) : {}", s.created_unix());
            let _ = writeln!(out, "  child pid      : {}", s.child_pid());
            let _ = writeln!(
                out,
                "  attached       : {:?}",
                s.attached_clients.iter().collect::<Vec<_>>()
            );
            for line in s.channel.statistics().lines() {
                let _ = writeln!(out, "  {line}");
            }
        }
        for c in self.clients.iter() {
            let _ = writeln!(out, "client '{}'", c.id());
            let _ = writeln!(
                out,
                "  attached to : {}",
                c.attached.as_deref().unwrap_or("-")
            );
            for line in c.control.statistics().lines() {
                let _ = writeln!(out, "  {line}");
            }
            if let Some(d) = &c.data {
                for line in d.statistics().lines() {
                    let _ = writeln!(out, "  {line}");
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_server() -> (Server, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let listener = ListenSocket::bind(&dir.path().join("srv.sock")).unwrap();
        (Server::new(listener).unwrap(), dir)
    }

    #[test]
    fn interrupt_is_idempotent() {
        let (server, _dir) = test_server();
        assert!(!server.interrupted());
        server.interrupt();
        server.interrupt();
        server.interrupt();
        assert!(server.interrupted());
    }

    #[test]
    fn shutdown_twice_is_a_no_op() {
        let (mut server, _dir) = test_server();
        server.shutdown();
        server.shutdown();
        assert!(server.clients.is_empty());
        assert!(server.sessions.is_empty());
    }

    #[test]
    fn statistics_mentions_socket() {
        let (server, _dir) = test_server();
        let stats = server.statistics();
        assert!(stats.contains("MonoMux server"));
        assert!(stats.contains("srv.sock"));
    }

    #[test]
    fn attach_set_stays_consistent() {
        let (mut server, _dir) = test_server();

        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        unsafe {
            libc::close(fds[1]);
        }
        let client_id = server.clients.accept(Handle::owned(fds[0])).id();

        let sock = server.socket_path().to_path_buf();
        let opts = crate::ipc::message::SpawnOptions {
            program: "/bin/cat".into(),
            ..Default::default()
        };
        let name = {
            let s = server.sessions.spawn("t", &opts, &sock).unwrap();
            s.name().to_string()
        };

        assert!(server.attach_client(client_id, &name));
        assert_eq!(
            server.clients.get(client_id).unwrap().attached.as_deref(),
            Some(name.as_str())
        );
        assert!(server
            .sessions
            .get(&name)
            .unwrap()
            .attached_clients
            .contains(&client_id));

        server.detach_client(client_id, &name);
        assert!(server.clients.get(client_id).unwrap().attached.is_none());
        assert!(!server
            .sessions
            .get(&name)
            .unwrap()
            .attached_clients
            .contains(&client_id));

        // Client teardown clears the session-side reference too.
        assert!(server.attach_client(client_id, &name));
        server.client_exit(client_id);
        assert!(!server
            .sessions
            .get(&name)
            .unwrap()
            .attached_clients
            .contains(&client_id));

        if let Some(s) = server.sessions.get(&name) {
            s.signal(libc::SIGKILL);
        }
        server.destroy_session(&name, 0);
        assert!(server.sessions.is_empty());
    }

    #[test]
    fn default_handlers_cover_all_requests() {
        let (server, _dir) = test_server();
        for kind in [
            MessageKind::ClientIdRequest,
            MessageKind::DataSocketRequest,
            MessageKind::SessionListRequest,
            MessageKind::MakeSessionRequest,
            MessageKind::AttachRequest,
            MessageKind::DetachRequest,
            MessageKind::SignalRequest,
            MessageKind::ResizeRequest,
            MessageKind::KeepaliveRequest,
            MessageKind::StatisticsRequest,
        ] {
            assert!(
                server.dispatch.contains_key(&kind.as_u16()),
                "no default handler for {kind:?}"
            );
        }
    }
}
