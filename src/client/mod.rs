pub mod terminal;

use std::collections::HashMap;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use crate::channel::BufferedChannel;
use crate::error::{MuxError, Result};
use crate::handle::Handle;
use crate::ipc::codec;
use crate::ipc::message::{
    AttachRequest, AttachResponse, ClientId, ClientIdRequest, ClientIdResponse,
    ConnectionNotification, DataSocketRequest, DataSocketResponse, DetachMode,
    DetachNotification, DetachRequest, DetachResponse, DisconnectNotification, KickNotification,
    MakeSessionRequest, MakeSessionResponse, MessageKind, Payload, ResizeRequest,
    ServerShutdownNotification, SessionExitNotification, SessionInfo, SessionListRequest,
    SessionListResponse, SignalRequest, SpawnOptions, StatisticsRequest, StatisticsResponse,
};
use crate::poll::{PollSet, SIGNAL_TOKEN};
use crate::signals::{self, SignalSource, SIGHUP, SIGINT, SIGTERM, SIGWINCH};
use crate::socket;

const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Frames of other kinds tolerated while waiting for one response.
const MAX_SKIPPED_FRAMES: usize = 8;

/// Why the client loop ended. The first recorded reason wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    None,
    /// Internal logic or connection failure.
    Failed,
    /// Killed by the user.
    Terminated,
    /// The controlling terminal went away.
    Hangup,
    /// Gracefully detached from the session.
    Detached,
    /// The attached session's process exited.
    SessionExit,
    /// The server shut down.
    ServerExit,
    /// The server kicked this client.
    ServerKicked,
}

#[derive(Debug, Clone)]
pub struct ExitState {
    pub reason: ExitReason,
    pub code: i32,
    pub message: String,
}

type ClientHandler = Rc<dyn Fn(&mut Client, &[u8])>;

/// A connection to a running server: the control channel opened first, the
/// data channel bound to it by the handshake, and the mirror event loop
/// pumping the user's terminal against both.
pub struct Client {
    socket_path: PathBuf,
    control: BufferedChannel,
    data: Option<BufferedChannel>,
    poll: Option<PollSet>,

    id: Option<u64>,
    nonce: Option<u64>,
    attached_session: Option<SessionInfo>,
    attached: bool,

    input: Option<RawFd>,
    output: RawFd,

    control_enabled: bool,
    data_enabled: bool,
    input_enabled: bool,

    dispatch: HashMap<u16, ClientHandler>,
    external_event_processor: Option<Box<dyn FnMut(&mut Client)>>,

    exit: ExitState,
    terminate: bool,
}

impl Client {
    /// Open the control connection and consume the server's greeting.
    /// With `block`, connection refusal is retried a bounded number of
    /// times (the server may still be starting up).
    pub fn connect(path: &Path, block: bool) -> Result<Client> {
        let handle = socket::connect(path, block)?;
        let mut control = BufferedChannel::duplex(handle, "control".into());
        let greeting: ConnectionNotification = codec::receive_message(&mut control)?;
        if !greeting.accepted {
            return Err(MuxError::System(format!(
                "server rejected connection: {}",
                greeting.reason
            )));
        }
        Ok(Client::new(path.to_path_buf(), control))
    }

    fn new(socket_path: PathBuf, control: BufferedChannel) -> Client {
        let mut client = Client {
            socket_path,
            control,
            data: None,
            poll: None,
            id: None,
            nonce: None,
            attached_session: None,
            attached: false,
            input: None,
            output: 1,
            control_enabled: false,
            data_enabled: false,
            input_enabled: false,
            dispatch: HashMap::new(),
            external_event_processor: None,
            exit: ExitState {
                reason: ExitReason::None,
                code: 0,
                message: String::new(),
            },
            terminate: false,
        };
        client.install_default_handlers();
        client
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn id(&self) -> Option<u64> {
        self.id
    }

    pub fn attached(&self) -> bool {
        self.attached
    }

    pub fn attached_session(&self) -> Option<&SessionInfo> {
        self.attached_session.as_ref()
    }

    pub fn exit_state(&self) -> &ExitState {
        &self.exit
    }

    /// Watch this descriptor as the user-facing input (normally stdin).
    /// The descriptor is a weak reference and never closed.
    pub fn set_input(&mut self, fd: RawFd) {
        self.input = Some(fd);
    }

    /// Where session output is written (normally stdout). Weak, never
    /// closed.
    pub fn set_output(&mut self, fd: RawFd) {
        self.output = fd;
    }

    /// Override the default handling of a message kind.
    pub fn register_message_handler(&mut self, kind: MessageKind, handler: ClientHandler) {
        self.dispatch.insert(kind.as_u16(), handler);
    }

    /// Invoked once per loop iteration, before blocking in the poller.
    pub fn set_external_event_processor(&mut self, f: Box<dyn FnMut(&mut Client)>) {
        self.external_event_processor = Some(f);
    }

    fn install_default_handlers(&mut self) {
        self.register_message_handler(MessageKind::ClientIdResponse, Rc::new(on_client_id));
        self.register_message_handler(MessageKind::DetachNotification, Rc::new(on_detached));
        self.register_message_handler(MessageKind::SessionExitNotification, Rc::new(on_session_exit));
        self.register_message_handler(
            MessageKind::ServerShutdownNotification,
            Rc::new(on_server_shutdown),
        );
        self.register_message_handler(MessageKind::KickNotification, Rc::new(on_kicked));
        self.register_message_handler(MessageKind::DisconnectNotification, Rc::new(on_disconnected));
        self.register_message_handler(MessageKind::KeepaliveResponse, Rc::new(|_, _| {}));
    }

    /// Record the loop's exit; only the first reason sticks.
    pub fn set_exit(&mut self, reason: ExitReason, code: i32, message: impl Into<String>) {
        if self.exit.reason != ExitReason::None {
            self.terminate = true;
            return;
        }
        self.exit = ExitState {
            reason,
            code,
            message: message.into(),
        };
        self.terminate = true;
    }

    // ---- handshake ----------------------------------------------------

    /// The three-phase handshake: learn our id and a nonce, open a second
    /// connection and present them to bind it as the data channel, then
    /// obtain a fresh nonce for later use.
    pub fn handshake(&mut self) -> Result<()> {
        self.request_identity()?;

        let handle = socket::connect(&self.socket_path, false)?;
        let mut data = BufferedChannel::duplex(handle, "data".into());
        let greeting: ConnectionNotification = codec::receive_message(&mut data)?;
        if !greeting.accepted {
            return Err(MuxError::System(format!(
                "server rejected data connection: {}",
                greeting.reason
            )));
        }

        let id = self
            .id
            .ok_or_else(|| MuxError::Protocol("no client id after identity request".into()))?;
        let nonce = self
            .nonce
            .take()
            .ok_or_else(|| MuxError::Nonce("no nonce to present".into()))?;
        codec::send_message(&mut data, &DataSocketRequest {
            client: ClientId { id, nonce },
        })?;
        let response: DataSocketResponse = codec::receive_message(&mut data)?;
        if !response.success {
            return Err(MuxError::Nonce(
                "server rejected establishment of the data connection".into(),
            ));
        }
        self.data = Some(data);

        // The nonce was spent on the data connection; hold a fresh one.
        self.request_identity()?;
        info!(id, "handshake complete");
        Ok(())
    }

    fn request_identity(&mut self) -> Result<()> {
        self.with_control_inhibited(|c| {
            codec::send_message(&mut c.control, &ClientIdRequest {})?;
            let response: ClientIdResponse = c.receive_response()?;
            c.id = Some(response.client.id);
            c.nonce = Some(response.client.nonce);
            Ok(())
        })
    }

    // ---- synchronous requests -----------------------------------------

    pub fn request_session_list(&mut self) -> Result<Vec<SessionInfo>> {
        self.with_control_inhibited(|c| {
            codec::send_message(&mut c.control, &SessionListRequest {})?;
            let response: SessionListResponse = c.receive_response()?;
            Ok(response.sessions)
        })
    }

    /// Ask the server to create a session; returns the actual name, which
    /// may differ from the requested one.
    pub fn request_make_session(&mut self, name: &str, spawn: SpawnOptions) -> Result<String> {
        self.with_control_inhibited(|c| {
            codec::send_message(&mut c.control, &MakeSessionRequest {
                name: name.to_string(),
                spawn,
            })?;
            let response: MakeSessionResponse = c.receive_response()?;
            if !response.success {
                return Err(MuxError::System(format!(
                    "session creation for '{name}' failed on the server"
                )));
            }
            Ok(response.name)
        })
    }

    pub fn request_attach(&mut self, name: &str) -> Result<bool> {
        let result = self.with_control_inhibited(|c| {
            codec::send_message(&mut c.control, &AttachRequest {
                name: name.to_string(),
            })?;
            let response: AttachResponse = c.receive_response()?;
            Ok::<AttachResponse, MuxError>(response)
        })?;
        self.attached = result.success;
        if result.success {
            self.attached_session = result.session;
        }
        Ok(self.attached)
    }

    pub fn request_detach(&mut self, mode: DetachMode) -> Result<()> {
        self.with_control_inhibited(|c| {
            codec::send_message(&mut c.control, &DetachRequest { mode })?;
            let _response: DetachResponse = c.receive_response()?;
            Ok(())
        })
    }

    pub fn request_statistics(&mut self) -> Result<String> {
        self.with_control_inhibited(|c| {
            codec::send_message(&mut c.control, &StatisticsRequest {})?;
            let response: StatisticsResponse = c.receive_response()?;
            Ok(response.contents)
        })
    }

    /// Ask the server to deliver a signal to the attached session.
    pub fn send_signal(&mut self, signo: i32) {
        let _ = codec::send_message(&mut self.control, &SignalRequest { signo });
        self.arm_control_write_interest();
    }

    /// Tell the server the terminal changed size.
    pub fn notify_window_size(&mut self, rows: u16, cols: u16) {
        let _ = codec::send_message(&mut self.control, &ResizeRequest { rows, cols });
        self.arm_control_write_interest();
    }

    /// Push raw bytes toward the session.
    pub fn send_data(&mut self, bytes: &[u8]) {
        let Some(data) = self.data.as_mut() else {
            warn!("send_data without an established data connection");
            return;
        };
        match data.write(bytes) {
            Ok(_) => {
                let fd = data.raw();
                let buffered = data.has_buffered_write();
                if let Some(poll) = self.poll.as_mut() {
                    let _ = poll.update(fd, true, buffered);
                }
            }
            Err(e) => {
                debug!(error = %e, "writing to data connection failed");
                if self.data.as_ref().is_some_and(|d| d.failed()) {
                    self.set_exit(ExitReason::Failed, -1, "lost server");
                }
            }
        }
    }

    /// Wait for a response frame of the expected kind on the (blocking)
    /// control channel. A bounded number of interleaved notifications is
    /// dispatched normally rather than treated as protocol errors.
    fn receive_response<T: Payload>(&mut self) -> Result<T> {
        let mut skipped = 0;
        loop {
            let frame = {
                loop {
                    if let Some(frame) = codec::pop_frame(&mut self.control)? {
                        break frame;
                    }
                    let chunk = self.control.optimal_read_size();
                    self.control.load(chunk)?;
                    if self.control.failed() {
                        return Err(MuxError::ChannelFailed(
                            self.control.identifier().to_string(),
                        ));
                    }
                }
            };
            if frame.kind == T::KIND.as_u16() {
                return codec::decode_payload(&frame.payload);
            }
            skipped += 1;
            if skipped > MAX_SKIPPED_FRAMES {
                return Err(MuxError::Protocol(format!(
                    "expected message kind {}, flooded with others",
                    T::KIND.as_u16()
                )));
            }
            trace!(kind = frame.kind, "interleaved frame while awaiting response");
            self.dispatch_frame(frame.kind, &frame.payload);
        }
    }

    fn dispatch_frame(&mut self, kind: u16, payload: &[u8]) {
        match self.dispatch.get(&kind).cloned() {
            Some(handler) => handler(self, payload),
            None => debug!(kind, "unknown message kind, dropping"),
        }
    }

    // ---- the event loop -----------------------------------------------

    /// The mirror loop: terminal input to the data socket, data-socket
    /// output to the terminal, control frames to the dispatcher, SIGWINCH
    /// to a resize request.
    pub fn run(&mut self) -> Result<()> {
        let input = self
            .input
            .ok_or_else(|| MuxError::System("client input is not connected".into()))?;
        if self.data.is_none() {
            return Err(MuxError::System("client is not connected to a server".into()));
        }

        signals::ignore_sigpipe();
        let mut poll = PollSet::new(16)?;
        let mut signal_source = SignalSource::new(&[SIGWINCH, SIGINT, SIGTERM, SIGHUP])?;
        signal_source.register(&mut poll)?;
        self.poll = Some(poll);

        self.control.handle().set_nonblocking(true)?;
        self.data.as_ref().unwrap().handle().set_nonblocking(true)?;

        self.enable_control_response();
        self.enable_data_socket();
        self.enable_input();

        while !self.terminate {
            if self.control.has_buffered_write() {
                let _ = self.control.flush();
            }
            if let Some(mut f) = self.external_event_processor.take() {
                f(self);
                self.external_event_processor = Some(f);
            }
            self.control.try_free_resources();
            if let Some(d) = self.data.as_mut() {
                d.try_free_resources();
            }

            let batch = self
                .poll
                .as_mut()
                .unwrap()
                .wait(Some(POLL_TIMEOUT))?;
            for event in batch {
                if event.token == SIGNAL_TOKEN {
                    for signo in signal_source.pending() {
                        self.handle_signal(signo);
                    }
                    continue;
                }
                let fd = event.token as RawFd;
                if Some(fd) == self.data.as_ref().map(|d| d.raw()) {
                    if event.readable {
                        self.data_callback();
                    }
                    if event.writable {
                        self.flush_data_socket();
                    }
                } else if fd == input {
                    if event.readable {
                        self.input_callback(input);
                    }
                } else if fd == self.control.raw() {
                    if event.readable {
                        self.control_callback();
                    }
                    if event.writable {
                        let _ = self.control.flush();
                        self.arm_control_write_interest();
                    }
                }
            }
        }

        self.disable_input();
        self.disable_data_socket();
        self.disable_control_response();
        self.poll = None;
        Ok(())
    }

    fn handle_signal(&mut self, signo: i32) {
        match signo {
            s if s == SIGWINCH => {
                if let Ok((rows, cols)) = terminal::window_size() {
                    self.notify_window_size(rows, cols);
                }
            }
            s if s == SIGHUP => self.set_exit(ExitReason::Hangup, 0, ""),
            s if s == SIGINT || s == SIGTERM => self.set_exit(ExitReason::Terminated, 0, ""),
            _ => {}
        }
    }

    /// Session bytes arrived: write them verbatim to the terminal.
    fn data_callback(&mut self) {
        let Some(data) = self.data.as_mut() else { return };
        let chunk = data.optimal_read_size();
        let bytes = match data.read(chunk) {
            Ok(b) => b,
            Err(e) => {
                debug!(error = %e, "error reading data connection");
                Vec::new()
            }
        };
        let failed = data.failed();
        let pending = data.has_buffered_read();
        let fd = data.raw();

        if !bytes.is_empty() {
            let out = Handle::weak(self.output);
            if let Err(e) = out.write_all(&bytes) {
                warn!(error = %e, "writing to terminal failed");
                self.set_exit(ExitReason::Failed, -1, "lost terminal output");
                return;
            }
        }
        if failed {
            self.set_exit(ExitReason::Failed, -1, "lost server");
            return;
        }
        if pending {
            if let Some(poll) = self.poll.as_mut() {
                poll.schedule(fd as usize, true, false);
            }
        }
    }

    /// Terminal input arrived: ship it to the session verbatim.
    fn input_callback(&mut self, input: RawFd) {
        let mut buf = [0u8; 4096];
        match Handle::weak(input).read(&mut buf) {
            Ok(0) => self.set_exit(ExitReason::Hangup, 0, "lost tty"),
            Ok(n) => self.send_data(&buf[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => {
                warn!(error = %e, "error reading terminal input");
                self.set_exit(ExitReason::Failed, -1, "lost terminal input");
            }
        }
    }

    /// Control frames arrived: dispatch notifications.
    fn control_callback(&mut self) {
        let chunk = self.control.optimal_read_size();
        if let Err(e) = self.control.load(chunk) {
            debug!(error = %e, "error reading control connection");
        }
        if self.control.failed() {
            self.set_exit(ExitReason::Failed, -1, "lost server");
            return;
        }
        loop {
            match codec::pop_frame(&mut self.control) {
                Ok(Some(frame)) => self.dispatch_frame(frame.kind, &frame.payload),
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "malformed control frame");
                    self.set_exit(ExitReason::Failed, -1, "protocol failure");
                    return;
                }
            }
        }
    }

    fn flush_data_socket(&mut self) {
        if let Some(data) = self.data.as_mut() {
            let _ = data.flush();
            let fd = data.raw();
            let buffered = data.has_buffered_write();
            if let Some(poll) = self.poll.as_mut() {
                let _ = poll.update(fd, true, buffered);
            }
        }
    }

    fn arm_control_write_interest(&mut self) {
        let fd = self.control.raw();
        let buffered = self.control.has_buffered_write();
        if let Some(poll) = self.poll.as_mut() {
            let _ = poll.update(fd, true, buffered);
        }
    }

    // ---- polling inhibitors -------------------------------------------

    pub fn enable_control_response(&mut self) {
        let fd = self.control.raw();
        if let Some(poll) = self.poll.as_mut() {
            if !poll.is_listening(fd) {
                let _ = poll.listen(fd, true, false);
            }
        }
        self.control_enabled = true;
    }

    pub fn disable_control_response(&mut self) {
        let fd = self.control.raw();
        if let Some(poll) = self.poll.as_mut() {
            let _ = poll.stop(fd);
        }
        self.control_enabled = false;
    }

    pub fn enable_data_socket(&mut self) {
        let Some(fd) = self.data.as_ref().map(|d| d.raw()) else { return };
        if let Some(poll) = self.poll.as_mut() {
            if !poll.is_listening(fd) {
                let _ = poll.listen(fd, true, false);
            }
        }
        self.data_enabled = true;
    }

    pub fn disable_data_socket(&mut self) {
        let Some(fd) = self.data.as_ref().map(|d| d.raw()) else { return };
        if let Some(poll) = self.poll.as_mut() {
            let _ = poll.stop(fd);
        }
        self.data_enabled = false;
    }

    pub fn enable_input(&mut self) {
        let Some(fd) = self.input else { return };
        if let Some(poll) = self.poll.as_mut() {
            if !poll.is_listening(fd) {
                let _ = poll.listen(fd, true, false);
            }
        }
        self.input_enabled = true;
    }

    pub fn disable_input(&mut self) {
        let Some(fd) = self.input else { return };
        if let Some(poll) = self.poll.as_mut() {
            let _ = poll.stop(fd);
        }
        self.input_enabled = false;
    }

    /// Run `f` with control-channel polling suspended, restoring the prior
    /// state on the way out. Needed when a request helper must read its
    /// response synchronously without racing the background dispatcher.
    pub fn with_control_inhibited<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        let was_enabled = self.control_enabled;
        if was_enabled {
            self.disable_control_response();
        }
        let result = f(self);
        if was_enabled {
            self.enable_control_response();
        }
        result
    }

    /// As [`Client::with_control_inhibited`], for the data channel.
    pub fn with_data_inhibited<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        let was_enabled = self.data_enabled;
        if was_enabled {
            self.disable_data_socket();
        }
        let result = f(self);
        if was_enabled {
            self.enable_data_socket();
        }
        result
    }

    /// As [`Client::with_control_inhibited`], for the input descriptor.
    pub fn with_input_inhibited<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        let was_enabled = self.input_enabled;
        if was_enabled {
            self.disable_input();
        }
        let result = f(self);
        if was_enabled {
            self.enable_input();
        }
        result
    }
}

// ---- default notification handlers ------------------------------------

fn on_client_id(client: &mut Client, payload: &[u8]) {
    let Ok(msg) = codec::decode_payload::<ClientIdResponse>(payload) else { return };
    client.id = Some(msg.client.id);
    client.nonce = Some(msg.client.nonce);
    trace!(id = msg.client.id, "identity refreshed");
}

fn on_detached(client: &mut Client, _payload: &[u8]) {
    let _ = codec::decode_payload::<DetachNotification>(_payload);
    client.set_exit(ExitReason::Detached, 0, "");
}

fn on_session_exit(client: &mut Client, payload: &[u8]) {
    let Ok(msg) = codec::decode_payload::<SessionExitNotification>(payload) else { return };
    client.set_exit(ExitReason::SessionExit, msg.code, "");
}

fn on_server_shutdown(client: &mut Client, _payload: &[u8]) {
    let _ = codec::decode_payload::<ServerShutdownNotification>(_payload);
    client.set_exit(ExitReason::ServerExit, 0, "");
}

fn on_kicked(client: &mut Client, payload: &[u8]) {
    let reason = codec::decode_payload::<KickNotification>(payload)
        .map(|m| m.reason)
        .unwrap_or_default();
    client.set_exit(ExitReason::ServerKicked, 0, reason);
}

fn on_disconnected(client: &mut Client, payload: &[u8]) {
    let reason = codec::decode_payload::<DisconnectNotification>(payload)
        .map(|m| m.reason)
        .unwrap_or_default();
    client.set_exit(ExitReason::Failed, -1, reason);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::Handle;

    fn dummy_client() -> Client {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        unsafe {
            libc::close(fds[1]);
        }
        let control = BufferedChannel::duplex(Handle::owned(fds[0]), "control".into());
        Client::new(PathBuf::from("/tmp/test.sock"), control)
    }

    #[test]
    fn first_exit_reason_wins() {
        let mut c = dummy_client();
        c.set_exit(ExitReason::Detached, 0, "");
        c.set_exit(ExitReason::Failed, -1, "later");
        assert_eq!(c.exit_state().reason, ExitReason::Detached);
        assert_eq!(c.exit_state().code, 0);
        assert!(c.terminate);
    }

    #[test]
    fn session_exit_notification_sets_code() {
        let mut c = dummy_client();
        let payload = serde_json::to_vec(&SessionExitNotification {
            name: "s1".into(),
            code: 7,
        })
        .unwrap();
        c.dispatch_frame(MessageKind::SessionExitNotification.as_u16(), &payload);
        assert_eq!(c.exit_state().reason, ExitReason::SessionExit);
        assert_eq!(c.exit_state().code, 7);
    }

    #[test]
    fn kick_notification_carries_reason() {
        let mut c = dummy_client();
        let payload = serde_json::to_vec(&KickNotification {
            reason: "too slow".into(),
        })
        .unwrap();
        c.dispatch_frame(MessageKind::KickNotification.as_u16(), &payload);
        assert_eq!(c.exit_state().reason, ExitReason::ServerKicked);
        assert_eq!(c.exit_state().message, "too slow");
    }

    #[test]
    fn unknown_kind_is_dropped_quietly() {
        let mut c = dummy_client();
        c.dispatch_frame(999, b"garbage");
        assert_eq!(c.exit_state().reason, ExitReason::None);
    }

    #[test]
    fn inhibitor_restores_prior_state() {
        let mut c = dummy_client();
        c.control_enabled = true;
        c.with_control_inhibited(|inner| {
            assert!(!inner.control_enabled);
        });
        assert!(c.control_enabled);

        c.control_enabled = false;
        c.with_control_inhibited(|inner| {
            assert!(!inner.control_enabled);
        });
        assert!(!c.control_enabled);
    }

    #[test]
    fn run_without_data_connection_errors() {
        let mut c = dummy_client();
        c.set_input(0);
        assert!(c.run().is_err());
    }
}
