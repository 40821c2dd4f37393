use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::os::fd::RawFd;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tracing::{debug, info, warn};

use crate::channel::BufferedChannel;
use crate::error::{MuxError, Result};
use crate::ipc::message::{SessionInfo, SpawnOptions};
use crate::ipc::SessionEnv;

/// Most dead children remembered between reap passes.
const DEAD_CHILDREN_MAX: usize = 8;

/// A reaped child waiting for its session to be torn down.
#[derive(Debug, Clone, Copy)]
pub struct DeadChild {
    pub pid: u32,
    pub exit_code: i32,
}

/// One server-hosted child process under a PTY.
pub struct SessionData {
    name: String,
    created: SystemTime,
    last_active: Instant,
    /// Duplex channel over the (duplicated, non-blocking) PTY master.
    pub channel: BufferedChannel,
    master: Box<dyn MasterPty + Send>,
    child: Box<dyn Child + Send + Sync>,
    child_pid: u32,
    /// Ids of clients currently receiving this session's output.
    pub attached_clients: BTreeSet<u64>,
}

impl SessionData {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn when_created(&self) -> SystemTime {
        self.created
    }

    pub fn created_unix(&self) -> u64 {
        self.created
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }

    pub fn last_active(&self) -> Instant {
        self.last_active
    }

    pub fn activity(&mut self) {
        self.last_active = Instant::now();
    }

    pub fn child_pid(&self) -> u32 {
        self.child_pid
    }

    /// The descriptor identifying this session in the poll set.
    pub fn master_fd(&self) -> RawFd {
        self.channel.raw()
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            name: self.name.clone(),
            created_at: self.created_unix(),
            attached_count: self.attached_clients.len() as u32,
        }
    }

    pub fn resize(&self, rows: u16, cols: u16) -> Result<()> {
        self.master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| MuxError::System(format!("resize pty: {e}")))
    }

    /// Check whether the child has exited without blocking.
    pub fn try_reap(&mut self) -> Option<i32> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(status.exit_code() as i32),
            Ok(None) => None,
            Err(e) => {
                warn!(session = %self.name, error = %e, "try_wait failed");
                None
            }
        }
    }

    /// Deliver a signal to the session's child process.
    pub fn signal(&self, signo: i32) {
        let rc = unsafe { libc::kill(self.child_pid as libc::pid_t, signo) };
        if rc != 0 {
            debug!(
                session = %self.name,
                signo,
                "signal delivery failed: {}",
                std::io::Error::last_os_error()
            );
        }
    }
}

/// Sessions by name, plus the bounded queue of children already known to be
/// dead and awaiting teardown.
pub struct SessionRegistry {
    sessions: BTreeMap<String, SessionData>,
    dead_children: VecDeque<DeadChild>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        SessionRegistry {
            sessions: BTreeMap::new(),
            dead_children: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&SessionData> {
        self.sessions.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut SessionData> {
        self.sessions.get_mut(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.sessions.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.sessions.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SessionData> {
        self.sessions.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut SessionData> {
        self.sessions.values_mut()
    }

    pub fn remove(&mut self, name: &str) -> Option<SessionData> {
        self.sessions.remove(name)
    }

    pub fn find_by_pid(&self, pid: u32) -> Option<&str> {
        self.sessions
            .values()
            .find(|s| s.child_pid == pid)
            .map(|s| s.name.as_str())
    }

    /// The unique name actually used for a request: the requested name if
    /// free, `name#N` with the smallest free N on collision, or the
    /// smallest free positive integer when no name was requested.
    pub fn unique_name(&self, requested: &str) -> String {
        if requested.is_empty() {
            let mut n: u64 = 1;
            while self.sessions.contains_key(&n.to_string()) {
                n += 1;
            }
            return n.to_string();
        }
        if !self.sessions.contains_key(requested) {
            return requested.to_string();
        }
        let mut n: u64 = 1;
        loop {
            let candidate = format!("{requested}#{n}");
            if !self.sessions.contains_key(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }

    /// Spawn a child under a fresh PTY and register it under a unique name.
    ///
    /// The PTY master descriptor is duplicated for the event loop: the
    /// duplicate is switched to non-blocking and close-on-exec and owns the
    /// session's buffered channel.
    pub fn spawn(
        &mut self,
        requested_name: &str,
        opts: &SpawnOptions,
        socket_path: &std::path::Path,
    ) -> Result<&mut SessionData> {
        let name = self.unique_name(requested_name);
        info!(session = %name, program = %opts.program, "creating session");

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: 24,
                cols: 80,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| MuxError::System(format!("openpty: {e}")))?;

        let mut cmd = CommandBuilder::new(&opts.program);
        cmd.args(&opts.args);
        for (k, v) in &opts.set_env {
            cmd.env(k, v);
        }
        for k in &opts.unset_env {
            cmd.env_remove(k);
        }
        let session_env = SessionEnv {
            socket: socket_path.to_path_buf(),
            session: name.clone(),
        };
        for (k, v) in session_env.env_vars() {
            cmd.env(k, v);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| MuxError::System(format!("spawn '{}': {e}", opts.program)))?;
        drop(pair.slave);

        let child_pid = child
            .process_id()
            .ok_or_else(|| MuxError::System("spawned child has no pid".into()))?;

        let master_raw = pair
            .master
            .as_raw_fd()
            .ok_or_else(|| MuxError::System("pty master exposes no descriptor".into()))?;
        let dup = unsafe { libc::dup(master_raw) };
        if dup < 0 {
            return Err(MuxError::Io(std::io::Error::last_os_error()));
        }
        let handle = crate::handle::Handle::owned(dup);
        handle.set_nonblocking(true)?;
        handle.set_cloexec(true)?;

        let channel = BufferedChannel::duplex(handle, format!("session/{name}"));
        let session = SessionData {
            name: name.clone(),
            created: SystemTime::now(),
            last_active: Instant::now(),
            channel,
            master: pair.master,
            child,
            child_pid,
            attached_clients: BTreeSet::new(),
        };
        self.sessions.insert(name.clone(), session);
        Ok(self.sessions.get_mut(&name).unwrap())
    }

    /// Remember a dead child for the next reap pass. The queue is bounded;
    /// an overflowing entry is dropped and picked up by a later scan.
    pub fn register_dead_child(&mut self, pid: u32, exit_code: i32) {
        if self.dead_children.len() >= DEAD_CHILDREN_MAX {
            debug!(pid, "dead-children queue full, deferring");
            return;
        }
        if self.dead_children.iter().any(|d| d.pid == pid) {
            return;
        }
        self.dead_children.push_back(DeadChild { pid, exit_code });
    }

    /// Poll every session's child and queue the ones that have exited.
    pub fn collect_dead_children(&mut self) {
        let dead: Vec<(u32, i32)> = self
            .sessions
            .values_mut()
            .filter_map(|s| s.try_reap().map(|code| (s.child_pid, code)))
            .collect();
        for (pid, code) in dead {
            self.register_dead_child(pid, code);
        }
    }

    /// Drain the dead-children queue, returning `(session_name, exit_code)`
    /// for every session whose child is gone. The caller owns teardown.
    pub fn drain_dead_children(&mut self) -> Vec<(String, i32)> {
        let mut out = Vec::new();
        while let Some(dead) = self.dead_children.pop_front() {
            if let Some(name) = self.find_by_pid(dead.pid) {
                out.push((name.to_string(), dead.exit_code));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spawn_opts(program: &str) -> SpawnOptions {
        SpawnOptions {
            program: program.into(),
            args: Vec::new(),
            set_env: Vec::new(),
            unset_env: Vec::new(),
        }
    }

    #[test]
    fn unique_name_prefers_requested() {
        let reg = SessionRegistry::new();
        assert_eq!(reg.unique_name("work"), "work");
    }

    #[test]
    fn unique_name_numbers_unnamed() {
        let reg = SessionRegistry::new();
        assert_eq!(reg.unique_name(""), "1");
    }

    #[test]
    fn spawn_and_reap_cat() {
        let mut reg = SessionRegistry::new();
        let sock = std::path::PathBuf::from("/tmp/unused.sock");
        let name = {
            let s = reg.spawn("s1", &spawn_opts("/bin/cat"), &sock).unwrap();
            assert_eq!(s.name(), "s1");
            assert!(s.child_pid() > 0);
            s.name().to_string()
        };

        // Collision picks name#1.
        let renamed = {
            let s = reg.spawn("s1", &spawn_opts("/bin/cat"), &sock).unwrap();
            s.name().to_string()
        };
        assert_eq!(renamed, "s1#1");

        // Kill both children and verify the reap path finds them.
        for n in [name.as_str(), renamed.as_str()] {
            reg.get(n).unwrap().signal(libc::SIGKILL);
        }
        let mut drained: Vec<(String, i32)> = Vec::new();
        for _ in 0..100 {
            reg.collect_dead_children();
            drained.extend(reg.drain_dead_children());
            if drained.len() == 2 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        assert_eq!(drained.len(), 2);
        for (n, _) in &drained {
            reg.remove(n);
        }
        assert!(reg.is_empty());
    }

    #[test]
    fn session_echo_through_pty() {
        let mut reg = SessionRegistry::new();
        let sock = std::path::PathBuf::from("/tmp/unused.sock");
        let s = reg.spawn("echo", &spawn_opts("/bin/cat"), &sock).unwrap();

        s.channel.write(b"hello\n").unwrap();
        let mut got = Vec::new();
        for _ in 0..200 {
            let chunk = s.channel.read(64).unwrap();
            got.extend_from_slice(&chunk);
            if got.windows(5).any(|w| w == b"hello") {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        let text = String::from_utf8_lossy(&got);
        assert!(text.contains("hello"), "pty echoed: {text:?}");

        s.signal(libc::SIGKILL);
    }

    #[test]
    fn missing_program_fails_spawn_or_dies_immediately() {
        // Depending on the backend the exec failure surfaces either as a
        // spawn error or as a child that exits at once.
        let mut reg = SessionRegistry::new();
        let sock = std::path::PathBuf::from("/tmp/unused.sock");
        match reg.spawn("bad", &spawn_opts("/nonexistent/never"), &sock) {
            Err(_) => assert!(!reg.contains("bad")),
            Ok(_) => {
                let mut drained = Vec::new();
                for _ in 0..200 {
                    reg.collect_dead_children();
                    drained.extend(reg.drain_dead_children());
                    if !drained.is_empty() {
                        break;
                    }
                    std::thread::sleep(std::time::Duration::from_millis(10));
                }
                assert_eq!(drained.len(), 1);
                assert_eq!(drained[0].0, "bad");
            }
        }
    }

    #[test]
    fn dead_children_queue_is_bounded_and_deduplicated() {
        let mut reg = SessionRegistry::new();
        for pid in 0..20u32 {
            reg.register_dead_child(pid + 1, 0);
        }
        assert!(reg.dead_children.len() <= DEAD_CHILDREN_MAX);
        let before = reg.dead_children.len();
        reg.register_dead_child(1, 0);
        assert_eq!(reg.dead_children.len(), before);
    }
}
