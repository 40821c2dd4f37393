use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime};

use tracing::debug;

use crate::channel::BufferedChannel;

/// A nonce is only honoured this long after issue.
pub const NONCE_TTL: Duration = Duration::from_secs(5);

struct Nonce {
    value: u64,
    issued: Instant,
}

/// Server-side record of one connected client.
pub struct ClientData {
    id: u64,
    pub control: BufferedChannel,
    pub data: Option<BufferedChannel>,
    nonce: Option<Nonce>,
    /// Name of the attached session, if any; resolved through the session
    /// registry, never held as a direct reference.
    pub attached: Option<String>,
    /// Last window size the client reported.
    pub window: (u16, u16),
    created: SystemTime,
    /// Set when the client last transmitted on its data connection;
    /// control chatter does not count as activity.
    last_active: Option<Instant>,
}

impl ClientData {
    pub fn new(id: u64, control: BufferedChannel) -> Self {
        ClientData {
            id,
            control,
            data: None,
            nonce: None,
            attached: None,
            window: (0, 0),
            created: SystemTime::now(),
            last_active: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn when_created(&self) -> SystemTime {
        self.created
    }

    pub fn last_active(&self) -> Option<Instant> {
        self.last_active
    }

    pub fn activity(&mut self) {
        self.last_active = Some(Instant::now());
    }

    /// Issue a fresh single-use nonce, replacing any outstanding one.
    pub fn make_nonce(&mut self) -> u64 {
        let value = rand::random::<u64>();
        self.nonce = Some(Nonce {
            value,
            issued: Instant::now(),
        });
        value
    }

    /// Take the outstanding nonce, rendering it unusable afterwards.
    /// Expired nonces are treated as absent.
    pub fn consume_nonce(&mut self) -> Option<u64> {
        let nonce = self.nonce.take()?;
        if nonce.issued.elapsed() > NONCE_TTL {
            return None;
        }
        Some(nonce.value)
    }

    pub fn has_live_nonce(&self) -> bool {
        self.nonce
            .as_ref()
            .is_some_and(|n| n.issued.elapsed() <= NONCE_TTL)
    }

    /// Drop a nonce that outlived its TTL without being presented.
    pub fn expire_nonce(&mut self) {
        if let Some(n) = &self.nonce {
            if n.issued.elapsed() > NONCE_TTL {
                debug!(client = self.id, "nonce expired unused");
                self.nonce = None;
            }
        }
    }

    #[cfg(test)]
    fn backdate_nonce(&mut self, by: Duration) {
        if let Some(n) = self.nonce.as_mut() {
            n.issued -= by;
        }
    }
}

/// Clients by id. Ids are monotonic and never reused within a server's
/// lifetime.
pub struct ClientRegistry {
    clients: HashMap<u64, ClientData>,
    next_id: u64,
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientRegistry {
    pub fn new() -> Self {
        ClientRegistry {
            clients: HashMap::new(),
            next_id: 1,
        }
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Admit a freshly accepted control connection.
    pub fn accept(&mut self, handle: crate::handle::Handle) -> &mut ClientData {
        let id = self.next_id;
        self.next_id += 1;
        let control = BufferedChannel::duplex(handle, format!("client/{id}"));
        self.clients.insert(id, ClientData::new(id, control));
        self.clients.get_mut(&id).unwrap()
    }

    pub fn get(&self, id: u64) -> Option<&ClientData> {
        self.clients.get(&id)
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut ClientData> {
        self.clients.get_mut(&id)
    }

    pub fn contains(&self, id: u64) -> bool {
        self.clients.contains_key(&id)
    }

    pub fn remove(&mut self, id: u64) -> Option<ClientData> {
        self.clients.remove(&id)
    }

    pub fn ids(&self) -> Vec<u64> {
        self.clients.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClientData> {
        self.clients.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ClientData> {
        self.clients.values_mut()
    }

    /// Move the requester's control connection over to become `main_id`'s
    /// data channel. The requester's transient record is destroyed; the
    /// moved descriptor is returned for re-tagging.
    pub fn promote_to_data(&mut self, main_id: u64, requester_id: u64) -> Option<std::os::fd::RawFd> {
        let requester = self.clients.remove(&requester_id)?;
        let channel = requester.control;
        let fd = channel.raw();
        match self.clients.get_mut(&main_id) {
            Some(main) => {
                main.data = Some(channel);
                Some(fd)
            }
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::Handle;

    fn dummy_handle() -> Handle {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        unsafe {
            libc::close(fds[1]);
        }
        Handle::owned(fds[0])
    }

    #[test]
    fn ids_are_monotonic() {
        let mut reg = ClientRegistry::new();
        let a = reg.accept(dummy_handle()).id();
        let b = reg.accept(dummy_handle()).id();
        assert!(b > a);
    }

    #[test]
    fn channel_identifier_names_the_client() {
        let mut reg = ClientRegistry::new();
        let c = reg.accept(dummy_handle());
        let expected = format!("client/{}", c.id());
        assert_eq!(c.control.identifier(), expected);
    }

    #[test]
    fn nonce_is_single_use() {
        let mut reg = ClientRegistry::new();
        let id = reg.accept(dummy_handle()).id();
        let c = reg.get_mut(id).unwrap();
        let n = c.make_nonce();
        assert_eq!(c.consume_nonce(), Some(n));
        assert_eq!(c.consume_nonce(), None);
    }

    #[test]
    fn new_nonce_replaces_old() {
        let mut reg = ClientRegistry::new();
        let id = reg.accept(dummy_handle()).id();
        let c = reg.get_mut(id).unwrap();
        let first = c.make_nonce();
        let second = c.make_nonce();
        // Only the most recent value is honoured.
        assert_ne!(first, second);
        assert_eq!(c.consume_nonce(), Some(second));
    }

    #[test]
    fn expired_nonce_is_not_honoured() {
        let mut reg = ClientRegistry::new();
        let id = reg.accept(dummy_handle()).id();
        let c = reg.get_mut(id).unwrap();
        c.make_nonce();
        c.backdate_nonce(NONCE_TTL + Duration::from_secs(1));
        assert!(!c.has_live_nonce());
        assert_eq!(c.consume_nonce(), None);
    }

    #[test]
    fn expire_nonce_clears_stale_values() {
        let mut reg = ClientRegistry::new();
        let id = reg.accept(dummy_handle()).id();
        let c = reg.get_mut(id).unwrap();
        c.make_nonce();
        c.backdate_nonce(NONCE_TTL + Duration::from_secs(1));
        c.expire_nonce();
        // A fresh nonce after expiry works as usual.
        let n = c.make_nonce();
        assert!(c.has_live_nonce());
        assert_eq!(c.consume_nonce(), Some(n));
    }

    #[test]
    fn promote_moves_channel_and_destroys_requester() {
        let mut reg = ClientRegistry::new();
        let main_id = reg.accept(dummy_handle()).id();
        let req_id = reg.accept(dummy_handle()).id();

        let fd = reg.promote_to_data(main_id, req_id).expect("promotion");
        assert!(fd >= 0);
        assert!(!reg.contains(req_id));
        assert!(reg.get(main_id).unwrap().data.is_some());
    }

    #[test]
    fn promote_to_unknown_main_fails() {
        let mut reg = ClientRegistry::new();
        let req_id = reg.accept(dummy_handle()).id();
        assert!(reg.promote_to_data(999, req_id).is_none());
        assert!(!reg.contains(req_id));
    }
}
