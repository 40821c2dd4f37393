use std::collections::HashMap;
use std::io::ErrorKind;
use std::os::fd::RawFd;
use std::time::Duration;

use mio::event::Source;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

use crate::error::{MuxError, Result};

/// Token reserved for the signal source; never collides with a descriptor.
pub const SIGNAL_TOKEN: usize = usize::MAX - 1;

/// One entry of a readiness batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ready {
    pub token: usize,
    pub readable: bool,
    pub writable: bool,
}

/// Readiness multiplexer over the platform poller.
///
/// Descriptors are registered under their own value as token; read interest
/// is level-triggered, write interest is toggled by callers while a channel
/// holds unflushed output. `schedule` injects an artificial event into the
/// next `wait`, which is how buffered-but-unparsed input and unfinished
/// flushes get revisited without fresh kernel readiness.
pub struct PollSet {
    poll: Poll,
    events: Events,
    interests: HashMap<usize, Interest>,
    scheduled: Vec<Ready>,
    scheduled_index: HashMap<usize, usize>,
}

impl PollSet {
    pub fn new(capacity: usize) -> Result<Self> {
        Ok(PollSet {
            poll: Poll::new()?,
            events: Events::with_capacity(capacity),
            interests: HashMap::new(),
            scheduled: Vec::new(),
            scheduled_index: HashMap::new(),
        })
    }

    fn interest(readable: bool, writable: bool) -> Interest {
        match (readable, writable) {
            (true, true) => Interest::READABLE | Interest::WRITABLE,
            (false, true) => Interest::WRITABLE,
            _ => Interest::READABLE,
        }
    }

    /// Register a descriptor. Fails if it is already registered.
    pub fn listen(&mut self, fd: RawFd, readable: bool, writable: bool) -> Result<()> {
        let interest = Self::interest(readable, writable);
        self.poll
            .registry()
            .register(&mut SourceFd(&fd), Token(fd as usize), interest)?;
        self.interests.insert(fd as usize, interest);
        Ok(())
    }

    /// Change the interest set of a registered descriptor. Unregistered
    /// descriptors are ignored; they show up briefly around client
    /// admission and teardown.
    pub fn update(&mut self, fd: RawFd, readable: bool, writable: bool) -> Result<()> {
        let interest = Self::interest(readable, writable);
        match self.interests.get(&(fd as usize)) {
            None => return Ok(()),
            Some(current) if *current == interest => return Ok(()),
            Some(_) => {}
        }
        self.poll
            .registry()
            .reregister(&mut SourceFd(&fd), Token(fd as usize), interest)?;
        self.interests.insert(fd as usize, interest);
        Ok(())
    }

    /// Whether the descriptor currently has write interest armed.
    pub fn wants_write(&self, fd: RawFd) -> bool {
        self.interests
            .get(&(fd as usize))
            .is_some_and(|i| i.is_writable())
    }

    pub fn is_listening(&self, fd: RawFd) -> bool {
        self.interests.contains_key(&(fd as usize))
    }

    /// Remove a descriptor; pending artificial events for it are dropped.
    pub fn stop(&mut self, fd: RawFd) -> Result<()> {
        if self.interests.remove(&(fd as usize)).is_some() {
            self.poll.registry().deregister(&mut SourceFd(&fd))?;
        }
        if self.scheduled_index.remove(&(fd as usize)).is_some() {
            self.scheduled.retain(|r| r.token != fd as usize);
            self.scheduled_index.clear();
            for (i, r) in self.scheduled.iter().enumerate() {
                self.scheduled_index.insert(r.token, i);
            }
        }
        Ok(())
    }

    /// Register a non-descriptor source (signals) under a fixed token.
    pub fn listen_source<S: Source>(&mut self, source: &mut S, token: usize) -> Result<()> {
        self.poll
            .registry()
            .register(source, Token(token), Interest::READABLE)?;
        Ok(())
    }

    /// Arrange for the descriptor to be reported ready on the next `wait`
    /// even without kernel readiness.
    pub fn schedule(&mut self, token: usize, readable: bool, writable: bool) {
        if let Some(&i) = self.scheduled_index.get(&token) {
            self.scheduled[i].readable |= readable;
            self.scheduled[i].writable |= writable;
            return;
        }
        self.scheduled_index.insert(token, self.scheduled.len());
        self.scheduled.push(Ready {
            token,
            readable,
            writable,
        });
    }

    /// Wait for readiness, merging scheduled artificial events into the
    /// batch. With artificial events pending the kernel is only polled
    /// non-blockingly.
    pub fn wait(&mut self, timeout: Option<Duration>) -> Result<Vec<Ready>> {
        let timeout = if self.scheduled.is_empty() {
            timeout
        } else {
            Some(Duration::ZERO)
        };

        if let Err(e) = self.poll.poll(&mut self.events, timeout) {
            if e.kind() == ErrorKind::Interrupted {
                self.events.clear();
            } else {
                return Err(MuxError::Io(e));
            }
        }

        let mut batch = std::mem::take(&mut self.scheduled);
        self.scheduled_index.clear();
        let mut index: HashMap<usize, usize> =
            batch.iter().enumerate().map(|(i, r)| (r.token, i)).collect();

        for event in self.events.iter() {
            let token = event.token().0;
            let readable = event.is_readable() || event.is_read_closed();
            let writable = event.is_writable() || event.is_write_closed();
            if let Some(&i) = index.get(&token) {
                batch[i].readable |= readable;
                batch[i].writable |= writable;
            } else {
                index.insert(token, batch.len());
                batch.push(Ready {
                    token,
                    readable,
                    writable,
                });
            }
        }
        Ok(batch)
    }
}
