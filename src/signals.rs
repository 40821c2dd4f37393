use signal_hook_mio::v1_0::Signals;

pub use signal_hook::consts::{SIGCHLD, SIGHUP, SIGINT, SIGTERM, SIGWINCH};

use crate::error::Result;
use crate::poll::{PollSet, SIGNAL_TOKEN};

/// Delivers signal numbers to the event loop as poll readiness.
///
/// The actual handler only writes to an internal pipe; the loop drains
/// `pending()` when the reserved token fires, so no user logic ever runs in
/// signal context.
pub struct SignalSource {
    signals: Signals,
}

impl SignalSource {
    pub fn new(which: &[i32]) -> Result<Self> {
        Ok(SignalSource {
            signals: Signals::new(which.iter().copied())?,
        })
    }

    /// Register with the poller under [`SIGNAL_TOKEN`].
    pub fn register(&mut self, poll: &mut PollSet) -> Result<()> {
        poll.listen_source(&mut self.signals, SIGNAL_TOKEN)
    }

    /// Drain every signal that arrived since the last call.
    pub fn pending(&mut self) -> Vec<i32> {
        self.signals.pending().collect()
    }
}

/// Stops `SIGPIPE` from killing the process when a peer disappears
/// mid-write; the write error is handled at the channel instead.
pub fn ignore_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn signal_becomes_poll_readiness() {
        let mut poll = PollSet::new(8).unwrap();
        let mut source = SignalSource::new(&[SIGWINCH]).unwrap();
        source.register(&mut poll).unwrap();

        unsafe {
            libc::kill(libc::getpid(), SIGWINCH);
        }

        let mut saw = false;
        for _ in 0..50 {
            let batch = poll.wait(Some(Duration::from_millis(100))).unwrap();
            if batch.iter().any(|e| e.token == SIGNAL_TOKEN) {
                saw = true;
                break;
            }
        }
        assert!(saw, "SIGWINCH never surfaced through the poller");
        assert!(source.pending().contains(&SIGWINCH));
    }
}
