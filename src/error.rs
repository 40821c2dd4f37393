use thiserror::Error;

/// Which ring of a buffered channel an overflow happened on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferSide {
    Read,
    Write,
}

impl std::fmt::Display for BufferSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BufferSide::Read => write!(f, "read"),
            BufferSide::Write => write!(f, "write"),
        }
    }
}

#[derive(Debug, Error)]
pub enum MuxError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("channel '{identifier}' {side} buffer overflow at {size} bytes")]
    ChannelOverflow {
        identifier: String,
        side: BufferSide,
        size: usize,
    },
    #[error("channel '{0}' has failed")]
    ChannelFailed(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("nonce rejected: {0}")]
    Nonce(String),
    #[error("invalid invocation: {0}")]
    Invocation(String),
    #[error("system error: {0}")]
    System(String),
}

pub type Result<T> = std::result::Result<T, MuxError>;

/// Process exit status of the `monomux` binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum FrontendExitCode {
    Success = 0,
    InvocationError = 1,
    SystemError = 2,
}

impl MuxError {
    pub fn exit_code(&self) -> FrontendExitCode {
        match self {
            MuxError::Invocation(_) => FrontendExitCode::InvocationError,
            _ => FrontendExitCode::SystemError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invocation_maps_to_exit_code_one() {
        let e = MuxError::Invocation("bad flag".into());
        assert_eq!(e.exit_code(), FrontendExitCode::InvocationError);
    }

    #[test]
    fn io_maps_to_system_error() {
        let e = MuxError::Io(std::io::Error::other("boom"));
        assert_eq!(e.exit_code(), FrontendExitCode::SystemError);
    }

    #[test]
    fn overflow_message_names_channel_and_side() {
        let e = MuxError::ChannelOverflow {
            identifier: "client/3".into(),
            side: BufferSide::Write,
            size: 42,
        };
        let msg = e.to_string();
        assert!(msg.contains("client/3"));
        assert!(msg.contains("write"));
    }
}
