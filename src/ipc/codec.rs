//! Size-prefixed message framing.
//!
//! Every control frame is `length: u64 LE` covering everything after it,
//! then `kind: u16 LE`, then the payload bytes. Payloads are JSON documents
//! typed by [`Payload`]; the framing itself never inspects them.

use tracing::{error, trace};

use crate::channel::BufferedChannel;
use crate::error::{MuxError, Result};
use crate::ipc::message::{MessageKind, Payload};

/// Control frames larger than this mark the channel failed; anything this
/// size is corruption, not a real message.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

const LEN_PREFIX: usize = std::mem::size_of::<u64>();
const KIND_PREFIX: usize = std::mem::size_of::<u16>();

/// A decoded frame before payload interpretation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: u16,
    pub payload: Vec<u8>,
}

/// Assemble the on-wire form of one frame.
pub fn encode_frame(kind: MessageKind, payload: &[u8]) -> Vec<u8> {
    let body_len = (KIND_PREFIX + payload.len()) as u64;
    let mut out = Vec::with_capacity(LEN_PREFIX + KIND_PREFIX + payload.len());
    out.extend_from_slice(&body_len.to_le_bytes());
    out.extend_from_slice(&kind.as_u16().to_le_bytes());
    out.extend_from_slice(payload);
    out
}

pub fn encode_message<T: Payload>(msg: &T) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(msg)?;
    Ok(encode_frame(T::KIND, &payload))
}

/// Encode and write a message; returns the bytes that physically left the
/// process (the rest rides in the channel's write ring).
pub fn send_message<T: Payload>(channel: &mut BufferedChannel, msg: &T) -> Result<usize> {
    let frame = encode_message(msg)?;
    channel.write(&frame)
}

/// Pop one complete frame out of the channel's read ring, if present.
///
/// Returns `Ok(None)` when the buffered bytes do not yet form a whole
/// frame. An impossible length prefix fails the channel.
pub fn pop_frame(channel: &mut BufferedChannel) -> Result<Option<Frame>> {
    let buffered = channel.read_in_buffer();
    if buffered < LEN_PREFIX {
        return Ok(None);
    }

    let prefix = channel.peek_buffered(LEN_PREFIX);
    let body_len = u64::from_le_bytes(prefix[..LEN_PREFIX].try_into().unwrap()) as usize;
    if body_len < KIND_PREFIX || body_len > MAX_MESSAGE_SIZE {
        error!(
            channel = channel.identifier(),
            length = body_len,
            "frame length prefix out of range, failing channel"
        );
        channel.mark_failed();
        return Err(MuxError::Protocol(format!(
            "frame length {body_len} out of range"
        )));
    }
    if buffered < LEN_PREFIX + body_len {
        return Ok(None);
    }

    channel.consume_buffered(LEN_PREFIX);
    let body = channel.consume_buffered(body_len);
    let kind = u16::from_le_bytes([body[0], body[1]]);
    trace!(channel = channel.identifier(), kind, "frame popped");
    Ok(Some(Frame {
        kind,
        payload: body[KIND_PREFIX..].to_vec(),
    }))
}

pub fn decode_payload<T: Payload>(payload: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(payload)?)
}

/// Read one message of the expected kind from a blocking channel.
///
/// Used during connection setup and by synchronous request helpers, before
/// the descriptors are switched to non-blocking for the event loop. A frame
/// of any other kind is a protocol error.
pub fn receive_message<T: Payload>(channel: &mut BufferedChannel) -> Result<T> {
    loop {
        if let Some(frame) = pop_frame(channel)? {
            if frame.kind != T::KIND.as_u16() {
                return Err(MuxError::Protocol(format!(
                    "expected message kind {}, got {}",
                    T::KIND.as_u16(),
                    frame.kind
                )));
            }
            return decode_payload(&frame.payload);
        }
        let chunk = channel.optimal_read_size();
        channel.load(chunk)?;
        if channel.failed() {
            return Err(MuxError::ChannelFailed(channel.identifier().to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::Handle;
    use crate::ipc::message::{
        ClientId, ClientIdResponse, ConnectionNotification, MakeSessionRequest, SpawnOptions,
    };

    fn pipe_pair() -> (BufferedChannel, BufferedChannel) {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        (
            BufferedChannel::duplex(Handle::owned(fds[0]), "codec-read".into()),
            BufferedChannel::duplex(Handle::owned(fds[1]), "codec-write".into()),
        )
    }

    #[test]
    fn frame_layout_is_len_kind_payload() {
        let frame = encode_frame(MessageKind::KeepaliveRequest, b"{}");
        assert_eq!(&frame[..8], &4u64.to_le_bytes());
        assert_eq!(
            u16::from_le_bytes([frame[8], frame[9]]),
            MessageKind::KeepaliveRequest.as_u16()
        );
        assert_eq!(&frame[10..], b"{}");
    }

    #[test]
    fn send_then_pop_roundtrip() {
        let (mut r, mut w) = pipe_pair();
        let msg = ClientIdResponse {
            client: ClientId { id: 7, nonce: 42 },
        };
        send_message(&mut w, &msg).unwrap();
        r.load(1024).unwrap();
        let frame = pop_frame(&mut r).unwrap().expect("complete frame");
        assert_eq!(frame.kind, MessageKind::ClientIdResponse.as_u16());
        let back: ClientIdResponse = decode_payload(&frame.payload).unwrap();
        assert_eq!(back.client.id, 7);
        assert_eq!(back.client.nonce, 42);
    }

    #[test]
    fn partial_frame_stays_buffered() {
        let (mut r, mut w) = pipe_pair();
        let frame = encode_frame(MessageKind::KeepaliveRequest, b"{}");
        w.write(&frame[..5]).unwrap();
        r.load(1024).unwrap();
        assert!(pop_frame(&mut r).unwrap().is_none());
        assert_eq!(r.read_in_buffer(), 5);

        w.write(&frame[5..]).unwrap();
        r.load(1024).unwrap();
        let popped = pop_frame(&mut r).unwrap().unwrap();
        assert_eq!(popped.kind, MessageKind::KeepaliveRequest.as_u16());
        assert_eq!(popped.payload, b"{}");
    }

    #[test]
    fn two_frames_pop_in_order() {
        let (mut r, mut w) = pipe_pair();
        w.write(&encode_frame(MessageKind::KeepaliveRequest, b"1")).unwrap();
        w.write(&encode_frame(MessageKind::KeepaliveResponse, b"2")).unwrap();
        r.load(1024).unwrap();
        let a = pop_frame(&mut r).unwrap().unwrap();
        let b = pop_frame(&mut r).unwrap().unwrap();
        assert_eq!(a.payload, b"1");
        assert_eq!(b.payload, b"2");
        assert!(pop_frame(&mut r).unwrap().is_none());
    }

    #[test]
    fn oversized_length_fails_channel() {
        let (mut r, mut w) = pipe_pair();
        let huge = (MAX_MESSAGE_SIZE as u64 + 1).to_le_bytes();
        w.write(&huge).unwrap();
        r.load(1024).unwrap();
        assert!(pop_frame(&mut r).is_err());
        assert!(r.failed());
    }

    #[test]
    fn undersized_length_fails_channel() {
        let (mut r, mut w) = pipe_pair();
        w.write(&1u64.to_le_bytes()).unwrap();
        r.load(1024).unwrap();
        assert!(pop_frame(&mut r).is_err());
        assert!(r.failed());
    }

    #[test]
    fn receive_message_blocking() {
        let (mut r, mut w) = pipe_pair();
        send_message(
            &mut w,
            &ConnectionNotification {
                accepted: true,
                reason: String::new(),
            },
        )
        .unwrap();
        let note: ConnectionNotification = receive_message(&mut r).unwrap();
        assert!(note.accepted);
    }

    #[test]
    fn receive_wrong_kind_is_protocol_error() {
        let (mut r, mut w) = pipe_pair();
        send_message(&mut w, &crate::ipc::message::KeepaliveRequest {}).unwrap();
        let got: Result<ConnectionNotification> = receive_message(&mut r);
        assert!(matches!(got, Err(MuxError::Protocol(_))));
    }

    #[test]
    fn large_payload_roundtrip() {
        let (mut r, mut w) = pipe_pair();
        let msg = MakeSessionRequest {
            name: "big".into(),
            spawn: SpawnOptions {
                program: "/bin/sh".into(),
                args: vec!["-c".into(), "x".repeat(100_000)],
                set_env: Vec::new(),
                unset_env: Vec::new(),
            },
        };
        // A pipe holds far less than the frame; the unsent tail lands in
        // the write ring and is flushed while the reader drains.
        let frame = encode_message(&msg).unwrap();
        w.handle().set_nonblocking(true).unwrap();
        r.handle().set_nonblocking(true).unwrap();
        w.write(&frame).unwrap();
        let mut popped = None;
        while popped.is_none() {
            if w.has_buffered_write() {
                w.flush().unwrap();
            }
            r.load(1 << 16).unwrap();
            popped = pop_frame(&mut r).unwrap();
        }
        let back: MakeSessionRequest = decode_payload(&popped.unwrap().payload).unwrap();
        assert_eq!(back.spawn.args[1].len(), 100_000);
    }
}
