use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// The protocol's stable message kind table. The numeric values are part of
/// the wire format and must never be reordered; unknown values decode to
/// `Invalid` and are dropped by receivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageKind {
    Invalid = 0,
    ConnectionNotification = 1,
    ClientIdRequest = 2,
    ClientIdResponse = 3,
    DataSocketRequest = 4,
    DataSocketResponse = 5,
    SessionListRequest = 6,
    SessionListResponse = 7,
    MakeSessionRequest = 8,
    MakeSessionResponse = 9,
    AttachRequest = 10,
    AttachResponse = 11,
    DetachRequest = 12,
    DetachResponse = 13,
    DetachNotification = 14,
    SignalRequest = 15,
    ResizeRequest = 16,
    KeepaliveRequest = 17,
    KeepaliveResponse = 18,
    StatisticsRequest = 19,
    StatisticsResponse = 20,
    SessionExitNotification = 21,
    ServerShutdownNotification = 22,
    KickNotification = 23,
    DisconnectNotification = 24,
}

impl MessageKind {
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(value: u16) -> MessageKind {
        match value {
            1 => MessageKind::ConnectionNotification,
            2 => MessageKind::ClientIdRequest,
            3 => MessageKind::ClientIdResponse,
            4 => MessageKind::DataSocketRequest,
            5 => MessageKind::DataSocketResponse,
            6 => MessageKind::SessionListRequest,
            7 => MessageKind::SessionListResponse,
            8 => MessageKind::MakeSessionRequest,
            9 => MessageKind::MakeSessionResponse,
            10 => MessageKind::AttachRequest,
            11 => MessageKind::AttachResponse,
            12 => MessageKind::DetachRequest,
            13 => MessageKind::DetachResponse,
            14 => MessageKind::DetachNotification,
            15 => MessageKind::SignalRequest,
            16 => MessageKind::ResizeRequest,
            17 => MessageKind::KeepaliveRequest,
            18 => MessageKind::KeepaliveResponse,
            19 => MessageKind::StatisticsRequest,
            20 => MessageKind::StatisticsResponse,
            21 => MessageKind::SessionExitNotification,
            22 => MessageKind::ServerShutdownNotification,
            23 => MessageKind::KickNotification,
            24 => MessageKind::DisconnectNotification,
            _ => MessageKind::Invalid,
        }
    }
}

/// Binds a payload struct to its wire kind.
pub trait Payload: Serialize + DeserializeOwned {
    const KIND: MessageKind;
}

macro_rules! payload {
    ($ty:ty, $kind:ident) => {
        impl Payload for $ty {
            const KIND: MessageKind = MessageKind::$kind;
        }
    };
}

/// The identity pair a client proves itself with on a second connection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ClientId {
    pub id: u64,
    pub nonce: u64,
}

/// Greeting sent by the server on every accepted connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionNotification {
    pub accepted: bool,
    #[serde(default)]
    pub reason: String,
}
payload!(ConnectionNotification, ConnectionNotification);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientIdRequest {}
payload!(ClientIdRequest, ClientIdRequest);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientIdResponse {
    pub client: ClientId,
}
payload!(ClientIdResponse, ClientIdResponse);

/// Sent on the second connection to pair it with an existing control
/// client as that client's data channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSocketRequest {
    pub client: ClientId,
}
payload!(DataSocketRequest, DataSocketRequest);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSocketResponse {
    pub success: bool,
}
payload!(DataSocketResponse, DataSocketResponse);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionListRequest {}
payload!(SessionListRequest, SessionListRequest);

/// Transmission form of one session's descriptive data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub name: String,
    /// Seconds since the UNIX epoch.
    pub created_at: u64,
    pub attached_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionListResponse {
    pub sessions: Vec<SessionInfo>,
}
payload!(SessionListResponse, SessionListResponse);

/// What to run in a new session, with environment adjustments.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpawnOptions {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub set_env: Vec<(String, String)>,
    #[serde(default)]
    pub unset_env: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MakeSessionRequest {
    /// Non-normative; the server may rename on collision.
    pub name: String,
    pub spawn: SpawnOptions,
}
payload!(MakeSessionRequest, MakeSessionRequest);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MakeSessionResponse {
    pub success: bool,
    /// The actual name; may differ from the requested one.
    pub name: String,
}
payload!(MakeSessionResponse, MakeSessionResponse);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachRequest {
    pub name: String,
}
payload!(AttachRequest, AttachRequest);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachResponse {
    pub success: bool,
    pub session: Option<SessionInfo>,
}
payload!(AttachResponse, AttachResponse);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetachMode {
    /// Detach the most recently active client of the session.
    Latest,
    /// Detach every attached client.
    All,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetachRequest {
    pub mode: DetachMode,
}
payload!(DetachRequest, DetachRequest);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetachResponse {}
payload!(DetachResponse, DetachResponse);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetachNotification {}
payload!(DetachNotification, DetachNotification);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalRequest {
    pub signo: i32,
}
payload!(SignalRequest, SignalRequest);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResizeRequest {
    pub rows: u16,
    pub cols: u16,
}
payload!(ResizeRequest, ResizeRequest);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeepaliveRequest {}
payload!(KeepaliveRequest, KeepaliveRequest);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeepaliveResponse {}
payload!(KeepaliveResponse, KeepaliveResponse);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatisticsRequest {}
payload!(StatisticsRequest, StatisticsRequest);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatisticsResponse {
    /// Human-readable only; not meant to be parsed.
    pub contents: String,
}
payload!(StatisticsResponse, StatisticsResponse);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionExitNotification {
    pub name: String,
    pub code: i32,
}
payload!(SessionExitNotification, SessionExitNotification);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerShutdownNotification {}
payload!(ServerShutdownNotification, ServerShutdownNotification);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KickNotification {
    pub reason: String,
}
payload!(KickNotification, KickNotification);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisconnectNotification {
    pub reason: String,
}
payload!(DisconnectNotification, DisconnectNotification);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_numbering_is_stable() {
        assert_eq!(MessageKind::ConnectionNotification.as_u16(), 1);
        assert_eq!(MessageKind::DataSocketRequest.as_u16(), 4);
        assert_eq!(MessageKind::ResizeRequest.as_u16(), 16);
        assert_eq!(MessageKind::DisconnectNotification.as_u16(), 24);
    }

    #[test]
    fn unknown_kind_decodes_to_invalid() {
        assert_eq!(MessageKind::from_u16(0), MessageKind::Invalid);
        assert_eq!(MessageKind::from_u16(999), MessageKind::Invalid);
    }

    #[test]
    fn every_kind_roundtrips_through_u16() {
        for v in 1..=24u16 {
            let kind = MessageKind::from_u16(v);
            assert_ne!(kind, MessageKind::Invalid, "kind {v} missing");
            assert_eq!(kind.as_u16(), v);
        }
    }

    #[test]
    fn spawn_options_json_roundtrip() {
        let opts = SpawnOptions {
            program: "/bin/cat".into(),
            args: vec!["-A".into()],
            set_env: vec![("TERM".into(), "xterm".into())],
            unset_env: vec!["TMUX".into()],
        };
        let json = serde_json::to_vec(&opts).unwrap();
        let back: SpawnOptions = serde_json::from_slice(&json).unwrap();
        assert_eq!(back.program, "/bin/cat");
        assert_eq!(back.args, vec!["-A"]);
        assert_eq!(back.set_env.len(), 1);
        assert_eq!(back.unset_env, vec!["TMUX"]);
    }

    #[test]
    fn detach_mode_serializes_lowercase() {
        let json = serde_json::to_string(&DetachRequest {
            mode: DetachMode::Latest,
        })
        .unwrap();
        assert!(json.contains("\"latest\""));
    }
}
