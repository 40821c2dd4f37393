//! Default control-message handlers.
//!
//! Each handler decodes its payload and manipulates the server through the
//! same public operations an embedder would use; a frame that fails to
//! decode is dropped silently, matching the tolerant protocol stance.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::ipc::codec::decode_payload;
use crate::ipc::message::{
    AttachRequest, AttachResponse, ClientId, ClientIdResponse, DataSocketRequest,
    DataSocketResponse, DetachMode, DetachNotification, DetachRequest, DetachResponse,
    KeepaliveResponse, MakeSessionRequest, MakeSessionResponse, MessageKind, ResizeRequest,
    SessionListResponse, SignalRequest, StatisticsResponse,
};

use super::Server;

pub(crate) fn install_defaults(server: &mut Server) {
    server.register_handler(MessageKind::ClientIdRequest, Arc::new(request_client_id));
    server.register_handler(MessageKind::DataSocketRequest, Arc::new(request_data_socket));
    server.register_handler(MessageKind::SessionListRequest, Arc::new(request_session_list));
    server.register_handler(MessageKind::MakeSessionRequest, Arc::new(request_make_session));
    server.register_handler(MessageKind::AttachRequest, Arc::new(request_attach));
    server.register_handler(MessageKind::DetachRequest, Arc::new(request_detach));
    server.register_handler(MessageKind::SignalRequest, Arc::new(request_signal));
    server.register_handler(MessageKind::ResizeRequest, Arc::new(request_resize));
    server.register_handler(MessageKind::KeepaliveRequest, Arc::new(request_keepalive));
    server.register_handler(MessageKind::StatisticsRequest, Arc::new(request_statistics));
}

fn request_client_id(server: &mut Server, id: u64, _payload: &[u8]) {
    let Some(client) = server.clients.get_mut(id) else { return };
    let nonce = client.make_nonce();
    server.send_control(
        id,
        &ClientIdResponse {
            client: ClientId { id, nonce },
        },
    );
}

/// The sender of this request is a *second* connection wanting to become
/// the data channel of the client named in the payload. A bad id, an
/// already-bound data channel, or a wrong/expired nonce rejects and closes
/// the offending connection. The named client's nonce is consumed only
/// when a binding is actually attempted (the id resolves and no data
/// channel is bound yet); an unknown id or an already-bound client leaves
/// any outstanding nonce untouched.
fn request_data_socket(server: &mut Server, requester_id: u64, payload: &[u8]) {
    let Ok(msg) = decode_payload::<DataSocketRequest>(payload) else { return };
    let main_id = msg.client.id;

    let valid = match server.clients.get_mut(main_id) {
        Some(main) if main.data.is_none() => main.consume_nonce() == Some(msg.client.nonce),
        _ => false,
    };
    if !valid || main_id == requester_id {
        warn!(
            requester = requester_id,
            claimed = main_id,
            "data socket request rejected"
        );
        server.send_control(requester_id, &DataSocketResponse { success: false });
        if let Some(c) = server.clients.get_mut(requester_id) {
            let _ = c.control.flush();
        }
        server.client_exit(requester_id);
        return;
    }

    if server.turn_into_data_socket(main_id, requester_id) {
        server.send_on_data(main_id, &DataSocketResponse { success: true });
    }
}

fn request_session_list(server: &mut Server, id: u64, _payload: &[u8]) {
    let sessions = server.sessions.iter().map(|s| s.info()).collect();
    server.send_control(id, &SessionListResponse { sessions });
}

fn request_make_session(server: &mut Server, id: u64, payload: &[u8]) {
    let Ok(msg) = decode_payload::<MakeSessionRequest>(payload) else { return };
    let socket_path = server.socket_path().to_path_buf();

    let spawned = match server.sessions.spawn(&msg.name, &msg.spawn, &socket_path) {
        Ok(session) => Ok((session.name().to_string(), session.master_fd())),
        Err(e) => Err(e),
    };

    match spawned {
        Ok((name, fd)) => {
            if let Err(e) = server.poll.listen(fd, true, false) {
                warn!(session = %name, error = %e, "registering session PTY failed");
            }
            server
                .fd_index
                .insert(fd, super::fd_index::FdTag::Session(name.clone()));
            server.session_ever_created = true;
            server.send_control(
                id,
                &MakeSessionResponse {
                    success: true,
                    name,
                },
            );
        }
        Err(e) => {
            warn!(name = %msg.name, error = %e, "session creation failed");
            server.send_control(
                id,
                &MakeSessionResponse {
                    success: false,
                    name: msg.name,
                },
            );
        }
    }
}

fn request_attach(server: &mut Server, id: u64, payload: &[u8]) {
    let Ok(msg) = decode_payload::<AttachRequest>(payload) else { return };
    if !server.attach_client(id, &msg.name) {
        server.send_control(
            id,
            &AttachResponse {
                success: false,
                session: None,
            },
        );
        return;
    }
    let info = server.sessions.get(&msg.name).map(|s| s.info());
    server.send_control(
        id,
        &AttachResponse {
            success: true,
            session: info,
        },
    );
}

fn request_detach(server: &mut Server, id: u64, payload: &[u8]) {
    let Ok(msg) = decode_payload::<DetachRequest>(payload) else { return };
    let Some(name) = server.clients.get(id).and_then(|c| c.attached.clone()) else {
        return;
    };

    let targets: Vec<u64> = match msg.mode {
        DetachMode::Latest => {
            let Some(s) = server.sessions.get(&name) else { return };
            s.attached_clients
                .iter()
                .filter_map(|cid| server.clients.get(*cid))
                .max_by_key(|c| c.last_active())
                .map(|c| c.id())
                .into_iter()
                .collect()
        }
        DetachMode::All => server
            .sessions
            .get(&name)
            .map(|s| s.attached_clients.iter().copied().collect())
            .unwrap_or_default(),
    };

    for target in targets {
        server.send_control(target, &DetachNotification {});
        server.detach_client(target, &name);
    }
    server.send_control(id, &DetachResponse {});
}

fn request_signal(server: &mut Server, id: u64, payload: &[u8]) {
    let Ok(msg) = decode_payload::<SignalRequest>(payload) else { return };
    if !(1..=64).contains(&msg.signo) {
        debug!(client = id, signo = msg.signo, "refusing out-of-range signal");
        return;
    }
    let Some(name) = server.clients.get(id).and_then(|c| c.attached.clone()) else {
        return;
    };
    if let Some(s) = server.sessions.get(&name) {
        s.signal(msg.signo);
    }
}

fn request_resize(server: &mut Server, id: u64, payload: &[u8]) {
    let Ok(msg) = decode_payload::<ResizeRequest>(payload) else { return };
    let name = {
        let Some(client) = server.clients.get_mut(id) else { return };
        client.window = (msg.rows, msg.cols);
        client.attached.clone()
    };
    if let Some(name) = name {
        if let Some(s) = server.sessions.get(&name) {
            if let Err(e) = s.resize(msg.rows, msg.cols) {
                debug!(session = %name, error = %e, "resize failed");
            }
        }
    }
}

fn request_keepalive(server: &mut Server, id: u64, _payload: &[u8]) {
    server.send_control(id, &KeepaliveResponse {});
}

fn request_statistics(server: &mut Server, id: u64, _payload: &[u8]) {
    let contents = server.statistics();
    server.send_control(id, &StatisticsResponse { contents });
}
