//! Per-connection session lifecycle: enter, receive loop, exit, and the
//! binary opcode dispatch table.
//!
//! Grounded on `examples/original_source/Servidor/server.cpp::handleClient`
//! for control flow and the exact user-facing Spanish text strings, and on
//! the teacher's `socket/client_conn.rs` for the task-per-connection shape
//! (one spawned task per accepted stream, driven by an inbound event
//! channel fed by [`crate::conn::Connection`]).

use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;

use crate::conn::{Connection, InboundEvent, OutboundHandle, WsStream};
use crate::directory::{Directory, PresenceState, UpsertOutcome};
use crate::history::{PrivateHistory, PublicHistory};
use crate::protocol::opcode::error;
use crate::protocol::{opcode, Frame};
use crate::router;

const WELCOME_TEXT: &str = "¡Bienvenido a YaPPuchino!";
const VOLUNTARY_DISCONNECT_REASON: &str = "El usuario solicitó desconexión voluntaria";
const EXIT_COMMAND: &str = "/exit";
const PUBLIC_DEST: &str = "~";

/// Shared services every session needs; cloned (cheaply, via `Arc`) into
/// each spawned session task.
pub struct SessionContext {
    pub directory: Arc<Directory>,
    pub public_history: Arc<PublicHistory>,
    pub private_history: Arc<PrivateHistory>,
}

fn state_label(state: PresenceState) -> &'static str {
    match state {
        PresenceState::Disconnected => "DESCONECTADO",
        PresenceState::Active => "ACTIVO",
        PresenceState::Busy => "OCUPADO",
        PresenceState::Inactive => "INACTIVO",
    }
}

/// Accept one admitted `(stream, name)` pair and spawn its session task.
pub fn spawn(ctx: Arc<SessionContext>, stream: WsStream, name: String, address: String) {
    tokio::spawn(async move {
        run(ctx, stream, name, address).await;
    });
}

async fn run(ctx: Arc<SessionContext>, stream: WsStream, name: String, address: String) {
    let (conn, events) = Connection::spawn(stream);
    let outbound = conn.outbound();

    if !enter(&ctx, &name, &address, outbound.clone()) {
        // Directory refused to overwrite a live `conn` for this name
        // (spec.md §7: an invariant violation, not a normal session end).
        // Close the offending new connection without ever running its
        // receive loop or touching the still-live record via `exit()`.
        log::warn!("rejecting duplicate live connection for {name} from {address}");
        outbound.close();
        conn.disconnect();
        return;
    }

    receive_loop(&ctx, &name, &outbound, events).await;

    exit(&ctx, &name);
    conn.disconnect();
}

/// Returns `false` when the directory refused the upsert because a live
/// connection already owns `name` — the caller must not proceed to the
/// receive loop or to `exit()` in that case.
fn enter(ctx: &SessionContext, name: &str, address: &str, outbound: OutboundHandle) -> bool {
    match ctx.directory.upsert_on_join(name, outbound.clone(), address.to_string()) {
        UpsertOutcome::Rejected => return false,
        UpsertOutcome::Created | UpsertOutcome::Reconnected => {}
    }
    outbound.send_text(WELCOME_TEXT);
    router::broadcast_joined(&ctx.directory, name, address);
    router::broadcast_text(&ctx.directory, &format!("Usuario {name} se ha unido."));
    // Announce the effective presence to peers (spec.md §4.5 step 1).
    ctx.directory.set_state(name, PresenceState::Active, true);
    router::broadcast_presence(&ctx.directory, name, PresenceState::Active);
    ctx.directory.touch(name);
    true
}

async fn receive_loop(
    ctx: &SessionContext,
    name: &str,
    outbound: &OutboundHandle,
    mut events: UnboundedReceiver<InboundEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            InboundEvent::Disconnected => break,
            InboundEvent::Text(text) => {
                touch_and_maybe_reactivate(ctx, name, outbound, !text.trim().is_empty());
                if handle_text(ctx, name, outbound, &text) {
                    break;
                }
            }
            InboundEvent::Binary(data) => {
                touch_and_maybe_reactivate(ctx, name, outbound, !data.is_empty());
                handle_binary(ctx, name, outbound, &data);
            }
        }
    }
}

/// Touch `lastActivity` on every inbound frame; reactivate an `Inactive`
/// user back to `Active` when the frame carries real content, per
/// spec.md §4.5 step 2 and the reactivation law in §8.
fn touch_and_maybe_reactivate(ctx: &SessionContext, name: &str, outbound: &OutboundHandle, is_meaningful: bool) {
    ctx.directory.touch(name);
    if is_meaningful && ctx.directory.state_of(name) == Some(PresenceState::Inactive) {
        ctx.directory.set_state(name, PresenceState::Active, true);
        router::broadcast_presence(&ctx.directory, name, PresenceState::Active);
        outbound.send_text(format!("Se ha reactivado el estado de {name} a ACTIVO."));
    }
}

/// Returns `true` when the session loop should exit.
fn handle_text(ctx: &SessionContext, name: &str, outbound: &OutboundHandle, text: &str) -> bool {
    if text.trim().is_empty() {
        send_error(outbound, error::EMPTY_MESSAGE);
        return false;
    }
    if text == EXIT_COMMAND {
        outbound.close();
        log::info!("{name}: {VOLUNTARY_DISCONNECT_REASON}");
        return true;
    }
    if let Err(e) = ctx.public_history.append(name, text) {
        log::warn!("failed to append public history for {name}: {e}");
    }
    router::broadcast_text(&ctx.directory, &format!("{name}: {text}"));
    false
}

fn handle_binary(ctx: &SessionContext, name: &str, outbound: &OutboundHandle, data: &[u8]) {
    let frame = match Frame::decode(data) {
        Ok(frame) => frame,
        Err(e) => {
            log::warn!("malformed frame from {name}: {e}");
            send_error(outbound, error::EMPTY_MESSAGE);
            return;
        }
    };

    match frame.opcode {
        opcode::client::LIST_USERS => handle_list_users(ctx, outbound),
        opcode::client::GET_USER => handle_get_user(ctx, outbound, &frame),
        opcode::client::CHANGE_STATUS => handle_change_status(ctx, outbound, &frame),
        opcode::client::SEND_MESSAGE => handle_send_message(ctx, name, outbound, &frame),
        opcode::client::GET_HISTORY => handle_get_history(ctx, name, outbound, &frame),
        opcode::client::LIST_ALL_USERS => handle_list_all_users(ctx, outbound),
        other => {
            log::warn!("unknown opcode {other} from {name}");
            send_error(outbound, error::EMPTY_MESSAGE);
        }
    }
}

fn send_error(outbound: &OutboundHandle, subcode: u8) {
    outbound.send_raw(Frame::encode_raw(opcode::server::ERROR_RESPONSE, &[&[subcode]]));
}

fn field_as_str(frame: &Frame, index: usize) -> Option<&str> {
    frame.fields.get(index).and_then(|f| std::str::from_utf8(f).ok())
}

/// Append `len8(bytes) ‖ bytes` to `buf`. Fails (and leaves `buf`
/// untouched) when `bytes` exceeds 255 bytes, mirroring `Frame::encode`'s
/// guard (spec.md §4.1) for the raw/manual encoders below that don't go
/// through [`Frame::encode`] itself.
fn try_push_field(buf: &mut Vec<u8>, bytes: &[u8]) -> Result<(), ()> {
    if bytes.len() > 255 {
        return Err(());
    }
    buf.push(bytes.len() as u8);
    buf.extend_from_slice(bytes);
    Ok(())
}

/// Encode the `(count, (len8, name, state)+)` layout shared by
/// `RESPONSE_LIST_USERS` and `RESPONSE_ALL_USERS`. `RESPONSE_GET_USER` has
/// a different, count-less layout — see [`encode_get_user`].
fn encode_user_list(opcode: u8, entries: &[(String, PresenceState)]) -> Result<Vec<u8>, ()> {
    let mut buf = vec![opcode, entries.len() as u8];
    for (name, state) in entries {
        try_push_field(&mut buf, name.as_bytes())?;
        buf.push(state.to_byte());
    }
    Ok(buf)
}

/// Encode `RESPONSE_GET_USER = opcode, len8(name), name, state` — no count
/// byte, unlike `RESPONSE_LIST_USERS`/`RESPONSE_ALL_USERS` (spec.md
/// §4.5.1; confirmed against the ground-truth client parser, which reads
/// `code == 52` straight into `nameLen` with no preceding count read).
fn encode_get_user(name: &str, state: PresenceState) -> Result<Vec<u8>, ()> {
    let mut buf = vec![opcode::server::RESPONSE_GET_USER];
    try_push_field(&mut buf, name.as_bytes())?;
    buf.push(state.to_byte());
    Ok(buf)
}

fn handle_list_users(ctx: &SessionContext, outbound: &OutboundHandle) {
    let entries: Vec<_> = ctx
        .directory
        .snapshot_connected()
        .into_iter()
        .map(|e| (e.name, e.state))
        .collect();
    match encode_user_list(opcode::server::RESPONSE_LIST_USERS, &entries) {
        Ok(bytes) => {
            outbound.send_raw(bytes);
        }
        Err(()) => {
            log::error!("LIST_USERS: a username exceeds 255 bytes, refusing to encode");
            send_error(outbound, error::EMPTY_MESSAGE);
        }
    }
}

fn handle_list_all_users(ctx: &SessionContext, outbound: &OutboundHandle) {
    let entries: Vec<_> = ctx
        .directory
        .snapshot()
        .into_iter()
        .map(|e| (e.name, e.state))
        .collect();
    match encode_user_list(opcode::server::RESPONSE_ALL_USERS, &entries) {
        Ok(bytes) => {
            outbound.send_raw(bytes);
        }
        Err(()) => {
            log::error!("LIST_ALL_USERS: a username exceeds 255 bytes, refusing to encode");
            send_error(outbound, error::EMPTY_MESSAGE);
        }
    }
}

fn handle_get_user(ctx: &SessionContext, outbound: &OutboundHandle, frame: &Frame) {
    let Some(target) = field_as_str(frame, 0) else {
        send_error(outbound, error::EMPTY_MESSAGE);
        return;
    };
    match ctx.directory.get_connected(target) {
        Some((name, state)) => match encode_get_user(&name, state) {
            Ok(bytes) => {
                outbound.send_raw(bytes);
            }
            Err(()) => {
                log::error!("GET_USER: username {name} exceeds 255 bytes, refusing to encode");
                send_error(outbound, error::EMPTY_MESSAGE);
            }
        },
        None => send_error(outbound, error::USER_NOT_FOUND),
    }
}

fn handle_change_status(ctx: &SessionContext, outbound: &OutboundHandle, frame: &Frame) {
    let (Some(target), Some(state_field)) = (field_as_str(frame, 0), frame.fields.get(1)) else {
        send_error(outbound, error::EMPTY_MESSAGE);
        return;
    };
    let Some(&state_byte) = state_field.first() else {
        send_error(outbound, error::EMPTY_MESSAGE);
        return;
    };
    let new_state = match state_byte {
        1 => PresenceState::Active,
        2 => PresenceState::Busy,
        3 => PresenceState::Inactive,
        _ => {
            send_error(outbound, error::INVALID_STATUS);
            return;
        }
    };
    if !ctx.directory.is_connected(target) {
        send_error(outbound, error::USER_NOT_FOUND);
        return;
    }
    if ctx.directory.set_state(target, new_state, true).is_some() {
        router::broadcast_presence(&ctx.directory, target, new_state);
        router::broadcast_text(
            &ctx.directory,
            &format!("Usuario {target} se ha cambiado a estado {}.", state_label(new_state)),
        );
    }
}

fn handle_send_message(ctx: &SessionContext, name: &str, outbound: &OutboundHandle, frame: &Frame) {
    let (Some(dest), Some(text)) = (field_as_str(frame, 0), field_as_str(frame, 1)) else {
        send_error(outbound, error::EMPTY_MESSAGE);
        return;
    };
    if text.is_empty() {
        send_error(outbound, error::EMPTY_MESSAGE);
        return;
    }

    if dest == PUBLIC_DEST {
        if let Err(e) = ctx.public_history.append(name, text) {
            log::warn!("failed to append public history for {name}: {e}");
        }
        router::broadcast_message_received(&ctx.directory, name, text);
        return;
    }

    if let Err(e) = ctx.private_history.append(name, dest, text) {
        log::warn!("failed to append private history for {name}/{dest}: {e}");
    }

    match ctx.directory.conn_of(dest) {
        Some(dest_conn) => {
            let frame = Frame::new(
                opcode::server::MESSAGE_RECEIVED,
                vec![name.as_bytes().to_vec(), text.as_bytes().to_vec()],
            );
            if let Ok(bytes) = frame.encode() {
                dest_conn.send_raw(bytes.clone());
                outbound.send_raw(bytes);
            }
        }
        None => send_error(outbound, error::USER_DISCONNECTED),
    }
}

fn handle_get_history(ctx: &SessionContext, name: &str, outbound: &OutboundHandle, frame: &Frame) {
    let Some(target) = field_as_str(frame, 0) else {
        send_error(outbound, error::EMPTY_MESSAGE);
        return;
    };

    let entries = if target == PUBLIC_DEST {
        match ctx.public_history.load() {
            Ok(entries) => entries,
            Err(e) => {
                log::warn!("failed to load public history: {e}");
                Vec::new()
            }
        }
    } else {
        if !ctx.private_history.exists(name, target) {
            send_error(outbound, error::USER_NOT_FOUND);
            return;
        }
        match ctx.private_history.load(name, target) {
            Ok(entries) => entries,
            Err(e) => {
                log::warn!("failed to load private history for {name}/{target}: {e}");
                Vec::new()
            }
        }
    };

    let mut buf = vec![opcode::server::RESPONSE_HISTORY, entries.len() as u8];
    for entry in &entries {
        if try_push_field(&mut buf, entry.sender.as_bytes()).is_err()
            || try_push_field(&mut buf, entry.text.as_bytes()).is_err()
        {
            log::error!("GET_HISTORY: an entry from {} exceeds 255 bytes, refusing to encode", entry.sender);
            send_error(outbound, error::EMPTY_MESSAGE);
            return;
        }
    }
    outbound.send_raw(buf);
}

fn exit(ctx: &SessionContext, name: &str) {
    ctx.directory.mark_disconnected(name);
    router::broadcast_presence(&ctx.directory, name, PresenceState::Disconnected);
    router::broadcast_text(&ctx.directory, &format!("Usuario {name} se ha desconectado."));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::test_support::{dummy_outbound, tracked_outbound, Captured};

    fn ctx() -> Arc<SessionContext> {
        let dir = tempfile::TempDir::new().unwrap();
        Arc::new(SessionContext {
            directory: Arc::new(Directory::new()),
            public_history: Arc::new(PublicHistory::new(dir.path().join("general.txt"))),
            private_history: Arc::new(PrivateHistory::new(dir.path().join("private"))),
        })
    }

    #[tokio::test]
    async fn empty_text_message_yields_error_response() {
        let ctx = ctx();
        ctx.directory.upsert_on_join("alice", dummy_outbound(), "addr".into());
        let (outbound, mut rx) = tracked_outbound();
        assert!(!handle_text(&ctx, "alice", &outbound, "   "));
        let captured = rx.recv().await.unwrap();
        assert_eq!(
            captured,
            Captured::Binary(Frame::encode_raw(opcode::server::ERROR_RESPONSE, &[&[error::EMPTY_MESSAGE]]))
        );
    }

    #[tokio::test]
    async fn exit_command_requests_close_and_stops_loop() {
        let ctx = ctx();
        ctx.directory.upsert_on_join("alice", dummy_outbound(), "addr".into());
        let (outbound, mut rx) = tracked_outbound();
        assert!(handle_text(&ctx, "alice", &outbound, "/exit"));
        assert_eq!(rx.recv().await.unwrap(), Captured::Close);
    }

    #[tokio::test]
    async fn normal_text_appends_history_and_broadcasts() {
        let ctx = ctx();
        ctx.directory.upsert_on_join("alice", dummy_outbound(), "addr".into());
        let (outbound, _rx) = tracked_outbound();
        assert!(!handle_text(&ctx, "alice", &outbound, "hello"));
        let entries = ctx.public_history.load().unwrap();
        assert_eq!(entries.last().unwrap().text, "hello");
    }

    #[tokio::test]
    async fn change_status_rejects_invalid_byte() {
        let ctx = ctx();
        ctx.directory.upsert_on_join("alice", dummy_outbound(), "addr".into());
        let (outbound, mut rx) = tracked_outbound();
        let frame = Frame::new(opcode::client::CHANGE_STATUS, vec![b"alice".to_vec(), vec![7]]);
        handle_change_status(&ctx, &outbound, &frame);
        assert_eq!(
            rx.recv().await.unwrap(),
            Captured::Binary(Frame::encode_raw(opcode::server::ERROR_RESPONSE, &[&[error::INVALID_STATUS]]))
        );
        assert_eq!(ctx.directory.state_of("alice"), Some(PresenceState::Active));
    }

    #[tokio::test]
    async fn change_status_unknown_user_yields_user_not_found() {
        let ctx = ctx();
        let (outbound, mut rx) = tracked_outbound();
        let frame = Frame::new(opcode::client::CHANGE_STATUS, vec![b"ghost".to_vec(), vec![2]]);
        handle_change_status(&ctx, &outbound, &frame);
        assert_eq!(
            rx.recv().await.unwrap(),
            Captured::Binary(Frame::encode_raw(opcode::server::ERROR_RESPONSE, &[&[error::USER_NOT_FOUND]]))
        );
    }

    #[tokio::test]
    async fn send_message_to_disconnected_user_yields_error() {
        let ctx = ctx();
        ctx.directory.upsert_on_join("alice", dummy_outbound(), "addr".into());
        ctx.directory.upsert_on_join("bob", dummy_outbound(), "addr".into());
        ctx.directory.mark_disconnected("bob");
        let (outbound, mut rx) = tracked_outbound();
        let frame = Frame::new(opcode::client::SEND_MESSAGE, vec![b"bob".to_vec(), b"hi".to_vec()]);
        handle_send_message(&ctx, "alice", &outbound, &frame);
        assert_eq!(
            rx.recv().await.unwrap(),
            Captured::Binary(Frame::encode_raw(opcode::server::ERROR_RESPONSE, &[&[error::USER_DISCONNECTED]]))
        );
        let logged = ctx.private_history.load("alice", "bob").unwrap();
        assert_eq!(logged.last().unwrap().text, "hi");
    }

    #[tokio::test]
    async fn send_message_public_broadcasts_message_received() {
        let ctx = ctx();
        ctx.directory.upsert_on_join("alice", dummy_outbound(), "addr".into());
        let (outbound, mut rx) = tracked_outbound();
        let frame = Frame::new(opcode::client::SEND_MESSAGE, vec![b"~".to_vec(), b"hello".to_vec()]);
        handle_send_message(&ctx, "alice", &outbound, &frame);
        let expected = Frame::new(opcode::server::MESSAGE_RECEIVED, vec![b"alice".to_vec(), b"hello".to_vec()])
            .encode()
            .unwrap();
        assert_eq!(rx.recv().await.unwrap(), Captured::Binary(expected));
        assert_eq!(ctx.public_history.load().unwrap().last().unwrap().text, "hello");
    }

    #[tokio::test]
    async fn list_users_excludes_disconnected() {
        let ctx = ctx();
        ctx.directory.upsert_on_join("alice", dummy_outbound(), "addr".into());
        ctx.directory.upsert_on_join("bob", dummy_outbound(), "addr".into());
        ctx.directory.mark_disconnected("bob");
        let (outbound, mut rx) = tracked_outbound();
        handle_list_users(&ctx, &outbound);
        let captured = rx.recv().await.unwrap();
        let Captured::Binary(bytes) = captured else { panic!("expected binary") };
        assert_eq!(bytes[0], opcode::server::RESPONSE_LIST_USERS);
        assert_eq!(bytes[1], 1);
    }

    #[tokio::test]
    async fn reactivation_on_inbound_traffic() {
        let ctx = ctx();
        ctx.directory.upsert_on_join("alice", dummy_outbound(), "addr".into());
        ctx.directory.set_state("alice", PresenceState::Inactive, true);
        let (outbound, mut rx) = tracked_outbound();
        touch_and_maybe_reactivate(&ctx, "alice", &outbound, true);
        assert_eq!(ctx.directory.state_of("alice"), Some(PresenceState::Active));
        let captured = rx.recv().await.unwrap();
        assert_eq!(
            captured,
            Captured::Text("Se ha reactivado el estado de alice a ACTIVO.".to_string())
        );
    }

    #[tokio::test]
    async fn get_user_response_has_no_count_byte() {
        // RESPONSE_GET_USER = opcode, len8(name), name, state — unlike
        // RESPONSE_LIST_USERS/RESPONSE_ALL_USERS, there is no leading
        // count byte (spec.md §4.5.1).
        let ctx = ctx();
        ctx.directory.upsert_on_join("alice", dummy_outbound(), "addr".into());
        ctx.directory.set_state("alice", PresenceState::Busy, true);
        let (outbound, mut rx) = tracked_outbound();
        let frame = Frame::new(opcode::client::GET_USER, vec![b"alice".to_vec()]);
        handle_get_user(&ctx, &outbound, &frame);
        let captured = rx.recv().await.unwrap();
        assert_eq!(
            captured,
            Captured::Binary(vec![
                opcode::server::RESPONSE_GET_USER,
                5,
                b'a',
                b'l',
                b'i',
                b'c',
                b'e',
                PresenceState::Busy.to_byte(),
            ])
        );
    }

    #[tokio::test]
    async fn get_user_unknown_target_yields_user_not_found() {
        let ctx = ctx();
        let (outbound, mut rx) = tracked_outbound();
        let frame = Frame::new(opcode::client::GET_USER, vec![b"ghost".to_vec()]);
        handle_get_user(&ctx, &outbound, &frame);
        assert_eq!(
            rx.recv().await.unwrap(),
            Captured::Binary(Frame::encode_raw(opcode::server::ERROR_RESPONSE, &[&[error::USER_NOT_FOUND]]))
        );
    }

    #[tokio::test]
    async fn duplicate_admission_for_a_live_connection_is_rejected_without_running() {
        let ctx = ctx();
        let first = dummy_outbound();
        ctx.directory.upsert_on_join("alice", first, "addr".into());

        let (second_outbound, mut rx) = tracked_outbound();
        let admitted = enter(&ctx, "alice", "addr2", second_outbound.clone());
        assert!(!admitted);

        // The first (still-live) session's record must be untouched: no
        // welcome text, no join/presence broadcast, and the directory
        // still reports alice as connected with her original handle.
        assert!(rx.try_recv().is_err());
        assert!(ctx.directory.is_connected("alice"));
    }
}
