//! Router / broadcast: snapshot-then-release-then-iterate fan-out
//! primitives.
//!
//! Grounded on the teacher's fan-out-with-per-recipient-failure-tolerance
//! approach (`socket/server.rs`'s accept loop logging and continuing past
//! individual connection failures) and `hub/state.rs`'s
//! snapshot-before-iterate discipline. Every function here takes its
//! snapshot from the directory under the directory mutex and releases it
//! before touching any connection — spec.md §3 and §5 both require that a
//! broadcast never runs while the directory mutex is held.

use crate::directory::{Directory, PresenceState};
use crate::protocol::{opcode, Frame};

/// Send one frame to one connection.
///
/// # Errors
///
/// Returns an error only if `frame` fails to encode (a field over 255
/// bytes) — a caller bug, not a transport failure.
pub fn send_to(conn: &crate::conn::OutboundHandle, frame: &Frame) -> anyhow::Result<bool> {
    conn.send_frame(frame)
}

/// Broadcast a UTF-8 text frame to every connected user whose presence is
/// `Active` or `Busy` (spec.md §4.4 — `Inactive` users are connected but
/// excluded from text broadcasts). Recipients whose `conn` is not open
/// are skipped.
pub fn broadcast_text(directory: &Directory, text: &str) {
    let snapshot = directory.snapshot_connected();
    for entry in snapshot {
        if !matches!(entry.state, PresenceState::Active | PresenceState::Busy) {
            continue;
        }
        let Some(conn) = entry.conn.as_ref() else { continue };
        if !conn.send_text(text) {
            log::warn!("broadcast_text: send failed for {}", entry.name);
        }
    }
}

/// Broadcast `USER_STATUS_CHANGED` (opcode 54, fixed layout — no length
/// prefix before the state byte) to every connected user.
///
/// Refuses to broadcast (logging an error instead) when `name` exceeds
/// 255 bytes: the single length byte in this fixed layout can't represent
/// a longer name, and `as u8` would silently wrap instead of failing the
/// way `Frame::encode` does for length-prefixed frames (spec.md §4.1).
pub fn broadcast_presence(directory: &Directory, name: &str, new_state: PresenceState) {
    if name.len() > 255 {
        log::error!("broadcast_presence: name {name} exceeds 255 bytes, refusing to encode");
        return;
    }
    let bytes = Frame::encode_raw(
        opcode::server::USER_STATUS_CHANGED,
        &[&[name.len() as u8], name.as_bytes(), &[new_state.to_byte()]],
    );
    for entry in directory.snapshot_connected() {
        let Some(conn) = entry.conn.as_ref() else { continue };
        if !conn.send_raw(bytes.clone()) {
            log::warn!("broadcast_presence: send failed for {}", entry.name);
        }
    }
}

/// Broadcast `USER_REGISTERED` (opcode 53, fixed layout) to every
/// connected user. As [`broadcast_presence`], refuses to encode (logging
/// instead) when `name` or `address` exceeds 255 bytes.
pub fn broadcast_joined(directory: &Directory, name: &str, address: &str) {
    if name.len() > 255 || address.len() > 255 {
        log::error!("broadcast_joined: name or address for {name} exceeds 255 bytes, refusing to encode");
        return;
    }
    let bytes = Frame::encode_raw(
        opcode::server::USER_REGISTERED,
        &[
            &[name.len() as u8],
            name.as_bytes(),
            &[address.len() as u8],
            address.as_bytes(),
        ],
    );
    for entry in directory.snapshot_connected() {
        let Some(conn) = entry.conn.as_ref() else { continue };
        if !conn.send_raw(bytes.clone()) {
            log::warn!("broadcast_joined: send failed for {}", entry.name);
        }
    }
}

/// Fan out `MESSAGE_RECEIVED(sender, text)` to every connected user
/// (including the sender, if still connected). Used for public
/// `SEND_MESSAGE(~, text)`. Returns the number of recipients the frame
/// was queued for.
pub fn broadcast_message_received(directory: &Directory, sender: &str, text: &str) -> usize {
    let frame = Frame::new(
        opcode::server::MESSAGE_RECEIVED,
        vec![sender.as_bytes().to_vec(), text.as_bytes().to_vec()],
    );
    let Ok(bytes) = frame.encode() else {
        log::error!("broadcast_message_received: failed to encode frame for {sender}");
        return 0;
    };
    let mut delivered = 0;
    for entry in directory.snapshot_connected() {
        let Some(conn) = entry.conn.as_ref() else { continue };
        if conn.send_raw(bytes.clone()) {
            delivered += 1;
        } else {
            log::warn!("broadcast_message_received: send failed for {}", entry.name);
        }
    }
    delivered
}
