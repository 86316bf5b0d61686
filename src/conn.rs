//! The concrete `Connection` abstraction: a spawned read/write task pair
//! bridging one accepted WebSocket stream to typed inbound events and an
//! outbound queue.
//!
//! Grounded on the teacher's `socket/client_conn.rs::SocketClientConn`
//! (split read/write halves, a dedicated write task fed through an
//! unbounded mpsc channel so every outbound write to one connection is
//! serialized) and `ws.rs`'s `WsReader`/`WsWriter` wrapper style for
//! talking to `tokio_tungstenite`.

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::protocol::Frame;

/// Server-side WebSocket stream type: a plain accepted TCP connection
/// after the HTTP upgrade, never TLS (this crate terminates plaintext
/// WebSocket on the internal network, per spec.md §6).
pub type WsStream = WebSocketStream<tokio::net::TcpStream>;

/// An event decoded from the connection's read half, forwarded to the
/// owning session task.
#[derive(Debug)]
pub enum InboundEvent {
    Text(String),
    Binary(Vec<u8>),
    /// The peer closed the stream or a read error occurred.
    Disconnected,
}

/// Queued outbound work for a connection's write task.
enum Outbound {
    Text(String),
    Binary(Vec<u8>),
    Close,
}

/// Cloneable handle to a connection's outbound queue.
///
/// Stored in [`crate::directory::UserRecord::conn`]. Sessions never touch
/// the write half directly — every outbound frame is serialized through
/// this queue, per spec.md §9's "serialize writes to any single
/// connection."
#[derive(Clone, Debug)]
pub struct OutboundHandle {
    tx: UnboundedSender<Outbound>,
}

impl OutboundHandle {
    /// Send a UTF-8 text frame. Returns `false` if the connection's write
    /// task has already exited (peer gone).
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.tx.send(Outbound::Text(text.into())).is_ok()
    }

    /// Encode and send a binary protocol frame.
    ///
    /// # Errors
    ///
    /// Returns an error if `frame` fails to encode (a field exceeds 255
    /// bytes); this is a caller bug, not a transport failure.
    pub fn send_frame(&self, frame: &Frame) -> anyhow::Result<bool> {
        let bytes = frame.encode()?;
        Ok(self.tx.send(Outbound::Binary(bytes)).is_ok())
    }

    /// Send pre-encoded binary bytes (used for `encode_raw` fixed-layout
    /// frames).
    pub fn send_raw(&self, bytes: Vec<u8>) -> bool {
        self.tx.send(Outbound::Binary(bytes)).is_ok()
    }

    /// Request a graceful close of the underlying stream.
    pub fn close(&self) -> bool {
        self.tx.send(Outbound::Close).is_ok()
    }
}

impl std::fmt::Debug for Outbound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outbound::Text(t) => write!(f, "Outbound::Text({} bytes)", t.len()),
            Outbound::Binary(b) => write!(f, "Outbound::Binary({} bytes)", b.len()),
            Outbound::Close => write!(f, "Outbound::Close"),
        }
    }
}

/// One accepted connection's read/write task pair.
pub struct Connection {
    outbound: OutboundHandle,
    read_handle: JoinHandle<()>,
    write_handle: JoinHandle<()>,
}

impl Connection {
    /// Split `stream`, spawn the read and write tasks, and return the
    /// connection handle together with the channel of decoded inbound
    /// events for the caller's session loop to consume.
    pub fn spawn(stream: WsStream) -> (Self, UnboundedReceiver<InboundEvent>) {
        let (sink, stream) = stream.split();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();

        let read_handle = tokio::spawn(Self::read_loop(stream, in_tx));
        let write_handle = tokio::spawn(Self::write_loop(sink, out_rx));

        (
            Self {
                outbound: OutboundHandle { tx: out_tx },
                read_handle,
                write_handle,
            },
            in_rx,
        )
    }

    /// A clone of the outbound handle, for storing in the directory.
    #[must_use]
    pub fn outbound(&self) -> OutboundHandle {
        self.outbound.clone()
    }

    async fn read_loop(
        mut stream: futures_util::stream::SplitStream<WsStream>,
        events: UnboundedSender<InboundEvent>,
    ) {
        loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    if events.send(InboundEvent::Text(text.to_string())).is_err() {
                        return;
                    }
                }
                Some(Ok(Message::Binary(data))) => {
                    if events.send(InboundEvent::Binary(data.to_vec())).is_err() {
                        return;
                    }
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                    // tungstenite answers pings automatically; nothing to surface.
                }
                Some(Ok(Message::Close(_))) | None => {
                    let _ = events.send(InboundEvent::Disconnected);
                    return;
                }
                Some(Ok(Message::Frame(_))) => {
                    // Raw frames never surface above the tungstenite layer itself.
                }
                Some(Err(e)) => {
                    log::warn!("connection read error: {e}");
                    let _ = events.send(InboundEvent::Disconnected);
                    return;
                }
            }
        }
    }

    async fn write_loop(
        mut sink: futures_util::stream::SplitSink<WsStream, Message>,
        mut queue: UnboundedReceiver<Outbound>,
    ) {
        while let Some(item) = queue.recv().await {
            let result = match item {
                Outbound::Text(text) => sink.send(Message::Text(text.into())).await,
                Outbound::Binary(data) => sink.send(Message::Binary(data.into())).await,
                Outbound::Close => sink.send(Message::Close(None)).await,
            };
            if let Err(e) = result {
                log::warn!("connection write error: {e}");
                break;
            }
        }
        let _ = sink.close().await;
    }

    /// Abort both tasks immediately, without a graceful close handshake.
    pub fn disconnect(self) {
        self.read_handle.abort();
        self.write_handle.abort();
    }
}
