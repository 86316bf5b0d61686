//! Admission controller: validates the WebSocket handshake's `name=`
//! query parameter and rejects duplicate live connections before a
//! session is ever created.
//!
//! Grounded on the teacher's `ws.rs`, which centralizes all WebSocket
//! setup for the *client* side in one module — this is the server-side
//! mirror image, built on `tokio_tungstenite::accept_hdr_async`'s
//! `Callback` hook (the idiomatic way this ecosystem inspects the HTTP
//! upgrade request and can short-circuit with a non-101 response).
//! Validation rules themselves follow
//! `examples/original_source/Servidor/server.cpp`'s `isValidUsername`/
//! `extractUsername`.

use std::sync::{Arc, Mutex as StdMutex};

use anyhow::{anyhow, Context, Result};
use tokio::net::TcpStream;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http;

use crate::conn::WsStream;
use crate::directory::Directory;

const INVALID_USERNAME_BODY: &str = "Nombre de usuario inválido";
const ALREADY_CONNECTED_BODY: &str = "Usuario ya conectado";

/// Outcome of attempting to admit one accepted TCP connection.
pub enum Admission {
    Admitted { stream: WsStream, name: String },
    Rejected { status: u16, body: &'static str },
}

enum Verdict {
    Admit(String),
    Reject(u16, &'static str),
}

fn extract_name_param(query: &str) -> Option<&str> {
    query.split('&').find_map(|pair| pair.strip_prefix("name="))
}

fn decode_name(raw: &str) -> Option<String> {
    percent_encoding::percent_decode_str(raw)
        .decode_utf8()
        .ok()
        .map(|s| s.into_owned())
}

/// Percent-decode and validate the `name` query parameter. Does not
/// trim whitespace (spec.md §4.6: "trim nothing").
fn extract_and_validate_name(query: &str) -> Result<String, &'static str> {
    let raw = extract_name_param(query).ok_or(INVALID_USERNAME_BODY)?;
    let decoded = decode_name(raw).ok_or(INVALID_USERNAME_BODY)?;
    if decoded.is_empty() || decoded == "~" {
        return Err(INVALID_USERNAME_BODY);
    }
    Ok(decoded)
}

fn build_error_response(status: u16, body: &str) -> ErrorResponse {
    http::Response::builder()
        .status(status)
        .body(Some(body.to_string()))
        .expect("building a static error response cannot fail")
}

/// Perform the WebSocket handshake, short-circuiting with an HTTP 400 and
/// a Spanish-language body when the name is invalid or already live.
///
/// # Errors
///
/// Returns an error only for handshake failures unrelated to admission
/// (protocol violation before the callback ran, I/O error). A deliberate
/// admission rejection is reported via `Ok(Admission::Rejected { .. })`,
/// not an `Err` — tungstenite has already written the HTTP response for
/// us in that case.
pub async fn accept(stream: TcpStream, directory: Arc<Directory>) -> Result<Admission> {
    let verdict: Arc<StdMutex<Option<Verdict>>> = Arc::new(StdMutex::new(None));
    let verdict_for_cb = verdict.clone();
    let directory_for_cb = directory;

    let callback = move |request: &Request, response: Response| -> std::result::Result<Response, ErrorResponse> {
        let query = request.uri().query().unwrap_or("");
        let name = match extract_and_validate_name(query) {
            Ok(name) => name,
            Err(body) => {
                *verdict_for_cb.lock().expect("verdict mutex poisoned") = Some(Verdict::Reject(400, body));
                return Err(build_error_response(400, body));
            }
        };
        if directory_for_cb.is_connected(&name) {
            *verdict_for_cb.lock().expect("verdict mutex poisoned") =
                Some(Verdict::Reject(400, ALREADY_CONNECTED_BODY));
            return Err(build_error_response(400, ALREADY_CONNECTED_BODY));
        }
        *verdict_for_cb.lock().expect("verdict mutex poisoned") = Some(Verdict::Admit(name));
        Ok(response)
    };

    match accept_hdr_async(stream, callback).await {
        Ok(ws_stream) => match verdict.lock().expect("verdict mutex poisoned").take() {
            Some(Verdict::Admit(name)) => Ok(Admission::Admitted { stream: ws_stream, name }),
            _ => Err(anyhow!("handshake succeeded without recording an admitted name")),
        },
        Err(handshake_err) => match verdict.lock().expect("verdict mutex poisoned").take() {
            Some(Verdict::Reject(status, body)) => Ok(Admission::Rejected { status, body }),
            _ => Err(anyhow!("websocket handshake failed: {handshake_err}")),
        },
    }
}

/// Whether the peeked request head looks like a WebSocket upgrade
/// request, versus a plain pre-flight `GET`.
fn is_websocket_upgrade(head: &str) -> bool {
    head.to_ascii_lowercase().contains("upgrade: websocket")
}

/// Handle a non-upgrade HTTP GET against the handshake URL: `200 OK` with
/// an empty body when the name is available, `400 Bad Request` with body
/// "Usuario ya conectado" when taken (spec.md §4.6).
async fn respond_preflight(stream: &mut TcpStream, head: &str, directory: &Directory) -> Result<()> {
    use tokio::io::AsyncWriteExt;

    let request_line = head.lines().next().unwrap_or("");
    let target = request_line.split_whitespace().nth(1).unwrap_or("");
    let query = target.split_once('?').map_or("", |(_, q)| q);

    let response = match extract_and_validate_name(query) {
        Err(body) => http_response(400, body),
        Ok(name) if directory.is_connected(&name) => http_response(400, ALREADY_CONNECTED_BODY),
        Ok(_) => http_response(200, ""),
    };

    stream
        .write_all(response.as_bytes())
        .await
        .context("writing pre-flight response")?;
    let _ = stream.shutdown().await;
    Ok(())
}

fn http_response(status: u16, body: &str) -> String {
    let reason = if status == 200 { "OK" } else { "Bad Request" };
    format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    )
}

/// Accept one TCP connection: peek its request head to decide whether it
/// is a WebSocket upgrade or a plain pre-flight GET, then dispatch
/// accordingly. Returns `None` for pre-flight requests and rejected
/// admissions (both already fully handled on the wire); `Some` for an
/// admitted session.
///
/// # Errors
///
/// Propagates I/O errors from peeking the stream or from
/// [`accept`].
pub async fn handle_connection(
    mut stream: TcpStream,
    directory: Arc<Directory>,
) -> Result<Option<(WsStream, String)>> {
    let mut peek_buf = [0u8; 8192];
    let n = stream.peek(&mut peek_buf).await.context("peeking request head")?;
    let head = String::from_utf8_lossy(&peek_buf[..n]).into_owned();

    if !is_websocket_upgrade(&head) {
        respond_preflight(&mut stream, &head, &directory).await?;
        return Ok(None);
    }

    match accept(stream, directory).await? {
        Admission::Admitted { stream, name } => Ok(Some((stream, name))),
        Admission::Rejected { status, body } => {
            log::info!("admission rejected ({status}): {body}");
            Ok(None)
        }
    }
}
