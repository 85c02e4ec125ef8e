//! WebSocket Session Management
//!
//! This module contains the server side of the relay protocol. It is structured
//! into submodules:
//!
//! - `auth`: Validates the one-shot credential that opens every connection.
//! - `session`: Manages the connection lifecycle and the per-message pipeline.
//! - `bridge`: Streams a validated conversation through the backend to the client.

pub mod auth;
pub mod bridge;
pub mod session;

pub use session::{SessionError, ws_handler};

use axum::extract::ws::Message;
use futures_util::{Stream, StreamExt};
use tracing::info;

/// Sent when a client exceeds its request quota.
pub const RATE_LIMITED_MESSAGE: &str = "rate limit exceeded, try again later";
/// Sent when no backend is configured.
pub const UNAVAILABLE_MESSAGE: &str = "server is not configured to generate responses";
/// Sent in place of any backend failure detail.
pub const INTERNAL_ERROR_MESSAGE: &str = "internal server error";
/// Sent for each frame discarded because too many were waiting.
pub const BACKLOG_FULL_MESSAGE: &str = "too many pending requests, message dropped";

/// Frames a session holds while a reply is streaming.
pub const MAX_BACKLOG: usize = 4;

/// Waits for the next text or binary frame, skipping ping/pong.
///
/// Returns `None` once the peer has closed the connection or the transport failed.
pub(crate) async fn next_data_frame<S, E>(socket_rx: &mut S) -> Option<Message>
where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: std::fmt::Display,
{
    while let Some(item) = socket_rx.next().await {
        match item {
            Ok(msg @ (Message::Text(_) | Message::Binary(_))) => return Some(msg),
            Ok(Message::Ping(_) | Message::Pong(_)) => continue,
            Ok(Message::Close(frame)) => {
                info!(?frame, "Client sent close frame.");
                return None;
            }
            Err(e) => {
                info!(error = %e, "Error receiving from client WebSocket.");
                return None;
            }
        }
    }
    None
}

/// The raw bytes of a data frame.
pub(crate) fn payload(msg: &Message) -> Option<&[u8]> {
    match msg {
        Message::Text(text) => Some(text.as_str().as_bytes()),
        Message::Binary(data) => Some(&data[..]),
        _ => None,
    }
}
