//! The one-shot credential exchange that opens every connection.

use super::next_data_frame;
use super::payload;
use axum::extract::ws::Message;
use futures_util::Stream;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use std::time::Duration;
use tokio::time::timeout;

/// Why a connection was refused during authentication.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("no credential received within {0:?}")]
    Timeout(Duration),
    #[error("credential frame is not valid JSON: {0}")]
    MalformedFrame(#[source] serde_json::Error),
    #[error("invalid or missing token")]
    InvalidToken,
    #[error("connection closed before authentication")]
    Closed,
}

impl AuthError {
    /// Reason text for the policy-violation close frame, or `None` when the
    /// peer is already gone.
    pub fn close_reason(&self) -> Option<&'static str> {
        match self {
            AuthError::InvalidToken => Some("Authentication failed"),
            AuthError::Timeout(_) | AuthError::MalformedFrame(_) => Some("Authentication required"),
            AuthError::Closed => None,
        }
    }
}

/// Reads exactly one data frame within `deadline` and checks its `token`.
///
/// With no `expected` token the server runs open: any well-formed JSON frame
/// is accepted. Nothing beyond the first data frame is read.
pub async fn authenticate<S, E>(
    socket_rx: &mut S,
    expected: Option<&SecretString>,
    deadline: Duration,
) -> Result<(), AuthError>
where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: std::fmt::Display,
{
    let frame = match timeout(deadline, next_data_frame(socket_rx)).await {
        Err(_) => return Err(AuthError::Timeout(deadline)),
        Ok(None) => return Err(AuthError::Closed),
        Ok(Some(frame)) => frame,
    };
    let raw = payload(&frame).unwrap_or_default();
    let value: Value = serde_json::from_slice(raw).map_err(AuthError::MalformedFrame)?;

    let Some(expected) = expected else {
        return Ok(());
    };
    match value.get("token").and_then(Value::as_str) {
        Some(token) if token == expected.expose_secret() => Ok(()),
        _ => Err(AuthError::InvalidToken),
    }
}
