//! Manages the WebSocket connection lifecycle for one relay client.

use super::{
    BACKLOG_FULL_MESSAGE, MAX_BACKLOG, RATE_LIMITED_MESSAGE, auth::authenticate, bridge,
    next_data_frame, payload,
};
use crate::{state::AppState, tls::PeerAddr};
use axum::{
    extract::{
        ConnectInfo, State,
        ws::{CloseFrame, Message, Utf8Bytes, WebSocket, WebSocketUpgrade, close_code},
    },
    response::Response,
};
use futures_util::{
    Sink, SinkExt, Stream, StreamExt,
    stream::{SplitSink, SplitStream},
};
use relay_core::{RequestOutcome, protocol::ServerMessage, validate::validate_prompt_with_limit};
use std::{
    collections::VecDeque,
    mem,
    net::{IpAddr, SocketAddr},
    sync::Arc,
};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Failures that end a session. Per-request problems never surface here.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("websocket transport failed: {0}")]
    Transport(#[source] BoxError),
    #[error("failed to encode server message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Axum handler to upgrade an HTTP connection to a WebSocket.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(PeerAddr(peer)): ConnectInfo<PeerAddr>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let max_size = state.config.max_frame_size;
    ws.max_message_size(max_size)
        .max_frame_size(max_size)
        .on_upgrade(move |socket| handle_socket(socket, peer, state))
}

/// Main handler for an individual WebSocket connection.
///
/// Authenticates the first frame, then serves prompts one at a time until the
/// client leaves or the transport fails.
#[instrument(
    name = "ws_session",
    skip_all,
    fields(session_id = %Uuid::new_v4(), client = %peer.ip())
)]
async fn handle_socket(socket: WebSocket, peer: SocketAddr, state: Arc<AppState>) {
    info!("New WebSocket connection. Awaiting authentication...");
    let (mut socket_tx, mut socket_rx) = socket.split();

    let expected = state.config.server_token.as_ref();
    if let Err(e) = authenticate(&mut socket_rx, expected, state.config.auth_timeout).await {
        warn!(error = %e, "Authentication failed.");
        if let Some(reason) = e.close_reason() {
            close_with_policy(&mut socket_tx, reason).await;
        }
        return;
    }
    info!("Client authenticated.");

    let mut session = Session {
        client: peer.ip(),
        state,
        socket_tx,
        socket_rx,
        backlog: Backlog::default(),
    };
    if let Err(e) = session.run().await {
        info!(error = %e, "Session ended by transport error.");
    }
    info!("WebSocket connection closed.");
}

struct Session {
    client: IpAddr,
    state: Arc<AppState>,
    socket_tx: SplitSink<WebSocket, Message>,
    socket_rx: SplitStream<WebSocket>,
    backlog: Backlog,
}

/// Frames that arrived while a reply was streaming, in arrival order.
///
/// Holds at most [`MAX_BACKLOG`] frames. Once full, every later frame is
/// discarded until the backlog drains, so rejections stay in arrival order.
#[derive(Debug, Default)]
struct Backlog {
    frames: VecDeque<Message>,
    /// Discarded frames still owed an error envelope.
    overflowed: usize,
}

impl Backlog {
    fn push(&mut self, frame: Message) {
        if self.overflowed > 0 || self.frames.len() >= MAX_BACKLOG {
            self.overflowed += 1;
            warn!(overflowed = self.overflowed, "Backlog full, dropping frame.");
        } else {
            debug!(queued = self.frames.len() + 1, "Frame arrived mid-response, queued.");
            self.frames.push_back(frame);
        }
    }
}

impl Session {
    async fn run(&mut self) -> Result<(), SessionError> {
        loop {
            let frame = match self.backlog.frames.pop_front() {
                Some(frame) => frame,
                None => {
                    for _ in 0..mem::take(&mut self.backlog.overflowed) {
                        send_msg(&mut self.socket_tx, &ServerMessage::error(BACKLOG_FULL_MESSAGE)).await?;
                    }
                    match next_data_frame(&mut self.socket_rx).await {
                        Some(frame) => frame,
                        None => return Ok(()),
                    }
                }
            };
            if !self.handle_frame(frame).await? {
                return Ok(());
            }
        }
    }

    /// Rate check, validation, then generation. Returns `false` once the
    /// client has gone away.
    async fn handle_frame(&mut self, frame: Message) -> Result<bool, SessionError> {
        if !self.state.limiter.admit(&self.client) {
            warn!("Rate limit exceeded.");
            send_msg(&mut self.socket_tx, &ServerMessage::error(RATE_LIMITED_MESSAGE)).await?;
            return Ok(true);
        }

        let raw = payload(&frame).unwrap_or_default();
        let prompt = match validate_prompt_with_limit(raw, self.state.config.max_history_size) {
            Ok(prompt) => prompt,
            Err(e) => {
                warn!(error = %e, "Rejected invalid prompt.");
                send_msg(&mut self.socket_tx, &ServerMessage::error(e.to_string())).await?;
                return Ok(true);
            }
        };
        info!(turns = prompt.content.len(), "Prompt received.");

        let disconnect = watch_for_disconnect(&mut self.socket_rx, &mut self.backlog);
        let outcome = bridge::relay(
            self.state.llm_client.as_deref(),
            &prompt,
            &mut self.socket_tx,
            disconnect,
        )
        .await?;
        debug!(?outcome, "Request finished.");
        Ok(outcome != RequestOutcome::Cancelled)
    }
}

/// Resolves when the client disconnects. Data frames that arrive meanwhile
/// go to the backlog.
async fn watch_for_disconnect<S, E>(socket_rx: &mut S, backlog: &mut Backlog)
where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: std::fmt::Display,
{
    while let Some(frame) = next_data_frame(socket_rx).await {
        backlog.push(frame);
    }
}

/// A helper function to serialize and send a `ServerMessage` to the client.
pub(crate) async fn send_msg<S>(socket_tx: &mut S, msg: &ServerMessage) -> Result<(), SessionError>
where
    S: Sink<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    let serialized = serde_json::to_string(msg)?;
    socket_tx
        .send(Message::Text(serialized.into()))
        .await
        .map_err(|e| SessionError::Transport(Box::new(e)))
}

/// Closes the connection with a policy-violation frame. Failures are ignored,
/// the connection is going away either way.
async fn close_with_policy<S>(socket_tx: &mut S, reason: &'static str)
where
    S: Sink<Message> + Unpin,
{
    let frame = CloseFrame {
        code: close_code::POLICY,
        reason: Utf8Bytes::from_static(reason),
    };
    let _ = socket_tx.send(Message::Close(Some(frame))).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{channel::mpsc, stream};
    use std::io;
    use std::time::Duration;

    fn text(s: &'static str) -> Message {
        Message::Text(s.into())
    }

    #[tokio::test]
    async fn disconnect_watch_resolves_on_close() {
        let items: Vec<Result<Message, io::Error>> = vec![Ok(Message::Close(None))];
        let mut rx = stream::iter(items);
        let mut backlog = Backlog::default();
        watch_for_disconnect(&mut rx, &mut backlog).await;
        assert!(backlog.frames.is_empty());
    }

    #[tokio::test]
    async fn disconnect_watch_resolves_on_end_of_stream() {
        let mut rx = stream::iter(Vec::<Result<Message, io::Error>>::new());
        let mut backlog = Backlog::default();
        watch_for_disconnect(&mut rx, &mut backlog).await;
        assert!(backlog.frames.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn frames_during_streaming_are_queued_not_treated_as_disconnect() {
        let mut rx = stream::iter(vec![Ok::<_, io::Error>(text("next")), Ok(text("after"))])
            .chain(stream::pending());
        let mut backlog = Backlog::default();

        let watched = tokio::time::timeout(
            Duration::from_secs(1),
            watch_for_disconnect(&mut rx, &mut backlog),
        )
        .await;

        assert!(watched.is_err(), "a data frame must not look like a disconnect");
        assert_eq!(backlog.frames, [text("next"), text("after")]);
    }

    #[tokio::test]
    async fn close_after_a_queued_frame_still_counts_as_disconnect() {
        let items: Vec<Result<Message, io::Error>> = vec![
            Ok(text("next")),
            Ok(Message::Ping(Vec::<u8>::new().into())),
            Ok(Message::Close(None)),
        ];
        let mut rx = stream::iter(items).chain(stream::pending());
        let mut backlog = Backlog::default();

        tokio::time::timeout(Duration::from_secs(1), watch_for_disconnect(&mut rx, &mut backlog))
            .await
            .expect("close after a queued frame was missed");
        assert_eq!(backlog.frames, [text("next")]);
    }

    #[test]
    fn full_backlog_drops_every_later_frame_until_drained() {
        let mut backlog = Backlog::default();
        for _ in 0..MAX_BACKLOG {
            backlog.push(text("kept"));
        }
        backlog.push(text("dropped"));
        assert_eq!(backlog.frames.len(), MAX_BACKLOG);
        assert_eq!(backlog.overflowed, 1);

        // A freed slot is not reused while rejections are owed.
        backlog.frames.pop_front();
        backlog.push(text("also dropped"));
        assert_eq!(backlog.frames.len(), MAX_BACKLOG - 1);
        assert_eq!(backlog.overflowed, 2);
        assert!(backlog.frames.iter().all(|f| *f == text("kept")));
    }

    #[tokio::test]
    async fn send_msg_writes_one_text_frame() {
        let (mut tx, mut rx) = mpsc::unbounded::<Message>();
        send_msg(&mut tx, &ServerMessage::stream("Hel")).await.unwrap();
        drop(tx);
        let frame = rx.next().await.unwrap();
        assert_eq!(frame, Message::Text(r#"{"type":"stream","content":"Hel"}"#.into()));
        assert!(rx.next().await.is_none());
    }

    #[tokio::test]
    async fn policy_close_carries_code_and_reason() {
        let (mut tx, mut rx) = mpsc::unbounded::<Message>();
        close_with_policy(&mut tx, "Authentication failed").await;
        match rx.next().await {
            Some(Message::Close(Some(frame))) => {
                assert_eq!(frame.code, 1008);
                assert_eq!(frame.reason.as_str(), "Authentication failed");
            }
            other => panic!("expected close frame, got {other:?}"),
        }
    }
}
