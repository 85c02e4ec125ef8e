//! A client session with the relay server.
//!
//! The client owns the conversation. Every prompt resends the whole history,
//! and a reply's streamed text is appended as a `model` turn once it ends.

use futures_util::{SinkExt, StreamExt};
use relay_core::protocol::{
    AuthMessage, ClientMessage, ConversationHistory, ConversationTurn, ServerMessage,
};
use rustls::{ClientConfig, RootCertStore};
use serde_json::{Map, Value};
use std::{fs::File, io::BufReader, path::Path, path::PathBuf, sync::Arc};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    Connector, MaybeTlsStream, WebSocketStream, connect_async_tls_with_config,
    tungstenite::{self, Message},
};
use tracing::{debug, info};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const SECURE_URL: &str = "wss://localhost:8080";
pub const PLAIN_URL: &str = "ws://localhost:8080";

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("could not connect to {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: tungstenite::Error,
    },
    #[error("connection closed by the server{}", .0.as_deref().map(|r| format!(": {r}")).unwrap_or_default())]
    ConnectionClosed(Option<String>),
    #[error("websocket transport failed: {0}")]
    Transport(#[source] tungstenite::Error),
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to load trusted certificate {path:?}: {message}")]
    Tls { path: PathBuf, message: String },
}

impl From<tungstenite::Error> for ClientError {
    fn from(e: tungstenite::Error) -> Self {
        match e {
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                ClientError::ConnectionClosed(None)
            }
            other => ClientError::Transport(other),
        }
    }
}

/// How the server ended a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// The full streamed text, ended by the finished marker.
    Completed(String),
    /// The server sent an error envelope.
    Rejected(String),
}

/// The URL to use when none is given: `wss` when a certificate is available.
pub fn default_url(cert_present: bool) -> &'static str {
    if cert_present { SECURE_URL } else { PLAIN_URL }
}

/// A TLS connector that trusts exactly the certificates in `cert_path`.
///
/// Meant for a self-signed server certificate.
pub fn rustls_connector(cert_path: &Path) -> Result<Connector, ClientError> {
    let tls_error = |message: String| ClientError::Tls {
        path: cert_path.to_path_buf(),
        message,
    };
    let file = File::open(cert_path).map_err(|e| tls_error(e.to_string()))?;
    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut BufReader::new(file)) {
        let cert = cert.map_err(|e| tls_error(e.to_string()))?;
        roots.add(cert).map_err(|e| tls_error(e.to_string()))?;
    }
    if roots.is_empty() {
        return Err(tls_error("no certificates found".to_string()));
    }

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| tls_error(e.to_string()))?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Connector::Rustls(Arc::new(config)))
}

pub struct RelayClient {
    ws: WsStream,
    history: ConversationHistory,
}

impl RelayClient {
    /// Opens the connection and sends the credential frame.
    ///
    /// A rejected token is only noticed on the first exchange, when the server
    /// closes the connection.
    pub async fn connect(
        url: &str,
        token: Option<&str>,
        connector: Option<Connector>,
    ) -> Result<Self, ClientError> {
        let (mut ws, _) = connect_async_tls_with_config(url, None, false, connector)
            .await
            .map_err(|source| ClientError::Connect {
                url: url.to_string(),
                source,
            })?;
        info!(%url, "Connected to relay server.");

        let auth = AuthMessage {
            token: token.map(str::to_string),
        };
        ws.send(Message::Text(serde_json::to_string(&auth)?.into()))
            .await?;
        Ok(Self {
            ws,
            history: ConversationHistory::new(),
        })
    }

    pub fn history(&self) -> &[ConversationTurn] {
        &self.history
    }

    /// Appends `text` as a user turn, sends the whole conversation and waits
    /// for the reply, handing each fragment to `on_fragment` as it arrives.
    ///
    /// Streamed text is kept as a `model` turn even when the reply ends in an
    /// error. The user turn always stays in the history.
    pub async fn send_prompt<F>(
        &mut self,
        text: &str,
        metadata: Map<String, Value>,
        mut on_fragment: F,
    ) -> Result<Reply, ClientError>
    where
        F: FnMut(&str),
    {
        self.history.push(ConversationTurn::user(text));
        let prompt = ClientMessage::Prompt {
            content: self.history.clone(),
            metadata,
        };
        self.ws
            .send(Message::Text(serde_json::to_string(&prompt)?.into()))
            .await?;

        let mut streamed = String::new();
        let reply = loop {
            let text = match self.ws.next().await {
                None => break Err(ClientError::ConnectionClosed(None)),
                Some(Err(e)) => break Err(e.into()),
                Some(Ok(Message::Text(text))) => text,
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame
                        .map(|f| f.reason.as_str().to_string())
                        .filter(|r| !r.is_empty());
                    break Err(ClientError::ConnectionClosed(reason));
                }
                Some(Ok(_)) => continue,
            };
            match serde_json::from_str::<ServerMessage>(text.as_str()) {
                Ok(ServerMessage::Stream { content }) => {
                    on_fragment(&content);
                    streamed.push_str(&content);
                }
                Ok(ServerMessage::Response { .. }) => break Ok(Reply::Completed(streamed.clone())),
                Ok(ServerMessage::Error { message }) => break Ok(Reply::Rejected(message)),
                Err(e) => debug!(error = %e, raw = %text.as_str(), "Ignoring unrecognised envelope."),
            }
        };

        if !streamed.is_empty() {
            self.history.push(ConversationTurn::model(streamed));
        }
        reply
    }

    pub async fn close(mut self) -> Result<(), ClientError> {
        match self.ws.close(None).await {
            Ok(()) => Ok(()),
            Err(e) => match ClientError::from(e) {
                ClientError::ConnectionClosed(_) => Ok(()),
                other => Err(other),
            },
        }
    }
}
