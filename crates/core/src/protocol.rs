//! Defines the WebSocket message protocol between the chat client and the relay server.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Content of the terminal `response` envelope that closes a successful reply.
pub const FINISHED_MARKER: &str = "[FINISHED]";

/// The author of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Model => write!(f, "model"),
        }
    }
}

/// A single piece of a turn's content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Part {
    pub text: String,
}

/// One turn of a conversation, in the shape the Gemini API uses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub parts: Vec<Part>,
}

impl ConversationTurn {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            parts: vec![Part { text: text.into() }],
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text)
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self::new(Role::Model, text)
    }

    /// Concatenates the text of every part.
    pub fn text(&self) -> String {
        self.parts.iter().map(|p| p.text.as_str()).collect()
    }
}

/// The full conversation. Owned by the client and resent with every prompt.
pub type ConversationHistory = Vec<ConversationTurn>;

/// The first frame a client sends after connecting.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// Messages sent from the client to the server after authentication.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Asks the model to continue the given conversation.
    Prompt {
        content: ConversationHistory,
        /// Backend options, forwarded untouched.
        #[serde(default)]
        metadata: Map<String, Value>,
    },
}

/// Messages sent from the server to the client.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// A chunk of a streamed text response.
    Stream { content: String },
    /// Signals the end of a streamed response. `content` is always [`FINISHED_MARKER`].
    Response { content: String },
    /// Ends the current request's reply sequence with a failure.
    Error { message: String },
}

impl ServerMessage {
    pub fn stream(content: impl Into<String>) -> Self {
        ServerMessage::Stream {
            content: content.into(),
        }
    }

    pub fn finished() -> Self {
        ServerMessage::Response {
            content: FINISHED_MARKER.to_string(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }
}
