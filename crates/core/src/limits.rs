//! Fixed protocol limits shared by the server and the client.

use std::time::Duration;

/// How long a freshly accepted connection may take to send its auth frame.
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum prompts a single client may send inside one rate-limit window.
pub const RATE_LIMIT_REQUESTS: usize = 10;

/// Length of the sliding rate-limit window.
pub const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);

/// Maximum serialized length, in characters, of a prompt's `content`.
pub const MAX_HISTORY_SIZE: usize = 100_000;

/// Largest WebSocket message accepted: the history ceiling plus room for the
/// surrounding envelope.
pub const MAX_FRAME_SIZE: usize = MAX_HISTORY_SIZE + 1024;
