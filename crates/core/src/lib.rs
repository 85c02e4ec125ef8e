pub mod limits;
pub mod llm_client;
pub mod protocol;
pub mod rate_limit;
pub mod validate;

/// Outcome of a single prompt once the relay has finished with it.
///
/// These are the terminal states of the per-request state machine that the
/// generation bridge owns. Rejections that happen before the bridge runs
/// (rate limiting, validation) are reported directly by the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// No backend is configured; an error envelope was sent.
    Unavailable,
    /// The conversation was empty; nothing was sent.
    Ignored,
    /// Every fragment was forwarded and the terminal response was sent.
    Completed { fragments: usize },
    /// The backend failed; a generic error envelope was sent.
    Failed,
    /// The client went away before the stream finished.
    Cancelled,
}
