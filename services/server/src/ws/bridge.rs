//! Streams one validated conversation through the backend to the client.

use super::{INTERNAL_ERROR_MESSAGE, UNAVAILABLE_MESSAGE, session::SessionError, session::send_msg};
use axum::extract::ws::Message;
use futures_util::{Sink, StreamExt};
use relay_core::{RequestOutcome, llm_client::LLMClient, protocol::ServerMessage, validate::ValidatedPrompt};
use std::future::Future;
use tracing::{debug, error, info, warn};

/// Runs a single request to completion and reports how it ended.
///
/// Every outcome except `Ignored` and `Cancelled` leaves exactly one terminal
/// envelope on the wire. `disconnect` resolves when the client goes away; the
/// backend stream is dropped at that point and nothing more is sent.
///
/// An `Err` means the socket itself failed while sending.
pub async fn relay<S, D>(
    llm_client: Option<&dyn LLMClient>,
    prompt: &ValidatedPrompt,
    socket_tx: &mut S,
    disconnect: D,
) -> Result<RequestOutcome, SessionError>
where
    S: Sink<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
    D: Future<Output = ()>,
{
    let Some(llm_client) = llm_client else {
        warn!("Prompt received but no backend is configured.");
        send_msg(socket_tx, &ServerMessage::error(UNAVAILABLE_MESSAGE)).await?;
        return Ok(RequestOutcome::Unavailable);
    };

    if prompt.content.is_empty() {
        debug!("Empty conversation, nothing to generate.");
        return Ok(RequestOutcome::Ignored);
    }

    tokio::pin!(disconnect);

    let started = tokio::select! {
        result = llm_client.stream_generate(&prompt.content, &prompt.metadata) => result,
        _ = &mut disconnect => {
            info!("Client disconnected before the backend responded.");
            return Ok(RequestOutcome::Cancelled);
        }
    };
    let mut stream = match started {
        Ok(stream) => stream,
        Err(e) => {
            error!(error = ?e, "Backend request failed.");
            send_msg(socket_tx, &ServerMessage::error(INTERNAL_ERROR_MESSAGE)).await?;
            return Ok(RequestOutcome::Failed);
        }
    };

    let mut fragments = 0;
    loop {
        tokio::select! {
            item = stream.next() => match item {
                Some(Ok(text)) if text.is_empty() => continue,
                Some(Ok(text)) => {
                    send_msg(socket_tx, &ServerMessage::stream(text)).await?;
                    fragments += 1;
                }
                Some(Err(e)) => {
                    error!(error = ?e, fragments, "Backend stream failed mid-response.");
                    send_msg(socket_tx, &ServerMessage::error(INTERNAL_ERROR_MESSAGE)).await?;
                    return Ok(RequestOutcome::Failed);
                }
                None => break,
            },
            _ = &mut disconnect => {
                info!(fragments, "Client disconnected mid-stream, abandoning backend request.");
                return Ok(RequestOutcome::Cancelled);
            }
        }
    }

    send_msg(socket_tx, &ServerMessage::finished()).await?;
    debug!(fragments, "Response complete.");
    Ok(RequestOutcome::Completed { fragments })
}
