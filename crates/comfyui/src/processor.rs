//! WebSocket message processing loop.
//!
//! Reads frames from the session's connection, interprets them as
//! [`StreamEvent`]s and publishes them on the session's broadcast channel.

use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::client::WsStream;
use crate::events::{StreamEvent, StreamEventKind};
use crate::history::ArtifactRef;
use crate::messages::{parse_message, ComfyUIMessage};

/// Pump messages until the socket closes, errors, or `cancel` fires.
///
/// Binary frames (preview images) are ignored.
pub async fn process_messages(
    ws_stream: &mut WsStream,
    client_id: &str,
    event_tx: &broadcast::Sender<StreamEvent>,
    cancel: &CancellationToken,
) {
    loop {
        let msg_result = tokio::select! {
            _ = cancel.cancelled() => break,
            next = ws_stream.next() => match next {
                Some(result) => result,
                None => break,
            },
        };

        match msg_result {
            Ok(Message::Text(text)) => handle_text_message(&text, client_id, event_tx),
            Ok(Message::Binary(_)) => {
                tracing::trace!(client_id, "Ignoring binary message (preview image)");
            }
            Ok(Message::Ping(_) | Message::Pong(_)) => {}
            Ok(Message::Close(frame)) => {
                tracing::info!(client_id, ?frame, "ComfyUI WebSocket closed");
                break;
            }
            Ok(Message::Frame(_)) => {}
            Err(e) => {
                tracing::warn!(client_id, error = %e, "WebSocket receive error");
                break;
            }
        }
    }
}

fn handle_text_message(text: &str, client_id: &str, event_tx: &broadcast::Sender<StreamEvent>) {
    match parse_message(text) {
        Ok(msg) => {
            if let Some(event) = interpret(msg) {
                if event.kind.is_terminal() {
                    tracing::debug!(client_id, prompt_id = ?event.prompt_id, kind = ?event.kind, "Terminal stream event");
                }
                // No receivers is normal between jobs.
                let _ = event_tx.send(event);
            }
        }
        Err(e) => {
            tracing::debug!(client_id, error = %e, raw_message = %text, "Unhandled ComfyUI message");
        }
    }
}

/// Map a wire message onto a stream event. Queue status is not forwarded.
pub fn interpret(msg: ComfyUIMessage) -> Option<StreamEvent> {
    let event = match msg {
        ComfyUIMessage::Status(data) => {
            tracing::debug!(queue_remaining = data.status.exec_info.queue_remaining, "ComfyUI queue status");
            return None;
        }
        ComfyUIMessage::ExecutionStart(data) => {
            StreamEvent::for_prompt(data.prompt_id, StreamEventKind::Started)
        }
        ComfyUIMessage::ExecutionCached(data) => StreamEvent::for_prompt(
            data.prompt_id,
            StreamEventKind::Cached { nodes: data.nodes },
        ),
        ComfyUIMessage::Executing(data) => {
            let kind = match data.node {
                Some(node) => StreamEventKind::NodeExecuting { node },
                None => StreamEventKind::Completed,
            };
            // An idle notification without a prompt id finishes nothing.
            let prompt_id = data.prompt_id?;
            StreamEvent::for_prompt(prompt_id, kind)
        }
        ComfyUIMessage::Progress(data) => StreamEvent {
            prompt_id: data.prompt_id,
            kind: StreamEventKind::Progress {
                value: data.value,
                max: data.max,
            },
        },
        ComfyUIMessage::Executed(data) => {
            let images = data
                .output
                .get("images")
                .and_then(|v| v.as_array())
                .into_iter()
                .flatten()
                .filter_map(|img| serde_json::from_value::<ArtifactRef>(img.clone()).ok())
                .collect();
            StreamEvent::for_prompt(
                data.prompt_id,
                StreamEventKind::Output {
                    node: data.node,
                    images,
                },
            )
        }
        ComfyUIMessage::ExecutionSuccess(data) => {
            StreamEvent::for_prompt(data.prompt_id, StreamEventKind::Completed)
        }
        ComfyUIMessage::ExecutionError(data) => {
            tracing::warn!(
                prompt_id = %data.prompt_id,
                node_id = ?data.node_id,
                error_type = %data.exception_type,
                error_message = %data.exception_message,
                "Execution error reported on stream",
            );
            StreamEvent::for_prompt(
                data.prompt_id,
                StreamEventKind::Failed {
                    message: data.exception_message,
                },
            )
        }
        ComfyUIMessage::ExecutionInterrupted(data) => {
            StreamEvent::for_prompt(data.prompt_id, StreamEventKind::Interrupted)
        }
    };
    Some(event)
}
