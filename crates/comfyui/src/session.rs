//! Persistent event-stream session for one renderer.
//!
//! [`StreamSession`] owns the WebSocket for a single client id. A background
//! task connects, pumps messages into a [`broadcast`] channel and reconnects
//! with backoff when the socket drops. Job monitors subscribe to the channel
//! and filter by prompt id.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;

use crate::client::ComfyUIClient;
use crate::events::{StreamEvent, StreamEventKind};
use crate::processor::process_messages;
use crate::reconnect::{reconnect_loop, ReconnectConfig};

/// Broadcast channel capacity for stream events.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// How long [`StreamSession::shutdown`] waits for the task to exit.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub struct StreamSession {
    client: ComfyUIClient,
    event_tx: broadcast::Sender<StreamEvent>,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
    task_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl StreamSession {
    /// Spawn the connection task. `cancel` is the engine-wide token; the
    /// session runs under a child of it.
    pub fn start(
        client: ComfyUIClient,
        reconnect: ReconnectConfig,
        cancel: &CancellationToken,
    ) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let session_cancel = cancel.child_token();
        let connected = Arc::new(AtomicBool::new(false));

        let task_client = client.clone();
        let task_tx = event_tx.clone();
        let task_connected = Arc::clone(&connected);
        let task_cancel = session_cancel.clone();
        let task_handle = tokio::spawn(async move {
            tracing::info!(client_id = %task_client.client_id(), "Starting event stream task");
            run_connection_loop(&task_client, &reconnect, &task_tx, &task_connected, &task_cancel)
                .await;
            tracing::info!(client_id = %task_client.client_id(), "Event stream task exited");
        });

        Arc::new(Self {
            client,
            event_tx,
            connected,
            cancel: session_cancel,
            task_handle: Mutex::new(Some(task_handle)),
        })
    }

    pub fn client_id(&self) -> &str {
        self.client.client_id()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.event_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Cancel the connection task and wait briefly for it to exit.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.task_handle.lock().await.take() {
            if tokio::time::timeout(SHUTDOWN_GRACE, handle).await.is_err() {
                tracing::warn!(client_id = %self.client_id(), "Event stream task did not exit in time");
            }
        }
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Connect, pump messages, reconnect. Runs until `cancel` fires.
async fn run_connection_loop(
    client: &ComfyUIClient,
    reconnect: &ReconnectConfig,
    event_tx: &broadcast::Sender<StreamEvent>,
    connected: &AtomicBool,
    cancel: &CancellationToken,
) {
    let mut pending = tokio::select! {
        _ = cancel.cancelled() => return,
        result = client.connect() => match result {
            Ok(conn) => Some(conn),
            Err(e) => {
                tracing::warn!(
                    client_id = %client.client_id(),
                    error = %e,
                    "Event stream unavailable, entering reconnect loop",
                );
                None
            }
        },
    };

    loop {
        let conn = match pending.take() {
            Some(conn) => conn,
            None => match reconnect_loop(client, reconnect, cancel).await {
                Some(conn) => conn,
                None => return,
            },
        };

        connected.store(true, Ordering::Release);
        let _ = event_tx.send(StreamEvent::session(StreamEventKind::Connected));

        let mut ws_stream = conn.ws_stream;
        process_messages(&mut ws_stream, &conn.client_id, event_tx, cancel).await;

        connected.store(false, Ordering::Release);
        let _ = event_tx.send(StreamEvent::session(StreamEventKind::Disconnected));

        if cancel.is_cancelled() {
            return;
        }
        tracing::warn!(client_id = %client.client_id(), "Event stream lost, reconnecting");
    }
}
