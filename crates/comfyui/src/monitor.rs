//! Job monitoring by racing the event stream against history polling.
//!
//! Two tasks write into one channel: a stream listener filtering the
//! session's broadcast by prompt id, and a poller hitting `/history` on a
//! fixed interval regardless of stream health. The first terminal signal
//! wins; both tasks are cancelled when [`watch`] returns or is dropped.

use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::api::ComfyUIApi;
use crate::events::{StreamEvent, StreamEventKind};
use crate::history::{parse_history, ArtifactRef, HistoryStatus};

const SIGNAL_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalSource {
    Stream,
    Poll,
}

/// Non-terminal observations forwarded while the job runs.
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorUpdate {
    Running,
    Progress { value: u32, max: u32 },
}

/// Terminal state as first reported by either source.
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorOutcome {
    Succeeded {
        outputs: Vec<ArtifactRef>,
        /// True when `outputs` came from history rather than stream events.
        confirmed: bool,
        source: SignalSource,
    },
    Failed {
        message: String,
        source: SignalSource,
    },
}

enum Signal {
    Update(MonitorUpdate),
    Terminal(MonitorOutcome),
}

/// Wait for `prompt_id` to reach a terminal state.
///
/// `stream` must be subscribed before the prompt is submitted so that no
/// event is missed. This function has no deadline of its own; callers
/// bound it with a timeout, and dropping it stops both listeners.
pub async fn watch<F>(
    api: &ComfyUIApi,
    stream: broadcast::Receiver<StreamEvent>,
    prompt_id: &str,
    poll_interval: Duration,
    mut on_update: F,
) -> MonitorOutcome
where
    F: FnMut(MonitorUpdate),
{
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();
    let (tx, mut rx) = mpsc::channel(SIGNAL_CHANNEL_CAPACITY);

    tokio::spawn(listen_stream(
        stream,
        prompt_id.to_string(),
        tx.clone(),
        cancel.clone(),
    ));
    tokio::spawn(poll_history(
        api.clone(),
        prompt_id.to_string(),
        poll_interval,
        tx,
        cancel.clone(),
    ));

    while let Some(signal) = rx.recv().await {
        match signal {
            Signal::Update(update) => on_update(update),
            Signal::Terminal(outcome) => {
                tracing::debug!(prompt_id, ?outcome, "Monitor reached terminal state");
                return outcome;
            }
        }
    }

    MonitorOutcome::Failed {
        message: "Job monitoring stopped without a terminal state".to_string(),
        source: SignalSource::Poll,
    }
}

async fn listen_stream(
    mut stream: broadcast::Receiver<StreamEvent>,
    prompt_id: String,
    tx: mpsc::Sender<Signal>,
    cancel: CancellationToken,
) {
    let mut streamed_outputs = Vec::new();

    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => return,
            received = stream.recv() => received,
        };

        let event = match received {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(prompt_id = %prompt_id, skipped, "Stream listener lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };

        if event.prompt_id.is_none() && event.kind == StreamEventKind::Disconnected {
            tracing::warn!(prompt_id = %prompt_id, "Event stream dropped, continuing with polling only");
            return;
        }
        if event.prompt_id.as_deref() != Some(prompt_id.as_str()) {
            continue;
        }

        let signal = match event.kind {
            StreamEventKind::Started
            | StreamEventKind::Cached { .. }
            | StreamEventKind::NodeExecuting { .. } => Signal::Update(MonitorUpdate::Running),
            StreamEventKind::Progress { value, max } => {
                Signal::Update(MonitorUpdate::Progress { value, max })
            }
            StreamEventKind::Output { images, .. } => {
                streamed_outputs.extend(images);
                continue;
            }
            StreamEventKind::Completed => Signal::Terminal(MonitorOutcome::Succeeded {
                outputs: std::mem::take(&mut streamed_outputs),
                confirmed: false,
                source: SignalSource::Stream,
            }),
            StreamEventKind::Failed { message } => Signal::Terminal(MonitorOutcome::Failed {
                message,
                source: SignalSource::Stream,
            }),
            StreamEventKind::Interrupted => Signal::Terminal(MonitorOutcome::Failed {
                message: "Execution was interrupted".to_string(),
                source: SignalSource::Stream,
            }),
            StreamEventKind::Connected | StreamEventKind::Disconnected => continue,
        };

        let terminal = matches!(signal, Signal::Terminal(_));
        if tx.send(signal).await.is_err() || terminal {
            return;
        }
    }
}

async fn poll_history(
    api: ComfyUIApi,
    prompt_id: String,
    interval: Duration,
    tx: mpsc::Sender<Signal>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let result = tokio::select! {
            _ = cancel.cancelled() => return,
            result = api.get_history(&prompt_id) => result,
        };

        let payload = match result {
            Ok(payload) => payload,
            Err(e) if e.is_not_found() => {
                tracing::debug!(prompt_id = %prompt_id, "History not available yet");
                continue;
            }
            Err(e) => {
                tracing::debug!(prompt_id = %prompt_id, error = %e, "History poll failed, will retry");
                continue;
            }
        };

        let outcome = match parse_history(&prompt_id, &payload) {
            HistoryStatus::Pending => {
                tracing::debug!(prompt_id = %prompt_id, "Poll tick: still pending");
                continue;
            }
            HistoryStatus::Succeeded { outputs } => MonitorOutcome::Succeeded {
                outputs,
                confirmed: true,
                source: SignalSource::Poll,
            },
            HistoryStatus::Failed { message } => MonitorOutcome::Failed {
                message,
                source: SignalSource::Poll,
            },
        };
        let _ = tx.send(Signal::Terminal(outcome)).await;
        return;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// An API pointed at a closed port: every poll fails and is retried.
    fn dead_api() -> ComfyUIApi {
        ComfyUIApi::new("http://127.0.0.1:1")
    }

    #[tokio::test]
    async fn stream_completion_wins_when_polling_fails() {
        let (tx, rx) = broadcast::channel(16);
        let handle = tokio::spawn(async move {
            let mut updates = Vec::new();
            let outcome = watch(&dead_api(), rx, "p1", Duration::from_millis(20), |u| {
                updates.push(u)
            })
            .await;
            (outcome, updates)
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        let image = ArtifactRef {
            filename: "a.png".into(),
            subfolder: String::new(),
            storage_class: "output".into(),
        };
        tx.send(StreamEvent::for_prompt("other", StreamEventKind::Completed)).unwrap();
        tx.send(StreamEvent::for_prompt("p1", StreamEventKind::Started)).unwrap();
        tx.send(StreamEvent::for_prompt("p1", StreamEventKind::Progress { value: 1, max: 4 })).unwrap();
        tx.send(StreamEvent::for_prompt(
            "p1",
            StreamEventKind::Output { node: "9".into(), images: vec![image.clone()] },
        ))
        .unwrap();
        tx.send(StreamEvent::for_prompt("p1", StreamEventKind::Completed)).unwrap();

        let (outcome, updates) = handle.await.unwrap();
        assert_eq!(
            outcome,
            MonitorOutcome::Succeeded {
                outputs: vec![image],
                confirmed: false,
                source: SignalSource::Stream,
            }
        );
        assert_eq!(
            updates,
            [MonitorUpdate::Running, MonitorUpdate::Progress { value: 1, max: 4 }]
        );
    }

    #[tokio::test]
    async fn stream_failure_is_reported() {
        let (tx, rx) = broadcast::channel(16);
        let handle = tokio::spawn(async move {
            watch(&dead_api(), rx, "p1", Duration::from_millis(20), |_| {}).await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        tx.send(StreamEvent::for_prompt(
            "p1",
            StreamEventKind::Failed { message: "boom".into() },
        ))
        .unwrap();
        assert_eq!(
            handle.await.unwrap(),
            MonitorOutcome::Failed { message: "boom".into(), source: SignalSource::Stream }
        );
    }

    #[tokio::test]
    async fn watch_can_be_abandoned_by_timeout() {
        let (_tx, rx) = broadcast::channel::<StreamEvent>(16);
        let api = dead_api();
        let result = tokio::time::timeout(
            Duration::from_millis(50),
            watch(&api, rx, "p1", Duration::from_millis(10), |_| {}),
        )
        .await;
        assert!(result.is_err());
    }
}
