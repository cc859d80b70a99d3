//! Execution client: runs one graph instance on the renderer end to end.
//!
//! Job lifecycle: `Built → Queued → Running → (Succeeded | Failed | TimedOut)`.
//! Auxiliary images are uploaded while `Built`; the graph is submitted
//! under the session's client id; completion is detected by
//! [`monitor::watch`]; declared outputs are downloaded and validated. The
//! whole job runs under a single deadline.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use genroute_core::mutation::{GraphInstance, Slot};
use genroute_core::request::SourceImage;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::api::ComfyUIApi;
use crate::events::{JobEvent, JobState, JobUpdate};
use crate::history::{parse_history, ArtifactRef, HistoryStatus};
use crate::monitor::{self, MonitorOutcome, MonitorUpdate};
use crate::session::StreamSession;

const JOB_EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub poll_interval: Duration,
    pub job_timeout: Duration,
    /// Where URL and inline inputs are written before upload.
    pub staging_dir: PathBuf,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            job_timeout: Duration::from_secs(300),
            staging_dir: std::env::temp_dir().join("genroute-staging"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("Failed to upload input image: {0}")]
    Upload(String),

    #[error("Failed to submit graph: {message}")]
    Submission { message: String, transient: bool },

    #[error("Failed to retrieve artifact: {0}")]
    Retrieval(String),

    #[error("Renderer reported failure: {0}")]
    Failed(String),

    #[error("Job {} timed out after {}s", job_id.as_deref().unwrap_or("<unsubmitted>"), after.as_secs())]
    TimedOut {
        job_id: Option<String>,
        after: Duration,
    },
}

/// A retrieved output file.
#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    pub reference: ArtifactRef,
    pub bytes: Vec<u8>,
}

impl Artifact {
    /// MIME type guessed from the file extension.
    pub fn content_type(&self) -> &'static str {
        let name = self.reference.filename.to_ascii_lowercase();
        if name.ends_with(".jpg") || name.ends_with(".jpeg") {
            "image/jpeg"
        } else if name.ends_with(".webp") {
            "image/webp"
        } else {
            "image/png"
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompletedJob {
    pub job_id: String,
    pub template: String,
    pub seed: u64,
    pub artifacts: Vec<Artifact>,
}

pub struct ExecutionClient {
    api: ComfyUIApi,
    session: Arc<StreamSession>,
    http: reqwest::Client,
    config: ExecutorConfig,
    job_tx: broadcast::Sender<JobEvent>,
}

impl ExecutionClient {
    pub fn new(api: ComfyUIApi, session: Arc<StreamSession>, config: ExecutorConfig) -> Self {
        let (job_tx, _) = broadcast::channel(JOB_EVENT_CHANNEL_CAPACITY);
        Self {
            api,
            session,
            http: reqwest::Client::new(),
            config,
            job_tx,
        }
    }

    pub fn api(&self) -> &ComfyUIApi {
        &self.api
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Lifecycle notifications for every job run through this client.
    pub fn subscribe_jobs(&self) -> broadcast::Receiver<JobEvent> {
        self.job_tx.subscribe()
    }

    /// Run one job. Each call submits a fresh prompt; nothing is retried.
    pub async fn run(
        &self,
        instance: GraphInstance,
        uploads: &[(Slot, SourceImage)],
    ) -> Result<CompletedJob, ExecutionError> {
        let ticket = Uuid::new_v4();
        let deadline = self.config.job_timeout;
        self.emit_state(ticket, None, JobState::Built);

        let mut job_id = None;
        let outcome =
            tokio::time::timeout(deadline, self.drive(ticket, instance, uploads, &mut job_id)).await;

        match outcome {
            Ok(Ok(done)) => {
                self.emit_state(ticket, job_id, JobState::Succeeded);
                tracing::info!(
                    job_id = %done.job_id,
                    artifacts = done.artifacts.len(),
                    "Job succeeded",
                );
                Ok(done)
            }
            Ok(Err(e)) => {
                tracing::warn!(job_id = ?job_id, error = %e, "Job failed");
                self.emit_state(ticket, job_id, JobState::Failed);
                Err(e)
            }
            Err(_) => {
                tracing::warn!(job_id = ?job_id, timeout_secs = deadline.as_secs(), "Job timed out");
                if let Some(id) = job_id.clone() {
                    // Best effort; nobody waits for it.
                    let api = self.api.clone();
                    tokio::spawn(async move {
                        if let Err(e) = api.cancel_execution(&id).await {
                            tracing::debug!(job_id = %id, error = %e, "Queue delete after timeout failed");
                        }
                    });
                }
                self.emit_state(ticket, job_id.clone(), JobState::TimedOut);
                Err(ExecutionError::TimedOut {
                    job_id,
                    after: deadline,
                })
            }
        }
    }

    async fn drive(
        &self,
        ticket: Uuid,
        mut instance: GraphInstance,
        uploads: &[(Slot, SourceImage)],
        job_id: &mut Option<String>,
    ) -> Result<CompletedJob, ExecutionError> {
        for (slot, source) in uploads {
            let stored = self.upload(ticket, *slot, source).await?;
            instance
                .bind_upload(*slot, &stored)
                .map_err(|e| ExecutionError::Upload(e.to_string()))?;
        }
        if instance.has_unbound_uploads() {
            return Err(ExecutionError::Upload(format!(
                "Template '{}' expects an input image that was not supplied",
                instance.template_name()
            )));
        }

        // Subscribe before submitting so no event for this prompt is missed.
        let stream = self.session.subscribe();
        let submitted = self
            .api
            .submit_prompt(&instance.to_json(), self.session.client_id())
            .await
            .map_err(|e| ExecutionError::Submission {
                transient: e.is_transient(),
                message: e.to_string(),
            })?;
        let prompt_id = submitted.prompt_id;
        *job_id = Some(prompt_id.clone());
        tracing::info!(
            job_id = %prompt_id,
            template = %instance.template_name(),
            queue_position = submitted.number,
            "Job submitted",
        );
        self.emit_state(ticket, job_id.clone(), JobState::Queued);

        let mut running = false;
        let outcome = monitor::watch(
            &self.api,
            stream,
            &prompt_id,
            self.config.poll_interval,
            |update| match update {
                MonitorUpdate::Running => {
                    if !running {
                        running = true;
                        self.emit_state(ticket, Some(prompt_id.clone()), JobState::Running);
                    }
                }
                MonitorUpdate::Progress { value, max } => {
                    tracing::debug!(job_id = %prompt_id, value, max, "Job progress");
                    self.emit(ticket, Some(prompt_id.clone()), JobUpdate::Progress { value, max });
                }
            },
        )
        .await;

        let outputs = match outcome {
            MonitorOutcome::Failed { message, source } => {
                tracing::warn!(job_id = %prompt_id, ?source, error = %message, "Renderer reported failure");
                return Err(ExecutionError::Failed(message));
            }
            MonitorOutcome::Succeeded {
                outputs,
                confirmed,
                source,
            } => {
                tracing::debug!(job_id = %prompt_id, ?source, "Job completed");
                if confirmed {
                    outputs
                } else {
                    self.confirm_outputs(&prompt_id, outputs).await
                }
            }
        };

        if outputs.is_empty() {
            return Err(ExecutionError::Retrieval(
                "Renderer reported success but declared no image outputs".to_string(),
            ));
        }

        let mut artifacts = Vec::with_capacity(outputs.len());
        for reference in outputs {
            let bytes = self
                .api
                .view(&reference)
                .await
                .map_err(|e| ExecutionError::Retrieval(format!("{}: {e}", reference.filename)))?;
            if bytes.is_empty() {
                return Err(ExecutionError::Retrieval(format!(
                    "{}: empty payload",
                    reference.filename
                )));
            }
            artifacts.push(Artifact { reference, bytes });
        }

        Ok(CompletedJob {
            job_id: prompt_id,
            template: instance.template_name().to_string(),
            seed: instance.seed(),
            artifacts,
        })
    }

    /// Prefer the history listing over outputs seen on the stream.
    async fn confirm_outputs(&self, prompt_id: &str, streamed: Vec<ArtifactRef>) -> Vec<ArtifactRef> {
        match self.api.get_history(prompt_id).await {
            Ok(payload) => match parse_history(prompt_id, &payload) {
                HistoryStatus::Succeeded { outputs } if !outputs.is_empty() => outputs,
                _ => streamed,
            },
            Err(e) => {
                tracing::debug!(job_id = %prompt_id, error = %e, "History lookup after stream completion failed");
                streamed
            }
        }
    }

    /// Fetch, stage and upload one input image. Returns the name to bind.
    async fn upload(
        &self,
        ticket: Uuid,
        slot: Slot,
        source: &SourceImage,
    ) -> Result<String, ExecutionError> {
        let upload_err = |e: &dyn std::fmt::Display| ExecutionError::Upload(format!("{slot}: {e}"));

        let file_name = format!("upload_{}_{}", ticket.simple(), source.file_name_hint());
        let (bytes, _staged) = match source {
            SourceImage::Path { path } => {
                let bytes = tokio::fs::read(path).await.map_err(|e| upload_err(&e))?;
                (bytes, None)
            }
            SourceImage::Inline { bytes, .. } => {
                let staged = StagedFile::write(&self.config.staging_dir, &file_name, bytes)
                    .await
                    .map_err(|e| upload_err(&e))?;
                (bytes.clone(), Some(staged))
            }
            SourceImage::Url { url } => {
                let bytes = self.download(url).await.map_err(|e| upload_err(&e))?;
                let staged = StagedFile::write(&self.config.staging_dir, &file_name, &bytes)
                    .await
                    .map_err(|e| upload_err(&e))?;
                (bytes, Some(staged))
            }
        };
        if bytes.is_empty() {
            return Err(upload_err(&"input image is empty"));
        }

        let response = self
            .api
            .upload_image(bytes, &file_name)
            .await
            .map_err(|e| upload_err(&e))?;
        tracing::info!(slot = %slot, stored = %response.name, "Uploaded input image");

        Ok(if response.subfolder.is_empty() {
            response.name
        } else {
            format!("{}/{}", response.subfolder, response.name)
        })
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, reqwest::Error> {
        let response = self.http.get(url).send().await?.error_for_status()?;
        Ok(response.bytes().await?.to_vec())
    }

    fn emit_state(&self, ticket: Uuid, job_id: Option<String>, state: JobState) {
        self.emit(ticket, job_id, JobUpdate::State { state });
    }

    fn emit(&self, ticket: Uuid, job_id: Option<String>, update: JobUpdate) {
        let _ = self.job_tx.send(JobEvent {
            ticket,
            job_id,
            update,
        });
    }
}

/// A file in the staging directory, removed on drop.
struct StagedFile {
    path: PathBuf,
}

impl StagedFile {
    async fn write(dir: &Path, name: &str, bytes: &[u8]) -> std::io::Result<Self> {
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(name);
        tokio::fs::write(&path, bytes).await?;
        Ok(Self { path })
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::debug!(path = %self.path.display(), error = %e, "Failed to remove staged upload");
        }
    }
}
