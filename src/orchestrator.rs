use std::{sync::Arc, time::Duration};

use stacked_errors::{bail, Result, StackableErr};
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::{
    engine::{ContainerEngine, WaitCondition},
    runner::{Payload, RunResult},
    ImageFilter, ImageSummary, FILTER_ARCHITECTURE, FILTER_LANGUAGE, FILTER_OPERATING_SYSTEM,
};

/// How long to wait for a result line from the container.
pub const READ_TIMEOUT: Duration = Duration::from_secs(60);
/// Grace period given to a container when stopping it.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(30);

/// Scoped teardown for one launched container: stops it exactly once on
/// every exit path. If the guard is dropped without [Teardown::finish]
/// (cancellation, panic), a best-effort background stop is spawned instead.
struct Teardown {
    engine: Arc<dyn ContainerEngine>,
    container_id: String,
    grace: Duration,
    done: bool,
}

impl Teardown {
    fn new(engine: Arc<dyn ContainerEngine>, container_id: String, grace: Duration) -> Self {
        Self {
            engine,
            container_id,
            grace,
            done: false,
        }
    }

    async fn finish(mut self) {
        self.done = true;
        if let Err(err) = self.engine.stop(&self.container_id, self.grace).await {
            warn!("failed to stop container {}: {err}", self.container_id);
        }
    }
}

impl Drop for Teardown {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let engine = Arc::clone(&self.engine);
        let container_id = std::mem::take(&mut self.container_id);
        let grace = self.grace;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = engine.stop(&container_id, grace).await;
            });
        }
    }
}

/// Splits drained container output on newlines and returns the first line
/// that JSON-decodes into a result carrying either a transcript or an error.
/// Pseudo-terminal echo and stray log lines fail this and are discarded.
fn first_result_line(bytes: &[u8]) -> Option<RunResult> {
    bytes.split(|&b| b == b'\n').find_map(|line| {
        let line = line.trim_ascii();
        if line.is_empty() {
            return None;
        }
        serde_json::from_slice::<RunResult>(line)
            .ok()
            .filter(|result| !result.is_empty())
    })
}

/// Request-scoped coordinator over an explicit engine handle. Cheap to
/// clone and holds no per-request state; every deployment gets a fresh
/// container that is never shared across requests.
#[derive(Clone)]
pub struct Orchestrator {
    engine: Arc<dyn ContainerEngine>,
    read_timeout: Duration,
    stop_grace: Duration,
}

impl Orchestrator {
    pub fn new(engine: Arc<dyn ContainerEngine>) -> Self {
        Self {
            engine,
            read_timeout: READ_TIMEOUT,
            stop_grace: STOP_TIMEOUT,
        }
    }

    /// Overrides how long to wait for the container's result line.
    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    /// Overrides the stop grace period used at teardown.
    pub fn with_stop_grace(mut self, stop_grace: Duration) -> Self {
        self.stop_grace = stop_grace;
        self
    }

    /// Runs one payload in a fresh sandbox container and collects its
    /// result. The container is stopped on every exit path. Pipeline
    /// failures (a command exiting non-zero, a stage timeout) come back as
    /// `Ok` results with `error` populated; `Err` means the orchestration
    /// itself failed.
    pub async fn create_deployment(&self, payload: &Payload) -> Result<RunResult> {
        let encoded = serde_json::to_vec(payload).stack_err("failed to serialize payload")?;
        let image = self
            .resolve_image(
                &payload.language,
                &payload.operating_system,
                &payload.architecture,
            )
            .await?;
        info!("deploying image \"{}\"", image.name());
        let container_id = self.engine.deploy(&image.name()).await?;
        let teardown = Teardown::new(
            Arc::clone(&self.engine),
            container_id.clone(),
            self.stop_grace,
        );

        // Wait for the container to stop, then forward the first meaningful
        // result line out of its drained output.
        let (tx, rx) = oneshot::channel();
        let engine = Arc::clone(&self.engine);
        let collector_id = container_id.clone();
        tokio::spawn(async move {
            let outcome = match engine
                .wait_and_read(&collector_id, WaitCondition::NotRunning)
                .await
            {
                Ok(bytes) => first_result_line(&bytes),
                Err(err) => Some(RunResult::from_error(err.to_string())),
            };
            if let Some(result) = outcome {
                let _ = tx.send(result);
            }
        });

        if let Err(err) = self.engine.write(&container_id, &encoded).await {
            teardown.finish().await;
            return Err(err).stack_err("failed to write payload to container");
        }

        let result = match tokio::time::timeout(self.read_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => RunResult::from_error("container exited without producing a result"),
            Err(_) => RunResult::from_error(format!(
                "read timeout exceeded ({}s)",
                self.read_timeout.as_secs()
            )),
        };
        teardown.finish().await;
        Ok(result)
    }

    /// Lists images matching the provided fields; empty fields match
    /// anything.
    pub async fn list_images(
        &self,
        language: &str,
        os: &str,
        arch: &str,
    ) -> Result<Vec<ImageSummary>> {
        let mut filter = ImageFilter::new();
        if !language.is_empty() {
            filter.set(FILTER_LANGUAGE, language);
        }
        if !os.is_empty() {
            filter.set(FILTER_OPERATING_SYSTEM, os);
        }
        if !arch.is_empty() {
            filter.set(FILTER_ARCHITECTURE, arch);
        }
        self.engine.find_images(&filter).await
    }

    /// Resolves the unique image for a (language, OS, architecture) triple.
    async fn resolve_image(&self, language: &str, os: &str, arch: &str) -> Result<ImageSummary> {
        let mut filter = ImageFilter::new();
        filter.set(FILTER_LANGUAGE, language);
        filter.set(FILTER_OPERATING_SYSTEM, os);
        filter.set(FILTER_ARCHITECTURE, arch);
        let images = self
            .engine
            .find_images(&filter)
            .await
            .stack_err("failed to query engine for images")?;
        match images.into_iter().next() {
            Some(image) => Ok(image),
            None => bail!(
                "failed to find image for language \"{language}\", OS \"{os}\", and architecture \
                 \"{arch}\""
            ),
        }
    }
}
