use std::{collections::HashMap, pin::Pin, time::Duration};

use async_trait::async_trait;
use bollard::{
    container::{
        AttachContainerOptions, Config as ContainerConfig, LogOutput, StopContainerOptions,
        WaitContainerOptions,
    },
    errors::Error as BollardError,
    image::ListImagesOptions,
    Docker,
};
use chrono::{DateTime, Utc};
use futures::stream::StreamExt;
use stacked_errors::{Result, StackableErr};
use tokio::io::AsyncWriteExt;

use crate::{normalize_image_id, Config, ImageFilter, ImageSummary};

/// Engine request timeout applied when the config does not set one, in
/// seconds.
pub const DEFAULT_DOCKER_TIMEOUT: u64 = 120;

/// The write half of an attached container, its stdin.
pub type ContainerStdin = Pin<Box<dyn tokio::io::AsyncWrite + Send>>;

/// The read half of an attached container: combined stdout and stderr on the
/// pseudo-terminal.
pub type ContainerOutput = Pin<
    Box<dyn futures::stream::Stream<Item = std::result::Result<LogOutput, BollardError>> + Send>,
>;

/// One hijacked bidirectional connection to a running container. Dropping it
/// closes both halves, so callers release it by letting it go out of scope
/// on every exit path.
pub struct ContainerDuplex {
    pub input: ContainerStdin,
    pub output: ContainerOutput,
}

/// What to wait for before draining a container's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitCondition {
    NotRunning,
    NextExit,
    Removed,
}

impl WaitCondition {
    pub fn as_str(self) -> &'static str {
        match self {
            WaitCondition::NotRunning => "not-running",
            WaitCondition::NextExit => "next-exit",
            WaitCondition::Removed => "removed",
        }
    }
}

/// The capability set the rest of the system needs from a container runtime.
/// [DockerEngine] is the production implementation; tests substitute fakes.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Creates a container from `image` with attached standard streams and a
    /// pseudo-terminal, then starts it. Returns the container id.
    async fn deploy(&self, image: &str) -> Result<String>;

    /// Opens the hijacked duplex connection of a started container.
    async fn attach(&self, container_id: &str) -> Result<ContainerDuplex>;

    /// Attaches, writes `data` followed by a single `\n` terminator, then
    /// closes the write side.
    async fn write(&self, container_id: &str, data: &[u8]) -> Result<()> {
        let mut duplex = self.attach(container_id).await?;
        duplex.input.write_all(data).await.stack()?;
        duplex.input.write_all(b"\n").await.stack()?;
        duplex.input.flush().await.stack()?;
        duplex.input.shutdown().await.stack()?;
        Ok(())
    }

    /// Attaches, waits until `condition` is met, then drains the reader to
    /// EOF. May return a partial buffer when the connection drops mid-read.
    async fn wait_and_read(&self, container_id: &str, condition: WaitCondition) -> Result<Vec<u8>>;

    /// Signals polite shutdown, killing after `grace`. Stopping an already
    /// stopped container is a no-op.
    async fn stop(&self, container_id: &str, grace: Duration) -> Result<()>;

    /// Lists images whose reference matches the filter's pattern, in engine
    /// order.
    async fn find_images(&self, filter: &ImageFilter) -> Result<Vec<ImageSummary>>;
}

fn parse_client_version(version: &str) -> Result<bollard::ClientVersion> {
    let parsed = version.split_once('.').and_then(|(major, minor)| {
        Some(bollard::ClientVersion {
            major_version: major.trim().parse().ok()?,
            minor_version: minor.trim().parse().ok()?,
        })
    });
    parsed.stack_err_with(|| format!("invalid engine API version \"{version}\""))
}

/// [ContainerEngine] backed by the docker API.
#[derive(Debug, Clone)]
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }

    /// Connects per config. Unset options take the engine's environment
    /// defaults (`DOCKER_HOST` and friends).
    pub fn connect(config: &Config) -> Result<Self> {
        let timeout = config.docker_timeout.unwrap_or(DEFAULT_DOCKER_TIMEOUT);
        let version = match config.docker_api_version.as_deref() {
            Some(version) => parse_client_version(version)?,
            None => *bollard::API_DEFAULT_VERSION,
        };
        let docker = match config.docker_host.as_deref() {
            Some(host) => Docker::connect_with_http(host, timeout, &version)
                .stack_err_with(|| format!("failed to connect to engine at \"{host}\""))?,
            None => Docker::connect_with_defaults().stack_err("failed to connect to engine")?,
        };
        Ok(Self::new(docker))
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn deploy(&self, image: &str) -> Result<String> {
        let response = self
            .docker
            .create_container::<String, String>(
                None,
                ContainerConfig {
                    attach_stdin: Some(true),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    tty: Some(true),
                    open_stdin: Some(true),
                    image: Some(image.to_owned()),
                    ..Default::default()
                },
            )
            .await
            .stack_err_with(|| format!("failed to create container from \"{image}\""))?;
        self.docker
            .start_container::<String>(&response.id, None)
            .await
            .stack_err_with(|| format!("failed to start container {}", response.id))?;
        tracing::debug!(container.id = %response.id, "container started");
        Ok(response.id)
    }

    async fn attach(&self, container_id: &str) -> Result<ContainerDuplex> {
        let results = self
            .docker
            .attach_container(
                container_id,
                Some(AttachContainerOptions::<String> {
                    stdin: Some(true),
                    stdout: Some(true),
                    stderr: Some(true),
                    stream: Some(true),
                    logs: Some(true),
                    detach_keys: None,
                }),
            )
            .await
            .stack_err_with(|| format!("failed to attach to container {container_id}"))?;
        Ok(ContainerDuplex {
            input: results.input,
            output: results.output,
        })
    }

    async fn wait_and_read(&self, container_id: &str, condition: WaitCondition) -> Result<Vec<u8>> {
        let mut duplex = self.attach(container_id).await?;
        let mut wait = self.docker.wait_container(
            container_id,
            Some(WaitContainerOptions {
                condition: condition.as_str(),
            }),
        );
        match wait.next().await {
            // a non-zero exit surfaces as this error variant and still means
            // the condition was met
            Some(Ok(_)) | Some(Err(BollardError::DockerContainerWaitError { .. })) | None => {}
            Some(Err(err)) => {
                return Err(err)
                    .stack_err_with(|| format!("failed to wait on container {container_id}"))
            }
        }
        let mut buf = Vec::new();
        while let Some(chunk) = duplex.output.next().await {
            match chunk {
                Ok(log) => buf.extend_from_slice(&log.into_bytes()),
                Err(err) => {
                    // keep whatever was read before the connection dropped
                    tracing::debug!("attach stream of {container_id} ended early: {err}");
                    break;
                }
            }
        }
        Ok(buf)
    }

    async fn stop(&self, container_id: &str, grace: Duration) -> Result<()> {
        let options = StopContainerOptions {
            t: grace.as_secs() as i64,
        };
        match self.docker.stop_container(container_id, Some(options)).await {
            Ok(()) => Ok(()),
            // already stopped, or already gone
            Err(BollardError::DockerResponseServerError {
                status_code: 304 | 404,
                ..
            }) => Ok(()),
            Err(err) => {
                Err(err).stack_err_with(|| format!("failed to stop container {container_id}"))
            }
        }
    }

    async fn find_images(&self, filter: &ImageFilter) -> Result<Vec<ImageSummary>> {
        let mut filters = HashMap::new();
        filters.insert("reference".to_owned(), vec![filter.reference_pattern()]);
        let summaries = self
            .docker
            .list_images(Some(ListImagesOptions {
                all: false,
                filters,
                ..Default::default()
            }))
            .await
            .stack_err("failed to list images")?;
        let mut images = Vec::new();
        for summary in summaries {
            let created_at = DateTime::<Utc>::from_timestamp(summary.created, 0).unwrap_or_default();
            for repo_tag in &summary.repo_tags {
                let Some((repository, tag)) = repo_tag.rsplit_once(':') else {
                    continue;
                };
                images.push(ImageSummary {
                    id: normalize_image_id(&summary.id).to_owned(),
                    repository: repository.to_owned(),
                    tag: tag.to_owned(),
                    created_at,
                    size: summary.size,
                });
            }
        }
        Ok(images)
    }
}
