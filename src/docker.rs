//! Per-session container provisioning against a Docker daemon.
//!
//! Handles:
//! - Pulling and caching session images
//! - Creating one container task per session, wired to the client's streams
//! - Window-resize propagation and the exit-status feed
//! - Teardown with escalating signals on every exit path

use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::container::{AttachContainerResults, LogOutput};
use bollard::models::{ContainerCreateBody, ContainerWaitResponse};
use bollard::query_parameters::{
    AttachContainerOptionsBuilder, CreateContainerOptionsBuilder, CreateImageOptionsBuilder,
    KillContainerOptionsBuilder, RemoveContainerOptionsBuilder, ResizeContainerTTYOptionsBuilder,
    StartContainerOptions, WaitContainerOptions,
};
use bollard::Docker;
use chrono::Utc;
use futures::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::container::{ExitStatus, InteractiveStreams, Manager, Spawner, TermSize};

/// Label marking containers managed by this gateway.
const MANAGED_LABEL: &str = "hostel.managed";

/// How long teardown waits for the task to exit after each signal.
const TEARDOWN_STEP_WAIT: Duration = Duration::from_secs(2);

const TEARDOWN_SIGNALS: [&str; 3] = ["SIGINT", "SIGTERM", "SIGKILL"];

/// Docker-backed session spawner.
pub struct DockerSpawner {
    docker: Docker,

    /// Sanitised image key -> image id. Entries are inserted only after a
    /// successful pull and live for the process lifetime.
    image_cache: Mutex<HashMap<String, String>>,
}

impl DockerSpawner {
    /// Connect to the daemon at `socket`, or the local defaults when unset.
    pub async fn new(socket: Option<&str>) -> Result<Self> {
        let docker = match socket {
            Some(addr) => Docker::connect_with_socket(addr, 120, bollard::API_DEFAULT_VERSION)
                .with_context(|| format!("Failed to connect to Docker daemon at {addr}"))?,
            None => Docker::connect_with_local_defaults()
                .context("Failed to connect to Docker daemon")?,
        };

        // Verify connection
        docker
            .ping()
            .await
            .context("Failed to ping Docker daemon")?;

        info!("Connected to Docker daemon");

        Ok(Self {
            docker,
            image_cache: Mutex::new(HashMap::new()),
        })
    }
}

#[async_trait]
impl Manager for DockerSpawner {
    /// Pull `image_ref` unless a previous pull already cached it. The cache
    /// lock is held across the pull, so concurrent calls stay single-flight;
    /// a redundant pull of the same reference is harmless.
    async fn prepare(&self, image_ref: &str) -> Result<()> {
        let key = sanitise_image_key(image_ref);
        let mut cache = self.image_cache.lock().await;
        if cache.contains_key(&key) {
            return Ok(());
        }

        info!("Pulling image {image_ref}");
        let options = CreateImageOptionsBuilder::new().from_image(image_ref).build();
        let mut pull = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = pull.next().await {
            progress.with_context(|| format!("could not pull image {image_ref}"))?;
        }

        let inspect = self
            .docker
            .inspect_image(image_ref)
            .await
            .with_context(|| format!("could not inspect pulled image {image_ref}"))?;
        let image_id = inspect.id.unwrap_or_else(|| image_ref.to_string());

        debug!("Cached image {image_ref} as {image_id}");
        cache.insert(key, image_id);
        Ok(())
    }
}

#[async_trait]
impl Spawner for DockerSpawner {
    async fn spawn(
        &self,
        image_ref: &str,
        argv: Vec<String>,
        streams: InteractiveStreams,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<ExitStatus>> {
        let key = sanitise_image_key(image_ref);
        if !self.image_cache.lock().await.contains_key(&key) {
            self.prepare(image_ref).await?;
        }

        let id = format!(
            "{}-{}",
            key,
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        );
        let tty = streams.initial_size.is_some();

        info!("Creating container {id} with {argv:?}");

        let body = ContainerCreateBody {
            image: Some(image_ref.to_string()),
            cmd: Some(argv),
            tty: Some(tty),
            open_stdin: Some(true),
            stdin_once: Some(true),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            labels: Some(HashMap::from([(
                MANAGED_LABEL.to_string(),
                "true".to_string(),
            )])),
            ..Default::default()
        };
        let options = CreateContainerOptionsBuilder::new().name(&id).build();
        self.docker
            .create_container(Some(options), body)
            .await
            .context("unable to create container")?;

        // Attach before start so no early output is missed, and subscribe
        // to the exit feed before the task can finish.
        let attach_options = AttachContainerOptionsBuilder::new()
            .stdin(true)
            .stdout(true)
            .stderr(true)
            .stream(true)
            .build();
        let io = match self
            .docker
            .attach_container(&id, Some(attach_options))
            .await
        {
            Ok(io) => io,
            Err(e) => {
                teardown(&self.docker, &id, true).await;
                return Err(e).context("could not attach to container");
            }
        };
        let mut wait = self
            .docker
            .wait_container(&id, None::<WaitContainerOptions>)
            .boxed();

        if let Err(e) = self
            .docker
            .start_container(&id, None::<StartContainerOptions>)
            .await
        {
            teardown(&self.docker, &id, true).await;
            return Err(e).context("could not start task");
        }
        debug!("Task {id} started");

        if let Some(size) = streams.initial_size {
            if let Err(e) = resize_tty(&self.docker, &id, size).await {
                warn!("Failed to set initial terminal size for {id}: {e}");
            }
        }

        // Client stdin -> task stdin. Dropping the write half on EOF closes
        // the task's stdin.
        let mut stdin = streams.stdin;
        let AttachContainerResults { mut output, mut input } = io;
        let stdin_task = tokio::spawn(async move {
            if let Err(e) = tokio::io::copy(&mut stdin, &mut input).await {
                debug!("stdin copy ended: {e}");
            }
            let _ = input.shutdown().await;
        });

        // Task output -> client. stdout is shut down once the last output
        // byte has been written, so the supervisor can order the exit status
        // after it.
        let mut stdout = streams.stdout;
        let mut stderr = streams.stderr;
        let output_task = tokio::spawn(async move {
            while let Some(frame) = output.next().await {
                let written = match frame {
                    Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                        stdout.write_all(&message).await
                    }
                    Ok(LogOutput::StdErr { message }) => stderr.write_all(&message).await,
                    Ok(LogOutput::StdIn { .. }) => Ok(()),
                    Err(e) => {
                        debug!("task output stream ended: {e}");
                        break;
                    }
                };
                if let Err(e) = written {
                    debug!("client stream closed: {e}");
                    break;
                }
            }
            let _ = stdout.shutdown().await;
        });

        let (tx, rx) = mpsc::channel(1);
        let docker = self.docker.clone();
        let mut updates = streams.updates;
        tokio::spawn(async move {
            let mut updates_open = true;
            let exited = loop {
                tokio::select! {
                    maybe_size = updates.recv(), if updates_open => match maybe_size {
                        Some(size) => {
                            if let Err(e) = resize_tty(&docker, &id, size).await {
                                warn!("Failed to resize task {id}: {e}");
                            }
                        }
                        None => updates_open = false,
                    },
                    outcome = wait.next() => match outcome {
                        Some(result) => break Some(exit_status_from_wait(result)),
                        None => break None,
                    },
                    _ = cancel.cancelled() => {
                        debug!("Session cancelled, tearing down {id}");
                        break None;
                    }
                }
            };

            match exited {
                Some(status) => {
                    // Drain and close the client-bound streams before
                    // emitting, so the exit status follows the last byte.
                    let _ = output_task.await;
                    stdin_task.abort();
                    debug!("Task {id} exited with {}", status.code);
                    if tx.send(status).await.is_err() {
                        debug!("Exit status for {id} dropped");
                    }
                    teardown(&docker, &id, true).await;
                }
                None => {
                    teardown(&docker, &id, false).await;
                    let _ = output_task.await;
                    stdin_task.abort();
                }
            }
        });

        Ok(rx)
    }
}

/// Tear a session container down. Runs detached from session cancellation;
/// every step logs failures and proceeds, so teardown never fails outward.
async fn teardown(docker: &Docker, id: &str, task_exited: bool) {
    if !task_exited {
        let mut wait = docker
            .wait_container(id, None::<WaitContainerOptions>)
            .boxed();

        for signal in TEARDOWN_SIGNALS {
            debug!("Signalling task {id} with {signal}");
            match docker
                .kill_container(
                    id,
                    Some(KillContainerOptionsBuilder::new().signal(signal).build()),
                )
                .await
            {
                Ok(()) => {}
                Err(bollard::errors::Error::DockerResponseServerError {
                    status_code: 409, ..
                }) => {
                    // Task already stopped.
                    break;
                }
                Err(e) => warn!("Failed to signal task {id} with {signal}: {e}"),
            }

            match tokio::time::timeout(TEARDOWN_STEP_WAIT, wait.next()).await {
                Ok(Some(result)) => {
                    let status = exit_status_from_wait(result);
                    debug!("Task {id} exited with {} during teardown", status.code);
                    break;
                }
                Ok(None) => break,
                Err(_) => debug!("Task {id} survived {signal}, escalating"),
            }
        }
    }

    let options = RemoveContainerOptionsBuilder::new().force(true).v(true).build();
    match docker.remove_container(id, Some(options)).await {
        Ok(()) => debug!("Removed container {id}"),
        Err(bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        }) => {
            // Already gone.
        }
        Err(e) => warn!("Failed to remove container {id}: {e}"),
    }
}

async fn resize_tty(docker: &Docker, id: &str, size: TermSize) -> Result<()> {
    let options = ResizeContainerTTYOptionsBuilder::new()
        .w(size.columns as i32)
        .h(size.rows as i32)
        .build();
    docker
        .resize_container_tty(id, options)
        .await
        .context("could not resize task tty")?;
    Ok(())
}

/// Map the daemon's wait outcome to an `ExitStatus`. A non-zero exit is
/// surfaced by bollard as `DockerContainerWaitError`.
fn exit_status_from_wait(
    result: Result<ContainerWaitResponse, bollard::errors::Error>,
) -> ExitStatus {
    match result {
        Ok(response) => ExitStatus {
            code: response.status_code.try_into().unwrap_or(1),
            error: response.error.and_then(|e| e.message),
        },
        Err(bollard::errors::Error::DockerContainerWaitError { error, code }) => ExitStatus {
            code: code.try_into().unwrap_or(1),
            error: if error.is_empty() { None } else { Some(error) },
        },
        Err(e) => ExitStatus {
            code: 1,
            error: Some(e.to_string()),
        },
    }
}

/// Image references become cache keys and container-name prefixes, and
/// Docker names cannot carry `:` or `/`.
fn sanitise_image_key(image_ref: &str) -> String {
    image_ref.replace([':', '/'], "_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitise_image_key() {
        assert_eq!(
            sanitise_image_key("docker.io/library/ubuntu:latest"),
            "docker.io_library_ubuntu_latest"
        );
        assert_eq!(sanitise_image_key("alpine"), "alpine");
    }

    #[test]
    fn test_exit_status_from_clean_wait() {
        let status = exit_status_from_wait(Ok(ContainerWaitResponse {
            status_code: 0,
            error: None,
        }));
        assert_eq!(
            status,
            ExitStatus {
                code: 0,
                error: None
            }
        );
    }

    #[test]
    fn test_exit_status_from_wait_error() {
        let status = exit_status_from_wait(Err(
            bollard::errors::Error::DockerContainerWaitError {
                error: "task killed".to_string(),
                code: 137,
            },
        ));
        assert_eq!(status.code, 137);
        assert_eq!(status.error.as_deref(), Some("task killed"));
    }

    #[test]
    fn test_exit_status_clamps_negative_codes() {
        let status = exit_status_from_wait(Ok(ContainerWaitResponse {
            status_code: -1,
            error: None,
        }));
        assert_eq!(status.code, 1);
    }
}
