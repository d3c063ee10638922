//! [`ContainerRuntime`] backed by the Docker Engine API via `bollard`.

use std::collections::HashMap;
use std::time::Duration;

use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogOutput,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::HostConfig;
use bollard::Docker;
use bytes::{Bytes, BytesMut};
use futures_util::future::BoxFuture;
use futures_util::StreamExt;
use tracing::{debug, info, warn};

use super::retry::RetryPolicy;
use super::{
    shell_join, shell_quote, ByteStream, ContainerRuntime, ContainerSpec, ContainerState,
    ManagedContainer, CONTAINER_DATA, CONTAINER_WORKSPACE, LABEL_MANAGED, LABEL_SESSION,
};
use crate::{AppError, Result};

const CONNECT_TIMEOUT_SECS: u64 = 120;

/// Docker Engine client with bounded retries on idempotent calls.
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
    retry: RetryPolicy,
}

impl DockerRuntime {
    /// Connect to the engine at `host`, or the local default socket.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Runtime` if the client cannot be built.
    pub fn connect(host: Option<&str>, retry: RetryPolicy) -> Result<Self> {
        let docker = match host {
            Some(host) => Docker::connect_with_socket(
                host,
                CONNECT_TIMEOUT_SECS,
                bollard::API_DEFAULT_VERSION,
            ),
            None => Docker::connect_with_local_defaults(),
        }
        .map_err(|err| AppError::Runtime(format!("cannot connect to container engine: {err}")))?;

        Ok(Self { docker, retry })
    }

    /// Probe the engine.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Runtime` if the engine does not answer.
    pub async fn ping(&self) -> Result<()> {
        self.retry
            .run("ping", is_transient, || self.docker.ping())
            .await?;
        Ok(())
    }

    async fn exec_collect(&self, id: &str, cmd: Vec<String>) -> Result<(Bytes, i64)> {
        let exec = self
            .retry
            .run("create_exec", is_transient, || {
                self.docker.create_exec(
                    id,
                    CreateExecOptions {
                        cmd: Some(cmd.clone()),
                        attach_stdout: Some(true),
                        attach_stderr: Some(true),
                        ..Default::default()
                    },
                )
            })
            .await?;

        let mut stdout = BytesMut::new();
        if let StartExecResults::Attached { mut output, .. } =
            self.docker.start_exec(&exec.id, None).await?
        {
            while let Some(chunk) = output.next().await {
                match chunk? {
                    LogOutput::StdOut { message } => stdout.extend_from_slice(&message),
                    LogOutput::StdErr { message } => {
                        debug!(container_id = id, stderr = %String::from_utf8_lossy(&message), "exec stderr");
                    }
                    _ => {}
                }
            }
        }

        let exit_code = self.exec_exit_code(&exec.id).await?;
        Ok((stdout.freeze(), exit_code))
    }

    async fn exec_exit_code(&self, exec_id: &str) -> Result<i64> {
        // The attached stream can close a moment before the engine records the exit.
        for _ in 0..20 {
            let inspect = self.docker.inspect_exec(exec_id).await?;
            if inspect.running != Some(true) {
                return Ok(inspect.exit_code.unwrap_or(-1));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        Err(AppError::Runtime(format!("exec {exec_id} did not finish")))
    }

    async fn exec_stream(&self, id: &str, cmd: Vec<String>) -> Result<ByteStream> {
        let exec = self
            .retry
            .run("create_exec", is_transient, || {
                self.docker.create_exec(
                    id,
                    CreateExecOptions {
                        cmd: Some(cmd.clone()),
                        attach_stdout: Some(true),
                        attach_stderr: Some(true),
                        ..Default::default()
                    },
                )
            })
            .await?;

        match self.docker.start_exec(&exec.id, None).await? {
            StartExecResults::Attached { output, .. } => Ok(output
                .map(|chunk| chunk.map(log_bytes).map_err(AppError::from))
                .boxed()),
            StartExecResults::Detached => Err(AppError::Runtime(
                "exec unexpectedly started detached".into(),
            )),
        }
    }
}

fn log_bytes(output: LogOutput) -> Bytes {
    match output {
        LogOutput::StdOut { message }
        | LogOutput::StdErr { message }
        | LogOutput::StdIn { message }
        | LogOutput::Console { message } => message,
    }
}

/// Transport hiccups and engine 5xx responses are worth another attempt.
fn is_transient(err: &BollardError) -> bool {
    match err {
        BollardError::DockerResponseServerError { status_code, .. } => *status_code >= 500,
        BollardError::RequestTimeoutError
        | BollardError::IOError { .. }
        | BollardError::HyperResponseError { .. } => true,
        _ => false,
    }
}

fn status_code(err: &BollardError) -> Option<u16> {
    match err {
        BollardError::DockerResponseServerError { status_code, .. } => Some(*status_code),
        _ => None,
    }
}

fn container_config(spec: &ContainerSpec) -> Config<String> {
    let labels = HashMap::from([
        (LABEL_MANAGED.to_owned(), "true".to_owned()),
        (LABEL_SESSION.to_owned(), spec.session_id.clone()),
    ]);
    let binds = vec![
        format!("{}:{CONTAINER_WORKSPACE}", spec.workspace_path.display()),
        format!("{}:{CONTAINER_DATA}", spec.data_path.display()),
    ];

    Config {
        image: Some(spec.image.clone()),
        labels: Some(labels),
        env: Some(spec.env.clone()),
        working_dir: Some(CONTAINER_WORKSPACE.to_owned()),
        // Keep the container alive; the runner is exec'd in separately.
        cmd: Some(vec!["sleep".to_owned(), "infinity".to_owned()]),
        host_config: Some(HostConfig {
            binds: Some(binds),
            auto_remove: Some(false),
            init: Some(true),
            ..Default::default()
        }),
        ..Default::default()
    }
}

impl ContainerRuntime for DockerRuntime {
    fn create<'a>(&'a self, spec: &'a ContainerSpec) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            let options = CreateContainerOptions {
                name: spec.name.clone(),
                ..Default::default()
            };

            // Not retried: a half-applied create is resolved by the name check below.
            match self
                .docker
                .create_container(Some(options), container_config(spec))
                .await
            {
                Ok(response) => {
                    info!(container_id = %response.id, name = %spec.name, "container created");
                    Ok(response.id)
                }
                Err(err) if status_code(&err) == Some(409) => {
                    let existing = self
                        .docker
                        .inspect_container(&spec.name, None::<InspectContainerOptions>)
                        .await?;
                    let id = existing.id.ok_or_else(|| {
                        AppError::Runtime(format!("container {} has no id", spec.name))
                    })?;
                    info!(container_id = %id, name = %spec.name, "container already exists");
                    Ok(id)
                }
                Err(err) => Err(err.into()),
            }
        })
    }

    fn start<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let result = self
                .retry
                .run("start", is_transient, || {
                    self.docker
                        .start_container(id, None::<StartContainerOptions<String>>)
                })
                .await;
            match result {
                // 304: already running.
                Err(err) if status_code(&err) == Some(304) => Ok(()),
                other => Ok(other?),
            }
        })
    }

    fn stop<'a>(&'a self, id: &'a str, grace: Duration) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let t = i64::try_from(grace.as_secs()).unwrap_or(i64::MAX);
            let result = self
                .retry
                .run("stop", is_transient, || {
                    self.docker
                        .stop_container(id, Some(StopContainerOptions { t }))
                })
                .await;
            match result {
                Err(err) if matches!(status_code(&err), Some(304 | 404)) => {
                    debug!(container_id = id, "stop: container already stopped or gone");
                    Ok(())
                }
                other => Ok(other?),
            }
        })
    }

    fn remove<'a>(&'a self, id: &'a str, force: bool) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let result = self
                .retry
                .run("remove", is_transient, || {
                    self.docker.remove_container(
                        id,
                        Some(RemoveContainerOptions {
                            force,
                            ..Default::default()
                        }),
                    )
                })
                .await;
            match result {
                Err(err) if status_code(&err) == Some(404) => Ok(()),
                other => Ok(other?),
            }
        })
    }

    fn inspect<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<ContainerState>> {
        Box::pin(async move {
            let result = self
                .retry
                .run("inspect", is_transient, || {
                    self.docker
                        .inspect_container(id, None::<InspectContainerOptions>)
                })
                .await;
            match result {
                Ok(response) => {
                    let running = response
                        .state
                        .and_then(|state| state.running)
                        .unwrap_or(false);
                    Ok(if running {
                        ContainerState::Running
                    } else {
                        ContainerState::Stopped
                    })
                }
                Err(err) if status_code(&err) == Some(404) => Ok(ContainerState::NotFound),
                Err(err) => Err(err.into()),
            }
        })
    }

    fn list_managed(&self) -> BoxFuture<'_, Result<Vec<ManagedContainer>>> {
        Box::pin(async move {
            let filters = HashMap::from([(
                "label".to_owned(),
                vec![format!("{LABEL_MANAGED}=true")],
            )]);
            let summaries = self
                .retry
                .run("list", is_transient, || {
                    self.docker.list_containers(Some(ListContainersOptions::<String> {
                        all: true,
                        filters: filters.clone(),
                        ..Default::default()
                    }))
                })
                .await?;

            Ok(summaries
                .into_iter()
                .filter_map(|summary| {
                    let id = summary.id?;
                    let name = summary
                        .names
                        .and_then(|names| names.into_iter().next())
                        .map(|name| name.trim_start_matches('/').to_owned())
                        .unwrap_or_default();
                    let session_id = summary
                        .labels
                        .and_then(|mut labels| labels.remove(LABEL_SESSION));
                    let state = if summary.state.as_deref() == Some("running") {
                        ContainerState::Running
                    } else {
                        ContainerState::Stopped
                    };
                    Some(ManagedContainer {
                        id,
                        name,
                        session_id,
                        state,
                    })
                })
                .collect())
        })
    }

    fn exec<'a>(&'a self, id: &'a str, cmd: &'a [String]) -> BoxFuture<'a, Result<ByteStream>> {
        Box::pin(self.exec_stream(id, cmd.to_vec()))
    }

    fn exec_detached_to_file<'a>(
        &'a self,
        id: &'a str,
        cmd: &'a [String],
        output_path: &'a str,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let line = format!(
                "nohup {} >> {} 2>&1 < /dev/null &",
                shell_join(cmd),
                shell_quote(output_path)
            );
            let (_, exit_code) = self
                .exec_collect(id, vec!["sh".into(), "-c".into(), line])
                .await?;
            if exit_code != 0 {
                return Err(AppError::Runtime(format!(
                    "detached exec in {id} exited with {exit_code}"
                )));
            }
            info!(container_id = id, output_path, "detached process launched");
            Ok(())
        })
    }

    fn tail_file<'a>(
        &'a self,
        id: &'a str,
        path: &'a str,
        from_line: u64,
    ) -> BoxFuture<'a, Result<ByteStream>> {
        let cmd = vec![
            "tail".to_owned(),
            "-n".to_owned(),
            format!("+{}", from_line.max(1)),
            "-F".to_owned(),
            path.to_owned(),
        ];
        Box::pin(self.exec_stream(id, cmd))
    }

    fn read_file<'a>(&'a self, id: &'a str, path: &'a str) -> BoxFuture<'a, Result<Bytes>> {
        Box::pin(async move {
            let (contents, exit_code) = self
                .exec_collect(id, vec!["cat".to_owned(), path.to_owned()])
                .await?;
            if exit_code != 0 {
                return Err(AppError::NotFound(format!("{path} in container {id}")));
            }
            Ok(contents)
        })
    }

    fn find_process<'a>(
        &'a self,
        id: &'a str,
        name_match: &'a str,
    ) -> BoxFuture<'a, Result<Option<u32>>> {
        Box::pin(async move {
            let (stdout, exit_code) = self
                .exec_collect(
                    id,
                    vec![
                        "pgrep".to_owned(),
                        "-o".to_owned(),
                        "-f".to_owned(),
                        name_match.to_owned(),
                    ],
                )
                .await?;
            // pgrep: 1 means no match.
            if exit_code == 1 {
                return Ok(None);
            }
            if exit_code != 0 {
                warn!(container_id = id, exit_code, "process probe failed");
                return Err(AppError::Runtime(format!(
                    "process probe in {id} exited with {exit_code}"
                )));
            }
            Ok(parse_pid(&stdout))
        })
    }
}

fn parse_pid(stdout: &[u8]) -> Option<u32> {
    String::from_utf8_lossy(stdout)
        .lines()
        .next()
        .and_then(|line| line.trim().parse().ok())
}
