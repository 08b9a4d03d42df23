//! The container driver seam.
//!
//! The builder only needs two capabilities: make an image available and
//! run a command in it with some directories bound. Docker via bollard is
//! the shipped driver; anything else is a different implementation of the
//! same trait.

use std::path::PathBuf;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use futures::StreamExt;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error(transparent)]
    Docker(#[from] bollard::errors::Error),

    #[error("`{dsn}` is not a valid container driver DSN: {message}")]
    InvalidDsn { dsn: String, message: String },
}

/// One container run: an image, a shell command and bind mounts.
#[derive(Debug, Clone)]
pub struct RunSpec {
    pub image: String,
    /// Passed to `sh -c` inside the container.
    pub command: String,
    /// `(host dir, container path)` read-write binds.
    pub binds: Vec<(PathBuf, String)>,
}

#[async_trait]
pub trait ContainerDriver: Send + Sync {
    /// Make the image available locally, appending progress to `log`.
    async fn acquire_image(&self, image: &str, log: &mut String) -> Result<(), DriverError>;

    /// Run the spec to completion, appending combined stdout and stderr
    /// to `log`. The container is removed on every path. Returns the
    /// exit status.
    async fn run(&self, spec: &RunSpec, log: &mut String) -> Result<i64, DriverError>;
}

#[async_trait]
impl<T: ContainerDriver + ?Sized> ContainerDriver for Box<T> {
    async fn acquire_image(&self, image: &str, log: &mut String) -> Result<(), DriverError> {
        (**self).acquire_image(image, log).await
    }

    async fn run(&self, spec: &RunSpec, log: &mut String) -> Result<i64, DriverError> {
        (**self).run(spec, log).await
    }
}

/// Docker over the `BUILDS_DOCKER_DSN` endpoint: `tcp://` / `https://`
/// (optionally with `?cert_path=` pointing at cert.pem/key.pem/ca.pem),
/// or a local socket path.
#[derive(Debug, Clone)]
pub struct DockerDriver {
    docker: Docker,
}

const CONNECT_TIMEOUT_SECS: u64 = 120;

impl DockerDriver {
    pub fn connect(dsn: &str) -> Result<Self, DriverError> {
        let docker = if dsn.starts_with("tcp://") || dsn.starts_with("https://") {
            let url = Url::parse(dsn).map_err(|err| DriverError::InvalidDsn {
                dsn: dsn.to_string(),
                message: err.to_string(),
            })?;
            let host = url.host_str().ok_or_else(|| DriverError::InvalidDsn {
                dsn: dsn.to_string(),
                message: "missing host".to_string(),
            })?;
            let port = url.port().unwrap_or(2376);
            // Client certificates need a TLS-enabled bollard build; this
            // one only speaks plain HTTP endpoints.
            if url.query_pairs().any(|(key, _)| key == "cert_path") {
                return Err(DriverError::InvalidDsn {
                    dsn: dsn.to_string(),
                    message: "cert_path is not supported by this build".to_string(),
                });
            }
            let address = format!("tcp://{host}:{port}");
            Docker::connect_with_http(&address, CONNECT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)?
        } else if dsn.is_empty() {
            Docker::connect_with_local_defaults()?
        } else {
            Docker::connect_with_socket(dsn, CONNECT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)?
        };
        Ok(Self { docker })
    }

    async fn remove(&self, container_id: &str) {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        if let Err(err) = self.docker.remove_container(container_id, Some(options)).await {
            warn!(container_id, "failed to remove build container: {err}");
        }
    }

    async fn run_inner(&self, container_id: &str, log: &mut String) -> Result<i64, DriverError> {
        self.docker
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await?;

        let mut logs = self.docker.logs(
            container_id,
            Some(LogsOptions::<String> {
                follow: true,
                stdout: true,
                stderr: true,
                ..Default::default()
            }),
        );
        while let Some(chunk) = logs.next().await {
            match chunk? {
                LogOutput::StdOut { message }
                | LogOutput::StdErr { message }
                | LogOutput::Console { message } => {
                    log.push_str(&String::from_utf8_lossy(&message));
                }
                LogOutput::StdIn { .. } => {}
            }
        }

        let mut wait = self
            .docker
            .wait_container(container_id, None::<WaitContainerOptions<String>>);
        match wait.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(err)) => Err(err.into()),
            None => Ok(0),
        }
    }
}

#[async_trait]
impl ContainerDriver for DockerDriver {
    async fn acquire_image(&self, image: &str, log: &mut String) -> Result<(), DriverError> {
        debug!(image, "pulling image");
        let mut pull = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: image,
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(progress) = pull.next().await {
            let progress = progress?;
            if let Some(status) = progress.status {
                log.push_str(&status);
                log.push('\n');
            }
        }
        Ok(())
    }

    async fn run(&self, spec: &RunSpec, log: &mut String) -> Result<i64, DriverError> {
        let binds: Vec<String> = spec
            .binds
            .iter()
            .map(|(host, container)| format!("{}:{}:rw", host.display(), container))
            .collect();
        let config = ContainerConfig {
            image: Some(spec.image.clone()),
            cmd: Some(vec!["sh".to_string(), "-c".to_string(), spec.command.clone()]),
            working_dir: Some("/".to_string()),
            host_config: Some(bollard::models::HostConfig {
                binds: Some(binds),
                ..Default::default()
            }),
            ..Default::default()
        };

        let container = self
            .docker
            .create_container(None::<CreateContainerOptions<String>>, config)
            .await?;
        let result = self.run_inner(&container.id, log).await;
        self.remove(&container.id).await;
        result
    }
}

/// Quote a string for `sh -c`.
pub(crate) fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
