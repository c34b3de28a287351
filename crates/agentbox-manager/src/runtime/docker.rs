use super::{ContainerRuntime, LaunchSpec, Result, RuntimeError, RuntimeState};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, DownloadFromContainerOptions, InspectContainerOptions,
    KillContainerOptions, RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
    UploadToContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use bytes::{Bytes, BytesMut};
use futures::{StreamExt, TryStreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

fn map_err(handle: &str, err: BollardError) -> RuntimeError {
    match err {
        BollardError::DockerResponseServerError {
            status_code: 404, ..
        } => RuntimeError::NotFound(handle.to_string()),
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } => RuntimeError::Api(format!("{status_code}: {message}")),
        e => RuntimeError::Internal(e.to_string()),
    }
}

// Docker copies only the directory contents when the path ends in `/.`,
// which keeps archives independent of where the volume is mounted.
fn contents_path(volume_path: &str) -> String {
    format!("{}/.", volume_path.trim_end_matches('/'))
}

/// Runtime backed by the local Docker daemon.
///
/// Every sandbox gets an anonymous volume at the template's volume path, the
/// template's memory/CPU/PID ceilings, and `agentbox.*` labels the ingress
/// uses to route `<subdomain>.<domain>` to the sandbox port.
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Arc<Docker>,
}

impl DockerRuntime {
    pub fn new(docker: Arc<Docker>) -> Self {
        Self { docker }
    }

    pub fn connect_local() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| RuntimeError::Internal(format!("failed to connect to Docker: {e}")))?;
        Ok(Self::new(Arc::new(docker)))
    }

    async fn ensure_image(&self, image: &str) -> Result<()> {
        match self.docker.inspect_image(image).await {
            Ok(_) => return Ok(()),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => {}
            Err(e) => return Err(map_err(image, e)),
        }

        info!(image, "Pulling image");
        let mut pull = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: image.to_string(),
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(progress) = pull.next().await {
            progress.map_err(|e| map_err(image, e))?;
        }
        Ok(())
    }

    fn container_config(spec: &LaunchSpec) -> Config<String> {
        let mut env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect();
        env.sort();

        Config {
            image: Some(spec.image.clone()),
            env: Some(env),
            labels: Some(spec.labels.clone()),
            exposed_ports: Some(HashMap::from([(
                format!("{}/tcp", spec.port),
                HashMap::new(),
            )])),
            volumes: Some(HashMap::from([(spec.volume_path.clone(), HashMap::new())])),
            host_config: Some(HostConfig {
                memory: Some(i64::try_from(spec.limits.memory_bytes).unwrap_or(i64::MAX)),
                memory_swap: Some(i64::try_from(spec.limits.memory_bytes).unwrap_or(i64::MAX)),
                cpu_shares: Some(i64::try_from(spec.limits.cpu_shares).unwrap_or(i64::MAX)),
                pids_limit: Some(spec.limits.pid_limit),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    async fn start_created(&self, id: &str, spec: &LaunchSpec) -> Result<()> {
        if let Some(archive) = &spec.restore_from {
            debug!(container_id = %id, bytes = archive.len(), "Restoring volume");
            self.docker
                .upload_to_container(
                    id,
                    Some(UploadToContainerOptions {
                        path: spec.volume_path.clone(),
                        ..Default::default()
                    }),
                    archive.clone(),
                )
                .await
                .map_err(|e| map_err(id, e))?;
        }

        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| map_err(id, e))
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    #[instrument(skip(self, spec), fields(name = %spec.name, image = %spec.image))]
    async fn create_and_start(&self, spec: &LaunchSpec) -> Result<String> {
        self.ensure_image(&spec.image).await?;

        // A leftover container from an attempt that timed out keeps the name.
        if let Err(e) = self.remove(&spec.name).await {
            debug!(error = %e, "No leftover container removed");
        }

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.name.clone(),
                    platform: None,
                }),
                Self::container_config(spec),
            )
            .await
            .map_err(|e| map_err(&spec.name, e))?;

        if let Err(e) = self.start_created(&created.id, spec).await {
            warn!(container_id = %created.id, error = %e, "Start failed, removing container");
            if let Err(cleanup) = self.remove(&created.id).await {
                warn!(container_id = %created.id, error = %cleanup, "Cleanup after failed start failed");
            }
            return Err(e);
        }

        info!(container_id = %created.id, "Sandbox started");
        Ok(created.id)
    }

    async fn stop(&self, handle: &str, grace: Duration) -> Result<()> {
        match self
            .docker
            .stop_container(
                handle,
                Some(StopContainerOptions {
                    t: grace.as_secs() as i64,
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            // Already stopped
            Err(BollardError::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(map_err(handle, e)),
        }
    }

    async fn kill(&self, handle: &str) -> Result<()> {
        match self
            .docker
            .kill_container(
                handle,
                Some(KillContainerOptions { signal: "SIGKILL" }),
            )
            .await
        {
            Ok(()) => Ok(()),
            // Not running
            Err(BollardError::DockerResponseServerError {
                status_code: 409, ..
            }) => Ok(()),
            Err(e) => Err(map_err(handle, e)),
        }
    }

    async fn remove(&self, handle: &str) -> Result<()> {
        match self
            .docker
            .remove_container(
                handle,
                Some(RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(map_err(handle, e)),
        }
    }

    async fn inspect(&self, handle: &str) -> Result<Option<RuntimeState>> {
        match self
            .docker
            .inspect_container(handle, None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => {
                let running = info
                    .state
                    .and_then(|s| s.running)
                    .unwrap_or(false);
                Ok(Some(if running {
                    RuntimeState::Running
                } else {
                    RuntimeState::Exited
                }))
            }
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(None),
            Err(e) => Err(map_err(handle, e)),
        }
    }

    async fn export_volume(&self, handle: &str, volume_path: &str) -> Result<Bytes> {
        let chunks: Vec<Bytes> = self
            .docker
            .download_from_container(
                handle,
                Some(DownloadFromContainerOptions {
                    path: contents_path(volume_path),
                }),
            )
            .map_err(|e| map_err(handle, e))
            .try_collect()
            .await?;

        let mut archive = BytesMut::with_capacity(chunks.iter().map(Bytes::len).sum());
        for chunk in chunks {
            archive.extend_from_slice(&chunk);
        }
        debug!(container_id = %handle, bytes = archive.len(), "Exported volume");
        Ok(archive.freeze())
    }
}
