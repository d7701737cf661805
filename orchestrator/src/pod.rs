//! Interpretation of Kubernetes pods.

use anyhow::Context;
use anyhow::Result;
use anyhow::bail;
use k8s_openapi::api::core::v1::ContainerStatus;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;

use crate::job::ContainerState;
use crate::job::ExitReason;
use crate::labels::DETERMINED_CONTAINER_NAME;
use crate::labels::KUBERNETES_JOB_NAME_LABEL;

/// The waiting reason of a container whose image can never be pulled.
const IMAGE_PULL_BACK_OFF: &str = "ImagePullBackOff";

/// The message used when a deleted pod has no exit code.
const DELETED_POD_MESSAGE: &str = "unable to get exit code or exit message from deleted pod";

/// An extension trait for Kubernetes pods.
pub trait PodExt {
    /// Gets the name of the batch job that owns the pod.
    ///
    /// Falls back to the pod name when the job name label is missing.
    fn job_name(&self) -> String;

    /// Gets the name of the node the pod is bound to.
    fn node_name(&self) -> Option<&str>;

    /// Determines if the pod's `PodScheduled` condition is true.
    fn is_scheduled(&self) -> bool;

    /// Determines if the pod is being deleted.
    fn is_deleting(&self) -> bool;

    /// Derives the coarse state of the pod from its phase and the status of
    /// the tracked container.
    ///
    /// Returns an error if the pod is missing its status or the phase is
    /// unknown.
    fn container_state(&self) -> Result<ContainerState>;

    /// Extracts the exit code and message of a terminated pod.
    ///
    /// A failed init container takes priority over the tracked container. A
    /// pod without init container statuses is malformed. A pod being deleted
    /// without an exit code yields a reason rather than an error.
    fn exit_reason(&self) -> Result<ExitReason>;

    /// Gets the message of a container stuck pulling its image.
    ///
    /// Returns `None` if no container is in `ImagePullBackOff`.
    fn image_pull_back_off(&self) -> Option<String>;
}

impl PodExt for Pod {
    fn job_name(&self) -> String {
        self.labels()
            .get(KUBERNETES_JOB_NAME_LABEL)
            .cloned()
            .unwrap_or_else(|| self.name_any())
    }

    fn node_name(&self) -> Option<&str> {
        self.spec.as_ref().and_then(|s| s.node_name.as_deref())
    }

    fn is_scheduled(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.conditions.as_ref())
            .and_then(|c| c.iter().find(|c| c.type_ == "PodScheduled"))
            .map(|c| c.status == "True")
            .unwrap_or(false)
    }

    fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    fn container_state(&self) -> Result<ContainerState> {
        let status = self.status.as_ref().context("pod has no status")?;
        let phase = status.phase.as_deref().context("pod has no phase")?;

        Ok(match phase {
            // Kubernetes may move a deleted pod back to pending without ever
            // reporting it as failed or succeeded
            "Pending" if self.is_deleting() => ContainerState::Terminated,
            "Pending" if self.is_scheduled() => ContainerState::Starting,
            "Pending" => ContainerState::Assigned,
            "Running" => {
                let container = tracked_container(status.container_statuses.as_deref())?;
                let state = container.state.as_ref();
                if state.and_then(|s| s.terminated.as_ref()).is_some() {
                    ContainerState::Terminated
                } else if state.and_then(|s| s.running.as_ref()).is_none() {
                    ContainerState::Starting
                } else {
                    ContainerState::Running
                }
            }
            "Failed" | "Succeeded" => ContainerState::Terminated,
            _ => bail!(
                "unexpected phase `{phase}` for pod `{name}`",
                name = self.name_any()
            ),
        })
    }

    fn exit_reason(&self) -> Result<ExitReason> {
        let name = self.name_any();
        let result = (|| -> Result<ExitReason> {
            let status = self.status.as_ref().context("pod has no status")?;
            let inits = status.init_container_statuses.as_deref().unwrap_or_default();
            if inits.is_empty() {
                bail!("found no init container statuses for pod `{name}`");
            }

            for init in inits {
                let Some(terminated) = init.state.as_ref().and_then(|s| s.terminated.as_ref())
                else {
                    continue;
                };

                if terminated.exit_code != 0 {
                    return Ok(ExitReason {
                        code: terminated.exit_code,
                        message: format!(
                            "container {init}: {message}",
                            init = init.name,
                            message = terminated.message.as_deref().unwrap_or_default()
                        ),
                        failure_type: None,
                    });
                }
            }

            let container = tracked_container(status.container_statuses.as_deref())?;
            let terminated = container
                .state
                .as_ref()
                .and_then(|s| s.terminated.as_ref())
                .with_context(|| format!("unable to get exit code from pod `{name}`"))?;

            Ok(ExitReason {
                code: terminated.exit_code,
                message: terminated.message.clone().unwrap_or_default(),
                failure_type: None,
            })
        })();

        match result {
            Err(_) if self.is_deleting() => Ok(ExitReason {
                message: DELETED_POD_MESSAGE.to_string(),
                ..Default::default()
            }),
            result => result,
        }
    }

    fn image_pull_back_off(&self) -> Option<String> {
        let status = self.status.as_ref()?;
        status
            .init_container_statuses
            .iter()
            .flatten()
            .chain(status.container_statuses.iter().flatten())
            .filter_map(|s| s.state.as_ref()?.waiting.as_ref())
            .find(|w| w.reason.as_deref() == Some(IMAGE_PULL_BACK_OFF))
            .map(|w| w.message.clone().unwrap_or_default())
    }
}

/// Finds the status of the tracked container.
fn tracked_container(statuses: Option<&[ContainerStatus]>) -> Result<&ContainerStatus> {
    statuses
        .unwrap_or_default()
        .iter()
        .find(|s| s.name == DETERMINED_CONTAINER_NAME)
        .with_context(|| format!("found no status for container `{DETERMINED_CONTAINER_NAME}`"))
}
