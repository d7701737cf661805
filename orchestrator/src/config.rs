//! Implementation of resource manager configuration.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::core::v1::Toleration;
use serde::Deserialize;
use serde::Serialize;
use tokio_retry2::strategy::ExponentialFactorBackoff;

use crate::request_queue::DEFAULT_WORKERS;

/// The default number of CPUs making up a CPU slot.
pub const DEFAULT_CPU_PER_SLOT: f32 = 1.0;

/// The default namespace jobs are created in.
pub const DEFAULT_NAMESPACE: &str = "default";

/// The kind of device a slot represents.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum SlotType {
    /// Slots are Nvidia GPUs.
    #[default]
    Cuda,
    /// Slots are a fixed amount of CPU.
    Cpu,
}

impl fmt::Display for SlotType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cuda => write!(f, "cuda"),
            Self::Cpu => write!(f, "cpu"),
        }
    }
}

/// Default pod customizations applied to task containers.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskContainerDefaults {
    /// The pod spec merged into jobs using CPU slots.
    #[serde(default)]
    pub cpu_pod_spec: Option<Pod>,
    /// The pod spec merged into jobs using GPU slots.
    #[serde(default)]
    pub gpu_pod_spec: Option<Pod>,
}

impl TaskContainerDefaults {
    /// Gets the pod spec for the given slot type.
    pub fn pod_spec(&self, slot_type: SlotType) -> Option<&Pod> {
        match slot_type {
            SlotType::Cuda => self.gpu_pod_spec.as_ref(),
            SlotType::Cpu => self.cpu_pod_spec.as_ref(),
        }
    }

    /// Gets the tolerations of the CPU and GPU pod specs.
    pub fn tolerations(&self) -> (Vec<Toleration>, Vec<Toleration>) {
        let tolerations = |pod: Option<&Pod>| {
            pod.and_then(|p| p.spec.as_ref())
                .and_then(|s| s.tolerations.clone())
                .unwrap_or_default()
        };

        (
            tolerations(self.cpu_pod_spec.as_ref()),
            tolerations(self.gpu_pod_spec.as_ref()),
        )
    }
}

/// Configuration of a resource pool.
#[derive(Debug, Clone, Deserialize)]
pub struct ResourcePoolConfig {
    /// The name of the pool.
    pub pool_name: String,
    /// The pool's pod customizations.
    #[serde(default)]
    pub task_container_defaults: Option<TaskContainerDefaults>,
}

/// Configuration of the resource pools managed by the resource manager.
///
/// This is read from a JSON file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResourcePoolsConfig {
    /// The configured pools.
    ///
    /// Defaults to a single pool named `default`.
    #[serde(default)]
    pub resource_pools: Vec<ResourcePoolConfig>,
    /// The pod customizations applied to every pool.
    #[serde(default)]
    pub task_container_defaults: Option<TaskContainerDefaults>,
}

impl ResourcePoolsConfig {
    /// Reads the configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).with_context(|| {
            format!(
                "failed to read resource pool configuration `{path}`",
                path = path.display()
            )
        })?;

        serde_json::from_str(&contents).with_context(|| {
            format!(
                "invalid resource pool configuration `{path}`",
                path = path.display()
            )
        })
    }

    /// Gets the configured pools, keyed by name.
    pub fn pools(&self) -> BTreeMap<String, Option<&TaskContainerDefaults>> {
        if self.resource_pools.is_empty() {
            return BTreeMap::from([(DEFAULT_NAMESPACE.to_string(), None)]);
        }

        self.resource_pools
            .iter()
            .map(|p| (p.pool_name.clone(), p.task_container_defaults.as_ref()))
            .collect()
    }
}

/// Configuration of the jobs service.
#[derive(Debug, Clone, bon::Builder)]
pub struct JobsConfig {
    /// The identifier of the cluster the resource manager belongs to.
    #[builder(into)]
    pub cluster_id: String,
    /// The namespaces the resource manager manages.
    #[builder(default = vec![DEFAULT_NAMESPACE.to_string()])]
    pub namespaces: Vec<String>,
    /// The kind of device a slot represents.
    #[builder(default)]
    pub slot_type: SlotType,
    /// The number of CPUs making up a CPU slot.
    #[builder(default = DEFAULT_CPU_PER_SLOT)]
    pub cpu_per_slot: f32,
    /// The number of request queue workers.
    #[builder(default = DEFAULT_WORKERS)]
    pub request_queue_workers: usize,
    /// The resource pool configuration.
    #[builder(default)]
    pub resource_pools: ResourcePoolsConfig,
}

impl JobsConfig {
    /// Gets the retry durations used by informers after a failed list or
    /// watch.
    ///
    /// Retries use an exponential power of 2 backoff, starting at 1 second with
    /// each delay capped at 1 minute. The iterator never ends.
    pub fn informer_retry_durations() -> impl Iterator<Item = Duration> {
        const INITIAL_DELAY_MILLIS: u64 = 1000;
        const BASE_FACTOR: f64 = 2.0;
        const MAX_DELAY: Duration = Duration::from_secs(60);

        ExponentialFactorBackoff::from_millis(INITIAL_DELAY_MILLIS, BASE_FACTOR)
            .max_delay(MAX_DELAY)
    }
}
