//! Construction of the Kubernetes objects backing a job.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use k8s_openapi::api::batch::v1::Job as KubeJob;
use k8s_openapi::api::batch::v1::JobSpec;
use k8s_openapi::api::core::v1::Affinity;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::api::core::v1::ConfigMapVolumeSource;
use k8s_openapi::api::core::v1::Container;
use k8s_openapi::api::core::v1::EmptyDirVolumeSource;
use k8s_openapi::api::core::v1::EnvVar;
use k8s_openapi::api::core::v1::NodeAffinity;
use k8s_openapi::api::core::v1::NodeSelector;
use k8s_openapi::api::core::v1::NodeSelectorRequirement;
use k8s_openapi::api::core::v1::NodeSelectorTerm;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::core::v1::PodSpec;
use k8s_openapi::api::core::v1::PodTemplateSpec;
use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::api::core::v1::Volume;
use k8s_openapi::api::core::v1::VolumeMount;
use k8s_openapi::api::scheduling::v1::PriorityClass;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::ObjectMeta;
use kuberm_db::AllocationId;
use regex::Regex;
use serde::Deserialize;
use tracing::debug;
use tracing::warn;

use crate::config::SlotType;
use crate::labels::ALLOCATION_ID_LABEL;
use crate::labels::CONTAINER_ID_LABEL;
use crate::labels::DETERMINED_CONTAINER_NAME;
use crate::labels::DETERMINED_INIT_CONTAINER_NAME;
use crate::labels::DETERMINED_LABEL;
use crate::labels::LABEL_PREFIX;
use crate::labels::RESOURCE_POOL_LABEL;
use crate::labels::RESOURCE_TYPE_NVIDIA;
use crate::labels::TASK_ID_LABEL;
use crate::labels::TASK_TYPE_LABEL;
use crate::labels::USER_LABEL;
use crate::labels::WORKSPACE_LABEL;
use crate::labels::cluster_id_node_label;

/// The priority class used by tasks without a priority.
pub const DEFAULT_PRIORITY_CLASS: &str = "determined-medium-priority";

/// The number of seconds a finished job is kept for.
///
/// This must be long enough to recover exit codes of jobs that finished while
/// the resource manager was down.
const TTL_SECONDS_AFTER_FINISHED: i32 = 900;

/// The maximum length of a label value.
const MAX_LABEL_VALUE_LEN: usize = 63;

/// The label value used when a value cannot be made valid.
const INVALID_LABEL_VALUE: &str = "invalid_value";

/// The name of the volume holding the task files.
const FILES_VOLUME_NAME: &str = "determined-files";

/// The path the task files are mounted at.
const FILES_MOUNT_PATH: &str = "/run/determined/files";

/// The name of the volume holding the config map the task files come from.
const STAGED_FILES_VOLUME_NAME: &str = "determined-staged-files";

/// The path the init container reads the config map from.
const STAGED_FILES_MOUNT_PATH: &str = "/run/determined/staged";

/// Matches a valid label value.
static VALID_LABEL_VALUE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(([A-Za-z0-9][-A-Za-z0-9_.]*)?[A-Za-z0-9])?$").expect("regex should compile")
});

/// Matches characters never allowed in a label value.
static DISALLOWED_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^A-Za-z0-9.\-_]").expect("regex should compile"));

/// Matches leading non-alphanumeric characters.
static LEADING_NON_ALPHANUMERIC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^A-Za-z0-9]+").expect("regex should compile"));

/// Matches trailing non-alphanumeric characters.
static TRAILING_NON_ALPHANUMERIC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^A-Za-z0-9]+$").expect("regex should compile"));

/// The specification of the task an allocation runs.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TaskSpec {
    /// The allocation the task belongs to.
    pub allocation_id: AllocationId,
    /// The task identifier.
    pub task_id: String,
    /// The container identifier.
    pub container_id: String,
    /// The type of the task (e.g. `TRIAL`).
    pub task_type: String,
    /// The description of the task, used to name the job.
    pub description: String,
    /// The user that owns the task.
    pub user: Option<String>,
    /// The workspace the task belongs to.
    pub workspace: String,
    /// The image to run.
    pub image: String,
    /// The entrypoint of the container.
    pub entrypoint: Vec<String>,
    /// The environment variables of the container.
    pub env: BTreeMap<String, String>,
    /// The working directory of the container.
    pub work_dir: Option<String>,
    /// The files made available to the container, keyed by file name.
    pub files: BTreeMap<String, String>,
    /// Additional labels, prefixed with `determined.ai/` on the job.
    pub extra_labels: BTreeMap<String, String>,
    /// The scheduling priority of the task.
    pub priority: Option<i32>,
    /// User customizations of the pod.
    pub pod_spec: Option<Pod>,
}

/// A request to start a job for an allocation.
#[derive(Debug, Clone, Deserialize)]
pub struct StartJobRequest {
    /// The task to run.
    pub spec: TaskSpec,
    /// The number of slots each pod uses.
    pub slots_per_pod: usize,
    /// The number of pods to run.
    #[serde(default = "default_num_pods")]
    pub num_pods: usize,
    /// The resource pool the allocation belongs to.
    pub resource_pool: String,
    /// The namespace to create the job in.
    #[serde(default)]
    pub namespace: Option<String>,
    /// Nodes the pods must not run on.
    #[serde(default)]
    pub blocked_nodes: Vec<String>,
}

/// Gets the default number of pods of a job.
fn default_num_pods() -> usize {
    1
}

/// Formats the unique name of a task's job.
///
/// The first 8 characters of the cluster identifier prefix the description so
/// that several installations can share a cluster.
pub fn unique_name(cluster_id: &str, description: &str) -> String {
    let prefix: String = cluster_id.chars().take(8).collect();
    if prefix.is_empty() {
        return description.to_string();
    }

    format!("det-{prefix}-{description}")
}

/// Determines if a value is a valid Kubernetes label value.
fn is_valid_label_value(value: &str) -> bool {
    value.len() <= MAX_LABEL_VALUE_LEN && VALID_LABEL_VALUE.is_match(value)
}

/// Conforms a value to the Kubernetes label value rules.
///
/// Values that cannot be fixed are replaced with `invalid_value`.
pub fn sanitize_label_value(value: &str) -> String {
    if is_valid_label_value(value) {
        return value.to_string();
    }

    let fixed = DISALLOWED_CHARS.replace_all(value, "_");
    let mut fixed = LEADING_NON_ALPHANUMERIC.replace(&fixed, "").into_owned();
    fixed.truncate(MAX_LABEL_VALUE_LEN);
    let fixed = TRAILING_NON_ALPHANUMERIC.replace(&fixed, "").into_owned();

    if !is_valid_label_value(&fixed) {
        warn!("unable to conform `{value}` to Kubernetes label standards: using `{INVALID_LABEL_VALUE}`");
        return INVALID_LABEL_VALUE.to_string();
    }

    debug!("reformatted label value `{value}` to `{fixed}`");
    fixed
}

/// Computes the resource requirements of the tracked container.
///
/// Tasks without slots use CPU devices so that they are not restricted to GPU
/// nodes.
pub fn resource_requirements(
    slot_type: SlotType,
    slots_per_pod: usize,
    cpu_per_slot: f32,
) -> ResourceRequirements {
    let slot_type = if slots_per_pod == 0 {
        SlotType::Cpu
    } else {
        slot_type
    };

    let resources = match slot_type {
        SlotType::Cpu => {
            let millis = (cpu_per_slot * slots_per_pod as f32 * 1000.0) as i64;
            BTreeMap::from([("cpu".to_string(), Quantity(format!("{millis}m")))])
        }
        SlotType::Cuda => BTreeMap::from([(
            RESOURCE_TYPE_NVIDIA.to_string(),
            Quantity(slots_per_pod.to_string()),
        )]),
    };

    ResourceRequirements {
        limits: Some(resources.clone()),
        requests: Some(resources),
        ..Default::default()
    }
}

/// Constructs the non-preempting priority class of an allocation.
pub fn priority_class(name: &str, priority: i32) -> PriorityClass {
    PriorityClass {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        value: priority,
        global_default: Some(false),
        description: Some("temporary priorityClass for determined".to_string()),
        preemption_policy: Some("Never".to_string()),
    }
}

/// Adds a required node selector requirement to a pod spec.
///
/// Requirements on labels are added to the match expressions and requirements
/// on fields to the match fields of the first term. Adding an existing
/// requirement has no effect.
pub fn add_node_selector_requirement(
    spec: &mut PodSpec,
    requirement: NodeSelectorRequirement,
    on_label: bool,
) {
    let selector = spec
        .affinity
        .get_or_insert_with(Affinity::default)
        .node_affinity
        .get_or_insert_with(NodeAffinity::default)
        .required_during_scheduling_ignored_during_execution
        .get_or_insert_with(NodeSelector::default);

    if selector.node_selector_terms.is_empty() {
        selector
            .node_selector_terms
            .push(NodeSelectorTerm::default());
    }

    let term = &mut selector.node_selector_terms[0];
    let requirements = if on_label {
        term.match_expressions.get_or_insert_with(Vec::new)
    } else {
        term.match_fields.get_or_insert_with(Vec::new)
    };

    if !requirements.contains(&requirement) {
        requirements.push(requirement);
    }
}

/// The inputs used to build a job's Kubernetes objects.
#[derive(Debug, Clone)]
pub struct JobTemplate<'a> {
    /// The name of the job (and its config map).
    pub name: &'a str,
    /// The namespace of the job.
    pub namespace: &'a str,
    /// The identifier of the cluster.
    pub cluster_id: &'a str,
    /// The task to run.
    pub spec: &'a TaskSpec,
    /// The resource pool of the allocation.
    pub resource_pool: &'a str,
    /// The kind of slots.
    pub slot_type: SlotType,
    /// The number of CPUs per CPU slot.
    pub cpu_per_slot: f32,
    /// The number of slots each pod uses.
    pub slots_per_pod: usize,
    /// The number of pods to run.
    pub num_pods: usize,
    /// Nodes the pods must not run on.
    pub blocked_nodes: &'a [String],
    /// The pod customizations merged into the pod template.
    pub pod_spec: Option<&'a Pod>,
    /// The priority class to use when the pod customizations set none.
    pub priority_class: Option<String>,
}

impl JobTemplate<'_> {
    /// Builds the config map holding the task files.
    pub fn config_map(&self) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(self.name.to_string()),
                namespace: Some(self.namespace.to_string()),
                labels: Some(BTreeMap::from([(
                    DETERMINED_LABEL.to_string(),
                    self.spec.allocation_id.to_string(),
                )])),
                ..Default::default()
            },
            data: Some(self.spec.files.clone()),
            ..Default::default()
        }
    }

    /// Builds the labels of the job and its pods.
    fn labels(&self, existing: Option<BTreeMap<String, String>>) -> BTreeMap<String, String> {
        let spec = self.spec;
        let mut labels = existing.unwrap_or_default();

        if let Some(user) = &spec.user {
            labels.insert(USER_LABEL.to_string(), sanitize_label_value(user));
        }

        labels.insert(
            WORKSPACE_LABEL.to_string(),
            sanitize_label_value(&spec.workspace),
        );
        labels.insert(
            RESOURCE_POOL_LABEL.to_string(),
            sanitize_label_value(self.resource_pool),
        );
        labels.insert(TASK_TYPE_LABEL.to_string(), spec.task_type.clone());
        labels.insert(TASK_ID_LABEL.to_string(), spec.task_id.clone());
        labels.insert(CONTAINER_ID_LABEL.to_string(), spec.container_id.clone());
        labels.insert(
            DETERMINED_LABEL.to_string(),
            spec.allocation_id.to_string(),
        );
        labels.insert(
            ALLOCATION_ID_LABEL.to_string(),
            spec.allocation_id.to_string(),
        );

        for (key, value) in &spec.extra_labels {
            labels.insert(format!("{LABEL_PREFIX}{key}"), sanitize_label_value(value));
        }

        labels
    }

    /// Builds the tracked container.
    fn container(&self) -> Container {
        let spec = self.spec;
        let mut env: Vec<EnvVar> = spec
            .env
            .iter()
            .map(|(name, value)| EnvVar {
                name: name.clone(),
                value: Some(value.clone()),
                ..Default::default()
            })
            .collect();

        for (name, value) in [
            ("DET_ALLOCATION_ID", spec.allocation_id.to_string()),
            ("DET_TASK_ID", spec.task_id.clone()),
            ("DET_CONTAINER_ID", spec.container_id.clone()),
            ("DET_SLOT_TYPE", self.slot_type.to_string()),
        ] {
            env.push(EnvVar {
                name: name.to_string(),
                value: Some(value),
                ..Default::default()
            });
        }

        Container {
            name: DETERMINED_CONTAINER_NAME.to_string(),
            image: Some(spec.image.clone()),
            command: (!spec.entrypoint.is_empty()).then(|| spec.entrypoint.clone()),
            env: Some(env),
            resources: Some(resource_requirements(
                self.slot_type,
                self.slots_per_pod,
                self.cpu_per_slot,
            )),
            volume_mounts: Some(vec![VolumeMount {
                name: FILES_VOLUME_NAME.to_string(),
                mount_path: FILES_MOUNT_PATH.to_string(),
                ..Default::default()
            }]),
            working_dir: spec.work_dir.clone(),
            ..Default::default()
        }
    }

    /// Builds the init container copying the task files into a writable
    /// volume shared with the tracked container.
    fn init_container(&self) -> Container {
        Container {
            name: DETERMINED_INIT_CONTAINER_NAME.to_string(),
            image: Some(self.spec.image.clone()),
            command: Some(vec![
                "sh".to_string(),
                "-c".to_string(),
                format!("cp -RL {STAGED_FILES_MOUNT_PATH}/. {FILES_MOUNT_PATH}/"),
            ]),
            volume_mounts: Some(vec![
                VolumeMount {
                    name: STAGED_FILES_VOLUME_NAME.to_string(),
                    mount_path: STAGED_FILES_MOUNT_PATH.to_string(),
                    read_only: Some(true),
                    ..Default::default()
                },
                VolumeMount {
                    name: FILES_VOLUME_NAME.to_string(),
                    mount_path: FILES_MOUNT_PATH.to_string(),
                    ..Default::default()
                },
            ]),
            ..Default::default()
        }
    }

    /// Builds the batch job.
    pub fn job(&self) -> KubeJob {
        let pod = self.pod_spec.cloned().unwrap_or_default();
        let mut metadata = pod.metadata;
        metadata.name = Some(self.name.to_string());
        metadata.namespace = Some(self.namespace.to_string());
        metadata.labels = Some(self.labels(metadata.labels.take()));

        let mut spec = pod.spec.unwrap_or_default();
        if spec.priority_class_name.as_deref().unwrap_or_default().is_empty() {
            spec.priority_class_name = self.priority_class.clone();
        }

        add_node_selector_requirement(
            &mut spec,
            NodeSelectorRequirement {
                key: cluster_id_node_label(self.cluster_id),
                operator: "DoesNotExist".to_string(),
                values: None,
            },
            true,
        );

        for node in self.blocked_nodes {
            add_node_selector_requirement(
                &mut spec,
                NodeSelectorRequirement {
                    key: "metadata.name".to_string(),
                    operator: "NotIn".to_string(),
                    values: Some(vec![node.clone()]),
                },
                false,
            );
        }

        let mut tracked = self.container();
        let mut containers = Vec::new();
        for container in std::mem::take(&mut spec.containers) {
            if container.name != DETERMINED_CONTAINER_NAME {
                containers.push(container);
                continue;
            }

            merge_container(&mut tracked, container);
        }

        containers.push(tracked);
        spec.containers = containers;
        spec.init_containers
            .get_or_insert_with(Vec::new)
            .push(self.init_container());
        spec.volumes.get_or_insert_with(Vec::new).extend([
            Volume {
                name: STAGED_FILES_VOLUME_NAME.to_string(),
                config_map: Some(ConfigMapVolumeSource {
                    name: self.name.to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            },
            Volume {
                name: FILES_VOLUME_NAME.to_string(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            },
        ]);
        spec.restart_policy = Some("Never".to_string());

        let num_pods = self.num_pods as i32;
        KubeJob {
            metadata: metadata.clone(),
            spec: Some(JobSpec {
                parallelism: Some(num_pods),
                completions: Some(num_pods),
                backoff_limit: Some(0),
                ttl_seconds_after_finished: Some(TTL_SECONDS_AFTER_FINISHED),
                template: PodTemplateSpec {
                    metadata: Some(metadata),
                    spec: Some(spec),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

/// Merges a user customization of the tracked container into it.
///
/// Environment, mounts and devices are appended; resource limits and requests
/// are only added for resources the tracked container does not set.
fn merge_container(tracked: &mut Container, user: Container) {
    tracked
        .env
        .get_or_insert_with(Vec::new)
        .extend(user.env.unwrap_or_default());

    if let Some(env_from) = user.env_from {
        tracked
            .env_from
            .get_or_insert_with(Vec::new)
            .extend(env_from);
    }

    if let Some(user) = user.resources {
        let resources = tracked.resources.get_or_insert_with(Default::default);
        for (ours, theirs) in [
            (&mut resources.limits, user.limits),
            (&mut resources.requests, user.requests),
        ] {
            let ours = ours.get_or_insert_with(BTreeMap::new);
            for (key, value) in theirs.unwrap_or_default() {
                ours.entry(key).or_insert(value);
            }
        }
    }

    tracked
        .volume_mounts
        .get_or_insert_with(Vec::new)
        .extend(user.volume_mounts.unwrap_or_default());

    if let Some(devices) = user.volume_devices {
        tracked
            .volume_devices
            .get_or_insert_with(Vec::new)
            .extend(devices);
    }
}
