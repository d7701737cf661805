//! Labels and well-known names shared with Kubernetes.
//!
//! These values form the ownership contract with objects already present in a
//! cluster; changing them orphans resources created by earlier versions.

use kuberm_db::AllocationId;

/// The label carrying the allocation identifier on every owned object.
pub const DETERMINED_LABEL: &str = "determined";

/// The label of pods selected for preemption.
pub const DETERMINED_PREEMPTION_LABEL: &str = "determined-preemption";

/// The label of system pods whose resource requests are reserved on a node.
pub const DETERMINED_SYSTEM_LABEL: &str = "determined-system";

/// The label Kubernetes puts on the pods of a batch job.
pub const KUBERNETES_JOB_NAME_LABEL: &str = "batch.kubernetes.io/job-name";

/// The prefix of descriptive labels.
pub const LABEL_PREFIX: &str = "determined.ai/";

/// The label recording the resource pool of a job.
pub const RESOURCE_POOL_LABEL: &str = "determined.ai/resource_pool";

/// The label recording the allocation identifier of a job.
pub const ALLOCATION_ID_LABEL: &str = "determined.ai/allocation_id";

/// The label recording the owning user.
pub const USER_LABEL: &str = "determined.ai/user";

/// The label recording the owning workspace.
pub const WORKSPACE_LABEL: &str = "determined.ai/workspace";

/// The label recording the task type.
pub const TASK_TYPE_LABEL: &str = "determined.ai/task_type";

/// The label recording the task identifier.
pub const TASK_ID_LABEL: &str = "determined.ai/task_id";

/// The label recording the container identifier.
pub const CONTAINER_ID_LABEL: &str = "determined.ai/container_id";

/// The extended resource name of Nvidia GPUs.
pub const RESOURCE_TYPE_NVIDIA: &str = "nvidia.com/gpu";

/// The name of the container whose lifecycle is tracked.
pub const DETERMINED_CONTAINER_NAME: &str = "determined-container";

/// The name of the init container staging the task files.
pub const DETERMINED_INIT_CONTAINER_NAME: &str = "determined-init-container";

/// The node label value of nodes disabled with immediate eviction.
pub const NO_EXECUTE_NODE_LABEL_VALUE: &str = "no-execute";

/// The node label value of nodes disabled with draining.
pub const NO_SCHEDULE_NODE_LABEL_VALUE: &str = "no-schedule";

/// Formats the node label used to disable nodes for the given cluster.
pub fn cluster_id_node_label(cluster_id: &str) -> String {
    format!("determined.ai/cluster-id-{cluster_id}")
}

/// Formats the label selector matching the objects of an allocation.
pub fn allocation_selector(id: &AllocationId) -> String {
    format!("{DETERMINED_LABEL}={id}")
}

/// Formats the name of the priority class created for an allocation.
pub fn priority_class_name(id: &AllocationId) -> String {
    format!("{id}-priorityclass")
}
