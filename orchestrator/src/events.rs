//! Events published by jobs to their allocation's topic.

use chrono::DateTime;
use chrono::Utc;
use kuberm_db::AllocationId;
use kuberm_events::EventBus;
use serde::Serialize;

use crate::job::ContainerState;

/// The event bus carrying resource events keyed by allocation.
pub type ResourcesEventBus = EventBus<AllocationId, ResourcesEvent>;

/// An event published for an allocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResourcesEvent {
    /// The coarse state of the allocation's resources changed.
    StateChanged(ResourcesStateChanged),
    /// A log line was produced by a container or by the resource manager.
    ContainerLog(ContainerLog),
    /// The allocation should give up its resources.
    ReleaseResources(ReleaseResources),
}

/// Reports a change of the coarse container state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourcesStateChanged {
    /// The identifier of the resources (the job name).
    pub resources_id: String,
    /// The new state.
    pub state: ContainerState,
    /// Present on the transition to running.
    pub started: Option<ResourcesStarted>,
    /// Present on the transition to terminated.
    pub stopped: Option<ResourcesStopped>,
}

/// Details of resources that have started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourcesStarted {
    /// The native (Kubernetes) identifier of the resources.
    pub native_resources_id: String,
}

/// Details of resources that have stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourcesStopped {
    /// The failure, if the resources did not exit successfully.
    pub failure: Option<ResourcesFailure>,
}

/// The kind of failure that stopped a set of resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureType {
    /// The resources themselves failed (creation, deletion, kill, crash).
    ResourcesFailed,
    /// The task running in the resources failed.
    TaskError,
}

/// A failure of a set of resources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourcesFailure {
    /// The kind of failure.
    pub failure_type: FailureType,
    /// The human-readable message.
    pub message: String,
    /// The exit code of the task, if one is known.
    pub exit_code: Option<i32>,
}

/// A log line associated with an allocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContainerLog {
    /// The container that produced the line, if any.
    pub container_id: Option<String>,
    /// When the line was produced.
    pub timestamp: DateTime<Utc>,
    /// The line itself.
    pub message: LogMessage,
}

/// The content of a log line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "source", content = "text", rename_all = "snake_case")]
pub enum LogMessage {
    /// A line read from a container's output.
    Stdout(String),
    /// A line produced by the resource manager on the allocation's behalf.
    Aux(String),
}

/// Asks the allocation to release its resources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReleaseResources {
    /// The human-readable reason.
    pub reason: String,
    /// Whether the release must not wait for a graceful shutdown.
    pub force_kill: bool,
}

/// The scheduling state of a job's pods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingState {
    /// At least one pod has not been bound to a node.
    Queued,
    /// Every pod has been bound to a node.
    Scheduled,
}

/// Reports the scheduling state of an allocation's pods.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchedulingStateUpdate {
    /// The allocation.
    pub allocation_id: AllocationId,
    /// The number of pods in the job.
    pub num_pods: usize,
    /// The rolled-up state.
    pub state: SchedulingState,
}
