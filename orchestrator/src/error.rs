//! Errors returned by the resource manager.

use kuberm_db::AllocationId;

/// Represents an orchestration error.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The allocation is not known to the resource manager.
    #[error("allocation `{0}` is not known to the resource manager")]
    UnknownAllocation(AllocationId),
    /// The agent (Kubernetes node) was not found.
    #[error("agent `{0}` was not found")]
    UnknownAgent(String),
    /// The slot was not found on the agent.
    #[error("slot `{slot}` was not found on agent `{agent}`")]
    UnknownSlot {
        /// The agent that was searched.
        agent: String,
        /// The requested slot.
        slot: String,
    },
    /// A job with the same name is already registered.
    #[error("job `{0}` is already registered")]
    DuplicateJob(String),
    /// A create request for the same object is already queued or executing.
    #[error("a create request for `{0}` is already in flight")]
    DuplicateRequest(String),
    /// The live Kubernetes objects of an allocation could not be adopted.
    #[error("failed to reattach allocation `{allocation_id}`: {reason}")]
    Reattach {
        /// The allocation being reattached.
        allocation_id: AllocationId,
        /// Why the reattachment failed.
        reason: String,
    },
    /// The service account may not patch nodes.
    #[error(
        "the resource manager's Kubernetes service account is missing permissions to patch \
         nodes: enabling or disabling nodes requires this permission, but everything else \
         works without it"
    )]
    NodePatchForbidden,
    /// An invalid argument was supplied.
    #[error("{0}")]
    InvalidArgument(String),
    /// A generic error occurred.
    #[error(transparent)]
    Generic(#[from] anyhow::Error),
    /// A Kubernetes error occurred.
    #[error(transparent)]
    Kubernetes(#[from] kube::Error),
    /// A database error occurred.
    #[error(transparent)]
    Database(#[from] kuberm_db::Error),
}

/// The result type of the orchestrator methods.
pub type OrchestrationResult<T> = Result<T, Error>;
