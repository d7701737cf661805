//! Implementation of the per-allocation job state machine.
//!
//! A [`Job`] owns one Kubernetes batch job and the pods it runs. It is driven
//! by informer callbacks (dispatched by the jobs service) and by external
//! commands, and it publishes its coarse state, its logs and its exit cause to
//! the allocation's topic on the event bus.
//!
//! Every callback takes the job's own lock, so informer deliveries and
//! external commands never interleave within a job.

use std::collections::HashMap;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use anyhow::Result;
use chrono::DateTime;
use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job as KubeJob;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::api::core::v1::Event;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use kuberm_db::AllocationId;
use serde::Serialize;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::cluster::Cluster;
use crate::config::SlotType;
use crate::error::OrchestrationResult;
use crate::events::ContainerLog;
use crate::events::FailureType;
use crate::events::LogMessage;
use crate::events::ReleaseResources;
use crate::events::ResourcesEvent;
use crate::events::ResourcesEventBus;
use crate::events::ResourcesFailure;
use crate::events::ResourcesStarted;
use crate::events::ResourcesStateChanged;
use crate::events::ResourcesStopped;
use crate::events::SchedulingState;
use crate::pod::PodExt;
use crate::request_queue::DeleteRequest;
use crate::request_queue::RequestQueue;

/// The coarse state of a job's containers.
///
/// States are ordered; a job only moves forward through them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContainerState {
    /// The job has been submitted but its pods are not yet bound to nodes.
    Assigned,
    /// The pods are pulling their images.
    Pulling,
    /// The pods are bound and starting.
    Starting,
    /// Every pod is running.
    Running,
    /// The job has stopped.
    Terminated,
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Assigned => write!(f, "ASSIGNED"),
            Self::Pulling => write!(f, "PULLING"),
            Self::Starting => write!(f, "STARTING"),
            Self::Running => write!(f, "RUNNING"),
            Self::Terminated => write!(f, "TERMINATED"),
        }
    }
}

/// The reason a job (or one of its pods) stopped.
///
/// The default value is a successful exit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExitReason {
    /// The exit code.
    pub code: i32,
    /// The exit message.
    pub message: String,
    /// The kind of failure, if known.
    pub failure_type: Option<FailureType>,
}

impl ExitReason {
    /// Constructs an exit reason with only a message.
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    /// Constructs a task error with the given message.
    pub fn task_error(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            failure_type: Some(FailureType::TaskError),
            ..Default::default()
        }
    }

    /// Determines if the reason is a successful exit.
    pub fn is_success(&self) -> bool {
        *self == Self::default()
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{msg} (code {code})", msg = self.message, code = self.code)
    }
}

/// Information about a pod of a job bound to a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodNodeInfo {
    /// The name of the node the pod is bound to.
    pub node_name: String,
    /// The number of slots the pod uses.
    pub num_slots: usize,
    /// The kind of slots the pod uses.
    pub slot_type: SlotType,
    /// The container identifier of the job.
    pub container_id: String,
    /// The coarse state of the job.
    pub state: ContainerState,
}

/// The mutable state of a job.
#[derive(Debug)]
struct JobState {
    /// The coarse state of the job.
    container: ContainerState,
    /// The latched exit cause.
    exit: Option<ExitReason>,
    /// The last observed state of each pod.
    pods: HashMap<String, ContainerState>,
    /// The node each pod is bound to.
    nodes: HashMap<String, String>,
    /// Whether each pod has been scheduled.
    scheduled: HashMap<String, bool>,
    /// Pods whose deletion has been requested.
    kill_sent: HashSet<String>,
    /// Pods whose exit has been observed.
    exits: HashSet<String>,
    /// Pods with a log streamer.
    streaming: HashSet<String>,
    /// Whether the pulling and starting events were sent.
    sent_starting: bool,
    /// Whether the running event was sent.
    sent_running: bool,
    /// Whether the stopped event was sent.
    sent_termination: bool,
}

impl Default for JobState {
    fn default() -> Self {
        Self {
            container: ContainerState::Assigned,
            exit: None,
            pods: Default::default(),
            nodes: Default::default(),
            scheduled: Default::default(),
            kill_sent: Default::default(),
            exits: Default::default(),
            streaming: Default::default(),
            sent_starting: false,
            sent_running: false,
            sent_termination: false,
        }
    }
}

impl JobState {
    /// Latches the exit cause unless one is already set.
    fn latch(&mut self, reason: ExitReason) {
        if self.exit.is_none() {
            self.exit = Some(reason);
        }
    }

    /// Determines if every pod of the job has been observed at or beyond the
    /// given state.
    fn all_pods_at_least(&self, num_pods: usize, state: ContainerState) -> bool {
        self.pods.len() == num_pods && self.pods.values().all(|s| *s >= state)
    }

    /// Converts the latched exit cause into a failure.
    ///
    /// Returns `None` for a successful exit.
    fn failure(&self) -> Option<ResourcesFailure> {
        let exit = self.exit.as_ref().filter(|e| !e.is_success())?;
        Some(ResourcesFailure {
            failure_type: exit.failure_type.unwrap_or(FailureType::ResourcesFailed),
            message: exit.message.clone(),
            exit_code: (exit.code > 0).then_some(exit.code),
        })
    }
}

/// A job backing an allocation.
pub struct Job {
    /// The name of the batch job.
    name: String,
    /// The name of the config map holding the task files.
    config_map_name: String,
    /// The namespace of the job.
    namespace: String,
    /// The allocation the job belongs to.
    allocation_id: AllocationId,
    /// The container identifier reported in events.
    container_id: String,
    /// The number of pods the job runs.
    num_pods: usize,
    /// The number of slots each pod uses.
    slots_per_pod: usize,
    /// The kind of slots the pods use.
    slot_type: SlotType,
    /// The cluster used to stream pod logs.
    cluster: Arc<dyn Cluster>,
    /// The queue used to create and delete Kubernetes objects.
    queue: RequestQueue,
    /// The bus events are published on.
    events: ResourcesEventBus,
    /// Whether deletion of the job's objects has been requested.
    resources_deleted: AtomicBool,
    /// Cancels the job's log streamers.
    log_streams: CancellationToken,
    /// The mutable state of the job.
    state: Mutex<JobState>,
}

#[bon::bon]
impl Job {
    /// Constructs a new job.
    ///
    /// The config map shares the name of the job.
    #[builder]
    pub fn new(
        #[builder(into)] name: String,
        #[builder(into)] namespace: String,
        allocation_id: AllocationId,
        #[builder(into)] container_id: String,
        num_pods: usize,
        slots_per_pod: usize,
        slot_type: SlotType,
        cluster: Arc<dyn Cluster>,
        queue: RequestQueue,
        events: ResourcesEventBus,
    ) -> Self {
        Self {
            config_map_name: name.clone(),
            name,
            namespace,
            allocation_id,
            container_id,
            num_pods,
            slots_per_pod,
            slot_type,
            cluster,
            queue,
            events,
            resources_deleted: AtomicBool::new(false),
            log_streams: CancellationToken::new(),
            state: Mutex::new(JobState::default()),
        }
    }
}

impl Job {
    /// Gets the name of the batch job.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Gets the namespace of the job.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Gets the allocation the job belongs to.
    pub fn allocation_id(&self) -> &AllocationId {
        &self.allocation_id
    }

    /// Gets the number of pods the job runs.
    pub fn num_pods(&self) -> usize {
        self.num_pods
    }

    /// Gets the coarse state of the job.
    pub fn state(&self) -> ContainerState {
        self.lock().container
    }

    /// Locks the mutable state of the job.
    fn lock(&self) -> MutexGuard<'_, JobState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Submits the job's Kubernetes objects to the request queue.
    pub fn submit(&self, job: KubeJob, config_map: ConfigMap) -> OrchestrationResult<()> {
        info!(
            "submitting job `{name}` for allocation `{id}`",
            name = self.name,
            id = self.allocation_id
        );
        self.queue.create_kubernetes_resources(job, config_map)
    }

    /// Handles an update of the batch job.
    ///
    /// Returns the coarse state of the job after the update.
    pub fn job_updated(&self, job: &KubeJob) -> ContainerState {
        let mut state = self.lock();
        if state.container == ContainerState::Terminated {
            return state.container;
        }

        let conditions = job
            .status
            .as_ref()
            .and_then(|s| s.conditions.as_deref())
            .unwrap_or_default();

        for condition in conditions.iter().filter(|c| c.status == "True") {
            match condition.type_.as_str() {
                "Complete" => {
                    state.latch(ExitReason::default());
                    info!(
                        "job `{name}` completed and transitioned from {from} to {to}",
                        name = self.name,
                        from = state.container,
                        to = ContainerState::Terminated
                    );
                }
                "Failed" => {
                    state.latch(ExitReason::message(format!(
                        "job exited with a failure but we don't have pod-level detail: {msg}",
                        msg = condition.message.as_deref().unwrap_or_default()
                    )));
                    info!(
                        "job `{name}` failed and transitioned from {from} to {to}",
                        name = self.name,
                        from = state.container,
                        to = ContainerState::Terminated
                    );
                }
                _ => continue,
            }

            state.container = ContainerState::Terminated;
            self.send_stopped(&mut state);
            break;
        }

        state.container
    }

    /// Handles an unexpected deletion of the batch job.
    pub fn job_deleted(&self) {
        let mut state = self.lock();
        if state.container == ContainerState::Terminated {
            return;
        }

        info!("job `{name}` was deleted", name = self.name);
        state.latch(ExitReason::message("job was deleted"));
        state.container = ContainerState::Terminated;
        self.send_stopped(&mut state);
    }

    /// Handles an update of one of the job's pods.
    ///
    /// Returns an error if the pod's state cannot be interpreted; the update
    /// is then ignored.
    pub fn pod_updated(&self, pod: &Pod) -> Result<()> {
        let name = pod.name_any();
        let pod_state = pod.container_state()?;

        let mut state = self.lock();
        state.pods.insert(name.clone(), pod_state);
        state.nodes.insert(
            name.clone(),
            pod.node_name().unwrap_or_default().to_string(),
        );
        state.scheduled.insert(name.clone(), pod.is_scheduled());

        if let Some(message) = pod.image_pull_back_off() {
            state.latch(ExitReason::message(
                "job was stuck due to unrecoverable image pull errors",
            ));
            info!("pod `{name}` cannot pull its image: {message}");
            self.kill();
        }

        if state.all_pods_at_least(self.num_pods, ContainerState::Starting) && !state.sent_starting
        {
            info!("pod `{name}` is pulling images and starting");
            state.container = ContainerState::Pulling;
            self.send_state(&state, None);
            state.container = ContainerState::Starting;
            self.send_state(&state, None);
            state.sent_starting = true;
        }

        if pod_state == ContainerState::Running && state.streaming.insert(name.clone()) {
            self.start_log_streamer(&name);
        }

        if state.all_pods_at_least(self.num_pods, ContainerState::Running) && !state.sent_running {
            info!("pod `{name}` is running");
            state.container = ContainerState::Running;
            self.send_state(
                &state,
                Some(ResourcesStarted {
                    native_resources_id: self.name.clone(),
                }),
            );
            state.sent_running = true;
        }

        if pod_state == ContainerState::Terminated && !state.exits.contains(&name) {
            info!("pod `{name}` is terminated");
            let exit = pod.exit_reason()?;
            if !exit.is_success() {
                state.latch(exit.clone());
                info!(
                    "container of pod `{name}` exited with {exit}: cleaning up job `{job}`",
                    job = self.name
                );
                let siblings: Vec<_> = state
                    .pods
                    .keys()
                    .filter(|pod| **pod != name && !state.exits.contains(*pod))
                    .cloned()
                    .collect();
                for pod in siblings {
                    self.kill_pod(&mut state, &pod);
                }
            }

            state.exits.insert(name);
        }

        if state.exits.len() == self.num_pods {
            state.latch(ExitReason::default());
            info!(
                "every container of job `{job}` has exited: cleaning up job",
                job = self.name
            );
            self.kill();
        }

        Ok(())
    }

    /// Handles deletion of one of the job's pods.
    pub fn pod_deleted(&self, pod: &Pod) {
        let name = pod.name_any();
        info!("pod `{name}` was deleted");
        self.lock()
            .latch(ExitReason::task_error(format!("pod {name} deleted")));
    }

    /// Handles a Kubernetes event involving the job or one of its pods.
    pub fn new_event(&self, event: &Event) {
        let text = self.prettify_event_message(event.message.as_deref().unwrap_or_default());
        let message = format!(
            "{kind} {name}: {text}",
            kind = event.involved_object.kind.as_deref().unwrap_or_default(),
            name = event.involved_object.name.as_deref().unwrap_or_default(),
        );

        let timestamp = event
            .metadata
            .creation_timestamp
            .as_ref()
            .map(|t| t.0)
            .unwrap_or_else(Utc::now);

        self.publish_log(timestamp, LogMessage::Aux(message));
    }

    /// Rewrites well-known scheduler messages into readable text.
    fn prettify_event_message(&self, message: &str) -> String {
        const REPLACEMENTS: &[(&str, &str)] = &[
            (
                "pod triggered scale-up",
                "Job requires additional resources, scaling up cluster.",
            ),
            ("Successfully assigned", "Pod resources allocated."),
            ("skip schedule deleting pod", "Deleting unscheduled pod."),
        ];

        if let Some((_, replacement)) = REPLACEMENTS.iter().find(|(k, _)| message.contains(k)) {
            return replacement.to_string();
        }

        if message.contains("nodes are available") {
            let available = message.chars().next().unwrap_or('0');
            let resource = match self.slot_type {
                SlotType::Cpu => "CPU slots",
                SlotType::Cuda => "GPUs",
            };

            return format!(
                "Waiting for resources. {available} {resource} are available, {required} \
                 {resource} required",
                required = self.slots_per_pod
            );
        }

        message.to_string()
    }

    /// Handles selection of the job's pods for preemption.
    pub fn preempt(&self) {
        info!("received preemption command for job `{name}`", name = self.name);
        self.release("preempted by the scheduler", false);
    }

    /// Handles a priority change of the allocation.
    pub fn change_priority(&self) {
        info!(
            "interrupting job `{name}` to change priorities",
            name = self.name
        );
        self.release("priority changed", false);
    }

    /// Handles a queue position change of the allocation.
    pub fn change_position(&self) {
        info!(
            "interrupting job `{name}` to change queue position",
            name = self.name
        );
        self.release("queue position changed", false);
    }

    /// Asks the allocation to release its resources.
    pub fn release(&self, reason: &str, force_kill: bool) {
        self.events.publish(
            self.allocation_id.clone(),
            ResourcesEvent::ReleaseResources(ReleaseResources {
                reason: reason.to_string(),
                force_kill,
            }),
        );
    }

    /// Kills the job at the request of its allocation.
    pub fn kill_external(&self) {
        info!("received request to stop job `{name}`", name = self.name);
        self.lock().latch(ExitReason::message("killed"));
        self.kill();
    }

    /// Requests deletion of the job's objects.
    ///
    /// Only the first call has an effect.
    fn kill(&self) {
        if self
            .resources_deleted
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        info!(
            "requesting to delete Kubernetes resources of job `{name}`",
            name = self.name
        );
        self.queue.delete_kubernetes_resources(DeleteRequest {
            namespace: self.namespace.clone(),
            job_name: Some(self.name.clone()),
            config_map_name: Some(self.config_map_name.clone()),
            pod_name: None,
        });
    }

    /// Requests deletion of a single pod.
    fn kill_pod(&self, state: &mut JobState, pod: &str) {
        if !state.kill_sent.insert(pod.to_string()) {
            return;
        }

        info!("requesting to delete pod `{pod}` of job `{name}`", name = self.name);
        self.queue.delete_kubernetes_resources(DeleteRequest {
            namespace: self.namespace.clone(),
            pod_name: Some(pod.to_string()),
            ..Default::default()
        });
    }

    /// Tears down the job when its owner stops tracking it.
    ///
    /// A job that has not terminated is killed and reported as crashed, so a
    /// stopped event is always sent.
    pub fn finalize(&self) {
        self.log_streams.cancel();

        let mut state = self.lock();
        if state.container != ContainerState::Terminated {
            self.kill();
            warn!(
                "killed job `{name}` after its handler exited unexpectedly",
                name = self.name
            );
            state.container = ContainerState::Terminated;
            state.latch(ExitReason::task_error("job crashed"));
            self.send_stopped(&mut state);
        }
    }

    /// Handles a failure to create the job's objects.
    pub fn receive_creation_failed(&self, error: &kube::Error) {
        error!(
            "failed to create Kubernetes resources of job `{name}`: {error}",
            name = self.name
        );

        self.lock().latch(ExitReason::message(format!(
            "failed to create Kubernetes resources: {error}"
        )));
        self.publish_log(Utc::now(), LogMessage::Aux(error.to_string()));
    }

    /// Handles cancellation of the job's buffered creation.
    pub fn receive_creation_cancelled(&self) {
        info!("creation of job `{name}` was cancelled", name = self.name);
        self.resources_deleted.store(true, Ordering::SeqCst);
    }

    /// Handles a failure to delete one of the job's objects.
    pub fn receive_deletion_failed(&self, error: &kube::Error) {
        error!(
            "failed to delete Kubernetes resources of job `{name}`: {error}",
            name = self.name
        );
    }

    /// Gets the node placement of the job's pods.
    pub fn node_info(&self) -> Vec<PodNodeInfo> {
        let state = self.lock();
        state
            .nodes
            .values()
            .map(|node| PodNodeInfo {
                node_name: node.clone(),
                num_slots: self.slots_per_pod,
                slot_type: self.slot_type,
                container_id: self.container_id.clone(),
                state: state.container,
            })
            .collect()
    }

    /// Rolls up the scheduling state of the job's pods.
    ///
    /// The job is scheduled only once every tracked pod is.
    pub fn scheduling_state(&self) -> SchedulingState {
        let state = self.lock();
        if !state.scheduled.is_empty() && state.scheduled.values().all(|s| *s) {
            SchedulingState::Scheduled
        } else {
            SchedulingState::Queued
        }
    }

    /// Starts log streamers for the running pods of a reattached job.
    pub fn start_log_streamers(&self, pods: &[Pod]) {
        let mut state = self.lock();
        for pod in pods {
            let name = pod.name_any();
            let phase = pod
                .status
                .as_ref()
                .and_then(|s| s.phase.as_deref())
                .unwrap_or_default();

            if phase != "Running" {
                warn!("skipped reattaching log streamer for pod `{name}` in phase `{phase}`");
                continue;
            }

            if state.streaming.insert(name.clone()) {
                self.start_log_streamer(&name);
            }
        }
    }

    /// Spawns a task following the logs of a pod.
    fn start_log_streamer(&self, pod: &str) {
        let cluster = self.cluster.clone();
        let events = self.events.clone();
        let allocation_id = self.allocation_id.clone();
        let container_id = self.container_id.clone();
        let namespace = self.namespace.clone();
        let pod = pod.to_string();
        let cancelled = self.log_streams.clone();

        debug!("starting log streamer for pod `{pod}`");
        tokio::spawn(async move {
            let mut lines = match cluster.pod_logs(&namespace, &pod).await {
                Ok(lines) => lines,
                Err(e) => {
                    warn!("failed to stream logs of pod `{pod}`: {e}");
                    return;
                }
            };

            loop {
                select! {
                    biased;

                    _ = cancelled.cancelled() => break,
                    line = lines.next() => match line {
                        Some(Ok(line)) => {
                            let (timestamp, text) = split_timestamp(&line);
                            events.publish(
                                allocation_id.clone(),
                                ResourcesEvent::ContainerLog(ContainerLog {
                                    container_id: Some(container_id.clone()),
                                    timestamp,
                                    message: LogMessage::Stdout(text.to_string()),
                                }),
                            );
                        }
                        Some(Err(e)) => {
                            warn!("log stream of pod `{pod}` failed: {e}");
                            break;
                        }
                        None => break,
                    }
                }
            }

            debug!("log streamer for pod `{pod}` has stopped");
        });
    }

    /// Publishes a log line for the job.
    fn publish_log(&self, timestamp: DateTime<Utc>, message: LogMessage) {
        self.events.publish(
            self.allocation_id.clone(),
            ResourcesEvent::ContainerLog(ContainerLog {
                container_id: Some(self.container_id.clone()),
                timestamp,
                message,
            }),
        );
    }

    /// Publishes the coarse state of the job.
    fn send_state(&self, state: &JobState, started: Option<ResourcesStarted>) {
        self.events.publish(
            self.allocation_id.clone(),
            ResourcesEvent::StateChanged(ResourcesStateChanged {
                resources_id: self.container_id.clone(),
                state: state.container,
                started,
                stopped: None,
            }),
        );
    }

    /// Publishes the stopped event.
    ///
    /// Only the first call has an effect.
    fn send_stopped(&self, state: &mut JobState) {
        if state.sent_termination {
            return;
        }

        self.events.publish(
            self.allocation_id.clone(),
            ResourcesEvent::StateChanged(ResourcesStateChanged {
                resources_id: self.container_id.clone(),
                state: state.container,
                started: None,
                stopped: Some(ResourcesStopped {
                    failure: state.failure(),
                }),
            }),
        );
        state.sent_termination = true;
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("name", &self.name)
            .field("namespace", &self.namespace)
            .field("allocation_id", &self.allocation_id)
            .field("num_pods", &self.num_pods)
            .finish_non_exhaustive()
    }
}

/// Splits the RFC 3339 timestamp Kubernetes prefixes to log lines.
///
/// Lines without a timestamp are stamped with the current time.
fn split_timestamp(line: &str) -> (DateTime<Utc>, &str) {
    line.split_once(' ')
        .and_then(|(ts, rest)| {
            DateTime::parse_from_rfc3339(ts)
                .ok()
                .map(|ts| (ts.with_timezone(&Utc), rest))
        })
        .unwrap_or_else(|| (Utc::now(), line))
}
