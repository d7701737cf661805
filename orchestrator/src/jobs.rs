//! Implementation of the jobs service.
//!
//! The jobs service is the single owner of every live [`Job`]. It routes
//! informer events and request queue failures to the job they concern, keeps
//! the allocation, job and resource pool mappings, and accounts for the
//! cluster's nodes and slots.
//!
//! Every operation holds the service lock for its duration, which serializes
//! all mutation of the service's state and all deliveries to jobs.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use k8s_openapi::api::batch::v1::Job as KubeJob;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::api::core::v1::Event;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::api::core::v1::Pod;
use kube::Client;
use kube::ResourceExt;
use kube::core::ErrorResponse;
use kuberm_db::AllocationId;
use kuberm_db::Database;
use serde::Deserialize;
use serde::Serialize;
use tokio::select;
use tokio::sync::Mutex;
use tokio::sync::MutexGuard;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::cluster::Cluster;
use crate::cluster::Selector;
use crate::config::JobsConfig;
use crate::config::DEFAULT_NAMESPACE;
use crate::error::Error;
use crate::error::OrchestrationResult;
use crate::events::ResourcesEventBus;
use crate::events::SchedulingStateUpdate;
use crate::informer::ClusterEvent;
use crate::informer::Informer;
use crate::informer::InformerEvent;
use crate::informer::KubeListWatch;
use crate::job::ContainerState;
use crate::job::Job;
use crate::labels::ALLOCATION_ID_LABEL;
use crate::labels::DETERMINED_LABEL;
use crate::labels::DETERMINED_PREEMPTION_LABEL;
use crate::labels::DETERMINED_SYSTEM_LABEL;
use crate::labels::KUBERNETES_JOB_NAME_LABEL;
use crate::labels::NO_EXECUTE_NODE_LABEL_VALUE;
use crate::labels::NO_SCHEDULE_NODE_LABEL_VALUE;
use crate::labels::RESOURCE_POOL_LABEL;
use crate::labels::allocation_selector;
use crate::labels::cluster_id_node_label;
use crate::labels::priority_class_name;
use crate::pod::PodExt;
use crate::request_queue::DeleteRequest;
use crate::request_queue::RequestQueue;
use crate::request_queue::ResourceRequestFailure;
use crate::spec::DEFAULT_PRIORITY_CLASS;
use crate::spec::JobTemplate;
use crate::spec::StartJobRequest;
use crate::spec::TaskSpec;
use crate::spec::priority_class;
use crate::spec::unique_name;
use crate::summary::AgentSummary;
use crate::summary::ClusterView;
use crate::summary::SlotSummary;
use crate::summary::num_slots;
use crate::summary::pool_mapping;
use crate::summary::quantity_millis;
use crate::summary::slot_id;
use crate::summary::summarize_pools;

/// How long agent listings are cached for.
const AGENTS_CACHE_DURATION: Duration = Duration::from_secs(15);

/// How long resource pool summaries are cached for.
const SUMMARY_CACHE_DURATION: Duration = Duration::from_secs(5);

/// The reason given to allocations on a node disabled without draining.
const NODE_DISABLED_REASON: &str = "node disabled without drain";

/// A request to resume tracking an allocation whose job outlived a previous
/// instance of the resource manager.
#[derive(Debug, Clone, Deserialize)]
pub struct ReattachJobRequest {
    /// The allocation to reattach.
    pub allocation_id: AllocationId,
    /// The number of slots each pod uses.
    pub slots_per_pod: usize,
    /// The number of pods of the job.
    #[serde(default = "default_num_pods")]
    pub num_pods: usize,
}

/// Gets the default number of pods of a reattached job.
fn default_num_pods() -> usize {
    1
}

/// A summary of a resource pool's compute usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ComputeUsageSummary {
    /// The number of agents summarized.
    pub num_agents_used: usize,
    /// The number of slots available.
    pub slots_available: usize,
}

/// A cached value.
#[derive(Debug)]
struct Cached<T> {
    /// When the value was computed.
    at: Instant,
    /// The value.
    value: T,
}

impl<T: Clone> Cached<T> {
    /// Gets the value if it is younger than the given duration.
    fn fresh(cached: &Option<Self>, duration: Duration) -> Option<T> {
        cached
            .as_ref()
            .filter(|c| c.at.elapsed() <= duration)
            .map(|c| c.value.clone())
    }
}

/// The state guarded by the service lock.
#[derive(Default)]
struct ServiceState {
    /// The live jobs, keyed by job name.
    jobs: HashMap<String, Arc<Job>>,
    /// The resource pool of each job, keyed by job name.
    pools: HashMap<String, String>,
    /// The job name of each allocation.
    allocations: HashMap<AllocationId, String>,
    /// The current nodes, keyed by name.
    nodes: BTreeMap<String, Node>,
    /// The CPU millicores requested by system pods, keyed by node name.
    system_reservations: HashMap<String, i64>,
    /// The cached agent listing.
    agents: Option<Cached<Vec<AgentSummary>>>,
    /// The cached resource pool summaries.
    summary: Option<Cached<BTreeMap<String, AgentSummary>>>,
}

impl ServiceState {
    /// Gets the job of an allocation.
    fn job_for(&self, id: &AllocationId) -> OrchestrationResult<Arc<Job>> {
        self.allocations
            .get(id)
            .and_then(|name| self.jobs.get(name))
            .cloned()
            .ok_or_else(|| Error::UnknownAllocation(id.clone()))
    }

    /// Registers a job.
    fn register(&mut self, job: Arc<Job>, pool: String) {
        let name = job.name().to_string();
        self.allocations
            .insert(job.allocation_id().clone(), name.clone());
        self.pools.insert(name.clone(), pool);
        self.jobs.insert(name, job);
    }

    /// Counts the pods of the jobs in each resource pool.
    fn pods_per_pool(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for (name, pool) in &self.pools {
            match self.jobs.get(name) {
                Some(job) => *counts.entry(pool.clone()).or_default() += job.num_pods(),
                None => error!("job `{name}` has a resource pool but is not registered"),
            }
        }

        counts
    }
}

/// The shared state of the jobs service.
struct Inner {
    /// The service configuration.
    config: JobsConfig,
    /// The Kubernetes API.
    cluster: Arc<dyn Cluster>,
    /// The queue creating and deleting the jobs' objects.
    queue: RequestQueue,
    /// The bus job events are published on.
    events: ResourcesEventBus,
    /// Receives the scheduling state of jobs whenever a pod changes.
    scheduling: Option<mpsc::UnboundedSender<SchedulingStateUpdate>>,
    /// When the service started; reported as the registration time of pools.
    started: DateTime<Utc>,
    /// Shuts down the service's background tasks.
    shutdown: CancellationToken,
    /// The service's background tasks.
    handles: std::sync::Mutex<Vec<JoinHandle<()>>>,
    /// The state guarded by the service lock.
    state: Mutex<ServiceState>,
}

/// Runs allocations as Kubernetes jobs.
///
/// The service is a cheap handle; clones share the same state.
#[derive(Clone)]
pub struct JobsService {
    /// The shared state.
    inner: Arc<Inner>,
}

#[bon::bon]
impl JobsService {
    /// Constructs a new jobs service.
    ///
    /// This spawns the request queue workers and the task routing request
    /// failures to jobs.
    #[builder]
    pub fn new(
        config: JobsConfig,
        cluster: Arc<dyn Cluster>,
        events: ResourcesEventBus,
        scheduling: Option<mpsc::UnboundedSender<SchedulingStateUpdate>>,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let (failures_tx, failures_rx) = mpsc::unbounded_channel();
        let (queue, handles) = RequestQueue::spawn(
            cluster.clone(),
            config.request_queue_workers,
            failures_tx,
            shutdown.clone(),
        );

        let service = Self {
            inner: Arc::new(Inner {
                config,
                cluster,
                queue,
                events,
                scheduling,
                started: Utc::now(),
                shutdown,
                handles: std::sync::Mutex::new(handles),
                state: Mutex::new(ServiceState::default()),
            }),
        };

        let handle = tokio::spawn(service.clone().route_failures(failures_rx));
        service.track(handle);
        service
    }
}

impl JobsService {
    /// Gets the service configuration.
    pub fn config(&self) -> &JobsConfig {
        &self.inner.config
    }

    /// Gets the namespace jobs are created in when a request names none.
    fn default_namespace(&self) -> &str {
        self.inner
            .config
            .namespaces
            .first()
            .map(String::as_str)
            .unwrap_or(DEFAULT_NAMESPACE)
    }

    /// Determines if a namespace is managed by the resource manager.
    fn is_managed(&self, namespace: Option<&str>) -> bool {
        let namespace = namespace.unwrap_or(DEFAULT_NAMESPACE);
        self.inner.config.namespaces.iter().any(|n| n == namespace)
    }

    /// Locks the service state.
    async fn lock(&self) -> MutexGuard<'_, ServiceState> {
        self.inner.state.lock().await
    }

    /// Keeps the handle of a background task.
    fn track(&self, handle: JoinHandle<()>) {
        self.inner
            .handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);
    }

    /// Deletes the Kubernetes objects left behind by allocations that are no
    /// longer open.
    ///
    /// Jobs missing the resource pool or allocation labels are deleted too;
    /// config maps are deleted unless their job is kept.
    pub async fn reconcile(&self, database: &dyn Database) -> OrchestrationResult<()> {
        let _state = self.lock().await;

        let open = database.open_allocation_ids().await?;
        info!("found {count} open allocation(s)", count = open.len());

        let selector = Selector::labels(DETERMINED_LABEL);
        let mut doomed_jobs = Vec::new();
        let mut kept = HashSet::new();

        for job in self.inner.cluster.list_jobs(&selector).await? {
            if !self.is_managed(job.namespace().as_deref()) {
                continue;
            }

            let name = job.name_any();
            let labels = job.labels();
            if labels
                .get(RESOURCE_POOL_LABEL)
                .is_none_or(|p| p.is_empty())
            {
                warn!("deleting job `{name}` without a resource pool label");
                doomed_jobs.push(job);
                continue;
            }

            let Some(id) = labels.get(ALLOCATION_ID_LABEL).filter(|id| !id.is_empty()) else {
                warn!("deleting job `{name}` without an allocation label");
                doomed_jobs.push(job);
                continue;
            };

            if !open.contains(id.as_str()) {
                warn!("deleting job `{name}`: allocation `{id}` is not open");
                doomed_jobs.push(job);
                continue;
            }

            kept.insert(name);
        }

        let mut doomed_config_maps = Vec::new();
        for config_map in self.inner.cluster.list_config_maps(&selector).await? {
            // Config maps share the name of their job
            if !self.is_managed(config_map.namespace().as_deref())
                || kept.contains(&config_map.name_any())
            {
                continue;
            }

            debug!(
                "deleting config map `{name}`: no job using it will be restored",
                name = config_map.name_any()
            );
            doomed_config_maps.push(config_map);
        }

        self.delete_resources(&doomed_jobs, &doomed_config_maps);
        Ok(())
    }

    /// Records the CPU requested by system pods on each node.
    ///
    /// CPU slots are counted after subtracting these reservations.
    pub async fn load_system_reservations(&self) -> OrchestrationResult<()> {
        let mut state = self.lock().await;
        let pods = self
            .inner
            .cluster
            .list_pods(&Selector::labels(DETERMINED_SYSTEM_LABEL))
            .await?;

        let default = self.default_namespace();
        let mut reservations: HashMap<String, i64> = HashMap::new();
        for pod in pods
            .iter()
            .filter(|p| p.namespace().as_deref().unwrap_or(DEFAULT_NAMESPACE) == default)
        {
            let node = pod.node_name().unwrap_or_default().to_string();
            let millis: i64 = pod
                .spec
                .iter()
                .flat_map(|s| s.containers.iter())
                .filter_map(|c| c.resources.as_ref()?.requests.as_ref()?.get("cpu"))
                .filter_map(quantity_millis)
                .sum();

            *reservations.entry(node).or_default() += millis;
        }

        state.system_reservations = reservations;
        Ok(())
    }

    /// Starts the informers feeding the service.
    ///
    /// Nodes are watched cluster-wide; pods, jobs, events and preemption
    /// signals are watched in every managed namespace.
    pub fn start_informers(&self, client: Client) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = &self.inner.shutdown;

        self.track(
            Informer::new(
                "node",
                Arc::new(KubeListWatch::<Node>::all(client.clone(), None)),
                ClusterEvent::Node,
                tx.clone(),
            )
            .spawn(shutdown.clone()),
        );

        for namespace in &self.inner.config.namespaces {
            self.track(
                Informer::new(
                    format!("pod ({namespace})"),
                    Arc::new(KubeListWatch::<Pod>::namespaced(
                        client.clone(),
                        namespace,
                        Some(DETERMINED_LABEL),
                    )),
                    ClusterEvent::Pod,
                    tx.clone(),
                )
                .spawn(shutdown.clone()),
            );

            self.track(
                Informer::new(
                    format!("preemption ({namespace})"),
                    Arc::new(KubeListWatch::<Pod>::namespaced(
                        client.clone(),
                        namespace,
                        Some(DETERMINED_PREEMPTION_LABEL),
                    )),
                    ClusterEvent::Preemption,
                    tx.clone(),
                )
                .spawn(shutdown.clone()),
            );

            self.track(
                Informer::new(
                    format!("job ({namespace})"),
                    Arc::new(KubeListWatch::<KubeJob>::namespaced(
                        client.clone(),
                        namespace,
                        Some(DETERMINED_LABEL),
                    )),
                    ClusterEvent::Job,
                    tx.clone(),
                )
                .spawn(shutdown.clone()),
            );

            self.track(
                Informer::new(
                    format!("event ({namespace})"),
                    Arc::new(KubeListWatch::<Event>::namespaced(
                        client.clone(),
                        namespace,
                        None,
                    )),
                    ClusterEvent::Event,
                    tx.clone(),
                )
                .spawn(shutdown.clone()),
            );
        }

        drop(tx);
        let service = self.clone();
        self.track(tokio::spawn(async move {
            let mut rx = rx;
            while let Some(event) = rx.recv().await {
                service.handle_event(event).await;
            }
        }));
    }

    /// Handles a change to a watched object.
    ///
    /// Changes to objects no registered job owns are dropped.
    pub async fn handle_event(&self, event: ClusterEvent) {
        let mut state = self.lock().await;
        match event {
            ClusterEvent::Job(InformerEvent::Added(job) | InformerEvent::Modified(job)) => {
                self.job_updated(&mut state, &job);
            }
            ClusterEvent::Job(InformerEvent::Deleted(job)) => self.job_deleted(&mut state, &job),
            ClusterEvent::Pod(InformerEvent::Added(pod) | InformerEvent::Modified(pod)) => {
                self.pod_updated(&state, &pod);
            }
            ClusterEvent::Pod(InformerEvent::Deleted(pod)) => self.pod_deleted(&state, &pod),
            ClusterEvent::Preemption(
                InformerEvent::Added(pod) | InformerEvent::Modified(pod),
            ) => self.preempt(&state, &pod),
            ClusterEvent::Preemption(InformerEvent::Deleted(_)) => {}
            ClusterEvent::Node(InformerEvent::Added(node) | InformerEvent::Modified(node)) => {
                debug!("node `{name}` was added or updated", name = node.name_any());
                state.nodes.insert(node.name_any(), node);
            }
            ClusterEvent::Node(InformerEvent::Deleted(node)) => {
                debug!("node `{name}` was deleted", name = node.name_any());
                state.nodes.remove(&node.name_any());
            }
            ClusterEvent::Event(InformerEvent::Added(event) | InformerEvent::Modified(event)) => {
                self.new_event(&state, &event);
            }
            ClusterEvent::Event(InformerEvent::Deleted(_)) => {}
        }
    }

    /// Delivers a batch job update to its job.
    fn job_updated(&self, state: &mut ServiceState, job: &KubeJob) {
        let name = job.name_any();
        let Some(handler) = state.jobs.get(&name).cloned() else {
            debug!("received update of unregistered job `{name}`");
            return;
        };

        if handler.job_updated(job) == ContainerState::Terminated {
            self.clean_up(state, &handler);
        }
    }

    /// Delivers a batch job deletion to its job.
    fn job_deleted(&self, state: &mut ServiceState, job: &KubeJob) {
        let name = job.name_any();
        let Some(handler) = state.jobs.get(&name).cloned() else {
            debug!("received deletion of unregistered job `{name}`");
            return;
        };

        handler.job_deleted();
        self.clean_up(state, &handler);
    }

    /// Delivers a pod update to its job and reports the job's scheduling
    /// state.
    fn pod_updated(&self, state: &ServiceState, pod: &Pod) {
        let name = pod.name_any();
        let Some(job_name) = pod.labels().get(KUBERNETES_JOB_NAME_LABEL) else {
            debug!("received update of pod `{name}` without a job name label");
            return;
        };

        let Some(job) = state.jobs.get(job_name) else {
            debug!("received update of pod `{name}` of unregistered job `{job_name}`");
            return;
        };

        if let Err(e) = job.pod_updated(pod) {
            error!("failed to process update of pod `{name}`: {e:#}");
            return;
        }

        if let Some(scheduling) = &self.inner.scheduling {
            scheduling
                .send(SchedulingStateUpdate {
                    allocation_id: job.allocation_id().clone(),
                    num_pods: job.num_pods(),
                    state: job.scheduling_state(),
                })
                .ok();
        }
    }

    /// Delivers a pod deletion to its job.
    fn pod_deleted(&self, state: &ServiceState, pod: &Pod) {
        let name = pod.name_any();
        let Some(job_name) = pod.labels().get(KUBERNETES_JOB_NAME_LABEL) else {
            debug!("received deletion of pod `{name}` without a job name label");
            return;
        };

        match state.jobs.get(job_name) {
            Some(job) => job.pod_deleted(pod),
            None => debug!("received deletion of pod `{name}` of unregistered job `{job_name}`"),
        }
    }

    /// Delivers a preemption signal to the job of a pod.
    fn preempt(&self, state: &ServiceState, pod: &Pod) {
        let job_name = pod.job_name();
        match state.jobs.get(&job_name) {
            Some(job) => job.preempt(),
            None => debug!("received preemption of unregistered job `{job_name}`"),
        }
    }

    /// Delivers a Kubernetes event to the job it involves.
    fn new_event(&self, state: &ServiceState, event: &Event) {
        let involved = &event.involved_object;
        let name = involved.name.as_deref().unwrap_or_default();

        let job_name = match involved.kind.as_deref() {
            // Pods are named after their job with a random suffix
            Some("Pod") => match name.rsplit_once('-') {
                Some((job_name, _)) => job_name,
                None => return,
            },
            Some("Job") => name,
            _ => return,
        };

        match state.jobs.get(job_name) {
            Some(job) => job.new_event(event),
            None => debug!("received event for unregistered job `{job_name}`"),
        }
    }

    /// Routes request queue failures to the jobs that issued the requests.
    async fn route_failures(self, mut failures: mpsc::UnboundedReceiver<ResourceRequestFailure>) {
        loop {
            select! {
                biased;

                _ = self.inner.shutdown.cancelled() => break,
                failure = failures.recv() => match failure {
                    Some(failure) => self.handle_failure(failure).await,
                    None => break,
                },
            }
        }
    }

    /// Handles a failed request of a job; the job is then cleaned up.
    async fn handle_failure(&self, failure: ResourceRequestFailure) {
        let mut state = self.lock().await;
        let name = failure.name();
        let Some(job) = state.jobs.get(name).cloned() else {
            warn!("received resource request failure for unregistered job `{name}`");
            return;
        };

        match &failure {
            ResourceRequestFailure::CreationFailed { error, .. } => {
                job.receive_creation_failed(error)
            }
            ResourceRequestFailure::CreationCancelled { .. } => job.receive_creation_cancelled(),
            ResourceRequestFailure::DeletionFailed { error, .. } => {
                job.receive_deletion_failed(error)
            }
        }

        self.clean_up(&mut state, &job);
    }

    /// Finalizes a job and removes it from the service.
    ///
    /// The allocation's priority class is deleted in the background.
    fn clean_up(&self, state: &mut ServiceState, job: &Arc<Job>) {
        job.finalize();

        let name = job.name();
        info!("de-registering job `{name}`");
        state.jobs.remove(name);
        state.pools.remove(name);
        if state
            .allocations
            .get(job.allocation_id())
            .is_some_and(|n| n == name)
        {
            state.allocations.remove(job.allocation_id());
        }

        self.delete_priority_class(priority_class_name(job.allocation_id()));
    }

    /// Deletes a priority class in the background.
    ///
    /// A class that does not exist is not an error.
    fn delete_priority_class(&self, class: String) {
        let cluster = self.inner.cluster.clone();
        tokio::spawn(async move {
            match cluster.delete_priority_class(&class).await {
                Ok(()) | Err(kube::Error::Api(ErrorResponse { code: 404, .. })) => {}
                Err(e) => warn!("failed to delete priority class `{class}`: {e}"),
            }
        });
    }

    /// Requests deletion of jobs and config maps.
    fn delete_resources(&self, jobs: &[KubeJob], config_maps: &[ConfigMap]) {
        for job in jobs {
            self.inner.queue.delete_kubernetes_resources(DeleteRequest {
                namespace: job.namespace().unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
                job_name: Some(job.name_any()),
                ..Default::default()
            });
        }

        for config_map in config_maps {
            self.inner.queue.delete_kubernetes_resources(DeleteRequest {
                namespace: config_map
                    .namespace()
                    .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
                config_map_name: Some(config_map.name_any()),
                ..Default::default()
            });
        }
    }

    /// Gets the pod customizations for a request.
    ///
    /// The task's own pod spec takes precedence over the defaults of its
    /// resource pool, which take precedence over the global defaults.
    fn pod_customizations<'a>(&'a self, request: &'a StartJobRequest) -> Option<&'a Pod> {
        let slot_type = self.inner.config.slot_type;
        let pools = &self.inner.config.resource_pools;

        request.spec.pod_spec.as_ref().or_else(|| {
            pools
                .resource_pools
                .iter()
                .find(|p| p.pool_name == request.resource_pool)
                .and_then(|p| p.task_container_defaults.as_ref())
                .and_then(|d| d.pod_spec(slot_type))
                .or_else(|| {
                    pools
                        .task_container_defaults
                        .as_ref()
                        .and_then(|d| d.pod_spec(slot_type))
                })
        })
    }

    /// Determines the priority class of a task's pods.
    ///
    /// A task with a priority gets its own priority class; if it cannot be
    /// created, no class is set. Pod specs naming a class are left alone.
    async fn priority_class(&self, spec: &TaskSpec, pod: Option<&Pod>) -> Option<String> {
        let named = pod
            .and_then(|p| p.spec.as_ref())
            .and_then(|s| s.priority_class_name.as_deref())
            .is_some_and(|n| !n.is_empty());
        if named {
            return None;
        }

        let Some(priority) = spec.priority else {
            return Some(DEFAULT_PRIORITY_CLASS.to_string());
        };

        let name = priority_class_name(&spec.allocation_id);
        match self
            .inner
            .cluster
            .create_priority_class(&priority_class(&name, priority))
            .await
        {
            Ok(()) => Some(name),
            Err(e) => {
                warn!("failed to create priority class `{name}`: {e}");
                None
            }
        }
    }

    /// Starts a job for an allocation.
    ///
    /// The job's objects are created asynchronously by the request queue.
    pub async fn start_job(&self, request: StartJobRequest) -> OrchestrationResult<()> {
        let mut state = self.lock().await;
        let config = &self.inner.config;

        let name = unique_name(&config.cluster_id, &request.spec.description);
        if state.jobs.contains_key(&name) {
            return Err(Error::DuplicateJob(name));
        }

        let namespace = request
            .namespace
            .clone()
            .unwrap_or_else(|| self.default_namespace().to_string());
        let pod_spec = self.pod_customizations(&request);
        let priority_class = self.priority_class(&request.spec, pod_spec).await;
        let created_class = priority_class
            .clone()
            .filter(|_| request.spec.priority.is_some());

        let template = JobTemplate {
            name: &name,
            namespace: &namespace,
            cluster_id: &config.cluster_id,
            spec: &request.spec,
            resource_pool: &request.resource_pool,
            slot_type: config.slot_type,
            cpu_per_slot: config.cpu_per_slot,
            slots_per_pod: request.slots_per_pod,
            num_pods: request.num_pods,
            blocked_nodes: &request.blocked_nodes,
            pod_spec,
            priority_class,
        };

        let job = Arc::new(
            Job::builder()
                .name(name.as_str())
                .namespace(namespace.as_str())
                .allocation_id(request.spec.allocation_id.clone())
                .container_id(request.spec.container_id.as_str())
                .num_pods(request.num_pods)
                .slots_per_pod(request.slots_per_pod)
                .slot_type(config.slot_type)
                .cluster(self.inner.cluster.clone())
                .queue(self.inner.queue.clone())
                .events(self.inner.events.clone())
                .build(),
        );

        if let Err(e) = job.submit(template.job(), template.config_map()) {
            if let Some(class) = created_class {
                self.delete_priority_class(class);
            }

            return Err(e);
        }

        state.register(job, request.resource_pool);
        Ok(())
    }

    /// Kills the job of an allocation.
    pub async fn kill_job(&self, id: &AllocationId) -> OrchestrationResult<()> {
        let state = self.lock().await;
        let job = state.job_for(id).inspect_err(|e| debug!("not killing: {e}"))?;
        job.kill_external();
        Ok(())
    }

    /// Asks the allocation to release its resources after a priority change.
    pub async fn change_priority(&self, id: &AllocationId) -> OrchestrationResult<()> {
        let state = self.lock().await;
        let job = state
            .job_for(id)
            .inspect_err(|e| debug!("not changing priority: {e}"))?;
        job.change_priority();
        Ok(())
    }

    /// Asks the allocation to release its resources after a queue position
    /// change.
    pub async fn change_position(&self, id: &AllocationId) -> OrchestrationResult<()> {
        let state = self.lock().await;
        let job = state
            .job_for(id)
            .inspect_err(|e| debug!("not changing position: {e}"))?;
        job.change_position();
        Ok(())
    }

    /// Resumes tracking the live job of an allocation.
    ///
    /// Exactly one job and one config map must carry the allocation's label.
    /// Otherwise, or if the job cannot be adopted, whatever was found is
    /// deleted.
    pub async fn reattach_job(&self, request: ReattachJobRequest) -> OrchestrationResult<()> {
        let mut state = self.lock().await;
        let id = &request.allocation_id;
        let cluster = &self.inner.cluster;
        let selector = Selector::labels(allocation_selector(id));

        let mut problems = Vec::new();
        let jobs = cluster.list_jobs(&selector).await.unwrap_or_else(|e| {
            problems.push(format!("failed to list jobs: {e}"));
            Vec::new()
        });
        let config_maps = cluster.list_config_maps(&selector).await.unwrap_or_else(|e| {
            problems.push(format!("failed to list config maps: {e}"));
            Vec::new()
        });

        if jobs.len() != 1 {
            problems.push(format!("expected one job, found {count}", count = jobs.len()));
        }

        if config_maps.len() != 1 {
            problems.push(format!(
                "expected one config map, found {count}",
                count = config_maps.len()
            ));
        }

        let fail = |reason: String| {
            self.delete_resources(&jobs, &config_maps);
            Err(Error::Reattach {
                allocation_id: id.clone(),
                reason,
            })
        };

        if !problems.is_empty() {
            return fail(problems.join("; "));
        }

        let kube_job = &jobs[0];
        let name = kube_job.name_any();
        if state.jobs.contains_key(&name) {
            return Err(Error::DuplicateJob(name));
        }

        let Some(pool) = kube_job.labels().get(RESOURCE_POOL_LABEL).cloned() else {
            return fail(format!("could not recover the resource pool of job `{name}`"));
        };

        let job = Arc::new(
            Job::builder()
                .name(name.as_str())
                .namespace(
                    kube_job
                        .namespace()
                        .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
                )
                .allocation_id(id.clone())
                .container_id(id.to_string())
                .num_pods(request.num_pods)
                .slots_per_pod(request.slots_per_pod)
                .slot_type(self.inner.config.slot_type)
                .cluster(cluster.clone())
                .queue(self.inner.queue.clone())
                .events(self.inner.events.clone())
                .build(),
        );

        let pods = match cluster.list_pods(&selector).await {
            Ok(pods) => pods,
            Err(e) => return fail(format!("failed to list pods of job `{name}`: {e}")),
        };

        job.start_log_streamers(&pods);
        info!("reattached job `{name}` of allocation `{id}`");
        state.register(job, pool);
        Ok(())
    }

    /// Redelivers the current state of an allocation's job and pods.
    pub async fn refresh_states(&self, id: &AllocationId) -> OrchestrationResult<()> {
        if id.as_str().is_empty() {
            return Err(Error::InvalidArgument(
                "an allocation identifier is required".to_string(),
            ));
        }

        let mut state = self.lock().await;
        let selector = Selector::labels(allocation_selector(id));

        for job in self.inner.cluster.list_jobs(&selector).await? {
            if self.is_managed(job.namespace().as_deref()) {
                self.job_updated(&mut state, &job);
            }
        }

        for pod in self.inner.cluster.list_pods(&selector).await? {
            if self.is_managed(pod.namespace().as_deref()) {
                self.pod_updated(&state, &pod);
            }
        }

        Ok(())
    }

    /// Lists bound pods the resource manager does not own.
    async fn foreign_pods(&self) -> kube::Result<Vec<Pod>> {
        let pods = self.inner.cluster.list_pods(&Selector::default()).await?;
        Ok(pods
            .into_iter()
            .filter(|p| {
                let labels = p.labels();
                !labels.contains_key(DETERMINED_LABEL)
                    && !labels.contains_key(DETERMINED_SYSTEM_LABEL)
                    && p.node_name().is_some_and(|n| !n.is_empty())
            })
            .collect())
    }

    /// Summarizes every node.
    async fn node_summaries(&self, state: &ServiceState) -> BTreeMap<String, AgentSummary> {
        let foreign = self.foreign_pods().await.unwrap_or_else(|e| {
            warn!(
                "failed to list pods not owned by the resource manager; slots in use may be \
                 reported as free: {e}"
            );
            Vec::new()
        });

        let config = &self.inner.config;
        ClusterView {
            nodes: &state.nodes,
            pods: state.jobs.values().flat_map(|j| j.node_info()).collect(),
            foreign_pods: &foreign,
            slot_type: config.slot_type,
            cpu_per_slot: config.cpu_per_slot,
            cluster_id: &config.cluster_id,
            system_reservations: &state.system_reservations,
        }
        .summarize_by_nodes()
    }

    /// Summarizes every node, with the resource pools each belongs to.
    async fn agents(&self, state: &ServiceState) -> BTreeMap<String, AgentSummary> {
        let mut summaries = self.node_summaries(state).await;
        let (_, node_pools) =
            pool_mapping(&state.nodes, &summaries, &self.inner.config.resource_pools);

        for (name, summary) in &mut summaries {
            summary.resource_pools = node_pools.get(name).cloned().unwrap_or_default();
        }

        summaries
    }

    /// Summarizes every resource pool.
    ///
    /// Summaries are cached briefly; they must not be used for decisions that
    /// need current information.
    async fn summarize(&self, state: &mut ServiceState) -> BTreeMap<String, AgentSummary> {
        if let Some(summary) = Cached::fresh(&state.summary, SUMMARY_CACHE_DURATION) {
            return summary;
        }

        let nodes = self.node_summaries(state).await;
        let (pools_to_nodes, _) =
            pool_mapping(&state.nodes, &nodes, &self.inner.config.resource_pools);
        let summary = summarize_pools(
            &nodes,
            &pools_to_nodes,
            &state.pods_per_pool(),
            self.inner.started,
        );

        state.summary = Some(Cached {
            at: Instant::now(),
            value: summary.clone(),
        });
        summary
    }

    /// Summarizes the compute usage of a resource pool, or of every pool.
    pub async fn summarize_resources(
        &self,
        pool: Option<&str>,
    ) -> OrchestrationResult<ComputeUsageSummary> {
        let mut state = self.lock().await;
        let summary = self.summarize(&mut state).await;

        let slots_available = match pool.filter(|p| !p.is_empty()) {
            Some(pool) => summary.get(pool).map(|s| num_slots(&s.slots)).unwrap_or(0),
            None => summary.values().map(|s| num_slots(&s.slots)).sum(),
        };

        Ok(ComputeUsageSummary {
            num_agents_used: summary.len(),
            slots_available,
        })
    }

    /// Gets every agent.
    ///
    /// Listings are cached briefly.
    pub async fn get_agents(&self) -> Vec<AgentSummary> {
        let mut state = self.lock().await;
        if let Some(agents) = Cached::fresh(&state.agents, AGENTS_CACHE_DURATION) {
            return agents;
        }

        let agents: Vec<_> = self.agents(&state).await.into_values().collect();
        state.agents = Some(Cached {
            at: Instant::now(),
            value: agents.clone(),
        });
        agents
    }

    /// Gets an agent.
    pub async fn get_agent(&self, id: &str) -> OrchestrationResult<AgentSummary> {
        let state = self.lock().await;
        self.agent(&state, id).await
    }

    /// Gets an agent from the current state.
    async fn agent(&self, state: &ServiceState, id: &str) -> OrchestrationResult<AgentSummary> {
        self.agents(state).await.remove(id).ok_or_else(|| {
            warn!("no agent with id `{id}`");
            Error::UnknownAgent(id.to_string())
        })
    }

    /// Gets the slots of an agent.
    pub async fn get_slots(&self, agent: &str) -> OrchestrationResult<Vec<SlotSummary>> {
        Ok(self.get_agent(agent).await?.slots.into_values().collect())
    }

    /// Gets a slot of an agent.
    ///
    /// A numeric slot index also matches the zero-padded slot identifier.
    pub async fn get_slot(&self, agent: &str, slot: &str) -> OrchestrationResult<SlotSummary> {
        let mut slots = self.get_agent(agent).await?.slots;
        if let Some(summary) = slots.remove(slot) {
            return Ok(summary);
        }

        slot.parse::<usize>()
            .ok()
            .and_then(|index| slots.remove(&slot_id(index)))
            .ok_or_else(|| {
                warn!("no slot with id `{slot}` on agent `{agent}`");
                Error::UnknownSlot {
                    agent: agent.to_string(),
                    slot: slot.to_string(),
                }
            })
    }

    /// Sets or removes the label disabling a node.
    async fn patch_node(&self, node: &str, value: Option<&str>) -> OrchestrationResult<()> {
        let label = cluster_id_node_label(&self.inner.config.cluster_id);
        match self.inner.cluster.patch_node_label(node, &label, value).await {
            Ok(()) => Ok(()),
            Err(kube::Error::Api(ErrorResponse { code: 403, .. })) => {
                Err(Error::NodePatchForbidden)
            }
            Err(e) => {
                error!("failed to patch label `{label}` of node `{node}`: {e}");
                Err(e.into())
            }
        }
    }

    /// Enables scheduling on a node.
    pub async fn enable_agent(&self, node: &str) -> OrchestrationResult<AgentSummary> {
        let state = self.lock().await;
        self.patch_node(node, None).await?;
        info!("node `{node}` was enabled");

        let mut agent = self.agent(&state, node).await?;
        set_schedulable(&mut agent, true, false);
        Ok(agent)
    }

    /// Disables scheduling on a node.
    ///
    /// A drained node keeps its running allocations; otherwise every
    /// allocation on the node is asked to release its resources immediately.
    pub async fn disable_agent(&self, node: &str, drain: bool) -> OrchestrationResult<AgentSummary> {
        let state = self.lock().await;
        let value = if drain {
            NO_SCHEDULE_NODE_LABEL_VALUE
        } else {
            NO_EXECUTE_NODE_LABEL_VALUE
        };

        self.patch_node(node, Some(value)).await?;
        info!("node `{node}` was disabled");

        if !drain {
            self.release_allocations_on_node(&state, node).await?;
        }

        let mut agent = self.agent(&state, node).await?;
        set_schedulable(&mut agent, false, drain);
        Ok(agent)
    }

    /// Asks every allocation with a pod on a node to release its resources.
    async fn release_allocations_on_node(
        &self,
        state: &ServiceState,
        node: &str,
    ) -> OrchestrationResult<()> {
        let pods = self
            .inner
            .cluster
            .list_pods(&Selector {
                labels: Some(DETERMINED_LABEL.to_string()),
                fields: Some(format!("spec.nodeName={node}")),
            })
            .await?;

        let mut notified = HashSet::new();
        for pod in pods {
            let name = pod.name_any();
            let Some(job_name) = pod.labels().get(KUBERNETES_JOB_NAME_LABEL) else {
                debug!("found pod `{name}` without a job name label on disabled node `{node}`");
                continue;
            };

            let Some(job) = state.jobs.get(job_name) else {
                warn!("found pod `{name}` of unregistered job `{job_name}` on disabled node `{node}`");
                continue;
            };

            if notified.insert(job.allocation_id().clone()) {
                info!("stopping pod `{name}` because node `{node}` was disabled without drain");
                job.release(NODE_DISABLED_REASON, true);
            }
        }

        Ok(())
    }

    /// Shuts down the service's background tasks.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let handles = std::mem::take(
            &mut *self
                .inner
                .handles
                .lock()
                .unwrap_or_else(|e| e.into_inner()),
        );

        for handle in handles {
            handle.await.ok();
        }
    }
}

/// Overrides the schedulability of an agent and its slots.
///
/// A patched node label is only observed once the node informer delivers it.
fn set_schedulable(agent: &mut AgentSummary, enabled: bool, draining: bool) {
    agent.enabled = enabled;
    agent.draining = draining;
    for slot in agent.slots.values_mut() {
        slot.enabled = enabled;
        slot.draining = draining;
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::batch::v1::JobCondition;
    use k8s_openapi::api::batch::v1::JobStatus;
    use k8s_openapi::api::core::v1::NodeStatus;
    use k8s_openapi::api::core::v1::ObjectReference;
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use kube::api::ObjectMeta;
    use kuberm_db::DatabaseResult;
    use kuberm_events::Subscription;

    use super::*;
    use crate::events::ResourcesEvent;
    use crate::labels::RESOURCE_TYPE_NVIDIA;
    use crate::testing::Call;
    use crate::testing::FakeCluster;
    use crate::testing::pod;
    use crate::testing::wait_until;

    const CLUSTER_ID: &str = "0123456789abcdef";

    struct OpenAllocations(HashSet<AllocationId>);

    #[async_trait::async_trait]
    impl Database for OpenAllocations {
        async fn open_allocation_ids(&self) -> DatabaseResult<HashSet<AllocationId>> {
            Ok(self.0.clone())
        }
    }

    fn service(cluster: &Arc<FakeCluster>, bus: &ResourcesEventBus) -> JobsService {
        JobsService::builder()
            .config(JobsConfig::builder().cluster_id(CLUSTER_ID).build())
            .cluster(cluster.clone())
            .events(bus.clone())
            .build()
    }

    fn meta(name: &str, labels: &[(&str, &str)]) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            labels: Some(
                labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    fn kube_job(name: &str, allocation: &str) -> KubeJob {
        KubeJob {
            metadata: meta(
                name,
                &[
                    (DETERMINED_LABEL, allocation),
                    (ALLOCATION_ID_LABEL, allocation),
                    (RESOURCE_POOL_LABEL, "default"),
                ],
            ),
            ..Default::default()
        }
    }

    fn config_map(name: &str, allocation: &str) -> ConfigMap {
        ConfigMap {
            metadata: meta(name, &[(DETERMINED_LABEL, allocation)]),
            ..Default::default()
        }
    }

    fn gpu_node(name: &str, gpus: u32) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: None,
            status: Some(NodeStatus {
                allocatable: Some(BTreeMap::from([(
                    RESOURCE_TYPE_NVIDIA.to_string(),
                    Quantity(gpus.to_string()),
                )])),
                ..Default::default()
            }),
        }
    }

    fn start_request(allocation: &str, description: &str) -> StartJobRequest {
        StartJobRequest {
            spec: TaskSpec {
                allocation_id: AllocationId::from(allocation),
                container_id: format!("{allocation}-container"),
                description: description.to_string(),
                image: "busybox".to_string(),
                ..Default::default()
            },
            slots_per_pod: 1,
            num_pods: 1,
            resource_pool: "default".to_string(),
            namespace: None,
            blocked_nodes: Vec::new(),
        }
    }

    fn complete(mut job: KubeJob) -> KubeJob {
        job.status = Some(JobStatus {
            conditions: Some(vec![JobCondition {
                type_: "Complete".to_string(),
                status: "True".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        });
        job
    }

    async fn next_event(events: &mut Subscription<AllocationId, ResourcesEvent>) -> ResourcesEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("an event should be published")
            .expect("the subscription should be open")
    }

    #[tokio::test]
    async fn reconciliation_deletes_resources_of_closed_allocations() {
        let cluster = FakeCluster::new();
        cluster.add_job(kube_job("job-a", "a"));
        cluster.add_job(kube_job("job-b", "b"));
        cluster.add_config_map(config_map("job-a", "a"));
        cluster.add_config_map(config_map("job-b", "b"));

        let bus = ResourcesEventBus::spawn();
        let service = service(&cluster, &bus);
        service
            .reconcile(&OpenAllocations(HashSet::from([AllocationId::from("a")])))
            .await
            .unwrap();

        wait_until(|| cluster.job_names() == HashSet::from(["job-a".to_string()])).await;
        wait_until(|| cluster.calls().contains(&Call::DeleteConfigMap("job-b".to_string()))).await;

        let calls = cluster.calls();
        assert!(!calls.contains(&Call::DeleteJob("job-a".to_string())));
        assert!(!calls.contains(&Call::DeleteConfigMap("job-a".to_string())));
        service.shutdown().await;
    }

    #[tokio::test]
    async fn reconciliation_deletes_jobs_missing_labels() {
        let cluster = FakeCluster::new();
        cluster.add_job(KubeJob {
            metadata: meta("unlabelled", &[(DETERMINED_LABEL, "a")]),
            ..Default::default()
        });

        let bus = ResourcesEventBus::spawn();
        let service = service(&cluster, &bus);
        service
            .reconcile(&OpenAllocations(HashSet::from([AllocationId::from("a")])))
            .await
            .unwrap();

        wait_until(|| cluster.job_names().is_empty()).await;
        service.shutdown().await;
    }

    #[tokio::test]
    async fn reattaching_requires_exactly_one_job() {
        let cluster = FakeCluster::new();
        let bus = ResourcesEventBus::spawn();
        let service = service(&cluster, &bus);

        let request = |id: &str| ReattachJobRequest {
            allocation_id: AllocationId::from(id),
            slots_per_pod: 1,
            num_pods: 1,
        };

        let error = service.reattach_job(request("missing")).await.unwrap_err();
        assert!(matches!(error, Error::Reattach { .. }));
        assert!(error.to_string().contains("missing"));

        cluster.add_job(kube_job("twin-1", "twin"));
        cluster.add_job(kube_job("twin-2", "twin"));
        cluster.add_config_map(config_map("twin-1", "twin"));

        let error = service.reattach_job(request("twin")).await.unwrap_err();
        assert!(error.to_string().contains("twin"));
        assert!(error.to_string().contains("expected one job, found 2"));

        // Whatever was found is deleted rather than half-adopted
        wait_until(|| cluster.job_names().is_empty()).await;
        service.shutdown().await;
    }

    #[tokio::test]
    async fn a_reattached_job_can_be_killed() {
        let cluster = FakeCluster::new();
        cluster.add_job(kube_job("det-job", "alloc"));
        cluster.add_config_map(config_map("det-job", "alloc"));

        let bus = ResourcesEventBus::spawn();
        let service = service(&cluster, &bus);
        service
            .reattach_job(ReattachJobRequest {
                allocation_id: AllocationId::from("alloc"),
                slots_per_pod: 1,
                num_pods: 1,
            })
            .await
            .unwrap();

        service.kill_job(&AllocationId::from("alloc")).await.unwrap();
        wait_until(|| cluster.calls().contains(&Call::DeleteJob("det-job".to_string()))).await;
        service.shutdown().await;
    }

    #[tokio::test]
    async fn starting_a_job_creates_its_objects_once() {
        let cluster = FakeCluster::new();
        let bus = ResourcesEventBus::spawn();
        let service = service(&cluster, &bus);

        service.start_job(start_request("alloc", "trial-1")).await.unwrap();
        let name = unique_name(CLUSTER_ID, "trial-1");
        wait_until(|| cluster.job_names().contains(&name)).await;

        let calls = cluster.calls();
        assert!(calls.contains(&Call::CreateConfigMap(name.clone())));
        assert!(!calls.iter().any(|c| matches!(c, Call::CreatePriorityClass(_))));

        let error = service
            .start_job(start_request("other", "trial-1"))
            .await
            .unwrap_err();
        assert!(matches!(error, Error::DuplicateJob(n) if n == name));
        service.shutdown().await;
    }

    #[tokio::test]
    async fn completion_cleans_up_the_job() {
        let cluster = FakeCluster::new();
        let bus = ResourcesEventBus::spawn();
        let mut events = bus.subscribe(AllocationId::from("alloc")).await;
        let service = service(&cluster, &bus);

        let mut request = start_request("alloc", "trial-1");
        request.spec.priority = Some(42);
        service.start_job(request).await.unwrap();
        assert!(
            cluster
                .calls()
                .contains(&Call::CreatePriorityClass("alloc-priorityclass".to_string()))
        );

        let name = unique_name(CLUSTER_ID, "trial-1");
        service
            .handle_event(ClusterEvent::Job(InformerEvent::Modified(complete(kube_job(
                &name, "alloc",
            )))))
            .await;

        match next_event(&mut events).await {
            ResourcesEvent::StateChanged(changed) => {
                assert_eq!(changed.state, ContainerState::Terminated);
                assert!(changed.stopped.unwrap().failure.is_none());
            }
            other => panic!("unexpected event {other:?}"),
        }

        assert!(matches!(
            service.kill_job(&AllocationId::from("alloc")).await,
            Err(Error::UnknownAllocation(_))
        ));
        wait_until(|| {
            cluster
                .calls()
                .contains(&Call::DeletePriorityClass("alloc-priorityclass".to_string()))
        })
        .await;
        service.shutdown().await;
    }

    #[tokio::test]
    async fn a_rejected_submission_deletes_its_priority_class() {
        let cluster = FakeCluster::new();
        let bus = ResourcesEventBus::spawn();
        let service = service(&cluster, &bus);
        let name = unique_name(CLUSTER_ID, "trial-1");
        cluster.hold(&name);

        service.start_job(start_request("alloc", "trial-1")).await.unwrap();
        cluster.wait_started(&name).await;
        service
            .handle_event(ClusterEvent::Job(InformerEvent::Modified(complete(kube_job(
                &name, "alloc",
            )))))
            .await;

        let mut request = start_request("alloc-2", "trial-1");
        request.spec.priority = Some(7);
        let error = service.start_job(request).await.unwrap_err();
        assert!(matches!(error, Error::DuplicateRequest(_)));
        assert!(
            cluster
                .calls()
                .contains(&Call::CreatePriorityClass("alloc-2-priorityclass".to_string()))
        );
        wait_until(|| {
            cluster
                .calls()
                .contains(&Call::DeletePriorityClass("alloc-2-priorityclass".to_string()))
        })
        .await;

        cluster.release(&name);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn a_failed_creation_stops_the_job() {
        let cluster = FakeCluster::new();
        let name = unique_name(CLUSTER_ID, "trial-1");
        cluster.fail(&name, 500);

        let bus = ResourcesEventBus::spawn();
        let mut events = bus.subscribe(AllocationId::from("alloc")).await;
        let service = service(&cluster, &bus);
        service.start_job(start_request("alloc", "trial-1")).await.unwrap();

        loop {
            if let ResourcesEvent::StateChanged(changed) = next_event(&mut events).await {
                let failure = changed.stopped.unwrap().failure.unwrap();
                assert!(
                    failure
                        .message
                        .starts_with("failed to create Kubernetes resources")
                );
                break;
            }
        }

        assert!(service.kill_job(&AllocationId::from("alloc")).await.is_err());
        service.shutdown().await;
    }

    #[tokio::test]
    async fn events_for_unknown_objects_are_dropped() {
        let cluster = FakeCluster::new();
        let bus = ResourcesEventBus::spawn();
        let service = service(&cluster, &bus);

        service
            .handle_event(ClusterEvent::Pod(InformerEvent::Modified(
                pod("stranger-abc", "stranger").running().build(),
            )))
            .await;
        service
            .handle_event(ClusterEvent::Job(InformerEvent::Deleted(kube_job(
                "stranger", "x",
            ))))
            .await;
        service
            .handle_event(ClusterEvent::Event(InformerEvent::Added(Event {
                involved_object: ObjectReference {
                    kind: Some("Pod".to_string()),
                    name: Some("stranger-abc".to_string()),
                    ..Default::default()
                },
                ..Default::default()
            })))
            .await;

        assert!(cluster.calls().is_empty());
        service.shutdown().await;
    }

    #[tokio::test]
    async fn preemption_asks_the_allocation_to_release() {
        let cluster = FakeCluster::new();
        let bus = ResourcesEventBus::spawn();
        let mut events = bus.subscribe(AllocationId::from("alloc")).await;
        let service = service(&cluster, &bus);

        service.start_job(start_request("alloc", "trial-1")).await.unwrap();
        let name = unique_name(CLUSTER_ID, "trial-1");
        service
            .handle_event(ClusterEvent::Preemption(InformerEvent::Added(
                pod(&format!("{name}-abc"), &name)
                    .label(DETERMINED_PREEMPTION_LABEL, "true")
                    .build(),
            )))
            .await;

        match next_event(&mut events).await {
            ResourcesEvent::ReleaseResources(release) => assert!(!release.force_kill),
            other => panic!("unexpected event {other:?}"),
        }

        service.shutdown().await;
    }

    #[tokio::test]
    async fn disabling_without_drain_releases_allocations_on_the_node() {
        let cluster = FakeCluster::new();
        let bus = ResourcesEventBus::spawn();
        let mut events = bus.subscribe(AllocationId::from("alloc")).await;
        let service = service(&cluster, &bus);

        service
            .handle_event(ClusterEvent::Node(InformerEvent::Added(gpu_node("node-1", 2))))
            .await;
        service.start_job(start_request("alloc", "trial-1")).await.unwrap();

        let name = unique_name(CLUSTER_ID, "trial-1");
        for index in 0..2 {
            cluster.add_pod(
                pod(&format!("{name}-{index}"), &name)
                    .label(DETERMINED_LABEL, "alloc")
                    .node("node-1")
                    .build(),
            );
        }

        let agent = service.disable_agent("node-1", false).await.unwrap();
        assert!(!agent.enabled);
        assert!(!agent.draining);
        assert!(agent.slots.values().all(|s| !s.enabled));
        assert!(cluster.calls().contains(&Call::PatchNode(
            "node-1".to_string(),
            cluster_id_node_label(CLUSTER_ID),
            Some(NO_EXECUTE_NODE_LABEL_VALUE.to_string()),
        )));

        match next_event(&mut events).await {
            ResourcesEvent::ReleaseResources(release) => {
                assert_eq!(release.reason, NODE_DISABLED_REASON);
                assert!(release.force_kill);
            }
            other => panic!("unexpected event {other:?}"),
        }

        // One release per allocation, not per pod
        assert!(events.try_recv().is_none());
        service.shutdown().await;
    }

    #[tokio::test]
    async fn draining_keeps_allocations_and_forbidden_patches_are_explained() {
        let cluster = FakeCluster::new();
        let bus = ResourcesEventBus::spawn();
        let service = service(&cluster, &bus);

        service
            .handle_event(ClusterEvent::Node(InformerEvent::Added(gpu_node("node-1", 1))))
            .await;

        let agent = service.disable_agent("node-1", true).await.unwrap();
        assert!(agent.draining);

        let agent = service.enable_agent("node-1").await.unwrap();
        assert!(agent.enabled);
        assert!(!agent.draining);

        cluster.fail("node-1", 403);
        assert!(matches!(
            service.enable_agent("node-1").await,
            Err(Error::NodePatchForbidden)
        ));
        service.shutdown().await;
    }

    #[tokio::test]
    async fn slots_are_found_by_index() {
        let cluster = FakeCluster::new();
        let bus = ResourcesEventBus::spawn();
        let service = service(&cluster, &bus);

        service
            .handle_event(ClusterEvent::Node(InformerEvent::Added(gpu_node("node-1", 4))))
            .await;

        assert_eq!(service.get_slot("node-1", "001").await.unwrap().id, "001");
        assert_eq!(service.get_slot("node-1", "1").await.unwrap().id, "001");
        assert!(matches!(
            service.get_slot("node-1", "9").await,
            Err(Error::UnknownSlot { .. })
        ));
        assert!(matches!(
            service.get_agent("node-2").await,
            Err(Error::UnknownAgent(_))
        ));
        assert_eq!(service.get_slots("node-1").await.unwrap().len(), 4);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn resource_summaries_count_pool_slots() {
        let cluster = FakeCluster::new();
        let bus = ResourcesEventBus::spawn();
        let service = service(&cluster, &bus);

        service
            .handle_event(ClusterEvent::Node(InformerEvent::Added(gpu_node("node-1", 4))))
            .await;
        service
            .handle_event(ClusterEvent::Node(InformerEvent::Added(gpu_node("node-2", 2))))
            .await;

        let summary = service.summarize_resources(Some("default")).await.unwrap();
        assert_eq!(summary.num_agents_used, 1);
        assert_eq!(summary.slots_available, 6);

        let summary = service.summarize_resources(Some("missing")).await.unwrap();
        assert_eq!(summary.slots_available, 0);

        let agents = service.get_agents().await;
        assert_eq!(agents.len(), 2);
        assert!(agents.iter().all(|a| a.resource_pools == ["default"]));

        // Served from the cache
        assert_eq!(service.get_agents().await, agents);
        service.shutdown().await;
    }
}
