//! Implementation of the request queue.
//!
//! The request queue is the only component that creates or deletes the
//! Kubernetes objects owned by jobs. Requests are executed by a fixed pool of
//! workers; requests that arrive while every worker is busy are buffered in
//! FIFO order.
//!
//! Requests are keyed by `namespace/name`. A delete of an object whose create
//! is still buffered cancels the create without contacting Kubernetes; a delete
//! of an object whose create is executing is held back until the create
//! completes.

use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;

use k8s_openapi::api::batch::v1::Job as KubeJob;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::ResourceExt;
use kube::core::ErrorResponse;
use tokio::select;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::warn;

use crate::cluster::Cluster;
use crate::error::Error;
use crate::error::OrchestrationResult;

/// The default number of request queue workers.
pub const DEFAULT_WORKERS: usize = 5;

/// A request to create the objects of a job.
#[derive(Debug, Clone)]
pub struct CreateRequest {
    /// The batch job to create.
    pub job: KubeJob,
    /// The config map to create before the job.
    pub config_map: ConfigMap,
}

/// A request to delete the objects of a job.
///
/// Each present name is deleted in the order job, config map, pod.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteRequest {
    /// The namespace of the objects.
    pub namespace: String,
    /// The name of the batch job to delete.
    pub job_name: Option<String>,
    /// The name of the config map to delete.
    pub config_map_name: Option<String>,
    /// The name of the pod to delete.
    pub pod_name: Option<String>,
}

impl DeleteRequest {
    /// Gets the name the request is keyed on.
    fn name(&self) -> &str {
        self.pod_name
            .as_deref()
            .or(self.job_name.as_deref())
            .or(self.config_map_name.as_deref())
            .unwrap_or_default()
    }

    /// Gets the request identifier.
    fn request_id(&self) -> String {
        format!("{ns}/{name}", ns = self.namespace, name = self.name())
    }
}

/// A failure reported back to the job that issued a request.
#[derive(Debug)]
pub enum ResourceRequestFailure {
    /// Creating the job's objects failed.
    CreationFailed {
        /// The name of the job.
        job_name: String,
        /// The Kubernetes error.
        error: kube::Error,
    },
    /// Deleting an object failed.
    DeletionFailed {
        /// The name the delete request was keyed on.
        name: String,
        /// The Kubernetes error.
        error: kube::Error,
    },
    /// A buffered create was cancelled by a delete before it was executed.
    CreationCancelled {
        /// The name of the job.
        job_name: String,
    },
}

impl ResourceRequestFailure {
    /// Gets the name of the object the failure relates to.
    pub fn name(&self) -> &str {
        match self {
            Self::CreationFailed { job_name, .. } | Self::CreationCancelled { job_name } => {
                job_name
            }
            Self::DeletionFailed { name, .. } => name,
        }
    }
}

/// A request buffered in or dispatched from the queue.
#[derive(Debug)]
enum Request {
    /// Create the objects of a job.
    Create(Box<CreateRequest>),
    /// Delete the objects of a job.
    Delete(DeleteRequest),
}

/// A request tagged with its identifier.
type QueuedRequest = (String, Request);

/// The mutable state of the queue.
#[derive(Default)]
struct QueueState {
    /// Requests waiting for a worker.
    queue: VecDeque<QueuedRequest>,
    /// Inboxes of workers waiting for a request.
    idle: Vec<mpsc::UnboundedSender<QueuedRequest>>,
    /// Creates that are buffered but not yet dispatched.
    pending_creations: HashSet<String>,
    /// Creates that are executing on a worker.
    creations_in_progress: HashSet<String>,
    /// Deletes waiting for an executing create of the same object.
    blocked_deletions: HashMap<String, DeleteRequest>,
}

impl QueueState {
    /// Hands a request to an idle worker or buffers it.
    fn submit(&mut self, id: String, request: Request) {
        match self.idle.pop() {
            Some(worker) => self.dispatch(worker, id, request),
            None => {
                if matches!(request, Request::Create(_)) {
                    self.pending_creations.insert(id.clone());
                }

                self.queue.push_back((id, request));
            }
        }
    }

    /// Sends a request to a worker.
    fn dispatch(
        &mut self,
        worker: mpsc::UnboundedSender<QueuedRequest>,
        id: String,
        request: Request,
    ) {
        if matches!(request, Request::Create(_)) {
            self.pending_creations.remove(&id);
            self.creations_in_progress.insert(id.clone());
        }

        if let Err(e) = worker.send((id, request)) {
            let (id, _) = e.0;
            warn!("request queue worker has shut down: dropping request `{id}`");
            self.creations_in_progress.remove(&id);
        }
    }

    /// Records completion of a request and gives the worker its next one.
    fn complete(&mut self, id: &str, worker: &mpsc::UnboundedSender<QueuedRequest>) {
        if self.creations_in_progress.remove(id) {
            if let Some(deletion) = self.blocked_deletions.remove(id) {
                debug!("releasing deletion of `{id}` held for its creation");
                self.queue
                    .push_back((id.to_string(), Request::Delete(deletion)));
            }
        }

        match self.queue.pop_front() {
            Some((id, request)) => self.dispatch(worker.clone(), id, request),
            None => self.idle.push(worker.clone()),
        }
    }
}

/// Serializes Kubernetes create and delete calls through a worker pool.
///
/// The queue is a cheap handle; clones share the same workers.
#[derive(Clone)]
pub struct RequestQueue {
    /// The state shared with the workers.
    state: Arc<Mutex<QueueState>>,
    /// The channel failures are reported on.
    failures: mpsc::UnboundedSender<ResourceRequestFailure>,
}

impl RequestQueue {
    /// Spawns the given number of workers and returns the queue with their
    /// handles.
    ///
    /// Failures of requests are sent to `failures`.
    pub fn spawn(
        cluster: Arc<dyn Cluster>,
        workers: usize,
        failures: mpsc::UnboundedSender<ResourceRequestFailure>,
        shutdown: CancellationToken,
    ) -> (Self, Vec<JoinHandle<()>>) {
        let state = Arc::new(Mutex::new(QueueState::default()));
        let mut handles = Vec::with_capacity(workers);

        for index in 0..workers.max(1) {
            let (tx, rx) = mpsc::unbounded_channel();
            lock(&state).idle.push(tx.clone());

            handles.push(tokio::spawn(Self::work(
                index,
                state.clone(),
                cluster.clone(),
                failures.clone(),
                tx,
                rx,
                shutdown.clone(),
            )));
        }

        (Self { state, failures }, handles)
    }

    /// Enqueues creation of a job's config map and batch job.
    ///
    /// Returns an error if a create of the same job is already queued or
    /// executing.
    pub fn create_kubernetes_resources(
        &self,
        job: KubeJob,
        config_map: ConfigMap,
    ) -> OrchestrationResult<()> {
        let id = format!(
            "{ns}/{name}",
            ns = job.namespace().unwrap_or_default(),
            name = job.name_any()
        );

        let mut state = lock(&self.state);
        if state.pending_creations.contains(&id) || state.creations_in_progress.contains(&id) {
            error!("a create request for `{id}` is already in flight");
            return Err(Error::DuplicateRequest(id));
        }

        state.submit(id, Request::Create(Box::new(CreateRequest { job, config_map })));
        Ok(())
    }

    /// Enqueues deletion of a job's objects.
    pub fn delete_kubernetes_resources(&self, request: DeleteRequest) {
        let id = request.request_id();
        let mut state = lock(&self.state);

        if state.pending_creations.remove(&id) {
            debug!("cancelling creation of `{id}` before it was executed");
            let mut job_name = None;
            state.queue.retain(|(queued, r)| match r {
                Request::Create(create) if *queued == id => {
                    job_name = Some(create.job.name_any());
                    false
                }
                _ => true,
            });

            self.failures
                .send(ResourceRequestFailure::CreationCancelled {
                    job_name: job_name.unwrap_or_else(|| request.name().to_string()),
                })
                .ok();
            return;
        }

        if state.creations_in_progress.contains(&id) {
            debug!("holding deletion of `{id}` until its creation completes");
            state.blocked_deletions.insert(id, request);
            return;
        }

        state.submit(id, Request::Delete(request));
    }

    /// Determines if every worker is idle and nothing is buffered.
    #[cfg(test)]
    pub(crate) fn is_idle(&self, workers: usize) -> bool {
        let state = lock(&self.state);
        state.queue.is_empty() && state.idle.len() == workers
    }

    /// Runs a worker.
    async fn work(
        index: usize,
        state: Arc<Mutex<QueueState>>,
        cluster: Arc<dyn Cluster>,
        failures: mpsc::UnboundedSender<ResourceRequestFailure>,
        inbox: mpsc::UnboundedSender<QueuedRequest>,
        mut requests: mpsc::UnboundedReceiver<QueuedRequest>,
        shutdown: CancellationToken,
    ) {
        debug!("request queue worker {index} has started");

        loop {
            select! {
                biased;

                _ = shutdown.cancelled() => break,
                request = requests.recv() => {
                    let Some((id, request)) = request else { break };

                    let failure = match request {
                        Request::Create(create) => Self::create(cluster.as_ref(), &create).await,
                        Request::Delete(delete) => Self::delete(cluster.as_ref(), &delete).await,
                    };

                    if let Some(failure) = failure {
                        failures.send(failure).ok();
                    }

                    lock(&state).complete(&id, &inbox);
                }
            }
        }

        debug!("request queue worker {index} has shut down");
    }

    /// Creates a job's config map and then its batch job.
    async fn create(
        cluster: &dyn Cluster,
        request: &CreateRequest,
    ) -> Option<ResourceRequestFailure> {
        let job_name = request.job.name_any();
        debug!("creating Kubernetes resources for job `{job_name}`");

        let result = async {
            cluster.create_config_map(&request.config_map).await?;
            cluster.create_job(&request.job).await
        }
        .await;

        match result {
            Ok(()) => {
                debug!("created Kubernetes resources for job `{job_name}`");
                None
            }
            Err(error) => {
                error!("failed to create Kubernetes resources for job `{job_name}`: {error}");
                Some(ResourceRequestFailure::CreationFailed { job_name, error })
            }
        }
    }

    /// Deletes a job's objects.
    ///
    /// Objects that no longer exist are ignored. Every named object is
    /// attempted; the first error is reported.
    async fn delete(
        cluster: &dyn Cluster,
        request: &DeleteRequest,
    ) -> Option<ResourceRequestFailure> {
        let ns = &request.namespace;
        let mut first = None;

        if let Some(name) = &request.job_name {
            record("job", name, cluster.delete_job(ns, name).await, &mut first);
        }

        if let Some(name) = &request.config_map_name {
            record(
                "config map",
                name,
                cluster.delete_config_map(ns, name).await,
                &mut first,
            );
        }

        if let Some(name) = &request.pod_name {
            record("pod", name, cluster.delete_pod(ns, name).await, &mut first);
        }

        first.map(|error| ResourceRequestFailure::DeletionFailed {
            name: request.name().to_string(),
            error,
        })
    }
}

/// Records the outcome of a delete call, keeping the first error.
fn record(kind: &str, name: &str, result: kube::Result<()>, first: &mut Option<kube::Error>) {
    match result {
        Ok(()) => debug!("deleted {kind} `{name}`"),
        Err(kube::Error::Api(ErrorResponse { code: 404, .. })) => {
            debug!("{kind} `{name}` was already deleted");
        }
        Err(e) => {
            error!("failed to delete {kind} `{name}`: {e}");
            first.get_or_insert(e);
        }
    }
}

/// Locks the queue state.
///
/// The state is never left inconsistent by a panic, so poisoning is ignored.
fn lock(state: &Mutex<QueueState>) -> std::sync::MutexGuard<'_, QueueState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use k8s_openapi::api::batch::v1::Job as KubeJob;
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::api::ObjectMeta;

    use super::*;
    use crate::testing::Call;
    use crate::testing::FakeCluster;
    use crate::testing::wait_until;

    fn meta(name: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            ..Default::default()
        }
    }

    fn objects(name: &str) -> (KubeJob, ConfigMap) {
        (
            KubeJob {
                metadata: meta(name),
                ..Default::default()
            },
            ConfigMap {
                metadata: meta(name),
                ..Default::default()
            },
        )
    }

    fn delete(name: &str) -> DeleteRequest {
        DeleteRequest {
            namespace: "default".to_string(),
            job_name: Some(name.to_string()),
            config_map_name: Some(name.to_string()),
            pod_name: None,
        }
    }

    fn spawn(
        cluster: &Arc<FakeCluster>,
        workers: usize,
    ) -> (
        RequestQueue,
        mpsc::UnboundedReceiver<ResourceRequestFailure>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (queue, _) = RequestQueue::spawn(cluster.clone(), workers, tx, CancellationToken::new());
        (queue, rx)
    }

    #[tokio::test]
    async fn it_creates_config_map_before_job() {
        let cluster = FakeCluster::new();
        let (queue, mut failures) = spawn(&cluster, 2);

        let (job, cm) = objects("det-a");
        queue.create_kubernetes_resources(job, cm).unwrap();
        wait_until(|| cluster.calls().len() == 2 && queue.is_idle(2)).await;

        assert_eq!(
            cluster.calls(),
            [
                Call::CreateConfigMap("det-a".into()),
                Call::CreateJob("det-a".into())
            ]
        );
        assert!(failures.try_recv().is_err());
    }

    #[tokio::test]
    async fn it_cancels_a_buffered_create_without_calling_kubernetes() {
        let cluster = FakeCluster::new();
        cluster.hold("det-a");
        let (queue, mut failures) = spawn(&cluster, 1);

        // Occupy the only worker so the second create is buffered
        let (job, cm) = objects("det-a");
        queue.create_kubernetes_resources(job, cm).unwrap();
        cluster.wait_started("det-a").await;

        let (job, cm) = objects("det-b");
        queue.create_kubernetes_resources(job, cm).unwrap();
        queue.delete_kubernetes_resources(delete("det-b"));

        match failures.recv().await.unwrap() {
            ResourceRequestFailure::CreationCancelled { job_name } => assert_eq!(job_name, "det-b"),
            f => panic!("unexpected failure {f:?}"),
        }

        cluster.release("det-a");
        wait_until(|| queue.is_idle(1)).await;

        assert!(
            cluster.calls().iter().all(|c| !matches!(
                c,
                Call::CreateConfigMap(n) | Call::CreateJob(n) | Call::DeleteJob(n) | Call::DeleteConfigMap(n)
                    if n == "det-b"
            )),
            "no call should be made for a cancelled create"
        );
    }

    #[tokio::test]
    async fn it_holds_a_delete_until_the_executing_create_completes() {
        let cluster = FakeCluster::new();
        cluster.hold("det-a");
        let (queue, mut failures) = spawn(&cluster, 3);

        let (job, cm) = objects("det-a");
        queue.create_kubernetes_resources(job, cm).unwrap();
        cluster.wait_started("det-a").await;

        queue.delete_kubernetes_resources(delete("det-a"));

        // Idle workers must not pick up the held delete
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(cluster.calls().is_empty());

        cluster.release("det-a");
        wait_until(|| cluster.calls().len() == 4 && queue.is_idle(3)).await;

        assert_eq!(
            cluster.calls(),
            [
                Call::CreateConfigMap("det-a".into()),
                Call::CreateJob("det-a".into()),
                Call::DeleteJob("det-a".into()),
                Call::DeleteConfigMap("det-a".into()),
            ]
        );
        assert!(cluster.job_names().is_empty());
        assert!(failures.try_recv().is_err());
    }

    #[tokio::test]
    async fn it_rejects_a_duplicate_create() {
        let cluster = FakeCluster::new();
        cluster.hold("det-a");
        let (queue, _failures) = spawn(&cluster, 1);

        let (job, cm) = objects("det-a");
        queue.create_kubernetes_resources(job.clone(), cm.clone()).unwrap();
        cluster.wait_started("det-a").await;

        assert!(matches!(
            queue.create_kubernetes_resources(job, cm),
            Err(Error::DuplicateRequest(id)) if id == "default/det-a"
        ));

        cluster.release("det-a");
    }

    #[tokio::test]
    async fn it_reports_a_failed_create() {
        let cluster = FakeCluster::new();
        cluster.fail("det-a", 500);
        let (queue, mut failures) = spawn(&cluster, 1);

        let (job, cm) = objects("det-a");
        queue.create_kubernetes_resources(job, cm).unwrap();

        match failures.recv().await.unwrap() {
            ResourceRequestFailure::CreationFailed { job_name, .. } => {
                assert_eq!(job_name, "det-a")
            }
            f => panic!("unexpected failure {f:?}"),
        }

        // The job is never created once the config map fails
        wait_until(|| queue.is_idle(1)).await;
        assert_eq!(cluster.calls(), [Call::CreateConfigMap("det-a".into())]);
    }

    #[tokio::test]
    async fn it_ignores_deletes_of_missing_objects() {
        let cluster = FakeCluster::new();
        let (queue, mut failures) = spawn(&cluster, 1);

        queue.delete_kubernetes_resources(delete("det-gone"));
        wait_until(|| cluster.calls().len() == 2 && queue.is_idle(1)).await;

        assert!(failures.try_recv().is_err());
    }

    #[tokio::test]
    async fn it_reports_a_failed_delete_once() {
        let cluster = FakeCluster::new();
        cluster.fail("det-a", 500);
        let (queue, mut failures) = spawn(&cluster, 1);

        queue.delete_kubernetes_resources(delete("det-a"));

        match failures.recv().await.unwrap() {
            ResourceRequestFailure::DeletionFailed { name, .. } => assert_eq!(name, "det-a"),
            f => panic!("unexpected failure {f:?}"),
        }

        wait_until(|| queue.is_idle(1)).await;
        assert!(failures.try_recv().is_err());
        assert_eq!(cluster.calls().len(), 2);
    }

    #[tokio::test]
    async fn it_bounds_concurrency_by_the_worker_count() {
        let cluster = FakeCluster::new();
        let (queue, _failures) = spawn(&cluster, 2);

        for i in 0..10 {
            let (job, cm) = objects(&format!("det-{i}"));
            queue.create_kubernetes_resources(job, cm).unwrap();
        }

        wait_until(|| cluster.job_names().len() == 10).await;
        assert!(cluster.max_in_flight() <= 2);
    }
}
