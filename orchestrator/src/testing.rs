//! An in-memory cluster used by the unit tests.

#![allow(clippy::missing_docs_in_private_items)]

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job as KubeJob;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::scheduling::v1::PriorityClass;
use kube::ResourceExt;
use kube::core::ErrorResponse;
use tokio::sync::Notify;
use tokio::sync::Semaphore;

use crate::cluster::Cluster;
use crate::cluster::LogStream;
use crate::cluster::Selector;

/// A call made against the fake cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum Call {
    CreateConfigMap(String),
    CreateJob(String),
    DeleteJob(String),
    DeleteConfigMap(String),
    DeletePod(String),
    PatchNode(String, String, Option<String>),
    CreatePriorityClass(String),
    DeletePriorityClass(String),
}

/// A create call held until released.
struct Hold {
    started: Arc<Notify>,
    release: Arc<Semaphore>,
}

#[derive(Default)]
struct State {
    calls: Vec<Call>,
    jobs: Vec<KubeJob>,
    config_maps: Vec<ConfigMap>,
    pods: Vec<Pod>,
    failures: HashMap<String, u16>,
    in_flight: usize,
    max_in_flight: usize,
}

/// A fake Kubernetes API.
#[derive(Default)]
pub(crate) struct FakeCluster {
    state: Mutex<State>,
    holds: Mutex<HashMap<String, Hold>>,
    logs: Mutex<HashMap<String, Vec<String>>>,
}

/// Makes a Kubernetes API error with the given status code.
pub(crate) fn api_error(code: u16) -> kube::Error {
    kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: format!("injected failure {code}"),
        reason: "Injected".to_string(),
        code,
    })
}

/// Determines if an object's labels match a selector of `key` and `key=value`
/// terms.
fn matches_labels(labels: &BTreeMap<String, String>, selector: &Selector) -> bool {
    let Some(selector) = &selector.labels else {
        return true;
    };

    selector.split(',').all(|term| match term.split_once('=') {
        Some((key, value)) => labels.get(key).map(String::as_str) == Some(value),
        None => labels.contains_key(term),
    })
}

impl FakeCluster {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub(crate) fn max_in_flight(&self) -> usize {
        self.state.lock().unwrap().max_in_flight
    }

    /// Makes every call naming the object fail with the given status code.
    pub(crate) fn fail(&self, name: &str, code: u16) {
        self.state
            .lock()
            .unwrap()
            .failures
            .insert(name.to_string(), code);
    }

    pub(crate) fn add_job(&self, job: KubeJob) {
        self.state.lock().unwrap().jobs.push(job);
    }

    pub(crate) fn add_config_map(&self, config_map: ConfigMap) {
        self.state.lock().unwrap().config_maps.push(config_map);
    }

    pub(crate) fn add_pod(&self, pod: Pod) {
        self.state.lock().unwrap().pods.push(pod);
    }

    pub(crate) fn job_names(&self) -> HashSet<String> {
        self.state
            .lock()
            .unwrap()
            .jobs
            .iter()
            .map(|j| j.name_any())
            .collect()
    }

    pub(crate) fn set_logs(&self, pod: &str, lines: &[&str]) {
        self.logs.lock().unwrap().insert(
            pod.to_string(),
            lines.iter().map(|l| l.to_string()).collect(),
        );
    }

    /// Holds creates of the named object until [`FakeCluster::release`].
    pub(crate) fn hold(&self, name: &str) {
        self.holds.lock().unwrap().insert(
            name.to_string(),
            Hold {
                started: Arc::new(Notify::new()),
                release: Arc::new(Semaphore::new(0)),
            },
        );
    }

    /// Waits until a held create of the named object has started.
    pub(crate) async fn wait_started(&self, name: &str) {
        let started = self.holds.lock().unwrap()[name].started.clone();
        started.notified().await;
    }

    pub(crate) fn release(&self, name: &str) {
        self.holds.lock().unwrap()[name].release.add_permits(1);
    }

    /// Records a call and returns any injected failure for the object.
    fn record(&self, call: Call, name: &str) -> kube::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(call);
        match state.failures.get(name) {
            Some(code) => Err(api_error(*code)),
            None => Ok(()),
        }
    }

    async fn enter(&self, name: &str) {
        {
            let mut state = self.state.lock().unwrap();
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
        }

        let hold = self
            .holds
            .lock()
            .unwrap()
            .get(name)
            .map(|h| (h.started.clone(), h.release.clone()));

        match hold {
            Some((started, release)) => {
                started.notify_one();
                release.acquire().await.unwrap().forget();
            }
            None => tokio::time::sleep(Duration::from_millis(5)).await,
        }
    }

    fn exit(&self) {
        self.state.lock().unwrap().in_flight -= 1;
    }
}

#[async_trait]
impl Cluster for FakeCluster {
    async fn create_config_map(&self, config_map: &ConfigMap) -> kube::Result<()> {
        let name = config_map.name_any();
        self.enter(&name).await;
        self.exit();
        self.record(Call::CreateConfigMap(name.clone()), &name)?;
        self.state
            .lock()
            .unwrap()
            .config_maps
            .push(config_map.clone());
        Ok(())
    }

    async fn create_job(&self, job: &KubeJob) -> kube::Result<()> {
        let name = job.name_any();
        self.record(Call::CreateJob(name.clone()), &name)?;
        self.state.lock().unwrap().jobs.push(job.clone());
        Ok(())
    }

    async fn delete_job(&self, _namespace: &str, name: &str) -> kube::Result<()> {
        self.record(Call::DeleteJob(name.to_string()), name)?;
        let mut state = self.state.lock().unwrap();
        let before = state.jobs.len();
        state.jobs.retain(|j| j.name_any() != name);
        if state.jobs.len() == before {
            return Err(api_error(404));
        }

        Ok(())
    }

    async fn delete_config_map(&self, _namespace: &str, name: &str) -> kube::Result<()> {
        self.record(Call::DeleteConfigMap(name.to_string()), name)?;
        let mut state = self.state.lock().unwrap();
        let before = state.config_maps.len();
        state.config_maps.retain(|c| c.name_any() != name);
        if state.config_maps.len() == before {
            return Err(api_error(404));
        }

        Ok(())
    }

    async fn delete_pod(&self, _namespace: &str, name: &str) -> kube::Result<()> {
        self.record(Call::DeletePod(name.to_string()), name)?;
        self.state
            .lock()
            .unwrap()
            .pods
            .retain(|p| p.name_any() != name);
        Ok(())
    }

    async fn list_jobs(&self, selector: &Selector) -> kube::Result<Vec<KubeJob>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .jobs
            .iter()
            .filter(|j| matches_labels(j.labels(), selector))
            .cloned()
            .collect())
    }

    async fn list_config_maps(&self, selector: &Selector) -> kube::Result<Vec<ConfigMap>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .config_maps
            .iter()
            .filter(|c| matches_labels(c.labels(), selector))
            .cloned()
            .collect())
    }

    async fn list_pods(&self, selector: &Selector) -> kube::Result<Vec<Pod>> {
        let node = selector
            .fields
            .as_deref()
            .and_then(|f| f.strip_prefix("spec.nodeName="));

        Ok(self
            .state
            .lock()
            .unwrap()
            .pods
            .iter()
            .filter(|p| matches_labels(p.labels(), selector))
            .filter(|p| {
                node.is_none()
                    || p.spec.as_ref().and_then(|s| s.node_name.as_deref()) == node
            })
            .cloned()
            .collect())
    }

    async fn patch_node_label(
        &self,
        node: &str,
        key: &str,
        value: Option<&str>,
    ) -> kube::Result<()> {
        self.record(
            Call::PatchNode(node.to_string(), key.to_string(), value.map(str::to_string)),
            node,
        )
    }

    async fn create_priority_class(&self, class: &PriorityClass) -> kube::Result<()> {
        let name = class.name_any();
        self.record(Call::CreatePriorityClass(name.clone()), &name)
    }

    async fn delete_priority_class(&self, name: &str) -> kube::Result<()> {
        self.record(Call::DeletePriorityClass(name.to_string()), name)
    }

    async fn pod_logs(&self, _namespace: &str, name: &str) -> kube::Result<LogStream> {
        let lines = self
            .logs
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .unwrap_or_default();
        Ok(futures::stream::iter(lines.into_iter().map(Ok)).boxed())
    }
}

/// Polls until the condition holds, panicking after a generous timeout.
pub(crate) async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }

        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    panic!("condition was not met in time");
}

/// Starts building a pod of the given job.
pub(crate) fn pod(name: &str, job: &str) -> PodBuilder {
    use k8s_openapi::api::core::v1::PodSpec;
    use k8s_openapi::api::core::v1::PodStatus;
    use kube::api::ObjectMeta;

    PodBuilder(Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            labels: Some(BTreeMap::from([(
                crate::labels::KUBERNETES_JOB_NAME_LABEL.to_string(),
                job.to_string(),
            )])),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: Some("node-1".to_string()),
            ..Default::default()
        }),
        status: Some(PodStatus {
            phase: Some("Pending".to_string()),
            ..Default::default()
        }),
    })
}

/// Builds pods in the states the tests need.
pub(crate) struct PodBuilder(Pod);

impl PodBuilder {
    fn status(&mut self) -> &mut k8s_openapi::api::core::v1::PodStatus {
        self.0.status.get_or_insert_with(Default::default)
    }

    fn container(
        &mut self,
        name: &str,
        state: k8s_openapi::api::core::v1::ContainerState,
        init: bool,
    ) {
        use k8s_openapi::api::core::v1::ContainerStatus;

        let status = ContainerStatus {
            name: name.to_string(),
            state: Some(state),
            ..Default::default()
        };

        let statuses = if init {
            &mut self.status().init_container_statuses
        } else {
            &mut self.status().container_statuses
        };

        let statuses = statuses.get_or_insert_with(Vec::new);
        statuses.retain(|s| s.name != name);
        statuses.push(status);
    }

    pub(crate) fn phase(mut self, phase: &str) -> Self {
        self.status().phase = Some(phase.to_string());
        self
    }

    pub(crate) fn node(mut self, node: &str) -> Self {
        self.0.spec.get_or_insert_with(Default::default).node_name = Some(node.to_string());
        self
    }

    pub(crate) fn label(mut self, key: &str, value: &str) -> Self {
        self.0
            .metadata
            .labels
            .get_or_insert_with(Default::default)
            .insert(key.to_string(), value.to_string());
        self
    }

    pub(crate) fn pending(mut self, scheduled: bool) -> Self {
        use k8s_openapi::api::core::v1::PodCondition;

        self.status().conditions = Some(vec![PodCondition {
            type_: "PodScheduled".to_string(),
            status: if scheduled { "True" } else { "False" }.to_string(),
            ..Default::default()
        }]);
        self.phase("Pending")
    }

    pub(crate) fn deleting(mut self) -> Self {
        self.0.metadata.deletion_timestamp = Some(
            k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(chrono::Utc::now()),
        );
        self
    }

    pub(crate) fn running(mut self) -> Self {
        use k8s_openapi::api::core::v1::ContainerState;
        use k8s_openapi::api::core::v1::ContainerStateRunning;

        self.container(
            crate::labels::DETERMINED_CONTAINER_NAME,
            ContainerState {
                running: Some(ContainerStateRunning::default()),
                ..Default::default()
            },
            false,
        );
        self.pending(true).phase("Running")
    }

    pub(crate) fn running_waiting(mut self) -> Self {
        use k8s_openapi::api::core::v1::ContainerState;
        use k8s_openapi::api::core::v1::ContainerStateWaiting;

        self.container(
            crate::labels::DETERMINED_CONTAINER_NAME,
            ContainerState {
                waiting: Some(ContainerStateWaiting {
                    reason: Some("ContainerCreating".to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            },
            false,
        );
        self.pending(true).phase("Running")
    }

    fn terminated_container(&mut self, name: &str, code: i32, message: &str, init: bool) {
        use k8s_openapi::api::core::v1::ContainerState;
        use k8s_openapi::api::core::v1::ContainerStateTerminated;

        self.container(
            name,
            ContainerState {
                terminated: Some(ContainerStateTerminated {
                    exit_code: code,
                    message: Some(message.to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            },
            init,
        );
    }

    fn staged_files(&mut self) {
        if self.status().init_container_statuses.is_none() {
            self.terminated_container(crate::labels::DETERMINED_INIT_CONTAINER_NAME, 0, "", true);
        }
    }

    pub(crate) fn running_terminated(mut self, code: i32, message: &str) -> Self {
        self.staged_files();
        self.terminated_container(crate::labels::DETERMINED_CONTAINER_NAME, code, message, false);
        self.pending(true).phase("Running")
    }

    pub(crate) fn terminated(mut self, code: i32, message: &str) -> Self {
        self.staged_files();
        self.terminated_container(crate::labels::DETERMINED_CONTAINER_NAME, code, message, false);
        self.pending(true)
            .phase(if code == 0 { "Succeeded" } else { "Failed" })
    }

    pub(crate) fn failed_init(mut self, name: &str, code: i32, message: &str) -> Self {
        self.terminated_container(name, code, message, true);
        self
    }

    pub(crate) fn without_init_statuses(mut self) -> Self {
        self.status().init_container_statuses = None;
        self
    }

    pub(crate) fn image_pull_back_off(mut self, message: &str) -> Self {
        use k8s_openapi::api::core::v1::ContainerState;
        use k8s_openapi::api::core::v1::ContainerStateWaiting;

        self.container(
            crate::labels::DETERMINED_CONTAINER_NAME,
            ContainerState {
                waiting: Some(ContainerStateWaiting {
                    reason: Some("ImagePullBackOff".to_string()),
                    message: Some(message.to_string()),
                }),
                ..Default::default()
            },
            false,
        );
        self.pending(true)
    }

    pub(crate) fn build(self) -> Pod {
        self.0
    }
}
