//! Access to the Kubernetes API.
//!
//! Everything the resource manager does against the cluster goes through the
//! [`Cluster`] trait so that the job state machine and the request queue can
//! be driven without a live API server.

use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use async_trait::async_trait;
use futures::AsyncBufReadExt;
use futures::StreamExt;
use futures::stream::BoxStream;
use k8s_openapi::api::batch::v1::Job as KubeJob;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::scheduling::v1::PriorityClass;
use kube::Api;
use kube::Client;
use kube::Resource;
use kube::ResourceExt;
use kube::api::DeleteParams;
use kube::api::ListParams;
use kube::api::LogParams;
use kube::api::Patch;
use kube::api::PatchParams;
use kube::api::PostParams;
use kube::api::PropagationPolicy;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::json;

/// The grace period given to deleted objects.
pub const DELETION_GRACE_PERIOD: Duration = Duration::from_secs(15);

/// The namespace used for objects that do not specify one.
const DEFAULT_NAMESPACE: &str = "default";

/// A stream of log lines from a container.
pub type LogStream = BoxStream<'static, std::io::Result<String>>;

/// Selects objects by label and field.
///
/// Listing is always performed across every namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selector {
    /// The label selector.
    pub labels: Option<String>,
    /// The field selector.
    pub fields: Option<String>,
}

impl Selector {
    /// Constructs a selector matching the given labels.
    pub fn labels(labels: impl Into<String>) -> Self {
        Self {
            labels: Some(labels.into()),
            fields: None,
        }
    }

    /// Constructs a selector matching the given fields.
    pub fn fields(fields: impl Into<String>) -> Self {
        Self {
            labels: None,
            fields: Some(fields.into()),
        }
    }

    /// Converts the selector to Kubernetes list parameters.
    pub fn to_list_params(&self) -> ListParams {
        let mut params = ListParams::default();
        if let Some(labels) = &self.labels {
            params = params.labels(labels);
        }

        if let Some(fields) = &self.fields {
            params = params.fields(fields);
        }

        params
    }
}

/// An abstraction of the Kubernetes API used by the resource manager.
#[async_trait]
pub trait Cluster: Send + Sync + 'static {
    /// Creates a config map.
    async fn create_config_map(&self, config_map: &ConfigMap) -> kube::Result<()>;

    /// Creates a batch job.
    async fn create_job(&self, job: &KubeJob) -> kube::Result<()>;

    /// Deletes a batch job with background propagation.
    async fn delete_job(&self, namespace: &str, name: &str) -> kube::Result<()>;

    /// Deletes a config map.
    async fn delete_config_map(&self, namespace: &str, name: &str) -> kube::Result<()>;

    /// Deletes a pod.
    async fn delete_pod(&self, namespace: &str, name: &str) -> kube::Result<()>;

    /// Lists batch jobs in every namespace.
    async fn list_jobs(&self, selector: &Selector) -> kube::Result<Vec<KubeJob>>;

    /// Lists config maps in every namespace.
    async fn list_config_maps(&self, selector: &Selector) -> kube::Result<Vec<ConfigMap>>;

    /// Lists pods in every namespace.
    async fn list_pods(&self, selector: &Selector) -> kube::Result<Vec<Pod>>;

    /// Sets (`Some`) or removes (`None`) a label on a node.
    async fn patch_node_label(&self, node: &str, key: &str, value: Option<&str>)
    -> kube::Result<()>;

    /// Creates a priority class.
    async fn create_priority_class(&self, class: &PriorityClass) -> kube::Result<()>;

    /// Deletes a priority class.
    async fn delete_priority_class(&self, name: &str) -> kube::Result<()>;

    /// Follows the logs of a pod's containers.
    async fn pod_logs(&self, namespace: &str, name: &str) -> kube::Result<LogStream>;
}

/// Implements [`Cluster`] with a Kubernetes client.
#[derive(Clone)]
pub struct KubeCluster {
    /// The Kubernetes client.
    client: Client,
}

impl KubeCluster {
    /// Constructs a cluster from the default client configuration.
    ///
    /// The configuration is inferred from the environment: in-cluster service
    /// account credentials or the local kubeconfig.
    pub async fn try_default() -> Result<Self> {
        let client = Client::try_default()
            .await
            .context("failed to get default Kubernetes client")?;

        Ok(Self { client })
    }

    /// Gets the underlying Kubernetes client.
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Gets the namespaced API for an object.
    fn namespaced_for<K>(&self, object: &K) -> Api<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        let namespace = object
            .namespace()
            .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());
        Api::namespaced(self.client.clone(), &namespace)
    }

    /// Lists objects across every namespace.
    async fn list_all<K>(&self, selector: &Selector) -> kube::Result<Vec<K>>
    where
        K: Resource + Clone + DeserializeOwned + std::fmt::Debug,
        <K as Resource>::DynamicType: Default,
    {
        let api: Api<K> = Api::all(self.client.clone());
        Ok(api.list(&selector.to_list_params()).await?.items)
    }

    /// Creates an object in its namespace.
    async fn create<K>(&self, object: &K) -> kube::Result<()>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + Serialize
            + std::fmt::Debug,
        <K as Resource>::DynamicType: Default,
    {
        self.namespaced_for(object)
            .create(&PostParams::default(), object)
            .await?;
        Ok(())
    }
}

/// Gets the parameters used for every deletion.
fn delete_params() -> DeleteParams {
    DeleteParams {
        grace_period_seconds: Some(DELETION_GRACE_PERIOD.as_secs() as u32),
        propagation_policy: Some(PropagationPolicy::Background),
        ..Default::default()
    }
}

#[async_trait]
impl Cluster for KubeCluster {
    async fn create_config_map(&self, config_map: &ConfigMap) -> kube::Result<()> {
        self.create(config_map).await
    }

    async fn create_job(&self, job: &KubeJob) -> kube::Result<()> {
        self.create(job).await
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> kube::Result<()> {
        let api: Api<KubeJob> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &delete_params()).await?;
        Ok(())
    }

    async fn delete_config_map(&self, namespace: &str, name: &str) -> kube::Result<()> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &delete_params()).await?;
        Ok(())
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> kube::Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &delete_params()).await?;
        Ok(())
    }

    async fn list_jobs(&self, selector: &Selector) -> kube::Result<Vec<KubeJob>> {
        self.list_all(selector).await
    }

    async fn list_config_maps(&self, selector: &Selector) -> kube::Result<Vec<ConfigMap>> {
        self.list_all(selector).await
    }

    async fn list_pods(&self, selector: &Selector) -> kube::Result<Vec<Pod>> {
        self.list_all(selector).await
    }

    async fn patch_node_label(
        &self,
        node: &str,
        key: &str,
        value: Option<&str>,
    ) -> kube::Result<()> {
        let api: Api<Node> = Api::all(self.client.clone());
        api.patch(
            node,
            &PatchParams::default(),
            &Patch::Merge(json!({ "metadata": { "labels": { key: value } } })),
        )
        .await?;
        Ok(())
    }

    async fn create_priority_class(&self, class: &PriorityClass) -> kube::Result<()> {
        let api: Api<PriorityClass> = Api::all(self.client.clone());
        api.create(&PostParams::default(), class).await?;
        Ok(())
    }

    async fn delete_priority_class(&self, name: &str) -> kube::Result<()> {
        let api: Api<PriorityClass> = Api::all(self.client.clone());
        api.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }

    async fn pod_logs(&self, namespace: &str, name: &str) -> kube::Result<LogStream> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let reader = api
            .log_stream(
                name,
                &LogParams {
                    follow: true,
                    timestamps: true,
                    ..Default::default()
                },
            )
            .await?;

        Ok(reader.lines().boxed())
    }
}
