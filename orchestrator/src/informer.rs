//! Implementation of resumable watches of Kubernetes objects.
//!
//! An informer lists the objects it watches, replays them as added, and then
//! watches for changes from the listed resource version. A watch closed by the
//! server is resumed at once from the last seen resource version; a failed
//! watch is resumed after a backoff that restarts whenever a watch makes
//! progress. A watch whose resource version has expired (`410 Gone`) causes a
//! relist that reports every current object as modified and every vanished
//! object as deleted.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use k8s_openapi::api::batch::v1::Job as KubeJob;
use k8s_openapi::api::core::v1::Event;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::api::core::v1::Pod;
use kube::Api;
use kube::Client;
use kube::Resource;
use kube::ResourceExt;
use kube::api::ListParams;
use kube::api::WatchEvent;
use kube::api::WatchParams;
use serde::de::DeserializeOwned;
use tokio::select;
use tokio::sync::mpsc;
use tokio_retry2::Retry;
use tokio_retry2::RetryError;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::JobsConfig;

/// The status code of an expired resource version.
const GONE: u16 = 410;

/// A change to a watched object.
#[derive(Debug, Clone, PartialEq)]
pub enum InformerEvent<K> {
    /// The object was added.
    Added(K),
    /// The object was modified.
    Modified(K),
    /// The object was deleted.
    Deleted(K),
}

/// A change to an object the jobs service watches.
#[derive(Debug, Clone)]
pub enum ClusterEvent {
    /// A pod of a job changed.
    Pod(InformerEvent<Pod>),
    /// A pod selected for preemption changed.
    Preemption(InformerEvent<Pod>),
    /// A batch job changed.
    Job(InformerEvent<KubeJob>),
    /// A node changed.
    Node(InformerEvent<Node>),
    /// A Kubernetes event was recorded.
    Event(InformerEvent<Event>),
}

/// The result of listing objects.
#[derive(Debug)]
pub struct Listing<K> {
    /// The listed objects.
    pub items: Vec<K>,
    /// The resource version to watch from.
    pub resource_version: String,
}

/// The source of an informer's objects.
#[async_trait]
pub trait ListWatch<K>: Send + Sync + 'static {
    /// Lists the objects.
    async fn list(&self) -> kube::Result<Listing<K>>;

    /// Watches for changes after the given resource version.
    async fn watch(
        &self,
        resource_version: &str,
    ) -> kube::Result<BoxStream<'static, kube::Result<WatchEvent<K>>>>;
}

/// Implements [`ListWatch`] with the Kubernetes API.
#[derive(Clone)]
pub struct KubeListWatch<K> {
    /// The API of the watched objects.
    api: Api<K>,
    /// The label selector of the watched objects.
    labels: Option<String>,
}

impl<K> KubeListWatch<K>
where
    K: Resource,
    <K as Resource>::DynamicType: Default,
{
    /// Constructs a source of every object of a cluster-scoped kind.
    pub fn all(client: Client, labels: Option<&str>) -> Self {
        Self {
            api: Api::all(client),
            labels: labels.map(str::to_string),
        }
    }

    /// Constructs a source of the objects in a namespace.
    pub fn namespaced(client: Client, namespace: &str, labels: Option<&str>) -> Self
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    {
        Self {
            api: Api::namespaced(client, namespace),
            labels: labels.map(str::to_string),
        }
    }
}

#[async_trait]
impl<K> ListWatch<K> for KubeListWatch<K>
where
    K: Resource + Clone + DeserializeOwned + fmt::Debug + Send + Sync + 'static,
    <K as Resource>::DynamicType: Default,
{
    async fn list(&self) -> kube::Result<Listing<K>> {
        let mut params = ListParams::default();
        if let Some(labels) = &self.labels {
            params = params.labels(labels);
        }

        let list = self.api.list(&params).await?;
        Ok(Listing {
            items: list.items,
            resource_version: list.metadata.resource_version.unwrap_or_default(),
        })
    }

    async fn watch(
        &self,
        resource_version: &str,
    ) -> kube::Result<BoxStream<'static, kube::Result<WatchEvent<K>>>> {
        let mut params = WatchParams::default();
        if let Some(labels) = &self.labels {
            params = params.labels(labels);
        }

        Ok(self.api.watch(&params, resource_version).await?.boxed())
    }
}

/// Determines if an error is an expired resource version.
fn is_gone(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(response) if response.code == GONE)
}

/// Gets the key an object is tracked under.
fn key<K: Resource>(object: &K) -> String {
    match object.meta().namespace.as_deref() {
        Some(namespace) => format!("{namespace}/{name}", name = object.name_any()),
        None => object.name_any(),
    }
}

/// Logs a failed list before it is retried.
fn notify_retry(e: &kube::Error, duration: Duration) {
    warn!(
        "failed to list Kubernetes objects: {e} (retrying after {duration} seconds)",
        duration = duration.as_secs()
    );
}

/// Why a watch stopped.
enum WatchEnd {
    /// The informer was shut down.
    Shutdown,
    /// The resource version expired; the objects must be relisted.
    Gone,
    /// The server closed the watch; it is resumed immediately.
    Closed,
    /// The watch failed; it is resumed after a delay.
    Failed {
        /// Whether the watch delivered any change before failing.
        progressed: bool,
    },
}

/// Watches objects of one kind and forwards their changes.
pub struct Informer<K> {
    /// The name of the informer, used in logs.
    name: String,
    /// The source of the objects.
    source: Arc<dyn ListWatch<K>>,
    /// Maps an object change to a cluster event.
    map: fn(InformerEvent<K>) -> ClusterEvent,
    /// The channel changes are forwarded on.
    events: mpsc::UnboundedSender<ClusterEvent>,
    /// The objects known to the informer, keyed by `namespace/name`.
    known: HashMap<String, K>,
    /// The resource version to resume from.
    resource_version: String,
}

impl<K> Informer<K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    /// Constructs a new informer.
    pub fn new(
        name: impl Into<String>,
        source: Arc<dyn ListWatch<K>>,
        map: fn(InformerEvent<K>) -> ClusterEvent,
        events: mpsc::UnboundedSender<ClusterEvent>,
    ) -> Self {
        Self {
            name: name.into(),
            source,
            map,
            events,
            known: HashMap::new(),
            resource_version: String::new(),
        }
    }

    /// Spawns the informer.
    pub fn spawn(self, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Runs the informer until shut down or until the receiver of its events
    /// is dropped.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!("{name} informer has started", name = self.name);

        let mut initial = true;
        'relist: loop {
            let source = self.source.clone();
            let listing = select! {
                biased;

                _ = shutdown.cancelled() => break,
                listing = Retry::spawn_notify(
                    JobsConfig::informer_retry_durations(),
                    || {
                        let source = source.clone();
                        async move { source.list().await.map_err(RetryError::transient) }
                    },
                    notify_retry,
                ) => listing,
            };

            let listing = match listing {
                Ok(listing) => listing,
                Err(e) => {
                    warn!("{name} informer failed to list objects: {e}", name = self.name);
                    continue;
                }
            };

            if !self.replay(listing, initial) {
                break;
            }

            initial = false;
            let mut retries = JobsConfig::informer_retry_durations();
            loop {
                match self.watch(&shutdown).await {
                    WatchEnd::Shutdown => break 'relist,
                    WatchEnd::Gone => {
                        debug!(
                            "{name} informer resource version expired; relisting",
                            name = self.name
                        );
                        continue 'relist;
                    }
                    WatchEnd::Closed => {
                        retries = JobsConfig::informer_retry_durations();
                    }
                    WatchEnd::Failed { progressed } => {
                        if progressed {
                            retries = JobsConfig::informer_retry_durations();
                        }

                        let delay = retries.next().unwrap_or(Duration::from_secs(60));
                        select! {
                            biased;

                            _ = shutdown.cancelled() => break 'relist,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
        }

        info!("{name} informer has shut down", name = self.name);
    }

    /// Sends an event; returns `false` if the receiver has gone away.
    fn send(&self, event: InformerEvent<K>) -> bool {
        self.events.send((self.map)(event)).is_ok()
    }

    /// Reconciles the known objects with a listing.
    ///
    /// The initial listing reports every object as added; later listings
    /// report every object as modified and every vanished object as deleted.
    fn replay(&mut self, listing: Listing<K>, initial: bool) -> bool {
        debug!(
            "{name} informer listed {count} object(s)",
            name = self.name,
            count = listing.items.len()
        );

        let mut previous = std::mem::take(&mut self.known);
        for item in listing.items {
            let key = key(&item);
            previous.remove(&key);
            self.known.insert(key, item.clone());

            let event = if initial {
                InformerEvent::Added(item)
            } else {
                InformerEvent::Modified(item)
            };

            if !self.send(event) {
                return false;
            }
        }

        for (_, item) in previous {
            if !self.send(InformerEvent::Deleted(item)) {
                return false;
            }
        }

        self.resource_version = listing.resource_version;
        true
    }

    /// Watches from the current resource version until the watch ends.
    async fn watch(&mut self, shutdown: &CancellationToken) -> WatchEnd {
        let mut stream = match self.source.watch(&self.resource_version).await {
            Ok(stream) => stream,
            Err(e) if is_gone(&e) => return WatchEnd::Gone,
            Err(e) => {
                warn!("{name} informer failed to watch: {e}", name = self.name);
                return WatchEnd::Failed { progressed: false };
            }
        };

        let mut progressed = false;
        loop {
            let event = select! {
                biased;

                _ = shutdown.cancelled() => return WatchEnd::Shutdown,
                event = stream.next() => event,
            };

            let event = match event {
                Some(Ok(WatchEvent::Added(object))) => {
                    self.track(&object);
                    InformerEvent::Added(object)
                }
                Some(Ok(WatchEvent::Modified(object))) => {
                    self.track(&object);
                    InformerEvent::Modified(object)
                }
                Some(Ok(WatchEvent::Deleted(object))) => {
                    self.known.remove(&key(&object));
                    self.update_version(&object);
                    InformerEvent::Deleted(object)
                }
                Some(Ok(WatchEvent::Bookmark(bookmark))) => {
                    self.resource_version = bookmark.metadata.resource_version;
                    progressed = true;
                    continue;
                }
                Some(Ok(WatchEvent::Error(e))) if e.code == GONE => return WatchEnd::Gone,
                Some(Ok(WatchEvent::Error(e))) => {
                    warn!("{name} informer watch failed: {e}", name = self.name);
                    return WatchEnd::Failed { progressed };
                }
                Some(Err(e)) if is_gone(&e) => return WatchEnd::Gone,
                Some(Err(e)) => {
                    warn!("{name} informer watch failed: {e}", name = self.name);
                    return WatchEnd::Failed { progressed };
                }
                None => {
                    debug!("{name} informer watch ended; resuming", name = self.name);
                    return WatchEnd::Closed;
                }
            };

            if !self.send(event) {
                return WatchEnd::Shutdown;
            }

            progressed = true;
        }
    }

    /// Records an added or modified object.
    fn track(&mut self, object: &K) {
        self.update_version(object);
        self.known.insert(key(object), object.clone());
    }

    /// Advances the resource version to that of an object.
    fn update_version(&mut self, object: &K) {
        if let Some(version) = &object.meta().resource_version {
            self.resource_version.clone_from(version);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use kube::api::ObjectMeta;
    use kube::core::ErrorResponse;

    use super::*;
    use crate::testing::api_error;

    /// A scripted source of nodes.
    #[derive(Default)]
    struct ScriptedSource {
        lists: Mutex<VecDeque<kube::Result<Listing<Node>>>>,
        watches: Mutex<VecDeque<Vec<kube::Result<WatchEvent<Node>>>>>,
        watched_from: Mutex<Vec<String>>,
        watched_at: Mutex<Vec<tokio::time::Instant>>,
        /// Whether scripted watches end after their events.
        closing: bool,
    }

    #[async_trait]
    impl ListWatch<Node> for ScriptedSource {
        async fn list(&self) -> kube::Result<Listing<Node>> {
            self.lists
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(api_error(500)))
        }

        async fn watch(
            &self,
            resource_version: &str,
        ) -> kube::Result<BoxStream<'static, kube::Result<WatchEvent<Node>>>> {
            self.watched_from
                .lock()
                .unwrap()
                .push(resource_version.to_string());
            self.watched_at
                .lock()
                .unwrap()
                .push(tokio::time::Instant::now());

            match self.watches.lock().unwrap().pop_front() {
                Some(events) if self.closing => Ok(futures::stream::iter(events).boxed()),
                Some(events) => Ok(futures::stream::iter(events)
                    .chain(futures::stream::pending())
                    .boxed()),
                None => Ok(futures::stream::pending().boxed()),
            }
        }
    }

    fn node(name: &str, version: &str) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                resource_version: Some(version.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn listing(items: Vec<Node>, version: &str) -> kube::Result<Listing<Node>> {
        Ok(Listing {
            items,
            resource_version: version.to_string(),
        })
    }

    fn describe(event: ClusterEvent) -> String {
        match event {
            ClusterEvent::Node(InformerEvent::Added(n)) => format!("added {}", n.name_any()),
            ClusterEvent::Node(InformerEvent::Modified(n)) => format!("modified {}", n.name_any()),
            ClusterEvent::Node(InformerEvent::Deleted(n)) => format!("deleted {}", n.name_any()),
            other => panic!("unexpected event {other:?}"),
        }
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<ClusterEvent>) -> String {
        describe(rx.recv().await.expect("informer should send an event"))
    }

    fn gaps(source: &ScriptedSource) -> Vec<Duration> {
        source
            .watched_at
            .lock()
            .unwrap()
            .windows(2)
            .map(|w| w[1] - w[0])
            .collect()
    }

    #[tokio::test]
    async fn it_replays_the_initial_listing_then_watches() {
        let source = Arc::new(ScriptedSource::default());
        source
            .lists
            .lock()
            .unwrap()
            .push_back(listing(vec![node("a", "1"), node("b", "2")], "10"));
        source.watches.lock().unwrap().push_back(vec![
            Ok(WatchEvent::Modified(node("a", "11"))),
            Ok(WatchEvent::Deleted(node("b", "12"))),
        ]);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let handle = Informer::new("node", source.clone(), ClusterEvent::Node, tx)
            .spawn(shutdown.clone());

        assert_eq!(next(&mut rx).await, "added a");
        assert_eq!(next(&mut rx).await, "added b");
        assert_eq!(next(&mut rx).await, "modified a");
        assert_eq!(next(&mut rx).await, "deleted b");
        assert_eq!(source.watched_from.lock().unwrap().as_slice(), ["10"]);

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn a_relist_after_gone_reports_vanished_objects() {
        let source = Arc::new(ScriptedSource::default());
        {
            let mut lists = source.lists.lock().unwrap();
            lists.push_back(listing(vec![node("a", "1"), node("b", "2")], "10"));
            lists.push_back(listing(vec![node("a", "20"), node("c", "21")], "22"));
        }
        source
            .watches
            .lock()
            .unwrap()
            .push_back(vec![Ok(WatchEvent::Error(ErrorResponse {
                status: "Failure".to_string(),
                message: "too old resource version".to_string(),
                reason: "Expired".to_string(),
                code: GONE,
            }))]);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let handle = Informer::new("node", source.clone(), ClusterEvent::Node, tx)
            .spawn(shutdown.clone());

        assert_eq!(next(&mut rx).await, "added a");
        assert_eq!(next(&mut rx).await, "added b");
        assert_eq!(next(&mut rx).await, "modified a");
        assert_eq!(next(&mut rx).await, "modified c");
        assert_eq!(next(&mut rx).await, "deleted b");

        crate::testing::wait_until(|| source.watched_from.lock().unwrap().len() == 2).await;
        assert_eq!(source.watched_from.lock().unwrap().as_slice(), ["10", "22"]);

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn failed_lists_are_retried() {
        let source = Arc::new(ScriptedSource::default());
        {
            let mut lists = source.lists.lock().unwrap();
            lists.push_back(Err(api_error(500)));
            lists.push_back(listing(vec![node("a", "1")], "5"));
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let handle = Informer::new("node", source, ClusterEvent::Node, tx).spawn(shutdown.clone());

        assert_eq!(next(&mut rx).await, "added a");

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn closed_watches_resume_immediately() {
        let mut source = ScriptedSource {
            closing: true,
            ..Default::default()
        };
        source
            .lists
            .get_mut()
            .unwrap()
            .push_back(listing(vec![node("a", "1")], "1"));
        for version in 2..6 {
            source
                .watches
                .get_mut()
                .unwrap()
                .push_back(vec![Ok(WatchEvent::Modified(node("a", &version.to_string())))]);
        }

        let source = Arc::new(source);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let handle = Informer::new("node", source.clone(), ClusterEvent::Node, tx)
            .spawn(shutdown.clone());

        assert_eq!(next(&mut rx).await, "added a");
        for _ in 2..6 {
            assert_eq!(next(&mut rx).await, "modified a");
        }

        crate::testing::wait_until(|| source.watched_from.lock().unwrap().len() == 5).await;
        assert_eq!(
            source.watched_from.lock().unwrap().as_slice(),
            ["1", "2", "3", "4", "5"]
        );
        assert!(gaps(&source).iter().all(|gap| gap.is_zero()));

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn failed_watches_back_off_until_a_watch_progresses() {
        let mut source = ScriptedSource {
            closing: true,
            ..Default::default()
        };
        source
            .lists
            .get_mut()
            .unwrap()
            .push_back(listing(vec![node("a", "1")], "1"));
        {
            let watches = source.watches.get_mut().unwrap();
            watches.push_back(vec![Err(api_error(500))]);
            watches.push_back(vec![Err(api_error(500))]);
            watches.push_back(vec![
                Ok(WatchEvent::Modified(node("a", "2"))),
                Err(api_error(500)),
            ]);
        }

        let source = Arc::new(source);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let handle = Informer::new("node", source.clone(), ClusterEvent::Node, tx)
            .spawn(shutdown.clone());

        assert_eq!(next(&mut rx).await, "added a");
        assert_eq!(next(&mut rx).await, "modified a");

        crate::testing::wait_until(|| source.watched_at.lock().unwrap().len() == 4).await;
        assert_eq!(
            gaps(&source),
            [
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(1)
            ]
        );

        shutdown.cancel();
        handle.await.unwrap();
    }
}
