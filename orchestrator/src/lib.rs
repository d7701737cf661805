//! Implements the Kubernetes resource manager.
//!
//! The resource manager runs allocations as Kubernetes batch jobs, follows
//! their pods through their lifecycle and reports the state of every
//! allocation on an event bus. It also accounts for the cluster's nodes as
//! agents with slots and groups them into resource pools.

use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;

use anyhow::Context as _;
use axum::Router;
use axum::extract::State as ExtractState;
use axum::response::sse::Event;
use axum::response::sse::KeepAlive;
use axum::response::sse::Sse;
use axum::routing::delete;
use axum::routing::get;
use axum::routing::post;
use bon::Builder;
use futures::Stream;
use futures::stream;
use kuberm_db::AllocationId;
use kuberm_db::Database;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::error;

use crate::cluster::KubeCluster;
use crate::config::JobsConfig;
use crate::events::ResourcesEvent;
use crate::events::ResourcesEventBus;
use crate::events::SchedulingStateUpdate;
use crate::http::DEFAULT_ADDRESS;
use crate::http::DEFAULT_PORT;
use crate::http::Json;
use crate::http::Path;
use crate::http::Query;
use crate::http::ServerResponse;
use crate::jobs::ComputeUsageSummary;
use crate::jobs::JobsService;
use crate::jobs::ReattachJobRequest;
use crate::spec::StartJobRequest;
use crate::summary::AgentSummary;
use crate::summary::SlotSummary;

pub mod cluster;
pub mod config;
mod error;
pub mod events;
pub mod http;
pub mod informer;
pub mod job;
pub mod jobs;
pub mod labels;
pub mod pod;
pub mod request_queue;
pub mod spec;
pub mod summary;
#[cfg(test)]
mod testing;

pub use error::Error;
pub use error::OrchestrationResult;

/// The state for the server.
#[derive(Clone)]
struct State {
    /// The jobs service.
    jobs: JobsService,
    /// The bus the jobs publish allocation events on.
    events: ResourcesEventBus,
}

/// The query parameters of the disable agent endpoint.
#[derive(Debug, Default, Deserialize)]
struct DisableParams {
    /// Whether running allocations may finish on the agent.
    #[serde(default)]
    drain: bool,
}

/// The query parameters of the resource summary endpoint.
#[derive(Debug, Default, Deserialize)]
struct SummaryParams {
    /// The resource pool to summarize; every pool when absent.
    pool: Option<String>,
}

/// The resource manager server.
#[derive(Clone, Builder)]
pub struct Server {
    /// The address to bind the server to.
    #[builder(into, default = DEFAULT_ADDRESS)]
    address: String,

    /// The port to bind the server to.
    #[builder(into, default = DEFAULT_PORT)]
    port: u16,

    /// The jobs service configuration.
    config: JobsConfig,

    /// The database listing open allocations.
    #[builder(name = "shared_database")]
    database: Arc<dyn Database>,

    /// The bus allocation events are published on.
    ///
    /// A new bus is spawned when not provided.
    events: Option<ResourcesEventBus>,

    /// Receives the scheduling state of jobs.
    scheduling: Option<mpsc::UnboundedSender<SchedulingStateUpdate>>,
}

impl<S: server_builder::State> ServerBuilder<S> {
    /// The database listing open allocations.
    ///
    /// This is a convenience method for setting the shared database from any
    /// type that implements `Database`.
    pub fn database(
        self,
        database: impl Database + 'static,
    ) -> ServerBuilder<server_builder::SetSharedDatabase<S>>
    where
        S::SharedDatabase: server_builder::IsUnset,
    {
        self.shared_database(Arc::new(database))
    }
}

impl Server {
    /// Runs the server.
    ///
    /// Resources of allocations that are no longer open are deleted before
    /// the informers start.
    pub async fn run<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let cluster = KubeCluster::try_default().await?;
        let client = cluster.client().clone();

        let events = self.events.unwrap_or_else(ResourcesEventBus::spawn);
        let jobs = JobsService::builder()
            .config(self.config)
            .cluster(Arc::new(cluster))
            .events(events.clone())
            .maybe_scheduling(self.scheduling)
            .build();

        jobs.reconcile(self.database.as_ref())
            .await
            .context("failed to reconcile Kubernetes resources")?;
        jobs.load_system_reservations()
            .await
            .context("failed to load system reservations")?;
        jobs.start_informers(client);

        let result = http::serve(
            http::app(
                Self::routes(),
                State {
                    jobs: jobs.clone(),
                    events,
                },
            ),
            &self.address,
            self.port,
            shutdown,
        )
        .await;

        jobs.shutdown().await;
        result
    }

    /// Gets the routes of the server.
    fn routes() -> Router<State> {
        Router::new()
            .route("/v1/allocations", post(Self::start_job))
            .route("/v1/allocations/{id}", delete(Self::kill_job))
            .route("/v1/allocations/{id}/priority", post(Self::change_priority))
            .route("/v1/allocations/{id}/position", post(Self::change_position))
            .route("/v1/allocations/{id}/refresh", post(Self::refresh_states))
            .route("/v1/allocations/{id}/events", get(Self::allocation_events))
            .route("/v1/reattach", post(Self::reattach_job))
            .route("/v1/summary", get(Self::summarize_resources))
            .route("/v1/agents", get(Self::get_agents))
            .route("/v1/agents/{agent}", get(Self::get_agent))
            .route("/v1/agents/{agent}/enable", post(Self::enable_agent))
            .route("/v1/agents/{agent}/disable", post(Self::disable_agent))
            .route("/v1/agents/{agent}/slots", get(Self::get_slots))
            .route("/v1/agents/{agent}/slots/{slot}", get(Self::get_slot))
    }

    /// Implements the API endpoint for starting a job.
    async fn start_job(
        ExtractState(state): ExtractState<State>,
        Json(request): Json<StartJobRequest>,
    ) -> ServerResponse<()> {
        state.jobs.start_job(request).await?;
        Ok(())
    }

    /// Implements the API endpoint for killing a job.
    async fn kill_job(
        Path(id): Path<String>,
        ExtractState(state): ExtractState<State>,
    ) -> ServerResponse<()> {
        state.jobs.kill_job(&AllocationId::from(id)).await?;
        Ok(())
    }

    /// Implements the API endpoint for changing the priority of an allocation.
    async fn change_priority(
        Path(id): Path<String>,
        ExtractState(state): ExtractState<State>,
    ) -> ServerResponse<()> {
        state.jobs.change_priority(&AllocationId::from(id)).await?;
        Ok(())
    }

    /// Implements the API endpoint for changing the queue position of an
    /// allocation.
    async fn change_position(
        Path(id): Path<String>,
        ExtractState(state): ExtractState<State>,
    ) -> ServerResponse<()> {
        state.jobs.change_position(&AllocationId::from(id)).await?;
        Ok(())
    }

    /// Implements the API endpoint for redelivering an allocation's state.
    async fn refresh_states(
        Path(id): Path<String>,
        ExtractState(state): ExtractState<State>,
    ) -> ServerResponse<()> {
        state.jobs.refresh_states(&AllocationId::from(id)).await?;
        Ok(())
    }

    /// Implements the API endpoint streaming the events of an allocation.
    ///
    /// Events are sent as they are published, each serialized as JSON. The
    /// stream ends after the event reporting that the allocation stopped.
    async fn allocation_events(
        Path(id): Path<String>,
        ExtractState(state): ExtractState<State>,
    ) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
        let subscription = state.events.subscribe(AllocationId::from(id)).await;

        let events = stream::unfold(Some(subscription), |subscription| async move {
            let mut subscription = subscription?;
            loop {
                let event = subscription.recv().await?;
                let stopped = matches!(
                    &event,
                    ResourcesEvent::StateChanged(changed) if changed.stopped.is_some()
                );

                match Event::default().json_data(&event) {
                    Ok(sent) => return Some((Ok(sent), (!stopped).then_some(subscription))),
                    Err(e) => error!("failed to serialize allocation event: {e}"),
                }
            }
        });

        Sse::new(events).keep_alive(KeepAlive::default())
    }

    /// Implements the API endpoint for reattaching an allocation.
    async fn reattach_job(
        ExtractState(state): ExtractState<State>,
        Json(request): Json<ReattachJobRequest>,
    ) -> ServerResponse<()> {
        state.jobs.reattach_job(request).await?;
        Ok(())
    }

    /// Implements the API endpoint for summarizing resource pools.
    async fn summarize_resources(
        Query(params): Query<SummaryParams>,
        ExtractState(state): ExtractState<State>,
    ) -> ServerResponse<Json<ComputeUsageSummary>> {
        Ok(Json(
            state
                .jobs
                .summarize_resources(params.pool.as_deref())
                .await?,
        ))
    }

    /// Implements the API endpoint for listing agents.
    async fn get_agents(ExtractState(state): ExtractState<State>) -> Json<Vec<AgentSummary>> {
        Json(state.jobs.get_agents().await)
    }

    /// Implements the API endpoint for getting an agent.
    async fn get_agent(
        Path(agent): Path<String>,
        ExtractState(state): ExtractState<State>,
    ) -> ServerResponse<Json<AgentSummary>> {
        Ok(Json(state.jobs.get_agent(&agent).await?))
    }

    /// Implements the API endpoint for enabling an agent.
    async fn enable_agent(
        Path(agent): Path<String>,
        ExtractState(state): ExtractState<State>,
    ) -> ServerResponse<Json<AgentSummary>> {
        Ok(Json(state.jobs.enable_agent(&agent).await?))
    }

    /// Implements the API endpoint for disabling an agent.
    async fn disable_agent(
        Path(agent): Path<String>,
        Query(params): Query<DisableParams>,
        ExtractState(state): ExtractState<State>,
    ) -> ServerResponse<Json<AgentSummary>> {
        Ok(Json(state.jobs.disable_agent(&agent, params.drain).await?))
    }

    /// Implements the API endpoint for listing the slots of an agent.
    async fn get_slots(
        Path(agent): Path<String>,
        ExtractState(state): ExtractState<State>,
    ) -> ServerResponse<Json<Vec<SlotSummary>>> {
        Ok(Json(state.jobs.get_slots(&agent).await?))
    }

    /// Implements the API endpoint for getting a slot of an agent.
    async fn get_slot(
        Path((agent, slot)): Path<(String, String)>,
        ExtractState(state): ExtractState<State>,
    ) -> ServerResponse<Json<SlotSummary>> {
        Ok(Json(state.jobs.get_slot(&agent, &slot).await?))
    }
}
