//! Implements the HTTP plumbing of the resource manager's service.

use std::any::Any;
use std::future::Future;

use anyhow::Context as _;
use axum::Router;
use axum::body::Body;
use axum::extract::FromRequest;
use axum::extract::FromRequestParts;
use axum::extract::rejection::JsonRejection;
use axum::extract::rejection::PathRejection;
use axum::http;
use axum::http::HeaderName;
use axum::http::StatusCode;
use axum::http::header;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use serde::Serialize;
use serde::Serializer;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::LatencyUnit;
use tower_http::compression::CompressionLayer;
use tower_http::sensitive_headers::SetSensitiveRequestHeadersLayer;
use tower_http::sensitive_headers::SetSensitiveResponseHeadersLayer;
use tower_http::trace::DefaultMakeSpan;
use tower_http::trace::DefaultOnResponse;
use tower_http::trace::TraceLayer;
use tracing::Span;
use tracing::debug;
use tracing::error;
use tracing::info;

/// The default address to bind the server to.
pub const DEFAULT_ADDRESS: &str = "0.0.0.0";

/// The default port to bind the server to.
pub const DEFAULT_PORT: u16 = 8080;

/// Header values to be blocked from logging.
const SENSITIVE_HEADERS: [HeaderName; 2] = [header::AUTHORIZATION, header::COOKIE];

/// A panic handler for returning 500.
fn handle_panic(err: Box<dyn Any + Send + 'static>) -> Response {
    if let Some(s) = err.downcast_ref::<String>() {
        error!("server panicked: {s}");
    } else if let Some(s) = err.downcast_ref::<&str>() {
        error!("server panicked: {s}");
    } else {
        error!("server panicked: unknown panic message");
    };

    Error::internal().into_response()
}

/// An extractor that wraps the JSON extractor of Axum.
///
/// This extractor returns an error object on rejection.
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(Error))]
pub struct Json<T>(pub T);

impl<T> IntoResponse for Json<T>
where
    T: Serialize,
{
    fn into_response(self) -> Response {
        axum::Json(self.0).into_response()
    }
}

/// Serializes a status code as its number.
fn serialize_status<S>(status: &StatusCode, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_u16(status.as_u16())
}

/// An error returned by the service.
#[derive(Serialize, Debug)]
pub struct Error {
    /// The status code being returned in the response.
    #[serde(serialize_with = "serialize_status")]
    pub status: StatusCode,
    /// The error message.
    pub message: String,
}

impl Error {
    /// Returns a "not found" JSON error response.
    pub fn not_found() -> Error {
        Error {
            status: StatusCode::NOT_FOUND,
            message: "the requested resource was not found".to_string(),
        }
    }

    /// Returns an "internal server error" JSON error response.
    pub fn internal() -> Error {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: StatusCode::INTERNAL_SERVER_ERROR.to_string(),
        }
    }
}

impl From<crate::Error> for Error {
    fn from(e: crate::Error) -> Self {
        use crate::Error::*;

        let status = match &e {
            UnknownAllocation(_) | UnknownAgent(_) | UnknownSlot { .. } => StatusCode::NOT_FOUND,
            DuplicateJob(_) | DuplicateRequest(_) | Reattach { .. } => StatusCode::CONFLICT,
            InvalidArgument(_) => StatusCode::BAD_REQUEST,
            NodePatchForbidden => StatusCode::FORBIDDEN,
            Generic(_) | Kubernetes(_) | Database(_) => {
                // Log the error but do not return it to the client
                error!("{e:#}");
                return Self::internal();
            }
        };

        Self {
            status,
            message: e.to_string(),
        }
    }
}

impl From<JsonRejection> for Error {
    fn from(rejection: JsonRejection) -> Self {
        Self {
            status: rejection.status(),
            message: rejection.body_text(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        (self.status, axum::Json(self)).into_response()
    }
}

/// Represents the response type for most endpoints.
pub type ServerResponse<T> = Result<T, Error>;

/// An extractor that wraps the path extractor of Axum.
///
/// This extractor returns an error on rejection.
#[derive(FromRequestParts)]
#[from_request(via(axum::extract::Path), rejection(Error))]
pub struct Path<T>(pub T);

impl From<PathRejection> for Error {
    fn from(rejection: PathRejection) -> Self {
        Self {
            status: rejection.status(),
            message: rejection.body_text(),
        }
    }
}

/// An extractor that wraps the query extractor of Axum (extra).
///
/// This extractor returns an error on rejection.
#[derive(FromRequestParts)]
#[from_request(via(axum_extra::extract::Query), rejection(Error))]
pub struct Query<T>(pub T);

impl From<axum_extra::extract::QueryRejection> for Error {
    fn from(rejection: axum_extra::extract::QueryRejection) -> Self {
        Self {
            status: rejection.status(),
            message: rejection.body_text(),
        }
    }
}

/// Wraps the routes of the service with the common middleware.
///
/// A `/ping` route is added and unmatched routes respond with a JSON 404.
pub fn app<S>(routes: Router<S>, state: S) -> Router
where
    S: Clone + Send + Sync + 'static,
{
    let middleware = ServiceBuilder::new()
        .layer(SetSensitiveRequestHeadersLayer::new(SENSITIVE_HEADERS))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().include_headers(true))
                .on_request(|request: &http::Request<Body>, _span: &Span| {
                    debug!(
                        "{method} {path}",
                        method = request.method(),
                        path = request.uri().path()
                    )
                })
                .on_response(
                    DefaultOnResponse::new()
                        .level(tracing::Level::DEBUG)
                        .latency_unit(LatencyUnit::Micros),
                ),
        )
        .layer(CompressionLayer::new())
        .layer(SetSensitiveResponseHeadersLayer::new(SENSITIVE_HEADERS));

    Router::new()
        .route("/ping", get(|| async {}))
        .merge(routes)
        .fallback(async || Error::not_found())
        .layer(middleware)
        .layer(tower_http::catch_panic::CatchPanicLayer::custom(
            handle_panic,
        ))
        .with_state(state)
}

/// Serves an application until the shutdown future completes.
pub async fn serve<F>(app: Router, address: &str, port: u16, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = format!("{address}:{port}");
    let listener = TcpListener::bind(&addr)
        .await
        .context("binding to the provided address")?;

    info!("listening at {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("failed to run server")?;

    Ok(())
}
