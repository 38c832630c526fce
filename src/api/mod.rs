use crate::config::Config;
use crate::services::conversation_resolver::ConversationResolver;
use crate::services::feed::EventFeed;
use crate::services::health_service::HealthService;
use crate::services::messaging_service::MessagingService;
use crate::services::unread_tracker::UnreadTracker;
use axum::body::Body;
use axum::http::Request;
use axum::{
    Router,
    routing::{get, patch, post},
};
use std::sync::Arc;
use tower_http::request_id::{PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

pub mod conversations;
pub mod dto;
pub mod gateway;
pub mod health;
pub mod messages;
pub mod middleware;

#[derive(Clone, Debug)]
pub struct AppState {
    pub config: Config,
    pub messaging: MessagingService,
    pub resolver: ConversationResolver,
    pub tracker: UnreadTracker,
    pub feed: Arc<dyn EventFeed>,
    pub shutdown_rx: tokio::sync::watch::Receiver<bool>,
}

#[derive(Clone, Debug)]
pub struct MgmtState {
    pub health_service: HealthService,
}

/// Services the public router is built from.
#[derive(Debug)]
pub struct ServiceContainer {
    pub messaging: MessagingService,
    pub resolver: ConversationResolver,
    pub tracker: UnreadTracker,
    pub feed: Arc<dyn EventFeed>,
}

/// Configures and returns the public API router.
pub fn app_router(config: Config, services: ServiceContainer, shutdown_rx: tokio::sync::watch::Receiver<bool>) -> Router {
    let state = AppState {
        config,
        messaging: services.messaging,
        resolver: services.resolver,
        tracker: services.tracker,
        feed: services.feed,
        shutdown_rx,
    };

    let api_routes = Router::new()
        .route("/conversations", post(conversations::get_or_create).get(conversations::list))
        .route("/conversations/{id}", get(conversations::get).patch(conversations::update))
        .route("/conversations/{id}/messages", get(conversations::list_messages).post(conversations::send_message))
        .route("/conversations/{id}/read", post(conversations::mark_read))
        .route("/messages/{id}", patch(messages::edit_message).delete(messages::delete_message))
        .route("/gateway", get(gateway::websocket_handler));

    Router::new()
        .nest("/v1", api_routes)
        .layer(PropagateRequestIdLayer::new(axum::http::HeaderName::from_static("x-request-id")))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(move |request: &Request<Body>| {
                    let request_id = request
                        .extensions()
                        .get::<tower_http::request_id::RequestId>()
                        .map(|id| id.header_value().to_str().unwrap_or_default())
                        .unwrap_or_default()
                        .to_string();

                    tracing::info_span!(
                        "request",
                        "request_id" = %request_id,
                        "http.request.method" = %request.method(),
                        "url.path" = %request.uri().path(),
                        "http.response.status_code" = tracing::field::Empty,
                        "otel.kind" = "server",
                        "user_id" = tracing::field::Empty,
                    )
                })
                .on_response(
                    |response: &axum::http::Response<_>, latency: std::time::Duration, _span: &tracing::Span| {
                        let status = response.status();
                        tracing::Span::current().record("http.response.status_code", status.as_u16());

                        tracing::info!(
                            latency_ms = %latency.as_millis(),
                            status = %status.as_u16(),
                            "request completed"
                        );
                    },
                )
                .on_failure(|error, _latency, _span: &tracing::Span| {
                    tracing::error!(error = %error, "request failed");
                }),
        )
        .layer(SetRequestIdLayer::new(
            axum::http::HeaderName::from_static("x-request-id"),
            middleware::MakeRequestUuidOrHeader,
        ))
        .with_state(state)
}

pub fn mgmt_router(state: MgmtState) -> Router {
    Router::new().route("/livez", get(health::livez)).route("/readyz", get(health::readyz)).with_state(state)
}
