use crate::api::AppState;
use crate::api::dto::gateway::{ClientFrame, ServerFrame};
use crate::api::middleware::verify_jwt;
use crate::domain::event::{FeedItem, Topic};
use axum::{
    extract::{
        Query, State,
        ws::{CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade, close_code},
    },
    http::Extensions,
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt, stream::SplitSink};
use opentelemetry::{KeyValue, global, metrics::Counter};
use serde::Deserialize;
use std::pin::Pin;
use tokio_stream::wrappers::{BroadcastStream, errors::BroadcastStreamRecvError};
use tokio_stream::{Stream, StreamMap};
use tower_http::request_id::RequestId;
use tracing::{Instrument, warn};
use uuid::Uuid;

/// `None` marks the end of a topic stream so the session can resubscribe.
type TopicStream = Pin<Box<dyn Stream<Item = Option<Result<FeedItem, BroadcastStreamRecvError>>> + Send>>;

#[derive(Deserialize)]
pub struct WsParams {
    token: String,
}

pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    extensions: Extensions,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let request_id = extensions
        .get::<RequestId>()
        .map(|id| id.header_value().to_str().unwrap_or_default().to_string())
        .unwrap_or_else(|| "unknown".to_string());

    match verify_jwt(&params.token, &state.config.auth.jwt_secret) {
        Ok(claims) => ws.on_upgrade(move |socket| handle_socket(socket, state, claims.sub, request_id)),
        Err(e) => e.into_response(),
    }
}

#[derive(Clone)]
struct Metrics {
    connections: opentelemetry::metrics::UpDownCounter<i64>,
    frames_sent: Counter<u64>,
    resyncs: Counter<u64>,
}

impl Metrics {
    fn new() -> Self {
        let meter = global::meter("marketdz-messaging");
        Self {
            connections: meter
                .i64_up_down_counter("marketdz_gateway_connections")
                .with_description("Open gateway WebSocket connections")
                .build(),
            frames_sent: meter
                .u64_counter("marketdz_gateway_frames_sent_total")
                .with_description("Frames pushed to gateway clients")
                .build(),
            resyncs: meter
                .u64_counter("marketdz_gateway_resyncs_total")
                .with_description("Resync frames sent after a feed gap")
                .build(),
        }
    }
}

struct GatewaySession {
    user_id: Uuid,
    state: AppState,
    streams: StreamMap<Topic, TopicStream>,
    metrics: Metrics,
}

impl GatewaySession {
    async fn subscribe(&mut self, topic: Topic) -> crate::error::Result<()> {
        let rx = self.state.feed.subscribe(topic).await?;
        let stream = BroadcastStream::new(rx).map(Some).chain(futures::stream::once(async { None }));
        self.streams.insert(topic, Box::pin(stream));
        Ok(())
    }

    async fn handle_client_frame(&mut self, frame: ClientFrame) -> ServerFrame {
        match frame {
            ClientFrame::Observe { conversation_id } => {
                if let Err(e) = self.state.messaging.conversation(self.user_id, conversation_id).await {
                    return ServerFrame::Error { message: e.to_string() };
                }
                let topic = Topic::Conversation(conversation_id);
                if !self.streams.contains_key(&topic)
                    && let Err(e) = self.subscribe(topic).await
                {
                    warn!(error = %e, conversation_id = %conversation_id, "Failed to observe conversation");
                    return ServerFrame::Error { message: e.to_string() };
                }
                ServerFrame::Observing { conversation_id }
            }
            ClientFrame::Unobserve { conversation_id } => {
                self.streams.remove(&Topic::Conversation(conversation_id));
                ServerFrame::Unobserved { conversation_id }
            }
        }
    }

    /// Maps one feed item to the frame for the client. A closed topic is resubscribed.
    async fn handle_feed_item(
        &mut self,
        topic: Topic,
        item: Option<Result<FeedItem, BroadcastStreamRecvError>>,
    ) -> Option<ServerFrame> {
        let conversation_id = match topic {
            Topic::Conversation(id) => Some(id),
            Topic::User(_) => None,
        };

        match item {
            Some(Ok(FeedItem::Event(event))) => Some(ServerFrame::from_event(&event, self.user_id)),
            Some(Ok(FeedItem::Reconnected)) => {
                self.metrics.resyncs.add(1, &[KeyValue::new("reason", "reconnected")]);
                Some(ServerFrame::Resync { conversation_id })
            }
            Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                warn!(skipped, "Gateway client lagged behind the feed");
                self.metrics.resyncs.add(1, &[KeyValue::new("reason", "lagged")]);
                Some(ServerFrame::Resync { conversation_id })
            }
            None => {
                self.streams.remove(&topic);
                if let Err(e) = self.subscribe(topic).await {
                    warn!(error = %e, "Failed to resubscribe after topic closed");
                    return Some(ServerFrame::Error { message: e.to_string() });
                }
                self.metrics.resyncs.add(1, &[KeyValue::new("reason", "closed")]);
                Some(ServerFrame::Resync { conversation_id })
            }
        }
    }
}

async fn send_frame(sink: &mut SplitSink<WebSocket, WsMessage>, frame: &ServerFrame) -> bool {
    match serde_json::to_string(frame) {
        Ok(text) => sink.send(WsMessage::Text(text.into())).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "Failed to encode gateway frame");
            true
        }
    }
}

async fn handle_socket(socket: WebSocket, state: AppState, user_id: Uuid, request_id: String) {
    let span = tracing::info_span!(
        "websocket_session",
        request_id = %request_id,
        user_id = %user_id,
        otel.kind = "server",
        ws.session_id = %Uuid::new_v4()
    );

    async move {
        let metrics = Metrics::new();
        metrics.connections.add(1, &[]);
        tracing::info!("WebSocket connected");

        let mut shutdown_rx = state.shutdown_rx.clone();
        let mut session = GatewaySession { user_id, state, streams: StreamMap::new(), metrics: metrics.clone() };
        let (mut ws_sink, mut ws_stream) = socket.split();

        if let Err(e) = session.subscribe(Topic::User(user_id)).await {
            warn!(error = %e, "Failed to subscribe to user topic");
            let _ = send_frame(&mut ws_sink, &ServerFrame::Error { message: e.to_string() }).await;
            let _ = ws_sink.close().await;
            metrics.connections.add(-1, &[]);
            return;
        }

        loop {
            if *shutdown_rx.borrow() {
                tracing::info!("Shutdown signal received, closing WebSocket");
                let _ = ws_sink
                    .send(WsMessage::Close(Some(CloseFrame {
                        code: close_code::AWAY,
                        reason: "Server shutting down".into(),
                    })))
                    .await;
                break;
            }

            let outgoing = tokio::select! {
                biased;

                _ = shutdown_rx.changed() => None,

                msg = ws_stream.next() => match msg {
                    Some(Ok(WsMessage::Text(text))) => match serde_json::from_str::<ClientFrame>(text.as_str()) {
                        Ok(frame) => Some(session.handle_client_frame(frame).await),
                        Err(e) => {
                            warn!(error = %e, "Failed to decode gateway frame");
                            Some(ServerFrame::Error { message: "Malformed frame".to_string() })
                        }
                    },
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket error");
                        break;
                    }
                    Some(Ok(_)) => None,
                },

                Some((topic, item)) = session.streams.next() => session.handle_feed_item(topic, item).await,
            };

            if let Some(frame) = outgoing {
                if !send_frame(&mut ws_sink, &frame).await {
                    break;
                }
                metrics.frames_sent.add(1, &[]);
            }
        }

        metrics.connections.add(-1, &[]);
        tracing::info!("WebSocket disconnected");
    }
    .instrument(span)
    .await;
}
