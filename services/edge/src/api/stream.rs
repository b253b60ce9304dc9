// Streaming endpoints: server-sent events and WebSocket.
// Both authenticate before the connection is accepted and then hand a
// bounded queue to the streaming service.
use crate::api::auth::{AuthQuery, Authenticated, authenticate};
use crate::api::error::{ApiError, api_unavailable};
use crate::app::AppState;
use crate::streaming::{ChannelTransport, CloseReason, StreamEvent, StreamingService};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, Stream, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Removes the connection when the response body is dropped by the server,
/// which is how a vanished SSE client shows up.
struct PeerGuard {
    streaming: Arc<StreamingService>,
    id: String,
}

impl Drop for PeerGuard {
    fn drop(&mut self) {
        self.streaming.remove_connection(&self.id, CloseReason::Peer);
    }
}

async fn open(
    state: &AppState,
    auth: &Authenticated,
) -> Result<(String, mpsc::Receiver<StreamEvent>), ApiError> {
    let id = uuid::Uuid::new_v4().to_string();
    let (transport, rx) = ChannelTransport::new(state.stream_queue_capacity);
    state
        .streaming
        .add_connection(id.clone(), auth.environment.clone(), Box::new(transport))
        .await
        .map_err(|_| api_unavailable("stream could not be opened"))?;
    tracing::debug!(
        connection_id = %id,
        token_id = auth.token.id,
        environment = %auth.environment,
        "stream opened"
    );
    Ok((id, rx))
}

pub(crate) async fn sse_stream(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<AuthQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ApiError> {
    let auth = authenticate(&state, &headers, &query, None)?;
    let (id, rx) = open(&state, &auth).await?;
    let guard = PeerGuard {
        streaming: Arc::clone(&state.streaming),
        id,
    };
    let stream = ReceiverStream::new(rx).map(move |event| {
        let _guard = &guard;
        Event::default().event(event.name()).json_data(&event)
    });
    Ok(Sse::new(stream))
}

pub(crate) async fn ws_stream(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<AuthQuery>,
) -> Result<Response, ApiError> {
    let auth = authenticate(&state, &headers, &query, None)?;
    Ok(ws
        .on_upgrade(move |socket| serve_socket(state, auth, socket))
        .into_response())
}

async fn serve_socket(state: AppState, auth: Authenticated, socket: WebSocket) {
    let (id, mut rx) = match open(&state, &auth).await {
        Ok(opened) => opened,
        Err(err) => {
            tracing::debug!(code = %err.body.code, "websocket stream rejected after upgrade");
            return;
        }
    };
    let (mut sink, mut incoming) = socket.split();
    let mut writer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(err) => {
                    tracing::warn!(error = %err, "stream event encode failed");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });
    // Clients send nothing after the handshake; reading only detects close.
    let reader = async {
        while let Some(Ok(message)) = incoming.next().await {
            if matches!(message, Message::Close(_)) {
                break;
            }
        }
    };
    tokio::select! {
        _ = &mut writer => {}
        _ = reader => {}
    }
    state.streaming.remove_connection(&id, CloseReason::Peer);
    writer.abort();
}
