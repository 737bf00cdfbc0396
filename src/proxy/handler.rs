use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::{Stream, StreamExt};
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::invocation::{InvocationRequest, StreamEvent, StreamOpened};
use crate::proxy::gateway::Invocation;
use crate::proxy::session::SessionManager;
use crate::AppState;

/// `POST /v1/invoke`
#[tracing::instrument(skip(state, req), fields(req_id = %Uuid::new_v4()))]
pub async fn invoke_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<InvocationRequest>,
) -> Result<Response, AppError> {
    match state.gateway.handle(req).await? {
        Invocation::Response(body) => Ok((StatusCode::OK, Json(body)).into_response()),
        Invocation::Stream(session_id) => {
            Ok((StatusCode::ACCEPTED, Json(StreamOpened { session_id })).into_response())
        }
    }
}

/// `GET /v1/sessions/:id/events`
///
/// The first subscriber takes the session's event channel; later attempts
/// get 404. A client that disconnects before the terminal event cancels the
/// session.
pub async fn session_events(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let rx = state
        .gateway
        .sessions()
        .subscribe(&id)
        .ok_or_else(|| AppError::SessionNotFound(id.to_string()))?;

    tracing::debug!(session_id = %id, "session subscriber attached");

    let guard = CancelOnDrop {
        sessions: state.gateway.sessions().clone(),
        id,
    };
    let events = ReceiverStream::new(rx).map(move |event| {
        let _guard = &guard;
        Ok(to_sse(&event))
    });
    Ok(Sse::new(events).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}

/// `POST /v1/sessions/:id/cancel`
pub async fn cancel_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    state.gateway.cancel(&id)?;
    Ok(StatusCode::ACCEPTED)
}

/// Cancels the session when the SSE response is dropped. A no-op once the
/// session is terminal.
struct CancelOnDrop {
    sessions: SessionManager,
    id: Uuid,
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if self.sessions.cancel(&self.id) {
            tracing::debug!(session_id = %self.id, "subscriber disconnected");
        }
    }
}

fn to_sse(event: &StreamEvent) -> Event {
    let data = serde_json::to_string(event).unwrap_or_else(|e| {
        tracing::error!(kind = event.kind(), "failed to encode stream event: {}", e);
        r#"{"type":"error","data":{"reason":"Internal"}}"#.to_string()
    });
    Event::default().event(event.kind()).data(data)
}
