use std::sync::Arc;

use serde_json::Value;

use crate::errors::AppError;
use crate::middleware::policy::{self, Decision};
use crate::middleware::rate_limit::{RateDecision, RateLimiter};
use crate::models::invocation::{InvocationRequest, SessionId, StreamEvent, StreamFailure};
use crate::proxy::session::SessionManager;
use crate::proxy::upstream::{Dispatcher, UpstreamTarget};
use crate::store::RegistryStore;

/// Resolve → authorize → rate budget → dispatch.
///
/// Every rejection happens before any upstream traffic, and a policy denial
/// never touches the rate budget.
#[derive(Clone)]
pub struct InvocationGateway {
    store: Arc<dyn RegistryStore>,
    limiter: RateLimiter,
    dispatcher: Arc<dyn Dispatcher>,
    sessions: SessionManager,
}

impl InvocationGateway {
    pub fn new(
        store: Arc<dyn RegistryStore>,
        limiter: RateLimiter,
        dispatcher: Arc<dyn Dispatcher>,
        sessions: SessionManager,
    ) -> Self {
        Self {
            store,
            limiter,
            dispatcher,
            sessions,
        }
    }

    pub fn store(&self) -> &Arc<dyn RegistryStore> {
        &self.store
    }

    pub fn dispatcher(&self) -> &Arc<dyn Dispatcher> {
        &self.dispatcher
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    async fn admit(&self, service_name: &str, action: &str) -> Result<UpstreamTarget, AppError> {
        let record = self.store.get(service_name).await?;

        if let Decision::Deny(reason) = policy::authorize(&record, action) {
            return Err(AppError::Denied {
                service: record.name,
                reason: reason.to_string(),
            });
        }

        match self.limiter.try_acquire(&record.name, record.rate_limit).await? {
            RateDecision::Allowed => {}
            RateDecision::Limited { retry_after } => {
                return Err(AppError::RateLimited {
                    service: record.name,
                    retry_after,
                });
            }
        }

        UpstreamTarget::from_record(&record)
    }

    /// Single request/response invocation. Returns the upstream body verbatim.
    #[tracing::instrument(skip(self, payload))]
    pub async fn invoke(&self, service_name: &str, action: &str, payload: Value) -> Result<Value, AppError> {
        let target = self.admit(service_name, action).await?;
        let result = self.dispatcher.call(&target, action, &payload).await;
        match &result {
            Ok(_) => tracing::debug!("invocation completed"),
            Err(e) => tracing::warn!(kind = e.kind(), "invocation failed: {}", e),
        }
        result
    }

    /// Admit the call, open a session and drive the upstream stream in the
    /// background. Admission failures are returned directly and no session
    /// is created.
    pub async fn invoke_stream(
        &self,
        service_name: &str,
        action: &str,
        payload: Value,
    ) -> Result<SessionId, AppError> {
        let target = self.admit(service_name, action).await?;
        let (session_id, sink, cancel) = self.sessions.open();

        let dispatcher = self.dispatcher.clone();
        let action = action.to_string();
        tokio::spawn(async move {
            let outcome = dispatcher
                .stream(&target, &action, &payload, sink.clone(), cancel)
                .await;

            let failure = match outcome {
                Ok(()) => StreamFailure::new("StreamAborted", "upstream disconnected"),
                Err(e) => StreamFailure::new(e.kind(), e.to_string()),
            };
            // No-op when a terminal event was already delivered.
            if sink.is_open() {
                tracing::warn!(
                    session_id = %session_id,
                    service = %target.service,
                    reason = %failure.reason,
                    "stream ended without completion"
                );
                let _ = sink.emit(StreamEvent::Error(failure));
            }
        });

        tracing::info!(session_id = %session_id, service = %service_name, "stream session opened");
        Ok(session_id)
    }

    /// Dispatch on the request's `stream` flag.
    pub async fn handle(&self, req: InvocationRequest) -> Result<Invocation, AppError> {
        let payload = req.payload();
        if req.stream {
            self.invoke_stream(&req.service_name, &req.action, payload)
                .await
                .map(Invocation::Stream)
        } else {
            self.invoke(&req.service_name, &req.action, payload)
                .await
                .map(Invocation::Response)
        }
    }

    pub fn cancel(&self, session_id: &SessionId) -> Result<(), AppError> {
        if self.sessions.cancel(session_id) {
            Ok(())
        } else {
            Err(AppError::SessionNotFound(session_id.to_string()))
        }
    }
}

#[derive(Debug)]
pub enum Invocation {
    Response(Value),
    Stream(SessionId),
}
