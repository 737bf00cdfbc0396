//! Upstream dispatch to service endpoints.
//!
//! Wire contract: `POST <endpoint>` with JSON `{action, payload, stream}` and
//! `Authorization: Bearer <api_key>` when the service has a key. Plain calls
//! return the endpoint's JSON body verbatim; streaming calls read SSE frames
//! (see [`crate::proxy::stream`]). Health probes hit `GET /health` on the
//! endpoint's origin.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde_json::{json, Value};

use crate::errors::AppError;
use crate::models::service::{ApiKey, HealthStatus, ServiceRecord};
use crate::proxy::session::{CancelSignal, SessionSink};
use crate::proxy::stream::{Frame, SseDecoder};

const ERROR_BODY_PREVIEW: usize = 512;

/// Where and how to reach one service.
#[derive(Debug, Clone)]
pub struct UpstreamTarget {
    pub service: String,
    pub endpoint: String,
    pub api_key: Option<ApiKey>,
}

impl UpstreamTarget {
    pub fn from_record(record: &ServiceRecord) -> Result<Self, AppError> {
        let endpoint = record.endpoint.clone().ok_or_else(|| {
            AppError::Upstream(format!("service '{}' has no endpoint", record.name))
        })?;
        Ok(Self {
            service: record.name.clone(),
            endpoint,
            api_key: record.api_key.clone(),
        })
    }
}

/// Transport to service endpoints. The gateway only talks to upstreams
/// through this trait.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// One request, one response.
    async fn call(&self, target: &UpstreamTarget, action: &str, payload: &Value) -> Result<Value, AppError>;

    /// Stream events into `sink` until the upstream finishes, the sink closes,
    /// or `cancel` fires. Returning `Ok` without a terminal event means the
    /// upstream went away early.
    async fn stream(
        &self,
        target: &UpstreamTarget,
        action: &str,
        payload: &Value,
        sink: SessionSink,
        cancel: CancelSignal,
    ) -> Result<(), AppError>;

    async fn probe(&self, target: &UpstreamTarget) -> HealthStatus;
}

/// reqwest-based [`Dispatcher`].
pub struct HttpDispatcher {
    client: ClientWithMiddleware,
    timeout: Duration,
}

impl HttpDispatcher {
    /// `max_retries = 0` disables internal retries; callers own retry policy.
    pub fn new(timeout: Duration, max_retries: u32) -> anyhow::Result<Self> {
        let reqwest_client = reqwest::Client::builder()
            .use_rustls_tls()
            .pool_max_idle_per_host(32)
            .connect_timeout(Duration::from_secs(5))
            .build()?;

        let client = if max_retries > 0 {
            let retry_policy = ExponentialBackoff::builder().build_with_max_retries(max_retries);
            ClientBuilder::new(reqwest_client)
                .with(RetryTransientMiddleware::new_with_policy(retry_policy))
                .build()
        } else {
            ClientBuilder::new(reqwest_client).build()
        };

        Ok(Self { client, timeout })
    }

    fn headers(target: &UpstreamTarget, streaming: bool) -> Result<HeaderMap, AppError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            ACCEPT,
            HeaderValue::from_static(if streaming {
                "text/event-stream"
            } else {
                "application/json"
            }),
        );
        if let Some(key) = &target.api_key {
            let mut value = HeaderValue::from_str(&format!("Bearer {}", key.expose()))
                .map_err(|_| {
                    AppError::Upstream(format!(
                        "api key for '{}' is not a valid header value",
                        target.service
                    ))
                })?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }
        Ok(headers)
    }

    fn body(action: &str, payload: &Value, streaming: bool) -> Result<Vec<u8>, AppError> {
        serde_json::to_vec(&json!({
            "action": action,
            "payload": payload,
            "stream": streaming,
        }))
        .map_err(|e| AppError::Internal(e.into()))
    }

    async fn send(
        &self,
        target: &UpstreamTarget,
        action: &str,
        payload: &Value,
        streaming: bool,
    ) -> Result<reqwest::Response, AppError> {
        let mut req = self
            .client
            .post(&target.endpoint)
            .headers(Self::headers(target, streaming)?)
            .body(Self::body(action, payload, streaming)?);
        if !streaming {
            req = req.timeout(self.timeout);
        }

        let resp = req.send().await.map_err(|e| {
            tracing::warn!(service = %target.service, "upstream request failed: {}", e);
            AppError::Upstream(e.to_string())
        })?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let preview: String = text.chars().take(ERROR_BODY_PREVIEW).collect();
            return Err(AppError::Upstream(format!(
                "'{}' returned {}: {}",
                target.service, status, preview
            )));
        }
        Ok(resp)
    }
}

#[async_trait]
impl Dispatcher for HttpDispatcher {
    async fn call(&self, target: &UpstreamTarget, action: &str, payload: &Value) -> Result<Value, AppError> {
        let resp = self.send(target, action, payload, false).await?;
        resp.json::<Value>().await.map_err(|e| {
            AppError::Upstream(format!("'{}' returned an invalid JSON body: {}", target.service, e))
        })
    }

    async fn stream(
        &self,
        target: &UpstreamTarget,
        action: &str,
        payload: &Value,
        sink: SessionSink,
        mut cancel: CancelSignal,
    ) -> Result<(), AppError> {
        let resp = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            resp = self.send(target, action, payload, true) => resp?,
        };

        let mut bytes = resp.bytes_stream();
        let mut decoder = SseDecoder::new();

        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!(service = %target.service, session_id = %sink.id(), "upstream stream cancelled");
                    return Ok(());
                }
                chunk = bytes.next() => chunk,
            };

            let eof = chunk.is_none();
            let frames = match chunk {
                Some(Ok(bytes)) => decoder.push(&bytes),
                Some(Err(e)) => return Err(AppError::StreamAborted(e.to_string())),
                None => decoder.finish().into_iter().collect(),
            };

            for frame in frames {
                match frame {
                    Frame::Done => return Ok(()),
                    Frame::Event(event) => {
                        if cancel.is_cancelled() || sink.emit(event).is_err() {
                            return Ok(());
                        }
                    }
                }
            }

            if eof || !sink.is_open() {
                if decoder.skipped() > 0 {
                    tracing::debug!(service = %target.service, skipped = decoder.skipped(), "upstream stream had undecodable frames");
                }
                return Ok(());
            }
        }
    }

    async fn probe(&self, target: &UpstreamTarget) -> HealthStatus {
        let url = match url::Url::parse(&target.endpoint).and_then(|u| u.join("/health")) {
            Ok(url) => url,
            Err(_) => return HealthStatus::Down,
        };

        let mut req = self.client.get(url.as_str()).timeout(Duration::from_secs(5));
        if let Some(key) = &target.api_key {
            req = req.bearer_auth(key.expose());
        }

        match req.send().await {
            Ok(resp) if resp.status().is_success() => HealthStatus::Healthy,
            Ok(resp) => {
                tracing::debug!(service = %target.service, status = %resp.status(), "health probe not ok");
                HealthStatus::Degraded
            }
            Err(e) => {
                tracing::debug!(service = %target.service, error = %e, "health probe failed");
                HealthStatus::Down
            }
        }
    }
}
