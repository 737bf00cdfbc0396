//! Shared fixtures: an in-memory registry and a scripted upstream.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use service_gateway::errors::AppError;
use service_gateway::middleware::rate_limit::RateLimiter;
use service_gateway::models::invocation::StreamEvent;
use service_gateway::models::service::{action_set, HealthStatus, NewService};
use service_gateway::proxy::gateway::InvocationGateway;
use service_gateway::proxy::session::{CancelSignal, SessionManager, SessionSink};
use service_gateway::proxy::upstream::{Dispatcher, UpstreamTarget};
use service_gateway::store::{MemoryStore, RegistryStore};

/// Upstream double. Every call is counted; streams replay `script`, then
/// either return (upstream finished) or wait for cancellation.
#[derive(Default)]
pub struct ScriptedDispatcher {
    pub calls: AtomicUsize,
    pub fail_with: Mutex<Option<String>>,
    pub script: Mutex<Vec<StreamEvent>>,
    pub hold_open: AtomicBool,
    pub saw_cancel: AtomicBool,
    pub health: Mutex<HashMap<String, HealthStatus>>,
}

impl ScriptedDispatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_script(events: Vec<StreamEvent>, hold_open: bool) -> Arc<Self> {
        let d = Self::default();
        *d.script.lock().unwrap() = events;
        d.hold_open.store(hold_open, Ordering::SeqCst);
        Arc::new(d)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Dispatcher for ScriptedDispatcher {
    async fn call(&self, target: &UpstreamTarget, action: &str, payload: &Value) -> Result<Value, AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(msg) = self.fail_with.lock().unwrap().clone() {
            return Err(AppError::Upstream(msg));
        }
        Ok(json!({
            "service": target.service,
            "action": action,
            "echo": payload,
        }))
    }

    async fn stream(
        &self,
        _target: &UpstreamTarget,
        _action: &str,
        _payload: &Value,
        sink: SessionSink,
        mut cancel: CancelSignal,
    ) -> Result<(), AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let script = self.script.lock().unwrap().clone();
        for event in script {
            if cancel.is_cancelled() || sink.emit(event).is_err() {
                return Ok(());
            }
        }
        if self.hold_open.load(Ordering::SeqCst) {
            cancel.cancelled().await;
            self.saw_cancel.store(true, Ordering::SeqCst);
            // Late output after cancellation must never reach the subscriber.
            let _ = sink.emit(StreamEvent::Progress(json!({"late": true})));
        }
        Ok(())
    }

    async fn probe(&self, target: &UpstreamTarget) -> HealthStatus {
        self.health
            .lock()
            .unwrap()
            .get(&target.service)
            .copied()
            .unwrap_or(HealthStatus::Healthy)
    }
}

/// The `screen-intelligence` record used across scenarios.
pub fn screen_intelligence(rate_limit: u32) -> NewService {
    let mut new = NewService::named("screen-intelligence");
    new.endpoint = Some("http://127.0.0.1:8765/v1/invoke".into());
    new.enabled = true;
    new.actions = action_set(["screen.describe", "screen.click"]);
    new.allowed_actions = action_set(["screen.describe"]);
    new.rate_limit = rate_limit;
    new
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub dispatcher: Arc<ScriptedDispatcher>,
    pub gateway: InvocationGateway,
}

pub async fn harness(dispatcher: Arc<ScriptedDispatcher>, services: Vec<NewService>) -> Harness {
    harness_with_sessions(dispatcher, services, SessionManager::new()).await
}

pub async fn harness_with_sessions(
    dispatcher: Arc<ScriptedDispatcher>,
    services: Vec<NewService>,
    sessions: SessionManager,
) -> Harness {
    let store = Arc::new(MemoryStore::new());
    for s in services {
        store.insert(s).await.unwrap();
    }
    let gateway = InvocationGateway::new(
        store.clone(),
        RateLimiter::local(Duration::from_secs(3600)),
        dispatcher.clone(),
        sessions,
    );
    Harness {
        store,
        dispatcher,
        gateway,
    }
}

/// Receive until the channel closes, failing the test if it stalls.
pub async fn collect(mut rx: tokio::sync::mpsc::Receiver<StreamEvent>) -> Vec<StreamEvent> {
    let mut out = Vec::new();
    loop {
        match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
            Ok(Some(ev)) => out.push(ev),
            Ok(None) => return out,
            Err(_) => panic!("session stalled after {:?}", out),
        }
    }
}
