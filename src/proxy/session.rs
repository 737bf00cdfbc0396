//! Streaming sessions: one ordered event channel per streaming invocation.
//!
//! A [`SessionSink`] guards the ordering rules for everything written to a
//! session: `early-response` at most once and only first, `progress`/`token`
//! until a terminal event, then exactly one `completion` or `error`. Once a
//! session is terminal every further write is refused. Cancelling a session
//! closes its sink with `error{reason: "cancelled"}` and signals the upstream
//! task through a [`CancelSignal`].
//!
//! The channel to the subscriber is bounded. One slot is always held back for
//! the terminal event; a producer that would fill the rest closes the session
//! with `StreamAborted` instead of buffering without limit.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::models::invocation::{SessionId, StreamEvent, StreamFailure};

/// Events a session buffers for its subscriber before it is aborted.
pub const DEFAULT_SESSION_BUFFER: usize = 1024;

/// Returned by [`SessionSink::emit`] once the session is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkClosed;

#[derive(Debug)]
enum Phase {
    Open { started: bool },
    Closed { at: Instant },
}

#[derive(Debug)]
struct SinkState {
    tx: Option<mpsc::Sender<StreamEvent>>,
    phase: Phase,
}

/// Write side of a session. Cheap to clone; all clones share one state.
#[derive(Clone, Debug)]
pub struct SessionSink {
    id: SessionId,
    state: Arc<Mutex<SinkState>>,
}

impl SessionSink {
    fn new(id: SessionId, tx: mpsc::Sender<StreamEvent>) -> Self {
        Self {
            id,
            state: Arc::new(Mutex::new(SinkState {
                tx: Some(tx),
                phase: Phase::Open { started: false },
            })),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SinkState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_open(&self) -> bool {
        matches!(self.lock().phase, Phase::Open { .. })
    }

    /// True while open but the receiver has been dropped.
    fn subscriber_gone(&self) -> bool {
        let state = self.lock();
        matches!(state.phase, Phase::Open { .. })
            && state.tx.as_ref().map(|tx| tx.is_closed()).unwrap_or(true)
    }

    fn closed_at(&self) -> Option<Instant> {
        match self.lock().phase {
            Phase::Closed { at } => Some(at),
            Phase::Open { .. } => None,
        }
    }

    /// Deliver one event in order.
    ///
    /// An `early-response` after any other event is dropped. A terminal event
    /// closes the session. Returns `SinkClosed` when the session was already
    /// terminal, its subscriber went away, or the buffer overflowed; the
    /// caller should stop producing.
    pub fn emit(&self, event: StreamEvent) -> Result<(), SinkClosed> {
        let mut state = self.lock();

        let started = match state.phase {
            Phase::Closed { .. } => return Err(SinkClosed),
            Phase::Open { started } => started,
        };

        if started && matches!(event, StreamEvent::EarlyResponse(_)) {
            tracing::warn!(session_id = %self.id, "dropping out-of-order early-response");
            return Ok(());
        }

        let Some(tx) = state.tx.take() else {
            state.phase = Phase::Closed { at: Instant::now() };
            return Err(SinkClosed);
        };

        let terminal = event.is_terminal();
        // The last free slot belongs to the terminal event.
        if !terminal && tx.capacity() <= 1 && !tx.is_closed() {
            tracing::warn!(session_id = %self.id, "subscriber fell behind, aborting session");
            let _ = tx.try_send(StreamEvent::Error(StreamFailure::new(
                "StreamAborted",
                "session buffer overflow",
            )));
            state.phase = Phase::Closed { at: Instant::now() };
            return Err(SinkClosed);
        }

        let delivered = tx.try_send(event).is_ok();

        if terminal || !delivered {
            // Dropping the sender ends the subscriber's stream after the
            // buffered events.
            state.phase = Phase::Closed { at: Instant::now() };
        } else {
            state.tx = Some(tx);
            state.phase = Phase::Open { started: true };
        }

        if delivered {
            Ok(())
        } else {
            tracing::debug!(session_id = %self.id, "subscriber gone, closing session");
            Err(SinkClosed)
        }
    }

    /// Close with `error{reason: "cancelled"}`. False if already terminal.
    fn close_cancelled(&self) -> bool {
        let mut state = self.lock();
        if matches!(state.phase, Phase::Closed { .. }) {
            return false;
        }
        if let Some(tx) = state.tx.take() {
            let _ = tx.try_send(StreamEvent::Error(StreamFailure::cancelled()));
        }
        state.phase = Phase::Closed { at: Instant::now() };
        true
    }
}

/// Read side of a session's cancellation flag, handed to the upstream task.
#[derive(Clone, Debug)]
pub struct CancelSignal(watch::Receiver<bool>);

impl CancelSignal {
    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once the session is cancelled. Never resolves otherwise.
    pub async fn cancelled(&mut self) {
        if self.0.wait_for(|c| *c).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    /// A signal that never fires, for driving dispatchers outside a session.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self(rx)
    }
}

struct SessionEntry {
    sink: SessionSink,
    cancel: watch::Sender<bool>,
    events: Option<mpsc::Receiver<StreamEvent>>,
    opened_at: Instant,
}

/// Registry of live streaming sessions keyed by session id.
#[derive(Clone)]
pub struct SessionManager {
    sessions: Arc<DashMap<SessionId, SessionEntry>>,
    buffer: usize,
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::with_buffer(DEFAULT_SESSION_BUFFER)
    }
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// `buffer` non-terminal events may queue per session; minimum 1.
    pub fn with_buffer(buffer: usize) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            buffer: buffer.max(1),
        }
    }

    /// Create a session; returns its id, write side and cancellation flag.
    pub fn open(&self) -> (SessionId, SessionSink, CancelSignal) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.buffer + 1);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let sink = SessionSink::new(id, tx);

        self.sessions.insert(
            id,
            SessionEntry {
                sink: sink.clone(),
                cancel: cancel_tx,
                events: Some(rx),
                opened_at: Instant::now(),
            },
        );
        tracing::debug!(session_id = %id, "session opened");

        (id, sink, CancelSignal(cancel_rx))
    }

    /// Take the event receiver. Only the first subscriber gets it.
    pub fn subscribe(&self, id: &SessionId) -> Option<mpsc::Receiver<StreamEvent>> {
        let rx = self.sessions.get_mut(id)?.events.take();
        if rx.is_some() {
            self.sessions
                .remove_if(id, |_, entry| !entry.sink.is_open());
        }
        rx
    }

    /// Cancel a live session. Returns false for unknown or already-terminal
    /// sessions.
    ///
    /// The sink is closed before the upstream is signalled, so nothing the
    /// upstream task emits afterwards reaches the subscriber.
    pub fn cancel(&self, id: &SessionId) -> bool {
        let Some(entry) = self.sessions.get(id) else {
            return false;
        };
        if !entry.sink.close_cancelled() {
            return false;
        }
        entry.cancel.send_replace(true);
        tracing::info!(session_id = %id, "session cancelled");
        true
    }

    pub fn is_open(&self, id: &SessionId) -> bool {
        self.sessions
            .get(id)
            .map(|e| e.sink.is_open())
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Drop terminal sessions that were already claimed, and terminal
    /// sessions nobody claimed within `ttl`. Open sessions are cancelled
    /// first when their subscriber disconnected, or when nobody claimed them
    /// within `ttl`.
    pub fn reap(&self, ttl: Duration) -> usize {
        let now = Instant::now();

        let abandoned: Vec<(SessionId, bool)> = self
            .sessions
            .iter()
            .filter_map(|e| {
                if e.sink.subscriber_gone() {
                    Some((*e.key(), true))
                } else if e.events.is_some()
                    && e.sink.is_open()
                    && now.duration_since(e.opened_at) >= ttl
                {
                    Some((*e.key(), false))
                } else {
                    None
                }
            })
            .collect();
        for (id, disconnected) in abandoned {
            if disconnected {
                tracing::info!(session_id = %id, "cancelling session after subscriber disconnect");
            } else {
                tracing::warn!(session_id = %id, "cancelling unclaimed session");
            }
            self.cancel(&id);
        }

        let before = self.sessions.len();
        self.sessions.retain(|_, entry| match entry.sink.closed_at() {
            None => true,
            Some(_) if entry.events.is_none() => false,
            Some(at) => now.duration_since(at) < ttl,
        });
        before - self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn drain(rx: &mut mpsc::Receiver<StreamEvent>) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    #[test]
    fn test_nothing_after_completion() {
        let mgr = SessionManager::new();
        let (id, sink, _) = mgr.open();
        let mut rx = mgr.subscribe(&id).unwrap();

        sink.emit(StreamEvent::EarlyResponse(json!({"ack": 1}))).unwrap();
        sink.emit(StreamEvent::Progress(json!(50))).unwrap();
        sink.emit(StreamEvent::Token("a".into())).unwrap();
        sink.emit(StreamEvent::Completion(json!({"text": "a"}))).unwrap();
        assert_eq!(sink.emit(StreamEvent::Token("late".into())), Err(SinkClosed));
        assert_eq!(
            sink.emit(StreamEvent::Error(StreamFailure::new("x", "y"))),
            Err(SinkClosed)
        );

        let kinds: Vec<&str> = drain(&mut rx).iter().map(StreamEvent::kind).collect();
        assert_eq!(kinds, vec!["early-response", "progress", "token", "completion"]);
    }

    #[test]
    fn test_late_early_response_is_dropped() {
        let mgr = SessionManager::new();
        let (id, sink, _) = mgr.open();
        let mut rx = mgr.subscribe(&id).unwrap();

        sink.emit(StreamEvent::Token("t".into())).unwrap();
        sink.emit(StreamEvent::EarlyResponse(json!({}))).unwrap();
        sink.emit(StreamEvent::Completion(json!(null))).unwrap();

        let kinds: Vec<&str> = drain(&mut rx).iter().map(StreamEvent::kind).collect();
        assert_eq!(kinds, vec!["token", "completion"]);
    }

    #[tokio::test]
    async fn test_cancel_closes_sink_and_signals_upstream() {
        let mgr = SessionManager::new();
        let (id, sink, mut cancel) = mgr.open();
        let mut rx = mgr.subscribe(&id).unwrap();

        sink.emit(StreamEvent::Progress(json!(1))).unwrap();
        assert!(mgr.cancel(&id));
        assert!(cancel.is_cancelled());
        cancel.cancelled().await;

        assert_eq!(sink.emit(StreamEvent::Progress(json!(2))), Err(SinkClosed));
        assert!(!mgr.cancel(&id), "second cancel is a no-op");

        let events = drain(&mut rx);
        assert_eq!(
            events,
            vec![
                StreamEvent::Progress(json!(1)),
                StreamEvent::Error(StreamFailure::cancelled()),
            ]
        );
        // Sender dropped: the stream ends.
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn test_cancel_after_completion_is_refused() {
        let mgr = SessionManager::new();
        let (id, sink, cancel) = mgr.open();
        sink.emit(StreamEvent::Completion(json!({}))).unwrap();
        assert!(!mgr.cancel(&id));
        assert!(!cancel.is_cancelled());
    }

    #[test]
    fn test_subscribe_only_once() {
        let mgr = SessionManager::new();
        let (id, _sink, _) = mgr.open();
        assert!(mgr.subscribe(&id).is_some());
        assert!(mgr.subscribe(&id).is_none());
        assert!(mgr.subscribe(&Uuid::new_v4()).is_none());
    }

    #[test]
    fn test_events_buffer_until_subscribed() {
        let mgr = SessionManager::new();
        let (id, sink, _) = mgr.open();
        sink.emit(StreamEvent::Token("x".into())).unwrap();
        sink.emit(StreamEvent::Completion(json!({}))).unwrap();

        let mut rx = mgr.subscribe(&id).unwrap();
        assert_eq!(drain(&mut rx).len(), 2);
        // Terminal and claimed: removed on subscribe.
        assert!(mgr.is_empty());
    }

    #[test]
    fn test_dropped_subscriber_closes_sink() {
        let mgr = SessionManager::new();
        let (id, sink, _) = mgr.open();
        drop(mgr.subscribe(&id));
        assert_eq!(sink.emit(StreamEvent::Token("x".into())), Err(SinkClosed));
        assert!(!sink.is_open());
    }

    #[test]
    fn test_reap_removes_claimed_terminal_sessions() {
        let mgr = SessionManager::new();
        let (id, sink, _) = mgr.open();
        let _rx = mgr.subscribe(&id).unwrap();
        sink.emit(StreamEvent::Completion(json!({}))).unwrap();

        let (_open_id, _open_sink, _) = mgr.open();
        assert_eq!(mgr.reap(Duration::from_secs(300)), 1);
        assert_eq!(mgr.len(), 1);
    }

    #[test]
    fn test_reap_cancels_unclaimed_stale_sessions() {
        let mgr = SessionManager::new();
        let (id, _sink, cancel) = mgr.open();
        assert_eq!(mgr.reap(Duration::ZERO), 1);
        assert!(cancel.is_cancelled());
        assert!(!mgr.is_open(&id));
    }

    #[test]
    fn test_reap_cancels_session_whose_subscriber_left() {
        let mgr = SessionManager::new();
        let (id, sink, cancel) = mgr.open();
        drop(mgr.subscribe(&id).unwrap());

        // Nothing emitted since the disconnect: the sink still looks open.
        assert!(sink.is_open());
        assert_eq!(mgr.reap(Duration::from_secs(300)), 1);
        assert!(cancel.is_cancelled());
        assert!(mgr.is_empty());
    }

    #[test]
    fn test_overflow_aborts_but_terminal_is_delivered() {
        let mgr = SessionManager::with_buffer(3);
        let (id, sink, _) = mgr.open();

        for i in 0..3 {
            sink.emit(StreamEvent::Progress(json!(i))).unwrap();
        }
        assert_eq!(sink.emit(StreamEvent::Progress(json!(3))), Err(SinkClosed));
        assert!(!sink.is_open());

        let mut rx = mgr.subscribe(&id).unwrap();
        let events = drain(&mut rx);
        assert_eq!(events.len(), 4);
        assert_eq!(
            events[3],
            StreamEvent::Error(StreamFailure::new("StreamAborted", "session buffer overflow"))
        );
    }

    #[test]
    fn test_full_buffer_still_takes_completion() {
        let mgr = SessionManager::with_buffer(2);
        let (id, sink, _) = mgr.open();
        sink.emit(StreamEvent::Token("a".into())).unwrap();
        sink.emit(StreamEvent::Token("b".into())).unwrap();
        sink.emit(StreamEvent::Completion(json!({}))).unwrap();

        let mut rx = mgr.subscribe(&id).unwrap();
        let kinds: Vec<&str> = drain(&mut rx).iter().map(StreamEvent::kind).collect();
        assert_eq!(kinds, vec!["token", "token", "completion"]);
    }

    #[test]
    fn test_cancel_on_full_buffer_delivers_cancelled() {
        let mgr = SessionManager::with_buffer(1);
        let (id, sink, _) = mgr.open();
        sink.emit(StreamEvent::Progress(json!(1))).unwrap();
        assert!(mgr.cancel(&id));

        let mut rx = mgr.subscribe(&id).unwrap();
        assert_eq!(
            drain(&mut rx),
            vec![
                StreamEvent::Progress(json!(1)),
                StreamEvent::Error(StreamFailure::cancelled()),
            ]
        );
    }
}
