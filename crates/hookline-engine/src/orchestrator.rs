use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::StreamExt;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use hookline_core::errors::GenerationError;
use hookline_core::events::{GenerationEvent, SessionState};
use hookline_core::ids::SessionId;
use hookline_core::request::{ContentKey, GenerationRequest};
use hookline_core::service::GenerationService;
use hookline_gateway::wire::FrameDecoder;
use hookline_telemetry::MetricsRecorder;

use crate::error::EngineError;
use crate::session::{Session, SessionOutcome};
use crate::store::ItemStore;

/// Configuration for the orchestrator.
#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    /// Slots per batch window.
    pub batch_size: usize,
    /// Capacity of the event broadcast channel.
    pub event_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            batch_size: 4,
            event_capacity: 256,
        }
    }
}

/// Latest session per content type.
struct ActiveSession {
    session_id: SessionId,
    cancel: CancellationToken,
    state: watch::Receiver<SessionState>,
}

/// Caller's view of one started session.
pub struct SessionHandle {
    session_id: SessionId,
    key: ContentKey,
    state: watch::Receiver<SessionState>,
    outcome: oneshot::Receiver<SessionOutcome>,
}

impl SessionHandle {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn key(&self) -> &ContentKey {
        &self.key
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Receiver that changes on every state transition.
    pub fn watch(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Wait for the session to end.
    pub async fn wait(self) -> SessionOutcome {
        self.outcome.await.unwrap_or_else(|_| {
            SessionOutcome::Failed(GenerationError::StreamInterrupted(
                "session task ended without an outcome".into(),
            ))
        })
    }
}

/// Runs generation sessions against a [`GenerationService`] and merges their
/// results into an [`ItemStore`].
///
/// At most one session is active per content type. Starting a new one cancels
/// the previous session, and the new session touches the store only after the
/// previous one has reached a terminal state.
pub struct GenerationOrchestrator {
    service: Arc<dyn GenerationService>,
    store: Arc<ItemStore>,
    config: OrchestratorConfig,
    sessions: DashMap<String, ActiveSession>,
    last_requests: DashMap<String, GenerationRequest>,
    event_tx: broadcast::Sender<GenerationEvent>,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl GenerationOrchestrator {
    pub fn new(
        service: Arc<dyn GenerationService>,
        store: Arc<ItemStore>,
        config: OrchestratorConfig,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            service,
            store,
            config,
            sessions: DashMap::new(),
            last_requests: DashMap::new(),
            event_tx,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn store(&self) -> &Arc<ItemStore> {
        &self.store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GenerationEvent> {
        self.event_tx.subscribe()
    }

    /// Start a session for `request`, superseding any session for the same
    /// content type. Must be called within a tokio runtime.
    pub fn start(&self, request: GenerationRequest) -> SessionHandle {
        let session = Session::new(request.clone(), self.config.batch_size);
        let session_id = session.id().clone();
        let key = session.key().clone();
        let content_type = request.content_type.clone();

        let cancel = CancellationToken::new();
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        let (outcome_tx, outcome_rx) = oneshot::channel();

        self.last_requests.insert(content_type.clone(), request);
        let previous = self.sessions.insert(
            content_type.clone(),
            ActiveSession {
                session_id: session_id.clone(),
                cancel: cancel.clone(),
                state: state_rx.clone(),
            },
        );

        let previous = previous.map(|prev| {
            if !prev.state.borrow().is_terminal() {
                debug!(
                    content_type = %content_type,
                    superseded = %prev.session_id,
                    by = %session_id,
                    "superseding active session"
                );
            }
            prev.cancel.cancel();
            prev.state
        });

        let runner = SessionRunner {
            service: Arc::clone(&self.service),
            store: Arc::clone(&self.store),
            event_tx: self.event_tx.clone(),
            metrics: self.metrics.clone(),
            state_tx,
            cancel,
        };
        tokio::spawn(runner.run(session, previous, outcome_tx));

        SessionHandle {
            session_id,
            key,
            state: state_rx,
            outcome: outcome_rx,
        }
    }

    /// Cancel the active session for `content_type`. Returns false if there
    /// is none; safe to call repeatedly.
    pub fn cancel(&self, content_type: &str) -> bool {
        match self.sessions.get(content_type) {
            Some(active) if !active.state.borrow().is_terminal() => {
                active.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    pub fn cancel_all(&self) {
        for active in self.sessions.iter() {
            active.cancel.cancel();
        }
    }

    /// Run the most recent request for `content_type` again as a new session.
    pub fn retry(&self, content_type: &str) -> Result<SessionHandle, EngineError> {
        let request = self
            .last_requests
            .get(content_type)
            .map(|r| r.value().clone())
            .ok_or_else(|| EngineError::NoPreviousRequest(content_type.to_string()))?;
        info!(content_type, "retrying generation");
        Ok(self.start(request))
    }

    /// State of the latest session for `content_type`, if any was started.
    pub fn state(&self, content_type: &str) -> Option<SessionState> {
        self.sessions
            .get(content_type)
            .map(|active| *active.state.borrow())
    }

    pub fn is_active(&self, content_type: &str) -> bool {
        self.state(content_type)
            .is_some_and(|state| !state.is_terminal())
    }
}

/// Everything a spawned session task needs.
struct SessionRunner {
    service: Arc<dyn GenerationService>,
    store: Arc<ItemStore>,
    event_tx: broadcast::Sender<GenerationEvent>,
    metrics: Option<Arc<MetricsRecorder>>,
    state_tx: watch::Sender<SessionState>,
    cancel: CancellationToken,
}

impl SessionRunner {
    async fn run(
        self,
        mut session: Session,
        previous: Option<watch::Receiver<SessionState>>,
        outcome_tx: oneshot::Sender<SessionOutcome>,
    ) {
        if let Some(previous) = previous {
            wait_for_terminal(previous).await;
        }
        let started = Instant::now();

        self.drive(&mut session).await;

        let outcome = session
            .outcome()
            .cloned()
            .unwrap_or(SessionOutcome::Aborted);
        self.record(&session, &outcome, started.elapsed());
        let _ = outcome_tx.send(outcome);
    }

    #[instrument(skip_all, fields(session_id = %session.id(), key = %session.key()))]
    async fn drive(&self, session: &mut Session) {
        if self.cancel.is_cancelled() {
            return self.abort(session);
        }

        let started = session.open_window(&self.store);
        self.emit(session, vec![started]);
        self.advance(session, SessionState::Requesting);

        let body = session.request().to_body();
        let opened = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            result = self.service.open(&body) => Some(result),
        };
        let mut stream = match opened {
            None => return self.abort(session),
            Some(Err(e)) => return self.fail(session, e),
            Some(Ok(stream)) => stream,
        };

        self.advance(session, SessionState::Streaming);
        let mut decoder = FrameDecoder::new();

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return self.abort(session),
                next = stream.next() => next,
            };

            match next {
                Some(Ok(chunk)) => {
                    for frame in decoder.push(&chunk) {
                        let events = session.apply(frame, &self.store);
                        self.emit(session, events);
                        if session.is_terminal() {
                            return;
                        }
                    }
                    if self.cancel.is_cancelled() {
                        return self.abort(session);
                    }
                }
                Some(Err(e)) => return self.fail(session, e),
                None => {
                    for frame in decoder.finish() {
                        let events = session.apply(frame, &self.store);
                        self.emit(session, events);
                        if session.is_terminal() {
                            return;
                        }
                    }
                    return self.fail(session, GenerationError::StreamEndedEarly);
                }
            }
        }
    }

    fn advance(&self, session: &mut Session, next: SessionState) {
        if let Some(event) = session.advance(next) {
            self.emit(session, vec![event]);
        }
    }

    fn abort(&self, session: &mut Session) {
        debug!("session cancelled");
        let events = session.abort(&self.store);
        self.emit(session, events);
    }

    fn fail(&self, session: &mut Session, error: GenerationError) {
        warn!(error = %error, kind = error.error_kind(), "generation session failed");
        let events = session.fail(error, &self.store);
        self.emit(session, events);
    }

    /// Broadcast events, then publish the session's current state.
    fn emit(&self, session: &Session, events: Vec<GenerationEvent>) {
        for event in events {
            if self.event_tx.send(event).is_err() {
                trace!("no event receivers, event dropped");
            }
        }
        let state = session.state();
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }

    fn record(&self, session: &Session, outcome: &SessionOutcome, elapsed: Duration) {
        match outcome {
            SessionOutcome::Completed { received, warning } => info!(
                session_id = %session.id(),
                key = %session.key(),
                received,
                warning = warning.as_deref().unwrap_or(""),
                duration_ms = elapsed.as_millis() as u64,
                "generation session completed"
            ),
            SessionOutcome::Failed(_) | SessionOutcome::Aborted => debug!(
                session_id = %session.id(),
                outcome = outcome.as_str(),
                duration_ms = elapsed.as_millis() as u64,
                "generation session ended"
            ),
        }

        let Some(metrics) = &self.metrics else {
            return;
        };
        let content_type = session.key().content_type.as_str();
        metrics.counter_inc(
            "generation.sessions",
            &[("outcome", outcome.as_str()), ("content_type", content_type)],
            1,
        );
        metrics.counter_inc(
            "generation.items_parsed",
            &[("content_type", content_type)],
            session.parsed_count() as u64,
        );
        metrics.histogram_observe(
            "generation.session_duration_ms",
            &[("content_type", content_type)],
            elapsed.as_millis() as f64,
        );
        if let SessionOutcome::Completed { warning: Some(_), .. } = outcome {
            metrics.counter_inc("generation.partial_completions", &[("content_type", content_type)], 1);
        }
    }
}

async fn wait_for_terminal(mut state: watch::Receiver<SessionState>) {
    // A closed channel means the task is gone, which is terminal too.
    let _ = state.wait_for(|s| s.is_terminal()).await;
}
