//! One generation session as a plain state machine.
//!
//! The session owns its output buffer and batch window and turns frames into
//! identity-scoped store writes plus the events describing them. It does no
//! I/O; the orchestrator drives it from the wire.

use tracing::{debug, trace};

use hookline_core::errors::GenerationError;
use hookline_core::events::{GenerationEvent, SessionState};
use hookline_core::frame::StreamFrame;
use hookline_core::ids::{ItemId, SessionId};
use hookline_core::item::ParsedItem;
use hookline_core::request::{ContentKey, GenerationRequest};
use hookline_gateway::extract::{estimate_partial_progress, extract_items};

use crate::error::EngineError;
use crate::store::{ItemStore, Placement};

/// How a session ended.
#[derive(Clone, Debug)]
pub enum SessionOutcome {
    Completed {
        received: usize,
        warning: Option<String>,
    },
    Failed(GenerationError),
    Aborted,
}

impl SessionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed { .. } => "completed",
            Self::Failed(_) => "failed",
            Self::Aborted => "aborted",
        }
    }

    pub fn state(&self) -> SessionState {
        match self {
            Self::Completed { .. } => SessionState::Completed,
            Self::Failed(_) => SessionState::Failed,
            Self::Aborted => SessionState::Aborted,
        }
    }

    /// Number of items received, or the reason the session produced none.
    pub fn into_result(self) -> Result<usize, EngineError> {
        match self {
            Self::Completed { received, .. } => Ok(received),
            Self::Failed(e) => Err(EngineError::Generation(e)),
            Self::Aborted => Err(EngineError::Aborted),
        }
    }
}

#[derive(Clone, Debug)]
struct Slot {
    id: ItemId,
    filled: bool,
}

/// The `K` slots of the visible list a session owns.
#[derive(Clone, Debug)]
pub struct BatchWindow {
    base_index: usize,
    slots: Vec<Slot>,
}

impl BatchWindow {
    fn new(session_id: &SessionId, size: usize) -> Self {
        Self {
            base_index: 0,
            slots: (0..size)
                .map(|slot| Slot {
                    id: ItemId::for_slot(session_id, slot),
                    filled: false,
                })
                .collect(),
        }
    }

    pub fn base_index(&self) -> usize {
        self.base_index
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn ids(&self) -> Vec<ItemId> {
        self.slots.iter().map(|s| s.id.clone()).collect()
    }

    pub fn id(&self, slot: usize) -> Option<&ItemId> {
        self.slots.get(slot).map(|s| &s.id)
    }

    fn unfilled_ids(&self) -> Vec<ItemId> {
        self.slots
            .iter()
            .filter(|s| !s.filled)
            .map(|s| s.id.clone())
            .collect()
    }
}

pub struct Session {
    id: SessionId,
    request: GenerationRequest,
    key: ContentKey,
    window: BatchWindow,
    opened: bool,
    output: String,
    parsed: usize,
    last_progress: f64,
    state: SessionState,
    terminal_seen: bool,
    outcome: Option<SessionOutcome>,
}

impl Session {
    pub fn new(request: GenerationRequest, batch_size: usize) -> Self {
        let id = SessionId::new();
        let key = request.key();
        let window = BatchWindow::new(&id, batch_size);
        Self {
            id,
            request,
            key,
            window,
            opened: false,
            output: String::new(),
            parsed: 0,
            last_progress: 0.0,
            state: SessionState::Idle,
            terminal_seen: false,
            outcome: None,
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn key(&self) -> &ContentKey {
        &self.key
    }

    pub fn request(&self) -> &GenerationRequest {
        &self.request
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn window(&self) -> &BatchWindow {
        &self.window
    }

    /// Items parsed from the streamed output so far.
    pub fn parsed_count(&self) -> usize {
        self.parsed
    }

    pub fn outcome(&self) -> Option<&SessionOutcome> {
        self.outcome.as_ref()
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Insert the window's loading placeholders. Forced new batches go to the
    /// front of the list, everything else to the back.
    pub fn open_window(&mut self, store: &ItemStore) -> GenerationEvent {
        let placement = if self.request.force_new_batch {
            Placement::Front
        } else {
            Placement::Back
        };
        let ids = self.window.ids();
        self.window.base_index = store.insert_placeholders(&self.key, placement, &ids);
        self.opened = true;

        debug!(
            session_id = %self.id,
            key = %self.key,
            base_index = self.window.base_index,
            slots = ids.len(),
            "batch window opened"
        );

        GenerationEvent::SessionStarted {
            session_id: self.id.clone(),
            key: self.key.clone(),
            base_index: self.window.base_index,
            slots: ids,
        }
    }

    /// Move to a non-terminal state. Returns the event, or `None` if nothing
    /// changed or the session already ended.
    pub fn advance(&mut self, next: SessionState) -> Option<GenerationEvent> {
        if self.is_terminal() || self.state == next || next.is_terminal() {
            return None;
        }
        self.state = next;
        Some(self.state_event())
    }

    /// Process one frame. Anything after the first terminal frame is ignored.
    pub fn apply(&mut self, frame: StreamFrame, store: &ItemStore) -> Vec<GenerationEvent> {
        if self.terminal_seen || self.is_terminal() {
            trace!(session_id = %self.id, frame = frame.kind(), "ignoring frame after terminal");
            return Vec::new();
        }

        match frame {
            StreamFrame::Delta { text } => self.on_delta(&text, store),
            StreamFrame::Done { items } => {
                self.terminal_seen = true;
                self.on_done(items, store)
            }
            StreamFrame::Error { message } => {
                self.terminal_seen = true;
                self.on_error(message, store)
            }
        }
    }

    fn on_delta(&mut self, text: &str, store: &ItemStore) -> Vec<GenerationEvent> {
        self.output.push_str(text);
        let mut events = Vec::new();

        let items = extract_items(&self.output);
        for item in items.into_iter().skip(self.parsed) {
            let slot = self.parsed;
            self.parsed += 1;
            let Some(entry) = self.window.slots.get_mut(slot) else {
                debug!(session_id = %self.id, slot, "item beyond batch window dropped");
                continue;
            };
            entry.filled = true;
            let id = entry.id.clone();
            if !store.fill(&self.key, &id, item.clone()) {
                debug!(session_id = %self.id, item_id = %id, "slot no longer visible");
            }
            self.last_progress = 0.0;
            events.push(GenerationEvent::ItemReady {
                session_id: self.id.clone(),
                key: self.key.clone(),
                item_id: id,
                slot,
                item,
            });
        }

        let slot = self.parsed;
        if let Some(id) = self.window.id(slot).cloned() {
            let progress = estimate_partial_progress(&self.output);
            if progress > self.last_progress {
                self.last_progress = progress;
                store.set_progress(&self.key, &id, progress);
                events.push(GenerationEvent::ItemProgress {
                    session_id: self.id.clone(),
                    key: self.key.clone(),
                    item_id: id,
                    slot,
                    progress,
                });
            }
        }

        events
    }

    fn on_done(&mut self, items: Vec<ParsedItem>, store: &ItemStore) -> Vec<GenerationEvent> {
        let window_size = self.window.len();
        if items.len() > window_size {
            debug!(
                session_id = %self.id,
                received = items.len(),
                window = window_size,
                "dropping items beyond batch window"
            );
        }

        let mut events = Vec::new();
        let mut received = 0;
        let mut items = items.into_iter();
        for slot in 0..window_size {
            let id = self.window.slots[slot].id.clone();
            match items.next() {
                Some(item) => {
                    received += 1;
                    self.window.slots[slot].filled = true;
                    store.fill(&self.key, &id, item.clone());
                    events.push(GenerationEvent::ItemReady {
                        session_id: self.id.clone(),
                        key: self.key.clone(),
                        item_id: id,
                        slot,
                        item,
                    });
                }
                None => {
                    store.remove(&self.key, &[id]);
                }
            }
        }
        self.window.slots.truncate(received);

        let warning = (received < window_size)
            .then(|| format!("received {received} of {window_size} items"));

        self.finish(SessionOutcome::Completed {
            received,
            warning: warning.clone(),
        });
        events.push(self.state_event());
        events.push(GenerationEvent::Completed {
            session_id: self.id.clone(),
            key: self.key.clone(),
            received,
            warning,
        });
        events
    }

    fn on_error(&mut self, message: String, store: &ItemStore) -> Vec<GenerationEvent> {
        let unfilled = self.window.unfilled_ids();
        store.remove(&self.key, &unfilled);
        self.window.slots.retain(|s| s.filled);

        self.fail_with(GenerationError::Protocol(message))
    }

    /// Transport failure, timeout or early end: the whole window goes away.
    pub fn fail(&mut self, error: GenerationError, store: &ItemStore) -> Vec<GenerationEvent> {
        if self.is_terminal() {
            return Vec::new();
        }
        self.discard_window(store);
        self.fail_with(error)
    }

    /// Cancellation: discard the window, no error.
    pub fn abort(&mut self, store: &ItemStore) -> Vec<GenerationEvent> {
        if self.is_terminal() {
            return Vec::new();
        }
        self.discard_window(store);
        self.finish(SessionOutcome::Aborted);
        vec![
            self.state_event(),
            GenerationEvent::Aborted {
                session_id: self.id.clone(),
                key: self.key.clone(),
            },
        ]
    }

    fn fail_with(&mut self, error: GenerationError) -> Vec<GenerationEvent> {
        let message = error.to_string();
        let kind = error.error_kind().to_string();
        self.finish(SessionOutcome::Failed(error));
        vec![
            self.state_event(),
            GenerationEvent::Failed {
                session_id: self.id.clone(),
                key: self.key.clone(),
                message,
                kind,
            },
        ]
    }

    fn discard_window(&mut self, store: &ItemStore) {
        if self.opened {
            let removed = store.remove(&self.key, &self.window.ids());
            trace!(session_id = %self.id, removed, "batch window discarded");
        }
        self.window.slots.clear();
    }

    fn finish(&mut self, outcome: SessionOutcome) {
        self.state = outcome.state();
        self.outcome = Some(outcome);
    }

    fn state_event(&self) -> GenerationEvent {
        GenerationEvent::StateChanged {
            session_id: self.id.clone(),
            key: self.key.clone(),
            state: self.state,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ItemStatus;

    fn request() -> GenerationRequest {
        GenerationRequest::new("videos", "luxury", "pool")
    }

    #[test]
    fn outcome_into_result() {
        let done = SessionOutcome::Completed {
            received: 3,
            warning: Some("received 3 of 4 items".into()),
        };
        assert_eq!(done.into_result().unwrap(), 3);
        assert!(matches!(
            SessionOutcome::Aborted.into_result(),
            Err(EngineError::Aborted)
        ));
        let failed = SessionOutcome::Failed(GenerationError::Protocol("quota".into()));
        assert!(matches!(
            failed.into_result(),
            Err(EngineError::Generation(GenerationError::Protocol(_)))
        ));
    }

    fn item(hook: &str) -> ParsedItem {
        ParsedItem {
            hook: Some(hook.into()),
            caption: Some(format!("{hook} caption")),
            ..Default::default()
        }
    }

    fn delta(text: &str) -> StreamFrame {
        StreamFrame::Delta { text: text.into() }
    }

    fn started(store: &ItemStore) -> Session {
        let mut session = Session::new(request(), 4);
        session.open_window(store);
        session.advance(SessionState::Requesting);
        session.advance(SessionState::Streaming);
        session
    }

    fn event_types(events: &[GenerationEvent]) -> Vec<&'static str> {
        events.iter().map(GenerationEvent::event_type).collect()
    }

    #[test]
    fn slot_ids_are_stable_and_derived_from_session() {
        let session = Session::new(request(), 4);
        let ids = session.window().ids();
        assert_eq!(ids.len(), 4);
        for (slot, id) in ids.iter().enumerate() {
            assert_eq!(id, &ItemId::for_slot(session.id(), slot));
        }
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn open_window_appends_by_default() {
        let store = ItemStore::new();
        store.seed(request().key(), vec![item("old")]);
        let mut session = Session::new(request(), 4);

        let event = session.open_window(&store);
        assert!(matches!(event, GenerationEvent::SessionStarted { base_index: 1, .. }));
        assert_eq!(session.window().base_index(), 1);
        let snapshot = store.snapshot(session.key());
        assert_eq!(snapshot.len(), 5);
        assert_eq!(snapshot[1].id, ItemId::for_slot(session.id(), 0));
    }

    #[test]
    fn open_window_prepends_forced_batch() {
        let store = ItemStore::new();
        store.seed(request().key(), vec![item("old")]);
        let mut session = Session::new(request().new_batch(), 4);

        session.open_window(&store);
        assert_eq!(session.window().base_index(), 1);
        let snapshot = store.snapshot(session.key());
        assert_eq!(snapshot[0].id, ItemId::for_slot(session.id(), 0));
        assert_eq!(snapshot[4].item.as_ref().unwrap().hook.as_deref(), Some("old"));
    }

    #[test]
    fn advance_ignores_repeats() {
        let mut session = Session::new(request(), 4);
        assert!(session.advance(SessionState::Requesting).is_some());
        assert!(session.advance(SessionState::Requesting).is_none());
        assert!(session.advance(SessionState::Completed).is_none());
        assert_eq!(session.state(), SessionState::Requesting);
    }

    #[test]
    fn delta_fills_slots_in_extraction_order() {
        let store = ItemStore::new();
        let mut session = started(&store);

        let text = serde_json::to_string(&vec![item("a"), item("b")]).unwrap();
        // Cut inside the first object.
        let (first, second) = text.split_at(10);

        let events = session.apply(delta(first), &store);
        assert!(!event_types(&events).contains(&"item_ready"));

        let events = session.apply(delta(second), &store);
        let ready: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                GenerationEvent::ItemReady { slot, item, .. } => Some((*slot, item.hook.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(ready, vec![(0, Some("a".to_string())), (1, Some("b".to_string()))]);
        assert_eq!(session.parsed_count(), 2);

        let snapshot = store.snapshot(session.key());
        assert_eq!(snapshot[0].item.as_ref().unwrap().hook.as_deref(), Some("a"));
        assert_eq!(snapshot[1].item.as_ref().unwrap().hook.as_deref(), Some("b"));
        assert!(snapshot[2].is_loading());
        assert!(snapshot[3].is_loading());
    }

    #[test]
    fn progress_goes_to_first_unfilled_slot() {
        let store = ItemStore::new();
        let mut session = started(&store);
        let ids = session.window().ids();

        session.apply(delta(r#"[{"hook":"a"},{"hook":"b","caption":"c"#), &store);

        assert_eq!(store.get(session.key(), &ids[0]).unwrap().status, ItemStatus::Ready);
        assert_eq!(
            store.get(session.key(), &ids[1]).unwrap().status,
            ItemStatus::Loading { progress: 0.5 }
        );
        assert_eq!(store.get(session.key(), &ids[2]).unwrap().progress(), 0.0);
    }

    #[test]
    fn progress_events_only_on_increase() {
        let store = ItemStore::new();
        let mut session = started(&store);

        let events = session.apply(delta(r#"[{"hook":"#), &store);
        assert_eq!(event_types(&events), vec!["item_progress"]);

        let events = session.apply(delta(r#""still typing"#), &store);
        assert!(events.is_empty());

        let events = session.apply(delta(r#"","caption":"x"#), &store);
        assert!(matches!(
            events.as_slice(),
            [GenerationEvent::ItemProgress { progress, slot: 0, .. }] if *progress == 0.5
        ));
    }

    #[test]
    fn malformed_object_is_skipped_not_slotted() {
        let store = ItemStore::new();
        let mut session = started(&store);

        session.apply(delta(r#"[{"hook": 7}, {"hook":"ok"}]"#), &store);
        assert_eq!(session.parsed_count(), 1);
        let snapshot = store.snapshot(session.key());
        assert_eq!(snapshot[0].item.as_ref().unwrap().hook.as_deref(), Some("ok"));
        assert_eq!(session.state(), SessionState::Streaming);
    }

    #[test]
    fn done_overwrites_by_position() {
        let store = ItemStore::new();
        let mut session = started(&store);
        let ids = session.window().ids();

        session.apply(delta(r#"[{"hook":"draft"}"#), &store);
        let finals: Vec<_> = ["w", "x", "y", "z"].into_iter().map(item).collect();
        let events = session.apply(StreamFrame::Done { items: finals.clone() }, &store);

        assert_eq!(session.state(), SessionState::Completed);
        assert!(matches!(
            events.last(),
            Some(GenerationEvent::Completed { received: 4, warning: None, .. })
        ));
        let snapshot = store.snapshot(session.key());
        assert_eq!(snapshot.len(), 4);
        for (slot, entry) in snapshot.iter().enumerate() {
            assert_eq!(entry.id, ids[slot]);
            assert_eq!(entry.item.as_ref(), Some(&finals[slot]));
        }
    }

    #[test]
    fn short_done_removes_rest_and_warns() {
        let store = ItemStore::new();
        store.seed(request().key(), vec![item("old")]);
        let mut session = started(&store);

        let both = vec![item("a"), item("b")];
        let text = serde_json::to_string(&both).unwrap();
        session.apply(delta(&text), &store);
        let events = session.apply(StreamFrame::Done { items: both.clone() }, &store);

        assert_eq!(store.len(session.key()), 3);
        assert_eq!(session.window().len(), 2);
        match events.last() {
            Some(GenerationEvent::Completed { received, warning, .. }) => {
                assert_eq!(*received, 2);
                assert_eq!(warning.as_deref(), Some("received 2 of 4 items"));
            }
            other => panic!("expected completed, got {other:?}"),
        }
        assert!(matches!(
            session.outcome(),
            Some(SessionOutcome::Completed { received: 2, warning: Some(_) })
        ));
    }

    #[test]
    fn done_with_extra_items_keeps_window_size() {
        let store = ItemStore::new();
        let mut session = started(&store);
        let finals: Vec<_> = (0..6).map(|i| item(&i.to_string())).collect();

        session.apply(StreamFrame::Done { items: finals }, &store);
        assert_eq!(store.len(session.key()), 4);
        assert!(matches!(
            session.outcome(),
            Some(SessionOutcome::Completed { received: 4, warning: None })
        ));
    }

    #[test]
    fn error_frame_keeps_parsed_and_drops_placeholders() {
        let store = ItemStore::new();
        let mut session = started(&store);

        session.apply(delta(r#"[{"hook":"kept"},{"hook":"half"#), &store);
        let events = session.apply(StreamFrame::Error { message: "model overloaded".into() }, &store);

        assert_eq!(session.state(), SessionState::Failed);
        let snapshot = store.snapshot(session.key());
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].item.as_ref().unwrap().hook.as_deref(), Some("kept"));
        match events.last() {
            Some(GenerationEvent::Failed { message, kind, .. }) => {
                assert_eq!(message, "model overloaded");
                assert_eq!(kind, "protocol");
            }
            other => panic!("expected failed, got {other:?}"),
        }
    }

    #[test]
    fn frames_after_terminal_are_ignored() {
        let store = ItemStore::new();
        let mut session = started(&store);
        let finals = vec![item("a"), item("b"), item("c"), item("d")];
        session.apply(StreamFrame::Done { items: finals }, &store);
        let before = store.snapshot(session.key());

        assert!(session.apply(delta(r#"[{"hook":"late"}]"#), &store).is_empty());
        assert!(session
            .apply(StreamFrame::Error { message: "late".into() }, &store)
            .is_empty());
        assert!(session.apply(StreamFrame::Done { items: vec![] }, &store).is_empty());

        assert_eq!(session.state(), SessionState::Completed);
        assert_eq!(store.snapshot(session.key()), before);
    }

    #[test]
    fn transport_failure_discards_whole_window() {
        let store = ItemStore::new();
        let seeded = store.seed(request().key(), vec![item("old")]);
        let mut session = started(&store);
        session.apply(delta(r#"[{"hook":"parsed"}"#), &store);

        let events = session.fail(GenerationError::StreamEndedEarly, &store);
        assert_eq!(event_types(&events), vec!["state_changed", "failed"]);
        assert_eq!(session.state(), SessionState::Failed);

        let remaining: Vec<_> = store.snapshot(session.key()).into_iter().map(|e| e.id).collect();
        assert_eq!(remaining, seeded);
        assert!(matches!(
            session.outcome(),
            Some(SessionOutcome::Failed(GenerationError::StreamEndedEarly))
        ));
    }

    #[test]
    fn abort_is_silent_and_idempotent() {
        let store = ItemStore::new();
        let mut session = started(&store);

        let events = session.abort(&store);
        assert_eq!(event_types(&events), vec!["state_changed", "aborted"]);
        assert!(store.is_empty(session.key()));

        assert!(session.abort(&store).is_empty());
        assert!(session.fail(GenerationError::Cancelled, &store).is_empty());
        assert_eq!(session.state(), SessionState::Aborted);
    }

    #[test]
    fn abort_before_window_touches_nothing() {
        let store = ItemStore::new();
        let seeded = store.seed(request().key(), vec![item("old")]);
        let mut session = Session::new(request(), 4);

        session.abort(&store);
        let remaining: Vec<_> = store.snapshot(session.key()).into_iter().map(|e| e.id).collect();
        assert_eq!(remaining, seeded);
    }
}
