use serde::{Deserialize, Serialize};

use crate::ids::{ItemId, SessionId};
use crate::item::ParsedItem;
use crate::request::ContentKey;

/// Lifecycle of one generation session.
///
/// `Idle → Requesting → Streaming → {Completed, Failed, Aborted}`. The last
/// three are terminal for that session only.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Requesting,
    Streaming,
    Completed,
    Failed,
    Aborted,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Aborted)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Requesting => "requesting",
            Self::Streaming => "streaming",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Change notifications emitted while sessions run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GenerationEvent {
    /// Placeholders for the batch window are in the visible list.
    SessionStarted {
        session_id: SessionId,
        key: ContentKey,
        base_index: usize,
        slots: Vec<ItemId>,
    },

    StateChanged {
        session_id: SessionId,
        key: ContentKey,
        state: SessionState,
    },

    ItemProgress {
        session_id: SessionId,
        key: ContentKey,
        item_id: ItemId,
        slot: usize,
        progress: f64,
    },

    ItemReady {
        session_id: SessionId,
        key: ContentKey,
        item_id: ItemId,
        slot: usize,
        item: ParsedItem,
    },

    /// `warning` is set when the service returned fewer items than the window.
    Completed {
        session_id: SessionId,
        key: ContentKey,
        received: usize,
        warning: Option<String>,
    },

    Failed {
        session_id: SessionId,
        key: ContentKey,
        message: String,
        kind: String,
    },

    Aborted {
        session_id: SessionId,
        key: ContentKey,
    },
}

impl GenerationEvent {
    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::SessionStarted { session_id, .. }
            | Self::StateChanged { session_id, .. }
            | Self::ItemProgress { session_id, .. }
            | Self::ItemReady { session_id, .. }
            | Self::Completed { session_id, .. }
            | Self::Failed { session_id, .. }
            | Self::Aborted { session_id, .. } => session_id,
        }
    }

    pub fn key(&self) -> &ContentKey {
        match self {
            Self::SessionStarted { key, .. }
            | Self::StateChanged { key, .. }
            | Self::ItemProgress { key, .. }
            | Self::ItemReady { key, .. }
            | Self::Completed { key, .. }
            | Self::Failed { key, .. }
            | Self::Aborted { key, .. } => key,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::SessionStarted { .. } => "session_started",
            Self::StateChanged { .. } => "state_changed",
            Self::ItemProgress { .. } => "item_progress",
            Self::ItemReady { .. } => "item_ready",
            Self::Completed { .. } => "completed",
            Self::Failed { .. } => "failed",
            Self::Aborted { .. } => "aborted",
        }
    }

    /// True for the last event a session emits.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed { .. } | Self::Failed { .. } | Self::Aborted { .. }
        )
    }
}
