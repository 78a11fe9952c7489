use serde::{Deserialize, Serialize};

use crate::item::ParsedItem;

/// One decoded frame of the generation wire protocol.
///
/// Ordering contract within a session: `Delta* → (Done | Error)`. Anything
/// after the first terminal frame is ignored by consumers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamFrame {
    Delta { text: String },
    Done { items: Vec<ParsedItem> },
    Error { message: String },
}

impl StreamFrame {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }

    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Delta { .. } => "delta",
            Self::Done { .. } => "done",
            Self::Error { .. } => "error",
        }
    }
}
