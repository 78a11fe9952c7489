use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque string id carrying a type prefix, e.g. `sess_0190...`.
macro_rules! prefixed_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub const PREFIX: &'static str = $prefix;

            /// Fresh id; v7 uuids sort by creation time.
            pub fn new() -> Self {
                Self(format!("{}_{}", Self::PREFIX, Uuid::now_v7().simple()))
            }

            pub fn from_raw(raw: impl Into<String>) -> Self {
                Self(raw.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// The id without its prefix.
            pub fn stem(&self) -> &str {
                self.0
                    .strip_prefix(Self::PREFIX)
                    .and_then(|rest| rest.strip_prefix('_'))
                    .unwrap_or(&self.0)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(raw: String) -> Self {
                Self(raw)
            }
        }
    };
}

prefixed_id!(
    /// One run of a generation request.
    SessionId,
    "sess"
);
prefixed_id!(
    /// One entry of a visible list.
    ItemId,
    "item"
);

impl ItemId {
    /// Identity of one slot of a session's batch window. The same session and
    /// slot always give the same id.
    pub fn for_slot(session_id: &SessionId, slot: usize) -> Self {
        Self(format!("{}_{}_{slot}", Self::PREFIX, session_id.stem()))
    }
}
