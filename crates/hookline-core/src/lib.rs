pub mod errors;
pub mod events;
pub mod frame;
pub mod ids;
pub mod item;
pub mod request;
pub mod service;

pub use errors::GenerationError;
pub use events::{GenerationEvent, SessionState};
pub use frame::StreamFrame;
pub use ids::{ItemId, SessionId};
pub use item::{ParsedItem, Slide};
pub use request::{ContentKey, GenerationBody, GenerationRequest};
pub use service::{ByteStream, GenerationService};
