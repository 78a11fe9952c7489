pub mod error;
pub mod orchestrator;
pub mod pool;
pub mod session;
pub mod store;

pub use error::EngineError;
pub use orchestrator::{GenerationOrchestrator, OrchestratorConfig, SessionHandle};
pub use pool::for_each_bounded;
pub use session::{BatchWindow, Session, SessionOutcome};
pub use store::{ItemStatus, ItemStore, Placement, VisibleItem};
