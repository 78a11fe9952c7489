pub mod client;
pub mod extract;
pub mod mock;
pub mod reliable;
pub mod wire;

pub use client::{GatewayConfig, HttpGenerationService};
pub use extract::{estimate_partial_progress, extract_items};
pub use mock::{MockResponse, MockService};
pub use reliable::{BreakerState, ReliableConfig, ReliableService};
pub use wire::FrameDecoder;
