pub mod coordinator;
pub mod handler;
pub mod messages;
pub mod pipeline;
pub mod streaming;
pub mod typing;
pub mod window;

#[cfg(test)]
mod test_support;

pub use coordinator::{ConcurrencyCoordinator, TurnGuard};
pub use handler::RelayHandler;
pub use pipeline::{PipelineParts, PipelineSettings, RequestPipeline};
pub use streaming::{StreamAggregator, StreamOutcome, StreamSettings};
pub use typing::TypingIndicator;
pub use window::{DialogWindow, DialogWindowManager};
