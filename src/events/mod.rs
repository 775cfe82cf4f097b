pub mod models;
pub mod queue;

pub use models::{names, IntegrationEvent};
pub use queue::EventPublishingQueue;
