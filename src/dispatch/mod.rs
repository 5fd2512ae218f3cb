//! Submission of inference tasks to an external reasoning service.

mod dispatcher;
mod service;

pub use dispatcher::Dispatcher;
pub use service::{OpenAiCompatibleService, ReasoningService};
