//! Edit agent: claim protocol, pipeline stages, worker loop, and
//! worker pool supervision.
//!
//! Coordination happens entirely through the job store's conditional
//! update; workers share no in-process mutable state. Edits to one
//! content item are applied in submission order, edits to different
//! items run in parallel across workers.

pub mod claim;
pub mod error;
pub mod notifier;
pub mod pipeline;
pub mod pool;
pub mod runlock;
pub mod worker;

pub use claim::Claimer;
pub use error::PipelineError;
pub use notifier::WebhookNotifier;
pub use pipeline::Pipeline;
pub use pool::WorkerPool;
pub use runlock::RunLock;
pub use worker::Worker;
