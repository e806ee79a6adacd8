pub mod dispatcher;
pub mod error;
pub mod idempotency;
pub mod service;

pub use dispatcher::{backoff_seconds, dispatcher_id, outbox_retention_loop, Dispatcher};
pub use error::OutboxError;
pub use service::OutboxService;
