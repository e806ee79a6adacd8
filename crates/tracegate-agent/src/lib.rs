pub mod error;
pub mod handlers;
pub mod http;
pub mod metrics;
pub mod reconcile;
pub mod state;
pub mod system;
pub mod xray_api;

pub use error::{AgentError, HandlerError};
pub use http::{router, AgentState};
pub use state::AgentStateStore;
