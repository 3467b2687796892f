//! HTTP side of the batch message protocol and live chunk delivery to
//! WebSocket viewers.

pub mod registry;
pub mod server;

pub use registry::SubscriberRegistry;
pub use server::{build_router, start, ApiError, AppState, ServerConfig, ServerHandle};
