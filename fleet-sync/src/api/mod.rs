//! HTTP, SSE and WebSocket surface of fleet-sync

pub mod consistency;
pub mod health;
pub mod queue;
pub mod rate_limiter;
pub mod sse;
pub mod sync;
pub mod ws;

pub use consistency::consistency_routes;
pub use health::health_routes;
pub use queue::queue_routes;
pub use rate_limiter::rate_limiter_routes;
pub use sse::event_stream;
pub use sync::sync_routes;
pub use ws::ws_handler;
