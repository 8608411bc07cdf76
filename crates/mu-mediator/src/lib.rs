pub mod backend;
pub mod cooldown;
pub mod core;
pub mod debounce;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod locator;
pub mod preload;
pub mod render;
pub mod session;
pub mod socket;
pub mod stream_store;
pub mod supervisor;
pub mod visibility;

/// Fan-out to every connected consumer.
#[derive(Debug, Clone)]
pub enum BroadcastMessage {
    /// Formatted WARN/ERROR log line.
    Log(String),
}
