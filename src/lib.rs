// Infrastructure layer (shared components)
pub mod infrastructure;

// Re-export infrastructure modules for convenience
pub use infrastructure::auth;
pub use infrastructure::config;
pub use infrastructure::error;
pub use infrastructure::metrics;
pub use infrastructure::redis;

// Domain layer (business logic)
pub mod channel;
pub mod coordination;
pub mod events;
pub mod fanout;
pub mod liveness;
pub mod presence;
pub mod protocol;
pub mod registry;

// Application layer
pub mod api;
pub mod server;
pub mod transport;

// Supporting modules
pub mod shutdown;
