mod health;
mod metrics;
mod publish;
mod routes;

pub use health::{health, stats, StatsResponse};
pub use metrics::prometheus_metrics;
pub use publish::{publish_channel, publish_tenant, publish_user};
pub use routes::api_routes;
