use std::env;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use uuid::Uuid;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub redis: RedisConfig,
    pub api: ApiConfig,
    #[serde(default)]
    pub realtime: RealtimeConfig,
    #[serde(default)]
    pub liveness: LivenessConfig,
    #[serde(default)]
    pub presence: PresenceConfig,
    #[serde(default)]
    pub coordination: CoordinationConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub issuer: Option<String>,
    pub audience: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub key: Option<String>,
}

/// Transport-level tuning shared by the WebSocket and SSE adapters.
#[derive(Debug, Clone, Deserialize)]
pub struct RealtimeConfig {
    /// Capacity of the per-connection outbound queue. A full queue
    /// disconnects the connection rather than blocking fan-out.
    #[serde(default = "default_outbound_queue_size")]
    pub outbound_queue_size: usize,
    /// Upper bound on token verification during the handshake.
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
    /// Reconnect delay hint (milliseconds) sent in `reconnect` envelopes.
    #[serde(default = "default_reconnect_retry_ms")]
    pub reconnect_retry_ms: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_max_connections_per_user")]
    pub max_connections_per_user: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LivenessConfig {
    /// Idle threshold for bidirectional (WebSocket) connections.
    #[serde(default = "default_ws_idle")]
    pub ws_idle_secs: u64,
    /// Idle threshold for unidirectional (SSE) connections. Higher than
    /// the WebSocket threshold since SSE cannot carry client pongs.
    #[serde(default = "default_sse_idle")]
    pub sse_idle_secs: u64,
    /// How often the monitor sweeps connections.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// How often mirrored state in the coordination store gets its TTL
    /// re-asserted.
    #[serde(default = "default_mirror_refresh")]
    pub mirror_refresh_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PresenceConfig {
    /// TTL of mirrored presence records in the coordination store.
    #[serde(default = "default_presence_ttl")]
    pub ttl_secs: u64,
    /// Delay before a disconnect is reflected as offline. Zero means the
    /// transition is immediate.
    #[serde(default)]
    pub offline_grace_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CoordinationConfig {
    /// Unique identifier for this server instance, used to suppress
    /// redelivery of this instance's own fan-out publishes.
    #[serde(default = "default_server_id")]
    pub server_id: String,
    /// Prefix for all coordination store keys and topics.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// TTL re-asserted on mirrored state (channel membership sets). Bounds
    /// how long a crashed instance's entries linger.
    #[serde(default = "default_mirror_ttl")]
    pub mirror_ttl_secs: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8081
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_outbound_queue_size() -> usize {
    64
}

fn default_handshake_timeout() -> u64 {
    5
}

fn default_reconnect_retry_ms() -> u64 {
    5000
}

fn default_max_connections() -> usize {
    10000
}

fn default_max_connections_per_user() -> usize {
    5
}

fn default_ws_idle() -> u64 {
    30
}

fn default_sse_idle() -> u64 {
    60
}

fn default_sweep_interval() -> u64 {
    5
}

fn default_mirror_refresh() -> u64 {
    60
}

fn default_mirror_ttl() -> u64 {
    300
}

fn default_presence_ttl() -> u64 {
    300
}

fn default_server_id() -> String {
    format!("vantage-{}", Uuid::new_v4().simple())
}

fn default_key_prefix() -> String {
    "vantage".to_string()
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if exists
        let _ = dotenvy::dotenv();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            // Start with default values
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8081)?
            .set_default("redis.url", "redis://localhost:6379")?
            .set_default("realtime.outbound_queue_size", 64)?
            .set_default("liveness.ws_idle_secs", 30)?
            .set_default("liveness.sse_idle_secs", 60)?
            .set_default("presence.ttl_secs", 300)?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // Load from environment variables
            // SERVER_HOST, SERVER_PORT, AUTH_JWT_SECRET, REDIS_URL, etc.
            .add_source(
                Environment::default()
                    .separator("_")
                    .try_parsing(true)
                    .list_separator(","),
            );

        builder.build()?.try_deserialize()
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

impl RealtimeConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

impl LivenessConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn mirror_refresh(&self) -> Duration {
        Duration::from_secs(self.mirror_refresh_secs)
    }
}

impl PresenceConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn offline_grace(&self) -> Duration {
        Duration::from_secs(self.offline_grace_secs)
    }
}

impl CoordinationConfig {
    pub fn mirror_ttl(&self) -> Duration {
        Duration::from_secs(self.mirror_ttl_secs)
    }

    /// Key holding the mirrored membership set of a channel.
    pub fn channel_members_key(&self, channel: &str) -> String {
        format!("{}:channels:{}", self.key_prefix, channel)
    }

    /// Prefix under which presence records are mirrored.
    pub fn presence_prefix(&self) -> String {
        format!("{}:presence", self.key_prefix)
    }

    /// Topic carrying channel-scoped fan-out events.
    pub fn channel_topic(&self) -> String {
        format!("{}:fanout:channel", self.key_prefix)
    }

    /// Topic carrying tenant-wide broadcast events.
    pub fn tenant_topic(&self) -> String {
        format!("{}:fanout:tenant", self.key_prefix)
    }

    /// Topic carrying user-directed events.
    pub fn user_topic(&self) -> String {
        format!("{}:fanout:user", self.key_prefix)
    }

    pub fn fanout_topics(&self) -> Vec<String> {
        vec![
            self.channel_topic(),
            self.tenant_topic(),
            self.user_topic(),
        ]
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: vec![],
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
        }
    }
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            outbound_queue_size: default_outbound_queue_size(),
            handshake_timeout_secs: default_handshake_timeout(),
            reconnect_retry_ms: default_reconnect_retry_ms(),
            max_connections: default_max_connections(),
            max_connections_per_user: default_max_connections_per_user(),
        }
    }
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            ws_idle_secs: default_ws_idle(),
            sse_idle_secs: default_sse_idle(),
            sweep_interval_secs: default_sweep_interval(),
            mirror_refresh_secs: default_mirror_refresh(),
        }
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_presence_ttl(),
            offline_grace_secs: 0,
        }
    }
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            server_id: default_server_id(),
            key_prefix: default_key_prefix(),
            mirror_ttl_secs: default_mirror_ttl(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let server = ServerConfig::default();
        assert_eq!(server.host, "0.0.0.0");
        assert_eq!(server.port, 8081);

        let liveness = LivenessConfig::default();
        assert_eq!(liveness.ws_idle_secs, 30);
        assert_eq!(liveness.sse_idle_secs, 60);

        let presence = PresenceConfig::default();
        assert_eq!(presence.ttl_secs, 300);
        assert_eq!(presence.offline_grace_secs, 0);
    }

    #[test]
    fn test_coordination_keys() {
        let config = CoordinationConfig {
            server_id: "vantage-test".to_string(),
            key_prefix: "vantage".to_string(),
            mirror_ttl_secs: 300,
        };

        assert_eq!(
            config.channel_members_key("t1:metrics"),
            "vantage:channels:t1:metrics"
        );
        assert_eq!(config.presence_prefix(), "vantage:presence");
        assert_eq!(config.channel_topic(), "vantage:fanout:channel");
        assert_eq!(config.fanout_topics().len(), 3);
    }

    #[test]
    fn test_server_id_is_unique() {
        let a = CoordinationConfig::default();
        let b = CoordinationConfig::default();
        assert_ne!(a.server_id, b.server_id);
        assert!(a.server_id.starts_with("vantage-"));
    }
}
