mod settings;

pub use settings::{
    ApiConfig, AuthConfig, CoordinationConfig, LivenessConfig, PresenceConfig, RealtimeConfig,
    RedisConfig, ServerConfig, Settings,
};
