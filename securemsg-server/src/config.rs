//! Relay configuration, read from the environment with the same names
//! (upper-snake-case) the CLI flags expose.

use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(name = "securemsg-server", about = "Relay server for end-to-end encrypted messaging sessions")]
pub struct ServerConfig {
    #[arg(long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    #[arg(long, env = "MAX_MESSAGE_SIZE", default_value_t = 1_048_576)]
    pub max_message_size: usize,

    #[arg(long, env = "MESSAGE_EXPIRY", default_value_t = 7 * 24 * 60 * 60 * 1000)]
    pub message_expiry_ms: i64,

    #[arg(long, env = "MESSAGE_RATE_WINDOW", default_value_t = 60_000)]
    pub message_rate_window_ms: i64,

    #[arg(long, env = "MESSAGE_RATE_MAX", default_value_t = 100)]
    pub message_rate_max: u32,

    #[arg(long, env = "HANDSHAKE_RATE_PER_MIN", default_value_t = 10)]
    pub handshake_rate_per_min: u32,

    #[arg(long, env = "MAX_SESSIONS", default_value_t = 10_000)]
    pub max_sessions: usize,

    #[arg(long, env = "MAX_STORED_MESSAGES", default_value_t = 10_000)]
    pub max_stored_messages: usize,

    #[arg(long, env = "NONCE_TTL", default_value_t = 300_000)]
    pub nonce_ttl_ms: i64,

    #[arg(long, env = "NONCE_CAPACITY", default_value_t = 100_000)]
    pub nonce_capacity: usize,

    #[arg(long, env = "SERVER_IDENTITY_KEY_PATH", default_value = "./data/server-identity.key")]
    pub server_identity_key_path: String,
}

impl ServerConfig {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn nonce_tracker_config(&self) -> securemsg_sdk::nonce::NonceTrackerConfig {
        securemsg_sdk::nonce::NonceTrackerConfig {
            ttl_ms: self.nonce_ttl_ms,
            capacity: self.nonce_capacity,
            sweep_interval: std::time::Duration::from_secs(60),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            port: 8080,
            host: "0.0.0.0".to_string(),
            max_message_size: 1_048_576,
            message_expiry_ms: 7 * 24 * 60 * 60 * 1000,
            message_rate_window_ms: 60_000,
            message_rate_max: 100,
            handshake_rate_per_min: 10,
            max_sessions: 10_000,
            max_stored_messages: 10_000,
            nonce_ttl_ms: 300_000,
            nonce_capacity: 100_000,
            server_identity_key_path: "./data/server-identity.key".to_string(),
        }
    }
}
