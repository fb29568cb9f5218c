use std::net::SocketAddr;
use std::time::Duration;

/// Names of the shared records every relay process agrees on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keyspace {
    /// hash: session id -> resource id of the bound connection
    pub sessions: String,
    /// hash: session id -> display name
    pub users: String,
    /// hash: session id -> last activity (unix seconds)
    pub active_sessions: String,
    /// list of serialized `message` events
    pub history: String,
    /// pub/sub channel shared by all processes
    pub channel: String,
    /// string key written by the health probe
    pub probe: String,
}

impl Default for Keyspace {
    fn default() -> Self {
        Self {
            sessions: "sessions".to_string(),
            users: "users".to_string(),
            active_sessions: "active_sessions".to_string(),
            history: "chat_history".to_string(),
            channel: "chat_channel".to_string(),
            probe: "greeting".to_string(),
        }
    }
}

impl Keyspace {
    /// Prefix every stored key; the channel name is taken as given.
    pub fn with_prefix(prefix: &str, channel: impl Into<String>) -> Self {
        let defaults = Self::default();
        Self {
            sessions: format!("{prefix}{}", defaults.sessions),
            users: format!("{prefix}{}", defaults.users),
            active_sessions: format!("{prefix}{}", defaults.active_sessions),
            history: format!("{prefix}{}", defaults.history),
            channel: channel.into(),
            probe: format!("{prefix}{}", defaults.probe),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub redis_url: String,
    pub keyspace: Keyspace,
    pub history_limit: usize,
    pub session_lifetime: Duration,
    pub sweep_interval: Duration,
    pub resubscribe_backoff: Duration,
    pub shutdown_grace: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 7654)),
            redis_url: "redis://127.0.0.1:6379".to_string(),
            keyspace: Keyspace::default(),
            history_limit: 100,
            session_lifetime: Duration::from_secs(240),
            sweep_interval: Duration::from_secs(60),
            resubscribe_backoff: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}
