use drumsheet_core::config::{self, ENV_HOST, ENV_PORT};

/// Server configuration loaded from environment variables, with
/// defaults suitable for the local desktop shell.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address (default: `127.0.0.1`).
    pub host: String,
    /// Bind port (default: `8000`).
    pub port: u16,
    /// HTTP request timeout in seconds (default: `120`; capture jobs
    /// themselves run in the background and are not bounded by this).
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8000,
            request_timeout_secs: 120,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: config::env_string(ENV_HOST).unwrap_or(defaults.host),
            port: config::env_string(ENV_PORT)
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(defaults.port),
            request_timeout_secs: defaults.request_timeout_secs,
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_local_shell() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr(), "127.0.0.1:8000");
    }
}
