//! Process configuration (flags with environment fallbacks).

use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Parser)]
#[command(name = "blackbox-gateway", version, about = "MCP gateway over stdio")]
pub struct Cli {
    /// Backend descriptor file (JSON or YAML). A missing file means no backends.
    #[arg(long, env = "BLACKBOX_CONFIG", default_value = "external_mcps.json")]
    pub config: PathBuf,

    /// Log filter, e.g. `info` or `blackbox_gateway=debug`. `RUST_LOG` wins when set.
    #[arg(long, env = "BLACKBOX_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[arg(long, env = "BLACKBOX_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// Bind address for the OAuth redirect listener (disabled when unset).
    #[arg(long, env = "BLACKBOX_CALLBACK_BIND")]
    pub callback_bind: Option<SocketAddr>,

    /// How long a started authorization may wait for its callback.
    #[arg(long, env = "BLACKBOX_AUTHORIZATION_TTL_SECS", default_value_t = 600)]
    pub authorization_ttl_secs: u64,

    #[arg(long, env = "BLACKBOX_HTTP_CONNECT_TIMEOUT_SECS", default_value_t = 10)]
    pub http_connect_timeout_secs: u64,
}

impl Cli {
    #[must_use]
    pub fn authorization_ttl(&self) -> Duration {
        Duration::from_secs(self.authorization_ttl_secs)
    }

    /// `None` when set to 0.
    #[must_use]
    pub fn http_connect_timeout(&self) -> Option<Duration> {
        (self.http_connect_timeout_secs > 0)
            .then(|| Duration::from_secs(self.http_connect_timeout_secs))
    }
}
