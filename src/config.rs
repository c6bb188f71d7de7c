use std::time::Duration;

pub const DEFAULT_TOKEN_TTL_SECONDS: u64 = 10 * 60;
pub const DEFAULT_SWEEP_INTERVAL_SECONDS: u64 = 60;
pub const DEFAULT_TOMBSTONE_RETENTION_SECONDS: u64 = 60 * 60;
pub const DEFAULT_STREAM_BUFFER_CHUNKS: usize = 16;
pub const DEFAULT_RESOLVE_TIMEOUT_SECONDS: u64 = 180;
pub const DEFAULT_SHUTDOWN_GRACE_SECONDS: u64 = 10;
const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8787";

/// Process-wide settings, read once at startup.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind_addr: String,
    pub token_ttl: Duration,
    pub sweep_interval: Duration,
    pub tombstone_retention: Duration,
    pub stream_buffer_chunks: usize,
    pub resolve_timeout: Duration,
    /// How long open downloads may keep the server alive after shutdown starts.
    pub shutdown_grace: Duration,
    /// Program followed by any leading arguments.
    pub yt_dlp_command: Vec<String>,
    pub allowed_origins: Vec<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            token_ttl: Duration::from_secs(DEFAULT_TOKEN_TTL_SECONDS),
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECONDS),
            tombstone_retention: Duration::from_secs(DEFAULT_TOMBSTONE_RETENTION_SECONDS),
            stream_buffer_chunks: DEFAULT_STREAM_BUFFER_CHUNKS,
            resolve_timeout: Duration::from_secs(DEFAULT_RESOLVE_TIMEOUT_SECONDS),
            shutdown_grace: Duration::from_secs(DEFAULT_SHUTDOWN_GRACE_SECONDS),
            yt_dlp_command: vec!["yt-dlp".to_string()],
            allowed_origins: Vec::new(),
        }
    }
}

impl RelayConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let seconds = |name: &str, default: Duration| {
            read_u64(&lookup, name)
                .filter(|value| *value > 0)
                .map(Duration::from_secs)
                .unwrap_or(default)
        };

        let yt_dlp_command = lookup("YT_DLP_BIN")
            .map(|value| value.split_whitespace().map(ToString::to_string).collect::<Vec<_>>())
            .filter(|parts| !parts.is_empty())
            .unwrap_or(defaults.yt_dlp_command.clone());

        let allowed_origins = lookup("ALLOWED_ORIGINS")
            .map(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|origin| !origin.is_empty())
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        Self {
            bind_addr: resolve_bind_addr(&lookup),
            token_ttl: seconds("TOKEN_TTL_SECONDS", defaults.token_ttl),
            sweep_interval: seconds("SWEEP_INTERVAL_SECONDS", defaults.sweep_interval),
            tombstone_retention: seconds(
                "TOMBSTONE_RETENTION_SECONDS",
                defaults.tombstone_retention,
            ),
            stream_buffer_chunks: read_u64(&lookup, "STREAM_BUFFER_CHUNKS")
                .and_then(|value| usize::try_from(value).ok())
                .filter(|value| *value > 0)
                .unwrap_or(defaults.stream_buffer_chunks),
            resolve_timeout: seconds("RESOLVE_TIMEOUT_SECONDS", defaults.resolve_timeout),
            shutdown_grace: seconds("SHUTDOWN_GRACE_SECONDS", defaults.shutdown_grace),
            yt_dlp_command,
            allowed_origins,
        }
    }
}

fn read_u64(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<u64> {
    lookup(name).and_then(|value| value.trim().parse::<u64>().ok())
}

fn resolve_bind_addr(lookup: &impl Fn(&str) -> Option<String>) -> String {
    if let Some(configured) = lookup("APP_ADDR")
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
    {
        return configured;
    }

    if let Some(port) = lookup("PORT").and_then(|value| value.trim().parse::<u16>().ok()) {
        return format!("0.0.0.0:{port}");
    }

    DEFAULT_BIND_ADDR.to_string()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from(pairs: &[(&str, &str)]) -> RelayConfig {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        RelayConfig::from_lookup(move |name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let config = config_from(&[]);
        assert_eq!(config.bind_addr, "127.0.0.1:8787");
        assert_eq!(config.token_ttl, Duration::from_secs(600));
        assert_eq!(config.sweep_interval, Duration::from_secs(60));
        assert_eq!(config.stream_buffer_chunks, 16);
        assert_eq!(config.shutdown_grace, Duration::from_secs(10));
        assert_eq!(config.yt_dlp_command, ["yt-dlp"]);
        assert!(config.allowed_origins.is_empty());
    }

    #[test]
    fn overrides_are_applied() {
        let config = config_from(&[
            ("PORT", "9000"),
            ("TOKEN_TTL_SECONDS", "30"),
            ("STREAM_BUFFER_CHUNKS", "4"),
            ("SHUTDOWN_GRACE_SECONDS", "2"),
            ("YT_DLP_BIN", "python3 -m yt_dlp"),
            ("ALLOWED_ORIGINS", "https://a.example, ,https://b.example"),
        ]);
        assert_eq!(config.bind_addr, "0.0.0.0:9000");
        assert_eq!(config.token_ttl, Duration::from_secs(30));
        assert_eq!(config.stream_buffer_chunks, 4);
        assert_eq!(config.shutdown_grace, Duration::from_secs(2));
        assert_eq!(config.yt_dlp_command, ["python3", "-m", "yt_dlp"]);
        assert_eq!(config.allowed_origins, ["https://a.example", "https://b.example"]);
    }

    #[test]
    fn app_addr_wins_over_port() {
        let config = config_from(&[("APP_ADDR", "0.0.0.0:1234"), ("PORT", "9000")]);
        assert_eq!(config.bind_addr, "0.0.0.0:1234");
    }

    #[test]
    fn zero_and_garbage_fall_back() {
        let config = config_from(&[
            ("TOKEN_TTL_SECONDS", "0"),
            ("SWEEP_INTERVAL_SECONDS", "soon"),
            ("YT_DLP_BIN", "   "),
        ]);
        assert_eq!(config.token_ttl, Duration::from_secs(600));
        assert_eq!(config.sweep_interval, Duration::from_secs(60));
        assert_eq!(config.yt_dlp_command, ["yt-dlp"]);
    }
}
