use std::time::Duration;

const DEFAULT_API_URL: &str = "http://127.0.0.1:8080";
const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;
const DEFAULT_POLL_MAX_ATTEMPTS: u32 = 300;
const DEFAULT_CANCEL_ACK_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_STATUS_CHANNEL_CAPACITY: usize = 256;

pub(crate) fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub(crate) fn env_u64(name: &str) -> Option<u64> {
    env_string(name).and_then(|v| v.parse::<u64>().ok())
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_url: String,
    pub api_token: Option<String>,
    /// Reconciliation poll period after a lifecycle command.
    pub poll_interval: Duration,
    /// 0 disables the cap.
    pub poll_max_attempts: u32,
    /// How long a cancelled operation waits for the remote acknowledgement
    /// before it is reported as cancelled anyway.
    pub cancel_ack_timeout: Duration,
    pub connect_timeout: Duration,
    pub status_channel_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            api_token: None,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            poll_max_attempts: DEFAULT_POLL_MAX_ATTEMPTS,
            cancel_ack_timeout: Duration::from_millis(DEFAULT_CANCEL_ACK_TIMEOUT_MS),
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            status_channel_capacity: DEFAULT_STATUS_CHANNEL_CAPACITY,
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Self {
        let api_url = env_string("KILN_API_URL")
            .map(|v| v.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_API_URL.to_string());

        let poll_interval = Duration::from_millis(
            env_u64("KILN_POLL_INTERVAL_MS")
                .map(|v| v.clamp(100, 60_000))
                .unwrap_or(DEFAULT_POLL_INTERVAL_MS),
        );
        let poll_max_attempts = env_u64("KILN_POLL_MAX_ATTEMPTS")
            .map(|v| v.clamp(0, 100_000) as u32)
            .unwrap_or(DEFAULT_POLL_MAX_ATTEMPTS);
        let cancel_ack_timeout = Duration::from_millis(
            env_u64("KILN_CANCEL_ACK_TIMEOUT_MS")
                .map(|v| v.clamp(500, 10 * 60_000))
                .unwrap_or(DEFAULT_CANCEL_ACK_TIMEOUT_MS),
        );
        let connect_timeout = Duration::from_millis(
            env_u64("KILN_CONNECT_TIMEOUT_MS")
                .map(|v| v.clamp(1000, 120_000))
                .unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS),
        );
        let status_channel_capacity = env_u64("KILN_STATUS_CHANNEL_CAPACITY")
            .map(|v| v.clamp(16, 65_536) as usize)
            .unwrap_or(DEFAULT_STATUS_CHANNEL_CAPACITY);

        Self {
            api_url,
            api_token: env_string("KILN_API_TOKEN"),
            poll_interval,
            poll_max_attempts,
            cancel_ack_timeout,
            connect_timeout,
            status_channel_capacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_poll_once_per_second() {
        let cfg = ClientConfig::default();
        assert_eq!(cfg.poll_interval, Duration::from_secs(1));
        assert_eq!(cfg.api_url, DEFAULT_API_URL);
        assert!(cfg.api_token.is_none());
    }
}
