//! Client-side channel configuration.

use std::time::Duration;

/// Reconnection backoff policy for [`crate::channel::ws::WsChannel`].
///
/// Delays start at `initial_delay` and double after each failed attempt,
/// capped at `max_delay`. After `max_attempts` failures the channel
/// gives up and reports [`crate::channel::ConnectionStatus::Failed`].
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt.
    #[serde(with = "duration_ms")]
    pub initial_delay: Duration,
    /// Upper bound on the backoff delay.
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,
    /// Number of attempts before giving up.
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

/// Configuration for a WebSocket channel to a hub.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Hub WebSocket URL, e.g. `ws://127.0.0.1:9100/ws`.
    pub hub_url: String,
    /// Reconnection backoff policy.
    pub reconnect: ReconnectConfig,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            hub_url: "ws://127.0.0.1:9100/ws".to_string(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// Serde adapter: durations as integer milliseconds.
mod duration_ms {
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let ms = <u64 as serde::Deserialize>::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}
