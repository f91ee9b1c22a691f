use std::time::Duration;

/// Client-side runtime settings, built once and shared by every call of a client.
#[derive(Clone, Debug, Default)]
pub struct ClientConfig {
    /// Runtime override, wins over the endpoint and service timeouts
    pub timeout: Option<Duration>,
    /// Replaces the descriptor's subject prefix
    pub subject_prefix: Option<String>,
    /// Bounds each individual stream receive. Falls back to the resolved call timeout.
    pub stream_idle_timeout: Option<Duration>,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Queue group every endpoint subscribes with
    pub queue_group: String,
    /// How many handler invocations may run at once per endpoint
    pub thresholds: usize,
    /// How long `stop()` waits for in-flight invocations
    pub stop_wait: Duration,
    /// Answer `$SRV.PING|INFO|STATS` discovery requests
    pub discovery: bool,
    /// Replaces the descriptor's subject prefix
    pub subject_prefix: Option<String>,
    /// Bounds each wait for the caller's next stream message. None waits until the caller's
    /// end marker or the service stops.
    pub stream_idle_timeout: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            queue_group: "q".to_string(),
            thresholds: 128,
            stop_wait: Duration::from_secs(5),
            discovery: true,
            subject_prefix: None,
            stream_idle_timeout: None,
        }
    }
}
