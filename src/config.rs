use crate::reconnect::ReconnectPolicy;
use crate::types::events::CALL_SIGNAL;

pub const DEFAULT_WS_URL: &str = "ws://localhost:3000/realtime";
pub const WS_URL_ENV: &str = "WS_URL";

#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Realtime endpoint the transport factory dials.
    pub ws_url: String,
    /// Wire event name carrying call signaling envelopes.
    pub signal_event: String,
    pub reconnect: ReconnectPolicy,
    /// Schedule reconnects after unexpected drops and failed connects.
    pub auto_reconnect: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ws_url: DEFAULT_WS_URL.to_string(),
            signal_event: CALL_SIGNAL.to_string(),
            reconnect: ReconnectPolicy::default(),
            auto_reconnect: true,
        }
    }
}

impl ClientConfig {
    /// Defaults, with the endpoint taken from `WS_URL` when set.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = std::env::var(WS_URL_ENV)
            && !url.trim().is_empty()
        {
            config.ws_url = url;
        }
        config
    }

    pub fn with_ws_url(mut self, url: impl Into<String>) -> Self {
        self.ws_url = url.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.ws_url, DEFAULT_WS_URL);
        assert_eq!(config.signal_event, "call_signal");
        assert!(config.auto_reconnect);
        assert_eq!(config.reconnect.delay(0), Duration::from_secs(1));
    }

    #[test]
    fn test_with_ws_url() {
        let config = ClientConfig::default().with_ws_url("wss://rt.example.com/ws");
        assert_eq!(config.ws_url, "wss://rt.example.com/ws");
    }
}
