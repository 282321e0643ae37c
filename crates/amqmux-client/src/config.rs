use std::time::Duration;

/// Per-channel behavior knobs.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// How long a synchronous request may wait for its reply before the
    /// channel is closed as desynchronized.
    pub rpc_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            rpc_timeout: Duration::from_secs(30),
        }
    }
}

impl ChannelConfig {
    /// Override the synchronous-request timeout.
    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }
}

/// Connection-wide behavior knobs.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Highest channel number this connection will allocate.
    pub channel_max: u16,
    /// Configuration applied to every channel opened on this connection.
    pub channel: ChannelConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            channel_max: 2047,
            channel: ChannelConfig::default(),
        }
    }
}

impl ConnectionConfig {
    /// Override the channel-number ceiling.
    pub fn with_channel_max(mut self, channel_max: u16) -> Self {
        self.channel_max = channel_max;
        self
    }

    /// Override the per-channel configuration.
    pub fn with_channel_config(mut self, channel: ChannelConfig) -> Self {
        self.channel = channel;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = ConnectionConfig::default();
        assert_eq!(config.channel_max, 2047);
        assert_eq!(config.channel.rpc_timeout, Duration::from_secs(30));
    }

    #[test]
    fn builders_override() {
        let config = ConnectionConfig::default()
            .with_channel_max(8)
            .with_channel_config(ChannelConfig::default().with_rpc_timeout(Duration::from_millis(50)));
        assert_eq!(config.channel_max, 8);
        assert_eq!(config.channel.rpc_timeout, Duration::from_millis(50));
    }
}
