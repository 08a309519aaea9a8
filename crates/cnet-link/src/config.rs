use std::time::Duration;
use url::Url;

pub const DEFAULT_BROKER_URL: &str = "ws://localhost:8080/ws";
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub endpoint: Url,
    /// Fixed wait between a closed session and the next attempt.
    pub reconnect_delay: Duration,
    /// Period of REQUEST_STATUS polling while the dashboard is observed.
    pub poll_interval: Duration,
    pub event_capacity: usize,
}

impl LinkConfig {
    pub fn new(endpoint: Url) -> Self {
        Self {
            endpoint,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            poll_interval: DEFAULT_POLL_INTERVAL,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }

    /// `DEFAULT_BROKER_URL` as a parsed endpoint.
    pub fn default_endpoint() -> Result<Url, url::ParseError> {
        Url::parse(DEFAULT_BROKER_URL)
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_broker_conventions() {
        let config = LinkConfig::new(LinkConfig::default_endpoint().expect("default endpoint"));
        assert_eq!(config.endpoint.as_str(), DEFAULT_BROKER_URL);
        assert_eq!(config.reconnect_delay, Duration::from_secs(5));
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.event_capacity, 256);
    }

    #[test]
    fn builder_overrides_timers() {
        let url = Url::parse("ws://10.0.0.5:9000/ws").expect("url");
        let config = LinkConfig::new(url)
            .with_reconnect_delay(Duration::from_millis(50))
            .with_poll_interval(Duration::from_millis(20))
            .with_event_capacity(0);
        assert_eq!(config.endpoint.port(), Some(9000));
        assert_eq!(config.reconnect_delay, Duration::from_millis(50));
        assert_eq!(config.poll_interval, Duration::from_millis(20));
        assert_eq!(config.event_capacity, 1);
    }
}
