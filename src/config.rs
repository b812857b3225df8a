use std::time::Duration;

/// Connection and timing settings shared by the single and multi-device drivers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverConfig {
    pub baud_rate: u32,
    /// Bound for the identification and capture acknowledgement lines.
    pub response_timeout: Duration,
    /// Transport read timeout, also how often a blocked drain checks for cancellation.
    pub poll_interval: Duration,
    /// Pause between the abort byte and reopening the transport.
    pub abort_settle: Duration,
    /// `None` waits for the sample stream forever.
    pub drain_timeout: Option<Duration>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            response_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(10),
            abort_settle: Duration::from_secs(2),
            drain_timeout: None,
        }
    }
}

impl DriverConfig {
    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_abort_settle(mut self, settle: Duration) -> Self {
        self.abort_settle = settle;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.drain_timeout = timeout;
        self
    }
}
