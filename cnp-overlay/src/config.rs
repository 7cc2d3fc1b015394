use cnp_core::{CanopyError, Result};
use std::time::Duration;

/// Tree shape and timing parameters for one overlay node.
#[derive(Debug, Clone)]
pub struct OverlayConfig {
    /// Reliability threshold R: minimum cluster size before it owns children.
    /// Clusters hold between R and 2R-1 members once placed.
    pub reliability: usize,
    /// Fan-out bound K: maximum child clusters per cluster. Zero means the
    /// tree never grows below the root.
    pub fanout: usize,
    /// How long a forwarded message waits for its acks before a resend.
    pub ack_timeout: Duration,
    /// Granularity of the resend scan.
    pub retry_tick: Duration,
    pub probe_interval: Duration,
    /// Consecutive unanswered probes before a peer is declared unreachable.
    pub probe_failure_threshold: u32,
    pub mailbox_capacity: usize,
    pub event_capacity: usize,
    pub join_timeout: Duration,
    /// Message ids remembered for duplicate suppression.
    pub delivery_window: usize,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            reliability: 3,
            fanout: 4,
            ack_timeout: Duration::from_millis(500),
            retry_tick: Duration::from_millis(100),
            probe_interval: Duration::from_secs(1),
            probe_failure_threshold: 3,
            mailbox_capacity: 4096,
            event_capacity: 1024,
            join_timeout: Duration::from_secs(5),
            delivery_window: 4096,
        }
    }
}

impl OverlayConfig {
    #[must_use]
    pub fn with_reliability(mut self, reliability: usize) -> Self {
        self.reliability = reliability;
        self
    }

    #[must_use]
    pub fn with_fanout(mut self, fanout: usize) -> Self {
        self.fanout = fanout;
        self
    }

    #[must_use]
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_retry_tick(mut self, tick: Duration) -> Self {
        self.retry_tick = tick;
        self
    }

    #[must_use]
    pub fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }

    #[must_use]
    pub fn with_probe_failure_threshold(mut self, threshold: u32) -> Self {
        self.probe_failure_threshold = threshold;
        self
    }

    #[must_use]
    pub fn with_mailbox_capacity(mut self, capacity: usize) -> Self {
        self.mailbox_capacity = capacity;
        self
    }

    #[must_use]
    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_delivery_window(mut self, window: usize) -> Self {
        self.delivery_window = window;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.reliability == 0 {
            return Err(CanopyError::Config("reliability must be at least 1".into()));
        }
        if u16::try_from(self.reliability).is_err() || u16::try_from(self.fanout).is_err() {
            return Err(CanopyError::Config(
                "reliability and fanout must fit in 16 bits".into(),
            ));
        }
        if self.probe_failure_threshold == 0 {
            return Err(CanopyError::Config(
                "probe_failure_threshold must be at least 1".into(),
            ));
        }
        if self.mailbox_capacity == 0 || self.event_capacity == 0 {
            return Err(CanopyError::Config("channel capacities must be non-zero".into()));
        }
        if self.retry_tick.is_zero() || self.probe_interval.is_zero() {
            return Err(CanopyError::Config("tick intervals must be non-zero".into()));
        }
        Ok(())
    }

    /// Largest size a cluster reaches before it splits.
    #[inline]
    #[must_use]
    pub const fn split_size(&self) -> usize {
        (2 * self.reliability).saturating_sub(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(OverlayConfig::default().validate().is_ok());
    }

    #[test]
    fn test_builder_and_validation() {
        let config = OverlayConfig::default().with_reliability(2).with_fanout(0);
        assert_eq!(config.split_size(), 3);
        assert!(config.validate().is_ok());

        assert!(OverlayConfig::default().with_reliability(0).validate().is_err());
        assert!(
            OverlayConfig::default()
                .with_probe_failure_threshold(0)
                .validate()
                .is_err()
        );
    }
}
