use cnp_core::{CanopyError, Result};
use cnp_network::TransportConfig;
use cnp_overlay::OverlayConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub listen_addr: SocketAddr,
    /// Address peers use to reach this node. Defaults to `listen_addr`.
    #[serde(default)]
    pub advertise_addr: Option<SocketAddr>,
    pub metrics_addr: SocketAddr,
    /// Existing member to join through. A new tree is started when absent.
    #[serde(default)]
    pub contact: Option<SocketAddr>,
    #[serde(default)]
    pub overlay: OverlaySettings,
    #[serde(default)]
    pub transport: TransportSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlaySettings {
    pub reliability: usize,
    pub fanout: usize,
    pub ack_timeout_ms: u64,
    pub retry_tick_ms: u64,
    pub probe_interval_ms: u64,
    pub probe_failure_threshold: u32,
    pub mailbox_capacity: usize,
    pub event_capacity: usize,
    pub join_timeout_ms: u64,
    pub delivery_window: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    pub connect_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub peer_queue_depth: usize,
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 7400)),
            advertise_addr: None,
            metrics_addr: SocketAddr::from(([0, 0, 0, 0], 9464)),
            contact: None,
            overlay: OverlaySettings::default(),
            transport: TransportSettings::default(),
        }
    }
}

impl Default for OverlaySettings {
    fn default() -> Self {
        let defaults = OverlayConfig::default();
        Self {
            reliability: defaults.reliability,
            fanout: defaults.fanout,
            ack_timeout_ms: millis(defaults.ack_timeout),
            retry_tick_ms: millis(defaults.retry_tick),
            probe_interval_ms: millis(defaults.probe_interval),
            probe_failure_threshold: defaults.probe_failure_threshold,
            mailbox_capacity: defaults.mailbox_capacity,
            event_capacity: defaults.event_capacity,
            join_timeout_ms: millis(defaults.join_timeout),
            delivery_window: defaults.delivery_window,
        }
    }
}

impl Default for TransportSettings {
    fn default() -> Self {
        let defaults = TransportConfig::default();
        Self {
            connect_timeout_ms: millis(defaults.connect_timeout),
            write_timeout_ms: millis(defaults.write_timeout),
            peer_queue_depth: defaults.peer_queue_depth,
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;

        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        match ext {
            "toml" => toml::from_str(&content)
                .map_err(|e| CanopyError::Config(format!("TOML parse error: {e}"))),
            "json" => serde_json::from_str(&content)
                .map_err(|e| CanopyError::Config(format!("JSON parse error: {e}"))),
            _ => Err(CanopyError::Config(format!(
                "Unknown config file extension: {ext}"
            ))),
        }
    }

    pub fn from_args(args: &super::Args) -> Self {
        Self {
            listen_addr: args.listen,
            advertise_addr: args.advertise,
            metrics_addr: args.metrics,
            contact: args.join,
            overlay: OverlaySettings {
                reliability: args.reliability,
                fanout: args.fanout,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Address stamped into this node's identity.
    #[must_use]
    pub fn advertised(&self) -> SocketAddr {
        self.advertise_addr.unwrap_or(self.listen_addr)
    }

    #[must_use]
    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.overlay.join_timeout_ms)
    }

    #[must_use]
    pub fn overlay_config(&self) -> OverlayConfig {
        let o = &self.overlay;
        let mut config = OverlayConfig::default()
            .with_reliability(o.reliability)
            .with_fanout(o.fanout)
            .with_ack_timeout(Duration::from_millis(o.ack_timeout_ms))
            .with_retry_tick(Duration::from_millis(o.retry_tick_ms))
            .with_probe_interval(Duration::from_millis(o.probe_interval_ms))
            .with_probe_failure_threshold(o.probe_failure_threshold)
            .with_mailbox_capacity(o.mailbox_capacity)
            .with_join_timeout(self.join_timeout())
            .with_delivery_window(o.delivery_window);
        config.event_capacity = o.event_capacity;
        config
    }

    #[must_use]
    pub fn transport_config(&self) -> TransportConfig {
        let mut config = TransportConfig::default()
            .with_connect_timeout(Duration::from_millis(self.transport.connect_timeout_ms))
            .with_write_timeout(Duration::from_millis(self.transport.write_timeout_ms));
        config.peer_queue_depth = self.transport.peer_queue_depth;
        config
    }
}
