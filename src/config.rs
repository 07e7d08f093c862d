//! Server and engine configuration.
//!
//! Defaults are production-sensible; each knob can be overridden through a
//! `COLLAB_`-prefixed environment variable read at startup.

use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// HTTP/WebSocket bind address.
    pub bind: SocketAddr,
    /// Presence sessions idle longer than this are evicted.
    pub presence_ttl: Duration,
    /// Interval of the background presence sweep.
    pub sweep_interval: Duration,
    /// Operation count that flushes an outgoing batch.
    pub batch_max_ops: usize,
    /// Elapsed time that flushes an outgoing batch.
    pub batch_max_delay: Duration,
    /// Log growth that triggers a snapshot capture.
    pub snapshot_threshold: usize,
    /// Maximum undo stack depth per (client, document).
    pub undo_depth: usize,
    /// Replication bus channel capacity.
    pub bus_capacity: usize,
    /// Size of the replication dedup window.
    pub dedup_window: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            bind: SocketAddr::from(([127, 0, 0, 1], 3000)),
            presence_ttl: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(10),
            batch_max_ops: 64,
            batch_max_delay: Duration::from_millis(50),
            snapshot_threshold: 256,
            undo_depth: 128,
            bus_capacity: 1024,
            dedup_window: 16 * 1024,
        }
    }
}

impl SyncConfig {
    /// Builds a config from the environment, falling back to defaults for
    /// anything unset or unparsable.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = SyncConfig::default();
        if let Some(bind) = parse_as::<SocketAddr>(lookup("COLLAB_BIND")) {
            config.bind = bind;
        }
        if let Some(secs) = parse_as::<u64>(lookup("COLLAB_PRESENCE_TTL_SECS")) {
            config.presence_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_as::<u64>(lookup("COLLAB_SWEEP_INTERVAL_SECS")) {
            config.sweep_interval = Duration::from_secs(secs);
        }
        if let Some(n) = parse_as::<usize>(lookup("COLLAB_BATCH_MAX_OPS")) {
            config.batch_max_ops = n;
        }
        if let Some(ms) = parse_as::<u64>(lookup("COLLAB_BATCH_MAX_DELAY_MS")) {
            config.batch_max_delay = Duration::from_millis(ms);
        }
        if let Some(n) = parse_as::<usize>(lookup("COLLAB_SNAPSHOT_THRESHOLD")) {
            config.snapshot_threshold = n;
        }
        if let Some(n) = parse_as::<usize>(lookup("COLLAB_UNDO_DEPTH")) {
            config.undo_depth = n;
        }
        if let Some(n) = parse_as::<usize>(lookup("COLLAB_BUS_CAPACITY")) {
            config.bus_capacity = n;
        }
        if let Some(n) = parse_as::<usize>(lookup("COLLAB_DEDUP_WINDOW")) {
            config.dedup_window = n;
        }
        config
    }
}

fn parse_as<T: std::str::FromStr>(raw: Option<String>) -> Option<T> {
    raw?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.presence_ttl, Duration::from_secs(30));
        assert!(config.batch_max_ops > 0);
        assert!(config.snapshot_threshold > 0);
    }

    #[test]
    fn test_every_knob_has_an_env_override() {
        let config = SyncConfig::from_lookup(|key| {
            let value = match key {
                "COLLAB_BIND" => "0.0.0.0:9100",
                "COLLAB_PRESENCE_TTL_SECS" => "45",
                "COLLAB_SWEEP_INTERVAL_SECS" => "5",
                "COLLAB_BATCH_MAX_OPS" => "7",
                "COLLAB_BATCH_MAX_DELAY_MS" => "120",
                "COLLAB_SNAPSHOT_THRESHOLD" => "33",
                "COLLAB_UNDO_DEPTH" => "9",
                "COLLAB_BUS_CAPACITY" => "256",
                "COLLAB_DEDUP_WINDOW" => "512",
                _ => return None,
            };
            Some(value.to_owned())
        });

        assert_eq!(config.bind, "0.0.0.0:9100".parse().unwrap());
        assert_eq!(config.presence_ttl, Duration::from_secs(45));
        assert_eq!(config.sweep_interval, Duration::from_secs(5));
        assert_eq!(config.batch_max_ops, 7);
        assert_eq!(config.batch_max_delay, Duration::from_millis(120));
        assert_eq!(config.snapshot_threshold, 33);
        assert_eq!(config.undo_depth, 9);
        assert_eq!(config.bus_capacity, 256);
        assert_eq!(config.dedup_window, 512);
    }

    #[test]
    fn test_unparsable_value_falls_back_to_default() {
        let config = SyncConfig::from_lookup(|key| {
            (key == "COLLAB_BATCH_MAX_OPS").then(|| "not a number".to_owned())
        });
        assert_eq!(config.batch_max_ops, SyncConfig::default().batch_max_ops);
    }
}
