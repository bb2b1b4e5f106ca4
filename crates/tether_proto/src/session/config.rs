//! See [`SessionConfig`].

use serde_json::Value;
use web_time::Duration;

use crate::buffer::{DEFAULT_BUFFER_SIZE, DEFAULT_MAX_TOTAL_BYTES};

/// Configuration for a [`ConnectionSession`](crate::session::ConnectionSession).
///
/// Constructed programmatically or from an already-parsed configuration
/// dictionary via [`SessionConfig::from_nvs`]. The buffer size is negotiated
/// at session open and cannot change while a session is active.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Size of every buffer, header included. Clamped to the pool's limits.
    pub buffer_size: usize,
    /// Cap on the total bytes the session's pool may have live.
    pub max_total_pool_bytes: usize,
    /// How long `go_online` may take before the session is forced to
    /// terminate.
    pub max_session_connect_wait: Duration,
    /// How long a graceful close may take before the session gives up
    /// waiting for the peer.
    pub max_session_close_wait: Duration,
    /// How long an automatic reconnect attempt may take.
    pub max_session_auto_reconnect_wait: Duration,
    /// Quiet time after which a keep-alive management frame is emitted.
    pub nominal_keep_alive_send_interval: Duration,
    /// Upper bound on the keep-alive interval as unanswered keep-alives back
    /// off.
    pub max_keep_alive_send_interval: Duration,
    /// Quiet receive time after which the connection is reported degraded.
    /// Zero disables degraded reporting.
    pub connection_degraded_holdoff: Duration,
    /// Delay before an automatic reconnect after transport loss. Absent
    /// disables auto-reconnect.
    pub auto_reconnect_holdoff: Option<Duration>,
    /// Age at which an unacknowledged buffer is first retransmitted. Backs
    /// off geometrically per buffer up to
    /// [`SessionConfig::retransmit_holdoff_max`].
    pub retransmit_holdoff: Duration,
    /// Cap on the per-buffer retransmit backoff.
    pub retransmit_holdoff_max: Duration,
    /// Cap on sent-but-unacknowledged buffers; queuing beyond it is refused
    /// so back-pressure propagates to the stream tools.
    pub max_held_buffers: usize,
    /// Total in-flight time after which a held buffer's message fails and
    /// the session terminates.
    pub max_held_time: Duration,
    /// Watermark advance that triggers an immediate standalone ack.
    pub ack_coalesce_threshold: u64,
    /// Longest a watermark advance may wait for a piggyback before a
    /// standalone ack is emitted.
    pub ack_coalesce_holdoff: Duration,
    /// Bound on the out-of-order reorder buffer, in frames.
    pub reorder_window: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_total_pool_bytes: DEFAULT_MAX_TOTAL_BYTES,
            max_session_connect_wait: Duration::from_secs(5),
            max_session_close_wait: Duration::from_secs(1),
            max_session_auto_reconnect_wait: Duration::from_secs(1),
            nominal_keep_alive_send_interval: Duration::from_secs(1),
            max_keep_alive_send_interval: Duration::from_secs(10),
            connection_degraded_holdoff: Duration::ZERO,
            auto_reconnect_holdoff: None,
            retransmit_holdoff: Duration::from_millis(100),
            retransmit_holdoff_max: Duration::from_secs(2),
            max_held_buffers: 128,
            max_held_time: Duration::from_secs(30),
            ack_coalesce_threshold: 8,
            ack_coalesce_holdoff: Duration::from_millis(20),
            reorder_window: 64,
        }
    }
}

fn get_u64(nvs: &Value, key: &str) -> Option<u64> {
    nvs.get(key).and_then(Value::as_u64)
}

fn get_duration(nvs: &Value, key: &str) -> Option<Duration> {
    nvs.get(key)
        .and_then(Value::as_f64)
        .filter(|secs| *secs >= 0.0)
        .map(Duration::from_secs_f64)
}

impl SessionConfig {
    /// Reads recognized keys out of an already-parsed configuration
    /// dictionary, leaving defaults for anything absent. Durations are
    /// numbers of seconds.
    #[must_use]
    pub fn from_nvs(nvs: &Value) -> Self {
        let defaults = Self::default();
        Self {
            buffer_size: get_u64(nvs, "BufferPool.BufferSize")
                .map_or(defaults.buffer_size, |n| n as usize),
            max_total_pool_bytes: get_u64(nvs, "BufferPool.MaxTotalSpaceInBytes")
                .map_or(defaults.max_total_pool_bytes, |n| n as usize),
            max_session_connect_wait: get_duration(nvs, "MaxSessionConnectWaitTime")
                .unwrap_or(defaults.max_session_connect_wait),
            max_session_close_wait: get_duration(nvs, "MaxSessionCloseWaitTime")
                .unwrap_or(defaults.max_session_close_wait),
            max_session_auto_reconnect_wait: get_duration(nvs, "MaxSessionAutoReconnectWaitTime")
                .unwrap_or(defaults.max_session_auto_reconnect_wait),
            nominal_keep_alive_send_interval: get_duration(nvs, "NominalKeepAliveSendInterval")
                .unwrap_or(defaults.nominal_keep_alive_send_interval),
            max_keep_alive_send_interval: get_duration(nvs, "MaxKeepAliveSendInterval")
                .unwrap_or(defaults.max_keep_alive_send_interval),
            connection_degraded_holdoff: get_duration(nvs, "ConnectionDegradedHoldoff")
                .unwrap_or(defaults.connection_degraded_holdoff),
            auto_reconnect_holdoff: get_duration(nvs, "AutoReconnectHoldoff"),
            retransmit_holdoff: get_duration(nvs, "RetransmitHoldoff")
                .unwrap_or(defaults.retransmit_holdoff),
            retransmit_holdoff_max: get_duration(nvs, "RetransmitHoldoffMax")
                .unwrap_or(defaults.retransmit_holdoff_max),
            max_held_buffers: get_u64(nvs, "MaxHeldBuffers")
                .map_or(defaults.max_held_buffers, |n| n as usize),
            max_held_time: get_duration(nvs, "MaxHeldTime").unwrap_or(defaults.max_held_time),
            ack_coalesce_threshold: get_u64(nvs, "AckCoalesceThreshold")
                .unwrap_or(defaults.ack_coalesce_threshold),
            ack_coalesce_holdoff: get_duration(nvs, "AckCoalesceHoldoff")
                .unwrap_or(defaults.ack_coalesce_holdoff),
            reorder_window: get_u64(nvs, "ReorderWindow")
                .map_or(defaults.reorder_window, |n| n as usize),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn defaults() {
        let config = SessionConfig::default();
        assert_eq!(1024, config.buffer_size);
        assert_eq!(1_024_000, config.max_total_pool_bytes);
        assert_eq!(Duration::from_secs(5), config.max_session_connect_wait);
        assert_eq!(Duration::from_secs(1), config.max_session_close_wait);
        assert_eq!(None, config.auto_reconnect_holdoff);
        assert_eq!(Duration::ZERO, config.connection_degraded_holdoff);
    }

    #[test]
    fn from_nvs_overrides() {
        let nvs = json!({
            "BufferPool.BufferSize": 2048,
            "BufferPool.MaxTotalSpaceInBytes": 4096,
            "MaxSessionConnectWaitTime": 2.5,
            "NominalKeepAliveSendInterval": 0.25,
            "AutoReconnectHoldoff": 1.0,
            "MaxHeldBuffers": 16,
        });
        let config = SessionConfig::from_nvs(&nvs);
        assert_eq!(2048, config.buffer_size);
        assert_eq!(4096, config.max_total_pool_bytes);
        assert_eq!(Duration::from_millis(2500), config.max_session_connect_wait);
        assert_eq!(
            Duration::from_millis(250),
            config.nominal_keep_alive_send_interval
        );
        assert_eq!(Some(Duration::from_secs(1)), config.auto_reconnect_holdoff);
        assert_eq!(16, config.max_held_buffers);
        // untouched keys keep their defaults
        assert_eq!(Duration::from_secs(1), config.max_session_close_wait);
    }

    #[test]
    fn from_nvs_ignores_malformed() {
        let nvs = json!({
            "MaxSessionConnectWaitTime": "soon",
            "AutoReconnectHoldoff": -3.0,
        });
        let config = SessionConfig::from_nvs(&nvs);
        assert_eq!(Duration::from_secs(5), config.max_session_connect_wait);
        assert_eq!(None, config.auto_reconnect_holdoff);
    }
}
