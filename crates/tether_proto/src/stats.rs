//! Session rate and event counters.
//!
//! Rates are sampled once per second into a five-slot ring, giving three
//! views of each quantity: the last one-second sample, a five-second moving
//! average, and the lifetime average. Event counters are plain monotonic
//! totals. A snapshot of everything is published as a name/value set.

use serde_json::{Map, Value, json};
use web_time::{Duration, Instant};

const WINDOW: usize = 5;
const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// One quantity sampled per second.
#[derive(Debug, Default, Clone)]
pub struct RateTracker {
    accum: f64,
    last_sample: f64,
    window: [f64; WINDOW],
    next_slot: usize,
    filled: usize,
    lifetime_total: f64,
}

impl RateTracker {
    /// Adds `amount` to the current sample.
    pub fn record(&mut self, amount: f64) {
        self.accum += amount;
        self.lifetime_total += amount;
    }

    fn roll(&mut self) {
        self.last_sample = self.accum;
        self.window[self.next_slot] = self.accum;
        self.next_slot = (self.next_slot + 1) % WINDOW;
        self.filled = (self.filled + 1).min(WINDOW);
        self.accum = 0.0;
    }

    /// The most recently closed one-second sample.
    #[must_use]
    pub const fn last(&self) -> f64 {
        self.last_sample
    }

    /// Average of the last five closed samples.
    #[must_use]
    pub fn moving_avg(&self) -> f64 {
        if self.filled == 0 {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let filled = self.filled as f64;
        self.window.iter().take(self.filled).sum::<f64>() / filled
    }

    /// Lifetime per-second average over `elapsed`.
    #[must_use]
    pub fn lifetime_avg(&self, elapsed: Duration) -> f64 {
        let secs = elapsed.as_secs_f64();
        if secs <= 0.0 {
            0.0
        } else {
            self.lifetime_total / secs
        }
    }

    /// Lifetime total.
    #[must_use]
    pub const fn total(&self) -> f64 {
        self.lifetime_total
    }
}

/// Mean of a measured delay, per sample and over the lifetime.
#[derive(Debug, Default, Clone)]
pub struct MeanTracker {
    sample_sum: f64,
    sample_count: u64,
    last_mean: f64,
    lifetime_sum: f64,
    lifetime_count: u64,
}

impl MeanTracker {
    /// Records one measured delay.
    pub fn record(&mut self, delay: Duration) {
        let secs = delay.as_secs_f64();
        self.sample_sum += secs;
        self.sample_count += 1;
        self.lifetime_sum += secs;
        self.lifetime_count += 1;
    }

    fn roll(&mut self) {
        self.last_mean = if self.sample_count == 0 {
            0.0
        } else {
            #[allow(clippy::cast_precision_loss)]
            let count = self.sample_count as f64;
            self.sample_sum / count
        };
        self.sample_sum = 0.0;
        self.sample_count = 0;
    }

    /// Mean delay in seconds over the most recently closed sample.
    #[must_use]
    pub const fn last_mean(&self) -> f64 {
        self.last_mean
    }

    /// Mean delay in seconds over the lifetime.
    #[must_use]
    pub fn lifetime_mean(&self) -> f64 {
        if self.lifetime_count == 0 {
            0.0
        } else {
            #[allow(clippy::cast_precision_loss)]
            let count = self.lifetime_count as f64;
            self.lifetime_sum / count
        }
    }
}

/// Rates for one direction of a session.
#[derive(Debug, Default, Clone)]
pub struct DirectionStats {
    /// Frame bytes.
    pub bytes: RateTracker,
    /// Buffers (frames in the reliable sequence space).
    pub buffers: RateTracker,
    /// Complete messages.
    pub messages: RateTracker,
    /// Acknowledgements (standalone or piggybacked watermark advances).
    pub acks: RateTracker,
    /// Delay from posting a buffer to its delivery (tx) or from first frame
    /// to acceptance (rx).
    pub buffer_delay: MeanTracker,
    /// Delay from posting a message to its delivery.
    pub message_delay: MeanTracker,
}

impl DirectionStats {
    fn roll(&mut self) {
        self.bytes.roll();
        self.buffers.roll();
        self.messages.roll();
        self.acks.roll();
        self.buffer_delay.roll();
        self.message_delay.roll();
    }

    fn snapshot(&self, elapsed: Duration) -> Value {
        let rate = |tracker: &RateTracker| {
            json!({
                "Last": tracker.last(),
                "Avg5s": tracker.moving_avg(),
                "Lifetime": tracker.lifetime_avg(elapsed),
            })
        };
        json!({
            "Bytes": rate(&self.bytes),
            "Buffers": rate(&self.buffers),
            "Messages": rate(&self.messages),
            "Acks": rate(&self.acks),
            "MeanBufferDelay": {
                "Last": self.buffer_delay.last_mean(),
                "Lifetime": self.buffer_delay.lifetime_mean(),
            },
            "MeanMessageDelay": {
                "Last": self.message_delay.last_mean(),
                "Lifetime": self.message_delay.lifetime_mean(),
            },
        })
    }
}

/// Monotonic event totals for one session (and, for the last two entries,
/// for a session manager).
#[derive(Debug, Default, Clone)]
#[allow(missing_docs)]
pub struct EventCounters {
    pub buffers_resent_tx: u64,
    pub buffers_resent_rx: u64,
    pub out_of_order_recv: u64,
    pub old_duplicate_recv: u64,
    pub keep_alives_tx: u64,
    pub keep_alives_rx: u64,
    pub management_frames_tx: u64,
    pub management_frames_rx: u64,
    pub invalid_frames: u64,
    pub protocol_violations: u64,
    pub transport_errors: u64,
    pub transport_error_closures: u64,
    pub unexpected_manager_frames: u64,
}

impl EventCounters {
    fn snapshot(&self) -> Value {
        json!({
            "BuffersResentTx": self.buffers_resent_tx,
            "BuffersResentRx": self.buffers_resent_rx,
            "OutOfOrderRecv": self.out_of_order_recv,
            "OldDuplicateRecv": self.old_duplicate_recv,
            "KeepAlivesTx": self.keep_alives_tx,
            "KeepAlivesRx": self.keep_alives_rx,
            "ManagementFramesTx": self.management_frames_tx,
            "ManagementFramesRx": self.management_frames_rx,
            "InvalidFrames": self.invalid_frames,
            "ProtocolViolations": self.protocol_violations,
            "TransportErrors": self.transport_errors,
            "TransportErrorClosures": self.transport_error_closures,
            "UnexpectedManagerFrames": self.unexpected_manager_frames,
        })
    }
}

/// All counters for one session.
#[derive(Debug, Clone)]
pub struct SessionStats {
    started: Instant,
    next_roll_at: Instant,
    /// Outbound rates.
    pub tx: DirectionStats,
    /// Inbound rates.
    pub rx: DirectionStats,
    /// Event totals.
    pub events: EventCounters,
}

impl SessionStats {
    /// Creates a stats block whose lifetime starts at `now`.
    #[must_use]
    pub fn new(now: Instant) -> Self {
        Self {
            started: now,
            next_roll_at: now + SAMPLE_INTERVAL,
            tx: DirectionStats::default(),
            rx: DirectionStats::default(),
            events: EventCounters::default(),
        }
    }

    /// Closes the current one-second sample if it is due. Returns whether a
    /// sample was closed.
    pub fn service(&mut self, now: Instant) -> bool {
        if now < self.next_roll_at {
            return false;
        }
        self.tx.roll();
        self.rx.roll();
        while self.next_roll_at <= now {
            self.next_roll_at += SAMPLE_INTERVAL;
        }
        true
    }

    /// Publishes the full counter set as a name/value set.
    #[must_use]
    pub fn snapshot(&self, now: Instant) -> Value {
        let elapsed = now.saturating_duration_since(self.started);
        let mut map = Map::new();
        map.insert("Tx".into(), self.tx.snapshot(elapsed));
        map.insert("Rx".into(), self.rx.snapshot(elapsed));
        map.insert("Events".into(), self.events.snapshot());
        Value::Object(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rates_roll_per_second() {
        let start = Instant::now();
        let mut stats = SessionStats::new(start);
        stats.tx.bytes.record(100.0);
        assert!(!stats.service(start + Duration::from_millis(500)));
        assert!((stats.tx.bytes.last() - 0.0).abs() < f64::EPSILON);

        assert!(stats.service(start + Duration::from_millis(1001)));
        assert!((stats.tx.bytes.last() - 100.0).abs() < f64::EPSILON);
        assert!((stats.tx.bytes.moving_avg() - 100.0).abs() < f64::EPSILON);

        // a quiet second drags the moving average down
        assert!(stats.service(start + Duration::from_millis(2002)));
        assert!((stats.tx.bytes.last() - 0.0).abs() < f64::EPSILON);
        assert!((stats.tx.bytes.moving_avg() - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn mean_delay() {
        let mut mean = MeanTracker::default();
        mean.record(Duration::from_millis(10));
        mean.record(Duration::from_millis(30));
        mean.roll();
        assert!((mean.last_mean() - 0.020).abs() < 1e-9);
        assert!((mean.lifetime_mean() - 0.020).abs() < 1e-9);
    }

    #[test]
    fn snapshot_shape() {
        let now = Instant::now();
        let mut stats = SessionStats::new(now);
        stats.events.keep_alives_tx = 3;
        let snap = stats.snapshot(now + Duration::from_secs(1));
        assert_eq!(3, snap["Events"]["KeepAlivesTx"]);
        assert!(snap["Tx"]["Bytes"].get("Last").is_some());
        assert!(snap["Rx"]["MeanMessageDelay"].get("Lifetime").is_some());
    }
}
