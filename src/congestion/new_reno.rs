//! NewReno-style congestion control, per spec section 4.4.

use std::time::Instant;

use super::{Controller, NewRenoConfig, MAX_DATAGRAM_SIZE};

pub struct NewReno {
    config: NewRenoConfig,
    window: u64,
    ssthresh: u64,
    /// Start of the current recovery period; a congestion event only fires once per period
    recovery_start_time: Option<Instant>,
}

impl NewReno {
    pub fn new(config: NewRenoConfig) -> Self {
        Self {
            window: config.initial_window,
            ssthresh: u64::MAX,
            recovery_start_time: None,
            config,
        }
    }

    fn in_recovery(&self, sent_time: Instant) -> bool {
        matches!(self.recovery_start_time, Some(t) if sent_time <= t)
    }
}

impl Controller for NewReno {
    fn on_ack(&mut self, _now: Instant, sent_time: Instant, sent_bytes: u64, app_limited: bool) {
        if app_limited || self.in_recovery(sent_time) {
            return;
        }
        if self.window < self.ssthresh {
            // Slow start: grow by the full size of the acknowledged packet.
            self.window += sent_bytes;
        } else {
            // Congestion avoidance: grow by one MSS per window-worth of acknowledged bytes.
            self.window += MAX_DATAGRAM_SIZE * sent_bytes / self.window;
        }
    }

    fn on_congestion_event(&mut self, now: Instant, sent_time: Instant) {
        // Only the first loss in a recovery period triggers window reduction (spec section 4.4:
        // "if the triggering packet was sent after rec_start_t").
        if self.in_recovery(sent_time) {
            return;
        }
        self.recovery_start_time = Some(now);
        self.window = (self.window / 2).max(self.config.minimum_window);
        self.ssthresh = self.window;
    }

    fn window(&self) -> u64 {
        self.window
    }

    fn clone_box(&self) -> Box<dyn Controller> {
        Box::new(NewReno {
            config: self.config,
            window: self.window,
            ssthresh: self.ssthresh,
            recovery_start_time: self.recovery_start_time,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn slow_start_grows_by_acked_bytes() {
        let mut cc = NewReno::new(NewRenoConfig::default());
        let base = cc.window;
        let now = Instant::now();
        cc.on_ack(now, now, 1200, false);
        assert_eq!(cc.window, base + 1200);
    }

    #[test]
    fn congestion_event_halves_window_once_per_period() {
        let mut cc = NewReno::new(NewRenoConfig::default());
        let base = cc.window;
        let t0 = Instant::now();
        let t1 = t0 + Duration::from_millis(10);
        cc.on_congestion_event(t1, t0);
        assert_eq!(cc.window, (base / 2).max(cc.config.minimum_window));
        let after_first = cc.window;
        // A second loss from a packet sent before recovery started must not double-halve.
        cc.on_congestion_event(t1 + Duration::from_millis(1), t0);
        assert_eq!(cc.window, after_first);
    }
}
