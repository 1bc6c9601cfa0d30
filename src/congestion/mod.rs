//! Congestion control (spec section 4.4): pluggable behind a small `Controller` trait so the
//! NewReno-style algorithm the spec specifies can be swapped later without touching recovery.

mod new_reno;

pub use new_reno::NewReno;

use std::time::Instant;

/// The maximum datagram size this crate assumes absent path MTU discovery
pub const MAX_DATAGRAM_SIZE: u64 = 1200;

/// Per-path congestion state, driven by the recovery loop
pub trait Controller: Send {
    /// A non-lost, ack-eliciting packet of `sent_bytes` was just acknowledged
    fn on_ack(&mut self, now: Instant, sent_time: Instant, sent_bytes: u64, app_limited: bool);

    /// One or more packets were declared lost or an ECN-CE mark arrived; `sent_time` is the send
    /// time of the packet that triggered the event
    fn on_congestion_event(&mut self, now: Instant, sent_time: Instant);

    /// Amount of unacknowledged, in-flight data permitted before more sends are blocked
    fn window(&self) -> u64;

    fn clone_box(&self) -> Box<dyn Controller>;
}

/// Builds fresh `Controller`s, one per path, so a config can be shared across connections
pub trait ControllerFactory: Send + Sync {
    fn build(&self, now: Instant) -> Box<dyn Controller>;
}

#[derive(Debug, Clone, Copy)]
pub struct NewRenoConfig {
    pub initial_window: u64,
    pub minimum_window: u64,
}

impl Default for NewRenoConfig {
    fn default() -> Self {
        Self {
            // min(10 * MAX_DATAGRAM_SIZE, max(2 * MAX_DATAGRAM_SIZE, 14720)), per spec section 4.4
            initial_window: (10 * MAX_DATAGRAM_SIZE).min((2 * MAX_DATAGRAM_SIZE).max(14720)),
            minimum_window: 2 * MAX_DATAGRAM_SIZE,
        }
    }
}

impl ControllerFactory for NewRenoConfig {
    fn build(&self, _now: Instant) -> Box<dyn Controller> {
        Box::new(NewReno::new(*self))
    }
}
