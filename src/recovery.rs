//! Loss detection, RTT estimation, and the glue between a [`PacketNumberSpace`] and a
//! congestion [`Controller`] (spec section 4.4).
//!
//! This module owns nothing about *which* packets to retransmit — that's the connection's job,
//! using the `lost` list [`Recovery::detect_lost_packets`] returns — only the timing and
//! congestion-window bookkeeping RFC 9002 describes.

use std::cmp;
use std::time::{Duration, Instant};

use crate::congestion::{Controller, ControllerFactory, MAX_DATAGRAM_SIZE};
use crate::connection::spaces::{PacketNumberSpace, SentPacket};

/// A packet is considered lost after this many higher-numbered packets have been acknowledged
/// (spec section 4.4)
pub const PACKET_THRESHOLD: u64 = 3;
/// Local timer granularity; the floor under any loss or PTO delay
pub const GRANULARITY: Duration = Duration::from_millis(1);
/// RTT assumed before any real sample exists (RFC 9002 section 6.2.2)
pub const INITIAL_RTT: Duration = Duration::from_millis(333);
/// After this many consecutive PTOs, ECN support for the path is disabled (spec section 4.4)
pub const PERSISTENT_CONGESTION_THRESHOLD: u32 = 3;

/// RTT sample tracking (spec section 4.4, "RTT")
#[derive(Debug, Clone)]
pub struct RttEstimator {
    pub latest_rtt: Duration,
    pub min_rtt: Duration,
    pub smoothed_rtt: Duration,
    pub var_rtt: Duration,
    have_sample: bool,
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self {
            latest_rtt: INITIAL_RTT,
            min_rtt: INITIAL_RTT,
            smoothed_rtt: INITIAL_RTT,
            var_rtt: INITIAL_RTT / 2,
            have_sample: false,
        }
    }
}

impl RttEstimator {
    /// Fold in one RTT sample. `ack_delay` is the peer-reported delay from this ACK;
    /// `max_ack_delay` is the negotiated (or fixed handshake-epoch) ceiling on how much of it is
    /// trusted.
    pub fn update(&mut self, latest_rtt: Duration, ack_delay: Duration, max_ack_delay: Duration) {
        self.latest_rtt = latest_rtt;
        if !self.have_sample {
            self.have_sample = true;
            self.min_rtt = latest_rtt;
            self.smoothed_rtt = latest_rtt;
            self.var_rtt = latest_rtt / 2;
            return;
        }
        self.min_rtt = cmp::min(self.min_rtt, latest_rtt);

        let capped_delay = cmp::min(ack_delay, max_ack_delay);
        let adjusted_rtt = if latest_rtt >= self.min_rtt + capped_delay {
            latest_rtt - capped_delay
        } else {
            latest_rtt
        };

        let var_sample = abs_diff(self.smoothed_rtt, adjusted_rtt);
        self.var_rtt = (self.var_rtt * 3 + var_sample) / 4;
        self.smoothed_rtt = (self.smoothed_rtt * 7 + adjusted_rtt) / 8;
    }

    pub fn pto_base_duration(&self) -> Duration {
        self.smoothed_rtt + cmp::max(4 * self.var_rtt, GRANULARITY)
    }
}

fn abs_diff(a: Duration, b: Duration) -> Duration {
    if a > b {
        a - b
    } else {
        b - a
    }
}

/// What the run loop should do once the next-due alarm fires
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum LossDetectionAction {
    /// Declare losses already computed; nothing further to send
    DeclareLosses,
    /// No packets were lost; send a PTO probe instead
    SendProbe,
}

pub struct Recovery {
    pub rtt: RttEstimator,
    pub controller: Box<dyn Controller>,
    pub bytes_in_flight: u64,
    pub pto_count: u32,
    pub max_ack_delay: Duration,
    /// Reusable after a successful ACK in a space with no other losses
    pub ecn_enabled: bool,
}

impl Recovery {
    pub fn new(factory: &dyn ControllerFactory, now: Instant, max_ack_delay: Duration) -> Self {
        Self {
            rtt: RttEstimator::default(),
            controller: factory.build(now),
            bytes_in_flight: 0,
            pto_count: 0,
            max_ack_delay,
            ecn_enabled: true,
        }
    }

    /// `max(kGranularity, 9/8 * max(srtt, latest_rtt))` (spec section 4.4, "Loss detection")
    fn loss_delay(&self) -> Duration {
        let base = cmp::max(self.rtt.smoothed_rtt, self.rtt.latest_rtt);
        cmp::max(GRANULARITY, base * 9 / 8)
    }

    /// Scan `space`'s outstanding packets, marking anything below `largest_acked - threshold` or
    /// older than `loss_delay` as lost. Returns the lost packets (removed from `sent_packets`)
    /// and the earliest send time any not-yet-lost packet would need to wait until to be
    /// declared lost, for arming the loss-detection alarm.
    pub fn detect_lost_packets(&mut self, space: &mut PacketNumberSpace, now: Instant) -> Vec<(u64, SentPacket)> {
        let loss_delay = self.loss_delay();
        let Some(largest_acked) = space.largest_acked_packet else {
            return Vec::new();
        };

        let mut lost = Vec::new();
        let mut earliest_not_yet_lost = None;
        let lost_send_time = now.checked_sub(loss_delay).unwrap_or(now);

        let candidates: Vec<u64> = space
            .sent_packets
            .range(..=largest_acked)
            .map(|(&pn, _)| pn)
            .collect();
        for pn in candidates {
            let sent_before_threshold = largest_acked.saturating_sub(pn) >= PACKET_THRESHOLD;
            let sent_long_enough_ago = space.sent_packets[&pn].time_sent <= lost_send_time;
            if sent_before_threshold || sent_long_enough_ago {
                let packet = space.sent_packets.remove(&pn).unwrap();
                if packet.in_flight {
                    self.bytes_in_flight = self.bytes_in_flight.saturating_sub(packet.size as u64);
                }
                lost.push((pn, packet));
            } else if space.sent_packets[&pn].in_flight {
                let due = space.sent_packets[&pn].time_sent + loss_delay;
                earliest_not_yet_lost = Some(match earliest_not_yet_lost {
                    Some(t) if t < due => t,
                    _ => due,
                });
            }
        }

        space.loss_time = earliest_not_yet_lost;

        if let Some((_, last)) = lost.iter().max_by_key(|(pn, _)| *pn) {
            self.controller.on_congestion_event(now, last.time_sent);
        }

        lost
    }

    pub fn on_packet_sent(&mut self, packet: &SentPacket) {
        if packet.in_flight {
            self.bytes_in_flight += packet.size as u64;
        }
    }

    /// Fold a fresh ACK-derived RTT sample and grow the congestion window for every
    /// newly-acknowledged, still-in-flight packet.
    pub fn on_packets_acked(&mut self, now: Instant, acked: &[(u64, SentPacket)], app_limited: bool) {
        for (_, packet) in acked {
            if packet.in_flight {
                self.bytes_in_flight = self.bytes_in_flight.saturating_sub(packet.size as u64);
                self.controller
                    .on_ack(now, packet.time_sent, packet.size as u64, app_limited);
            }
        }
    }

    pub fn on_ecn_ce(&mut self, now: Instant, sent_time: Instant) {
        self.controller.on_congestion_event(now, sent_time);
    }

    /// Window available for new in-flight data
    pub fn congestion_window(&self) -> u64 {
        self.controller.window()
    }

    pub fn can_send(&self, additional: u64) -> bool {
        self.bytes_in_flight + additional <= self.congestion_window()
    }

    /// `(srtt + max(4*rttvar, kGranularity) + max_ack_delay) * 2^pto_count` (spec section 4.4)
    pub fn pto_duration(&self) -> Duration {
        let base = self.rtt.pto_base_duration() + self.max_ack_delay;
        base * 2u32.saturating_pow(self.pto_count)
    }

    /// `2 * max(srtt, kInitialRtt) * 2^crypto_count`, used for the Initial/Handshake spaces
    /// before any ACK has refined the RTT estimate (spec section 4.4)
    pub fn crypto_retransmit_duration(&self, crypto_count: u32) -> Duration {
        let base = 2 * cmp::max(self.rtt.smoothed_rtt, INITIAL_RTT);
        base * 2u32.saturating_pow(crypto_count)
    }

    /// After enough consecutive PTOs, treat the path as not supporting ECN (spec section 4.4)
    pub fn maybe_disable_ecn(&mut self) {
        if self.pto_count >= PERSISTENT_CONGESTION_THRESHOLD {
            self.ecn_enabled = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rtt_first_sample_sets_everything() {
        let mut rtt = RttEstimator::default();
        rtt.update(Duration::from_millis(100), Duration::from_millis(5), Duration::from_millis(25));
        assert_eq!(rtt.smoothed_rtt, Duration::from_millis(100));
        assert_eq!(rtt.min_rtt, Duration::from_millis(100));
    }

    #[test]
    fn rtt_later_sample_blends() {
        let mut rtt = RttEstimator::default();
        rtt.update(Duration::from_millis(100), Duration::from_millis(0), Duration::from_millis(25));
        rtt.update(Duration::from_millis(140), Duration::from_millis(0), Duration::from_millis(25));
        assert!(rtt.smoothed_rtt > Duration::from_millis(100));
        assert!(rtt.smoothed_rtt < Duration::from_millis(140));
    }
}
