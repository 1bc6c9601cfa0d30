//! Packet-number space (spec section 3): per-epoch RX/TX tracking, ACK bookkeeping, and the set
//! of packets sent awaiting acknowledgement.

use std::collections::BTreeMap;
use std::time::Instant;

use bytes::Bytes;
use fnv::FnvHashMap;

use crate::crypto::Keys;
use crate::range_set::RangeSet;

/// Which of the three packet-number spaces a packet belongs to
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum SpaceId {
    Initial,
    Handshake,
    Data,
}

impl SpaceId {
    pub const ALL: [SpaceId; 3] = [SpaceId::Initial, SpaceId::Handshake, SpaceId::Data];
}

/// A record of one transmitted packet, kept until it's acknowledged or declared lost
#[derive(Debug, Clone)]
pub struct SentPacket {
    pub time_sent: Instant,
    pub size: u16,
    pub ack_eliciting: bool,
    pub in_flight: bool,
    /// Stream data included, as `(stream, offset, bytes)`, so loss can be retransmitted without
    /// re-reading it from anywhere else
    pub stream_frames: Vec<(crate::connection::streams::StreamId, u64, Bytes)>,
    /// CRYPTO data included, as `(offset, bytes)`, for the same reason
    pub crypto_frame: Option<(u64, Bytes)>,
    pub retransmits: super::Retransmits,
    /// Previous transmission this packet resends, for RTX-chain bookkeeping (spec section 9)
    pub rtx_of: Option<u64>,
}

impl SentPacket {
    pub fn ack_only(&self) -> bool {
        !self.ack_eliciting
    }
}

pub struct PacketNumberSpace {
    pub id: SpaceId,
    pub keys: Option<Keys>,

    pub largest_acked_packet: Option<u64>,
    pub largest_sent_packet: Option<u64>,
    /// The largest packet number successfully decrypted in this space so far, used to expand a
    /// newly-received truncated packet number (RFC 9000 Appendix A) — distinct from
    /// `largest_acked_packet`, which is the largest *our own* packet the peer has acknowledged.
    pub largest_rx_packet: Option<u64>,
    pub sent_packets: BTreeMap<u64, SentPacket>,

    /// Packet numbers received, pending acknowledgement
    pub recv: RangeSet,
    /// Every packet number ever received, for duplicate detection
    pub recv_all: RangeSet,
    pub ect0_count: u64,
    pub ect1_count: u64,
    pub ce_count: u64,

    pub pkts_rxed_since_last_ack_tx: u64,
    pub ack_elicited: bool,
    pub permit_ack_only: bool,

    /// Abandoned (e.g. Initial/Handshake discarded once the next epoch installs)
    pub dead: bool,

    pub loss_time: Option<Instant>,
    pub time_of_last_sent_ack_eliciting_packet: Option<Instant>,
    pub time_of_last_sent_crypto_packet: Option<Instant>,
    pub crypto_count: u32,
    pub loss_probes: u32,

    next_pn: u64,
    pub pending: super::Retransmits,
}

impl PacketNumberSpace {
    pub fn new(id: SpaceId) -> Self {
        Self {
            id,
            keys: None,
            largest_acked_packet: None,
            largest_sent_packet: None,
            largest_rx_packet: None,
            sent_packets: BTreeMap::new(),
            recv: RangeSet::new(),
            recv_all: RangeSet::new(),
            ect0_count: 0,
            ect1_count: 0,
            ce_count: 0,
            pkts_rxed_since_last_ack_tx: 0,
            ack_elicited: false,
            permit_ack_only: false,
            dead: false,
            loss_time: None,
            time_of_last_sent_ack_eliciting_packet: None,
            time_of_last_sent_crypto_packet: None,
            crypto_count: 0,
            loss_probes: 0,
            next_pn: 0,
            pending: super::Retransmits::default(),
        }
    }

    /// Whether `pn` is a duplicate we've already processed
    pub fn is_duplicate(&self, pn: u64) -> bool {
        self.recv_all.contains(pn)
    }

    pub fn record_received(&mut self, pn: u64) {
        self.recv.insert_one(pn);
        self.recv_all.insert_one(pn);
        self.largest_rx_packet = Some(self.largest_rx_packet.map_or(pn, |l| l.max(pn)));
    }

    /// Allocate the next packet number to send in this space
    pub fn next_packet_number(&mut self) -> u64 {
        let pn = self.next_pn;
        self.next_pn += 1;
        pn
    }

    /// Choose the packet-number encoding length (1-4 bytes), per spec section 4.2: smallest `pnl`
    /// such that `2 * (nr - largest_acked) <= 2^(8 * pnl)`
    pub fn packet_number_len(&self, nr: u64) -> usize {
        let largest_acked = self.largest_acked_packet.unwrap_or(0);
        let range = nr.saturating_sub(largest_acked).saturating_add(1) * 2;
        if range <= 1 << 8 {
            1
        } else if range <= 1 << 16 {
            2
        } else if range <= 1 << 24 {
            3
        } else {
            4
        }
    }

    pub fn has_unacked_ack_eliciting(&self) -> bool {
        self.sent_packets.values().any(|p| p.ack_eliciting)
    }
}

pub type Spaces = FnvHashMap<SpaceId, PacketNumberSpace>;
