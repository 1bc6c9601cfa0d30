//! Connection state machine (spec section 4.1) and the RX/TX pipelines that drive it (spec
//! sections 4.2-4.7): dispatch of decoded frames to recovery/flow-control/CID state, and
//! assembly of outgoing packets from whatever the connection currently needs to send.

pub mod cid_state;
pub mod spaces;
pub mod streams;

use std::cmp;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::{Buf, Bytes, BytesMut};
use fnv::FnvHashSet;
use tracing::{debug, trace, warn};

use crate::cid::{ConnectionId, ResetToken};
use crate::congestion::ControllerFactory;
use crate::crypto::{Epoch, Keys, Session, TranscriptEvent};
use crate::error::{ConnectionError, TransportError, TransportErrorCode};
use crate::frame::{self, Ack, EcnCounts, Frame, FrameType};
use crate::packet::{self, Header, LongType};
use crate::range_set::RangeSet;
use crate::recovery::Recovery;
use crate::transport_parameters::TransportParameters;
use crate::{Side, VarInt};

use cid_state::CidState;
use spaces::{PacketNumberSpace, SentPacket, SpaceId, Spaces};
use streams::{Dir, Recv, Send, StreamId, Streams};

/// The connection state machine (spec section 4.1).
///
/// A transition to the same variant is a logic bug (`debug_assert!` catches it in
/// [`Connection::set_state`]); every other transition is the only place the `state` field of
/// [`Connection`] changes.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum State {
    /// `clsd`: fully terminated, ready to be torn down by the endpoint
    Closed,
    /// `idle`: client hasn't sent its first Initial yet
    Idle,
    /// `opng`: handshake in flight, not yet confirmed
    Opening,
    /// `estb`: handshake confirmed in both directions
    Established,
    /// `qlse`: a local error was raised but CONNECTION_CLOSE has not yet been transmitted
    QueueClose,
    /// `clsg`: CONNECTION_CLOSE has been enqueued; waiting for the closing timer or a final ACK
    Closing,
    /// `drng`: the peer's CONNECTION_CLOSE was received; draining until the timer fires
    Draining,
}

impl State {
    fn is_terminal(self) -> bool {
        matches!(self, State::Closed)
    }

    fn is_closed_or_draining(self) -> bool {
        matches!(self, State::Closing | State::Draining | State::QueueClose)
    }
}

/// Control frames owed to the peer that must survive packet loss, replayed until acknowledged
/// (spec section 4.2's TX frame ordering; spec section 9 calls these "connection/stream
/// control").
#[derive(Default, Clone)]
pub struct Retransmits {
    pub max_data: bool,
    pub max_stream_data: FnvHashSet<StreamId>,
    pub max_streams_bi: bool,
    pub max_streams_uni: bool,
    pub data_blocked: bool,
    pub stream_data_blocked: FnvHashSet<StreamId>,
    pub streams_blocked_bi: bool,
    pub streams_blocked_uni: bool,
    pub new_connection_id: Vec<u64>,
    pub retire_connection_id: Vec<u64>,
    pub path_challenge: Option<[u8; 8]>,
    pub path_response: Option<[u8; 8]>,
    pub handshake_done: bool,
    pub new_token: Option<Bytes>,
    pub ping: bool,
    pub reset_stream: Vec<(StreamId, VarInt)>,
    pub stop_sending: Vec<(StreamId, VarInt)>,
}

impl Retransmits {
    pub fn is_empty(&self) -> bool {
        !self.max_data
            && self.max_stream_data.is_empty()
            && !self.max_streams_bi
            && !self.max_streams_uni
            && !self.data_blocked
            && self.stream_data_blocked.is_empty()
            && !self.streams_blocked_bi
            && !self.streams_blocked_uni
            && self.new_connection_id.is_empty()
            && self.retire_connection_id.is_empty()
            && self.path_challenge.is_none()
            && self.path_response.is_none()
            && !self.handshake_done
            && self.new_token.is_none()
            && !self.ping
            && self.reset_stream.is_empty()
            && self.stop_sending.is_empty()
    }

    /// Merge another batch back in, as happens when a packet carrying them is declared lost
    pub fn merge(&mut self, other: Retransmits) {
        self.max_data |= other.max_data;
        self.max_stream_data.extend(other.max_stream_data);
        self.max_streams_bi |= other.max_streams_bi;
        self.max_streams_uni |= other.max_streams_uni;
        self.data_blocked |= other.data_blocked;
        self.stream_data_blocked.extend(other.stream_data_blocked);
        self.streams_blocked_bi |= other.streams_blocked_bi;
        self.streams_blocked_uni |= other.streams_blocked_uni;
        self.new_connection_id.extend(other.new_connection_id);
        self.retire_connection_id.extend(other.retire_connection_id);
        self.path_challenge = self.path_challenge.or(other.path_challenge);
        self.path_response = self.path_response.or(other.path_response);
        self.handshake_done |= other.handshake_done;
        self.new_token = self.new_token.take().or(other.new_token);
        self.ping |= other.ping;
        self.reset_stream.extend(other.reset_stream);
        self.stop_sending.extend(other.stop_sending);
    }
}

/// Per-connection knobs a `Connection` is built with; the wire-visible half is carried in
/// [`TransportParameters`], this is purely local behavior.
#[derive(Clone)]
pub struct Config {
    pub max_remote_bi_streams: u64,
    pub max_remote_uni_streams: u64,
    pub receive_window: u64,
    pub stream_receive_window: u64,
    pub idle_timeout: Duration,
    pub ack_delay_exponent: u64,
    pub max_ack_delay: Duration,
    pub spin_enabled: bool,
    /// Interop hack (spec section 9 Open Questions): unconditionally Retry on port 4434
    pub retry_on_port_4434: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_remote_bi_streams: 100,
            max_remote_uni_streams: 100,
            receive_window: 1 << 20,
            stream_receive_window: 1 << 18,
            idle_timeout: Duration::from_secs(30),
            ack_delay_exponent: 3,
            max_ack_delay: Duration::from_millis(25),
            spin_enabled: true,
            retry_on_port_4434: false,
        }
    }
}

/// Which alarm most recently fired, surfaced to the application/run loop by [`Connection::poll`]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Event {
    Connected,
    StreamReadable(StreamId),
    StreamWritable(StreamId),
    StreamFinished(StreamId),
    ConnectionLost,
    HandshakeDataReady,
}

/// Every one-shot crypto offset tracker needed for the three handshake epochs. Crypto data has
/// no flow control and no framing beyond offset + length, so a bare [`Send`]/[`Recv`] pair per
/// epoch (rather than the general `Streams` map) is enough (spec section 3: "crypto streams").
struct CryptoSpace {
    send: Send,
    recv: Recv,
}

impl CryptoSpace {
    fn new() -> Self {
        Self {
            send: Send::new(u64::MAX),
            recv: Recv::new(u64::MAX),
        }
    }
}

pub struct Connection {
    pub side: Side,
    state: State,
    pub version: u32,

    pub peer: SocketAddr,
    pub cids: CidState,

    spaces: Spaces,
    crypto: [CryptoSpace; 3],
    pub streams: Streams,

    pub tp_in: TransportParameters,
    pub tp_out: TransportParameters,
    params_sent: bool,
    params_received: bool,

    tls: Box<dyn Session>,
    recovery: Recovery,

    config: Config,

    // Timers (spec section 4.7)
    idle_timeout_at: Option<Instant>,
    closing_timeout_at: Option<Instant>,
    ack_timeout: [Option<Instant>; 3],
    key_flip_at: Option<Instant>,

    // Error / close bookkeeping (spec section 7)
    close_reason: Option<CloseReason>,
    close_frame_to_send: Option<Frame>,

    events: VecDeque<Event>,
    readable_streams: FnvHashSet<StreamId>,
    writable_streams: FnvHashSet<StreamId>,

    pub spin_enabled: bool,
    spin: bool,
    key_phase: bool,
    zero_rtt_enabled: bool,
    did_0rtt: bool,

    stored_new_tokens: Vec<Bytes>,

    /// Token echoed by a server Retry, carried on every subsequent Initial until the handshake
    /// completes (spec section 8, scenario 3)
    retry_token: Option<Bytes>,
    /// Whether this connection has already accepted one Retry; a second is a protocol violation
    retry_received: bool,

    pub needs_tx: bool,
}

#[derive(Debug, Clone)]
enum CloseReason {
    Transport(TransportError),
    Application { code: VarInt, reason: Bytes },
}

impl Connection {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        side: Side,
        config: Config,
        controller_factory: &dyn ControllerFactory,
        tls: Box<dyn Session>,
        local_cid: ConnectionId,
        local_reset_token: ResetToken,
        remote_cid: ConnectionId,
        remote_reset_token: ResetToken,
        peer: SocketAddr,
        now: Instant,
    ) -> Self {
        let mut spaces = Spaces::default();
        for id in SpaceId::ALL {
            spaces.insert(id, PacketNumberSpace::new(id));
        }
        let tp_in = TransportParameters {
            initial_max_streams_bidi: config.max_remote_bi_streams,
            initial_max_streams_uni: config.max_remote_uni_streams,
            initial_max_data: config.receive_window,
            initial_max_stream_data_bidi_local: config.stream_receive_window,
            initial_max_stream_data_bidi_remote: config.stream_receive_window,
            initial_max_stream_data_uni: config.stream_receive_window,
            max_idle_timeout: config.idle_timeout.as_millis() as u64,
            ack_delay_exponent: config.ack_delay_exponent,
            max_ack_delay: config.max_ack_delay.as_millis() as u64,
            active_connection_id_limit: 4,
            ..TransportParameters::default()
        };

        // The limit on streams *we* may open is the peer's to grant, via its transport
        // parameters or a later MAX_STREAMS; until one of those arrives, it's zero. The limit
        // we grant the peer is ours to set, fixed here to what we advertise in `tp_in` above.
        let streams = Streams::new(
            side,
            0,
            0,
            config.receive_window,
            config.max_remote_bi_streams,
            config.max_remote_uni_streams,
        );

        let mut conn = Self {
            side,
            state: if side.is_client() { State::Idle } else { State::Opening },
            version: packet::VERSION,
            peer,
            cids: CidState::new(local_cid, local_reset_token, remote_cid, remote_reset_token),
            spaces,
            crypto: [CryptoSpace::new(), CryptoSpace::new(), CryptoSpace::new()],
            streams,
            tp_in,
            tp_out: TransportParameters::default(),
            params_sent: false,
            params_received: false,
            tls,
            recovery: Recovery::new(controller_factory, now, config.max_ack_delay),
            spin_enabled: config.spin_enabled,
            config,
            idle_timeout_at: None,
            closing_timeout_at: None,
            ack_timeout: [None; 3],
            key_flip_at: None,
            close_reason: None,
            close_frame_to_send: None,
            events: VecDeque::new(),
            readable_streams: FnvHashSet::default(),
            writable_streams: FnvHashSet::default(),
            spin: false,
            key_phase: false,
            zero_rtt_enabled: false,
            did_0rtt: false,
            stored_new_tokens: Vec::new(),
            retry_token: None,
            retry_received: false,
            needs_tx: true,
        };
        let mut encoded_tp = BytesMut::new();
        conn.tp_in.write(&mut encoded_tp);
        conn.tls.set_local_transport_parameters(encoded_tp.freeze());
        conn.params_sent = true;
        // Pick up whatever the session has queued before a single byte arrives: the Initial
        // keys (derived locally, not TLS-negotiated) and, for the client, its first
        // ClientHello-bearing CRYPTO data.
        if let Err(e) = conn.drive_tls(SpaceId::Initial) {
            conn.err_close(now, e);
        }
        conn
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.state == State::Established
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_terminal()
    }

    /// Whether this side's transport parameters have gone out to the peer
    pub fn params_sent(&self) -> bool {
        self.params_sent
    }

    /// Whether the peer's transport parameters have been decoded and applied to `tp_out`
    pub fn params_received(&self) -> bool {
        self.params_received
    }

    /// The only place `state` mutates (spec section 4.1)
    fn set_state(&mut self, new: State) {
        debug_assert_ne!(self.state, new, "transition to the same state is a bug");
        trace!(?self.state, ?new, "state transition");
        self.state = new;
    }

    // ---------------------------------------------------------------- RX pipeline (spec 4.7) --

    /// Handle one just-arrived UDP datagram, decoalescing and processing every packet within it
    pub fn handle_datagram(&mut self, now: Instant, remote: SocketAddr, data: BytesMut) {
        for part in packet::decoalesce(data.freeze()) {
            if let Err(e) = self.handle_packet(now, remote, part) {
                debug!(error = %e, "fatal protocol violation, closing");
                self.err_close(now, e);
                return;
            }
        }
    }

    /// Decode, unprotect, and dispatch one packet. Only genuine protocol violations (spec
    /// section 7's fatal list) return `Err`; a packet that merely fails to parse or decrypt is
    /// logged and dropped in place, per spec section 7's "recoverable per-frame conditions ...
    /// are logged and the packet is dropped" — a single corrupted or spoofed UDP packet must
    /// never be enough to tear down a connection.
    fn handle_packet(&mut self, now: Instant, remote: SocketAddr, data: Bytes) -> Result<(), TransportError> {
        let dcid_len = self.cids.local.active().len();
        let header = match packet::decode_hdr_beginning(dcid_len, &data) {
            Ok(h) => h,
            Err(e) => {
                trace!(error = %e, "dropping unparseable packet header");
                return Ok(());
            }
        };

        if let Header::VersionNegotiate { .. } = header {
            // Version negotiation restarts the handshake at a version both sides support; this
            // crate speaks exactly one version, so any VN packet simply fails the connection
            // (spec section 8, scenario 2 covers the multi-version case external tooling drives).
            return Err(TransportError::new(
                TransportErrorCode::ProtocolViolation,
                None,
                "no mutually supported version",
            ));
        }

        let space_id = match header.long_type() {
            Some(LongType::Initial) => SpaceId::Initial,
            Some(LongType::Handshake) => SpaceId::Handshake,
            Some(LongType::ZeroRtt) => SpaceId::Data,
            Some(LongType::Retry) => {
                // Retry carries no packet-number space; handled entirely by the endpoint/client
                // before a `Connection` exists for the new attempt.
                return Ok(());
            }
            None => SpaceId::Data,
        };

        let is_long = header.long_type().is_some();
        let number_offset = match &header {
            Header::Initial { number_offset, .. } | Header::Long { number_offset, .. } | Header::Short { number_offset, .. } => {
                *number_offset
            }
            _ => unreachable!("handled above"),
        };

        let mut buf = BytesMut::from(&data[..]);
        // RFC 9000 Appendix A expands the truncated wire packet number against the largest
        // *received* (decrypted) packet number in this space so far, not the largest our own
        // packet the peer has acknowledged.
        let largest_rx = self.spaces[&space_id].largest_rx_packet;
        let keys = match self.spaces[&space_id].keys.as_ref() {
            Some(k) => k,
            None => {
                trace!(?space_id, "no keys installed yet, dropping");
                return Ok(());
            }
        };

        let (pn, pn_len) = match packet::remove_header_protection(&mut buf, number_offset, is_long, &keys.header.remote, largest_rx) {
            Ok(v) => v,
            Err(e) => {
                trace!(error = %e, "dropping packet: header protection removal failed");
                return Ok(());
            }
        };

        let space = &self.spaces[&space_id];
        if space.is_duplicate(pn) {
            trace!(pn, "duplicate packet, dropping");
            return Ok(());
        }

        let header_len = number_offset + pn_len;
        let packet_len = match &header {
            Header::Initial { len, .. } | Header::Long { len, .. } => header_len + *len as usize - pn_len,
            _ => buf.len(),
        };
        if packet_len > buf.len() {
            return Err(TransportError::new(TransportErrorCode::ProtocolViolation, None, "length exceeds datagram"));
        }
        let (header_bytes, rest) = buf.split_at_mut(header_len);
        let payload_ciphertext = &mut rest[..packet_len - header_len];

        // A short-header packet whose key-phase bit disagrees with our expectation is either the
        // peer initiating a key update (RFC 9001 section 6) or a stale/spoofed packet; only a
        // packet number higher than anything seen so far in this space, and one that actually
        // decrypts under the next-generation keys, is accepted as the former.
        let peer_key_phase = !is_long && (header_bytes[0] & 0x04) != 0;
        let keys = self.spaces[&space_id].keys.as_ref().expect("checked above");
        let is_update_candidate = space_id == SpaceId::Data && peer_key_phase != self.key_phase;
        let plaintext = if is_update_candidate && largest_rx.map_or(true, |l| pn > l) {
            let candidate = keys.packet.update();
            match packet::open(&candidate.remote, pn, header_bytes, payload_ciphertext) {
                Ok(p) => {
                    let p = Bytes::copy_from_slice(p);
                    self.spaces.get_mut(&space_id).unwrap().keys.as_mut().unwrap().packet = candidate;
                    self.key_phase = peer_key_phase;
                    debug!(pn, "peer-initiated key update accepted");
                    Some(p)
                }
                Err(_) => None,
            }
        } else if is_update_candidate {
            // Lower packet number than anything seen yet, claiming a new phase: a stale or
            // spoofed packet, not a legitimate update (RFC 9001 section 6.3, "illegal key
            // update"). Dropped rather than treated as fatal, since it can't affect connection
            // state either way.
            None
        } else {
            packet::open(&keys.packet.remote, pn, header_bytes, payload_ciphertext).ok().map(Bytes::copy_from_slice)
        };
        let plaintext = match plaintext {
            Some(p) => p,
            None => {
                trace!(pn, "dropping packet: AEAD authentication failed");
                return Ok(());
            }
        };
        let udp_len = data.len() as u64;

        self.spaces.get_mut(&space_id).unwrap().record_received(pn);
        self.maybe_begin_migration(remote, pn, udp_len, now);
        self.reset_idle_timeout(now);

        self.process_frames(now, space_id, pn, plaintext, &header)?;

        if self.state == State::Opening && space_id == SpaceId::Data {
            self.set_state(State::Established);
            self.events.push_back(Event::Connected);
        }
        self.needs_tx = true;
        Ok(())
    }

    /// Proactively flip to the next key-phase generation (spec section 3's `do_key_flip`, armed
    /// by the key-flip alarm named in spec section 4.7). Both directions' packet-protection keys
    /// rotate together since each side derives its next generation independently from its own
    /// current secret (RFC 9001 section 6.1); only the packet-protection keys move; header
    /// protection is unaffected.
    pub fn initiate_key_update(&mut self) {
        if self.state != State::Established {
            return;
        }
        let space = self.spaces.get_mut(&SpaceId::Data).unwrap();
        if let Some(keys) = space.keys.as_mut() {
            keys.packet = keys.packet.update();
            self.key_phase = !self.key_phase;
            self.needs_tx = true;
            debug!("initiated local key update");
        }
    }

    /// Arm the key-flip alarm (spec section 4.7) to fire a proactive [`Self::initiate_key_update`]
    /// at `at`; callers (e.g. a periodic key-rotation policy) decide the schedule, since the spec
    /// names the alarm but not an interval.
    pub fn schedule_key_update(&mut self, at: Instant) {
        self.key_flip_at = Some(at);
    }

    /// Apply a server Retry, validated by the endpoint against the odcid this connection sent
    /// its first Initial to (spec section 8, scenario 3; spec section 9, "Retry-list" note does
    /// not apply here — this is the one-shot CID switch, not the rtx chain).
    ///
    /// The client discards its original Initial packet-number space, re-derives Initial keys
    /// under the server-chosen CID, and retransmits its ClientHello with the echoed token on
    /// the next `poll_transmit`.
    pub fn handle_retry(&mut self, new_dcid: ConnectionId, token: Bytes) -> bool {
        if self.side.is_server() || self.retry_received || !matches!(self.state, State::Idle | State::Opening) {
            return false;
        }
        self.retry_received = true;
        self.retry_token = Some(token);
        self.cids.remote = CidState::new(
            *self.cids.local.active(),
            *self.cids.local.active_reset_token(),
            new_dcid,
            ResetToken::new([0; 16]),
        )
        .remote;
        let mut space = PacketNumberSpace::new(SpaceId::Initial);
        space.keys = Some(crate::crypto::initial_keys(&new_dcid, self.side));
        self.spaces.insert(SpaceId::Initial, space);
        self.needs_tx = true;
        true
    }

    /// Record a CID the endpoint just minted on this connection's behalf and queue a
    /// `NEW_CONNECTION_ID` announcing it (spec section 4.5).
    pub fn issue_new_cid(&mut self, id: ConnectionId, reset_token: ResetToken) {
        let seq = self.cids.issue_local(id, reset_token);
        self.pending_mut(SpaceId::Data).new_connection_id.push(seq);
        self.needs_tx = true;
    }

    fn maybe_begin_migration(&mut self, remote: SocketAddr, pn: u64, udp_len: u64, now: Instant) {
        if remote == self.peer {
            self.cids.highest_pn_from_peer = self.cids.highest_pn_from_peer.max(pn);
            return;
        }
        if pn > self.cids.highest_pn_from_peer {
            self.cids.begin_migration(remote, pn, udp_len, now);
            if let Some(challenge) = self.cids.path_challenge.as_ref().map(|c| c.challenge) {
                self.pending_mut(SpaceId::Data).path_challenge = Some(challenge);
            }
        }
    }

    fn process_frames(
        &mut self,
        now: Instant,
        space_id: SpaceId,
        packet_number: u64,
        payload: Bytes,
        header: &Header,
    ) -> Result<(), TransportError> {
        let restricted = header.is_long_restricted();
        let is_0rtt = matches!(header, Header::Long { ty: LongType::ZeroRtt, .. });
        let mut ack_eliciting = false;
        let mut saw_ack = false;

        for frame in frame::Iter::new(payload) {
            let frame = frame.map_err(|_| TransportError::new(TransportErrorCode::FrameEncoding, None, "truncated frame"))?;

            if restricted
                && !matches!(
                    frame,
                    Frame::Ack(_) | Frame::Crypto(_) | Frame::Padding | Frame::ConnectionClose(_)
                )
            {
                return Err(TransportError::new(
                    TransportErrorCode::ProtocolViolation,
                    Some(frame.ty()),
                    "frame not permitted in this epoch",
                ));
            }
            if is_0rtt && matches!(frame, Frame::Ack(_)) {
                return Err(TransportError::new(
                    TransportErrorCode::ProtocolViolation,
                    Some(FrameType::Ack),
                    "ACK not permitted in 0-RTT",
                ));
            }

            if frame.is_ack_eliciting() {
                ack_eliciting = true;
            }
            if matches!(frame, Frame::Ack(_)) {
                saw_ack = true;
            }

            self.handle_frame(now, space_id, frame)?;
        }

        let space = self.spaces.get_mut(&space_id).unwrap();
        if ack_eliciting {
            space.ack_elicited = true;
            space.pkts_rxed_since_last_ack_tx += 1;
            // Immediate ACK on out-of-order arrival; otherwise coalesce up to max_ack_delay
            // (spec section 4.4, "ACK coalescing and scheduling").
            let out_of_order = space.recv.max() != Some(packet_number);
            self.ack_timeout[space_id as usize] = Some(if out_of_order {
                now
            } else {
                now + self.tp_out_max_ack_delay()
            });
        }
        let _ = saw_ack;
        Ok(())
    }

    fn tp_out_max_ack_delay(&self) -> Duration {
        Duration::from_millis(self.tp_out.max_ack_delay.max(1))
    }

    fn handle_frame(&mut self, now: Instant, space_id: SpaceId, frame: Frame) -> Result<(), TransportError> {
        match frame {
            Frame::Padding | Frame::Ping => {}
            Frame::Ack(ack) => self.handle_ack(now, space_id, ack)?,
            Frame::Crypto(c) => self.handle_crypto(space_id, c)?,
            Frame::Stream(s) => self.handle_stream(s)?,
            Frame::ResetStream { id, .. } => {
                if let Some(stream) = self.streams.get_mut(id) {
                    stream.state = streams::StreamState::Closed;
                    self.readable_streams.insert(id);
                }
            }
            Frame::StopSending { id, .. } => {
                self.writable_streams.remove(&id);
            }
            Frame::NewToken { token } => self.stored_new_tokens.push(token),
            Frame::MaxData(limit) => {
                self.streams.max_data = self.streams.max_data.max(limit.into_inner());
            }
            Frame::MaxStreamData { id, max } => {
                if let Some(stream) = self.streams.get_mut(id).and_then(|s| s.send.as_mut()) {
                    stream.max_data = stream.max_data.max(max.into_inner());
                }
            }
            Frame::MaxStreams { bidi, count } => {
                // Raises the ceiling on streams *we* may open; tracked alongside the remote
                // limits already in `Streams` for simplicity (spec section 4.6).
                if bidi {
                    self.streams.set_max_remote_bi(count.into_inner());
                } else {
                    self.streams.set_max_remote_uni(count.into_inner());
                }
            }
            Frame::DataBlocked { .. } => {
                if 2 * self.streams.data_recvd > self.streams.local_max_data {
                    self.streams.local_max_data *= 2;
                    self.pending_mut(space_id).max_data = true;
                }
            }
            Frame::StreamDataBlocked { id, .. } => {
                if let Some(stream) = self.streams.get_mut(id).and_then(|s| s.recv.as_mut()) {
                    stream.max_data *= 2;
                    self.pending_mut(space_id).max_stream_data.insert(id);
                }
            }
            Frame::StreamsBlocked { bidi, limit } => {
                let dir = if bidi { Dir::Bi } else { Dir::Uni };
                if let Some(new_limit) = self.streams.maybe_grant_streams(dir, limit.into_inner()) {
                    let _ = new_limit;
                    if bidi {
                        self.pending_mut(space_id).max_streams_bi = true;
                    } else {
                        self.pending_mut(space_id).max_streams_uni = true;
                    }
                }
            }
            Frame::NewConnectionId {
                sequence,
                retire_prior_to,
                id,
                reset_token,
            } => {
                let limit = self.tp_in.active_connection_id_limit;
                let retired = self
                    .cids
                    .remote
                    .insert(sequence.into_inner(), retire_prior_to.into_inner(), id, reset_token, limit)?;
                self.pending_mut(space_id).retire_connection_id.extend(retired);
            }
            Frame::RetireConnectionId { sequence } => {
                // Retiring one of our locally-issued CIDs just shrinks this side's live count;
                // the endpoint notices on its next dispatch and mints a replacement (spec
                // section 4.5), so there's nothing further to queue here.
                self.cids.local.retire(sequence.into_inner());
            }
            Frame::PathChallenge(data) => {
                self.pending_mut(space_id).path_response = Some(data);
            }
            Frame::PathResponse(data) => {
                if let Some(confirmed) = self.cids.confirm_migration(data) {
                    self.peer = confirmed;
                }
            }
            Frame::ConnectionClose(c) => {
                self.close_reason = Some(if c.is_app {
                    CloseReason::Application {
                        code: c.error_code,
                        reason: c.reason,
                    }
                } else {
                    CloseReason::Transport(TransportError::new(
                        TransportErrorCode::from_code(c.error_code.into_inner()),
                        None,
                        String::from_utf8_lossy(&c.reason).into_owned(),
                    ))
                });
                if !self.state.is_closed_or_draining() {
                    self.set_state(State::Draining);
                    self.closing_timeout_at = Some(now); // drain immediately, no retransmission
                }
                self.events.push_back(Event::ConnectionLost);
            }
            Frame::HandshakeDone => {
                if self.state != State::Established {
                    self.set_state(State::Established);
                }
            }
        }
        Ok(())
    }

    fn handle_ack(&mut self, now: Instant, space_id: SpaceId, ack: Ack) -> Result<(), TransportError> {
        let ack_delay_exp = if space_id == SpaceId::Data {
            self.tp_out.ack_delay_exponent
        } else {
            3
        };
        let ack_delay = Duration::from_micros(ack.delay << ack_delay_exp);

        let mut newly_acked = Vec::new();
        {
            let space = self.spaces.get_mut(&space_id).unwrap();
            space.largest_acked_packet = Some(space.largest_acked_packet.map_or(ack.largest, |l| l.max(ack.largest)));
            for range in ack.iter() {
                for pn in range {
                    if let Some(packet) = space.sent_packets.remove(&pn) {
                        newly_acked.push((pn, packet));
                    }
                }
            }
        }
        if newly_acked.is_empty() {
            return Ok(());
        }

        // An RTT sample is only valid when the largest packet this ACK reports was itself newly
        // acknowledged (RFC 9002 section 5.1).
        if let Some((_, largest_packet)) = newly_acked.iter().find(|(pn, _)| *pn == ack.largest) {
            let sample = now.saturating_duration_since(largest_packet.time_sent);
            self.recovery.rtt.update(sample, ack_delay, self.max_ack_delay_for(space_id));
        }

        self.recovery.on_packets_acked(now, &newly_acked, false);

        if let Some(ecn) = &ack.ecn {
            let space = self.spaces.get_mut(&space_id).unwrap();
            if ecn.ce > space.ce_count {
                space.ce_count = ecn.ce;
                if let Some((_, last)) = newly_acked.last() {
                    self.recovery.on_ecn_ce(now, last.time_sent);
                }
            }
        }

        // Resurrect any retransmits the now-acked packets carried, minus what's superseded.
        for (_, packet) in &newly_acked {
            for (stream, offset, data) in &packet.stream_frames {
                if let Some(send) = self.streams.get_mut(*stream).and_then(|s| s.send.as_mut()) {
                    send.ack(*offset, data.len() as u64);
                }
            }
            if let Some((offset, data)) = &packet.crypto_frame {
                self.crypto[space_id as usize].send.ack(*offset, data.len() as u64);
            }
        }

        let lost = self.recovery.detect_lost_packets(self.spaces.get_mut(&space_id).unwrap(), now);
        for (pn, packet) in lost {
            trace!(pn, ?space_id, "packet declared lost");
            self.requeue_lost(space_id, packet);
        }
        self.recovery.pto_count = 0;
        Ok(())
    }

    fn max_ack_delay_for(&self, space_id: SpaceId) -> Duration {
        if space_id == SpaceId::Data {
            self.tp_out_max_ack_delay()
        } else {
            Duration::ZERO
        }
    }

    /// Put a lost packet's content back on the retransmission queue: control frames return to
    /// `pending`, stream bytes are reinserted into their stream's send queue (spec section 8,
    /// scenario 4: "the payload is retransmitted in a new packet").
    fn requeue_lost(&mut self, space_id: SpaceId, packet: SentPacket) {
        self.pending_mut(space_id).merge(packet.retransmits);
        for (stream, offset, data) in packet.stream_frames {
            if let Some(send) = self.streams.get_mut(stream).and_then(|s| s.send.as_mut()) {
                // A FIN-only frame carries no bytes a RangeSet can track; resend it iff the FIN
                // itself hasn't been acknowledged yet.
                if data.is_empty() {
                    if send.fin_sent && !send.fin_acked {
                        send.retransmit(offset, data);
                    }
                    continue;
                }
                for gap in send.unacked_ranges(offset, data.len() as u64) {
                    let skip = (gap.start - offset) as usize;
                    let glen = (gap.end - gap.start) as usize;
                    send.retransmit(gap.start, data.slice(skip..skip + glen));
                }
            }
        }
        if let Some((offset, data)) = packet.crypto_frame {
            let crypto = &mut self.crypto[space_id as usize];
            for gap in crypto.send.unacked_ranges(offset, data.len() as u64) {
                let skip = (gap.start - offset) as usize;
                let glen = (gap.end - gap.start) as usize;
                crypto.send.retransmit(gap.start, data.slice(skip..skip + glen));
            }
        }
        self.needs_tx = true;
    }

    fn handle_crypto(&mut self, space_id: SpaceId, c: frame::Crypto) -> Result<(), TransportError> {
        let epoch = space_to_epoch(space_id);
        let crypto = &mut self.crypto[space_id as usize];
        crypto.recv.ingest(c.offset, c.data.clone(), false);
        let mut buf = [0u8; 4096];
        loop {
            let n = crypto.recv.read(&mut buf);
            if n == 0 {
                break;
            }
            self.tls
                .read_handshake(epoch, &buf[..n])
                .map_err(|e| e)?;
        }
        self.drive_tls(space_id)
    }

    fn drive_tls(&mut self, _space_id: SpaceId) -> Result<(), TransportError> {
        while let Some(event) = self.tls.poll_transcript() {
            match event {
                TranscriptEvent::Keys { epoch, .. } => {
                    if let Some(keys) = self.tls.take_keys(epoch) {
                        let space_id = epoch_to_space(epoch);
                        self.spaces.get_mut(&space_id).unwrap().keys = Some(keys);
                    }
                }
                TranscriptEvent::HandshakeComplete => {
                    if self.state == State::Opening {
                        self.set_state(State::Established);
                        self.events.push_back(Event::Connected);
                    }
                    if self.side.is_server() {
                        // Tells the client it's safe to discard its own Initial/Handshake state
                        // and stop accepting a server Retry (RFC 9000 section 19.20).
                        self.pending_mut(SpaceId::Data).handshake_done = true;
                        self.needs_tx = true;
                    }
                }
                TranscriptEvent::TransportParameters(encoded) => {
                    self.apply_peer_transport_parameters(encoded)?;
                }
                TranscriptEvent::Alert(alert) => {
                    return Err(TransportError::new(
                        TransportErrorCode::Crypto(alert),
                        None,
                        "TLS alert",
                    ));
                }
            }
        }
        for epoch in Epoch::ALL {
            let mut buf = Vec::new();
            if self.tls.write_handshake(epoch, &mut buf) > 0 {
                let space_id = epoch_to_space(epoch);
                let crypto = &mut self.crypto[space_id as usize];
                crypto.send.write(&buf);
                self.needs_tx = true;
            }
        }
        Ok(())
    }

    /// Decode the peer's transport parameters extension and apply its consequences: the stream
    /// ceilings and connection-level send window it grants us (spec section 6)
    fn apply_peer_transport_parameters(&mut self, mut encoded: Bytes) -> Result<(), TransportError> {
        let params = TransportParameters::read(&mut encoded)?;
        self.streams.set_max_remote_bi(params.initial_max_streams_bidi);
        self.streams.set_max_remote_uni(params.initial_max_streams_uni);
        self.streams.max_data = params.initial_max_data;
        self.tp_out = params;
        self.params_received = true;
        Ok(())
    }

    fn handle_stream(&mut self, s: frame::Stream) -> Result<(), TransportError> {
        let id = s.id;
        let recv_window = self.config.stream_receive_window;
        let send_window = self.tp_out.initial_max_stream_data_bidi_remote;
        let stream = self.streams.get_or_open_remote(id, recv_window, send_window)?;
        let Some(recv) = stream.recv.as_mut() else {
            return Ok(()); // closed/send-only from our perspective: silently dropped (spec 4.3)
        };
        let end = s.offset + s.data.len() as u64;
        if end > recv.max_data {
            return Err(TransportError::new(TransportErrorCode::FlowControl, Some(FrameType::Stream), "stream exceeds max_data"));
        }
        if end > self.streams.local_max_data {
            return Err(TransportError::new(TransportErrorCode::FlowControl, Some(FrameType::Stream), "connection exceeds max_data"));
        }
        let new_bytes = recv.ingest(s.offset, s.data, s.fin);
        self.streams.data_recvd += new_bytes;
        self.readable_streams.insert(id);

        if 2 * self.streams.data_recvd > self.streams.local_max_data {
            self.streams.local_max_data *= 2;
            self.pending_mut(SpaceId::Data).max_data = true;
        }
        Ok(())
    }

    fn pending_mut(&mut self, space_id: SpaceId) -> &mut Retransmits {
        &mut self.spaces.get_mut(&space_id).unwrap().pending
    }

    fn reset_idle_timeout(&mut self, now: Instant) {
        let local = self.config.idle_timeout.as_millis() as u64;
        let peer = self.tp_out.max_idle_timeout;
        let effective = match (local, peer) {
            (0, 0) => return,
            (0, p) => p,
            (l, 0) => l,
            (l, p) => l.min(p),
        };
        self.idle_timeout_at = Some(now + Duration::from_millis(effective));
    }

    // ---------------------------------------------------------------- TX pipeline (spec 4.2) --

    /// Attempt to assemble one outgoing datagram into `buf`, returning its length if there was
    /// anything to send
    pub fn poll_transmit(&mut self, now: Instant, max_datagram_size: usize, buf: &mut Vec<u8>) -> Option<usize> {
        if self.state.is_terminal() {
            return None;
        }

        let start_len = buf.len();
        let mut wrote_any = false;
        let mut wrote_initial = false;

        for space_id in SpaceId::ALL {
            if self.spaces[&space_id].dead || self.spaces[&space_id].keys.is_none() {
                continue;
            }
            if buf.len() - start_len >= max_datagram_size {
                break;
            }
            if self.compose_packet(now, space_id, max_datagram_size, buf) {
                wrote_any = true;
                wrote_initial |= space_id == SpaceId::Initial;
            }
        }

        if !wrote_any {
            self.needs_tx = false;
            return None;
        }

        // The client's first sent Initial is what opens the connection (spec section 4.1).
        if self.side.is_client() && self.state == State::Idle && wrote_initial {
            self.set_state(State::Opening);
        }

        // Client Initials that open the connection are padded to exactly 1200 bytes (spec
        // section 4.2); anything else is left datagram-sized as written.
        if self.side.is_client() && (self.state == State::Idle || self.state == State::Opening) {
            while buf.len() - start_len < crate::MIN_INITIAL_SIZE && buf.len() - start_len < max_datagram_size {
                buf.push(0);
            }
        }

        self.needs_tx = self.has_pending_work();
        Some(buf.len() - start_len)
    }

    fn has_pending_work(&self) -> bool {
        SpaceId::ALL
            .iter()
            .any(|id| !self.spaces[id].pending.is_empty() || self.spaces[id].ack_elicited)
            || self.streams.has_pending()
            || self.close_frame_to_send.is_some()
    }

    fn compose_packet(&mut self, now: Instant, space_id: SpaceId, max_size: usize, buf: &mut Vec<u8>) -> bool {
        if self.spaces[&space_id].keys.is_none() {
            return false;
        }
        let pn = self.spaces.get_mut(&space_id).unwrap().next_packet_number();
        let number_len = self.spaces[&space_id].packet_number_len(pn);

        let mut header_buf = BytesMut::new();
        let number_offset = match space_id {
            SpaceId::Initial => packet::encode_long(
                &mut header_buf,
                LongType::Initial,
                self.version,
                self.cids.remote.active(),
                self.cids.local.active(),
                self.retry_token.as_deref(),
                pn,
                number_len,
            ),
            SpaceId::Handshake => packet::encode_long(
                &mut header_buf,
                LongType::Handshake,
                self.version,
                self.cids.remote.active(),
                self.cids.local.active(),
                None,
                pn,
                number_len,
            ),
            SpaceId::Data => packet::encode_short(
                &mut header_buf,
                self.cids.remote.active(),
                pn,
                number_len,
                self.key_phase,
                self.spin_enabled && self.spin,
            ),
        };

        let mut payload = Vec::new();
        let mut retransmits = Retransmits::default();
        let mut stream_frames = Vec::new();
        let mut ack_eliciting = false;

        self.write_ack(space_id, &mut payload);
        if space_id == SpaceId::Data {
            if let Some(frame) = self.close_frame_to_send.take() {
                let is_close = matches!(frame, Frame::ConnectionClose(_));
                frame.encode(&mut payload);
                if is_close {
                    self.set_state(State::Closing);
                }
            }
        }
        let crypto_frame = self.write_crypto(space_id, &mut payload, &mut ack_eliciting);
        self.write_control(space_id, &mut payload, &mut retransmits, &mut ack_eliciting);
        if space_id == SpaceId::Data {
            self.write_stream_data(max_size.saturating_sub(header_buf.len() + payload.len() + 16), &mut payload, &mut stream_frames, &mut ack_eliciting);
        }

        if payload.is_empty() {
            // nothing to say in this space; undo the packet-number allocation's side effects
            return false;
        }

        if !ack_eliciting && self.needs_ping(space_id) {
            Frame::Ping.encode(&mut payload);
            ack_eliciting = true;
        }

        // Sample-window invariant: at least 4 bytes between the pn field's start and the end of
        // the payload (spec section 4.2).
        while payload.len() < number_len + 4 {
            Frame::Padding.encode(&mut payload);
        }

        let header_len = header_buf.len();
        let mut full = header_buf;
        full.extend_from_slice(&payload);

        if matches!(space_id, SpaceId::Initial | SpaceId::Handshake) {
            let remaining = (full.len() - header_len - number_len) as u64 + 16;
            packet::patch_long_len(&mut full, header_len - number_len - 4, remaining);
        }

        let (header_bytes, body) = full.split_at_mut(header_len);
        let mut sealed = body.to_vec();
        let keys = self.spaces[&space_id].keys.as_ref().expect("checked above");
        if packet::seal(&keys.packet.local, pn, header_bytes, &mut sealed).is_err() {
            return false;
        }
        let mut datagram = BytesMut::from(&header_bytes[..]);
        datagram.extend_from_slice(&sealed);

        let is_long = matches!(space_id, SpaceId::Initial | SpaceId::Handshake);
        let hp_key = &self.spaces[&space_id].keys.as_ref().unwrap().header.local;
        if packet::apply_header_protection(&mut datagram, header_len, number_len, is_long, hp_key).is_err() {
            return false;
        }

        let size = datagram.len();
        buf.extend_from_slice(&datagram);

        let space = self.spaces.get_mut(&space_id).unwrap();
        let sent = SentPacket {
            time_sent: now,
            size: size as u16,
            ack_eliciting,
            in_flight: ack_eliciting,
            stream_frames,
            crypto_frame,
            retransmits,
            rtx_of: None,
        };
        self.recovery.on_packet_sent(&sent);
        if ack_eliciting {
            space.time_of_last_sent_ack_eliciting_packet = Some(now);
        }
        if sent.crypto_frame.is_some() {
            space.time_of_last_sent_crypto_packet = Some(now);
        }
        space.sent_packets.insert(pn, sent);
        space.pkts_rxed_since_last_ack_tx = 0;
        true
    }

    fn needs_ping(&self, space_id: SpaceId) -> bool {
        // A PTO probe with nothing else queued still needs to elicit an ACK (spec section 4.2).
        self.recovery.pto_count > 0 && self.spaces[&space_id].has_unacked_ack_eliciting()
    }

    fn write_ack(&mut self, space_id: SpaceId, payload: &mut Vec<u8>) {
        let space = self.spaces.get_mut(&space_id).unwrap();
        if space.recv.is_empty() || !space.ack_elicited {
            return;
        }
        let largest = space.recv.max().unwrap();
        let ack = Ack {
            largest,
            // Coalescing delay isn't tracked separately from the ack_timeout alarm; reporting 0
            // just means the peer trusts our RTT sample fully, which is conservative, not wrong.
            delay: 0,
            ranges: space.recv.clone(),
            ecn: if space.ect0_count + space.ect1_count + space.ce_count > 0 {
                Some(EcnCounts {
                    ect0: space.ect0_count,
                    ect1: space.ect1_count,
                    ce: space.ce_count,
                })
            } else {
                None
            },
        };
        Frame::Ack(ack).encode(payload);
        space.ack_elicited = false;
    }

    fn write_crypto(&mut self, space_id: SpaceId, payload: &mut Vec<u8>, ack_eliciting: &mut bool) -> Option<(u64, Bytes)> {
        let crypto = &mut self.crypto[space_id as usize];
        if let Some((offset, data)) = crypto.send.pop(1024) {
            Frame::Crypto(frame::Crypto { offset, data: data.clone() }).encode(payload);
            *ack_eliciting = true;
            return Some((offset, data));
        }
        None
    }

    fn write_control(&mut self, space_id: SpaceId, payload: &mut Vec<u8>, sent: &mut Retransmits, ack_eliciting: &mut bool) {
        let pending = std::mem::take(&mut self.spaces.get_mut(&space_id).unwrap().pending);

        if pending.max_data {
            Frame::MaxData(VarInt::from_u64(self.streams.local_max_data).unwrap_or(VarInt::MAX)).encode(payload);
            sent.max_data = true;
            *ack_eliciting = true;
        }
        for id in &pending.max_stream_data {
            if let Some(max) = self.streams.get(*id).and_then(|s| s.recv.as_ref()).map(|r| r.max_data) {
                Frame::MaxStreamData {
                    id: *id,
                    max: VarInt::from_u64(max).unwrap_or(VarInt::MAX),
                }
                .encode(payload);
                sent.max_stream_data.insert(*id);
                *ack_eliciting = true;
            }
        }
        if pending.max_streams_bi {
            Frame::MaxStreams {
                bidi: true,
                count: VarInt::from_u64(self.streams.max_bi_local_announced()).unwrap_or(VarInt::MAX),
            }
            .encode(payload);
            sent.max_streams_bi = true;
            *ack_eliciting = true;
        }
        if pending.max_streams_uni {
            Frame::MaxStreams {
                bidi: false,
                count: VarInt::from_u64(self.streams.max_uni_local_announced()).unwrap_or(VarInt::MAX),
            }
            .encode(payload);
            sent.max_streams_uni = true;
            *ack_eliciting = true;
        }
        for seq in &pending.new_connection_id {
            // The actual (id, token) pair for a just-issued CID lives in `cids.local`; look it
            // up by sequence at send time so retransmits always reflect current state.
            if let Some((id, reset_token)) = self.cids.local.get(*seq) {
                Frame::NewConnectionId {
                    sequence: VarInt::from_u64(*seq).unwrap_or(VarInt::MAX),
                    retire_prior_to: VarInt::from_u32(0),
                    id,
                    reset_token,
                }
                .encode(payload);
                sent.new_connection_id.push(*seq);
                *ack_eliciting = true;
            }
        }
        for seq in pending.retire_connection_id {
            Frame::RetireConnectionId {
                sequence: VarInt::from_u64(seq).unwrap_or(VarInt::MAX),
            }
            .encode(payload);
            sent.retire_connection_id.push(seq);
            *ack_eliciting = true;
        }
        if let Some(challenge) = pending.path_challenge {
            Frame::PathChallenge(challenge).encode(payload);
            sent.path_challenge = Some(challenge);
            *ack_eliciting = true;
        }
        if let Some(response) = pending.path_response {
            Frame::PathResponse(response).encode(payload);
            *ack_eliciting = true;
        }
        if pending.handshake_done {
            Frame::HandshakeDone.encode(payload);
            sent.handshake_done = true;
            *ack_eliciting = true;
        }
        for (id, code) in pending.reset_stream {
            Frame::ResetStream {
                id,
                error_code: code,
                final_size: VarInt::from_u32(0),
            }
            .encode(payload);
            *ack_eliciting = true;
        }
    }

    fn write_stream_data(&mut self, budget: usize, payload: &mut Vec<u8>, out: &mut Vec<(StreamId, u64, Bytes)>, ack_eliciting: &mut bool) {
        if budget < 8 {
            return;
        }
        let mut remaining = budget;
        let ids: Vec<StreamId> = self.streams.iter_mut().map(|(id, _)| *id).collect();
        for id in ids {
            if remaining < 8 {
                break;
            }
            let Some(stream) = self.streams.get_mut(id) else { continue };
            let Some(send) = stream.send.as_mut() else { continue };
            if !send.is_pending() {
                continue;
            }
            let Some((offset, data)) = send.pop(remaining - 8) else { continue };
            let len = data.len() as u64;
            let fin = send.fin_sent && send.out_data == offset + len;
            out.push((id, offset, data.clone()));
            remaining = remaining.saturating_sub(data.len() + 16);
            Frame::Stream(frame::Stream { id, offset, fin, data }).encode(payload);
            *ack_eliciting = true;
        }
    }

    // ---------------------------------------------------------------- Timers (spec 4.7) --

    /// Earliest per-space PTO deadline among spaces with an outstanding ack-eliciting packet
    /// (spec section 4.4: "if none [is lost], it arms a PTO ... Crypto retransmission uses
    /// `last_sent_crypto_t + 2·max(srtt, kInitialRtt)·2^crypto_cnt`").
    fn pto_deadline(&self) -> Option<(SpaceId, Instant)> {
        SpaceId::ALL
            .into_iter()
            .filter_map(|id| {
                let space = &self.spaces[&id];
                if space.dead || space.keys.is_none() || !space.has_unacked_ack_eliciting() {
                    return None;
                }
                if id == SpaceId::Data {
                    let base = space.time_of_last_sent_ack_eliciting_packet?;
                    Some((id, base + self.recovery.pto_duration()))
                } else {
                    let base = space
                        .time_of_last_sent_crypto_packet
                        .or(space.time_of_last_sent_ack_eliciting_packet)?;
                    Some((id, base + self.recovery.crypto_retransmit_duration(space.crypto_count)))
                }
            })
            .min_by_key(|(_, t)| *t)
    }

    /// Next instant the run loop must wake this connection for, across every alarm kind
    pub fn poll_timeout(&self) -> Option<Instant> {
        let loss_time = SpaceId::ALL.into_iter().filter_map(|id| self.spaces[&id].loss_time).min();
        // The loss-detection alarm supersedes the PTO alarm while a loss is already pending
        // (spec section 4.4: "fires at min_loss_t across spaces; if none, it arms a PTO").
        let loss_or_pto = loss_time.or_else(|| self.pto_deadline().map(|(_, t)| t));
        [
            self.idle_timeout_at,
            self.closing_timeout_at,
            self.key_flip_at,
            loss_or_pto,
            self.ack_timeout[0],
            self.ack_timeout[1],
            self.ack_timeout[2],
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Drive all expired timers at `now` (spec section 4.7, step 2)
    pub fn handle_timeout(&mut self, now: Instant) {
        if let Some(t) = self.idle_timeout_at {
            if now >= t {
                self.close_reason = Some(CloseReason::Transport(TransportError::new(
                    TransportErrorCode::NoError,
                    None,
                    "idle timeout",
                )));
                self.events.push_back(Event::ConnectionLost);
                self.set_state(State::Closed);
                return;
            }
        }
        if let Some(t) = self.closing_timeout_at {
            if now >= t && self.state.is_closed_or_draining() {
                self.set_state(State::Closed);
                self.events.push_back(Event::ConnectionLost);
                return;
            }
        }
        for (i, at) in self.ack_timeout.into_iter().enumerate() {
            if matches!(at, Some(t) if now >= t) {
                self.ack_timeout[i] = None;
                self.needs_tx = true;
            }
        }
        if matches!(self.key_flip_at, Some(t) if now >= t) {
            self.key_flip_at = None;
            self.initiate_key_update();
        }
        let mut declared_loss = false;
        for space_id in SpaceId::ALL {
            if matches!(self.spaces[&space_id].loss_time, Some(t) if now >= t) {
                declared_loss = true;
                let lost = self.recovery.detect_lost_packets(self.spaces.get_mut(&space_id).unwrap(), now);
                for (_, packet) in lost {
                    self.requeue_lost(space_id, packet);
                }
            }
        }
        if !declared_loss {
            if let Some((space_id, deadline)) = self.pto_deadline() {
                if now >= deadline {
                    if space_id != SpaceId::Data {
                        self.spaces.get_mut(&space_id).unwrap().crypto_count += 1;
                    }
                    self.spaces.get_mut(&space_id).unwrap().loss_probes += 1;
                    self.on_pto();
                }
            }
        }
    }

    /// A PTO fired with no new losses detected: arm a probe (spec section 4.4)
    pub fn on_pto(&mut self) {
        self.recovery.pto_count += 1;
        self.recovery.maybe_disable_ecn();
        self.needs_tx = true;
    }

    // ---------------------------------------------------------------- Errors (spec 7) --

    /// `err_close`: latch the first fatal error, arm CONNECTION_CLOSE for immediate
    /// transmission, and move to `qlse` then `clsg` (spec section 7)
    pub fn err_close(&mut self, now: Instant, err: TransportError) {
        if self.close_reason.is_some() {
            return; // first one wins
        }
        warn!(code = %err.code, reason = %err.reason, "connection fatal error");
        let frame_type = err.frame.map(|f| VarInt::from_u64(frame_type_code(f)).unwrap_or(VarInt::from_u32(0)));
        self.close_frame_to_send = Some(Frame::ConnectionClose(frame::ConnectionClose {
            is_app: false,
            error_code: err.code.code(),
            frame_type,
            reason: Bytes::from(err.reason.clone()),
        }));
        self.close_reason = Some(CloseReason::Transport(err));
        if !self.state.is_closed_or_draining() {
            self.set_state(State::QueueClose);
        }
        self.closing_timeout_at = Some(now + self.closing_timer_duration());
        self.needs_tx = true;
    }

    /// Application-initiated close
    pub fn close(&mut self, now: Instant, code: VarInt, reason: Bytes) {
        if self.close_reason.is_some() {
            return;
        }
        self.close_frame_to_send = Some(Frame::ConnectionClose(frame::ConnectionClose {
            is_app: true,
            error_code: code,
            frame_type: None,
            reason: reason.clone(),
        }));
        self.close_reason = Some(CloseReason::Application { code, reason });
        if !self.state.is_closed_or_draining() {
            self.set_state(State::QueueClose);
        }
        self.closing_timeout_at = Some(now + self.closing_timer_duration());
        self.needs_tx = true;
    }

    fn closing_timer_duration(&self) -> Duration {
        // 3*srtt + 4*rttvar (spec section 5); the default estimator already seeds both from
        // `INITIAL_RTT` before any sample exists.
        self.recovery.rtt.smoothed_rtt * 3 + self.recovery.rtt.var_rtt * 4
    }

    pub fn close_reason(&self) -> Option<ConnectionError> {
        match self.close_reason.clone()? {
            CloseReason::Transport(e) => Some(ConnectionError::TransportError(e)),
            CloseReason::Application { code, reason } => Some(ConnectionError::ApplicationClosed { code, reason }),
        }
    }

    // ---------------------------------------------------------------- Application API --

    pub fn poll(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    pub fn open(&mut self, dir: Dir) -> Option<StreamId> {
        self.streams.open(
            dir,
            self.tp_out.initial_max_stream_data_bidi_remote,
            self.config.stream_receive_window,
        )
    }

    pub fn write(&mut self, id: StreamId, data: &[u8]) -> usize {
        let n = self
            .streams
            .get_mut(id)
            .and_then(|s| s.send.as_mut())
            .map(|s| s.write(data))
            .unwrap_or(0);
        if n > 0 {
            self.needs_tx = true;
        }
        n
    }

    pub fn read(&mut self, id: StreamId, buf: &mut [u8]) -> usize {
        self.streams.get_mut(id).and_then(|s| s.recv.as_mut()).map(|r| r.read(buf)).unwrap_or(0)
    }

    pub fn finish(&mut self, id: StreamId) {
        if let Some(send) = self.streams.get_mut(id).and_then(|s| s.send.as_mut()) {
            send.finish();
            self.needs_tx = true;
        }
    }
}

fn space_to_epoch(space: SpaceId) -> Epoch {
    match space {
        SpaceId::Initial => Epoch::Initial,
        SpaceId::Handshake => Epoch::Handshake,
        SpaceId::Data => Epoch::Data,
    }
}

fn epoch_to_space(epoch: Epoch) -> SpaceId {
    match epoch {
        Epoch::Initial => SpaceId::Initial,
        Epoch::Handshake => SpaceId::Handshake,
        Epoch::Data | Epoch::ZeroRtt => SpaceId::Data,
    }
}

fn frame_type_code(ty: FrameType) -> u64 {
    // Mirrors `FrameType::code` in `frame.rs`; kept here too since that method is private to the
    // frame module and CONNECTION_CLOSE only needs the numeric wire value.
    match ty {
        FrameType::Padding => 0x00,
        FrameType::Ping => 0x01,
        FrameType::Ack => 0x02,
        FrameType::ResetStream => 0x04,
        FrameType::StopSending => 0x05,
        FrameType::Crypto => 0x06,
        FrameType::NewToken => 0x07,
        FrameType::Stream => 0x08,
        FrameType::MaxData => 0x10,
        FrameType::MaxStreamData => 0x11,
        FrameType::MaxStreams { bidi: true } => 0x12,
        FrameType::MaxStreams { bidi: false } => 0x13,
        FrameType::DataBlocked => 0x14,
        FrameType::StreamDataBlocked => 0x15,
        FrameType::StreamsBlocked { bidi: true } => 0x16,
        FrameType::StreamsBlocked { bidi: false } => 0x17,
        FrameType::NewConnectionId => 0x18,
        FrameType::RetireConnectionId => 0x19,
        FrameType::PathChallenge => 0x1a,
        FrameType::PathResponse => 0x1b,
        FrameType::ConnectionClose { is_app: false } => 0x1c,
        FrameType::ConnectionClose { is_app: true } => 0x1d,
        FrameType::HandshakeDone => 0x1e,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retransmits_merge_is_union() {
        let mut a = Retransmits::default();
        a.max_data = true;
        let mut b = Retransmits::default();
        b.ping = true;
        a.merge(b);
        assert!(a.max_data);
        assert!(a.ping);
    }
}
