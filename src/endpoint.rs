//! Endpoint-wide connection routing and the run loop (spec section 4.7, section 9).
//!
//! An [`Endpoint`] owns every [`Connection`] on one UDP socket and is the single point an
//! inbound datagram is routed from: by destination connection ID, by source IP/port (for
//! short-header packets, which don't carry a length-prefixed CID table lookup is cheap for),
//! or by the trailing 16 bytes matching a previously issued Stateless Reset Token. Connection
//! handles are slab indices paired with a generation counter (spec section 9: "connection
//! handles are indices or generation-counted handles, never raw aliases") so a handle from a
//! torn-down connection can't silently resolve to whatever new connection reused its slot.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use fnv::FnvHashMap;
use rand::RngCore;
use slab::Slab;
use tracing::{debug, trace, warn};

use crate::cid::{ConnectionId, ConnectionIdGenerator, RandomConnectionIdGenerator, ResetToken};
use crate::congestion::{ControllerFactory, NewRenoConfig};
use crate::connection::{self, Connection, State};
use crate::crypto::{HmacKey, Session};
use crate::error::Result;
use crate::packet::{self, Header};
use crate::token::RetryToken;
use crate::Side;

/// Minimum length a short-header datagram must have for its trailing 16 bytes to plausibly be
/// a Stateless Reset Token rather than part of a legitimately short packet (spec section 4.5).
pub const MIN_SRT_PKT_LEN: usize = 21;

/// A stable reference to a [`Connection`] owned by an [`Endpoint`].
///
/// Slab keys are reused once a connection is torn down; `generation` guards against a stale
/// handle resolving to whatever connection reused that slot.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct ConnectionHandle {
    index: usize,
    generation: u64,
}

struct Slot {
    generation: u64,
    conn: Connection,
    /// Set once this connection has been queued for `accept()`, so a later datagram that keeps
    /// the connection in `Established` doesn't re-queue it a second time.
    offered: bool,
}

/// The TLS adapter factory (spec section 6): produces the opaque [`Session`] each new
/// connection drives its handshake through. The handshake implementation itself is an external
/// collaborator; this crate only defines the seam.
pub trait SessionFactory: Send {
    /// Build the client side of a handshake. `dcid` is the random destination CID the client
    /// is about to send its first Initial to (needed so the session can be asked to derive, or
    /// be told about, the locally-computed Initial secrets).
    fn client_session(&self, dcid: &ConnectionId, server_name: &str, alpn: &[Vec<u8>]) -> Box<dyn Session>;

    /// Build the server side once an Initial for a new connection has been accepted. `odcid`
    /// is the client's chosen destination CID from that first Initial.
    fn server_session(&self, odcid: &ConnectionId, alpn: &[Vec<u8>]) -> Box<dyn Session>;
}

/// Endpoint-wide configuration (spec section 5's resource policy plus the CID/version/retry
/// knobs section 9's open questions call out as config rather than compile-time behavior).
pub struct EndpointConfig {
    /// Length of connection IDs this endpoint mints for itself; constrains how many
    /// simultaneous connections a single receive-side CID table lookup can distinguish.
    pub local_cid_len: usize,
    /// Buffer-pool sizing knob (spec section 5); informational here since buffers are plain
    /// heap allocations rather than a pre-allocated pool, but preserved for parity with the
    /// resource-policy budget callers may want to reason about.
    pub num_bufs: usize,
    pub supported_versions: Vec<u32>,
    /// ALPN protocols this endpoint is willing to negotiate.
    pub alpn_protocols: Vec<Vec<u8>>,
    /// Secret used to derive Stateless Reset Tokens for local CIDs and to validate Retry/
    /// NEW_TOKEN tokens this process minted (spec section 4.5, section 8 scenario 3).
    pub reset_key: HmacKey,
    /// Interop hack (spec section 9 Open Questions): unconditionally Retry everything,
    /// regardless of local port, when set by the caller for a server bound to port 4434.
    pub force_retry: bool,
    pub connection: connection::Config,
}

impl EndpointConfig {
    pub fn new(reset_key: HmacKey) -> Self {
        Self {
            local_cid_len: 8,
            num_bufs: 10_000,
            supported_versions: vec![packet::VERSION],
            alpn_protocols: Vec::new(),
            reset_key,
            force_retry: false,
            connection: connection::Config::default(),
        }
    }
}

/// An application-facing event surfaced by [`Endpoint::poll`], distinct from the per-connection
/// [`crate::connection::Event`] stream a caller drains via `endpoint.get_mut(handle).poll()`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum EndpointEvent {
    /// A new connection finished its handshake far enough to hand to the application (spec
    /// section 4.7: the `accept` API call).
    Incoming(ConnectionHandle),
    /// `handle`'s connection reached `clsd` and has been removed from every lookup table; its
    /// slot may be reused by a future `ConnectionHandle` with a different generation.
    ConnectionDrained(ConnectionHandle),
}

/// Owns every [`Connection`] on one (conceptual) UDP socket: the three lookup tables spec
/// section 9 names (`conns_by_id`, `conns_by_ipnp`, `conns_by_srt`), the accept queue, and the
/// endpoint-level decisions that precede a `Connection` existing at all (version negotiation,
/// Retry, stateless reset).
///
/// Performs no I/O: datagrams arrive via [`Endpoint::handle_datagram`] and outgoing ones are
/// collected via [`Endpoint::poll_transmit`], so callers can drive this from any socket type —
/// see [`crate::Endpoint::drive`] (behind `cfg(test)`/example use) for a `tokio::net::UdpSocket`
/// run loop in the shape spec section 4.7 describes.
pub struct Endpoint<F> {
    config: EndpointConfig,
    cid_generator: Box<dyn ConnectionIdGenerator>,
    controller_factory: Box<dyn ControllerFactory>,
    sessions: F,

    connections: Slab<Slot>,
    next_generation: u64,

    conns_by_id: FnvHashMap<ConnectionId, ConnectionHandle>,
    conns_by_ipnp: FnvHashMap<SocketAddr, ConnectionHandle>,
    conns_by_srt: FnvHashMap<ResetToken, ConnectionHandle>,

    incoming: VecDeque<ConnectionHandle>,
    events: VecDeque<EndpointEvent>,
    /// Datagrams the endpoint itself originates outside of any connection (Version
    /// Negotiation, Retry, stateless reset) — queued here rather than synthesized by a
    /// `Connection`, since none exists yet.
    stray_tx: VecDeque<(SocketAddr, Vec<u8>)>,
}

impl<F: SessionFactory> Endpoint<F> {
    pub fn new(config: EndpointConfig, sessions: F) -> Self {
        let controller_factory: Box<dyn ControllerFactory> = Box::new(NewRenoConfig::default());
        let cid_generator: Box<dyn ConnectionIdGenerator> = Box::new(RandomConnectionIdGenerator::new(config.local_cid_len.max(crate::cid::MIN_CID_SIZE)));
        Self {
            config,
            cid_generator,
            controller_factory,
            sessions,
            connections: Slab::new(),
            next_generation: 0,
            conns_by_id: FnvHashMap::default(),
            conns_by_ipnp: FnvHashMap::default(),
            conns_by_srt: FnvHashMap::default(),
            incoming: VecDeque::new(),
            events: VecDeque::new(),
            stray_tx: VecDeque::new(),
        }
    }

    /// Use a caller-supplied connection-ID generator, e.g. one embedding routing information
    /// for a stateless load balancer.
    pub fn with_cid_generator(mut self, generator: Box<dyn ConnectionIdGenerator>) -> Self {
        self.cid_generator = generator;
        self
    }

    fn reset_token_for(&self, cid: &ConnectionId) -> ResetToken {
        let tag = self.config.reset_key.sign(cid);
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&tag.as_ref()[..16]);
        ResetToken::new(bytes)
    }

    fn insert(&mut self, conn: Connection) -> ConnectionHandle {
        let generation = self.next_generation;
        self.next_generation += 1;
        let index = self.connections.insert(Slot { generation, conn, offered: false });
        ConnectionHandle { index, generation }
    }

    fn slot(&self, handle: ConnectionHandle) -> Option<&Slot> {
        self.connections.get(handle.index).filter(|s| s.generation == handle.generation)
    }

    fn slot_mut(&mut self, handle: ConnectionHandle) -> Option<&mut Slot> {
        self.connections.get_mut(handle.index).filter(|s| s.generation == handle.generation)
    }

    pub fn get(&self, handle: ConnectionHandle) -> Option<&Connection> {
        self.slot(handle).map(|s| &s.conn)
    }

    pub fn get_mut(&mut self, handle: ConnectionHandle) -> Option<&mut Connection> {
        self.slot_mut(handle).map(|s| &mut s.conn)
    }

    pub fn poll(&mut self) -> Option<EndpointEvent> {
        self.events.pop_front()
    }

    /// A pending endpoint-originated datagram (Version Negotiation, Retry, stateless reset),
    /// distinct from a connection's own `poll_transmit`.
    pub fn poll_stray_transmit(&mut self) -> Option<(SocketAddr, Vec<u8>)> {
        self.stray_tx.pop_front()
    }

    // ---------------------------------------------------------------- Client API --

    /// Begin a new client connection (spec section 4.1: `idle`, transitioning to `opng` once
    /// the first Initial is actually sent via `poll_transmit`).
    pub fn connect(&mut self, now: Instant, remote: SocketAddr, server_name: &str, alpn: &[Vec<u8>]) -> Result<ConnectionHandle> {
        let local_cid = self.cid_generator.generate_cid();
        let local_token = self.reset_token_for(&local_cid);
        // The client's first destination CID is an unpredictable value of its own choosing
        // (RFC 9000 section 7.2); its length must be at least 8 bytes.
        let remote_cid = ConnectionId::random(&mut rand::thread_rng(), 8);
        let remote_token = ResetToken::new([0; 16]); // unknown until the peer issues one

        let tls = self.sessions.client_session(&remote_cid, server_name, alpn);
        let conn = Connection::new(
            Side::Client,
            self.config.connection.clone(),
            self.controller_factory.as_ref(),
            tls,
            local_cid,
            local_token,
            remote_cid,
            remote_token,
            remote,
            now,
        );

        let handle = self.insert(conn);
        self.conns_by_id.insert(local_cid, handle);
        self.conns_by_ipnp.insert(remote, handle);
        self.conns_by_srt.insert(local_token, handle);
        Ok(handle)
    }

    /// Pop the next fully-accepted incoming connection (spec section 4.7: the `accept` API
    /// call); `None` if nothing is waiting.
    pub fn accept(&mut self) -> Option<ConnectionHandle> {
        self.incoming.pop_front()
    }

    // ---------------------------------------------------------------- RX pipeline --

    /// Route one just-arrived UDP datagram: to an existing connection by CID/address, to
    /// stateless-reset detection, or — for an unrecognized Initial — to the pre-connection
    /// version-negotiation/Retry/new-connection path (spec section 9).
    pub fn handle_datagram(&mut self, now: Instant, remote: SocketAddr, data: BytesMut) {
        if data.len() >= MIN_SRT_PKT_LEN && data[0] & 0x80 == 0 && self.handle_possible_stateless_reset(now, &data) {
            return;
        }

        let header = match packet::decode_hdr_beginning(self.config.local_cid_len, &data) {
            Ok(h) => h,
            Err(e) => {
                trace!(error = %e, "dropping undecodable datagram");
                return;
            }
        };

        if let Header::Retry { token, integrity_tag, .. } = &header {
            self.handle_retry(&header, token.clone(), *integrity_tag, &data, remote);
            return;
        }

        if let Some(&handle) = self.conns_by_id.get(header.dst_cid()) {
            self.dispatch(handle, now, remote, data);
            return;
        }

        match header {
            Header::Initial { version, dst_cid, src_cid, token, .. } => {
                if version != packet::VERSION {
                    self.send_version_negotiation(remote, &src_cid, &dst_cid);
                    return;
                }
                self.accept_initial(now, remote, dst_cid, src_cid, token, data);
            }
            Header::Short { dst_cid, .. } if data.len() >= MIN_SRT_PKT_LEN => {
                // No connection owns this CID any more; if we ever issued it, the peer is
                // owed a stateless reset so it stops retransmitting into the void.
                self.send_stateless_reset(remote, &dst_cid);
            }
            _ => trace!("no connection for this datagram, dropping"),
        }
    }

    fn dispatch(&mut self, handle: ConnectionHandle, now: Instant, remote: SocketAddr, data: BytesMut) {
        let Some(slot) = self.slot_mut(handle) else { return };
        slot.conn.handle_datagram(now, remote, data);
        // Read everything needed out of the connection before touching any other field of
        // `self`: `slot` borrows `self.connections` through `&mut self`, so it must be dropped
        // before `self.incoming`/`self.conns_by_ipnp`/`self.remove` can be reached again.
        let newly_offered = slot.conn.state() == State::Established && !slot.offered;
        if newly_offered {
            slot.offered = true;
        }
        let still_migrating = slot.conn.cids.migrating_peer.is_some();
        let peer = slot.conn.peer;
        let closed = slot.conn.is_closed();
        let needs_cids = !closed && slot.conn.cids.local_live_count() < slot.conn.tp_in.active_connection_id_limit;

        if newly_offered {
            self.incoming.push_back(handle);
            self.events.push_back(EndpointEvent::Incoming(handle));
        }
        if !still_migrating {
            // Keep the ip/port index current so a later datagram from the same address (e.g.
            // after `confirm_migration` completes) still resolves by address, not just CID.
            self.conns_by_ipnp.insert(peer, handle);
        }
        if needs_cids {
            // Top up the peer's spare-CID pool (spec section 4.5) so it has something to
            // switch to if it migrates; each one must also be indexed so future datagrams
            // addressed to it route back to this connection.
            self.issue_spare_cids(handle);
        }
        if closed {
            self.remove(handle);
        }
    }

    /// Mint fresh local CIDs until `handle`'s connection has as many live ones as its peer's
    /// `active_connection_id_limit` allows, indexing each for routing as it's issued.
    fn issue_spare_cids(&mut self, handle: ConnectionHandle) {
        loop {
            let needs_more = match self.slot(handle) {
                Some(slot) => slot.conn.cids.local_live_count() < slot.conn.tp_in.active_connection_id_limit,
                None => return,
            };
            if !needs_more {
                return;
            }
            let id = self.cid_generator.generate_cid();
            let token = self.reset_token_for(&id);
            match self.slot_mut(handle) {
                Some(slot) => slot.conn.issue_new_cid(id, token),
                None => return,
            }
            self.conns_by_id.insert(id, handle);
            self.conns_by_srt.insert(token, handle);
        }
    }

    fn handle_possible_stateless_reset(&mut self, now: Instant, data: &[u8]) -> bool {
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&data[data.len() - 16..]);
        let token = ResetToken::new(bytes);
        let Some(&handle) = self.conns_by_srt.get(&token) else { return false };
        let Some(slot) = self.slot_mut(handle) else { return false };
        debug!(?handle, "stateless reset token matched, draining connection");
        slot.conn.close(now, crate::VarInt::from_u32(0), Bytes::new());
        true
    }

    fn send_version_negotiation(&mut self, remote: SocketAddr, client_scid: &ConnectionId, client_dcid: &ConnectionId) {
        let mut buf = Vec::new();
        buf.push(0x80 | (rand::thread_rng().next_u32() as u8 & 0x7f));
        buf.extend_from_slice(&0u32.to_be_bytes());
        client_scid.encode_long(&mut buf);
        client_dcid.encode_long(&mut buf);
        for v in &self.config.supported_versions {
            buf.extend_from_slice(&v.to_be_bytes());
        }
        trace!(?remote, "sending version negotiation");
        self.stray_tx.push_back((remote, buf));
    }

    fn accept_initial(&mut self, now: Instant, remote: SocketAddr, odcid: ConnectionId, client_scid: ConnectionId, token: Bytes, data: BytesMut) {
        if token.is_empty() {
            if self.config.force_retry {
                self.send_retry(remote, &odcid, &client_scid);
                return;
            }
        } else {
            // A non-empty token on an Initial is either a Retry token (committing to the scid
            // we handed the client) or a cross-connection NEW_TOKEN; only the former is
            // checked here since this crate doesn't yet resume 0-RTT across connections.
            match RetryToken::validate(&self.config.reset_key, remote, token) {
                Some(committed_scid) if committed_scid == odcid => {}
                _ => {
                    debug!(?remote, "rejecting Initial with invalid address-validation token");
                    return;
                }
            }
        }

        let local_cid = self.cid_generator.generate_cid();
        let local_token = self.reset_token_for(&local_cid);
        let tls = self.sessions.server_session(&odcid, &self.config.alpn_protocols);
        let conn = Connection::new(
            Side::Server,
            self.config.connection.clone(),
            self.controller_factory.as_ref(),
            tls,
            local_cid,
            local_token,
            client_scid,
            ResetToken::new([0; 16]),
            remote,
            now,
        );

        let handle = self.insert(conn);
        self.conns_by_id.insert(local_cid, handle);
        self.conns_by_id.insert(odcid, handle); // the client may still address its first Initial's dcid briefly
        self.conns_by_ipnp.insert(remote, handle);
        self.conns_by_srt.insert(local_token, handle);
        // Hand the Initial that triggered this connection's creation to it, same as any other
        // datagram addressed to an already-known connection.
        self.dispatch(handle, now, remote, data);
    }

    /// Send a Stateless Reset for a CID we no longer have a connection for (spec section 4.5):
    /// since the token is `HMAC(reset_key, cid)`, we can reconstruct the one we would have
    /// handed out for `dcid` without keeping any state for the connection that owned it.
    fn send_stateless_reset(&mut self, remote: SocketAddr, dcid: &ConnectionId) {
        let token = self.reset_token_for(dcid);
        let mut buf = vec![0u8; MIN_SRT_PKT_LEN];
        rand::thread_rng().fill_bytes(&mut buf[..MIN_SRT_PKT_LEN - ResetToken::LEN]);
        buf[0] = 0x40 | (buf[0] & 0x1f);
        buf[MIN_SRT_PKT_LEN - ResetToken::LEN..].copy_from_slice(token.as_ref());
        trace!(?remote, "sending stateless reset");
        self.stray_tx.push_back((remote, buf));
    }

    fn send_retry(&mut self, remote: SocketAddr, odcid: &ConnectionId, client_scid: &ConnectionId) {
        let server_scid = self.cid_generator.generate_cid();
        let retry_token = RetryToken::generate(&self.config.reset_key, remote, &server_scid);
        let datagram = packet::encode_retry(odcid, packet::VERSION, client_scid, &server_scid, &retry_token);
        trace!(?remote, "sending retry");
        self.stray_tx.push_back((remote, datagram));
    }

    /// A Retry packet arrived; find the client connection it's addressed to (by the CID it
    /// used on its first Initial) and, if the integrity tag checks out against that
    /// connection's own odcid, apply it.
    fn handle_retry(&mut self, header: &Header, token: Bytes, integrity_tag: [u8; 16], raw: &[u8], remote: SocketAddr) {
        let Header::Retry { dst_cid, src_cid, .. } = header else { return };
        let Some(&handle) = self.conns_by_id.get(dst_cid) else {
            trace!("retry for unknown connection, dropping");
            return;
        };
        let Some(slot) = self.slot_mut(handle) else { return };
        if slot.conn.side.is_server() || slot.conn.peer != remote {
            return;
        }
        // The integrity tag is computed over the destination CID from the client's own first
        // Initial (RFC 9001 section 5.8), which this connection still remembers as its active
        // remote CID as long as no Retry has been applied yet.
        let odcid = *slot.conn.cids.remote.active();
        let header_and_token = &raw[..raw.len() - 16];
        if !packet::verify_retry_integrity_tag(&odcid, header_and_token, &integrity_tag) {
            warn!("dropping Retry with bad integrity tag");
            return;
        }
        if slot.conn.handle_retry(*src_cid, token) {
            self.conns_by_id.insert(*src_cid, handle);
        }
    }

    // ---------------------------------------------------------------- TX pipeline --

    /// Assemble the next outgoing datagram for `handle`, if it has anything to send.
    pub fn poll_transmit(&mut self, handle: ConnectionHandle, now: Instant, max_datagram_size: usize, buf: &mut Vec<u8>) -> Option<(SocketAddr, usize)> {
        let slot = self.slot_mut(handle)?;
        let peer = slot.conn.peer;
        let n = slot.conn.poll_transmit(now, max_datagram_size, buf)?;
        Some((peer, n))
    }

    /// Every connection with a datagram ready to send right now (spec section 4.7 step 5).
    pub fn connections_needing_tx(&self) -> Vec<ConnectionHandle> {
        self.connections
            .iter()
            .filter(|(_, slot)| slot.conn.needs_tx)
            .map(|(index, slot)| ConnectionHandle { index, generation: slot.generation })
            .collect()
    }

    // ---------------------------------------------------------------- Timers --

    /// The earliest instant any owned connection needs `handle_timeout` called (spec section
    /// 4.7 step 2's timer wheel, collapsed to "what's the next deadline").
    pub fn poll_timeout(&self) -> Option<Instant> {
        self.connections.iter().filter_map(|(_, slot)| slot.conn.poll_timeout()).min()
    }

    /// Fire every expired timer across every connection, tearing down any that reached `clsd`.
    pub fn handle_timeout(&mut self, now: Instant) {
        let expired: Vec<ConnectionHandle> = self
            .connections
            .iter()
            .filter(|(_, slot)| matches!(slot.conn.poll_timeout(), Some(t) if t <= now))
            .map(|(index, slot)| ConnectionHandle { index, generation: slot.generation })
            .collect();
        for handle in expired {
            if let Some(slot) = self.slot_mut(handle) {
                slot.conn.handle_timeout(now);
                if slot.conn.is_closed() {
                    self.remove(handle);
                }
            }
        }
    }

    fn remove(&mut self, handle: ConnectionHandle) {
        if self.slot(handle).is_none() {
            return;
        }
        self.conns_by_id.retain(|_, h| *h != handle);
        self.conns_by_ipnp.retain(|_, h| *h != handle);
        self.conns_by_srt.retain(|_, h| *h != handle);
        self.connections.remove(handle.index);
        self.events.push_back(EndpointEvent::ConnectionDrained(handle));
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::test_support::MockSession;

    struct MockSessions;
    impl SessionFactory for MockSessions {
        fn client_session(&self, dcid: &ConnectionId, _server_name: &str, alpn: &[Vec<u8>]) -> Box<dyn Session> {
            Box::new(MockSession::client(*dcid, alpn.first().cloned().unwrap_or_default()))
        }
        fn server_session(&self, odcid: &ConnectionId, alpn: &[Vec<u8>]) -> Box<dyn Session> {
            Box::new(MockSession::server(*odcid, alpn.first().cloned().unwrap_or_default()))
        }
    }

    fn endpoint() -> Endpoint<MockSessions> {
        Endpoint::new(EndpointConfig::new(HmacKey::new(b"test endpoint secret")), MockSessions)
    }

    /// End-to-end scenario 1 (spec section 8): client Initial -> server Initial+Handshake ->
    /// client Handshake+ACK -> server short-header 1-RTT, both sides reach `estb`.
    #[test]
    fn handshake_no_data_reaches_established_both_sides() {
        let mut client = endpoint();
        let mut server = endpoint();
        let now = Instant::now();
        let client_addr: SocketAddr = "127.0.0.1:10001".parse().unwrap();
        let server_addr: SocketAddr = "127.0.0.1:10002".parse().unwrap();

        let ch = client.connect(now, server_addr, "example.test", &[b"hq-xx".to_vec()]).unwrap();

        let mut sh = None;
        for _ in 0..10 {
            let mut buf = Vec::new();
            if let Some((_, n)) = client.poll_transmit(ch, now, 1452, &mut buf) {
                server.handle_datagram(now, client_addr, BytesMut::from(&buf[..n]));
            }
            if sh.is_none() {
                if let Some(h) = server.accept() {
                    sh = Some(h);
                }
            }
            if let Some(sh) = sh {
                let mut buf = Vec::new();
                if let Some((_, n)) = server.poll_transmit(sh, now, 1452, &mut buf) {
                    client.handle_datagram(now, server_addr, BytesMut::from(&buf[..n]));
                }
            }
            let done = client.get(ch).map_or(false, |c| c.is_established())
                && sh.and_then(|h| server.get(h)).map_or(false, |c| c.is_established());
            if done {
                break;
            }
        }

        assert!(client.get(ch).unwrap().is_established());
        let sh = sh.expect("server accepted a connection");
        assert!(server.get(sh).unwrap().is_established());
    }

    /// Spec section 6: the peer's transport parameters must actually arrive and be applied
    /// before a locally-initiated stream can open (the ceiling starts at zero until then), and
    /// stream bytes must survive the round trip once they do.
    #[test]
    fn stream_data_flows_after_transport_parameters_negotiate() {
        use crate::connection::streams::Dir;

        let mut client = endpoint();
        let mut server = endpoint();
        let now = Instant::now();
        let client_addr: SocketAddr = "127.0.0.1:10011".parse().unwrap();
        let server_addr: SocketAddr = "127.0.0.1:10012".parse().unwrap();

        let ch = client.connect(now, server_addr, "example.test", &[b"hq-xx".to_vec()]).unwrap();

        let mut sh = None;
        let mut stream_id = None;
        for _ in 0..20 {
            let mut buf = Vec::new();
            if let Some((_, n)) = client.poll_transmit(ch, now, 1452, &mut buf) {
                server.handle_datagram(now, client_addr, BytesMut::from(&buf[..n]));
            }
            if sh.is_none() {
                if let Some(h) = server.accept() {
                    sh = Some(h);
                }
            }
            if let Some(sh) = sh {
                let mut buf = Vec::new();
                if let Some((_, n)) = server.poll_transmit(sh, now, 1452, &mut buf) {
                    client.handle_datagram(now, server_addr, BytesMut::from(&buf[..n]));
                }
            }

            if stream_id.is_none() {
                if let Some(c) = client.get_mut(ch) {
                    if c.is_established() && c.params_received() {
                        let id = c.open(Dir::Bi).expect("peer's transport parameters grant bidi streams");
                        c.write(id, b"hello");
                        c.finish(id);
                        stream_id = Some(id);
                    }
                }
            }
        }

        let sh = sh.expect("server accepted a connection");
        let id = stream_id.expect("client opened a stream once parameters arrived");
        let server_conn = server.get_mut(sh).unwrap();
        let mut buf = [0u8; 16];
        let n = server_conn.read(id, &mut buf);
        assert_eq!(&buf[..n], b"hello");
    }

    /// RFC 9001 section 6: once established, either side can flip the key-phase bit to rotate
    /// packet-protection keys, and the peer must pick this up mid-stream without a handshake.
    #[test]
    fn key_update_round_trips_after_client_initiates() {
        use crate::connection::streams::Dir;

        let mut client = endpoint();
        let mut server = endpoint();
        let now = Instant::now();
        let client_addr: SocketAddr = "127.0.0.1:10021".parse().unwrap();
        let server_addr: SocketAddr = "127.0.0.1:10022".parse().unwrap();

        let ch = client.connect(now, server_addr, "example.test", &[b"hq-xx".to_vec()]).unwrap();

        let mut sh = None;
        let mut flipped = false;
        let mut stream_id = None;
        for _ in 0..30 {
            let mut buf = Vec::new();
            if let Some((_, n)) = client.poll_transmit(ch, now, 1452, &mut buf) {
                server.handle_datagram(now, client_addr, BytesMut::from(&buf[..n]));
            }
            if sh.is_none() {
                if let Some(h) = server.accept() {
                    sh = Some(h);
                }
            }
            if let Some(sh) = sh {
                let mut buf = Vec::new();
                if let Some((_, n)) = server.poll_transmit(sh, now, 1452, &mut buf) {
                    client.handle_datagram(now, server_addr, BytesMut::from(&buf[..n]));
                }
            }

            if let Some(c) = client.get_mut(ch) {
                if c.is_established() && !flipped {
                    c.initiate_key_update();
                    flipped = true;
                }
                if flipped && stream_id.is_none() && c.params_received() {
                    let id = c.open(Dir::Bi).expect("peer's transport parameters grant bidi streams");
                    c.write(id, b"post-update");
                    c.finish(id);
                    stream_id = Some(id);
                }
            }
        }

        assert!(flipped, "client had a chance to initiate the key update");
        assert!(client.get(ch).unwrap().is_established());
        let sh = sh.expect("server accepted a connection");
        assert!(server.get(sh).unwrap().is_established());

        let id = stream_id.expect("client opened a stream after flipping key phase");
        let server_conn = server.get_mut(sh).unwrap();
        let mut buf = [0u8; 16];
        let n = server_conn.read(id, &mut buf);
        assert_eq!(&buf[..n], b"post-update");
    }

    /// Drives the same scenario 1 handshake over real sockets instead of calling
    /// `handle_datagram` directly, exercising the `poll_timeout`/`select!` run loop shape
    /// `main.rs` uses against an actual `tokio::net::UdpSocket` pair on loopback.
    #[tokio::test]
    async fn handshake_completes_over_real_loopback_sockets() {
        use std::time::Duration;
        use tokio::net::UdpSocket;
        use tokio::time::sleep;

        let client_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server_socket.local_addr().unwrap();

        let mut client = endpoint();
        let mut server = endpoint();
        let now = Instant::now();
        let ch = client.connect(now, server_addr, "example.test", &[b"hq-xx".to_vec()]).unwrap();

        let mut sh = None;
        let mut recv_buf = vec![0u8; 65527];
        let mut tx_buf = vec![0u8; 1452];

        for _ in 0..50 {
            let now = Instant::now();
            tx_buf.clear();
            if let Some((remote, n)) = client.poll_transmit(ch, now, tx_buf.capacity(), &mut tx_buf) {
                client_socket.send_to(&tx_buf[..n], remote).await.unwrap();
            }
            if let Some(sh) = sh {
                tx_buf.clear();
                if let Some((remote, n)) = server.poll_transmit(sh, now, tx_buf.capacity(), &mut tx_buf) {
                    server_socket.send_to(&tx_buf[..n], remote).await.unwrap();
                }
            }

            let done = client.get(ch).map_or(false, |c| c.is_established())
                && sh.and_then(|h| server.get(h)).map_or(false, |c| c.is_established());
            if done {
                break;
            }

            tokio::select! {
                recvd = server_socket.recv_from(&mut recv_buf) => {
                    let (n, remote) = recvd.unwrap();
                    server.handle_datagram(Instant::now(), remote, BytesMut::from(&recv_buf[..n]));
                    if sh.is_none() {
                        sh = server.accept();
                    }
                }
                recvd = client_socket.recv_from(&mut recv_buf) => {
                    let (n, remote) = recvd.unwrap();
                    client.handle_datagram(Instant::now(), remote, BytesMut::from(&recv_buf[..n]));
                }
                _ = sleep(Duration::from_millis(5)) => {}
            }
        }

        assert!(client.get(ch).unwrap().is_established());
        let sh = sh.expect("server accepted a connection");
        assert!(server.get(sh).unwrap().is_established());
    }

    #[test]
    fn connection_handle_generation_guards_stale_reference() {
        let mut ep = endpoint();
        let now = Instant::now();
        let addr: SocketAddr = "127.0.0.1:10003".parse().unwrap();
        let h1 = ep.connect(now, addr, "example.test", &[]).unwrap();
        ep.remove(h1);
        assert!(ep.get(h1).is_none());
        let h2 = ep.connect(now, addr, "example.test", &[]).unwrap();
        // A slab slot can be reused; the stale handle must not resolve to the new occupant.
        if h1.index == h2.index {
            assert_ne!(h1.generation, h2.generation);
            assert!(ep.get(h1).is_none());
            assert!(ep.get(h2).is_some());
        }
    }
}
