//! The seam between the transport core and an external TLS 1.3 implementation (spec section 6).
//!
//! Nothing in this module drives an actual TLS handshake: that library is an external
//! collaborator by design (spec section 1). What lives here is the *contract* the core needs from
//! it (the [`Session`] trait and the four outputs spec section 6 names: per-epoch output bytes, an
//! epoch-transition signal, install-key callbacks, and an error code), plus the one piece of
//! keying material this crate must compute itself because it isn't TLS-negotiated: the fixed
//! Initial secrets derived from the client's destination CID (spec section 6, "Initial keys are
//! derived from a fixed 20-byte salt and the client dcid").

use bytes::Bytes;
use ring::aead;
use ring::hkdf;
use ring::hmac;

use crate::cid::ConnectionId;
use crate::error::TransportErrorCode;
use crate::{Side, TransportError};

/// Which set of keys protects a packet
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum Epoch {
    Initial,
    ZeroRtt,
    Handshake,
    Data,
}

impl Epoch {
    pub const ALL: [Epoch; 4] = [Epoch::Initial, Epoch::ZeroRtt, Epoch::Handshake, Epoch::Data];
}

/// The header-protection keys for one direction. These are fixed for the life of an epoch: RFC
/// 9001 section 6 rotates only the packet-protection secret on a key update, never header
/// protection, so these are derived once and never recomputed.
pub struct HeaderKeys {
    pub local: aead::quic::HeaderProtectionKey,
    pub remote: aead::quic::HeaderProtectionKey,
}

/// One direction's packet-protection key, plus the traffic secret it was derived from so a key
/// update (RFC 9001 section 6.1, the "quic ku" label) can derive the next generation without
/// redoing the TLS key schedule.
pub struct PacketKey {
    packet: aead::LessSafeKey,
    /// Nonce bytes whose high bits are XORed with the packet number before use, per RFC 9001
    /// section 5.3.
    iv: [u8; aead::NONCE_LEN],
    secret: hkdf::Prk,
    alg: &'static aead::Algorithm,
}

impl PacketKey {
    fn new(alg: &'static aead::Algorithm, secret: hkdf::Prk) -> Self {
        let key = hkdf_expand_aead_key(&secret, b"quic key", alg);
        let mut iv = [0u8; aead::NONCE_LEN];
        hkdf_expand_into(&secret, b"quic iv", &mut iv);
        Self {
            packet: aead::LessSafeKey::new(key),
            iv,
            secret,
            alg,
        }
    }

    /// Build the per-packet nonce by XORing the packet number into the low bits of `iv`
    pub fn nonce(&self, packet_number: u64) -> aead::Nonce {
        let mut nonce = self.iv;
        let pn_bytes = packet_number.to_be_bytes();
        for (n, &p) in nonce.iter_mut().rev().zip(pn_bytes.iter().rev()) {
            *n ^= p;
        }
        aead::Nonce::assume_unique_for_key(nonce)
    }

    pub fn seal_key(&self) -> &aead::LessSafeKey {
        &self.packet
    }

    /// Derive the next generation's packet-protection key (RFC 9001 section 6.1)
    pub fn update(&self) -> PacketKey {
        PacketKey::new(self.alg, hkdf_expand_prk(&self.secret, b"quic ku"))
    }
}

fn directional_keys(alg: &'static aead::Algorithm, secret: hkdf::Prk) -> (aead::quic::HeaderProtectionKey, PacketKey) {
    let hp_alg = header_protection_algorithm(alg);
    let hp_key_bytes = hkdf_expand_bytes(&secret, b"quic hp", alg.key_len());
    let header = aead::quic::HeaderProtectionKey::new(hp_alg, &hp_key_bytes).expect("key material sized for the chosen algorithm");
    (header, PacketKey::new(alg, secret))
}

/// Packet-protection keys for both directions, replaced wholesale on a key update
pub struct PacketKeys {
    pub local: PacketKey,
    pub remote: PacketKey,
}

impl PacketKeys {
    /// Derive the next generation of both directions' packet keys (RFC 9001 section 6.1). Both
    /// peers compute this independently from their respective current secrets; no coordination
    /// beyond the key-phase bit is required.
    pub fn update(&self) -> PacketKeys {
        PacketKeys {
            local: self.local.update(),
            remote: self.remote.update(),
        }
    }
}

/// Keys for both read and write directions at one epoch: a fixed header-protection pair plus a
/// packet-protection pair that a key update replaces (spec section 3's `do_key_flip` and spec
/// section 4.7's key-flip alarm; see `Connection::initiate_key_update`/`handle_packet`'s
/// phase-mismatch branch).
pub struct Keys {
    pub header: HeaderKeys,
    pub packet: PacketKeys,
}

const INITIAL_SALT: [u8; 20] = [
    0x38, 0x76, 0x2c, 0xf7, 0xf5, 0x59, 0x34, 0xb3, 0x4d, 0x17, 0x9a, 0xe6, 0xa4, 0xc8, 0x0c, 0xad,
    0xcc, 0xbb, 0x7f, 0x0a,
];

/// Derive the Initial packet-protection keys from the client's chosen destination CID
///
/// Both endpoints derive the same two secrets (`client in`, `server in`); `side` selects which
/// one is "local" (write) and which is "remote" (read) for this endpoint.
pub fn initial_keys(dcid: &ConnectionId, side: Side) -> Keys {
    let salt = hkdf::Salt::new(hkdf::HKDF_SHA256, &INITIAL_SALT);
    let initial_secret = salt.extract(dcid);

    let client_secret = hkdf_expand_prk(&initial_secret, b"client in");
    let server_secret = hkdf_expand_prk(&initial_secret, b"server in");

    let (local_secret, remote_secret) = match side {
        Side::Client => (client_secret, server_secret),
        Side::Server => (server_secret, client_secret),
    };

    let (local_header, local_packet) = directional_keys(&aead::AES_128_GCM, local_secret);
    let (remote_header, remote_packet) = directional_keys(&aead::AES_128_GCM, remote_secret);

    Keys {
        header: HeaderKeys {
            local: local_header,
            remote: remote_header,
        },
        packet: PacketKeys {
            local: local_packet,
            remote: remote_packet,
        },
    }
}

/// `HKDF-Expand-Label(secret, label, "", length)` per RFC 8446 section 7.1, with the QUIC base
/// label `tls13 ` spec section 6 names.
fn hkdf_expand_into(secret: &hkdf::Prk, label: &[u8], out: &mut [u8]) {
    let full_label = build_label(label, out.len());
    let info: [&[u8]; 1] = [&full_label];
    let okm = secret
        .expand(&info, OkmLen(out.len()))
        .expect("label length fits HKDF output bounds");
    okm.fill(out).expect("output buffer sized to match OkmLen");
}

fn hkdf_expand_bytes(secret: &hkdf::Prk, label: &[u8], len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    hkdf_expand_into(secret, label, &mut buf);
    buf
}

fn hkdf_expand_aead_key(secret: &hkdf::Prk, label: &[u8], alg: &'static aead::Algorithm) -> aead::UnboundKey {
    let bytes = hkdf_expand_bytes(secret, label, alg.key_len());
    aead::UnboundKey::new(alg, &bytes).expect("key material sized for the chosen algorithm")
}

fn hkdf_expand_prk(secret: &hkdf::Prk, label: &[u8]) -> hkdf::Prk {
    // HKDF-Expand-Label with a 32-byte output, promoted back into a Prk for further expansion.
    let mut buf = [0u8; 32];
    hkdf_expand_into(secret, label, &mut buf);
    hkdf::Salt::new(hkdf::HKDF_SHA256, &[]).extract(&buf)
}

fn build_label(label: &[u8], len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + 1 + 6 + label.len() + 1);
    out.extend_from_slice(&(len as u16).to_be_bytes());
    let full_label_len = 6 + label.len();
    out.push(full_label_len as u8);
    out.extend_from_slice(b"tls13 ");
    out.extend_from_slice(label);
    out.push(0); // zero-length context
    out
}

struct OkmLen(usize);

impl hkdf::KeyType for OkmLen {
    fn len(&self) -> usize {
        self.0
    }
}

fn header_protection_algorithm(alg: &'static aead::Algorithm) -> &'static aead::quic::Algorithm {
    if *alg == aead::AES_128_GCM {
        &aead::quic::AES_128
    } else if *alg == aead::AES_256_GCM {
        &aead::quic::AES_256
    } else {
        &aead::quic::CHACHA20
    }
}

/// An HMAC key used to compute Stateless Reset Tokens and Retry token integrity tags (spec
/// sections 4.5 and 8, scenario 3)
pub struct HmacKey(hmac::Key);

impl HmacKey {
    pub fn new(secret: &[u8]) -> Self {
        Self(hmac::Key::new(hmac::HMAC_SHA256, secret))
    }

    pub fn sign(&self, data: &[u8]) -> hmac::Tag {
        hmac::sign(&self.0, data)
    }
}

/// The handshake step outcome a [`Session`] reports back to the connection
pub enum TranscriptEvent {
    /// New keys are ready to be installed for `epoch`, in the given direction
    Keys {
        epoch: Epoch,
        is_write: bool,
    },
    /// The handshake has produced its final 1-RTT keys and transport parameters
    HandshakeComplete,
    /// The peer's transport parameters extension (spec section 6, TLS extension `0xffa5`)
    /// arrived; `encoded` is the still-encoded parameter set for the core to decode itself,
    /// since only the core knows how to interpret its own wire format.
    TransportParameters(Bytes),
    /// A fatal TLS alert was raised
    Alert(u8),
}

/// The interface the connection core requires from a TLS 1.3 implementation (spec section 6)
///
/// Implementations own the actual handshake state machine; the core only ever pushes and pulls
/// opaque `CRYPTO` frame payloads through it, keyed by [`Epoch`].
pub trait Session: Send + 'static {
    /// Hand the core's own encoded transport parameters (spec section 6) to the session, so it
    /// can be carried in the TLS extension of the next outbound flight (ClientHello for the
    /// client, EncryptedExtensions for the server).
    fn set_local_transport_parameters(&mut self, params: Bytes);

    /// Feed `data` received in a `CRYPTO` frame at `epoch` into the handshake
    fn read_handshake(&mut self, epoch: Epoch, data: &[u8]) -> Result<(), TransportError>;

    /// Drain any handshake bytes the session wants to send at `epoch` into `buf`, returning the
    /// number of bytes written
    fn write_handshake(&mut self, epoch: Epoch, buf: &mut Vec<u8>) -> usize;

    /// Pop the next pending transcript event, if any
    fn poll_transcript(&mut self) -> Option<TranscriptEvent>;

    /// Take the keys most recently announced via `TranscriptEvent::Keys`
    fn take_keys(&mut self, epoch: Epoch) -> Option<Keys>;

    /// True until the handshake has completed in both directions
    fn is_handshaking(&self) -> bool;

    /// Negotiated ALPN protocol, once available
    fn alpn_protocol(&self) -> Option<&[u8]>;
}

/// Helper constructing the `err_close`-shaped error for a rejected TLS alert (spec section 7:
/// `TLS (0x100 | tls_alert)`)
pub fn alert_to_transport_error(alert: u8) -> TransportErrorCode {
    TransportErrorCode::Crypto(alert)
}

/// A fake [`Session`] exercising the adapter contract without a real TLS 1.3 handshake, used
/// only to drive the connection state machine and run loop in tests (spec section 6: the real
/// handshake library is an external collaborator this crate never implements).
#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::VecDeque;

    use bytes::Bytes;

    use crate::cid::ConnectionId;
    use crate::error::TransportError;
    use crate::Side;

    use super::{initial_keys, Epoch, Keys, Session, TranscriptEvent};

    /// Derives a `Keys` pair for an epoch other than Initial by feeding a per-epoch-salted CID
    /// through the same Initial-secret derivation; not a real HKDF-Expand-Label transcript
    /// secret, just enough symmetry for both mock peers to agree on keys deterministically.
    fn mock_keys(epoch: Epoch, dcid: &ConnectionId, side: Side) -> Keys {
        if epoch == Epoch::Initial {
            return initial_keys(dcid, side);
        }
        let mut salted = dcid.to_vec();
        salted.push(epoch as u8);
        let len = salted.len().min(20);
        initial_keys(&ConnectionId::new(&salted[..len]), side)
    }

    #[derive(Default)]
    struct Outbox {
        initial: Vec<u8>,
        handshake: Vec<u8>,
    }

    pub struct MockSession {
        side: Side,
        dcid: ConnectionId,
        alpn: Vec<u8>,
        events: VecDeque<TranscriptEvent>,
        pending_keys: Vec<(Epoch, Keys)>,
        outbox: Outbox,
        local_params: Bytes,
        got_peer_hello: bool,
        handshaking: bool,
    }

    impl MockSession {
        /// Build the client side; `dcid` is the random destination CID the client picked for
        /// its first Initial (spec section 6: Initial keys are derived from it).
        pub fn client(dcid: ConnectionId, alpn: Vec<u8>) -> Self {
            let mut s = Self {
                side: Side::Client,
                dcid,
                alpn,
                events: VecDeque::new(),
                pending_keys: Vec::new(),
                outbox: Outbox::default(),
                local_params: Bytes::new(),
                got_peer_hello: false,
                handshaking: true,
            };
            s.install(Epoch::Initial);
            s
        }

        /// Build the server side; `dcid` is the same CID the client used (the endpoint learned
        /// it by parsing the client's first Initial).
        pub fn server(dcid: ConnectionId, alpn: Vec<u8>) -> Self {
            let mut s = Self {
                side: Side::Server,
                dcid,
                alpn,
                events: VecDeque::new(),
                pending_keys: Vec::new(),
                outbox: Outbox::default(),
                local_params: Bytes::new(),
                got_peer_hello: false,
                handshaking: true,
            };
            s.install(Epoch::Initial);
            s
        }

        fn install(&mut self, epoch: Epoch) {
            self.events.push_back(TranscriptEvent::Keys { epoch, is_write: true });
            self.events.push_back(TranscriptEvent::Keys { epoch, is_write: false });
            self.pending_keys.push((epoch, mock_keys(epoch, &self.dcid, self.side)));
        }

        /// Frame `marker` (the fake handshake message) behind a length-prefixed copy of the
        /// local transport parameters, standing in for how a real TLS library would embed them
        /// in the ClientHello/EncryptedExtensions of that same flight.
        fn frame(&self, marker: &[u8]) -> Vec<u8> {
            let mut out = Vec::with_capacity(2 + self.local_params.len() + marker.len());
            out.extend_from_slice(&(self.local_params.len() as u16).to_be_bytes());
            out.extend_from_slice(&self.local_params);
            out.extend_from_slice(marker);
            out
        }

        /// Undo [`Self::frame`]: split off the peer's encoded transport parameters and surface
        /// them as a transcript event, returning the remaining plaintext marker.
        fn unframe(&mut self, data: &[u8]) -> Vec<u8> {
            if data.len() < 2 {
                return data.to_vec();
            }
            let len = u16::from_be_bytes([data[0], data[1]]) as usize;
            if data.len() < 2 + len {
                return data.to_vec();
            }
            let params = Bytes::copy_from_slice(&data[2..2 + len]);
            self.events.push_back(TranscriptEvent::TransportParameters(params));
            data[2 + len..].to_vec()
        }
    }

    impl Session for MockSession {
        fn set_local_transport_parameters(&mut self, params: Bytes) {
            self.local_params = params;
            if self.side.is_client() {
                self.outbox.initial = self.frame(b"CH");
            }
        }

        fn read_handshake(&mut self, epoch: Epoch, data: &[u8]) -> Result<(), TransportError> {
            if data.is_empty() || self.got_peer_hello {
                return Ok(());
            }
            self.got_peer_hello = true;
            let marker = self.unframe(data);
            match (self.side, epoch) {
                (Side::Server, Epoch::Initial) if marker == b"CH" => {
                    // Client's "CH" arrived: derive Handshake + Data keys and reply with "SH".
                    self.install(Epoch::Handshake);
                    self.install(Epoch::Data);
                    self.outbox.initial = self.frame(b"SH");
                }
                (Side::Client, Epoch::Initial) if marker == b"SH" => {
                    // Server's "SH" arrived: derive Handshake + Data keys and send "Finished".
                    self.install(Epoch::Handshake);
                    self.install(Epoch::Data);
                    self.outbox.handshake = b"CF".to_vec();
                    self.events.push_back(TranscriptEvent::HandshakeComplete);
                    self.handshaking = false;
                }
                (Side::Server, Epoch::Handshake) => {
                    // Client's "Finished" arrived.
                    self.events.push_back(TranscriptEvent::HandshakeComplete);
                    self.handshaking = false;
                }
                _ => {}
            }
            Ok(())
        }

        fn write_handshake(&mut self, epoch: Epoch, buf: &mut Vec<u8>) -> usize {
            let out = match epoch {
                Epoch::Initial => std::mem::take(&mut self.outbox.initial),
                Epoch::Handshake => std::mem::take(&mut self.outbox.handshake),
                _ => Vec::new(),
            };
            let n = out.len();
            buf.extend_from_slice(&out);
            n
        }

        fn poll_transcript(&mut self) -> Option<TranscriptEvent> {
            self.events.pop_front()
        }

        fn take_keys(&mut self, epoch: Epoch) -> Option<Keys> {
            let idx = self.pending_keys.iter().position(|(e, _)| *e == epoch)?;
            Some(self.pending_keys.remove(idx).1)
        }

        fn is_handshaking(&self) -> bool {
            self.handshaking
        }

        fn alpn_protocol(&self) -> Option<&[u8]> {
            if self.alpn.is_empty() {
                None
            } else {
                Some(&self.alpn)
            }
        }
    }
}
