//! Packet coder (spec section 4.2): header encode/decode, header protection, AEAD packet
//! protection, and datagram coalescing/decoalescing.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use ring::aead;

use crate::cid::ConnectionId;
use crate::coding::{BufExt, BufMutExt, UnexpectedEnd};
use crate::crypto::PacketKey;
use crate::error::{TransportError, TransportErrorCode};
use crate::varint::VarInt;

/// The QUIC version this crate speaks
pub const VERSION: u32 = 1;

/// The long-header packet type, carried in the low 4 bits of byte 0 (after unmasking)
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum LongType {
    Initial,
    ZeroRtt,
    Handshake,
    Retry,
}

impl LongType {
    fn bits(self) -> u8 {
        match self {
            LongType::Initial => 0b00,
            LongType::ZeroRtt => 0b01,
            LongType::Handshake => 0b10,
            LongType::Retry => 0b11,
        }
    }

    fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0b00 => LongType::Initial,
            0b01 => LongType::ZeroRtt,
            0b10 => LongType::Handshake,
            _ => LongType::Retry,
        }
    }

    /// Whether two long-header types may be coalesced into the same datagram, in the given
    /// order (spec section 4.2, "coalesce")
    pub fn coalesces_into(self, next: LongType) -> bool {
        matches!(
            (self, next),
            (LongType::Initial, LongType::ZeroRtt)
                | (LongType::Initial, LongType::Handshake)
                | (LongType::ZeroRtt, LongType::Handshake)
        )
    }
}

/// A decoded, not-yet-unprotected packet header
#[derive(Debug, Clone)]
pub enum Header {
    Initial {
        version: u32,
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
        token: Bytes,
        len: u64,
        number_offset: usize,
    },
    Long {
        ty: LongType,
        version: u32,
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
        len: u64,
        number_offset: usize,
    },
    Retry {
        version: u32,
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
        token: Bytes,
        integrity_tag: [u8; 16],
    },
    VersionNegotiate {
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
    },
    Short {
        dst_cid: ConnectionId,
        number_offset: usize,
    },
}

impl Header {
    pub fn long_type(&self) -> Option<LongType> {
        match self {
            Header::Initial { .. } => Some(LongType::Initial),
            Header::Long { ty, .. } => Some(*ty),
            Header::Retry { .. } => Some(LongType::Retry),
            _ => None,
        }
    }

    pub fn dst_cid(&self) -> &ConnectionId {
        match self {
            Header::Initial { dst_cid, .. }
            | Header::Long { dst_cid, .. }
            | Header::Retry { dst_cid, .. }
            | Header::VersionNegotiate { dst_cid, .. }
            | Header::Short { dst_cid, .. } => dst_cid,
        }
    }

    /// Is this header's reserved long-header type bits (for Initial/Handshake/0-RTT) only
    /// subject to {ACK, CRYPTO, PADDING, CONNECTION_CLOSE} per spec section 4.3
    pub fn is_long_restricted(&self) -> bool {
        matches!(self.long_type(), Some(LongType::Initial) | Some(LongType::Handshake))
    }
}

/// Encode a long header (Initial/0-RTT/Handshake) and return the offset of the packet-number
/// field so the caller can apply header protection in place afterward
pub fn encode_long(
    buf: &mut BytesMut,
    ty: LongType,
    version: u32,
    dst_cid: &ConnectionId,
    src_cid: &ConnectionId,
    token: Option<&[u8]>,
    packet_number: u64,
    number_len: usize,
) -> usize {
    let first_byte = 0xc0 | (ty.bits() << 4) | (number_len as u8 - 1);
    buf.put_u8(first_byte);
    buf.put_u32(version);
    dst_cid.encode_long(buf);
    src_cid.encode_long(buf);
    if ty == LongType::Initial {
        let token = token.unwrap_or(&[]);
        buf.write_var(token.len() as u64);
        buf.put_slice(token);
    }
    // Length field (payload + pn) is patched in by the caller once the payload size is known;
    // reserve the maximum varint width (4 bytes) so the offset math stays fixed.
    buf.put_u32(0xffff_ffff); // placeholder, top two bits 11 => 4-byte varint tag
    let number_offset = buf.len();
    encode_packet_number(buf, packet_number, number_len);
    number_offset
}

/// Patch a previously-reserved 4-byte length placeholder with the real remaining length
pub fn patch_long_len(buf: &mut [u8], length_offset: usize, remaining: u64) {
    let varint = VarInt::from_u64(remaining).expect("long header payload fits a varint");
    debug_assert_eq!(varint.size(), 4, "placeholder reserved exactly 4 bytes");
    let mut tmp = BytesMut::with_capacity(4);
    varint.encode(&mut tmp);
    buf[length_offset..length_offset + 4].copy_from_slice(&tmp);
}

/// Fixed AES-128-GCM key used to compute a Retry packet's integrity tag (RFC 9001 section 5.8,
/// QUIC v1); public by design, not an endpoint secret.
const RETRY_INTEGRITY_KEY: [u8; 16] = [
    0xbe, 0x0c, 0x69, 0x0b, 0x9f, 0x66, 0x57, 0x5a, 0x1d, 0x76, 0x6b, 0x54, 0xe3, 0x68, 0xc8, 0x4e,
];
const RETRY_INTEGRITY_NONCE: [u8; 12] = [0x46, 0x15, 0x99, 0xd3, 0x5d, 0x63, 0x2b, 0xf2, 0x23, 0x98, 0x25, 0xbb];

fn retry_integrity_tag(odcid: &ConnectionId, header_and_token: &[u8]) -> [u8; 16] {
    let mut pseudo = Vec::with_capacity(1 + odcid.len() + header_and_token.len());
    pseudo.push(odcid.len() as u8);
    pseudo.extend_from_slice(odcid);
    pseudo.extend_from_slice(header_and_token);

    let key = aead::LessSafeKey::new(aead::UnboundKey::new(&aead::AES_128_GCM, &RETRY_INTEGRITY_KEY).expect("fixed key material is valid"));
    let nonce = aead::Nonce::assume_unique_for_key(RETRY_INTEGRITY_NONCE);
    let tag = key
        .seal_in_place_separate_tag(nonce, aead::Aad::from(&pseudo), &mut [])
        .expect("empty plaintext always seals");
    let mut out = [0u8; 16];
    out.copy_from_slice(tag.as_ref());
    out
}

/// Build a full Retry datagram: long header, echoed token, and the RFC 9001 integrity tag
/// computed over a pseudo-packet prefixed with `odcid` (spec section 8, scenario 3)
pub fn encode_retry(odcid: &ConnectionId, version: u32, dst_cid: &ConnectionId, src_cid: &ConnectionId, token: &[u8]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.put_u8(0xc0 | (LongType::Retry.bits() << 4));
    buf.put_u32(version);
    dst_cid.encode_long(&mut buf);
    src_cid.encode_long(&mut buf);
    buf.put_slice(token);
    let tag = retry_integrity_tag(odcid, &buf);
    buf.extend_from_slice(&tag);
    buf
}

/// Verify a received Retry's integrity tag against the odcid the client used on its own first
/// Initial, given the full packet minus its trailing 16-byte tag
pub fn verify_retry_integrity_tag(odcid: &ConnectionId, header_and_token: &[u8], tag: &[u8; 16]) -> bool {
    retry_integrity_tag(odcid, header_and_token) == *tag
}

pub fn encode_short(
    buf: &mut BytesMut,
    dst_cid: &ConnectionId,
    packet_number: u64,
    number_len: usize,
    key_phase: bool,
    spin: bool,
) -> usize {
    let mut first_byte = 0x40 | (number_len as u8 - 1);
    if key_phase {
        first_byte |= 0x04;
    }
    if spin {
        first_byte |= 0x20;
    }
    buf.put_u8(first_byte);
    buf.put_slice(dst_cid);
    let number_offset = buf.len();
    encode_packet_number(buf, packet_number, number_len);
    number_offset
}

fn encode_packet_number(buf: &mut BytesMut, pn: u64, len: usize) {
    let bytes = pn.to_be_bytes();
    buf.put_slice(&bytes[8 - len..]);
}

/// Everything decodable before header protection is removed: the CID/version/token/length
/// fields, and where the (still-masked) packet-number field begins (spec section 4.2,
/// `decode_hdr_beginning`)
pub fn decode_hdr_beginning(
    dcid_len_for_short: usize,
    data: &[u8],
) -> Result<Header, TransportError> {
    if data.is_empty() {
        return Err(malformed("empty datagram"));
    }
    let first = data[0];
    if first & 0x80 == 0 {
        // Short header: 1 flag byte + fixed-length DCID + pn field.
        if data.len() < 1 + dcid_len_for_short {
            return Err(malformed("short header truncated"));
        }
        let dst_cid = ConnectionId::new(&data[1..1 + dcid_len_for_short]);
        return Ok(Header::Short {
            dst_cid,
            number_offset: 1 + dcid_len_for_short,
        });
    }

    let mut buf = &data[1..];
    if buf.remaining() < 4 {
        return Err(malformed("long header truncated before version"));
    }
    let version = buf.get_u32();

    let dst_cid = ConnectionId::decode_long(&mut buf).map_err(|_| malformed("bad dcid length"))?;
    let src_cid = ConnectionId::decode_long(&mut buf).map_err(|_| malformed("bad scid length"))?;

    if version == 0 {
        return Ok(Header::VersionNegotiate { dst_cid, src_cid });
    }

    let ty = LongType::from_bits(first >> 4);

    if ty == LongType::Retry {
        let consumed = data.len() - buf.remaining();
        // Everything but the trailing 16-byte integrity tag is the opaque retry token; the
        // original destination CID the tag was computed over is never on the wire, it's
        // whatever dcid the receiver used on its own first Initial (spec section 4.2, Retry).
        if data.len() < consumed + 16 {
            return Err(malformed("retry packet too short for integrity tag"));
        }
        let tag_start = data.len() - 16;
        let token = Bytes::copy_from_slice(&data[consumed..tag_start]);
        let mut integrity_tag = [0u8; 16];
        integrity_tag.copy_from_slice(&data[tag_start..]);
        return Ok(Header::Retry {
            version,
            dst_cid,
            src_cid,
            token,
            integrity_tag,
        });
    }

    let token = if ty == LongType::Initial {
        let token_len = buf.get_var().map_err(|_| malformed("truncated token length"))? as usize;
        if buf.remaining() < token_len {
            return Err(malformed("token longer than remaining buffer"));
        }
        let t = Bytes::copy_from_slice(&buf.chunk()[..token_len]);
        buf.advance(token_len);
        t
    } else {
        Bytes::new()
    };

    let len = buf.get_var().map_err(|_| malformed("truncated length field"))?;
    if buf.remaining() < len as usize {
        return Err(malformed("length field exceeds remaining buffer"));
    }
    let number_offset = data.len() - buf.remaining();

    if ty == LongType::Initial {
        Ok(Header::Initial {
            version,
            dst_cid,
            src_cid,
            token,
            len,
            number_offset,
        })
    } else {
        Ok(Header::Long {
            ty,
            version,
            dst_cid,
            src_cid,
            len,
            number_offset,
        })
    }
}

fn malformed(reason: &'static str) -> TransportError {
    TransportError::new(TransportErrorCode::ProtocolViolation, None, reason)
}

/// Undo header protection in place and recover the full packet number, given the largest packet
/// number successfully received in this space so far (spec section 4.2, `undo_hp +
/// decode_hdr_remainder`; RFC 9000 Appendix A's `largest_pn`)
///
/// `buf` must contain at least `number_offset + 4 + Self::SAMPLE_LEN` bytes: header protection
/// samples 16 bytes starting 4 bytes past the start of the (still masked) packet-number field.
pub fn remove_header_protection(
    buf: &mut [u8],
    number_offset: usize,
    is_long: bool,
    hp_key: &aead::quic::HeaderProtectionKey,
    largest_rx: Option<u64>,
) -> Result<(u64, usize), TransportError> {
    const SAMPLE_LEN: usize = 16;
    let sample_offset = number_offset + 4;
    if buf.len() < sample_offset + SAMPLE_LEN {
        return Err(malformed("packet too short for header protection sample"));
    }
    let sample = &buf[sample_offset..sample_offset + SAMPLE_LEN];
    let mask = hp_key
        .new_mask(sample)
        .map_err(|_| malformed("header protection mask failed"))?;

    let first_mask = if is_long { mask[0] & 0x0f } else { mask[0] & 0x1f };
    buf[0] ^= first_mask;
    let number_len = (buf[0] & 0x03) as usize + 1;

    for i in 0..number_len {
        buf[number_offset + i] ^= mask[1 + i];
    }

    let mut truncated = 0u64;
    for i in 0..number_len {
        truncated = (truncated << 8) | buf[number_offset + i] as u64;
    }

    let full = expand_packet_number(truncated, number_len, largest_rx);
    Ok((full, number_len))
}

/// Reconstruct the full packet number from its truncated wire representation by choosing the
/// candidate closest to `expected = largest_rx + 1` (RFC 9000 Appendix A)
fn expand_packet_number(truncated: u64, number_len: usize, largest_rx: Option<u64>) -> u64 {
    let expected = largest_rx.map(|l| l + 1).unwrap_or(0);
    let win = 1u64 << (8 * number_len);
    let half_win = win / 2;
    let candidate = (expected & !(win - 1)) | truncated;

    if candidate + half_win <= expected && candidate + win <= (1 << 62) - 1 {
        candidate + win
    } else if candidate > expected + half_win && candidate >= win {
        candidate - win
    } else {
        candidate
    }
}

/// Apply header protection to a just-encoded packet, in place (spec section 4.2, `apply_aead`'s
/// header-protection pass)
pub fn apply_header_protection(
    buf: &mut [u8],
    number_offset: usize,
    number_len: usize,
    is_long: bool,
    hp_key: &aead::quic::HeaderProtectionKey,
) -> Result<(), TransportError> {
    const SAMPLE_LEN: usize = 16;
    let sample_offset = number_offset + 4;
    if buf.len() < sample_offset + SAMPLE_LEN {
        return Err(malformed("packet too short for header protection sample"));
    }
    let sample = &buf[sample_offset..sample_offset + SAMPLE_LEN];
    let mask = hp_key
        .new_mask(sample)
        .map_err(|_| malformed("header protection mask failed"))?;

    let first_mask = if is_long { mask[0] & 0x0f } else { mask[0] & 0x1f };
    buf[0] ^= first_mask;
    for i in 0..number_len {
        buf[number_offset + i] ^= mask[1 + i];
    }
    Ok(())
}

/// AEAD-seal `payload` in place, using the header bytes as associated data. Returns the ciphertext
/// including the 16-byte authentication tag.
pub fn seal(
    key: &PacketKey,
    packet_number: u64,
    header: &[u8],
    payload: &mut Vec<u8>,
) -> Result<(), TransportError> {
    let nonce = key.nonce(packet_number);
    let aad = aead::Aad::from(header);
    key.seal_key()
        .seal_in_place_append_tag(nonce, aad, payload)
        .map_err(|_| malformed("AEAD seal failed"))?;
    Ok(())
}

/// Undo AEAD protection in place, returning the plaintext length
pub fn open<'a>(
    key: &PacketKey,
    packet_number: u64,
    header: &[u8],
    payload: &'a mut [u8],
) -> Result<&'a [u8], TransportError> {
    let nonce = key.nonce(packet_number);
    let aad = aead::Aad::from(header);
    key.seal_key()
        .open_in_place(nonce, aad, payload)
        .map_err(|_| TransportError::new(TransportErrorCode::ProtocolViolation, None, "AEAD open failed"))
}

/// Split a received UDP datagram into its coalesced packets (spec section 4.2, `decoalesce`).
///
/// Only long-header packets declare their own length, so decoalescing stops as soon as a short
/// header packet is seen (it must be the last packet in the datagram) or the declared length
/// doesn't leave room for another valid header.
pub fn decoalesce(datagram: Bytes) -> Vec<Bytes> {
    let mut parts = Vec::new();
    let mut rest = datagram;
    loop {
        if rest.is_empty() {
            break;
        }
        let first = rest[0];
        if first & 0x80 == 0 {
            // Short header consumes the remainder of the datagram.
            parts.push(rest);
            break;
        }
        // Peek the long-header length field to find the split point; fall back to consuming the
        // rest of the datagram if parsing fails, so the caller's header decode reports the error.
        match split_point(&rest) {
            Some(at) if at < rest.len() => {
                parts.push(rest.slice(..at));
                rest = rest.slice(at..);
            }
            _ => {
                parts.push(rest);
                break;
            }
        }
    }
    parts
}

fn split_point(data: &[u8]) -> Option<usize> {
    let first = data[0];
    let mut buf = &data[1..];
    if buf.remaining() < 4 {
        return None;
    }
    let version = buf.get_u32();
    if version == 0 {
        return None; // version negotiation packets are never coalesced
    }
    let _dst = ConnectionId::decode_long(&mut buf).ok()?;
    let _src = ConnectionId::decode_long(&mut buf).ok()?;
    let ty = LongType::from_bits(first >> 4);
    if ty == LongType::Retry {
        return None; // Retry has no length field and is never coalesced with a follower
    }
    if ty == LongType::Initial {
        let token_len = buf.get_var().ok()? as usize;
        if buf.remaining() < token_len {
            return None;
        }
        buf.advance(token_len);
    }
    let len = buf.get_var().ok()?;
    let consumed = data.len() - buf.remaining();
    Some(consumed + len as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_header_round_trip_beginning() {
        let dst = ConnectionId::new(&[1, 2, 3, 4]);
        let src = ConnectionId::new(&[5, 6, 7, 8]);
        let mut buf = BytesMut::new();
        let number_offset = encode_long(&mut buf, LongType::Initial, VERSION, &dst, &src, Some(b"tok"), 7, 1);
        patch_long_len(&mut buf, number_offset - 4, 1 + 16);
        let parsed = decode_hdr_beginning(0, &buf).unwrap();
        match parsed {
            Header::Initial {
                version,
                dst_cid,
                src_cid,
                token,
                number_offset: off,
                ..
            } => {
                assert_eq!(version, VERSION);
                assert_eq!(&*dst_cid, &[1, 2, 3, 4]);
                assert_eq!(&*src_cid, &[5, 6, 7, 8]);
                assert_eq!(&token[..], b"tok");
                assert_eq!(off, number_offset);
            }
            other => panic!("unexpected header {other:?}"),
        }
    }

    #[test]
    fn short_header_round_trip_beginning() {
        let dst = ConnectionId::new(&[9, 9, 9, 9, 9, 9, 9, 9]);
        let mut buf = BytesMut::new();
        let number_offset = encode_short(&mut buf, &dst, 42, 2, true, false);
        let parsed = decode_hdr_beginning(8, &buf).unwrap();
        match parsed {
            Header::Short { dst_cid, number_offset: off } => {
                assert_eq!(&*dst_cid, &[9, 9, 9, 9, 9, 9, 9, 9]);
                assert_eq!(off, number_offset);
            }
            other => panic!("unexpected header {other:?}"),
        }
    }

    #[test]
    fn packet_number_expansion_matches_rfc_example() {
        // RFC 9000 Appendix A: largest acked 0xa82f30ea, full pn 0xa82f9b32, truncated to 2 bytes.
        let full = expand_packet_number(0x9b32, 2, Some(0xa82f30ea));
        assert_eq!(full, 0xa82f9b32);
    }

    #[test]
    fn header_protection_round_trip() {
        use ring::rand::{SecureRandom, SystemRandom};
        let rng = SystemRandom::new();
        let mut key_bytes = [0u8; 16];
        rng.fill(&mut key_bytes).unwrap();
        let hp_key = aead::quic::HeaderProtectionKey::new(&aead::quic::AES_128, &key_bytes).unwrap();
        let hp_key2 = aead::quic::HeaderProtectionKey::new(&aead::quic::AES_128, &key_bytes).unwrap();

        let dst = ConnectionId::new(&[1, 2, 3, 4]);
        let src = ConnectionId::new(&[5, 6, 7, 8]);
        let mut buf = BytesMut::new();
        let number_offset = encode_long(&mut buf, LongType::Initial, VERSION, &dst, &src, None, 7, 1);
        patch_long_len(&mut buf, number_offset - 4, 1 + 16);
        buf.extend_from_slice(&[0u8; 16]); // stand-in sample payload so a sample window exists

        apply_header_protection(&mut buf, number_offset, 1, true, &hp_key).unwrap();
        let (pn, pn_len) = remove_header_protection(&mut buf, number_offset, true, &hp_key2, None).unwrap();
        assert_eq!(pn, 7);
        assert_eq!(pn_len, 1);
    }
}
