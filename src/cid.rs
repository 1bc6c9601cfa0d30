//! Connection IDs (spec section 3): an opaque 4-20 byte identifier, plus the generator seam an
//! `Endpoint` uses to mint fresh local CIDs.

use std::fmt;
use std::ops::Deref;

use bytes::{Buf, BufMut};
use rand::RngCore;

use crate::coding::UnexpectedEnd;

pub const MAX_CID_SIZE: usize = 20;
pub const MIN_CID_SIZE: usize = 4;

/// An opaque QUIC connection identifier, 0-20 bytes
#[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ConnectionId {
    len: u8,
    bytes: [u8; MAX_CID_SIZE],
}

impl ConnectionId {
    pub fn new(bytes: &[u8]) -> Self {
        debug_assert!(bytes.len() <= MAX_CID_SIZE);
        let mut buf = [0; MAX_CID_SIZE];
        buf[..bytes.len()].copy_from_slice(bytes);
        Self {
            len: bytes.len() as u8,
            bytes: buf,
        }
    }

    pub fn random<R: RngCore>(rng: &mut R, len: usize) -> Self {
        debug_assert!(len <= MAX_CID_SIZE);
        let mut bytes = [0; MAX_CID_SIZE];
        rng.fill_bytes(&mut bytes[..len]);
        Self {
            len: len as u8,
            bytes,
        }
    }

    pub fn decode_long<B: Buf>(buf: &mut B) -> Result<Self, UnexpectedEnd> {
        if !buf.has_remaining() {
            return Err(UnexpectedEnd);
        }
        let len = buf.get_u8() as usize;
        if len > MAX_CID_SIZE {
            return Err(UnexpectedEnd);
        }
        if buf.remaining() < len {
            return Err(UnexpectedEnd);
        }
        let mut bytes = [0; MAX_CID_SIZE];
        buf.copy_to_slice(&mut bytes[..len]);
        Ok(Self {
            len: len as u8,
            bytes,
        })
    }

    pub fn encode_long<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(self.len);
        buf.put_slice(self);
    }
}

impl Deref for ConnectionId {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.iter() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// An 8-byte stateless reset token, secret between an endpoint and the holder of a CID
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct ResetToken([u8; 16]);

impl ResetToken {
    pub const LEN: usize = 16;

    pub fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, UnexpectedEnd> {
        if buf.remaining() < Self::LEN {
            return Err(UnexpectedEnd);
        }
        let mut bytes = [0; Self::LEN];
        buf.copy_to_slice(&mut bytes);
        Ok(Self(bytes))
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_slice(&self.0);
    }
}

impl AsRef<[u8]> for ResetToken {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for ResetToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResetToken([elided])")
    }
}

/// Generates connection IDs for local use
///
/// Allows applications to embed information in local CIDs, e.g. for stateless load balancers.
/// The default is `RandomConnectionIdGenerator`.
pub trait ConnectionIdGenerator: Send {
    /// Generate a new CID; must not repeat within the endpoint's lifetime with meaningful
    /// probability
    fn generate_cid(&mut self) -> ConnectionId;
    /// Length of CIDs this generator produces
    fn cid_len(&self) -> usize;
    /// How long a CID remains valid for routing after it is retired
    fn cid_lifetime(&self) -> Option<std::time::Duration> {
        None
    }
}

pub struct RandomConnectionIdGenerator {
    len: usize,
}

impl RandomConnectionIdGenerator {
    pub fn new(len: usize) -> Self {
        assert!((MIN_CID_SIZE..=MAX_CID_SIZE).contains(&len));
        Self { len }
    }
}

impl Default for RandomConnectionIdGenerator {
    fn default() -> Self {
        Self::new(8)
    }
}

impl ConnectionIdGenerator for RandomConnectionIdGenerator {
    fn generate_cid(&mut self) -> ConnectionId {
        ConnectionId::random(&mut rand::thread_rng(), self.len)
    }

    fn cid_len(&self) -> usize {
        self.len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let cid = ConnectionId::new(&[1, 2, 3, 4, 5]);
        let mut buf = Vec::new();
        cid.encode_long(&mut buf);
        let mut slice = &buf[..];
        let decoded = ConnectionId::decode_long(&mut slice).unwrap();
        assert_eq!(&*decoded, &[1, 2, 3, 4, 5]);
    }

    #[test]
    fn random_len() {
        let mut gen = RandomConnectionIdGenerator::new(8);
        let cid = gen.generate_cid();
        assert_eq!(cid.len(), 8);
    }
}
