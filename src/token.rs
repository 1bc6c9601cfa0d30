//! Retry and `NEW_TOKEN` address-validation tokens (spec section 8, scenario 3; spec section
//! 4.3, frame `0x07`).
//!
//! Both token kinds are opaque to the peer and self-verifying: rather than keep server-side
//! state per outstanding Retry, the server folds the client's address and (for Retry) the scid
//! it committed to into a keyed hash, and re-derives the same hash when the token comes back on
//! a later Initial. `commit` is a per-endpoint secret fed into every derivation so tokens from a
//! restarted process don't validate against a new one.

use std::net::SocketAddr;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::cid::ConnectionId;
use crate::crypto::HmacKey;

const DIGEST_LEN: usize = 32;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Kind {
    Retry,
    NewToken,
}

impl Kind {
    fn tag(self) -> u8 {
        match self {
            Kind::Retry => 0,
            Kind::NewToken => 1,
        }
    }
}

fn digest(commit: &HmacKey, kind: Kind, peer: SocketAddr, extra: &[u8]) -> [u8; DIGEST_LEN] {
    let mut input = Vec::with_capacity(1 + 32 + extra.len());
    input.push(kind.tag());
    match peer {
        SocketAddr::V4(a) => {
            input.extend_from_slice(&a.ip().octets());
            input.extend_from_slice(&a.port().to_be_bytes());
        }
        SocketAddr::V6(a) => {
            input.extend_from_slice(&a.ip().octets());
            input.extend_from_slice(&a.port().to_be_bytes());
        }
    }
    input.extend_from_slice(extra);
    let tag = commit.sign(&input);
    let mut out = [0u8; DIGEST_LEN];
    out.copy_from_slice(tag.as_ref());
    out
}

/// A Retry token: `SHA256(commit || peer || scid) || scid` (spec section 8, scenario 3), where
/// `scid` is the server-chosen connection ID the client is told to use as its next Initial's
/// destination CID.
pub struct RetryToken;

impl RetryToken {
    pub fn generate(commit: &HmacKey, peer: SocketAddr, scid: &ConnectionId) -> Bytes {
        let hash = digest(commit, Kind::Retry, peer, scid);
        let mut buf = BytesMut::with_capacity(DIGEST_LEN + scid.len());
        buf.put_slice(&hash);
        buf.put_slice(scid);
        buf.freeze()
    }

    /// Verify `token` was issued by this endpoint to `peer`, returning the scid it commits to
    pub fn validate(commit: &HmacKey, peer: SocketAddr, mut token: Bytes) -> Option<ConnectionId> {
        if token.remaining() < DIGEST_LEN {
            return None;
        }
        let mut claimed = [0u8; DIGEST_LEN];
        token.copy_to_slice(&mut claimed);
        let scid = ConnectionId::new(&token);
        let expected = digest(commit, Kind::Retry, peer, &scid);
        // Constant-time-ish compare isn't load-bearing here (the whole token is already a MAC
        // the attacker can't forge without `commit`), but avoid a data-dependent early-out.
        if claimed == expected {
            Some(scid)
        } else {
            None
        }
    }
}

/// A `NEW_TOKEN` token: address validation carried across connections, with no embedded CID.
pub struct NewToken;

impl NewToken {
    pub fn generate(commit: &HmacKey, peer: SocketAddr) -> Bytes {
        let hash = digest(commit, Kind::NewToken, peer, &[]);
        Bytes::copy_from_slice(&hash)
    }

    pub fn validate(commit: &HmacKey, peer: SocketAddr, token: &[u8]) -> bool {
        if token.len() != DIGEST_LEN {
            return false;
        }
        let expected = digest(commit, Kind::NewToken, peer, &[]);
        token == expected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:4434".parse().unwrap()
    }

    #[test]
    fn retry_token_round_trips() {
        let commit = HmacKey::new(b"server secret");
        let scid = ConnectionId::new(&[9, 8, 7, 6]);
        let token = RetryToken::generate(&commit, addr(), &scid);
        let recovered = RetryToken::validate(&commit, addr(), token).unwrap();
        assert_eq!(&*recovered, &*scid);
    }

    #[test]
    fn retry_token_rejects_wrong_peer() {
        let commit = HmacKey::new(b"server secret");
        let scid = ConnectionId::new(&[1, 2, 3, 4]);
        let token = RetryToken::generate(&commit, addr(), &scid);
        let other: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        assert!(RetryToken::validate(&commit, other, token).is_none());
    }

    #[test]
    fn new_token_round_trips() {
        let commit = HmacKey::new(b"server secret");
        let token = NewToken::generate(&commit, addr());
        assert!(NewToken::validate(&commit, addr(), &token));
    }
}
