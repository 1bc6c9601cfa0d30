//! Stream multiplexing (spec section 3, "Stream"): ordered inbound reassembly, outbound
//! retransmission queueing, and the per-stream/per-connection flow control the spec's Data Model
//! and section 4.6 describe.

mod recv;
mod send;

pub use recv::Recv;
pub use send::Send;

use std::collections::hash_map::Entry;

use fnv::FnvHashMap;

use crate::error::{TransportError, TransportErrorCode};
use crate::Side;

/// A 62-bit stream identifier
///
/// The two low bits encode initiator (client/server) and directionality (bi/uni), per spec
/// section 3.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct StreamId(pub u64);

impl StreamId {
    pub fn new(initiator: Side, dir: Dir, index: u64) -> Self {
        StreamId(index << 2 | (dir as u64) << 1 | initiator as u64)
    }

    pub fn initiator(self) -> Side {
        if self.0 & 0x1 == 0 {
            Side::Client
        } else {
            Side::Server
        }
    }

    pub fn dir(self) -> Dir {
        if self.0 & 0x2 == 0 {
            Dir::Bi
        } else {
            Dir::Uni
        }
    }

    /// The stream's position among others sharing its initiator and directionality
    pub fn index(self) -> u64 {
        self.0 >> 2
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Dir {
    Bi = 0,
    Uni = 1,
}

/// Where a stream sits in its half-close lifecycle (spec section 3)
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum StreamState {
    Idle,
    Open,
    /// Half-closed, local: we've finished sending
    HalfClosedLocal,
    /// Half-closed, remote: the peer has finished sending
    HalfClosedRemote,
    Closed,
}

pub struct Stream {
    pub send: Option<Send>,
    pub recv: Option<Recv>,
    pub state: StreamState,
}

impl Stream {
    fn new_bi(send_window: u64, recv_window: u64) -> Self {
        Self {
            send: Some(Send::new(send_window)),
            recv: Some(Recv::new(recv_window)),
            state: StreamState::Idle,
        }
    }

    fn new_send_only(send_window: u64) -> Self {
        Self {
            send: Some(Send::new(send_window)),
            recv: None,
            state: StreamState::Idle,
        }
    }

    fn new_recv_only(recv_window: u64) -> Self {
        Self {
            send: None,
            recv: Some(Recv::new(recv_window)),
            state: StreamState::Idle,
        }
    }
}

/// Manages every stream of a connection plus the aggregate connection-level flow-control state
pub struct Streams {
    side: Side,
    streams: FnvHashMap<StreamId, Stream>,

    next_bi_local: u64,
    next_uni_local: u64,
    /// Highest index the peer may use, per direction (doubled as credit is consumed, spec 4.6)
    max_bi_remote: u64,
    max_uni_remote: u64,
    /// Highest index we've granted ourselves (peer-facing limit we impose)
    max_bi_local_announced: u64,
    max_uni_local_announced: u64,

    pub data_sent: u64,
    pub data_recvd: u64,
    /// Limit on outgoing data, dictated by the peer's MAX_DATA
    pub max_data: u64,
    /// Limit on incoming data we've advertised to the peer
    pub local_max_data: u64,
    pub blocked: bool,
}

impl Streams {
    /// `max_remote_bi`/`max_remote_uni` are the peer's grant to us, unknown until its transport
    /// parameters (or a later `MAX_STREAMS`) arrive, so callers start those at zero.
    /// `local_announced_bi`/`local_announced_uni` are our own grant to the peer, fixed to
    /// whatever this side advertised in its own transport parameters (spec section 6).
    pub fn new(
        side: Side,
        max_remote_bi: u64,
        max_remote_uni: u64,
        local_max_data: u64,
        local_announced_bi: u64,
        local_announced_uni: u64,
    ) -> Self {
        Self {
            side,
            streams: FnvHashMap::default(),
            next_bi_local: 0,
            next_uni_local: 0,
            max_bi_remote: max_remote_bi,
            max_uni_remote: max_remote_uni,
            max_bi_local_announced: local_announced_bi,
            max_uni_local_announced: local_announced_uni,
            data_sent: 0,
            data_recvd: 0,
            max_data: 0,
            local_max_data,
            blocked: false,
        }
    }

    /// Open a new stream initiated locally
    pub fn open(&mut self, dir: Dir, send_window: u64, recv_window: u64) -> Option<StreamId> {
        let index = match dir {
            Dir::Bi => &mut self.next_bi_local,
            Dir::Uni => &mut self.next_uni_local,
        };
        let remote_limit = match dir {
            Dir::Bi => self.max_bi_remote,
            Dir::Uni => self.max_uni_remote,
        };
        if *index >= remote_limit {
            return None;
        }
        let id = StreamId::new(self.side, dir, *index);
        *index += 1;
        let stream = match dir {
            Dir::Bi => Stream::new_bi(send_window, recv_window),
            Dir::Uni => Stream::new_send_only(send_window),
        };
        self.streams.insert(id, stream);
        Some(id)
    }

    /// Fetch or lazily create a peer-initiated stream, validating it against the negotiated
    /// stream-id ceiling (spec section 4.3: "a stream id greater than the negotiated max ... is
    /// fatal STREAM_ID_ERROR")
    pub fn get_or_open_remote(
        &mut self,
        id: StreamId,
        recv_window: u64,
        send_window: u64,
    ) -> Result<&mut Stream, TransportError> {
        if id.initiator() == self.side {
            // Locally-initiated streams must already exist; absence means it's closed/unknown.
            return self
                .streams
                .get_mut(&id)
                .ok_or_else(|| TransportError::new(TransportErrorCode::StreamState, None, "unknown local stream"));
        }
        let limit = match id.dir() {
            Dir::Bi => self.max_bi_local_announced,
            Dir::Uni => self.max_uni_local_announced,
        };
        if id.index() >= limit {
            return Err(TransportError::new(
                TransportErrorCode::StreamLimit,
                None,
                "stream id exceeds negotiated maximum",
            ));
        }
        match self.streams.entry(id) {
            Entry::Occupied(e) => Ok(e.into_mut()),
            Entry::Vacant(e) => {
                let stream = match id.dir() {
                    Dir::Bi => Stream::new_bi(send_window, recv_window),
                    Dir::Uni => Stream::new_recv_only(recv_window),
                };
                Ok(e.insert(stream))
            }
        }
    }

    pub fn get(&self, id: StreamId) -> Option<&Stream> {
        self.streams.get(&id)
    }

    pub fn get_mut(&mut self, id: StreamId) -> Option<&mut Stream> {
        self.streams.get_mut(&id)
    }

    pub fn remove(&mut self, id: StreamId) {
        self.streams.remove(&id);
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&StreamId, &mut Stream)> {
        self.streams.iter_mut()
    }

    /// Raise `max_bi_local_announced`/`max_uni_local_announced` to grant more peer-initiated
    /// streams, doubling once half of the current limit has been consumed (spec section 4.6)
    pub fn maybe_grant_streams(&mut self, dir: Dir, consumed: u64) -> Option<u64> {
        let limit = match dir {
            Dir::Bi => &mut self.max_bi_local_announced,
            Dir::Uni => &mut self.max_uni_local_announced,
        };
        if consumed * 2 > *limit {
            *limit *= 2;
            Some(*limit)
        } else {
            None
        }
    }

    pub fn max_bi_local_announced(&self) -> u64 {
        self.max_bi_local_announced
    }

    pub fn max_uni_local_announced(&self) -> u64 {
        self.max_uni_local_announced
    }

    /// Raise the ceiling on streams we ourselves may open, on receipt of a peer `MAX_STREAMS`
    pub fn set_max_remote_bi(&mut self, limit: u64) {
        self.max_bi_remote = self.max_bi_remote.max(limit);
    }

    pub fn set_max_remote_uni(&mut self, limit: u64) {
        self.max_uni_remote = self.max_uni_remote.max(limit);
    }

    /// Whether any stream has data queued to send, for the TX path's "anything to write?" check
    pub fn has_pending(&self) -> bool {
        self.streams.values().any(|s| s.send.as_ref().map_or(false, |send| send.is_pending()))
    }
}
