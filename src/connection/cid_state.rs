//! Connection-ID management and path migration (spec section 4.5).
//!
//! Each endpoint tracks two ordered-by-sequence sets: the CIDs it has issued to the peer
//! (`local`, indexed so the peer can address us) and the CIDs the peer has issued to us
//! (`remote`, which we use as the active destination CID). Exactly one entry in each set is
//! "active" at a time.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Instant;

use rand::RngCore;

use crate::cid::{ConnectionId, ResetToken};
use crate::error::{TransportError, TransportErrorCode};

#[derive(Debug, Clone)]
struct IssuedCid {
    id: ConnectionId,
    reset_token: ResetToken,
    retired: bool,
}

/// The set of CIDs one side has issued, ordered by sequence number
pub struct CidSet {
    by_seq: BTreeMap<u64, IssuedCid>,
    active_seq: u64,
    /// Highest sequence number ever issued/accepted
    max_seq: u64,
    retire_prior_to: u64,
}

impl CidSet {
    fn new(first: ConnectionId, first_token: ResetToken) -> Self {
        let mut by_seq = BTreeMap::new();
        by_seq.insert(
            0,
            IssuedCid {
                id: first,
                reset_token: first_token,
                retired: false,
            },
        );
        Self {
            by_seq,
            active_seq: 0,
            max_seq: 0,
            retire_prior_to: 0,
        }
    }

    pub fn active(&self) -> &ConnectionId {
        &self.by_seq[&self.active_seq].id
    }

    pub fn active_reset_token(&self) -> &ResetToken {
        &self.by_seq[&self.active_seq].reset_token
    }

    pub fn active_seq(&self) -> u64 {
        self.active_seq
    }

    /// Insert a CID received via `NEW_CONNECTION_ID`, ignoring exact duplicates. Returns the
    /// sequence numbers newly retired by `retire_prior_to` (RFC 9000 section 5.1.2: the peer may
    /// raise this floor at any time, and every CID below it must be retired and announced with
    /// `RETIRE_CONNECTION_ID`), switching the active CID away from one of them if needed.
    pub fn insert(
        &mut self,
        seq: u64,
        retire_prior_to: u64,
        id: ConnectionId,
        reset_token: ResetToken,
        limit: u64,
    ) -> Result<Vec<u64>, TransportError> {
        if self.by_seq.contains_key(&seq) {
            return Ok(Vec::new()); // duplicate NEW_CONNECTION_ID, accepted silently (spec section 4.5)
        }
        self.by_seq.insert(
            seq,
            IssuedCid {
                id,
                reset_token,
                retired: false,
            },
        );
        self.max_seq = self.max_seq.max(seq);
        self.retire_prior_to = self.retire_prior_to.max(retire_prior_to);

        let cutoff = self.retire_prior_to;
        let mut newly_retired = Vec::new();
        for (&s, cid) in self.by_seq.iter_mut() {
            if s < cutoff && !cid.retired {
                cid.retired = true;
                newly_retired.push(s);
            }
        }
        if newly_retired.contains(&self.active_seq) {
            if let Some((&next_seq, _)) = self.by_seq.iter().find(|(_, c)| !c.retired) {
                self.active_seq = next_seq;
            }
        }

        let active = self.by_seq.len() as u64 - self.retired_count();
        if active > limit {
            return Err(TransportError::new(
                TransportErrorCode::ProtocolViolation,
                None,
                "active_connection_id_limit exceeded",
            ));
        }
        Ok(newly_retired)
    }

    fn retired_count(&self) -> u64 {
        self.by_seq.values().filter(|c| c.retired).count() as u64
    }

    /// Mark a sequence number retired (on our own initiative, or because the peer sent
    /// `retire_prior_to` covering it); if it was active, switch to the next-lowest live entry.
    pub fn retire(&mut self, seq: u64) -> Option<ConnectionId> {
        let was_active = seq == self.active_seq;
        if let Some(cid) = self.by_seq.get_mut(&seq) {
            cid.retired = true;
        }
        if was_active {
            if let Some((&next_seq, _)) = self.by_seq.iter().find(|(_, c)| !c.retired) {
                self.active_seq = next_seq;
                return Some(self.active().clone_for_retire());
            }
        }
        None
    }

    /// Whether another live (non-active, non-retired) CID exists to migrate to
    pub fn next_available(&self) -> Option<u64> {
        self.by_seq
            .iter()
            .find(|(&seq, c)| seq != self.active_seq && !c.retired)
            .map(|(&seq, _)| seq)
    }

    pub fn switch_active(&mut self, seq: u64) {
        debug_assert!(self.by_seq.contains_key(&seq));
        self.active_seq = seq;
    }

    pub fn find_by_token(&self, token: &ResetToken) -> bool {
        self.by_seq.values().any(|c| &c.reset_token == token)
    }

    /// Record a CID this side has handed out, returning its sequence number so the caller can
    /// enqueue `NEW_CONNECTION_ID`
    fn issue(&mut self, id: ConnectionId, reset_token: ResetToken) -> u64 {
        let seq = self.max_seq + 1;
        self.max_seq = seq;
        self.by_seq.insert(seq, IssuedCid { id, reset_token, retired: false });
        seq
    }

    /// Look up the `(id, reset_token)` pair issued at `seq`, for encoding `NEW_CONNECTION_ID`
    pub fn get(&self, seq: u64) -> Option<(ConnectionId, ResetToken)> {
        self.by_seq.get(&seq).map(|c| (c.id, c.reset_token))
    }

    /// How many CIDs this side has issued that aren't yet retired
    pub fn live_count(&self) -> u64 {
        self.by_seq.len() as u64 - self.retired_count()
    }
}

impl ConnectionId {
    fn clone_for_retire(&self) -> ConnectionId {
        *self
    }
}

impl PartialEq for ResetToken {
    fn eq(&self, other: &Self) -> bool {
        self.as_ref() == other.as_ref()
    }
}
impl Eq for ResetToken {}

/// Path-validation state for an address the connection has not yet confirmed (spec section 4.5)
pub struct PathChallengeState {
    pub challenge: [u8; 8],
    pub sent_at: Instant,
    /// Bytes permitted to the unvalidated peer address, 3x the packet that triggered validation
    pub amplification_limit: u64,
    pub bytes_sent: u64,
}

/// Owns both CID sets plus in-progress migration/path-validation state for a connection
pub struct CidState {
    pub local: CidSet,
    pub remote: CidSet,
    pub migrating_peer: Option<SocketAddr>,
    pub path_challenge: Option<PathChallengeState>,
    /// Highest packet number seen from the current peer address; used to detect migration
    pub highest_pn_from_peer: u64,
}

impl CidState {
    pub fn new(
        local_first: ConnectionId,
        local_token: ResetToken,
        remote_first: ConnectionId,
        remote_token: ResetToken,
    ) -> Self {
        Self {
            local: CidSet::new(local_first, local_token),
            remote: CidSet::new(remote_first, remote_token),
            migrating_peer: None,
            path_challenge: None,
            highest_pn_from_peer: 0,
        }
    }

    /// Record a CID this side has handed out (generated by the endpoint, which owns the
    /// generator and reset-token key shared across every connection), returning its sequence
    /// number so the caller can enqueue `NEW_CONNECTION_ID`
    pub fn issue_local(&mut self, id: ConnectionId, reset_token: ResetToken) -> u64 {
        self.local.issue(id, reset_token)
    }

    /// How many local CIDs are issued and not yet retired, for comparing against the peer's
    /// `active_connection_id_limit`
    pub fn local_live_count(&self) -> u64 {
        self.local.live_count()
    }

    /// On receiving data from a new source address with a higher packet number than any seen
    /// before, begin path validation (spec section 4.5)
    pub fn begin_migration(&mut self, from: SocketAddr, pn: u64, triggering_len: u64, now: Instant) {
        if pn <= self.highest_pn_from_peer {
            return;
        }
        self.migrating_peer = Some(from);
        let mut challenge = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut challenge);
        self.path_challenge = Some(PathChallengeState {
            challenge,
            sent_at: now,
            amplification_limit: triggering_len * 3,
            bytes_sent: 0,
        });
    }

    /// A matching `PATH_RESPONSE` arrived: commit the migration
    pub fn confirm_migration(&mut self, response: [u8; 8]) -> Option<SocketAddr> {
        let matches = self.path_challenge.as_ref().map_or(false, |c| c.challenge == response);
        if !matches {
            return None;
        }
        self.path_challenge = None;
        self.migrating_peer.take()
    }

    /// Whether `amount` more bytes may be sent to the address currently under validation
    pub fn path_validation_permits(&self, amount: u64) -> bool {
        match &self.path_challenge {
            Some(c) => c.bytes_sent + amount <= c.amplification_limit,
            None => true,
        }
    }

    pub fn record_path_validation_send(&mut self, amount: u64) {
        if let Some(c) = &mut self.path_challenge {
            c.bytes_sent += amount;
        }
    }
}
