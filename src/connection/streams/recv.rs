//! Inbound half of a stream: ordered reassembly from out-of-order `STREAM`/`CRYPTO` data (spec
//! section 4.3, "Ordered delivery within a stream uses DIET-style merging on the OOO set keyed by
//! `off`").

use std::collections::{BTreeMap, VecDeque};

use bytes::Bytes;

use crate::range_set::RangeSet;

pub struct Recv {
    /// Bytes delivered in order and ready for the application to read
    in_order: VecDeque<u8>,
    /// Out-of-order chunks, keyed by their starting offset; covered ranges never overlap
    ooo: BTreeMap<u64, Bytes>,
    /// Which byte ranges have been received at all (used to detect overlap/duplication)
    received: RangeSet,
    /// Next expected in-order offset
    pub in_data_off: u64,
    /// Limit we've advertised to the peer
    pub max_data: u64,
    pub fin_offset: Option<u64>,
    pub fin_delivered: bool,
}

impl Recv {
    pub fn new(max_data: u64) -> Self {
        Self {
            in_order: VecDeque::new(),
            ooo: BTreeMap::new(),
            received: RangeSet::new(),
            in_data_off: 0,
            max_data,
            fin_offset: None,
            fin_delivered: false,
        }
    }

    /// Insert a chunk of stream data received at `offset`, with `fin` set if it is the stream's
    /// final frame
    ///
    /// Returns `Ok(new_bytes)` where `new_bytes` counts bytes not previously received (used to
    /// update connection/stream flow-control accounting); data entirely behind `in_data_off` or
    /// fully duplicate is accepted as a no-op.
    pub fn ingest(&mut self, offset: u64, data: Bytes, fin: bool) -> u64 {
        let end = offset + data.len() as u64;

        if fin {
            self.fin_offset = Some(end);
        }

        // An empty STREAM frame with FIN delivers FIN and no bytes; one without FIN is ignored
        // (spec section 8, Boundary behaviors).
        if data.is_empty() {
            self.try_deliver_fin();
            return 0;
        }

        if end <= self.in_data_off {
            // Entirely behind the delivered cursor: duplicate, dropped silently.
            return 0;
        }

        let query_start = offset.max(self.in_data_off);
        let already_covered = self.received.count_covered(query_start..end);
        let was_new = self.received.insert(query_start..end);
        if !was_new {
            return 0;
        }
        let new_bytes = (end - query_start) - already_covered;

        if offset <= self.in_data_off {
            // Extends the in-order frontier directly.
            let skip = (self.in_data_off - offset) as usize;
            self.in_order.extend(&data[skip..]);
            self.in_data_off = end;
            self.splice_contiguous_ooo();
        } else {
            self.ooo.insert(offset, data);
        }

        self.try_deliver_fin();
        new_bytes
    }

    /// Once `in_data_off` advances, pull in any out-of-order entries that are now contiguous
    fn splice_contiguous_ooo(&mut self) {
        loop {
            let Some((&start, _)) = self.ooo.range(..=self.in_data_off).next_back() else {
                break;
            };
            if start > self.in_data_off {
                break;
            }
            let data = self.ooo.remove(&start).unwrap();
            let chunk_end = start + data.len() as u64;
            if chunk_end <= self.in_data_off {
                // Fully behind the frontier now; drop.
                continue;
            }
            let skip = (self.in_data_off - start) as usize;
            self.in_order.extend(&data[skip..]);
            self.in_data_off = chunk_end;
        }
        // Drop any OOO entries now fully behind the frontier.
        self.ooo.retain(|&start, data| start + (data.len() as u64) > self.in_data_off);
    }

    fn try_deliver_fin(&mut self) {
        if let Some(fin) = self.fin_offset {
            if !self.fin_delivered && self.in_data_off >= fin {
                self.fin_delivered = true;
            }
        }
    }

    /// Read up to `buf.len()` in-order bytes, returning how many were copied
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.in_order.len());
        for slot in buf.iter_mut().take(n) {
            *slot = self.in_order.pop_front().unwrap();
        }
        n
    }

    pub fn has_data(&self) -> bool {
        !self.in_order.is_empty()
    }

    pub fn is_finished(&self) -> bool {
        self.fin_delivered && self.in_order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_order_delivery() {
        let mut recv = Recv::new(1 << 20);
        recv.ingest(0, Bytes::from_static(b"hello"), false);
        assert_eq!(recv.in_data_off, 5);
        let mut buf = [0u8; 5];
        assert_eq!(recv.read(&mut buf), 5);
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn out_of_order_splice() {
        let mut recv = Recv::new(1 << 20);
        recv.ingest(5, Bytes::from_static(b"world"), false);
        assert_eq!(recv.in_data_off, 0);
        assert!(!recv.has_data());
        recv.ingest(0, Bytes::from_static(b"hello"), false);
        assert_eq!(recv.in_data_off, 10);
        let mut buf = [0u8; 10];
        recv.read(&mut buf);
        assert_eq!(&buf, b"helloworld");
    }

    #[test]
    fn duplicate_is_noop() {
        let mut recv = Recv::new(1 << 20);
        assert_eq!(recv.ingest(0, Bytes::from_static(b"hello"), false), 5);
        assert_eq!(recv.ingest(0, Bytes::from_static(b"hello"), false), 0);
        assert_eq!(recv.in_data_off, 5);
    }

    #[test]
    fn empty_fin_delivers_fin_only() {
        let mut recv = Recv::new(1 << 20);
        recv.ingest(0, Bytes::from_static(b"hi"), false);
        assert!(!recv.is_finished());
        recv.ingest(2, Bytes::new(), true);
        assert!(recv.is_finished());
    }
}
