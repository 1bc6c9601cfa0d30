//! Outbound half of a stream: the send queue, the set of byte ranges the peer has acknowledged,
//! and the per-stream flow control limit the spec's Data Model names `out_data_max`/`out_data`.

use std::collections::VecDeque;
use std::ops::Range;

use bytes::Bytes;

use crate::range_set::RangeSet;

/// A buffered chunk of unsent or not-yet-acknowledged outbound data
struct Chunk {
    offset: u64,
    bytes: Bytes,
}

pub struct Send {
    /// Data not yet sent
    queue: VecDeque<Chunk>,
    /// Offset of the first byte not yet written into the queue (next write lands here)
    pub out_data: u64,
    /// Byte ranges the peer has acknowledged; kept as a set rather than a single floor because
    /// ACKs of different packets can arrive in an order other than the offsets they cover.
    acked: RangeSet,
    /// Final stream length, fixed once `finish` is called
    fin_offset: Option<u64>,
    /// Peer-advertised limit on `out_data`
    pub max_data: u64,
    pub fin_sent: bool,
    pub fin_acked: bool,
    pub blocked: bool,
    pub stop_reason: Option<u64>,
}

impl Send {
    pub fn new(max_data: u64) -> Self {
        Self {
            queue: VecDeque::new(),
            out_data: 0,
            acked: RangeSet::new(),
            fin_offset: None,
            max_data,
            fin_sent: false,
            fin_acked: false,
            blocked: false,
            stop_reason: None,
        }
    }

    /// Queue `data` for transmission, respecting the peer's flow-control limit
    ///
    /// Returns the number of bytes actually queued, which may be less than `data.len()` if the
    /// connection or stream is blocked.
    pub fn write(&mut self, data: &[u8]) -> usize {
        let credit = self.max_data.saturating_sub(self.out_data);
        let n = (data.len() as u64).min(credit) as usize;
        if n == 0 {
            self.blocked = !data.is_empty();
            return 0;
        }
        self.blocked = n < data.len();
        self.queue.push_back(Chunk {
            offset: self.out_data,
            bytes: Bytes::copy_from_slice(&data[..n]),
        });
        self.out_data += n as u64;
        n
    }

    /// Mark the stream's final size; if every byte up to it has already been popped for
    /// transmission, queue a zero-length FIN-only chunk so `fin` still rides on a frame (spec
    /// section 4.3: `FIN` may be set on an otherwise-empty `STREAM` frame).
    pub fn finish(&mut self) {
        self.fin_sent = true;
        self.fin_offset = Some(self.out_data);
        if self.queue.is_empty() {
            self.queue.push_back(Chunk {
                offset: self.out_data,
                bytes: Bytes::new(),
            });
        }
    }

    /// Pop up to `max_len` bytes of unsent data starting at the lowest queued offset
    pub fn pop(&mut self, max_len: usize) -> Option<(u64, Bytes)> {
        let chunk = self.queue.front_mut()?;
        let offset = chunk.offset;
        if chunk.bytes.len() <= max_len {
            let chunk = self.queue.pop_front().unwrap();
            Some((chunk.offset, chunk.bytes))
        } else {
            let bytes = chunk.bytes.split_to(max_len);
            chunk.offset += max_len as u64;
            Some((offset, bytes))
        }
    }

    /// Retransmit bytes lost between `offset` and `offset + len`, reinserting them at the front
    /// of the queue in offset order
    pub fn retransmit(&mut self, offset: u64, bytes: Bytes) {
        let pos = self
            .queue
            .iter()
            .position(|c| c.offset > offset)
            .unwrap_or(self.queue.len());
        self.queue.insert(pos, Chunk { offset, bytes });
    }

    pub fn ack(&mut self, offset: u64, len: u64) {
        if len > 0 {
            self.acked.insert(offset..offset + len);
        }
        if let Some(fin_offset) = self.fin_offset {
            if offset + len >= fin_offset {
                self.fin_acked = true;
            }
        }
    }

    /// The sub-ranges of `offset..offset+len` not yet covered by an acknowledgement, for
    /// requeuing only the parts of a lost packet the peer hasn't already confirmed (spec section
    /// 8, scenario 4). `len == 0` identifies a FIN-only frame, which this never reports as a
    /// range to resend; callers must check `fin_acked` for that case instead.
    pub fn unacked_ranges(&self, offset: u64, len: u64) -> Vec<Range<u64>> {
        let end = offset + len;
        let mut out = Vec::new();
        let mut cursor = offset;
        for acked in self.acked.iter() {
            if acked.start >= end {
                break;
            }
            if acked.end <= cursor {
                continue;
            }
            if acked.start > cursor {
                out.push(cursor..acked.start);
            }
            cursor = cursor.max(acked.end);
            if cursor >= end {
                break;
            }
        }
        if cursor < end {
            out.push(cursor..end);
        }
        out
    }

    pub fn is_pending(&self) -> bool {
        !self.queue.is_empty() || (self.fin_sent && !self.fin_acked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finish_after_all_bytes_drained_still_carries_fin() {
        let mut send = Send::new(1 << 20);
        send.write(b"hello");
        send.pop(5).unwrap();
        assert!(!send.is_pending());
        send.finish();
        assert!(send.is_pending());
        let (offset, bytes) = send.pop(16).unwrap();
        assert_eq!(offset, 5);
        assert!(bytes.is_empty());
        // Sent but not yet acknowledged: still pending, so a loss would be retried.
        assert!(send.is_pending());
        send.ack(offset, 0);
        assert!(!send.is_pending());
    }

    #[test]
    fn fin_only_frame_marks_fin_acked() {
        let mut send = Send::new(1 << 20);
        send.write(b"hi");
        send.pop(2).unwrap();
        send.finish();
        send.pop(16).unwrap();
        assert!(!send.fin_acked);
        send.ack(2, 0);
        assert!(send.fin_acked);
        assert!(!send.is_pending());
    }

    #[test]
    fn out_of_order_acks_do_not_mask_an_earlier_loss() {
        let mut send = Send::new(1 << 20);
        send.write(b"helloworld");
        let (o1, c1) = send.pop(5).unwrap();
        let (o2, c2) = send.pop(5).unwrap();
        assert!(!send.unacked_ranges(o1, c1.len() as u64).is_empty());
        // The second half is acknowledged before the first, which must not make the still-lost
        // first half look acked.
        send.ack(o2, c2.len() as u64);
        let gaps = send.unacked_ranges(o1, c1.len() as u64);
        assert_eq!(gaps, vec![o1..o1 + c1.len() as u64]);
    }
}
