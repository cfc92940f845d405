//! Frame encoding and the outbound send queue. Grounded on the source's `formatMessage`
//! (header length-encoding) and `send`/`sendFragment` (the `FRAGMENT_START`/`FRAGMENT_MID`
//! streaming-send state), plus `messageQueue`/`write_some` for the backpressure queue.
//! Frames built here are always server → client and therefore never masked (RFC 6455
//! §5.1 forbids a server from masking).

use crate::frame::OpCode;
use std::collections::VecDeque;

/// Encodes a complete, unfragmented message as one frame.
pub fn format_message(opcode: OpCode, payload: &[u8]) -> Vec<u8> {
    format_message_reported(opcode, payload, payload.len())
}

/// Builds a frame header that declares `reported_length` as the payload size while only
/// writing `payload`'s bytes into the frame this call — used to start a streaming send
/// whose eventual total size is already known (see `FragmentState`). FIN is always 1: the
/// source never sends a real multi-frame (FIN=0/Continuation) fragmented message, it
/// commits to the total size upfront in a single frame and streams the rest of the bytes
/// in afterward with no further framing.
fn format_message_reported(opcode: OpCode, payload: &[u8], reported_length: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(header_len(reported_length) + payload.len());
    write_header(&mut out, opcode, reported_length, true);
    out.extend_from_slice(payload);
    out
}

/// Builds a `Close` frame carrying the given status code and an optional UTF-8 reason,
/// per RFC 6455 §5.5.1. The source reuses an in-flight buffer for this; here it's always
/// built fresh, since fresh allocation is correct and does not run afoul of the aliasing
/// the source's reused buffer invited.
pub fn format_close(code: u16, reason: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(2 + reason.len());
    payload.extend_from_slice(&code.to_be_bytes());
    payload.extend_from_slice(reason.as_bytes());
    format_message(OpCode::Close, &payload)
}

pub fn format_pong(payload: &[u8]) -> Vec<u8> {
    format_message(OpCode::Pong, payload)
}

pub fn format_ping(payload: &[u8]) -> Vec<u8> {
    format_message(OpCode::Ping, payload)
}

fn header_len(payload_len: usize) -> usize {
    if payload_len < 126 {
        2
    } else if payload_len <= 0xFFFF {
        4
    } else {
        10
    }
}

fn write_header(out: &mut Vec<u8>, opcode: OpCode, payload_len: usize, fin: bool) {
    let first = (fin as u8) << 7 | opcode.as_u8();
    out.push(first);
    if payload_len < 126 {
        out.push(payload_len as u8);
    } else if payload_len <= 0xFFFF {
        out.push(126);
        out.extend_from_slice(&(payload_len as u16).to_be_bytes());
    } else {
        out.push(127);
        out.extend_from_slice(&(payload_len as u64).to_be_bytes());
    }
}

/// Tracks a streaming send's progress, matching the source's `FRAGMENT_START`/
/// `FRAGMENT_MID` states. This is *not* RFC 6455 multi-frame fragmentation (FIN=0 frames
/// chained with `Continuation` opcodes) — the source instead declares the eventual total
/// payload size in a single frame header up front, then streams the remaining bytes in
/// raw, with no header at all, as they become available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FragmentState {
    #[default]
    Start,
    Mid,
}

impl FragmentState {
    pub fn new() -> Self {
        FragmentState::Start
    }

    /// Encodes the next chunk of a streamed send and advances the state, mirroring the
    /// source's `sendFragment(data, length, opCode, remainingBytes)`:
    /// - `Start` with `remaining_bytes > 0`: this is the first chunk of a stream whose
    ///   total size is already known; emits one frame header declaring
    ///   `payload.len() + remaining_bytes` as the length, but carries only `payload` as
    ///   the bytes written this call.
    /// - `Start` with `remaining_bytes == 0`: there was never a second chunk, so this is
    ///   just a complete, ordinary message.
    /// - `Mid` (a header was already sent): `payload` goes out raw, continuing the frame
    ///   already declared — no new header, regardless of `remaining_bytes`.
    ///
    /// `remaining_bytes == 0` always resets the state back to `Start` so the next call
    /// starts a fresh message.
    pub fn send_fragment(&mut self, opcode: OpCode, payload: &[u8], remaining_bytes: usize) -> Vec<u8> {
        let out = match (*self, remaining_bytes) {
            (FragmentState::Start, 0) => format_message(opcode, payload),
            (FragmentState::Start, _) => {
                format_message_reported(opcode, payload, payload.len() + remaining_bytes)
            }
            (FragmentState::Mid, _) => payload.to_vec(),
        };
        *self = if remaining_bytes == 0 {
            FragmentState::Start
        } else {
            FragmentState::Mid
        };
        out
    }
}

/// One queued write: the full buffer plus how much of it has already gone out, so a
/// partial `poll_write` can resume from where it left off instead of re-encoding.
#[derive(Debug)]
pub struct QueuedBytes {
    data: Vec<u8>,
    offset: usize,
}

impl QueuedBytes {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data, offset: 0 }
    }

    pub fn remaining(&self) -> &[u8] {
        &self.data[self.offset..]
    }

    pub fn advance(&mut self, n: usize) {
        self.offset += n;
    }

    pub fn is_drained(&self) -> bool {
        self.offset >= self.data.len()
    }
}

/// FIFO of not-yet-fully-written buffers. An owned `Vec<u8>` per entry rather than the
/// source's raw pointer-arithmetic buffer header: correctness over the extra allocation.
#[derive(Debug, Default)]
pub struct SendQueue {
    queue: VecDeque<QueuedBytes>,
}

impl SendQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, data: Vec<u8>) {
        if !data.is_empty() {
            self.queue.push_back(QueuedBytes::new(data));
        }
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Total bytes across all queued buffers still waiting to go out, exposed to callers
    /// as `Connection::queue_depth` so backpressure is observable rather than opaque.
    pub fn depth(&self) -> usize {
        self.queue.iter().map(|q| q.remaining().len()).sum()
    }

    pub fn front_mut(&mut self) -> Option<&mut QueuedBytes> {
        self.queue.front_mut()
    }

    /// Drops the front entry once fully written. No-op if it isn't drained yet.
    pub fn pop_front_if_drained(&mut self) {
        if matches!(self.queue.front(), Some(q) if q.is_drained()) {
            self.queue.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_payload_gets_a_two_byte_header() {
        let frame = format_message(OpCode::Text, b"hi");
        assert_eq!(frame[0], 0x81); // fin + text
        assert_eq!(frame[1], 2);
        assert_eq!(&frame[2..], b"hi");
    }

    #[test]
    fn payload_at_126_boundary_uses_extended_16_bit_length() {
        let payload = vec![0u8; 126];
        let frame = format_message(OpCode::Binary, &payload);
        assert_eq!(frame[1], 126);
        assert_eq!(&frame[2..4], &126u16.to_be_bytes());
        assert_eq!(frame.len(), 4 + 126);
    }

    #[test]
    fn payload_at_65536_boundary_uses_extended_64_bit_length() {
        let payload = vec![0u8; 65536];
        let frame = format_message(OpCode::Binary, &payload);
        assert_eq!(frame[1], 127);
        assert_eq!(frame.len(), 10 + 65536);
    }

    #[test]
    fn server_frames_are_never_masked() {
        let frame = format_message(OpCode::Text, b"hi");
        assert_eq!(frame[1] & 0x80, 0);
    }

    #[test]
    fn close_frame_carries_code_and_reason() {
        let frame = format_close(1001, "bye");
        // header(2) + code(2) + "bye"
        assert_eq!(frame.len(), 2 + 2 + 3);
        assert_eq!(&frame[2..4], &1001u16.to_be_bytes());
        assert_eq!(&frame[4..], b"bye");
    }

    #[test]
    fn fragmented_send_declares_total_length_once_then_streams_raw_bytes() {
        let mut state = FragmentState::new();

        // First chunk: 3 bytes now, 3 more still to come. The header must declare the
        // eventual total (6), FIN=1, and the real opcode — never Continuation.
        let first = state.send_fragment(OpCode::Text, b"foo", 3);
        assert_eq!(first[0] & 0x0F, OpCode::Text.as_u8());
        assert_eq!(first[0] & 0x80, 0x80); // fin=1, per the source's formatMessage
        assert_eq!(first[1], 6); // reported length, not this call's 3 bytes
        assert_eq!(&first[2..], b"foo");

        // Mid chunk: raw bytes, no header at all.
        let second = state.send_fragment(OpCode::Text, b"ba", 1);
        assert_eq!(second, b"ba");

        // Final chunk: still raw, no header, and the state resets for the next send.
        let third = state.send_fragment(OpCode::Text, b"r", 0);
        assert_eq!(third, b"r");

        let reassembled = [&first[2..], &second[..], &third[..]].concat();
        assert_eq!(reassembled, b"foobar");

        // State reset: a fresh one-shot send is a normal, complete frame again.
        let restarted = state.send_fragment(OpCode::Binary, b"hi", 0);
        assert_eq!(restarted[0] & 0x0F, OpCode::Binary.as_u8());
        assert_eq!(restarted[1], 2);
        assert_eq!(&restarted[2..], b"hi");
    }

    #[test]
    fn send_queue_tracks_partial_writes() {
        let mut queue = SendQueue::new();
        queue.enqueue(vec![1, 2, 3, 4]);
        assert_eq!(queue.depth(), 4);
        {
            let front = queue.front_mut().unwrap();
            assert_eq!(front.remaining(), &[1, 2, 3, 4]);
            front.advance(2);
            assert_eq!(front.remaining(), &[3, 4]);
        }
        assert_eq!(queue.depth(), 2);
        queue.pop_front_if_drained();
        assert_eq!(queue.depth(), 2); // not drained yet, still there

        queue.front_mut().unwrap().advance(2);
        queue.pop_front_if_drained();
        assert!(queue.is_empty());
    }
}
