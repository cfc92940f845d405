//! The resumable frame parser: a state machine over
//! `FirstByte -> Len1 -> [LenExt16 | LenExt64] -> [MaskKey x4] -> Payload -> FirstByte`
//! that consumes whatever byte chunk the transport handed it, and leaves any partial
//! header in `spill` for the next `consume` call. This is what lets the connection feed
//! it arbitrary TCP read boundaries without ever having to buffer a whole frame first.

use crate::error::Error;
use crate::frame::{OpCode, MAX_HEADER_SIZE};

/// Receives parsed fragments from `FrameParser::consume`. `MessageAssembler` is the only
/// real implementor, but the trait keeps the parser testable without an assembler.
pub trait FrameSink {
    fn on_fragment(
        &mut self,
        opcode: OpCode,
        payload: &mut [u8],
        fin: bool,
        remaining_in_frame: usize,
        compressed: bool,
    ) -> Result<(), Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    FirstByte,
    Len1,
    LenExt16,
    LenExt64,
    MaskKey,
    Payload,
}

pub struct FrameParser {
    state: State,
    fin: bool,
    rsv1: bool,
    opcode: OpCode,
    masked: bool,
    len7: u8,
    ext_len_buf: [u8; 8],
    ext_len_read: u8,
    ext_len_needed: u8,
    remaining_payload: u64,
    mask_key: [u8; 4],
    mask_read: u8,
    mask_offset: usize,
    /// `true` while a multi-frame data message is in progress (saw a data frame with
    /// `fin == false`, haven't yet seen its terminating continuation frame).
    message_in_progress: bool,
    /// Unconsumed header bytes carried across `consume` calls.
    spill: [u8; MAX_HEADER_SIZE],
    spill_len: usize,
    permessage_deflate_negotiated: bool,
    max_frame_size: Option<usize>,
}

impl FrameParser {
    pub fn new(permessage_deflate_negotiated: bool, max_frame_size: Option<usize>) -> Self {
        Self {
            state: State::FirstByte,
            fin: false,
            rsv1: false,
            opcode: OpCode::Continuation,
            masked: false,
            len7: 0,
            ext_len_buf: [0; 8],
            ext_len_read: 0,
            ext_len_needed: 0,
            remaining_payload: 0,
            mask_key: [0; 4],
            mask_read: 0,
            mask_offset: 0,
            message_in_progress: false,
            spill: [0; MAX_HEADER_SIZE],
            spill_len: 0,
            permessage_deflate_negotiated,
            max_frame_size,
        }
    }

    /// Consumes `input` (mutated in place: payload bytes are unmasked as they're
    /// recognized), driving `sink.on_fragment` for every complete chunk it can emit.
    /// Any bytes left over mid-header are copied into the internal spill buffer and
    /// will be processed before new input the next time `consume` is called.
    pub fn consume(&mut self, input: &mut [u8], sink: &mut dyn FrameSink) -> Result<(), Error> {
        // Prepend spill: copy it in front of `input` using a local combined buffer only
        // when non-empty, to avoid extra allocation/copies on the common fast path.
        if self.spill_len > 0 {
            let mut combined = Vec::with_capacity(self.spill_len + input.len());
            combined.extend_from_slice(&self.spill[..self.spill_len]);
            combined.extend_from_slice(input);
            self.spill_len = 0;
            return self.consume_owned(combined, sink);
        }
        self.consume_slice(input, sink)
    }

    fn consume_owned(&mut self, mut buf: Vec<u8>, sink: &mut dyn FrameSink) -> Result<(), Error> {
        self.consume_slice(&mut buf, sink)
    }

    fn consume_slice(&mut self, input: &mut [u8], sink: &mut dyn FrameSink) -> Result<(), Error> {
        let mut i = 0usize;
        let len = input.len();

        'outer: while i < len {
            match self.state {
                State::FirstByte => {
                    let b = input[i];
                    i += 1;
                    self.fin = b & 0b1000_0000 != 0;
                    self.rsv1 = b & 0b0100_0000 != 0;
                    let rsv2 = b & 0b0010_0000 != 0;
                    let rsv3 = b & 0b0001_0000 != 0;
                    if rsv2 || rsv3 || (self.rsv1 && !self.permessage_deflate_negotiated) {
                        return Err(Error::RSVNotZero);
                    }
                    self.opcode = OpCode::from_byte(b & 0b0000_1111)?;
                    if !self.fin && self.opcode.is_control() {
                        return Err(Error::ControlFramesFragmented);
                    }
                    self.state = State::Len1;
                }
                State::Len1 => {
                    let b = input[i];
                    i += 1;
                    self.masked = b & 0b1000_0000 != 0;
                    if !self.masked {
                        return Err(Error::UnmaskedClientFrame);
                    }
                    self.len7 = b & 0b0111_1111;
                    if self.len7 > 125 && self.opcode.is_control() {
                        return Err(Error::ControlFramePayloadSize);
                    }
                    match self.len7 {
                        126 => {
                            self.ext_len_needed = 2;
                            self.ext_len_read = 0;
                            self.state = State::LenExt16;
                        }
                        127 => {
                            self.ext_len_needed = 8;
                            self.ext_len_read = 0;
                            self.state = State::LenExt64;
                        }
                        n => {
                            self.remaining_payload = n as u64;
                            self.after_length()?;
                        }
                    }
                }
                State::LenExt16 | State::LenExt64 => {
                    while self.ext_len_read < self.ext_len_needed && i < len {
                        self.ext_len_buf[self.ext_len_read as usize] = input[i];
                        self.ext_len_read += 1;
                        i += 1;
                    }
                    if self.ext_len_read < self.ext_len_needed {
                        break 'outer; // need more bytes; spill below
                    }
                    self.remaining_payload = if self.ext_len_needed == 2 {
                        u16::from_be_bytes([self.ext_len_buf[0], self.ext_len_buf[1]]) as u64
                    } else {
                        u64::from_be_bytes(self.ext_len_buf)
                    };
                    self.after_length()?;
                }
                State::MaskKey => {
                    while self.mask_read < 4 && i < len {
                        self.mask_key[self.mask_read as usize] = input[i];
                        self.mask_read += 1;
                        i += 1;
                    }
                    if self.mask_read < 4 {
                        break 'outer;
                    }
                    self.mask_offset = 0;
                    self.state = State::Payload;
                    // Fragmentation bookkeeping depends only on this frame's header
                    // (opcode, fin) and is decided exactly once here, before any of its
                    // payload is delivered — checking it again per payload chunk would
                    // misfire on a single large frame streamed across several `consume`
                    // calls, rejecting its own later chunks as "already in progress".
                    self.begin_frame()?;
                    if self.remaining_payload == 0 {
                        self.emit_empty_frame(sink)?;
                    }
                }
                State::Payload => {
                    let available = (len - i) as u64;
                    let take = available.min(self.remaining_payload) as usize;
                    let chunk = &mut input[i..i + take];
                    for b in chunk.iter_mut() {
                        *b ^= self.mask_key[self.mask_offset % 4];
                        self.mask_offset += 1;
                    }
                    i += take;
                    self.remaining_payload -= take as u64;
                    let remaining_in_frame = self.remaining_payload as usize;
                    let fin = self.fin;
                    let opcode = self.opcode;
                    let compressed = self.rsv1;

                    sink.on_fragment(opcode, chunk, fin, remaining_in_frame, compressed)?;

                    if remaining_in_frame == 0 {
                        self.state = State::FirstByte;
                    }
                }
            }
        }

        // Anything left in `input` past this point is a partial header; stash it.
        if i < len {
            let remaining = &input[i..];
            debug_assert!(remaining.len() <= MAX_HEADER_SIZE);
            self.spill[..remaining.len()].copy_from_slice(remaining);
            self.spill_len = remaining.len();
        }

        Ok(())
    }

    fn after_length(&mut self) -> Result<(), Error> {
        if let Some(max) = self.max_frame_size {
            if self.remaining_payload as usize > max {
                return Err(Error::CustomFragmentSizeExceeded(
                    self.remaining_payload as usize,
                    max,
                ));
            }
        }
        self.mask_read = 0;
        self.state = State::MaskKey;
        Ok(())
    }

    /// Runs once per frame, right as its header finishes parsing (before any payload is
    /// delivered to the sink): validates this frame's opcode against whatever
    /// fragmented-message state is already open, and updates that state. `fin`/`opcode`
    /// are fixed for the whole frame, so this never needs to re-run per payload chunk.
    fn begin_frame(&mut self) -> Result<(), Error> {
        if self.opcode.is_data() {
            if self.opcode != OpCode::Continuation {
                if !self.fin && self.message_in_progress {
                    return Err(Error::FragmentedInProgress);
                }
                if self.fin && self.message_in_progress {
                    return Err(Error::InvalidFrameFragmentation);
                }
                if !self.fin {
                    self.message_in_progress = true;
                }
            } else if !self.message_in_progress {
                return Err(Error::InvalidContinuationFrame);
            }
            if self.fin {
                self.message_in_progress = false;
            }
        }
        Ok(())
    }

    fn emit_empty_frame(&mut self, sink: &mut dyn FrameSink) -> Result<(), Error> {
        let fin = self.fin;
        let opcode = self.opcode;
        let compressed = self.rsv1;
        sink.on_fragment(opcode, &mut [], fin, 0, compressed)?;
        self.state = State::FirstByte;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Default)]
    struct RecordingSink {
        events: Vec<(OpCode, Vec<u8>, bool, usize, bool)>,
    }

    impl FrameSink for RecordingSink {
        fn on_fragment(
            &mut self,
            opcode: OpCode,
            payload: &mut [u8],
            fin: bool,
            remaining_in_frame: usize,
            compressed: bool,
        ) -> Result<(), Error> {
            self.events
                .push((opcode, payload.to_vec(), fin, remaining_in_frame, compressed));
            Ok(())
        }
    }

    fn masked_frame(fin: bool, opcode: OpCode, payload: &[u8], mask: [u8; 4]) -> Vec<u8> {
        let mut out = Vec::new();
        let first = (fin as u8) << 7 | opcode.as_u8();
        out.push(first);
        let len = payload.len();
        if len < 126 {
            out.push(0x80 | len as u8);
        } else if len <= 0xFFFF {
            out.push(0x80 | 126);
            out.extend_from_slice(&(len as u16).to_be_bytes());
        } else {
            out.push(0x80 | 127);
            out.extend_from_slice(&(len as u64).to_be_bytes());
        }
        out.extend_from_slice(&mask);
        for (idx, b) in payload.iter().enumerate() {
            out.push(b ^ mask[idx % 4]);
        }
        out
    }

    #[test]
    fn tiny_text_single_chunk() {
        let mut bytes = masked_frame(true, OpCode::Text, b"hi", [0x11, 0x22, 0x33, 0x44]);
        let mut parser = FrameParser::new(false, None);
        let mut sink = RecordingSink::default();
        parser.consume(&mut bytes, &mut sink).unwrap();
        assert_eq!(sink.events.len(), 1);
        assert_eq!(sink.events[0].0, OpCode::Text);
        assert_eq!(sink.events[0].1, b"hi");
        assert!(sink.events[0].2);
    }

    #[test]
    fn fragmented_text_across_reads() {
        let mut first = masked_frame(false, OpCode::Text, b"foo", [1, 2, 3, 4]);
        let mut second = masked_frame(true, OpCode::Continuation, b"ba", [5, 6, 7, 8]);

        let mut parser = FrameParser::new(false, None);
        let mut sink = RecordingSink::default();
        parser.consume(&mut first, &mut sink).unwrap();
        parser.consume(&mut second, &mut sink).unwrap();

        assert_eq!(sink.events.len(), 2);
        assert_eq!(sink.events[0].1, b"foo");
        assert!(!sink.events[0].2);
        assert_eq!(sink.events[1].1, b"ba");
        assert!(sink.events[1].2);
    }

    #[test]
    fn large_single_frame_streamed_across_many_reads_is_not_a_new_fragment() {
        // fin=false on a single still-open frame, with its own payload (not a later
        // continuation frame) split across several `consume` calls. Each later chunk
        // shares the same opcode as the first, which must not be mistaken for a second
        // data frame arriving while one is already in progress.
        let whole = masked_frame(false, OpCode::Binary, b"the quick brown fox jumps", [4, 5, 6, 7]);
        let mut parser = FrameParser::new(false, None);
        let mut sink = RecordingSink::default();

        // Split the header (first 6 bytes: byte0, byte1, mask x4) away from the payload,
        // then split the payload itself into three more pieces.
        let header_len = 6;
        let (header, payload) = whole.split_at(header_len);
        let third = payload.len() / 3;
        let mut p1 = header.to_vec();
        let mut p2 = payload[..third].to_vec();
        let mut p3 = payload[third..2 * third].to_vec();
        let mut p4 = payload[2 * third..].to_vec();

        parser.consume(&mut p1, &mut sink).unwrap();
        parser.consume(&mut p2, &mut sink).unwrap();
        parser.consume(&mut p3, &mut sink).unwrap();
        parser.consume(&mut p4, &mut sink).unwrap();

        let reconstructed: Vec<u8> = sink.events.iter().flat_map(|e| e.1.clone()).collect();
        assert_eq!(reconstructed, b"the quick brown fox jumps");
        // Still mid-message: the frame itself had fin == false.
        assert!(!sink.events.last().unwrap().2);

        // A genuinely new data frame arriving while this one is still open is rejected.
        let mut bogus = masked_frame(true, OpCode::Text, b"x", [1, 1, 1, 1]);
        assert!(parser.consume(&mut bogus, &mut sink).is_err());
    }

    #[test]
    fn chunking_invariance_for_arbitrary_splits() {
        let whole = masked_frame(true, OpCode::Binary, b"the quick brown fox", [9, 8, 7, 6]);

        let baseline = Rc::new(RefCell::new(RecordingSink::default()));
        {
            let mut p = FrameParser::new(false, None);
            let mut w = whole.clone();
            p.consume(&mut w, &mut *baseline.borrow_mut()).unwrap();
        }

        for split in 1..whole.len() {
            let mut parser = FrameParser::new(false, None);
            let mut sink = RecordingSink::default();
            let (mut a, mut b) = (whole[..split].to_vec(), whole[split..].to_vec());
            parser.consume(&mut a, &mut sink).unwrap();
            parser.consume(&mut b, &mut sink).unwrap();

            let baseline_ref = baseline.borrow();
            let reconstructed: Vec<u8> = sink.events.iter().flat_map(|e| e.1.clone()).collect();
            let expected: Vec<u8> = baseline_ref.events.iter().flat_map(|e| e.1.clone()).collect();
            assert_eq!(reconstructed, expected, "mismatch splitting at byte {split}");
        }
    }

    #[test]
    fn rejects_unmasked_client_frame() {
        let mut bytes = vec![0x81, 0x02, b'h', b'i'];
        let mut parser = FrameParser::new(false, None);
        let mut sink = RecordingSink::default();
        assert!(parser.consume(&mut bytes, &mut sink).is_err());
    }

    #[test]
    fn rejects_fragmented_control_frame() {
        let mut bytes = masked_frame(false, OpCode::Ping, b"", [1, 1, 1, 1]);
        let mut parser = FrameParser::new(false, None);
        let mut sink = RecordingSink::default();
        assert!(parser.consume(&mut bytes, &mut sink).is_err());
    }

    #[test]
    fn oversized_text_with_16_bit_length() {
        let payload = vec![b'A'; 300];
        let mut bytes = masked_frame(true, OpCode::Text, &payload, [1, 2, 3, 4]);
        assert_eq!(&bytes[0..4], &[0x81, 0xFE, 0x01, 0x2C]);
        let mut parser = FrameParser::new(false, None);
        let mut sink = RecordingSink::default();
        parser.consume(&mut bytes, &mut sink).unwrap();
        assert_eq!(sink.events[0].1.len(), 300);
    }

    #[test]
    fn ping_pong_empty_payload() {
        let mut bytes = masked_frame(true, OpCode::Ping, b"", [0, 0, 0, 0]);
        let mut parser = FrameParser::new(false, None);
        let mut sink = RecordingSink::default();
        parser.consume(&mut bytes, &mut sink).unwrap();
        assert_eq!(sink.events.len(), 1);
        assert_eq!(sink.events[0].0, OpCode::Ping);
        assert!(sink.events[0].1.is_empty());
    }
}
