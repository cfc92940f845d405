//! Turns the parser's per-frame fragments into whole messages: accumulates fragmented
//! data frames, inflates compressed ones, validates `Text` payloads as UTF-8, and answers
//! control frames. Grounded on the source's `handleFragment`, which does all of this in
//! one function against a single scratch buffer; here it's split into a `FrameSink`
//! implementation the connection drives, queuing finished messages as `Outcome`s the
//! connection drains after every `FrameParser::consume`.

use crate::config::WebSocketConfig;
use crate::error::Error;
use crate::frame::OpCode;
use crate::inflate::{Inflater, DEFLATE_TAIL};
use crate::parser::FrameSink;
use crate::utf8::Utf8Validator;

/// A fully reassembled message handed to the connection's message callback.
#[derive(Debug, Clone)]
pub enum Message {
    Text(String),
    Binary(Vec<u8>),
}

/// What the assembler wants the connection to do after processing a fragment.
#[derive(Debug)]
pub enum Outcome {
    Message(Message),
    /// Send this payload back as a `Pong` (the connection owns the actual write).
    SendPong(Vec<u8>),
    /// Peer sent a `Close` frame; connection should begin/complete the close handshake
    /// with this parsed code and reason.
    PeerClose(u16, String),
}

pub struct MessageAssembler {
    config: WebSocketConfig,
    inflater: Option<Inflater>,
    pending: Vec<Outcome>,

    data_buffer: Vec<u8>,
    data_opcode: Option<OpCode>,
    data_compressed: bool,
    data_truncated: bool,

    control_buffer: Vec<u8>,
    control_opcode: Option<OpCode>,
}

impl MessageAssembler {
    pub fn new(config: WebSocketConfig, inflater: Option<Inflater>) -> Self {
        Self {
            config,
            inflater,
            pending: Vec::new(),
            data_buffer: Vec::new(),
            data_opcode: None,
            data_compressed: false,
            data_truncated: false,
            control_buffer: Vec::new(),
            control_opcode: None,
        }
    }

    /// Drains outcomes accumulated since the last call. The connection calls this after
    /// every `FrameParser::consume`.
    pub fn take_outcomes(&mut self) -> Vec<Outcome> {
        std::mem::take(&mut self.pending)
    }

    /// Appends already-decoded bytes (plain for uncompressed messages, inflated for
    /// `permessage-deflate` ones) to `data_buffer`, bounded by `max_payload`. Compressed
    /// messages are inflated fragment-by-fragment as they arrive (see `on_fragment`), so
    /// this always bounds the decompressed size, never the still-compressed wire bytes.
    fn append_data(&mut self, decoded: &[u8]) -> Result<(), Error> {
        let Some(max) = self.config.max_payload else {
            self.data_buffer.extend_from_slice(decoded);
            return Ok(());
        };
        if self.data_buffer.len() >= max {
            if self.config.close_on_oversize_message {
                return Err(Error::MessageTooBig);
            }
            self.data_truncated = true;
            return Ok(());
        }
        let room = max - self.data_buffer.len();
        let take = room.min(decoded.len());
        self.data_buffer.extend_from_slice(&decoded[..take]);
        if take < decoded.len() {
            if self.config.close_on_oversize_message {
                return Err(Error::MessageTooBig);
            }
            self.data_truncated = true;
        }
        Ok(())
    }

    /// Feeds one fragment's compressed bytes through the inflater and appends whatever
    /// comes out to `data_buffer` (bounded by `max_payload`), so the cap applies to the
    /// decompressed size rather than to the wire bytes. On the last fragment of the
    /// message, also feeds the RFC 7692 sync-flush trailer to flush the final bytes out.
    fn inflate_fragment(&mut self, payload: &[u8], last_fragment: bool) -> Result<(), Error> {
        let mut buf = [0u8; 8192];

        // Each inflater borrow below is scoped to its own statement, so `append_data`
        // can still borrow `self` mutably within the same loop iteration.
        self.inflater_mut().set_input(payload);
        loop {
            let n = self.inflater_mut().inflate(&mut buf)?;
            if n == 0 {
                break;
            }
            self.append_data(&buf[..n])?;
        }

        if last_fragment {
            self.inflater_mut().set_input(&DEFLATE_TAIL);
            loop {
                let n = self.inflater_mut().inflate(&mut buf)?;
                if n == 0 {
                    break;
                }
                self.append_data(&buf[..n])?;
            }
        }

        Ok(())
    }

    fn inflater_mut(&mut self) -> &mut Inflater {
        self.inflater
            .as_mut()
            .expect("compressed frame without a negotiated inflater")
    }

    fn finish_data_message(&mut self) -> Result<Outcome, Error> {
        let opcode = self.data_opcode.take().expect("data message in progress");
        self.data_compressed = false;
        let payload = std::mem::take(&mut self.data_buffer);
        let truncated = std::mem::replace(&mut self.data_truncated, false);

        if truncated && self.config.close_on_oversize_message {
            return Err(Error::MessageTooBig);
        }

        match opcode {
            OpCode::Text => {
                if !Utf8Validator::validate_complete(&payload) {
                    return Err(Error::InvalidUtf8);
                }
                let text = String::from_utf8(payload)?;
                Ok(Outcome::Message(Message::Text(text)))
            }
            OpCode::Binary => Ok(Outcome::Message(Message::Binary(payload))),
            _ => unreachable!("only Text/Binary ever start a data message"),
        }
    }

    fn finish_control_message(&mut self) -> Result<Outcome, Error> {
        let opcode = self.control_opcode.take().expect("control message in progress");
        let payload = std::mem::take(&mut self.control_buffer);
        match opcode {
            OpCode::Ping => Ok(Outcome::SendPong(payload)),
            OpCode::Close => {
                let (code, reason) = parse_close_payload(&payload);
                Ok(Outcome::PeerClose(code, reason))
            }
            _ => unreachable!("only Ping/Close ever resolve to an outcome"),
        }
    }
}

fn parse_close_payload(payload: &[u8]) -> (u16, String) {
    if payload.len() < 2 {
        return (1005, String::new());
    }
    let code = u16::from_be_bytes([payload[0], payload[1]]);
    let reason = String::from_utf8_lossy(&payload[2..]).into_owned();
    (code, reason)
}

impl FrameSink for MessageAssembler {
    fn on_fragment(
        &mut self,
        opcode: OpCode,
        payload: &mut [u8],
        fin: bool,
        remaining_in_frame: usize,
        compressed: bool,
    ) -> Result<(), Error> {
        if opcode.is_control() {
            // Pong carries no reply and isn't tracked past this point.
            if opcode == OpCode::Pong {
                return Ok(());
            }
            self.control_opcode.get_or_insert(opcode);
            self.control_buffer.extend_from_slice(payload);
            if fin && remaining_in_frame == 0 {
                let outcome = self.finish_control_message()?;
                self.pending.push(outcome);
            }
            return Ok(());
        }

        // Fast path: a single, whole, uncompressed frame with nothing already buffered
        // and within the configured limit skips data_buffer entirely.
        let starting_fresh = self.data_opcode.is_none() && self.data_buffer.is_empty();
        let within_limit = match self.config.max_payload {
            Some(max) => payload.len() <= max,
            None => true,
        };
        if starting_fresh && fin && remaining_in_frame == 0 && !compressed && within_limit {
            let message = match opcode {
                OpCode::Text => {
                    if !Utf8Validator::validate_complete(payload) {
                        return Err(Error::InvalidUtf8);
                    }
                    Message::Text(String::from_utf8(payload.to_vec())?)
                }
                OpCode::Binary => Message::Binary(payload.to_vec()),
                OpCode::Continuation => return Err(Error::InvalidContinuationFrame),
                _ => unreachable!(),
            };
            self.pending.push(Outcome::Message(message));
            return Ok(());
        }

        if self.data_opcode.is_none() {
            if opcode == OpCode::Continuation {
                return Err(Error::InvalidContinuationFrame);
            }
            self.data_opcode = Some(opcode);
            self.data_compressed = compressed;
            if compressed {
                self.inflater
                    .as_mut()
                    .expect("compressed frame without a negotiated inflater")
                    .reset_if_needed();
            }
        }

        if self.data_compressed {
            let last_fragment = fin && remaining_in_frame == 0;
            self.inflate_fragment(payload, last_fragment)?;
        } else {
            self.append_data(payload)?;
        }

        if fin && remaining_in_frame == 0 {
            let outcome = self.finish_data_message()?;
            self.pending.push(outcome);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::FrameParser;

    fn masked_frame(fin: bool, opcode: OpCode, payload: &[u8], mask: [u8; 4]) -> Vec<u8> {
        let mut out = Vec::new();
        out.push((fin as u8) << 7 | opcode.as_u8());
        let len = payload.len();
        if len < 126 {
            out.push(0x80 | len as u8);
        } else {
            out.push(0x80 | 126);
            out.extend_from_slice(&(len as u16).to_be_bytes());
        }
        out.extend_from_slice(&mask);
        for (i, b) in payload.iter().enumerate() {
            out.push(b ^ mask[i % 4]);
        }
        out
    }

    fn masked_compressed_frame(opcode: OpCode, payload: &[u8], mask: [u8; 4]) -> Vec<u8> {
        let mut out = Vec::new();
        out.push(0b1100_0000 | opcode.as_u8()); // fin=1, rsv1=1
        let len = payload.len();
        if len < 126 {
            out.push(0x80 | len as u8);
        } else {
            out.push(0x80 | 126);
            out.extend_from_slice(&(len as u16).to_be_bytes());
        }
        out.extend_from_slice(&mask);
        for (i, b) in payload.iter().enumerate() {
            out.push(b ^ mask[i % 4]);
        }
        out
    }

    fn config() -> WebSocketConfig {
        WebSocketConfig {
            max_payload: Some(1024),
            max_frame_size: Some(1024),
            close_on_oversize_message: false,
            permessage_deflate: false,
        }
    }

    #[test]
    fn delivers_a_tiny_text_message() {
        let mut parser = FrameParser::new(false, None);
        let mut assembler = MessageAssembler::new(config(), None);
        let mut bytes = masked_frame(true, OpCode::Text, b"hi", [1, 2, 3, 4]);
        parser.consume(&mut bytes, &mut assembler).unwrap();
        let outcomes = assembler.take_outcomes();
        assert_eq!(outcomes.len(), 1);
        matches!(&outcomes[0], Outcome::Message(Message::Text(s)) if s == "hi");
    }

    #[test]
    fn reassembles_fragmented_text() {
        let mut parser = FrameParser::new(false, None);
        let mut assembler = MessageAssembler::new(config(), None);
        let mut first = masked_frame(false, OpCode::Text, b"foo", [1, 1, 1, 1]);
        let mut second = masked_frame(true, OpCode::Continuation, b"bar", [2, 2, 2, 2]);
        parser.consume(&mut first, &mut assembler).unwrap();
        assert!(assembler.take_outcomes().is_empty());
        parser.consume(&mut second, &mut assembler).unwrap();
        let outcomes = assembler.take_outcomes();
        match &outcomes[0] {
            Outcome::Message(Message::Text(s)) => assert_eq!(s, "foobar"),
            other => panic!("expected text message, got {other:?}"),
        }
    }

    #[test]
    fn ping_produces_a_pong_echo() {
        let mut parser = FrameParser::new(false, None);
        let mut assembler = MessageAssembler::new(config(), None);
        let mut bytes = masked_frame(true, OpCode::Ping, b"ahoy", [9, 9, 9, 9]);
        parser.consume(&mut bytes, &mut assembler).unwrap();
        let outcomes = assembler.take_outcomes();
        match &outcomes[0] {
            Outcome::SendPong(payload) => assert_eq!(payload, b"ahoy"),
            other => panic!("expected pong, got {other:?}"),
        }
    }

    #[test]
    fn pong_produces_no_outcome() {
        let mut parser = FrameParser::new(false, None);
        let mut assembler = MessageAssembler::new(config(), None);
        let mut bytes = masked_frame(true, OpCode::Pong, b"", [3, 3, 3, 3]);
        parser.consume(&mut bytes, &mut assembler).unwrap();
        assert!(assembler.take_outcomes().is_empty());
    }

    #[test]
    fn close_frame_parses_code_and_reason() {
        let mut parser = FrameParser::new(false, None);
        let mut assembler = MessageAssembler::new(config(), None);
        let mut payload = vec![0x03, 0xE9]; // 1001
        payload.extend_from_slice(b"bye");
        let mut bytes = masked_frame(true, OpCode::Close, &payload, [4, 4, 4, 4]);
        parser.consume(&mut bytes, &mut assembler).unwrap();
        match &assembler.take_outcomes()[0] {
            Outcome::PeerClose(code, reason) => {
                assert_eq!(*code, 1001);
                assert_eq!(reason, "bye");
            }
            other => panic!("expected peer close, got {other:?}"),
        }
    }

    #[test]
    fn oversize_message_truncates_by_default() {
        let mut cfg = config();
        cfg.max_payload = Some(4);
        let mut parser = FrameParser::new(false, None);
        let mut assembler = MessageAssembler::new(cfg, None);
        let mut bytes = masked_frame(true, OpCode::Binary, b"abcdefgh", [1, 0, 1, 0]);
        parser.consume(&mut bytes, &mut assembler).unwrap();
        match &assembler.take_outcomes()[0] {
            Outcome::Message(Message::Binary(data)) => assert_eq!(data.len(), 4),
            other => panic!("expected truncated binary message, got {other:?}"),
        }
    }

    #[test]
    fn oversize_message_closes_when_configured() {
        let mut cfg = config();
        cfg.max_payload = Some(4);
        cfg.close_on_oversize_message = true;
        let mut parser = FrameParser::new(false, None);
        let mut assembler = MessageAssembler::new(cfg, None);
        let mut bytes = masked_frame(true, OpCode::Binary, b"abcdefgh", [1, 0, 1, 0]);
        assert!(parser.consume(&mut bytes, &mut assembler).is_err());
    }

    #[test]
    fn oversize_compressed_message_truncates_by_decompressed_size_not_wire_size() {
        use crate::inflate::Inflater;
        use flate2::write::DeflateEncoder;
        use flate2::Compression;
        use std::io::Write;

        // Highly compressible: a few hundred wire bytes decompress to far more than
        // max_payload. If truncation ran against the still-compressed bytes (the bug),
        // nothing would ever get capped here since the wire size never reaches max.
        let decompressed = vec![b'z'; 8192];
        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&decompressed).unwrap();
        let mut compressed = encoder.finish().unwrap();
        compressed.truncate(compressed.len() - 4); // permessage-deflate strips this trailer

        let mut cfg = config();
        cfg.max_payload = Some(50);
        cfg.permessage_deflate = true;
        assert!(compressed.len() < cfg.max_payload.unwrap(), "fixture not compressible enough");

        let mut parser = FrameParser::new(true, None);
        let mut assembler = MessageAssembler::new(cfg, Some(Inflater::new(false, None)));
        let mut bytes = masked_compressed_frame(OpCode::Binary, &compressed, [1, 2, 3, 4]);
        parser.consume(&mut bytes, &mut assembler).unwrap();
        match &assembler.take_outcomes()[0] {
            Outcome::Message(Message::Binary(data)) => assert_eq!(data.len(), 50),
            other => panic!("expected truncated binary message, got {other:?}"),
        }
    }

    #[test]
    fn invalid_utf8_is_rejected() {
        let mut parser = FrameParser::new(false, None);
        let mut assembler = MessageAssembler::new(config(), None);
        let mut bytes = masked_frame(true, OpCode::Text, &[0xFF, 0xFE], [1, 2, 3, 4]);
        assert!(parser.consume(&mut bytes, &mut assembler).is_err());
    }
}
