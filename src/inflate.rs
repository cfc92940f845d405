//! Streaming raw-deflate decompression for permessage-deflate, grounded on the source's
//! `Decoder` (flate2-backed) but reshaped into the `set_input`/`inflate` two-phase API the
//! design calls for, so a caller can drain into its own buffer across several calls
//! instead of getting back an owned `Vec` each time.

use crate::error::Error;
use flate2::{Decompress, FlushDecompress, Status};

/// Appended after the last fragment of a compressed message before the final drain, per
/// RFC 7692 §7.2.1 — permessage-deflate strips this trailer on the wire and every
/// implementation must add it back before finishing inflation.
pub const DEFLATE_TAIL: [u8; 4] = [0x00, 0x00, 0xFF, 0xFF];

pub struct Inflater {
    decompressor: Decompress,
    /// `true` when the negotiated extension disables context takeover, meaning the
    /// window must be reset between messages rather than carried over.
    reset_between_messages: bool,
    pending_input: Vec<u8>,
    input_cursor: usize,
    baseline_total_in: u64,
}

impl Inflater {
    pub fn new(reset_between_messages: bool, window_bits: Option<u8>) -> Self {
        let decompressor = match window_bits {
            Some(bits) => Decompress::new_with_window_bits(false, bits),
            None => Decompress::new(false),
        };
        Self {
            decompressor,
            reset_between_messages,
            pending_input: Vec::new(),
            input_cursor: 0,
            baseline_total_in: 0,
        }
    }

    /// Stages `bytes` for the next `inflate` calls. Call once per fragment payload, and
    /// once more with `inflate::DEFLATE_TAIL` after the last fragment of a message.
    pub fn set_input(&mut self, bytes: &[u8]) {
        self.pending_input.clear();
        self.pending_input.extend_from_slice(bytes);
        self.input_cursor = 0;
        self.baseline_total_in = self.decompressor.total_in();
    }

    /// Drains as much of the staged input into `out` as fits, returning the number of
    /// bytes produced. Returns `Ok(0)` once the staged input is fully consumed; call
    /// repeatedly (growing/reusing `out`) until it returns 0.
    pub fn inflate(&mut self, out: &mut [u8]) -> Result<usize, Error> {
        if self.input_cursor >= self.pending_input.len() {
            return Ok(0);
        }

        let before_out = self.decompressor.total_out();
        let input = &self.pending_input[self.input_cursor..];
        let _status: Status = self
            .decompressor
            .decompress(input, out, FlushDecompress::Sync)
            .map_err(|e| Error::DeflateError(e.to_string()))?;

        self.input_cursor = (self.decompressor.total_in() - self.baseline_total_in) as usize;
        let produced = (self.decompressor.total_out() - before_out) as usize;

        Ok(produced)
    }

    /// Called between messages when `client_no_context_takeover` was negotiated.
    pub fn reset_if_needed(&mut self) {
        if self.reset_between_messages {
            self.decompressor.reset(false);
        }
    }

    /// Convenience used by the assembler: inflate a complete message's compressed bytes
    /// (fragments already concatenated, tail already appended) into an owned `Vec`.
    pub fn inflate_all(&mut self, compressed: &[u8]) -> Result<Vec<u8>, Error> {
        self.reset_if_needed();
        self.set_input(compressed);

        let mut out = Vec::new();
        let mut buf = vec![0u8; buffer_size_for(compressed.len())];
        loop {
            let produced = self.inflate(&mut buf)?;
            if produced == 0 {
                break;
            }
            out.extend_from_slice(&buf[..produced]);
        }
        Ok(out)
    }
}

fn buffer_size_for(payload_size: usize) -> usize {
    if payload_size <= 4096 {
        4096
    } else if payload_size <= 65536 {
        16384
    } else {
        65536
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::DeflateEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn raw_deflate(payload: &[u8]) -> Vec<u8> {
        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(payload).unwrap();
        let mut compressed = encoder.finish().unwrap();
        // permessage-deflate strips the 4-byte sync-flush trailer on the wire.
        compressed.truncate(compressed.len() - 4);
        compressed
    }

    #[test]
    fn inflates_a_single_message() {
        let payload = b"hello hello hello hello websocket websocket";
        let mut compressed = raw_deflate(payload);
        compressed.extend_from_slice(&DEFLATE_TAIL);

        let mut inflater = Inflater::new(false, None);
        let out = inflater.inflate_all(&compressed).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn inflates_split_fragments() {
        let payload = b"a message that gets split across two compressed fragments";
        let mut compressed = raw_deflate(payload);
        compressed.extend_from_slice(&DEFLATE_TAIL);
        let mid = compressed.len() / 2;

        let mut inflater = Inflater::new(false, None);
        inflater.set_input(&compressed[..mid]);
        let mut out = Vec::new();
        let mut buf = vec![0u8; 4096];
        loop {
            let n = inflater.inflate(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        inflater.set_input(&compressed[mid..]);
        loop {
            let n = inflater.inflate(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, payload);
    }

    #[test]
    fn corrupt_stream_is_a_decode_error() {
        let mut inflater = Inflater::new(false, None);
        let garbage = vec![0xFFu8; 32];
        let result = inflater.inflate_all(&garbage);
        assert!(result.is_err());
    }
}
