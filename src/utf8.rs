//! Incremental UTF-8 validation that survives chunk boundaries, so a `Text` message can
//! be validated fragment-by-fragment as it streams in rather than only once fully
//! buffered. Implemented directly rather than pulled in as a dependency: this is core
//! protocol logic (RFC 6455 §8.1 requires rejecting invalid UTF-8), not ambient
//! infrastructure.

/// State machine carried across `feed` calls for one message.
#[derive(Debug, Default, Clone)]
pub struct Utf8Validator {
    /// Bytes still expected to complete the codepoint currently in progress.
    needed: u8,
    /// Valid range for the *next* continuation byte (tightens for overlong/surrogate
    /// exclusion on 3- and 4-byte sequences, per the table in the Unicode standard).
    lower: u8,
    upper: u8,
}

impl Utf8Validator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a chunk of bytes, updating internal state. Returns `false` as soon as the
    /// chunk is provably invalid; the caller should stop and close the connection.
    pub fn feed(&mut self, bytes: &[u8]) -> bool {
        for &b in bytes {
            if self.needed == 0 {
                match b {
                    0x00..=0x7F => {}
                    0xC2..=0xDF => {
                        self.needed = 1;
                        self.lower = 0x80;
                        self.upper = 0xBF;
                    }
                    0xE0 => {
                        self.needed = 2;
                        self.lower = 0xA0; // excludes overlong encodings
                        self.upper = 0xBF;
                    }
                    0xE1..=0xEC | 0xEE..=0xEF => {
                        self.needed = 2;
                        self.lower = 0x80;
                        self.upper = 0xBF;
                    }
                    0xED => {
                        self.needed = 2;
                        self.lower = 0x80;
                        self.upper = 0x9F; // excludes UTF-16 surrogates D800..DFFF
                    }
                    0xF0 => {
                        self.needed = 3;
                        self.lower = 0x90; // excludes overlong
                        self.upper = 0xBF;
                    }
                    0xF1..=0xF3 => {
                        self.needed = 3;
                        self.lower = 0x80;
                        self.upper = 0xBF;
                    }
                    0xF4 => {
                        self.needed = 3;
                        self.lower = 0x80;
                        self.upper = 0x8F; // excludes codepoints above U+10FFFF
                    }
                    _ => return false, // stray continuation byte, 0xC0/0xC1, or 0xF5..=0xFF
                }
            } else {
                if b < self.lower || b > self.upper {
                    return false;
                }
                // Subsequent continuation bytes of a multi-byte sequence always fall in
                // 0x80..=0xBF once the first continuation byte has narrowed the range.
                self.lower = 0x80;
                self.upper = 0xBF;
                self.needed -= 1;
            }
        }
        true
    }

    /// Call once the full message has been fed; a message that ends mid-codepoint is
    /// invalid even if every byte fed so far was individually acceptable.
    pub fn finish(&self) -> bool {
        self.needed == 0
    }

    /// One-shot validation of a complete buffer, used at message-completion time for
    /// payloads that weren't validated incrementally while streaming.
    pub fn validate_complete(bytes: &[u8]) -> bool {
        let mut v = Self::new();
        v.feed(bytes) && v.finish()
    }
}
