use httparse::Error as HttpParseError;
use std::io;
use std::string::FromUtf8Error;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    // Framing errors -> always a 1006 close per spec
    #[error("RSV bit set without a negotiated extension")]
    RSVNotZero,

    #[error("control frames must not be fragmented")]
    ControlFramesFragmented,

    #[error("control frame payload can't be greater than 125 bytes")]
    ControlFramePayloadSize,

    #[error("client frame was not masked")]
    UnmaskedClientFrame,

    #[error("invalid frame while there is a fragmented message in progress")]
    InvalidFrameFragmentation,

    #[error("incoming fragmented message but there is one already in progress")]
    FragmentedInProgress,

    #[error("invalid continuation frame: no fragmented message to continue")]
    InvalidContinuationFrame,

    #[error("invalid opcode: `{0}`")]
    InvalidOpcode(u8),

    #[error("fragment_size: `{0}` can't be greater than max_frame_size: `{1}`")]
    CustomFragmentSizeExceeded(usize, usize),

    #[error("invalid UTF-8 in text message")]
    InvalidUtf8,

    #[error("{source}")]
    FromUtf8Error {
        #[from]
        source: FromUtf8Error,
    },

    // Compression errors -> 1006 close
    #[error("deflate stream error: {0}")]
    DeflateError(String),

    #[error("max_window_bits should be a value between 8 and 15")]
    InvalidMaxWindowBits,

    // Policy error -> 1009 close only when close_on_oversize_message is set
    #[error("message exceeds max_payload")]
    MessageTooBig,

    // Lifecycle errors
    #[error("connection is already closing")]
    OverlappedClose,

    // Transport / IO errors -> 1006 close unless a peer close frame was already parsed
    #[error("IO error: {source}")]
    IOError {
        #[from]
        source: io::Error,
    },

    #[error("TLS handshake failed: {0}")]
    Tls(String),

    // HTTP Upgrade handshake errors (handshake module, not part of the core state machine)
    #[error("invalid HTTP handshake request method or version")]
    InvalidHTTPHandshake,

    #[error("Connection: Upgrade header missing in the request")]
    NoConnectionHeaderPresent,

    #[error("Upgrade: websocket header missing in the request")]
    NoUpgradeHeaderPresent,

    #[error("couldn't find Sec-WebSocket-Key header in the request")]
    NoSecWebsocketKey,

    #[error("{source}")]
    HttpParseError {
        #[from]
        source: HttpParseError,
    },

    #[error("incomplete HTTP request")]
    IncompleteHTTPRequest,
}

impl Error {
    /// The close code a conformant peer should see for this failure. Almost everything
    /// the parser/assembler/inflater can raise is 1006 (abnormal closure) per spec; the
    /// oversize-message policy error is the only one with its own code, and only when the
    /// caller opted into strict enforcement via `WebSocketConfig::close_on_oversize_message`.
    pub fn close_code(&self) -> u16 {
        match self {
            Error::MessageTooBig => 1009,
            _ => 1006,
        }
    }
}
