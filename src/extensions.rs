//! Parsing and negotiation of `Sec-WebSocket-Extensions: permessage-deflate` at handshake
//! time. Negotiation itself is ambient (handshake-time bookkeeping); the result is just a
//! bag of parameters the core's `Inflater` consumes (see `inflate` and `connection`).

const PERMESSAGE_DEFLATE: &str = "permessage-deflate";
const CLIENT_NO_CONTEXT_TAKEOVER: &str = "client_no_context_takeover";
const SERVER_NO_CONTEXT_TAKEOVER: &str = "server_no_context_takeover";
const CLIENT_MAX_WINDOW_BITS: &str = "client_max_window_bits";
const SERVER_MAX_WINDOW_BITS: &str = "server_max_window_bits";

/// Some compression parameters affect both compression and decompression
/// (`client_no_context_takeover`, `server_no_context_takeover`), while others only
/// constrain the window size used on one side. Larger windows (closer to 15) compress
/// better at the cost of memory; smaller windows (closer to 8) are cheaper but compress
/// worse.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extensions {
    pub permessage_deflate: bool,
    /// The client resets its compression context after every message; if accepted, this
    /// server's `Inflater` must reset its window after every message too.
    pub client_no_context_takeover: bool,
    /// This server resets its compression context after every message it sends; has no
    /// effect on the `Inflater` (which only decompresses inbound data).
    pub server_no_context_takeover: bool,
    pub client_max_window_bits: Option<u8>,
    pub server_max_window_bits: Option<u8>,
}

/// Parses a client's offered `Sec-WebSocket-Extensions` header value. Returns `None` if
/// the client did not offer `permessage-deflate` at all.
pub fn parse_extensions(extensions_header_value: &str) -> Option<Extensions> {
    let mut extensions = Extensions::default();

    for part in extensions_header_value.split(';') {
        let part = part.trim();
        if part == PERMESSAGE_DEFLATE {
            extensions.permessage_deflate = true;
        } else if part.starts_with(CLIENT_NO_CONTEXT_TAKEOVER) {
            extensions.client_no_context_takeover = true;
        } else if part.starts_with(SERVER_NO_CONTEXT_TAKEOVER) {
            extensions.server_no_context_takeover = true;
        } else if let Some(bits) = parse_window_bits(part, CLIENT_MAX_WINDOW_BITS) {
            extensions.client_max_window_bits = bits;
        } else if let Some(bits) = parse_window_bits(part, SERVER_MAX_WINDOW_BITS) {
            extensions.server_max_window_bits = bits;
        }
    }

    extensions.permessage_deflate.then_some(extensions)
}

fn parse_window_bits(part: &str, name: &str) -> Option<Option<u8>> {
    if !part.starts_with(name) {
        return None;
    }
    if !part.contains('=') {
        return Some(Some(15));
    }
    Some(part.split('=').last()?.trim().parse::<u8>().ok())
}

/// Decides what this server will actually use, given the client's offer and the
/// server's own configuration. The server never asks for more than the client offered.
pub fn negotiate(client_offer: Option<&Extensions>, server_enabled: bool) -> Option<Extensions> {
    let offer = client_offer?;
    if !server_enabled || !offer.permessage_deflate {
        return None;
    }
    Some(offer.clone())
}

/// Formats the `Sec-WebSocket-Extensions` response header line (without the trailing
/// `\r\n`) confirming what this server accepted, or `None` if nothing was negotiated.
pub fn format_response_header(extensions: &Extensions) -> Option<String> {
    if !extensions.permessage_deflate {
        return None;
    }
    let mut header = format!("Sec-WebSocket-Extensions: {PERMESSAGE_DEFLATE}");
    if extensions.client_no_context_takeover {
        header.push_str(&format!("; {CLIENT_NO_CONTEXT_TAKEOVER}"));
    }
    if extensions.server_no_context_takeover {
        header.push_str(&format!("; {SERVER_NO_CONTEXT_TAKEOVER}"));
    }
    if let Some(bits) = extensions.client_max_window_bits {
        header.push_str(&format!("; {CLIENT_MAX_WINDOW_BITS}={bits}"));
    }
    if let Some(bits) = extensions.server_max_window_bits {
        header.push_str(&format!("; {SERVER_MAX_WINDOW_BITS}={bits}"));
    }
    Some(header)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_permessage_deflate() {
        let ext = parse_extensions("permessage-deflate").unwrap();
        assert!(ext.permessage_deflate);
        assert!(!ext.client_no_context_takeover);
    }

    #[test]
    fn parses_full_offer() {
        let ext = parse_extensions(
            "permessage-deflate; client_no_context_takeover; client_max_window_bits=10",
        )
        .unwrap();
        assert!(ext.client_no_context_takeover);
        assert_eq!(ext.client_max_window_bits, Some(10));
    }

    #[test]
    fn no_offer_without_the_token() {
        assert!(parse_extensions("some-other-extension").is_none());
    }

    #[test]
    fn negotiate_respects_server_disabled() {
        let offer = parse_extensions("permessage-deflate").unwrap();
        assert!(negotiate(Some(&offer), false).is_none());
        assert!(negotiate(Some(&offer), true).is_some());
    }

    #[test]
    fn response_header_roundtrips_params() {
        let ext = Extensions {
            permessage_deflate: true,
            server_no_context_takeover: true,
            server_max_window_bits: Some(12),
            ..Default::default()
        };
        let header = format_response_header(&ext).unwrap();
        assert!(header.contains("server_no_context_takeover"));
        assert!(header.contains("server_max_window_bits=12"));
    }
}
