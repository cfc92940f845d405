//! The HTTP/1.1 Upgrade handshake: reads the request line by line up to the blank line
//! that ends the headers, validates it's actually asking for a WebSocket upgrade,
//! computes `Sec-WebSocket-Accept`, negotiates `permessage-deflate`, and writes back the
//! `101 Switching Protocols` response. Parsing itself (not the accept-key math, not the
//! negotiation) is the one piece of this crate that uses `httparse` instead of hand-rolled
//! string search, because a real `Request-Line` plus header block deserves a real parser.

use crate::error::Error;
use crate::extensions::{self, Extensions};
use crate::transport::WsStream;
use crate::utils::generate_websocket_accept_value;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;

const MAX_REQUEST_SIZE: usize = 16 * 1024;
const READ_TIMEOUT: Duration = Duration::from_secs(10);

pub struct HandshakeOutcome {
    pub transport: WsStream,
    pub negotiated_extensions: Option<Extensions>,
}

/// Reads and validates the upgrade request on `transport`, writes the `101` response, and
/// hands the same transport back so the caller can build a `Connection` from it.
pub async fn perform_handshake(
    mut transport: WsStream,
    permessage_deflate_enabled: bool,
) -> Result<HandshakeOutcome, Error> {
    let raw_request = read_request_headers(&mut transport).await?;

    let mut header_storage = [httparse::EMPTY_HEADER; 32];
    let mut request = httparse::Request::new(&mut header_storage);
    let parse_result = request
        .parse(&raw_request)
        .map_err(|source| Error::HttpParseError { source })?;
    if parse_result.is_partial() {
        return Err(Error::IncompleteHTTPRequest);
    }

    if request.method != Some("GET") || request.version != Some(1) {
        return Err(Error::InvalidHTTPHandshake);
    }

    let mut sec_websocket_key: Option<&str> = None;
    let mut has_upgrade_header = false;
    let mut has_connection_header = false;
    let mut extensions_offer: Option<Extensions> = None;

    for header in request.headers.iter() {
        let name = header.name;
        let value = std::str::from_utf8(header.value).unwrap_or("");
        if name.eq_ignore_ascii_case("Upgrade") && value.to_ascii_lowercase().contains("websocket")
        {
            has_upgrade_header = true;
        } else if name.eq_ignore_ascii_case("Connection")
            && value.to_ascii_lowercase().contains("upgrade")
        {
            has_connection_header = true;
        } else if name.eq_ignore_ascii_case("Sec-WebSocket-Key") {
            sec_websocket_key = Some(value.trim());
        } else if name.eq_ignore_ascii_case("Sec-WebSocket-Extensions") {
            extensions_offer = extensions::parse_extensions(value);
        }
    }

    if !has_upgrade_header {
        return Err(Error::NoUpgradeHeaderPresent);
    }
    if !has_connection_header {
        return Err(Error::NoConnectionHeaderPresent);
    }
    let key = sec_websocket_key.ok_or(Error::NoSecWebsocketKey)?;

    let accept_value = generate_websocket_accept_value(key.to_string());
    let negotiated_extensions = extensions::negotiate(extensions_offer.as_ref(), permessage_deflate_enabled);

    let mut response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Connection: Upgrade\r\n\
         Upgrade: websocket\r\n\
         Sec-WebSocket-Accept: {accept_value}\r\n"
    );
    if let Some(ext) = negotiated_extensions.as_ref() {
        if let Some(header_line) = extensions::format_response_header(ext) {
            response.push_str(&header_line);
            response.push_str("\r\n");
        }
    }
    response.push_str("\r\n");

    transport.write_all(response.as_bytes()).await?;

    Ok(HandshakeOutcome {
        transport,
        negotiated_extensions,
    })
}

/// Reads raw bytes off `transport` until the blank line ending the HTTP headers shows up,
/// bailing out on a slow/oversized client rather than buffering forever.
async fn read_request_headers(transport: &mut WsStream) -> Result<Vec<u8>, Error> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    loop {
        if buf.len() > MAX_REQUEST_SIZE {
            return Err(Error::InvalidHTTPHandshake);
        }
        let read = timeout(READ_TIMEOUT, transport.read(&mut chunk))
            .await
            .map_err(|_| Error::IncompleteHTTPRequest)??;
        if read == 0 {
            return Err(Error::IncompleteHTTPRequest);
        }
        buf.extend_from_slice(&chunk[..read]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }

    Ok(buf)
}
