//! The per-connection state machine: owns the transport, drives the frame parser and
//! message assembler over whatever the socket handed back, and manages the send queue
//! and the two-phase close protocol. Grounded on the source's `onReadable` (read loop +
//! spill handling), `write`/`write_some` (queued, partial-write-aware sends), and `close`
//! (graceful vs. forced, 15 second watchdog) — reshaped from uv_poll_t callbacks into one
//! `tokio::select!` loop per connection.

use crate::assembler::{Message, MessageAssembler, Outcome};
use crate::config::{WebSocketConfig, CLOSE_WATCHDOG, LARGE_BUFFER_SIZE};
use crate::error::Error;
use crate::extensions::Extensions;
use crate::frame::OpCode;
use crate::inflate::Inflater;
use crate::parser::FrameParser;
use crate::send::{format_close, format_message, FragmentState, SendQueue};
use crate::transport::WsStream;
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use tokio::io::{split, AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::time::{sleep, Sleep};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    /// A close frame has gone out (ours or an echo of the peer's); waiting for the
    /// handshake to finish or the watchdog to fire.
    Closing,
    Closed,
}

#[derive(Debug)]
pub enum ConnectionEvent {
    Message(Message),
    Closed { code: u16, reason: String },
}

pub struct Connection {
    read_half: ReadHalf<WsStream>,
    write_half: WriteHalf<WsStream>,
    parser: FrameParser,
    assembler: MessageAssembler,
    send_queue: SendQueue,
    state: ConnectionState,
    watchdog: Option<Pin<Box<Sleep>>>,
    recv_buffer: Vec<u8>,
    peer_addr: SocketAddr,
    /// Events produced by one `feed()` call beyond the first — `next_event` only
    /// surfaces one event per call, so extras (e.g. two small text messages landing in
    /// the same read) queue here instead of being dropped.
    pending_events: VecDeque<ConnectionEvent>,
    /// Progress of an in-flight `send_fragment` stream, persisted across calls the way
    /// the source keeps one `sendState` per connection.
    fragment_state: FragmentState,
    /// Set on the first `write_some` call, matching the source's lazily-bound session id.
    session_id: Option<String>,
}

impl Connection {
    pub fn new(
        transport: WsStream,
        config: WebSocketConfig,
        negotiated: Option<Extensions>,
    ) -> io::Result<Self> {
        let peer_addr = transport.peer_addr()?;
        let permessage_deflate = negotiated.is_some();
        let inflater = negotiated.as_ref().map(|ext| {
            Inflater::new(ext.client_no_context_takeover, ext.client_max_window_bits)
        });
        let max_frame_size = config.max_frame_size;

        // Nagle's algorithm would otherwise hold small frames (pings, acks, the batched
        // replies `feed` builds below) back waiting to fill a segment; since replies
        // produced by one read are already coalesced into a single `write`, there's
        // nothing left for the kernel to usefully wait on.
        if let Err(err) = transport.set_nodelay(true) {
            log::warn!("failed to set TCP_NODELAY: {err}");
        }
        let (read_half, write_half) = split(transport);

        Ok(Self {
            read_half,
            write_half,
            parser: FrameParser::new(permessage_deflate, max_frame_size),
            assembler: MessageAssembler::new(config, inflater),
            send_queue: SendQueue::new(),
            state: ConnectionState::Open,
            watchdog: None,
            recv_buffer: vec![0u8; LARGE_BUFFER_SIZE],
            peer_addr,
            pending_events: VecDeque::new(),
            fragment_state: FragmentState::new(),
            session_id: None,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Total bytes still queued to be written, for observing backpressure.
    pub fn queue_depth(&self) -> usize {
        self.send_queue.depth()
    }

    pub fn send_text(&mut self, text: &str) -> Result<(), Error> {
        self.send(OpCode::Text, text.as_bytes())
    }

    pub fn send_binary(&mut self, data: &[u8]) -> Result<(), Error> {
        self.send(OpCode::Binary, data)
    }

    pub fn send(&mut self, opcode: OpCode, payload: &[u8]) -> Result<(), Error> {
        if self.state == ConnectionState::Closed {
            return Ok(()); // connection is on its way out; drop the write silently
        }
        self.send_queue.enqueue(format_message(opcode, payload));
        Ok(())
    }

    /// Queues an already wire-encoded frame verbatim, used when relaying a broadcast or
    /// a targeted send from outside this connection's owning task.
    pub fn enqueue_raw(&mut self, frame: Vec<u8>) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.send_queue.enqueue(frame);
    }

    /// Streams one chunk of a message whose eventual total size is already known,
    /// mirroring the source's `sendFragment(data, length, opCode, remainingBytes)`. The
    /// first call of a stream declares the full size up front in a single frame header;
    /// every later call (while `remaining_bytes` keeps arriving) writes raw continuation
    /// bytes with no header of its own. Pass `remaining_bytes == 0` on the last chunk —
    /// this also covers a plain one-shot send when it's the only call made.
    pub fn send_fragment(&mut self, bytes: &[u8], opcode: OpCode, remaining_bytes: usize) -> Result<(), Error> {
        if self.state == ConnectionState::Closed {
            return Ok(());
        }
        let frame = self.fragment_state.send_fragment(opcode, bytes, remaining_bytes);
        self.send_queue.enqueue(frame);
        Ok(())
    }

    /// Convenience send that binds `session_id` to this connection on its first call,
    /// matching the source's `write_some`. Always reports the full length back to the
    /// caller — the queue absorbs backpressure, observable separately via `queue_depth`.
    pub fn write_some(&mut self, bytes: &[u8], session_id: &str) -> usize {
        if self.session_id.is_none() {
            self.session_id = Some(session_id.to_string());
        }
        let _ = self.send(OpCode::Binary, bytes);
        bytes.len()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Starts a graceful close: queues a close frame, arms the 15 second watchdog, and
    /// notifies the caller via a `Closed` event right away (the notification is not
    /// deferred to whatever the peer eventually echoes back). Idempotent — calling it
    /// again while already closing logs and has no further effect.
    pub fn close(&mut self, code: u16, reason: &str) {
        if self.state == ConnectionState::Closing {
            log::warn!("close() called again while already closing");
            return;
        }
        if self.state == ConnectionState::Closed {
            return;
        }
        self.begin_closing(code, reason.to_string());
    }

    /// Common path for both app-initiated `close()` and echoing back a peer-initiated
    /// close frame: queues the close frame, arms the watchdog, and raises the one
    /// `Closed` notification this connection will ever produce. A no-op if a close is
    /// already in flight, so callers never need to guard against double-notifying.
    fn begin_closing(&mut self, code: u16, reason: String) {
        if self.state != ConnectionState::Open {
            return;
        }
        self.send_queue.enqueue(format_close(code, &reason));
        self.state = ConnectionState::Closing;
        self.watchdog = Some(Box::pin(sleep(CLOSE_WATCHDOG)));
        self.pending_events.push_back(ConnectionEvent::Closed { code, reason });
    }

    fn force_close(&mut self) {
        self.state = ConnectionState::Closed;
        self.watchdog = None;
    }

    /// Forces the connection closed and, unless `begin_closing` already notified the
    /// caller for this connection, raises the `Closed` event now. Every abnormal-
    /// termination path (read/write error, EOF, watchdog expiry) goes through this so the
    /// "exactly one `Closed` event per connection" rule holds without each call site
    /// having to check `self.state` itself.
    fn force_close_with_event(&mut self, code: u16, reason: String) {
        let already_notified = self.state != ConnectionState::Open;
        self.force_close();
        if !already_notified {
            self.pending_events.push_back(ConnectionEvent::Closed { code, reason });
        }
    }

    /// Drives the connection until there is an event worth surfacing (a message, or the
    /// connection finishing). Returns `None` once the connection is fully closed and
    /// every queued byte has gone out — the caller should drop the connection then.
    pub async fn next_event(&mut self) -> Option<ConnectionEvent> {
        loop {
            if let Some(event) = self.pending_events.pop_front() {
                return Some(event);
            }

            if self.state == ConnectionState::Closed && self.send_queue.is_empty() {
                return None;
            }

            let can_read = self.state != ConnectionState::Closed;
            let can_write = !self.send_queue.is_empty();

            tokio::select! {
                biased;

                _ = Self::wait_watchdog(&mut self.watchdog) => {
                    self.force_close_with_event(1006, "close handshake timed out".to_string());
                }

                result = self.write_half.write(
                    self.send_queue.front_mut().map(|q| q.remaining()).unwrap_or(&[])
                ), if can_write => {
                    match result {
                        Ok(0) => {
                            self.force_close_with_event(1006, "write returned zero".to_string());
                        }
                        Ok(n) => {
                            if let Some(front) = self.send_queue.front_mut() {
                                front.advance(n);
                            }
                            self.send_queue.pop_front_if_drained();
                            if self.state != ConnectionState::Open && self.send_queue.is_empty() {
                                let _ = self.write_half.shutdown().await;
                            }
                        }
                        Err(e) => {
                            self.force_close_with_event(1006, e.to_string());
                        }
                    }
                }

                result = self.read_half.read(&mut self.recv_buffer), if can_read => {
                    match result {
                        Ok(0) => {
                            self.force_close_with_event(1006, "connection reset by peer".to_string());
                        }
                        Ok(n) => {
                            self.feed(n);
                        }
                        Err(e) => {
                            self.force_close_with_event(1006, e.to_string());
                        }
                    }
                }
            }
        }
    }

    async fn wait_watchdog(watchdog: &mut Option<Pin<Box<Sleep>>>) {
        match watchdog {
            Some(sleep) => sleep.await,
            None => std::future::pending().await,
        }
    }

    /// Parses and reassembles whatever landed in `recv_buffer[..n]`, queuing any
    /// resulting events (messages, or the close handshake completing) onto
    /// `pending_events` rather than returning them directly, since one read can produce
    /// more than one deliverable message. Every reply this read generates (pongs, a
    /// close echo) is accumulated into one buffer and enqueued as a single write at the
    /// end, so they land in one outbound TCP segment instead of one `write` per frame.
    fn feed(&mut self, n: usize) {
        let mut chunk = std::mem::take(&mut self.recv_buffer);
        let result = self.parser.consume(&mut chunk[..n], &mut self.assembler);
        self.recv_buffer = chunk;
        self.recv_buffer.resize(LARGE_BUFFER_SIZE, 0);

        let mut batched_replies = Vec::new();

        if let Err(e) = result {
            let code = e.close_code();
            batched_replies.extend_from_slice(&format_close(code, &e.to_string()));
            self.flush_batched(batched_replies);
            self.force_close_with_event(code, e.to_string());
            return;
        }

        for outcome in self.assembler.take_outcomes() {
            if self.state == ConnectionState::Closed {
                break; // already decided to close this round; nothing further to process
            }
            match outcome {
                Outcome::Message(message) => {
                    self.pending_events.push_back(ConnectionEvent::Message(message));
                }
                Outcome::SendPong(payload) => {
                    batched_replies.extend_from_slice(&format_message(OpCode::Pong, &payload));
                }
                Outcome::PeerClose(code, reason) => {
                    if self.state == ConnectionState::Closing {
                        // We had already sent our own close frame and already raised the
                        // one `Closed` event for this connection; the peer's frame just
                        // completes the handshake.
                        self.force_close();
                    } else {
                        // Flush whatever replies this read already produced before this
                        // point so ordering against the close echo `begin_closing` queues
                        // next stays correct, then start our own graceful close using the
                        // peer's code/reason (this both echoes it back and is the one
                        // notification the app gets for this disconnect).
                        self.flush_batched(std::mem::take(&mut batched_replies));
                        self.begin_closing(code, reason);
                    }
                }
            }
        }

        self.flush_batched(batched_replies);
    }

    fn flush_batched(&mut self, batched: Vec<u8>) {
        if !batched.is_empty() {
            self.send_queue.enqueue(batched);
        }
    }
}
