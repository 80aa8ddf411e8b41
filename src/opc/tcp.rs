use anyhow::{Context, Result};
use std::fmt;
use std::io::{ErrorKind, Read};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::display::PixelBuffer;
use crate::governor::Clock;
use crate::opc::sequence::{DuplicatePolicy, SeqVerdict, SequenceTracker};
use crate::opc::udp::lock_pixels;
use crate::opc::{IngestSource, OpcHeader, SourceStats, CMD_SET_PIXELS};

const RECV_BUFFER_SIZE: usize = 16384;

/// Reassembly state for the persistent-connection transport
#[derive(Clone, Copy)]
enum StreamState {
    AwaitHeader,
    /// Header decoded, waiting for its declared payload
    AwaitBody(OpcHeader),
}

/// Why the assembler wants the connection gone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CloseReason {
    /// Declared length exceeds buffer capacity; a stream cannot skip bytes
    /// whose boundary it cannot trust
    OversizeLength(u16),
    UnknownCommand(u8),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::OversizeLength(len) => write!(f, "declared length {} exceeds capacity", len),
            CloseReason::UnknownCommand(cmd) => write!(f, "unknown command 0x{:02x}", cmd),
        }
    }
}

/// Result of feeding bytes to the assembler
pub(crate) struct FeedOutcome {
    pub applied: u64,
    pub close: Option<CloseReason>,
}

/// Turns an ordered byte stream back into OPC frames.
///
/// Unlike a datagram, a TCP segment carries no frame boundary: the header and
/// body routinely arrive split across reads, so the assembler buffers input
/// and only advances when a complete unit is available. Separated from the
/// socket handling so fragmentation behavior is testable byte-by-byte.
pub(crate) struct StreamAssembler {
    buf: Vec<u8>,
    state: StreamState,
    tracker: SequenceTracker,
    sequence_aware: bool,
    policy: DuplicatePolicy,
    /// Pixel buffer byte capacity, cached so the length check needs no lock
    max_len: usize,
}

impl StreamAssembler {
    pub fn new(sequence_aware: bool, policy: DuplicatePolicy, max_len: usize) -> Self {
        StreamAssembler {
            buf: Vec::new(),
            state: StreamState::AwaitHeader,
            tracker: SequenceTracker::new(),
            sequence_aware,
            policy,
            max_len,
        }
    }

    /// Fresh connection: drop buffered bytes, counters back to defaults
    pub fn reset(&mut self) {
        self.buf.clear();
        self.state = StreamState::AwaitHeader;
        self.tracker.reset();
    }

    pub fn tracker(&self) -> &SequenceTracker {
        &self.tracker
    }

    /// Append freshly read bytes and run the state machine as far as the
    /// buffered data allows. A Some(close) outcome means the caller must
    /// drop the connection; buffered state is only reset on the next accept.
    pub fn feed(&mut self, bytes: &[u8], pixels: &Mutex<PixelBuffer>) -> FeedOutcome {
        self.buf.extend_from_slice(bytes);
        let mut applied = 0u64;

        loop {
            match self.state {
                StreamState::AwaitHeader => {
                    let wire = OpcHeader::wire_size(self.sequence_aware);
                    let Some(header) = OpcHeader::decode(&self.buf, self.sequence_aware) else {
                        break; // wait for more data
                    };
                    self.buf.drain(..wire);
                    self.state = StreamState::AwaitBody(header);
                }
                StreamState::AwaitBody(header) => {
                    let len = header.length as usize;
                    if len > self.max_len {
                        return FeedOutcome {
                            applied,
                            close: Some(CloseReason::OversizeLength(header.length)),
                        };
                    }
                    if self.buf.len() < len {
                        break; // wait for more data
                    }

                    if header.command != CMD_SET_PIXELS {
                        return FeedOutcome {
                            applied,
                            close: Some(CloseReason::UnknownCommand(header.command)),
                        };
                    }

                    let apply = match header.sequence {
                        Some(seq) => match self.tracker.observe(seq) {
                            SeqVerdict::Stale => false,
                            SeqVerdict::Duplicate => self.policy == DuplicatePolicy::Accept,
                            _ => true,
                        },
                        None => true,
                    };

                    if apply {
                        lock_pixels(pixels).write_packed(&self.buf[..len]);
                        applied += 1;
                    }
                    // stale/discarded frames still consume their payload
                    self.buf.drain(..len);
                    self.state = StreamState::AwaitHeader;
                }
            }
        }

        FeedOutcome {
            applied,
            close: None,
        }
    }
}

/// Stream ingestion over a single-slot TCP listener.
///
/// Only one client at a time: a new inbound connection unconditionally evicts
/// the current one. Each `poll()` drains the socket without blocking and runs
/// the assembler over whatever arrived.
pub struct TcpSource {
    addr: String,
    listener: Option<TcpListener>,
    client: Option<TcpStream>,
    asm: StreamAssembler,
    pixels: Arc<Mutex<PixelBuffer>>,
    last_frame: AtomicU64,
    clock: Clock,
    read_buf: Vec<u8>,
    debug: bool,
}

impl TcpSource {
    pub fn new(
        addr: String,
        sequence_aware: bool,
        policy: DuplicatePolicy,
        pixels: Arc<Mutex<PixelBuffer>>,
        clock: Clock,
        debug: bool,
    ) -> Self {
        let max_len = lock_pixels(&pixels).byte_len();
        TcpSource {
            addr,
            listener: None,
            client: None,
            asm: StreamAssembler::new(sequence_aware, policy, max_len),
            pixels,
            last_frame: AtomicU64::new(0),
            clock,
            read_buf: vec![0u8; RECV_BUFFER_SIZE],
            debug,
        }
    }

    fn close_client(&mut self, why: &str) {
        if self.debug {
            println!("Closing connection: {}", why);
        }
        self.client = None;
    }

    fn accept_pending(&mut self) {
        let Some(listener) = self.listener.as_ref() else {
            return;
        };
        match listener.accept() {
            Ok((stream, peer)) => {
                if let Err(e) = stream.set_nonblocking(true) {
                    eprintln!("Failed to set client non-blocking: {}", e);
                    return;
                }
                if self.client.is_some() {
                    self.close_client("evicted by new client");
                }
                if self.debug {
                    println!("✓ Client connected from {}", peer);
                }
                self.asm.reset();
                self.client = Some(stream);
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => eprintln!("Error accepting connection: {}", e),
        }
    }
}

impl IngestSource for TcpSource {
    fn begin(&mut self) -> Result<()> {
        let listener = TcpListener::bind(&self.addr)
            .context(format!("Failed to bind TCP {}", self.addr))?;
        listener.set_nonblocking(true)?;
        if self.debug {
            println!("✓ OPC listening on tcp://{}", self.addr);
        }
        self.listener = Some(listener);
        Ok(())
    }

    fn poll(&mut self) -> Result<u64> {
        if self.listener.is_none() {
            anyhow::bail!("poll() before begin()");
        }
        self.accept_pending();

        // Drain everything the socket has right now, then run the
        // assembler once over the lot.
        let mut incoming = Vec::new();
        let mut close: Option<&'static str> = None;
        match self.client.as_mut() {
            None => return Ok(0),
            Some(stream) => loop {
                match stream.read(&mut self.read_buf) {
                    Ok(0) => {
                        close = Some("client disconnected");
                        break;
                    }
                    Ok(n) => incoming.extend_from_slice(&self.read_buf[..n]),
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => {
                        eprintln!("Read error mid-frame: {}", e);
                        close = Some("read error");
                        break;
                    }
                }
            },
        }

        let mut applied = 0u64;
        if !incoming.is_empty() {
            let outcome = self.asm.feed(&incoming, &self.pixels);
            applied = outcome.applied;
            if let Some(reason) = outcome.close {
                eprintln!("Protocol violation: {}", reason);
                close = Some("protocol violation");
            }
        }
        if let Some(why) = close {
            self.close_client(why);
        }

        if applied > 0 {
            self.last_frame
                .store(self.clock.now_millis(), Ordering::Relaxed);
        }
        Ok(applied)
    }

    fn last_frame_millis(&self) -> u64 {
        self.last_frame.load(Ordering::Relaxed)
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            dropped: self.asm.tracker().dropped(),
            stale: self.asm.tracker().stale(),
        }
    }
}
