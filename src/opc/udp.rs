use anyhow::{Context, Result};
use std::io::ErrorKind;
use std::net::UdpSocket;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::display::PixelBuffer;
use crate::governor::Clock;
use crate::opc::sequence::{DuplicatePolicy, SeqVerdict, SequenceTracker};
use crate::opc::{IngestSource, OpcHeader, SourceStats, CMD_DEVICE, CMD_SET_PIXELS};

/// Largest possible UDP payload
const DATAGRAM_BUFFER_SIZE: usize = 65536;

pub(crate) fn lock_pixels(pixels: &Mutex<PixelBuffer>) -> MutexGuard<'_, PixelBuffer> {
    pixels.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Process one complete datagram. Returns true when a pixel frame was applied
/// to the buffer.
///
/// A datagram is one frame: whatever this function does not consume is
/// dropped with the datagram, so a short header or an over-declared length
/// can never bleed into the next frame. Shared by the polled and
/// callback-driven UDP sources.
pub(crate) fn ingest_datagram(
    datagram: &[u8],
    sequence_aware: bool,
    policy: DuplicatePolicy,
    tracker: &mut SequenceTracker,
    pixels: &Mutex<PixelBuffer>,
    ddebug: bool,
) -> bool {
    let Some(header) = OpcHeader::decode(datagram, sequence_aware) else {
        if ddebug {
            eprintln!("[DEBUG] Runt datagram ({} bytes), discarded", datagram.len());
        }
        return false;
    };
    let payload = &datagram[OpcHeader::wire_size(sequence_aware)..];

    if let Some(seq) = header.sequence {
        match tracker.observe(seq) {
            SeqVerdict::Stale => {
                if ddebug {
                    eprintln!("[DEBUG] Stale sequence {} (last {})", seq, tracker.last_sequence());
                }
                return false;
            }
            SeqVerdict::Duplicate if policy == DuplicatePolicy::Discard => return false,
            SeqVerdict::Gap { missed } => {
                if ddebug {
                    eprintln!("[DEBUG] Sequence gap: {} frame(s) missed before {}", missed, seq);
                }
            }
            _ => {}
        }
    }

    match header.command {
        CMD_SET_PIXELS => {
            let mut pixels = lock_pixels(pixels);
            let want = (header.length as usize).min(pixels.byte_len());
            if payload.len() < want {
                eprintln!(
                    "Truncated datagram: {} payload bytes, header declared {}",
                    payload.len(),
                    header.length
                );
                return false;
            }
            pixels.write_packed(&payload[..want]);
            if header.length as usize > pixels.byte_len() {
                // excess bytes die with the datagram; the frame still counts
                eprintln!(
                    "Length {} exceeds buffer capacity {}",
                    header.length,
                    pixels.byte_len()
                );
            }
            true
        }
        CMD_DEVICE => {
            // reserved, currently a no-op
            false
        }
        other => {
            eprintln!("Unknown OPC command 0x{:02x}, ignored", other);
            false
        }
    }
}

/// Polled datagram ingestion: each `poll()` drains every pending datagram
/// from a non-blocking UDP socket.
pub struct UdpSource {
    addr: String,
    socket: Option<UdpSocket>,
    tracker: SequenceTracker,
    sequence_aware: bool,
    policy: DuplicatePolicy,
    pixels: Arc<Mutex<PixelBuffer>>,
    last_frame: AtomicU64,
    clock: Clock,
    recv_buf: Vec<u8>,
    debug: bool,
    ddebug: bool,
}

impl UdpSource {
    pub fn new(
        addr: String,
        sequence_aware: bool,
        policy: DuplicatePolicy,
        pixels: Arc<Mutex<PixelBuffer>>,
        clock: Clock,
        debug: bool,
        ddebug: bool,
    ) -> Self {
        UdpSource {
            addr,
            socket: None,
            tracker: SequenceTracker::new(),
            sequence_aware,
            policy,
            pixels,
            last_frame: AtomicU64::new(0),
            clock,
            recv_buf: vec![0u8; DATAGRAM_BUFFER_SIZE],
            debug,
            ddebug,
        }
    }
}

impl IngestSource for UdpSource {
    fn begin(&mut self) -> Result<()> {
        let socket = UdpSocket::bind(&self.addr)
            .context(format!("Failed to bind UDP {}", self.addr))?;
        socket.set_nonblocking(true)?;
        if self.debug {
            println!("✓ OPC listening on udp://{}", self.addr);
        }
        self.socket = Some(socket);
        Ok(())
    }

    fn poll(&mut self) -> Result<u64> {
        let socket = self.socket.as_ref().context("poll() before begin()")?;
        let mut applied = 0u64;

        loop {
            match socket.recv(&mut self.recv_buf) {
                Ok(n) => {
                    if ingest_datagram(
                        &self.recv_buf[..n],
                        self.sequence_aware,
                        self.policy,
                        &mut self.tracker,
                        &self.pixels,
                        self.ddebug,
                    ) {
                        applied += 1;
                        self.last_frame
                            .store(self.clock.now_millis(), Ordering::Relaxed);
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e).context("UDP receive failed"),
            }
        }

        Ok(applied)
    }

    fn last_frame_millis(&self) -> u64 {
        self.last_frame.load(Ordering::Relaxed)
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            dropped: self.tracker.dropped(),
            stale: self.tracker.stale(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn datagram(command: u8, length: u16, sequence: u16, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        OpcHeader {
            channel: 0,
            command,
            length,
            sequence: Some(sequence),
        }
        .encode(&mut out);
        out.extend_from_slice(payload);
        out
    }

    fn two_pixels() -> Mutex<PixelBuffer> {
        Mutex::new(PixelBuffer::new(2))
    }

    #[test]
    fn test_set_pixels_end_to_end() {
        let pixels = two_pixels();
        let mut tracker = SequenceTracker::new();
        let dg = datagram(CMD_SET_PIXELS, 6, 1, &[10, 20, 30, 40, 50, 60]);

        let applied = ingest_datagram(&dg, true, DuplicatePolicy::Accept, &mut tracker, &pixels, false);

        assert!(applied);
        assert_eq!(lock_pixels(&pixels).as_bytes(), &[10, 20, 30, 40, 50, 60]);
    }

    #[test]
    fn test_short_header_discarded() {
        let pixels = two_pixels();
        let mut tracker = SequenceTracker::new();
        assert!(!ingest_datagram(&[0, 0, 0], true, DuplicatePolicy::Accept, &mut tracker, &pixels, false));
        assert_eq!(tracker.last_sequence(), 0);
    }

    #[test]
    fn test_oversize_length_truncates_but_counts() {
        let pixels = two_pixels();
        let mut tracker = SequenceTracker::new();
        // declares 9 bytes against a 6-byte buffer, ships all 9
        let dg = datagram(CMD_SET_PIXELS, 9, 1, &[1, 2, 3, 4, 5, 6, 7, 8, 9]);

        let applied = ingest_datagram(&dg, true, DuplicatePolicy::Accept, &mut tracker, &pixels, false);

        assert!(applied);
        assert_eq!(lock_pixels(&pixels).as_bytes(), &[1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_truncated_payload_discarded() {
        let pixels = two_pixels();
        let mut tracker = SequenceTracker::new();
        let dg = datagram(CMD_SET_PIXELS, 6, 1, &[1, 2, 3]); // 3 of 6 promised bytes

        assert!(!ingest_datagram(&dg, true, DuplicatePolicy::Accept, &mut tracker, &pixels, false));
        assert_eq!(lock_pixels(&pixels).as_bytes(), &[0; 6]);
    }

    #[test]
    fn test_stale_leaves_buffer_untouched() {
        let pixels = two_pixels();
        let mut tracker = SequenceTracker::new();

        let dg5 = datagram(CMD_SET_PIXELS, 6, 5, &[9; 6]);
        assert!(ingest_datagram(&dg5, true, DuplicatePolicy::Accept, &mut tracker, &pixels, false));

        let dg3 = datagram(CMD_SET_PIXELS, 6, 3, &[1; 6]);
        assert!(!ingest_datagram(&dg3, true, DuplicatePolicy::Accept, &mut tracker, &pixels, false));

        assert_eq!(lock_pixels(&pixels).as_bytes(), &[9; 6]);
        assert_eq!(tracker.stale(), 1);
    }

    #[test]
    fn test_duplicate_policy() {
        let pixels = two_pixels();
        let mut tracker = SequenceTracker::new();
        let first = datagram(CMD_SET_PIXELS, 6, 1, &[9; 6]);
        ingest_datagram(&first, true, DuplicatePolicy::Accept, &mut tracker, &pixels, false);

        let resend = datagram(CMD_SET_PIXELS, 6, 1, &[7; 6]);
        assert!(!ingest_datagram(&resend, true, DuplicatePolicy::Discard, &mut tracker, &pixels, false));
        assert_eq!(lock_pixels(&pixels).as_bytes(), &[9; 6]);

        assert!(ingest_datagram(&resend, true, DuplicatePolicy::Accept, &mut tracker, &pixels, false));
        assert_eq!(lock_pixels(&pixels).as_bytes(), &[7; 6]);
        assert_eq!(tracker.last_sequence(), 1);
    }

    #[test]
    fn test_device_and_unknown_commands_not_counted() {
        let pixels = two_pixels();
        let mut tracker = SequenceTracker::new();

        let dev = datagram(CMD_DEVICE, 0, 1, &[]);
        assert!(!ingest_datagram(&dev, true, DuplicatePolicy::Accept, &mut tracker, &pixels, false));

        let odd = datagram(0x42, 6, 2, &[1; 6]);
        assert!(!ingest_datagram(&odd, true, DuplicatePolicy::Accept, &mut tracker, &pixels, false));
        assert_eq!(lock_pixels(&pixels).as_bytes(), &[0; 6]);
    }

    #[test]
    fn test_sequence_unaware_short_header() {
        let pixels = two_pixels();
        let mut tracker = SequenceTracker::new();
        // 4-byte header, no sequence field
        let mut dg = Vec::new();
        OpcHeader {
            channel: 0,
            command: CMD_SET_PIXELS,
            length: 6,
            sequence: None,
        }
        .encode(&mut dg);
        dg.extend_from_slice(&[5; 6]);

        assert!(ingest_datagram(&dg, false, DuplicatePolicy::Accept, &mut tracker, &pixels, false));
        assert_eq!(lock_pixels(&pixels).as_bytes(), &[5; 6]);
        assert_eq!(tracker.last_sequence(), 0); // tracker never consulted
    }

    #[test]
    fn test_udp_source_loopback() {
        let pixels = Arc::new(Mutex::new(PixelBuffer::new(2)));
        let clock = Clock::new();
        let mut source = UdpSource::new(
            "127.0.0.1:0".to_string(),
            true,
            DuplicatePolicy::Accept,
            Arc::clone(&pixels),
            clock,
            false,
            false,
        );
        source.begin().unwrap();
        let addr = source.socket.as_ref().unwrap().local_addr().unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender
            .send_to(&datagram(CMD_SET_PIXELS, 6, 1, &[10, 20, 30, 40, 50, 60]), addr)
            .unwrap();

        // give the loopback datagram a moment to land
        let mut applied = 0;
        for _ in 0..50 {
            std::thread::sleep(std::time::Duration::from_millis(10));
            applied = source.poll().unwrap();
            if applied > 0 {
                break;
            }
        }

        assert_eq!(applied, 1);
        assert_eq!(lock_pixels(&pixels).as_bytes(), &[10, 20, 30, 40, 50, 60]);
        assert!(source.last_frame_millis() > 0);
    }
}
