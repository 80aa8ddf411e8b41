use anyhow::{Context, Result};
use std::io::ErrorKind;
use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::display::PixelBuffer;
use crate::governor::Clock;
use crate::opc::sequence::{DuplicatePolicy, SequenceTracker};
use crate::opc::udp::ingest_datagram;
use crate::opc::{IngestSource, SourceStats};

/// Push-driven datagram ingestion.
///
/// Same wire contract as UdpSource, but the decode/bound/commit work happens
/// on a dedicated receive thread the moment a datagram arrives instead of
/// waiting for the main loop's poll. The thread is the only writer on its
/// side; completed frames become visible to the render step whole, through
/// the pixel buffer lock, and `poll()` just collects the count of frames
/// committed since the last call.
pub struct CallbackSource {
    addr: String,
    sequence_aware: bool,
    policy: DuplicatePolicy,
    pixels: Arc<Mutex<PixelBuffer>>,
    clock: Clock,
    got: Arc<AtomicU64>,
    last_frame: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
    stale: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
    local_addr: Option<std::net::SocketAddr>,
    debug: bool,
    ddebug: bool,
}

impl CallbackSource {
    pub fn new(
        addr: String,
        sequence_aware: bool,
        policy: DuplicatePolicy,
        pixels: Arc<Mutex<PixelBuffer>>,
        clock: Clock,
        debug: bool,
        ddebug: bool,
    ) -> Self {
        CallbackSource {
            addr,
            sequence_aware,
            policy,
            pixels,
            clock,
            got: Arc::new(AtomicU64::new(0)),
            last_frame: Arc::new(AtomicU64::new(0)),
            dropped: Arc::new(AtomicU64::new(0)),
            stale: Arc::new(AtomicU64::new(0)),
            running: Arc::new(AtomicBool::new(true)),
            handle: None,
            local_addr: None,
            debug,
            ddebug,
        }
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl IngestSource for CallbackSource {
    fn begin(&mut self) -> Result<()> {
        let socket = UdpSocket::bind(&self.addr)
            .context(format!("Failed to bind UDP {}", self.addr))?;
        // bounded timeout so the thread notices shutdown
        socket.set_read_timeout(Some(Duration::from_millis(100)))?;
        self.local_addr = Some(socket.local_addr()?);
        if self.debug {
            println!("✓ OPC listening on udp://{} (receive thread)", self.addr);
        }

        let sequence_aware = self.sequence_aware;
        let policy = self.policy;
        let pixels = Arc::clone(&self.pixels);
        let clock = self.clock.clone();
        let got = Arc::clone(&self.got);
        let last_frame = Arc::clone(&self.last_frame);
        let dropped = Arc::clone(&self.dropped);
        let stale = Arc::clone(&self.stale);
        let running = Arc::clone(&self.running);
        let ddebug = self.ddebug;

        self.handle = Some(thread::spawn(move || {
            receive_thread(
                socket, sequence_aware, policy, pixels, clock, got, last_frame, dropped, stale,
                running, ddebug,
            );
        }));
        Ok(())
    }

    /// Collect and reset the count of frames the receive thread committed
    /// since the previous call.
    fn poll(&mut self) -> Result<u64> {
        if self.handle.is_none() {
            anyhow::bail!("poll() before begin()");
        }
        Ok(self.got.swap(0, Ordering::Relaxed))
    }

    fn last_frame_millis(&self) -> u64 {
        self.last_frame.load(Ordering::Relaxed)
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            dropped: self.dropped.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
        }
    }
}

impl Drop for CallbackSource {
    fn drop(&mut self) {
        self.stop();
    }
}

#[allow(clippy::too_many_arguments)]
fn receive_thread(
    socket: UdpSocket,
    sequence_aware: bool,
    policy: DuplicatePolicy,
    pixels: Arc<Mutex<PixelBuffer>>,
    clock: Clock,
    got: Arc<AtomicU64>,
    last_frame: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
    stale: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
    ddebug: bool,
) {
    let mut tracker = SequenceTracker::new();
    let mut buf = vec![0u8; 65536];

    while running.load(Ordering::Relaxed) {
        match socket.recv(&mut buf) {
            Ok(n) => {
                if ingest_datagram(&buf[..n], sequence_aware, policy, &mut tracker, &pixels, ddebug)
                {
                    got.fetch_add(1, Ordering::Relaxed);
                    last_frame.store(clock.now_millis(), Ordering::Relaxed);
                }
                dropped.store(tracker.dropped(), Ordering::Relaxed);
                stale.store(tracker.stale(), Ordering::Relaxed);
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                continue;
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                eprintln!("UDP receive thread error: {}", e);
                thread::sleep(Duration::from_millis(100));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opc::udp::lock_pixels;
    use crate::opc::{OpcHeader, CMD_SET_PIXELS};

    #[test]
    fn test_callback_source_commits_from_receive_thread() {
        let pixels = Arc::new(Mutex::new(PixelBuffer::new(2)));
        let mut source = CallbackSource::new(
            "127.0.0.1:0".to_string(),
            true,
            DuplicatePolicy::Accept,
            Arc::clone(&pixels),
            Clock::new(),
            false,
            false,
        );
        source.begin().unwrap();
        let addr = source.local_addr.unwrap();

        let mut dg = Vec::new();
        OpcHeader {
            channel: 0,
            command: CMD_SET_PIXELS,
            length: 6,
            sequence: Some(1),
        }
        .encode(&mut dg);
        dg.extend_from_slice(&[10, 20, 30, 40, 50, 60]);

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(&dg, addr).unwrap();

        // the receive thread commits on its own schedule; poll until it has
        let mut applied = 0;
        for _ in 0..100 {
            thread::sleep(Duration::from_millis(10));
            applied += source.poll().unwrap();
            if applied > 0 {
                break;
            }
        }

        assert_eq!(applied, 1);
        assert_eq!(lock_pixels(&pixels).as_bytes(), &[10, 20, 30, 40, 50, 60]);
        assert!(source.last_frame_millis() > 0);

        // a second poll with nothing new reads zero
        assert_eq!(source.poll().unwrap(), 0);
        source.stop();
    }
}
