use anyhow::{Context, Result};
use serialport::SerialPort;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::config::OutputConfig;
use crate::protocol::build_adalight_frame;

/// Serial LED output with a dedicated worker thread.
///
/// The commit step hands a gamma-corrected frame to `send_frame`; a bounded
/// single-slot queue gives skip-ahead behavior, so a slow serial link drops
/// frames instead of stalling the ingest loop.
pub struct Output {
    config: OutputConfig,
    sender: SyncSender<Vec<u8>>,
    frames_sent: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
    worker_handle: Option<thread::JoinHandle<()>>,
}

impl Output {
    pub fn new(config: OutputConfig, debug: bool) -> Result<Self> {
        let port = open_port(&config)?;

        let (sender, receiver) = mpsc::sync_channel::<Vec<u8>>(1);
        let frames_sent = Arc::new(AtomicU64::new(0));
        let running = Arc::new(AtomicBool::new(true));

        let worker_config = config.clone();
        let worker_frames_sent = Arc::clone(&frames_sent);
        let worker_running = Arc::clone(&running);
        let worker_handle = thread::spawn(move || {
            worker_thread(port, receiver, worker_config, worker_frames_sent, worker_running);
        });

        if debug {
            println!(
                "✓ Opened {} (offset {}, {} LEDs @ {} baud)",
                config.port, config.opc_offset, config.led_count, config.baud_rate
            );
        }

        Ok(Output {
            config,
            sender,
            frames_sent,
            running,
            worker_handle: Some(worker_handle),
        })
    }

    pub fn config(&self) -> &OutputConfig {
        &self.config
    }

    /// Queue a frame, dropping it if the worker is still busy (skip-ahead)
    pub fn send_frame(&self, pixel_data: Vec<u8>) {
        match self.sender.try_send(pixel_data) {
            Ok(_) => {}
            Err(TrySendError::Full(_)) => {}
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    #[allow(dead_code)]
    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.worker_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Output {
    fn drop(&mut self) {
        self.stop();
    }
}

fn open_port(config: &OutputConfig) -> Result<Box<dyn SerialPort>> {
    let mut port = serialport::new(&config.port, config.baud_rate)
        .data_bits(serialport::DataBits::Eight)
        .parity(serialport::Parity::None)
        .stop_bits(serialport::StopBits::One)
        .flow_control(serialport::FlowControl::None)
        .open()
        .context(format!("Failed to open serial port {}", config.port))?;

    port.set_timeout(Duration::from_millis(1000))
        .context("Failed to set serial port timeout")?;

    if let Err(e) = port.write_data_terminal_ready(true) {
        eprintln!("Warning: Failed to set DTR on {}: {}", config.port, e);
    }

    // let the device settle after DTR
    thread::sleep(Duration::from_millis(100));

    Ok(port)
}

fn worker_thread(
    mut port: Box<dyn SerialPort>,
    receiver: Receiver<Vec<u8>>,
    config: OutputConfig,
    frames_sent: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
) {
    while running.load(Ordering::Relaxed) {
        match receiver.recv_timeout(Duration::from_millis(100)) {
            Ok(pixel_data) => {
                let reordered = reorder_channels(pixel_data, config.pixel_format.as_deref());
                let frame = build_adalight_frame(&reordered);

                if let Err(e) = port.write_all(&frame).and_then(|_| port.flush()) {
                    eprintln!("✗ Serial error on {}: {}", config.port, e);
                    eprintln!("✗ Output {} is now disconnected", config.port);
                    break;
                }
                frames_sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    // best effort: leave the strip dark
    let frame = build_adalight_frame(&vec![0u8; config.led_count * 3]);
    let _ = port.write_all(&frame);
    let _ = port.flush();
}

/// Swap RGB channel order per pixel for strips wired differently
fn reorder_channels(mut data: Vec<u8>, format: Option<&str>) -> Vec<u8> {
    match format {
        Some("GRB") => {
            for i in 0..data.len() / 3 {
                data.swap(i * 3, i * 3 + 1);
            }
        }
        Some("BGR") => {
            for i in 0..data.len() / 3 {
                data.swap(i * 3, i * 3 + 2);
            }
        }
        None | Some("RGB") => {}
        Some(other) => eprintln!("Unknown pixel format {}, sending as RGB", other),
    }
    data
}
