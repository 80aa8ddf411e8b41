use anyhow::Result;
use clap::Parser;
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

mod config;
mod display;
mod governor;
mod opc;
mod output;
mod protocol;

use config::{Config, Transport};
use display::{fill_rainbow, GammaTable, PixelBuffer};
use governor::{Clock, FpsGovernor, LivenessChange, LivenessMonitor};
use opc::callback::CallbackSource;
use opc::tcp::TcpSource;
use opc::udp::{lock_pixels, UdpSource};
use opc::IngestSource;
use output::Output;

#[derive(Parser)]
#[command(name = "pixelserver")]
#[command(about = "OPC pixel server\n\nReceives Open Pixel Control frames over UDP or TCP and drives serial LED strips.", long_about = None)]
struct Cli {
    /// Path to configuration file (JSON)
    config: String,

    /// Enable debug output (status and statistics)
    #[arg(long)]
    debug: bool,

    /// Enable detailed debug (per-frame diagnostics)
    #[arg(long)]
    ddebug: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_data = fs::read_to_string(&cli.config)?;
    let config: Config = serde_json::from_str(&config_data)?;

    // ddebug implies debug
    let debug = cli.debug || cli.ddebug;

    let clock = Clock::new();
    let pixels = Arc::new(Mutex::new(PixelBuffer::new(config.opc.pixel_count)));
    let gamma = GammaTable::new(config.display.gamma, config.display.gamma_zero_floor);

    let mut outputs = Vec::new();
    for output_config in &config.outputs {
        match Output::new(output_config.clone(), debug) {
            Ok(output) => outputs.push(output),
            Err(e) => eprintln!("✗ Failed to open {}: {}", output_config.port, e),
        }
    }
    if outputs.is_empty() && debug {
        println!("No serial outputs available; frames stay in the pixel buffer");
    }

    let addr = format!("{}:{}", config.opc.host, config.opc.port);
    let mut source: Box<dyn IngestSource> = match config.opc.transport {
        Transport::Udp => Box::new(UdpSource::new(
            addr,
            config.opc.sequence_aware,
            config.opc.duplicate_policy,
            Arc::clone(&pixels),
            clock.clone(),
            debug,
            cli.ddebug,
        )),
        Transport::Tcp => Box::new(TcpSource::new(
            addr,
            config.opc.sequence_aware,
            config.opc.duplicate_policy,
            Arc::clone(&pixels),
            clock.clone(),
            debug,
        )),
        Transport::UdpCallback => Box::new(CallbackSource::new(
            addr,
            config.opc.sequence_aware,
            config.opc.duplicate_policy,
            Arc::clone(&pixels),
            clock.clone(),
            debug,
            cli.ddebug,
        )),
    };
    source.begin()?;

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = Arc::clone(&running);
        let debug_for_handler = debug;
        if let Err(e) = ctrlc::set_handler(move || {
            if debug_for_handler {
                println!("\nShutting down...");
            }
            running.store(false, Ordering::Relaxed);
        }) {
            eprintln!("Warning: Could not set Ctrl-C handler: {}", e);
        }
    }

    if debug {
        println!("(Press Ctrl-C to stop)");
    }

    let pacing = config.display.pacing.then_some(config.display.target_fps);
    let mut governor = FpsGovernor::new(pacing, debug);
    let mut liveness = LivenessMonitor::new(config.display.idle_timeout_ms);
    let mut hue: u8 = 0;

    while running.load(Ordering::Relaxed) {
        governor.start_frame();

        let received = match source.poll() {
            Ok(n) => n,
            Err(e) => {
                eprintln!("Ingest error: {}", e);
                0
            }
        };

        match liveness.observe(clock.now_millis(), source.last_frame_millis()) {
            Some(LivenessChange::WentIdle) => {
                if debug {
                    println!(
                        "No frame in {}ms; showing idle pattern",
                        config.display.idle_timeout_ms
                    );
                }
            }
            Some(LivenessChange::WentLive) => {
                if debug {
                    println!("Sender is live");
                }
            }
            None => {}
        }

        if liveness.is_idle() {
            let mut frame = vec![0u8; config.opc.pixel_count * 3];
            fill_rainbow(&mut frame, hue, 5);
            hue = hue.wrapping_add(1);
            commit(&gamma, frame, &outputs);
        } else if received > 0 {
            // copy out so gamma never touches the raw buffer
            let frame = lock_pixels(&pixels).as_bytes().to_vec();
            commit(&gamma, frame, &outputs);
        }

        governor.end_frame();
        if pacing.is_none() {
            // keep the unpaced loop from spinning hot
            thread::sleep(Duration::from_millis(1));
        }
    }

    let stats = source.stats();
    if debug {
        println!(
            "Sequence stats: {} dropped, {} stale",
            stats.dropped, stats.stale
        );
    }

    shutdown(&outputs, debug);
    Ok(())
}

/// Gamma-correct a frame once and fan it out to every output's slice
fn commit(gamma: &GammaTable, mut frame: Vec<u8>, outputs: &[Output]) {
    gamma.apply(&mut frame);

    for output in outputs {
        let config = output.config();
        let offset = config.opc_offset * 3;
        if offset >= frame.len() {
            continue;
        }
        let end = (offset + config.led_count * 3).min(frame.len());
        output.send_frame(frame[offset..end].to_vec());
    }
}

/// Send black frames so the strips go dark on exit
fn shutdown(outputs: &[Output], debug: bool) {
    if debug {
        println!("Turning off LEDs...");
    }

    for output in outputs {
        let black = vec![0u8; output.config().led_count * 3];
        output.send_frame(black);
    }

    // give the workers time to push the black frames out
    thread::sleep(Duration::from_millis(100));

    if debug {
        println!("✓ Server stopped");
    }
}
