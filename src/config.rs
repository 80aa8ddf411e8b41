use serde::{Deserialize, Serialize};

use crate::opc::sequence::DuplicatePolicy;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub opc: OpcConfig,
    #[serde(default)]
    pub display: DisplayConfig,
    #[serde(default)]
    pub outputs: Vec<OutputConfig>,
}

/// Which ingestion transport to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Transport {
    #[default]
    Udp,
    Tcp,
    /// UDP on a dedicated receive thread instead of polled from the loop
    UdpCallback,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OpcConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub transport: Transport,
    /// Pixel buffer capacity in pixels
    pub pixel_count: usize,
    /// Whether senders include the 2-byte sequence counter after the header
    #[serde(default = "default_true")]
    pub sequence_aware: bool,
    #[serde(default)]
    pub duplicate_policy: DuplicatePolicy,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DisplayConfig {
    #[serde(default = "default_gamma")]
    pub gamma: f32,
    /// Largest input value allowed to render fully off
    #[serde(default = "default_zero_floor")]
    pub gamma_zero_floor: u16,
    #[serde(default = "default_target_fps")]
    pub target_fps: f32,
    /// Sleep out each loop iteration to the target rate
    #[serde(default = "default_true")]
    pub pacing: bool,
    /// Fall back to the idle pattern after this long without a frame
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_ms: u64,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        DisplayConfig {
            gamma: default_gamma(),
            gamma_zero_floor: default_zero_floor(),
            target_fps: default_target_fps(),
            pacing: true,
            idle_timeout_ms: default_idle_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutputConfig {
    pub port: String,
    pub baud_rate: u32,
    pub led_count: usize,
    /// First pixel of the shared buffer this output renders
    #[serde(default)]
    pub opc_offset: usize,
    pub pixel_format: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_port() -> u16 {
    crate::opc::OPC_PORT
}

fn default_gamma() -> f32 {
    2.2
}

fn default_zero_floor() -> u16 {
    255
}

fn default_target_fps() -> f32 {
    60.0
}

fn default_idle_timeout() -> u64 {
    100
}
