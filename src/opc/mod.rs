use anyhow::Result;

pub mod callback;
pub mod sequence;
pub mod tcp;
pub mod udp;

/// Default Open Pixel Control port
pub const OPC_PORT: u16 = 7890;

/// OPC command: set pixel string (RGB triples)
pub const CMD_SET_PIXELS: u8 = 0x00;
/// OPC command: device command (reserved)
pub const CMD_DEVICE: u8 = 0xff;

/// Decoded OPC frame header.
///
/// Wire layout is big-endian: channel (1), command (1), length (2), and an
/// optional sequence counter (2) used by the sequence-aware variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpcHeader {
    pub channel: u8,
    pub command: u8,
    /// Payload byte count as declared by the sender; may exceed buffer capacity
    pub length: u16,
    pub sequence: Option<u16>,
}

impl OpcHeader {
    /// Size of the wire header in bytes
    pub fn wire_size(sequence_aware: bool) -> usize {
        if sequence_aware { 6 } else { 4 }
    }

    /// Decode a header from the front of `buf`.
    ///
    /// Returns None when fewer than `wire_size` bytes are available; nothing
    /// is consumed in that case and the caller must buffer and retry. No
    /// length or command validation happens here.
    pub fn decode(buf: &[u8], sequence_aware: bool) -> Option<OpcHeader> {
        if buf.len() < Self::wire_size(sequence_aware) {
            return None;
        }

        let sequence = if sequence_aware {
            Some(u16::from_be_bytes([buf[4], buf[5]]))
        } else {
            None
        };

        Some(OpcHeader {
            channel: buf[0],
            command: buf[1],
            length: u16::from_be_bytes([buf[2], buf[3]]),
            sequence,
        })
    }

    /// Encode this header onto the end of `out`
    #[allow(dead_code)]
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.channel);
        out.push(self.command);
        out.extend_from_slice(&self.length.to_be_bytes());
        if let Some(seq) = self.sequence {
            out.extend_from_slice(&seq.to_be_bytes());
        }
    }
}

/// Per-source counters reported alongside fps statistics
#[derive(Debug, Clone, Copy, Default)]
pub struct SourceStats {
    pub dropped: u64,
    pub stale: u64,
}

/// One OPC ingestion transport.
///
/// The three implementations (polled UDP, reassembling TCP, callback-driven
/// UDP) share this surface so the main loop does not care which transport is
/// configured.
pub trait IngestSource {
    /// Bind the transport (and start any receive thread)
    fn begin(&mut self) -> Result<()>;

    /// Drain pending input; returns the number of frames whose payload was
    /// applied to the pixel buffer during this call.
    fn poll(&mut self) -> Result<u64>;

    /// Milliseconds (process clock) of the most recent applied frame; 0 if
    /// none has arrived yet.
    fn last_frame_millis(&self) -> u64;

    fn stats(&self) -> SourceStats;
}
