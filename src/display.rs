/// Fixed-capacity RGB pixel buffer.
///
/// The single piece of state shared between ingestion and display: sources
/// write whole decoded frames into it, the commit step reads it. Stored raw
/// (uncorrected) so the contents can be re-displayed or dumped without
/// double-applying gamma.
pub struct PixelBuffer {
    data: Vec<u8>,
}

impl PixelBuffer {
    pub fn new(pixel_count: usize) -> Self {
        PixelBuffer {
            data: vec![0u8; pixel_count * 3],
        }
    }

    /// Number of pixels
    #[allow(dead_code)]
    pub fn capacity(&self) -> usize {
        self.data.len() / 3
    }

    /// Number of backing bytes (capacity * 3)
    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    /// Copy packed RGB bytes into the front of the buffer, truncating to
    /// capacity. Returns the number of bytes actually written.
    pub fn write_packed(&mut self, payload: &[u8]) -> usize {
        let n = payload.len().min(self.data.len());
        self.data[..n].copy_from_slice(&payload[..n]);
        n
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    #[allow(dead_code)]
    pub fn fill(&mut self, r: u8, g: u8, b: u8) {
        for px in self.data.chunks_exact_mut(3) {
            px[0] = r;
            px[1] = g;
            px[2] = b;
        }
    }
}

/// Per-channel gamma lookup, applied once at commit time.
pub struct GammaTable {
    lut: [u8; 256],
}

impl GammaTable {
    pub fn new(gamma: f32, zero_floor: u16) -> Self {
        let mut table = GammaTable { lut: [0; 256] };
        table.set_gamma(gamma, zero_floor);
        table
    }

    /// Recompute the table. `zero_floor` is the largest input value that is
    /// still allowed to come out fully off; any brighter input that would
    /// round to 0 is forced to 1 so nominally-lit pixels never go dark.
    pub fn set_gamma(&mut self, gamma: f32, zero_floor: u16) {
        for i in 0..256usize {
            let mut v = ((i as f32 / 255.0).powf(gamma) * 255.0).round() as u8;
            if i as u16 > zero_floor && v == 0 {
                v = 1;
            }
            self.lut[i] = v;
        }
    }

    /// Correct a packed RGB frame in place
    pub fn apply(&self, frame: &mut [u8]) {
        for b in frame.iter_mut() {
            *b = self.lut[*b as usize];
        }
    }
}

/// Fill a packed RGB frame with a hue ramp, `hue_delta` hue steps per pixel.
/// Used as the idle pattern when no sender is live.
pub fn fill_rainbow(frame: &mut [u8], start_hue: u8, hue_delta: u8) {
    let mut hue = start_hue;
    for px in frame.chunks_exact_mut(3) {
        let (r, g, b) = hue_to_rgb(hue);
        px[0] = r;
        px[1] = g;
        px[2] = b;
        hue = hue.wrapping_add(hue_delta);
    }
}

/// Full-saturation, full-value HSV to RGB over a 0..=255 hue wheel
fn hue_to_rgb(hue: u8) -> (u8, u8, u8) {
    let region = hue / 43; // six ~43-step sectors
    let t = (u16::from(hue % 43) * 6).min(255) as u8; // ramp within the sector
    let q = 255 - t;

    match region {
        0 => (255, t, 0),
        1 => (q, 255, 0),
        2 => (0, 255, t),
        3 => (0, q, 255),
        4 => (t, 0, 255),
        _ => (255, 0, q),
    }
}
