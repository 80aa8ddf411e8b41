/// Build an Adalight serial frame: 'Ada' magic, LED count, checksum, then
/// the packed RGB payload.
pub fn build_adalight_frame(pixel_data: &[u8]) -> Vec<u8> {
    let led_count = pixel_data.len() / 3;

    let count_hi = (led_count >> 8) as u8;
    let count_lo = led_count as u8;
    let checksum = count_hi ^ count_lo ^ 0x55;

    let mut frame = Vec::with_capacity(6 + pixel_data.len());
    frame.extend_from_slice(&[0x41, 0x64, 0x61]); // 'Ada'
    frame.push(count_hi);
    frame.push(count_lo);
    frame.push(checksum);
    frame.extend_from_slice(pixel_data);

    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adalight_header_layout() {
        let frame = build_adalight_frame(&[1, 2, 3, 4, 5, 6]);
        assert_eq!(&frame[..3], b"Ada");
        assert_eq!(frame[3], 0); // count hi
        assert_eq!(frame[4], 2); // count lo
        assert_eq!(frame[5], 0 ^ 2 ^ 0x55);
        assert_eq!(&frame[6..], &[1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_adalight_large_count() {
        let frame = build_adalight_frame(&vec![0u8; 300 * 3]);
        assert_eq!(frame[3], 1); // 300 = 0x012c
        assert_eq!(frame[4], 0x2c);
    }
}
