//! Raw PCM16 payload conversion
//!
//! Stateless: each payload is a run of signed 16-bit little-endian samples,
//! normalized to f32 by dividing by 32768. An odd trailing byte cannot be
//! half a sample and is truncated.

/// Convert a PCM16 LE byte payload to mono f32 samples.
pub fn decode_pcm16(payload: &[u8]) -> Vec<f32> {
    let even_len = payload.len() & !1;
    let mut samples = Vec::with_capacity(even_len / 2);
    for pair in payload[..even_len].chunks_exact(2) {
        let value = i16::from_le_bytes([pair[0], pair[1]]);
        samples.push(value as f32 / 32_768.0);
    }
    samples
}
