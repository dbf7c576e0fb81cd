//! Sample rate conversion to the fixed output rate
//!
//! The transport delivers speech at whatever rate the synthesis backend
//! produces (24 kHz in the common deployment); the output device runs at a
//! fixed working rate. Each decoded buffer is converted with a
//! polynomial-interpolation resampler sized to the buffer.

use crate::error::{Error, Result};
use rubato::{FastFixedIn, PolynomialDegree, Resampler as RubatoResampler};
use tracing::debug;

/// Resample mono samples from `input_rate` to `output_rate`.
///
/// Returns the input unchanged when the rates already match.
pub fn resample_mono(input: &[f32], input_rate: u32, output_rate: u32) -> Result<Vec<f32>> {
    if input_rate == output_rate {
        return Ok(input.to_vec());
    }
    if input.is_empty() {
        return Ok(Vec::new());
    }

    debug!(
        input_rate,
        output_rate,
        frames = input.len(),
        "resampling buffer"
    );

    // Chunk size equal to the input length: one process() call per buffer.
    let mut resampler = FastFixedIn::<f32>::new(
        output_rate as f64 / input_rate as f64,
        1.0,
        PolynomialDegree::Septic,
        input.len(),
        1,
    )
    .map_err(|e| Error::Decode(format!("Failed to create resampler: {}", e)))?;

    let planar_input = vec![input.to_vec()];
    let mut planar_output = resampler
        .process(&planar_input, None)
        .map_err(|e| Error::Decode(format!("Resampling failed: {}", e)))?;

    Ok(planar_output.remove(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_rate_is_identity() {
        let input = vec![0.1, -0.2, 0.3];
        let output = resample_mono(&input, 48_000, 48_000).unwrap();
        assert_eq!(output, input);
    }

    #[test]
    fn test_empty_input() {
        assert!(resample_mono(&[], 24_000, 48_000).unwrap().is_empty());
    }

    #[test]
    fn test_upsample_ratio() {
        // 100 ms of a 200 Hz tone at 24 kHz.
        let input_rate = 24_000u32;
        let frames = 2_400usize;
        let input: Vec<f32> = (0..frames)
            .map(|i| {
                let t = i as f32 / input_rate as f32;
                (2.0 * std::f32::consts::PI * 200.0 * t).sin() * 0.5
            })
            .collect();

        let output = resample_mono(&input, input_rate, 48_000).unwrap();

        let expected = frames * 2;
        assert!(
            output.len() >= expected - 20 && output.len() <= expected + 20,
            "Expected ~{} frames, got {}",
            expected,
            output.len()
        );
        assert!(output.iter().all(|s| s.abs() <= 1.0));
    }
}
