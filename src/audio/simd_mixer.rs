// src/audio/simd_mixer.rs
// SIMD sample copies used by audio channel playback and recording

use wide::f32x4;

/// Add `src * gain` onto `dest` and return the largest absolute value
/// written. Only the common prefix of both slices is touched.
#[inline]
pub fn add_scaled(dest: &mut [f32], src: &[f32], gain: f32) -> f32 {
    let len = dest.len().min(src.len());
    let gain_vec = f32x4::splat(gain);
    let mut peak_vec = f32x4::splat(0.0);
    let chunks = len / 4;

    for i in 0..chunks {
        let idx = i * 4;
        let dest_vec = f32x4::new([dest[idx], dest[idx + 1], dest[idx + 2], dest[idx + 3]]);
        let src_vec = f32x4::new([src[idx], src[idx + 1], src[idx + 2], src[idx + 3]]);

        // dest += src * gain
        let result = dest_vec + (src_vec * gain_vec);
        peak_vec = peak_vec.max(result.abs());
        dest[idx..idx + 4].copy_from_slice(&result.to_array());
    }

    let mut peak = peak_vec.to_array().into_iter().fold(0.0f32, f32::max);

    // Remainder
    for i in chunks * 4..len {
        let sample = dest[i] + src[i] * gain;
        dest[i] = sample;
        peak = peak.max(sample.abs());
    }
    peak
}

/// Plain copy of the common prefix. Returns the number of samples copied.
#[inline]
pub fn copy_samples(dest: &mut [f32], src: &[f32]) -> usize {
    let len = dest.len().min(src.len());
    dest[..len].copy_from_slice(&src[..len]);
    len
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scalar_add(dest: &mut [f32], src: &[f32], gain: f32) {
        for (d, s) in dest.iter_mut().zip(src) {
            *d += s * gain;
        }
    }

    #[test]
    fn test_add_scaled_matches_scalar() {
        let src: Vec<f32> = (0..37).map(|i| (i as f32 * 0.37).sin()).collect();
        let mut simd_out: Vec<f32> = (0..37).map(|i| i as f32 * 0.01).collect();
        let mut scalar_out = simd_out.clone();

        add_scaled(&mut simd_out, &src, 0.5);
        scalar_add(&mut scalar_out, &src, 0.5);

        for (simd, scalar) in simd_out.iter().zip(scalar_out.iter()) {
            assert!((simd - scalar).abs() < 1e-6, "SIMD mismatch: {} vs {}", simd, scalar);
        }
    }

    #[test]
    fn test_add_scaled_reports_peak_of_mix() {
        let mut dest = vec![0.5, -0.25, 0.0, 0.0, 0.5];
        let src = vec![0.5, -0.5, 0.25, 0.0, -1.0];
        let peak = add_scaled(&mut dest, &src, 1.0);
        assert_eq!(dest, vec![1.0, -0.75, 0.25, 0.0, -0.5]);
        assert!((peak - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_add_scaled_uses_shorter_slice() {
        let mut dest = vec![0.0; 3];
        let src = vec![1.0; 8];
        add_scaled(&mut dest, &src, 2.0);
        assert_eq!(dest, vec![2.0, 2.0, 2.0]);
    }

    #[test]
    fn test_copy_samples_uses_shorter_slice() {
        let mut dest = vec![0.0; 4];
        assert_eq!(copy_samples(&mut dest, &[1.0, 2.0]), 2);
        assert_eq!(dest, vec![1.0, 2.0, 0.0, 0.0]);
    }
}
