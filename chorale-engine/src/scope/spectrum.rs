//! Spectral helper for analyzer widgets
//!
//! Turns a scope window into a log-frequency magnitude spectrum suitable
//! for band-style visualisers: Hann window, real FFT, dB compression,
//! then resampling of the linear bins onto a log-frequency axis. Window
//! sizes are powers of two between 2^3 and 2^9; only the lower half of
//! the transform carries meaning, so the visible spectrum is `size / 2`
//! values long.

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;

/// Smallest supported window exponent (N = 8)
pub const MIN_EXP: usize = 3;
/// Largest supported window exponent (N = 512)
pub const MAX_EXP: usize = 9;

/// Windowed log-frequency spectrum over a power-of-two scope block
pub struct Spectrum {
    exp: usize,
    size: usize,
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    buf: Vec<Complex<f32>>,
    scratch: Vec<Complex<f32>>,
    power: Vec<f32>,
}

impl Spectrum {
    /// Create a spectrum over a `1 << exp` sample window
    ///
    /// `exp` outside `[3, 9]` is clamped.
    pub fn new(exp: usize) -> Self {
        let exp = exp.clamp(MIN_EXP, MAX_EXP);
        let size = 1usize << exp;

        let fft = FftPlanner::new().plan_fft_forward(size);
        let scratch_len = fft.get_inplace_scratch_len();

        // Hann window
        let window = (0..size)
            .map(|i| {
                let x = i as f32 / size as f32;
                0.5 * (1.0 - (2.0 * std::f32::consts::PI * x).cos())
            })
            .collect();

        Self {
            exp,
            size,
            fft,
            window,
            buf: vec![Complex::new(0.0, 0.0); size],
            scratch: vec![Complex::new(0.0, 0.0); scratch_len],
            power: vec![0.0; size / 2],
        }
    }

    /// Window size N
    pub fn size(&self) -> usize {
        self.size
    }

    /// Window exponent (N = 1 << exp)
    pub fn size_exp(&self) -> usize {
        self.exp
    }

    /// Duplicate `size` samples from `src` into `dst`
    pub fn copy(&self, dst: &mut [f32], src: &[f32]) {
        dst[..self.size].copy_from_slice(&src[..self.size]);
    }

    /// In-place scalar multiply over the visible spectrum
    pub fn scale(&self, buf: &mut [f32], factor: f32) {
        for v in buf.iter_mut().take(self.size / 2) {
            *v *= factor;
        }
    }

    /// Compute the log-frequency magnitude spectrum of `input`
    ///
    /// `input` must carry at least `size` samples; the first `size / 2`
    /// entries of `out` receive the spectrum, anything beyond is left
    /// untouched (and undefined for callers).
    pub fn log_spectrum(&mut self, out: &mut [f32], input: &[f32]) {
        let n = self.size / 2;

        for i in 0..self.size {
            self.buf[i] = Complex::new(input[i] * self.window[i], 0.0);
        }
        self.fft
            .process_with_scratch(&mut self.buf, &mut self.scratch);

        // Power per bin, compressed to non-negative dB
        for k in 0..n {
            let p = self.buf[k].norm_sqr();
            let db = if p > 0.0 { 5.0 * p.log10() } else { 0.0 };
            self.power[k] = db.max(0.0);
        }

        // Resample the linear bins onto a log-frequency axis
        for (i, slot) in out.iter_mut().take(n).enumerate() {
            let pos = if n > 1 {
                (n as f32).powf(i as f32 / (n - 1) as f32) - 1.0
            } else {
                0.0
            };
            let lo = (pos.floor() as usize).min(n - 1);
            let hi = (lo + 1).min(n - 1);
            let frac = pos - lo as f32;
            *slot = self.power[lo] * (1.0 - frac) + self.power[hi] * frac;
        }
    }

    /// Reconfigure for a requested band count, returning the visible length
    pub fn resize_for_bands(&mut self, bands: usize) -> usize {
        let exp = exponent_for_bands(bands);
        if exp != self.exp {
            *self = Spectrum::new(exp);
        }
        self.size / 2
    }
}

/// Window exponent needed to feed a band-style analyzer
pub fn exponent_for_bands(bands: usize) -> usize {
    match bands {
        0..=8 => 4,
        9..=16 => 5,
        17..=32 => 6,
        33..=64 => 7,
        65..=128 => 8,
        _ => 9,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponent_clamped() {
        assert_eq!(Spectrum::new(0).size(), 8);
        assert_eq!(Spectrum::new(3).size(), 8);
        assert_eq!(Spectrum::new(9).size(), 512);
        assert_eq!(Spectrum::new(20).size(), 512);
    }

    #[test]
    fn test_band_mapping() {
        assert_eq!(exponent_for_bands(8), 4);
        assert_eq!(exponent_for_bands(16), 5);
        assert_eq!(exponent_for_bands(32), 6);
        assert_eq!(exponent_for_bands(64), 7);
        assert_eq!(exponent_for_bands(128), 8);
        assert_eq!(exponent_for_bands(256), 9);
    }

    #[test]
    fn test_resize_for_bands_monotonic_and_clamped() {
        let mut spectrum = Spectrum::new(3);
        let mut prev = 0;
        for bands in 1..=512 {
            let visible = spectrum.resize_for_bands(bands);
            assert!(visible >= prev, "visible length decreased at {}", bands);
            assert!((4..=256).contains(&visible));
            prev = visible;
        }
        assert_eq!(prev, 256);
    }

    #[test]
    fn test_sine_peaks_in_low_bins() {
        let mut spectrum = Spectrum::new(9);
        let size = spectrum.size();
        // Bin-4 sine: log axis keeps low bins at low output indices
        let input: Vec<f32> = (0..size)
            .map(|i| (2.0 * std::f32::consts::PI * 4.0 * i as f32 / size as f32).sin())
            .collect();
        let mut out = vec![0.0f32; size / 2];
        spectrum.log_spectrum(&mut out, &input);

        let peak_idx = out
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap();
        assert!(out[peak_idx] > 0.0);
        // On a log axis over 256 outputs, bin 4 lands in the lower half
        assert!(peak_idx < 128, "peak at {}", peak_idx);
    }

    #[test]
    fn test_silence_yields_flat_spectrum() {
        let mut spectrum = Spectrum::new(6);
        let input = vec![0.0f32; spectrum.size()];
        let mut out = vec![1.0f32; spectrum.size() / 2];
        spectrum.log_spectrum(&mut out, &input);
        assert!(out.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_scale() {
        let spectrum = Spectrum::new(4);
        let mut buf = vec![2.0f32; spectrum.size()];
        spectrum.scale(&mut buf, 0.5);
        for v in &buf[..spectrum.size() / 2] {
            assert_eq!(*v, 1.0);
        }
        // Upper half untouched
        assert_eq!(buf[spectrum.size() / 2], 2.0);
    }

    #[test]
    fn test_copy() {
        let spectrum = Spectrum::new(3);
        let src: Vec<f32> = (0..8).map(|i| i as f32).collect();
        let mut dst = vec![0.0f32; 8];
        spectrum.copy(&mut dst, &src);
        assert_eq!(dst, src);
    }
}
