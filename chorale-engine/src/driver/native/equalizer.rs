//! Ten-band graphic equalizer
//!
//! Peaking biquad per band (Audio EQ Cookbook), applied in the decode
//! thread over interleaved stereo f32. Band values arrive in the backend
//! range 0..=200 where 100 is flat and 0 switches the band off; the span
//! maps linearly onto +/-12 dB.

use crate::config::EQ_BANDS;

/// Center frequencies in Hz, lowest band first
pub const BAND_FREQUENCIES: [f32; EQ_BANDS] = [
    30.0, 60.0, 125.0, 250.0, 500.0, 1_000.0, 2_000.0, 4_000.0, 8_000.0, 16_000.0,
];

const MAX_GAIN_DB: f32 = 12.0;
/// One-octave bandwidth
const BAND_Q: f32 = 1.0;

#[derive(Debug, Clone, Copy, Default)]
struct Biquad {
    b0: f32,
    b1: f32,
    b2: f32,
    a1: f32,
    a2: f32,
    // Direct form 1 state, one pair per channel
    x1: [f32; 2],
    x2: [f32; 2],
    y1: [f32; 2],
    y2: [f32; 2],
}

impl Biquad {
    fn peaking(sample_rate: f32, freq: f32, gain_db: f32) -> Self {
        let a = 10f32.powf(gain_db / 40.0);
        let w0 = 2.0 * std::f32::consts::PI * freq / sample_rate;
        let alpha = w0.sin() / (2.0 * BAND_Q);
        let (cos_w0, a0) = (w0.cos(), 1.0 + alpha / a);

        Self {
            b0: (1.0 + alpha * a) / a0,
            b1: (-2.0 * cos_w0) / a0,
            b2: (1.0 - alpha * a) / a0,
            a1: (-2.0 * cos_w0) / a0,
            a2: (1.0 - alpha / a) / a0,
            ..Default::default()
        }
    }

    #[inline]
    fn run(&mut self, ch: usize, x: f32) -> f32 {
        let y = self.b0 * x + self.b1 * self.x1[ch] + self.b2 * self.x2[ch]
            - self.a1 * self.y1[ch]
            - self.a2 * self.y2[ch];
        self.x2[ch] = self.x1[ch];
        self.x1[ch] = x;
        self.y2[ch] = self.y1[ch];
        self.y1[ch] = y;
        y
    }

    fn reset(&mut self) {
        self.x1 = [0.0; 2];
        self.x2 = [0.0; 2];
        self.y1 = [0.0; 2];
        self.y2 = [0.0; 2];
    }
}

pub struct Equalizer {
    sample_rate: f32,
    values: [i32; EQ_BANDS],
    filters: [Option<Biquad>; EQ_BANDS],
}

impl Equalizer {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate: sample_rate as f32,
            values: [0; EQ_BANDS],
            filters: [None; EQ_BANDS],
        }
    }

    /// Switch the sample rate, recomputing active filters
    pub fn set_sample_rate(&mut self, sample_rate: u32) {
        self.sample_rate = sample_rate as f32;
        let values = self.values;
        for (band, &value) in values.iter().enumerate() {
            self.rebuild(band, value);
        }
    }

    /// Set one band in the backend range 0..=200; 0 disables the band
    pub fn set_band(&mut self, band: usize, value: i32) {
        if band >= EQ_BANDS {
            return;
        }
        let value = value.clamp(0, 200);
        if self.values[band] == value {
            return;
        }
        self.values[band] = value;
        self.rebuild(band, value);
    }

    /// True when any band would alter the signal
    pub fn is_active(&self) -> bool {
        self.filters.iter().any(|f| f.is_some())
    }

    fn rebuild(&mut self, band: usize, value: i32) {
        // 0 = band off, 100 = flat: neither needs a filter
        if value == 0 || value == 100 {
            self.filters[band] = None;
            return;
        }
        let gain_db = (value - 100) as f32 / 100.0 * MAX_GAIN_DB;
        self.filters[band] = Some(Biquad::peaking(
            self.sample_rate,
            BAND_FREQUENCIES[band],
            gain_db,
        ));
    }

    /// Filter interleaved stereo samples in place
    pub fn process(&mut self, samples: &mut [f32]) {
        if !self.is_active() {
            return;
        }
        for filter in self.filters.iter_mut().flatten() {
            for frame in samples.chunks_exact_mut(2) {
                frame[0] = filter.run(0, frame[0]);
                frame[1] = filter.run(1, frame[1]);
            }
        }
    }

    /// Clear filter state, e.g. after a seek
    pub fn reset(&mut self) {
        for filter in self.filters.iter_mut().flatten() {
            filter.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_bands_are_inactive() {
        let mut eq = Equalizer::new(44100);
        assert!(!eq.is_active());
        eq.set_band(4, 100);
        assert!(!eq.is_active());
        eq.set_band(4, 0);
        assert!(!eq.is_active());
    }

    #[test]
    fn flat_settings_pass_signal_unchanged() {
        let mut eq = Equalizer::new(44100);
        let mut samples: Vec<f32> = (0..256).map(|i| (i as f32 * 0.1).sin() * 0.5).collect();
        let reference = samples.clone();
        eq.process(&mut samples);
        assert_eq!(samples, reference);
    }

    #[test]
    fn boosted_band_raises_in_band_energy() {
        let mut eq = Equalizer::new(44100);
        eq.set_band(5, 200); // +12 dB at 1 kHz

        // 1 kHz stereo sine, long enough for the filter to settle
        let rate = 44100.0;
        let mut samples = Vec::with_capacity(2 * 8192);
        for i in 0..8192 {
            let s = (2.0 * std::f32::consts::PI * 1000.0 * i as f32 / rate).sin() * 0.1;
            samples.push(s);
            samples.push(s);
        }
        let before: f32 = samples.iter().map(|s| s * s).sum();
        eq.process(&mut samples);
        let after: f32 = samples.iter().map(|s| s * s).sum();
        assert!(after > before * 2.0, "boost must add energy at 1 kHz");
    }

    #[test]
    fn cut_band_lowers_in_band_energy() {
        let mut eq = Equalizer::new(44100);
        eq.set_band(5, 1); // near the full -12 dB cut

        let rate = 44100.0;
        let mut samples = Vec::with_capacity(2 * 8192);
        for i in 0..8192 {
            let s = (2.0 * std::f32::consts::PI * 1000.0 * i as f32 / rate).sin() * 0.5;
            samples.push(s);
            samples.push(s);
        }
        let before: f32 = samples.iter().map(|s| s * s).sum();
        eq.process(&mut samples);
        let after: f32 = samples.iter().map(|s| s * s).sum();
        assert!(after < before * 0.5, "cut must remove energy at 1 kHz");
    }

    #[test]
    fn out_of_range_band_index_is_ignored() {
        let mut eq = Equalizer::new(44100);
        eq.set_band(EQ_BANDS + 3, 200);
        assert!(!eq.is_active());
    }
}
