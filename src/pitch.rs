//! Pitch
//!
//! Monophonic fundamental-frequency estimation for short snapshots of
//! microphone audio, using normalized autocorrelation with parabolic peak
//! refinement.

use std::{f32::consts::PI, sync::Arc};

use log::trace;
use rustfft::{num_complex::Complex, Fft, FftPlanner};
use thiserror::Error;

use crate::note::DetectedNote;

/// Number of samples analysed per detection by the live capture sources.
pub const DEFAULT_WINDOW_SIZE: usize = 4096;

const DEFAULT_SILENCE_THRESHOLD: f32 = 0.015;
const DEFAULT_MIN_FREQUENCY: f32 = 60.0;
const DEFAULT_MAX_FREQUENCY: f32 = 2000.0;

/// A lag with correlation above this is accepted as a period candidate.
const STRONG_CORRELATION: f32 = 0.9;
/// Once a strong candidate is found, scanning stops when correlation falls below this.
const DECAY_CORRELATION: f32 = 0.85;
/// Weakest correlation accepted when no strong candidate exists.
const FALLBACK_CORRELATION: f32 = 0.7;

/// Errors returned when configuring a [`PitchEstimator`].
#[derive(Debug, Error)]
pub enum PitchError {
    /// An estimator parameter was out of range.
    #[error("configuration error: {0}")]
    Configuration(String),
}

/// A fixed-length snapshot of recent mono audio.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalBuffer {
    /// Samples in `[-1, 1]`, oldest first.
    pub samples: Vec<f32>,
    /// Sampling rate in Hz.
    pub sample_rate: f32,
}

impl SignalBuffer {
    /// Wrap a block of samples.
    pub fn new(samples: Vec<f32>, sample_rate: f32) -> Self {
        SignalBuffer {
            samples,
            sample_rate,
        }
    }

    /// An all-zero buffer of `len` samples.
    pub fn silence(len: usize, sample_rate: f32) -> Self {
        Self::new(vec![0.0; len], sample_rate)
    }

    /// A pure sine tone, handy for calibration and simulation.
    pub fn tone(frequency: f32, amplitude: f32, len: usize, sample_rate: f32) -> Self {
        let samples = (0..len)
            .map(|i| amplitude * (2.0 * PI * frequency * i as f32 / sample_rate).sin())
            .collect();
        Self::new(samples, sample_rate)
    }

    /// Root-mean-square level of the buffer.
    pub fn rms(&self) -> f32 {
        rms(&self.samples)
    }

    /// Number of samples held.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// True when the buffer holds no samples.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Root-mean-square level of a block of samples (0 for an empty block).
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let energy: f32 = samples.iter().map(|s| s * s).sum();
    (energy / samples.len() as f32).sqrt()
}

/// Builder for a [`PitchEstimator`].
pub struct PitchEstimatorBuilder {
    silence_threshold: f32,
    min_frequency: f32,
    max_frequency: f32,
}

impl PitchEstimatorBuilder {
    /// Start with default parameters:
    /// silence_threshold = 0.015, min_frequency = 60 Hz,
    /// max_frequency = 2000 Hz.
    pub fn new() -> Self {
        PitchEstimatorBuilder {
            silence_threshold: DEFAULT_SILENCE_THRESHOLD,
            min_frequency: DEFAULT_MIN_FREQUENCY,
            max_frequency: DEFAULT_MAX_FREQUENCY,
        }
    }

    /// Set the RMS level below which a buffer is treated as silence.
    pub fn silence_threshold(mut self, rms: f32) -> Self {
        self.silence_threshold = rms;
        self
    }

    /// Set the lowest detectable fundamental in Hz.
    pub fn min_frequency(mut self, hz: f32) -> Self {
        self.min_frequency = hz;
        self
    }

    /// Set the highest detectable fundamental in Hz.
    pub fn max_frequency(mut self, hz: f32) -> Self {
        self.max_frequency = hz;
        self
    }

    /// Finalize and create the estimator.
    pub fn build(self) -> Result<PitchEstimator, PitchError> {
        if self.silence_threshold.is_nan() || self.silence_threshold < 0.0 {
            return Err(PitchError::Configuration(
                "silence_threshold must be non-negative".into(),
            ));
        }
        if self.min_frequency.is_nan()
            || self.min_frequency <= 0.0
            || !self.max_frequency.is_finite()
        {
            return Err(PitchError::Configuration(
                "frequency bounds must be positive and finite".into(),
            ));
        }
        if self.min_frequency >= self.max_frequency {
            return Err(PitchError::Configuration(format!(
                "min_frequency ({}) must be below max_frequency ({})",
                self.min_frequency, self.max_frequency
            )));
        }

        Ok(PitchEstimator::with_params(
            self.silence_threshold,
            self.min_frequency,
            self.max_frequency,
        ))
    }
}

impl Default for PitchEstimatorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

struct AutocorrPlan {
    size: usize,
    forward: Arc<dyn Fft<f32>>,
    inverse: Arc<dyn Fft<f32>>,
}

/// Single-pitch estimator.
///
/// Scratch buffers and FFT plans are reused between calls, so after the first
/// buffer of a given length no further allocation happens.
pub struct PitchEstimator {
    silence_threshold: f32,
    min_frequency: f32,
    max_frequency: f32,
    planner: FftPlanner<f32>,
    plan: Option<AutocorrPlan>,
    spectrum: Vec<Complex<f32>>,
    energy: Vec<f64>,
    correlations: Vec<f32>,
}

impl PitchEstimator {
    /// Start customizing with a builder.
    pub fn builder() -> PitchEstimatorBuilder {
        PitchEstimatorBuilder::new()
    }

    fn with_params(silence_threshold: f32, min_frequency: f32, max_frequency: f32) -> Self {
        PitchEstimator {
            silence_threshold,
            min_frequency,
            max_frequency,
            planner: FftPlanner::new(),
            plan: None,
            spectrum: Vec::new(),
            energy: Vec::new(),
            correlations: Vec::new(),
        }
    }

    /// RMS level below which buffers are ignored.
    pub fn silence_threshold(&self) -> f32 {
        self.silence_threshold
    }

    /// Detectable frequency range in Hz.
    pub fn frequency_range(&self) -> (f32, f32) {
        (self.min_frequency, self.max_frequency)
    }

    /// Estimate the pitch of `buffer` and map it to a note.
    ///
    /// Returns `None` for silence, for low-confidence estimates, and for
    /// estimates outside the configured frequency range.
    pub fn detect(&mut self, buffer: &SignalBuffer) -> Option<DetectedNote> {
        let volume = buffer.rms();
        let frequency = self.estimate(&buffer.samples, buffer.sample_rate)?;
        if frequency < self.min_frequency || frequency > self.max_frequency {
            trace!("rejecting out-of-range estimate {frequency:.2} Hz");
            return None;
        }
        let detected = DetectedNote::from_frequency(frequency, volume);
        if let Some(note) = &detected {
            trace!("detected {} ({frequency:.2} Hz, rms {volume:.4})", note.full_name);
        }
        detected
    }

    /// Estimate the fundamental frequency of `samples` in Hz.
    ///
    /// Returns `None` when the signal is too quiet or no lag correlates well
    /// enough. Absence of a pitch is a normal outcome, not an error.
    pub fn estimate(&mut self, samples: &[f32], sample_rate: f32) -> Option<f32> {
        let size = samples.len();
        if size < 2 || sample_rate.is_nan() || sample_rate <= 0.0 {
            return None;
        }
        if rms(samples) < self.silence_threshold {
            return None;
        }

        let min_lag = ((sample_rate / self.max_frequency).floor() as usize).max(1);
        let max_lag = ((sample_rate / self.min_frequency).floor() as usize).min(size);
        if min_lag >= max_lag {
            return None;
        }

        self.autocorrelate(samples);
        let (best_lag, best_correlation) = self.pick_lag(min_lag, max_lag)?;
        if best_correlation < FALLBACK_CORRELATION {
            return None;
        }

        // Parabolic interpolation around the peak.
        let prev = self.correlation_at(best_lag - 1);
        let curr = self.correlation_at(best_lag);
        let next = self.correlation_at(best_lag + 1);
        let shift = (prev - next) / (2.0 * (prev - 2.0 * curr + next));
        let shift = if shift.is_finite() { shift } else { 0.0 };

        Some(sample_rate / (best_lag as f32 + shift))
    }

    /// Normalized correlation for `lag` from the last analysed buffer, 0 outside it.
    #[inline]
    fn correlation_at(&self, lag: usize) -> f32 {
        self.correlations.get(lag).copied().unwrap_or(0.0)
    }

    /// Find the period lag in `[min_lag, max_lag)`.
    fn pick_lag(&self, min_lag: usize, max_lag: usize) -> Option<(usize, f32)> {
        // Skip the lobe around lag zero: a slowly varying signal correlates
        // strongly with itself at short lags without that being its period.
        let lobe_end = self.correlations[1..max_lag]
            .iter()
            .position(|&c| c < FALLBACK_CORRELATION)
            .map_or(max_lag, |i| i + 1);
        let start = min_lag.max(lobe_end);

        let mut best_lag = None;
        let mut best_correlation = 0.0;
        let mut found_strong = false;

        for lag in start..max_lag {
            let correlation = self.correlations[lag];
            if correlation > STRONG_CORRELATION && correlation > best_correlation {
                best_correlation = correlation;
                best_lag = Some(lag);
                found_strong = true;
            } else if found_strong && correlation < DECAY_CORRELATION {
                break;
            }
        }

        if !found_strong {
            for lag in start..max_lag {
                let correlation = self.correlations[lag];
                if correlation > FALLBACK_CORRELATION && correlation > best_correlation {
                    best_correlation = correlation;
                    best_lag = Some(lag);
                }
            }
        }

        best_lag.map(|lag| (lag, best_correlation))
    }

    /// Fill `self.correlations[lag]` for every lag in `0..samples.len()`.
    ///
    /// Lag products come from the power spectrum of the zero-padded signal;
    /// each is divided by the geometric mean of the energies of the two
    /// overlapping windows.
    fn autocorrelate(&mut self, samples: &[f32]) {
        let size = samples.len();
        let fft_size = (2 * size).next_power_of_two();
        let plan = match self.plan.take() {
            Some(plan) if plan.size == fft_size => plan,
            _ => AutocorrPlan {
                size: fft_size,
                forward: self.planner.plan_fft_forward(fft_size),
                inverse: self.planner.plan_fft_inverse(fft_size),
            },
        };

        self.spectrum.clear();
        self.spectrum
            .extend(samples.iter().map(|&s| Complex { re: s, im: 0.0 }));
        self.spectrum.resize(fft_size, Complex { re: 0.0, im: 0.0 });

        plan.forward.process(&mut self.spectrum);
        for bin in self.spectrum.iter_mut() {
            *bin = Complex {
                re: bin.norm_sqr(),
                im: 0.0,
            };
        }
        plan.inverse.process(&mut self.spectrum);
        self.plan = Some(plan);

        // energy[i] = sum of squares of samples[..i]
        self.energy.clear();
        self.energy.push(0.0);
        let mut acc = 0.0f64;
        for &s in samples {
            acc += f64::from(s) * f64::from(s);
            self.energy.push(acc);
        }
        let total = acc;
        let floor = total * f64::EPSILON;

        let scale = 1.0 / fft_size as f64;
        self.correlations.clear();
        for lag in 0..size {
            let product = f64::from(self.spectrum[lag].re) * scale;
            let head = self.energy[size - lag];
            let tail = total - self.energy[lag];
            let denom = (head * tail).max(0.0).sqrt();
            let correlation = if denom > floor {
                (product / denom).clamp(-1.0, 1.0) as f32
            } else {
                0.0
            };
            self.correlations.push(correlation);
        }
    }
}

impl Default for PitchEstimator {
    fn default() -> Self {
        PitchEstimator::with_params(
            DEFAULT_SILENCE_THRESHOLD,
            DEFAULT_MIN_FREQUENCY,
            DEFAULT_MAX_FREQUENCY,
        )
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, Rng, SeedableRng};

    use super::*;
    use crate::note::NoteName;

    const SAMPLE_RATE: f32 = 44_100.0;

    #[test]
    fn silent_buffer_has_no_pitch() {
        let mut estimator = PitchEstimator::default();
        let buffer = SignalBuffer::silence(DEFAULT_WINDOW_SIZE, SAMPLE_RATE);
        assert_eq!(estimator.estimate(&buffer.samples, SAMPLE_RATE), None);
        assert!(estimator.detect(&buffer).is_none());
    }

    #[test]
    fn quiet_tone_is_gated() {
        let mut estimator = PitchEstimator::default();
        // rms of a 0.01 amplitude sine is ~0.007, under the 0.015 gate
        let buffer = SignalBuffer::tone(440.0, 0.01, DEFAULT_WINDOW_SIZE, SAMPLE_RATE);
        assert_eq!(estimator.estimate(&buffer.samples, SAMPLE_RATE), None);
    }

    #[test]
    fn a4_sine_is_estimated() {
        let mut estimator = PitchEstimator::default();
        let buffer = SignalBuffer::tone(440.0, 0.5, DEFAULT_WINDOW_SIZE, SAMPLE_RATE);
        let freq = estimator.estimate(&buffer.samples, SAMPLE_RATE).unwrap();
        assert!((freq - 440.0).abs() < 4.4, "got {freq}");

        let note = estimator.detect(&buffer).unwrap();
        assert_eq!(note.name, NoteName::A);
        assert_eq!(note.octave, 4);
        assert_eq!(note.full_name, "A4");
        assert!((note.volume - 0.5 / 2f32.sqrt()).abs() < 0.01);
    }

    #[test]
    fn low_tone_is_not_mistaken_for_short_lag() {
        let mut estimator = PitchEstimator::default();
        let buffer = SignalBuffer::tone(82.41, 0.5, DEFAULT_WINDOW_SIZE, SAMPLE_RATE);
        let freq = estimator.estimate(&buffer.samples, SAMPLE_RATE).unwrap();
        assert!((freq - 82.41).abs() < 0.83, "got {freq}");
    }

    #[test]
    fn scratch_is_reused_across_lengths() {
        let mut estimator = PitchEstimator::default();
        for &len in &[2048usize, 4096, 2048] {
            let buffer = SignalBuffer::tone(330.0, 0.5, len, SAMPLE_RATE);
            let freq = estimator.estimate(&buffer.samples, SAMPLE_RATE).unwrap();
            assert!((freq - 330.0).abs() < 3.3, "len {len}: got {freq}");
        }
    }

    #[test]
    fn degenerate_input_has_no_pitch() {
        let mut estimator = PitchEstimator::default();
        assert_eq!(estimator.estimate(&[], SAMPLE_RATE), None);
        assert_eq!(estimator.estimate(&[0.5], SAMPLE_RATE), None);
        assert_eq!(estimator.estimate(&[0.5; 64], 0.0), None);
    }

    #[test]
    fn builder_rejects_bad_ranges() {
        assert!(PitchEstimator::builder().min_frequency(0.0).build().is_err());
        assert!(PitchEstimator::builder()
            .min_frequency(500.0)
            .max_frequency(400.0)
            .build()
            .is_err());
        assert!(PitchEstimator::builder().silence_threshold(-1.0).build().is_err());
        assert!(PitchEstimator::builder().build().is_ok());
    }

    /// A 330 Hz tone at amplitude 0.3 plus uniform noise in `[-width, width)`.
    fn noisy_tone(width: f32, seed: u64) -> SignalBuffer {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut buffer = SignalBuffer::tone(330.0, 0.3, DEFAULT_WINDOW_SIZE, SAMPLE_RATE);
        for sample in buffer.samples.iter_mut() {
            *sample += rng.random_range(-width..width);
        }
        buffer
    }

    #[test]
    fn moderate_noise_falls_back_to_a_period_multiple() {
        let mut estimator = PitchEstimator::default();
        // Noise power ~0.0096 against 0.045 of tone: every period peak sits near 0.82.
        for seed in 0..4 {
            let buffer = noisy_tone(0.17, seed);
            let freq = estimator.estimate(&buffer.samples, SAMPLE_RATE).unwrap();

            let peaks = &estimator.correlations[22..735];
            let best = peaks.iter().copied().fold(f32::MIN, f32::max);
            assert!(
                best > FALLBACK_CORRELATION && best < STRONG_CORRELATION,
                "seed {seed}: {best}"
            );

            let multiple = (330.0 / freq).round();
            assert!((1.0..=5.0).contains(&multiple), "seed {seed}: got {freq}");
            let expected = 330.0 / multiple;
            assert!((freq - expected).abs() < 0.02 * expected, "seed {seed}: got {freq}");
        }
    }

    #[test]
    fn heavy_noise_has_no_pitch() {
        let mut estimator = PitchEstimator::default();
        for seed in 0..4 {
            let buffer = noisy_tone(0.6, seed);
            assert!(buffer.rms() > DEFAULT_SILENCE_THRESHOLD);
            assert_eq!(
                estimator.estimate(&buffer.samples, SAMPLE_RATE),
                None,
                "seed {seed}"
            );
            assert!(estimator.correlations[22..735]
                .iter()
                .all(|&c| c < FALLBACK_CORRELATION));
        }
    }

    #[test]
    fn narrowed_range_rejects_estimates_outside_it() {
        let mut estimator = PitchEstimator::builder()
            .min_frequency(600.0)
            .max_frequency(1500.0)
            .build()
            .unwrap();
        let buffer = SignalBuffer::tone(440.0, 0.5, DEFAULT_WINDOW_SIZE, SAMPLE_RATE);
        assert!(estimator.detect(&buffer).is_none());
    }
}
