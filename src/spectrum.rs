//! Frequency-spectrum analysis for live visualization
//!
//! Both the microphone and the playback engine expose a 24-band spectrum
//! signal. Samples from the audio callbacks are buffered here, transformed
//! with a Hanning-windowed FFT, grouped onto an auditory (Bark-like) scale,
//! EMA-smoothed, and published into a shared snapshot at ~30fps.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rustfft::{num_complex::Complex, Fft, FftPlanner};
use tokio::sync::mpsc;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;

/// Number of spectrum bands exposed to the application.
pub const NUM_BANDS: usize = 24;

/// FFT window size (~21ms at 48kHz)
const FFT_SIZE: usize = 1024;

/// Sample buffer capacity; only the most recent window is analyzed.
const BUFFER_CAPACITY: usize = FFT_SIZE * 4;

/// EMA smoothing factor (0.3 = 30% new value, 70% previous)
const EMA_ALPHA: f32 = 0.3;

/// Frame interval for ~30fps snapshot updates
const FRAME_INTERVAL_MS: u64 = 33;

/// Shared live spectrum snapshot, written by the emitter task and read by
/// the facade.
pub type SharedSpectrum = Arc<Mutex<[f32; NUM_BANDS]>>;

/// Create an all-zero shared snapshot.
pub fn shared_spectrum() -> SharedSpectrum {
    Arc::new(Mutex::new([0.0; NUM_BANDS]))
}

/// Sender half for feeding raw samples from an audio callback.
pub type SpectrumSender = mpsc::Sender<Vec<i16>>;

/// Receiver half consumed by the emitter task.
pub type SpectrumReceiver = mpsc::Receiver<Vec<i16>>;

/// Create a spectrum sample channel.
pub fn spectrum_channel() -> (SpectrumSender, SpectrumReceiver) {
    mpsc::channel(100)
}

/// Bark-scale frequency warp.
///
/// Traunmuller's approximation; good enough for visualization banding.
fn bark(freq_hz: f32) -> f32 {
    13.0 * (0.00076 * freq_hz).atan() + 3.5 * ((freq_hz / 7500.0).powi(2)).atan()
}

/// Spectrum analyzer over a rolling window of recent samples.
///
/// NOT internally synchronized; owned by the emitter task.
pub struct SpectrumAnalyzer {
    samples: VecDeque<i16>,
    fft: Arc<dyn Fft<f32>>,
    /// Pre-computed Hanning window coefficients.
    window: Vec<f32>,
    /// Band index for each FFT bin in 1..FFT_SIZE/2.
    bin_bands: Vec<usize>,
    scratch: Vec<Complex<f32>>,
}

impl SpectrumAnalyzer {
    pub fn new(sample_rate: u32) -> Self {
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(FFT_SIZE);

        let window: Vec<f32> = (0..FFT_SIZE)
            .map(|i| {
                0.5 * (1.0 - (2.0 * std::f32::consts::PI * i as f32 / (FFT_SIZE - 1) as f32).cos())
            })
            .collect();

        // Map each positive-frequency bin to one of NUM_BANDS equal slices of
        // the Bark axis up to Nyquist.
        let nyquist = sample_rate as f32 / 2.0;
        let bark_max = bark(nyquist);
        let bin_bands: Vec<usize> = (1..FFT_SIZE / 2)
            .map(|bin| {
                let freq = bin as f32 * sample_rate as f32 / FFT_SIZE as f32;
                let band = (bark(freq) / bark_max * NUM_BANDS as f32) as usize;
                band.min(NUM_BANDS - 1)
            })
            .collect();

        Self {
            samples: VecDeque::with_capacity(BUFFER_CAPACITY),
            fft,
            window,
            bin_bands,
            scratch: vec![Complex::new(0.0, 0.0); FFT_SIZE],
        }
    }

    /// Add samples, evicting the oldest past capacity.
    pub fn push_samples(&mut self, samples: &[i16]) {
        let len = samples.len();
        if len >= BUFFER_CAPACITY {
            self.samples.clear();
            self.samples.extend(&samples[len - BUFFER_CAPACITY..]);
            return;
        }

        let to_remove = (self.samples.len() + len).saturating_sub(BUFFER_CAPACITY);
        if to_remove > 0 {
            self.samples.drain(0..to_remove);
        }
        self.samples.extend(samples);
    }

    /// Compute band magnitudes (0.0-1.0) over the most recent window.
    ///
    /// Fewer than FFT_SIZE buffered samples are zero-padded; an empty buffer
    /// yields all zeros.
    pub fn compute(&mut self) -> [f32; NUM_BANDS] {
        let mut bands = [0.0f32; NUM_BANDS];
        if self.samples.is_empty() {
            return bands;
        }

        let start = self.samples.len().saturating_sub(FFT_SIZE);
        for (i, slot) in self.scratch.iter_mut().enumerate() {
            let sample = self
                .samples
                .get(start + i)
                .map(|&s| s as f32 / i16::MAX as f32)
                .unwrap_or(0.0);
            *slot = Complex::new(sample * self.window[i], 0.0);
        }

        self.fft.process(&mut self.scratch);

        let mut counts = [0u32; NUM_BANDS];
        for (bin, &band) in self.bin_bands.iter().enumerate() {
            // bin_bands starts at FFT bin 1 (skip DC)
            let mag = self.scratch[bin + 1].norm();
            bands[band] += mag;
            counts[band] += 1;
        }

        // Normalize: compensate the Hanning coherent gain (0.5) and the FFT
        // scale, then compress with sqrt so quiet content stays visible.
        let scale = 4.0 / FFT_SIZE as f32;
        for (band, &count) in bands.iter_mut().zip(counts.iter()) {
            if count > 0 {
                let avg = *band / count as f32 * scale;
                *band = avg.sqrt().clamp(0.0, 1.0);
            }
        }

        bands
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

/// EMA smoothing state for the published bands.
struct EmaState {
    prev: [f32; NUM_BANDS],
    initialized: bool,
}

impl EmaState {
    fn new() -> Self {
        Self {
            prev: [0.0; NUM_BANDS],
            initialized: false,
        }
    }

    fn apply(&mut self, bands: &mut [f32; NUM_BANDS]) {
        if !self.initialized {
            self.prev = *bands;
            self.initialized = true;
            return;
        }
        for (band, prev) in bands.iter_mut().zip(self.prev.iter()) {
            *band = EMA_ALPHA * *band + (1.0 - EMA_ALPHA) * prev;
        }
        self.prev = *bands;
    }
}

/// Run the spectrum emitter until cancelled.
///
/// Drains the sample channel on each ~33ms tick, computes the band snapshot,
/// smooths it, and publishes it into `shared`. The snapshot is zeroed on
/// shutdown so stale bars don't linger in the UI.
pub async fn run_spectrum_emitter(
    mut rx: SpectrumReceiver,
    sample_rate: u32,
    shared: SharedSpectrum,
    cancel: CancellationToken,
) {
    let mut analyzer = SpectrumAnalyzer::new(sample_rate);
    let mut ema = EmaState::new();
    let mut tick = interval(Duration::from_millis(FRAME_INTERVAL_MS));

    log::debug!("Spectrum emitter started ({}Hz)", sample_rate);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {
                while let Ok(samples) = rx.try_recv() {
                    analyzer.push_samples(&samples);
                }

                let mut bands = analyzer.compute();
                ema.apply(&mut bands);

                if let Ok(mut snapshot) = shared.lock() {
                    *snapshot = bands;
                }
            }
        }
    }

    if let Ok(mut snapshot) = shared.lock() {
        *snapshot = [0.0; NUM_BANDS];
    }
    log::debug!("Spectrum emitter stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f32, sample_rate: u32, count: usize) -> Vec<i16> {
        (0..count)
            .map(|i| {
                let t = i as f32 / sample_rate as f32;
                ((2.0 * std::f32::consts::PI * freq * t).sin() * 16000.0) as i16
            })
            .collect()
    }

    #[test]
    fn test_empty_buffer_is_silent() {
        let mut analyzer = SpectrumAnalyzer::new(48_000);
        let bands = analyzer.compute();
        assert!(bands.iter().all(|&b| b == 0.0));
    }

    #[test]
    fn test_bands_are_bounded() {
        let mut analyzer = SpectrumAnalyzer::new(48_000);
        analyzer.push_samples(&vec![i16::MAX; FFT_SIZE]);
        let bands = analyzer.compute();
        for &b in &bands {
            assert!((0.0..=1.0).contains(&b), "band {} out of range", b);
        }
    }

    #[test]
    fn test_sine_energy_lands_in_low_bands() {
        let mut analyzer = SpectrumAnalyzer::new(48_000);
        analyzer.push_samples(&sine(440.0, 48_000, FFT_SIZE * 2));
        let bands = analyzer.compute();

        let peak = bands
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .map(|(i, _)| i)
            .unwrap();

        // 440Hz is ~4.3 Bark of ~24 total at 24kHz Nyquist: low third
        assert!(peak < NUM_BANDS / 3, "peak band {} unexpectedly high", peak);
        assert!(bands[peak] > 0.05);
    }

    #[test]
    fn test_high_sine_lands_above_low_sine() {
        let mut low = SpectrumAnalyzer::new(48_000);
        low.push_samples(&sine(200.0, 48_000, FFT_SIZE * 2));
        let low_peak = low
            .compute()
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .map(|(i, _)| i)
            .unwrap();

        let mut high = SpectrumAnalyzer::new(48_000);
        high.push_samples(&sine(8000.0, 48_000, FFT_SIZE * 2));
        let high_peak = high
            .compute()
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .map(|(i, _)| i)
            .unwrap();

        assert!(high_peak > low_peak);
    }

    #[test]
    fn test_buffer_bounded() {
        let mut analyzer = SpectrumAnalyzer::new(48_000);
        analyzer.push_samples(&vec![100i16; BUFFER_CAPACITY * 2]);
        assert!(analyzer.samples.len() <= BUFFER_CAPACITY);
    }

    #[test]
    fn test_bark_monotonic() {
        let mut prev = 0.0;
        for f in [100.0, 500.0, 1000.0, 4000.0, 12000.0, 20000.0] {
            let b = bark(f);
            assert!(b > prev, "bark({}) not increasing", f);
            prev = b;
        }
    }

    #[test]
    fn test_ema_smoothing() {
        let mut ema = EmaState::new();

        let mut bands1 = [0.5f32; NUM_BANDS];
        ema.apply(&mut bands1);
        assert_eq!(bands1[0], 0.5, "First frame should be unchanged");

        let mut bands2 = [1.0f32; NUM_BANDS];
        ema.apply(&mut bands2);
        let expected = EMA_ALPHA * 1.0 + (1.0 - EMA_ALPHA) * 0.5;
        assert!((bands2[0] - expected).abs() < 0.001);
    }

    #[tokio::test]
    async fn test_emitter_zeroes_snapshot_on_cancel() {
        let (tx, rx) = spectrum_channel();
        let shared = shared_spectrum();
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run_spectrum_emitter(
            rx,
            48_000,
            shared.clone(),
            cancel.clone(),
        ));

        tx.send(sine(440.0, 48_000, FFT_SIZE)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;

        cancel.cancel();
        task.await.unwrap();

        let snapshot = shared.lock().unwrap();
        assert!(snapshot.iter().all(|&b| b == 0.0));
    }
}
