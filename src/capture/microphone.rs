//! Microphone capture using cpal
//!
//! The cpal `Stream` is not `Send`, so the stream lives on a dedicated thread
//! that owns it from creation to drop. Control (stop) flows in over a
//! channel; samples flow out over tokio channels via `try_send` so the device
//! callback never blocks.
//!
//! Muting does not tear down the stream: an atomic gate substitutes silence
//! in the callback, so the device handle is untouched and unmuting is
//! instantaneous.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, SampleRate, StreamConfig};
use tokio::sync::mpsc;

use crate::config::AudioConstraints;
use crate::error::VoiceError;
use crate::retry::retry_with_delay;
use crate::spectrum::SpectrumSender;

/// Bounded retry budget for stopping the device thread.
const STOP_ATTEMPTS: u32 = 5;
const STOP_RETRY_DELAY: Duration = Duration::from_millis(100);

/// How long to wait for the device thread to report init success/failure.
const INIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Fallback when device capability introspection is unavailable.
const FALLBACK_SAMPLE_RATE: u32 = 48_000;

/// Clamp a requested sample rate into a device-supported range.
///
/// Below the minimum uses the minimum, above the maximum uses the maximum,
/// otherwise the requested value is used as-is.
pub fn clamp_rate(requested: u32, min: u32, max: u32) -> u32 {
    requested.clamp(min, max)
}

/// The capture parameters actually in effect after device negotiation.
#[derive(Debug, Clone, Copy)]
pub struct NegotiatedConfig {
    pub sample_rate: u32,
    pub channels: u16,
}

enum Command {
    Stop,
}

/// Handle to a running microphone capture.
pub struct Microphone {
    control_tx: std_mpsc::Sender<Command>,
    thread: Option<std::thread::JoinHandle<()>>,
    muted: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
    negotiated: NegotiatedConfig,
}

impl Microphone {
    /// Acquire the default input device and start capturing.
    ///
    /// PCM16 sample batches are delivered to `sample_tx` (for chunking) and
    /// `spectrum_tx` (for visualization) from the device callback. Either
    /// channel being full drops that batch only.
    pub fn start(
        constraints: &AudioConstraints,
        sample_tx: mpsc::Sender<Vec<i16>>,
        spectrum_tx: SpectrumSender,
    ) -> Result<Self, VoiceError> {
        let muted = Arc::new(AtomicBool::new(false));
        let stopped = Arc::new(AtomicBool::new(false));
        let (control_tx, control_rx) = std_mpsc::channel::<Command>();
        let (init_tx, init_rx) = std_mpsc::channel::<Result<NegotiatedConfig, VoiceError>>();

        let thread_muted = muted.clone();
        let thread_stopped = stopped.clone();
        let thread_constraints = constraints.clone();

        let thread = std::thread::Builder::new()
            .name("voicelink-mic".into())
            .spawn(move || {
                let result = build_capture(
                    &thread_constraints,
                    sample_tx,
                    spectrum_tx,
                    thread_muted,
                );
                match result {
                    Ok((stream, negotiated)) => {
                        if init_tx.send(Ok(negotiated)).is_err() {
                            // Caller gave up; drop the stream and exit
                            thread_stopped.store(true, Ordering::SeqCst);
                            return;
                        }
                        // Block until told to stop; the stream stays alive
                        // for exactly this scope.
                        let _ = control_rx.recv();
                        drop(stream);
                        thread_stopped.store(true, Ordering::SeqCst);
                        log::info!("Microphone: device thread exited");
                    }
                    Err(e) => {
                        let _ = init_tx.send(Err(e));
                        thread_stopped.store(true, Ordering::SeqCst);
                    }
                }
            })
            .map_err(|e| VoiceError::MicInitFailed(e.to_string()))?;

        let negotiated = match init_rx.recv_timeout(INIT_TIMEOUT) {
            Ok(Ok(negotiated)) => negotiated,
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(VoiceError::MicInitFailed(
                    "Timed out waiting for device initialization".into(),
                ))
            }
        };

        log::info!(
            "Microphone: capturing at {}Hz, {} channel(s)",
            negotiated.sample_rate,
            negotiated.channels
        );

        Ok(Self {
            control_tx,
            thread: Some(thread),
            muted,
            stopped,
            negotiated,
        })
    }

    pub fn negotiated(&self) -> NegotiatedConfig {
        self.negotiated
    }

    /// Gate the input without touching the device stream.
    pub fn mute(&self) {
        self.muted.store(true, Ordering::SeqCst);
        log::debug!("Microphone: muted");
    }

    pub fn unmute(&self) {
        self.muted.store(false, Ordering::SeqCst);
        log::debug!("Microphone: unmuted");
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    /// Stop capturing. Safe to call multiple times.
    ///
    /// Waits for the device thread to acknowledge, retrying a bounded number
    /// of times with delay before reporting a closure failure.
    pub async fn stop(&mut self) -> Result<(), VoiceError> {
        let Some(thread) = self.thread.take() else {
            return Ok(()); // Already stopped
        };

        let _ = self.control_tx.send(Command::Stop);

        let stopped = self.stopped.clone();
        let acked = retry_with_delay(STOP_ATTEMPTS, STOP_RETRY_DELAY, |attempt| {
            let stopped = stopped.clone();
            async move {
                if stopped.load(Ordering::SeqCst) {
                    Ok(())
                } else {
                    Err(format!("device thread still running (check {})", attempt))
                }
            }
        })
        .await;

        if acked.is_err() {
            log::error!(
                "Microphone: device thread did not stop after {} checks",
                STOP_ATTEMPTS
            );
            return Err(VoiceError::MicStopFailed {
                attempts: STOP_ATTEMPTS,
            });
        }

        let _ = thread.join();
        Ok(())
    }
}

impl Drop for Microphone {
    fn drop(&mut self) {
        // Best effort: let the device thread unblock if stop() was never called
        if self.thread.is_some() {
            let _ = self.control_tx.send(Command::Stop);
        }
    }
}

/// Substitute silence while muted, preserving batch cadence so downstream
/// chunk timing is unaffected.
fn gate_samples(muted: bool, samples: Vec<i16>) -> Vec<i16> {
    if muted {
        vec![0; samples.len()]
    } else {
        samples
    }
}

fn build_capture(
    constraints: &AudioConstraints,
    sample_tx: mpsc::Sender<Vec<i16>>,
    spectrum_tx: SpectrumSender,
    muted: Arc<AtomicBool>,
) -> Result<(cpal::Stream, NegotiatedConfig), VoiceError> {
    let host = cpal::default_host();
    let device = host.default_input_device().ok_or_else(|| {
        VoiceError::MicInitFailed("No audio input device found".into())
    })?;

    log::info!("Microphone: using input device {:?}", device.name());

    let (config, sample_format) = negotiate(&device, constraints)?;
    let negotiated = NegotiatedConfig {
        sample_rate: config.sample_rate.0,
        channels: config.channels,
    };

    let stream = match sample_format {
        SampleFormat::I16 => {
            build_stream_typed::<i16>(&device, &config, sample_tx, spectrum_tx, muted)
        }
        SampleFormat::U16 => {
            build_stream_typed::<u16>(&device, &config, sample_tx, spectrum_tx, muted)
        }
        SampleFormat::F32 => {
            build_stream_typed::<f32>(&device, &config, sample_tx, spectrum_tx, muted)
        }
        other => {
            return Err(VoiceError::UnsupportedAudioConfig(format!(
                "Unsupported sample format {:?}",
                other
            )))
        }
    }?;

    stream.play().map_err(|e| classify_init_error(e.to_string()))?;

    Ok((stream, negotiated))
}

/// Negotiate the stream configuration against device capabilities.
///
/// The requested rate is clamped into the supported range of the best
/// matching config. If capability introspection fails entirely, a hard-coded
/// default is used.
fn negotiate(
    device: &Device,
    constraints: &AudioConstraints,
) -> Result<(StreamConfig, SampleFormat), VoiceError> {
    match device.supported_input_configs() {
        Ok(ranges) => {
            let mut best: Option<(u32, cpal::SupportedStreamConfigRange)> = None;
            for range in ranges {
                // Prefer an exact channel match, then the closest
                let penalty = (range.channels() as i32 - constraints.channels as i32)
                    .unsigned_abs();
                match &best {
                    Some((best_penalty, _)) if *best_penalty <= penalty => {}
                    _ => best = Some((penalty, range)),
                }
            }

            let (_, range) = best.ok_or_else(|| {
                VoiceError::UnsupportedAudioConfig(
                    "Device reported no input configurations".into(),
                )
            })?;

            let rate = clamp_rate(
                constraints.sample_rate,
                range.min_sample_rate().0,
                range.max_sample_rate().0,
            );
            if rate != constraints.sample_rate {
                log::info!(
                    "Microphone: requested {}Hz clamped to {}Hz",
                    constraints.sample_rate,
                    rate
                );
            }

            let supported = range.with_sample_rate(SampleRate(rate));
            let sample_format = supported.sample_format();
            Ok((supported.into(), sample_format))
        }
        Err(e) => {
            // Introspection unavailable: fall back to the platform default
            log::warn!(
                "Microphone: capability introspection failed ({}), using fallback config",
                e
            );
            match device.default_input_config() {
                Ok(supported) => {
                    let sample_format = supported.sample_format();
                    Ok((supported.into(), sample_format))
                }
                Err(_) => Ok((
                    StreamConfig {
                        channels: constraints.channels,
                        sample_rate: SampleRate(FALLBACK_SAMPLE_RATE),
                        buffer_size: cpal::BufferSize::Default,
                    },
                    SampleFormat::F32,
                )),
            }
        }
    }
}

fn build_stream_typed<T>(
    device: &Device,
    config: &StreamConfig,
    sample_tx: mpsc::Sender<Vec<i16>>,
    spectrum_tx: SpectrumSender,
    muted: Arc<AtomicBool>,
) -> Result<cpal::Stream, VoiceError>
where
    T: cpal::Sample<Float = f32> + cpal::SizedSample + Send + 'static,
{
    let err_fn = |err| log::error!("Microphone stream error: {}", err);

    let stream = device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let samples: Vec<i16> = data.iter().map(|&s| sample_to_i16(s)).collect();
                let samples = gate_samples(muted.load(Ordering::SeqCst), samples);

                // try_send only: the device callback must never block, and a
                // full channel drops this batch alone.
                if sample_tx.try_send(samples.clone()).is_err() {
                    log::debug!("Microphone: sample channel full, dropping batch");
                }
                let _ = spectrum_tx.try_send(samples);
            },
            err_fn,
            None,
        )
        .map_err(|e| classify_init_error(e.to_string()))?;

    Ok(stream)
}

/// Convert any cpal sample type to i16.
fn sample_to_i16<T: cpal::Sample<Float = f32>>(sample: T) -> i16 {
    let f32_sample: f32 = sample.to_float_sample();
    let clamped = f32_sample.clamp(-1.0, 1.0);
    (clamped * i16::MAX as f32) as i16
}

/// Distinguish permission denials from generic device failures.
fn classify_init_error(detail: String) -> VoiceError {
    let lower = detail.to_lowercase();
    if lower.contains("permission") || lower.contains("access denied") {
        VoiceError::MicPermissionDenied(detail)
    } else {
        VoiceError::MicInitFailed(detail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_rate_below_min() {
        // Requested 40000 against [44100, 96000] clamps to the minimum
        assert_eq!(clamp_rate(40_000, 44_100, 96_000), 44_100);
    }

    #[test]
    fn test_clamp_rate_above_max() {
        assert_eq!(clamp_rate(192_000, 44_100, 96_000), 96_000);
    }

    #[test]
    fn test_clamp_rate_in_range_unchanged() {
        assert_eq!(clamp_rate(48_000, 44_100, 96_000), 48_000);
    }

    #[test]
    fn test_sample_to_i16() {
        assert_eq!(sample_to_i16(0.0f32), 0);
        assert_eq!(sample_to_i16(1.0f32), i16::MAX);
        assert_eq!(sample_to_i16(-1.0f32), -i16::MAX);
        assert_eq!(sample_to_i16(2.0f32), i16::MAX); // clamped
    }

    #[test]
    fn test_gate_substitutes_silence_preserving_length() {
        let samples = vec![100i16, -200, 300];
        let gated = gate_samples(true, samples.clone());
        assert_eq!(gated, vec![0, 0, 0]);

        let passed = gate_samples(false, samples.clone());
        assert_eq!(passed, samples);
    }

    #[test]
    fn test_classify_permission_errors() {
        assert!(matches!(
            classify_init_error("Operation not permitted: permission denied".into()),
            VoiceError::MicPermissionDenied(_)
        ));
        assert!(matches!(
            classify_init_error("device disconnected".into()),
            VoiceError::MicInitFailed(_)
        ));
    }

    #[tokio::test]
    #[ignore] // Requires an audio input device
    async fn test_start_mute_stop_on_real_device() {
        let (sample_tx, _sample_rx) = mpsc::channel(16);
        let (spectrum_tx, _spectrum_rx) = crate::spectrum::spectrum_channel();

        let mut mic = Microphone::start(&AudioConstraints::default(), sample_tx, spectrum_tx)
            .expect("microphone start failed");

        assert!(!mic.is_muted());
        mic.mute();
        assert!(mic.is_muted());
        mic.unmute();
        assert!(!mic.is_muted());

        mic.stop().await.expect("stop failed");
        // Idempotent
        mic.stop().await.expect("second stop failed");
    }
}
