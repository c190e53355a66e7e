//! Output device playback using cpal
//!
//! Mirrors the capture side: the cpal output `Stream` is owned by a dedicated
//! thread, the callback pulls samples from the shared [`ClipQueue`], applies
//! volume and output mute, and posts clip lifecycle signals through an
//! unbounded channel (the callback must never block).

use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, StreamConfig};
use tokio::sync::mpsc;

use super::queue::{AudioClip, ClipQueue, PlaybackEvent};
use crate::error::VoiceError;
use crate::spectrum::SpectrumSender;

/// Assumed rate for clips that arrive as raw PCM16 without a WAV header.
const RAW_PCM_SAMPLE_RATE: u32 = 48_000;

/// How long to wait for the device thread to report init success/failure.
const INIT_TIMEOUT: Duration = Duration::from_secs(5);

enum Command {
    Shutdown,
}

/// Handle to the running playback engine.
pub struct Player {
    queue: Arc<Mutex<ClipQueue>>,
    volume_bits: Arc<AtomicU32>,
    output_muted: Arc<AtomicBool>,
    control_tx: std_mpsc::Sender<Command>,
    thread: Option<std::thread::JoinHandle<()>>,
    output_sample_rate: u32,
}

impl Player {
    /// Initialize the default output device and start the playback thread.
    ///
    /// Clip lifecycle signals are delivered through `event_tx`; post-volume
    /// output samples feed `spectrum_tx` for the output visualization.
    pub fn start(
        event_tx: mpsc::UnboundedSender<PlaybackEvent>,
        spectrum_tx: SpectrumSender,
    ) -> Result<Self, VoiceError> {
        let queue = Arc::new(Mutex::new(ClipQueue::new()));
        let volume_bits = Arc::new(AtomicU32::new(1.0f32.to_bits()));
        let output_muted = Arc::new(AtomicBool::new(false));
        let (control_tx, control_rx) = std_mpsc::channel::<Command>();
        let (init_tx, init_rx) = std_mpsc::channel::<Result<u32, VoiceError>>();

        let thread_queue = queue.clone();
        let thread_volume = volume_bits.clone();
        let thread_muted = output_muted.clone();

        let thread = std::thread::Builder::new()
            .name("voicelink-player".into())
            .spawn(move || {
                match build_output(thread_queue, thread_volume, thread_muted, event_tx, spectrum_tx)
                {
                    Ok((stream, sample_rate)) => {
                        if init_tx.send(Ok(sample_rate)).is_err() {
                            return;
                        }
                        let _ = control_rx.recv();
                        drop(stream);
                        log::info!("Player: device thread exited");
                    }
                    Err(e) => {
                        let _ = init_tx.send(Err(e));
                    }
                }
            })
            .map_err(|e| VoiceError::PlaybackInitFailed(e.to_string()))?;

        let output_sample_rate = match init_rx.recv_timeout(INIT_TIMEOUT) {
            Ok(Ok(rate)) => rate,
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(VoiceError::PlaybackInitFailed(
                    "Timed out waiting for output device initialization".into(),
                ))
            }
        };

        log::info!("Player: output at {}Hz", output_sample_rate);

        Ok(Self {
            queue,
            volume_bits,
            output_muted,
            control_tx,
            thread: Some(thread),
            output_sample_rate,
        })
    }

    /// Decode a base64 clip payload and enqueue it.
    ///
    /// A decode failure is scoped to this clip: the error is returned for
    /// reporting and the queue keeps playing whatever else it holds.
    pub fn add_clip(&self, id: &str, base64_data: &str) -> Result<(), VoiceError> {
        let bytes = STANDARD
            .decode(base64_data)
            .map_err(|e| VoiceError::ClipDecodeFailed {
                clip_id: id.to_string(),
                detail: format!("invalid base64: {}", e),
            })?;

        let samples = decode_samples(&bytes, self.output_sample_rate).map_err(|detail| {
            VoiceError::ClipDecodeFailed {
                clip_id: id.to_string(),
                detail,
            }
        })?;

        if let Ok(mut queue) = self.queue.lock() {
            queue.push(AudioClip {
                id: id.to_string(),
                samples,
            });
        }
        Ok(())
    }

    /// Stop the current clip immediately and drop everything queued.
    pub fn clear_queue(&self) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.clear();
        }
    }

    /// Whether a clip is currently audible.
    pub fn is_playing(&self) -> bool {
        self.queue.lock().map(|q| q.is_playing()).unwrap_or(false)
    }

    /// Clips queued behind the one playing.
    pub fn queue_len(&self) -> usize {
        self.queue.lock().map(|q| q.len()).unwrap_or(0)
    }

    /// Output-level mute, independent of decode/queue state and of volume.
    pub fn mute_output(&self) {
        self.output_muted.store(true, Ordering::SeqCst);
    }

    pub fn unmute_output(&self) {
        self.output_muted.store(false, Ordering::SeqCst);
    }

    pub fn is_output_muted(&self) -> bool {
        self.output_muted.load(Ordering::SeqCst)
    }

    /// Set output volume, clamped to 0.0-1.0. Applied continuously.
    pub fn set_volume(&self, volume: f32) {
        let clamped = volume.clamp(0.0, 1.0);
        self.volume_bits.store(clamped.to_bits(), Ordering::SeqCst);
    }

    pub fn volume(&self) -> f32 {
        f32::from_bits(self.volume_bits.load(Ordering::SeqCst))
    }

    /// Sample rate of the negotiated output stream.
    pub fn output_sample_rate(&self) -> u32 {
        self.output_sample_rate
    }

    /// Full teardown of the output device context. Safe to call twice.
    pub fn stop_all(&mut self) -> Result<(), VoiceError> {
        self.clear_queue();
        let Some(thread) = self.thread.take() else {
            return Ok(()); // Never initialized or already stopped
        };
        let _ = self.control_tx.send(Command::Shutdown);
        thread
            .join()
            .map_err(|_| VoiceError::PlaybackTeardownFailed("device thread panicked".into()))
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        if self.thread.is_some() {
            let _ = self.control_tx.send(Command::Shutdown);
        }
    }
}

fn build_output(
    queue: Arc<Mutex<ClipQueue>>,
    volume_bits: Arc<AtomicU32>,
    output_muted: Arc<AtomicBool>,
    event_tx: mpsc::UnboundedSender<PlaybackEvent>,
    spectrum_tx: SpectrumSender,
) -> Result<(cpal::Stream, u32), VoiceError> {
    let host = cpal::default_host();
    let device = host.default_output_device().ok_or_else(|| {
        VoiceError::PlaybackInitFailed("No audio output device found".into())
    })?;

    log::info!("Player: using output device {:?}", device.name());

    let supported = device
        .default_output_config()
        .map_err(|e| VoiceError::PlaybackInitFailed(e.to_string()))?;
    let sample_format = supported.sample_format();
    let config: StreamConfig = supported.into();
    let sample_rate = config.sample_rate.0;

    let stream = match sample_format {
        SampleFormat::F32 => build_out_stream_typed::<f32>(
            &device, &config, queue, volume_bits, output_muted, event_tx, spectrum_tx,
        ),
        SampleFormat::I16 => build_out_stream_typed::<i16>(
            &device, &config, queue, volume_bits, output_muted, event_tx, spectrum_tx,
        ),
        SampleFormat::U16 => build_out_stream_typed::<u16>(
            &device, &config, queue, volume_bits, output_muted, event_tx, spectrum_tx,
        ),
        other => {
            return Err(VoiceError::PlaybackInitFailed(format!(
                "Unsupported output sample format {:?}",
                other
            )))
        }
    }?;

    stream
        .play()
        .map_err(|e| VoiceError::PlaybackInitFailed(e.to_string()))?;

    Ok((stream, sample_rate))
}

fn build_out_stream_typed<T>(
    device: &Device,
    config: &StreamConfig,
    queue: Arc<Mutex<ClipQueue>>,
    volume_bits: Arc<AtomicU32>,
    output_muted: Arc<AtomicBool>,
    event_tx: mpsc::UnboundedSender<PlaybackEvent>,
    spectrum_tx: SpectrumSender,
) -> Result<cpal::Stream, VoiceError>
where
    T: cpal::SizedSample + cpal::FromSample<f32>,
{
    let err_fn = |err| log::error!("Player stream error: {}", err);
    let channels = config.channels as usize;
    let mut mono: Vec<f32> = Vec::new();
    let mut events: Vec<PlaybackEvent> = Vec::new();

    let stream = device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                let frames = data.len() / channels.max(1);
                mono.resize(frames, 0.0);
                events.clear();

                if let Ok(mut q) = queue.lock() {
                    q.next_samples(&mut mono, &mut events);
                } else {
                    mono.fill(0.0);
                }

                let volume = if output_muted.load(Ordering::SeqCst) {
                    0.0
                } else {
                    f32::from_bits(volume_bits.load(Ordering::SeqCst))
                };

                for (frame, &sample) in mono.iter().enumerate() {
                    let value = T::from_sample(sample * volume);
                    for ch in 0..channels {
                        data[frame * channels + ch] = value;
                    }
                }

                for event in events.drain(..) {
                    let _ = event_tx.send(event);
                }

                let snapshot: Vec<i16> = mono
                    .iter()
                    .map(|&s| ((s * volume).clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
                    .collect();
                let _ = spectrum_tx.try_send(snapshot);
            },
            err_fn,
            None,
        )
        .map_err(|e| VoiceError::PlaybackInitFailed(e.to_string()))?;

    Ok(stream)
}

/// Decode a clip payload into mono f32 at the output rate.
///
/// WAV-framed payloads (RIFF magic) are parsed with hound; anything else is
/// treated as raw PCM16 little-endian mono.
fn decode_samples(bytes: &[u8], output_rate: u32) -> Result<Vec<f32>, String> {
    if bytes.len() >= 4 && &bytes[..4] == b"RIFF" {
        decode_wav(bytes, output_rate)
    } else {
        decode_raw_pcm16(bytes, output_rate)
    }
}

fn decode_wav(bytes: &[u8], output_rate: u32) -> Result<Vec<f32>, String> {
    let reader = hound::WavReader::new(Cursor::new(bytes)).map_err(|e| e.to_string())?;
    let spec = reader.spec();

    let mono: Vec<f32> = match (spec.sample_format, spec.bits_per_sample) {
        (hound::SampleFormat::Int, 16) => mixdown(
            reader
                .into_samples::<i16>()
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| e.to_string())?
                .iter()
                .map(|&s| s as f32 / i16::MAX as f32),
            spec.channels,
        ),
        (hound::SampleFormat::Float, 32) => mixdown(
            reader
                .into_samples::<f32>()
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| e.to_string())?
                .into_iter(),
            spec.channels,
        ),
        (format, bits) => {
            return Err(format!("unsupported WAV format {:?}/{} bits", format, bits))
        }
    };

    Ok(resample_linear(&mono, spec.sample_rate, output_rate))
}

fn decode_raw_pcm16(bytes: &[u8], output_rate: u32) -> Result<Vec<f32>, String> {
    if bytes.len() % 2 != 0 {
        return Err(format!("odd byte length {} for PCM16 payload", bytes.len()));
    }
    let samples: Vec<f32> = bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / i16::MAX as f32)
        .collect();
    Ok(resample_linear(&samples, RAW_PCM_SAMPLE_RATE, output_rate))
}

/// Average interleaved channels down to mono.
fn mixdown(samples: impl Iterator<Item = f32>, channels: u16) -> Vec<f32> {
    let channels = channels.max(1) as usize;
    if channels == 1 {
        return samples.collect();
    }
    let interleaved: Vec<f32> = samples.collect();
    interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Linear-interpolation resampling for arbitrary rate ratios.
fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() || from_rate == 0 || to_rate == 0 {
        return samples.to_vec();
    }

    let out_len = ((samples.len() as u64 * to_rate as u64) / from_rate as u64).max(1) as usize;
    let step = from_rate as f64 / to_rate as f64;
    let last = samples.len() - 1;

    (0..out_len)
        .map(|i| {
            let pos = i as f64 * step;
            let i0 = (pos as usize).min(last);
            let i1 = (i0 + 1).min(last);
            let frac = (pos - i0 as f64) as f32;
            samples[i0] * (1.0 - frac) + samples[i1] * frac
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wav_bytes(samples: &[i16], sample_rate: u32, channels: u16) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for &s in samples {
                writer.write_sample(s).unwrap();
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }

    #[test]
    fn test_decode_wav_mono() {
        let bytes = wav_bytes(&[i16::MAX, 0, i16::MIN + 1], 48_000, 1);
        let samples = decode_samples(&bytes, 48_000).unwrap();
        assert_eq!(samples.len(), 3);
        assert!((samples[0] - 1.0).abs() < 0.001);
        assert_eq!(samples[1], 0.0);
        assert!((samples[2] + 1.0).abs() < 0.001);
    }

    #[test]
    fn test_decode_wav_stereo_mixes_down() {
        // L=1.0, R=0.0 should average to ~0.5
        let bytes = wav_bytes(&[i16::MAX, 0, i16::MAX, 0], 48_000, 2);
        let samples = decode_samples(&bytes, 48_000).unwrap();
        assert_eq!(samples.len(), 2);
        assert!((samples[0] - 0.5).abs() < 0.001);
    }

    #[test]
    fn test_decode_wav_resamples_to_output_rate() {
        let bytes = wav_bytes(&vec![1000i16; 240], 24_000, 1);
        let samples = decode_samples(&bytes, 48_000).unwrap();
        // 240 samples at 24kHz is 10ms, which is 480 samples at 48kHz
        assert_eq!(samples.len(), 480);
    }

    #[test]
    fn test_decode_raw_pcm16() {
        let bytes = pcm_bytes(&[0x1234, -5]);
        let samples = decode_samples(&bytes, RAW_PCM_SAMPLE_RATE).unwrap();
        assert_eq!(samples.len(), 2);
        assert!((samples[0] - 0x1234 as f32 / i16::MAX as f32).abs() < 1e-6);
    }

    fn pcm_bytes(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|&s| s.to_le_bytes()).collect()
    }

    #[test]
    fn test_decode_raw_odd_length_fails() {
        assert!(decode_samples(&[0x01, 0x02, 0x03], 48_000).is_err());
    }

    #[test]
    fn test_decode_truncated_wav_fails() {
        let mut bytes = wav_bytes(&[100i16; 100], 48_000, 1);
        bytes.truncate(10);
        assert!(decode_samples(&bytes, 48_000).is_err());
    }

    #[test]
    fn test_resample_identity() {
        let samples = vec![0.1, 0.2, 0.3];
        assert_eq!(resample_linear(&samples, 48_000, 48_000), samples);
    }

    #[test]
    fn test_resample_halves_and_doubles_length() {
        let samples = vec![0.5; 1000];
        assert_eq!(resample_linear(&samples, 48_000, 24_000).len(), 500);
        assert_eq!(resample_linear(&samples, 24_000, 48_000).len(), 2000);
    }

    #[test]
    fn test_resample_interpolates_between_points() {
        let samples = vec![0.0, 1.0];
        let doubled = resample_linear(&samples, 24_000, 48_000);
        assert_eq!(doubled.len(), 4);
        assert_eq!(doubled[0], 0.0);
        assert!(doubled[1] > 0.0 && doubled[1] < 1.0);
    }

    #[test]
    fn test_mixdown_mono_passthrough() {
        let samples = vec![0.1, 0.2];
        assert_eq!(mixdown(samples.clone().into_iter(), 1), samples);
    }

    #[tokio::test]
    #[ignore] // Requires an audio output device
    async fn test_player_lifecycle_on_real_device() {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let (spectrum_tx, _spectrum_rx) = crate::spectrum::spectrum_channel();

        let mut player = Player::start(event_tx, spectrum_tx).expect("player start failed");
        assert_eq!(player.volume(), 1.0);

        player.set_volume(0.5);
        assert_eq!(player.volume(), 0.5);
        player.set_volume(7.0);
        assert_eq!(player.volume(), 1.0, "volume clamps to 1.0");

        // 100ms of quiet tone as raw PCM16
        let clip: Vec<i16> = vec![1000; 4800];
        let data = STANDARD.encode(pcm_bytes(&clip));
        player.add_clip("clip-1", &data).unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), event_rx.recv())
            .await
            .expect("no playback event")
            .unwrap();
        assert_eq!(
            event,
            PlaybackEvent::ClipStarted {
                id: "clip-1".into()
            }
        );

        player.stop_all().expect("teardown failed");
        player.stop_all().expect("second teardown failed");
    }
}
