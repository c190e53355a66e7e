//! Fixed-interval chunk accumulation for outbound audio
//!
//! Receives raw PCM16 batches from the capture callback, accumulates them
//! into fixed-duration chunks (default 100ms), and delivers each chunk as a
//! little-endian byte buffer. Chunks are never buffered indefinitely: if the
//! downstream channel is full, the chunk is dropped with a warning and the
//! next one proceeds.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Configuration for the chunk accumulator.
#[derive(Debug, Clone)]
pub struct ChunkerConfig {
    /// Negotiated capture sample rate in Hz.
    pub sample_rate: u32,
    /// Chunk duration in milliseconds.
    pub chunk_interval_ms: u32,
}

impl ChunkerConfig {
    /// Samples per chunk at the capture rate.
    pub fn samples_per_chunk(&self) -> usize {
        (self.sample_rate * self.chunk_interval_ms / 1000) as usize
    }
}

/// Encode PCM16 samples as little-endian bytes for the wire.
pub fn pcm16_to_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|&s| s.to_le_bytes()).collect()
}

/// Run the chunk accumulation loop until the sample channel closes or the
/// token is cancelled. Returns the number of chunks delivered.
///
/// A failed delivery (full or closed downstream channel) is isolated: the
/// chunk is dropped and accumulation continues.
pub async fn run_chunker(
    mut rx: mpsc::Receiver<Vec<i16>>,
    config: ChunkerConfig,
    chunk_tx: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
) -> u64 {
    let samples_per_chunk = config.samples_per_chunk().max(1);
    let mut buffer: Vec<i16> = Vec::with_capacity(samples_per_chunk * 2);
    let mut chunks_sent: u64 = 0;

    log::info!(
        "Chunker: started ({}Hz, {}ms chunks = {} samples)",
        config.sample_rate,
        config.chunk_interval_ms,
        samples_per_chunk
    );

    loop {
        let samples = tokio::select! {
            _ = cancel.cancelled() => break,
            recv = rx.recv() => match recv {
                Some(samples) => samples,
                None => break,
            },
        };

        buffer.extend(samples);

        while buffer.len() >= samples_per_chunk {
            let chunk: Vec<i16> = buffer.drain(..samples_per_chunk).collect();
            if deliver(&chunk_tx, &chunk) {
                chunks_sent += 1;
                if chunks_sent % 50 == 0 {
                    log::debug!("Chunker: sent {} chunks", chunks_sent);
                }
            }
        }
    }

    // Flush any partial tail so trailing speech isn't lost
    if !buffer.is_empty() {
        log::debug!("Chunker: flushing final partial chunk ({} samples)", buffer.len());
        if deliver(&chunk_tx, &buffer) {
            chunks_sent += 1;
        }
    }

    log::info!("Chunker: stopped after {} chunks", chunks_sent);
    chunks_sent
}

fn deliver(chunk_tx: &mpsc::Sender<Vec<u8>>, samples: &[i16]) -> bool {
    match chunk_tx.try_send(pcm16_to_bytes(samples)) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            log::warn!("Chunker: downstream full, dropping chunk");
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            log::debug!("Chunker: downstream closed, dropping chunk");
            false
        }
    }
}
