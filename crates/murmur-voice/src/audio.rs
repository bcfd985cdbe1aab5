//! Microphone capture plumbing: PCM encoding, frame assembly, and the
//! capture-session lifecycle.
//!
//! Blocks of 32-bit float samples come off a capture device, get scaled to
//! 16-bit little-endian PCM, base64-encoded, and shipped to the provider as
//! interim `audio_input` frames. A single pump task preserves block order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use murmur_types::{AudioSettings, ClientFrame};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::client::{SessionClient, Transport};
use crate::error::VoiceError;

/// Scales float samples in `[-1.0, 1.0]` to signed 16-bit PCM and packs
/// them little-endian. Out-of-range samples clamp rather than wrap.
pub fn encode_pcm_block(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let clamped = sample.clamp(-1.0, 1.0);
        let quantized = (clamped * 32_767.0).round() as i16;
        out.extend_from_slice(&quantized.to_le_bytes());
    }
    out
}

/// Builds the interim `audio_input` frame for one encoded block.
pub fn audio_input_frame(pcm: &[u8]) -> ClientFrame {
    ClientFrame::AudioInput {
        data: BASE64.encode(pcm),
        interim: true,
    }
}

/// Hardware-facing capture handle. Teardown happens in a fixed order:
/// detach the sample processor, close the audio context, stop the input
/// tracks.
pub trait CaptureDevice: Send + Sync + 'static {
    fn disconnect_processor(&self);
    fn close_context(&self);
    fn stop_tracks(&self);
}

/// A running capture session. Dropping it without calling [`stop`] leaks
/// the device, so callers hold it for the lifetime of the capture.
///
/// [`stop`]: AudioStream::stop
pub struct AudioStream {
    device: Arc<dyn CaptureDevice>,
    pump: JoinHandle<()>,
    stopped: Arc<AtomicBool>,
}

impl AudioStream {
    /// Stops the capture. Safe to call more than once; only the first call
    /// releases the device.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.pump.abort();
        self.device.disconnect_processor();
        self.device.close_context();
        self.device.stop_tracks();
    }
}

impl Drop for AudioStream {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Starts streaming captured sample blocks to the provider.
///
/// Sends a `session_settings` handshake describing the PCM format first,
/// then pumps blocks from `samples` in arrival order. If the handshake
/// fails the device is released before the error is returned.
pub async fn start_audio_stream<T: Transport>(
    client: &SessionClient<T>,
    device: Arc<dyn CaptureDevice>,
    settings: AudioSettings,
    mut samples: mpsc::Receiver<Vec<f32>>,
) -> Result<AudioStream, VoiceError> {
    let handshake = ClientFrame::SessionSettings { audio: settings };
    let payload = serde_json::to_string(&handshake)
        .map_err(|e| VoiceError::Capture(e.to_string()))?;
    if let Err(e) = client.send(payload).await {
        // Failed before any audio moved; release the hardware now.
        device.disconnect_processor();
        device.close_context();
        device.stop_tracks();
        return Err(e);
    }

    let pump_client = client.clone();
    let pump = tokio::spawn(async move {
        while let Some(block) = samples.recv().await {
            let frame = audio_input_frame(&encode_pcm_block(&block));
            let payload = match serde_json::to_string(&frame) {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!("failed to serialize audio frame: {}", e);
                    continue;
                }
            };
            if let Err(e) = pump_client.send(payload).await {
                tracing::warn!("audio frame dropped: {}", e);
            }
        }
    });

    Ok(AudioStream {
        device,
        pump,
        stopped: Arc::new(AtomicBool::new(false)),
    })
}
