//! Audio capture and output plumbing.
//!
//! # Design constraints
//!
//! The cpal input callback runs on an OS audio thread at elevated priority. It
//! **must not** allocate beyond its first call, block on a mutex, or perform I/O.
//! `CpalCapture` satisfies that by only downmixing into a reusable buffer and
//! pushing into an SPSC ring producer. A dedicated framing thread drains the
//! ring, resamples to the session rate and cuts fixed-length `AudioFrame`s.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio on
//! macOS), so the stream is created and dropped on the framing thread. A sync
//! oneshot channel propagates open errors back to `start()`.

pub mod device;
pub mod output;
pub mod pcm;
pub mod replay;
pub mod resample;

pub use replay::ReplayCapture;

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread::JoinHandle;

use crate::{
    buffering::frame::AudioFrame,
    error::{Result, VocaladError},
};

/// Callback invoked once per captured frame, on the capture source's thread.
pub type FrameCallback = Box<dyn FnMut(AudioFrame) + Send + 'static>;

/// A source of fixed-size mono frames at the session capture rate.
///
/// Implementations deliver frames on their own cadence until `stop()`.
pub trait CaptureSource: Send {
    /// Begin delivering frames to `on_frame`.
    ///
    /// # Errors
    /// `VocaladError::PermissionDenied` when the device cannot be acquired.
    fn start(&mut self, on_frame: FrameCallback) -> Result<()>;

    /// Stop delivering frames and release the device. Idempotent.
    fn stop(&mut self);

    fn is_running(&self) -> bool;
}

/// Frame layout requested from a capture source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureSettings {
    /// Session capture rate in Hz. Frames are delivered at this rate regardless
    /// of the device's native rate.
    pub sample_rate: u32,
    /// Samples per frame.
    pub frame_len: usize,
    /// Input device name to prefer over the system default.
    pub preferred_device: Option<String>,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            frame_len: 2048,
            preferred_device: None,
        }
    }
}

/// Samples drained from the capture ring per framing-thread iteration.
const DRAIN_CHUNK: usize = 960;

/// Framing-thread sleep when the ring is empty.
#[cfg(feature = "audio-cpal")]
const EMPTY_SLEEP_MS: u64 = 3;

/// Frames of callback scratch reserved before a stream starts.
#[cfg(feature = "audio-cpal")]
pub(crate) const CALLBACK_SCRATCH_FRAMES: usize = 8192;

/// Microphone capture through cpal.
pub struct CpalCapture {
    settings: CaptureSettings,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    device_sample_rate: Option<u32>,
}

impl CpalCapture {
    pub fn new(settings: CaptureSettings) -> Self {
        Self {
            settings,
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
            device_sample_rate: None,
        }
    }

    /// Native rate of the opened device, once started.
    pub fn device_sample_rate(&self) -> Option<u32> {
        self.device_sample_rate
    }
}

/// Device-rate to session-rate converter for the framing thread.
///
/// # Errors
/// `AudioDevice` when the device reports an unusable rate.
pub(crate) fn capture_converter(
    device_rate: u32,
    settings: &CaptureSettings,
) -> Result<resample::RateConverter> {
    resample::RateConverter::new(device_rate, settings.sample_rate, DRAIN_CHUNK)
}

#[cfg(feature = "audio-cpal")]
impl CaptureSource for CpalCapture {
    fn start(&mut self, on_frame: FrameCallback) -> Result<()> {
        if self.worker.is_some() {
            return Err(VocaladError::AlreadyRunning);
        }
        self.running.store(true, Ordering::SeqCst);

        let settings = self.settings.clone();
        let running = Arc::clone(&self.running);
        let (open_tx, open_rx) = std::sync::mpsc::channel::<Result<u32>>();

        let worker = std::thread::Builder::new()
            .name("vocalad-capture".into())
            .spawn(move || {
                let (producer, consumer) = crate::buffering::create_capture_ring();
                let (stream, device_rate) = match cpal_input::open(
                    producer,
                    Arc::clone(&running),
                    settings.preferred_device.as_deref(),
                ) {
                    Ok(opened) => opened,
                    Err(e) => {
                        let _ = open_tx.send(Err(e));
                        running.store(false, Ordering::SeqCst);
                        return;
                    }
                };
                // The device only counts as open once frames can be produced.
                let resampler = match capture_converter(device_rate, &settings) {
                    Ok(r) => r,
                    Err(e) => {
                        let _ = open_tx.send(Err(e));
                        running.store(false, Ordering::SeqCst);
                        return;
                    }
                };
                let _ = open_tx.send(Ok(device_rate));

                cpal_input::frame_loop(consumer, &running, resampler, &settings, on_frame);

                // Stream drops here, releasing the device on this thread.
                drop(stream);
            })
            .map_err(|e| VocaladError::AudioStream(format!("spawn capture thread: {e}")))?;

        match open_rx.recv() {
            Ok(Ok(rate)) => {
                tracing::info!(device_rate = rate, "capture started");
                self.device_sample_rate = Some(rate);
                self.worker = Some(worker);
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = worker.join();
                self.running.store(false, Ordering::SeqCst);
                Err(e)
            }
            Err(_) => {
                self.running.store(false, Ordering::SeqCst);
                Err(VocaladError::Other(anyhow::anyhow!(
                    "capture thread died before reporting device state"
                )))
            }
        }
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("capture thread panicked");
            }
            tracing::info!("capture stopped");
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }
}

/// Stub when the `audio-cpal` feature is disabled.
#[cfg(not(feature = "audio-cpal"))]
impl CaptureSource for CpalCapture {
    fn start(&mut self, _on_frame: FrameCallback) -> Result<()> {
        let _ = (&self.settings, &self.worker, self.device_sample_rate);
        Err(VocaladError::AudioStream(
            "compiled without audio-cpal feature".into(),
        ))
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }

    fn is_running(&self) -> bool {
        false
    }
}

impl Drop for CpalCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(feature = "audio-cpal")]
mod cpal_input {
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    };

    use cpal::{
        traits::{DeviceTrait, StreamTrait},
        FromSample, Sample, SampleFormat, SizedSample, Stream, StreamConfig,
    };
    use tracing::{debug, error, info, warn};

    use super::{
        CaptureSettings, FrameCallback, CALLBACK_SCRATCH_FRAMES, DRAIN_CHUNK, EMPTY_SLEEP_MS,
    };
    use crate::{
        audio::{
            device::{resolve_device, DeviceDirection},
            resample::RateConverter,
        },
        buffering::{framer::FrameAssembler, AudioConsumer, AudioProducer, Consumer, Producer},
        error::{Result, VocaladError},
    };

    fn unavailable(e: impl std::fmt::Display) -> VocaladError {
        VocaladError::PermissionDenied(e.to_string())
    }

    /// Open the input device and start streaming mono f32 into `producer`.
    pub(super) fn open(
        producer: AudioProducer,
        running: Arc<AtomicBool>,
        preferred: Option<&str>,
    ) -> Result<(Stream, u32)> {
        let device = resolve_device(DeviceDirection::Input, preferred).map_err(|e| match e {
            VocaladError::NoDefaultInputDevice => unavailable("no input device available"),
            other => other,
        })?;

        info!(
            device = device.name().unwrap_or_default().as_str(),
            "opening input device"
        );

        let supported = device.default_input_config().map_err(unavailable)?;
        let sample_rate = supported.sample_rate().0;
        let channels = supported.channels();
        info!(sample_rate, channels, "input config selected");

        let config = StreamConfig {
            channels,
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let stream = match supported.sample_format() {
            SampleFormat::F32 => build::<f32>(&device, &config, producer, running),
            SampleFormat::I16 => build::<i16>(&device, &config, producer, running),
            SampleFormat::I32 => build::<i32>(&device, &config, producer, running),
            SampleFormat::U16 => build::<u16>(&device, &config, producer, running),
            SampleFormat::U8 => build::<u8>(&device, &config, producer, running),
            fmt => {
                return Err(VocaladError::AudioStream(format!(
                    "unsupported sample format: {fmt:?}"
                )))
            }
        }
        .map_err(|e| match e {
            cpal::BuildStreamError::DeviceNotAvailable => unavailable(e),
            other => VocaladError::AudioStream(other.to_string()),
        })?;

        stream.play().map_err(|e| match e {
            cpal::PlayStreamError::DeviceNotAvailable => unavailable(e),
            other => VocaladError::AudioStream(other.to_string()),
        })?;

        Ok((stream, sample_rate))
    }

    fn build<T>(
        device: &cpal::Device,
        config: &StreamConfig,
        mut producer: AudioProducer,
        running: Arc<AtomicBool>,
    ) -> std::result::Result<Stream, cpal::BuildStreamError>
    where
        T: SizedSample,
        f32: FromSample<T>,
    {
        let ch = config.channels.max(1) as usize;
        let mut mix_buf: Vec<f32> = Vec::with_capacity(CALLBACK_SCRATCH_FRAMES);
        device.build_input_stream(
            config,
            move |data: &[T], _info: &cpal::InputCallbackInfo| {
                if !running.load(Ordering::Relaxed) {
                    return;
                }
                let frames = data.len() / ch;
                mix_buf.resize(frames, 0.0);
                for (f, out) in mix_buf.iter_mut().enumerate() {
                    let base = f * ch;
                    let mut sum = 0f32;
                    for c in 0..ch {
                        sum += f32::from_sample(data[base + c]);
                    }
                    *out = sum / ch as f32;
                }
                let written = producer.push_slice(&mix_buf);
                if written < mix_buf.len() {
                    warn!("capture ring full: dropped {} frames", mix_buf.len() - written);
                }
            },
            |err| error!("audio input stream error: {err}"),
            None,
        )
    }

    /// Drain the ring until `running` clears, delivering session-rate frames.
    pub(super) fn frame_loop(
        mut consumer: AudioConsumer,
        running: &AtomicBool,
        mut resampler: RateConverter,
        settings: &CaptureSettings,
        mut on_frame: FrameCallback,
    ) {
        let mut framer = FrameAssembler::new(settings.frame_len, settings.sample_rate);
        let mut raw = vec![0f32; DRAIN_CHUNK];

        while running.load(Ordering::Relaxed) {
            let n = consumer.pop_slice(&mut raw);
            if n == 0 {
                std::thread::sleep(std::time::Duration::from_millis(EMPTY_SLEEP_MS));
                continue;
            }
            let resampled = resampler.process(&raw[..n]);
            if resampled.is_empty() {
                continue;
            }
            for frame in framer.push(&resampled) {
                debug!(seq = frame.seq, "capture frame ready");
                on_frame(frame);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_converter_rejects_unusable_device_rate() {
        let settings = CaptureSettings::default();
        assert!(matches!(
            capture_converter(0, &settings),
            Err(VocaladError::AudioDevice(_))
        ));
    }

    #[test]
    fn capture_converter_targets_session_rate() {
        let settings = CaptureSettings::default();
        let converter = capture_converter(48_000, &settings).unwrap();
        assert_eq!(converter.to_rate(), 16_000);
        assert!(!converter.is_passthrough());
        assert!(capture_converter(16_000, &settings).unwrap().is_passthrough());
    }
}
