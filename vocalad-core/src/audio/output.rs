//! Output stream hosting for the playback backends.
//!
//! The stream lives on its own thread for the same `!Send` reason as capture.
//! Backends supply a [`RenderSource`] that fills mono buffers at the device
//! rate; the callback fans the mono signal out to every device channel.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread::JoinHandle;

use crate::error::{Result, VocaladError};

/// Fills mono output buffers from the audio callback.
///
/// Called on the real-time thread: implementations must not block or allocate
/// per call.
pub trait RenderSource: Send + 'static {
    /// Overwrite `out` with the next `out.len()` mono samples.
    fn render(&mut self, out: &mut [f32]);
}

/// Running output stream. Closing (or dropping) releases the device.
pub struct OutputStream {
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    sample_rate: u32,
    channels: u16,
}

impl OutputStream {
    /// Open `preferred` (or the default output) and start rendering from `render`.
    ///
    /// # Errors
    /// `NoDefaultOutputDevice` / `AudioStream` when the device cannot be opened.
    #[cfg(feature = "audio-cpal")]
    pub fn open<R: RenderSource>(preferred: Option<&str>, render: R) -> Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let thread_running = Arc::clone(&running);
        let preferred = preferred.map(str::to_owned);
        let (open_tx, open_rx) = std::sync::mpsc::channel::<Result<(u32, u16)>>();

        let worker = std::thread::Builder::new()
            .name("vocalad-output".into())
            .spawn(move || {
                let stream =
                    match cpal_output::open(preferred.as_deref(), render, Arc::clone(&thread_running)) {
                        Ok((stream, rate, channels)) => {
                            let _ = open_tx.send(Ok((rate, channels)));
                            stream
                        }
                        Err(e) => {
                            let _ = open_tx.send(Err(e));
                            return;
                        }
                    };
                while thread_running.load(Ordering::Relaxed) {
                    std::thread::park_timeout(std::time::Duration::from_millis(50));
                }
                drop(stream);
            })
            .map_err(|e| VocaladError::AudioStream(format!("spawn output thread: {e}")))?;

        match open_rx.recv() {
            Ok(Ok((sample_rate, channels))) => {
                tracing::info!(sample_rate, channels, "output stream started");
                Ok(Self {
                    running,
                    worker: Some(worker),
                    sample_rate,
                    channels,
                })
            }
            Ok(Err(e)) => {
                let _ = worker.join();
                Err(e)
            }
            Err(_) => Err(VocaladError::Other(anyhow::anyhow!(
                "output thread died before reporting device state"
            ))),
        }
    }

    #[cfg(not(feature = "audio-cpal"))]
    pub fn open<R: RenderSource>(_preferred: Option<&str>, _render: R) -> Result<Self> {
        Err(VocaladError::AudioStream(
            "compiled without audio-cpal feature".into(),
        ))
    }

    /// Device sample rate in Hz.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn close(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            worker.thread().unpark();
            if worker.join().is_err() {
                tracing::error!("output thread panicked");
            }
            tracing::info!("output stream closed");
        }
    }
}

impl Drop for OutputStream {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(feature = "audio-cpal")]
mod cpal_output {
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    };

    use cpal::{
        traits::{DeviceTrait, StreamTrait},
        FromSample, Sample, SampleFormat, SizedSample, Stream, StreamConfig,
    };

    use super::RenderSource;
    use crate::{
        audio::device::{resolve_device, DeviceDirection},
        error::{Result, VocaladError},
    };

    pub(super) fn open<R: RenderSource>(
        preferred: Option<&str>,
        render: R,
        running: Arc<AtomicBool>,
    ) -> Result<(Stream, u32, u16)> {
        let device = resolve_device(DeviceDirection::Output, preferred)?;
        tracing::info!(
            device = device.name().unwrap_or_default().as_str(),
            "opening output device"
        );

        let supported = device
            .default_output_config()
            .map_err(|e| VocaladError::AudioDevice(e.to_string()))?;
        let sample_rate = supported.sample_rate().0;
        let channels = supported.channels();
        let config = StreamConfig {
            channels,
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let stream = match supported.sample_format() {
            SampleFormat::F32 => build::<f32, R>(&device, &config, render, running),
            SampleFormat::I16 => build::<i16, R>(&device, &config, render, running),
            SampleFormat::I32 => build::<i32, R>(&device, &config, render, running),
            SampleFormat::U16 => build::<u16, R>(&device, &config, render, running),
            SampleFormat::U8 => build::<u8, R>(&device, &config, render, running),
            fmt => {
                return Err(VocaladError::AudioStream(format!(
                    "unsupported output sample format: {fmt:?}"
                )))
            }
        }
        .map_err(|e| VocaladError::AudioStream(e.to_string()))?;

        stream
            .play()
            .map_err(|e| VocaladError::AudioStream(e.to_string()))?;
        Ok((stream, sample_rate, channels))
    }

    fn build<T, R>(
        device: &cpal::Device,
        config: &StreamConfig,
        mut render: R,
        running: Arc<AtomicBool>,
    ) -> std::result::Result<Stream, cpal::BuildStreamError>
    where
        T: SizedSample + FromSample<f32>,
        R: RenderSource,
    {
        let ch = config.channels.max(1) as usize;
        let mut mono: Vec<f32> = Vec::with_capacity(crate::audio::CALLBACK_SCRATCH_FRAMES);
        device.build_output_stream(
            config,
            move |data: &mut [T], _info: &cpal::OutputCallbackInfo| {
                let frames = data.len() / ch;
                mono.resize(frames, 0.0);
                if running.load(Ordering::Relaxed) {
                    render.render(&mut mono);
                } else {
                    mono.fill(0.0);
                }
                for (frame, &s) in data.chunks_mut(ch).zip(mono.iter()) {
                    let v = T::from_sample(s);
                    frame.fill(v);
                }
            },
            |err| tracing::error!("audio output stream error: {err}"),
            None,
        )
    }
}
