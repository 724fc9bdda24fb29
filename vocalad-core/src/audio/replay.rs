//! Capture source that replays a prepared buffer or WAV file.
//!
//! Used by the loopback binary and the integration tests in place of a
//! microphone. Frames go through the same resample + framing path as live
//! capture, so downstream stages cannot tell the difference.

use std::path::Path;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, info};

use super::{resample::RateConverter, CaptureSettings, CaptureSource, FrameCallback};
use crate::{
    buffering::framer::FrameAssembler,
    error::{Result, VocaladError},
};

/// Read a WAV file into mono f32 samples plus its sample rate.
///
/// # Errors
/// `VocaladError::Decode` when hound cannot parse the file.
pub fn read_wav_mono(path: &Path) -> Result<(Vec<f32>, u32)> {
    let wav_err = |e: hound::Error| VocaladError::Decode(format!("{}: {e}", path.display()));
    let mut reader = hound::WavReader::open(path).map_err(wav_err)?;
    let spec = reader.spec();
    let channels = usize::from(spec.channels.max(1));

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(wav_err)?,
        hound::SampleFormat::Int if spec.bits_per_sample <= 16 => reader
            .samples::<i16>()
            .map(|s| s.map(|v| v as f32 / 32768.0))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(wav_err)?,
        hound::SampleFormat::Int => {
            let scale = (1_i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(wav_err)?
        }
    };

    if channels == 1 {
        return Ok((interleaved, spec.sample_rate));
    }
    let mono = interleaved
        .chunks(channels)
        .map(|f| f.iter().sum::<f32>() / channels as f32)
        .collect();
    Ok((mono, spec.sample_rate))
}

/// Replays samples as if they came from a microphone.
pub struct ReplayCapture {
    samples: Arc<Vec<f32>>,
    source_rate: u32,
    settings: CaptureSettings,
    realtime: bool,
    pad_with_silence: bool,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl ReplayCapture {
    /// Replay `samples` recorded at `source_rate`.
    pub fn from_samples(samples: Vec<f32>, source_rate: u32, settings: CaptureSettings) -> Self {
        Self {
            samples: Arc::new(samples),
            source_rate,
            settings,
            realtime: true,
            pad_with_silence: false,
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    pub fn from_wav(path: &Path, settings: CaptureSettings) -> Result<Self> {
        let (samples, rate) = read_wav_mono(path)?;
        info!(
            path = %path.display(),
            samples = samples.len(),
            sample_rate = rate,
            "loaded replay audio"
        );
        Ok(Self::from_samples(samples, rate, settings))
    }

    /// Sleep one frame duration between deliveries (default `true`).
    pub fn realtime(mut self, on: bool) -> Self {
        self.realtime = on;
        self
    }

    /// Keep delivering silent frames after the buffer runs out, until stopped.
    pub fn pad_with_silence(mut self, on: bool) -> Self {
        self.pad_with_silence = on;
        self
    }

    /// Source audio length in seconds.
    pub fn duration_secs(&self) -> f64 {
        if self.source_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.source_rate as f64
    }
}

impl CaptureSource for ReplayCapture {
    fn start(&mut self, mut on_frame: FrameCallback) -> Result<()> {
        if self.worker.is_some() {
            return Err(VocaladError::AlreadyRunning);
        }
        let mut resampler =
            RateConverter::new(self.source_rate, self.settings.sample_rate, 1024)?;
        self.running.store(true, Ordering::SeqCst);

        let samples = Arc::clone(&self.samples);
        let running = Arc::clone(&self.running);
        let frame_len = self.settings.frame_len.max(1);
        let target_rate = self.settings.sample_rate;
        let realtime = self.realtime;
        let pad = self.pad_with_silence;

        let worker = std::thread::Builder::new()
            .name("vocalad-replay".into())
            .spawn(move || {
                let mut framer = FrameAssembler::new(frame_len, target_rate);
                let mut converted = resampler.process(&samples);
                converted.extend(resampler.finish());
                let cadence = Duration::from_secs_f64(frame_len as f64 / target_rate as f64);

                for frame in framer.push(&converted) {
                    if !running.load(Ordering::Relaxed) {
                        return;
                    }
                    on_frame(frame);
                    if realtime {
                        std::thread::sleep(cadence);
                    }
                }
                debug!("replay buffer exhausted");

                let silence = vec![0.0f32; frame_len];
                while pad && running.load(Ordering::Relaxed) {
                    for frame in framer.push(&silence) {
                        on_frame(frame);
                    }
                    std::thread::sleep(cadence);
                }
                running.store(false, Ordering::SeqCst);
            })
            .map_err(|e| VocaladError::AudioStream(format!("spawn replay thread: {e}")))?;

        self.worker = Some(worker);
        Ok(())
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("replay thread panicked");
            }
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }
}

impl Drop for ReplayCapture {
    fn drop(&mut self) {
        self.stop();
    }
}
