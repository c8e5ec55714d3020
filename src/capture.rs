//! Capture
//!
//! Sources of microphone audio. The engine acquires a source once per
//! session, pulls one [`SignalBuffer`] per tick while playing, and releases
//! the source when the session ends.

use std::collections::VecDeque;

use thiserror::Error;

use crate::pitch::{SignalBuffer, DEFAULT_WINDOW_SIZE};

/// Errors raised while acquiring an audio source.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// The user or the platform refused access to the input device.
    #[error("microphone permission denied: {0}")]
    PermissionDenied(String),

    /// The device could not be opened or configured.
    #[error("audio device error: {0}")]
    Device(String),
}

/// A source of recent mono audio.
pub trait AudioCapture {
    /// Open the source. Called once before the countdown starts.
    fn acquire(&mut self) -> Result<(), CaptureError>;

    /// The most recent window of audio, or `None` when the source is not acquired.
    fn sample(&mut self) -> Option<SignalBuffer>;

    /// Close the source. Must be safe to call when not acquired.
    fn release(&mut self);
}

/// An in-memory source that replays queued buffers.
///
/// Once the queue is empty it returns silence. Useful for simulation and for
/// driving the engine in tests.
#[derive(Debug, Clone)]
pub struct ScriptedCapture {
    sample_rate: f32,
    window: usize,
    queue: VecDeque<SignalBuffer>,
    denial: Option<String>,
    acquired: bool,
    acquisitions: usize,
    releases: usize,
}

impl ScriptedCapture {
    /// An empty source producing `window`-sample buffers at `sample_rate`.
    pub fn new(sample_rate: f32, window: usize) -> Self {
        ScriptedCapture {
            sample_rate,
            window,
            queue: VecDeque::new(),
            denial: None,
            acquired: false,
            acquisitions: 0,
            releases: 0,
        }
    }

    /// Make every `acquire` fail with a permission error.
    pub fn deny(mut self, reason: impl Into<String>) -> Self {
        self.denial = Some(reason.into());
        self
    }

    /// Allow acquisition again after [`ScriptedCapture::deny`].
    pub fn allow(&mut self) {
        self.denial = None;
    }

    /// Queue a buffer for a later `sample` call.
    pub fn push(&mut self, buffer: SignalBuffer) {
        self.queue.push_back(buffer);
    }

    /// Queue a sine tone of the configured window length.
    pub fn push_tone(&mut self, frequency: f32, amplitude: f32) {
        let tone = SignalBuffer::tone(frequency, amplitude, self.window, self.sample_rate);
        self.push(tone);
    }

    /// Queue a window of silence.
    pub fn push_silence(&mut self) {
        self.push(SignalBuffer::silence(self.window, self.sample_rate));
    }

    /// Buffers not yet consumed.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Whether the source is currently held.
    pub fn is_acquired(&self) -> bool {
        self.acquired
    }

    /// Number of successful acquisitions so far.
    pub fn acquisitions(&self) -> usize {
        self.acquisitions
    }

    /// Number of releases of a held source so far.
    pub fn releases(&self) -> usize {
        self.releases
    }
}

impl Default for ScriptedCapture {
    fn default() -> Self {
        ScriptedCapture::new(44_100.0, DEFAULT_WINDOW_SIZE)
    }
}

impl AudioCapture for ScriptedCapture {
    fn acquire(&mut self) -> Result<(), CaptureError> {
        if let Some(reason) = &self.denial {
            return Err(CaptureError::PermissionDenied(reason.clone()));
        }
        self.acquired = true;
        self.acquisitions += 1;
        Ok(())
    }

    fn sample(&mut self) -> Option<SignalBuffer> {
        if !self.acquired {
            return None;
        }
        Some(
            self.queue
                .pop_front()
                .unwrap_or_else(|| SignalBuffer::silence(self.window, self.sample_rate)),
        )
    }

    fn release(&mut self) {
        if self.acquired {
            self.acquired = false;
            self.releases += 1;
        }
    }
}

#[cfg(feature = "cpal")]
pub use self::live::CpalCapture;

#[cfg(feature = "cpal")]
mod live {
    use std::{
        collections::VecDeque,
        sync::{Arc, Mutex},
    };

    use cpal::{
        traits::{DeviceTrait, HostTrait, StreamTrait},
        FromSample, Sample, SampleFormat, SizedSample, Stream,
    };
    use log::{info, warn};

    use super::{AudioCapture, CaptureError};
    use crate::pitch::{SignalBuffer, DEFAULT_WINDOW_SIZE};

    /// Live capture from the default input device.
    ///
    /// The stream callback mixes each frame down to mono and keeps the most
    /// recent `window` samples in a ring buffer.
    pub struct CpalCapture {
        window: usize,
        ring: Arc<Mutex<VecDeque<f32>>>,
        stream: Option<Stream>,
        sample_rate: f32,
    }

    impl CpalCapture {
        /// A capture keeping `window` samples of history.
        pub fn new(window: usize) -> Self {
            CpalCapture {
                window,
                ring: Arc::new(Mutex::new(VecDeque::with_capacity(window))),
                stream: None,
                sample_rate: 0.0,
            }
        }
    }

    impl Default for CpalCapture {
        fn default() -> Self {
            Self::new(DEFAULT_WINDOW_SIZE)
        }
    }

    impl AudioCapture for CpalCapture {
        fn acquire(&mut self) -> Result<(), CaptureError> {
            if self.stream.is_some() {
                return Ok(());
            }
            let host = cpal::default_host();
            let device = host.default_input_device().ok_or_else(|| {
                CaptureError::PermissionDenied("no input device available".into())
            })?;
            let config = device
                .default_input_config()
                .map_err(|e| CaptureError::Device(e.to_string()))?;
            let sample_format = config.sample_format();
            let config = cpal::StreamConfig::from(config);
            self.sample_rate = config.sample_rate.0 as f32;
            info!(
                "capturing from {:?} at {} Hz",
                device.name().unwrap_or_default(),
                config.sample_rate.0
            );

            if let Ok(mut ring) = self.ring.lock() {
                ring.clear();
            }
            let ring = Arc::clone(&self.ring);
            let stream = match sample_format {
                SampleFormat::F32 => build_stream::<f32>(&device, &config, ring, self.window),
                SampleFormat::I16 => build_stream::<i16>(&device, &config, ring, self.window),
                SampleFormat::U16 => build_stream::<u16>(&device, &config, ring, self.window),
                other => Err(CaptureError::Device(format!(
                    "unsupported sample format {other:?}"
                ))),
            }?;
            stream
                .play()
                .map_err(|e| CaptureError::Device(e.to_string()))?;
            self.stream = Some(stream);
            Ok(())
        }

        fn sample(&mut self) -> Option<SignalBuffer> {
            self.stream.as_ref()?;
            let ring = self.ring.lock().ok()?;
            let mut samples = vec![0.0; self.window.saturating_sub(ring.len())];
            samples.extend(ring.iter().copied());
            Some(SignalBuffer::new(samples, self.sample_rate))
        }

        fn release(&mut self) {
            if let Some(stream) = self.stream.take() {
                if let Err(e) = stream.pause() {
                    warn!("failed to pause input stream: {e}");
                }
                info!("released input device");
            }
        }
    }

    impl Drop for CpalCapture {
        fn drop(&mut self) {
            self.release();
        }
    }

    fn build_stream<T>(
        device: &cpal::Device,
        config: &cpal::StreamConfig,
        ring: Arc<Mutex<VecDeque<f32>>>,
        window: usize,
    ) -> Result<Stream, CaptureError>
    where
        T: SizedSample + Send + 'static,
        f32: FromSample<T>,
    {
        let channels = usize::from(config.channels.max(1));
        let err_fn = |err| warn!("an error occurred on the input stream: {err}");

        device
            .build_input_stream(
                config,
                move |data: &[T], _: &cpal::InputCallbackInfo| {
                    let Ok(mut ring) = ring.lock() else {
                        return;
                    };
                    for frame in data.chunks(channels) {
                        let sum: f32 = frame.iter().map(|&s| s.to_sample::<f32>()).sum();
                        ring.push_back(sum / frame.len() as f32);
                    }
                    while ring.len() > window {
                        ring.pop_front();
                    }
                },
                err_fn,
                None,
            )
            .map_err(|e| CaptureError::Device(e.to_string()))
    }
}
