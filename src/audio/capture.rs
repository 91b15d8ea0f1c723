//! Real audio capture using CPAL (Cross-Platform Audio Library).
//!
//! Produces fixed-duration mono PCM16 frames on a drop-oldest queue. A
//! supervisor task re-binds the stream when the default device changes, the
//! stream goes silent past the dead-stream timeout, or the stream reports an
//! error. Bind and unbind are serialized through one mutex so the supervisor
//! and shutdown can never race on the same stream.

use crate::audio::device;
use crate::config::{AudioSettings, LevelMonitorSettings};
use crate::defaults;
use crate::error::{Result, TranskriboError};
use crate::pipeline::queue::DropOldestQueue;
use crate::pipeline::types::AudioFrame;
use cpal::traits::{DeviceTrait, StreamTrait};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Wrapper for cpal::Stream to make it Send.
///
/// SAFETY: the stream is only touched while holding the bind mutex in
/// `BindState`, so it never moves between threads concurrently.
struct SendableStream(cpal::Stream);

unsafe impl Send for SendableStream {}

/// State guarded by the bind mutex: the live stream and where it is bound.
struct BindState {
    stream: Option<SendableStream>,
    bound_index: Option<usize>,
    bound_name: String,
    bound_at: Instant,
}

struct CaptureShared {
    settings: AudioSettings,
    frames: Arc<DropOldestQueue<AudioFrame>>,
    bind: Mutex<BindState>,
    running: AtomicBool,
    stream_error: Arc<AtomicBool>,
    frame_index: Arc<AtomicU64>,
    /// Millis since capture start, updated by the callback on every frame.
    last_frame_ms: Arc<AtomicU64>,
    started_at: Instant,
}

impl CaptureShared {
    fn millis_since_start(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }

    fn mark_frame(&self) {
        self.last_frame_ms
            .store(self.millis_since_start(), Ordering::Relaxed);
    }

    fn last_frame_age(&self) -> Duration {
        let last = self.last_frame_ms.load(Ordering::Relaxed);
        Duration::from_millis(self.millis_since_start().saturating_sub(last))
    }
}

/// Capture stream producing ordered `AudioFrame`s with hot device re-bind.
pub struct CaptureStream {
    shared: Arc<CaptureShared>,
    supervisor: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl CaptureStream {
    pub fn new(settings: AudioSettings) -> Self {
        let shared = Arc::new(CaptureShared {
            settings,
            frames: Arc::new(DropOldestQueue::new(defaults::FRAME_QUEUE_CAPACITY)),
            bind: Mutex::new(BindState {
                stream: None,
                bound_index: None,
                bound_name: String::new(),
                bound_at: Instant::now(),
            }),
            running: AtomicBool::new(false),
            stream_error: Arc::new(AtomicBool::new(false)),
            frame_index: Arc::new(AtomicU64::new(0)),
            last_frame_ms: Arc::new(AtomicU64::new(0)),
            started_at: Instant::now(),
        });
        Self {
            shared,
            supervisor: Mutex::new(None),
        }
    }

    /// Handle for consuming frames. Cloneable; closed by `stop()`.
    pub fn frames(&self) -> Arc<DropOldestQueue<AudioFrame>> {
        Arc::clone(&self.shared.frames)
    }

    /// Begin capture: bind the preferred device and start the supervisor.
    ///
    /// An initial bind failure is not fatal; the supervisor keeps retrying
    /// with backoff until `stop()`.
    pub fn start(&self) -> Result<()> {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Ok(()); // Already started
        }

        if let Err(e) = bind_preferred(&self.shared) {
            warn!("Initial audio bind failed ({e}); will keep retrying");
        }

        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(async move { supervise(shared).await });
        let mut supervisor = self
            .supervisor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *supervisor = Some(handle);
        Ok(())
    }

    /// Release the device and terminate the frame stream.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self
            .supervisor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            handle.abort();
        }
        unbind(&self.shared);
        self.shared.frames.close();
    }

    /// Frames discarded because the consumer fell behind.
    pub fn overflow_count(&self) -> u64 {
        self.shared.frames.dropped_count()
    }
}

/// Supervisor loop: health checks and re-binds at the configured interval.
async fn supervise(shared: Arc<CaptureShared>) {
    let interval = Duration::from_secs_f64(shared.settings.device_check_interval);
    let mut backoff = defaults::BIND_RETRY_INITIAL;

    while shared.running.load(Ordering::SeqCst) {
        tokio::time::sleep(interval).await;
        if !shared.running.load(Ordering::SeqCst) {
            break;
        }

        let reason = rebind_reason(&shared);
        let Some(reason) = reason else {
            backoff = defaults::BIND_RETRY_INITIAL;
            continue;
        };

        info!("Audio re-bind ({reason})");
        let bind_shared = Arc::clone(&shared);
        let result = tokio::task::spawn_blocking(move || bind_preferred(&bind_shared)).await;
        match result {
            Ok(Ok(())) => {
                backoff = defaults::BIND_RETRY_INITIAL;
            }
            Ok(Err(e)) => {
                warn!("Audio re-bind failed: {e}; retrying in {backoff:?}");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(defaults::BIND_RETRY_MAX);
            }
            Err(e) => {
                warn!("Audio re-bind task failed: {e}");
            }
        }
    }
}

/// Decide whether the stream needs a re-bind, and why.
fn rebind_reason(shared: &CaptureShared) -> Option<&'static str> {
    if shared.stream_error.swap(false, Ordering::SeqCst) {
        return Some("stream reported an error");
    }

    let (has_stream, bound_index, bound_age) = {
        let bind = shared
            .bind
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        (
            bind.stream.is_some(),
            bind.bound_index,
            bind.bound_at.elapsed(),
        )
    };

    if !has_stream {
        return Some("no stream bound");
    }

    // A fresh bind gets a grace period before silence counts against it.
    if bound_age > defaults::BIND_GRACE_PERIOD
        && shared.last_frame_age() > defaults::DEAD_STREAM_TIMEOUT
    {
        return Some("no frames within the dead-stream timeout");
    }

    // Follow the system default only when no device is pinned.
    if shared.settings.device_index.is_none() && shared.settings.device_name.is_none() {
        let current_default = device::default_input_index();
        if current_default.is_some() && current_default != bound_index {
            return Some("default input device changed");
        }
    }

    None
}

/// Tear down the current stream and bind the preferred device, falling back
/// across the enumeration in order. Holds the bind mutex throughout so the
/// supervisor and shutdown never race.
fn bind_preferred(shared: &Arc<CaptureShared>) -> Result<()> {
    let mut bind = shared
        .bind
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());

    if let Some(old) = bind.stream.take() {
        let _ = old.0.pause();
        drop(old);
    }

    let mut candidates: Vec<Option<usize>> = Vec::new();
    let push_candidate = |candidate: Option<usize>, candidates: &mut Vec<Option<usize>>| {
        if !candidates.contains(&candidate) {
            candidates.push(candidate);
        }
    };

    push_candidate(device::resolve_preferred_index(&shared.settings), &mut candidates);
    if let Ok(devices) = device::list_devices() {
        for info in devices {
            push_candidate(Some(info.index), &mut candidates);
        }
    }
    push_candidate(None, &mut candidates);

    let mut last_error: Option<TranskriboError> = None;
    for candidate in candidates {
        let opened = match candidate {
            Some(index) => device::device_at(index),
            None => device::default_device(),
        };
        let (cpal_device, name) = match opened {
            Ok(pair) => pair,
            Err(e) => {
                last_error = Some(e);
                continue;
            }
        };

        // New capture session: frame indices restart from zero. Reset before
        // the stream starts so frames emitted during bind verification are
        // already in the new session.
        shared.frame_index.store(0, Ordering::SeqCst);

        match open_stream(shared, &cpal_device) {
            Ok(stream) => {
                info!(
                    "Audio stream bound to '{}' ({})",
                    name,
                    candidate.map_or("system default".to_string(), |i| format!("index {i}")),
                );
                shared.mark_frame();
                bind.stream = Some(SendableStream(stream));
                bind.bound_index = candidate.or_else(device::default_input_index);
                bind.bound_name = name;
                bind.bound_at = Instant::now();
                return Ok(());
            }
            Err(e) => {
                debug!("Bind attempt on '{name}' failed: {e}");
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| TranskriboError::AudioCapture {
        message: "no input devices available".to_string(),
    }))
}

fn unbind(shared: &CaptureShared) {
    let mut bind = shared
        .bind
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(stream) = bind.stream.take() {
        let _ = stream.0.pause();
    }
    bind.bound_index = None;
}

/// Build and start an input stream on the device.
///
/// Tries in order:
/// 1. i16 mono at the configured device rate
/// 2. f32 mono at the configured device rate
/// 3. The device's native default config, converting in software
///
/// Some PipeWire-ALSA setups accept non-native configs but never fire the
/// data callback, so each started stream is verified to deliver data before
/// it is accepted.
fn open_stream(shared: &Arc<CaptureShared>, cpal_device: &cpal::Device) -> Result<cpal::Stream> {
    let device_rate = shared.settings.device_sample_rate;
    let preferred = cpal::StreamConfig {
        channels: 1,
        sample_rate: cpal::SampleRate(device_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    // i16 mono — works with PipeWire/PulseAudio which convert transparently
    {
        let counter = Arc::new(AtomicU64::new(0));
        let mut assembler = FrameAssembler::new(shared, 1, device_rate, Arc::clone(&counter));
        if let Ok(stream) = cpal_device.build_input_stream(
            &preferred,
            move |data: &[i16], _: &cpal::InputCallbackInfo| assembler.ingest_i16(data),
            error_callback(shared),
            None,
        ) && stream.play().is_ok()
            && delivers_data(&counter)
        {
            return Ok(stream);
        }
    }

    // f32 mono — for devices that only expose float formats
    {
        let counter = Arc::new(AtomicU64::new(0));
        let mut assembler = FrameAssembler::new(shared, 1, device_rate, Arc::clone(&counter));
        if let Ok(stream) = cpal_device.build_input_stream(
            &preferred,
            move |data: &[f32], _: &cpal::InputCallbackInfo| assembler.ingest_f32(data),
            error_callback(shared),
            None,
        ) && stream.play().is_ok()
            && delivers_data(&counter)
        {
            return Ok(stream);
        }
    }

    open_stream_native(shared, cpal_device)
}

/// Build a stream using the device's native config, with software channel
/// mixing and resampling.
fn open_stream_native(shared: &Arc<CaptureShared>, cpal_device: &cpal::Device) -> Result<cpal::Stream> {
    use cpal::SampleFormat;

    let default_config =
        cpal_device
            .default_input_config()
            .map_err(|e| TranskriboError::AudioCapture {
                message: format!("Failed to query default input config: {e}"),
            })?;

    let native_rate = default_config.sample_rate().0;
    let native_channels = default_config.channels() as usize;
    let stream_config: cpal::StreamConfig = default_config.clone().into();

    debug!(
        "Using native audio format ({}ch/{}Hz/{:?}), converting in software",
        native_channels,
        native_rate,
        default_config.sample_format(),
    );

    let counter = Arc::new(AtomicU64::new(0));
    let stream = match default_config.sample_format() {
        SampleFormat::I16 => {
            let mut assembler =
                FrameAssembler::new(shared, native_channels, native_rate, Arc::clone(&counter));
            cpal_device.build_input_stream(
                &stream_config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| assembler.ingest_i16(data),
                error_callback(shared),
                None,
            )
        }
        SampleFormat::F32 => {
            let mut assembler =
                FrameAssembler::new(shared, native_channels, native_rate, Arc::clone(&counter));
            cpal_device.build_input_stream(
                &stream_config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| assembler.ingest_f32(data),
                error_callback(shared),
                None,
            )
        }
        fmt => {
            return Err(TranskriboError::AudioCapture {
                message: format!(
                    "Unsupported native sample format: {fmt:?}. \
                     Try pinning a device with AUDIO_DEVICE_INDEX."
                ),
            });
        }
    }
    .map_err(|e| TranskriboError::AudioCapture {
        message: format!("Failed to build native input stream: {e}"),
    })?;

    stream.play().map_err(|e| TranskriboError::AudioCapture {
        message: format!("Failed to start audio stream: {e}"),
    })?;
    Ok(stream)
}

fn error_callback(shared: &Arc<CaptureShared>) -> impl FnMut(cpal::StreamError) + Send + 'static {
    let error_flag = Arc::clone(&shared.stream_error);
    move |err| {
        warn!("Audio stream error: {err}");
        error_flag.store(true, Ordering::SeqCst);
    }
}

/// Wait briefly and check whether the callback actually fired.
fn delivers_data(counter: &AtomicU64) -> bool {
    std::thread::sleep(Duration::from_millis(200));
    counter.load(Ordering::Relaxed) > 0
}

/// Converts callback buffers into fixed-duration pipeline frames: downmix to
/// mono, linear resample to the pipeline rate, slice into frames, and feed
/// the level monitor.
struct FrameAssembler {
    shared: Arc<CaptureShared>,
    channels: usize,
    source_rate: u32,
    target_rate: u32,
    frame_samples: usize,
    acc: Vec<i16>,
    monitor: LevelMonitor,
    callbacks: Arc<AtomicU64>,
}

impl FrameAssembler {
    fn new(
        shared: &Arc<CaptureShared>,
        channels: usize,
        source_rate: u32,
        callbacks: Arc<AtomicU64>,
    ) -> Self {
        let settings = &shared.settings;
        Self {
            shared: Arc::clone(shared),
            channels: channels.max(1),
            source_rate,
            target_rate: settings.sample_rate,
            frame_samples: settings.frame_samples(),
            acc: Vec::new(),
            monitor: LevelMonitor::new(settings.level.clone()),
            callbacks,
        }
    }

    fn ingest_i16(&mut self, data: &[i16]) {
        self.callbacks.fetch_add(1, Ordering::Relaxed);
        let mono = downmix_to_mono(data, self.channels);
        let resampled = resample(&mono, self.source_rate, self.target_rate);
        self.acc.extend_from_slice(&resampled);
        self.drain_frames();
    }

    fn ingest_f32(&mut self, data: &[f32]) {
        let as_i16: Vec<i16> = data
            .iter()
            .map(|&s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
            .collect();
        self.ingest_i16(&as_i16);
    }

    fn drain_frames(&mut self) {
        while self.acc.len() >= self.frame_samples {
            let samples: Vec<i16> = self.acc.drain(..self.frame_samples).collect();
            let duration = self.frame_samples as f64 / self.target_rate as f64;
            self.monitor.observe(&samples, duration);

            let index = self.shared.frame_index.fetch_add(1, Ordering::SeqCst);
            let frame = AudioFrame::new(samples, self.target_rate, index);
            self.shared.mark_frame();
            self.shared.frames.push(frame);
        }
    }
}

/// Mix multi-channel audio to mono by averaging channels.
fn downmix_to_mono(samples: &[i16], channels: usize) -> Vec<i16> {
    if channels <= 1 {
        return samples.to_vec();
    }
    samples
        .chunks_exact(channels)
        .map(|frame| {
            let sum: i32 = frame.iter().map(|&s| s as i32).sum();
            (sum / channels as i32) as i16
        })
        .collect()
}

/// Simple linear interpolation resampling.
fn resample(samples: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = from_rate as f64 / to_rate as f64;
    let output_len = (samples.len() as f64 / ratio).ceil() as usize;

    (0..output_len)
        .map(|i| {
            let source_pos = i as f64 * ratio;
            let source_idx = source_pos.floor() as usize;
            let fraction = source_pos - source_idx as f64;

            if source_idx + 1 >= samples.len() {
                samples[samples.len() - 1]
            } else {
                let left = samples[source_idx] as f64;
                let right = samples[source_idx + 1] as f64;
                (left + (right - left) * fraction) as i16
            }
        })
        .collect()
}

/// Tracks RMS/peak levels and warns on sustained silence or clipping.
struct LevelMonitor {
    settings: LevelMonitorSettings,
    silence_accumulated: f64,
    clip_accumulated: f64,
    last_silence_warning: Option<Instant>,
    last_clip_warning: Option<Instant>,
}

impl LevelMonitor {
    fn new(settings: LevelMonitorSettings) -> Self {
        Self {
            settings,
            silence_accumulated: 0.0,
            clip_accumulated: 0.0,
            last_silence_warning: None,
            last_clip_warning: None,
        }
    }

    fn observe(&mut self, samples: &[i16], duration_seconds: f64) {
        if !self.settings.enabled || samples.is_empty() {
            return;
        }

        let rms_db = rms_dbfs(samples);
        if rms_db <= self.settings.silence_threshold_dbfs {
            self.silence_accumulated += duration_seconds;
            if self.silence_accumulated >= self.settings.silence_duration_seconds
                && cooldown_elapsed(self.last_silence_warning)
            {
                warn!(
                    "Input audio below {:.1} dBFS for {:.1}s; verify loopback routing or gain",
                    self.settings.silence_threshold_dbfs, self.silence_accumulated,
                );
                self.last_silence_warning = Some(Instant::now());
                self.silence_accumulated = 0.0;
            }
        } else {
            self.silence_accumulated = 0.0;
        }

        let peak_db = peak_dbfs(samples);
        if peak_db >= self.settings.clip_threshold_dbfs {
            self.clip_accumulated += duration_seconds;
            if self.clip_accumulated >= self.settings.clip_hold_seconds
                && cooldown_elapsed(self.last_clip_warning)
            {
                warn!(
                    "Input audio peaking at {:.1} dBFS for {:.1}s; attenuate the source",
                    peak_db, self.clip_accumulated,
                );
                self.last_clip_warning = Some(Instant::now());
                self.clip_accumulated = 0.0;
            }
        } else {
            self.clip_accumulated = 0.0;
        }
    }
}

fn cooldown_elapsed(last: Option<Instant>) -> bool {
    last.is_none_or(|t| t.elapsed() >= defaults::LEVEL_WARNING_COOLDOWN)
}

fn rms_dbfs(samples: &[i16]) -> f64 {
    let sum_squares: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    let rms = (sum_squares / samples.len() as f64).sqrt();
    if rms <= 0.0 {
        f64::NEG_INFINITY
    } else {
        20.0 * (rms / i16::MAX as f64).log10()
    }
}

fn peak_dbfs(samples: &[i16]) -> f64 {
    let peak = samples.iter().map(|&s| (s as i32).abs()).max().unwrap_or(0);
    if peak <= 0 {
        f64::NEG_INFINITY
    } else {
        20.0 * (peak as f64 / i16::MAX as f64).log10()
    }
}
