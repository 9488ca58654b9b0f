//! PulseAudio backend
//!
//! Each device runs on its own OS thread using PulseAudio's simple API. The
//! microphone thread reads float32 blocks and hands them to tokio without
//! ever blocking on the consumer. The output thread renders the scheduled
//! timeline in short blocks and owns the output clock: time advances by
//! exactly the number of frames written to the device.

use super::decoder::AudioBuffer;
use super::device::{
    AudioBackend, DeviceError, InputRequest, MicrophoneStream, MicrophoneTrack, OutputContext,
    VoiceId,
};
use crate::pcm;
use libpulse_binding::callbacks::ListResult;
use libpulse_binding::context::{Context, FlagSet as ContextFlagSet, State as ContextState};
use libpulse_binding::def::{BufferAttr, Retval};
use libpulse_binding::error::PAErr;
use libpulse_binding::mainloop::standard::{IterateResult, Mainloop};
use libpulse_binding::proplist::{properties, Proplist};
use libpulse_binding::sample::{Format, Spec};
use libpulse_binding::stream::Direction;
use libpulse_simple_binding::Simple;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, info, warn};

/// Captured blocks buffered between the device thread and the session.
const CAPTURE_QUEUE_BLOCKS: usize = 8;

/// Output render granularity (20 ms blocks).
const RENDER_BLOCKS_PER_SECOND: u32 = 50;

/// Server-side playback buffer target, in milliseconds.
const PLAYBACK_TARGET_MS: u32 = 100;

const F32_BYTES: usize = 4;

/// Represents an audio source known to the PulseAudio server
#[derive(Debug, Clone)]
pub struct AudioDevice {
    /// Device name (PulseAudio source name)
    pub name: String,
    /// Human-readable description
    pub description: String,
    pub sample_rate: u32,
    pub channels: u8,
    /// Is this device a monitor (system playback) or a microphone
    pub is_monitor: bool,
}

/// Audio device type for filtering
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    Microphone,
    Monitor,
    Any,
}

/// PulseAudio-backed device factory.
#[derive(Debug, Clone)]
pub struct PulseBackend {
    app_name: String,
}

impl PulseBackend {
    pub fn new(app_name: &str) -> Self {
        Self {
            app_name: app_name.to_string(),
        }
    }
}

impl AudioBackend for PulseBackend {
    fn open_microphone(&self, request: &InputRequest) -> Result<MicrophoneStream, DeviceError> {
        let spec = Spec {
            format: Format::F32le,
            channels: 1,
            rate: request.sample_rate,
        };
        let block_bytes = (request.block_size * F32_BYTES) as u32;
        let attr = BufferAttr {
            maxlength: block_bytes * 4,
            tlength: u32::MAX,
            prebuf: u32::MAX,
            minreq: u32::MAX,
            fragsize: block_bytes,
        };

        let (tx, rx) = mpsc::channel::<Vec<f32>>(CAPTURE_QUEUE_BLOCKS);
        let armed = Arc::new(AtomicBool::new(false));
        let shutdown = Arc::new(AtomicBool::new(false));

        let app_name = self.app_name.clone();
        let device = request.device.clone();
        let block_size = request.block_size;
        let thread_armed = armed.clone();
        let thread_shutdown = shutdown.clone();

        info!(
            "🎤 Opening microphone {} at {} Hz",
            device.as_deref().unwrap_or("(default)"),
            spec.rate
        );

        spawn_device_thread(
            "orbit-capture",
            move || {
                Simple::new(
                    None,
                    &app_name,
                    Direction::Record,
                    device.as_deref(),
                    "microphone",
                    &spec,
                    None,
                    Some(&attr),
                )
            },
            move |simple| run_capture(simple, block_size, tx, thread_armed, thread_shutdown),
            DeviceError::Input,
        )?;

        Ok(MicrophoneStream::new(
            rx,
            Box::new(PulseMicrophone { armed, shutdown }),
        ))
    }

    fn open_output(
        &self,
        sample_rate: u32,
        channel_count: u16,
    ) -> Result<Box<dyn OutputContext>, DeviceError> {
        let channels = u8::try_from(channel_count).map_err(|_| {
            DeviceError::Output(format!("unsupported channel count {}", channel_count))
        })?;
        let spec = Spec {
            format: Format::S16le,
            channels,
            rate: sample_rate,
        };
        let target_bytes =
            sample_rate * u32::from(channel_count) * 2 * PLAYBACK_TARGET_MS / 1000;
        let attr = BufferAttr {
            maxlength: u32::MAX,
            tlength: target_bytes,
            prebuf: u32::MAX,
            minreq: u32::MAX,
            fragsize: u32::MAX,
        };

        let shared = Arc::new(OutputShared {
            voices: Mutex::new(Vec::new()),
            frames_written: AtomicU64::new(0),
            gain: AtomicU32::new(1.0f32.to_bits()),
            running: AtomicBool::new(true),
        });
        let (finished_tx, finished_rx) = std_mpsc::channel();

        let app_name = self.app_name.clone();
        let thread_shared = shared.clone();

        info!("🔈 Opening audio output at {} Hz", sample_rate);

        spawn_device_thread(
            "orbit-playback",
            move || {
                Simple::new(
                    None,
                    &app_name,
                    Direction::Playback,
                    None,
                    "assistant",
                    &spec,
                    None,
                    Some(&attr),
                )
            },
            move |simple| run_output(simple, thread_shared, finished_tx, sample_rate, channel_count),
            DeviceError::Output,
        )?;

        Ok(Box::new(PulseOutput {
            shared,
            finished_rx,
            sample_rate,
        }))
    }
}

/// Open a PulseAudio stream on a dedicated thread and report the result.
fn spawn_device_thread<O, R>(
    name: &str,
    open: O,
    run: R,
    open_error: fn(String) -> DeviceError,
) -> Result<(), DeviceError>
where
    O: FnOnce() -> Result<Simple, PAErr> + Send + 'static,
    R: FnOnce(Simple) + Send + 'static,
{
    let (ready_tx, ready_rx) = std_mpsc::sync_channel::<Result<(), String>>(1);

    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || match open() {
            Ok(simple) => {
                let _ = ready_tx.send(Ok(()));
                run(simple);
            }
            Err(e) => {
                let _ = ready_tx.send(Err(format!("{e}")));
            }
        })
        .map_err(|e| DeviceError::Worker(e.to_string()))?;

    match ready_rx.recv() {
        Ok(Ok(())) => Ok(()),
        Ok(Err(message)) => Err(open_error(message)),
        Err(_) => Err(DeviceError::Worker(format!("{} exited during open", name))),
    }
}

struct PulseMicrophone {
    armed: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
}

impl MicrophoneTrack for PulseMicrophone {
    fn resume(&mut self) {
        self.armed.store(true, Ordering::Release);
    }

    fn stop(&mut self) {
        self.armed.store(false, Ordering::Release);
        self.shutdown.store(true, Ordering::Release);
    }
}

impl Drop for PulseMicrophone {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_capture(
    simple: Simple,
    block_size: usize,
    tx: mpsc::Sender<Vec<f32>>,
    armed: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
) {
    let mut raw = vec![0u8; block_size * F32_BYTES];
    let mut dropped: u64 = 0;

    while !shutdown.load(Ordering::Acquire) {
        if let Err(e) = simple.read(&mut raw) {
            error!("Microphone read failed: {}", e);
            break;
        }
        if !armed.load(Ordering::Acquire) {
            continue;
        }

        let block: Vec<f32> = raw
            .chunks_exact(F32_BYTES)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        match tx.try_send(block) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                dropped += 1;
                if dropped % 16 == 1 {
                    warn!("Session is not keeping up, dropped {} microphone blocks", dropped);
                }
            }
            Err(TrySendError::Closed(_)) => break,
        }
    }

    info!("🎤 Microphone capture stopped");
}

/// One buffer placed on the output timeline.
struct Voice {
    id: VoiceId,
    start_frame: u64,
    buffer: AudioBuffer,
}

struct OutputShared {
    voices: Mutex<Vec<Voice>>,
    frames_written: AtomicU64,
    gain: AtomicU32,
    running: AtomicBool,
}

impl OutputShared {
    fn voices(&self) -> MutexGuard<'_, Vec<Voice>> {
        self.voices.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct PulseOutput {
    shared: Arc<OutputShared>,
    finished_rx: std_mpsc::Receiver<VoiceId>,
    sample_rate: u32,
}

impl OutputContext for PulseOutput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn current_time(&self) -> f64 {
        self.shared.frames_written.load(Ordering::Acquire) as f64 / f64::from(self.sample_rate)
    }

    fn start(&mut self, id: VoiceId, buffer: AudioBuffer, when: f64) {
        let written = self.shared.frames_written.load(Ordering::Acquire);
        let start_frame = ((when * f64::from(self.sample_rate)).round() as u64).max(written);
        self.shared.voices().push(Voice {
            id,
            start_frame,
            buffer,
        });
    }

    fn stop(&mut self, id: VoiceId) {
        self.shared.voices().retain(|voice| voice.id != id);
    }

    fn drain_finished(&mut self) -> Vec<VoiceId> {
        self.finished_rx.try_iter().collect()
    }

    fn set_gain(&mut self, gain: f32) {
        self.shared.gain.store(gain.to_bits(), Ordering::Relaxed);
    }

    fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    fn close(&mut self) {
        if self.shared.running.swap(false, Ordering::AcqRel) {
            self.shared.voices().clear();
            debug!("Audio output closed");
        }
    }
}

impl Drop for PulseOutput {
    fn drop(&mut self) {
        self.close();
    }
}

fn run_output(
    simple: Simple,
    shared: Arc<OutputShared>,
    finished_tx: std_mpsc::Sender<VoiceId>,
    sample_rate: u32,
    channel_count: u16,
) {
    let channels = channel_count.max(1) as usize;
    let block_frames = (sample_rate / RENDER_BLOCKS_PER_SECOND).max(1) as usize;
    let mut block = vec![0.0f32; block_frames * channels];

    while shared.running.load(Ordering::Acquire) {
        let position = shared.frames_written.load(Ordering::Acquire);
        let finished = render_block(&mut shared.voices(), position, &mut block, channels);
        for id in finished {
            let _ = finished_tx.send(id);
        }

        let gain = f32::from_bits(shared.gain.load(Ordering::Relaxed));
        if gain != 1.0 {
            block.iter_mut().for_each(|sample| *sample *= gain);
        }

        if let Err(e) = simple.write(&pcm::float_to_pcm16(&block)) {
            error!("Audio output write failed: {}", e);
            shared.running.store(false, Ordering::Release);
            break;
        }
        shared
            .frames_written
            .fetch_add(block_frames as u64, Ordering::AcqRel);
    }

    info!("🔈 Audio output stopped");
}

/// Render the timeline window starting at `position` into `out`.
///
/// `out` is interleaved with `channels` channels and is overwritten. Voices
/// that end inside the window are removed and their ids returned.
fn render_block(
    voices: &mut Vec<Voice>,
    position: u64,
    out: &mut [f32],
    channels: usize,
) -> Vec<VoiceId> {
    out.fill(0.0);
    let frames = (out.len() / channels) as u64;
    let end = position + frames;

    for voice in voices.iter() {
        let voice_end = voice.start_frame + voice.buffer.len() as u64;
        if voice_end <= position || voice.start_frame >= end {
            continue;
        }
        let source_channels = voice.buffer.channel_count().max(1) as usize;
        for frame in voice.start_frame.max(position)..voice_end.min(end) {
            let src = (frame - voice.start_frame) as usize;
            let dst = (frame - position) as usize * channels;
            for channel in 0..channels {
                let source = voice.buffer.channel(channel.min(source_channels - 1));
                out[dst + channel] += source.get(src).copied().unwrap_or(0.0);
            }
        }
    }

    let mut finished = Vec::new();
    voices.retain(|voice| {
        let done = voice.start_frame + voice.buffer.len() as u64 <= end;
        if done {
            finished.push(voice.id);
        }
        !done
    });
    finished
}

/// List the sources known to the PulseAudio server
pub fn list_devices(device_type: DeviceType) -> Result<Vec<AudioDevice>, DeviceError> {
    let server_error = |message: &str| DeviceError::Input(message.to_string());
    let devices = Arc::new(Mutex::new(Vec::new()));
    let devices_clone = devices.clone();

    let mut proplist = Proplist::new().ok_or_else(|| server_error("failed to create proplist"))?;
    proplist
        .set_str(properties::APPLICATION_NAME, "orbit-device-lister")
        .map_err(|()| server_error("failed to set application name"))?;

    let mut mainloop = Mainloop::new().ok_or_else(|| server_error("failed to create mainloop"))?;
    let mut context = Context::new_with_proplist(&mainloop, "orbit-context", &proplist)
        .ok_or_else(|| server_error("failed to create context"))?;

    context
        .connect(None, ContextFlagSet::NOFLAGS, None)
        .map_err(|e| DeviceError::Input(format!("{e}")))?;

    loop {
        match mainloop.iterate(false) {
            IterateResult::Quit(_) | IterateResult::Err(_) => {
                return Err(server_error("mainloop iterate failed"));
            }
            IterateResult::Success(_) => {}
        }
        match context.get_state() {
            ContextState::Ready => break,
            ContextState::Failed | ContextState::Terminated => {
                return Err(server_error("connection to PulseAudio failed"));
            }
            _ => {}
        }
    }

    let done = Arc::new(AtomicBool::new(false));
    let done_clone = done.clone();

    let introspector = context.introspect();
    let _op = introspector.get_source_info_list(move |result| match result {
        ListResult::Item(source) => {
            let is_monitor = source.monitor_of_sink.is_some()
                || source
                    .name
                    .as_ref()
                    .is_some_and(|name| name.contains("monitor"));

            let include = match device_type {
                DeviceType::Microphone => !is_monitor,
                DeviceType::Monitor => is_monitor,
                DeviceType::Any => true,
            };

            if let (true, Some(name), Some(description)) =
                (include, source.name.as_ref(), source.description.as_ref())
            {
                devices_clone
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(AudioDevice {
                        name: name.to_string(),
                        description: description.to_string(),
                        sample_rate: source.sample_spec.rate,
                        channels: source.sample_spec.channels,
                        is_monitor,
                    });
            }
        }
        ListResult::End => done_clone.store(true, Ordering::Release),
        ListResult::Error => {
            error!("Error listing audio devices");
            done_clone.store(true, Ordering::Release);
        }
    });

    while !done.load(Ordering::Acquire) {
        match mainloop.iterate(false) {
            IterateResult::Quit(_) | IterateResult::Err(_) => {
                return Err(server_error("mainloop iterate failed"));
            }
            IterateResult::Success(_) => {}
        }
    }

    context.disconnect();
    mainloop.quit(Retval(0));

    let devices = devices
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    Ok(devices)
}
