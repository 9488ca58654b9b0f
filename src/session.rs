//! Session lifecycle
//!
//! A [`Session`] owns every live resource: the Live API channel, the
//! microphone, the speakers and the per-turn state. It is driven by a single
//! task ([`spawn`]) that selects over UI commands, inbound server messages and
//! captured microphone blocks, so no state here is shared or locked.
//!
//! State machine: `Idle -> Connecting -> Active -> Idle`, with `Error` on any
//! failure (always followed by `Idle`).

use crate::audio::{self, AudioBackend, DeviceError, PlaybackScheduler};
use crate::capture::{self, CapturePipeline};
use crate::config::AssistantConfig;
use crate::credentials::CredentialChain;
use crate::demux::{self, Signal, Turn};
use crate::events::{self, EventSink, EventStream, SessionEvent, SessionState};
use crate::gemini::{BidiGenerateContentSetup, ServerMessage, TransportError};
use crate::gemini_client::{Connector, LiveChannel};
use crate::pcm;
use crate::recorder::SessionRecorder;
use crate::transcript::{InProgressTranscript, TranscriptAssembler};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;
pub const OUTPUT_CHANNELS: u16 = 1;

/// Transport errors containing this are an expected race while closing.
const CLOSE_RACE_SIGNATURE: &str = "CLOSING or CLOSED";

/// Errors that end a session. The message is what the user sees.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("API key is required. Please add your API key in Settings.")]
    MissingCredential,

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("Connection failed: {0}")]
    Transport(#[from] TransportError),
}

/// Resources that exist only while a session is live.
struct LiveResources {
    channel: LiveChannel,
    capture: CapturePipeline,
    playback: PlaybackScheduler,
    recorder: Option<SessionRecorder>,
}

impl LiveResources {
    /// Every step runs regardless of the others.
    fn release(mut self) {
        self.capture.teardown();
        self.playback.shutdown();
        self.playback.close_output();
        if let Err(e) = self.channel.close() {
            debug!("Channel already closed: {}", e);
        }
        if let Some(recorder) = self.recorder.take() {
            recorder.finish();
        }
    }
}

/// Something the session must react to while live.
#[derive(Debug)]
pub enum Activity {
    /// From the server; `None` when the connection is gone.
    Inbound(Option<Result<ServerMessage, TransportError>>),
    /// From the microphone; `None` when the device stopped.
    Captured(Option<Vec<f32>>),
}

pub struct Session {
    config: AssistantConfig,
    credentials: CredentialChain,
    connector: Arc<dyn Connector>,
    audio: Arc<dyn AudioBackend>,
    state: SessionState,
    events: Option<EventSink>,
    live: Option<LiveResources>,
    turn: Turn,
    transcripts: TranscriptAssembler,
}

impl Session {
    pub fn new(
        config: AssistantConfig,
        credentials: CredentialChain,
        connector: Arc<dyn Connector>,
        audio: Arc<dyn AudioBackend>,
    ) -> Self {
        Self {
            config,
            credentials,
            connector,
            audio,
            state: SessionState::Idle,
            events: None,
            live: None,
            turn: Turn::new(),
            transcripts: TranscriptAssembler::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_live(&self) -> bool {
        self.live.is_some()
    }

    /// Open a session and report through `events`.
    ///
    /// Ignored with a warning if a session is already pending or active.
    pub async fn start(&mut self, events: EventSink) {
        if !self.begin_start(events) {
            return;
        }
        let opened = self.open().await;
        self.finish_start(opened);
    }

    /// Enter Connecting. Returns `false` if the start is ignored.
    fn begin_start(&mut self, events: EventSink) -> bool {
        if self.live.is_some() || self.state.is_live() {
            warn!("⚠️ Session is already starting or active, ignoring start");
            return false;
        }

        self.events = Some(events);
        self.turn.reset();
        self.transition(SessionState::Connecting);
        true
    }

    fn finish_start(&mut self, opened: Result<LiveResources, SessionError>) {
        match opened {
            Ok(live) => {
                self.live = Some(live);
                self.transition(SessionState::Active);
                if let Some(live) = self.live.as_mut() {
                    live.capture.connect();
                }
                info!("🎙️ Session active");
            }
            Err(e) => {
                error!("Failed to start session: {}", e);
                self.fail(e.to_string());
            }
        }
    }

    /// Acquire everything in order: credential, microphone, speakers, channel.
    ///
    /// Anything acquired before a failure is released when dropped.
    async fn open(&mut self) -> Result<LiveResources, SessionError> {
        let api_key = self
            .credentials
            .resolve()
            .await
            .ok_or(SessionError::MissingCredential)?;

        let capture = CapturePipeline::open(self.audio.as_ref(), self.config.input_device.clone())?;

        let output = self.audio.open_output(OUTPUT_SAMPLE_RATE, OUTPUT_CHANNELS)?;
        let mut playback = PlaybackScheduler::new(output);
        playback.set_gain(self.config.output_gain());

        let setup = BidiGenerateContentSetup::from_config(&self.config);
        let channel = self.connector.connect(&api_key, setup).await?;

        let recorder = self
            .config
            .record_dir
            .as_deref()
            .and_then(|dir| SessionRecorder::create(dir, OUTPUT_SAMPLE_RATE));

        Ok(LiveResources {
            channel,
            capture,
            playback,
            recorder,
        })
    }

    /// Release everything and return to Idle. Safe to call at any time.
    pub fn stop(&mut self) {
        // Detach the consumer first so nothing in flight reaches it.
        let sink = self.events.take();
        let live = self.live.take();
        if sink.is_none() && live.is_none() {
            debug!("No session to stop");
            return;
        }

        if let Some(live) = live {
            live.release();
        }
        self.turn.reset();

        let entries = self.transcripts.flush();
        if let Some(sink) = &sink {
            if !entries.is_empty() {
                for entry in entries {
                    let _ = sink.send(SessionEvent::TranscriptFinalized(entry));
                }
                let _ = sink.send(SessionEvent::InProgress(InProgressTranscript::default()));
            }
            if self.state != SessionState::Idle {
                let _ = sink.send(SessionEvent::StateChanged(SessionState::Idle));
            }
        }
        self.state = SessionState::Idle;
        info!("👋 Session stopped");
    }

    /// Wait for the next thing to handle. Never resolves while not live.
    pub async fn next_activity(&mut self) -> Activity {
        let Some(live) = self.live.as_mut() else {
            return std::future::pending().await;
        };
        let LiveResources {
            channel, capture, ..
        } = live;

        tokio::select! {
            message = channel.recv() => Activity::Inbound(message),
            block = capture.next_block() => Activity::Captured(block),
        }
    }

    pub fn handle(&mut self, activity: Activity) {
        match activity {
            Activity::Inbound(Some(Ok(message))) => self.handle_server_message(message),
            Activity::Inbound(Some(Err(e))) => self.handle_transport_error(e),
            Activity::Inbound(None) => {
                info!("🔌 Connection closed");
                self.stop();
            }
            Activity::Captured(Some(block)) => self.forward_block(&block),
            Activity::Captured(None) => {
                let e = SessionError::Device(DeviceError::Input("microphone stopped".to_string()));
                error!("{}", e);
                self.fail(e.to_string());
            }
        }
    }

    pub fn handle_server_message(&mut self, message: ServerMessage) {
        if self.live.is_none() {
            debug!("Ignoring server message, no live session");
            return;
        }

        if message.setup_complete.is_some() {
            debug!("Duplicate setupComplete");
        }
        if let Some(go_away) = &message.go_away {
            warn!(
                "⏳ Server will close the connection in {}",
                go_away.time_left.as_deref().unwrap_or("an unknown time")
            );
        }
        if let Some(call) = &message.tool_call {
            warn!("Ignoring function call, none are declared: {}", call);
        }
        if message.tool_call_cancellation.is_some() {
            debug!("Ignoring tool call cancellation");
        }
        if message.session_resumption_update.is_some() {
            debug!("Session resumption update received");
        }

        if let Some(content) = message.server_content {
            for event in demux::classify(content) {
                for signal in self.turn.apply(event) {
                    self.dispatch(signal);
                }
            }
        }
    }

    fn handle_transport_error(&mut self, e: TransportError) {
        match e {
            TransportError::ConnectionClosed => {
                info!("🔌 Connection closed by server");
                self.stop();
            }
            e if e.to_string().contains(CLOSE_RACE_SIGNATURE) => {
                debug!("Ignoring close race: {}", e);
            }
            e => {
                error!("Transport error: {}", e);
                self.fail(SessionError::Transport(e).to_string());
            }
        }
    }

    fn dispatch(&mut self, signal: Signal) {
        match signal {
            Signal::Transcription(update) => {
                let entries = self.transcripts.on_update(&update);
                self.emit(SessionEvent::Transcription(update));
                for entry in entries {
                    self.emit(SessionEvent::TranscriptFinalized(entry));
                }
                self.emit(SessionEvent::InProgress(self.transcripts.in_progress()));
            }
            Signal::ToolCall(update) => {
                info!("🛠️ Tool call: {}", update.tool_name.as_str());
                self.emit(SessionEvent::ToolCall(update));
            }
            Signal::PlayAudio(bytes) => self.play(&bytes),
            Signal::Interrupt => {
                if let Some(live) = self.live.as_mut() {
                    live.playback.interrupt();
                }
            }
            Signal::TurnComplete => {
                debug!("Turn complete");
                if let Some(entry) = self.transcripts.finish_turn() {
                    self.emit(SessionEvent::TranscriptFinalized(entry));
                    self.emit(SessionEvent::InProgress(self.transcripts.in_progress()));
                }
            }
        }
    }

    fn play(&mut self, bytes: &[u8]) {
        let Some(live) = self.live.as_mut() else {
            return;
        };
        if !live.playback.is_output_running() {
            let e = SessionError::Device(DeviceError::Output("device stopped".to_string()));
            error!("{}", e);
            self.fail(e.to_string());
            return;
        }
        let buffer = audio::decode(bytes, OUTPUT_SAMPLE_RATE, OUTPUT_CHANNELS);
        if let Some(recorder) = live.recorder.as_mut() {
            recorder.write_assistant(&buffer);
        }
        live.playback.schedule(buffer);
    }

    fn forward_block(&mut self, block: &[f32]) {
        let Some(live) = self.live.as_mut() else {
            return;
        };
        let pcm_bytes = pcm::float_to_pcm16(block);
        if let Some(recorder) = live.recorder.as_mut() {
            recorder.write_mic(&pcm_bytes);
        }
        capture::forward(&live.channel, &pcm_bytes);
    }

    fn fail(&mut self, message: String) {
        self.transition(SessionState::Error);
        self.emit(SessionEvent::Error(message));
        self.stop();
    }

    fn transition(&mut self, state: SessionState) {
        if self.state == state {
            return;
        }
        self.state = state;
        if !state.is_live() {
            let entries = self.transcripts.flush();
            if !entries.is_empty() {
                for entry in entries {
                    self.emit(SessionEvent::TranscriptFinalized(entry));
                }
                self.emit(SessionEvent::InProgress(InProgressTranscript::default()));
            }
        }
        self.emit(SessionEvent::StateChanged(state));
    }

    fn emit(&self, event: SessionEvent) {
        if let Some(sink) = &self.events {
            if sink.send(event).is_err() {
                debug!("Event consumer went away");
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Requests from the UI to the session driver.
#[derive(Debug)]
pub enum Command {
    Start(EventSink),
    Stop,
    Shutdown,
}

/// Cloneable handle to a running session driver.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl SessionHandle {
    /// Request a start; events for that session arrive on the returned stream.
    pub fn start(&self) -> EventStream {
        let (sink, stream) = events::channel();
        if self.commands.send(Command::Start(sink)).is_err() {
            warn!("Session driver is gone, start ignored");
        }
        stream
    }

    pub fn stop(&self) {
        let _ = self.commands.send(Command::Stop);
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

/// Run `session` on its own task.
pub fn spawn(session: Session) -> (SessionHandle, JoinHandle<()>) {
    let (commands, rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(drive(session, rx));
    (SessionHandle { commands }, task)
}

enum Step {
    Command(Option<Command>),
    Activity(Activity),
}

enum OpenOutcome {
    Opened(Result<LiveResources, SessionError>),
    Cancelled { exit: bool },
}

/// Acquire the session's resources while still answering commands.
///
/// A stop or shutdown drops the pending open, which releases whatever it
/// had acquired so far.
async fn open_or_cancel(
    session: &mut Session,
    commands: &mut mpsc::UnboundedReceiver<Command>,
) -> OpenOutcome {
    let open = session.open();
    tokio::pin!(open);

    loop {
        tokio::select! {
            biased;
            command = commands.recv() => match command {
                Some(Command::Start(_)) => {
                    warn!("⚠️ Session is already starting, ignoring start");
                }
                Some(Command::Stop) => return OpenOutcome::Cancelled { exit: false },
                Some(Command::Shutdown) | None => return OpenOutcome::Cancelled { exit: true },
            },
            opened = &mut open => return OpenOutcome::Opened(opened),
        }
    }
}

async fn drive(mut session: Session, mut commands: mpsc::UnboundedReceiver<Command>) {
    loop {
        let step = tokio::select! {
            biased;
            command = commands.recv() => Step::Command(command),
            activity = session.next_activity() => Step::Activity(activity),
        };

        match step {
            Step::Command(Some(Command::Start(sink))) => {
                if !session.begin_start(sink) {
                    continue;
                }
                match open_or_cancel(&mut session, &mut commands).await {
                    OpenOutcome::Opened(opened) => session.finish_start(opened),
                    OpenOutcome::Cancelled { exit } => {
                        info!("Start cancelled while connecting");
                        session.stop();
                        if exit {
                            break;
                        }
                    }
                }
            }
            Step::Command(Some(Command::Stop)) => session.stop(),
            Step::Command(Some(Command::Shutdown)) | Step::Command(None) => {
                session.stop();
                break;
            }
            Step::Activity(activity) => session.handle(activity),
        }
    }
    debug!("Session driver exited");
}
