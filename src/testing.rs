//! In-memory devices, connector and credentials for tests

use crate::audio::{
    AudioBackend, AudioBuffer, DeviceError, InputRequest, MicrophoneStream, MicrophoneTrack,
    OutputContext, VoiceId,
};
use crate::credentials::{CredentialError, CredentialSource};
use crate::gemini::{BidiGenerateContentSetup, Result, ServerMessage, TransportError};
use crate::gemini_client::{Connector, LiveChannel, Outbound};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap()
}

#[derive(Debug)]
struct OutputLog {
    now: f64,
    started: Vec<(VoiceId, f64)>,
    live: Vec<(VoiceId, f64)>,
    stopped: Vec<VoiceId>,
    finished: Vec<VoiceId>,
    gain: f32,
    running: bool,
    close_count: usize,
}

/// Output context whose clock only moves when the test says so.
pub struct FakeOutput {
    sample_rate: u32,
    log: Arc<Mutex<OutputLog>>,
}

/// Test-side view of a [`FakeOutput`].
#[derive(Clone)]
pub struct OutputProbe {
    log: Arc<Mutex<OutputLog>>,
}

impl FakeOutput {
    pub fn new(sample_rate: u32, now: f64) -> (Self, OutputProbe) {
        let log = Arc::new(Mutex::new(OutputLog {
            now,
            started: Vec::new(),
            live: Vec::new(),
            stopped: Vec::new(),
            finished: Vec::new(),
            gain: 1.0,
            running: true,
            close_count: 0,
        }));
        (
            Self {
                sample_rate,
                log: log.clone(),
            },
            OutputProbe { log },
        )
    }
}

impl OutputContext for FakeOutput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn current_time(&self) -> f64 {
        lock(&self.log).now
    }

    fn start(&mut self, id: VoiceId, buffer: AudioBuffer, when: f64) {
        let mut log = lock(&self.log);
        log.started.push((id, when));
        log.live.push((id, when + buffer.duration()));
    }

    fn stop(&mut self, id: VoiceId) {
        let mut log = lock(&self.log);
        if let Some(index) = log.live.iter().position(|(live, _)| *live == id) {
            log.live.remove(index);
            log.stopped.push(id);
        }
    }

    fn drain_finished(&mut self) -> Vec<VoiceId> {
        std::mem::take(&mut lock(&self.log).finished)
    }

    fn set_gain(&mut self, gain: f32) {
        lock(&self.log).gain = gain;
    }

    fn is_running(&self) -> bool {
        lock(&self.log).running
    }

    fn close(&mut self) {
        let mut log = lock(&self.log);
        log.running = false;
        log.close_count += 1;
    }
}

impl OutputProbe {
    /// `(id, start time)` of every buffer started, in order.
    pub fn started(&self) -> Vec<(VoiceId, f64)> {
        lock(&self.log).started.clone()
    }

    /// Ids cut before their natural end, in order.
    pub fn stopped(&self) -> Vec<VoiceId> {
        lock(&self.log).stopped.clone()
    }

    /// Move the clock; buffers ending at or before `now` finish naturally.
    pub fn advance_to(&self, now: f64) {
        let mut log = lock(&self.log);
        log.now = now;
        let (done, live): (Vec<_>, Vec<_>) = log.live.drain(..).partition(|(_, end)| *end <= now);
        log.live = live;
        log.finished.extend(done.into_iter().map(|(id, _)| id));
    }

    pub fn close_count(&self) -> usize {
        lock(&self.log).close_count
    }

    pub fn gain(&self) -> f32 {
        lock(&self.log).gain
    }

    /// Simulate the device dying underneath the session.
    pub fn fail(&self) {
        lock(&self.log).running = false;
    }
}

#[derive(Default)]
struct BackendState {
    fail_input: bool,
    fail_output: bool,
    mic_tx: Option<mpsc::Sender<Vec<f32>>>,
    mic_resumed: bool,
    mic_stops: usize,
    input_requests: Vec<InputRequest>,
    output_opens: usize,
    output: Option<OutputProbe>,
}

/// Scripted microphone plus [`FakeOutput`] speakers.
#[derive(Clone, Default)]
pub struct FakeBackend {
    state: Arc<Mutex<BackendState>>,
}

struct FakeTrack {
    state: Arc<Mutex<BackendState>>,
}

impl MicrophoneTrack for FakeTrack {
    fn resume(&mut self) {
        lock(&self.state).mic_resumed = true;
    }

    fn stop(&mut self) {
        let mut state = lock(&self.state);
        state.mic_resumed = false;
        state.mic_stops += 1;
    }
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_input(&self) {
        lock(&self.state).fail_input = true;
    }

    pub fn fail_output(&self) {
        lock(&self.state).fail_output = true;
    }

    /// Feed for the most recently opened microphone.
    pub fn mic_sender(&self) -> Option<mpsc::Sender<Vec<f32>>> {
        lock(&self.state).mic_tx.clone()
    }

    /// Simulate the device going away.
    pub fn close_mic(&self) {
        lock(&self.state).mic_tx = None;
    }

    pub fn mic_resumed(&self) -> bool {
        lock(&self.state).mic_resumed
    }

    pub fn mic_stops(&self) -> usize {
        lock(&self.state).mic_stops
    }

    pub fn input_requests(&self) -> Vec<InputRequest> {
        lock(&self.state).input_requests.clone()
    }

    pub fn output_opens(&self) -> usize {
        lock(&self.state).output_opens
    }

    pub fn output(&self) -> Option<OutputProbe> {
        lock(&self.state).output.clone()
    }
}

impl AudioBackend for FakeBackend {
    fn open_microphone(&self, request: &InputRequest) -> std::result::Result<MicrophoneStream, DeviceError> {
        let mut state = lock(&self.state);
        state.input_requests.push(request.clone());
        if state.fail_input {
            return Err(DeviceError::Input("Permission denied".to_string()));
        }
        let (tx, rx) = mpsc::channel(64);
        state.mic_tx = Some(tx);
        Ok(MicrophoneStream::new(
            rx,
            Box::new(FakeTrack {
                state: self.state.clone(),
            }),
        ))
    }

    fn open_output(
        &self,
        sample_rate: u32,
        _channel_count: u16,
    ) -> std::result::Result<Box<dyn OutputContext>, DeviceError> {
        let mut state = lock(&self.state);
        state.output_opens += 1;
        if state.fail_output {
            return Err(DeviceError::Output("No such device".to_string()));
        }
        let (output, probe) = FakeOutput::new(sample_rate, 0.0);
        state.output = Some(probe);
        Ok(Box::new(output))
    }
}

/// Server side of a [`FakeConnector`] session.
pub struct RemoteEnd {
    pub outbound: mpsc::UnboundedReceiver<Outbound>,
    pub inbound: mpsc::Sender<Result<ServerMessage>>,
}

impl RemoteEnd {
    pub async fn push(&self, message: serde_json::Value) {
        let message: ServerMessage = serde_json::from_value(message).unwrap();
        self.inbound.send(Ok(message)).await.unwrap();
    }

    pub async fn push_error(&self, error: TransportError) {
        self.inbound.send(Err(error)).await.unwrap();
    }

    /// Everything the client has queued so far.
    pub fn drain_outbound(&mut self) -> Vec<Outbound> {
        let mut items = Vec::new();
        while let Ok(item) = self.outbound.try_recv() {
            items.push(item);
        }
        items
    }
}

#[derive(Default)]
struct ConnectorState {
    reject: Option<String>,
    hang: bool,
    keys: Vec<String>,
    setups: Vec<BidiGenerateContentSetup>,
    remote: Option<RemoteEnd>,
}

/// Connector that records what it was asked and hands the test the far end.
#[derive(Clone, Default)]
pub struct FakeConnector {
    state: Arc<Mutex<ConnectorState>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reject(&self, reason: &str) {
        lock(&self.state).reject = Some(reason.to_string());
    }

    /// Never complete a connect.
    pub fn hang(&self) {
        lock(&self.state).hang = true;
    }

    pub fn keys(&self) -> Vec<String> {
        lock(&self.state).keys.clone()
    }

    pub fn setups(&self) -> Vec<BidiGenerateContentSetup> {
        lock(&self.state).setups.clone()
    }

    pub fn take_remote(&self) -> Option<RemoteEnd> {
        lock(&self.state).remote.take()
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(
        &self,
        api_key: &str,
        setup: BidiGenerateContentSetup,
    ) -> Result<LiveChannel> {
        let hang = {
            let mut state = lock(&self.state);
            state.keys.push(api_key.to_string());
            state.setups.push(setup);
            state.hang
        };
        if hang {
            return std::future::pending().await;
        }

        let mut state = lock(&self.state);
        if let Some(reason) = state.reject.clone() {
            return Err(TransportError::Rejected(reason));
        }

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::channel(64);
        state.remote = Some(RemoteEnd {
            outbound: outbound_rx,
            inbound: inbound_tx,
        });
        Ok(LiveChannel::new(outbound_tx, inbound_rx))
    }
}

/// Credential source with a fixed answer.
pub struct StaticCredentials(pub Option<String>);

#[async_trait]
impl CredentialSource for StaticCredentials {
    fn name(&self) -> &str {
        "static"
    }

    async fn lookup(&self) -> std::result::Result<Option<String>, CredentialError> {
        Ok(self.0.clone())
    }
}
