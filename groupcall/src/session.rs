//! The group call session state machine.
//!
//! A [`GroupCall`] mediates between the platform's signaling bridge and the
//! native transport engine. Its own logic runs on the tokio scheduler as a
//! single actor task; the engine's callbacks arrive on engine threads and
//! only enqueue commands for that actor, never touching session state
//! themselves. The media pipeline hangs off the session through a pull
//! adapter the engine drains on its real-time cadence.
//!
//! Lifecycle: `Idle → Connecting → Joining → Connected ⇄ Reconnecting →
//! LeavingCall → Idle`. Connected and Reconnecting alternate for as long as
//! the platform keeps colliding SSRCs or the network flaps; an explicit
//! [`stop`] or a server-side discard reaches Idle from any state.
//!
//! [`stop`]: GroupCall::stop

use crate::config::GroupCallConfig;
use crate::dispatcher::{Action, Dispatcher, Handler, SessionEvent};
use crate::participant::{Participant, ParticipantCache};
use bytes::Bytes;
use groupcall_core::{
    to_unsigned, AudioDeviceModule, ConnectionMode, EngineEvents, GroupCallError, JoinPayload,
    MediaSource, RemoteParameters, TransportEngine,
};
use groupcall_media::{AudioStream, EndOfStream, FileAudioSource, FileVideoSource, VideoStream};
use groupcall_signaling::{
    PeerId, SignalingBridge, SignalingError, SignalingUpdate, SubscriptionKey,
};
use parking_lot::{Mutex, RwLock};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Where the session currently stands in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No session; safe to `start`
    Idle,
    /// Resolving the call and setting up the engine
    Connecting,
    /// Join payload exchanged, waiting for the network to come up
    Joining,
    /// Real-time media is flowing
    Connected,
    /// Renegotiating the join after a collision or network change
    Reconnecting,
    /// Tearing down and leaving server-side
    LeavingCall,
}

/// Medium-specific first-time setup for the engine's audio device module.
///
/// One session is parameterized with exactly one of these; what used to be
/// a hierarchy of call kinds is a plain capability choice here.
#[derive(Clone)]
pub enum MediaMode {
    /// Engine-side file playout and recording
    File {
        /// File to play into the call
        input: Option<PathBuf>,
        /// File to record the call into
        output: Option<PathBuf>,
        /// Restart the input file when it ends
        repeat: bool,
    },
    /// System audio devices, addressed by name or GUID
    Device {
        /// Playout device, default system device when absent
        playout: Option<String>,
        /// Recording device, default system device when absent
        recording: Option<String>,
    },
    /// Caller-supplied pull callbacks
    RawCallback(Arc<dyn MediaSource>),
    /// The built-in audio/video streaming pipeline, driven through
    /// [`play_audio`]/[`play_video`]
    ///
    /// [`play_audio`]: GroupCall::play_audio
    /// [`play_video`]: GroupCall::play_video
    Combined,
}

impl std::fmt::Debug for MediaMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::File { input, output, repeat } => f
                .debug_struct("File")
                .field("input", input)
                .field("output", output)
                .field("repeat", repeat)
                .finish(),
            Self::Device { playout, recording } => f
                .debug_struct("Device")
                .field("playout", playout)
                .field("recording", recording)
                .finish(),
            Self::RawCallback(_) => f.debug_tuple("RawCallback").finish(),
            Self::Combined => f.write_str("Combined"),
        }
    }
}

const ALL_ACTIONS: [Action; 5] = [
    Action::NetworkStatusChanged,
    Action::ParticipantListUpdated,
    Action::AudioPlayoutEnded,
    Action::VideoPlayoutEnded,
    Action::CallDiscarded,
];

/// Commands the engine-facing sink and the media callbacks enqueue for the
/// session actor
enum SessionCommand {
    JoinPayloadReady(JoinPayload),
    NetworkStateChanged(bool),
    ParticipantDescriptionsRequired(Vec<u32>),
    AudioEnded(String),
    VideoEnded(String),
}

enum ActorMessage {
    Command(SessionCommand),
    Update(SignalingUpdate),
}

/// How a pending join-payload wait was released
enum JoinWaitOutcome {
    /// The payload was exchanged with the platform
    Joined,
    /// A concurrent stop made the wait moot; stop owns the state from here
    Cancelled,
}

/// Engine callback sink. Runs on engine threads; only converts and
/// enqueues, per the marshaling contract.
struct CommandSink {
    commands: mpsc::UnboundedSender<SessionCommand>,
}

impl EngineEvents for CommandSink {
    fn join_payload_ready(&self, payload: JoinPayload) {
        let _ = self.commands.send(SessionCommand::JoinPayloadReady(payload));
    }

    fn network_state_changed(&self, connected: bool) {
        let _ = self
            .commands
            .send(SessionCommand::NetworkStateChanged(connected));
    }

    fn participant_descriptions_required(&self, ssrcs: Vec<u32>) {
        let _ = self
            .commands
            .send(SessionCommand::ParticipantDescriptionsRequired(ssrcs));
    }
}

/// Pull adapter between the engine and the streaming pipeline. The engine
/// calls in from its real-time threads; both reads are non-blocking, padding
/// with silence (audio) or serving the last frame (video).
struct StreamMediaSource {
    audio: RwLock<Option<AudioStream>>,
    video: RwLock<Option<VideoStream>>,
}

impl StreamMediaSource {
    fn new() -> Self {
        Self {
            audio: RwLock::new(None),
            video: RwLock::new(None),
        }
    }

    fn set_audio(&self, stream: AudioStream) {
        *self.audio.write() = Some(stream);
    }

    fn set_video(&self, stream: VideoStream) {
        *self.video.write() = Some(stream);
    }

    fn stop_audio(&self) {
        if let Some(stream) = self.audio.write().take() {
            stream.stop();
        }
    }

    fn stop_video(&self) {
        if let Some(stream) = self.video.write().take() {
            stream.stop();
        }
    }

    fn stop_all(&self) {
        self.stop_audio();
        self.stop_video();
    }

    fn set_audio_pause(&self, paused: bool) {
        if let Some(stream) = &*self.audio.read() {
            stream.set_pause(paused);
        }
    }

    fn set_video_pause(&self, paused: bool) {
        if let Some(stream) = &*self.video.read() {
            stream.set_pause(paused);
        }
    }

    fn is_audio_running(&self) -> bool {
        self.audio.read().as_ref().is_some_and(|s| s.is_running())
    }

    fn is_video_running(&self) -> bool {
        self.video.read().as_ref().is_some_and(|s| s.is_running())
    }

    fn is_audio_paused(&self) -> bool {
        self.audio.read().as_ref().is_some_and(|s| s.is_paused())
    }

    fn is_video_paused(&self) -> bool {
        self.video.read().as_ref().is_some_and(|s| s.is_paused())
    }
}

impl MediaSource for StreamMediaSource {
    fn pull_audio(&self, len: usize) -> Bytes {
        let buffered = self.audio.read().as_ref().and_then(|s| s.read(len));
        buffered.unwrap_or_else(|| Bytes::from(vec![0u8; len]))
    }

    fn pull_video(&self) -> Bytes {
        match &*self.video.read() {
            Some(stream) => stream.read(),
            None => Bytes::new(),
        }
    }
}

/// Platform-session fields owned exclusively by the session
#[derive(Default)]
struct SessionData {
    call: Option<groupcall_signaling::CallDescriptor>,
    join_as: Option<PeerId>,
    invite_hash: Option<String>,
    my_ssrc: Option<u32>,
}

struct SessionCore {
    config: GroupCallConfig,
    engine: Arc<dyn TransportEngine>,
    bridge: Arc<dyn SignalingBridge>,
    dispatcher: Dispatcher,
    participants: ParticipantCache,
    media: Arc<StreamMediaSource>,
    media_mode: MediaMode,

    state: Mutex<SessionState>,
    session: Mutex<SessionData>,
    is_connected: AtomicBool,
    is_muted: AtomicBool,
    stop_requested: AtomicBool,
    speaking_indicator_enabled: AtomicBool,

    /// Released when a join payload has been exchanged with the platform
    join_waiter: Mutex<Option<oneshot::Sender<JoinWaitOutcome>>>,
    /// Released when the engine confirms disconnection during a stop
    disconnect_waiter: Mutex<Option<oneshot::Sender<()>>>,

    commands: mpsc::UnboundedSender<SessionCommand>,
    updates: mpsc::UnboundedSender<SignalingUpdate>,
}

/// Fluent construction of a [`GroupCall`]
pub struct GroupCallBuilder {
    engine: Arc<dyn TransportEngine>,
    bridge: Arc<dyn SignalingBridge>,
    media_mode: MediaMode,
    config: GroupCallConfig,
}

impl GroupCallBuilder {
    /// Choose the medium-specific first-time setup. Defaults to
    /// [`MediaMode::Combined`].
    pub fn media_mode(mut self, mode: MediaMode) -> Self {
        self.media_mode = mode;
        self
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: GroupCallConfig) -> Self {
        self.config = config;
        self
    }

    /// Override the bounded-wait budget for reconnect and stop.
    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.config.operation_timeout = timeout;
        self
    }

    /// Build the session and spawn its actor task. Must be called within a
    /// tokio runtime.
    pub fn build(self) -> GroupCall {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (update_tx, update_rx) = mpsc::unbounded_channel();

        let core = Arc::new(SessionCore {
            config: self.config,
            engine: self.engine,
            bridge: self.bridge,
            dispatcher: Dispatcher::new(&ALL_ACTIONS),
            participants: ParticipantCache::new(),
            media: Arc::new(StreamMediaSource::new()),
            media_mode: self.media_mode,
            state: Mutex::new(SessionState::Idle),
            session: Mutex::new(SessionData::default()),
            is_connected: AtomicBool::new(false),
            is_muted: AtomicBool::new(true),
            stop_requested: AtomicBool::new(false),
            speaking_indicator_enabled: AtomicBool::new(true),
            join_waiter: Mutex::new(None),
            disconnect_waiter: Mutex::new(None),
            commands: cmd_tx.clone(),
            updates: update_tx,
        });

        let sink: Arc<dyn EngineEvents> = Arc::new(CommandSink { commands: cmd_tx });
        core.engine.register_events(sink);

        tokio::spawn(run_actor(Arc::downgrade(&core), cmd_rx, update_rx));

        GroupCall { core }
    }
}

/// Handle to one call session. Cheap to clone; all clones drive the same
/// session.
#[derive(Clone)]
pub struct GroupCall {
    core: Arc<SessionCore>,
}

impl GroupCall {
    /// Start building a session over an engine and a bridge.
    pub fn builder(
        engine: Arc<dyn TransportEngine>,
        bridge: Arc<dyn SignalingBridge>,
    ) -> GroupCallBuilder {
        GroupCallBuilder {
            engine,
            bridge,
            media_mode: MediaMode::Combined,
            config: GroupCallConfig::default(),
        }
    }

    /// Join the active call of `group` and start media per the session's
    /// [`MediaMode`].
    ///
    /// `join_as` picks how the local user appears in the participant list
    /// (defaulting to the platform's choice), `invite_hash` is the speaker
    /// invite token, and `enable_speaking_indicator` controls the periodic
    /// speaking action sent while connected.
    ///
    /// Starting while another call is active on this session reuses the
    /// engine instance: the previous membership is renegotiated away by the
    /// same path a reconnect takes.
    pub async fn start(
        &self,
        group: &str,
        join_as: Option<PeerId>,
        invite_hash: Option<String>,
        enable_speaking_indicator: bool,
    ) -> Result<(), GroupCallError> {
        let result = SessionCore::start(
            &self.core,
            group,
            join_as,
            invite_hash,
            enable_speaking_indicator,
        )
        .await;
        if result.is_err() {
            *self.core.state.lock() = SessionState::Idle;
        }
        result
    }

    /// Renegotiate the join on the same engine instance. Waits, bounded by
    /// the configured timeout, until a fresh join payload has been exchanged
    /// with the platform.
    pub async fn reconnect(&self) -> Result<(), GroupCallError> {
        SessionCore::reconnect(&self.core).await
    }

    /// Tear the session down: reject late signaling with the stop guard,
    /// unsubscribe from updates, quiesce the engine, wait (bounded) for
    /// disconnection when connected, leave server-side, and reset. No-op
    /// when no session is active.
    pub async fn stop(&self) -> Result<(), GroupCallError> {
        SessionCore::stop(&self.core).await
    }

    /// Mute or unmute the outgoing audio, on the engine and mirrored to the
    /// platform.
    pub async fn set_mute(&self, muted: bool) -> Result<(), GroupCallError> {
        let (join_as, _) = self.core.require_session("set_mute")?;
        self.core.is_muted.store(muted, Ordering::SeqCst);
        self.core.engine.set_mute(muted);
        debug!(muted, "Set mute");
        self.core
            .bridge
            .edit_call_member(&join_as, None, Some(muted))
            .await
            .map_err(Into::into)
    }

    /// Set the local user's volume. The percent value is clamped to
    /// `[1, 200]` before anything is sent; the platform receives it in its
    /// own units and the engine gets the equivalent gain for the own SSRC.
    pub async fn set_volume(&self, percent: i32) -> Result<(), GroupCallError> {
        let (join_as, my_ssrc) = self.core.require_session("set_volume")?;
        let percent = percent.clamp(1, 200) as u32;
        debug!(percent, "Set volume");
        self.core
            .bridge
            .edit_call_member(&join_as, Some(scale_volume(percent)), None)
            .await?;
        if let Some(ssrc) = my_ssrc {
            self.core.engine.set_volume(ssrc, f64::from(percent) / 100.0);
        }
        Ok(())
    }

    /// Edit another member's settings. Requires call-management permission
    /// on the platform side.
    ///
    /// `volume` is a percent; it is scaled to platform units with a floor of
    /// one so the raw values `0` and `100` — which the platform
    /// special-cases — are never sent literally. Whether current platform
    /// versions still reject a literal `100` is unverified; the defensive
    /// scaling is kept either way.
    pub async fn edit_member(
        &self,
        peer: &PeerId,
        volume: Option<u32>,
        muted: Option<bool>,
    ) -> Result<(), GroupCallError> {
        self.core.require_session("edit_member")?;
        self.core
            .bridge
            .edit_call_member(peer, volume.map(scale_volume), muted)
            .await
            .map_err(Into::into)
    }

    /// Play an audio file into the call. Any running audio stream is
    /// stopped first; with no source the engine keeps pulling silence.
    pub async fn play_audio(
        &self,
        source: Option<PathBuf>,
        repeat: bool,
    ) -> Result<(), GroupCallError> {
        self.core.media.stop_audio();
        if let Some(path) = source {
            let decoder = FileAudioSource::open(&path)?;
            let stream = AudioStream::start(
                Some(Box::new(decoder)),
                repeat,
                self.core.media_ended_callback(MediaKind::Audio),
                None,
            );
            self.core.media.set_audio(stream);
        }
        SessionCore::unmute_after_media_start(&self.core).await
    }

    /// Play a video file into the call, optionally with its audio track and
    /// best-effort lip sync between the two streams. Any running video
    /// stream is stopped first.
    pub async fn play_video(
        &self,
        source: Option<PathBuf>,
        with_audio: bool,
        repeat: bool,
        lip_sync: bool,
    ) -> Result<(), GroupCallError> {
        self.core.media.stop_video();

        let mut companion = None;
        if let Some(path) = &source {
            let decoder = FileVideoSource::open(path)?;
            let stream = VideoStream::start(
                Some(Box::new(decoder)),
                repeat,
                self.core.media_ended_callback(MediaKind::Video),
            );
            let info = stream.video_info();
            self.core
                .engine
                .set_video_capture(info.width, info.height, info.fps);
            if lip_sync {
                companion = Some(stream.clone());
            }
            self.core.media.set_video(stream);
        }

        if with_audio {
            self.core.media.stop_audio();
            if let Some(path) = &source {
                let decoder = FileAudioSource::open(path)?;
                let stream = AudioStream::start(
                    Some(Box::new(decoder)),
                    repeat,
                    self.core.media_ended_callback(MediaKind::Audio),
                    companion,
                );
                self.core.media.set_audio(stream);
            }
            return SessionCore::unmute_after_media_start(&self.core).await;
        }
        Ok(())
    }

    /// Stop audio playout and mute on the platform when connected.
    pub async fn stop_audio(&self) -> Result<(), GroupCallError> {
        self.core.media.stop_audio();
        if self.core.is_connected.load(Ordering::SeqCst) {
            let (join_as, _) = self.core.require_session("stop_audio")?;
            self.core.is_muted.store(true, Ordering::SeqCst);
            self.core
                .bridge
                .edit_call_member(&join_as, None, Some(true))
                .await?;
        }
        Ok(())
    }

    /// Stop video playout.
    pub async fn stop_video(&self) -> Result<(), GroupCallError> {
        self.core.media.stop_video();
        Ok(())
    }

    /// Pause or resume the audio stream. Production keeps running so
    /// resuming is instant; the platform-side mute flag is mirrored when
    /// connected.
    pub async fn set_audio_pause(&self, paused: bool) -> Result<(), GroupCallError> {
        self.core.media.set_audio_pause(paused);
        if self.core.is_connected.load(Ordering::SeqCst) {
            let (join_as, _) = self.core.require_session("set_audio_pause")?;
            self.core.is_muted.store(paused, Ordering::SeqCst);
            self.core
                .bridge
                .edit_call_member(&join_as, None, Some(paused))
                .await?;
        }
        Ok(())
    }

    /// Pause or resume the video stream.
    pub async fn set_video_pause(&self, paused: bool) -> Result<(), GroupCallError> {
        self.core.media.set_video_pause(paused);
        Ok(())
    }

    /// Pause or resume both streams with a single platform edit.
    pub async fn set_pause(&self, paused: bool) -> Result<(), GroupCallError> {
        self.core.media.set_audio_pause(paused);
        self.core.media.set_video_pause(paused);
        if self.core.is_connected.load(Ordering::SeqCst) {
            let (join_as, _) = self.core.require_session("set_pause")?;
            self.core.is_muted.store(paused, Ordering::SeqCst);
            self.core
                .bridge
                .edit_call_member(&join_as, None, Some(paused))
                .await?;
        }
        Ok(())
    }

    /// Restart the playout side of the engine's audio device module, e.g.
    /// after changing the input file of a [`MediaMode::File`] session.
    pub fn restart_playout(&self) -> Result<(), GroupCallError> {
        self.core.require_session("restart_playout")?;
        self.core.engine.restart_playout();
        Ok(())
    }

    /// Restart the recording side of the engine's audio device module.
    pub fn restart_recording(&self) -> Result<(), GroupCallError> {
        self.core.require_session("restart_recording")?;
        self.core.engine.restart_recording();
        Ok(())
    }

    /// Register a handler for any dispatcher action.
    pub fn add_handler(&self, handler: Handler, action: Action) -> Result<bool, GroupCallError> {
        self.core.dispatcher.add_handler(handler, action)
    }

    /// Remove a previously registered handler. Idempotent.
    pub fn remove_handler(&self, handler: &Handler, action: Action) -> Result<bool, GroupCallError> {
        self.core.dispatcher.remove_handler(handler, action)
    }

    /// Called on every deduplicated network-state transition.
    pub fn on_network_status_changed(&self, handler: Handler) -> Result<bool, GroupCallError> {
        self.add_handler(handler, Action::NetworkStatusChanged)
    }

    /// Called with every participant-list delta the platform delivers.
    pub fn on_participant_list_updated(&self, handler: Handler) -> Result<bool, GroupCallError> {
        self.add_handler(handler, Action::ParticipantListUpdated)
    }

    /// Called once when a non-repeating audio source ends.
    pub fn on_audio_playout_ended(&self, handler: Handler) -> Result<bool, GroupCallError> {
        self.add_handler(handler, Action::AudioPlayoutEnded)
    }

    /// Called once when a non-repeating video source ends.
    pub fn on_video_playout_ended(&self, handler: Handler) -> Result<bool, GroupCallError> {
        self.add_handler(handler, Action::VideoPlayoutEnded)
    }

    /// Called when the platform discards the call.
    pub fn on_call_discarded(&self, handler: Handler) -> Result<bool, GroupCallError> {
        self.add_handler(handler, Action::CallDiscarded)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.core.state.lock()
    }

    /// Whether the engine currently reports the network as up.
    pub fn is_connected(&self) -> bool {
        self.core.is_connected.load(Ordering::SeqCst)
    }

    /// The local SSRC of the current join attempt, once assigned.
    pub fn my_ssrc(&self) -> Option<u32> {
        self.core.session.lock().my_ssrc
    }

    /// The local user's own peer identity, when the bridge knows it.
    pub fn my_peer(&self) -> Option<PeerId> {
        self.core.bridge.my_peer()
    }

    /// Snapshot of the tracked participants.
    pub fn participants(&self) -> Vec<Participant> {
        self.core.participants.participants()
    }

    /// Whether the audio stream is producing.
    pub fn is_audio_running(&self) -> bool {
        self.core.media.is_audio_running()
    }

    /// Whether the video stream is producing.
    pub fn is_video_running(&self) -> bool {
        self.core.media.is_video_running()
    }

    /// Whether audio reads are paused.
    pub fn is_audio_paused(&self) -> bool {
        self.core.media.is_audio_paused()
    }

    /// Whether video reads are paused.
    pub fn is_video_paused(&self) -> bool {
        self.core.media.is_video_paused()
    }
}

impl std::fmt::Debug for GroupCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupCall")
            .field("state", &*self.core.state.lock())
            .field("connected", &self.core.is_connected.load(Ordering::SeqCst))
            .finish()
    }
}

#[derive(Clone, Copy)]
enum MediaKind {
    Audio,
    Video,
}

fn scale_volume(percent: u32) -> u32 {
    (percent * 100).max(1)
}

impl SessionCore {
    fn require_session(&self, operation: &str) -> Result<(PeerId, Option<u32>), GroupCallError> {
        let session = self.session.lock();
        match (&session.call, &session.join_as) {
            (Some(_), Some(join_as)) => Ok((join_as.clone(), session.my_ssrc)),
            _ => Err(GroupCallError::CallBeforeStart {
                operation: operation.to_string(),
            }),
        }
    }

    fn device_module(&self) -> AudioDeviceModule {
        match &self.media_mode {
            MediaMode::File { input, output, repeat } => AudioDeviceModule::File {
                input: input.clone(),
                output: output.clone(),
                endless: *repeat,
            },
            MediaMode::Device { playout, recording } => AudioDeviceModule::Device {
                playout: playout.clone(),
                recording: recording.clone(),
            },
            MediaMode::RawCallback(source) => AudioDeviceModule::Raw(Arc::clone(source)),
            MediaMode::Combined => {
                let source: Arc<dyn MediaSource> = self.media.clone();
                AudioDeviceModule::Raw(source)
            }
        }
    }

    /// End-of-stream callbacks run on media production threads, so they only
    /// enqueue for the actor, exactly like the engine sink.
    fn media_ended_callback(&self, kind: MediaKind) -> EndOfStream {
        let commands = self.commands.clone();
        Arc::new(move |source: &str| {
            let command = match kind {
                MediaKind::Audio => SessionCommand::AudioEnded(source.to_string()),
                MediaKind::Video => SessionCommand::VideoEnded(source.to_string()),
            };
            let _ = commands.send(command);
        })
    }

    async fn start(
        core: &Arc<Self>,
        group: &str,
        join_as: Option<PeerId>,
        invite_hash: Option<String>,
        enable_speaking_indicator: bool,
    ) -> Result<(), GroupCallError> {
        core.stop_requested.store(false, Ordering::SeqCst);
        core.speaking_indicator_enabled
            .store(enable_speaking_indicator, Ordering::SeqCst);
        *core.state.lock() = SessionState::Connecting;

        let call = core.bridge.resolve_and_fetch_call(group).await?;
        let join_as = core.bridge.resolve_join_as(join_as).await?;
        debug!(call_id = call.id, %join_as, "Resolved call");

        {
            let mut session = core.session.lock();
            session.call = Some(call.clone());
            session.join_as = Some(join_as);
            session.invite_hash = invite_hash;
        }

        // One subscription per active call, keyed by the descriptor.
        core.bridge.unregister_update_handlers();
        core.bridge
            .register_update_handlers(SubscriptionKey::for_call(&call), core.updates.clone());

        if core.engine.is_call_started() {
            // Same engine instance, new chat or identity.
            Self::reconnect(core).await
        } else {
            core.engine.start_call(core.device_module())?;
            *core.state.lock() = SessionState::Joining;
            Ok(())
        }
    }

    async fn reconnect(core: &Arc<Self>) -> Result<(), GroupCallError> {
        debug!("Reconnecting");
        if core.session.lock().call.is_none() {
            return Err(GroupCallError::CallBeforeStart {
                operation: "reconnect".to_string(),
            });
        }

        *core.state.lock() = SessionState::Reconnecting;
        core.engine.set_connection_mode(ConnectionMode::None);

        let (tx, rx) = oneshot::channel();
        *core.join_waiter.lock() = Some(tx);
        core.engine.emit_join_payload();

        // A prior stop released the audio device module.
        core.engine.restart_recording();
        core.engine.restart_playout();

        match tokio::time::timeout(core.config.operation_timeout, rx).await {
            Ok(Ok(JoinWaitOutcome::Joined)) => {
                *core.state.lock() = SessionState::Joining;
                Ok(())
            }
            // Cancelled by a concurrent stop, or the waiter was replaced by
            // a newer attempt; either way this wait resolves harmlessly.
            Ok(_) => Ok(()),
            Err(_) => {
                core.join_waiter.lock().take();
                Err(GroupCallError::ReconnectTimeout {
                    timeout: core.config.operation_timeout,
                })
            }
        }
    }

    async fn stop(core: &Arc<Self>) -> Result<(), GroupCallError> {
        if core.session.lock().call.is_none() {
            debug!("No active session, nothing to stop");
            return Ok(());
        }

        core.stop_requested.store(true, Ordering::SeqCst);
        debug!("Stop requested");
        *core.state.lock() = SessionState::LeavingCall;

        core.bridge.unregister_update_handlers();
        // Hold-mute keeps the engine from recreating the outgoing audio
        // channel while the mode drops.
        core.engine.set_mute(true);
        core.is_muted.store(true, Ordering::SeqCst);
        core.engine.set_connection_mode(ConnectionMode::None);

        // A reconnect waiting on a payload that will never be used resolves
        // harmlessly now.
        if let Some(tx) = core.join_waiter.lock().take() {
            let _ = tx.send(JoinWaitOutcome::Cancelled);
        }

        let (tx, rx) = oneshot::channel();
        *core.disconnect_waiter.lock() = Some(tx);
        if core.is_connected.load(Ordering::SeqCst) {
            if tokio::time::timeout(core.config.operation_timeout, rx)
                .await
                .is_err()
            {
                core.disconnect_waiter.lock().take();
                return Err(GroupCallError::DisconnectTimeout {
                    timeout: core.config.operation_timeout,
                });
            }
        } else {
            core.disconnect_waiter.lock().take();
        }

        core.engine.stop_audio_device_module();

        if let Err(e) = core.bridge.leave_call().await {
            warn!(error = %e, "Couldn't leave the call; the server will evict us on its own timeout");
        }
        core.bridge.reset();

        {
            let mut session = core.session.lock();
            *session = SessionData::default();
        }
        core.participants.clear();
        core.media.stop_all();

        core.stop_requested.store(false, Ordering::SeqCst);
        *core.state.lock() = SessionState::Idle;
        debug!("Stopped properly");
        Ok(())
    }

    async fn unmute_after_media_start(core: &Arc<Self>) -> Result<(), GroupCallError> {
        if !core.is_connected.load(Ordering::SeqCst) {
            return Ok(());
        }
        let (join_as, _) = core.require_session("play")?;
        core.is_muted.store(false, Ordering::SeqCst);
        core.engine.set_mute(false);
        core.bridge
            .edit_call_member(&join_as, None, Some(false))
            .await
            .map_err(Into::into)
    }

    fn handle_command(core: &Arc<Self>, command: SessionCommand) {
        match command {
            SessionCommand::JoinPayloadReady(payload) => Self::handle_join_payload(core, payload),
            SessionCommand::NetworkStateChanged(connected) => {
                Self::handle_network_state(core, connected);
            }
            SessionCommand::ParticipantDescriptionsRequired(ssrcs) => {
                Self::handle_descriptions_required(core, ssrcs);
            }
            SessionCommand::AudioEnded(source) => {
                core.dispatcher
                    .trigger(Action::AudioPlayoutEnded, SessionEvent::AudioPlayoutEnded { source });
            }
            SessionCommand::VideoEnded(source) => {
                core.dispatcher
                    .trigger(Action::VideoPlayoutEnded, SessionEvent::VideoPlayoutEnded { source });
            }
        }
    }

    fn handle_join_payload(core: &Arc<Self>, payload: JoinPayload) {
        debug!("Join payload ready");
        if core.stop_requested.load(Ordering::SeqCst) {
            debug!("Join rejected by a stop request");
            return;
        }
        let invite_hash = {
            let mut session = core.session.lock();
            if session.call.is_none() {
                debug!("No call descriptor, join payload ignored");
                return;
            }
            session.my_ssrc = Some(payload.ssrc);
            session.invite_hash.clone()
        };

        // The join RPC runs off the actor so a slow platform can't stall
        // event processing, and a reconnect it spawns can be satisfied by
        // the next payload flowing through the actor.
        let core = Arc::clone(core);
        tokio::spawn(async move {
            let params = payload.to_params_json();
            match core
                .bridge
                .join_call(invite_hash.as_deref(), &params, true)
                .await
            {
                Ok(ssrc) => {
                    let ssrc = to_unsigned(ssrc);
                    core.session.lock().my_ssrc = Some(ssrc);
                    if let Some(tx) = core.join_waiter.lock().take() {
                        let _ = tx.send(JoinWaitOutcome::Joined);
                    }
                    debug!(ssrc, "Joined the call");
                }
                Err(SignalingError::DuplicateSsrc) => {
                    // Expected under concurrent join races; renegotiate with
                    // a fresh payload instead of surfacing an error.
                    debug!("Duplicate SSRC");
                    if let Err(e) = Self::reconnect(&core).await {
                        warn!(error = %e, "Reconnect after SSRC collision failed");
                    }
                }
                Err(e) => warn!(error = %e, "Join request failed"),
            }
        });
    }

    fn handle_network_state(core: &Arc<Self>, connected: bool) {
        if core.is_connected.load(Ordering::SeqCst) == connected {
            debug!("Network state unchanged");
            return;
        }
        core.is_connected.store(connected, Ordering::SeqCst);
        debug!(connected, "Network state changed");

        if connected {
            *core.state.lock() = SessionState::Connected;
            // Revert the hold-mute a prior stop left on the engine.
            core.engine.set_mute(false);
            core.is_muted.store(false, Ordering::SeqCst);
            {
                let core = Arc::clone(core);
                tokio::spawn(async move {
                    if let Ok((join_as, _)) = core.require_session("unmute") {
                        if let Err(e) = core
                            .bridge
                            .edit_call_member(&join_as, None, Some(false))
                            .await
                        {
                            debug!(error = %e, "Couldn't mirror unmute to the platform");
                        }
                    }
                });
            }
            if core.speaking_indicator_enabled.load(Ordering::SeqCst) {
                Self::start_speaking_worker(core);
            }
        } else if let Some(tx) = core.disconnect_waiter.lock().take() {
            let _ = tx.send(());
        }

        core.dispatcher.trigger(
            Action::NetworkStatusChanged,
            SessionEvent::NetworkStatusChanged { connected },
        );
    }

    fn start_speaking_worker(core: &Arc<Self>) {
        let core = Arc::clone(core);
        tokio::spawn(async move {
            debug!("Start speaking action worker");
            while core.is_connected.load(Ordering::SeqCst) {
                if let Err(e) = core.bridge.send_speaking_indicator().await {
                    debug!(error = %e, "Speaking action failed");
                }
                tokio::time::sleep(core.config.speaking_indicator_interval).await;
            }
        });
    }

    fn handle_descriptions_required(core: &Arc<Self>, ssrcs: Vec<u32>) {
        debug!(count = ssrcs.len(), "Participant descriptions required");
        if let Some(descriptors) = core.participants.descriptors(&ssrcs) {
            core.engine.add_participants(descriptors);
            return;
        }

        // Cache miss: refresh the whole list once and serve what we can.
        let core = Arc::clone(core);
        tokio::spawn(async move {
            match core.bridge.fetch_participants().await {
                Ok(list) => {
                    core.participants.replace_all(&list);
                    let descriptors: Vec<_> = ssrcs
                        .iter()
                        .filter_map(|&ssrc| core.participants.get(ssrc))
                        .map(|p| p.descriptor())
                        .collect();
                    if descriptors.len() < ssrcs.len() {
                        debug!(
                            missing = ssrcs.len() - descriptors.len(),
                            "Some requested participants are unknown to the platform"
                        );
                    }
                    core.engine.add_participants(descriptors);
                }
                Err(e) => warn!(error = %e, "Couldn't refresh the participant list"),
            }
        });
    }

    async fn handle_update(core: &Arc<Self>, update: SignalingUpdate) {
        match update {
            SignalingUpdate::ParticipantsUpdated { participants } => {
                Self::handle_participants_updated(core, participants);
            }
            SignalingUpdate::CallParamsUpdated { params } => {
                Self::handle_params_updated(core, &params).await;
            }
            SignalingUpdate::CallDiscarded => {
                debug!("Call discarded server-side");
                core.dispatcher
                    .trigger(Action::CallDiscarded, SessionEvent::CallDiscarded);
                let core = Arc::clone(core);
                tokio::spawn(async move {
                    if let Err(e) = Self::stop(&core).await {
                        warn!(error = %e, "Stop after call discard failed");
                    }
                });
            }
        }
    }

    fn handle_participants_updated(
        core: &Arc<Self>,
        participants: Vec<groupcall_signaling::ParticipantUpdate>,
    ) {
        debug!(count = participants.len(), "Participants updated");
        core.dispatcher.trigger(
            Action::ParticipantListUpdated,
            SessionEvent::ParticipantListUpdated {
                participants: participants.clone(),
            },
        );

        let (join_as, my_ssrc) = {
            let session = core.session.lock();
            (session.join_as.clone(), session.my_ssrc)
        };

        let removed = core.participants.apply(&participants);

        for participant in &participants {
            if participant.left {
                continue;
            }
            let ssrc = to_unsigned(participant.source);

            // Another client session of the same identity grabbed a new
            // SSRC; our join is stale.
            if Some(&participant.peer) == join_as.as_ref() {
                if let Some(mine) = my_ssrc {
                    if ssrc != mine {
                        debug!(expected = mine, actual = ssrc, "Own SSRC mismatch");
                        let core = Arc::clone(core);
                        tokio::spawn(async move {
                            if let Err(e) = Self::reconnect(&core).await {
                                warn!(error = %e, "Reconnect after SSRC mismatch failed");
                            }
                        });
                    }
                }
            }

            // Admin allowed us to speak; re-assert the unmute we already
            // chose locally.
            if participant.is_self
                && participant.can_self_unmute
                && !core.is_muted.load(Ordering::SeqCst)
            {
                if let Some(join_as) = join_as.clone() {
                    let core = Arc::clone(core);
                    tokio::spawn(async move {
                        if let Err(e) = core
                            .bridge
                            .edit_call_member(&join_as, None, Some(false))
                            .await
                        {
                            debug!(error = %e, "Couldn't re-apply unmute");
                        }
                    });
                }
            }
        }

        if !removed.is_empty() {
            debug!(ssrcs = ?removed, "Remove left participants");
            core.engine.remove_ssrcs(removed);
        }
    }

    async fn handle_params_updated(core: &Arc<Self>, params: &str) {
        debug!("Call params updated");
        if core.stop_requested.load(Ordering::SeqCst) {
            debug!("Stale call params discarded after stop request");
            return;
        }
        if core.session.lock().call.is_none() {
            debug!("Call params without a session discarded");
            return;
        }

        let remote = match RemoteParameters::from_params_json(params) {
            Ok(remote) => remote,
            Err(e) => {
                warn!(error = %e, "Platform sent unparsable call params");
                return;
            }
        };

        // Refresh the participant snapshot so the engine starts with the
        // full current set, not just the deltas seen so far.
        match core.bridge.fetch_participants().await {
            Ok(list) => core.participants.replace_all(&list),
            Err(e) => debug!(error = %e, "Participant refresh failed, using cached set"),
        }

        core.engine.set_connection_mode(ConnectionMode::Rtc);
        core.engine
            .set_join_response(remote, core.participants.snapshot());
        debug!("Join response payload was set");
    }
}

async fn run_actor(
    core: Weak<SessionCore>,
    mut commands: mpsc::UnboundedReceiver<SessionCommand>,
    mut updates: mpsc::UnboundedReceiver<SignalingUpdate>,
) {
    loop {
        let message = tokio::select! {
            command = commands.recv() => command.map(ActorMessage::Command),
            update = updates.recv() => update.map(ActorMessage::Update),
        };
        let Some(message) = message else { break };
        let Some(core) = core.upgrade() else { break };

        match message {
            ActorMessage::Command(command) => SessionCore::handle_command(&core, command),
            ActorMessage::Update(update) => SessionCore::handle_update(&core, update).await,
        }
    }
    debug!("Session actor finished");
}
