//! Transport-engine boundary.
//!
//! The native engine owns ICE/DTLS negotiation, codecs, and device I/O and
//! runs on its own threads. The session drives it through [`TransportEngine`]
//! commands and receives its callbacks through an [`EngineEvents`] sink. The
//! engine pulls outgoing media on its real-time threads through
//! [`MediaSource`]; implementations of that trait must never block.

use crate::error::GroupCallError;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

/// Gate between "no media should flow" and active real-time media.
///
/// The transition to [`ConnectionMode::Rtc`] happens once per join attempt,
/// when the remote parameters are applied; teardown and reconnection drop
/// back to [`ConnectionMode::None`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    /// No media flows: pre-join, teardown, or between reconnect attempts
    None,
    /// Active real-time media
    Rtc,
}

/// One DTLS fingerprint of a join parameter set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtlsFingerprint {
    /// Hash function name
    pub hash: String,
    /// DTLS setup role
    pub setup: String,
    /// Fingerprint value
    pub fingerprint: String,
}

/// One ICE candidate from the remote parameter set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    /// Candidate port
    pub port: String,
    /// Transport protocol
    pub protocol: String,
    /// Network identifier
    pub network: String,
    /// ICE generation
    pub generation: String,
    /// Candidate identifier
    pub id: String,
    /// Component identifier
    pub component: String,
    /// Candidate foundation
    pub foundation: String,
    /// Candidate priority
    pub priority: String,
    /// Candidate address
    pub ip: String,
    /// Candidate type
    #[serde(rename = "type")]
    pub candidate_type: String,
    /// TCP candidate type, when protocol is tcp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_type: Option<String>,
    /// Related address for reflexive/relayed candidates
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rel_addr: Option<String>,
    /// Related port for reflexive/relayed candidates
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rel_port: Option<String>,
}

/// Local connection parameters generated by the engine when it is ready to
/// join. Produced once per join/reconnect attempt and consumed exactly once
/// by the signaling join request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinPayload {
    /// ICE username fragment
    pub ufrag: String,
    /// ICE password
    pub pwd: String,
    /// DTLS fingerprints
    pub fingerprints: Vec<DtlsFingerprint>,
    /// Local audio SSRC chosen by the engine
    pub ssrc: u32,
}

impl JoinPayload {
    /// Serialize into the JSON parameter string the platform join RPC takes.
    pub fn to_params_json(&self) -> String {
        // serde_json cannot fail on this shape
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// The platform's answer to a [`JoinPayload`], delivered asynchronously via
/// a call-params update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteParameters {
    /// Remote ICE username fragment
    pub ufrag: String,
    /// Remote ICE password
    pub pwd: String,
    /// Remote DTLS fingerprints
    #[serde(default)]
    pub fingerprints: Vec<DtlsFingerprint>,
    /// Remote ICE candidates
    #[serde(default)]
    pub candidates: Vec<IceCandidate>,
}

impl RemoteParameters {
    /// Parse the platform's params payload. The platform wraps the transport
    /// description in a `{"transport": {...}}` envelope.
    pub fn from_params_json(params: &str) -> Result<Self, GroupCallError> {
        #[derive(Deserialize)]
        struct Envelope {
            transport: RemoteParameters,
        }

        let envelope: Envelope =
            serde_json::from_str(params).map_err(|e| GroupCallError::MalformedParameters {
                reason: e.to_string(),
            })?;
        Ok(envelope.transport)
    }
}

/// Description of one call participant as the engine tracks it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantDescriptor {
    /// Participant audio SSRC (unsigned engine form)
    pub audio_ssrc: u32,
    /// Whether the participant is muted for everyone
    pub muted: bool,
    /// Participant volume in platform units, when set by an admin
    pub volume: Option<u32>,
}

/// Pull interface the engine drives from its real-time threads.
///
/// Every method must return within the engine's real-time budget: no
/// blocking I/O, no lock that a slow path can hold, no waiting on the
/// session scheduler.
pub trait MediaSource: Send + Sync {
    /// Produce the next outgoing audio buffer of exactly `len` bytes.
    /// Implementations pad with silence when less data is available.
    fn pull_audio(&self, len: usize) -> Bytes;

    /// Produce the next outgoing video frame, padded to the configured
    /// frame size.
    fn pull_video(&self) -> Bytes;

    /// Receive one buffer of recorded (incoming mixed) audio.
    fn recorded_audio(&self, _data: &[u8]) {}

    /// Whether outgoing playout is currently paused.
    fn is_playout_paused(&self) -> bool {
        false
    }

    /// Whether recording is currently paused.
    fn is_recording_paused(&self) -> bool {
        false
    }
}

/// Medium-specific audio device module handed to the engine on first start
#[derive(Clone)]
pub enum AudioDeviceModule {
    /// Engine-side file playout/recording
    File {
        /// File to play into the call
        input: Option<PathBuf>,
        /// File to record the call into
        output: Option<PathBuf>,
        /// Restart the input file when it ends
        endless: bool,
    },
    /// System audio devices, addressed by name or GUID
    Device {
        /// Playout device, default system device when absent
        playout: Option<String>,
        /// Recording device, default system device when absent
        recording: Option<String>,
    },
    /// Caller-supplied pull callbacks
    Raw(Arc<dyn MediaSource>),
}

impl std::fmt::Debug for AudioDeviceModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::File { input, output, endless } => f
                .debug_struct("File")
                .field("input", input)
                .field("output", output)
                .field("endless", endless)
                .finish(),
            Self::Device { playout, recording } => f
                .debug_struct("Device")
                .field("playout", playout)
                .field("recording", recording)
                .finish(),
            Self::Raw(_) => f.debug_tuple("Raw").finish(),
        }
    }
}

/// Callbacks the engine fires from its own threads.
///
/// Implementations must only marshal: convert the callback into a message
/// for the session scheduler and return. State transitions never happen
/// inside these callbacks.
pub trait EngineEvents: Send + Sync {
    /// The engine produced local join parameters for this join attempt.
    fn join_payload_ready(&self, payload: JoinPayload);

    /// The engine's network state flipped between connected and not.
    fn network_state_changed(&self, connected: bool);

    /// The engine needs descriptors for SSRCs it does not know yet.
    fn participant_descriptions_required(&self, ssrcs: Vec<u32>);
}

/// Commands the session issues to the native engine.
///
/// Command methods are fire-and-forget from the session's perspective; the
/// engine applies them on its own threads. Only first-time setup can fail
/// in a way the session must observe.
pub trait TransportEngine: Send + Sync {
    /// Register the callback sink. Called once before [`start_call`].
    ///
    /// [`start_call`]: TransportEngine::start_call
    fn register_events(&self, events: Arc<dyn EngineEvents>);

    /// First-time setup with the medium-specific audio device module.
    fn start_call(&self, module: AudioDeviceModule) -> Result<(), GroupCallError>;

    /// Whether a call was already started on this engine instance.
    fn is_call_started(&self) -> bool;

    /// Ask the engine to regenerate and re-emit a join payload.
    fn emit_join_payload(&self);

    /// Apply the platform's answer together with the current participant
    /// snapshot.
    fn set_join_response(&self, params: RemoteParameters, participants: Vec<ParticipantDescriptor>);

    /// Gate media flow.
    fn set_connection_mode(&self, mode: ConnectionMode);

    /// Mute or unmute the outgoing audio channel.
    fn set_mute(&self, muted: bool);

    /// Set the local playback gain for one SSRC. Gain `1.0` is nominal.
    fn set_volume(&self, ssrc: u32, gain: f64);

    /// Drop a batch of SSRCs from the engine's tracked participant set.
    fn remove_ssrcs(&self, ssrcs: Vec<u32>);

    /// Add descriptors for participants the engine asked about.
    fn add_participants(&self, participants: Vec<ParticipantDescriptor>);

    /// Configure the video capture geometry the engine pulls at.
    fn set_video_capture(&self, width: u32, height: u32, fps: u32);

    /// Restart the playout side of the audio device module.
    fn restart_playout(&self);

    /// Restart the recording side of the audio device module.
    fn restart_recording(&self);

    /// Release the audio device module during teardown.
    fn stop_audio_device_module(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_payload_serializes_flat() {
        let payload = JoinPayload {
            ufrag: "abcd".to_string(),
            pwd: "secret".to_string(),
            fingerprints: vec![DtlsFingerprint {
                hash: "sha-256".to_string(),
                setup: "active".to_string(),
                fingerprint: "AA:BB".to_string(),
            }],
            ssrc: 123456,
        };

        let json = payload.to_params_json();
        assert!(json.contains("\"ufrag\":\"abcd\""));
        assert!(json.contains("\"ssrc\":123456"));

        let back: JoinPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn remote_parameters_unwrap_transport_envelope() {
        let json = r#"{
            "transport": {
                "ufrag": "remote",
                "pwd": "pw",
                "fingerprints": [
                    {"hash": "sha-256", "setup": "passive", "fingerprint": "CC:DD"}
                ],
                "candidates": [{
                    "port": "30000", "protocol": "udp", "network": "1",
                    "generation": "0", "id": "c1", "component": "1",
                    "foundation": "f1", "priority": "100", "ip": "10.0.0.1",
                    "type": "host"
                }]
            }
        }"#;

        let params = RemoteParameters::from_params_json(json).unwrap();
        assert_eq!(params.ufrag, "remote");
        assert_eq!(params.candidates.len(), 1);
        assert_eq!(params.candidates[0].candidate_type, "host");
    }

    #[test]
    fn malformed_parameters_are_an_explicit_error() {
        let err = RemoteParameters::from_params_json("{\"nope\": 1}").unwrap_err();
        assert!(matches!(err, GroupCallError::MalformedParameters { .. }));
    }
}
