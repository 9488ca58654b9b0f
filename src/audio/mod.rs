//! Audio decoding, device access and playback scheduling

pub mod decoder;
pub mod device;
pub mod playback;
pub mod pulse;

pub use decoder::{decode, AudioBuffer};
pub use device::{
    AudioBackend, DeviceError, InputRequest, MicrophoneStream, MicrophoneTrack, OutputContext,
    VoiceId,
};
pub use playback::PlaybackScheduler;
pub use pulse::PulseBackend;
