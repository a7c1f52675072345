//! # Audio Module
//!
//! Everything between the microphone, the remote peer and the speaker.
//!
//! ## Key Components:
//! - **Codec**: float ↔ PCM16 conversion, base64, WAV headers
//! - **Resample**: box-filter rate conversion for uplink frames
//! - **Capture / Uplink**: microphone frames → 24kHz PCM16 → bounded queue → transport
//! - **Playback / Mixer**: gapless scheduling of downlink chunks on the output clock
//! - **Interruption**: barge-in, stops everything that is scheduled and resets the timeline
//! - **Buffer / Visualizer**: analysis tap on the output and the radial spectrum display
//!
//! ## Audio Format:
//! - **Sample Rate**: 24kHz in both directions on the wire
//! - **Bit Depth**: 16-bit signed PCM, little-endian
//! - **Channels**: Mono

pub mod buffer;
pub mod capture;
pub mod codec;
pub mod interruption;
pub mod mixer;
pub mod playback;
pub mod resample;
pub mod uplink;
pub mod visualizer;
