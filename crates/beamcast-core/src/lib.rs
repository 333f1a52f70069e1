//! beamcast-core — shared types for the Beamcast streaming host.
//!
//! Everything the other crates agree on lives here: the negotiated session
//! configuration, captured/encoded frame types, input events and client
//! permissions, the capture seam, and the error enums.

pub mod capture;
pub mod config;
pub mod errors;
pub mod input;
pub mod packet;
pub mod types;

pub use capture::{CaptureSource, SolidColorSource};
pub use config::{
    AudioConfig, AutoBitrateSettings, EncryptionMode, OpusStreamConfig, SessionConfig,
    StreamSettings, VideoConfig,
};
pub use errors::{ControlError, EncoderError, StreamError};
pub use input::{Feedback, InputEventClass, Permissions};
pub use packet::{Replacement, VideoPacket};
pub use types::*;
