//! beamcast-stream — the streaming session core.
//!
//! One client session spans four concurrent paths over three sockets:
//!
//! ```text
//!               ┌──────────────── Session (C10) ────────────────┐
//! UDP base+9    │ video: pipeline → FEC + AES-GCM → sender task │
//! TCP base+10   │ control: AES-GCM frames, handlers, telemetry  │
//! UDP base+11   │ audio: Opus → AES-CBC + FEC → sender task     │
//!               │ input: decrypt → permission gate → backend    │
//!               └───────────────────────────────────────────────┘
//! ```
//!
//! The auto-bitrate controller closes the loop from the client's LOSS_STATS
//! telemetry back into the encoder's bitrate.

pub mod auto_bitrate;
pub mod broadcast;
pub mod control;
pub mod fec;
pub mod input_relay;
pub mod launch;
pub mod lifecycle;
pub mod pipeline;
pub mod protocol;
pub mod rtp;
pub mod session;

pub use auto_bitrate::AutoBitrateController;
pub use broadcast::BroadcastContext;
pub use control::{install_default_handlers, ControlServer};
pub use input_relay::{InputBackend, NullInputBackend};
pub use launch::LaunchSession;
pub use lifecycle::{LoggingCommandRunner, SessionRuntime};
pub use session::{CommandRunner, Session, SessionState, VideoEvent};

/// Media/control port layout relative to the configured base port.
pub const VIDEO_PORT_OFFSET: u16 = 9;
pub const CONTROL_PORT_OFFSET: u16 = 10;
pub const AUDIO_PORT_OFFSET: u16 = 11;
