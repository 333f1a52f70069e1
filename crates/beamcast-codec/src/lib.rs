//! beamcast-codec — the encoder abstraction.
//!
//! ```text
//! descriptor (backend × codec × capabilities × options)
//!      │  probe_encoders() picks the best at startup
//!      ▼
//! GstEncodeSession — convert / request_idr / invalidate_refs / reconfigure_bitrate
//!      │
//!      ▼
//! VideoPacket stream (drained by the capture pipeline)
//! ```

pub mod descriptor;
pub mod options;
pub mod probe;
pub mod session;

pub use descriptor::{
    candidates, nvenc, software, vaapi, Capabilities, CodecSupport, EncoderDescriptor, EncoderKind,
};
pub use options::{resolve_all, EncoderOption, OptionValue, ResolvedOption, ResolvedValue};
pub use probe::{probe_encoders, ActiveCodecs};
pub use session::{EncodeSession, GstEncodeSession};
