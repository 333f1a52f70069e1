use thiserror::Error;

/// Errors surfaced by the streaming session and its sender tasks.
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Session is not in a state that allows {operation}")]
    InvalidState { operation: &'static str },

    #[error("Capture source ended")]
    CaptureEnded,

    #[error("Peer endpoint for {stream} stream is not bound yet")]
    PeerNotBound { stream: &'static str },

    #[error("Handshake did not complete within {ms}ms")]
    HandshakeTimeout { ms: u64 },

    #[error("Control ping deadline expired")]
    PingTimeout,

    #[error("Encoder error: {0}")]
    Encoder(#[from] EncoderError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the encoder abstraction.
#[derive(Error, Debug)]
pub enum EncoderError {
    #[error("No encoder passed probing for {codec}")]
    NoUsableEncoder { codec: &'static str },

    #[error("Encoder backend `{backend}` is unavailable on this platform")]
    BackendUnavailable { backend: &'static str },

    #[error("Pipeline construction failed: {reason}")]
    PipelineConstruction { reason: String },

    #[error("Frame submission rejected: {reason}")]
    SubmitFailed { reason: String },

    #[error("Encoder produced no packet within the deadline")]
    PacketTimeout,

    #[error("Unrecoverable backend error {code}")]
    Fatal { code: i32 },
}

/// Errors from the control channel.
#[derive(Error, Debug)]
pub enum ControlError {
    #[error("Control frame too short: {len} bytes")]
    Truncated { len: usize },

    #[error("Payload length {declared} exceeds frame bounds ({available} available)")]
    BadLength { declared: usize, available: usize },

    #[error("Decryption failed (tag mismatch)")]
    DecryptFailed,

    #[error("No session matches peer")]
    UnknownSession,

    #[error("Send queue full")]
    Backpressure,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
