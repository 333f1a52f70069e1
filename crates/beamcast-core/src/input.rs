//! Client input classification, permissions, and gamepad feedback.
//!
//! Input payloads stay opaque to the core — the external input backend owns
//! the event structs. The core only needs to classify an event far enough
//! to enforce the client's permission bits, and to serialise the feedback
//! messages travelling the other way.

use serde::{Deserialize, Serialize};

// MARK: - Permissions

/// Client permission bitfield granted at pairing time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Permissions(pub u32);

impl Permissions {
    pub const INPUT_CONTROLLER: Permissions = Permissions(1 << 8);
    pub const INPUT_TOUCH: Permissions = Permissions(1 << 9);
    pub const INPUT_PEN: Permissions = Permissions(1 << 10);
    pub const INPUT_MOUSE: Permissions = Permissions(1 << 11);
    pub const INPUT_KEYBOARD: Permissions = Permissions(1 << 12);
    pub const ALL_INPUTS: Permissions = Permissions(0x1f << 8);

    pub const LIST: Permissions = Permissions(1 << 24);
    pub const VIEW: Permissions = Permissions(1 << 25);
    pub const LAUNCH: Permissions = Permissions(1 << 26);

    pub const DEFAULT: Permissions = Permissions(Self::LIST.0 | Self::VIEW.0);
    pub const NONE: Permissions = Permissions(0);
    pub const ALL: Permissions =
        Permissions(Self::ALL_INPUTS.0 | Self::LIST.0 | Self::VIEW.0 | Self::LAUNCH.0);

    pub fn contains(self, other: Permissions) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for Permissions {
    type Output = Permissions;

    fn bitor(self, rhs: Permissions) -> Permissions {
        Permissions(self.0 | rhs.0)
    }
}

// MARK: - InputEventClass

/// Coarse class of a decrypted input packet, read from its leading
/// little-endian u32 event tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputEventClass {
    Keyboard,
    Mouse,
    Controller,
    Touch,
    Pen,
    Other,
}

impl InputEventClass {
    /// Classify an input payload. Tags follow the reference protocol's
    /// event-type numbering.
    pub fn classify(payload: &[u8]) -> Self {
        if payload.len() < 4 {
            return Self::Other;
        }
        let tag = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
        match tag {
            0x03 | 0x04 => Self::Keyboard,
            0x05 | 0x06 | 0x07 | 0x08 | 0x09 | 0x0a => Self::Mouse,
            0x0b | 0x0c | 0x0d | 0x1e => Self::Controller,
            0x15 => Self::Touch,
            0x16 => Self::Pen,
            _ => Self::Other,
        }
    }

    /// Permission bit this class requires. `Other` events (utf-8 text,
    /// haptics acks) ride on the keyboard bit.
    pub fn required_permission(self) -> Permissions {
        match self {
            Self::Keyboard | Self::Other => Permissions::INPUT_KEYBOARD,
            Self::Mouse => Permissions::INPUT_MOUSE,
            Self::Controller => Permissions::INPUT_CONTROLLER,
            Self::Touch => Permissions::INPUT_TOUCH,
            Self::Pen => Permissions::INPUT_PEN,
        }
    }
}

// MARK: - Feedback

/// Host→client gamepad feedback, produced by the external input backend and
/// shipped over the control stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feedback {
    Rumble { id: u16, low_freq: u16, high_freq: u16 },
    RumbleTriggers { id: u16, left: u16, right: u16 },
    /// Enable or change the cadence of a controller's motion sensor.
    MotionEventState { id: u16, report_rate: u16, motion_type: u8 },
    SetRgbLed { id: u16, r: u8, g: u8, b: u8 },
}

impl Feedback {
    /// Little-endian control payload for this message.
    pub fn encode(&self) -> Vec<u8> {
        match *self {
            Feedback::Rumble { id, low_freq, high_freq } => {
                let mut out = Vec::with_capacity(10);
                out.extend_from_slice(&0u32.to_le_bytes()); // header padding
                out.extend_from_slice(&id.to_le_bytes());
                out.extend_from_slice(&low_freq.to_le_bytes());
                out.extend_from_slice(&high_freq.to_le_bytes());
                out
            }
            Feedback::RumbleTriggers { id, left, right } => {
                let mut out = Vec::with_capacity(6);
                out.extend_from_slice(&id.to_le_bytes());
                out.extend_from_slice(&left.to_le_bytes());
                out.extend_from_slice(&right.to_le_bytes());
                out
            }
            Feedback::MotionEventState { id, report_rate, motion_type } => {
                let mut out = Vec::with_capacity(5);
                out.extend_from_slice(&id.to_le_bytes());
                out.extend_from_slice(&report_rate.to_le_bytes());
                out.push(motion_type);
                out
            }
            Feedback::SetRgbLed { id, r, g, b } => {
                let mut out = Vec::with_capacity(5);
                out.extend_from_slice(&id.to_le_bytes());
                out.push(r);
                out.push(g);
                out.push(b);
                out
            }
        }
    }
}
