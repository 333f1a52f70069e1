//! Capture seam between the streaming core and the platform backends.
//!
//! DXGI/X11/Wayland/KMS backends live outside this workspace; the pipeline
//! only sees this trait. `SolidColorSource` is the in-tree implementation
//! used by encoder probing and tests.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::errors::StreamError;
use crate::types::{CapturedFrame, RawPixelFormat};

// ── CaptureSource ─────────────────────────────────────────────────────────────

/// One display's frame source.
///
/// `next_frame` waits up to `timeout` for a new frame; `Ok(None)` means the
/// timeout elapsed with nothing new (the pipeline duplicates the previous
/// frame to keep pacing), `Err` means the source died.
#[async_trait]
pub trait CaptureSource: Send {
    async fn next_frame(&mut self, timeout: Duration) -> Result<Option<CapturedFrame>, StreamError>;

    fn width(&self) -> u32;

    fn height(&self) -> u32;

    fn format(&self) -> RawPixelFormat;
}

// ── SolidColorSource ──────────────────────────────────────────────────────────

/// Synthetic capture source producing one solid-colour frame per interval.
pub struct SolidColorSource {
    width: u32,
    height: u32,
    format: RawPixelFormat,
    interval: Duration,
    frame: Bytes,
    frame_number: u64,
    /// When set, the source reports end-of-frames after this many frames.
    limit: Option<u64>,
}

impl SolidColorSource {
    pub fn new(width: u32, height: u32, fps: u32) -> Self {
        Self::with_color(width, height, fps, [0x20, 0x40, 0x80])
    }

    pub fn with_color(width: u32, height: u32, fps: u32, bgr: [u8; 3]) -> Self {
        let format = RawPixelFormat::Bgrx;
        let mut data = Vec::with_capacity(format.frame_size(width, height));
        for _ in 0..(width as usize * height as usize) {
            data.extend_from_slice(&[bgr[0], bgr[1], bgr[2], 0xff]);
        }
        Self {
            width,
            height,
            format,
            interval: Duration::from_secs(1) / fps.max(1),
            frame: Bytes::from(data),
            frame_number: 0,
            limit: None,
        }
    }

    /// Stop producing after `frames` frames (probing uses 1).
    pub fn with_frame_limit(mut self, frames: u64) -> Self {
        self.limit = Some(frames);
        self
    }
}

#[async_trait]
impl CaptureSource for SolidColorSource {
    async fn next_frame(&mut self, timeout: Duration) -> Result<Option<CapturedFrame>, StreamError> {
        if let Some(limit) = self.limit {
            if self.frame_number >= limit {
                return Err(StreamError::CaptureEnded);
            }
        }
        if timeout < self.interval {
            tokio::time::sleep(timeout).await;
            return Ok(None);
        }
        tokio::time::sleep(self.interval).await;
        let frame = CapturedFrame {
            data: self.frame.clone(),
            width: self.width,
            height: self.height,
            format: self.format,
            frame_number: self.frame_number,
        };
        self.frame_number += 1;
        Ok(Some(frame))
    }

    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn format(&self) -> RawPixelFormat {
        self.format
    }
}
