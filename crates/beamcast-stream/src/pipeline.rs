//! Capture → encode → packetize pipeline, one task per session.
//!
//! ```text
//! capture ── raw frame ──► encode session ── AU ──► SPS/VUI post-process
//!     │ timeout: duplicate previous frame            │ first packet + IDRs
//!     └── pacing at config.framerate                 ▼
//!                                        timestamp + flags ──► broadcast
//! ```
//!
//! The pipeline also commits the auto-bitrate controller's proposals: only
//! this task talks to the encoder, so `reconfigure_bitrate` has a single
//! caller.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use beamcast_bitstream::{make_sps_replacements, VuiParams};
use beamcast_codec::{EncoderDescriptor, GstEncodeSession};
use beamcast_codec::session::EncodeSession;
use beamcast_core::{CaptureSource, CapturedFrame, Colorspace, VideoPacket};

use crate::auto_bitrate::AutoBitrateController;
use crate::session::{Session, SessionState, VideoEvent};

pub struct PipelineDeps {
    pub encoder: Arc<EncoderDescriptor>,
    pub controller: Arc<AutoBitrateController>,
}

/// Run the video pipeline until shutdown or a fatal error. Video errors are
/// fatal to the session; the caller observes that through the state change.
pub async fn run_video_pipeline(
    session: Arc<Session>,
    mut capture: Box<dyn CaptureSource>,
    deps: PipelineDeps,
    packets_tx: mpsc::Sender<VideoPacket>,
) {
    let config = session.config.video.clone();
    let Some(codec) = deps.encoder.codec_from_config(&config) else {
        warn!("Session {}: no encoder for {}", session.launch_id, config.codec);
        crate::session::stop(&session);
        return;
    };

    let mut encoder = match GstEncodeSession::new(&deps.encoder, codec, &config, capture.format()) {
        Ok(e) => e,
        Err(e) => {
            warn!("Session {}: encoder construction failed: {}", session.launch_id, e);
            crate::session::stop(&session);
            return;
        }
    };

    let Some(mut events) = session.take_video_events() else {
        warn!("Session {}: video events already taken", session.launch_id);
        crate::session::stop(&session);
        return;
    };

    let colorspace = Colorspace::from_csc_mode(config.encoder_csc_mode, config.hdr());
    let vui = VuiParams::from(colorspace);
    let frame_interval = config.frame_interval();

    let mut shutdown = session.shutdown_watch();
    let mut last_frame: Option<CapturedFrame> = None;
    let mut next_frame_number = 0u64;
    let mut first_packet = true;

    info!(
        "Session {} pipeline: {} {}x{}@{} ({} kbps)",
        session.launch_id,
        config.codec,
        config.width,
        config.height,
        config.fps(),
        config.bitrate_kbps
    );

    loop {
        tokio::select! {
            biased;

            _ = shutdown.changed() => break,

            // Control-channel events, observed before the next frame
            event = events.recv() => {
                match event {
                    Some(VideoEvent::RequestIdr) => encoder.request_idr_frame(),
                    Some(VideoEvent::InvalidateRefs { first, last }) => {
                        encoder.invalidate_ref_frames(first, last);
                    }
                    None => break,
                }
            }

            // Capture; a timeout duplicates the previous frame so the
            // client keeps seeing monotonic timestamps at target cadence.
            result = capture.next_frame(frame_interval) => {
                let frame = match result {
                    Ok(Some(mut frame)) => {
                        frame.frame_number = next_frame_number;
                        last_frame = Some(frame.clone());
                        Some(frame)
                    }
                    Ok(None) => last_frame.clone().map(|mut dup| {
                        dup.frame_number = next_frame_number;
                        dup
                    }),
                    Err(e) => {
                        warn!("Session {}: capture failed: {}", session.launch_id, e);
                        crate::session::stop(&session);
                        break;
                    }
                };
                if let Some(frame) = frame {
                    next_frame_number += 1;
                    if let Err(e) = encoder.convert(&frame) {
                        warn!("Session {}: encode failed: {}", session.launch_id, e);
                        crate::session::stop(&session);
                        break;
                    }
                }
            }

            // Encoded output
            packet = encoder.next_packet() => {
                let Some(mut packet) = packet else {
                    debug!("Session {}: encoder drained", session.launch_id);
                    break;
                };

                if first_packet || packet.is_idr() {
                    packet.replacements =
                        make_sps_replacements(config.codec, &packet.data, &vui);
                    first_packet = false;
                }
                packet.frame_timestamp = Some(Instant::now());

                if packets_tx.send(packet).await.is_err() {
                    break;
                }

                maybe_adjust_bitrate(&session, &deps.controller, &mut encoder);
            }
        }
    }

    if session.state() != SessionState::Stopped {
        crate::session::stop(&session);
    }
    debug!("Session {} pipeline exited", session.launch_id);
}

/// Ask the controller for a proposal and commit it against the encoder.
/// The attempt is recorded either way so refusals back off.
fn maybe_adjust_bitrate(
    session: &Arc<Session>,
    controller: &AutoBitrateController,
    encoder: &mut dyn EncodeSession,
) {
    if !controller.should_adjust_bitrate(session) {
        return;
    }
    let new_kbps = controller.calculate_new_bitrate(session);
    let applied = encoder.reconfigure_bitrate(new_kbps);
    controller.confirm_bitrate_change(session, new_kbps, applied);
    if applied {
        info!("Session {}: bitrate adjusted to {} kbps", session.launch_id, new_kbps);
    } else {
        debug!("Session {}: encoder refused bitrate change", session.launch_id);
    }
}
