//! Session start/stop orchestration: wiring one session's tasks together.
//!
//! `start` owns the STOPPED→STARTING edge: do-commands run, event pumps and
//! sender tasks spawn, and the watchdog takes over the STARTING→RUNNING and
//! timeout edges. `stop`/`graceful_stop` set STOPPING; `join` waits for the
//! tasks, runs undo-commands, and lands in STOPPED.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use beamcast_codec::EncoderDescriptor;
use beamcast_core::{CaptureSource, StreamError, VideoPacket};

use crate::auto_bitrate::AutoBitrateController;
use crate::broadcast::{self, BroadcastContext};
use crate::control::ControlServer;
use crate::input_relay;
use crate::pipeline::{self, PipelineDeps};
use crate::protocol;
use crate::session::{CommandRunner, Session, SessionState};

/// Process-wide collaborators a session needs to run.
pub struct SessionRuntime {
    pub broadcast: Arc<BroadcastContext>,
    pub control: Arc<ControlServer>,
    pub controller: Arc<AutoBitrateController>,
    pub encoder: Arc<EncoderDescriptor>,
    pub runner: Arc<dyn CommandRunner>,
}

/// Start a session. Preconditions: state is STOPPED, a control peer is
/// bound, keys are installed (done at alloc).
pub async fn start(
    session: &Arc<Session>,
    runtime: &SessionRuntime,
    capture: Box<dyn CaptureSource>,
) -> Result<(), StreamError> {
    if session.state() != SessionState::Stopped {
        return Err(StreamError::InvalidState { operation: "start" });
    }
    if session.control.lock().peer.is_none() {
        return Err(StreamError::PeerNotBound { stream: "control" });
    }

    session.set_state(SessionState::Starting);

    for entry in &session.do_cmds {
        if let Err(e) = runtime.runner.run(entry) {
            warn!("Session {} do command failed: {}", session.launch_id, e);
        }
    }

    runtime.broadcast.register(session);

    // Event pumps: HDR pushes and gamepad feedback toward the client
    session.add_task(tokio::spawn(run_hdr_pump(
        Arc::clone(&runtime.control),
        Arc::clone(session),
    )));
    session.add_task(tokio::spawn(input_relay::run_feedback_pump(
        Arc::clone(&runtime.control),
        Arc::clone(session),
    )));

    if !session.config.video.input_only {
        // Audio sender
        session.install_audio_channel(64);
        if let Some(frames) = session.take_audio_frames() {
            session.add_task(tokio::spawn(broadcast::run_audio_sender(
                Arc::clone(session),
                Arc::clone(&runtime.broadcast),
                frames,
            )));
        }

        // Video pipeline feeding the video sender
        let (packets_tx, packets_rx) = mpsc::channel::<VideoPacket>(32);
        session.add_task(tokio::spawn(broadcast::run_video_sender(
            Arc::clone(session),
            Arc::clone(&runtime.broadcast),
            packets_rx,
        )));
        session.add_task(tokio::spawn(pipeline::run_video_pipeline(
            Arc::clone(session),
            capture,
            PipelineDeps {
                encoder: Arc::clone(&runtime.encoder),
                controller: Arc::clone(&runtime.controller),
            },
            packets_tx,
        )));
    }

    session.add_task(tokio::spawn(broadcast::run_watchdog(
        Arc::clone(session),
        Arc::clone(&runtime.broadcast),
    )));

    debug!("Session {} started", session.launch_id);
    Ok(())
}

/// Immediate stop.
pub fn stop(session: &Arc<Session>) {
    crate::session::stop(session);
}

/// Graceful stop: final control message, bounded wait, then STOPPING.
pub async fn graceful_stop(session: &Arc<Session>, runtime: &SessionRuntime) {
    crate::control::graceful_stop(&runtime.control, session, 0).await;
}

/// Join the session's tasks, run undo commands, release registries.
pub async fn join(session: &Arc<Session>, runtime: &SessionRuntime) {
    crate::session::join(session, runtime.runner.as_ref()).await;
    runtime.control.remove_session(session);
    runtime.controller.reset(session);
}

async fn run_hdr_pump(control: Arc<ControlServer>, session: Arc<Session>) {
    let Some(mut hdr) = session.take_hdr_events() else {
        return;
    };
    let mut shutdown = session.shutdown_watch();
    loop {
        let info = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            i = hdr.recv() => match i {
                Some(i) => i,
                None => break,
            },
        };
        if let Err(e) =
            control.send_encrypted(&session, protocol::PACKET_TYPE_HDR_INFO, &info.encode())
        {
            debug!("HDR info send failed: {}", e);
        }
    }
}

/// Stock runner that logs commands instead of spawning processes; the real
/// process runner lives with the application layer.
pub struct LoggingCommandRunner;

impl CommandRunner for LoggingCommandRunner {
    fn run(&self, entry: &beamcast_core::CommandEntry) -> Result<(), StreamError> {
        tracing::info!(
            "Session command (elevated={}): {}",
            entry.elevated,
            entry.cmd
        );
        Ok(())
    }
}
