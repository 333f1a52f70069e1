//! Input re-injection and gamepad feedback.
//!
//! Decrypted input payloads are classified just far enough to check the
//! client's permission bits, then handed to the external input backend
//! opaquely. Denied events are dropped without any reply — a rejection
//! message would leak the permission state to the client.
//!
//! Feedback (rumble, trigger rumble, motion state, RGB LED) flows the other
//! way: the backend pushes onto the session's feedback channel and the pump
//! task ships each message out on the control stream.

use std::sync::Arc;

use tracing::{debug, trace};

use beamcast_core::{Feedback, InputEventClass};

use crate::control::ControlServer;
use crate::protocol;
use crate::session::Session;

// ── Backend seam ──────────────────────────────────────────────────────────────

/// External input-injection backend (uinput, SendInput, …).
pub trait InputBackend: Send + Sync {
    /// Inject one decrypted input payload for this session.
    fn inject(&self, session_id: u32, payload: &[u8]);
}

/// Backend that swallows everything; used before a real backend is wired
/// and in tests.
pub struct NullInputBackend;

impl InputBackend for NullInputBackend {
    fn inject(&self, session_id: u32, payload: &[u8]) {
        trace!("Input dropped (no backend): session {} {} bytes", session_id, payload.len());
    }
}

// ── Relay ─────────────────────────────────────────────────────────────────────

/// Forward one input payload if the session's permissions allow its class.
pub fn relay_input(session: &Arc<Session>, backend: &dyn InputBackend, payload: &[u8]) {
    let class = InputEventClass::classify(payload);
    let required = class.required_permission();
    if !session.permissions().contains(required) {
        // Silent drop; see module docs.
        return;
    }
    backend.inject(session.launch_id, payload);
}

/// Pump the session's feedback channel onto the control stream until the
/// session shuts down.
pub async fn run_feedback_pump(server: Arc<ControlServer>, session: Arc<Session>) {
    let Some(mut feedback) = session.take_feedback_events() else {
        return;
    };
    let mut shutdown = session.shutdown_watch();
    loop {
        let event = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            f = feedback.recv() => match f {
                Some(f) => f,
                None => break,
            },
        };
        let msg_type = match event {
            Feedback::Rumble { .. } => protocol::PACKET_TYPE_RUMBLE_DATA,
            Feedback::RumbleTriggers { .. } => protocol::PACKET_TYPE_RUMBLE_TRIGGERS,
            Feedback::MotionEventState { .. } => protocol::PACKET_TYPE_MOTION_EVENT,
            Feedback::SetRgbLed { .. } => protocol::PACKET_TYPE_RGB_LED,
        };
        if let Err(e) = server.send_encrypted(&session, msg_type, &event.encode()) {
            debug!("Feedback send failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    use beamcast_core::{Permissions, SessionConfig};

    use crate::launch::test_launch_session;

    struct RecordingBackend {
        seen: Mutex<Vec<Vec<u8>>>,
    }

    impl InputBackend for RecordingBackend {
        fn inject(&self, _session_id: u32, payload: &[u8]) {
            self.seen.lock().push(payload.to_vec());
        }
    }

    fn mouse_event() -> Vec<u8> {
        let mut payload = 0x08u32.to_le_bytes().to_vec();
        payload.extend_from_slice(&[0u8; 8]);
        payload
    }

    #[test]
    fn permitted_input_reaches_the_backend() {
        let session = Session::alloc(SessionConfig::default(), &test_launch_session()).unwrap();
        let backend = RecordingBackend { seen: Mutex::new(Vec::new()) };
        relay_input(&session, &backend, &mouse_event());
        assert_eq!(backend.seen.lock().len(), 1);
    }

    #[test]
    fn denied_input_is_dropped_silently() {
        let mut launch = test_launch_session();
        launch.permissions = Permissions::DEFAULT; // view/list only
        let session = Session::alloc(SessionConfig::default(), &launch).unwrap();
        let backend = RecordingBackend { seen: Mutex::new(Vec::new()) };
        relay_input(&session, &backend, &mouse_event());
        assert!(backend.seen.lock().is_empty());
    }

    #[test]
    fn permission_revocation_applies_immediately() {
        let session = Session::alloc(SessionConfig::default(), &test_launch_session()).unwrap();
        let backend = RecordingBackend { seen: Mutex::new(Vec::new()) };
        relay_input(&session, &backend, &mouse_event());
        session.update_device_info("revoked", Permissions::DEFAULT);
        relay_input(&session, &backend, &mouse_event());
        assert_eq!(backend.seen.lock().len(), 1);
    }
}
