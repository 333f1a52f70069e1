//! The streaming session: one client's video/audio/control/input state.
//!
//! # Lifecycle
//!
//! ```text
//! STOPPED ──start()──► STARTING ──peers bound + first ping──► RUNNING
//!    ▲                     │ handshake timeout                    │
//!    │                     ▼                                      ▼ stop /
//!    └──join()──────── STOPPING ◄───────── ping timeout / sender error
//! ```
//!
//! The session is shared by the control thread, the video pipeline task,
//! the audio sender task, and the input-relay path. Each substream block is
//! written by its own task; cross-task reads snapshot under a short mutex.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use beamcast_core::{
    CommandEntry, Feedback, HdrInfo, Permissions, SessionConfig, StreamError,
};
use beamcast_crypto::{CbcCipher, CryptoError, GcmCipher};

use crate::launch::LaunchSession;

// ── State ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Stopped = 0,
    Stopping = 1,
    Starting = 2,
    Running = 3,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Stopping,
            2 => Self::Starting,
            3 => Self::Running,
            _ => Self::Stopped,
        }
    }
}

// ── Substream blocks ──────────────────────────────────────────────────────────

/// Video sender state. Written by the video task; peers snapshot.
pub struct VideoContext {
    pub ping_payload: String,
    /// Sequence number low watermark handed to the packetizer.
    pub lowseq: u16,
    pub peer: Option<SocketAddr>,
    /// Present only when media encryption was negotiated.
    pub cipher: Option<GcmCipher>,
    pub iv_seed: [u8; 12],
    pub iv_counter: u64,
}

/// Audio sender state.
pub struct AudioContext {
    pub ping_payload: String,
    pub cipher: CbcCipher,
    pub sequence: u16,
    pub av_ri_key_id: u32,
    pub timestamp: u32,
    pub peer: Option<SocketAddr>,
}

/// Control-channel state.
pub struct ControlContext {
    pub cipher: GcmCipher,
    /// Pre-Gen7 clients encrypt input blobs separately with this IV.
    pub legacy_input_iv: Vec<u8>,
    pub incoming_iv: [u8; 12],
    pub outgoing_iv: [u8; 12],
    pub connect_data: u32,
    /// `None` until a control peer claims this session ("port 0").
    pub expected_peer: Option<SocketAddr>,
    pub peer: Option<SocketAddr>,
    /// Outgoing encrypted-frame sequence, starts at 0.
    pub seq: u32,
    /// Incoming sequence high-water mark.
    pub incoming_seq: u32,
}

/// Events the control channel raises toward the video pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoEvent {
    RequestIdr,
    InvalidateRefs { first: i64, last: i64 },
}

// ── Session ───────────────────────────────────────────────────────────────────

pub struct Session {
    pub config: SessionConfig,

    pub launch_id: u32,
    pub device_uuid: String,
    device_name: Mutex<String>,
    permissions: Mutex<Permissions>,

    state: AtomicU8,

    pub video: Mutex<VideoContext>,
    pub audio: Mutex<AudioContext>,
    pub control: Mutex<ControlContext>,

    video_events_tx: mpsc::UnboundedSender<VideoEvent>,
    video_events_rx: Mutex<Option<mpsc::UnboundedReceiver<VideoEvent>>>,
    hdr_tx: mpsc::UnboundedSender<HdrInfo>,
    hdr_rx: Mutex<Option<mpsc::UnboundedReceiver<HdrInfo>>>,
    feedback_tx: mpsc::UnboundedSender<Feedback>,
    feedback_rx: Mutex<Option<mpsc::UnboundedReceiver<Feedback>>>,

    /// Opus frames from the external audio capture toward the audio sender.
    audio_frames_tx: Mutex<Option<mpsc::Sender<bytes::Bytes>>>,
    audio_frames_rx: Mutex<Option<mpsc::Receiver<bytes::Bytes>>>,

    shutdown_tx: watch::Sender<bool>,

    ping_deadline: Mutex<Instant>,
    got_first_ping: AtomicBool,
    started_at: Mutex<Instant>,

    pub do_cmds: Vec<CommandEntry>,
    pub undo_cmds: Vec<CommandEntry>,

    pub auto_bitrate_enabled: bool,
    pub auto_bitrate_min_kbps: u32,
    pub auto_bitrate_max_kbps: u32,
    /// LOSS_STATS packets seen since the last BITRATE_STATS emission.
    pub stats_counter: AtomicU32,
    /// Last CONNECTION_STATUS forwarded to the client; -1 = never.
    pub last_sent_connection_status: AtomicI32,

    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Session {
    /// Build a session from the negotiated config and launch parameters.
    /// Installs keys and wires the typed event channels; does not start any
    /// tasks.
    pub fn alloc(config: SessionConfig, launch: &LaunchSession) -> Result<Arc<Self>, CryptoError> {
        let control_cipher = GcmCipher::new(&launch.gcm_key)?;
        let audio_cipher = CbcCipher::new(&launch.gcm_key, true)?;
        let video_cipher = if config.encryption_flags_enabled != 0 {
            Some(GcmCipher::new(&launch.gcm_key)?)
        } else {
            None
        };

        let mut iv_seed = [0u8; 12];
        for (i, b) in launch.iv.iter().take(12).enumerate() {
            iv_seed[i] = *b;
        }
        // Directions must never share an IV under the same key; the host's
        // outgoing seed flips the top bit.
        let mut outgoing_iv = iv_seed;
        outgoing_iv[0] ^= 0x80;

        let (video_events_tx, video_events_rx) = mpsc::unbounded_channel();
        let (hdr_tx, hdr_rx) = mpsc::unbounded_channel();
        let (feedback_tx, feedback_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);

        let now = Instant::now();
        Ok(Arc::new(Self {
            video: Mutex::new(VideoContext {
                ping_payload: launch.av_ping_payload.clone(),
                lowseq: 0,
                peer: None,
                cipher: video_cipher,
                iv_seed,
                iv_counter: 0,
            }),
            audio: Mutex::new(AudioContext {
                ping_payload: launch.av_ping_payload.clone(),
                cipher: audio_cipher,
                sequence: 0,
                av_ri_key_id: launch.av_ri_key_id(),
                timestamp: 0,
                peer: None,
            }),
            control: Mutex::new(ControlContext {
                cipher: control_cipher,
                legacy_input_iv: launch.iv.clone(),
                incoming_iv: iv_seed,
                outgoing_iv,
                connect_data: launch.control_connect_data,
                expected_peer: None,
                peer: None,
                seq: 0,
                incoming_seq: 0,
            }),
            config,
            launch_id: launch.id,
            device_uuid: launch.device_uuid.clone(),
            device_name: Mutex::new(launch.device_name.clone()),
            permissions: Mutex::new(launch.permissions),
            state: AtomicU8::new(SessionState::Stopped as u8),
            video_events_tx,
            video_events_rx: Mutex::new(Some(video_events_rx)),
            hdr_tx,
            hdr_rx: Mutex::new(Some(hdr_rx)),
            feedback_tx,
            feedback_rx: Mutex::new(Some(feedback_rx)),
            audio_frames_tx: Mutex::new(None),
            audio_frames_rx: Mutex::new(None),
            shutdown_tx,
            ping_deadline: Mutex::new(now + Duration::from_secs(3600)),
            got_first_ping: AtomicBool::new(false),
            started_at: Mutex::new(now),
            do_cmds: launch.do_cmds.clone(),
            undo_cmds: launch.undo_cmds.clone(),
            auto_bitrate_enabled: launch.auto_bitrate_enabled,
            auto_bitrate_min_kbps: launch.auto_bitrate_min_kbps,
            auto_bitrate_max_kbps: launch.auto_bitrate_max_kbps,
            stats_counter: AtomicU32::new(0),
            last_sent_connection_status: AtomicI32::new(-1),
            tasks: Mutex::new(Vec::new()),
        }))
    }

    // ── State ────────────────────────────────────────────────────────────────

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: SessionState) {
        let prev = SessionState::from_u8(self.state.swap(state as u8, Ordering::AcqRel));
        if prev != state {
            info!("Session {}: {:?} → {:?}", self.launch_id, prev, state);
        }
    }

    /// CAS used by the watchdog so a racing `stop` is never overwritten.
    pub(crate) fn try_transition(&self, from: SessionState, to: SessionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    // ── Identity ─────────────────────────────────────────────────────────────

    pub fn device_name(&self) -> String {
        self.device_name.lock().clone()
    }

    pub fn permissions(&self) -> Permissions {
        *self.permissions.lock()
    }

    /// Refresh name/permissions after a pairing update.
    pub fn update_device_info(&self, name: &str, permissions: Permissions) {
        *self.device_name.lock() = name.to_owned();
        *self.permissions.lock() = permissions;
        debug!("Session {}: device info updated ({})", self.launch_id, name);
    }

    pub fn uuid_matches(&self, uuid: &str) -> bool {
        self.device_uuid == uuid
    }

    // ── Events ───────────────────────────────────────────────────────────────

    pub fn raise_idr(&self) {
        let _ = self.video_events_tx.send(VideoEvent::RequestIdr);
    }

    pub fn raise_invalidate_refs(&self, first: i64, last: i64) {
        let _ = self.video_events_tx.send(VideoEvent::InvalidateRefs { first, last });
    }

    pub fn push_hdr(&self, info: HdrInfo) {
        let _ = self.hdr_tx.send(info);
    }

    pub fn push_feedback(&self, feedback: Feedback) {
        let _ = self.feedback_tx.send(feedback);
    }

    /// The video pipeline takes its event receiver exactly once.
    pub fn take_video_events(&self) -> Option<mpsc::UnboundedReceiver<VideoEvent>> {
        self.video_events_rx.lock().take()
    }

    pub fn take_hdr_events(&self) -> Option<mpsc::UnboundedReceiver<HdrInfo>> {
        self.hdr_rx.lock().take()
    }

    pub fn take_feedback_events(&self) -> Option<mpsc::UnboundedReceiver<Feedback>> {
        self.feedback_rx.lock().take()
    }

    // ── Audio ingress ────────────────────────────────────────────────────────

    pub(crate) fn install_audio_channel(&self, capacity: usize) {
        let (tx, rx) = mpsc::channel(capacity);
        *self.audio_frames_tx.lock() = Some(tx);
        *self.audio_frames_rx.lock() = Some(rx);
    }

    /// Sender handed to the external audio capture; one encoded Opus frame
    /// per send.
    pub fn audio_frame_sender(&self) -> Option<mpsc::Sender<bytes::Bytes>> {
        self.audio_frames_tx.lock().clone()
    }

    pub(crate) fn take_audio_frames(&self) -> Option<mpsc::Receiver<bytes::Bytes>> {
        self.audio_frames_rx.lock().take()
    }

    // ── Ping / shutdown ──────────────────────────────────────────────────────

    pub fn refresh_ping_deadline(&self, timeout: Duration) {
        *self.ping_deadline.lock() = Instant::now() + timeout;
        self.got_first_ping.store(true, Ordering::Release);
    }

    pub fn ping_deadline(&self) -> Instant {
        *self.ping_deadline.lock()
    }

    pub fn got_first_ping(&self) -> bool {
        self.got_first_ping.load(Ordering::Acquire)
    }

    pub fn started_at(&self) -> Instant {
        *self.started_at.lock()
    }

    pub fn shutdown_watch(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub(crate) fn add_task(&self, task: JoinHandle<()>) {
        self.tasks.lock().push(task);
    }

    /// Await every session task; used by `join`.
    pub(crate) async fn drain_tasks(&self) {
        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Session {} task panicked: {}", self.launch_id, e);
            }
        }
    }

    // ── Peer binding ─────────────────────────────────────────────────────────

    /// Both media endpoints learned (input-only sessions skip this gate).
    pub fn media_peers_bound(&self) -> bool {
        if self.config.video.input_only {
            return true;
        }
        self.video.lock().peer.is_some() && self.audio.lock().peer.is_some()
    }
}

// ── Lifecycle free functions ──────────────────────────────────────────────────

/// Runs pre/post-session commands. The process-spawning half lives outside
/// the core.
pub trait CommandRunner: Send + Sync {
    fn run(&self, entry: &CommandEntry) -> Result<(), StreamError>;
}

/// Immediate stop: flip to STOPPING and wake every task.
pub fn stop(session: &Session) {
    match session.state() {
        SessionState::Stopped | SessionState::Stopping => {}
        _ => {
            session.set_state(SessionState::Stopping);
            session.request_shutdown();
        }
    }
}

/// Wait for the sender tasks, run undo commands, then land in STOPPED.
pub async fn join(session: &Arc<Session>, runner: &dyn CommandRunner) {
    session.drain_tasks().await;
    for entry in session.undo_cmds.iter().rev() {
        if let Err(e) = runner.run(entry) {
            warn!("Session {} undo command failed: {}", session.launch_id, e);
        }
    }
    session.set_state(SessionState::Stopped);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launch::test_launch_session;

    fn test_session() -> Arc<Session> {
        Session::alloc(SessionConfig::default(), &test_launch_session()).unwrap()
    }

    #[test]
    fn alloc_starts_stopped_and_unclaimed() {
        let s = test_session();
        assert_eq!(s.state(), SessionState::Stopped);
        assert!(s.control.lock().expected_peer.is_none());
        assert!(!s.media_peers_bound());
        assert_eq!(s.control.lock().seq, 0);
    }

    #[test]
    fn outgoing_iv_differs_from_incoming() {
        let s = test_session();
        let ctl = s.control.lock();
        assert_ne!(ctl.incoming_iv, ctl.outgoing_iv);
    }

    #[test]
    fn cas_transition_does_not_clobber_stopping() {
        let s = test_session();
        s.set_state(SessionState::Starting);
        // A stop lands first…
        s.set_state(SessionState::Stopping);
        // …then the watchdog's STARTING→RUNNING must fail.
        assert!(!s.try_transition(SessionState::Starting, SessionState::Running));
        assert_eq!(s.state(), SessionState::Stopping);
    }

    #[test]
    fn input_only_sessions_skip_media_peer_gate() {
        let mut config = SessionConfig::default();
        config.video.input_only = true;
        let s = Session::alloc(config, &test_launch_session()).unwrap();
        assert!(s.media_peers_bound());
    }

    #[tokio::test]
    async fn video_events_flow_in_order() {
        let s = test_session();
        let mut rx = s.take_video_events().unwrap();
        s.raise_idr();
        s.raise_invalidate_refs(100, 105);
        assert_eq!(rx.recv().await, Some(VideoEvent::RequestIdr));
        assert_eq!(
            rx.recv().await,
            Some(VideoEvent::InvalidateRefs { first: 100, last: 105 })
        );
        // Receiver can only be taken once
        assert!(s.take_video_events().is_none());
    }
}
