//! Broadcast context: the two media UDP sockets and the per-session sender
//! tasks.
//!
//! ```text
//!                    ┌────────────── BroadcastContext ──────────────┐
//! pipeline ──VideoPacket──► video sender ── FEC + GCM ──► video sock (base+9)
//! audio capture ──Opus───► audio sender ── CBC + FEC ──► audio sock (base+11)
//!                    └── recv loops learn peer endpoints from pings ┘
//! ```
//!
//! The context is shared by every session through an `Arc` and never
//! back-references sessions except through the weak registration list used
//! for peer learning.

use std::net::SocketAddr;
use std::sync::Weak;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use beamcast_core::{StreamError, StreamSettings, VideoPacket};

use crate::fec::{encode_group, group_fragments, AudioFecEncoder};
use crate::protocol::{audio_iv, video_iv};
use crate::rtp::{
    AudioFecHeader, RtpHeader, VideoShardHeader, AUDIO_FEC_PAYLOAD_TYPE, AUDIO_PAYLOAD_TYPE,
    VIDEO_FLAG_AFTER_REF_INVALIDATION, VIDEO_FLAG_IDR, VIDEO_PAYLOAD_TYPE,
};
use crate::session::{Session, SessionState};
use crate::{AUDIO_PORT_OFFSET, VIDEO_PORT_OFFSET};

/// Transient send errors tolerated before a datagram is dropped.
const SEND_RETRY_CAP: usize = 3;

// ── BroadcastContext ──────────────────────────────────────────────────────────

pub struct BroadcastContext {
    pub video_sock: Arc<UdpSocket>,
    pub audio_sock: Arc<UdpSocket>,
    pub settings: StreamSettings,
    /// Sessions awaiting peer endpoints, matched by ping payload.
    registered: Mutex<Vec<Weak<Session>>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum MediaSocket {
    Video,
    Audio,
}

impl BroadcastContext {
    /// Bind both media sockets (video = base+9, audio = base+11) and start
    /// the peer-learning receive loops.
    pub async fn bind(base_port: u16, settings: StreamSettings) -> Result<Arc<Self>, StreamError> {
        let video_sock =
            Arc::new(UdpSocket::bind(("0.0.0.0", base_port + VIDEO_PORT_OFFSET)).await?);
        let audio_sock =
            Arc::new(UdpSocket::bind(("0.0.0.0", base_port + AUDIO_PORT_OFFSET)).await?);
        info!(
            "Broadcast sockets bound: video {}, audio {}",
            video_sock.local_addr()?,
            audio_sock.local_addr()?
        );

        let ctx = Arc::new(Self {
            video_sock,
            audio_sock,
            settings,
            registered: Mutex::new(Vec::new()),
        });

        tokio::spawn(recv_loop(Arc::clone(&ctx), MediaSocket::Video));
        tokio::spawn(recv_loop(Arc::clone(&ctx), MediaSocket::Audio));
        Ok(ctx)
    }

    /// Register a session for peer learning.
    pub fn register(&self, session: &Arc<Session>) {
        let mut registered = self.registered.lock();
        registered.retain(|w| w.strong_count() > 0);
        registered.push(Arc::downgrade(session));
    }

    fn claim_peer(&self, socket: MediaSocket, payload: &[u8], peer: SocketAddr) {
        let registered = self.registered.lock();
        for weak in registered.iter() {
            let Some(session) = weak.upgrade() else { continue };
            match socket {
                MediaSocket::Video => {
                    let mut video = session.video.lock();
                    if video.peer.is_none() && payload.starts_with(video.ping_payload.as_bytes()) {
                        video.peer = Some(peer);
                        info!("Session {}: video peer {}", session.launch_id, peer);
                        return;
                    }
                }
                MediaSocket::Audio => {
                    let mut audio = session.audio.lock();
                    if audio.peer.is_none() && payload.starts_with(audio.ping_payload.as_bytes()) {
                        audio.peer = Some(peer);
                        info!("Session {}: audio peer {}", session.launch_id, peer);
                        return;
                    }
                }
            }
        }
        trace!("Unmatched {} ping from {}", if socket == MediaSocket::Video { "video" } else { "audio" }, peer);
    }
}

async fn recv_loop(ctx: Arc<BroadcastContext>, socket: MediaSocket) {
    let sock = match socket {
        MediaSocket::Video => Arc::clone(&ctx.video_sock),
        MediaSocket::Audio => Arc::clone(&ctx.audio_sock),
    };
    let mut buf = [0u8; 2048];
    loop {
        match sock.recv_from(&mut buf).await {
            Ok((len, peer)) => ctx.claim_peer(socket, &buf[..len], peer),
            Err(e) => {
                warn!("Media socket receive error: {}", e);
                return;
            }
        }
    }
}

/// Send with a short retry on transient failure; video data is dropped
/// after the cap rather than stalling the frame clock.
async fn send_capped(sock: &UdpSocket, datagram: &[u8], peer: SocketAddr) -> bool {
    for attempt in 0..SEND_RETRY_CAP {
        match sock.send_to(datagram, peer).await {
            Ok(_) => return true,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock && attempt + 1 < SEND_RETRY_CAP => {
                tokio::task::yield_now().await;
            }
            Err(e) => {
                debug!("UDP send to {} failed: {}", peer, e);
                return false;
            }
        }
    }
    false
}

// ── Video sender ──────────────────────────────────────────────────────────────

/// Drains the pipeline's packet queue, packetizes with FEC + encryption,
/// and sends to the learned peer. A send-path error here is fatal to the
/// session.
pub async fn run_video_sender(
    session: Arc<Session>,
    ctx: Arc<BroadcastContext>,
    mut packets: mpsc::Receiver<VideoPacket>,
) {
    let mut shutdown = session.shutdown_watch();
    loop {
        let packet = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            p = packets.recv() => match p {
                Some(p) => p,
                None => break,
            },
        };

        let peer = session.video.lock().peer;
        let Some(peer) = peer else {
            // Media cannot flow before the endpoint is learned.
            trace!("Session {}: dropping frame, video peer unbound", session.launch_id);
            continue;
        };

        if let Err(e) = send_video_packet(&session, &ctx, &packet, peer).await {
            warn!("Session {} video sender failed: {}", session.launch_id, e);
            crate::session::stop(&session);
            break;
        }
    }
    debug!("Session {} video sender exited", session.launch_id);
}

async fn send_video_packet(
    session: &Arc<Session>,
    ctx: &BroadcastContext,
    packet: &VideoPacket,
    peer: SocketAddr,
) -> Result<(), StreamError> {
    let payload_size = session.config.packet_size.max(256);
    let data = packet.patched_data();
    let timestamp =
        (packet.frame_index as u32).wrapping_mul(session.config.video.rtp_timestamp_step());

    let mut flags = 0u8;
    if packet.is_idr() {
        flags |= VIDEO_FLAG_IDR;
    }
    if packet.after_ref_frame_invalidation {
        flags |= VIDEO_FLAG_AFTER_REF_INVALIDATION;
    }

    let fragments: Vec<Vec<u8>> = data.chunks(payload_size).map(<[u8]>::to_vec).collect();
    let last_len = fragments.last().map(Vec::len).unwrap_or(0) as u16;

    for chunk in group_fragments(fragments) {
        let group = encode_group(
            &chunk,
            ctx.settings.fec_percentage,
            session.config.min_required_fec_packets,
        )
        .map_err(|_| StreamError::InvalidState { operation: "fec encode" })?;

        for (shard_index, shard) in group.shards.iter().enumerate() {
            // Sender-side state snapshot: sequence + IV counter advance
            // under one short lock.
            let (sequence, iv, cipher) = {
                let mut video = session.video.lock();
                let sequence = video.lowseq;
                video.lowseq = video.lowseq.wrapping_add(1);
                let iv = video_iv(&video.iv_seed, video.iv_counter);
                video.iv_counter += 1;
                (sequence, iv, video.cipher.clone())
            };

            let mut body = Vec::with_capacity(12 + shard.len());
            VideoShardHeader {
                frame_index: packet.frame_index as u32,
                shard_index: shard_index as u8,
                data_shards: group.data_shards as u8,
                parity_shards: group.parity_shards as u8,
                flags,
                last_shard_bytes: last_len,
                reserved: 0,
            }
            .write(&mut body);
            body.extend_from_slice(shard);

            let body = match &cipher {
                Some(cipher) => cipher
                    .encrypt(&iv, &body)
                    .map_err(|_| StreamError::InvalidState { operation: "video encrypt" })?,
                None => body,
            };

            let mut datagram = Vec::with_capacity(12 + body.len());
            RtpHeader {
                payload_type: VIDEO_PAYLOAD_TYPE,
                sequence,
                timestamp,
                ssrc: session.launch_id,
            }
            .write(&mut datagram);
            datagram.extend_from_slice(&body);

            send_capped(&ctx.video_sock, &datagram, peer).await;
        }
    }
    Ok(())
}

// ── Audio sender ──────────────────────────────────────────────────────────────

/// Consumes encoded Opus frames, encrypts per shard, maintains the 4+2 FEC
/// group, and sends. Audio errors end this task but leave the session
/// running.
pub async fn run_audio_sender(
    session: Arc<Session>,
    ctx: Arc<BroadcastContext>,
    mut frames: mpsc::Receiver<bytes::Bytes>,
) {
    let mut fec = AudioFecEncoder::new();
    let timestamp_step = session.config.audio.rtp_timestamp_step();
    let mut shutdown = session.shutdown_watch();

    loop {
        let frame = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            f = frames.recv() => match f {
                Some(f) => f,
                None => break,
            },
        };

        let peer = session.audio.lock().peer;
        let Some(peer) = peer else { continue };

        // Encrypt + advance sequence/timestamp under one lock
        let (ciphertext, sequence, timestamp, av_ri_key_id) = {
            let mut audio = session.audio.lock();
            let sequence = audio.sequence;
            let timestamp = audio.timestamp;
            let iv = audio_iv(audio.av_ri_key_id, sequence);
            let ciphertext = match audio.cipher.encrypt(&iv, &frame) {
                Ok(c) => c,
                Err(e) => {
                    warn!("Session {} audio encrypt failed: {}", session.launch_id, e);
                    return;
                }
            };
            audio.sequence = audio.sequence.wrapping_add(1);
            audio.timestamp = audio.timestamp.wrapping_add(timestamp_step);
            (ciphertext, sequence, timestamp, audio.av_ri_key_id)
        };

        let mut datagram = Vec::with_capacity(12 + ciphertext.len());
        RtpHeader {
            payload_type: AUDIO_PAYLOAD_TYPE,
            sequence,
            timestamp,
            ssrc: session.launch_id,
        }
        .write(&mut datagram);
        datagram.extend_from_slice(&ciphertext);
        send_capped(&ctx.audio_sock, &datagram, peer).await;

        // FEC parity rides behind every fourth packet
        match fec.push(&ciphertext, sequence, timestamp) {
            Ok(Some(parity)) => {
                for (i, shard) in parity.shards.iter().enumerate() {
                    let sequence = {
                        let mut audio = session.audio.lock();
                        let s = audio.sequence;
                        audio.sequence = audio.sequence.wrapping_add(1);
                        s
                    };
                    let mut datagram = Vec::with_capacity(24 + shard.len());
                    RtpHeader {
                        payload_type: AUDIO_FEC_PAYLOAD_TYPE,
                        sequence,
                        timestamp: parity.base_timestamp,
                        ssrc: session.launch_id,
                    }
                    .write(&mut datagram);
                    AudioFecHeader {
                        shard_index: i as u8,
                        payload_type: AUDIO_PAYLOAD_TYPE,
                        base_sequence: parity.base_sequence,
                        base_timestamp: parity.base_timestamp,
                        ssrc: av_ri_key_id,
                    }
                    .write(&mut datagram);
                    datagram.extend_from_slice(shard);
                    send_capped(&ctx.audio_sock, &datagram, peer).await;
                }
            }
            Ok(None) => {}
            Err(e) => warn!("Session {} audio FEC failed: {}", session.launch_id, e),
        }
    }
    debug!("Session {} audio sender exited", session.launch_id);
}

// ── Watchdog ──────────────────────────────────────────────────────────────────

/// Drives STARTING→RUNNING once peers are bound and the first ping landed,
/// and enforces the handshake and ping deadlines.
pub async fn run_watchdog(session: Arc<Session>, ctx: Arc<BroadcastContext>) {
    let handshake_deadline = Instant::now()
        + std::time::Duration::from_millis(ctx.settings.handshake_timeout_ms.max(1000));
    let mut shutdown = session.shutdown_watch();
    let mut tick = tokio::time::interval(std::time::Duration::from_millis(100));

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => return,
            _ = tick.tick() => {}
        }

        match session.state() {
            SessionState::Starting => {
                if session.media_peers_bound() && session.got_first_ping() {
                    if session.try_transition(SessionState::Starting, SessionState::Running) {
                        info!("Session {} running", session.launch_id);
                    }
                } else if Instant::now() > handshake_deadline {
                    warn!("Session {} handshake timed out", session.launch_id);
                    crate::session::stop(&session);
                    return;
                }
            }
            SessionState::Running => {
                if Instant::now() > session.ping_deadline() {
                    warn!("Session {} ping timeout", session.launch_id);
                    crate::session::stop(&session);
                    return;
                }
            }
            SessionState::Stopping | SessionState::Stopped => return,
        }
    }
}
