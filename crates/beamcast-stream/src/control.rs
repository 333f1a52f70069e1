//! Control server: the reliable, encrypted, ordered message bus between the
//! host and its peers.
//!
//! Reliability and ordering come from the TCP transport; confidentiality
//! from the per-frame AES-GCM envelope ([`protocol::PACKET_TYPE_ENCRYPTED`]).
//! Decrypted envelopes re-enter [`ControlServer::call`] with
//! `reinjected = true`, so handlers only ever see plaintext.
//!
//! Handlers run on the iterate task and must not block; anything long is
//! posted onto the session's channels.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use beamcast_core::{ControlError, HdrInfo, StreamSettings};

use crate::auto_bitrate::AutoBitrateController;
use crate::input_relay::{self, InputBackend};
use crate::protocol::{self, BitrateStats, LossStats};
use crate::session::{Session, SessionState};

/// Tag failures tolerated per session inside [`CRYPTO_FAILURE_WINDOW`]
/// before the session is dropped.
const CRYPTO_FAILURE_CAP: u32 = 5;
const CRYPTO_FAILURE_WINDOW: Duration = Duration::from_secs(10);

type Handler = Arc<dyn Fn(&ControlServer, &Arc<Session>, &[u8]) + Send + Sync>;

enum ControlEvent {
    Connect(SocketAddr),
    Disconnect(SocketAddr),
    Receive(SocketAddr, Vec<u8>),
}

// ── ControlServer ─────────────────────────────────────────────────────────────

pub struct ControlServer {
    settings: StreamSettings,
    handlers: Mutex<HashMap<u16, Handler>>,
    sessions: Mutex<Vec<Arc<Session>>>,
    peer_map: Mutex<HashMap<SocketAddr, Arc<Session>>>,
    peer_writers: Mutex<HashMap<SocketAddr, mpsc::Sender<Vec<u8>>>>,
    events_tx: mpsc::Sender<ControlEvent>,
    events_rx: tokio::sync::Mutex<mpsc::Receiver<ControlEvent>>,
    crypto_failures: Mutex<HashMap<u32, (Instant, u32)>>,
}

impl ControlServer {
    pub fn new(settings: StreamSettings) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::channel(1024);
        Arc::new(Self {
            settings,
            handlers: Mutex::new(HashMap::new()),
            sessions: Mutex::new(Vec::new()),
            peer_map: Mutex::new(HashMap::new()),
            peer_writers: Mutex::new(HashMap::new()),
            events_tx,
            events_rx: tokio::sync::Mutex::new(events_rx),
            crypto_failures: Mutex::new(HashMap::new()),
        })
    }

    /// Bind the reliable transport and start accepting peers.
    pub async fn bind(self: &Arc<Self>, port: u16) -> Result<(), ControlError> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        info!("Control server listening on {}", listener.local_addr()?);
        let server = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => server.accept_peer(stream, peer),
                    Err(e) => {
                        warn!("Control accept failed: {}", e);
                        return;
                    }
                }
            }
        });
        Ok(())
    }

    fn accept_peer(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("set_nodelay({}): {}", peer, e);
        }
        let (mut reader, mut writer) = stream.into_split();
        let (write_tx, mut write_rx) = mpsc::channel::<Vec<u8>>(256);
        self.peer_writers.lock().insert(peer, write_tx);
        let _ = self.events_tx.try_send(ControlEvent::Connect(peer));

        // Writer task: drains the per-peer queue.
        tokio::spawn(async move {
            while let Some(frame) = write_rx.recv().await {
                if writer.write_all(&frame).await.is_err() {
                    return;
                }
            }
        });

        // Reader task: reframes the byte stream into control frames.
        let server = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let mut header = [0u8; 4];
                if reader.read_exact(&mut header).await.is_err() {
                    break;
                }
                let len = u16::from_le_bytes([header[2], header[3]]) as usize;
                if len > protocol::MAX_PAYLOAD {
                    warn!("Peer {} sent an oversized control frame ({} bytes)", peer, len);
                    break;
                }
                let mut frame = vec![0u8; 4 + len];
                frame[..4].copy_from_slice(&header);
                if reader.read_exact(&mut frame[4..]).await.is_err() {
                    break;
                }
                if server
                    .events_tx
                    .send(ControlEvent::Receive(peer, frame))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            let _ = server.events_tx.try_send(ControlEvent::Disconnect(peer));
        });
    }

    // ── Session registry ─────────────────────────────────────────────────────

    pub fn add_session(&self, session: Arc<Session>) {
        self.sessions.lock().push(session);
    }

    pub fn remove_session(&self, session: &Arc<Session>) {
        self.sessions.lock().retain(|s| s.launch_id != session.launch_id);
        self.peer_map.lock().retain(|_, s| s.launch_id != session.launch_id);
        self.crypto_failures.lock().remove(&session.launch_id);
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn find_session_by_uuid(&self, uuid: &str) -> Option<Arc<Session>> {
        self.sessions.lock().iter().find(|s| s.uuid_matches(uuid)).cloned()
    }

    pub fn all_session_uuids(&self) -> Vec<String> {
        self.sessions.lock().iter().map(|s| s.device_uuid.clone()).collect()
    }

    /// Session for this peer. A hit in the peer map is O(1); otherwise the
    /// first unclaimed session (no expected peer yet) whose `connect_data`
    /// matches is claimed and bound.
    pub fn get_session(&self, peer: SocketAddr, connect_data: u32) -> Option<Arc<Session>> {
        if let Some(session) = self.peer_map.lock().get(&peer) {
            return Some(Arc::clone(session));
        }

        let sessions = self.sessions.lock();
        for session in sessions.iter() {
            let mut control = session.control.lock();
            let claim = match control.expected_peer {
                None => control.connect_data == connect_data,
                // Legacy clients: match on address, any connect data.
                Some(expected) => expected.ip() == peer.ip() && control.peer.is_none(),
            };
            if claim {
                control.expected_peer = Some(peer);
                control.peer = Some(peer);
                drop(control);
                self.peer_map.lock().insert(peer, Arc::clone(session));
                info!("Session {} claimed by control peer {}", session.launch_id, peer);
                return Some(Arc::clone(session));
            }
        }
        None
    }

    // ── Handler table ────────────────────────────────────────────────────────

    pub fn map(
        &self,
        msg_type: u16,
        handler: impl Fn(&ControlServer, &Arc<Session>, &[u8]) + Send + Sync + 'static,
    ) {
        self.handlers.lock().insert(msg_type, Arc::new(handler));
    }

    /// Dispatch one message. Encrypted envelopes decrypt and re-enter with
    /// `reinjected = true`; unknown types log and are ignored.
    pub fn call(&self, msg_type: u16, session: &Arc<Session>, payload: &[u8], reinjected: bool) {
        if msg_type == protocol::PACKET_TYPE_ENCRYPTED && !reinjected {
            match self.decrypt_envelope(session, payload) {
                Ok(plaintext) => match protocol::decode_frame(&plaintext) {
                    Ok((inner_type, inner_payload)) => {
                        self.call(inner_type, session, inner_payload, true)
                    }
                    Err(e) => debug!("Bad inner control frame: {}", e),
                },
                Err(_) => self.note_crypto_failure(session),
            }
            return;
        }

        let handler = self.handlers.lock().get(&msg_type).cloned();
        match handler {
            Some(handler) => handler(self, session, payload),
            None => trace!("Unhandled control type 0x{:04x}", msg_type),
        }
    }

    fn decrypt_envelope(&self, session: &Arc<Session>, payload: &[u8]) -> Result<Vec<u8>, ControlError> {
        if payload.len() < 4 {
            return Err(ControlError::Truncated { len: payload.len() });
        }
        let seq = u32::from_le_bytes(payload[0..4].try_into().unwrap());
        let mut control = session.control.lock();
        let iv = protocol::control_iv(&control.incoming_iv, seq);
        let plaintext = control
            .cipher
            .decrypt(&iv, &payload[4..])
            .map_err(|_| ControlError::DecryptFailed)?;
        control.incoming_seq = control.incoming_seq.max(seq);
        Ok(plaintext)
    }

    fn note_crypto_failure(&self, session: &Arc<Session>) {
        let mut failures = self.crypto_failures.lock();
        let now = Instant::now();
        let entry = failures.entry(session.launch_id).or_insert((now, 0));
        if now.duration_since(entry.0) > CRYPTO_FAILURE_WINDOW {
            *entry = (now, 0);
        }
        entry.1 += 1;
        let count = entry.1;
        drop(failures);

        debug!("Session {}: control tag failure #{}", session.launch_id, count);
        if count > CRYPTO_FAILURE_CAP {
            warn!(
                "Session {}: dropping after repeated control decrypt failures",
                session.launch_id
            );
            crate::session::stop(session);
        }
    }

    // ── Outbound ─────────────────────────────────────────────────────────────

    /// Queue one already-framed payload to a peer.
    pub fn send(&self, frame: Vec<u8>, peer: SocketAddr) -> Result<(), ControlError> {
        let writers = self.peer_writers.lock();
        let Some(tx) = writers.get(&peer) else {
            return Err(ControlError::UnknownSession);
        };
        tx.try_send(frame).map_err(|_| ControlError::Backpressure)
    }

    /// Encrypt and send one control message to the session's peer.
    pub fn send_encrypted(
        &self,
        session: &Arc<Session>,
        msg_type: u16,
        payload: &[u8],
    ) -> Result<(), ControlError> {
        let inner = protocol::encode_frame(msg_type, payload);
        let (peer, envelope) = {
            let mut control = session.control.lock();
            let Some(peer) = control.peer else {
                return Err(ControlError::UnknownSession);
            };
            let seq = control.seq;
            control.seq = control.seq.wrapping_add(1);
            let iv = protocol::control_iv(&control.outgoing_iv, seq);
            let ciphertext = control
                .cipher
                .encrypt(&iv, &inner)
                .map_err(|_| ControlError::DecryptFailed)?;
            let mut envelope = Vec::with_capacity(4 + ciphertext.len());
            envelope.extend_from_slice(&seq.to_le_bytes());
            envelope.extend_from_slice(&ciphertext);
            (peer, envelope)
        };
        self.send(protocol::encode_frame(protocol::PACKET_TYPE_ENCRYPTED, &envelope), peer)
    }

    /// Outbound queues drain continuously on the writer tasks; `flush` is
    /// kept for contract parity and yields so queued writes get a chance.
    pub async fn flush(&self) {
        tokio::task::yield_now().await;
    }

    // ── Event loop ───────────────────────────────────────────────────────────

    /// Service queued transport events for up to `timeout`.
    pub async fn iterate(self: &Arc<Self>, timeout: Duration) {
        let mut events = self.events_rx.lock().await;
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let event = tokio::select! {
                e = events.recv() => match e {
                    Some(e) => e,
                    None => return,
                },
                _ = tokio::time::sleep_until(deadline) => return,
            };
            drop(events);
            self.handle_event(event);
            events = self.events_rx.lock().await;
        }
    }

    fn handle_event(self: &Arc<Self>, event: ControlEvent) {
        match event {
            ControlEvent::Connect(peer) => debug!("Control peer connected: {}", peer),
            ControlEvent::Disconnect(peer) => {
                debug!("Control peer disconnected: {}", peer);
                self.peer_writers.lock().remove(&peer);
                let session = self.peer_map.lock().remove(&peer);
                if let Some(session) = session {
                    // Control end-of-stream takes the whole session down.
                    if matches!(session.state(), SessionState::Starting | SessionState::Running) {
                        info!("Session {}: control stream ended", session.launch_id);
                        crate::session::stop(&session);
                    }
                }
            }
            ControlEvent::Receive(peer, frame) => {
                let (msg_type, payload) = match protocol::decode_frame(&frame) {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        debug!("Bad control frame from {}: {}", peer, e);
                        return;
                    }
                };
                // First frame from an unknown peer carries connect data in
                // its leading four payload bytes.
                let connect_data = payload
                    .get(0..4)
                    .map(|b| u32::from_le_bytes(b.try_into().unwrap()))
                    .unwrap_or(0);
                let Some(session) = self.get_session(peer, connect_data) else {
                    trace!("No session for control peer {}", peer);
                    return;
                };
                self.call(msg_type, &session, payload, false);
            }
        }
    }
}

// ── Default handler table ─────────────────────────────────────────────────────

/// Install the standard Gen7+ handler set.
pub fn install_default_handlers(
    server: &Arc<ControlServer>,
    controller: Arc<AutoBitrateController>,
    input: Arc<dyn InputBackend>,
) {
    let ping_timeout = Duration::from_millis(server.settings.ping_timeout_ms.max(1000));
    server.map(protocol::PACKET_TYPE_PING, move |srv, session, _payload| {
        session.refresh_ping_deadline(ping_timeout);
        if let Err(e) = srv.send_encrypted(session, protocol::PACKET_TYPE_PING, &[]) {
            trace!("Ping echo failed: {}", e);
        }
    });

    server.map(protocol::PACKET_TYPE_IDR_REQUEST, |_, session, _payload| {
        debug!("Session {}: client requested IDR", session.launch_id);
        session.raise_idr();
    });

    server.map(
        protocol::PACKET_TYPE_INVALIDATE_REF_FRAMES,
        |_, session, payload| match protocol::parse_invalidate_ref_frames(payload) {
            Some((first, last)) => session.raise_invalidate_refs(first, last),
            None => debug!("Malformed INVALIDATE_REF_FRAMES"),
        },
    );

    server.map(protocol::PACKET_TYPE_HDR_INFO, |_, session, payload| {
        if let Some(info) = HdrInfo::decode(payload) {
            session.push_hdr(info);
        }
    });

    {
        let input = Arc::clone(&input);
        server.map(protocol::PACKET_TYPE_INPUT_DATA, move |_, session, payload| {
            input_relay::relay_input(session, input.as_ref(), payload);
        });
    }

    {
        let controller = Arc::clone(&controller);
        server.map(protocol::PACKET_TYPE_LOSS_STATS, move |srv, session, payload| {
            let Some(stats) = protocol::parse_loss_stats(payload) else {
                debug!("Malformed LOSS_STATS");
                return;
            };
            handle_loss_stats(srv, session, &controller, stats);
        });
    }

    {
        let controller = Arc::clone(&controller);
        server.map(
            protocol::PACKET_TYPE_CONNECTION_STATUS,
            move |_, session, payload| {
                if let Some(status) = protocol::parse_connection_status(payload) {
                    controller.process_connection_status(session, status);
                }
            },
        );
    }

    server.map(protocol::PACKET_TYPE_TERMINATION, |_, session, _payload| {
        info!("Session {}: client requested termination", session.launch_id);
        crate::session::stop(session);
    });
}

fn handle_loss_stats(
    server: &ControlServer,
    session: &Arc<Session>,
    controller: &AutoBitrateController,
    stats: LossStats,
) {
    controller.process_loss_stats_report(
        session,
        stats.count,
        stats.last_good_frame,
        stats.time_interval_ms,
    );

    // Host-side connection status egress: severe inferred loss reads POOR.
    if let Some(snapshot) = controller.get_stats(session) {
        let status = if snapshot.loss_percentage > controller.settings().loss_severe_pct as f32 {
            protocol::CONNECTION_STATUS_POOR
        } else {
            protocol::CONNECTION_STATUS_OKAY
        };
        let prev = session
            .last_sent_connection_status
            .swap(status as i32, std::sync::atomic::Ordering::AcqRel);
        if prev != status as i32 {
            let _ = server.send_encrypted(
                session,
                protocol::PACKET_TYPE_CONNECTION_STATUS,
                &[status],
            );
        }

        // Periodic BITRATE_STATS egress
        let interval = controller.settings().stats_interval_packets.max(1);
        let seen = session
            .stats_counter
            .fetch_add(1, std::sync::atomic::Ordering::AcqRel)
            + 1;
        if seen >= interval {
            session.stats_counter.store(0, std::sync::atomic::Ordering::Release);
            emit_bitrate_stats(server, session, snapshot);
        }
    }
}

fn emit_bitrate_stats(server: &ControlServer, session: &Arc<Session>, stats: BitrateStats) {
    if let Err(e) =
        server.send_encrypted(session, protocol::PACKET_TYPE_BITRATE_STATS, &stats.encode())
    {
        trace!("BITRATE_STATS send failed: {}", e);
    }
}

// ── Graceful stop ─────────────────────────────────────────────────────────────

/// Send the final termination message, give the client a moment to
/// acknowledge by disconnecting, then stop.
pub async fn graceful_stop(server: &Arc<ControlServer>, session: &Arc<Session>, code: u32) {
    let _ = server.send_encrypted(session, protocol::PACKET_TYPE_TERMINATION, &code.to_le_bytes());
    server.flush().await;

    let peer = session.control.lock().peer;
    if let Some(peer) = peer {
        for _ in 0..10 {
            if !server.peer_map.lock().contains_key(&peer) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
    crate::session::stop(session);
}

#[cfg(test)]
mod tests {
    use super::*;
    use beamcast_core::SessionConfig;

    use crate::launch::test_launch_session;

    fn server() -> Arc<ControlServer> {
        ControlServer::new(StreamSettings::default())
    }

    fn session() -> Arc<Session> {
        Session::alloc(SessionConfig::default(), &test_launch_session()).unwrap()
    }

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn unclaimed_session_is_claimed_by_connect_data() {
        let srv = server();
        let s = session();
        srv.add_session(Arc::clone(&s));

        // Wrong connect data → no claim
        assert!(srv.get_session(addr(5000), 0x1111).is_none());
        // Matching connect data claims and binds
        let claimed = srv.get_session(addr(5000), 0xdead_beef).unwrap();
        assert_eq!(claimed.launch_id, s.launch_id);
        assert_eq!(s.control.lock().expected_peer, Some(addr(5000)));

        // Follow-up lookups hit the peer map regardless of connect data
        assert!(srv.get_session(addr(5000), 0).is_some());
        // A different peer cannot steal the claimed session
        assert!(srv.get_session(addr(5001), 0xdead_beef).is_none());
    }

    #[test]
    fn encrypted_envelope_reinjects_plaintext() {
        let srv = server();
        let s = session();

        let seen: Arc<Mutex<Vec<(u16, Vec<u8>)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        srv.map(protocol::PACKET_TYPE_IDR_REQUEST, move |_, _, payload| {
            sink.lock().push((protocol::PACKET_TYPE_IDR_REQUEST, payload.to_vec()));
        });

        // Build a client→host envelope with the session's incoming IV seed
        let inner = protocol::encode_frame(protocol::PACKET_TYPE_IDR_REQUEST, &[9, 9]);
        let envelope = {
            let control = s.control.lock();
            let iv = protocol::control_iv(&control.incoming_iv, 0);
            let ciphertext = control.cipher.encrypt(&iv, &inner).unwrap();
            let mut out = 0u32.to_le_bytes().to_vec();
            out.extend_from_slice(&ciphertext);
            out
        };

        srv.call(protocol::PACKET_TYPE_ENCRYPTED, &s, &envelope, false);
        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].1, vec![9, 9]);
    }

    #[test]
    fn repeated_tag_failures_drop_the_session() {
        let srv = server();
        let s = session();
        s.set_state(SessionState::Running);

        let garbage = {
            let mut buf = 0u32.to_le_bytes().to_vec();
            buf.extend_from_slice(&[0u8; 32]);
            buf
        };
        for _ in 0..=CRYPTO_FAILURE_CAP {
            srv.call(protocol::PACKET_TYPE_ENCRYPTED, &s, &garbage, false);
        }
        assert_eq!(s.state(), SessionState::Stopping);
    }

    #[test]
    fn unknown_types_are_ignored() {
        let srv = server();
        let s = session();
        // Must not panic or change state
        srv.call(0x7777, &s, &[1, 2, 3], false);
        assert_eq!(s.state(), SessionState::Stopped);
    }

    #[test]
    fn loss_stats_handler_drives_controller_and_egress_counter() {
        let srv = server();
        let s = session();
        let controller = Arc::new(AutoBitrateController::new(Default::default()));
        install_default_handlers(&srv, Arc::clone(&controller), Arc::new(input_relay::NullInputBackend));

        let mut payload = [0u8; 32];
        payload[4..8].copy_from_slice(&50u32.to_le_bytes());
        payload[12..20].copy_from_slice(&100u64.to_le_bytes());
        srv.call(protocol::PACKET_TYPE_LOSS_STATS, &s, &payload, true);

        let stats = controller.get_stats(&s).unwrap();
        assert_eq!(stats.loss_percentage, 0.0); // first report
        assert_eq!(s.stats_counter.load(std::sync::atomic::Ordering::Acquire), 1);
    }
}
