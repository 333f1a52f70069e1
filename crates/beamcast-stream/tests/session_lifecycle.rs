//! End-to-end session lifecycle over real sockets (no encoder required:
//! input-only sessions skip the video pipeline).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use beamcast_core::{
    CommandEntry, Permissions, SessionConfig, SolidColorSource, StreamSettings,
};
use beamcast_stream::{
    install_default_handlers, lifecycle, protocol, AutoBitrateController, BroadcastContext,
    ControlServer, LaunchSession, LoggingCommandRunner, NullInputBackend, Session, SessionRuntime,
    SessionState,
};

fn launch_session() -> LaunchSession {
    LaunchSession {
        id: 7,
        gcm_key: vec![0x24; 16],
        iv: (16u8..32).collect(),
        av_ping_payload: "INTEG-PING-0007".into(),
        control_connect_data: 0x0bad_cafe,
        device_name: "integration".into(),
        device_uuid: "11111111-2222-3333-4444-555555555555".into(),
        permissions: Permissions::ALL,
        input_only: false,
        host_audio: false,
        auto_bitrate_enabled: true,
        auto_bitrate_min_kbps: 0,
        auto_bitrate_max_kbps: 0,
        width: 1280,
        height: 720,
        fps: 60,
        gamepad_mask: 0,
        surround_info: 0,
        surround_params: String::new(),
        enable_hdr: false,
        enable_sops: false,
        virtual_display: false,
        scale_factor: 100,
        rtsp_cipher: None,
        rtsp_url_scheme: "rtsp://".into(),
        rtsp_iv_counter: 0,
        do_cmds: vec![CommandEntry { cmd: "echo pre".into(), elevated: false }],
        undo_cmds: vec![CommandEntry { cmd: "echo post".into(), elevated: false }],
    }
}

async fn runtime(base_port: u16) -> SessionRuntime {
    let settings = StreamSettings::default();
    let broadcast = BroadcastContext::bind(base_port, settings.clone()).await.unwrap();
    let control = ControlServer::new(settings);
    let controller = Arc::new(AutoBitrateController::new(Default::default()));
    install_default_handlers(&control, Arc::clone(&controller), Arc::new(NullInputBackend));
    SessionRuntime {
        broadcast,
        control,
        controller,
        encoder: Arc::new(beamcast_codec::software()),
        runner: Arc::new(LoggingCommandRunner),
    }
}

async fn wait_for_state(session: &Arc<Session>, state: SessionState, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if session.state() == state {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    session.state() == state
}

#[tokio::test]
async fn input_only_session_runs_and_stops() {
    let rt = runtime(47_800).await;

    let mut config = SessionConfig::default();
    config.video.input_only = true;
    let launch = launch_session();
    let session = Session::alloc(config, &launch).unwrap();
    rt.control.add_session(Arc::clone(&session));

    // The control peer claims the unclaimed session by connect data
    let peer: SocketAddr = "127.0.0.1:40001".parse().unwrap();
    let claimed = rt.control.get_session(peer, launch.control_connect_data).unwrap();
    assert_eq!(claimed.launch_id, session.launch_id);

    lifecycle::start(&session, &rt, Box::new(SolidColorSource::new(640, 360, 30)))
        .await
        .unwrap();
    assert_eq!(session.state(), SessionState::Starting);

    // First ping flips the watchdog's gate
    rt.control.call(protocol::PACKET_TYPE_PING, &session, &[], true);
    assert!(wait_for_state(&session, SessionState::Running, Duration::from_secs(2)).await);

    lifecycle::stop(&session);
    lifecycle::join(&session, &rt).await;
    assert_eq!(session.state(), SessionState::Stopped);
    assert_eq!(rt.control.session_count(), 0);
}

#[tokio::test]
async fn start_requires_a_bound_control_peer() {
    let rt = runtime(47_810).await;
    let session = Session::alloc(SessionConfig::default(), &launch_session()).unwrap();
    let err = lifecycle::start(&session, &rt, Box::new(SolidColorSource::new(640, 360, 30))).await;
    assert!(err.is_err());
    assert_eq!(session.state(), SessionState::Stopped);
}

#[tokio::test]
async fn media_peers_are_learned_from_pings() {
    let rt = runtime(47_820).await;
    let launch = launch_session();
    let session = Session::alloc(SessionConfig::default(), &launch).unwrap();
    rt.broadcast.register(&session);

    let client = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client
        .send_to(launch.av_ping_payload.as_bytes(), ("127.0.0.1", 47_820 + 9))
        .await
        .unwrap();
    client
        .send_to(launch.av_ping_payload.as_bytes(), ("127.0.0.1", 47_820 + 11))
        .await
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline && !session.media_peers_bound() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(session.media_peers_bound());
    assert_eq!(
        session.video.lock().peer.map(|p| p.ip()),
        Some(client.local_addr().unwrap().ip())
    );
}
