//! Video send path over a real UDP socket: packetization, FEC geometry,
//! per-shard encryption, and sequence ordering as a client would see them.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use beamcast_core::{Permissions, SessionConfig, StreamSettings, VideoPacket};
use beamcast_crypto::GcmCipher;
use beamcast_stream::broadcast::{run_video_sender, BroadcastContext};
use beamcast_stream::protocol::video_iv;
use beamcast_stream::rtp::{RtpHeader, VideoShardHeader, VIDEO_FLAG_IDR};
use beamcast_stream::{LaunchSession, Session};

fn launch_session() -> LaunchSession {
    LaunchSession {
        id: 21,
        gcm_key: vec![0x5a; 16],
        iv: (64u8..80).collect(),
        av_ping_payload: "MEDIA-PING-0021".into(),
        control_connect_data: 0x2222_3333,
        device_name: "media-test".into(),
        device_uuid: "99999999-8888-7777-6666-555555555555".into(),
        permissions: Permissions::ALL,
        input_only: false,
        host_audio: false,
        auto_bitrate_enabled: false,
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
        do_cmds: Vec::new(),
        undo_cmds: Vec::new(),
    }
}

#[tokio::test]
async fn video_shards_arrive_ordered_encrypted_and_fec_protected() {
    let base_port = 47_830;
    let ctx = BroadcastContext::bind(base_port, StreamSettings::default()).await.unwrap();

    let mut config = SessionConfig::default();
    config.packet_size = 512;
    config.min_required_fec_packets = 2;
    config.encryption_flags_enabled = 1;
    let launch = launch_session();
    let session = Session::alloc(config, &launch).unwrap();

    // The "client": a local UDP socket whose address we bind as the peer
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    session.video.lock().peer = Some(client.local_addr().unwrap());

    let (packets_tx, packets_rx) = mpsc::channel::<VideoPacket>(8);
    tokio::spawn(run_video_sender(Arc::clone(&session), ctx, packets_rx));

    // Two frames: 600 bytes (2 fragments) then 100 bytes (1 fragment)
    let frame_a = VideoPacket::new(vec![0xabu8; 600], 0, true);
    let frame_b = VideoPacket::new(vec![0xcdu8; 100], 1, false);
    packets_tx.send(frame_a).await.unwrap();
    packets_tx.send(frame_b).await.unwrap();

    // Frame A: 2 data shards + parity ≥ 2; frame B: 1 + 2
    let mut datagrams = Vec::new();
    for _ in 0..7 {
        let mut buf = [0u8; 2048];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .expect("datagram missing")
            .unwrap();
        datagrams.push(buf[..len].to_vec());
    }

    // Sequence numbers strictly increase from the session's low watermark
    let mut counter = 0u64;
    let cipher = GcmCipher::new(&launch.gcm_key).unwrap();
    let mut iv_seed = [0u8; 12];
    iv_seed.copy_from_slice(&launch.iv[..12]);

    let mut frame_a_shards: Vec<Vec<u8>> = Vec::new();
    for (i, datagram) in datagrams.iter().enumerate() {
        let rtp = RtpHeader::parse(datagram).expect("valid RTP header");
        assert_eq!(rtp.sequence, i as u16, "sequence must be monotonic");
        assert_eq!(rtp.ssrc, 21);

        // Decrypt with the per-shard IV (seed XOR big-endian counter)
        let plaintext = cipher
            .decrypt(&video_iv(&iv_seed, counter), &datagram[12..])
            .expect("tag must verify");
        counter += 1;

        let shard = VideoShardHeader::parse(&plaintext).expect("shard header");
        if shard.frame_index == 0 {
            assert_eq!(shard.data_shards, 2);
            assert!(shard.parity_shards >= 2);
            assert_ne!(shard.flags & VIDEO_FLAG_IDR, 0);
            frame_a_shards.push(plaintext[12..].to_vec());
        } else {
            assert_eq!(shard.frame_index, 1);
            assert_eq!(shard.flags & VIDEO_FLAG_IDR, 0);
        }
    }

    // Frame A's first data shard carries the original payload bytes
    assert_eq!(&frame_a_shards[0][..512], &[0xabu8; 512][..]);
    // Parity differs from data (i.e. real coding happened)
    let parity = &frame_a_shards[2];
    assert_ne!(&parity[..], &frame_a_shards[0][..]);

    // Frame index is non-decreasing across the stream: frame 0 shards all
    // precede frame 1 shards
    assert_eq!(frame_a_shards.len(), 4);
}
