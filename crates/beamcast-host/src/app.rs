//! Host bootstrap: probing, shared contexts, and session raising.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use beamcast_codec::probe_encoders;
use beamcast_codec::ActiveCodecs;
use beamcast_core::{AutoBitrateSettings, CaptureSource, SessionConfig, StreamSettings};
use beamcast_stream::{
    install_default_handlers, lifecycle, AutoBitrateController, BroadcastContext, ControlServer,
    InputBackend, LaunchSession, LoggingCommandRunner, NullInputBackend, Session, SessionRuntime,
    CONTROL_PORT_OFFSET,
};

// ── Settings ──────────────────────────────────────────────────────────────────

/// Host configuration file shape. The config file itself is optional; every
/// field has a default.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostSettings {
    pub base_port: u16,
    pub stream: StreamSettings,
    pub auto_bitrate: AutoBitrateSettings,
    /// Keep going when no encoder passes probing (capture refuses later).
    pub ignore_encoder_probe_failure: bool,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            base_port: 47_989,
            stream: StreamSettings::default(),
            auto_bitrate: AutoBitrateSettings::default(),
            ignore_encoder_probe_failure: false,
        }
    }
}

impl HostSettings {
    pub fn load(path: &str) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Reading config file {path}"))?;
        serde_json::from_str(&raw).with_context(|| format!("Parsing config file {path}"))
    }
}

// ── Host ──────────────────────────────────────────────────────────────────────

pub struct Host {
    pub runtime: SessionRuntime,
    pub active_codecs: ActiveCodecs,
    settings: HostSettings,
}

impl Host {
    /// Probe encoders, bind sockets, install handlers. Call once at startup.
    pub async fn bootstrap(settings: HostSettings, input: Arc<dyn InputBackend>) -> Result<Host> {
        let (encoder, active_codecs) = match probe_encoders(beamcast_codec::candidates()).await {
            Ok(outcome) => outcome,
            Err(e) if settings.ignore_encoder_probe_failure => {
                warn!("Encoder probing failed ({}); capture will refuse to start", e);
                (beamcast_codec::software(), ActiveCodecs::default())
            }
            Err(e) => return Err(e).context("Encoder probing"),
        };

        let broadcast = BroadcastContext::bind(settings.base_port, settings.stream.clone())
            .await
            .context("Binding media sockets")?;

        let control = ControlServer::new(settings.stream.clone());
        control
            .bind(settings.base_port + CONTROL_PORT_OFFSET)
            .await
            .context("Binding control server")?;

        let controller = Arc::new(AutoBitrateController::new(settings.auto_bitrate.clone()));
        install_default_handlers(&control, Arc::clone(&controller), input);

        // The control event loop services all sessions
        {
            let control = Arc::clone(&control);
            tokio::spawn(async move {
                loop {
                    control.iterate(Duration::from_millis(50)).await;
                }
            });
        }

        info!(
            "Host ready on base port {} (hevc={}, av1={})",
            settings.base_port, active_codecs.hevc, active_codecs.av1
        );

        Ok(Host {
            runtime: SessionRuntime {
                broadcast,
                control,
                controller,
                encoder: Arc::new(encoder),
                runner: Arc::new(LoggingCommandRunner),
            },
            active_codecs,
            settings,
        })
    }

    /// Allocate a session from a finished handshake and register it with
    /// the control server, leaving it unclaimed until the client connects.
    pub fn raise(&self, config: SessionConfig, launch: &LaunchSession) -> Result<Arc<Session>> {
        let session = Session::alloc(config, launch).context("Allocating session")?;
        self.runtime.control.add_session(Arc::clone(&session));
        info!(
            "Session {} raised for {} ({})",
            session.launch_id,
            session.device_name(),
            session.device_uuid
        );
        Ok(session)
    }

    /// Wait for the control peer to claim the session, then start it.
    pub async fn start_when_claimed(
        &self,
        session: &Arc<Session>,
        capture: Box<dyn CaptureSource>,
    ) -> Result<()> {
        let deadline = tokio::time::Instant::now()
            + Duration::from_millis(self.settings.stream.handshake_timeout_ms.max(1000));
        while session.control.lock().peer.is_none() {
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!("Client never connected the control stream");
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        lifecycle::start(session, &self.runtime, capture)
            .await
            .context("Starting session")?;
        Ok(())
    }

    /// Stop and tear down every known session.
    pub async fn terminate_sessions(&self) {
        for uuid in self.runtime.control.all_session_uuids() {
            if let Some(session) = self.runtime.control.find_session_by_uuid(&uuid) {
                lifecycle::graceful_stop(&session, &self.runtime).await;
                lifecycle::join(&session, &self.runtime).await;
            }
        }
    }
}

/// Default input backend wiring; the real injector registers itself here
/// when the platform layer is linked in.
pub fn default_input_backend() -> Arc<dyn InputBackend> {
    Arc::new(NullInputBackend)
}
