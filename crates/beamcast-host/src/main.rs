//! Beamcast host — the streaming core process.
//!
//! Probes the machine's encoders, binds the media and control sockets, and
//! waits for the external pairing/RTSP layer to raise launch sessions.
//!
//! | Env var            | Meaning                                   |
//! |--------------------|-------------------------------------------|
//! | `BEAMCAST_CONFIG`  | Path to the JSON settings file (optional) |
//! | `RUST_LOG`         | tracing filter (default `info`)           |

mod app;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

use app::{default_input_backend, Host, HostSettings};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    info!("Beamcast host v{}", env!("CARGO_PKG_VERSION"));

    // GStreamer must come up before any probe or encode session
    gstreamer::init()?;

    let settings = match std::env::var("BEAMCAST_CONFIG") {
        Ok(path) => HostSettings::load(&path)?,
        Err(_) => HostSettings::default(),
    };

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    runtime.block_on(run(settings))
}

async fn run(settings: HostSettings) -> Result<()> {
    let host = Host::bootstrap(settings, default_input_backend()).await?;

    // Sessions arrive from the external pairing/RTSP layer through
    // Host::raise; this process just keeps the lights on until told to go.
    tokio::signal::ctrl_c().await?;
    info!("Shutting down, terminating sessions");
    host.terminate_sessions().await;
    Ok(())
}
