//! Thin host binary: loads configuration, builds the production
//! [`Services`] bundle, assembles a [`Device`] over a transport, and runs
//! forever. The real MQTT client and platform audio I/O are out of scope
//! (spec §1) — wiring them in is the platform integration layer's job, not
//! this crate's; this binary exists so the library has a runnable shell.

use std::sync::Arc;
use std::time::Duration;

use aia_client::config::DeviceConfig;
use aia_client::device::Device;
use aia_client::mqtt::ChannelMqttTransport;
use aia_client::services::Services;
use anyhow::{Context, Result};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => DeviceConfig::load(&path).with_context(|| format!("loading device config from {path}"))?,
        None => {
            tracing::info!("no config path given, using defaults");
            DeviceConfig::default()
        }
    };

    // A real deployment hands in an MQTT client and a PortAudio/Opus sink;
    // both are out of scope (spec §1). The in-memory transport keeps this
    // binary runnable standalone.
    let (transport, inbound) = ChannelMqttTransport::new();
    let transport = Arc::new(transport);
    let services = Arc::new(Services::production());
    let play_pcm: Arc<aia_client::managers::speaker::PlayPcmCallback> = Arc::new(|_pcm: &[u8]| {});

    let device = Device::new(config, transport, services, play_pcm);
    device.connect()?;
    device.capabilities.publish(vec!["speaker".to_string(), "microphone".to_string(), "alerts".to_string()])?;

    tracing::info!("device assembled, idling");
    loop {
        if let Ok(published) = inbound.recv_timeout(Duration::from_secs(5)) {
            tracing::debug!(topic = %published.topic, bytes = published.payload.len(), "outbound publish (loopback transport)");
        }
    }
}
