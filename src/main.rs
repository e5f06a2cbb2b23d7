use energy_meter::config::Config;
use energy_meter::connection::ConnectionManager;
use energy_meter::device::Device;
use energy_meter::link::ResolverLink;
use energy_meter::mqtt::{MqttTransport, TlsMaterial};
use energy_meter::sensor::SysfsAnalogInput;
use energy_meter::time_sync::{SntpClient, TimeSync};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), anyhow::Error> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let cfg_path =
        std::env::var("APP_CONFIG").unwrap_or_else(|_| "config/config.example.yaml".into());
    let cfg = Config::load(&cfg_path)?;
    info!(
        thing = %cfg.device.thing_name,
        broker = %format!("{}:{}", cfg.mqtt.host, cfg.mqtt.port),
        topic = %cfg.mqtt.publish_topic,
        track_watt_hours = cfg.energy.track_watt_hours,
        "loaded config"
    );

    let tls = cfg.mqtt.tls.as_ref().map(TlsMaterial::load).transpose()?;
    if tls.is_none() {
        warn!("no TLS material configured; broker session will not use a client certificate");
    }

    let link = ResolverLink::new(cfg.mqtt.host.clone(), cfg.mqtt.port);
    let transport = MqttTransport::new(
        &cfg.mqtt,
        Duration::from_millis(cfg.connection.connect_timeout_ms),
    );
    let connection = ConnectionManager::new(link, transport, &cfg, tls);
    let time = TimeSync::new(SntpClient::from_config(&cfg.time), &cfg.time);
    let input = SysfsAnalogInput::new(&cfg.device.adc_path);

    let mut device = Device::new(&cfg, input, time, connection);
    let outcome = device.start().await?;
    info!(?outcome, "startup complete");

    device
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "cannot listen for ctrl-c; running until killed");
                std::future::pending::<()>().await;
            }
        })
        .await;

    Ok(())
}
