use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use log::info;

mod config;
mod dispatch;
mod error;
mod manager;
mod messages;
mod mqtt;
mod registry;
mod scheduler;
mod transport;

/// Pushes lifecycle notifications to devices that report their app state over MQTT.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if std::env::var_os("RUST_LOG").is_none() {
        pretty_env_logger::formatted_builder()
            .filter_level(log::LevelFilter::Info)
            .init();
    } else {
        pretty_env_logger::init();
    }

    let cli = Cli::parse();
    let config = config::AppConfig::load(&cli.config)?;
    let settings = config.dispatch_settings();
    info!("Dispatch settings: {:?}", settings);

    let (mqtt_client, eventloop) = mqtt::MqttClient::new(&config.mqtt);
    mqtt_client.subscribe().await?;

    let (scheduler, handle) = scheduler::Scheduler::new(Arc::new(mqtt_client.clone()), settings);

    let core = manager::Manager::new(mqtt_client, eventloop, scheduler, handle);
    core.run_loop().await?;

    Ok(())
}
