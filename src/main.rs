use anyhow::Result;
use clap::Parser;
use kinetic_ble::domain::settings::SettingsService;
use kinetic_ble::infrastructure::bluetooth::btleplug_backend::BtleplugPlatform;
use kinetic_ble::infrastructure::bluetooth::fake::FakePlatform;
use kinetic_ble::infrastructure::bluetooth::{SensorService, SessionConfig};
use kinetic_ble::infrastructure::logging::init_logger;
use kinetic_ble::presentation::{Cli, Commands, SensorApp};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const SIMULATED_PERIOD: Duration = Duration::from_millis(20);

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = match cli.settings {
        Some(path) => SettingsService::open(path),
        None => SettingsService::new()?,
    };

    // Keep the guard alive for the whole run
    let _logging_guard = init_logger(&settings.get().log_settings)?;
    info!("Starting kinetic_ble");

    let config = SessionConfig::from_settings(settings.get())?;
    let (sensor, events) = if cli.simulate {
        info!("Using simulated sensor");
        SensorService::spawn(Arc::new(FakePlatform::simulated(SIMULATED_PERIOD)), config)
    } else {
        SensorService::spawn(Arc::new(BtleplugPlatform::new().await?), config)
    };

    let mut app = SensorApp::new(settings, sensor, events);
    let result = match cli.command {
        Commands::Scan => app.scan().await.map(|_| ()),
        Commands::Stream {
            device,
            seconds,
            record,
        } => app.stream(device, seconds, record.as_deref()).await,
    };

    app.shutdown().await;
    result
}
