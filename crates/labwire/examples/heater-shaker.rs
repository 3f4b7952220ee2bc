//! Drives a heater-shaker module over its serial node.
//!
//! Run with:
//!   cargo run -p labwire --example heater-shaker -- /dev/ttyACM0 [settings.json]
//!
//! Configure the port first, e.g. `stty -F /dev/ttyACM0 115200 raw -echo`.

use std::sync::Arc;
use std::time::Duration;

use labwire::peer::{open_device, Command, CommandPolicy, LineProtocol};
use labwire::Settings;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(1);
    let device = args.next().unwrap_or_else(|| "/dev/ttyACM0".to_string());
    let settings = match args.next() {
        Some(path) => Settings::from_file(path)?,
        None => Settings::default(),
    };
    settings.logging.init();

    let registry = Arc::new(settings.marshal_registry()?);
    let module = open_device(&device, LineProtocol::heater_shaker(), settings.device_config(), registry).await?;

    let info = module.call(Command::new("GET_INFO")).await?;
    eprintln!("device info: {}", info.into_value());

    module
        .call(Command::new("SET_TEMP").arg("S", 37.0).precision(2))
        .await?;
    module.call(Command::new("SET_RPM").arg("S", 500)).await?;

    let homing = CommandPolicy::new(Duration::from_secs(30), 1);
    for _ in 0..3 {
        let temp = module.call(Command::new("GET_TEMP")).await?;
        let rpm = module.call(Command::new("GET_RPM")).await?;
        eprintln!("{} | {}", temp.into_value(), rpm.into_value());
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    module.call(Command::new("DEACTIVATE_HEATER")).await?;
    module.call(Command::new("HOME_PLATE").policy(homing)).await?;
    module.close().await;
    Ok(())
}
