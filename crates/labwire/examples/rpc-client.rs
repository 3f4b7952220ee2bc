//! Calls the `rpc-server` example.
//!
//! Run with:
//!   cargo run -p labwire --example rpc-client -- <socket path>

use std::sync::Arc;

use labwire::logging::{init_logging, LogFormat, LogLevel};
use labwire::marshal::lab::{self, Mount, Point};
use labwire::peer::{connect, Command, ConnectionConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging(LogFormat::Text, LogLevel::Info);

    let path = std::env::args().nth(1).ok_or("usage: rpc-client <socket path>")?;
    let registry = Arc::new(lab::standard_registry()?);
    let client = connect(&path, ConnectionConfig::json_rpc(), Arc::clone(&registry)).await?;

    let homed = client.call(Command::new("home")).await?;
    eprintln!("homed: {}", homed.into_value());

    let reply = client
        .call(
            Command::new("move_to")
                .typed_arg("mount", lab::MOUNT, Mount::Right)
                .typed_arg("abs_position", lab::POINT, Point::new(120.5, 80.0, 42.0)),
        )
        .await?;
    let reached: Point = reply.decode_as(&registry, lab::POINT.as_str())?;
    eprintln!("reached {reached:?}");

    let instruments = client.call(Command::new("attached_instruments")).await?;
    eprintln!("instruments: {}", instruments.into_value());

    client.close().await;
    Ok(())
}
