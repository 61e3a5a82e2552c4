//! This example powers on a SteamVR base station.
//! The device name should be given as a command line argument.

use std::str::FromStr;

use bleasy_bridge::platform::BtleplugRadio;
use bleasy_bridge::{BleEvent, CharacteristicId, ConnectOptions, Error, ScanOptions, Session, SessionConfig};
use futures::StreamExt;
use tokio::time::Duration;
use uuid::Uuid;

const SERVICE_UUID: &str = "00001523-1212-efde-1523-785feabcd124";
const POWER_UUID: &str = "00001525-1212-efde-1523-785feabcd124";

#[tokio::main]
async fn main() -> Result<(), Error> {
    // Give the BLE device name as a command line argument.
    let name = std::env::args().nth(1).expect("Expected device name");
    pretty_env_logger::init();

    let session = Session::new(BtleplugRadio::new(0).await?, SessionConfig::default());
    let mut events = session.event_stream();

    while !session.radio_state().await?.is_ready() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let options = ScanOptions::default()
        .exact_advertising_name([name])
        .stop_after_first_match();
    session.start_scan(options).await?;

    let peripheral = loop {
        match events.next().await {
            Some(BleEvent::DiscoveredPeripheral(peripheral)) => break peripheral,
            Some(_) => continue,
            None => return Err(Error::SessionClosed),
        }
    };

    session.connect(&peripheral.id, ConnectOptions::default()).await?;

    let power = CharacteristicId::new(
        Uuid::from_str(SERVICE_UUID).unwrap(),
        Uuid::from_str(POWER_UUID).unwrap(),
    );

    println!("Power: {:?}", session.read(&peripheral.id, power).await?);

    session.write_command(&peripheral.id, power, &[1]).await?;

    session.disconnect(&peripheral.id).await
}
