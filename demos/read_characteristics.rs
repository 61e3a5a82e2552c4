//! This example finds the first device advertising the battery service
//! and reads the device's battery level.

use bleasy_bridge::common::{characteristics::BATTERY_LEVEL, services::BATTERY};
use bleasy_bridge::platform::BtleplugRadio;
use bleasy_bridge::{BleEvent, CharacteristicId, ConnectOptions, Error, ScanOptions, Session, SessionConfig};
use futures::StreamExt;
use tokio::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Error> {
    pretty_env_logger::init();

    let session = Session::new(BtleplugRadio::new(0).await?, SessionConfig::default());
    let mut events = session.event_stream();

    while !session.radio_state().await?.is_ready() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    // Filters devices that advertise the battery service
    let options = ScanOptions::default()
        .filter_by_services([BATTERY])
        .stop_after_first_match();
    session.start_scan(options).await?;

    // Take the first discovered device
    let peripheral = loop {
        match events.next().await {
            Some(BleEvent::DiscoveredPeripheral(peripheral)) => break peripheral,
            Some(_) => continue,
            None => return Err(Error::SessionClosed),
        }
    };
    println!("{:?}", peripheral);

    session.connect(&peripheral.id, ConnectOptions::default()).await?;

    for service in session.discover_services(&peripheral.id, &[]).await? {
        println!("Service: {:?}", service);
    }

    // Read the battery level
    let battery_level = session
        .read(&peripheral.id, CharacteristicId::new(BATTERY, BATTERY_LEVEL))
        .await?;
    println!("Battery level: {:?}", battery_level);

    session.disconnect(&peripheral.id).await
}
