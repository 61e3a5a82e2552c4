//! This example finds the first BLE device that advertises the heart rate service,
//! connects to it and starts listening for heart rate values.

use bleasy_bridge::common::{characteristics::HEART_RATE_MEASUREMENT, services::HEART_RATE};
use bleasy_bridge::platform::BtleplugRadio;
use bleasy_bridge::{BleEvent, CharacteristicId, ConnectOptions, Error, ScanOptions, Session, SessionConfig};
use futures::StreamExt;
use tokio::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Error> {
    pretty_env_logger::init();

    let session = Session::new(
        BtleplugRadio::new(0).await?,
        SessionConfig::default().operation_timeout(Duration::from_secs(10)),
    );
    let mut events = session.event_stream();

    while !session.radio_state().await?.is_ready() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let options = ScanOptions::default()
        .filter_by_services([HEART_RATE])
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

    for service in session.discover_services(&peripheral.id, &[HEART_RATE]).await? {
        println!("Service: {:?}", service);
    }

    let hr_measurement = CharacteristicId::new(HEART_RATE, HEART_RATE_MEASUREMENT);
    let mut hr_stream = session.notification_stream(&peripheral.id, hr_measurement);
    session.set_notify(&peripheral.id, hr_measurement, true).await?;

    while let Some(hr) = hr_stream.next().await {
        println!("RSSI: {}", session.read_rssi(&peripheral.id).await.unwrap_or(0));
        println!("{:?}", hr);
    }

    Ok(())
}
