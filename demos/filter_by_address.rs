//! This example finds a BLE device with specified identifier.

use bleasy_bridge::platform::BtleplugRadio;
use bleasy_bridge::{BleEvent, Error, ScanOptions, Session, SessionConfig};
use futures::StreamExt;
use tokio::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Error> {
    let address = std::env::args()
        .nth(1)
        .expect("Expected the device identifier as an argument");

    pretty_env_logger::init();

    log::info!("Scanning for device {}", address);

    let session = Session::new(BtleplugRadio::new(0).await?, SessionConfig::default());
    let mut events = session.event_stream();

    while !session.radio_state().await?.is_ready() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let options = ScanOptions::default()
        .filter_by_address(move |id| id.as_str().eq_ignore_ascii_case(&address))
        .stop_after_first_match();
    session.start_scan(options).await?;

    while let Some(event) = events.next().await {
        if let BleEvent::DiscoveredPeripheral(peripheral) = event {
            println!("{:?}", peripheral);
            break;
        }
    }

    Ok(())
}
