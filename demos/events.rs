//! This example listens for session events while scanning.

use bleasy_bridge::platform::BtleplugRadio;
use bleasy_bridge::{BleEvent, Error, ScanOptions, Session, SessionConfig};
use futures::StreamExt;
use tokio::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Error> {
    pretty_env_logger::init();

    // Open the first Bluetooth adapter and start a session on it
    let radio = BtleplugRadio::new(0).await?;
    let session = Session::new(radio, SessionConfig::default());

    // Create a stream that is provided with session events
    let mut event_stream = session.event_stream();

    // Read events in a separate task
    let join_handle = tokio::spawn(async move {
        while let Some(event) = event_stream.next().await {
            match event {
                BleEvent::RadioStateChanged(state) => println!("Radio state: {:?}", state),
                BleEvent::DiscoveredPeripheral(peripheral) => {
                    println!("Device discovered: {} {:?}", peripheral.id, peripheral.local_name())
                }
                BleEvent::StopScan { reason } => {
                    println!("Scan stopped: {:?}", reason);
                    break;
                }
                event => println!("{:?}", event),
            }
        }
    });

    // Wait for the adapter to come up before scanning
    while !session.radio_state().await?.is_ready() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    session
        .start_scan(ScanOptions::default().stop_after_timeout(Duration::from_secs(2)))
        .await?;

    join_handle.await.ok();

    Ok(())
}
