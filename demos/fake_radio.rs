//! This example drives a session against the in-memory radio, playing the
//! peripheral side by hand. Runs without any Bluetooth hardware.

use bleasy_bridge::fake::{FakeRadio, RadioCommand};
use bleasy_bridge::{
    CharacteristicId, CharacteristicInfo, CharacteristicProperties, ConnectOptions, Error,
    PeripheralId, RadioEvent, ScanOptions, Session, SessionConfig,
};
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<(), Error> {
    pretty_env_logger::init();

    let (radio, mut air) = FakeRadio::new();
    let session = Session::new(radio, SessionConfig::default());
    let id = PeripheralId::from("AA:BB:CC:DD:EE:FF");
    let counter = CharacteristicId::new(Uuid::from_u128(0xfeed), Uuid::from_u128(0xbeef));

    // The air side answers every command the session issues.
    let peripheral = tokio::spawn({
        let id = id.clone();
        async move {
            air.power_on();
            let mut value = 0u8;

            while let Some(command) = air.next_command().await {
                let event = match command {
                    RadioCommand::StartScan { .. } => {
                        air.advertise(&id, Some("Counter"));
                        continue;
                    }
                    RadioCommand::Connect { id, .. } => RadioEvent::Connected(id),
                    RadioCommand::CancelConnection(id) => RadioEvent::Disconnected { id, error: None },
                    RadioCommand::DiscoverServices { id, .. } => RadioEvent::ServicesDiscovered {
                        id,
                        result: Ok(vec![counter.service]),
                    },
                    RadioCommand::DiscoverCharacteristics { id, service } => {
                        RadioEvent::CharacteristicsDiscovered {
                            id,
                            service,
                            result: Ok(vec![CharacteristicInfo {
                                id: counter,
                                properties: CharacteristicProperties::READ
                                    | CharacteristicProperties::WRITE,
                            }]),
                        }
                    }
                    RadioCommand::Read { id, characteristic } => RadioEvent::ValueUpdated {
                        id,
                        characteristic,
                        result: Ok(vec![value]),
                    },
                    RadioCommand::Write {
                        id,
                        characteristic,
                        data,
                        ..
                    } => {
                        value = value.wrapping_add(data.first().copied().unwrap_or(0));
                        RadioEvent::WriteCompleted {
                            id,
                            characteristic,
                            result: Ok(()),
                        }
                    }
                    command => {
                        println!("Ignoring {:?}", command);
                        continue;
                    }
                };
                air.emit(event);
            }
        }
    });

    while !session.radio_state().await?.is_ready() {
        tokio::task::yield_now().await;
    }

    session
        .start_scan(ScanOptions::default().stop_after_first_match())
        .await?;
    while session.discovered_peripherals().await?.is_empty() {
        tokio::task::yield_now().await;
    }

    session.connect(&id, ConnectOptions::default()).await?;
    println!("Services: {:?}", session.discover_services(&id, &[]).await?);

    for step in 1..=3 {
        session.write_request(&id, counter, &[step]).await?;
        println!("Counter: {:?}", session.read(&id, counter).await?);
    }

    session.disconnect(&id).await?;
    println!("{:#?}", session.snapshot().await?);

    session.close();
    peripheral.abort();

    Ok(())
}
