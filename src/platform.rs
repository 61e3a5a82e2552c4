//! [`RadioStack`] on top of the host Bluetooth stack through btleplug.
//!
//! btleplug exposes an async request/response API; every command is run on a
//! background task and its outcome is turned back into a [`RadioEvent`].
//! Commands other than connects run one at a time in issue order, which keeps
//! unacknowledged writes ordered on the air.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};

use btleplug::api::{
    Central, CentralEvent, CentralState, Characteristic, Descriptor, Manager as _, Peripheral as _, ScanFilter,
    WriteType as PlatformWriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::characteristic::{CharacteristicId, CharacteristicInfo, CharacteristicProperties, WriteType};
use crate::common::{PeripheralId, RadioState};
use crate::peripheral::AdvertisementData;
use crate::radio::{ConnectOptions, RadioEvent, RadioEventSink, RadioStack};
use crate::{Error, Result};

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;
type Peripherals = Arc<Mutex<HashMap<PeripheralId, Peripheral>>>;

pub struct BtleplugRadio {
    _manager: Manager,
    adapter: Adapter,
    peripherals: Peripherals,
    sink: Option<RadioEventSink>,
    jobs: Option<mpsc::UnboundedSender<Job>>,
}

impl BtleplugRadio {
    /// Opens the Bluetooth adapter with the given index. The first found
    /// adapter is index 0.
    pub async fn new(adapter_index: usize) -> Result<Self> {
        let manager = Manager::new().await?;
        let mut adapters = manager.adapters().await?;

        if adapter_index >= adapters.len() {
            return Err(Error::Radio(format!(
                "no bluetooth adapter with index {} ({} found)",
                adapter_index,
                adapters.len()
            )));
        }

        let adapter = adapters.swap_remove(adapter_index);
        log::trace!("Using adapter: {:?}", adapter);

        Ok(Self {
            _manager: manager,
            adapter,
            peripherals: Arc::new(Mutex::new(HashMap::new())),
            sink: None,
            jobs: None,
        })
    }

    fn peripheral(&self, id: &PeripheralId) -> Result<Peripheral> {
        self.peripherals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
            .ok_or_else(|| Error::UnknownPeripheral(id.clone()))
    }

    fn sink(&self) -> Result<RadioEventSink> {
        self.sink.clone().ok_or(Error::SessionClosed)
    }

    fn run(&self, job: impl Future<Output = ()> + Send + 'static) -> Result<()> {
        self.jobs
            .as_ref()
            .ok_or(Error::SessionClosed)?
            .send(Box::pin(job))
            .map_err(|_| Error::SessionClosed)
    }
}

fn platform_id(peripheral: &Peripheral) -> PeripheralId {
    PeripheralId::new(peripheral.id().to_string())
}

fn characteristic_info(characteristic: &Characteristic) -> CharacteristicInfo {
    CharacteristicInfo {
        id: CharacteristicId::new(characteristic.service_uuid, characteristic.uuid),
        properties: CharacteristicProperties::from_bits(characteristic.properties.bits()),
    }
}

fn radio_state(state: CentralState) -> RadioState {
    match state {
        CentralState::PoweredOn => RadioState::PoweredOn,
        CentralState::PoweredOff => RadioState::PoweredOff,
        CentralState::Unknown => RadioState::Unknown,
    }
}

/// Looks up a discovered characteristic, discovering services first if the
/// peripheral has none yet.
async fn find_characteristic(
    peripheral: &Peripheral,
    id: &CharacteristicId,
) -> std::result::Result<Characteristic, String> {
    if peripheral.services().is_empty() {
        peripheral
            .discover_services()
            .await
            .map_err(|e| e.to_string())?;
    }

    peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.service_uuid == id.service && c.uuid == id.characteristic)
        .ok_or_else(|| format!("characteristic {} not found", id))
}

async fn find_descriptor(
    peripheral: &Peripheral,
    characteristic: &CharacteristicId,
    descriptor: Uuid,
) -> std::result::Result<Descriptor, String> {
    find_characteristic(peripheral, characteristic)
        .await?
        .descriptors
        .into_iter()
        .find(|d| d.uuid == descriptor)
        .ok_or_else(|| format!("descriptor {} of {} not found", descriptor, characteristic))
}

async fn forward_notifications(peripheral: Peripheral, sink: RadioEventSink) {
    let mut notifications = match peripheral.notifications().await {
        Ok(notifications) => notifications,
        Err(e) => {
            log::warn!("No notification stream for {:?}: {}", peripheral.id(), e);
            return;
        }
    };
    let id = platform_id(&peripheral);

    while let Some(notification) = notifications.next().await {
        let characteristic = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == notification.uuid);
        let Some(characteristic) = characteristic else {
            log::debug!("Notification from unknown characteristic {}", notification.uuid);
            continue;
        };

        let delivered = sink.send(RadioEvent::ValueUpdated {
            id: id.clone(),
            characteristic: CharacteristicId::new(characteristic.service_uuid, characteristic.uuid),
            result: Ok(notification.value),
        });
        if !delivered {
            break;
        }
    }
}

async fn listen(adapter: Adapter, peripherals: Peripherals, sink: RadioEventSink) {
    let mut events = match adapter.events().await {
        Ok(events) => events,
        Err(e) => {
            log::error!("Could not listen to adapter events: {}", e);
            sink.send(RadioEvent::StateChanged(RadioState::Unsupported));
            return;
        }
    };

    let state = match adapter.adapter_state().await {
        Ok(state) => radio_state(state),
        Err(e) => {
            log::warn!("Could not read the adapter state: {}", e);
            RadioState::Unknown
        }
    };
    sink.send(RadioEvent::StateChanged(state));

    while let Some(event) = events.next().await {
        let delivered = match event {
            CentralEvent::StateUpdate(state) => sink.send(RadioEvent::StateChanged(radio_state(state))),
            CentralEvent::DeviceDiscovered(platform) | CentralEvent::DeviceUpdated(platform) => {
                let Ok(peripheral) = adapter.peripheral(&platform).await else {
                    continue;
                };
                let properties = peripheral.properties().await.ok().flatten().unwrap_or_default();
                let id = platform_id(&peripheral);

                peripherals
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(id.clone(), peripheral);

                sink.send(RadioEvent::Discovered {
                    id,
                    name: properties.local_name.clone(),
                    advertisement: AdvertisementData {
                        local_name: properties.local_name,
                        is_connectable: None,
                        tx_power_level: properties.tx_power_level,
                        manufacturer_data: properties.manufacturer_data,
                        service_data: properties.service_data,
                        service_uuids: properties.services,
                    },
                    rssi: properties.rssi,
                })
            }
            CentralEvent::DeviceDisconnected(platform) => match adapter.peripheral(&platform).await {
                Ok(peripheral) => sink.send(RadioEvent::Disconnected {
                    id: platform_id(&peripheral),
                    error: None,
                }),
                Err(_) => true,
            },
            _ => true,
        };

        if !delivered {
            break;
        }
    }

    log::info!("Adapter event stream ended");
}

impl RadioStack for BtleplugRadio {
    fn attach(&mut self, sink: RadioEventSink) {
        let (jobs, mut receiver) = mpsc::unbounded_channel::<Job>();
        tokio::spawn(async move {
            while let Some(job) = receiver.recv().await {
                job.await;
            }
        });

        tokio::spawn(listen(self.adapter.clone(), self.peripherals.clone(), sink.clone()));

        self.jobs = Some(jobs);
        self.sink = Some(sink);
    }

    fn start_scan(&mut self, services: &[Uuid], allow_duplicates: bool) -> Result<()> {
        if allow_duplicates {
            log::debug!("Duplicate filtering is left to the platform");
        }

        let adapter = self.adapter.clone();
        let filter = ScanFilter {
            services: services.to_vec(),
        };
        self.run(async move {
            if let Err(e) = adapter.start_scan(filter).await {
                log::error!("Could not start the scan: {}", e);
            }
        })
    }

    fn stop_scan(&mut self) -> Result<()> {
        let adapter = self.adapter.clone();
        self.run(async move {
            if let Err(e) = adapter.stop_scan().await {
                log::warn!("Could not stop the scan: {}", e);
            }
        })
    }

    fn connect(&mut self, id: &PeripheralId, options: &ConnectOptions) -> Result<()> {
        let peripheral = self.peripheral(id)?;
        let sink = self.sink()?;
        let id = id.clone();

        if options.auto_connect {
            log::debug!("Auto-connect is not supported by btleplug, connecting directly");
        }

        // Connects can take long; they do not hold up the command queue.
        tokio::spawn(async move {
            match peripheral.connect().await {
                Ok(()) => {
                    sink.send(RadioEvent::Connected(id));
                    forward_notifications(peripheral, sink).await;
                }
                Err(e) => {
                    sink.send(RadioEvent::ConnectFailed {
                        id,
                        reason: e.to_string(),
                    });
                }
            }
        });

        Ok(())
    }

    fn cancel_connection(&mut self, id: &PeripheralId) -> Result<()> {
        let peripheral = self.peripheral(id)?;
        let sink = self.sink()?;
        let id = id.clone();

        self.run(async move {
            match peripheral.disconnect().await {
                // The adapter usually reports this too; the second one is a no-op.
                Ok(()) => sink.send(RadioEvent::Disconnected { id, error: None }),
                Err(e) => sink.send(RadioEvent::DisconnectFailed {
                    id,
                    reason: e.to_string(),
                }),
            };
        })
    }

    fn discover_services(&mut self, id: &PeripheralId, services: &[Uuid]) -> Result<()> {
        let peripheral = self.peripheral(id)?;
        let sink = self.sink()?;
        let filter = services.to_vec();
        let id = id.clone();

        self.run(async move {
            let result = peripheral
                .discover_services()
                .await
                .map(|_| {
                    peripheral
                        .services()
                        .into_iter()
                        .map(|service| service.uuid)
                        .filter(|uuid| filter.is_empty() || filter.contains(uuid))
                        .collect()
                })
                .map_err(|e| e.to_string());

            sink.send(RadioEvent::ServicesDiscovered { id, result });
        })
    }

    fn discover_characteristics(&mut self, id: &PeripheralId, service: Uuid) -> Result<()> {
        let peripheral = self.peripheral(id)?;
        let sink = self.sink()?;
        let id = id.clone();

        self.run(async move {
            let mut services = peripheral.services();
            if services.is_empty() {
                if let Err(e) = peripheral.discover_services().await {
                    sink.send(RadioEvent::CharacteristicsDiscovered {
                        id,
                        service,
                        result: Err(e.to_string()),
                    });
                    return;
                }
                services = peripheral.services();
            }

            let result = services
                .into_iter()
                .find(|s| s.uuid == service)
                .map(|s| s.characteristics.iter().map(characteristic_info).collect())
                .ok_or_else(|| format!("service {} not found", service));

            sink.send(RadioEvent::CharacteristicsDiscovered {
                id,
                service,
                result,
            });
        })
    }

    fn read(&mut self, id: &PeripheralId, characteristic: &CharacteristicId) -> Result<()> {
        let peripheral = self.peripheral(id)?;
        let sink = self.sink()?;
        let characteristic = *characteristic;
        let id = id.clone();

        self.run(async move {
            let result = match find_characteristic(&peripheral, &characteristic).await {
                Ok(found) => peripheral.read(&found).await.map_err(|e| e.to_string()),
                Err(e) => Err(e),
            };

            sink.send(RadioEvent::ValueUpdated {
                id,
                characteristic,
                result,
            });
        })
    }

    fn write(
        &mut self,
        id: &PeripheralId,
        characteristic: &CharacteristicId,
        data: &[u8],
        write_type: WriteType,
    ) -> Result<()> {
        let peripheral = self.peripheral(id)?;
        let sink = self.sink()?;
        let characteristic = *characteristic;
        let data = data.to_vec();
        let id = id.clone();

        self.run(async move {
            let platform_write_type = match write_type {
                WriteType::WithResponse => PlatformWriteType::WithResponse,
                WriteType::WithoutResponse => PlatformWriteType::WithoutResponse,
            };

            let result = match find_characteristic(&peripheral, &characteristic).await {
                Ok(found) => peripheral
                    .write(&found, &data, platform_write_type)
                    .await
                    .map_err(|e| e.to_string()),
                Err(e) => Err(e),
            };

            match (write_type, result) {
                (WriteType::WithResponse, result) => {
                    sink.send(RadioEvent::WriteCompleted {
                        id,
                        characteristic,
                        result,
                    });
                }
                (WriteType::WithoutResponse, Err(e)) => {
                    log::warn!("Write to {} on {} failed: {}", characteristic, id, e);
                }
                (WriteType::WithoutResponse, Ok(())) => {}
            }
        })
    }

    fn set_notify(
        &mut self,
        id: &PeripheralId,
        characteristic: &CharacteristicId,
        enabled: bool,
    ) -> Result<()> {
        let peripheral = self.peripheral(id)?;
        let sink = self.sink()?;
        let characteristic = *characteristic;
        let id = id.clone();

        self.run(async move {
            let result = match find_characteristic(&peripheral, &characteristic).await {
                Ok(found) if enabled => peripheral.subscribe(&found).await,
                Ok(found) => peripheral.unsubscribe(&found).await,
                Err(e) => {
                    sink.send(RadioEvent::NotificationStateChanged {
                        id,
                        characteristic,
                        result: Err(e),
                    });
                    return;
                }
            };

            sink.send(RadioEvent::NotificationStateChanged {
                id,
                characteristic,
                result: result.map(|_| enabled).map_err(|e| e.to_string()),
            });
        })
    }

    fn read_rssi(&mut self, id: &PeripheralId) -> Result<()> {
        let peripheral = self.peripheral(id)?;
        let sink = self.sink()?;
        let id = id.clone();

        self.run(async move {
            let result = match peripheral.properties().await {
                Ok(properties) => properties
                    .and_then(|props| props.rssi)
                    .ok_or_else(|| "signal strength unavailable".to_string()),
                Err(e) => Err(e.to_string()),
            };

            sink.send(RadioEvent::RssiRead { id, result });
        })
    }

    fn read_descriptor(
        &mut self,
        id: &PeripheralId,
        characteristic: &CharacteristicId,
        descriptor: Uuid,
    ) -> Result<()> {
        let peripheral = self.peripheral(id)?;
        let sink = self.sink()?;
        let characteristic = *characteristic;
        let id = id.clone();

        self.run(async move {
            let result = match find_descriptor(&peripheral, &characteristic, descriptor).await {
                Ok(found) => peripheral
                    .read_descriptor(&found)
                    .await
                    .map_err(|e| e.to_string()),
                Err(e) => Err(e),
            };

            sink.send(RadioEvent::DescriptorRead {
                id,
                characteristic,
                descriptor,
                result,
            });
        })
    }

    fn write_descriptor(
        &mut self,
        id: &PeripheralId,
        characteristic: &CharacteristicId,
        descriptor: Uuid,
        data: &[u8],
    ) -> Result<()> {
        let peripheral = self.peripheral(id)?;
        let sink = self.sink()?;
        let characteristic = *characteristic;
        let data = data.to_vec();
        let id = id.clone();

        self.run(async move {
            let result = match find_descriptor(&peripheral, &characteristic, descriptor).await {
                Ok(found) => peripheral
                    .write_descriptor(&found, &data)
                    .await
                    .map_err(|e| e.to_string()),
                Err(e) => Err(e),
            };

            sink.send(RadioEvent::DescriptorWritten {
                id,
                characteristic,
                descriptor,
                result,
            });
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adapter_states_map_onto_radio_states() {
        assert_eq!(radio_state(CentralState::PoweredOn), RadioState::PoweredOn);
        assert_eq!(radio_state(CentralState::PoweredOff), RadioState::PoweredOff);
        assert_eq!(radio_state(CentralState::Unknown), RadioState::Unknown);
        assert!(!radio_state(CentralState::PoweredOff).is_ready());
    }
}
