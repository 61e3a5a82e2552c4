use std::collections::HashMap;

use uuid::Uuid;

use crate::common::{ConnectionState, PeripheralId};

/// Last advertisement payload received from a peripheral.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdvertisementData {
    pub local_name: Option<String>,
    pub is_connectable: Option<bool>,
    pub tx_power_level: Option<i16>,
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
    pub service_data: HashMap<Uuid, Vec<u8>>,
    pub service_uuids: Vec<Uuid>,
}

/// Everything the session knows about a remote device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peripheral {
    pub id: PeripheralId,
    pub name: Option<String>,
    pub advertisement: AdvertisementData,
    /// Signal strength
    pub rssi: Option<i16>,
    pub state: ConnectionState,
    pub bonded: bool,
}

impl Peripheral {
    pub fn new(id: PeripheralId) -> Self {
        Self {
            id,
            name: None,
            advertisement: AdvertisementData::default(),
            rssi: None,
            state: ConnectionState::Disconnected,
            bonded: false,
        }
    }

    /// Local name of the device, falling back to the advertised one
    pub fn local_name(&self) -> Option<&str> {
        self.name
            .as_deref()
            .or(self.advertisement.local_name.as_deref())
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Whether the peripheral advertises any of the given services. An empty
    /// filter matches everything.
    pub fn advertises_any(&self, services: &[Uuid]) -> bool {
        services.is_empty()
            || services
                .iter()
                .any(|uuid| self.advertisement.service_uuids.contains(uuid))
    }
}
