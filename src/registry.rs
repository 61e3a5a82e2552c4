use std::collections::HashMap;

use crate::common::{ConnectionState, PeripheralId};
use crate::peripheral::{AdvertisementData, Peripheral};

/// Every peripheral seen by the session, keyed by identifier.
///
/// Entries are only ever removed by [`PeripheralRegistry::evict`]; a
/// disconnected peripheral stays around so that it can be reconnected.
#[derive(Debug, Default)]
pub(crate) struct PeripheralRegistry {
    peripherals: HashMap<PeripheralId, Peripheral>,
}

impl PeripheralRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Inserts a freshly discovered peripheral or refreshes the advertisement
    /// of a known one. Returns whether the entry was newly created.
    pub(crate) fn upsert_discovered(
        &mut self,
        id: PeripheralId,
        name: Option<String>,
        advertisement: AdvertisementData,
        rssi: Option<i16>,
    ) -> bool {
        let mut created = false;
        let peripheral = self.peripherals.entry(id.clone()).or_insert_with(|| {
            created = true;
            Peripheral::new(id)
        });

        if name.is_some() {
            peripheral.name = name;
        }
        peripheral.advertisement = advertisement;
        if rssi.is_some() {
            peripheral.rssi = rssi;
        }

        created
    }

    /// Re-populates an entry handed back by the radio stack after a relaunch.
    pub(crate) fn restore(
        &mut self,
        id: PeripheralId,
        name: Option<String>,
        state: ConnectionState,
    ) -> &Peripheral {
        let peripheral = self
            .peripherals
            .entry(id.clone())
            .or_insert_with(|| Peripheral::new(id));

        if name.is_some() {
            peripheral.name = name;
        }
        peripheral.state = state;
        peripheral
    }

    #[inline]
    pub(crate) fn get(&self, id: &PeripheralId) -> Option<&Peripheral> {
        self.peripherals.get(id)
    }

    #[inline]
    pub(crate) fn contains(&self, id: &PeripheralId) -> bool {
        self.peripherals.contains_key(id)
    }

    pub(crate) fn state(&self, id: &PeripheralId) -> Option<ConnectionState> {
        self.peripherals.get(id).map(|p| p.state)
    }

    /// Returns the previous state, or `None` for an unknown peripheral.
    pub(crate) fn set_state(
        &mut self,
        id: &PeripheralId,
        state: ConnectionState,
    ) -> Option<ConnectionState> {
        self.peripherals
            .get_mut(id)
            .map(|p| std::mem::replace(&mut p.state, state))
    }

    pub(crate) fn set_rssi(&mut self, id: &PeripheralId, rssi: i16) {
        if let Some(peripheral) = self.peripherals.get_mut(id) {
            peripheral.rssi = Some(rssi);
        }
    }

    pub(crate) fn set_bonded(&mut self, id: &PeripheralId, bonded: bool) -> bool {
        match self.peripherals.get_mut(id) {
            Some(peripheral) => {
                peripheral.bonded = bonded;
                true
            }
            None => false,
        }
    }

    pub(crate) fn evict(&mut self, id: &PeripheralId) -> Option<Peripheral> {
        self.peripherals.remove(id)
    }

    /// Identifiers of every peripheral holding or establishing a link.
    pub(crate) fn linked(&self) -> Vec<PeripheralId> {
        self.peripherals
            .values()
            .filter(|p| p.state.is_linked())
            .map(|p| p.id.clone())
            .collect()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Peripheral> {
        self.peripherals.values()
    }

    pub(crate) fn snapshot(&self) -> Vec<Peripheral> {
        self.peripherals.values().cloned().collect()
    }
}
