use uuid::Uuid;

use crate::characteristic::CharacteristicInfo;

/// A discovered GATT service with its characteristics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub uuid: Uuid,
    pub characteristics: Vec<CharacteristicInfo>,
}

impl ServiceInfo {
    pub fn characteristic(&self, uuid: Uuid) -> Option<&CharacteristicInfo> {
        self.characteristics
            .iter()
            .find(|characteristic| characteristic.uuid() == uuid)
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }
}
