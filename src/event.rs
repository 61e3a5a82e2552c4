use tokio::sync::broadcast;

use crate::characteristic::CharacteristicId;
use crate::common::{PeripheralId, RadioState};
use crate::peripheral::Peripheral;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopScanReason {
    /// `stop_scan` was called (also reported when no scan was running)
    Requested,
    Timeout,
    /// The configured number of matching peripherals was found
    MatchLimit,
    /// The radio left the powered-on state mid-scan
    RadioUnavailable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    Requested,
    Unexpected { error: Option<String> },
}

/// Unsolicited events, i.e. everything that has no single waiting caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BleEvent {
    DiscoveredPeripheral(Peripheral),
    StopScan {
        reason: StopScanReason,
    },
    RadioStateChanged(RadioState),
    Connected {
        peripheral: PeripheralId,
    },
    Disconnected {
        peripheral: PeripheralId,
        reason: DisconnectReason,
    },
    NotificationValueUpdated {
        peripheral: PeripheralId,
        characteristic: CharacteristicId,
        value: Vec<u8>,
    },
    NotificationStateChanged {
        peripheral: PeripheralId,
        characteristic: CharacteristicId,
        is_notifying: bool,
        error: Option<String>,
    },
    SessionRestored {
        peripherals: Vec<Peripheral>,
    },
    BondUpdated {
        peripheral: PeripheralId,
        bonded: bool,
    },
}

impl BleEvent {
    pub fn peripheral(&self) -> Option<&PeripheralId> {
        match self {
            BleEvent::DiscoveredPeripheral(p) => Some(&p.id),
            BleEvent::Connected { peripheral }
            | BleEvent::Disconnected { peripheral, .. }
            | BleEvent::NotificationValueUpdated { peripheral, .. }
            | BleEvent::NotificationStateChanged { peripheral, .. }
            | BleEvent::BondUpdated { peripheral, .. } => Some(peripheral),
            BleEvent::StopScan { .. }
            | BleEvent::RadioStateChanged(_)
            | BleEvent::SessionRestored { .. } => None,
        }
    }
}

/// Publishing side of the event stream.
#[derive(Debug, Clone)]
pub(crate) struct EventEmitter {
    sender: broadcast::Sender<BleEvent>,
}

impl EventEmitter {
    pub(crate) fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub(crate) fn emit(&self, event: BleEvent) {
        log::trace!("Emitting {:?}", event);
        // No subscribers is fine; events are fire-and-forget.
        self.sender.send(event).ok();
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<BleEvent> {
        self.sender.subscribe()
    }
}
