//! The radio stack this crate sits on top of.
//!
//! Commands are fire-and-forget: a [`RadioStack`] method only hands the
//! request to the stack and must not wait for the air. The outcome comes back
//! later as a [`RadioEvent`] through the [`RadioEventSink`] given to
//! [`RadioStack::attach`]. Returning `Err` from a command means the stack
//! refused it outright and no callback will follow.

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::characteristic::{CharacteristicId, CharacteristicInfo, WriteType};
use crate::common::{ConnectionState, PeripheralId, RadioState};
use crate::peripheral::AdvertisementData;
use crate::session::Message;
use crate::Result;

/// Connection parameters forwarded to the radio.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Let the stack connect whenever the device becomes available instead
    /// of attempting a direct connection.
    pub auto_connect: bool,
}

impl ConnectOptions {
    pub fn auto_connect(mut self, auto_connect: bool) -> Self {
        self.auto_connect = auto_connect;
        self
    }
}

/// Peripheral handed back by the stack when it restores a previous session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoredPeripheral {
    pub id: PeripheralId,
    pub name: Option<String>,
    pub state: ConnectionState,
}

/// Callbacks delivered by the radio stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioEvent {
    StateChanged(RadioState),
    Discovered {
        id: PeripheralId,
        name: Option<String>,
        advertisement: AdvertisementData,
        rssi: Option<i16>,
    },
    Connected(PeripheralId),
    ConnectFailed {
        id: PeripheralId,
        reason: String,
    },
    /// A requested disconnect did not happen; the link is still up.
    DisconnectFailed {
        id: PeripheralId,
        reason: String,
    },
    /// Fired whoever initiated the disconnect.
    Disconnected {
        id: PeripheralId,
        error: Option<String>,
    },
    ServicesDiscovered {
        id: PeripheralId,
        result: std::result::Result<Vec<Uuid>, String>,
    },
    CharacteristicsDiscovered {
        id: PeripheralId,
        service: Uuid,
        result: std::result::Result<Vec<CharacteristicInfo>, String>,
    },
    /// Either the reply to a read or an incoming notification.
    ValueUpdated {
        id: PeripheralId,
        characteristic: CharacteristicId,
        result: std::result::Result<Vec<u8>, String>,
    },
    WriteCompleted {
        id: PeripheralId,
        characteristic: CharacteristicId,
        result: std::result::Result<(), String>,
    },
    NotificationStateChanged {
        id: PeripheralId,
        characteristic: CharacteristicId,
        result: std::result::Result<bool, String>,
    },
    RssiRead {
        id: PeripheralId,
        result: std::result::Result<i16, String>,
    },
    DescriptorRead {
        id: PeripheralId,
        characteristic: CharacteristicId,
        descriptor: Uuid,
        result: std::result::Result<Vec<u8>, String>,
    },
    DescriptorWritten {
        id: PeripheralId,
        characteristic: CharacteristicId,
        descriptor: Uuid,
        result: std::result::Result<(), String>,
    },
    WillRestoreState {
        peripherals: Vec<RestoredPeripheral>,
    },
    BondStateChanged {
        id: PeripheralId,
        bonded: bool,
    },
}

/// Where a radio stack delivers its callbacks. Cheap to clone, safe to use
/// from any thread.
#[derive(Debug, Clone)]
pub struct RadioEventSink {
    sender: mpsc::UnboundedSender<Message>,
}

impl RadioEventSink {
    pub(crate) fn new(sender: mpsc::UnboundedSender<Message>) -> Self {
        Self { sender }
    }

    /// Returns `false` once the session is gone.
    pub fn send(&self, event: RadioEvent) -> bool {
        self.sender.send(Message::Radio(event)).is_ok()
    }
}

/// Capability set of a BLE central stack.
pub trait RadioStack: Send + 'static {
    /// Called once when the session starts, before any command.
    fn attach(&mut self, sink: RadioEventSink);

    fn start_scan(&mut self, services: &[Uuid], allow_duplicates: bool) -> Result<()>;

    fn stop_scan(&mut self) -> Result<()>;

    fn connect(&mut self, id: &PeripheralId, options: &ConnectOptions) -> Result<()>;

    /// Cancels a pending connection or tears down an established one.
    fn cancel_connection(&mut self, id: &PeripheralId) -> Result<()>;

    /// An empty filter discovers every service.
    fn discover_services(&mut self, id: &PeripheralId, services: &[Uuid]) -> Result<()>;

    fn discover_characteristics(&mut self, id: &PeripheralId, service: Uuid) -> Result<()>;

    fn read(&mut self, id: &PeripheralId, characteristic: &CharacteristicId) -> Result<()>;

    /// `WithoutResponse` writes produce no [`RadioEvent::WriteCompleted`].
    fn write(
        &mut self,
        id: &PeripheralId,
        characteristic: &CharacteristicId,
        data: &[u8],
        write_type: WriteType,
    ) -> Result<()>;

    fn set_notify(
        &mut self,
        id: &PeripheralId,
        characteristic: &CharacteristicId,
        enabled: bool,
    ) -> Result<()>;

    fn read_rssi(&mut self, id: &PeripheralId) -> Result<()>;

    fn read_descriptor(
        &mut self,
        id: &PeripheralId,
        characteristic: &CharacteristicId,
        descriptor: Uuid,
    ) -> Result<()>;

    fn write_descriptor(
        &mut self,
        id: &PeripheralId,
        characteristic: &CharacteristicId,
        descriptor: Uuid,
        data: &[u8],
    ) -> Result<()>;
}
