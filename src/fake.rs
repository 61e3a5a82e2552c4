//! In-memory radio stack.
//!
//! [`FakeRadio`] accepts every command and records it; the paired
//! [`FakeRadioController`] plays the air side, inspecting what the session
//! asked for and answering with [`RadioEvent`]s in whatever order a test
//! needs.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::characteristic::{CharacteristicId, WriteType};
use crate::common::{PeripheralId, RadioState};
use crate::peripheral::AdvertisementData;
use crate::radio::{ConnectOptions, RadioEvent, RadioEventSink, RadioStack};
use crate::{Error, Result};

/// A command as the session issued it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioCommand {
    StartScan {
        services: Vec<Uuid>,
        allow_duplicates: bool,
    },
    StopScan,
    Connect {
        id: PeripheralId,
        options: ConnectOptions,
    },
    CancelConnection(PeripheralId),
    DiscoverServices {
        id: PeripheralId,
        services: Vec<Uuid>,
    },
    DiscoverCharacteristics {
        id: PeripheralId,
        service: Uuid,
    },
    Read {
        id: PeripheralId,
        characteristic: CharacteristicId,
    },
    Write {
        id: PeripheralId,
        characteristic: CharacteristicId,
        data: Vec<u8>,
        write_type: WriteType,
    },
    SetNotify {
        id: PeripheralId,
        characteristic: CharacteristicId,
        enabled: bool,
    },
    ReadRssi(PeripheralId),
    ReadDescriptor {
        id: PeripheralId,
        characteristic: CharacteristicId,
        descriptor: Uuid,
    },
    WriteDescriptor {
        id: PeripheralId,
        characteristic: CharacteristicId,
        descriptor: Uuid,
        data: Vec<u8>,
    },
}

#[derive(Debug, Default)]
struct FakeState {
    sink: Option<RadioEventSink>,
    /// Reason every command is refused with, while set
    refusal: Option<String>,
}

fn lock(state: &Mutex<FakeState>) -> MutexGuard<'_, FakeState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
pub struct FakeRadio {
    state: Arc<Mutex<FakeState>>,
    commands: mpsc::UnboundedSender<RadioCommand>,
}

impl FakeRadio {
    pub fn new() -> (Self, FakeRadioController) {
        let state = Arc::new(Mutex::new(FakeState::default()));
        let (commands, receiver) = mpsc::unbounded_channel();

        (
            Self {
                state: state.clone(),
                commands,
            },
            FakeRadioController { state, receiver },
        )
    }

    fn record(&mut self, command: RadioCommand) -> Result<()> {
        if let Some(reason) = lock(&self.state).refusal.clone() {
            log::debug!("Fake radio refusing {:?}", command);
            return Err(Error::Radio(reason));
        }

        log::trace!("Fake radio received {:?}", command);
        // The controller may be gone; the command is then simply lost.
        self.commands.send(command).ok();
        Ok(())
    }
}

impl RadioStack for FakeRadio {
    fn attach(&mut self, sink: RadioEventSink) {
        lock(&self.state).sink = Some(sink);
    }

    fn start_scan(&mut self, services: &[Uuid], allow_duplicates: bool) -> Result<()> {
        self.record(RadioCommand::StartScan {
            services: services.to_vec(),
            allow_duplicates,
        })
    }

    fn stop_scan(&mut self) -> Result<()> {
        self.record(RadioCommand::StopScan)
    }

    fn connect(&mut self, id: &PeripheralId, options: &ConnectOptions) -> Result<()> {
        self.record(RadioCommand::Connect {
            id: id.clone(),
            options: options.clone(),
        })
    }

    fn cancel_connection(&mut self, id: &PeripheralId) -> Result<()> {
        self.record(RadioCommand::CancelConnection(id.clone()))
    }

    fn discover_services(&mut self, id: &PeripheralId, services: &[Uuid]) -> Result<()> {
        self.record(RadioCommand::DiscoverServices {
            id: id.clone(),
            services: services.to_vec(),
        })
    }

    fn discover_characteristics(&mut self, id: &PeripheralId, service: Uuid) -> Result<()> {
        self.record(RadioCommand::DiscoverCharacteristics {
            id: id.clone(),
            service,
        })
    }

    fn read(&mut self, id: &PeripheralId, characteristic: &CharacteristicId) -> Result<()> {
        self.record(RadioCommand::Read {
            id: id.clone(),
            characteristic: *characteristic,
        })
    }

    fn write(
        &mut self,
        id: &PeripheralId,
        characteristic: &CharacteristicId,
        data: &[u8],
        write_type: WriteType,
    ) -> Result<()> {
        self.record(RadioCommand::Write {
            id: id.clone(),
            characteristic: *characteristic,
            data: data.to_vec(),
            write_type,
        })
    }

    fn set_notify(
        &mut self,
        id: &PeripheralId,
        characteristic: &CharacteristicId,
        enabled: bool,
    ) -> Result<()> {
        self.record(RadioCommand::SetNotify {
            id: id.clone(),
            characteristic: *characteristic,
            enabled,
        })
    }

    fn read_rssi(&mut self, id: &PeripheralId) -> Result<()> {
        self.record(RadioCommand::ReadRssi(id.clone()))
    }

    fn read_descriptor(
        &mut self,
        id: &PeripheralId,
        characteristic: &CharacteristicId,
        descriptor: Uuid,
    ) -> Result<()> {
        self.record(RadioCommand::ReadDescriptor {
            id: id.clone(),
            characteristic: *characteristic,
            descriptor,
        })
    }

    fn write_descriptor(
        &mut self,
        id: &PeripheralId,
        characteristic: &CharacteristicId,
        descriptor: Uuid,
        data: &[u8],
    ) -> Result<()> {
        self.record(RadioCommand::WriteDescriptor {
            id: id.clone(),
            characteristic: *characteristic,
            descriptor,
            data: data.to_vec(),
        })
    }
}

/// Air side of a [`FakeRadio`].
#[derive(Debug)]
pub struct FakeRadioController {
    state: Arc<Mutex<FakeState>>,
    receiver: mpsc::UnboundedReceiver<RadioCommand>,
}

impl FakeRadioController {
    /// Waits for the next command the session hands to the radio.
    pub async fn next_command(&mut self) -> Option<RadioCommand> {
        self.receiver.recv().await
    }

    pub fn try_next_command(&mut self) -> Option<RadioCommand> {
        self.receiver.try_recv().ok()
    }

    /// Delivers a callback to the attached session. Returns `false` if no
    /// session is listening.
    pub fn emit(&self, event: RadioEvent) -> bool {
        let sink = lock(&self.state).sink.clone();
        sink.map_or(false, |sink| sink.send(event))
    }

    pub fn power_on(&self) -> bool {
        self.emit(RadioEvent::StateChanged(RadioState::PoweredOn))
    }

    /// Reports an advertisement with no payload beyond the local name.
    pub fn advertise(&self, id: &PeripheralId, name: Option<&str>) -> bool {
        self.emit(RadioEvent::Discovered {
            id: id.clone(),
            name: name.map(str::to_string),
            advertisement: AdvertisementData {
                local_name: name.map(str::to_string),
                ..Default::default()
            },
            rssi: Some(-60),
        })
    }

    /// Makes the radio refuse every command with `reason`, or accept them
    /// again for `None`.
    pub fn refuse_commands(&self, reason: Option<&str>) {
        lock(&self.state).refusal = reason.map(str::to_string);
    }
}
