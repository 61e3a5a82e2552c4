use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::{Stream, StreamExt};
use stream_cancel::{Trigger, Valved};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use crate::characteristic::{CharacteristicId, CharacteristicInfo, WriteType};
use crate::common::{ConnectionState, PeripheralId, RadioState};
use crate::controller::CentralSessionController;
use crate::event::{BleEvent, EventEmitter};
use crate::gatt::GattOperationDispatcher;
use crate::peripheral::Peripheral;
use crate::pending::{OperationKey, OperationKind, PendingOperationTable, Responder};
use crate::radio::{ConnectOptions, RadioEvent, RadioEventSink, RadioStack};
use crate::registry::PeripheralRegistry;
use crate::scanner::ScanOptions;
use crate::service::ServiceInfo;
use crate::write_queue::WriteRequest;
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Capacity of the event broadcast channel. Slow subscribers skip events
    /// once they fall this far behind.
    event_capacity: usize,
    /// Deadline applied to every correlated operation.
    operation_timeout: Option<Duration>,
    /// Maximum number of bytes handed to the radio per write.
    write_chunk_size: Option<usize>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            event_capacity: 64,
            operation_timeout: None,
            write_chunk_size: None,
        }
    }
}

impl SessionConfig {
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Give up on operations the radio has not answered within `timeout`.
    /// The operation fails with [`Error::Timeout`]; a late radio answer is ignored.
    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = Some(timeout);
        self
    }

    /// Split writes larger than `size` bytes into several radio writes
    pub fn write_chunk_size(mut self, size: usize) -> Self {
        self.write_chunk_size = Some(size);
        self
    }
}

/// Point-in-time copy of the session state, for diagnostics.
#[derive(Debug, Clone)]
pub struct Diagnostics {
    pub radio_state: RadioState,
    pub scanning: bool,
    pub peripherals: Vec<Peripheral>,
    pub pending: Vec<(OperationKey, Duration)>,
    pub queued_writes: usize,
}

/// Success payload of any command.
#[derive(Debug)]
pub(crate) enum Completion {
    Done,
    Bytes(Vec<u8>),
    Rssi(i16),
    Services(Vec<ServiceInfo>),
    Characteristics(Vec<CharacteristicInfo>),
    Notifying(bool),
    Peripherals(Vec<Peripheral>),
    Flag(bool),
    RadioState(RadioState),
    Diagnostics(Diagnostics),
}

macro_rules! expect_completion {
    ($completion:expr, $variant:ident) => {
        match $completion {
            Completion::$variant(value) => Ok(value),
            _ => Err(Error::UnexpectedCompletion(stringify!($variant))),
        }
    };
}

#[derive(Debug)]
pub(crate) enum Query {
    DiscoveredPeripherals,
    ConnectedPeripherals(Vec<Uuid>),
    BondedPeripherals,
    IsConnected(PeripheralId),
    IsScanning,
    RadioState,
    CheckState,
    Snapshot,
}

#[derive(Debug)]
pub(crate) enum Command {
    StartScan {
        options: ScanOptions,
        responder: Responder<Completion>,
    },
    StopScan {
        responder: Responder<Completion>,
    },
    Connect {
        id: PeripheralId,
        options: ConnectOptions,
        responder: Responder<Completion>,
    },
    Disconnect {
        id: PeripheralId,
        responder: Responder<Completion>,
    },
    DiscoverServices {
        id: PeripheralId,
        services: Vec<Uuid>,
        responder: Responder<Completion>,
    },
    DiscoverCharacteristics {
        id: PeripheralId,
        service: Uuid,
        responder: Responder<Completion>,
    },
    Read {
        id: PeripheralId,
        characteristic: CharacteristicId,
        responder: Responder<Completion>,
    },
    Write {
        id: PeripheralId,
        characteristic: CharacteristicId,
        request: WriteRequest,
        responder: Responder<()>,
    },
    SetNotify {
        id: PeripheralId,
        characteristic: CharacteristicId,
        enabled: bool,
        buffer: Option<usize>,
        responder: Responder<Completion>,
    },
    ReadRssi {
        id: PeripheralId,
        responder: Responder<Completion>,
    },
    ReadDescriptor {
        id: PeripheralId,
        characteristic: CharacteristicId,
        descriptor: Uuid,
        responder: Responder<Completion>,
    },
    WriteDescriptor {
        id: PeripheralId,
        characteristic: CharacteristicId,
        descriptor: Uuid,
        data: Vec<u8>,
        responder: Responder<Completion>,
    },
    RemovePeripheral {
        id: PeripheralId,
        responder: Responder<Completion>,
    },
    /// `ticket` narrows a write key down to one caller.
    Abandon {
        key: OperationKey,
        ticket: Option<u64>,
    },
    Query {
        query: Query,
        responder: Responder<Completion>,
    },
}

/// Everything the owner task reacts to, in arrival order.
#[derive(Debug)]
pub(crate) enum Message {
    Command(Command),
    Radio(RadioEvent),
    ScanTimeout(u64),
    Shutdown,
}

/// State owned by the session task and shared by its two halves.
pub(crate) struct Shared<R> {
    pub(crate) radio: R,
    pub(crate) radio_state: RadioState,
    pub(crate) registry: PeripheralRegistry,
    pub(crate) pending: PendingOperationTable<Completion>,
    pub(crate) events: EventEmitter,
}

impl<R: RadioStack> Shared<R> {
    pub(crate) fn ensure_ready(&self) -> Result<()> {
        if self.radio_state.is_ready() {
            Ok(())
        } else {
            Err(Error::RadioNotReady {
                state: self.radio_state,
            })
        }
    }

    pub(crate) fn ensure_known(&self, id: &PeripheralId) -> Result<ConnectionState> {
        self.ensure_ready()?;
        self.registry
            .state(id)
            .ok_or_else(|| Error::UnknownPeripheral(id.clone()))
    }

    pub(crate) fn ensure_connected(&self, id: &PeripheralId) -> Result<()> {
        match self.ensure_known(id)? {
            ConnectionState::Connected => Ok(()),
            _ => Err(Error::NotConnected(id.clone())),
        }
    }
}

struct SessionTask<R> {
    shared: Shared<R>,
    controller: CentralSessionController,
    gatt: GattOperationDispatcher,
}

impl<R: RadioStack> SessionTask<R> {
    async fn run(mut self, mut receiver: mpsc::UnboundedReceiver<Message>) {
        log::info!("Session started");

        while let Some(message) = receiver.recv().await {
            match message {
                Message::Command(command) => self.on_command(command),
                Message::Radio(event) => self.on_radio_event(event),
                Message::ScanTimeout(generation) => {
                    self.controller.on_scan_timeout(&mut self.shared, generation)
                }
                Message::Shutdown => break,
            }
        }

        self.controller.shutdown(&mut self.shared);
        self.shared.pending.reject_all(Error::SessionClosed);
        self.gatt.shutdown();

        log::info!("Session was stopped.");
    }

    fn on_command(&mut self, command: Command) {
        let Self {
            shared,
            controller,
            gatt,
        } = self;

        match command {
            Command::StartScan { options, responder } => {
                responder.send(controller.start_scan(shared, options).map(|_| Completion::Done))
            }
            Command::StopScan { responder } => {
                controller.stop_scan(shared);
                responder.resolve(Completion::Done);
            }
            Command::Connect {
                id,
                options,
                responder,
            } => controller.connect(shared, id, options, responder),
            Command::Disconnect { id, responder } => {
                controller.disconnect(shared, gatt, id, responder)
            }
            Command::DiscoverServices {
                id,
                services,
                responder,
            } => gatt.discover_services(shared, id, services, responder),
            Command::DiscoverCharacteristics {
                id,
                service,
                responder,
            } => gatt.discover_characteristics(shared, id, service, responder),
            Command::Read {
                id,
                characteristic,
                responder,
            } => gatt.read(shared, id, characteristic, responder),
            Command::Write {
                id,
                characteristic,
                request,
                responder,
            } => gatt.write(shared, id, characteristic, request, responder),
            Command::SetNotify {
                id,
                characteristic,
                enabled,
                buffer,
                responder,
            } => gatt.set_notify(shared, id, characteristic, enabled, buffer, responder),
            Command::ReadRssi { id, responder } => gatt.read_rssi(shared, id, responder),
            Command::ReadDescriptor {
                id,
                characteristic,
                descriptor,
                responder,
            } => gatt.read_descriptor(shared, id, characteristic, descriptor, responder),
            Command::WriteDescriptor {
                id,
                characteristic,
                descriptor,
                data,
                responder,
            } => gatt.write_descriptor(shared, id, characteristic, descriptor, data, responder),
            Command::RemovePeripheral { id, responder } => responder.send(
                controller
                    .remove_peripheral(shared, &id)
                    .map(|_| Completion::Done),
            ),
            Command::Abandon { key, ticket } => {
                let abandoned = match (key.kind, ticket) {
                    (OperationKind::Write(characteristic), Some(ticket)) => {
                        gatt.abandon_write(&key.peripheral, &characteristic, ticket)
                    }
                    (OperationKind::Write(characteristic), None) => {
                        gatt.abandon_writes(&key.peripheral, &characteristic) > 0
                    }
                    _ => shared.pending.abandon(&key),
                };
                log::debug!("Abandoned {}: {}", key, abandoned);
            }
            Command::Query { query, responder } => {
                responder.resolve(Self::on_query(shared, controller, gatt, query));
            }
        }
    }

    fn on_query(
        shared: &mut Shared<R>,
        controller: &CentralSessionController,
        gatt: &GattOperationDispatcher,
        query: Query,
    ) -> Completion {
        match query {
            Query::DiscoveredPeripherals => Completion::Peripherals(shared.registry.snapshot()),
            Query::ConnectedPeripherals(services) => Completion::Peripherals(
                shared
                    .registry
                    .iter()
                    .filter(|p| p.is_connected())
                    .filter(|p| {
                        services.is_empty()
                            || p.advertises_any(&services)
                            || gatt.has_any_service(&p.id, &services)
                    })
                    .cloned()
                    .collect(),
            ),
            Query::BondedPeripherals => Completion::Peripherals(
                shared.registry.iter().filter(|p| p.bonded).cloned().collect(),
            ),
            Query::IsConnected(id) => Completion::Flag(
                shared
                    .registry
                    .get(&id)
                    .map_or(false, Peripheral::is_connected),
            ),
            Query::IsScanning => Completion::Flag(controller.is_scanning()),
            Query::RadioState => Completion::RadioState(shared.radio_state),
            Query::CheckState => {
                shared
                    .events
                    .emit(BleEvent::RadioStateChanged(shared.radio_state));
                Completion::RadioState(shared.radio_state)
            }
            Query::Snapshot => Completion::Diagnostics(Diagnostics {
                radio_state: shared.radio_state,
                scanning: controller.is_scanning(),
                peripherals: shared.registry.snapshot(),
                pending: shared.pending.ages(),
                queued_writes: gatt.queued_writes(),
            }),
        }
    }

    fn on_radio_event(&mut self, event: RadioEvent) {
        log::trace!("Radio event: {:?}", event);

        let Self {
            shared,
            controller,
            gatt,
        } = self;

        match event {
            RadioEvent::StateChanged(state) => controller.on_state_changed(shared, gatt, state),
            RadioEvent::Discovered {
                id,
                name,
                advertisement,
                rssi,
            } => controller.on_discovered(shared, id, name, advertisement, rssi),
            RadioEvent::Connected(id) => controller.on_connected(shared, &id),
            RadioEvent::ConnectFailed { id, reason } => {
                controller.on_connect_failed(shared, gatt, &id, reason)
            }
            RadioEvent::DisconnectFailed { id, reason } => {
                controller.on_disconnect_failed(shared, &id, reason)
            }
            RadioEvent::Disconnected { id, error } => {
                controller.on_disconnected(shared, gatt, &id, error)
            }
            RadioEvent::WillRestoreState { peripherals } => {
                controller.on_restore_state(shared, peripherals)
            }
            RadioEvent::BondStateChanged { id, bonded } => {
                controller.on_bond_state_changed(shared, id, bonded)
            }
            RadioEvent::ServicesDiscovered { id, result } => {
                gatt.on_services_discovered(shared, &id, result)
            }
            RadioEvent::CharacteristicsDiscovered {
                id,
                service,
                result,
            } => gatt.on_characteristics_discovered(shared, &id, service, result),
            RadioEvent::ValueUpdated {
                id,
                characteristic,
                result,
            } => gatt.on_value_updated(shared, &id, characteristic, result),
            RadioEvent::WriteCompleted {
                id,
                characteristic,
                result,
            } => gatt.on_write_completed(shared, &id, characteristic, result),
            RadioEvent::NotificationStateChanged {
                id,
                characteristic,
                result,
            } => gatt.on_notification_state_changed(shared, &id, characteristic, result),
            RadioEvent::RssiRead { id, result } => gatt.on_rssi_read(shared, &id, result),
            RadioEvent::DescriptorRead {
                id,
                characteristic,
                descriptor,
                result,
            } => gatt.on_descriptor_read(shared, &id, characteristic, descriptor, result),
            RadioEvent::DescriptorWritten {
                id,
                characteristic,
                descriptor,
                result,
            } => gatt.on_descriptor_written(shared, &id, characteristic, descriptor, result),
        }
    }
}

struct SessionInner {
    sender: mpsc::UnboundedSender<Message>,
    events: EventEmitter,
    operation_timeout: Option<Duration>,
    next_write_ticket: AtomicU64,
    event_stream_stoppers: RwLock<Vec<Trigger>>,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.sender.send(Message::Shutdown).ok();
    }
}

/// Handle to a running BLE session.
///
/// All radio interaction happens on a single task owned by the session;
/// handles only send it commands and await the outcome, so they are cheap to
/// clone and can be used from anywhere. The task stops when [`Session::close`]
/// is called or the last handle is dropped.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Attaches to `radio` and spawns the session task. Must be called from
    /// within a tokio runtime.
    pub fn new<R: RadioStack>(mut radio: R, config: SessionConfig) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let events = EventEmitter::new(config.event_capacity);

        radio.attach(RadioEventSink::new(sender.clone()));

        let task = SessionTask {
            shared: Shared {
                radio,
                radio_state: RadioState::Unknown,
                registry: PeripheralRegistry::new(),
                pending: PendingOperationTable::new(),
                events: events.clone(),
            },
            controller: CentralSessionController::new(sender.clone()),
            gatt: GattOperationDispatcher::new(config.write_chunk_size),
        };
        tokio::spawn(task.run(receiver));

        Self {
            inner: Arc::new(SessionInner {
                sender,
                events,
                operation_timeout: config.operation_timeout,
                next_write_ticket: AtomicU64::new(0),
                event_stream_stoppers: RwLock::new(Vec::new()),
            }),
        }
    }

    /// Stops the session task. Operations still in flight fail with
    /// [`Error::SessionClosed`] and event streams end.
    pub fn close(&self) {
        self.inner.sender.send(Message::Shutdown).ok();
        if let Ok(mut stoppers) = self.inner.event_stream_stoppers.write() {
            stoppers.clear();
        }
    }

    /// Create a new stream that receives session events.
    pub fn event_stream(&self) -> Valved<Pin<Box<dyn Stream<Item = BleEvent> + Send>>> {
        let receiver = self.inner.events.subscribe();

        let stream: Pin<Box<dyn Stream<Item = BleEvent> + Send>> =
            Box::pin(BroadcastStream::new(receiver).filter_map(|x| async move { x.ok() }));

        self.valve(stream)
    }

    /// Create a new stream that receives the notification values of one characteristic.
    pub fn notification_stream(
        &self,
        id: &PeripheralId,
        characteristic: CharacteristicId,
    ) -> Valved<Pin<Box<dyn Stream<Item = Vec<u8>> + Send>>> {
        let receiver = self.inner.events.subscribe();
        let id = id.clone();

        let stream: Pin<Box<dyn Stream<Item = Vec<u8>> + Send>> =
            Box::pin(BroadcastStream::new(receiver).filter_map(move |x| {
                let value = match x {
                    Ok(BleEvent::NotificationValueUpdated {
                        peripheral,
                        characteristic: c,
                        value,
                    }) if peripheral == id && c == characteristic => Some(value),
                    _ => None,
                };
                async move { value }
            }));

        self.valve(stream)
    }

    fn valve<T: Stream>(&self, stream: T) -> Valved<T> {
        let (trigger, stream) = Valved::new(stream);
        if let Ok(mut stoppers) = self.inner.event_stream_stoppers.write() {
            stoppers.push(trigger);
        }
        stream
    }

    /// Start scanning for ble devices.
    pub async fn start_scan(&self, options: ScanOptions) -> Result<()> {
        self.request(None, |responder| Command::StartScan { options, responder })
            .await
            .map(|_| ())
    }

    /// Stop scanning for ble devices. Stopping an idle scanner is not an error.
    pub async fn stop_scan(&self) -> Result<()> {
        self.request(None, |responder| Command::StopScan { responder })
            .await
            .map(|_| ())
    }

    /// Connect to a previously discovered peripheral.
    pub async fn connect(&self, id: &PeripheralId, options: ConnectOptions) -> Result<()> {
        let key = OperationKey::new(id.clone(), OperationKind::Connect);
        let id = id.clone();

        self.request(Some(key), |responder| Command::Connect {
            id,
            options,
            responder,
        })
        .await
        .map(|_| ())
    }

    /// Disconnect from the device. Completes once the radio reports the link gone.
    pub async fn disconnect(&self, id: &PeripheralId) -> Result<()> {
        let key = OperationKey::new(id.clone(), OperationKind::Disconnect);
        let id = id.clone();

        self.request(Some(key), |responder| Command::Disconnect { id, responder })
            .await
            .map(|_| ())
    }

    /// Discover services (all of them for an empty filter) along with their characteristics.
    pub async fn discover_services(&self, id: &PeripheralId, services: &[Uuid]) -> Result<Vec<ServiceInfo>> {
        let key = OperationKey::new(id.clone(), OperationKind::DiscoverServices);
        let id = id.clone();
        let services = services.to_vec();

        let completion = self
            .request(Some(key), |responder| Command::DiscoverServices {
                id,
                services,
                responder,
            })
            .await?;
        expect_completion!(completion, Services)
    }

    pub async fn discover_characteristics(
        &self,
        id: &PeripheralId,
        service: Uuid,
    ) -> Result<Vec<CharacteristicInfo>> {
        let key = OperationKey::new(id.clone(), OperationKind::DiscoverCharacteristics(service));
        let id = id.clone();

        let completion = self
            .request(Some(key), |responder| Command::DiscoverCharacteristics {
                id,
                service,
                responder,
            })
            .await?;
        expect_completion!(completion, Characteristics)
    }

    pub async fn read(&self, id: &PeripheralId, characteristic: CharacteristicId) -> Result<Vec<u8>> {
        let key = OperationKey::new(id.clone(), OperationKind::Read(characteristic));
        let id = id.clone();

        let completion = self
            .request(Some(key), |responder| Command::Read {
                id,
                characteristic,
                responder,
            })
            .await?;
        expect_completion!(completion, Bytes)
    }

    /// Queue a write. Writes to the same characteristic reach the radio in call order.
    pub async fn write(
        &self,
        id: &PeripheralId,
        characteristic: CharacteristicId,
        data: &[u8],
        write_type: WriteType,
    ) -> Result<()> {
        self.queue_write(id, characteristic, data, write_type, None).await
    }

    /// Like [`Session::write`], handing the radio at most `max_chunk_size`
    /// bytes at a time regardless of the session's chunk size.
    pub async fn write_chunked(
        &self,
        id: &PeripheralId,
        characteristic: CharacteristicId,
        data: &[u8],
        write_type: WriteType,
        max_chunk_size: usize,
    ) -> Result<()> {
        self.queue_write(id, characteristic, data, write_type, Some(max_chunk_size))
            .await
    }

    async fn queue_write(
        &self,
        id: &PeripheralId,
        characteristic: CharacteristicId,
        data: &[u8],
        write_type: WriteType,
        chunk_size: Option<usize>,
    ) -> Result<()> {
        let key = OperationKey::new(id.clone(), OperationKind::Write(characteristic));
        let ticket = self.inner.next_write_ticket.fetch_add(1, Ordering::Relaxed);
        let (responder, receiver) = Responder::new();

        self.send(Command::Write {
            id: id.clone(),
            characteristic,
            request: WriteRequest {
                ticket,
                data: data.to_vec(),
                write_type,
                chunk_size,
            },
            responder,
        })?;
        self.completion(Some(key), Some(ticket), receiver).await
    }

    pub async fn write_request(&self, id: &PeripheralId, characteristic: CharacteristicId, data: &[u8]) -> Result<()> {
        self.write(id, characteristic, data, WriteType::WithResponse).await
    }

    pub async fn write_command(&self, id: &PeripheralId, characteristic: CharacteristicId, data: &[u8]) -> Result<()> {
        self.write(id, characteristic, data, WriteType::WithoutResponse).await
    }

    /// Enable or disable notifications. Values arrive as
    /// [`BleEvent::NotificationValueUpdated`] events.
    pub async fn set_notify(&self, id: &PeripheralId, characteristic: CharacteristicId, enabled: bool) -> Result<()> {
        self.notify(id, characteristic, enabled, None).await
    }

    /// Enable notifications, coalescing values into frames of `buffer_len` bytes.
    pub async fn start_notification_with_buffer(
        &self,
        id: &PeripheralId,
        characteristic: CharacteristicId,
        buffer_len: usize,
    ) -> Result<()> {
        self.notify(id, characteristic, true, Some(buffer_len)).await
    }

    async fn notify(
        &self,
        id: &PeripheralId,
        characteristic: CharacteristicId,
        enabled: bool,
        buffer: Option<usize>,
    ) -> Result<()> {
        let key = OperationKey::new(id.clone(), OperationKind::SetNotify(characteristic));
        let id = id.clone();

        let completion = self
            .request(Some(key), |responder| Command::SetNotify {
                id,
                characteristic,
                enabled,
                buffer,
                responder,
            })
            .await?;

        match expect_completion!(completion, Notifying)? {
            notifying if notifying == enabled => Ok(()),
            notifying => Err(Error::NotifyError(format!(
                "radio reports notifying = {}",
                notifying
            ))),
        }
    }

    /// Signal strength
    pub async fn read_rssi(&self, id: &PeripheralId) -> Result<i16> {
        let key = OperationKey::new(id.clone(), OperationKind::ReadRssi);
        let id = id.clone();

        let completion = self
            .request(Some(key), |responder| Command::ReadRssi { id, responder })
            .await?;
        expect_completion!(completion, Rssi)
    }

    pub async fn read_descriptor(
        &self,
        id: &PeripheralId,
        characteristic: CharacteristicId,
        descriptor: Uuid,
    ) -> Result<Vec<u8>> {
        let key = OperationKey::new(id.clone(), OperationKind::ReadDescriptor(characteristic, descriptor));
        let id = id.clone();

        let completion = self
            .request(Some(key), |responder| Command::ReadDescriptor {
                id,
                characteristic,
                descriptor,
                responder,
            })
            .await?;
        expect_completion!(completion, Bytes)
    }

    /// Write a descriptor value. Not queued behind characteristic writes.
    pub async fn write_descriptor(
        &self,
        id: &PeripheralId,
        characteristic: CharacteristicId,
        descriptor: Uuid,
        data: &[u8],
    ) -> Result<()> {
        let key = OperationKey::new(id.clone(), OperationKind::WriteDescriptor(characteristic, descriptor));
        let id = id.clone();
        let data = data.to_vec();

        self.request(Some(key), |responder| Command::WriteDescriptor {
            id,
            characteristic,
            descriptor,
            data,
            responder,
        })
        .await
        .map(|_| ())
    }

    /// Stop waiting for an operation. The radio is not told; whatever it
    /// answers later is ignored. For a write key, every write of that
    /// characteristic the radio has not seen yet is dropped, and the one
    /// under way completes unobserved. An abandoned connect keeps the
    /// peripheral latched until the radio answers or [`Session::disconnect`]
    /// cancels it.
    pub fn abandon(&self, key: OperationKey) {
        self.send(Command::Abandon { key, ticket: None }).ok();
    }

    /// Forget a peripheral. Refused while it is connected or connecting.
    pub async fn remove_peripheral(&self, id: &PeripheralId) -> Result<()> {
        let id = id.clone();
        self.request(None, |responder| Command::RemovePeripheral { id, responder })
            .await
            .map(|_| ())
    }

    pub async fn discovered_peripherals(&self) -> Result<Vec<Peripheral>> {
        let completion = self.query(Query::DiscoveredPeripherals).await?;
        expect_completion!(completion, Peripherals)
    }

    /// Connected peripherals, optionally only those exposing one of `services`.
    pub async fn connected_peripherals(&self, services: &[Uuid]) -> Result<Vec<Peripheral>> {
        let completion = self
            .query(Query::ConnectedPeripherals(services.to_vec()))
            .await?;
        expect_completion!(completion, Peripherals)
    }

    pub async fn bonded_peripherals(&self) -> Result<Vec<Peripheral>> {
        let completion = self.query(Query::BondedPeripherals).await?;
        expect_completion!(completion, Peripherals)
    }

    pub async fn is_connected(&self, id: &PeripheralId) -> Result<bool> {
        let completion = self.query(Query::IsConnected(id.clone())).await?;
        expect_completion!(completion, Flag)
    }

    pub async fn is_scanning(&self) -> Result<bool> {
        let completion = self.query(Query::IsScanning).await?;
        expect_completion!(completion, Flag)
    }

    pub async fn radio_state(&self) -> Result<RadioState> {
        let completion = self.query(Query::RadioState).await?;
        expect_completion!(completion, RadioState)
    }

    /// Like [`Session::radio_state`], but also re-emits the state as an event.
    pub async fn check_state(&self) -> Result<RadioState> {
        let completion = self.query(Query::CheckState).await?;
        expect_completion!(completion, RadioState)
    }

    pub async fn snapshot(&self) -> Result<Diagnostics> {
        let completion = self.query(Query::Snapshot).await?;
        expect_completion!(completion, Diagnostics)
    }

    async fn query(&self, query: Query) -> Result<Completion> {
        self.request(None, |responder| Command::Query { query, responder })
            .await
    }

    async fn request(
        &self,
        key: Option<OperationKey>,
        command: impl FnOnce(Responder<Completion>) -> Command,
    ) -> Result<Completion> {
        let (responder, receiver) = Responder::new();
        self.send(command(responder))?;
        self.completion(key, None, receiver).await
    }

    fn send(&self, command: Command) -> Result<()> {
        self.inner
            .sender
            .send(Message::Command(command))
            .map_err(|_| Error::SessionClosed)
    }

    /// Waits for the outcome of `key`, abandoning it (or only the write
    /// `ticket`) once the operation timeout passes.
    async fn completion<T>(
        &self,
        key: Option<OperationKey>,
        ticket: Option<u64>,
        receiver: oneshot::Receiver<Result<T>>,
    ) -> Result<T> {
        let received = match (self.inner.operation_timeout, key) {
            (Some(timeout), Some(key)) => match tokio::time::timeout(timeout, receiver).await {
                Ok(received) => received,
                Err(_) => {
                    log::warn!("{} timed out after {:?}", key, timeout);
                    self.send(Command::Abandon { key, ticket }).ok();
                    return Err(Error::Timeout);
                }
            },
            _ => receiver.await,
        };

        match received {
            Ok(result) => result,
            Err(_) if self.inner.sender.is_closed() => Err(Error::SessionClosed),
            Err(_) => Err(Error::Abandoned),
        }
    }
}
