use std::collections::{HashMap, HashSet};

use uuid::Uuid;

use crate::characteristic::{CharacteristicId, CharacteristicInfo};
use crate::common::PeripheralId;
use crate::event::BleEvent;
use crate::notify_buffer::NotifyBuffer;
use crate::pending::{OperationKey, OperationKind, Responder};
use crate::radio::RadioStack;
use crate::service::ServiceInfo;
use crate::session::{Completion, Shared};
use crate::write_queue::{WriteQueue, WriteQueueEntry, WriteRequest};
use crate::Error;

type Subscription = (PeripheralId, CharacteristicId);

/// Characteristics collected for a `discover_services` call, one radio
/// request per service.
#[derive(Debug)]
struct ServiceDiscovery {
    order: Vec<Uuid>,
    found: HashMap<Uuid, Vec<CharacteristicInfo>>,
    remaining: HashSet<Uuid>,
}

impl ServiceDiscovery {
    fn new(order: Vec<Uuid>) -> Self {
        Self {
            remaining: order.iter().copied().collect(),
            found: HashMap::new(),
            order,
        }
    }

    fn into_services(mut self) -> Vec<ServiceInfo> {
        self.order
            .into_iter()
            .map(|uuid| ServiceInfo {
                uuid,
                characteristics: self.found.remove(&uuid).unwrap_or_default(),
            })
            .collect()
    }
}

/// GATT operations on connected peripherals. Never changes connection state.
#[derive(Debug)]
pub(crate) struct GattOperationDispatcher {
    writes: WriteQueue,
    write_chunk_size: Option<usize>,
    discoveries: HashMap<PeripheralId, ServiceDiscovery>,
    /// Services found by the last successful discovery of each peripheral
    services: HashMap<PeripheralId, Vec<Uuid>>,
    notifying: HashSet<Subscription>,
    /// Frame sizes asked for by notification requests still in flight
    requested_buffers: HashMap<Subscription, usize>,
    buffers: HashMap<Subscription, NotifyBuffer>,
}

impl GattOperationDispatcher {
    pub(crate) fn new(write_chunk_size: Option<usize>) -> Self {
        Self {
            writes: WriteQueue::new(),
            write_chunk_size,
            discoveries: HashMap::new(),
            services: HashMap::new(),
            notifying: HashSet::new(),
            requested_buffers: HashMap::new(),
            buffers: HashMap::new(),
        }
    }

    pub(crate) fn discover_services<R: RadioStack>(
        &mut self,
        shared: &mut Shared<R>,
        id: PeripheralId,
        services: Vec<Uuid>,
        responder: Responder<Completion>,
    ) {
        if let Err(e) = shared.ensure_connected(&id) {
            return responder.reject(e);
        }

        let key = OperationKey::new(id.clone(), OperationKind::DiscoverServices);
        if !shared.pending.register(key.clone(), responder) {
            return;
        }
        self.discoveries.remove(&id);

        log::debug!("Discovering services of {} (filter: {:?})", id, services);
        if let Err(e) = shared.radio.discover_services(&id, &services) {
            shared.pending.reject(&key, Error::DiscoveryError(e.to_string()));
        }
    }

    pub(crate) fn on_services_discovered<R: RadioStack>(
        &mut self,
        shared: &mut Shared<R>,
        id: &PeripheralId,
        result: Result<Vec<Uuid>, String>,
    ) {
        let key = OperationKey::new(id.clone(), OperationKind::DiscoverServices);

        let services = match result {
            Ok(services) => services,
            Err(reason) => {
                log::warn!("Service discovery of {} failed: {}", id, reason);
                shared.pending.reject(&key, Error::DiscoveryError(reason));
                return;
            }
        };

        if shared.registry.contains(id) {
            self.services.insert(id.clone(), services.clone());
        }

        if !shared.pending.contains(&key) {
            log::trace!("Nobody waits for the services of {}", id);
            return;
        }

        if services.is_empty() {
            shared.pending.resolve(&key, Completion::Services(Vec::new()));
            return;
        }

        for service in &services {
            if let Err(e) = shared.radio.discover_characteristics(id, *service) {
                shared.pending.reject(&key, Error::DiscoveryError(e.to_string()));
                return;
            }
        }
        self.discoveries
            .insert(id.clone(), ServiceDiscovery::new(services));
    }

    pub(crate) fn discover_characteristics<R: RadioStack>(
        &mut self,
        shared: &mut Shared<R>,
        id: PeripheralId,
        service: Uuid,
        responder: Responder<Completion>,
    ) {
        if let Err(e) = shared.ensure_connected(&id) {
            return responder.reject(e);
        }

        let key = OperationKey::new(id.clone(), OperationKind::DiscoverCharacteristics(service));
        if !shared.pending.register(key.clone(), responder) {
            return;
        }

        if let Err(e) = shared.radio.discover_characteristics(&id, service) {
            shared.pending.reject(&key, Error::DiscoveryError(e.to_string()));
        }
    }

    pub(crate) fn on_characteristics_discovered<R: RadioStack>(
        &mut self,
        shared: &mut Shared<R>,
        id: &PeripheralId,
        service: Uuid,
        result: Result<Vec<CharacteristicInfo>, String>,
    ) {
        shared.pending.complete(
            &OperationKey::new(id.clone(), OperationKind::DiscoverCharacteristics(service)),
            result
                .clone()
                .map(Completion::Characteristics)
                .map_err(Error::DiscoveryError),
        );

        let Some(discovery) = self.discoveries.get_mut(id) else {
            return;
        };
        if !discovery.remaining.remove(&service) {
            return;
        }

        let key = OperationKey::new(id.clone(), OperationKind::DiscoverServices);
        match result {
            Err(reason) => {
                self.discoveries.remove(id);
                shared.pending.reject(&key, Error::DiscoveryError(reason));
            }
            Ok(characteristics) => {
                discovery.found.insert(service, characteristics);
                if discovery.remaining.is_empty() {
                    if let Some(discovery) = self.discoveries.remove(id) {
                        shared
                            .pending
                            .resolve(&key, Completion::Services(discovery.into_services()));
                    }
                }
            }
        }
    }

    pub(crate) fn read<R: RadioStack>(
        &mut self,
        shared: &mut Shared<R>,
        id: PeripheralId,
        characteristic: CharacteristicId,
        responder: Responder<Completion>,
    ) {
        if let Err(e) = shared.ensure_connected(&id) {
            return responder.reject(e);
        }

        let key = OperationKey::new(id.clone(), OperationKind::Read(characteristic));
        if !shared.pending.register(key.clone(), responder) {
            return;
        }

        if let Err(e) = shared.radio.read(&id, &characteristic) {
            shared.pending.reject(&key, Error::ReadError(e.to_string()));
        }
    }

    /// A value with a read waiting for it answers that read, anything else is
    /// a notification.
    pub(crate) fn on_value_updated<R: RadioStack>(
        &mut self,
        shared: &mut Shared<R>,
        id: &PeripheralId,
        characteristic: CharacteristicId,
        result: Result<Vec<u8>, String>,
    ) {
        let key = OperationKey::new(id.clone(), OperationKind::Read(characteristic));
        if shared.pending.contains(&key) {
            shared.pending.complete(
                &key,
                result.map(Completion::Bytes).map_err(Error::ReadError),
            );
            return;
        }

        let value = match result {
            Ok(value) => value,
            Err(reason) => {
                log::warn!("Value update of {} on {} failed: {}", characteristic, id, reason);
                return;
            }
        };

        let subscription = (id.clone(), characteristic);
        let frames = match self.buffers.get_mut(&subscription) {
            Some(buffer) => buffer.push(&value),
            None => vec![value],
        };

        for value in frames {
            shared.events.emit(BleEvent::NotificationValueUpdated {
                peripheral: id.clone(),
                characteristic,
                value,
            });
        }
    }

    pub(crate) fn write<R: RadioStack>(
        &mut self,
        shared: &mut Shared<R>,
        id: PeripheralId,
        characteristic: CharacteristicId,
        request: WriteRequest,
        responder: Responder<()>,
    ) {
        if let Err(e) = shared.ensure_connected(&id) {
            return responder.reject(e);
        }

        let entry = WriteQueueEntry::new(request, self.write_chunk_size, responder);
        if !self.writes.enqueue(id.clone(), characteristic, entry) {
            log::trace!(
                "Write to {} on {} queued behind {} others",
                characteristic,
                id,
                self.writes.lane_len(&id, &characteristic) - 1
            );
            return;
        }

        self.pump(shared, &id, &characteristic);
    }

    pub(crate) fn on_write_completed<R: RadioStack>(
        &mut self,
        shared: &mut Shared<R>,
        id: &PeripheralId,
        characteristic: CharacteristicId,
        result: Result<(), String>,
    ) {
        if !self.writes.on_write_completed(id, &characteristic, result) {
            log::trace!("Ignoring write completion for {} on {}", characteristic, id);
            return;
        }

        self.pump(shared, id, &characteristic);
    }

    fn pump<R: RadioStack>(
        &mut self,
        shared: &mut Shared<R>,
        id: &PeripheralId,
        characteristic: &CharacteristicId,
    ) {
        let radio = &mut shared.radio;
        self.writes.pump(id, characteristic, |chunk, write_type| {
            radio.write(id, characteristic, chunk, write_type)
        });
    }

    pub(crate) fn set_notify<R: RadioStack>(
        &mut self,
        shared: &mut Shared<R>,
        id: PeripheralId,
        characteristic: CharacteristicId,
        enabled: bool,
        buffer: Option<usize>,
        responder: Responder<Completion>,
    ) {
        if let Err(e) = shared.ensure_connected(&id) {
            return responder.reject(e);
        }

        let key = OperationKey::new(id.clone(), OperationKind::SetNotify(characteristic));
        if !shared.pending.register(key.clone(), responder) {
            return;
        }

        let subscription = (id.clone(), characteristic);
        match buffer {
            Some(len) if enabled => {
                self.requested_buffers.insert(subscription.clone(), len);
            }
            _ => {
                self.requested_buffers.remove(&subscription);
            }
        }

        log::debug!(
            "{} notifications of {} on {}",
            if enabled { "Enabling" } else { "Disabling" },
            characteristic,
            id
        );
        if let Err(e) = shared.radio.set_notify(&id, &characteristic, enabled) {
            self.requested_buffers.remove(&subscription);
            shared.pending.reject(&key, Error::NotifyError(e.to_string()));
        }
    }

    pub(crate) fn on_notification_state_changed<R: RadioStack>(
        &mut self,
        shared: &mut Shared<R>,
        id: &PeripheralId,
        characteristic: CharacteristicId,
        result: Result<bool, String>,
    ) {
        let subscription = (id.clone(), characteristic);
        let key = OperationKey::new(id.clone(), OperationKind::SetNotify(characteristic));
        let requested_buffer = self.requested_buffers.remove(&subscription);

        let (is_notifying, error) = match result {
            Ok(true) => {
                self.notifying.insert(subscription.clone());
                match requested_buffer {
                    Some(len) => {
                        self.buffers.insert(subscription, NotifyBuffer::new(len));
                    }
                    None => {
                        self.buffers.remove(&subscription);
                    }
                }
                shared.pending.resolve(&key, Completion::Notifying(true));
                (true, None)
            }
            Ok(false) => {
                self.notifying.remove(&subscription);
                self.buffers.remove(&subscription);
                shared.pending.resolve(&key, Completion::Notifying(false));
                (false, None)
            }
            Err(reason) => {
                log::warn!(
                    "Notification update of {} on {} failed: {}",
                    characteristic,
                    id,
                    reason
                );
                shared
                    .pending
                    .reject(&key, Error::NotifyError(reason.clone()));
                (self.notifying.contains(&subscription), Some(reason))
            }
        };

        shared.events.emit(BleEvent::NotificationStateChanged {
            peripheral: id.clone(),
            characteristic,
            is_notifying,
            error,
        });
    }

    pub(crate) fn read_rssi<R: RadioStack>(
        &mut self,
        shared: &mut Shared<R>,
        id: PeripheralId,
        responder: Responder<Completion>,
    ) {
        if let Err(e) = shared.ensure_connected(&id) {
            return responder.reject(e);
        }

        let key = OperationKey::new(id.clone(), OperationKind::ReadRssi);
        if !shared.pending.register(key.clone(), responder) {
            return;
        }

        if let Err(e) = shared.radio.read_rssi(&id) {
            shared.pending.reject(&key, Error::ReadError(e.to_string()));
        }
    }

    pub(crate) fn on_rssi_read<R: RadioStack>(
        &mut self,
        shared: &mut Shared<R>,
        id: &PeripheralId,
        result: Result<i16, String>,
    ) {
        if let Ok(rssi) = result {
            shared.registry.set_rssi(id, rssi);
        }

        shared.pending.complete(
            &OperationKey::new(id.clone(), OperationKind::ReadRssi),
            result.map(Completion::Rssi).map_err(Error::ReadError),
        );
    }

    pub(crate) fn read_descriptor<R: RadioStack>(
        &mut self,
        shared: &mut Shared<R>,
        id: PeripheralId,
        characteristic: CharacteristicId,
        descriptor: Uuid,
        responder: Responder<Completion>,
    ) {
        if let Err(e) = shared.ensure_connected(&id) {
            return responder.reject(e);
        }

        let key = OperationKey::new(id.clone(), OperationKind::ReadDescriptor(characteristic, descriptor));
        if !shared.pending.register(key.clone(), responder) {
            return;
        }

        if let Err(e) = shared.radio.read_descriptor(&id, &characteristic, descriptor) {
            shared.pending.reject(&key, Error::ReadError(e.to_string()));
        }
    }

    pub(crate) fn on_descriptor_read<R: RadioStack>(
        &mut self,
        shared: &mut Shared<R>,
        id: &PeripheralId,
        characteristic: CharacteristicId,
        descriptor: Uuid,
        result: Result<Vec<u8>, String>,
    ) {
        shared.pending.complete(
            &OperationKey::new(id.clone(), OperationKind::ReadDescriptor(characteristic, descriptor)),
            result.map(Completion::Bytes).map_err(Error::ReadError),
        );
    }

    pub(crate) fn write_descriptor<R: RadioStack>(
        &mut self,
        shared: &mut Shared<R>,
        id: PeripheralId,
        characteristic: CharacteristicId,
        descriptor: Uuid,
        data: Vec<u8>,
        responder: Responder<Completion>,
    ) {
        if let Err(e) = shared.ensure_connected(&id) {
            return responder.reject(e);
        }

        let key = OperationKey::new(id.clone(), OperationKind::WriteDescriptor(characteristic, descriptor));
        if !shared.pending.register(key.clone(), responder) {
            return;
        }

        log::debug!("Writing {} bytes to descriptor {} of {} on {}", data.len(), descriptor, characteristic, id);
        if let Err(e) = shared
            .radio
            .write_descriptor(&id, &characteristic, descriptor, &data)
        {
            shared.pending.reject(&key, Error::WriteError(e.to_string()));
        }
    }

    pub(crate) fn on_descriptor_written<R: RadioStack>(
        &mut self,
        shared: &mut Shared<R>,
        id: &PeripheralId,
        characteristic: CharacteristicId,
        descriptor: Uuid,
        result: Result<(), String>,
    ) {
        shared.pending.complete(
            &OperationKey::new(id.clone(), OperationKind::WriteDescriptor(characteristic, descriptor)),
            result.map(|_| Completion::Done).map_err(Error::WriteError),
        );
    }

    /// Asks the radio to stop every notification of a peripheral that is
    /// about to be disconnected. Failures are only logged.
    pub(crate) fn disable_notifications<R: RadioStack>(&mut self, shared: &mut Shared<R>, id: &PeripheralId) {
        for (_, characteristic) in self.notifying.iter().filter(|(p, _)| p == id) {
            if let Err(e) = shared.radio.set_notify(id, characteristic, false) {
                log::debug!("Could not unsubscribe {} on {}: {}", characteristic, id, e);
            }
        }
    }

    /// Drops every GATT state of a peripheral whose link is gone. Returns the
    /// number of queued writes that were rejected.
    pub(crate) fn link_lost(&mut self, id: &PeripheralId) -> usize {
        self.discoveries.remove(id);
        self.services.remove(id);
        self.notifying.retain(|(p, _)| p != id);
        self.requested_buffers.retain(|(p, _), _| p != id);
        self.buffers.retain(|(p, _), _| p != id);

        self.writes
            .reject_peripheral(id, Error::PeripheralDisconnected(id.clone()))
    }

    /// Lets go of one caller's write. See [`WriteQueue::abandon`].
    pub(crate) fn abandon_write(&mut self, id: &PeripheralId, characteristic: &CharacteristicId, ticket: u64) -> bool {
        self.writes.abandon(id, characteristic, ticket)
    }

    /// Lets go of every caller writing to one characteristic.
    pub(crate) fn abandon_writes(&mut self, id: &PeripheralId, characteristic: &CharacteristicId) -> usize {
        self.writes.abandon_lane(id, characteristic)
    }

    pub(crate) fn has_any_service(&self, id: &PeripheralId, services: &[Uuid]) -> bool {
        self.services
            .get(id)
            .map_or(false, |found| found.iter().any(|s| services.contains(s)))
    }

    pub(crate) fn queued_writes(&self) -> usize {
        self.writes.len()
    }

    pub(crate) fn shutdown(&mut self) {
        self.writes.reject_all(Error::SessionClosed);
    }
}
