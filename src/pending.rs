use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use uuid::Uuid;

use crate::characteristic::CharacteristicId;
use crate::common::PeripheralId;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Connect,
    Disconnect,
    DiscoverServices,
    DiscoverCharacteristics(Uuid),
    Read(CharacteristicId),
    Write(CharacteristicId),
    SetNotify(CharacteristicId),
    ReadRssi,
    ReadDescriptor(CharacteristicId, Uuid),
    WriteDescriptor(CharacteristicId, Uuid),
}

/// Identity of one outstanding radio interaction. At most one operation per
/// key may be in flight.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OperationKey {
    pub peripheral: PeripheralId,
    pub kind: OperationKind,
}

impl OperationKey {
    pub fn new(peripheral: PeripheralId, kind: OperationKind) -> Self {
        Self { peripheral, kind }
    }
}

impl fmt::Display for OperationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            OperationKind::Connect => write!(f, "connect({})", self.peripheral),
            OperationKind::Disconnect => write!(f, "disconnect({})", self.peripheral),
            OperationKind::DiscoverServices => {
                write!(f, "discover-services({})", self.peripheral)
            }
            OperationKind::DiscoverCharacteristics(service) => {
                write!(f, "discover-characteristics({}, {})", self.peripheral, service)
            }
            OperationKind::Read(c) => write!(f, "read({}, {})", self.peripheral, c),
            OperationKind::Write(c) => write!(f, "write({}, {})", self.peripheral, c),
            OperationKind::SetNotify(c) => write!(f, "set-notify({}, {})", self.peripheral, c),
            OperationKind::ReadRssi => write!(f, "read-rssi({})", self.peripheral),
            OperationKind::ReadDescriptor(c, d) => {
                write!(f, "read-descriptor({}, {}, {})", self.peripheral, c, d)
            }
            OperationKind::WriteDescriptor(c, d) => {
                write!(f, "write-descriptor({}, {}, {})", self.peripheral, c, d)
            }
        }
    }
}

/// Completion sink of one caller. Consumed by the first resolution.
#[derive(Debug)]
pub(crate) struct Responder<T> {
    sender: oneshot::Sender<Result<T>>,
}

impl<T> Responder<T> {
    pub(crate) fn new() -> (Self, oneshot::Receiver<Result<T>>) {
        let (sender, receiver) = oneshot::channel();
        (Self { sender }, receiver)
    }

    pub(crate) fn resolve(self, value: T) {
        self.send(Ok(value));
    }

    pub(crate) fn reject(self, error: Error) {
        self.send(Err(error));
    }

    pub(crate) fn send(self, result: Result<T>) {
        // The caller may have stopped waiting; nothing left to notify then.
        if self.sender.send(result).is_err() {
            log::trace!("Completion dropped, caller is gone");
        }
    }
}

#[derive(Debug)]
struct PendingOperation<T> {
    responder: Responder<T>,
    created_at: Instant,
}

/// Correlates radio callbacks with the callers that are waiting for them.
#[derive(Debug)]
pub(crate) struct PendingOperationTable<T> {
    entries: HashMap<OperationKey, PendingOperation<T>>,
}

impl<T> Default for PendingOperationTable<T> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<T> PendingOperationTable<T> {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Registers a caller for `key`. If the key is already occupied, the new
    /// caller is rejected with [`Error::DuplicateOperation`] and the existing
    /// one is left alone.
    pub(crate) fn register(&mut self, key: OperationKey, responder: Responder<T>) -> bool {
        if self.entries.contains_key(&key) {
            log::debug!("Rejecting duplicate operation {}", key);
            responder.reject(Error::DuplicateOperation(key));
            return false;
        }

        self.entries.insert(
            key,
            PendingOperation {
                responder,
                created_at: Instant::now(),
            },
        );
        true
    }

    #[inline]
    pub(crate) fn contains(&self, key: &OperationKey) -> bool {
        self.entries.contains_key(key)
    }

    pub(crate) fn resolve(&mut self, key: &OperationKey, value: T) -> bool {
        self.complete(key, Ok(value))
    }

    pub(crate) fn reject(&mut self, key: &OperationKey, error: Error) -> bool {
        self.complete(key, Err(error))
    }

    /// Removes and notifies the caller of `key`. Callbacks for keys that are
    /// no longer pending are ignored.
    pub(crate) fn complete(&mut self, key: &OperationKey, result: Result<T>) -> bool {
        match self.entries.remove(key) {
            Some(pending) => {
                pending.responder.send(result);
                true
            }
            None => {
                log::trace!("No pending operation for {}, ignoring", key);
                false
            }
        }
    }

    /// Drops the caller of `key` without notifying it. The radio is not told;
    /// its eventual callback finds nothing to resolve.
    pub(crate) fn abandon(&mut self, key: &OperationKey) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Rejects every pending operation of one peripheral, returning how many
    /// callers were notified.
    pub(crate) fn reject_peripheral(&mut self, peripheral: &PeripheralId, error: Error) -> usize {
        let keys = self
            .entries
            .keys()
            .filter(|key| &key.peripheral == peripheral)
            .cloned()
            .collect::<Vec<_>>();

        for key in &keys {
            self.reject(key, error.clone());
        }

        keys.len()
    }

    /// Rejects everything, used on session teardown.
    pub(crate) fn reject_all(&mut self, error: Error) {
        for (_, pending) in self.entries.drain() {
            pending.responder.reject(error.clone());
        }
    }

    /// Pending keys along with how long they have been waiting.
    pub(crate) fn ages(&self) -> Vec<(OperationKey, Duration)> {
        let now = Instant::now();
        self.entries
            .iter()
            .map(|(key, pending)| (key.clone(), now.duration_since(pending.created_at)))
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(peripheral: &str, kind: OperationKind) -> OperationKey {
        OperationKey::new(PeripheralId::from(peripheral), kind)
    }

    #[test]
    fn resolves_exactly_once() {
        let mut table = PendingOperationTable::new();
        let (responder, mut rx) = Responder::new();
        let key = key("a", OperationKind::ReadRssi);

        assert!(table.register(key.clone(), responder));
        assert!(table.resolve(&key, -42));
        assert!(!table.resolve(&key, -1));
        assert!(!table.reject(&key, Error::Timeout));

        assert_eq!(rx.try_recv().unwrap(), Ok(-42));
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn duplicate_registration_keeps_the_first_caller() {
        let mut table = PendingOperationTable::new();
        let key = key("a", OperationKind::Connect);
        let (first, mut first_rx) = Responder::new();
        let (second, mut second_rx) = Responder::new();

        assert!(table.register(key.clone(), first));
        assert!(!table.register(key.clone(), second));

        assert_eq!(
            second_rx.try_recv().unwrap(),
            Err(Error::DuplicateOperation(key.clone()))
        );

        table.resolve(&key, ());
        assert_eq!(first_rx.try_recv().unwrap(), Ok(()));
    }

    #[test]
    fn reject_peripheral_only_touches_that_peripheral() {
        let mut table = PendingOperationTable::new();
        let c = CharacteristicId::new(Uuid::from_u128(1), Uuid::from_u128(2));
        let (read, mut read_rx) = Responder::new();
        let (notify, mut notify_rx) = Responder::new();
        let (other, mut other_rx) = Responder::new();

        table.register(key("a", OperationKind::Read(c)), read);
        table.register(key("a", OperationKind::SetNotify(c)), notify);
        table.register(key("b", OperationKind::Read(c)), other);

        let a = PeripheralId::from("a");
        assert_eq!(
            table.reject_peripheral(&a, Error::PeripheralDisconnected(a.clone())),
            2
        );

        assert_eq!(
            read_rx.try_recv().unwrap(),
            Err::<u8, _>(Error::PeripheralDisconnected(a.clone()))
        );
        assert_eq!(
            notify_rx.try_recv().unwrap(),
            Err(Error::PeripheralDisconnected(a))
        );
        assert!(other_rx.try_recv().is_err());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn abandoned_operations_ignore_late_callbacks() {
        let mut table = PendingOperationTable::<u8>::new();
        let (responder, mut rx) = Responder::new();
        let key = key("a", OperationKind::DiscoverServices);

        table.register(key.clone(), responder);
        assert!(table.abandon(&key));
        assert!(!table.resolve(&key, 1));

        // The sink was dropped without a value.
        assert!(matches!(
            rx.try_recv(),
            Err(oneshot::error::TryRecvError::Closed)
        ));
    }
}
