use std::time::Duration;

use tokio::sync::mpsc;

use crate::common::{ConnectionState, PeripheralId, RadioState};
use crate::event::{BleEvent, DisconnectReason, StopScanReason};
use crate::gatt::GattOperationDispatcher;
use crate::peripheral::{AdvertisementData, Peripheral};
use crate::pending::{OperationKey, OperationKind, Responder};
use crate::radio::{ConnectOptions, RadioStack, RestoredPeripheral};
use crate::scanner::{ScanOptions, ScanState};
use crate::session::{Completion, Message, Shared};
use crate::{Error, Result};

/// Scanning and connection lifecycle. The only place that changes a
/// peripheral's connection state.
pub(crate) struct CentralSessionController {
    latch: crate::latch::ConnectionLatch,
    scan: Option<ScanState>,
    scan_generation: u64,
    /// Feeds scan timeouts back into the session task
    timer_sender: mpsc::UnboundedSender<Message>,
}

impl CentralSessionController {
    pub(crate) fn new(timer_sender: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            latch: crate::latch::ConnectionLatch::new(),
            scan: None,
            scan_generation: 0,
            timer_sender,
        }
    }

    #[inline]
    pub(crate) fn is_scanning(&self) -> bool {
        self.scan.is_some()
    }

    pub(crate) fn start_scan<R: RadioStack>(
        &mut self,
        shared: &mut Shared<R>,
        options: ScanOptions,
    ) -> Result<()> {
        shared.ensure_ready()?;

        if self.scan.is_some() {
            log::info!("Scan already running, restarting with new options");
        } else {
            log::info!("Starting the scan");
        }

        shared
            .radio
            .start_scan(options.services(), options.duplicates_allowed())?;

        self.scan_generation += 1;
        if let Some(timeout) = options.timeout() {
            self.schedule_scan_timeout(timeout, self.scan_generation);
        }
        self.scan = Some(ScanState::new(options, self.scan_generation));

        Ok(())
    }

    fn schedule_scan_timeout(&self, timeout: Duration, generation: u64) {
        let sender = self.timer_sender.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            sender.send(Message::ScanTimeout(generation)).ok();
        });
    }

    pub(crate) fn stop_scan<R: RadioStack>(&mut self, shared: &mut Shared<R>) {
        if self.scan.is_none() {
            log::info!("Scanner is already stopped");
            shared.events.emit(BleEvent::StopScan {
                reason: StopScanReason::Requested,
            });
            return;
        }

        self.end_scan(shared, StopScanReason::Requested);
    }

    fn end_scan<R: RadioStack>(&mut self, shared: &mut Shared<R>, reason: StopScanReason) {
        if self.scan.take().is_none() {
            return;
        }

        if reason != StopScanReason::RadioUnavailable {
            if let Err(e) = shared.radio.stop_scan() {
                log::warn!("Radio refused to stop the scan: {}", e);
            }
        }

        log::info!("Scanner was stopped ({:?}).", reason);
        shared.events.emit(BleEvent::StopScan { reason });
    }

    pub(crate) fn on_scan_timeout<R: RadioStack>(&mut self, shared: &mut Shared<R>, generation: u64) {
        match &self.scan {
            Some(scan) if scan.generation == generation => {
                log::info!("Scanner stop condition reached.");
                self.end_scan(shared, StopScanReason::Timeout);
            }
            _ => log::trace!("Stale scan timer #{} fired", generation),
        }
    }

    pub(crate) fn on_discovered<R: RadioStack>(
        &mut self,
        shared: &mut Shared<R>,
        id: PeripheralId,
        name: Option<String>,
        advertisement: AdvertisementData,
        rssi: Option<i16>,
    ) {
        let Some(scan) = self.scan.as_mut() else {
            if shared.registry.contains(&id) {
                shared.registry.upsert_discovered(id, name, advertisement, rssi);
            } else {
                log::trace!("Ignoring advertisement of {} outside of a scan", id);
            }
            return;
        };

        let mut candidate = shared
            .registry
            .get(&id)
            .cloned()
            .unwrap_or_else(|| Peripheral::new(id.clone()));
        if name.is_some() {
            candidate.name = name.clone();
        }
        candidate.advertisement = advertisement.clone();

        if !scan.passes_filters(&candidate) {
            log::trace!("Device {} filtered out", id);
            return;
        }

        if shared
            .registry
            .upsert_discovered(id.clone(), name, advertisement, rssi)
        {
            log::info!("Found device: {}", id);
        }

        if let Some(peripheral) = shared.registry.get(&id) {
            shared
                .events
                .emit(BleEvent::DiscoveredPeripheral(peripheral.clone()));
        }

        if scan.record_match(&id) {
            log::info!("Scanner stop condition reached.");
            self.end_scan(shared, StopScanReason::MatchLimit);
        }
    }

    pub(crate) fn connect<R: RadioStack>(
        &mut self,
        shared: &mut Shared<R>,
        id: PeripheralId,
        options: ConnectOptions,
        responder: Responder<Completion>,
    ) {
        match shared.ensure_known(&id) {
            Err(e) => return responder.reject(e),
            Ok(ConnectionState::Disconnecting) => {
                return responder.reject(Error::DisconnectInProgress(id))
            }
            Ok(ConnectionState::Connected) => {
                log::debug!("Already connected to {}", id);
                return responder.resolve(Completion::Done);
            }
            Ok(_) => {}
        }

        if let Err(e) = self.latch.acquire(&id) {
            return responder.reject(e);
        }

        let key = OperationKey::new(id.clone(), OperationKind::Connect);
        if !shared.pending.register(key.clone(), responder) {
            self.latch.release(&id);
            return;
        }

        log::info!("Connecting to device {}", id);
        shared.registry.set_state(&id, ConnectionState::Connecting);

        if let Err(e) = shared.radio.connect(&id, &options) {
            log::warn!("Could not connect to {}: {}", id, e);
            self.latch.release(&id);
            shared.registry.set_state(&id, ConnectionState::Disconnected);
            shared.pending.reject(&key, Error::ConnectFailed(e.to_string()));
        }
    }

    pub(crate) fn on_connected<R: RadioStack>(&mut self, shared: &mut Shared<R>, id: &PeripheralId) {
        let state = shared.registry.state(id);

        if self.latch.release(id) {
            let key = OperationKey::new(id.clone(), OperationKind::Connect);
            if state == Some(ConnectionState::Disconnecting) {
                // The requested disconnect ends this link once the radio reports it.
                log::debug!("Connected to {} after a disconnect was requested", id);
                shared
                    .pending
                    .reject(&key, Error::PeripheralDisconnected(id.clone()));
                return;
            }
            if state == Some(ConnectionState::Connecting) {
                shared.registry.set_state(id, ConnectionState::Connected);
            }
            shared.pending.resolve(&key, Completion::Done);
        } else if state == Some(ConnectionState::Connecting) {
            // Restored connection the radio was still establishing.
            shared.registry.set_state(id, ConnectionState::Connected);
        } else {
            log::trace!("Ignoring connect callback for {} ({:?})", id, state);
            return;
        }

        log::info!("Device connected: {}", id);
        shared.events.emit(BleEvent::Connected {
            peripheral: id.clone(),
        });
    }

    pub(crate) fn on_connect_failed<R: RadioStack>(
        &mut self,
        shared: &mut Shared<R>,
        gatt: &mut GattOperationDispatcher,
        id: &PeripheralId,
        reason: String,
    ) {
        if !self.latch.release(id) {
            log::trace!("Ignoring connect failure for {} without a pending attempt", id);
            return;
        }

        log::warn!("Could not connect to {}: {}", id, reason);
        shared.pending.reject(
            &OperationKey::new(id.clone(), OperationKind::Connect),
            Error::ConnectFailed(reason),
        );

        if shared.registry.state(id) == Some(ConnectionState::Disconnecting) {
            self.link_lost(shared, gatt, id, DisconnectReason::Requested);
        } else {
            shared.registry.set_state(id, ConnectionState::Disconnected);
        }
    }

    pub(crate) fn disconnect<R: RadioStack>(
        &mut self,
        shared: &mut Shared<R>,
        gatt: &mut GattOperationDispatcher,
        id: PeripheralId,
        responder: Responder<Completion>,
    ) {
        let previous = match shared.ensure_known(&id) {
            Err(e) => return responder.reject(e),
            Ok(ConnectionState::Disconnected) => return responder.reject(Error::NotConnected(id)),
            Ok(state) => state,
        };

        let key = OperationKey::new(id.clone(), OperationKind::Disconnect);
        if !shared.pending.register(key.clone(), responder) {
            return;
        }

        log::info!("Disconnecting from device {}", id);
        if previous == ConnectionState::Connected {
            gatt.disable_notifications(shared, &id);
        }
        shared.registry.set_state(&id, ConnectionState::Disconnecting);

        if let Err(e) = shared.radio.cancel_connection(&id) {
            log::warn!("Radio refused to disconnect {}: {}", id, e);
            shared.registry.set_state(&id, previous);
            shared.pending.reject(&key, e);
        }
    }

    /// The radio kept the link. The peripheral goes back to where it was
    /// before the disconnect was requested.
    pub(crate) fn on_disconnect_failed<R: RadioStack>(
        &mut self,
        shared: &mut Shared<R>,
        id: &PeripheralId,
        reason: String,
    ) {
        if shared.registry.state(id) != Some(ConnectionState::Disconnecting) {
            log::trace!("Ignoring disconnect failure for {}", id);
            return;
        }

        let state = if self.latch.is_held(id) {
            ConnectionState::Connecting
        } else {
            ConnectionState::Connected
        };
        log::warn!("Could not disconnect from {}: {}", id, reason);
        shared.registry.set_state(id, state);
        shared.pending.reject(
            &OperationKey::new(id.clone(), OperationKind::Disconnect),
            Error::DisconnectFailed(reason),
        );
    }

    pub(crate) fn on_disconnected<R: RadioStack>(
        &mut self,
        shared: &mut Shared<R>,
        gatt: &mut GattOperationDispatcher,
        id: &PeripheralId,
        error: Option<String>,
    ) {
        let reason = match shared.registry.state(id) {
            None | Some(ConnectionState::Disconnected) => {
                log::trace!("Ignoring disconnect callback for {}", id);
                return;
            }
            Some(ConnectionState::Disconnecting) => DisconnectReason::Requested,
            Some(_) => DisconnectReason::Unexpected { error },
        };

        self.link_lost(shared, gatt, id, reason);
    }

    /// Tears down everything tied to a link the radio no longer holds. Every
    /// caller waiting on this peripheral is answered before this returns.
    fn link_lost<R: RadioStack>(
        &mut self,
        shared: &mut Shared<R>,
        gatt: &mut GattOperationDispatcher,
        id: &PeripheralId,
        reason: DisconnectReason,
    ) {
        shared.registry.set_state(id, ConnectionState::Disconnected);
        self.latch.release(id);

        shared.pending.resolve(
            &OperationKey::new(id.clone(), OperationKind::Disconnect),
            Completion::Done,
        );
        let rejected = shared
            .pending
            .reject_peripheral(id, Error::PeripheralDisconnected(id.clone()));
        let flushed = gatt.link_lost(id);

        log::info!(
            "Device disconnected: {} ({:?}, {} pending operations and {} writes cancelled)",
            id,
            reason,
            rejected,
            flushed
        );
        shared.events.emit(BleEvent::Disconnected {
            peripheral: id.clone(),
            reason,
        });
    }

    pub(crate) fn on_state_changed<R: RadioStack>(
        &mut self,
        shared: &mut Shared<R>,
        gatt: &mut GattOperationDispatcher,
        state: RadioState,
    ) {
        let previous = std::mem::replace(&mut shared.radio_state, state);
        log::info!("Radio state changed: {:?} -> {:?}", previous, state);
        shared.events.emit(BleEvent::RadioStateChanged(state));

        if state.is_ready() {
            return;
        }

        self.end_scan(shared, StopScanReason::RadioUnavailable);

        // The stack gives no guarantee it will report these links itself.
        for id in shared.registry.linked() {
            let reason = match shared.registry.state(&id) {
                Some(ConnectionState::Disconnecting) => DisconnectReason::Requested,
                _ => DisconnectReason::Unexpected {
                    error: Some(format!("radio state changed to {:?}", state)),
                },
            };
            self.link_lost(shared, gatt, &id, reason);
        }
    }

    pub(crate) fn on_restore_state<R: RadioStack>(
        &mut self,
        shared: &mut Shared<R>,
        peripherals: Vec<RestoredPeripheral>,
    ) {
        log::info!("Restoring {} peripherals", peripherals.len());

        let restored = peripherals
            .into_iter()
            .map(|p| shared.registry.restore(p.id, p.name, p.state).clone())
            .collect();

        shared.events.emit(BleEvent::SessionRestored {
            peripherals: restored,
        });
    }

    pub(crate) fn on_bond_state_changed<R: RadioStack>(
        &mut self,
        shared: &mut Shared<R>,
        id: PeripheralId,
        bonded: bool,
    ) {
        if !shared.registry.set_bonded(&id, bonded) {
            log::debug!("Bond update for unknown peripheral {}", id);
        }
        shared.events.emit(BleEvent::BondUpdated {
            peripheral: id,
            bonded,
        });
    }

    pub(crate) fn remove_peripheral<R: RadioStack>(
        &mut self,
        shared: &mut Shared<R>,
        id: &PeripheralId,
    ) -> Result<()> {
        match shared.registry.state(id) {
            None => Err(Error::UnknownPeripheral(id.clone())),
            Some(state) if state.is_linked() => Err(Error::StillConnected(id.clone())),
            Some(_) => {
                shared.registry.evict(id);
                log::debug!("Removed peripheral {}", id);
                Ok(())
            }
        }
    }

    pub(crate) fn shutdown<R: RadioStack>(&mut self, shared: &mut Shared<R>) {
        if self.scan.take().is_some() {
            shared.radio.stop_scan().ok();
        }
    }
}
