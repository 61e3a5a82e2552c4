use std::time::Duration;

use bleasy_bridge::fake::{FakeRadio, FakeRadioController, RadioCommand};
use bleasy_bridge::{
    BleEvent, CharacteristicId, CharacteristicInfo, CharacteristicProperties, ConnectOptions,
    ConnectionState, DisconnectReason, Error, OperationKey, OperationKind, PeripheralId,
    RadioEvent, RadioState, RestoredPeripheral, ScanOptions, ServiceInfo, Session, SessionConfig,
    StopScanReason, WriteType,
};
use futures::{Stream, StreamExt};
use tokio::time::timeout;
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(2);

const SERVICE: Uuid = Uuid::from_u128(0x1000);
const OTHER_SERVICE: Uuid = Uuid::from_u128(0x2000);

fn characteristic(n: u128) -> CharacteristicId {
    CharacteristicId::new(SERVICE, Uuid::from_u128(0x1000 + n))
}

async fn command(air: &mut FakeRadioController) -> RadioCommand {
    timeout(WAIT, air.next_command())
        .await
        .expect("no radio command in time")
        .expect("radio dropped")
}

async fn event_matching<S>(events: &mut S, mut pred: impl FnMut(&BleEvent) -> bool) -> BleEvent
where
    S: Stream<Item = BleEvent> + Unpin,
{
    loop {
        let event = timeout(WAIT, events.next())
            .await
            .expect("no event in time")
            .expect("event stream ended");
        if pred(&event) {
            return event;
        }
    }
}

async fn powered_session(config: SessionConfig) -> (Session, FakeRadioController) {
    let _ = pretty_env_logger::try_init();

    let (radio, air) = FakeRadio::new();
    let session = Session::new(radio, config);
    assert!(air.power_on());
    assert_eq!(session.radio_state().await, Ok(RadioState::PoweredOn));

    (session, air)
}

async fn discover(session: &Session, air: &mut FakeRadioController, id: &PeripheralId) {
    session.start_scan(ScanOptions::default()).await.unwrap();
    assert!(matches!(command(air).await, RadioCommand::StartScan { .. }));

    air.advertise(id, Some("sensor"));
    session.stop_scan().await.unwrap();
    assert_eq!(command(air).await, RadioCommand::StopScan);
}

async fn connect(session: &Session, air: &mut FakeRadioController, id: &PeripheralId) {
    let connecting = tokio::spawn({
        let session = session.clone();
        let id = id.clone();
        async move { session.connect(&id, ConnectOptions::default()).await }
    });

    assert_eq!(
        command(air).await,
        RadioCommand::Connect {
            id: id.clone(),
            options: ConnectOptions::default()
        }
    );
    air.emit(RadioEvent::Connected(id.clone()));

    assert_eq!(connecting.await.unwrap(), Ok(()));
}

async fn connected_session(config: SessionConfig) -> (Session, FakeRadioController, PeripheralId) {
    let (session, mut air) = powered_session(config).await;
    let id = PeripheralId::from("AA:BB");
    discover(&session, &mut air, &id).await;
    connect(&session, &mut air, &id).await;
    (session, air, id)
}

#[tokio::test]
async fn second_connect_is_rejected_while_first_is_in_flight() {
    let (session, mut air) = powered_session(SessionConfig::default()).await;
    let id = PeripheralId::from("AA:BB");
    discover(&session, &mut air, &id).await;
    let mut events = session.event_stream();

    let first = tokio::spawn({
        let session = session.clone();
        let id = id.clone();
        async move { session.connect(&id, ConnectOptions::default()).await }
    });
    assert!(matches!(command(&mut air).await, RadioCommand::Connect { .. }));

    assert_eq!(
        session.connect(&id, ConnectOptions::default()).await,
        Err(Error::ConnectInProgress(id.clone()))
    );

    air.emit(RadioEvent::Connected(id.clone()));
    assert_eq!(first.await.unwrap(), Ok(()));

    // A duplicate callback neither reconnects nor emits again.
    air.emit(RadioEvent::Connected(id.clone()));
    assert_eq!(session.is_connected(&id).await, Ok(true));

    event_matching(&mut events, |e| matches!(e, BleEvent::Connected { .. })).await;
    session.check_state().await.unwrap();
    let next = event_matching(&mut events, |e| {
        matches!(e, BleEvent::Connected { .. } | BleEvent::RadioStateChanged(_))
    })
    .await;
    assert_eq!(next, BleEvent::RadioStateChanged(RadioState::PoweredOn));
    assert!(air.try_next_command().is_none());
}

#[tokio::test]
async fn connect_failure_releases_the_latch() {
    let (session, mut air) = powered_session(SessionConfig::default()).await;
    let id = PeripheralId::from("AA:BB");
    discover(&session, &mut air, &id).await;

    let first = tokio::spawn({
        let session = session.clone();
        let id = id.clone();
        async move { session.connect(&id, ConnectOptions::default()).await }
    });
    command(&mut air).await;
    air.emit(RadioEvent::ConnectFailed {
        id: id.clone(),
        reason: "timeout".into(),
    });
    assert_eq!(
        first.await.unwrap(),
        Err(Error::ConnectFailed("timeout".into()))
    );

    connect(&session, &mut air, &id).await;
}

#[tokio::test]
async fn connect_to_unknown_peripheral_fails() {
    let (session, _air) = powered_session(SessionConfig::default()).await;
    let id = PeripheralId::from("nope");

    assert_eq!(
        session.connect(&id, ConnectOptions::default()).await,
        Err(Error::UnknownPeripheral(id))
    );
}

#[tokio::test]
async fn commands_need_a_powered_radio() {
    let (radio, _air) = FakeRadio::new();
    let session = Session::new(radio, SessionConfig::default());

    assert_eq!(
        session.start_scan(ScanOptions::default()).await,
        Err(Error::RadioNotReady {
            state: RadioState::Unknown
        })
    );
    assert!(matches!(
        session
            .connect(&PeripheralId::from("AA:BB"), ConnectOptions::default())
            .await,
        Err(Error::RadioNotReady { .. })
    ));
}

#[tokio::test]
async fn acknowledged_writes_reach_the_radio_in_order() {
    let (session, mut air, id) = connected_session(SessionConfig::default()).await;
    let c = characteristic(1);

    let writes = async {
        futures::join!(
            session.write_request(&id, c, &[1]),
            session.write_request(&id, c, &[2]),
            session.write_request(&id, c, &[3]),
        )
    };
    tokio::pin!(writes);
    // One poll hands all three writes to the session, in order.
    assert!(futures::poll!(writes.as_mut()).is_pending());

    for expected in [1u8, 2, 3] {
        assert_eq!(
            command(&mut air).await,
            RadioCommand::Write {
                id: id.clone(),
                characteristic: c,
                data: vec![expected],
                write_type: WriteType::WithResponse,
            }
        );

        // Nothing else is issued until the radio acknowledges.
        session.snapshot().await.unwrap();
        assert!(air.try_next_command().is_none());

        air.emit(RadioEvent::WriteCompleted {
            id: id.clone(),
            characteristic: c,
            result: Ok(()),
        });
    }

    let (w1, w2, w3) = timeout(WAIT, writes).await.unwrap();
    assert_eq!((w1, w2, w3), (Ok(()), Ok(()), Ok(())));
    assert_eq!(session.snapshot().await.unwrap().queued_writes, 0);
}

#[tokio::test]
async fn large_writes_are_chunked() {
    let (session, mut air, id) =
        connected_session(SessionConfig::default().write_chunk_size(2)).await;
    let c = characteristic(1);

    let writing = tokio::spawn({
        let session = session.clone();
        let id = id.clone();
        async move { session.write_command(&id, c, &[1, 2, 3, 4, 5]).await }
    });

    for chunk in [vec![1, 2], vec![3, 4], vec![5]] {
        assert!(matches!(
            command(&mut air).await,
            RadioCommand::Write { data, write_type: WriteType::WithoutResponse, .. } if data == chunk
        ));
    }
    assert_eq!(writing.await.unwrap(), Ok(()));
}

#[tokio::test]
async fn unexpected_disconnect_rejects_everything_pending() {
    let (session, mut air, id) = connected_session(SessionConfig::default()).await;
    let mut events = session.event_stream();

    let operations = async {
        futures::join!(
            session.read(&id, characteristic(1)),
            session.write_request(&id, characteristic(2), &[1]),
            session.write_request(&id, characteristic(2), &[2]),
            session.set_notify(&id, characteristic(3), true),
        )
    };
    tokio::pin!(operations);
    assert!(futures::poll!(operations.as_mut()).is_pending());

    assert!(matches!(command(&mut air).await, RadioCommand::Read { .. }));
    assert!(matches!(command(&mut air).await, RadioCommand::Write { .. }));
    assert!(matches!(command(&mut air).await, RadioCommand::SetNotify { .. }));

    let diagnostics = session.snapshot().await.unwrap();
    assert_eq!(diagnostics.pending.len(), 2);
    assert_eq!(diagnostics.queued_writes, 2);

    air.emit(RadioEvent::Disconnected {
        id: id.clone(),
        error: Some("link supervision timeout".into()),
    });

    let disconnected = Err(Error::PeripheralDisconnected(id.clone()));
    let (read, w1, w2, notify) = timeout(WAIT, operations).await.unwrap();
    assert_eq!(read, Err(Error::PeripheralDisconnected(id.clone())));
    assert_eq!(w1, disconnected);
    assert_eq!(w2, disconnected);
    assert_eq!(notify, disconnected);

    let diagnostics = session.snapshot().await.unwrap();
    assert!(diagnostics.pending.is_empty());
    assert_eq!(diagnostics.queued_writes, 0);

    let event = event_matching(&mut events, |e| matches!(e, BleEvent::Disconnected { .. })).await;
    assert_eq!(
        event,
        BleEvent::Disconnected {
            peripheral: id.clone(),
            reason: DisconnectReason::Unexpected {
                error: Some("link supervision timeout".into())
            }
        }
    );
    assert_eq!(session.is_connected(&id).await, Ok(false));
}

#[tokio::test]
async fn late_callbacks_are_ignored() {
    let (session, mut air, id) = connected_session(SessionConfig::default()).await;
    let c = characteristic(1);

    let rssi = tokio::spawn({
        let session = session.clone();
        let id = id.clone();
        async move { session.read_rssi(&id).await }
    });
    assert_eq!(command(&mut air).await, RadioCommand::ReadRssi(id.clone()));
    air.emit(RadioEvent::RssiRead {
        id: id.clone(),
        result: Ok(-42),
    });
    assert_eq!(rssi.await.unwrap(), Ok(-42));

    let before = session.snapshot().await.unwrap();

    air.emit(RadioEvent::RssiRead {
        id: id.clone(),
        result: Err("late".into()),
    });
    air.emit(RadioEvent::WriteCompleted {
        id: id.clone(),
        characteristic: c,
        result: Ok(()),
    });
    air.emit(RadioEvent::CharacteristicsDiscovered {
        id: id.clone(),
        service: SERVICE,
        result: Ok(Vec::new()),
    });
    air.emit(RadioEvent::ConnectFailed {
        id: id.clone(),
        reason: "late".into(),
    });

    let after = session.snapshot().await.unwrap();
    assert!(after.pending.is_empty());
    assert_eq!(after.queued_writes, before.queued_writes);
    assert_eq!(session.is_connected(&id).await, Ok(true));
    assert!(air.try_next_command().is_none());

    // A second disconnect callback after cleanup is a no-op too.
    air.emit(RadioEvent::Disconnected {
        id: id.clone(),
        error: None,
    });
    air.emit(RadioEvent::Disconnected {
        id: id.clone(),
        error: None,
    });
    assert_eq!(session.is_connected(&id).await, Ok(false));
}

#[tokio::test]
async fn scan_connect_discover_read_disconnect() {
    let (session, mut air) = powered_session(SessionConfig::default()).await;
    let mut events = session.event_stream();
    let id = PeripheralId::from("AA:BB");
    let c1 = characteristic(1);

    session.start_scan(ScanOptions::default()).await.unwrap();
    assert_eq!(
        command(&mut air).await,
        RadioCommand::StartScan {
            services: Vec::new(),
            allow_duplicates: false
        }
    );

    air.advertise(&id, Some("sensor"));
    let BleEvent::DiscoveredPeripheral(peripheral) =
        event_matching(&mut events, |e| matches!(e, BleEvent::DiscoveredPeripheral(_))).await
    else {
        unreachable!()
    };
    assert_eq!(peripheral.id, id);
    assert_eq!(peripheral.rssi, Some(-60));
    assert_eq!(peripheral.state, ConnectionState::Disconnected);

    connect(&session, &mut air, &id).await;

    let discovering = tokio::spawn({
        let session = session.clone();
        let id = id.clone();
        async move { session.discover_services(&id, &[]).await }
    });
    assert_eq!(
        command(&mut air).await,
        RadioCommand::DiscoverServices {
            id: id.clone(),
            services: Vec::new()
        }
    );
    air.emit(RadioEvent::ServicesDiscovered {
        id: id.clone(),
        result: Ok(vec![SERVICE]),
    });
    assert_eq!(
        command(&mut air).await,
        RadioCommand::DiscoverCharacteristics {
            id: id.clone(),
            service: SERVICE
        }
    );
    let info = CharacteristicInfo {
        id: c1,
        properties: CharacteristicProperties::READ | CharacteristicProperties::NOTIFY,
    };
    air.emit(RadioEvent::CharacteristicsDiscovered {
        id: id.clone(),
        service: SERVICE,
        result: Ok(vec![info.clone()]),
    });
    assert_eq!(
        discovering.await.unwrap(),
        Ok(vec![ServiceInfo {
            uuid: SERVICE,
            characteristics: vec![info]
        }])
    );

    let reading = tokio::spawn({
        let session = session.clone();
        let id = id.clone();
        async move { session.read(&id, c1).await }
    });
    assert_eq!(
        command(&mut air).await,
        RadioCommand::Read {
            id: id.clone(),
            characteristic: c1
        }
    );
    air.emit(RadioEvent::ValueUpdated {
        id: id.clone(),
        characteristic: c1,
        result: Ok(vec![0x01, 0x02]),
    });
    assert_eq!(reading.await.unwrap(), Ok(vec![0x01, 0x02]));

    let disconnecting = tokio::spawn({
        let session = session.clone();
        let id = id.clone();
        async move { session.disconnect(&id).await }
    });
    assert_eq!(
        command(&mut air).await,
        RadioCommand::CancelConnection(id.clone())
    );
    air.emit(RadioEvent::Disconnected {
        id: id.clone(),
        error: None,
    });
    assert_eq!(disconnecting.await.unwrap(), Ok(()));

    let event = event_matching(&mut events, |e| matches!(e, BleEvent::Disconnected { .. })).await;
    assert_eq!(
        event,
        BleEvent::Disconnected {
            peripheral: id.clone(),
            reason: DisconnectReason::Requested
        }
    );

    assert_eq!(
        session.read(&id, c1).await,
        Err(Error::NotConnected(id.clone()))
    );
}

#[tokio::test]
async fn power_loss_tears_down_connections() {
    let (session, mut air, id) = connected_session(SessionConfig::default()).await;
    let mut events = session.event_stream();

    let reading = tokio::spawn({
        let session = session.clone();
        let id = id.clone();
        async move { session.read(&id, characteristic(1)).await }
    });
    assert!(matches!(command(&mut air).await, RadioCommand::Read { .. }));

    air.emit(RadioEvent::StateChanged(RadioState::PoweredOff));

    assert_eq!(
        reading.await.unwrap(),
        Err(Error::PeripheralDisconnected(id.clone()))
    );
    assert_eq!(
        event_matching(&mut events, |e| matches!(e, BleEvent::RadioStateChanged(_))).await,
        BleEvent::RadioStateChanged(RadioState::PoweredOff)
    );
    assert!(matches!(
        event_matching(&mut events, |e| matches!(e, BleEvent::Disconnected { .. })).await,
        BleEvent::Disconnected {
            reason: DisconnectReason::Unexpected { .. },
            ..
        }
    ));

    let peripherals = session.discovered_peripherals().await.unwrap();
    assert_eq!(peripherals.len(), 1);
    assert_eq!(peripherals[0].state, ConnectionState::Disconnected);
    assert!(session.connected_peripherals(&[]).await.unwrap().is_empty());
}

#[tokio::test]
async fn power_loss_ends_the_scan() {
    let (session, mut air) = powered_session(SessionConfig::default()).await;
    let mut events = session.event_stream();

    session.start_scan(ScanOptions::default()).await.unwrap();
    command(&mut air).await;
    air.emit(RadioEvent::StateChanged(RadioState::PoweredOff));

    assert_eq!(
        event_matching(&mut events, |e| matches!(e, BleEvent::StopScan { .. })).await,
        BleEvent::StopScan {
            reason: StopScanReason::RadioUnavailable
        }
    );
    assert_eq!(session.is_scanning().await, Ok(false));
    assert!(air.try_next_command().is_none());
}

#[tokio::test]
async fn scan_stops_after_timeout() {
    let (session, mut air) = powered_session(SessionConfig::default()).await;
    let mut events = session.event_stream();

    session
        .start_scan(ScanOptions::default().stop_after_timeout(Duration::from_millis(100)))
        .await
        .unwrap();
    command(&mut air).await;
    assert_eq!(session.is_scanning().await, Ok(true));

    assert_eq!(
        event_matching(&mut events, |e| matches!(e, BleEvent::StopScan { .. })).await,
        BleEvent::StopScan {
            reason: StopScanReason::Timeout
        }
    );
    assert_eq!(command(&mut air).await, RadioCommand::StopScan);
    assert_eq!(session.is_scanning().await, Ok(false));
}

#[tokio::test]
async fn scan_stops_after_enough_matches() {
    let (session, mut air) = powered_session(SessionConfig::default()).await;
    let mut events = session.event_stream();

    session
        .start_scan(
            ScanOptions::default()
                .filter_by_name(|name| name.starts_with("HR"))
                .stop_after_first_match(),
        )
        .await
        .unwrap();
    command(&mut air).await;

    air.advertise(&PeripheralId::from("11"), Some("Keyboard"));
    air.advertise(&PeripheralId::from("22"), Some("HR Strap"));

    let BleEvent::DiscoveredPeripheral(peripheral) =
        event_matching(&mut events, |e| matches!(e, BleEvent::DiscoveredPeripheral(_))).await
    else {
        unreachable!()
    };
    assert_eq!(peripheral.id, PeripheralId::from("22"));
    assert_eq!(
        event_matching(&mut events, |e| matches!(e, BleEvent::StopScan { .. })).await,
        BleEvent::StopScan {
            reason: StopScanReason::MatchLimit
        }
    );

    // Filtered out devices are not remembered.
    let known = session.discovered_peripherals().await.unwrap();
    assert_eq!(known.len(), 1);
}

#[tokio::test]
async fn stopping_an_idle_scan_still_reports() {
    let (session, mut air) = powered_session(SessionConfig::default()).await;
    let mut events = session.event_stream();

    session.stop_scan().await.unwrap();

    assert_eq!(
        event_matching(&mut events, |e| matches!(e, BleEvent::StopScan { .. })).await,
        BleEvent::StopScan {
            reason: StopScanReason::Requested
        }
    );
    assert!(air.try_next_command().is_none());
}

#[tokio::test]
async fn unanswered_operation_times_out() {
    let (session, mut air, id) = connected_session(
        SessionConfig::default().operation_timeout(Duration::from_millis(100)),
    )
    .await;
    let c = characteristic(1);

    assert_eq!(session.read(&id, c).await, Err(Error::Timeout));
    assert!(matches!(command(&mut air).await, RadioCommand::Read { .. }));
    assert!(session.snapshot().await.unwrap().pending.is_empty());

    // The key is free again.
    let reading = tokio::spawn({
        let session = session.clone();
        let id = id.clone();
        async move { session.read(&id, c).await }
    });
    assert!(matches!(command(&mut air).await, RadioCommand::Read { .. }));
    air.emit(RadioEvent::ValueUpdated {
        id: id.clone(),
        characteristic: c,
        result: Ok(vec![7]),
    });
    assert_eq!(reading.await.unwrap(), Ok(vec![7]));
}

#[tokio::test]
async fn timed_out_connect_stays_latched_until_cancelled() {
    let (session, mut air) = powered_session(
        SessionConfig::default().operation_timeout(Duration::from_millis(100)),
    )
    .await;
    let id = PeripheralId::from("AA:BB");
    discover(&session, &mut air, &id).await;

    assert_eq!(
        session.connect(&id, ConnectOptions::default()).await,
        Err(Error::Timeout)
    );
    assert!(matches!(command(&mut air).await, RadioCommand::Connect { .. }));
    assert_eq!(
        session.connect(&id, ConnectOptions::default()).await,
        Err(Error::ConnectInProgress(id.clone()))
    );

    let disconnecting = tokio::spawn({
        let session = session.clone();
        let id = id.clone();
        async move { session.disconnect(&id).await }
    });
    assert_eq!(
        command(&mut air).await,
        RadioCommand::CancelConnection(id.clone())
    );
    air.emit(RadioEvent::Disconnected {
        id: id.clone(),
        error: None,
    });
    assert_eq!(disconnecting.await.unwrap(), Ok(()));

    connect(&session, &mut air, &id).await;
}

#[tokio::test]
async fn abandoned_operation_frees_its_key() {
    let (session, mut air, id) = connected_session(SessionConfig::default()).await;

    let key = OperationKey::new(id.clone(), OperationKind::DiscoverServices);
    let first = tokio::spawn({
        let session = session.clone();
        let id = id.clone();
        async move { session.discover_services(&id, &[]).await }
    });
    command(&mut air).await;

    // Overlapping discovery is refused.
    assert_eq!(
        session.discover_services(&id, &[]).await,
        Err(Error::DuplicateOperation(key.clone()))
    );

    session.abandon(key);
    assert_eq!(first.await.unwrap(), Err(Error::Abandoned));
    assert!(session.snapshot().await.unwrap().pending.is_empty());
}

#[tokio::test]
async fn discovery_collects_every_service() {
    let (session, mut air, id) = connected_session(SessionConfig::default()).await;

    let discovering = tokio::spawn({
        let session = session.clone();
        let id = id.clone();
        async move { session.discover_services(&id, &[SERVICE, OTHER_SERVICE]).await }
    });
    command(&mut air).await;
    air.emit(RadioEvent::ServicesDiscovered {
        id: id.clone(),
        result: Ok(vec![SERVICE, OTHER_SERVICE]),
    });
    command(&mut air).await;
    command(&mut air).await;

    let other = CharacteristicInfo {
        id: CharacteristicId::new(OTHER_SERVICE, Uuid::from_u128(0x2001)),
        properties: CharacteristicProperties::WRITE,
    };
    // Answers may come back in any order.
    air.emit(RadioEvent::CharacteristicsDiscovered {
        id: id.clone(),
        service: OTHER_SERVICE,
        result: Ok(vec![other.clone()]),
    });
    air.emit(RadioEvent::CharacteristicsDiscovered {
        id: id.clone(),
        service: SERVICE,
        result: Ok(Vec::new()),
    });

    let services = discovering.await.unwrap().unwrap();
    assert_eq!(
        services.iter().map(ServiceInfo::uuid).collect::<Vec<_>>(),
        vec![SERVICE, OTHER_SERVICE]
    );
    assert_eq!(
        services[1].characteristic(other.uuid()),
        Some(&other)
    );

    let connected = session.connected_peripherals(&[OTHER_SERVICE]).await.unwrap();
    assert_eq!(connected.len(), 1);
}

#[tokio::test]
async fn buffered_notifications_arrive_in_frames() {
    let (session, mut air, id) = connected_session(SessionConfig::default()).await;
    let c = characteristic(4);
    let mut values = session.notification_stream(&id, c);

    let subscribing = tokio::spawn({
        let session = session.clone();
        let id = id.clone();
        async move { session.start_notification_with_buffer(&id, c, 4).await }
    });
    assert_eq!(
        command(&mut air).await,
        RadioCommand::SetNotify {
            id: id.clone(),
            characteristic: c,
            enabled: true
        }
    );
    air.emit(RadioEvent::NotificationStateChanged {
        id: id.clone(),
        characteristic: c,
        result: Ok(true),
    });
    assert_eq!(subscribing.await.unwrap(), Ok(()));

    for chunk in [vec![1, 2, 3], vec![4, 5], vec![6, 7, 8, 9]] {
        air.emit(RadioEvent::ValueUpdated {
            id: id.clone(),
            characteristic: c,
            result: Ok(chunk),
        });
    }

    let first = timeout(WAIT, values.next()).await.unwrap();
    let second = timeout(WAIT, values.next()).await.unwrap();
    assert_eq!(first, Some(vec![1, 2, 3, 4]));
    assert_eq!(second, Some(vec![5, 6, 7, 8]));
}

#[tokio::test]
async fn disconnect_unsubscribes_first() {
    let (session, mut air, id) = connected_session(SessionConfig::default()).await;
    let c = characteristic(4);

    let subscribing = tokio::spawn({
        let session = session.clone();
        let id = id.clone();
        async move { session.set_notify(&id, c, true).await }
    });
    command(&mut air).await;
    air.emit(RadioEvent::NotificationStateChanged {
        id: id.clone(),
        characteristic: c,
        result: Ok(true),
    });
    assert_eq!(subscribing.await.unwrap(), Ok(()));

    let disconnecting = tokio::spawn({
        let session = session.clone();
        let id = id.clone();
        async move { session.disconnect(&id).await }
    });
    assert_eq!(
        command(&mut air).await,
        RadioCommand::SetNotify {
            id: id.clone(),
            characteristic: c,
            enabled: false
        }
    );
    assert_eq!(
        command(&mut air).await,
        RadioCommand::CancelConnection(id.clone())
    );

    // Still disconnecting: a new connect has to wait.
    assert_eq!(
        session.connect(&id, ConnectOptions::default()).await,
        Err(Error::DisconnectInProgress(id.clone()))
    );

    air.emit(RadioEvent::Disconnected {
        id: id.clone(),
        error: None,
    });
    assert_eq!(disconnecting.await.unwrap(), Ok(()));
}

#[tokio::test]
async fn refused_command_fails_immediately() {
    let (session, mut air, id) = connected_session(SessionConfig::default()).await;

    air.refuse_commands(Some("busy"));
    assert_eq!(
        session.read(&id, characteristic(1)).await,
        Err(Error::ReadError("radio refused the command: busy".into()))
    );
    assert_eq!(
        session.disconnect(&id).await,
        Err(Error::Radio("busy".into()))
    );
    assert_eq!(session.is_connected(&id).await, Ok(true));

    air.refuse_commands(None);
    session.snapshot().await.unwrap();
    assert!(air.try_next_command().is_none());
}

#[tokio::test]
async fn restored_peripherals_are_known() {
    let (session, air) = powered_session(SessionConfig::default()).await;
    let mut events = session.event_stream();
    let id = PeripheralId::from("CC:DD");

    air.emit(RadioEvent::WillRestoreState {
        peripherals: vec![RestoredPeripheral {
            id: id.clone(),
            name: Some("watch".into()),
            state: ConnectionState::Connected,
        }],
    });

    let BleEvent::SessionRestored { peripherals } =
        event_matching(&mut events, |e| matches!(e, BleEvent::SessionRestored { .. })).await
    else {
        unreachable!()
    };
    assert_eq!(peripherals.len(), 1);
    assert_eq!(peripherals[0].name.as_deref(), Some("watch"));
    assert_eq!(session.is_connected(&id).await, Ok(true));

    air.emit(RadioEvent::BondStateChanged {
        id: id.clone(),
        bonded: true,
    });
    let bonded = session.bonded_peripherals().await.unwrap();
    assert_eq!(bonded.len(), 1);
    assert_eq!(bonded[0].id, id);
}

#[tokio::test]
async fn remove_peripheral_refuses_connected_ones() {
    let (session, mut air, id) = connected_session(SessionConfig::default()).await;

    assert_eq!(
        session.remove_peripheral(&id).await,
        Err(Error::StillConnected(id.clone()))
    );

    air.emit(RadioEvent::Disconnected {
        id: id.clone(),
        error: None,
    });
    assert_eq!(session.remove_peripheral(&id).await, Ok(()));
    assert!(session.discovered_peripherals().await.unwrap().is_empty());
    assert_eq!(
        session.remove_peripheral(&id).await,
        Err(Error::UnknownPeripheral(id))
    );
    assert!(air.try_next_command().is_none());
}

#[tokio::test]
async fn closing_the_session_fails_pending_operations() {
    let (session, mut air, id) = connected_session(SessionConfig::default()).await;

    let reading = tokio::spawn({
        let session = session.clone();
        let id = id.clone();
        async move { session.read(&id, characteristic(1)).await }
    });
    command(&mut air).await;

    session.close();
    assert_eq!(reading.await.unwrap(), Err(Error::SessionClosed));
    assert_eq!(session.radio_state().await, Err(Error::SessionClosed));
}

#[tokio::test]
async fn timed_out_write_leaves_later_writers_alone() {
    let (session, mut air, id) = connected_session(
        SessionConfig::default().operation_timeout(Duration::from_millis(200)),
    )
    .await;
    let c = characteristic(1);

    let first = tokio::spawn({
        let session = session.clone();
        let id = id.clone();
        async move { session.write_request(&id, c, &[1]).await }
    });
    assert!(matches!(command(&mut air).await, RadioCommand::Write { data, .. } if data == vec![1]));

    tokio::time::sleep(Duration::from_millis(150)).await;
    let second = tokio::spawn({
        let session = session.clone();
        let id = id.clone();
        async move { session.write_request(&id, c, &[2]).await }
    });

    assert_eq!(first.await.unwrap(), Err(Error::Timeout));

    // The second writer is still within its own deadline.
    air.emit(RadioEvent::WriteCompleted {
        id: id.clone(),
        characteristic: c,
        result: Ok(()),
    });
    assert!(matches!(command(&mut air).await, RadioCommand::Write { data, .. } if data == vec![2]));
    air.emit(RadioEvent::WriteCompleted {
        id: id.clone(),
        characteristic: c,
        result: Ok(()),
    });
    assert_eq!(second.await.unwrap(), Ok(()));
    assert_eq!(session.snapshot().await.unwrap().queued_writes, 0);
}

#[tokio::test]
async fn timed_out_queued_write_is_never_sent() {
    let (session, mut air, id) = connected_session(
        SessionConfig::default().operation_timeout(Duration::from_millis(100)),
    )
    .await;
    let c = characteristic(1);

    let (first, second) = futures::join!(
        session.write_request(&id, c, &[1]),
        session.write_request(&id, c, &[2]),
    );
    assert_eq!((first, second), (Err(Error::Timeout), Err(Error::Timeout)));
    assert!(matches!(command(&mut air).await, RadioCommand::Write { data, .. } if data == vec![1]));

    air.emit(RadioEvent::WriteCompleted {
        id: id.clone(),
        characteristic: c,
        result: Ok(()),
    });
    assert_eq!(session.snapshot().await.unwrap().queued_writes, 0);
    assert!(air.try_next_command().is_none());
}

#[tokio::test]
async fn chunk_size_can_be_chosen_per_write() {
    let (session, mut air, id) =
        connected_session(SessionConfig::default().write_chunk_size(2)).await;
    let c = characteristic(1);

    let writing = tokio::spawn({
        let session = session.clone();
        let id = id.clone();
        async move {
            session
                .write_chunked(&id, c, &[1, 2, 3, 4, 5], WriteType::WithoutResponse, 4)
                .await
        }
    });

    for chunk in [vec![1, 2, 3, 4], vec![5]] {
        assert!(matches!(
            command(&mut air).await,
            RadioCommand::Write { data, .. } if data == chunk
        ));
    }
    assert_eq!(writing.await.unwrap(), Ok(()));
}

#[tokio::test]
async fn descriptors_are_read_and_written() {
    let (session, mut air, id) = connected_session(SessionConfig::default()).await;
    let c = characteristic(1);
    let descriptor = Uuid::from_u128(0x2902);

    let reading = tokio::spawn({
        let session = session.clone();
        let id = id.clone();
        async move { session.read_descriptor(&id, c, descriptor).await }
    });
    assert_eq!(
        command(&mut air).await,
        RadioCommand::ReadDescriptor {
            id: id.clone(),
            characteristic: c,
            descriptor,
        }
    );
    air.emit(RadioEvent::DescriptorRead {
        id: id.clone(),
        characteristic: c,
        descriptor,
        result: Ok(vec![1, 0]),
    });
    assert_eq!(reading.await.unwrap(), Ok(vec![1, 0]));

    let writing = tokio::spawn({
        let session = session.clone();
        let id = id.clone();
        async move { session.write_descriptor(&id, c, descriptor, &[0, 0]).await }
    });
    assert_eq!(
        command(&mut air).await,
        RadioCommand::WriteDescriptor {
            id: id.clone(),
            characteristic: c,
            descriptor,
            data: vec![0, 0],
        }
    );
    air.emit(RadioEvent::DescriptorWritten {
        id: id.clone(),
        characteristic: c,
        descriptor,
        result: Err("not permitted".into()),
    });
    assert_eq!(
        writing.await.unwrap(),
        Err(Error::WriteError("not permitted".into()))
    );

    // Descriptor operations need a link like everything else.
    let pending = tokio::spawn({
        let session = session.clone();
        let id = id.clone();
        async move { session.read_descriptor(&id, c, descriptor).await }
    });
    assert!(matches!(command(&mut air).await, RadioCommand::ReadDescriptor { .. }));
    air.emit(RadioEvent::Disconnected {
        id: id.clone(),
        error: None,
    });
    assert_eq!(
        pending.await.unwrap(),
        Err(Error::PeripheralDisconnected(id.clone()))
    );
    assert_eq!(
        session.read_descriptor(&id, c, descriptor).await,
        Err(Error::NotConnected(id.clone()))
    );
}

#[tokio::test]
async fn failed_disconnect_keeps_the_link() {
    let (session, mut air, id) = connected_session(SessionConfig::default()).await;

    let disconnecting = tokio::spawn({
        let session = session.clone();
        let id = id.clone();
        async move { session.disconnect(&id).await }
    });
    assert_eq!(
        command(&mut air).await,
        RadioCommand::CancelConnection(id.clone())
    );
    air.emit(RadioEvent::DisconnectFailed {
        id: id.clone(),
        reason: "busy".into(),
    });

    assert_eq!(
        disconnecting.await.unwrap(),
        Err(Error::DisconnectFailed("busy".into()))
    );
    assert_eq!(session.is_connected(&id).await, Ok(true));

    // The peripheral is still usable and can be disconnected again.
    let disconnecting = tokio::spawn({
        let session = session.clone();
        let id = id.clone();
        async move { session.disconnect(&id).await }
    });
    command(&mut air).await;
    air.emit(RadioEvent::Disconnected {
        id: id.clone(),
        error: None,
    });
    assert_eq!(disconnecting.await.unwrap(), Ok(()));
}

#[tokio::test]
async fn connect_overtaken_by_disconnect_fails() {
    let (session, mut air) = powered_session(SessionConfig::default()).await;
    let id = PeripheralId::from("AA:BB");
    discover(&session, &mut air, &id).await;
    let mut events = session.event_stream();

    let connecting = tokio::spawn({
        let session = session.clone();
        let id = id.clone();
        async move { session.connect(&id, ConnectOptions::default()).await }
    });
    assert!(matches!(command(&mut air).await, RadioCommand::Connect { .. }));

    let disconnecting = tokio::spawn({
        let session = session.clone();
        let id = id.clone();
        async move { session.disconnect(&id).await }
    });
    assert_eq!(
        command(&mut air).await,
        RadioCommand::CancelConnection(id.clone())
    );

    air.emit(RadioEvent::Connected(id.clone()));
    assert_eq!(
        connecting.await.unwrap(),
        Err(Error::PeripheralDisconnected(id.clone()))
    );
    assert_eq!(session.is_connected(&id).await, Ok(false));

    air.emit(RadioEvent::Disconnected {
        id: id.clone(),
        error: None,
    });
    assert_eq!(disconnecting.await.unwrap(), Ok(()));

    let event = event_matching(&mut events, |e| {
        matches!(e, BleEvent::Connected { .. } | BleEvent::Disconnected { .. })
    })
    .await;
    assert_eq!(
        event,
        BleEvent::Disconnected {
            peripheral: id.clone(),
            reason: DisconnectReason::Requested,
        }
    );
}

#[tokio::test]
async fn power_loss_while_connecting_releases_the_latch() {
    let (session, mut air) = powered_session(SessionConfig::default()).await;
    let id = PeripheralId::from("AA:BB");
    discover(&session, &mut air, &id).await;
    let mut events = session.event_stream();

    let connecting = tokio::spawn({
        let session = session.clone();
        let id = id.clone();
        async move { session.connect(&id, ConnectOptions::default()).await }
    });
    assert!(matches!(command(&mut air).await, RadioCommand::Connect { .. }));

    air.emit(RadioEvent::StateChanged(RadioState::PoweredOff));
    assert_eq!(
        connecting.await.unwrap(),
        Err(Error::PeripheralDisconnected(id.clone()))
    );
    let event = event_matching(&mut events, |e| matches!(e, BleEvent::Disconnected { .. })).await;
    assert_eq!(
        event,
        BleEvent::Disconnected {
            peripheral: id.clone(),
            reason: DisconnectReason::Unexpected {
                error: Some("radio state changed to PoweredOff".into()),
            },
        }
    );

    assert!(air.power_on());
    assert_eq!(session.radio_state().await, Ok(RadioState::PoweredOn));
    connect(&session, &mut air, &id).await;
}
