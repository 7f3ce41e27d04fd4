//! End-to-end tests of the session driver against the mock reader.

mod common;

use std::time::Duration;

use bytes::Bytes;
use rstest::rstest;

use blescard_core::{Channel, ErrorCode, PowerState};
use blescard_session::{Callback, SessionConfig, SessionListener, SessionState};
use blescard_transport::{
    TransportError,
    mock::{MOCK_ATR, MockReaderConfig},
};
use common::{WAIT, device, is_transmit_response, open_ready, ready_with_card, start};

#[tokio::test]
async fn test_driver_setup_reports_ready() {
    let (mut handle, mock) = start(SessionConfig::default(), MockReaderConfig::default());
    mock.insert_card(0).await.unwrap();

    let callbacks = open_ready(&mut handle).await;

    assert_eq!(callbacks[0], Callback::SessionConnected);
    assert!(callbacks.contains(&Callback::ReaderStatusChanged {
        slot: 0,
        present: true,
        powered: false,
    }));
    assert!(callbacks.contains(&Callback::CardConnected(Channel::new(0, MOCK_ATR.to_vec()))));

    let Some(Callback::SessionReady(constants)) = callbacks.last() else {
        panic!("expected session-ready last, got {callbacks:?}");
    };
    assert_eq!(constants.vendor_name, "Blescard Labs");
    assert_eq!(constants.product_name, "Mock CCID Reader");
    assert_eq!(
        constants.slot_names,
        vec!["Mock CCID Reader slot 0", "Mock CCID Reader slot 1"]
    );
    assert!(!constants.secured_service);

    assert_eq!(handle.state(), SessionState::Idle);
    assert!(mock.is_powered(0).await);

    let registry = handle.registry();
    assert!(registry.lock().await.is_connected(&device()));
}

#[tokio::test]
async fn test_driver_transmit_round_trip() {
    let (mut handle, _mock) = ready_with_card(SessionConfig::default()).await;

    handle.transmit(0, vec![0x00, 0xA4, 0x04, 0x00]).await.unwrap();
    let callbacks = handle.recv_until(WAIT, is_transmit_response).await.unwrap();

    assert_eq!(
        callbacks.last(),
        Some(&Callback::TransmitResponse {
            channel: Channel::new(0, MOCK_ATR.to_vec()),
            response: Bytes::from_static(&[0x00, 0xA4, 0x04, 0x00, 0x90, 0x00]),
        })
    );
}

#[rstest]
#[case(None, vec![512, 98])]
#[case(Some(244), vec![244, 244, 122])]
#[tokio::test]
async fn test_driver_chunks_large_commands(
    #[case] max_write: Option<usize>,
    #[case] expected: Vec<usize>,
) {
    let reader = MockReaderConfig {
        max_write,
        ..MockReaderConfig::default()
    };
    let (mut handle, mock) = start(SessionConfig::default(), reader);
    mock.insert_card(0).await.unwrap();
    open_ready(&mut handle).await;
    let before = mock.writes().await.len();

    // 600-byte APDU: 610-byte frame
    handle.transmit(0, vec![0x5A; 600]).await.unwrap();
    let callbacks = handle.recv_until(WAIT, is_transmit_response).await.unwrap();

    let writes = mock.writes().await;
    assert_eq!(writes[before..].to_vec(), expected);
    let Some(Callback::TransmitResponse { response, .. }) = callbacks.last() else {
        panic!("expected transmit response");
    };
    assert_eq!(response.len(), 602);
}

#[tokio::test]
async fn test_driver_control_and_slot_status() {
    let (mut handle, _mock) = ready_with_card(SessionConfig::default()).await;

    handle.control(vec![0x01, 0x02]).await.unwrap();
    let callbacks = handle
        .recv_until(WAIT, |c| matches!(c, Callback::ControlResponse(_)))
        .await
        .unwrap();
    assert_eq!(
        callbacks.last(),
        Some(&Callback::ControlResponse(Bytes::from_static(&[0x01, 0x02])))
    );

    handle.power_off(0).await.unwrap();
    let callbacks = handle
        .recv_until(WAIT, |c| matches!(c, Callback::CardDisconnected(_)))
        .await
        .unwrap();
    assert_eq!(callbacks.last(), Some(&Callback::CardDisconnected(Channel::unpowered(0))));

    handle.power_on(0).await.unwrap();
    let callbacks = handle
        .recv_until(WAIT, |c| matches!(c, Callback::CardConnected(_)))
        .await
        .unwrap();
    assert_eq!(
        callbacks.last(),
        Some(&Callback::CardConnected(Channel::new(0, MOCK_ATR.to_vec())))
    );
}

#[tokio::test]
async fn test_driver_rejects_second_command_while_busy() {
    let (handle, mock) = ready_with_card(SessionConfig::default()).await;
    mock.set_mute(true).await;

    handle.transmit(0, vec![0x00, 0xB0, 0x00, 0x00]).await.unwrap();
    let err = handle.transmit(0, vec![0x00, 0xB0, 0x00, 0x00]).await.unwrap_err();

    assert!(matches!(err, TransportError::Busy));
    assert_eq!(handle.state(), SessionState::AwaitingResponse);
}

#[tokio::test(start_paused = true)]
async fn test_driver_response_deadline_reports_card_mute() {
    let config = SessionConfig::builder()
        .with_response_timeout(Duration::from_millis(300))
        .build()
        .unwrap();
    let (mut handle, mock) = ready_with_card(config).await;
    mock.set_mute(true).await;

    handle.transmit(0, vec![0x00, 0xB0, 0x00, 0x00]).await.unwrap();
    let callbacks = handle
        .recv_until(WAIT, |c| matches!(c, Callback::ReaderOrCardError { .. }))
        .await
        .unwrap();

    let Some(Callback::ReaderOrCardError { slot, error }) = callbacks.last() else {
        panic!("expected reader-or-card-error");
    };
    assert_eq!(*slot, 0);
    assert_eq!(error.code, ErrorCode::CardMute);
    assert!(!error.fatal);
    assert_eq!(handle.state(), SessionState::Idle);

    // The session keeps working once the reader answers again.
    mock.set_mute(false).await;
    handle.transmit(0, vec![0x00, 0xB0, 0x00, 0x00]).await.unwrap();
    handle.recv_until(WAIT, is_transmit_response).await.unwrap();
}

#[tokio::test]
async fn test_driver_card_insert_and_remove() {
    let (mut handle, mock) = start(SessionConfig::default(), MockReaderConfig::default());
    open_ready(&mut handle).await;

    mock.insert_card(1).await.unwrap();
    let callbacks = handle
        .recv_until(WAIT, |c| matches!(c, Callback::CardConnected(_)))
        .await
        .unwrap();
    assert_eq!(
        callbacks,
        vec![
            Callback::ReaderStatusChanged {
                slot: 1,
                present: true,
                powered: false,
            },
            Callback::CardConnected(Channel::new(1, MOCK_ATR.to_vec())),
        ]
    );

    mock.remove_card(1).await.unwrap();
    let callbacks = handle
        .recv_until(WAIT, |c| matches!(c, Callback::ReaderStatusChanged { .. }))
        .await
        .unwrap();
    assert_eq!(
        callbacks.last(),
        Some(&Callback::ReaderStatusChanged {
            slot: 1,
            present: false,
            powered: false,
        })
    );
}

#[tokio::test]
async fn test_driver_sleep_and_wake() {
    let (mut handle, mock) = ready_with_card(SessionConfig::default()).await;

    mock.sleep().await;
    let callbacks = handle
        .recv_until(WAIT, |c| matches!(c, Callback::SleepStateChanged { .. }))
        .await
        .unwrap();
    assert_eq!(callbacks.last(), Some(&Callback::SleepStateChanged { sleeping: true }));

    mock.wake().await;
    let callbacks = handle
        .recv_until(WAIT, |c| matches!(c, Callback::SleepStateChanged { .. }))
        .await
        .unwrap();
    assert_eq!(callbacks.last(), Some(&Callback::SleepStateChanged { sleeping: false }));
}

#[tokio::test]
async fn test_driver_power_info() {
    let (mut handle, _mock) = ready_with_card(SessionConfig::default()).await;

    handle.read_power_info().await.unwrap();
    let callbacks = handle
        .recv_until(WAIT, |c| matches!(c, Callback::PowerInfo { .. }))
        .await
        .unwrap();

    assert_eq!(
        callbacks.last(),
        Some(&Callback::PowerInfo {
            state: PowerState::ExternalPower,
            battery_level: 87,
        })
    );
}

#[tokio::test]
async fn test_driver_write_failure_tears_down() {
    let (mut handle, mock) = ready_with_card(SessionConfig::default()).await;
    mock.set_fail_writes(true).await;

    handle.transmit(0, vec![0x00, 0xB0, 0x00, 0x00]).await.unwrap();
    let callbacks = handle
        .recv_until(WAIT, |c| *c == Callback::SessionClosed)
        .await
        .unwrap();

    let error = callbacks
        .iter()
        .find_map(|c| match c {
            Callback::SessionError(error) => Some(error.clone()),
            _ => None,
        })
        .expect("session error before close");
    assert_eq!(error.code, ErrorCode::WriteAttributeFailed);
    assert!(error.fatal);
    assert_eq!(handle.state(), SessionState::Disconnected);
    assert!(!mock.is_connected().await);

    let registry = handle.registry();
    let registry = registry.lock().await;
    assert!(!registry.is_connected(&device()));
    assert!(registry.is_known(&device()));
}

#[tokio::test]
async fn test_driver_link_loss_closes_session() {
    let (mut handle, mock) = ready_with_card(SessionConfig::default()).await;

    mock.drop_link().await;
    handle
        .recv_until(WAIT, |c| *c == Callback::SessionClosed)
        .await
        .unwrap();
    assert_eq!(handle.state(), SessionState::Disconnected);

    // A new connect request runs setup again.
    let callbacks = open_ready(&mut handle).await;
    assert!(callbacks.contains(&Callback::CardConnected(Channel::new(0, MOCK_ATR.to_vec()))));
}

#[tokio::test(start_paused = true)]
async fn test_driver_retries_refused_connections() {
    let (mut handle, mock) = start(SessionConfig::default(), MockReaderConfig::default());
    mock.refuse_connections(2).await;

    let callbacks = open_ready(&mut handle).await;
    assert_eq!(callbacks[0], Callback::SessionConnected);
    assert!(mock.is_connected().await);
}

#[tokio::test(start_paused = true)]
async fn test_driver_gives_up_after_max_attempts() {
    let (mut handle, mock) = start(SessionConfig::default(), MockReaderConfig::default());
    mock.refuse_connections(10).await;

    handle.open().await.unwrap();
    let callbacks = handle
        .recv_until(WAIT, |c| *c == Callback::SessionClosed)
        .await
        .unwrap();

    assert_eq!(callbacks, vec![Callback::SessionClosed]);
    assert_eq!(handle.state(), SessionState::Disconnected);
    assert!(!mock.is_connected().await);
}

#[tokio::test]
async fn test_driver_disconnect_request() {
    let (mut handle, mock) = ready_with_card(SessionConfig::default()).await;

    handle.disconnect().await.unwrap();
    handle
        .recv_until(WAIT, |c| *c == Callback::SessionClosed)
        .await
        .unwrap();

    assert!(!mock.is_connected().await);
    let registry = handle.registry();
    assert_eq!(registry.lock().await.connected().count(), 0);
}

#[tokio::test]
async fn test_driver_shutdown_disconnects() {
    let (handle, mock) = ready_with_card(SessionConfig::default()).await;
    assert!(mock.is_connected().await);

    handle.shutdown().await.unwrap();
    assert!(!mock.is_connected().await);
}

#[tokio::test]
async fn test_driver_secured_service() {
    let reader = MockReaderConfig {
        secured: true,
        ..MockReaderConfig::default()
    };
    let (mut handle, _mock) = start(SessionConfig::default(), reader);

    let callbacks = open_ready(&mut handle).await;
    let Some(Callback::SessionReady(constants)) = callbacks.last() else {
        panic!("expected session-ready");
    };
    assert!(constants.secured_service);
}

#[derive(Default)]
struct Recorder {
    ready: bool,
    responses: Vec<(u8, Bytes)>,
}

impl SessionListener for Recorder {
    fn on_session_ready(&mut self, _constants: &blescard_core::DeviceSessionConstants) {
        self.ready = true;
    }

    fn on_transmit_response(&mut self, channel: &Channel, response: &Bytes) {
        self.responses.push((channel.slot(), response.clone()));
    }
}

#[tokio::test]
async fn test_driver_dispatches_to_listener() {
    let (mut handle, mock) = start(SessionConfig::default(), MockReaderConfig::default());
    mock.insert_card(0).await.unwrap();
    handle.open().await.unwrap();

    let mut recorder = Recorder::default();
    while !recorder.ready {
        assert!(handle.dispatch_next(&mut recorder).await);
    }

    handle.transmit(0, vec![0x80, 0xCA]).await.unwrap();
    while recorder.responses.is_empty() {
        assert!(handle.dispatch_next(&mut recorder).await);
    }
    assert_eq!(
        recorder.responses,
        vec![(0, Bytes::from_static(&[0x80, 0xCA, 0x90, 0x00]))]
    );
}

#[tokio::test]
async fn test_driver_rejects_invalid_config() {
    let (reader, _mock) = blescard_transport::mock::MockReader::new();
    let config = SessionConfig {
        max_chunk_size: 0,
        ..SessionConfig::default()
    };

    let result = blescard_transport::SessionDriver::new(config, reader, device());
    assert!(matches!(result, Err(TransportError::Protocol(_))));
}
