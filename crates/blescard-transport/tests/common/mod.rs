//! Common test utilities for driver integration tests.

#![allow(dead_code)]

use std::time::Duration;

use blescard_core::DeviceId;
use blescard_session::{Callback, SessionConfig};
use blescard_transport::{
    SessionDriver, SessionHandle,
    mock::{MockReader, MockReaderConfig, MockReaderHandle},
};

/// Upper bound for any single wait in these tests.
pub const WAIT: Duration = Duration::from_secs(5);

pub fn device() -> DeviceId {
    DeviceId::new("AA:BB:CC:DD:EE:01").unwrap()
}

/// Start a driver against a fresh mock reader.
pub fn start(config: SessionConfig, reader: MockReaderConfig) -> (SessionHandle, MockReaderHandle) {
    let (reader, mock) = MockReader::with_config(reader);
    let driver = SessionDriver::new(config, reader, device())
        .unwrap()
        .with_connect_retry(Duration::from_millis(10), 3);
    (driver.start().unwrap(), mock)
}

/// Open the session and wait for session-ready. Returns every callback.
pub async fn open_ready(handle: &mut SessionHandle) -> Vec<Callback> {
    handle.open().await.unwrap();
    handle
        .recv_until(WAIT, |c| matches!(c, Callback::SessionReady(_)))
        .await
        .unwrap()
}

/// Start with default settings and a card in slot 0, wait for ready.
pub async fn ready_with_card(config: SessionConfig) -> (SessionHandle, MockReaderHandle) {
    let (mut handle, mock) = start(config, MockReaderConfig::default());
    mock.insert_card(0).await.unwrap();
    open_ready(&mut handle).await;
    (handle, mock)
}

pub fn is_transmit_response(callback: &Callback) -> bool {
    matches!(callback, Callback::TransmitResponse { .. })
}
