//! Error routing and callback delivery.
//!
//! Every [`SCardError`] raised by the session is routed by its fatal flag:
//!
//! ```text
//!   SCardError
//!       │
//!       ├── fatal ─────────────────► session-error + teardown (Disconnecting)
//!       │
//!       └── recoverable
//!             ├── slot known ──────► reader-or-card-error(slot), back to Idle
//!             └── no slot ─────────► session-error, session stays up
//! ```
//!
//! Callbacks are delivered to a [`SessionListener`] in the order the session
//! produced them.

use bytes::Bytes;

use blescard_core::{Channel, DeviceSessionConstants, PowerState, SCardError};

use crate::action::Callback;

/// Where an error is reported and what it does to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorRoute {
    /// Report as session-error and disconnect.
    Teardown,
    /// Report as reader-or-card-error for this slot.
    Slot(u8),
    /// Report as a non-fatal session-error.
    Session,
}

/// Decide how `error`, raised while working on `slot`, is reported.
///
/// # Examples
///
/// ```
/// use blescard_core::{ErrorCode, SCardError};
/// use blescard_session::{ErrorRoute, route};
///
/// let mute = SCardError::new(ErrorCode::CardMute, "no answer");
/// assert_eq!(route(&mute, Some(1)), ErrorRoute::Slot(1));
///
/// let dialog = SCardError::new(ErrorCode::DialogError, "desync");
/// assert_eq!(route(&dialog, Some(1)), ErrorRoute::Teardown);
/// ```
pub fn route(error: &SCardError, slot: Option<u8>) -> ErrorRoute {
    match (error.fatal, slot) {
        (true, _) => ErrorRoute::Teardown,
        (false, Some(slot)) => ErrorRoute::Slot(slot),
        (false, None) => ErrorRoute::Session,
    }
}

/// Receiver of session callbacks.
///
/// Every method has an empty default so listeners only implement what they
/// care about.
pub trait SessionListener {
    fn on_session_connected(&mut self) {}

    fn on_session_ready(&mut self, _constants: &DeviceSessionConstants) {}

    fn on_session_closed(&mut self) {}

    fn on_session_error(&mut self, _error: &SCardError) {}

    fn on_reader_or_card_error(&mut self, _slot: u8, _error: &SCardError) {}

    fn on_reader_status_changed(&mut self, _slot: u8, _present: bool, _powered: bool) {}

    fn on_card_connected(&mut self, _channel: &Channel) {}

    fn on_card_disconnected(&mut self, _channel: &Channel) {}

    fn on_transmit_response(&mut self, _channel: &Channel, _response: &Bytes) {}

    fn on_control_response(&mut self, _response: &Bytes) {}

    fn on_power_info(&mut self, _state: PowerState, _battery_level: u8) {}

    fn on_sleep_state_changed(&mut self, _sleeping: bool) {}

    /// Deliver one callback to the matching method.
    fn dispatch(&mut self, callback: &Callback) {
        match callback {
            Callback::SessionConnected => self.on_session_connected(),
            Callback::SessionReady(constants) => self.on_session_ready(constants),
            Callback::SessionClosed => self.on_session_closed(),
            Callback::SessionError(error) => self.on_session_error(error),
            Callback::ReaderOrCardError { slot, error } => {
                self.on_reader_or_card_error(*slot, error)
            }
            Callback::ReaderStatusChanged {
                slot,
                present,
                powered,
            } => self.on_reader_status_changed(*slot, *present, *powered),
            Callback::CardConnected(channel) => self.on_card_connected(channel),
            Callback::CardDisconnected(channel) => self.on_card_disconnected(channel),
            Callback::TransmitResponse { channel, response } => {
                self.on_transmit_response(channel, response)
            }
            Callback::ControlResponse(response) => self.on_control_response(response),
            Callback::PowerInfo {
                state,
                battery_level,
            } => self.on_power_info(*state, *battery_level),
            Callback::SleepStateChanged { sleeping } => self.on_sleep_state_changed(*sleeping),
        }
    }

    /// Deliver callbacks in order.
    fn dispatch_all<'a>(&mut self, callbacks: impl IntoIterator<Item = &'a Callback>)
    where
        Self: Sized,
    {
        for callback in callbacks {
            self.dispatch(callback);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blescard_core::ErrorCode;
    use rstest::rstest;

    #[rstest]
    #[case(ErrorCode::ProtocolError, Some(0), ErrorRoute::Teardown)]
    #[case(ErrorCode::DummyDevice, None, ErrorRoute::Teardown)]
    #[case(ErrorCode::CardMute, Some(2), ErrorRoute::Slot(2))]
    #[case(ErrorCode::CardCommunicationError, None, ErrorRoute::Session)]
    fn test_route(#[case] code: ErrorCode, #[case] slot: Option<u8>, #[case] expected: ErrorRoute) {
        assert_eq!(route(&SCardError::new(code, "x"), slot), expected);
    }

    #[test]
    fn test_recoverable_override_is_not_torn_down() {
        let error = SCardError::recoverable(ErrorCode::ProtocolError, "bad slot");
        assert_eq!(route(&error, None), ErrorRoute::Session);
    }

    #[derive(Default)]
    struct Recorder {
        seen: Vec<String>,
    }

    impl SessionListener for Recorder {
        fn on_reader_status_changed(&mut self, slot: u8, present: bool, powered: bool) {
            self.seen.push(format!("status {slot} {present} {powered}"));
        }

        fn on_card_connected(&mut self, channel: &Channel) {
            self.seen.push(format!("connected {}", channel.slot()));
        }
    }

    #[test]
    fn test_dispatch_preserves_order_and_skips_defaults() {
        let callbacks = vec![
            Callback::SessionConnected,
            Callback::ReaderStatusChanged {
                slot: 0,
                present: true,
                powered: false,
            },
            Callback::CardConnected(Channel::new(0, vec![0x3B])),
        ];

        let mut recorder = Recorder::default();
        recorder.dispatch_all(&callbacks);

        assert_eq!(recorder.seen, vec!["status 0 true false", "connected 0"]);
    }
}
