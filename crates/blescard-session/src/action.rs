//! Outputs of the session state machine.
//!
//! The session never performs I/O. Each event yields an [`Output`]: the
//! transport [`Action`]s to execute, in order, and the [`Callback`]s to
//! deliver to the application, in order.

use bytes::Bytes;
use std::time::Duration;

use blescard_core::{Channel, DeviceSessionConstants, PowerState, SCardError};

use crate::event::AttributeId;

/// Transport work requested by the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Connect,
    DiscoverAttributes,
    ReadAttribute(AttributeId),
    /// Write one chunk. Never larger than the configured chunk size.
    WriteAttribute {
        attribute: AttributeId,
        value: Bytes,
    },
    EnableNotifications(AttributeId),
    Disconnect,
    /// Deliver `Event::ResponseTimeout { sequence }` after `timeout`,
    /// replacing any armed deadline.
    ArmResponseTimer { sequence: u8, timeout: Duration },
    CancelResponseTimer,
}

/// Application notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Callback {
    SessionConnected,
    /// Emitted once, when setup and card auto-connection are done.
    SessionReady(DeviceSessionConstants),
    SessionClosed,
    SessionError(SCardError),
    ReaderOrCardError {
        slot: u8,
        error: SCardError,
    },
    ReaderStatusChanged {
        slot: u8,
        present: bool,
        powered: bool,
    },
    CardConnected(Channel),
    CardDisconnected(Channel),
    TransmitResponse {
        channel: Channel,
        response: Bytes,
    },
    ControlResponse(Bytes),
    PowerInfo {
        state: PowerState,
        battery_level: u8,
    },
    SleepStateChanged {
        sleeping: bool,
    },
}

impl Callback {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Callback::SessionConnected => "session-connected",
            Callback::SessionReady(_) => "session-ready",
            Callback::SessionClosed => "session-closed",
            Callback::SessionError(_) => "session-error",
            Callback::ReaderOrCardError { .. } => "reader-or-card-error",
            Callback::ReaderStatusChanged { .. } => "reader-status-changed",
            Callback::CardConnected(_) => "card-connected",
            Callback::CardDisconnected(_) => "card-disconnected",
            Callback::TransmitResponse { .. } => "transmit-response",
            Callback::ControlResponse(_) => "control-response",
            Callback::PowerInfo { .. } => "power-info",
            Callback::SleepStateChanged { .. } => "sleep-state-changed",
        }
    }
}

/// Everything one event produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Output {
    pub actions: Vec<Action>,
    pub callbacks: Vec<Callback>,
}

impl Output {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty() && self.callbacks.is_empty()
    }

    pub(crate) fn act(&mut self, action: Action) {
        self.actions.push(action);
    }

    pub(crate) fn notify(&mut self, callback: Callback) {
        self.callbacks.push(callback);
    }
}
