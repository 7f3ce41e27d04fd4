//! Inputs of the session state machine.
//!
//! Events come from three sources and are delivered one at a time:
//!
//! - [`Request`]: the application
//! - [`TransportEvent`]: the BLE (or other) transport, reporting the
//!   outcome of an [`Action`](crate::Action) or an unsolicited notification
//! - [`Event::ResponseTimeout`]: the response deadline armed by the session

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// A GATT characteristic, qualified by the service exposing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AttributeId {
    pub service: Uuid,
    pub characteristic: Uuid,
}

impl AttributeId {
    pub const fn new(service: Uuid, characteristic: Uuid) -> Self {
        Self {
            service,
            characteristic,
        }
    }
}

impl fmt::Display for AttributeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service, self.characteristic)
    }
}

/// A card or reader command issued by the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CardCommand {
    /// Exchange an APDU with the card in `slot`.
    Transmit { slot: u8, apdu: Bytes },
    /// Send a vendor control command to the reader.
    Control { data: Bytes },
    PowerOn { slot: u8 },
    PowerOff { slot: u8 },
    GetSlotStatus { slot: u8 },
}

impl CardCommand {
    /// Slot addressed by the command, `None` for reader-level commands.
    pub fn slot(&self) -> Option<u8> {
        match self {
            CardCommand::Transmit { slot, .. }
            | CardCommand::PowerOn { slot }
            | CardCommand::PowerOff { slot }
            | CardCommand::GetSlotStatus { slot } => Some(*slot),
            CardCommand::Control { .. } => None,
        }
    }
}

/// Application requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Connect,
    /// Start discovery once the link is up.
    Create,
    Command(CardCommand),
    ReadPowerInfo,
    Disconnect,
}

/// Transport completions and notifications.
///
/// Failures carry the transport's description of what went wrong.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected,
    Disconnected,
    AttributesDiscovered(Result<Vec<AttributeId>, String>),
    AttributeRead {
        attribute: AttributeId,
        result: Result<Bytes, String>,
    },
    AttributeWritten {
        attribute: AttributeId,
        result: Result<(), String>,
    },
    NotificationsEnabled {
        attribute: AttributeId,
        result: Result<(), String>,
    },
    Notification {
        attribute: AttributeId,
        value: Bytes,
    },
}

/// Anything that can advance the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Request(Request),
    Transport(TransportEvent),
    /// The deadline armed for the command with this sequence number expired.
    ResponseTimeout { sequence: u8 },
}

impl Event {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Event::Request(Request::Connect) => "connect",
            Event::Request(Request::Create) => "create",
            Event::Request(Request::Command(_)) => "command",
            Event::Request(Request::ReadPowerInfo) => "read-power-info",
            Event::Request(Request::Disconnect) => "disconnect",
            Event::Transport(TransportEvent::Connected) => "transport-connected",
            Event::Transport(TransportEvent::Disconnected) => "transport-disconnected",
            Event::Transport(TransportEvent::AttributesDiscovered(_)) => "attributes-discovered",
            Event::Transport(TransportEvent::AttributeRead { .. }) => "attribute-read",
            Event::Transport(TransportEvent::AttributeWritten { .. }) => "attribute-written",
            Event::Transport(TransportEvent::NotificationsEnabled { .. }) => {
                "notifications-enabled"
            }
            Event::Transport(TransportEvent::Notification { .. }) => "notification",
            Event::ResponseTimeout { .. } => "response-timeout",
        }
    }
}

impl From<Request> for Event {
    fn from(request: Request) -> Self {
        Event::Request(request)
    }
}

impl From<TransportEvent> for Event {
    fn from(event: TransportEvent) -> Self {
        Event::Transport(event)
    }
}

impl From<CardCommand> for Event {
    fn from(command: CardCommand) -> Self {
        Event::Request(Request::Command(command))
    }
}
