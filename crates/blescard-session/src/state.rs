//! Session lifecycle states.
//!
//! # States
//!
//! - `Disconnected`: initial and terminal state
//! - `Connecting`: transport connection requested
//! - `Connected`: link up, waiting for the application to create the session
//! - `DiscoveringAttributes`: GATT discovery in progress
//! - `ReadingInformation`: reading device information and the slot bitmap
//! - `SubscribingNotifications`: enabling notifications one attribute at a time
//! - `ReadingSlotNames`: asking the reader for each slot's name
//! - `ConnectingToCard`: powering cards found in their slots
//! - `Idle`: ready for commands
//! - `WritingCommand`: sending a command chunk by chunk
//! - `AwaitingResponse`: command sent, reassembling the response
//! - `ReadingPowerInfo`: reading battery attributes
//! - `Disconnecting`: transport disconnect requested
//!
//! # Valid Transitions
//!
//! ```text
//! Disconnected ─► Connecting ─► Connected ─► DiscoveringAttributes ─► ReadingInformation
//!                   ▲    │ (retry)                                           │
//!                   └────┘                                                   ▼
//!              ReadingSlotNames ◄─────────────────────────── SubscribingNotifications
//!                │        │
//!                ▼        ▼
//!   ConnectingToCard ◄──► Idle ◄──► WritingCommand ─► AwaitingResponse ─► Idle
//!                          ▲ │
//!                          │ └──► ReadingPowerInfo ─► Idle
//!
//! any connected state ─► Disconnecting ─► Disconnected
//! any connected state ─► Disconnected (link lost)
//! ```
//!
//! # Examples
//!
//! ```
//! use blescard_session::{SessionState, StateMachine};
//!
//! let mut machine = StateMachine::new(16);
//! assert_eq!(machine.current_state(), SessionState::Disconnected);
//!
//! machine.transition_to(SessionState::Connecting).unwrap();
//! assert!(machine.transition_to(SessionState::Idle).is_err());
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use blescard_core::{Error, Result};

/// Default number of transitions kept for diagnostics.
///
/// A full session setup takes about ten transitions and each command two
/// more, so this covers setup plus a few dozen exchanges.
pub const DEFAULT_HISTORY_SIZE: usize = 100;

/// Position of a session in the device lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    DiscoveringAttributes,
    ReadingInformation,
    SubscribingNotifications,
    ReadingSlotNames,
    ConnectingToCard,
    Idle,
    WritingCommand,
    AwaitingResponse,
    ReadingPowerInfo,
    Disconnecting,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state_str = match self {
            SessionState::Disconnected => "Disconnected",
            SessionState::Connecting => "Connecting",
            SessionState::Connected => "Connected",
            SessionState::DiscoveringAttributes => "DiscoveringAttributes",
            SessionState::ReadingInformation => "ReadingInformation",
            SessionState::SubscribingNotifications => "SubscribingNotifications",
            SessionState::ReadingSlotNames => "ReadingSlotNames",
            SessionState::ConnectingToCard => "ConnectingToCard",
            SessionState::Idle => "Idle",
            SessionState::WritingCommand => "WritingCommand",
            SessionState::AwaitingResponse => "AwaitingResponse",
            SessionState::ReadingPowerInfo => "ReadingPowerInfo",
            SessionState::Disconnecting => "Disconnecting",
        };
        write!(f, "{}", state_str)
    }
}

impl SessionState {
    /// Check if transition to target state is valid from this state.
    ///
    /// # Examples
    ///
    /// ```
    /// use blescard_session::SessionState;
    ///
    /// assert!(SessionState::Idle.can_transition_to(&SessionState::WritingCommand));
    /// assert!(!SessionState::Idle.can_transition_to(&SessionState::AwaitingResponse));
    /// assert!(SessionState::AwaitingResponse.can_transition_to(&SessionState::Disconnecting));
    /// ```
    pub fn can_transition_to(&self, target: &SessionState) -> bool {
        use SessionState::*;

        matches!(
            (self, target),
            (Disconnected, Connecting)
            // Connect retry after a failed attempt
            | (Connecting, Connecting | Connected)
            | (Connected, DiscoveringAttributes)
            | (DiscoveringAttributes, ReadingInformation)
            | (ReadingInformation, SubscribingNotifications)
            | (SubscribingNotifications, ReadingSlotNames)
            | (ReadingSlotNames, ConnectingToCard | Idle)
            | (ConnectingToCard, Idle)
            | (Idle, ConnectingToCard | WritingCommand | ReadingPowerInfo)
            | (WritingCommand, AwaitingResponse | Idle)
            | (AwaitingResponse, Idle)
            | (ReadingPowerInfo, Idle)
        ) || (self.is_connected() && matches!(target, Disconnecting | Disconnected))
            || (*self == Disconnecting && *target == Disconnected)
    }

    /// The transport link is (or is being) established.
    pub fn is_connected(&self) -> bool {
        !matches!(self, SessionState::Disconnected | SessionState::Disconnecting)
    }

    /// A CCID exchange may be in flight in this state.
    pub fn exchanges_ccid(&self) -> bool {
        matches!(
            self,
            SessionState::ReadingSlotNames
                | SessionState::ConnectingToCard
                | SessionState::WritingCommand
                | SessionState::AwaitingResponse
        )
    }
}

/// A single recorded state change.
///
/// The timestamp is process-local and not serialized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: SessionState,
    pub to: SessionState,
    #[serde(skip, default = "Instant::now")]
    pub timestamp: Instant,
}

impl StateTransition {
    pub fn new(from: SessionState, to: SessionState) -> Self {
        Self {
            from,
            to,
            timestamp: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.timestamp.elapsed()
    }
}

/// Validated state holder with a bounded transition history.
#[derive(Debug)]
pub struct StateMachine {
    current_state: SessionState,
    state_entered_at: Instant,
    history: VecDeque<StateTransition>,
    history_size: usize,
}

impl StateMachine {
    /// Create a machine in `Disconnected` keeping `history_size` transitions.
    pub fn new(history_size: usize) -> Self {
        Self {
            current_state: SessionState::Disconnected,
            state_entered_at: Instant::now(),
            history: VecDeque::with_capacity(history_size.min(DEFAULT_HISTORY_SIZE)),
            history_size,
        }
    }

    pub fn current_state(&self) -> SessionState {
        self.current_state
    }

    pub fn time_in_current_state(&self) -> Duration {
        self.state_entered_at.elapsed()
    }

    /// Recent transitions, oldest first.
    pub fn history(&self) -> &VecDeque<StateTransition> {
        &self.history
    }

    /// Transition to a new state, validating the transition.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidStateTransition` if the transition is not in
    /// the lifecycle graph. The current state is left unchanged.
    pub fn transition_to(&mut self, new_state: SessionState) -> Result<StateTransition> {
        if !self.current_state.can_transition_to(&new_state) {
            return Err(Error::InvalidStateTransition {
                from: self.current_state.to_string(),
                to: new_state.to_string(),
            });
        }

        let transition = StateTransition::new(self.current_state, new_state);
        self.current_state = new_state;
        self.state_entered_at = Instant::now();

        if self.history_size > 0 {
            self.history.push_back(transition.clone());
            while self.history.len() > self.history_size {
                self.history.pop_front();
            }
        }

        Ok(transition)
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_SIZE)
    }
}
