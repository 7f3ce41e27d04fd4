//! Reader session state machine.
//!
//! A [`Session`] drives one multi-slot card reader from connection to
//! teardown. It is a pure transition function: every [`Event`] yields an
//! [`Output`] listing the transport [`Action`]s to perform and the
//! [`Callback`]s to deliver, in order.
//!
//! ```text
//!   Request ──────┐
//!                 │       ┌──────────────┐       ┌─► Action   (to the transport)
//!   TransportEvent├──────►│   Session    ├───────┤
//!                 │       │ (state, slots│       └─► Callback (to the application)
//!   ResponseTimeout       │  reassembler)│
//!                 ┘       └──────────────┘
//! ```
//!
//! # Modules
//!
//! - [`state`]: the 13-state lifecycle graph with transition history
//! - [`event`]: session inputs
//! - [`action`]: session outputs
//! - [`dispatch`]: error routing and the [`SessionListener`] callback trait
//! - [`config`]: [`SessionConfig`] and the GATT profile
//! - [`registry`]: known and connected readers
//! - [`session`]: the transition function

pub mod action;
pub mod config;
pub mod dispatch;
pub mod event;
pub mod registry;
pub mod session;
pub mod state;

pub use action::{Action, Callback, Output};
pub use config::{GattProfile, SessionConfig, SessionConfigBuilder};
pub use dispatch::{ErrorRoute, SessionListener, route};
pub use event::{AttributeId, CardCommand, Event, Request, TransportEvent};
pub use registry::SessionRegistry;
pub use session::Session;
pub use state::{DEFAULT_HISTORY_SIZE, SessionState, StateMachine, StateTransition};
