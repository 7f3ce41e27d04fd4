//! Transport layer and async driver for reader sessions.
//!
//! This crate connects the pure [`Session`](blescard_session::Session)
//! state machine to a real (or simulated) GATT link.
//!
//! # Design Philosophy
//!
//! - **Async-first**: transports expose `Send` futures (Rust 1.90 +
//!   Edition 2024 RPITIT) so a session runs as an ordinary Tokio task.
//! - **Single owner**: one task owns the session and its transport; the
//!   application talks to it only through channels.
//! - **Mock-friendly**: [`MockReader`](mock::MockReader) simulates a full
//!   multi-slot reader for tests and demos.
//!
//! # Example
//!
//! ```no_run
//! use blescard_core::DeviceId;
//! use blescard_session::{SessionConfig, SessionListener};
//! use blescard_transport::{SessionDriver, mock::MockReader};
//!
//! struct Printer;
//!
//! impl SessionListener for Printer {
//!     fn on_transmit_response(&mut self, channel: &blescard_core::Channel, response: &bytes::Bytes) {
//!         println!("slot {}: {:02X?}", channel.slot(), response);
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let (reader, _mock) = MockReader::new();
//!     let driver = SessionDriver::new(SessionConfig::default(), reader, DeviceId::new("demo")?)?;
//!     let mut handle = driver.start()?;
//!     handle.open().await?;
//!
//!     let mut printer = Printer;
//!     while handle.dispatch_next(&mut printer).await {}
//!     Ok(())
//! }
//! ```

pub mod driver;
pub mod error;
pub mod mock;
pub mod traits;

pub use blescard_session::SessionListener;
pub use driver::{
    DEFAULT_MAX_CONNECT_ATTEMPTS, DEFAULT_RETRY_DELAY, SessionDriver, SessionHandle,
    SharedRegistry,
};
pub use error::{Result, TransportError};
pub use traits::{LinkEvent, LinkEvents, Transport};
