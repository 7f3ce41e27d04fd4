//! Transport trait definition.
//!
//! A [`Transport`] is the GATT client side of one reader link. The session
//! driver calls it to carry out every [`Action`](blescard_session::Action)
//! the session produces, and receives unsolicited traffic (notifications
//! and link loss) through the [`LinkEvents`] channel.
//!
//! Methods return `Send` futures so the driver can run on a multi-threaded
//! Tokio runtime. Implementations may still write them as plain `async fn`.

use std::future::Future;

use bytes::Bytes;
use tokio::sync::mpsc;

use blescard_session::AttributeId;

use crate::error::Result;

/// Unsolicited traffic from the reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A value notified on a subscribed attribute.
    Notification { attribute: AttributeId, value: Bytes },

    /// The link dropped without being asked to.
    Disconnected,
}

/// Receiving end of a transport's unsolicited traffic.
pub type LinkEvents = mpsc::UnboundedReceiver<LinkEvent>;

/// GATT client for one reader.
///
/// # Examples
///
/// ```no_run
/// use blescard_transport::{Transport, Result};
///
/// async fn dump_attributes<T: Transport>(transport: &mut T) -> Result<()> {
///     transport.connect().await?;
///     for attribute in transport.discover_attributes().await? {
///         println!("{attribute}");
///     }
///     transport.disconnect().await
/// }
/// ```
pub trait Transport: Send + 'static {
    /// Human-readable name of the remote device.
    fn name(&self) -> &str;

    /// Establish the link.
    fn connect(&mut self) -> impl Future<Output = Result<()>> + Send;

    /// List every characteristic of every service.
    fn discover_attributes(&mut self) -> impl Future<Output = Result<Vec<AttributeId>>> + Send;

    fn read_attribute(
        &mut self,
        attribute: AttributeId,
    ) -> impl Future<Output = Result<Bytes>> + Send;

    /// Write one value. Never called with more than
    /// [`max_chunk_size`](Transport::max_chunk_size) bytes.
    fn write_attribute(
        &mut self,
        attribute: AttributeId,
        value: Bytes,
    ) -> impl Future<Output = Result<()>> + Send;

    fn enable_notifications(
        &mut self,
        attribute: AttributeId,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Tear the link down. Does not report [`LinkEvent::Disconnected`].
    fn disconnect(&mut self) -> impl Future<Output = Result<()>> + Send;

    /// Hand over the unsolicited traffic channel. Returns `None` once taken.
    fn take_link_events(&mut self) -> Option<LinkEvents>;

    /// Largest single write the link accepts, if smaller than the session's
    /// configured chunk size.
    fn max_chunk_size(&self) -> Option<usize> {
        None
    }
}
