//! Async session driver.
//!
//! The [`SessionDriver`] owns a [`Session`] and a [`Transport`] and runs
//! them in one Tokio task. Everything that can advance the session is
//! funneled into that task, so events are handled strictly one at a time:
//!
//! ```text
//!   SessionHandle ──requests──┐
//!                             │     ┌──────────────────────────┐
//!   Transport ───link events──┼────►│ driver task              │
//!                             │     │  Session::handle(event)  │──callbacks──► SessionHandle
//!   response deadline ────────┘     │  execute Actions         │
//!                                   └────────────┬─────────────┘
//!                                                │ await
//!                                                ▼
//!                                            Transport
//! ```
//!
//! Each [`Action`] is carried out by awaiting the transport; its outcome
//! is queued as a [`TransportEvent`] and handled before any new request or
//! notification is taken, so the session always sees the completion of
//! its own work first.
//!
//! # Examples
//!
//! ```no_run
//! use blescard_core::DeviceId;
//! use blescard_session::{Callback, SessionConfig};
//! use blescard_transport::{SessionDriver, mock::MockReader};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let (reader, mock) = MockReader::new();
//!     mock.insert_card(0).await?;
//!
//!     let driver = SessionDriver::new(SessionConfig::default(), reader, DeviceId::new("mock")?)?;
//!     let mut handle = driver.start()?;
//!     handle.open().await?;
//!
//!     while let Some(callback) = handle.recv().await {
//!         if matches!(callback, Callback::SessionReady(_)) {
//!             break;
//!         }
//!     }
//!
//!     handle.transmit(0, vec![0x00, 0xA4, 0x04, 0x00]).await?;
//!     handle.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, trace, warn};

use blescard_core::DeviceId;
use blescard_session::{
    Action, CardCommand, Callback, Event, Request, Session, SessionConfig, SessionListener,
    SessionRegistry, SessionState, TransportEvent,
};

use crate::{
    Result, TransportError,
    traits::{LinkEvent, LinkEvents, Transport},
};

/// Default pause between connection attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Default number of failed connection attempts before giving up.
pub const DEFAULT_MAX_CONNECT_ATTEMPTS: usize = 5;

/// Registry shared by every driver of an application.
pub type SharedRegistry = Arc<Mutex<SessionRegistry>>;

/// A request from the handle with its acknowledgement channel.
#[derive(Debug)]
struct Envelope {
    request: Request,
    reply: oneshot::Sender<Result<()>>,
}

/// Builder for a session task.
///
/// # Lifecycle
///
/// 1. Create the driver with a configuration, a transport and a device id
/// 2. Optionally share a registry or tune connection retries
/// 3. Call `start()` to spawn the task and get a [`SessionHandle`]
/// 4. Drive the session through the handle
/// 5. `shutdown()` tears the link down and waits for the task
pub struct SessionDriver<T: Transport> {
    config: SessionConfig,
    transport: T,
    device: DeviceId,
    registry: SharedRegistry,
    retry_delay: Duration,
    max_connect_attempts: usize,
}

impl<T: Transport> SessionDriver<T> {
    /// Create a driver.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(config: SessionConfig, transport: T, device: DeviceId) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            transport,
            device,
            registry: SharedRegistry::default(),
            retry_delay: DEFAULT_RETRY_DELAY,
            max_connect_attempts: DEFAULT_MAX_CONNECT_ATTEMPTS,
        })
    }

    /// Record this session in `registry` instead of a private one.
    pub fn with_registry(mut self, registry: SharedRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Pause `delay` between connection attempts and give up after
    /// `max_attempts` consecutive failures.
    pub fn with_connect_retry(mut self, delay: Duration, max_attempts: usize) -> Self {
        self.retry_delay = delay;
        self.max_connect_attempts = max_attempts.max(1);
        self
    }

    /// Spawn the session task.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport's link events were already taken.
    pub fn start(mut self) -> Result<SessionHandle> {
        let link = self
            .transport
            .take_link_events()
            .ok_or_else(|| TransportError::unsupported("link events already taken"))?;

        let (request_tx, request_rx) = mpsc::channel(32);
        let (callback_tx, callback_rx) = mpsc::channel(100);
        let (state_tx, state_rx) = watch::channel(SessionState::Disconnected);

        let mut session = Session::new(self.config);
        if let Some(limit) = self.transport.max_chunk_size() {
            let size = limit.min(session.config().max_chunk_size);
            session.set_max_chunk_size(size);
        }

        info!("Starting session for {} ({})", self.device, self.transport.name());
        let task = DriverTask {
            session,
            transport: self.transport,
            device: self.device.clone(),
            registry: Arc::clone(&self.registry),
            requests: request_rx,
            link,
            link_open: true,
            callbacks: callback_tx,
            state: state_tx,
            pending: VecDeque::new(),
            deadline: None,
            connect_failures: 0,
            retry_delay: self.retry_delay,
            max_connect_attempts: self.max_connect_attempts,
        };

        Ok(SessionHandle {
            device: self.device,
            requests: request_tx,
            callbacks: callback_rx,
            state: state_rx,
            registry: self.registry,
            task: tokio::spawn(task.run()),
        })
    }
}

/// Application side of a running session.
///
/// Callbacks travel over a bounded channel and the driver waits for room
/// before taking the next request. An application that sends requests
/// without ever draining callbacks ([`recv`](Self::recv),
/// [`recv_until`](Self::recv_until), [`dispatch_next`](Self::dispatch_next))
/// can therefore wait forever for a request to be acknowledged once the
/// channel is full.
pub struct SessionHandle {
    device: DeviceId,
    requests: mpsc::Sender<Envelope>,
    callbacks: mpsc::Receiver<Callback>,
    state: watch::Receiver<SessionState>,
    registry: SharedRegistry,
    task: JoinHandle<Result<()>>,
}

impl SessionHandle {
    /// Submit a request. Resolves once the driver has taken it.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Busy`] for a card command while another
    /// one is in flight, and [`TransportError::ChannelClosed`] if the
    /// driver task has stopped.
    pub async fn request(&self, request: Request) -> Result<()> {
        let (reply, ack) = oneshot::channel();
        self.requests
            .send(Envelope { request, reply })
            .await
            .map_err(|_| TransportError::channel_closed())?;
        ack.await.map_err(|_| TransportError::channel_closed())?
    }

    /// Connect and, once the link is up, run session setup.
    pub async fn open(&self) -> Result<()> {
        self.request(Request::Connect).await
    }

    pub async fn transmit(&self, slot: u8, apdu: impl Into<Bytes>) -> Result<()> {
        let apdu = apdu.into();
        self.command(CardCommand::Transmit { slot, apdu }).await
    }

    pub async fn control(&self, data: impl Into<Bytes>) -> Result<()> {
        let data = data.into();
        self.command(CardCommand::Control { data }).await
    }

    pub async fn power_on(&self, slot: u8) -> Result<()> {
        self.command(CardCommand::PowerOn { slot }).await
    }

    pub async fn power_off(&self, slot: u8) -> Result<()> {
        self.command(CardCommand::PowerOff { slot }).await
    }

    pub async fn get_slot_status(&self, slot: u8) -> Result<()> {
        self.command(CardCommand::GetSlotStatus { slot }).await
    }

    pub async fn read_power_info(&self) -> Result<()> {
        self.request(Request::ReadPowerInfo).await
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.request(Request::Disconnect).await
    }

    async fn command(&self, command: CardCommand) -> Result<()> {
        self.request(Request::Command(command)).await
    }

    /// Receive the next callback. Returns `None` once the task has stopped
    /// and every callback was received.
    pub async fn recv(&mut self) -> Option<Callback> {
        self.callbacks.recv().await
    }

    /// Receive callbacks until one matches `predicate`, or `timeout`
    /// elapses. Returns every callback received, the match last.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Timeout`] if nothing matched in time and
    /// [`TransportError::ChannelClosed`] if the task stopped first.
    pub async fn recv_until<F>(&mut self, timeout: Duration, mut predicate: F) -> Result<Vec<Callback>>
    where
        F: FnMut(&Callback) -> bool,
    {
        let mut received = Vec::new();
        // Durations past the clock's range never expire.
        let deadline = Instant::now().checked_add(timeout);
        loop {
            let next = match deadline {
                Some(at) => time::timeout_at(at, self.callbacks.recv()).await,
                None => Ok(self.callbacks.recv().await),
            };
            match next {
                Ok(Some(callback)) => {
                    let done = predicate(&callback);
                    received.push(callback);
                    if done {
                        return Ok(received);
                    }
                }
                Ok(None) => return Err(TransportError::channel_closed()),
                Err(_) => return Err(TransportError::timeout_after(timeout)),
            }
        }
    }

    /// Receive one callback and deliver it to `listener`. Returns `false`
    /// once the task has stopped.
    pub async fn dispatch_next<L: SessionListener>(&mut self, listener: &mut L) -> bool {
        match self.callbacks.recv().await {
            Some(callback) => {
                listener.dispatch(&callback);
                true
            }
            None => false,
        }
    }

    /// Session state after the last handled event.
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn device(&self) -> &DeviceId {
        &self.device
    }

    pub fn registry(&self) -> SharedRegistry {
        Arc::clone(&self.registry)
    }

    /// Disconnect if needed and wait for the task to finish.
    ///
    /// Callbacks emitted during teardown are discarded.
    pub async fn shutdown(self) -> Result<()> {
        let Self {
            requests,
            callbacks,
            task,
            ..
        } = self;
        drop(requests);
        drop(callbacks);

        match task.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Ok(()),
            Err(e) => Err(TransportError::other(format!("Session task panicked: {e}"))),
        }
    }
}

/// State owned by the spawned task.
struct DriverTask<T: Transport> {
    session: Session,
    transport: T,
    device: DeviceId,
    registry: SharedRegistry,

    requests: mpsc::Receiver<Envelope>,
    link: LinkEvents,
    link_open: bool,
    callbacks: mpsc::Sender<Callback>,
    state: watch::Sender<SessionState>,

    pending: VecDeque<Event>,
    deadline: Option<(u8, Instant)>,

    connect_failures: usize,
    retry_delay: Duration,
    max_connect_attempts: usize,
}

impl<T: Transport> DriverTask<T> {
    async fn run(mut self) -> Result<()> {
        loop {
            while let Some(event) = self.pending.pop_front() {
                self.step(event).await;
            }

            let deadline = self.deadline;
            let expiry = deadline.map_or_else(Instant::now, |(_, at)| at);

            tokio::select! {
                envelope = self.requests.recv() => match envelope {
                    Some(envelope) => self.on_request(envelope),
                    None => break,
                },
                event = self.link.recv(), if self.link_open => match event {
                    Some(LinkEvent::Notification { attribute, value }) => {
                        trace!("Notification on {}: {} bytes", attribute, value.len());
                        self.pending
                            .push_back(TransportEvent::Notification { attribute, value }.into());
                    }
                    Some(LinkEvent::Disconnected) => {
                        warn!("Link to {} lost", self.device);
                        self.deadline = None;
                        self.pending.push_back(TransportEvent::Disconnected.into());
                    }
                    None => {
                        debug!("Link event channel closed");
                        self.link_open = false;
                    }
                },
                _ = time::sleep_until(expiry), if deadline.is_some() => {
                    if let Some((sequence, _)) = self.deadline.take() {
                        warn!("Response deadline expired for sequence {}", sequence);
                        self.pending.push_back(Event::ResponseTimeout { sequence });
                    }
                }
            }
        }

        self.teardown().await;
        Ok(())
    }

    /// Close the session on the way out.
    async fn teardown(&mut self) {
        if !self.session.state().is_connected() {
            return;
        }
        debug!("Handle dropped, disconnecting {}", self.device);
        self.pending.push_back(Request::Disconnect.into());
        while let Some(event) = self.pending.pop_front() {
            self.step(event).await;
        }
    }

    fn on_request(&mut self, envelope: Envelope) {
        let Envelope { request, reply } = envelope;
        let state = self.session.state();

        let in_flight = matches!(
            state,
            SessionState::WritingCommand | SessionState::AwaitingResponse
        );
        let accepted = match &request {
            Request::Command(_) if in_flight => {
                debug!("Rejecting command: exchange in flight ({})", state);
                Err(TransportError::busy())
            }
            _ => Ok(()),
        };

        if accepted.is_ok() {
            if matches!(request, Request::Connect) {
                self.connect_failures = 0;
            }
            self.pending.push_back(request.into());
        }
        if reply.send(accepted).is_err() {
            trace!("Requester went away before the acknowledgement");
        }
    }

    /// Handle one event and carry out everything it asks for.
    async fn step(&mut self, event: Event) {
        let output = self.session.handle(event);
        self.state.send_replace(self.session.state());

        for callback in output.callbacks {
            self.deliver(callback).await;
        }
        for action in output.actions {
            self.execute(action).await;
        }
    }

    async fn deliver(&mut self, callback: Callback) {
        debug!("Callback {}", callback.name());
        self.registry.lock().await.observe(&self.device, &callback);

        // Setup starts as soon as the link is up.
        if let Callback::SessionConnected = callback {
            self.pending.push_back(Request::Create.into());
        }

        if self.callbacks.send(callback).await.is_err() {
            trace!("Callback receiver dropped");
        }
    }

    async fn execute(&mut self, action: Action) {
        trace!("Executing {:?}", action);
        let event = match action {
            Action::Connect => self.connect().await,
            Action::DiscoverAttributes => TransportEvent::AttributesDiscovered(
                self.transport
                    .discover_attributes()
                    .await
                    .map_err(|e| e.to_string()),
            ),
            Action::ReadAttribute(attribute) => TransportEvent::AttributeRead {
                attribute,
                result: self
                    .transport
                    .read_attribute(attribute)
                    .await
                    .map_err(|e| e.to_string()),
            },
            Action::WriteAttribute { attribute, value } => TransportEvent::AttributeWritten {
                attribute,
                result: self
                    .transport
                    .write_attribute(attribute, value)
                    .await
                    .map_err(|e| e.to_string()),
            },
            Action::EnableNotifications(attribute) => TransportEvent::NotificationsEnabled {
                attribute,
                result: self
                    .transport
                    .enable_notifications(attribute)
                    .await
                    .map_err(|e| e.to_string()),
            },
            Action::Disconnect => {
                self.deadline = None;
                if let Err(e) = self.transport.disconnect().await {
                    warn!("Disconnect from {} failed: {}", self.device, e);
                }
                TransportEvent::Disconnected
            }
            Action::ArmResponseTimer { sequence, timeout } => {
                self.deadline = Instant::now()
                    .checked_add(timeout)
                    .map(|at| (sequence, at));
                return;
            }
            Action::CancelResponseTimer => {
                self.deadline = None;
                return;
            }
        };
        self.pending.push_back(event.into());
    }

    /// One connection attempt. After too many failures the session is
    /// asked to give up instead of retrying.
    async fn connect(&mut self) -> TransportEvent {
        if self.connect_failures > 0 {
            time::sleep(self.retry_delay).await;
        }

        match self.transport.connect().await {
            Ok(()) => {
                self.connect_failures = 0;
                TransportEvent::Connected
            }
            Err(e) => {
                self.connect_failures += 1;
                warn!(
                    "Connection attempt {} to {} failed: {}",
                    self.connect_failures, self.device, e
                );
                if self.connect_failures >= self.max_connect_attempts {
                    error!("Giving up on {} after {} attempts", self.device, self.connect_failures);
                    self.pending.push_back(Request::Disconnect.into());
                }
                TransportEvent::Disconnected
            }
        }
    }
}
