//! Mock CCID reader for testing and development.
//!
//! [`MockReader`] implements [`Transport`] entirely in memory. It exposes
//! the Device Information and Battery services plus the CCID service,
//! answers CCID commands the way a contact reader does and notifies
//! responses in MTU-sized fragments. The paired [`MockReaderHandle`]
//! inserts and removes cards, puts the reader to sleep, drops the link
//! and injects failures.
//!
//! Simulated command behavior:
//!
//! | Command         | Card absent          | Card unpowered   | Card powered     |
//! |-----------------|----------------------|------------------|------------------|
//! | IccPowerOn      | mute (DataBlock)     | ATR              | ATR              |
//! | IccPowerOff     | SlotStatus absent    | SlotStatus       | SlotStatus       |
//! | GetSlotStatus   | SlotStatus absent    | SlotStatus       | SlotStatus       |
//! | XfrBlock        | mute (DataBlock)     | SlotStatus       | APDU + `90 00`   |
//! | Escape `58 21 n`| slot name            | slot name        | slot name        |
//! | Escape other    | echo                 | echo             | echo             |

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, trace};
use uuid::Uuid;

use blescard_core::constants::{
    GATT_BATTERY_LEVEL, GATT_BATTERY_POWER_STATE, GATT_BATTERY_SERVICE,
    GATT_DEVICE_INFORMATION_SERVICE, GATT_FIRMWARE_REVISION, GATT_HARDWARE_REVISION,
    GATT_MANUFACTURER_NAME, GATT_MODEL_NUMBER, GATT_PNP_ID, GATT_SERIAL_NUMBER,
    GATT_SOFTWARE_REVISION, HEADER_SIZE, LOW_POWER_FLAG, PC_TO_RDR_ESCAPE,
    PC_TO_RDR_GET_SLOT_STATUS, PC_TO_RDR_ICC_POWER_OFF, PC_TO_RDR_ICC_POWER_ON,
    PC_TO_RDR_XFR_BLOCK, RDR_TO_PC_DATA_BLOCK, RDR_TO_PC_ESCAPE, RDR_TO_PC_SLOT_STATUS,
    SEQUENCE_OFFSET, SLOT_ERROR_CMD_NOT_SUPPORTED, SLOT_ERROR_ICC_MUTE, SLOT_NAME_ESCAPE_PREFIX,
    SLOT_OFFSET, SLOTS_PER_BITMAP_BYTE, sig_uuid,
};
use blescard_session::{AttributeId, GattProfile};

use crate::{
    Result, TransportError,
    traits::{LinkEvent, LinkEvents, Transport},
};

/// ATR of the simulated contact card.
pub const MOCK_ATR: [u8; 4] = [0x3B, 0x8F, 0x80, 0x01];

// Header status bytes: command status in bits 7..6, ICC status in bits 1..0.
const STATUS_POWERED: u8 = 0x00;
const STATUS_UNPOWERED: u8 = 0x01;
const STATUS_ABSENT: u8 = 0x02;
const STATUS_FAILED_ABSENT: u8 = 0x42;

// Bitmap slot codes.
const CODE_ABSENT: u8 = 0;
const CODE_PRESENT: u8 = 1;
const CODE_REMOVED: u8 = 2;
const CODE_INSERTED: u8 = 3;

/// Static description of a mock reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockReaderConfig {
    pub name: String,
    pub slot_count: u8,
    pub gatt: GattProfile,
    /// Expose the secured CCID service instead of the plain one.
    pub secured: bool,
    /// Largest notification payload.
    pub mtu: usize,
    /// Largest accepted write, reported through `max_chunk_size`.
    pub max_write: Option<usize>,
    /// Battery level and power state byte. `None` hides the Battery service.
    pub battery: Option<(u8, u8)>,
    pub firmware_revision: String,
}

impl Default for MockReaderConfig {
    fn default() -> Self {
        Self {
            name: "Mock CCID Reader".to_string(),
            slot_count: 2,
            gatt: GattProfile::default(),
            secured: false,
            mtu: 20,
            max_write: None,
            battery: Some((87, 0x3B)),
            firmware_revision: "1.53-7".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
struct MockCard {
    atr: Vec<u8>,
    powered: bool,
}

#[derive(Debug)]
struct ReaderState {
    config: MockReaderConfig,
    cards: Vec<Option<MockCard>>,
    slot_names: Vec<String>,
    sleeping: bool,
    connected: bool,
    subscriptions: HashSet<AttributeId>,
    refuse_connections: usize,
    fail_writes: bool,
    mute: bool,
    rx: Vec<u8>,
    writes: Vec<usize>,
}

impl ReaderState {
    fn new(config: MockReaderConfig) -> Self {
        let slots = usize::from(config.slot_count);
        Self {
            cards: vec![None; slots],
            slot_names: (0..slots).map(|i| format!("{} slot {}", config.name, i)).collect(),
            config,
            sleeping: false,
            connected: false,
            subscriptions: HashSet::new(),
            refuse_connections: 0,
            fail_writes: false,
            mute: false,
            rx: Vec::new(),
            writes: Vec::new(),
        }
    }

    fn ccid_service(&self) -> Uuid {
        if self.config.secured {
            self.config.gatt.ccid_secured_service
        } else {
            self.config.gatt.ccid_service
        }
    }

    fn status_attribute(&self) -> AttributeId {
        AttributeId::new(self.ccid_service(), self.config.gatt.ccid_status)
    }

    fn rdr_to_pc(&self) -> AttributeId {
        AttributeId::new(self.ccid_service(), self.config.gatt.rdr_to_pc)
    }

    fn check_slot(&self, slot: u8) -> Result<usize> {
        let index = usize::from(slot);
        if index < self.cards.len() {
            Ok(index)
        } else {
            Err(TransportError::other(format!(
                "Slot {} out of range ({} slots)",
                slot, self.config.slot_count
            )))
        }
    }

    fn check_connected(&self) -> Result<()> {
        if self.connected {
            Ok(())
        } else {
            Err(TransportError::disconnected(self.config.name.clone()))
        }
    }

    fn attributes(&self) -> Vec<AttributeId> {
        let information = sig_uuid(GATT_DEVICE_INFORMATION_SERVICE);
        let mut attributes: Vec<AttributeId> = [
            GATT_MANUFACTURER_NAME,
            GATT_MODEL_NUMBER,
            GATT_SERIAL_NUMBER,
            GATT_FIRMWARE_REVISION,
            GATT_HARDWARE_REVISION,
            GATT_SOFTWARE_REVISION,
            GATT_PNP_ID,
        ]
        .into_iter()
        .map(|short| AttributeId::new(information, sig_uuid(short)))
        .collect();

        if self.config.battery.is_some() {
            let battery = sig_uuid(GATT_BATTERY_SERVICE);
            attributes.push(AttributeId::new(battery, sig_uuid(GATT_BATTERY_LEVEL)));
            attributes.push(AttributeId::new(battery, sig_uuid(GATT_BATTERY_POWER_STATE)));
        }

        let service = self.ccid_service();
        let gatt = self.config.gatt;
        for characteristic in [gatt.ccid_status, gatt.pc_to_rdr, gatt.rdr_to_pc] {
            attributes.push(AttributeId::new(service, characteristic));
        }
        attributes
    }

    fn read(&self, attribute: AttributeId) -> Result<Bytes> {
        let c = attribute.characteristic;
        let value: Vec<u8> = if attribute == self.status_attribute() {
            self.bitmap(None)
        } else if c == sig_uuid(GATT_MANUFACTURER_NAME) {
            b"Blescard Labs".to_vec()
        } else if c == sig_uuid(GATT_MODEL_NUMBER) {
            self.config.name.as_bytes().to_vec()
        } else if c == sig_uuid(GATT_SERIAL_NUMBER) {
            b"00042".to_vec()
        } else if c == sig_uuid(GATT_FIRMWARE_REVISION) {
            self.config.firmware_revision.as_bytes().to_vec()
        } else if c == sig_uuid(GATT_HARDWARE_REVISION) {
            b"B".to_vec()
        } else if c == sig_uuid(GATT_SOFTWARE_REVISION) {
            b"2.0".to_vec()
        } else if c == sig_uuid(GATT_PNP_ID) {
            vec![0x01, 0x6C, 0x04, 0x01, 0x00, 0x10, 0x00]
        } else if let Some((level, power_state)) = self.config.battery
            && (c == sig_uuid(GATT_BATTERY_LEVEL) || c == sig_uuid(GATT_BATTERY_POWER_STATE))
        {
            vec![if c == sig_uuid(GATT_BATTERY_LEVEL) { level } else { power_state }]
        } else {
            return Err(TransportError::operation_failed(
                "Read",
                format!("unknown attribute {attribute}"),
            ));
        };
        Ok(Bytes::from(value))
    }

    /// Status bitmap, with `edge` reported for one slot.
    fn bitmap(&self, edge: Option<(usize, u8)>) -> Vec<u8> {
        let flag = if self.sleeping { LOW_POWER_FLAG } else { 0x00 };
        let mut bytes = vec![self.config.slot_count | flag];
        let codes: Vec<u8> = self
            .cards
            .iter()
            .enumerate()
            .map(|(i, card)| match edge {
                Some((slot, code)) if slot == i => code,
                _ if card.is_some() => CODE_PRESENT,
                _ => CODE_ABSENT,
            })
            .collect();
        for group in codes.chunks(SLOTS_PER_BITMAP_BYTE) {
            let byte = group
                .iter()
                .enumerate()
                .fold(0u8, |acc, (i, code)| acc | (*code << (i * 2)));
            bytes.push(byte);
        }
        bytes
    }

    /// Accept one written chunk. Returns the response once a full command
    /// has arrived.
    fn on_write(&mut self, chunk: &[u8]) -> Option<Vec<u8>> {
        self.writes.push(chunk.len());
        self.rx.extend_from_slice(chunk);
        if self.rx.len() < HEADER_SIZE {
            return None;
        }
        let length = u32::from_le_bytes([self.rx[1], self.rx[2], self.rx[3], self.rx[4]]) as usize;
        if self.rx.len() < HEADER_SIZE + length {
            return None;
        }
        let command: Vec<u8> = self.rx.drain(..HEADER_SIZE + length).collect();
        Some(self.respond_to(&command))
    }

    fn respond_to(&mut self, command: &[u8]) -> Vec<u8> {
        let (code, slot, sequence) = (command[0], command[SLOT_OFFSET], command[SEQUENCE_OFFSET]);
        let payload = &command[HEADER_SIZE..];
        trace!("Mock reader got command {:02X} for slot {}", code, slot);

        let frame = |code, status, error, payload: &[u8]| {
            response_frame(code, slot, sequence, status, error, payload)
        };
        let mute = |code| frame(code, STATUS_FAILED_ABSENT, SLOT_ERROR_ICC_MUTE, &[]);
        let card = self.cards.get_mut(usize::from(slot)).and_then(Option::as_mut);

        match code {
            PC_TO_RDR_ESCAPE => {
                if payload.len() == 3 && payload[..2] == SLOT_NAME_ESCAPE_PREFIX {
                    let mut name = vec![0x00];
                    if let Some(n) = self.slot_names.get(usize::from(payload[2])) {
                        name.extend_from_slice(n.as_bytes());
                    }
                    frame(RDR_TO_PC_ESCAPE, STATUS_POWERED, 0x00, &name)
                } else {
                    frame(RDR_TO_PC_ESCAPE, STATUS_POWERED, 0x00, payload)
                }
            }
            PC_TO_RDR_ICC_POWER_ON => match card {
                Some(card) => {
                    card.powered = true;
                    frame(RDR_TO_PC_DATA_BLOCK, STATUS_POWERED, 0x00, &card.atr)
                }
                None => mute(RDR_TO_PC_DATA_BLOCK),
            },
            PC_TO_RDR_ICC_POWER_OFF => match card {
                Some(card) => {
                    card.powered = false;
                    frame(RDR_TO_PC_SLOT_STATUS, STATUS_UNPOWERED, 0x00, &[])
                }
                None => frame(RDR_TO_PC_SLOT_STATUS, STATUS_ABSENT, 0x00, &[]),
            },
            PC_TO_RDR_GET_SLOT_STATUS => {
                let status = match card {
                    Some(card) if card.powered => STATUS_POWERED,
                    Some(_) => STATUS_UNPOWERED,
                    None => STATUS_ABSENT,
                };
                frame(RDR_TO_PC_SLOT_STATUS, status, 0x00, &[])
            }
            PC_TO_RDR_XFR_BLOCK => match card {
                Some(card) if card.powered => {
                    let mut answer = payload.to_vec();
                    answer.extend_from_slice(&[0x90, 0x00]);
                    frame(RDR_TO_PC_DATA_BLOCK, STATUS_POWERED, 0x00, &answer)
                }
                Some(_) => frame(RDR_TO_PC_SLOT_STATUS, STATUS_UNPOWERED, 0x00, &[]),
                None => mute(RDR_TO_PC_DATA_BLOCK),
            },
            other => {
                debug!("Mock reader does not support command {:02X}", other);
                frame(
                    RDR_TO_PC_SLOT_STATUS,
                    STATUS_FAILED_ABSENT,
                    SLOT_ERROR_CMD_NOT_SUPPORTED,
                    &[],
                )
            }
        }
    }
}

/// Build a raw RDR_to_PC frame.
fn response_frame(code: u8, slot: u8, sequence: u8, status: u8, error: u8, payload: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(HEADER_SIZE + payload.len());
    bytes.push(code);
    bytes.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    bytes.extend_from_slice(&[slot, sequence, status, error, 0x00]);
    bytes.extend_from_slice(payload);
    bytes
}

/// Shared reader state plus the notification sender.
#[derive(Debug, Clone)]
struct Shared {
    state: Arc<Mutex<ReaderState>>,
    link_tx: mpsc::UnboundedSender<LinkEvent>,
}

impl Shared {
    /// Notify `value` on `attribute` in MTU-sized fragments, if subscribed.
    fn notify(&self, state: &ReaderState, attribute: AttributeId, value: &[u8]) {
        if !state.connected || !state.subscriptions.contains(&attribute) {
            trace!("Mock reader drops notification on {}", attribute);
            return;
        }
        for fragment in value.chunks(state.config.mtu.max(1)) {
            let event = LinkEvent::Notification {
                attribute,
                value: Bytes::copy_from_slice(fragment),
            };
            if self.link_tx.send(event).is_err() {
                debug!("Mock reader link channel closed");
                return;
            }
        }
    }

    async fn notify_status(&self, edge: Option<(usize, u8)>) {
        let state = self.state.lock().await;
        let bitmap = state.bitmap(edge);
        self.notify(&state, state.status_attribute(), &bitmap);
    }
}

/// Mock CCID reader for testing and development.
///
/// # Examples
///
/// ```
/// use blescard_transport::Transport;
/// use blescard_transport::mock::MockReader;
///
/// #[tokio::main]
/// async fn main() -> blescard_transport::Result<()> {
///     let (mut reader, handle) = MockReader::new();
///     handle.insert_card(0).await?;
///
///     reader.connect().await?;
///     let attributes = reader.discover_attributes().await?;
///     assert!(!attributes.is_empty());
///
///     Ok(())
/// }
/// ```
#[derive(Debug)]
pub struct MockReader {
    shared: Shared,
    link_rx: Option<LinkEvents>,
    name: String,
    max_write: Option<usize>,
}

impl MockReader {
    /// Create a two-slot reader with no cards.
    ///
    /// Returns a tuple of (MockReader, MockReaderHandle) where the handle
    /// controls the simulated hardware.
    pub fn new() -> (Self, MockReaderHandle) {
        Self::with_config(MockReaderConfig::default())
    }

    /// Create a reader with `slot_count` empty slots.
    pub fn with_slots(slot_count: u8) -> (Self, MockReaderHandle) {
        Self::with_config(MockReaderConfig {
            slot_count,
            ..MockReaderConfig::default()
        })
    }

    pub fn with_config(config: MockReaderConfig) -> (Self, MockReaderHandle) {
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let name = config.name.clone();
        let max_write = config.max_write;
        let shared = Shared {
            state: Arc::new(Mutex::new(ReaderState::new(config))),
            link_tx,
        };

        let reader = Self {
            shared: shared.clone(),
            link_rx: Some(link_rx),
            name: name.clone(),
            max_write,
        };
        let handle = MockReaderHandle { shared, name };

        (reader, handle)
    }
}

impl Default for MockReader {
    fn default() -> Self {
        Self::new().0
    }
}

impl Transport for MockReader {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&mut self) -> Result<()> {
        let mut state = self.shared.state.lock().await;
        if state.refuse_connections > 0 {
            state.refuse_connections -= 1;
            return Err(TransportError::operation_failed("Connect", "peer not responding"));
        }
        debug!("Mock reader {} connected", self.name);
        state.connected = true;
        Ok(())
    }

    async fn discover_attributes(&mut self) -> Result<Vec<AttributeId>> {
        let state = self.shared.state.lock().await;
        state.check_connected()?;
        Ok(state.attributes())
    }

    async fn read_attribute(&mut self, attribute: AttributeId) -> Result<Bytes> {
        let state = self.shared.state.lock().await;
        state.check_connected()?;
        state.read(attribute)
    }

    async fn write_attribute(&mut self, attribute: AttributeId, value: Bytes) -> Result<()> {
        let mut state = self.shared.state.lock().await;
        state.check_connected()?;
        if state.fail_writes {
            return Err(TransportError::operation_failed("Write", "GATT write error"));
        }
        if attribute != AttributeId::new(state.ccid_service(), state.config.gatt.pc_to_rdr) {
            return Err(TransportError::operation_failed(
                "Write",
                format!("{attribute} is not writable"),
            ));
        }

        if let Some(response) = state.on_write(&value) {
            if state.mute {
                debug!("Mock reader swallows response");
            } else {
                let rdr_to_pc = state.rdr_to_pc();
                self.shared.notify(&state, rdr_to_pc, &response);
            }
        }
        Ok(())
    }

    async fn enable_notifications(&mut self, attribute: AttributeId) -> Result<()> {
        let mut state = self.shared.state.lock().await;
        state.check_connected()?;
        if attribute != state.status_attribute() && attribute != state.rdr_to_pc() {
            return Err(TransportError::operation_failed(
                "Subscribe",
                format!("{attribute} does not notify"),
            ));
        }
        state.subscriptions.insert(attribute);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        let mut state = self.shared.state.lock().await;
        state.connected = false;
        state.subscriptions.clear();
        state.rx.clear();
        debug!("Mock reader {} disconnected", self.name);
        Ok(())
    }

    fn take_link_events(&mut self) -> Option<LinkEvents> {
        self.link_rx.take()
    }

    fn max_chunk_size(&self) -> Option<usize> {
        self.max_write
    }
}

/// Handle for controlling a mock reader.
///
/// Clones share the same simulated hardware.
#[derive(Debug, Clone)]
pub struct MockReaderHandle {
    shared: Shared,
    name: String,
}

impl MockReaderHandle {
    /// Insert a card with the default ATR.
    ///
    /// Notifies the status bitmap with an insertion edge when connected.
    ///
    /// # Errors
    ///
    /// Returns an error if the slot does not exist.
    pub async fn insert_card(&self, slot: u8) -> Result<()> {
        self.insert_card_with_atr(slot, MOCK_ATR.to_vec()).await
    }

    pub async fn insert_card_with_atr(&self, slot: u8, atr: Vec<u8>) -> Result<()> {
        let index = {
            let mut state = self.shared.state.lock().await;
            let index = state.check_slot(slot)?;
            state.cards[index] = Some(MockCard { atr, powered: false });
            index
        };
        debug!("Card inserted in slot {}", slot);
        self.shared.notify_status(Some((index, CODE_INSERTED))).await;
        Ok(())
    }

    /// Remove the card from `slot`. Notifies a removal edge when connected.
    pub async fn remove_card(&self, slot: u8) -> Result<()> {
        let index = {
            let mut state = self.shared.state.lock().await;
            let index = state.check_slot(slot)?;
            state.cards[index] = None;
            index
        };
        debug!("Card removed from slot {}", slot);
        self.shared.notify_status(Some((index, CODE_REMOVED))).await;
        Ok(())
    }

    /// Enter low-power mode. Every card loses power.
    pub async fn sleep(&self) {
        {
            let mut state = self.shared.state.lock().await;
            state.sleeping = true;
            for card in state.cards.iter_mut().flatten() {
                card.powered = false;
            }
        }
        self.shared.notify_status(None).await;
    }

    pub async fn wake(&self) {
        self.shared.state.lock().await.sleeping = false;
        self.shared.notify_status(None).await;
    }

    /// Drop the link as if the reader went out of range.
    pub async fn drop_link(&self) {
        {
            let mut state = self.shared.state.lock().await;
            state.connected = false;
            state.subscriptions.clear();
            state.rx.clear();
        }
        if self.shared.link_tx.send(LinkEvent::Disconnected).is_err() {
            debug!("Mock reader link channel closed");
        }
    }

    /// Fail the next `attempts` connection attempts.
    pub async fn refuse_connections(&self, attempts: usize) {
        self.shared.state.lock().await.refuse_connections = attempts;
    }

    /// Make every write fail until cleared.
    pub async fn set_fail_writes(&self, fail: bool) {
        self.shared.state.lock().await.fail_writes = fail;
    }

    /// Stop answering CCID commands until cleared.
    pub async fn set_mute(&self, mute: bool) {
        self.shared.state.lock().await.mute = mute;
    }

    pub async fn set_slot_name(&self, slot: u8, name: impl Into<String>) -> Result<()> {
        let mut state = self.shared.state.lock().await;
        let index = state.check_slot(slot)?;
        state.slot_names[index] = name.into();
        Ok(())
    }

    /// Sizes of every chunk written so far.
    pub async fn writes(&self) -> Vec<usize> {
        self.shared.state.lock().await.writes.clone()
    }

    pub async fn is_powered(&self, slot: u8) -> bool {
        let state = self.shared.state.lock().await;
        state
            .cards
            .get(usize::from(slot))
            .and_then(Option::as_ref)
            .is_some_and(|card| card.powered)
    }

    pub async fn is_connected(&self) -> bool {
        self.shared.state.lock().await.connected
    }

    /// Get the device name.
    pub fn name(&self) -> &str {
        &self.name
    }
}
