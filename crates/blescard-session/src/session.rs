//! The device session: one reader, one transport link.
//!
//! [`Session::handle`] is the whole state machine. It takes one [`Event`],
//! updates the session and returns the transport actions to execute and the
//! callbacks to deliver. It never blocks and never performs I/O, so it can be
//! driven by an async task, a test harness or a benchmark alike.
//!
//! # Lifecycle
//!
//! ```text
//!  Connect ──► Connecting ──(link up)──► Connected ──Create──► DiscoveringAttributes
//!                                                                      │
//!       ┌──────────────────────────────────────────────────────────────┘
//!       ▼
//!  ReadingInformation ──► SubscribingNotifications ──► ReadingSlotNames
//!   (info, status bitmap)   (status, rdr_to_pc)         (escape 58 21 n)
//!                                                              │
//!                       ┌──────────────────────────────────────┤
//!                       ▼                                      ▼
//!               ConnectingToCard ──────── session ready ────► Idle
//!               (power on each present,                        │
//!                unpowered card)                               ├─► WritingCommand ─► AwaitingResponse ─► Idle
//!                                                              └─► ReadingPowerInfo ─────────────────► Idle
//! ```
//!
//! # Exchanges
//!
//! At most one CCID command is in flight. Its frame is written in chunks of
//! at most `max_chunk_size` bytes, each chunk issued after the previous write
//! was confirmed. Response fragments arriving on the reader-to-host
//! characteristic are reassembled and correlated with the command by
//! sequence number and slot.
//!
//! # Example
//!
//! ```
//! use blescard_session::{Action, Event, Request, Session, SessionConfig, SessionState};
//!
//! let mut session = Session::new(SessionConfig::default());
//! let output = session.handle(Event::Request(Request::Connect));
//!
//! assert_eq!(session.state(), SessionState::Connecting);
//! assert_eq!(output.actions, vec![Action::Connect]);
//! ```

use std::collections::{HashMap, VecDeque};

use bytes::Bytes;
use tracing::{debug, error, info, trace, warn};

use blescard_core::{
    DeviceSessionConstants, Error, ErrorCode, FirmwareVersion, PowerState, SCardError, Slot,
    constants::{
        GATT_BATTERY_LEVEL, GATT_BATTERY_POWER_STATE, GATT_FIRMWARE_REVISION,
        GATT_HARDWARE_REVISION, GATT_MANUFACTURER_NAME, GATT_MODEL_NUMBER, GATT_PNP_ID,
        GATT_SERIAL_NUMBER, GATT_SOFTWARE_REVISION, sig_uuid,
    },
};
use blescard_protocol::{
    ChunkedWriter, CcidCommand, CcidHeader, CcidResponse, CommandCode, DeviceStatus, Feed,
    Reassembler, ResponseCode, SlotCode, WriteStep, declared_slot_count,
    parse_device_status_bitmap,
};

use crate::action::{Action, Callback, Output};
use crate::config::SessionConfig;
use crate::dispatch::{ErrorRoute, route};
use crate::event::{AttributeId, CardCommand, Event, Request, TransportEvent};
use crate::state::{SessionState, StateMachine, StateTransition};

/// Device information attributes, in read order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InfoField {
    Manufacturer,
    Model,
    Serial,
    FirmwareRevision,
    HardwareRevision,
    SoftwareRevision,
    PnpId,
}

impl InfoField {
    const ALL: [InfoField; 7] = [
        InfoField::Manufacturer,
        InfoField::Model,
        InfoField::Serial,
        InfoField::FirmwareRevision,
        InfoField::HardwareRevision,
        InfoField::SoftwareRevision,
        InfoField::PnpId,
    ];

    fn characteristic(&self) -> u16 {
        match self {
            InfoField::Manufacturer => GATT_MANUFACTURER_NAME,
            InfoField::Model => GATT_MODEL_NUMBER,
            InfoField::Serial => GATT_SERIAL_NUMBER,
            InfoField::FirmwareRevision => GATT_FIRMWARE_REVISION,
            InfoField::HardwareRevision => GATT_HARDWARE_REVISION,
            InfoField::SoftwareRevision => GATT_SOFTWARE_REVISION,
            InfoField::PnpId => GATT_PNP_ID,
        }
    }
}

/// The three characteristics of the CCID service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CcidAttributes {
    status: AttributeId,
    pc_to_rdr: AttributeId,
    rdr_to_pc: AttributeId,
}

/// Who started the exchange in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Purpose {
    SlotName,
    AutoConnect,
    User,
}

#[derive(Debug)]
struct Exchange {
    command: CcidCommand,
    purpose: Purpose,
    writer: ChunkedWriter,
    timer_armed: bool,
}

/// Battery values collected while in `ReadingPowerInfo`.
#[derive(Debug, Default)]
struct PowerReading {
    state: PowerState,
    level: u8,
}

/// State of one reader session.
#[derive(Debug)]
pub struct Session {
    machine: StateMachine,
    config: SessionConfig,
    constants: DeviceSessionConstants,
    slots: Vec<Slot>,

    ccid: Option<CcidAttributes>,
    info: HashMap<AttributeId, InfoField>,
    battery_level: Option<AttributeId>,
    battery_power_state: Option<AttributeId>,

    read_queue: VecDeque<AttributeId>,
    notify_queue: VecDeque<AttributeId>,
    power_queue: VecDeque<AttributeId>,
    power: PowerReading,

    slot_name_cursor: u8,
    auto_connect: VecDeque<u8>,

    exchange: Option<Exchange>,
    reassembler: Reassembler,
    next_sequence: u8,

    sleeping: bool,
    ready: bool,
}

impl Session {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            machine: StateMachine::new(config.history_size),
            reassembler: Reassembler::with_max_frame_size(0, config.max_frame_size),
            config,
            constants: DeviceSessionConstants::default(),
            slots: Vec::new(),
            ccid: None,
            info: HashMap::new(),
            battery_level: None,
            battery_power_state: None,
            read_queue: VecDeque::new(),
            notify_queue: VecDeque::new(),
            power_queue: VecDeque::new(),
            power: PowerReading::default(),
            slot_name_cursor: 0,
            auto_connect: VecDeque::new(),
            exchange: None,
            next_sequence: 0,
            sleeping: false,
            ready: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.machine.current_state()
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    pub fn slot(&self, index: u8) -> Option<&Slot> {
        self.slots.get(usize::from(index))
    }

    pub fn constants(&self) -> &DeviceSessionConstants {
        &self.constants
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn is_sleeping(&self) -> bool {
        self.sleeping
    }

    /// Session-ready was emitted and the link is still up.
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// A card command would be accepted right now.
    pub fn accepts_command(&self) -> bool {
        self.state() == SessionState::Idle
    }

    pub fn history(&self) -> impl Iterator<Item = &StateTransition> {
        self.machine.history().iter()
    }

    /// Adopt the transport's write limit. Applies from the next command.
    pub fn set_max_chunk_size(&mut self, max_chunk_size: usize) {
        self.config.max_chunk_size = max_chunk_size.max(1);
    }

    /// Advance the session by one event.
    pub fn handle(&mut self, event: Event) -> Output {
        let mut out = Output::default();
        trace!("Handling {} in {}", event.name(), self.state());

        match event {
            Event::Request(request) => self.on_request(request, &mut out),
            Event::Transport(event) => self.on_transport(event, &mut out),
            Event::ResponseTimeout { sequence } => self.on_response_timeout(sequence, &mut out),
        }

        out
    }

    // ---------------------------------------------------------------------
    // Requests
    // ---------------------------------------------------------------------

    fn on_request(&mut self, request: Request, out: &mut Output) {
        let state = self.state();
        match (state, request) {
            (SessionState::Disconnected, Request::Connect) => {
                info!("Connecting to reader");
                self.enter(SessionState::Connecting);
                out.act(Action::Connect);
            }
            (SessionState::Connected, Request::Create) => {
                self.enter(SessionState::DiscoveringAttributes);
                out.act(Action::DiscoverAttributes);
            }
            (SessionState::Idle, Request::Command(command)) => self.start_command(command, out),
            (_, Request::Command(command)) => {
                warn!("Rejecting command in {}: another command is in flight", state);
                let detail = format!("Command rejected while {state}");
                let error = SCardError::recoverable(ErrorCode::DialogError, detail);
                self.raise(error, command.slot(), out);
            }
            (SessionState::Idle, Request::ReadPowerInfo) => self.start_power_info(out),
            (SessionState::Disconnected | SessionState::Disconnecting, Request::Disconnect) => {
                debug!("Disconnect requested while {}", state);
            }
            (_, Request::Disconnect) => {
                info!("Disconnect requested");
                self.begin_disconnect(out);
            }
            (state, request) => {
                warn!("Ignoring {:?} request in {}", request, state);
            }
        }
    }

    fn start_command(&mut self, command: CardCommand, out: &mut Output) {
        if let Some(slot) = command.slot()
            && usize::from(slot) >= self.slots.len()
        {
            let error = Error::SlotOutOfRange {
                slot,
                slot_count: self.slot_count(),
            };
            self.raise(
                SCardError::recoverable(ErrorCode::ProtocolError, error.to_string()),
                None,
                out,
            );
            return;
        }

        let command = match command {
            CardCommand::Transmit { slot, apdu } => CcidCommand::xfr_block(slot, apdu),
            CardCommand::Control { data } => CcidCommand::escape(data),
            CardCommand::PowerOn { slot } => CcidCommand::power_on(slot),
            CardCommand::PowerOff { slot } => CcidCommand::power_off(slot),
            CardCommand::GetSlotStatus { slot } => CcidCommand::get_slot_status(slot),
        };

        self.enter(SessionState::WritingCommand);
        if let Err(e) = self.start_exchange(command, Purpose::User, out) {
            self.enter(SessionState::Idle);
            self.raise(e, None, out);
        }
    }

    fn start_power_info(&mut self, out: &mut Output) {
        self.power_queue = [self.battery_level, self.battery_power_state]
            .into_iter()
            .flatten()
            .collect();
        self.power = PowerReading::default();

        match self.power_queue.front() {
            Some(&attribute) => {
                self.enter(SessionState::ReadingPowerInfo);
                out.act(Action::ReadAttribute(attribute));
            }
            None => {
                debug!("Reader exposes no battery attributes");
                out.notify(Callback::PowerInfo {
                    state: PowerState::Unknown,
                    battery_level: 0,
                });
            }
        }
    }

    // ---------------------------------------------------------------------
    // Transport events
    // ---------------------------------------------------------------------

    fn on_transport(&mut self, event: TransportEvent, out: &mut Output) {
        let state = self.state();

        if matches!(state, SessionState::Disconnected | SessionState::Disconnecting)
            && event != TransportEvent::Disconnected
        {
            debug!("Ignoring {:?} while {}", event, state);
            return;
        }

        match event {
            TransportEvent::Connected => {
                if state == SessionState::Connecting {
                    info!("Transport connected");
                    self.enter(SessionState::Connected);
                    out.notify(Callback::SessionConnected);
                } else {
                    warn!("Ignoring transport-connected in {}", state);
                }
            }
            TransportEvent::Disconnected => match state {
                SessionState::Connecting => {
                    warn!("Connection attempt failed, retrying");
                    self.enter(SessionState::Connecting);
                    out.act(Action::Connect);
                }
                SessionState::Disconnected => debug!("Transport already disconnected"),
                _ => self.close(out),
            },
            TransportEvent::AttributesDiscovered(result) => {
                if state == SessionState::DiscoveringAttributes {
                    self.on_attributes_discovered(result, out);
                } else {
                    warn!("Ignoring attribute discovery result in {}", state);
                }
            }
            TransportEvent::AttributeRead { attribute, result } => match state {
                SessionState::ReadingInformation => {
                    self.on_information_read(attribute, result, out)
                }
                SessionState::ReadingPowerInfo => self.on_power_info_read(attribute, result, out),
                _ => warn!("Ignoring read of {} in {}", attribute, state),
            },
            TransportEvent::NotificationsEnabled { attribute, result } => {
                if state == SessionState::SubscribingNotifications {
                    self.on_notifications_enabled(attribute, result, out);
                } else {
                    warn!("Ignoring notification enable of {} in {}", attribute, state);
                }
            }
            TransportEvent::AttributeWritten { attribute, result } => {
                self.on_attribute_written(attribute, result, out)
            }
            TransportEvent::Notification { attribute, value } => {
                self.on_notification(attribute, value, out)
            }
        }
    }

    fn on_attributes_discovered(
        &mut self,
        result: Result<Vec<AttributeId>, String>,
        out: &mut Output,
    ) {
        let attributes = match result {
            Ok(attributes) => attributes,
            Err(e) => {
                let detail = format!("Attribute discovery failed: {e}");
                self.fail(SCardError::fatal(ErrorCode::ProtocolError, detail), out);
                return;
            }
        };
        debug!("Discovered {} attributes", attributes.len());

        let gatt = self.config.gatt;
        let has_service = |uuid| attributes.iter().any(|a| a.service == uuid);
        let (service, secured) = if has_service(gatt.ccid_secured_service) {
            (gatt.ccid_secured_service, true)
        } else if has_service(gatt.ccid_service) {
            (gatt.ccid_service, false)
        } else {
            let error = SCardError::fatal(ErrorCode::DummyDevice, "CCID service not found");
            self.fail(error, out);
            return;
        };

        let find = |characteristic| {
            attributes
                .iter()
                .copied()
                .find(|a| a.service == service && a.characteristic == characteristic)
        };
        let (Some(status), Some(pc_to_rdr), Some(rdr_to_pc)) = (
            find(gatt.ccid_status),
            find(gatt.pc_to_rdr),
            find(gatt.rdr_to_pc),
        ) else {
            let error = SCardError::fatal(
                ErrorCode::DummyDevice,
                format!("CCID service {service} lacks a required characteristic"),
            );
            self.fail(error, out);
            return;
        };

        let find_any = |short| {
            let characteristic = sig_uuid(short);
            attributes
                .iter()
                .copied()
                .find(|a| a.characteristic == characteristic)
        };

        self.info.clear();
        self.read_queue.clear();
        for field in InfoField::ALL {
            if let Some(attribute) = find_any(field.characteristic()) {
                self.info.insert(attribute, field);
                self.read_queue.push_back(attribute);
            }
        }
        self.read_queue.push_back(status);

        self.battery_level = find_any(GATT_BATTERY_LEVEL);
        self.battery_power_state = find_any(GATT_BATTERY_POWER_STATE);

        self.notify_queue = VecDeque::from([status, rdr_to_pc]);
        self.ccid = Some(CcidAttributes {
            status,
            pc_to_rdr,
            rdr_to_pc,
        });
        self.constants.secured_service = secured;
        info!(
            "Using {} CCID service {}",
            if secured { "secured" } else { "plain" },
            service
        );

        self.enter(SessionState::ReadingInformation);
        if let Some(&first) = self.read_queue.front() {
            out.act(Action::ReadAttribute(first));
        }
    }

    fn on_information_read(
        &mut self,
        attribute: AttributeId,
        result: Result<Bytes, String>,
        out: &mut Output,
    ) {
        if self.read_queue.front() != Some(&attribute) {
            warn!("Ignoring unexpected read of {}", attribute);
            return;
        }

        let value = match result {
            Ok(value) => value,
            Err(e) => {
                let detail = format!("Reading {attribute} failed: {e}");
                self.fail(SCardError::fatal(ErrorCode::ReadAttributeFailed, detail), out);
                return;
            }
        };
        self.read_queue.pop_front();

        if self.ccid.is_some_and(|ccid| ccid.status == attribute) {
            if let Err(e) = self.on_initial_status(&value, out) {
                self.fail(e, out);
                return;
            }
        } else if let Some(&field) = self.info.get(&attribute) {
            self.store_info(field, &value);
        }

        if let Some(&next) = self.read_queue.front() {
            out.act(Action::ReadAttribute(next));
        } else if let Some(&first) = self.notify_queue.front() {
            self.enter(SessionState::SubscribingNotifications);
            out.act(Action::EnableNotifications(first));
        }
    }

    fn store_info(&mut self, field: InfoField, value: &[u8]) {
        let text = || attribute_text(value);
        let constants = &mut self.constants;
        match field {
            InfoField::Manufacturer => constants.vendor_name = text(),
            InfoField::Model => constants.product_name = text(),
            InfoField::Serial => constants.serial_number = text(),
            InfoField::FirmwareRevision => {
                constants.firmware_revision = text();
                constants.firmware_version =
                    match constants.firmware_revision.parse::<FirmwareVersion>() {
                        Ok(version) => Some(version),
                        Err(e) => {
                            warn!("{}", e);
                            None
                        }
                    };
            }
            InfoField::HardwareRevision => constants.hardware_revision = text(),
            InfoField::SoftwareRevision => constants.software_revision = text(),
            InfoField::PnpId => constants.pnp_id = hex::encode_upper(value),
        }
        debug!("Read {:?}", field);
    }

    fn on_initial_status(&mut self, value: &[u8], out: &mut Output) -> Result<(), SCardError> {
        let count = declared_slot_count(value).map_err(|e| e.to_scard_error())?;
        if count == 0 {
            return Err(SCardError::fatal(
                ErrorCode::DummyDevice,
                "Reader declares no slots",
            ));
        }

        info!("Reader has {} slots", count);
        self.slots = (0..count).map(Slot::new).collect();
        self.reassembler.set_slot_count(count);
        self.apply_status_bitmap(value, true, out)
    }

    fn on_notifications_enabled(
        &mut self,
        attribute: AttributeId,
        result: Result<(), String>,
        out: &mut Output,
    ) {
        if self.notify_queue.front() != Some(&attribute) {
            warn!("Ignoring unexpected notification enable of {}", attribute);
            return;
        }

        if let Err(e) = result {
            let detail = format!("Enabling notifications on {attribute} failed: {e}");
            self.fail(
                SCardError::fatal(ErrorCode::EnableNotificationFailed, detail),
                out,
            );
            return;
        }
        self.notify_queue.pop_front();

        if let Some(&next) = self.notify_queue.front() {
            out.act(Action::EnableNotifications(next));
            return;
        }

        self.enter(SessionState::ReadingSlotNames);
        self.slot_name_cursor = 0;
        self.constants.slot_names.clear();
        if let Err(e) = self.start_exchange(CcidCommand::slot_name(0), Purpose::SlotName, out) {
            self.fail(e, out);
        }
    }

    fn on_attribute_written(
        &mut self,
        attribute: AttributeId,
        result: Result<(), String>,
        out: &mut Output,
    ) {
        let Some(exchange) = self.exchange.as_mut() else {
            debug!("Ignoring write confirmation for {} with no command in flight", attribute);
            return;
        };

        if let Err(e) = result {
            if self.state() == SessionState::WritingCommand {
                self.enter(SessionState::Idle);
            }
            let detail = format!("Writing {attribute} failed: {e}");
            self.fail(SCardError::fatal(ErrorCode::WriteAttributeFailed, detail), out);
            return;
        }

        match exchange.writer.on_write_confirmed() {
            WriteStep::Write(chunk) => out.act(Action::WriteAttribute {
                attribute,
                value: chunk,
            }),
            WriteStep::Pending => {}
            WriteStep::Done => {
                trace!(
                    "{} written in {} chunks",
                    exchange.command.code,
                    exchange.writer.chunks_written()
                );
                let sequence = exchange.command.sequence;
                let timed = exchange.purpose != Purpose::SlotName;
                if let Some(timeout) = self.config.response_timeout()
                    && timed
                {
                    exchange.timer_armed = true;
                    out.act(Action::ArmResponseTimer { sequence, timeout });
                }
                if self.state() == SessionState::WritingCommand {
                    self.enter(SessionState::AwaitingResponse);
                }
            }
        }
    }

    fn on_notification(&mut self, attribute: AttributeId, value: Bytes, out: &mut Output) {
        let Some(ccid) = self.ccid else {
            debug!("Ignoring notification from {} before discovery", attribute);
            return;
        };

        if attribute == ccid.status {
            if self.slots.is_empty() {
                debug!("Ignoring status notification before the initial read");
                return;
            }
            if let Err(e) = self.apply_status_bitmap(&value, false, out) {
                self.fail(e, out);
                return;
            }
            if self.state() == SessionState::Idle {
                self.process_next_slot_connection(out);
            }
        } else if attribute == ccid.rdr_to_pc {
            self.on_response_fragment(&value, out);
        } else {
            debug!("Ignoring notification from {}", attribute);
        }
    }

    // ---------------------------------------------------------------------
    // Slot status
    // ---------------------------------------------------------------------

    fn apply_status_bitmap(
        &mut self,
        value: &[u8],
        initial: bool,
        out: &mut Output,
    ) -> Result<(), SCardError> {
        let status =
            parse_device_status_bitmap(value, self.slot_count()).map_err(|e| e.to_scard_error())?;

        let codes = match status {
            DeviceStatus::Sleeping => {
                if !self.sleeping {
                    info!("Reader went to sleep");
                    self.sleeping = true;
                    self.slots.iter_mut().for_each(Slot::force_off);
                    self.auto_connect.clear();
                    out.notify(Callback::SleepStateChanged { sleeping: true });
                }
                return Ok(());
            }
            DeviceStatus::Awake(codes) => codes,
        };

        if self.sleeping {
            info!("Reader woke up");
            self.sleeping = false;
            out.notify(Callback::SleepStateChanged { sleeping: false });
        }

        for (slot, code) in self.slots.iter_mut().zip(codes) {
            let index = slot.index();
            let present = code.card_present();
            match code {
                SlotCode::Absent | SlotCode::Present => {
                    if present != slot.card_present() {
                        if present {
                            slot.set_card_status(true, false);
                        } else {
                            slot.remove_card();
                        }
                    }
                    if initial && present {
                        out.notify(Callback::ReaderStatusChanged {
                            slot: index,
                            present,
                            powered: slot.card_powered(),
                        });
                    }
                }
                SlotCode::Inserted => {
                    debug!("Card inserted in slot {}", index);
                    slot.disconnect();
                    slot.set_card_status(true, false);
                    slot.set_card_error(false);
                    if !self.auto_connect.contains(&index) {
                        self.auto_connect.push_back(index);
                    }
                }
                SlotCode::Removed => {
                    debug!("Card removed from slot {}", index);
                    slot.remove_card();
                    self.auto_connect.retain(|&queued| queued != index);
                }
            }
            if code.is_change() {
                out.notify(Callback::ReaderStatusChanged {
                    slot: index,
                    present,
                    powered: false,
                });
            }
        }

        Ok(())
    }

    fn apply_header_status(&mut self, header: &CcidHeader) {
        let Some(slot) = self.slots.get_mut(usize::from(header.slot)) else {
            return;
        };
        if let Some((present, powered)) = header.icc_status().card_status() {
            slot.set_card_status(present, powered);
        }
    }

    // ---------------------------------------------------------------------
    // CCID exchanges
    // ---------------------------------------------------------------------

    fn start_exchange(
        &mut self,
        command: CcidCommand,
        purpose: Purpose,
        out: &mut Output,
    ) -> Result<(), SCardError> {
        let Some(ccid) = self.ccid else {
            return Err(SCardError::fatal(
                ErrorCode::ProtocolError,
                "CCID attributes were not discovered",
            ));
        };

        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);
        let command = command.with_sequence(sequence);
        let frame = command.encode().map_err(|e| e.to_scard_error())?;

        debug!(
            "Sending {} to slot {} (seq {}, {} bytes)",
            command.code,
            command.slot,
            sequence,
            frame.len()
        );

        let mut writer = ChunkedWriter::new(frame, self.config.max_chunk_size);
        if let WriteStep::Write(chunk) = writer.next_chunk() {
            out.act(Action::WriteAttribute {
                attribute: ccid.pc_to_rdr,
                value: chunk,
            });
        }

        self.reassembler.clear();
        self.exchange = Some(Exchange {
            command,
            purpose,
            writer,
            timer_armed: false,
        });
        Ok(())
    }

    /// Take the exchange in flight, disarming its deadline.
    fn finish_exchange(&mut self, out: &mut Output) -> Option<Exchange> {
        let exchange = self.exchange.take()?;
        if exchange.timer_armed {
            out.act(Action::CancelResponseTimer);
        }
        Some(exchange)
    }

    fn on_response_fragment(&mut self, value: &[u8], out: &mut Output) {
        let Some((sequence, slot)) = self
            .exchange
            .as_ref()
            .filter(|_| self.state().exchanges_ccid())
            .map(|exchange| (exchange.command.sequence, exchange.command.slot))
        else {
            warn!(
                "Dropping {} unsolicited response bytes in {}",
                value.len(),
                self.state()
            );
            return;
        };

        let feed = match self.reassembler.feed(value) {
            Ok(Feed::Incomplete) => return,
            Ok(feed) => feed,
            Err(e) => {
                self.fail(e.to_scard_error(), out);
                return;
            }
        };

        let header = match &feed {
            Feed::Complete(response) => response.header,
            Feed::Failed { header, .. } => *header,
            Feed::Incomplete => return,
        };
        if header.sequence != sequence || header.slot != slot {
            let detail = format!(
                "Response (seq {}, slot {}) does not answer command (seq {}, slot {})",
                header.sequence, header.slot, sequence, slot
            );
            self.fail(SCardError::fatal(ErrorCode::DialogError, detail), out);
            return;
        }

        let Some(exchange) = self.finish_exchange(out) else {
            return;
        };
        match feed {
            Feed::Complete(response) => self.on_response(exchange, response, out),
            Feed::Failed { header, error } => {
                self.on_exchange_failed(exchange, header, error, out)
            }
            Feed::Incomplete => {}
        }
    }

    fn on_response(&mut self, exchange: Exchange, response: CcidResponse, out: &mut Output) {
        if response.code() != ResponseCode::Escape {
            self.apply_header_status(&response.header);
        }

        match exchange.purpose {
            Purpose::SlotName => {
                let name = if response.code() == ResponseCode::Escape {
                    slot_name_from(&response.payload)
                } else {
                    warn!(
                        "Unexpected {} to slot name request for slot {}",
                        response.code(),
                        exchange.command.payload.last().copied().unwrap_or_default()
                    );
                    None
                };
                self.store_slot_name(name, out);
            }
            Purpose::AutoConnect => {
                if let Err(e) = self.dispatch_response(&exchange.command, response, out) {
                    self.fail(e, out);
                    return;
                }
                self.drop_from_worklist(exchange.command.slot);
                self.process_next_slot_connection(out);
            }
            Purpose::User => {
                if let Err(e) = self.dispatch_response(&exchange.command, response, out) {
                    self.fail(e, out);
                    return;
                }
                self.enter(SessionState::Idle);
                self.process_next_slot_connection(out);
            }
        }
    }

    fn on_exchange_failed(
        &mut self,
        exchange: Exchange,
        header: CcidHeader,
        error: SCardError,
        out: &mut Output,
    ) {
        self.apply_header_status(&header);
        let slot = exchange.command.slot;

        match exchange.purpose {
            Purpose::SlotName => {
                debug!("Slot name request failed: {}", error);
                self.store_slot_name(None, out);
            }
            Purpose::AutoConnect => {
                self.mark_card_error(slot);
                self.raise(error, Some(slot), out);
                self.drop_from_worklist(slot);
                self.process_next_slot_connection(out);
            }
            Purpose::User => {
                self.mark_card_error(slot);
                let fatal = error.fatal;
                self.raise(error, Some(slot), out);
                if !fatal {
                    self.enter(SessionState::Idle);
                    self.process_next_slot_connection(out);
                }
            }
        }
    }

    /// Deliver the outcome of a card or reader command.
    ///
    /// # Errors
    /// Returns a fatal DIALOG_ERROR when the response opcode does not answer
    /// the command.
    fn dispatch_response(
        &mut self,
        command: &CcidCommand,
        response: CcidResponse,
        out: &mut Output,
    ) -> Result<(), SCardError> {
        let slot_count = self.slot_count();
        let code = response.code();
        let Some(slot) = self.slots.get_mut(usize::from(response.slot())) else {
            return Err(Error::SlotOutOfRange {
                slot: response.slot(),
                slot_count,
            }
            .to_scard_error());
        };

        match (code, command.code) {
            (ResponseCode::Escape, CommandCode::Escape) => {
                out.notify(Callback::ControlResponse(response.payload));
            }
            (ResponseCode::DataBlock, CommandCode::XfrBlock) => {
                out.notify(Callback::TransmitResponse {
                    channel: slot.channel().clone(),
                    response: response.payload,
                });
            }
            (ResponseCode::DataBlock | ResponseCode::SlotStatus, CommandCode::IccPowerOn) => {
                info!(
                    "Card in slot {} powered, ATR {}",
                    slot.index(),
                    hex::encode_upper(&response.payload)
                );
                slot.connect(response.payload.to_vec());
                out.notify(Callback::CardConnected(slot.channel().clone()));
            }
            (ResponseCode::SlotStatus, CommandCode::GetSlotStatus) => {
                debug!(
                    "Slot {} status: present={} powered={}",
                    slot.index(),
                    slot.card_present(),
                    slot.card_powered()
                );
            }
            (ResponseCode::SlotStatus, CommandCode::IccPowerOff) => {
                slot.disconnect();
                out.notify(Callback::CardDisconnected(slot.channel().clone()));
            }
            (ResponseCode::SlotStatus, CommandCode::XfrBlock) => {
                let detail = if !slot.card_present() {
                    "Transmit invoked, but no card present"
                } else if !slot.card_powered() {
                    "Transmit invoked, but card not powered"
                } else {
                    "Transmit answered without data"
                };
                let index = slot.index();
                let error = SCardError::recoverable(ErrorCode::CardCommunicationError, detail);
                self.raise(error, Some(index), out);
            }
            (ResponseCode::Unknown(raw), expected) => {
                return Err(SCardError::fatal(
                    ErrorCode::DialogError,
                    format!("Unknown CCID response ({raw:02X}) for command : {expected}"),
                ));
            }
            (observed, expected) => {
                return Err(SCardError::fatal(
                    ErrorCode::DialogError,
                    format!("Unexpected CCID response ({observed}) for command : {expected}"),
                ));
            }
        }

        Ok(())
    }

    fn on_response_timeout(&mut self, sequence: u8, out: &mut Output) {
        let current = self
            .exchange
            .as_ref()
            .is_some_and(|exchange| exchange.timer_armed && exchange.command.sequence == sequence);
        if !current {
            debug!("Ignoring stale response deadline for sequence {}", sequence);
            return;
        }
        let Some(exchange) = self.exchange.take() else {
            return;
        };

        self.reassembler.clear();
        let slot = exchange.command.slot;
        warn!(
            "No response to {} on slot {} (seq {})",
            exchange.command.code, slot, sequence
        );
        let error = SCardError::new(
            ErrorCode::CardMute,
            format!("No response to {}", exchange.command.code),
        );

        self.mark_card_error(slot);
        self.raise(error, Some(slot), out);
        match exchange.purpose {
            Purpose::AutoConnect => self.drop_from_worklist(slot),
            Purpose::User => {
                self.enter(SessionState::Idle);
            }
            Purpose::SlotName => {}
        }
        self.process_next_slot_connection(out);
    }

    // ---------------------------------------------------------------------
    // Enumeration and auto-connect
    // ---------------------------------------------------------------------

    fn store_slot_name(&mut self, name: Option<String>, out: &mut Output) {
        let index = self.slot_name_cursor;
        let name = name.unwrap_or_else(|| format!("Slot {index}"));
        debug!("Slot {} is named {:?}", index, name);

        if let Some(slot) = self.slots.get_mut(usize::from(index)) {
            slot.set_name(name.clone());
        }
        self.constants.slot_names.push(name);

        let next = index.saturating_add(1);
        if usize::from(next) < self.slots.len() {
            self.slot_name_cursor = next;
            if let Err(e) = self.start_exchange(CcidCommand::slot_name(next), Purpose::SlotName, out)
            {
                self.fail(e, out);
            }
            return;
        }

        self.auto_connect = self
            .slots
            .iter()
            .filter(|slot| slot.card_present() && !slot.card_powered())
            .map(Slot::index)
            .collect();
        self.process_next_slot_connection(out);
    }

    fn drop_from_worklist(&mut self, index: u8) {
        self.auto_connect.retain(|&queued| queued != index);
    }

    /// Power the next queued card, or settle in Idle when none is left.
    fn process_next_slot_connection(&mut self, out: &mut Output) {
        if !self.sleeping {
            while let Some(&index) = self.auto_connect.front() {
                let eligible = self
                    .slot(index)
                    .is_some_and(|slot| slot.card_present() && !slot.card_powered());
                if !eligible {
                    self.auto_connect.pop_front();
                    continue;
                }

                if self.state() != SessionState::ConnectingToCard {
                    self.enter(SessionState::ConnectingToCard);
                }
                info!("Connecting to card in slot {}", index);
                if let Err(e) =
                    self.start_exchange(CcidCommand::power_on(index), Purpose::AutoConnect, out)
                {
                    self.fail(e, out);
                }
                return;
            }
        }

        if !self.ready {
            self.ready = true;
            info!("Session ready");
            out.notify(Callback::SessionReady(self.constants.clone()));
        }
        if self.state() != SessionState::Idle {
            self.enter(SessionState::Idle);
        }
    }

    fn mark_card_error(&mut self, index: u8) {
        if let Some(slot) = self.slots.get_mut(usize::from(index)) {
            slot.set_card_error(true);
        }
    }

    // ---------------------------------------------------------------------
    // Errors and teardown
    // ---------------------------------------------------------------------

    /// Report `error` and tear the session down if it is fatal.
    fn raise(&mut self, error: SCardError, slot: Option<u8>, out: &mut Output) {
        match route(&error, slot) {
            ErrorRoute::Teardown => {
                error!("Fatal session error: {}", error);
                out.notify(Callback::SessionError(error));
                self.begin_disconnect(out);
            }
            ErrorRoute::Slot(slot) => {
                warn!("Slot {} error: {}", slot, error);
                out.notify(Callback::ReaderOrCardError { slot, error });
            }
            ErrorRoute::Session => {
                warn!("Session error: {}", error);
                out.notify(Callback::SessionError(error));
            }
        }
    }

    fn fail(&mut self, error: SCardError, out: &mut Output) {
        self.raise(error, None, out);
    }

    fn begin_disconnect(&mut self, out: &mut Output) {
        self.finish_exchange(out);
        self.reassembler.clear();
        self.auto_connect.clear();
        self.read_queue.clear();
        self.notify_queue.clear();
        self.power_queue.clear();

        if self.state().is_connected() {
            self.enter(SessionState::Disconnecting);
            out.act(Action::Disconnect);
        }
    }

    /// The link is gone: forget everything learned about the reader.
    fn close(&mut self, out: &mut Output) {
        info!("Transport disconnected, closing session");
        self.finish_exchange(out);
        self.reassembler.clear();
        self.reassembler.set_slot_count(0);
        self.slots.clear();
        self.ccid = None;
        self.info.clear();
        self.battery_level = None;
        self.battery_power_state = None;
        self.read_queue.clear();
        self.notify_queue.clear();
        self.power_queue.clear();
        self.auto_connect.clear();
        self.constants = DeviceSessionConstants::default();
        self.slot_name_cursor = 0;
        self.sleeping = false;
        self.ready = false;

        self.enter(SessionState::Disconnected);
        out.notify(Callback::SessionClosed);
    }

    // ---------------------------------------------------------------------
    // Helpers
    // ---------------------------------------------------------------------

    fn on_power_info_read(
        &mut self,
        attribute: AttributeId,
        result: Result<Bytes, String>,
        out: &mut Output,
    ) {
        if self.power_queue.front() != Some(&attribute) {
            warn!("Ignoring unexpected read of {}", attribute);
            return;
        }

        let value = match result {
            Ok(value) => value,
            Err(e) => {
                self.enter(SessionState::Idle);
                let detail = format!("Reading {attribute} failed: {e}");
                self.fail(SCardError::fatal(ErrorCode::ReadAttributeFailed, detail), out);
                return;
            }
        };
        self.power_queue.pop_front();

        if Some(attribute) == self.battery_level {
            self.power.level = value.first().copied().unwrap_or_default();
        } else if Some(attribute) == self.battery_power_state
            && let Some(&byte) = value.first()
        {
            self.power.state = PowerState::from_power_state_byte(byte);
        }

        if let Some(&next) = self.power_queue.front() {
            out.act(Action::ReadAttribute(next));
            return;
        }

        let power = std::mem::take(&mut self.power);
        info!("Battery {}% on {}", power.level, power.state);
        out.notify(Callback::PowerInfo {
            state: power.state,
            battery_level: power.level,
        });
        self.enter(SessionState::Idle);
        self.process_next_slot_connection(out);
    }

    fn slot_count(&self) -> u8 {
        u8::try_from(self.slots.len()).unwrap_or(u8::MAX)
    }

    fn enter(&mut self, state: SessionState) {
        match self.machine.transition_to(state) {
            Ok(transition) => debug!("Session {} -> {}", transition.from, transition.to),
            Err(e) => error!("{}", e),
        }
    }
}

/// Text of a string attribute, without trailing NULs or padding.
fn attribute_text(value: &[u8]) -> String {
    String::from_utf8_lossy(value)
        .trim_matches(char::from(0))
        .trim()
        .to_string()
}

/// Slot name carried by a slot-name escape response, after its status byte.
fn slot_name_from(payload: &[u8]) -> Option<String> {
    let name = attribute_text(payload.get(1..)?);
    (!name.is_empty()).then_some(name)
}
