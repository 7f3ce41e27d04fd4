//! Common test utilities for session integration tests.
//!
//! [`SimReader`] answers session actions the way a real reader would, and
//! [`Harness`] loops actions back into the session as transport events
//! until it has nothing left to do.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use uuid::Uuid;

use blescard_core::constants::{
    GATT_BATTERY_LEVEL, GATT_BATTERY_POWER_STATE, GATT_FIRMWARE_REVISION,
    GATT_HARDWARE_REVISION, GATT_MANUFACTURER_NAME, GATT_MODEL_NUMBER, GATT_PNP_ID,
    GATT_SERIAL_NUMBER, GATT_SOFTWARE_REVISION, HEADER_SIZE, sig_uuid,
};
use blescard_session::{
    Action, AttributeId, Callback, Event, GattProfile, Request, Session, SessionConfig,
    TransportEvent,
};

pub const DEVICE_INFORMATION_SERVICE: Uuid = sig_uuid(0x180A);
pub const BATTERY_SERVICE: Uuid = sig_uuid(0x180F);

pub const ATR: [u8; 4] = [0x3B, 0x8F, 0x80, 0x01];

/// Build a raw RDR_to_PC frame.
pub fn response_frame(code: u8, slot: u8, seq: u8, status: u8, error: u8, payload: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(HEADER_SIZE + payload.len());
    bytes.push(code);
    bytes.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    bytes.extend_from_slice(&[slot, seq, status, error, 0x00]);
    bytes.extend_from_slice(payload);
    bytes
}

/// Build a slot status bitmap from one 2-bit code per slot.
pub fn bitmap(codes: &[u8], sleeping: bool) -> Vec<u8> {
    let mut bytes = vec![codes.len() as u8 | if sleeping { 0x80 } else { 0x00 }];
    for group in codes.chunks(4) {
        let byte = group
            .iter()
            .enumerate()
            .fold(0u8, |acc, (i, code)| acc | ((code & 0x03) << (i * 2)));
        bytes.push(byte);
    }
    bytes
}

#[derive(Debug, Clone)]
pub struct SimCard {
    pub atr: Vec<u8>,
    pub powered: bool,
}

impl SimCard {
    pub fn new() -> Self {
        Self {
            atr: ATR.to_vec(),
            powered: false,
        }
    }

    fn icc_status(&self) -> u8 {
        if self.powered { 0x00 } else { 0x01 }
    }
}

/// In-memory reader answering GATT reads and CCID commands.
#[derive(Debug)]
pub struct SimReader {
    pub gatt: GattProfile,
    pub secured: bool,
    pub has_ccid_service: bool,
    pub slot_count: u8,
    pub cards: Vec<Option<SimCard>>,
    pub names: Vec<String>,
    pub battery: Option<(u8, u8)>,
    /// Notification payload limit.
    pub mtu: usize,
    /// When false, complete responses are parked in `held`.
    pub respond: bool,
    pub held: VecDeque<Vec<u8>>,
    pub fail_writes: bool,
    pub fail_reads: bool,
    rx: Vec<u8>,
}

impl SimReader {
    pub fn new(slot_count: u8) -> Self {
        Self {
            gatt: GattProfile::default(),
            secured: false,
            has_ccid_service: true,
            slot_count,
            cards: vec![None; usize::from(slot_count)],
            names: (0..slot_count).map(|i| format!("Reader slot {i}")).collect(),
            battery: Some((87, 0x3B)),
            mtu: 20,
            respond: true,
            held: VecDeque::new(),
            fail_writes: false,
            fail_reads: false,
            rx: Vec::new(),
        }
    }

    pub fn with_card(mut self, slot: u8) -> Self {
        self.cards[usize::from(slot)] = Some(SimCard::new());
        self
    }

    pub fn ccid_service(&self) -> Uuid {
        if self.secured {
            self.gatt.ccid_secured_service
        } else {
            self.gatt.ccid_service
        }
    }

    pub fn status_attribute(&self) -> AttributeId {
        AttributeId::new(self.ccid_service(), self.gatt.ccid_status)
    }

    pub fn rdr_to_pc(&self) -> AttributeId {
        AttributeId::new(self.ccid_service(), self.gatt.rdr_to_pc)
    }

    pub fn attributes(&self) -> Vec<AttributeId> {
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
        .map(|short| AttributeId::new(DEVICE_INFORMATION_SERVICE, sig_uuid(short)))
        .collect();

        if self.battery.is_some() {
            attributes.push(AttributeId::new(BATTERY_SERVICE, sig_uuid(GATT_BATTERY_LEVEL)));
            attributes.push(AttributeId::new(
                BATTERY_SERVICE,
                sig_uuid(GATT_BATTERY_POWER_STATE),
            ));
        }

        if self.has_ccid_service {
            let service = self.ccid_service();
            for characteristic in [self.gatt.ccid_status, self.gatt.pc_to_rdr, self.gatt.rdr_to_pc] {
                attributes.push(AttributeId::new(service, characteristic));
            }
        }
        attributes
    }

    /// Current bitmap: present cards report code 1.
    pub fn current_bitmap(&self) -> Vec<u8> {
        let codes: Vec<u8> = self.cards.iter().map(|c| u8::from(c.is_some())).collect();
        let mut bytes = bitmap(&codes, false);
        bytes[0] = self.slot_count;
        bytes
    }

    pub fn read(&self, attribute: AttributeId) -> Result<Bytes, String> {
        if self.fail_reads {
            return Err("GATT read error".to_string());
        }
        let c = attribute.characteristic;
        let value: Vec<u8> = if c == self.gatt.ccid_status {
            self.current_bitmap()
        } else if c == sig_uuid(GATT_MANUFACTURER_NAME) {
            b"Blescard Labs".to_vec()
        } else if c == sig_uuid(GATT_MODEL_NUMBER) {
            b"BR-2\0".to_vec()
        } else if c == sig_uuid(GATT_SERIAL_NUMBER) {
            b"00042".to_vec()
        } else if c == sig_uuid(GATT_FIRMWARE_REVISION) {
            b"1.53-7".to_vec()
        } else if c == sig_uuid(GATT_HARDWARE_REVISION) {
            b"B".to_vec()
        } else if c == sig_uuid(GATT_SOFTWARE_REVISION) {
            b"2.0".to_vec()
        } else if c == sig_uuid(GATT_PNP_ID) {
            vec![0x01, 0x6C, 0x04, 0x01, 0x00, 0x10, 0x00]
        } else if c == sig_uuid(GATT_BATTERY_LEVEL) {
            vec![self.battery.map(|b| b.0).unwrap_or_default()]
        } else if c == sig_uuid(GATT_BATTERY_POWER_STATE) {
            vec![self.battery.map(|b| b.1).unwrap_or_default()]
        } else {
            return Err(format!("unknown attribute {attribute}"));
        };
        Ok(Bytes::from(value))
    }

    /// Accept one written chunk; returns the response once a full command
    /// has arrived.
    pub fn on_write(&mut self, chunk: &[u8]) -> Option<Vec<u8>> {
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
        let (code, slot, seq) = (command[0], command[5], command[6]);
        let payload = &command[HEADER_SIZE..];
        let absent = |code| response_frame(code, slot, seq, 0x42, 0xFE, &[]);

        match code {
            0x6B => {
                if payload.len() == 3 && payload[..2] == [0x58, 0x21] {
                    let mut name = vec![0x00];
                    if let Some(n) = self.names.get(usize::from(payload[2])) {
                        name.extend_from_slice(n.as_bytes());
                    }
                    response_frame(0x83, 0, seq, 0x00, 0x00, &name)
                } else {
                    response_frame(0x83, 0, seq, 0x00, 0x00, payload)
                }
            }
            0x62 => match self.cards[usize::from(slot)].as_mut() {
                Some(card) => {
                    card.powered = true;
                    response_frame(0x80, slot, seq, 0x00, 0x00, &card.atr)
                }
                None => absent(0x80),
            },
            0x63 => match self.cards[usize::from(slot)].as_mut() {
                Some(card) => {
                    card.powered = false;
                    response_frame(0x81, slot, seq, 0x01, 0x00, &[])
                }
                None => response_frame(0x81, slot, seq, 0x02, 0x00, &[]),
            },
            0x65 => {
                let status = self.cards[usize::from(slot)]
                    .as_ref()
                    .map(SimCard::icc_status)
                    .unwrap_or(0x02);
                response_frame(0x81, slot, seq, status, 0x00, &[])
            }
            0x6F => match self.cards[usize::from(slot)].as_ref() {
                Some(card) if card.powered => {
                    let mut answer = payload.to_vec();
                    answer.extend_from_slice(&[0x90, 0x00]);
                    response_frame(0x80, slot, seq, 0x00, 0x00, &answer)
                }
                Some(_) => response_frame(0x81, slot, seq, 0x01, 0x00, &[]),
                None => absent(0x80),
            },
            other => panic!("unexpected command {other:02X}"),
        }
    }
}

/// Drives a [`Session`] against a [`SimReader`].
#[derive(Debug)]
pub struct Harness {
    pub session: Session,
    pub reader: SimReader,
    pub callbacks: Vec<Callback>,
    pub writes: Vec<Bytes>,
    pub timer: Option<(u8, Duration)>,
}

impl Harness {
    pub fn new(config: SessionConfig, reader: SimReader) -> Self {
        Self {
            session: Session::new(config),
            reader,
            callbacks: Vec::new(),
            writes: Vec::new(),
            timer: None,
        }
    }

    /// Connect, set up and clear the recorded callbacks.
    pub fn ready(config: SessionConfig, reader: SimReader) -> Self {
        let mut harness = Self::new(config, reader);
        harness.open();
        harness.callbacks.clear();
        harness.writes.clear();
        harness
    }

    /// Connect and create the session. Returns every callback emitted.
    pub fn open(&mut self) -> Vec<Callback> {
        let mut callbacks = self.send(Request::Connect);
        callbacks.extend(self.send(Request::Create));
        callbacks
    }

    /// Feed `event` and every event it causes. Returns the new callbacks.
    pub fn send(&mut self, event: impl Into<Event>) -> Vec<Callback> {
        let start = self.callbacks.len();
        let mut events = VecDeque::from([event.into()]);

        while let Some(event) = events.pop_front() {
            let output = self.session.handle(event);
            self.callbacks.extend(output.callbacks);
            for action in output.actions {
                self.execute(action, &mut events);
            }
        }

        self.callbacks[start..].to_vec()
    }

    pub fn notify_status(&mut self, bytes: Vec<u8>) -> Vec<Callback> {
        let attribute = self.reader.status_attribute();
        self.send(TransportEvent::Notification {
            attribute,
            value: Bytes::from(bytes),
        })
    }

    /// Deliver raw bytes on the reader-to-host characteristic.
    pub fn notify_response(&mut self, bytes: &[u8]) -> Vec<Callback> {
        let attribute = self.reader.rdr_to_pc();
        self.send(TransportEvent::Notification {
            attribute,
            value: Bytes::copy_from_slice(bytes),
        })
    }

    /// Deliver the oldest held response in MTU-sized fragments.
    pub fn release(&mut self) -> Vec<Callback> {
        let frame = self.reader.held.pop_front().expect("no held response");
        let mut callbacks = Vec::new();
        for fragment in frame.chunks(self.reader.mtu) {
            callbacks.extend(self.notify_response(fragment));
        }
        callbacks
    }

    /// Expire the armed response deadline.
    pub fn fire_timer(&mut self) -> Vec<Callback> {
        let (sequence, _) = self.timer.take().expect("no timer armed");
        self.send(Event::ResponseTimeout { sequence })
    }

    /// Sequence number of the last command written.
    pub fn last_sequence(&self) -> u8 {
        let frame: Vec<u8> = self.writes.iter().flat_map(|w| w.iter().copied()).collect();
        let mut offset = 0;
        let mut sequence = 0;
        while offset + HEADER_SIZE <= frame.len() {
            let length = u32::from_le_bytes([
                frame[offset + 1],
                frame[offset + 2],
                frame[offset + 3],
                frame[offset + 4],
            ]) as usize;
            sequence = frame[offset + 6];
            offset += HEADER_SIZE + length;
        }
        sequence
    }

    fn execute(&mut self, action: Action, events: &mut VecDeque<Event>) {
        match action {
            Action::Connect => events.push_back(TransportEvent::Connected.into()),
            Action::DiscoverAttributes => events.push_back(
                TransportEvent::AttributesDiscovered(Ok(self.reader.attributes())).into(),
            ),
            Action::ReadAttribute(attribute) => events.push_back(
                TransportEvent::AttributeRead {
                    attribute,
                    result: self.reader.read(attribute),
                }
                .into(),
            ),
            Action::EnableNotifications(attribute) => events.push_back(
                TransportEvent::NotificationsEnabled {
                    attribute,
                    result: Ok(()),
                }
                .into(),
            ),
            Action::WriteAttribute { attribute, value } => {
                self.writes.push(value.clone());
                if self.reader.fail_writes {
                    events.push_back(
                        TransportEvent::AttributeWritten {
                            attribute,
                            result: Err("GATT write error".to_string()),
                        }
                        .into(),
                    );
                    return;
                }
                events.push_back(
                    TransportEvent::AttributeWritten {
                        attribute,
                        result: Ok(()),
                    }
                    .into(),
                );
                if let Some(frame) = self.reader.on_write(&value) {
                    if self.reader.respond {
                        let rdr_to_pc = self.reader.rdr_to_pc();
                        for fragment in frame.chunks(self.reader.mtu) {
                            events.push_back(
                                TransportEvent::Notification {
                                    attribute: rdr_to_pc,
                                    value: Bytes::copy_from_slice(fragment),
                                }
                                .into(),
                            );
                        }
                    } else {
                        self.reader.held.push_back(frame);
                    }
                }
            }
            Action::Disconnect => events.push_back(TransportEvent::Disconnected.into()),
            Action::ArmResponseTimer { sequence, timeout } => {
                self.timer = Some((sequence, timeout));
            }
            Action::CancelResponseTimer => self.timer = None,
        }
    }
}
