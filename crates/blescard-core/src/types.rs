use crate::{Result, constants::BATTERY_EXTERNAL_POWER_MASK, error::Error};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a remote reader (BLE address or platform handle).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    /// Create a new device identifier.
    ///
    /// # Errors
    /// Returns `Error::InvalidMessageFormat` if the identifier is blank.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into().trim().to_string();
        if id.is_empty() {
            return Err(Error::InvalidMessageFormat(
                "Device identifier must not be empty".to_string(),
            ));
        }
        Ok(DeviceId(id))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for DeviceId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        DeviceId::new(s)
    }
}

/// Logical communication path to the card of one slot.
///
/// A channel is never mutated: a new one replaces it whenever the card
/// power state changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    slot: u8,
    atr: Vec<u8>,
}

impl Channel {
    pub fn new(slot: u8, atr: Vec<u8>) -> Self {
        Self { slot, atr }
    }

    /// A channel with no powered card.
    pub fn unpowered(slot: u8) -> Self {
        Self::new(slot, Vec::new())
    }

    #[must_use]
    pub fn slot(&self) -> u8 {
        self.slot
    }

    /// Answer-To-Reset of the powered card, empty when unpowered.
    #[must_use]
    pub fn atr(&self) -> &[u8] {
        &self.atr
    }

    #[must_use]
    pub fn is_powered(&self) -> bool {
        !self.atr.is_empty()
    }
}

/// One card slot of a reader.
///
/// `card_powered` is never true while `card_present` is false; every
/// mutator preserves that.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    index: u8,
    name: String,
    card_present: bool,
    card_powered: bool,
    card_connected: bool,
    card_error: bool,
    channel: Channel,
}

impl Slot {
    pub fn new(index: u8) -> Self {
        Self {
            index,
            name: String::new(),
            card_present: false,
            card_powered: false,
            card_connected: false,
            card_error: false,
            channel: Channel::unpowered(index),
        }
    }

    #[must_use]
    pub fn index(&self) -> u8 {
        self.index
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    #[must_use]
    pub fn card_present(&self) -> bool {
        self.card_present
    }

    #[must_use]
    pub fn card_powered(&self) -> bool {
        self.card_powered
    }

    #[must_use]
    pub fn card_connected(&self) -> bool {
        self.card_connected
    }

    #[must_use]
    pub fn card_error(&self) -> bool {
        self.card_error
    }

    #[must_use]
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Record presence and power as reported by the reader.
    ///
    /// A powered-but-absent report is clamped to unpowered. Losing power
    /// replaces the channel with one carrying no ATR.
    pub fn set_card_status(&mut self, present: bool, powered: bool) {
        self.card_present = present;
        self.card_powered = present && powered;
        if !self.card_powered {
            self.card_connected = false;
            if self.channel.is_powered() {
                self.channel = Channel::unpowered(self.index);
            }
        }
    }

    pub fn set_card_error(&mut self, error: bool) {
        self.card_error = error;
    }

    /// A card answered a power-on with `atr`.
    pub fn connect(&mut self, atr: Vec<u8>) {
        self.card_present = true;
        self.card_powered = true;
        self.card_connected = true;
        self.card_error = false;
        self.channel = Channel::new(self.index, atr);
    }

    /// The card was powered off but is still in the slot.
    pub fn disconnect(&mut self) {
        self.card_powered = false;
        self.card_connected = false;
        self.channel = Channel::unpowered(self.index);
    }

    /// The card left the slot.
    pub fn remove_card(&mut self) {
        self.disconnect();
        self.card_present = false;
        self.card_error = false;
    }

    /// The reader went to sleep: nothing is known about the card anymore.
    pub fn force_off(&mut self) {
        self.disconnect();
        self.card_present = false;
    }
}

/// Firmware version parsed from a `major.minor-build` revision string.
///
/// # Examples
///
/// ```
/// use blescard_core::FirmwareVersion;
///
/// let version: FirmwareVersion = "1.53-7".parse().unwrap();
/// assert_eq!((version.major, version.minor, version.build), (1, 53, 7));
/// assert_eq!(version.to_string(), "1.53-7");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FirmwareVersion {
    pub major: u16,
    pub minor: u16,
    pub build: u16,
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}-{}", self.major, self.minor, self.build)
    }
}

impl std::str::FromStr for FirmwareVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidMessageFormat(format!("Invalid firmware revision: {s}"));

        let (version, build) = s.trim().split_once('-').ok_or_else(invalid)?;
        let (major, minor) = version.split_once('.').ok_or_else(invalid)?;

        Ok(FirmwareVersion {
            major: major.trim().parse().map_err(|_| invalid())?,
            minor: minor.trim().parse().map_err(|_| invalid())?,
            build: build.trim().parse().map_err(|_| invalid())?,
        })
    }
}

/// Power source of a battery-capable reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    /// The reader exposes no power attributes.
    #[default]
    Unknown,
    /// Running on USB or charging.
    ExternalPower,
    /// Running on battery.
    Battery,
}

impl PowerState {
    /// Interpret the battery power state attribute.
    pub fn from_power_state_byte(byte: u8) -> Self {
        if byte & BATTERY_EXTERNAL_POWER_MASK == BATTERY_EXTERNAL_POWER_MASK {
            PowerState::ExternalPower
        } else {
            PowerState::Battery
        }
    }

    /// Numeric form used by the reader tooling: 0 unknown, 1 external, 2 battery.
    pub fn as_u8(&self) -> u8 {
        match self {
            PowerState::Unknown => 0,
            PowerState::ExternalPower => 1,
            PowerState::Battery => 2,
        }
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PowerState::Unknown => write!(f, "unknown"),
            PowerState::ExternalPower => write!(f, "external power"),
            PowerState::Battery => write!(f, "battery"),
        }
    }
}

/// Reader metadata gathered once while the session is being set up.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSessionConstants {
    pub vendor_name: String,
    pub product_name: String,
    pub serial_number: String,
    pub firmware_revision: String,
    pub hardware_revision: String,
    pub software_revision: String,
    /// PnP ID attribute rendered as uppercase hex.
    pub pnp_id: String,
    pub firmware_version: Option<FirmwareVersion>,
    pub slot_names: Vec<String>,
    /// The reader exposes the secured CCID service variant.
    pub secured_service: bool,
}
