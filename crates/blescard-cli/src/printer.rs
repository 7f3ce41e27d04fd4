//! Console output for session callbacks.

use bytes::Bytes;

use blescard_core::{Channel, DeviceSessionConstants, PowerState, SCardError};
use blescard_session::SessionListener;

/// Prints every callback on stdout, one line each.
#[derive(Debug, Default)]
pub struct Printer;

impl SessionListener for Printer {
    fn on_session_connected(&mut self) {
        println!("connected");
    }

    fn on_session_ready(&mut self, constants: &DeviceSessionConstants) {
        println!(
            "ready: {} {} (serial {}, firmware {}, PnP {})",
            constants.vendor_name,
            constants.product_name,
            constants.serial_number,
            constants.firmware_revision,
            constants.pnp_id
        );
        if constants.secured_service {
            println!("  secured CCID service");
        }
        for (slot, name) in constants.slot_names.iter().enumerate() {
            println!("  slot {slot}: {name}");
        }
    }

    fn on_session_closed(&mut self) {
        println!("closed");
    }

    fn on_session_error(&mut self, error: &SCardError) {
        println!("session error: {error}");
    }

    fn on_reader_or_card_error(&mut self, slot: u8, error: &SCardError) {
        println!("slot {slot} error: {error}");
    }

    fn on_reader_status_changed(&mut self, slot: u8, present: bool, powered: bool) {
        let card = match (present, powered) {
            (false, _) => "empty",
            (true, false) => "card present",
            (true, true) => "card powered",
        };
        println!("slot {slot}: {card}");
    }

    fn on_card_connected(&mut self, channel: &Channel) {
        println!(
            "slot {} connected, ATR {}",
            channel.slot(),
            hex::encode_upper(channel.atr())
        );
    }

    fn on_card_disconnected(&mut self, channel: &Channel) {
        println!("slot {} disconnected", channel.slot());
    }

    fn on_transmit_response(&mut self, channel: &Channel, response: &Bytes) {
        println!("slot {} << {}", channel.slot(), hex::encode_upper(response));
    }

    fn on_control_response(&mut self, response: &Bytes) {
        println!("control << {}", hex::encode_upper(response));
    }

    fn on_power_info(&mut self, state: PowerState, battery_level: u8) {
        println!("power: {state}, battery {battery_level}%");
    }

    fn on_sleep_state_changed(&mut self, sleeping: bool) {
        println!("reader {}", if sleeping { "asleep" } else { "awake" });
    }
}
