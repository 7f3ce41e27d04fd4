//! Known and connected readers.
//!
//! A reader becomes known when its session first reports ready; its
//! constants are kept so a later session can be compared against them. The
//! connected set follows session-ready and session-closed. A reader whose
//! session fails fatally before it was ever ready is forgotten.

use std::collections::{HashMap, HashSet};

use tracing::{debug, info};

use blescard_core::{DeviceId, DeviceSessionConstants};

use crate::action::Callback;

#[derive(Debug, Default)]
pub struct SessionRegistry {
    known: HashMap<DeviceId, DeviceSessionConstants>,
    connected: HashSet<DeviceId>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update the registry from a callback emitted by `device`'s session.
    pub fn observe(&mut self, device: &DeviceId, callback: &Callback) {
        match callback {
            Callback::SessionReady(constants) => {
                info!("Reader {} ready ({} slots)", device, constants.slot_names.len());
                self.known.insert(device.clone(), constants.clone());
                self.connected.insert(device.clone());
            }
            Callback::SessionClosed => {
                if self.connected.remove(device) {
                    debug!("Reader {} no longer connected", device);
                }
            }
            Callback::SessionError(error) if error.fatal && !self.connected.contains(device) => {
                if self.known.remove(device).is_some() {
                    info!("Forgetting reader {} after {}", device, error);
                }
            }
            _ => {}
        }
    }

    pub fn is_known(&self, device: &DeviceId) -> bool {
        self.known.contains_key(device)
    }

    pub fn is_connected(&self, device: &DeviceId) -> bool {
        self.connected.contains(device)
    }

    pub fn constants(&self, device: &DeviceId) -> Option<&DeviceSessionConstants> {
        self.known.get(device)
    }

    pub fn connected(&self) -> impl Iterator<Item = &DeviceId> {
        self.connected.iter()
    }

    /// Drop everything recorded for `device`.
    pub fn forget(&mut self, device: &DeviceId) {
        self.known.remove(device);
        self.connected.remove(device);
    }

    pub fn known_count(&self) -> usize {
        self.known.len()
    }
}
