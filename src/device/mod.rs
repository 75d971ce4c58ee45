//! Device subsystem abstraction
//!
//! The echo engine never talks to a MIDI API directly. Everything goes through
//! [`DeviceSubsystem`]: enumeration, opening ports and the handle primitives.
//! The production implementation wraps `midir`; tests use [`mock::MockSubsystem`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::DeviceError;

pub mod midir_backend;
pub mod mock;

pub use midir_backend::MidirSubsystem;

/// Volatile numeric id assigned at enumeration time.
///
/// Only valid while the device stays attached; never persist it.
pub type DeviceId = usize;

/// Direction of a MIDI port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortKind {
    Input,
    Output,
}

impl fmt::Display for PortKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortKind::Input => write!(f, "input"),
            PortKind::Output => write!(f, "output"),
        }
    }
}

/// One enumerated port: its current id and its stable name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub id: DeviceId,
    pub name: String,
}

impl DeviceInfo {
    pub fn new(id: DeviceId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

/// Callback invoked by the subsystem for every incoming event.
///
/// May run on any thread, concurrently with everything else.
pub type InputCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// An opened input port.
pub trait InputHandle: Send {
    /// Begin delivering events to the callback given at open time
    fn start(&mut self) -> Result<(), DeviceError>;

    /// Stop delivering events
    fn stop(&mut self) -> Result<(), DeviceError>;

    /// Release the port. Calling it again is a no-op.
    fn close(&mut self) -> Result<(), DeviceError>;
}

/// An opened output port.
pub trait OutputHandle: Send {
    /// Send a channel/system message of at most three bytes
    fn send_short(&mut self, data: &[u8]) -> Result<(), DeviceError>;

    /// Send a sysex or otherwise buffered message
    fn send_long(&mut self, data: &[u8]) -> Result<(), DeviceError>;

    /// Release the port. Calling it again is a no-op.
    fn close(&mut self) -> Result<(), DeviceError>;
}

/// OS-level MIDI primitives consumed by the echo engine.
pub trait DeviceSubsystem: Send + Sync {
    fn enumerate_inputs(&self) -> Result<Vec<DeviceInfo>, DeviceError>;

    fn enumerate_outputs(&self) -> Result<Vec<DeviceInfo>, DeviceError>;

    /// Open an input port. Events are delivered to `on_event` between
    /// [`InputHandle::start`] and [`InputHandle::stop`].
    fn open_input(
        &self,
        id: DeviceId,
        on_event: InputCallback,
    ) -> Result<Box<dyn InputHandle>, DeviceError>;

    fn open_output(&self, id: DeviceId) -> Result<Box<dyn OutputHandle>, DeviceError>;
}

/// Snapshot of the live hardware inventory, keyed by name.
///
/// When several ports share a name, the first enumerated one wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Inventory {
    pub inputs: BTreeMap<String, DeviceId>,
    pub outputs: BTreeMap<String, DeviceId>,
}

impl Inventory {
    /// Enumerate both directions from the subsystem
    pub fn capture(subsystem: &dyn DeviceSubsystem) -> Result<Self, DeviceError> {
        Ok(Self {
            inputs: by_name(subsystem.enumerate_inputs()?),
            outputs: by_name(subsystem.enumerate_outputs()?),
        })
    }
}

fn by_name(devices: Vec<DeviceInfo>) -> BTreeMap<String, DeviceId> {
    let mut map = BTreeMap::new();
    for device in devices {
        map.entry(device.name).or_insert(device.id);
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inventory_first_duplicate_wins() {
        let map = by_name(vec![
            DeviceInfo::new(0, "loopMIDI Port"),
            DeviceInfo::new(1, "Keystation"),
            DeviceInfo::new(2, "loopMIDI Port"),
        ]);
        assert_eq!(map.get("loopMIDI Port"), Some(&0));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_inventory_equality_includes_ids() {
        let mut a = Inventory::default();
        a.inputs.insert("A".into(), 0);
        a.outputs.insert("W".into(), 0);
        a.outputs.insert("X".into(), 1);

        // W replugged: same names, swapped ids
        let mut b = a.clone();
        b.outputs.insert("W".into(), 1);
        b.outputs.insert("X".into(), 0);
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
    }
}
