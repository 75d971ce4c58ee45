//! `midir` implementation of the device subsystem
//!
//! Ids are port indices in enumeration order, exactly as `midir` lists them.
//! midir has no separate start/stop for inputs, so an opened input forwards
//! events only while its running flag is set.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use midir::{ConnectErrorKind, Ignore, MidiInput, MidiInputConnection, MidiOutput, MidiOutputConnection};
use tracing::{debug, trace};

use super::{DeviceId, DeviceInfo, DeviceSubsystem, InputCallback, InputHandle, OutputHandle};
use crate::error::{DeviceError, DeviceErrorKind};
use crate::midi::format_hex;

const CLIENT_NAME: &str = "EchoMIDI";

/// Device subsystem backed by the platform MIDI API through `midir`
#[derive(Debug, Default)]
pub struct MidirSubsystem;

impl MidirSubsystem {
    pub fn new() -> Self {
        Self
    }

    fn input_client(&self) -> Result<MidiInput, DeviceError> {
        let mut midi_in = MidiInput::new(CLIENT_NAME)
            .map_err(|e| DeviceError::other("could not create MIDI input client").with_cause(e))?;
        // Sysex, timing and active sensing are echoed like everything else
        midi_in.ignore(Ignore::None);
        Ok(midi_in)
    }

    fn output_client(&self) -> Result<MidiOutput, DeviceError> {
        MidiOutput::new(CLIENT_NAME)
            .map_err(|e| DeviceError::other("could not create MIDI output client").with_cause(e))
    }
}

impl DeviceSubsystem for MidirSubsystem {
    fn enumerate_inputs(&self) -> Result<Vec<DeviceInfo>, DeviceError> {
        let midi_in = self.input_client()?;
        let mut devices = Vec::new();
        for (id, port) in midi_in.ports().iter().enumerate() {
            match midi_in.port_name(port) {
                Ok(name) => devices.push(DeviceInfo::new(id, name)),
                Err(e) => debug!("Skipping input port {} without a name: {}", id, e),
            }
        }
        Ok(devices)
    }

    fn enumerate_outputs(&self) -> Result<Vec<DeviceInfo>, DeviceError> {
        let midi_out = self.output_client()?;
        let mut devices = Vec::new();
        for (id, port) in midi_out.ports().iter().enumerate() {
            match midi_out.port_name(port) {
                Ok(name) => devices.push(DeviceInfo::new(id, name)),
                Err(e) => debug!("Skipping output port {} without a name: {}", id, e),
            }
        }
        Ok(devices)
    }

    fn open_input(
        &self,
        id: DeviceId,
        on_event: InputCallback,
    ) -> Result<Box<dyn InputHandle>, DeviceError> {
        let midi_in = self.input_client()?;
        let ports = midi_in.ports();
        let port = ports.get(id).ok_or_else(|| {
            DeviceError::invalid_id(format!(
                "input id {} out of range (0..{})",
                id,
                ports.len()
            ))
        })?;
        let name = midi_in.port_name(port).unwrap_or_default();

        let running = Arc::new(AtomicBool::new(false));
        let gate = running.clone();

        let connection = midi_in
            .connect(
                port,
                &format!("echo-midi-in-{}", id),
                move |_timestamp, data, _| {
                    if gate.load(Ordering::Acquire) {
                        on_event(data);
                    } else {
                        trace!("Dropped input while stopped: {}", format_hex(data));
                    }
                },
                (),
            )
            .map_err(|e| connect_error(e.kind(), &e.to_string()))?;

        debug!("MIDI IN opened: [{}] '{}'", id, name);
        Ok(Box::new(MidirInput {
            connection: Some(connection),
            running,
        }))
    }

    fn open_output(&self, id: DeviceId) -> Result<Box<dyn OutputHandle>, DeviceError> {
        let midi_out = self.output_client()?;
        let ports = midi_out.ports();
        let port = ports.get(id).ok_or_else(|| {
            DeviceError::invalid_id(format!(
                "output id {} out of range (0..{})",
                id,
                ports.len()
            ))
        })?;
        let name = midi_out.port_name(port).unwrap_or_default();

        let connection = midi_out
            .connect(port, &format!("echo-midi-out-{}", id))
            .map_err(|e| connect_error(e.kind(), &e.to_string()))?;

        debug!("MIDI OUT opened: [{}] '{}'", id, name);
        Ok(Box::new(MidirOutput {
            connection: Some(connection),
        }))
    }
}

/// Map a midir connect failure onto the coarse subsystem kinds.
///
/// midir does not expose "already allocated" as its own kind, the WinMM
/// backend only reports it in the message text.
fn connect_error(kind: ConnectErrorKind, message: &str) -> DeviceError {
    match kind {
        ConnectErrorKind::InvalidPort => DeviceError::invalid_id(message.to_string()),
        ConnectErrorKind::Other(_) => {
            let lower = message.to_ascii_lowercase();
            if lower.contains("allocated") || lower.contains("in use") || lower.contains("busy") {
                DeviceError::busy(message.to_string())
            } else {
                DeviceError::new(DeviceErrorKind::Other, message.to_string())
            }
        },
    }
}

struct MidirInput {
    connection: Option<MidiInputConnection<()>>,
    running: Arc<AtomicBool>,
}

// midir connections are only touched through &mut self by the owning echo unit
unsafe impl Send for MidirInput {}

impl InputHandle for MidirInput {
    fn start(&mut self) -> Result<(), DeviceError> {
        if self.connection.is_none() {
            return Err(DeviceError::other("input port is closed"));
        }
        self.running.store(true, Ordering::Release);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), DeviceError> {
        if self.connection.is_none() {
            return Err(DeviceError::other("input port is closed"));
        }
        self.running.store(false, Ordering::Release);
        Ok(())
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        self.running.store(false, Ordering::Release);
        if let Some(connection) = self.connection.take() {
            connection.close();
        }
        Ok(())
    }
}

impl Drop for MidirInput {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

struct MidirOutput {
    connection: Option<MidiOutputConnection>,
}

// See MidirInput
unsafe impl Send for MidirOutput {}

impl MidirOutput {
    fn send(&mut self, data: &[u8]) -> Result<(), DeviceError> {
        let connection = self
            .connection
            .as_mut()
            .ok_or_else(|| DeviceError::other("output port is closed"))?;
        connection
            .send(data)
            .map_err(|e| DeviceError::other("MIDI send failed").with_cause(e))
    }
}

impl OutputHandle for MidirOutput {
    fn send_short(&mut self, data: &[u8]) -> Result<(), DeviceError> {
        self.send(data)
    }

    fn send_long(&mut self, data: &[u8]) -> Result<(), DeviceError> {
        self.send(data)
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        if let Some(connection) = self.connection.take() {
            connection.close();
        }
        Ok(())
    }
}

impl Drop for MidirOutput {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
