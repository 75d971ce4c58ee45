//! In-memory device subsystem for tests
//!
//! Behaves like a small MIDI stack: ids are positions in the port lists and
//! shift when a port is unplugged, inputs are exclusive, outputs can be opened
//! by several owners, and tests can occupy a port "from another process",
//! make sends fail, and inject input events.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{
    DeviceId, DeviceInfo, DeviceSubsystem, InputCallback, InputHandle, OutputHandle, PortKind,
};
use crate::error::DeviceError;

/// One forwarded message as seen by a mock output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockSend {
    pub long: bool,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
struct MockPort {
    name: String,
    serial: u64,
}

struct OpenInput {
    callback: InputCallback,
    running: bool,
}

#[derive(Default)]
struct MockState {
    inputs: Vec<MockPort>,
    outputs: Vec<MockPort>,
    next_serial: u64,
    open_inputs: HashMap<u64, OpenInput>,
    open_outputs: HashMap<String, usize>,
    output_closes: HashMap<String, usize>,
    sent: HashMap<String, Vec<MockSend>>,
    failing_outputs: HashSet<String>,
    failing_starts: HashSet<String>,
    occupied: HashSet<(PortKind, String)>,
}

impl MockState {
    fn serial(&mut self) -> u64 {
        self.next_serial += 1;
        self.next_serial
    }

    fn output_plugged(&self, serial: u64) -> bool {
        self.outputs.iter().any(|p| p.serial == serial)
    }
}

/// Cloneable handle to a shared in-memory MIDI stack
#[derive(Clone, Default)]
pub struct MockSubsystem {
    state: Arc<Mutex<MockState>>,
}

impl MockSubsystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a stack with the given ports already plugged in
    pub fn with_devices(inputs: &[&str], outputs: &[&str]) -> Self {
        let mock = Self::new();
        for name in inputs {
            mock.plug_input(name);
        }
        for name in outputs {
            mock.plug_output(name);
        }
        mock
    }

    pub fn plug_input(&self, name: &str) {
        let mut state = self.state.lock();
        let serial = state.serial();
        state.inputs.push(MockPort {
            name: name.to_string(),
            serial,
        });
    }

    pub fn plug_output(&self, name: &str) {
        let mut state = self.state.lock();
        let serial = state.serial();
        state.outputs.push(MockPort {
            name: name.to_string(),
            serial,
        });
    }

    /// Remove an input port; later ports shift down one id
    pub fn unplug_input(&self, name: &str) {
        let mut state = self.state.lock();
        if let Some(pos) = state.inputs.iter().position(|p| p.name == name) {
            let port = state.inputs.remove(pos);
            state.open_inputs.remove(&port.serial);
        }
    }

    /// Remove an output port; later ports shift down one id
    pub fn unplug_output(&self, name: &str) {
        let mut state = self.state.lock();
        if let Some(pos) = state.outputs.iter().position(|p| p.name == name) {
            state.outputs.remove(pos);
        }
    }

    /// Mark a port as held by some other process
    pub fn occupy(&self, kind: PortKind, name: &str) {
        self.state.lock().occupied.insert((kind, name.to_string()));
    }

    pub fn release(&self, kind: PortKind, name: &str) {
        self.state.lock().occupied.remove(&(kind, name.to_string()));
    }

    /// Make every send to this output fail
    pub fn fail_sends(&self, output: &str, fail: bool) {
        let mut state = self.state.lock();
        if fail {
            state.failing_outputs.insert(output.to_string());
        } else {
            state.failing_outputs.remove(output);
        }
    }

    /// Make `start` fail on handles of this input; open and close still work
    pub fn fail_starts(&self, input: &str, fail: bool) {
        let mut state = self.state.lock();
        if fail {
            state.failing_starts.insert(input.to_string());
        } else {
            state.failing_starts.remove(input);
        }
    }

    /// Deliver an event from a hardware input.
    ///
    /// Returns false when no started handle is listening. The callback runs
    /// on the calling thread without the mock lock held.
    pub fn inject(&self, input: &str, data: &[u8]) -> bool {
        let callback = {
            let state = self.state.lock();
            let Some(port) = state.inputs.iter().find(|p| p.name == input) else {
                return false;
            };
            match state.open_inputs.get(&port.serial) {
                Some(open) if open.running => open.callback.clone(),
                _ => return false,
            }
        };
        callback(data);
        true
    }

    /// Everything successfully sent to an output, oldest first
    pub fn sent(&self, output: &str) -> Vec<MockSend> {
        self.state.lock().sent.get(output).cloned().unwrap_or_default()
    }

    pub fn sent_data(&self, output: &str) -> Vec<Vec<u8>> {
        self.sent(output).into_iter().map(|s| s.data).collect()
    }

    pub fn clear_sent(&self) {
        self.state.lock().sent.clear();
    }

    pub fn input_open(&self, name: &str) -> bool {
        let state = self.state.lock();
        state
            .inputs
            .iter()
            .find(|p| p.name == name)
            .is_some_and(|p| state.open_inputs.contains_key(&p.serial))
    }

    pub fn input_running(&self, name: &str) -> bool {
        let state = self.state.lock();
        state
            .inputs
            .iter()
            .find(|p| p.name == name)
            .and_then(|p| state.open_inputs.get(&p.serial))
            .is_some_and(|open| open.running)
    }

    /// Number of handles currently open on an output
    pub fn output_open_count(&self, name: &str) -> usize {
        self.state.lock().open_outputs.get(name).copied().unwrap_or(0)
    }

    /// Number of handle closes ever seen for an output
    pub fn output_close_count(&self, name: &str) -> usize {
        self.state.lock().output_closes.get(name).copied().unwrap_or(0)
    }

    pub fn input_id(&self, name: &str) -> Option<DeviceId> {
        self.state.lock().inputs.iter().position(|p| p.name == name)
    }

    pub fn output_id(&self, name: &str) -> Option<DeviceId> {
        self.state.lock().outputs.iter().position(|p| p.name == name)
    }
}

impl DeviceSubsystem for MockSubsystem {
    fn enumerate_inputs(&self) -> Result<Vec<DeviceInfo>, DeviceError> {
        let state = self.state.lock();
        Ok(state
            .inputs
            .iter()
            .enumerate()
            .map(|(id, p)| DeviceInfo::new(id, p.name.clone()))
            .collect())
    }

    fn enumerate_outputs(&self) -> Result<Vec<DeviceInfo>, DeviceError> {
        let state = self.state.lock();
        Ok(state
            .outputs
            .iter()
            .enumerate()
            .map(|(id, p)| DeviceInfo::new(id, p.name.clone()))
            .collect())
    }

    fn open_input(
        &self,
        id: DeviceId,
        on_event: InputCallback,
    ) -> Result<Box<dyn InputHandle>, DeviceError> {
        let mut state = self.state.lock();
        let port = state.inputs.get(id).cloned().ok_or_else(|| {
            DeviceError::invalid_id(format!("input id {} out of range", id))
        })?;
        if state.occupied.contains(&(PortKind::Input, port.name.clone()))
            || state.open_inputs.contains_key(&port.serial)
        {
            return Err(DeviceError::busy(format!("'{}' already allocated", port.name)));
        }
        state.open_inputs.insert(
            port.serial,
            OpenInput {
                callback: on_event,
                running: false,
            },
        );
        Ok(Box::new(MockInputHandle {
            state: self.state.clone(),
            serial: port.serial,
            closed: false,
        }))
    }

    fn open_output(&self, id: DeviceId) -> Result<Box<dyn OutputHandle>, DeviceError> {
        let mut state = self.state.lock();
        let port = state.outputs.get(id).cloned().ok_or_else(|| {
            DeviceError::invalid_id(format!("output id {} out of range", id))
        })?;
        if state.occupied.contains(&(PortKind::Output, port.name.clone())) {
            return Err(DeviceError::busy(format!("'{}' already allocated", port.name)));
        }
        *state.open_outputs.entry(port.name.clone()).or_insert(0) += 1;
        Ok(Box::new(MockOutputHandle {
            state: self.state.clone(),
            serial: port.serial,
            name: port.name,
            closed: false,
        }))
    }
}

struct MockInputHandle {
    state: Arc<Mutex<MockState>>,
    serial: u64,
    closed: bool,
}

impl MockInputHandle {
    fn set_running(&mut self, running: bool) -> Result<(), DeviceError> {
        if self.closed {
            return Err(DeviceError::other("input handle is closed"));
        }
        let mut state = self.state.lock();
        let Some(port) = state.inputs.iter().find(|p| p.serial == self.serial) else {
            return Err(DeviceError::other("input device was removed"));
        };
        if running && state.failing_starts.contains(&port.name) {
            return Err(DeviceError::other(format!("'{}' refused to start", port.name)));
        }
        match state.open_inputs.get_mut(&self.serial) {
            Some(open) => {
                open.running = running;
                Ok(())
            },
            None => Err(DeviceError::other("input handle is not registered")),
        }
    }
}

impl InputHandle for MockInputHandle {
    fn start(&mut self) -> Result<(), DeviceError> {
        self.set_running(true)
    }

    fn stop(&mut self) -> Result<(), DeviceError> {
        self.set_running(false)
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        if !self.closed {
            self.closed = true;
            self.state.lock().open_inputs.remove(&self.serial);
        }
        Ok(())
    }
}

impl Drop for MockInputHandle {
    fn drop(&mut self) {
        let _ = InputHandle::close(self);
    }
}

struct MockOutputHandle {
    state: Arc<Mutex<MockState>>,
    serial: u64,
    name: String,
    closed: bool,
}

impl MockOutputHandle {
    fn record(&mut self, long: bool, data: &[u8]) -> Result<(), DeviceError> {
        if self.closed {
            return Err(DeviceError::other("output handle is closed"));
        }
        let mut state = self.state.lock();
        if !state.output_plugged(self.serial) {
            return Err(DeviceError::other("output device was removed"));
        }
        if state.failing_outputs.contains(&self.name) {
            return Err(DeviceError::other(format!("send to '{}' failed", self.name)));
        }
        state.sent.entry(self.name.clone()).or_default().push(MockSend {
            long,
            data: data.to_vec(),
        });
        Ok(())
    }
}

impl OutputHandle for MockOutputHandle {
    fn send_short(&mut self, data: &[u8]) -> Result<(), DeviceError> {
        self.record(false, data)
    }

    fn send_long(&mut self, data: &[u8]) -> Result<(), DeviceError> {
        self.record(true, data)
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        if !self.closed {
            self.closed = true;
            let mut state = self.state.lock();
            if let Some(count) = state.open_outputs.get_mut(&self.name) {
                *count = count.saturating_sub(1);
            }
            *state.output_closes.entry(self.name.clone()).or_insert(0) += 1;
        }
        Ok(())
    }
}

impl Drop for MockOutputHandle {
    fn drop(&mut self) {
        let _ = OutputHandle::close(self);
    }
}
