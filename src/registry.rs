//! Device registry and reconciler
//!
//! Holds the logical model of every input and output ever seen, keyed by
//! device name, and converges it onto the live hardware inventory. Names are
//! the only stable identity; ids are refreshed on every pass.
//!
//! The registry owns one [`EchoUnit`] per available input. Whether an output
//! is attached to that unit is decided in exactly one place, the target-attach
//! gate (`Registry::attach`), re-run after any change to availability, mute
//! records or configured targets.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::device::{DeviceId, DeviceSubsystem, Inventory};
use crate::echo::{EchoUnit, SendFailureCallback, TargetState};
use crate::error::EchoError;
use crate::focus::FocusRegistry;

struct InputRecord {
    available: bool,
    echo_enabled: bool,
    id: Option<DeviceId>,
    /// Present exactly while the input is available
    unit: Option<EchoUnit>,
}

impl InputRecord {
    fn unavailable() -> Self {
        Self {
            available: false,
            echo_enabled: false,
            id: None,
            unit: None,
        }
    }
}

#[derive(Default)]
struct OutputRecord {
    available: bool,
    id: Option<DeviceId>,
    /// input name → muted by user. A missing entry counts as muted.
    mute: BTreeMap<String, bool>,
    /// input name → focus-mute rule
    focus_rules: BTreeMap<String, String>,
}

/// Read-only view of an input record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputStatus {
    pub name: String,
    pub id: Option<DeviceId>,
    pub available: bool,
    pub echo_enabled: bool,
    pub echoing: bool,
    /// Output ids attached to the input's echo unit
    pub targets: Vec<DeviceId>,
}

/// Read-only view of an output record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputStatus {
    pub name: String,
    pub id: Option<DeviceId>,
    pub available: bool,
    pub mute: BTreeMap<String, bool>,
    pub focus_rules: BTreeMap<String, String>,
}

/// Handle-free routing state, comparable across registries
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingState {
    /// input name → (available, echo enabled)
    pub inputs: BTreeMap<String, (bool, bool)>,
    /// output name → availability
    pub outputs: BTreeMap<String, bool>,
    /// (output, input) → muted by user, for every recorded pair
    pub mute: BTreeMap<(String, String), bool>,
    /// (output, input) → rule, for every non-empty rule
    pub focus_rules: BTreeMap<(String, String), String>,
}

/// What one reconciliation pass changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub inputs_added: Vec<String>,
    pub inputs_returned: Vec<String>,
    pub inputs_lost: Vec<String>,
    pub outputs_added: Vec<String>,
    pub outputs_returned: Vec<String>,
    pub outputs_lost: Vec<String>,
    /// Available devices that came back under a different id
    pub renumbered: Vec<String>,
    /// Records downgraded to unavailable after a device error
    pub degraded: Vec<String>,
    /// Targets attached during the pass
    pub attached: usize,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        *self == ReconcileReport::default()
    }
}

impl fmt::Display for ReconcileReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "inputs +{} ~{} -{}, outputs +{} ~{} -{}, {} renumbered, {} target(s) attached, {} degraded",
            self.inputs_added.len(),
            self.inputs_returned.len(),
            self.inputs_lost.len(),
            self.outputs_added.len(),
            self.outputs_returned.len(),
            self.outputs_lost.len(),
            self.renumbered.len(),
            self.attached,
            self.degraded.len()
        )
    }
}

/// Logical model of all known devices and their routing
pub struct Registry {
    subsystem: Arc<dyn DeviceSubsystem>,
    focus: FocusRegistry,
    on_send_failure: Option<SendFailureCallback>,
    inputs: BTreeMap<String, InputRecord>,
    outputs: BTreeMap<String, OutputRecord>,
}

impl Registry {
    pub fn new(subsystem: Arc<dyn DeviceSubsystem>, focus: FocusRegistry) -> Self {
        Self {
            subsystem,
            focus,
            on_send_failure: None,
            inputs: BTreeMap::new(),
            outputs: BTreeMap::new(),
        }
    }

    /// Report fan-out send failures of units created from now on
    pub fn set_send_failure_callback(&mut self, callback: SendFailureCallback) {
        self.on_send_failure = Some(callback);
    }

    fn spawn_unit(&self, name: &str) -> EchoUnit {
        let mut unit = EchoUnit::new(name, self.subsystem.clone(), &self.focus);
        if let Some(callback) = &self.on_send_failure {
            unit.set_send_failure_callback(callback.clone());
        }
        unit
    }

    // ---- queries ----

    pub fn inputs(&self) -> Vec<InputStatus> {
        self.inputs
            .iter()
            .map(|(name, record)| input_status(name, record))
            .collect()
    }

    pub fn outputs(&self) -> Vec<OutputStatus> {
        self.outputs
            .iter()
            .map(|(name, record)| output_status(name, record))
            .collect()
    }

    pub fn input(&self, name: &str) -> Option<InputStatus> {
        self.inputs.get(name).map(|r| input_status(name, r))
    }

    pub fn output(&self, name: &str) -> Option<OutputStatus> {
        self.outputs.get(name).map(|r| output_status(name, r))
    }

    /// Recorded user mute for the pair; unrecorded pairs are muted
    pub fn is_muted(&self, output: &str, input: &str) -> bool {
        self.outputs
            .get(output)
            .and_then(|r| r.mute.get(input).copied())
            .unwrap_or(true)
    }

    pub fn focus_rule(&self, output: &str, input: &str) -> &str {
        self.outputs
            .get(output)
            .and_then(|r| r.focus_rules.get(input))
            .map(String::as_str)
            .unwrap_or("")
    }

    /// Live target state of `output` in the echo unit of `input`
    pub fn target_state(&self, output: &str, input: &str) -> Option<TargetState> {
        let out_id = self.outputs.get(output).filter(|r| r.available)?.id?;
        self.inputs.get(input)?.unit.as_ref()?.target_state(out_id)
    }

    /// Effective send gate for the pair
    pub fn sends(&self, output: &str, input: &str) -> bool {
        self.target_state(output, input).is_some_and(|t| t.sends())
    }

    pub fn routing_state(&self) -> RoutingState {
        let mut state = RoutingState::default();
        for (name, record) in &self.inputs {
            state
                .inputs
                .insert(name.clone(), (record.available, record.echo_enabled));
        }
        for (name, record) in &self.outputs {
            state.outputs.insert(name.clone(), record.available);
            for (input, muted) in &record.mute {
                state.mute.insert((name.clone(), input.clone()), *muted);
            }
            for (input, rule) in record.focus_rules.iter().filter(|(_, r)| !r.is_empty()) {
                state
                    .focus_rules
                    .insert((name.clone(), input.clone()), rule.clone());
            }
        }
        state
    }

    // ---- user-driven mutators ----

    /// Enable or disable echo for `input`.
    ///
    /// A no-op when the value does not change. When the input is available
    /// its unit is opened and started, or stopped and closed, to match.
    /// Unknown inputs are recorded as unavailable.
    pub fn set_echo(&mut self, input: &str, enabled: bool) -> Result<(), EchoError> {
        let record = self
            .inputs
            .entry(input.to_string())
            .or_insert_with(InputRecord::unavailable);
        if record.echo_enabled == enabled {
            return Ok(());
        }
        if !record.available {
            record.echo_enabled = enabled;
            debug!("Echo for unavailable '{}' set to {}", input, enabled);
            return Ok(());
        }

        let (Some(id), Some(unit)) = (record.id, record.unit.as_mut()) else {
            return Err(EchoError::precondition(format!(
                "available input '{}' has no echo unit",
                input
            )));
        };

        let result = if enabled {
            unit.open(id).and_then(|()| {
                unit.start().inspect_err(|_| {
                    if let Err(e) = unit.close() {
                        debug!("Close after failed start of '{}': {}", input, e);
                    }
                })
            })
        } else {
            unit.stop().and_then(|()| unit.close())
        };

        match result {
            Ok(()) => {
                record.echo_enabled = enabled;
                info!("Echo {} for '{}'", if enabled { "enabled" } else { "disabled" }, input);
                Ok(())
            },
            Err(e) if !enabled => {
                // The input is gone or wedged; drop the unit so that the
                // next reconciliation starts from a clean handle.
                record.echo_enabled = false;
                self.degrade_input(input, &e);
                Err(e)
            },
            Err(e) => Err(e),
        }
    }

    /// Record the user mute for (`output`, `input`) and bring the live
    /// target in line. Unmuting attaches the target if needed; muting only
    /// gates it.
    pub fn set_target_mute(&mut self, output: &str, input: &str, muted: bool) -> Result<(), EchoError> {
        self.inputs
            .entry(input.to_string())
            .or_insert_with(InputRecord::unavailable);
        self.outputs
            .entry(output.to_string())
            .or_default()
            .mute
            .insert(input.to_string(), muted);
        self.sync_pair(output, input).map(|_| ())
    }

    /// Record the focus-mute rule for (`output`, `input`); an empty rule
    /// removes focus muting.
    pub fn set_target_focus_rule(&mut self, output: &str, input: &str, rule: &str) -> Result<(), EchoError> {
        self.inputs
            .entry(input.to_string())
            .or_insert_with(InputRecord::unavailable);
        self.outputs
            .entry(output.to_string())
            .or_default()
            .focus_rules
            .insert(input.to_string(), rule.trim().to_string());
        self.sync_pair(output, input).map(|_| ())
    }

    /// Tear every unit down. Records are kept.
    pub fn shutdown(&mut self) {
        for (name, record) in self.inputs.iter_mut() {
            if let Some(mut unit) = record.unit.take() {
                for e in unit.teardown() {
                    warn!("Teardown of '{}': {}", name, e);
                }
            }
        }
        debug!("All echo units torn down");
    }

    // ---- target attach ----

    /// The target-attach gate.
    ///
    /// Attaches `output` to the unit of `input` iff the input is available,
    /// the output is available, a mute record exists for the pair and says
    /// not muted, and the target is not attached yet. Returns whether a
    /// target was attached.
    fn attach(&mut self, output: &str, input: &str) -> Result<bool, EchoError> {
        let Some(in_rec) = self.inputs.get_mut(input) else {
            return Ok(false);
        };
        let Some(out_rec) = self.outputs.get(output) else {
            return Ok(false);
        };
        if !in_rec.available || !out_rec.available {
            return Ok(false);
        }
        if out_rec.mute.get(input) != Some(&false) {
            return Ok(false);
        }
        let (Some(out_id), Some(unit)) = (out_rec.id, in_rec.unit.as_mut()) else {
            return Ok(false);
        };
        if unit.has_target(out_id) || !unit.add_target(out_id)? {
            return Ok(false);
        }

        let rule = out_rec.focus_rules.get(input).map(String::as_str).unwrap_or("");
        unit.set_focus_mute_rule(out_id, rule)?;
        unit.set_mute(out_id, false)?;
        debug!("Attached '{}' -> '{}'", input, output);
        Ok(true)
    }

    /// Attach if the gate allows, then push the pair's recorded mute and
    /// rule into the live target when the unit holds it.
    fn sync_pair(&mut self, output: &str, input: &str) -> Result<bool, EchoError> {
        let attached = self.attach(output, input)?;

        let Some(out_rec) = self.outputs.get(output) else {
            return Ok(attached);
        };
        let Some(out_id) = out_rec.id.filter(|_| out_rec.available) else {
            return Ok(attached);
        };
        let Some(unit) = self.inputs.get_mut(input).and_then(|r| r.unit.as_mut()) else {
            return Ok(attached);
        };
        if unit.has_target(out_id) {
            let muted = out_rec.mute.get(input).copied().unwrap_or(true);
            let rule = out_rec.focus_rules.get(input).map(String::as_str).unwrap_or("");
            unit.set_mute(out_id, muted)?;
            unit.set_focus_mute_rule(out_id, rule)?;
        }
        Ok(attached)
    }

    // ---- reconciliation ----

    /// Converge the logical model onto the live device inventory.
    ///
    /// Device errors never escape: the affected record is downgraded to
    /// unavailable and the next pass retries it.
    pub fn reconcile(&mut self) -> ReconcileReport {
        let live = match Inventory::capture(self.subsystem.as_ref()) {
            Ok(live) => live,
            Err(e) => {
                warn!("Device enumeration failed, skipping reconciliation: {}", e);
                return ReconcileReport::default();
            },
        };
        let mut report = ReconcileReport::default();

        // Outputs that vanished or were renumbered leave every unit before
        // anything is attached, so no unit ever holds two outputs under
        // one id.
        let mut rebound = Vec::new();
        for (name, record) in self.outputs.iter_mut() {
            if !record.available {
                continue;
            }
            let live_id = live.outputs.get(name).copied();
            if live_id == record.id {
                continue;
            }
            if let Some(old) = record.id {
                detach_everywhere(&mut self.inputs, old);
            }
            match live_id {
                Some(id) => {
                    debug!("Output '{}' renumbered to {}", name, id);
                    record.id = Some(id);
                    report.renumbered.push(name.clone());
                    rebound.push(name.clone());
                },
                None => {
                    info!("MIDI output disconnected: '{}'", name);
                    record.available = false;
                    record.id = None;
                    report.outputs_lost.push(name.clone());
                },
            }
        }

        // Inputs gone from the live set: drop the unit, keep the config
        for (name, record) in self.inputs.iter_mut() {
            if record.available && !live.inputs.contains_key(name) {
                info!("MIDI input disconnected: '{}'", name);
                record.available = false;
                record.id = None;
                if let Some(mut unit) = record.unit.take() {
                    for e in unit.teardown() {
                        debug!("Teardown of vanished '{}': {}", name, e);
                    }
                }
                report.inputs_lost.push(name.clone());
            }
        }

        let mut appeared = Vec::new();
        for (name, &id) in &live.inputs {
            match self.inputs.get_mut(name) {
                Some(record) if record.available => {
                    if record.id == Some(id) {
                        continue;
                    }
                    // The open handle may belong to a port that was unplugged
                    // and replugged between two passes: rebuild the unit.
                    debug!("Input '{}' renumbered to {}", name, id);
                    record.available = false;
                    record.id = None;
                    if let Some(mut unit) = record.unit.take() {
                        for e in unit.teardown() {
                            debug!("Teardown of renumbered '{}': {}", name, e);
                        }
                    }
                    report.renumbered.push(name.clone());
                    appeared.push((name.clone(), id));
                },
                Some(_) => {
                    info!("MIDI input reconnected: '{}'", name);
                    report.inputs_returned.push(name.clone());
                    appeared.push((name.clone(), id));
                },
                None => {
                    info!("MIDI input discovered: '{}'", name);
                    self.inputs.insert(name.clone(), InputRecord::unavailable());
                    report.inputs_added.push(name.clone());
                    appeared.push((name.clone(), id));
                },
            }
        }

        let mut ready = Vec::new();
        for (name, id) in appeared {
            match self.bring_up_input(&name, id) {
                Ok(()) => ready.push(name),
                Err(e) => {
                    self.degrade_input(&name, &e);
                    report.degraded.push(name);
                },
            }
        }

        let mut returned = Vec::new();
        for (name, &id) in &live.outputs {
            match self.outputs.get_mut(name) {
                Some(record) if record.available => {},
                Some(record) => {
                    info!("MIDI output reconnected: '{}'", name);
                    record.available = true;
                    record.id = Some(id);
                    report.outputs_returned.push(name.clone());
                    returned.push(name.clone());
                },
                None => {
                    info!("MIDI output discovered: '{}'", name);
                    self.outputs.insert(
                        name.clone(),
                        OutputRecord {
                            available: true,
                            id: Some(id),
                            ..Default::default()
                        },
                    );
                    report.outputs_added.push(name.clone());
                },
            }
        }

        // A returning output starts from its persisted configuration, with
        // every pair it has no record for muted.
        let input_names: Vec<String> = self.inputs.keys().cloned().collect();
        for name in &returned {
            if let Some(record) = self.outputs.get_mut(name) {
                for input in &input_names {
                    record.mute.entry(input.clone()).or_insert(true);
                }
            }
        }
        for output in returned.iter().chain(rebound.iter()) {
            for input in &input_names {
                match self.sync_pair(output, input) {
                    Ok(attached) => report.attached += usize::from(attached),
                    Err(e) => {
                        self.degrade_output(output, &e);
                        report.degraded.push(output.clone());
                        break;
                    },
                }
            }
        }

        // Freshly available inputs recover their targets
        let output_names: Vec<String> = self.outputs.keys().cloned().collect();
        for input in &ready {
            for output in &output_names {
                match self.attach(output, input) {
                    Ok(attached) => report.attached += usize::from(attached),
                    Err(e) => {
                        self.degrade_output(output, &e);
                        report.degraded.push(output.clone());
                    },
                }
            }
        }

        if !report.is_empty() {
            info!("Reconciled: {}", report);
        }
        report
    }

    /// Mark an input available under `id` with a fresh unit, opening and
    /// starting it when echo is enabled.
    fn bring_up_input(&mut self, name: &str, id: DeviceId) -> Result<(), EchoError> {
        let unit = self.spawn_unit(name);
        let Some(record) = self.inputs.get_mut(name) else {
            return Ok(());
        };
        record.available = true;
        record.id = Some(id);
        let unit = record.unit.insert(unit);
        if record.echo_enabled {
            unit.open(id)?;
            unit.start()?;
            info!("Echo resumed for '{}'", name);
        }
        Ok(())
    }

    fn degrade_input(&mut self, name: &str, cause: &EchoError) {
        let Some(record) = self.inputs.get_mut(name) else {
            return;
        };
        warn!("Input '{}' marked unavailable: {}", name, cause);
        record.available = false;
        record.id = None;
        if let Some(mut unit) = record.unit.take() {
            for e in unit.teardown() {
                debug!("Teardown of degraded '{}': {}", name, e);
            }
        }
    }

    fn degrade_output(&mut self, name: &str, cause: &EchoError) {
        let Some(record) = self.outputs.get_mut(name) else {
            return;
        };
        warn!("Output '{}' marked unavailable: {}", name, cause);
        record.available = false;
        if let Some(id) = record.id.take() {
            detach_everywhere(&mut self.inputs, id);
        }
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn detach_everywhere(inputs: &mut BTreeMap<String, InputRecord>, output_id: DeviceId) {
    for (name, record) in inputs.iter_mut() {
        let Some(unit) = record.unit.as_mut() else {
            continue;
        };
        if let Err(e) = unit.remove_target(output_id) {
            debug!("Detaching output {} from '{}': {}", output_id, name, e);
        }
    }
}

fn input_status(name: &str, record: &InputRecord) -> InputStatus {
    InputStatus {
        name: name.to_string(),
        id: record.id,
        available: record.available,
        echo_enabled: record.echo_enabled,
        echoing: record.unit.as_ref().is_some_and(|u| u.is_echoing()),
        targets: record
            .unit
            .as_ref()
            .map(|u| u.target_ids())
            .unwrap_or_default(),
    }
}

fn output_status(name: &str, record: &OutputRecord) -> OutputStatus {
    OutputStatus {
        name: name.to_string(),
        id: record.id,
        available: record.available,
        mute: record.mute.clone(),
        focus_rules: record.focus_rules.clone(),
    }
}
