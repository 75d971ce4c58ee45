//! Echo unit: one open input fanned out to a set of output targets
//!
//! The unit owns its input handle and a target table shared with two other
//! actors: the device callback (fan-out, any thread) and the focus listener
//! thread (focus-mute updates). The table sits behind one per-unit mutex.
//! Fan-out holds it only to snapshot which handles pass the send gate; the
//! sends themselves run after the lock is released.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::device::{DeviceId, DeviceSubsystem, InputCallback, InputHandle, OutputHandle, PortKind};
use crate::error::{DeviceError, EchoError};
use crate::focus::{focus_muted, FocusRegistry};
use crate::midi::{format_hex, status_label, EventShape};

type SharedOutput = Arc<Mutex<Box<dyn OutputHandle>>>;

/// Per-unit target table, shared with the focus tracker through a weak ref
pub(crate) type SharedTargets = Arc<Mutex<TargetTable>>;

/// One failed forward, reported once per affected target per event
#[derive(Debug, Clone)]
pub struct SendFailure {
    pub unit: String,
    pub target: DeviceId,
    pub shape: EventShape,
    pub error: String,
}

/// Observer for per-target send failures on the fan-out path
pub type SendFailureCallback = Arc<dyn Fn(&SendFailure) + Send + Sync>;

struct Target {
    handle: SharedOutput,
    user_muted: bool,
    focus_muted: bool,
    focus_mute_rule: String,
}

impl Target {
    fn passes_gate(&self) -> bool {
        !self.user_muted && !self.focus_muted
    }
}

/// Read-only view of one attached target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetState {
    pub user_muted: bool,
    pub focus_muted: bool,
    pub focus_mute_rule: String,
}

impl TargetState {
    /// Whether events are currently forwarded to this target
    pub fn sends(&self) -> bool {
        !self.user_muted && !self.focus_muted
    }
}

#[derive(Default)]
pub(crate) struct TargetTable {
    targets: BTreeMap<DeviceId, Target>,
}

impl TargetTable {
    /// Recompute focus mute for every target with a rule.
    ///
    /// Returns the number of targets whose state changed.
    pub(crate) fn apply_foreground(&mut self, unit: &str, executable: &str) -> usize {
        let mut changed = 0;
        for (id, target) in self.targets.iter_mut() {
            if target.focus_mute_rule.is_empty() {
                continue;
            }
            let muted = focus_muted(&target.focus_mute_rule, executable);
            if muted != target.focus_muted {
                target.focus_muted = muted;
                changed += 1;
                debug!(
                    "'{}' -> output {}: focus {} (rule '{}')",
                    unit,
                    id,
                    if muted { "muted" } else { "unmuted" },
                    target.focus_mute_rule
                );
            }
        }
        changed
    }

    fn recipients(&self) -> Vec<(DeviceId, SharedOutput)> {
        self.targets
            .iter()
            .filter(|(_, t)| t.passes_gate())
            .map(|(id, t)| (*id, t.handle.clone()))
            .collect()
    }
}

/// Forward one event to every target passing the send gate.
///
/// A failing target is logged and reported but does not stop delivery to
/// the others. Returns the number of targets that accepted the event.
fn fan_out(
    targets: &SharedTargets,
    unit: &str,
    data: &[u8],
    on_failure: Option<&SendFailureCallback>,
) -> usize {
    let Some(shape) = EventShape::classify(data) else {
        return 0;
    };

    let recipients = targets.lock().recipients();
    trace!(
        "'{}' {} [{}] -> {} target(s)",
        unit,
        status_label(data),
        format_hex(data),
        recipients.len()
    );

    let mut delivered = 0;
    for (id, handle) in recipients {
        let result = {
            let mut handle = handle.lock();
            match shape {
                EventShape::Short => handle.send_short(data),
                EventShape::Long => handle.send_long(data),
            }
        };
        match result {
            Ok(()) => delivered += 1,
            Err(e) => {
                warn!("'{}' failed to forward to output {}: {}", unit, id, e);
                if let Some(callback) = on_failure {
                    callback(&SendFailure {
                        unit: unit.to_string(),
                        target: id,
                        shape,
                        error: e.to_string(),
                    });
                }
            },
        }
    }
    delivered
}

struct OpenInput {
    id: DeviceId,
    handle: Box<dyn InputHandle>,
}

/// Echo of one input device into its targets.
///
/// Lifecycle: `open` → `start` → `stop` → `close`. Targets can be added and
/// removed at any point; they survive `stop`/`close` until removed or until
/// [`EchoUnit::teardown`].
pub struct EchoUnit {
    name: String,
    subsystem: Arc<dyn DeviceSubsystem>,
    focus: FocusRegistry,
    registration: u64,
    input: Option<OpenInput>,
    echoing: bool,
    targets: SharedTargets,
    on_send_failure: Option<SendFailureCallback>,
}

impl EchoUnit {
    /// Create a closed unit for the input named `name` and register it for
    /// focus updates.
    pub fn new(name: impl Into<String>, subsystem: Arc<dyn DeviceSubsystem>, focus: &FocusRegistry) -> Self {
        let name = name.into();
        let targets: SharedTargets = Arc::new(Mutex::new(TargetTable::default()));
        let registration = focus.register(&name, &targets);
        Self {
            name,
            subsystem,
            focus: focus.clone(),
            registration,
            input: None,
            echoing: false,
            targets,
            on_send_failure: None,
        }
    }

    /// Report per-target send failures to `callback`.
    ///
    /// Takes effect on the next [`EchoUnit::open`].
    pub fn set_send_failure_callback(&mut self, callback: SendFailureCallback) {
        self.on_send_failure = Some(callback);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_open(&self) -> bool {
        self.input.is_some()
    }

    pub fn is_echoing(&self) -> bool {
        self.echoing
    }

    /// Id the input is currently open under
    pub fn input_id(&self) -> Option<DeviceId> {
        self.input.as_ref().map(|i| i.id)
    }

    /// Bind to the hardware input `id`. Events are not forwarded until
    /// [`EchoUnit::start`].
    pub fn open(&mut self, id: DeviceId) -> Result<(), EchoError> {
        if let Some(input) = &self.input {
            return Err(EchoError::precondition(format!(
                "'{}' is already open on input {}",
                self.name, input.id
            )));
        }

        let targets = self.targets.clone();
        let unit = self.name.clone();
        let on_failure = self.on_send_failure.clone();
        let callback: InputCallback = Arc::new(move |data: &[u8]| {
            fan_out(&targets, &unit, data, on_failure.as_ref());
        });

        let handle = self
            .subsystem
            .open_input(id, callback)
            .map_err(|e| EchoError::from_device(PortKind::Input, id, "open", e))?;
        debug!("Echo IN opened: '{}' (id {})", self.name, id);
        self.input = Some(OpenInput { id, handle });
        Ok(())
    }

    /// Release the input handle. Must be stopped first.
    pub fn close(&mut self) -> Result<(), EchoError> {
        if self.echoing {
            return Err(EchoError::precondition(format!(
                "'{}' must be stopped before it is closed",
                self.name
            )));
        }
        let Some(mut input) = self.input.take() else {
            return Ok(());
        };
        input
            .handle
            .close()
            .map_err(|e| EchoError::from_device(PortKind::Input, input.id, "close", e))?;
        debug!("Echo IN closed: '{}' (id {})", self.name, input.id);
        Ok(())
    }

    /// Start forwarding events
    pub fn start(&mut self) -> Result<(), EchoError> {
        let input = self.open_input("start")?;
        let id = input.id;
        input
            .handle
            .start()
            .map_err(|e| EchoError::from_device(PortKind::Input, id, "start", e))?;
        self.echoing = true;
        debug!("Echo started: '{}'", self.name);
        Ok(())
    }

    /// Stop forwarding events
    pub fn stop(&mut self) -> Result<(), EchoError> {
        let input = self.open_input("stop")?;
        let id = input.id;
        input
            .handle
            .stop()
            .map_err(|e| EchoError::from_device(PortKind::Input, id, "stop", e))?;
        self.echoing = false;
        debug!("Echo stopped: '{}'", self.name);
        Ok(())
    }

    fn open_input(&mut self, operation: &str) -> Result<&mut OpenInput, EchoError> {
        let name = &self.name;
        self.input
            .as_mut()
            .ok_or_else(|| EchoError::precondition(format!("{} on '{}' while closed", operation, name)))
    }

    /// Open output `id` and attach it with both mutes cleared.
    ///
    /// `Ok(false)` when the target is already attached. On an open failure
    /// nothing is inserted.
    pub fn add_target(&mut self, id: DeviceId) -> Result<bool, EchoError> {
        if self.targets.lock().targets.contains_key(&id) {
            return Ok(false);
        }

        let handle = self
            .subsystem
            .open_output(id)
            .map_err(|e| EchoError::from_device(PortKind::Output, id, "open", e))?;

        let mut table = self.targets.lock();
        if table.targets.contains_key(&id) {
            drop(table);
            let mut handle = handle;
            if let Err(e) = handle.close() {
                debug!("'{}': closing duplicate handle for output {}: {}", self.name, id, e);
            }
            return Ok(false);
        }
        table.targets.insert(
            id,
            Target {
                handle: Arc::new(Mutex::new(handle)),
                user_muted: false,
                focus_muted: false,
                focus_mute_rule: String::new(),
            },
        );
        drop(table);
        debug!("'{}' -> output {} attached", self.name, id);
        Ok(true)
    }

    /// Detach and close target `id`. No-op when it is not attached.
    pub fn remove_target(&mut self, id: DeviceId) -> Result<(), EchoError> {
        let removed = self.targets.lock().targets.remove(&id);
        let Some(target) = removed else {
            return Ok(());
        };
        debug!("'{}' -> output {} detached", self.name, id);
        release(target)
            .map_err(|e| EchoError::from_device(PortKind::Output, id, "close", e))
    }

    pub fn set_mute(&mut self, id: DeviceId, muted: bool) -> Result<(), EchoError> {
        let mut table = self.targets.lock();
        let target = table
            .targets
            .get_mut(&id)
            .ok_or_else(|| self.missing_target(id))?;
        target.user_muted = muted;
        trace!("'{}' -> output {}: user_muted={}", self.name, id, muted);
        Ok(())
    }

    /// Replace the focus-mute rule of target `id`.
    ///
    /// The focus-mute state is re-evaluated against the last known
    /// foreground executable; an empty rule always clears it.
    pub fn set_focus_mute_rule(&mut self, id: DeviceId, rule: &str) -> Result<(), EchoError> {
        let foreground = self.focus.foreground();
        let mut table = self.targets.lock();
        let target = table
            .targets
            .get_mut(&id)
            .ok_or_else(|| self.missing_target(id))?;
        target.focus_mute_rule = rule.trim().to_string();
        target.focus_muted = match &foreground {
            Some(exe) => focus_muted(&target.focus_mute_rule, exe),
            None => false,
        };
        trace!(
            "'{}' -> output {}: focus rule '{}' (focus_muted={})",
            self.name,
            id,
            target.focus_mute_rule,
            target.focus_muted
        );
        Ok(())
    }

    fn missing_target(&self, id: DeviceId) -> EchoError {
        EchoError::precondition(format!("output {} is not a target of '{}'", id, self.name))
    }

    pub fn has_target(&self, id: DeviceId) -> bool {
        self.targets.lock().targets.contains_key(&id)
    }

    /// Ids of attached targets, ascending
    pub fn target_ids(&self) -> Vec<DeviceId> {
        self.targets.lock().targets.keys().copied().collect()
    }

    pub fn target_state(&self, id: DeviceId) -> Option<TargetState> {
        self.targets.lock().targets.get(&id).map(|t| TargetState {
            user_muted: t.user_muted,
            focus_muted: t.focus_muted,
            focus_mute_rule: t.focus_mute_rule.clone(),
        })
    }

    /// Stop, close, then release every target.
    ///
    /// Runs every step even when an earlier one fails and returns all
    /// failures. Each target handle is released exactly once.
    pub fn teardown(&mut self) -> Vec<EchoError> {
        let mut errors = Vec::new();

        if self.echoing {
            if let Err(e) = self.stop() {
                errors.push(e);
                // The handle is going away regardless
                self.echoing = false;
            }
        }
        if let Err(e) = self.close() {
            errors.push(e);
        }
        self.input = None;

        let targets = std::mem::take(&mut self.targets.lock().targets);
        for (id, target) in targets {
            if let Err(e) = release(target) {
                errors.push(EchoError::from_device(PortKind::Output, id, "close", e));
            }
        }

        errors
    }
}

fn release(target: Target) -> Result<(), DeviceError> {
    // The guard borrows `target` and must be dropped before it
    let mut handle = target.handle.lock();
    handle.close()
}

impl Drop for EchoUnit {
    fn drop(&mut self) {
        for e in self.teardown() {
            warn!("Teardown of '{}': {}", self.name, e);
        }
        self.focus.unregister(self.registration);
    }
}
