//! Focus tracker: listener thread plus the registration list of echo units
//!
//! The tracker never owns echo units. Units register a weak reference to
//! their target table on construction and unregister on drop; each
//! foreground change recomputes `focus_muted` on every registered target.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, trace, warn};

use super::{FocusError, FocusEvent, FocusSource, StopFn};
use crate::echo::{SharedTargets, TargetTable};

struct Registration {
    unit: String,
    targets: Weak<Mutex<TargetTable>>,
}

/// Cloneable, non-owning list of echo units interested in focus changes
#[derive(Clone, Default)]
pub struct FocusRegistry {
    units: Arc<DashMap<u64, Registration>>,
    next_id: Arc<AtomicU64>,
    foreground: Arc<RwLock<Option<String>>>,
}

impl FocusRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called by echo unit construction only
    pub(crate) fn register(&self, unit: &str, targets: &SharedTargets) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.units.insert(
            id,
            Registration {
                unit: unit.to_string(),
                targets: Arc::downgrade(targets),
            },
        );
        trace!("Focus registration #{} for '{}'", id, unit);
        id
    }

    /// Called by echo unit destruction only
    pub(crate) fn unregister(&self, id: u64) {
        if let Some((_, reg)) = self.units.remove(&id) {
            trace!("Focus unregistration #{} for '{}'", id, reg.unit);
        }
    }

    /// Number of registered units
    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Executable of the last resolved foreground window
    pub fn foreground(&self) -> Option<String> {
        self.foreground.read().clone()
    }

    /// Apply one foreground change to every registered unit.
    ///
    /// Returns how many targets changed their focus-mute state.
    pub fn apply(&self, event: &FocusEvent) -> usize {
        let executable = match event {
            FocusEvent::Foreground { executable } if !executable.is_empty() => executable,
            _ => {
                trace!("Ignoring unresolved foreground change");
                return 0;
            },
        };
        *self.foreground.write() = Some(executable.clone());

        let mut changed = 0;
        let mut dead = Vec::new();
        for entry in self.units.iter() {
            match entry.targets.upgrade() {
                Some(targets) => {
                    changed += targets.lock().apply_foreground(&entry.unit, executable);
                },
                None => dead.push(*entry.key()),
            }
        }
        // Removing while iterating a DashMap would deadlock on the shard lock
        for id in dead {
            self.units.remove(&id);
        }

        debug!(
            "Foreground is now '{}' ({} target(s) changed)",
            executable, changed
        );
        changed
    }
}

struct ActiveListener {
    source: String,
    shutdown: Sender<()>,
    thread: JoinHandle<()>,
    stop_source: Option<StopFn>,
}

enum TrackerState {
    Inactive,
    Active(ActiveListener),
}

/// Owns the focus listener thread.
///
/// `init` moves it from inactive to active, `cleanup` back. Registration
/// goes through [`FocusRegistry`], which outlives listener restarts.
pub struct FocusTracker {
    registry: FocusRegistry,
    state: TrackerState,
    processed: Arc<AtomicU64>,
}

impl FocusTracker {
    pub fn new() -> Self {
        Self {
            registry: FocusRegistry::new(),
            state: TrackerState::Inactive,
            processed: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Handle given to echo units for registration
    pub fn registry(&self) -> FocusRegistry {
        self.registry.clone()
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, TrackerState::Active(_))
    }

    /// Number of events the listener thread has dispatched so far
    pub fn events_processed(&self) -> u64 {
        self.processed.load(Ordering::Acquire)
    }

    /// Start listening to `source` on a dedicated thread
    pub fn init(&mut self, source: Box<dyn FocusSource>) -> Result<(), FocusError> {
        if self.is_active() {
            return Err(FocusError::AlreadyActive);
        }

        let source_name = source.name().to_string();
        let (events, stop_source) = source.listen()?.into_parts();
        let (shutdown_tx, shutdown_rx) = channel::bounded::<()>(1);

        let registry = self.registry.clone();
        let processed = self.processed.clone();
        let spawned = thread::Builder::new()
            .name("echo-midi-focus".to_string())
            .spawn(move || listen_loop(events, shutdown_rx, registry, processed));

        let thread = match spawned {
            Ok(thread) => thread,
            Err(e) => {
                if let Some(stop) = stop_source {
                    stop();
                }
                return Err(FocusError::Spawn(e));
            },
        };

        info!("Focus tracking active ({})", source_name);
        self.state = TrackerState::Active(ActiveListener {
            source: source_name,
            shutdown: shutdown_tx,
            thread,
            stop_source,
        });
        Ok(())
    }

    /// Signal the listener thread, wait for it, and tear the source down.
    /// No-op when inactive.
    pub fn cleanup(&mut self) {
        let TrackerState::Active(listener) = std::mem::replace(&mut self.state, TrackerState::Inactive)
        else {
            return;
        };

        // The receiver may already be gone if the source closed first
        let _ = listener.shutdown.send(());
        if listener.thread.join().is_err() {
            warn!("Focus listener thread panicked");
        }
        if let Some(stop) = listener.stop_source {
            stop();
        }
        info!("Focus tracking stopped ({})", listener.source);
    }
}

impl Default for FocusTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for FocusTracker {
    fn drop(&mut self) {
        self.cleanup();
    }
}

fn listen_loop(
    events: Receiver<FocusEvent>,
    shutdown: Receiver<()>,
    registry: FocusRegistry,
    processed: Arc<AtomicU64>,
) {
    loop {
        crossbeam::select! {
            recv(events) -> event => match event {
                Ok(event) => {
                    registry.apply(&event);
                    processed.fetch_add(1, Ordering::Release);
                },
                Err(_) => {
                    debug!("Focus source closed its event stream");
                    break;
                },
            },
            recv(shutdown) -> _ => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::focus::mock::ChannelFocusSource;

    #[test]
    fn test_init_and_cleanup_transitions() {
        let mut tracker = FocusTracker::new();
        assert!(!tracker.is_active());

        let (source, _injector) = ChannelFocusSource::new();
        tracker.init(Box::new(source)).unwrap();
        assert!(tracker.is_active());

        let (second, _other) = ChannelFocusSource::new();
        assert!(matches!(
            tracker.init(Box::new(second)),
            Err(FocusError::AlreadyActive)
        ));

        tracker.cleanup();
        assert!(!tracker.is_active());
        // Idempotent
        tracker.cleanup();
    }

    #[test]
    fn test_cleanup_stops_source() {
        let mut tracker = FocusTracker::new();
        let (source, injector) = ChannelFocusSource::new();
        tracker.init(Box::new(source)).unwrap();
        assert!(!injector.is_stopped());
        tracker.cleanup();
        assert!(injector.is_stopped());
    }

    #[test]
    fn test_listener_dispatches_events() {
        let mut tracker = FocusTracker::new();
        let registry = tracker.registry();
        let (source, injector) = ChannelFocusSource::new();
        tracker.init(Box::new(source)).unwrap();

        injector.send(FocusEvent::foreground(r"C:\Windows\notepad.exe"));
        injector.send(FocusEvent::Unresolved);
        injector.wait_for(&tracker, 2);

        assert_eq!(
            registry.foreground().as_deref(),
            Some(r"C:\Windows\notepad.exe")
        );
        tracker.cleanup();
    }

    #[test]
    fn test_unresolved_keeps_last_foreground() {
        let registry = FocusRegistry::new();
        registry.apply(&FocusEvent::foreground("/usr/bin/ardour8"));
        assert_eq!(registry.apply(&FocusEvent::Unresolved), 0);
        assert_eq!(registry.foreground().as_deref(), Some("/usr/bin/ardour8"));
    }
}
