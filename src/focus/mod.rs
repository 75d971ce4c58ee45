//! Focus mute
//!
//! Targets can carry a focus-mute rule: the name or full path of an
//! executable. While some other application owns the foreground window, the
//! target is muted. The OS notification source sits behind [`FocusSource`]
//! so the [`FocusTracker`] can be driven by a synthetic source in tests.

use crossbeam::channel::Receiver;

pub mod mock;
pub mod rule;
pub mod tracker;

#[cfg(target_os = "windows")]
pub mod windows;

pub use rule::{focus_muted, rule_matches};
pub use tracker::{FocusRegistry, FocusTracker};

/// A foreground change reported by a [`FocusSource`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FocusEvent {
    /// The foreground window belongs to this executable
    Foreground { executable: String },
    /// The foreground changed but its executable could not be resolved
    /// (usually access denied). Carries no information.
    Unresolved,
}

impl FocusEvent {
    pub fn foreground(executable: impl Into<String>) -> Self {
        FocusEvent::Foreground {
            executable: executable.into(),
        }
    }
}

/// Errors from the focus tracker lifecycle
#[derive(Debug, thiserror::Error)]
pub enum FocusError {
    #[error("focus tracker is already active")]
    AlreadyActive,

    #[error("failed to install focus hook: {0}")]
    HookInstall(String),

    #[error("failed to spawn focus listener thread")]
    Spawn(#[source] std::io::Error),

    #[error("focus tracking is not supported on this platform")]
    Unsupported,
}

type StopFn = Box<dyn FnOnce() + Send>;

/// Live subscription to a focus source.
///
/// `events` yields foreground changes until the source stops; `stop` tears
/// the OS listener down and must return only once it is gone.
pub struct FocusStream {
    events: Receiver<FocusEvent>,
    stop: Option<StopFn>,
}

impl FocusStream {
    pub fn new(events: Receiver<FocusEvent>, stop: impl FnOnce() + Send + 'static) -> Self {
        Self {
            events,
            stop: Some(Box::new(stop)),
        }
    }

    pub(crate) fn into_parts(mut self) -> (Receiver<FocusEvent>, Option<StopFn>) {
        let stop = self.stop.take();
        (self.events.clone(), stop)
    }
}

impl Drop for FocusStream {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            stop();
        }
    }
}

/// Producer of foreground-change notifications
pub trait FocusSource: Send {
    /// Short name for logs
    fn name(&self) -> &str;

    /// Install the listener and start producing events
    fn listen(self: Box<Self>) -> Result<FocusStream, FocusError>;
}

/// The OS focus source for this platform, if there is one
pub fn platform_source() -> Option<Box<dyn FocusSource>> {
    #[cfg(target_os = "windows")]
    {
        Some(Box::new(windows::WinEventFocusSource::new()))
    }
    #[cfg(not(target_os = "windows"))]
    {
        None
    }
}
