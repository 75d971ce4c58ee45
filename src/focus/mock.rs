//! Channel-backed focus source for tests.
//!
//! Lets tests inject synthetic [`FocusEvent`]s without an OS window hook.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender};

use super::{FocusError, FocusEvent, FocusSource, FocusStream, FocusTracker};

/// A [`FocusSource`] fed by a [`FocusInjector`]
pub struct ChannelFocusSource {
    events: Receiver<FocusEvent>,
    stopped: Arc<AtomicBool>,
    fail_install: bool,
}

/// Test-side handle of a [`ChannelFocusSource`]
#[derive(Clone)]
pub struct FocusInjector {
    sender: Sender<FocusEvent>,
    stopped: Arc<AtomicBool>,
}

impl ChannelFocusSource {
    pub fn new() -> (Self, FocusInjector) {
        let (sender, events) = channel::unbounded();
        let stopped = Arc::new(AtomicBool::new(false));
        (
            Self {
                events,
                stopped: stopped.clone(),
                fail_install: false,
            },
            FocusInjector { sender, stopped },
        )
    }

    /// A source whose hook installation always fails
    pub fn failing() -> Self {
        let (source, _) = Self::new();
        Self {
            fail_install: true,
            ..source
        }
    }
}

impl FocusSource for ChannelFocusSource {
    fn name(&self) -> &str {
        "channel"
    }

    fn listen(self: Box<Self>) -> Result<FocusStream, FocusError> {
        if self.fail_install {
            return Err(FocusError::HookInstall("synthetic failure".to_string()));
        }
        let stopped = self.stopped.clone();
        Ok(FocusStream::new(self.events, move || {
            stopped.store(true, Ordering::SeqCst);
        }))
    }
}

impl FocusInjector {
    /// Queue an event as if the OS reported it.
    ///
    /// Panics if the source was dropped without being listened to.
    pub fn send(&self, event: FocusEvent) {
        self.sender
            .send(event)
            .expect("focus source receiver has been dropped");
    }

    /// Shorthand for a resolved foreground change
    pub fn focus(&self, executable: &str) {
        self.send(FocusEvent::foreground(executable));
    }

    /// Has the stream's stop hook run?
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Block until `tracker` has dispatched at least `count` events.
    ///
    /// Panics after two seconds.
    pub fn wait_for(&self, tracker: &FocusTracker, count: u64) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while tracker.events_processed() < count {
            assert!(
                Instant::now() < deadline,
                "focus tracker processed {} of {} events",
                tracker.events_processed(),
                count
            );
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_receives_injected_events() {
        let (source, injector) = ChannelFocusSource::new();
        let stream = Box::new(source).listen().unwrap();

        injector.focus("/usr/bin/ardour8");
        let (events, _stop) = stream.into_parts();
        assert_eq!(
            events.recv().unwrap(),
            FocusEvent::foreground("/usr/bin/ardour8")
        );
    }

    #[test]
    fn test_dropping_stream_runs_stop() {
        let (source, injector) = ChannelFocusSource::new();
        let stream = Box::new(source).listen().unwrap();
        assert!(!injector.is_stopped());
        drop(stream);
        assert!(injector.is_stopped());
    }

    #[test]
    fn test_failing_source() {
        let source = ChannelFocusSource::failing();
        assert!(matches!(
            Box::new(source).listen(),
            Err(FocusError::HookInstall(_))
        ));
    }
}
