//! Process-scoped engine context
//!
//! Built once at startup and passed by handle to everything that needs the
//! device subsystem or the focus tracker. Nothing in the engine lives in a
//! global: tests build as many independent contexts as they like.

use std::sync::Arc;

use tracing::info;

use crate::device::DeviceSubsystem;
use crate::focus::{FocusError, FocusSource, FocusTracker};
use crate::registry::Registry;

pub struct EchoContext {
    subsystem: Arc<dyn DeviceSubsystem>,
    focus: FocusTracker,
}

impl EchoContext {
    pub fn new(subsystem: Arc<dyn DeviceSubsystem>) -> Self {
        Self {
            subsystem,
            focus: FocusTracker::new(),
        }
    }

    /// Start focus tracking on `source`. `None` runs without it.
    pub fn init(&mut self, source: Option<Box<dyn FocusSource>>) -> Result<(), FocusError> {
        match source {
            Some(source) => self.focus.init(source),
            None => {
                info!("Focus tracking disabled");
                Ok(())
            },
        }
    }

    /// A fresh, empty registry bound to this context
    pub fn registry(&self) -> Registry {
        Registry::new(self.subsystem.clone(), self.focus.registry())
    }

    pub fn subsystem(&self) -> Arc<dyn DeviceSubsystem> {
        self.subsystem.clone()
    }

    pub fn focus(&self) -> &FocusTracker {
        &self.focus
    }

    /// Stop focus tracking. Idempotent.
    pub fn shutdown(&mut self) {
        self.focus.cleanup();
    }
}

impl Drop for EchoContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::mock::MockSubsystem;
    use crate::focus::mock::ChannelFocusSource;

    #[test]
    fn test_init_and_shutdown() {
        let mut ctx = EchoContext::new(Arc::new(MockSubsystem::new()));
        let (source, injector) = ChannelFocusSource::new();
        ctx.init(Some(Box::new(source))).unwrap();
        assert!(ctx.focus().is_active());

        ctx.shutdown();
        assert!(!ctx.focus().is_active());
        assert!(injector.is_stopped());
    }

    #[test]
    fn test_init_without_source() {
        let mut ctx = EchoContext::new(Arc::new(MockSubsystem::new()));
        ctx.init(None).unwrap();
        assert!(!ctx.focus().is_active());
    }

    #[test]
    fn test_failing_source_leaves_tracker_inactive() {
        let mut ctx = EchoContext::new(Arc::new(MockSubsystem::new()));
        let result = ctx.init(Some(Box::new(ChannelFocusSource::failing())));
        assert!(matches!(result, Err(FocusError::HookInstall(_))));
        assert!(!ctx.focus().is_active());
    }

    #[test]
    fn test_registries_share_focus_registration() {
        let mock = MockSubsystem::with_devices(&["A", "B"], &[]);
        let ctx = EchoContext::new(Arc::new(mock));
        let mut registry = ctx.registry();
        registry.reconcile();
        // One unit per available input
        assert_eq!(ctx.focus().registry().len(), 2);
        drop(registry);
        assert!(ctx.focus().registry().is_empty());
    }
}
