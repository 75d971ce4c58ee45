//! EchoMIDI
//!
//! Routes events from MIDI input devices to any number of MIDI outputs.
//! Each input with echo enabled gets an [`echo::EchoUnit`] that fans its
//! events out to attached targets; the [`registry::Registry`] keeps the
//! named device model in sync with the plugged-in hardware; the
//! [`focus::FocusTracker`] mutes targets while their application is not in
//! the foreground.

pub mod cli;
pub mod config;
pub mod context;
pub mod device;
pub mod echo;
pub mod error;
pub mod focus;
pub mod midi;
pub mod paths;
pub mod persistence;
pub mod registry;
pub mod watcher;

pub use context::EchoContext;
pub use error::{DeviceError, DeviceErrorKind, EchoError};
pub use registry::Registry;
