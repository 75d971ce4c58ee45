//! Routing document persistence
//!
//! The routing configuration is stored as JSON:
//!
//! ```json
//! {
//!     "Midi Inputs": [
//!         {
//!             "Name": "Keystation 49",
//!             "Echo": true,
//!             "Midi Outputs": [
//!                 { "Name": "loopMIDI Port A", "Mute": false, "Focus send": "reaper" }
//!             ]
//!         }
//!     ]
//! }
//! ```
//!
//! Loading replays every entry through the registry's public mutators, so a
//! document can be applied before or after the devices are discovered.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::error::EchoError;
use crate::registry::Registry;

/// Whole routing file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingDocument {
    #[serde(rename = "Midi Inputs", default)]
    pub inputs: Vec<InputEntry>,
}

/// One input and the outputs it has routing records for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputEntry {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Echo", default)]
    pub echo: bool,
    #[serde(rename = "Midi Outputs", default)]
    pub outputs: Vec<TargetEntry>,
}

/// Routing of one (output, input) pair. `mute` is absent when the pair has
/// a focus rule but no mute record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetEntry {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Mute", default, skip_serializing_if = "Option::is_none")]
    pub mute: Option<bool>,
    #[serde(rename = "Focus send", default)]
    pub focus_send: String,
}

/// A document entry the registry rejected
#[derive(Debug)]
pub struct ApplyFailure {
    pub input: String,
    pub output: Option<String>,
    pub error: EchoError,
}

impl RoutingDocument {
    /// Capture the registry's routing. Inputs are written in name order and
    /// each lists the outputs holding a mute record or a focus rule for it.
    pub fn from_registry(registry: &Registry) -> Self {
        let outputs = registry.outputs();
        let inputs = registry
            .inputs()
            .into_iter()
            .map(|input| InputEntry {
                outputs: outputs
                    .iter()
                    .filter_map(|out| {
                        let mute = out.mute.get(&input.name).copied();
                        let focus_send = out.focus_rules.get(&input.name).cloned().unwrap_or_default();
                        (mute.is_some() || !focus_send.is_empty()).then(|| TargetEntry {
                            name: out.name.clone(),
                            mute,
                            focus_send,
                        })
                    })
                    .collect(),
                name: input.name,
                echo: input.echo_enabled,
            })
            .collect();
        Self { inputs }
    }

    /// Replay the document through `set_echo`, `set_target_mute` and
    /// `set_target_focus_rule`.
    ///
    /// A rejected entry does not stop the rest of the document; every
    /// failure is logged and returned.
    pub fn apply_to(&self, registry: &mut Registry) -> Vec<ApplyFailure> {
        let mut failures = Vec::new();
        for input in &self.inputs {
            if let Err(error) = registry.set_echo(&input.name, input.echo) {
                warn!("Could not restore echo for '{}': {}", input.name, error);
                failures.push(ApplyFailure {
                    input: input.name.clone(),
                    output: None,
                    error,
                });
            }

            for target in &input.outputs {
                let result = match target.mute {
                    Some(muted) => registry.set_target_mute(&target.name, &input.name, muted),
                    None => Ok(()),
                }
                .and_then(|()| {
                    registry.set_target_focus_rule(&target.name, &input.name, &target.focus_send)
                });
                if let Err(error) = result {
                    warn!(
                        "Could not restore routing '{}' -> '{}': {}",
                        input.name, target.name, error
                    );
                    failures.push(ApplyFailure {
                        input: input.name.clone(),
                        output: Some(target.name.clone()),
                        error,
                    });
                }
            }
        }
        debug!(
            "Routing applied ({} input(s), {} failure(s))",
            self.inputs.len(),
            failures.len()
        );
        failures
    }

    /// Save the document as pretty JSON, creating the parent directory
    pub async fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self).context("Failed to serialize routing")?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        fs::write(path, json)
            .await
            .with_context(|| format!("Failed to write routing file {}", path.display()))?;

        info!("Routing saved to {}", path.display());
        Ok(())
    }

    pub async fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read routing file {}", path.display()))?;

        let document: RoutingDocument =
            serde_json::from_str(&json).context("Failed to parse routing JSON")?;

        debug!(
            "Routing loaded from {} ({} input(s))",
            path.display(),
            document.inputs.len()
        );
        Ok(document)
    }

    /// Like [`RoutingDocument::load_from_file`], but a missing file is an
    /// empty document
    pub async fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !fs::try_exists(path).await.unwrap_or(false) {
            info!("No routing file at {}, starting empty", path.display());
            return Ok(Self::default());
        }
        Self::load_from_file(path).await
    }
}
