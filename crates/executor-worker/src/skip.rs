// Step-skip protocol. A pre-step may leave a marker in the working directory
// naming a later step; everything up to that step is then skipped.

use anyhow::{Context, Result};
use executor_common::constants::workspace::{MARKER_DIR, SKIP_FILE};
use serde::Deserialize;
use std::path::Path;

/// Where the pipeline loop stands with respect to skipping.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SkipState {
    #[default]
    NotSkipping,
    SkippingUntil(String),
}

impl SkipState {
    /// Whether the spec keyed `key` runs. Reaching the target ends the skip and
    /// the target itself runs.
    pub fn should_run(&mut self, key: &str) -> bool {
        match self {
            SkipState::NotSkipping => true,
            SkipState::SkippingUntil(target) if target == key => {
                *self = SkipState::NotSkipping;
                true
            }
            SkipState::SkippingUntil(_) => false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SkipError {
    #[error("skip marker written by {pre_step:?} names {target:?}, which is not a later step")]
    UnknownTarget { pre_step: String, target: String },
    #[error("malformed skip marker: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SkipMarker {
    next_step: String,
}

/// Read and consume the skip marker under `working_directory`, returning the
/// step name it names. `None` when no marker was written.
pub async fn take_skip_marker(working_directory: &Path) -> Result<Option<String>> {
    let path = working_directory.join(MARKER_DIR).join(SKIP_FILE);
    let raw = match tokio::fs::read(&path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("failed to read skip marker {path:?}")),
    };
    tokio::fs::remove_file(&path)
        .await
        .with_context(|| format!("failed to consume skip marker {path:?}"))?;

    let marker: SkipMarker = serde_json::from_slice(&raw).map_err(SkipError::from)?;
    let next = marker.next_step.trim();
    Ok((!next.is_empty()).then(|| next.to_string()))
}

/// Delete any skip marker under `working_directory` so only one written by the
/// next step is seen.
pub async fn clear_skip_marker(working_directory: &Path) -> Result<()> {
    let path = working_directory.join(MARKER_DIR).join(SKIP_FILE);
    match tokio::fs::remove_file(&path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("failed to clear skip marker {path:?}")),
    }
}
