//! Post-run processing utilities.
//!
//! Handles result download and save after a job completes. The result is
//! always addressed by the last session id in the chain.

use crate::api::PipelineApi;
use crate::model::JobOutcome;
use crate::storage;
use anyhow::{Context, Result};
use std::path::Path;

/// Result of post-run processing, ready for presentation layers.
pub struct ProcessedJob {
    pub outcome: JobOutcome,
    pub messages: Vec<String>,
}

/// Download the translated result and write it to `output` (or the default
/// results directory).
pub async fn process_job_completion(
    api: &dyn PipelineApi,
    outcome: JobOutcome,
    output: Option<&Path>,
) -> Result<ProcessedJob> {
    let session_id = outcome.result_session_id().to_string();
    let bytes = api
        .download(&session_id)
        .await
        .with_context(|| format!("failed to download result for session {}", session_id))?;

    let path = match output {
        Some(path) => path.to_path_buf(),
        None => storage::default_result_path(&outcome.filename)?,
    };
    storage::save_result(&path, &bytes)?;
    tracing::info!(
        session_id = %session_id,
        path = %path.display(),
        bytes = bytes.len(),
        "saved translated result"
    );

    let mut outcome = outcome;
    outcome.output_path = Some(path.clone());
    Ok(ProcessedJob {
        messages: vec![format!("Saved: {}", path.display())],
        outcome,
    })
}
