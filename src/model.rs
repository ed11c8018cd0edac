use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Sheets whose name carries this prefix mark the workbook for the
/// chained-transform workflow.
pub const CAPS_SHEET_PREFIX: &str = "CAPS_";

/// Processor identifier for the primary AI translation pass.
pub const PROCESSOR_TRANSLATE: &str = "ai_translate";
/// Processor identifier for the secondary CAPS normalization pass.
pub const PROCESSOR_CAPS: &str = "caps_transform";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub base_url: String,
    pub ws_base_url: String,
    pub job_id: String,
    #[serde(default)]
    pub bearer_token: Option<String>,
    pub user_agent: String,
    pub max_workers: u32,
    #[serde(with = "humantime_serde")]
    pub http_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub split_poll_interval: Duration,
    pub split_max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub monitor_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub reconnect_base_delay: Duration,
    pub max_reconnect_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub fallback_poll_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub reconnect_probe_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub session_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub expiry_check_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub expiry_warning_threshold: Duration,
}

/// Lifecycle stage of one backend session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Created,
    Split,
    Executing,
    Completed,
    Expired,
}

impl Stage {
    /// Terminal stages admit no further transition.
    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Completed | Stage::Expired)
    }
}

/// One backend-tracked unit of work, persisted between stage transitions.
/// Timestamps are unix seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub filename: String,
    pub created_at: i64,
    pub expires_at: i64,
    pub last_access: i64,
    pub stage: Stage,
    #[serde(default)]
    pub sheet_count: u32,
}

impl SessionRecord {
    pub fn remaining_secs(&self, now: i64) -> i64 {
        (self.expires_at - now).max(0)
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.remaining_secs(now) == 0
    }
}

/// Workbook analysis the caller obtained before starting a job. The presence
/// of a marker sheet selects the chained-transform workflow.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalysisSummary {
    #[serde(default)]
    pub sheets: Vec<SheetInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SheetInfo {
    pub name: String,
    #[serde(default)]
    pub row_count: u64,
}

impl AnalysisSummary {
    pub fn has_caps_sheet(&self) -> bool {
        self.sheets
            .iter()
            .any(|s| s.name.starts_with(CAPS_SHEET_PREFIX))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowKind {
    Standard,
    ChainedTransform,
}

impl WorkflowKind {
    pub fn for_analysis(analysis: &AnalysisSummary) -> Self {
        if analysis.has_caps_sheet() {
            WorkflowKind::ChainedTransform
        } else {
            WorkflowKind::Standard
        }
    }
}

/// Named phase of a running job, for presentation layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobPhase {
    Upload,
    Split,
    Translate,
    CapsSplit,
    CapsTransform,
    Finalize,
}

/// Events emitted by the workflow runner and consumed by CLI/page layers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JobEvent {
    PhaseStarted {
        phase: JobPhase,
    },
    SessionCreated {
        session_id: String,
    },
    Progress {
        percent: f64,
        message: String,
        error: bool,
    },
    Info(String),
    JobCompleted {
        // Box to keep JobEvent size small.
        outcome: Box<JobOutcome>,
    },
}

/// Fractional execution progress for one session. Shared shape between the
/// live channel's progress event and the polling endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressUpdate {
    #[serde(default)]
    pub completed: u64,
    #[serde(default)]
    pub total: u64,
    pub percent: f64,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl ProgressUpdate {
    /// Whether a polled update already reports a finished run.
    pub fn is_terminal(&self) -> bool {
        match self.status.as_deref() {
            Some("completed") | Some("failed") => true,
            _ => self.percent >= 100.0,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.status.as_deref() == Some("failed")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitState {
    NotStarted,
    Processing,
    Completed,
    Failed,
}

/// Response of the split-status endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitStatus {
    pub status: SplitState,
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default)]
    pub task_count: Option<u64>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Body of the execute-start call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub session_id: String,
    pub processor: String,
    pub max_workers: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub glossary_id: Option<String>,
}

/// One row of the backend session-list endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub stage: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
}

/// Final result of one logical translation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobOutcome {
    #[serde(default)]
    pub timestamp_utc: String,
    pub filename: String,
    pub workflow_kind: WorkflowKind,
    /// Ordered backend session ids; the result is addressed by the last one.
    pub session_chain: Vec<String>,
    #[serde(default)]
    pub task_count: Option<u64>,
    pub duration_ms: u64,
    #[serde(default)]
    pub output_path: Option<PathBuf>,
}

impl JobOutcome {
    /// The session id the downloadable result lives under.
    pub fn result_session_id(&self) -> &str {
        self.session_chain
            .last()
            .map(String::as_str)
            .unwrap_or_default()
    }
}
