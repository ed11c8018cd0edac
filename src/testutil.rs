//! Shared fakes for unit tests.

use crate::api::{ApiError, PipelineApi};
use crate::channel::ProgressSink;
use crate::model::{
    ExecuteRequest, PipelineConfig, ProgressUpdate, SessionRecord, SessionSummary, SplitState,
    SplitStatus,
};
use crate::session::{ExpiryNotifier, SessionStore};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

/// A config with millisecond-scale intervals so tests finish quickly.
pub(crate) fn test_config() -> PipelineConfig {
    PipelineConfig {
        base_url: "http://127.0.0.1:9".into(),
        ws_base_url: "ws://127.0.0.1:9".into(),
        job_id: "test-job".into(),
        bearer_token: None,
        user_agent: "sheetflow-test".into(),
        max_workers: 4,
        http_timeout: Duration::from_secs(5),
        split_poll_interval: Duration::from_millis(1),
        split_max_attempts: 10,
        monitor_timeout: Duration::from_secs(5),
        heartbeat_interval: Duration::from_millis(50),
        reconnect_base_delay: Duration::from_millis(1),
        max_reconnect_attempts: 1,
        fallback_poll_interval: Duration::from_millis(3),
        reconnect_probe_interval: Duration::from_secs(60),
        session_timeout: Duration::from_secs(3600),
        expiry_check_interval: Duration::from_secs(60),
        expiry_warning_threshold: Duration::from_secs(1800),
    }
}

pub(crate) fn split_ok(state: SplitState) -> Result<SplitStatus, ApiError> {
    Ok(SplitStatus {
        status: state,
        progress: None,
        task_count: Some(12),
        message: None,
    })
}

#[derive(Default)]
struct FakeApiInner {
    session_counter: u32,
    upload_files: Vec<String>,
    parent_calls: Vec<(String, String)>,
    execute_calls: Vec<ExecuteRequest>,
    split_scripts: HashMap<String, VecDeque<Result<SplitStatus, ApiError>>>,
    progress_scripts: HashMap<String, VecDeque<ProgressUpdate>>,
    last_progress: HashMap<String, ProgressUpdate>,
    glossary_fails: bool,
    glossary_uploads: u32,
    download_calls: Vec<String>,
    sessions: Vec<SessionSummary>,
}

/// Scripted in-process backend.
///
/// Session ids are handed out as `sess-1`, `sess-2`, … in call order, so
/// tests can script statuses and progress for ids they know in advance.
#[derive(Default)]
pub(crate) struct FakeApi {
    inner: Mutex<FakeApiInner>,
}

impl FakeApi {
    fn lock(&self) -> std::sync::MutexGuard<'_, FakeApiInner> {
        self.inner.lock().expect("fake api lock poisoned")
    }

    /// Queue split-status responses for one session id. Unscripted sessions
    /// report `completed` immediately.
    pub(crate) fn script_split(
        &self,
        session_id: &str,
        responses: Vec<Result<SplitStatus, ApiError>>,
    ) {
        self.lock()
            .split_scripts
            .insert(session_id.to_string(), responses.into());
    }

    /// Queue an execution-progress response for the channel polling loop,
    /// for tests that use a single hard-coded session id.
    pub(crate) fn push_progress(&self, update: ProgressUpdate) {
        self.push_progress_for("s1", update.clone());
        self.push_progress_for("s2", update);
    }

    pub(crate) fn push_progress_for(&self, session_id: &str, update: ProgressUpdate) {
        self.lock()
            .progress_scripts
            .entry(session_id.to_string())
            .or_default()
            .push_back(update);
    }

    pub(crate) fn fail_glossary_uploads(&self) {
        self.lock().glossary_fails = true;
    }

    pub(crate) fn set_sessions(&self, sessions: Vec<SessionSummary>) {
        self.lock().sessions = sessions;
    }

    pub(crate) fn upload_files(&self) -> Vec<String> {
        self.lock().upload_files.clone()
    }

    pub(crate) fn parent_calls(&self) -> Vec<(String, String)> {
        self.lock().parent_calls.clone()
    }

    pub(crate) fn execute_calls(&self) -> Vec<ExecuteRequest> {
        self.lock().execute_calls.clone()
    }

    pub(crate) fn glossary_uploads(&self) -> u32 {
        self.lock().glossary_uploads
    }

    pub(crate) fn download_calls(&self) -> Vec<String> {
        self.lock().download_calls.clone()
    }
}

#[async_trait]
impl PipelineApi for FakeApi {
    async fn upload_and_split(
        &self,
        file: &Path,
        _config_json: &serde_json::Value,
    ) -> Result<String, ApiError> {
        let mut inner = self.lock();
        inner.session_counter += 1;
        let id = format!("sess-{}", inner.session_counter);
        inner
            .upload_files
            .push(file.file_name().unwrap_or_default().to_string_lossy().into_owned());
        Ok(id)
    }

    async fn split_from_parent(
        &self,
        parent_session_id: &str,
        processor: &str,
    ) -> Result<String, ApiError> {
        let mut inner = self.lock();
        inner.session_counter += 1;
        let id = format!("sess-{}", inner.session_counter);
        inner
            .parent_calls
            .push((parent_session_id.to_string(), processor.to_string()));
        Ok(id)
    }

    async fn split_status(&self, session_id: &str) -> Result<SplitStatus, ApiError> {
        let mut inner = self.lock();
        match inner.split_scripts.get_mut(session_id).and_then(VecDeque::pop_front) {
            Some(response) => response,
            None => split_ok(SplitState::Completed),
        }
    }

    async fn execute_start(&self, req: &ExecuteRequest) -> Result<(), ApiError> {
        self.lock().execute_calls.push(req.clone());
        Ok(())
    }

    async fn execution_progress(&self, session_id: &str) -> Result<ProgressUpdate, ApiError> {
        let mut inner = self.lock();
        if let Some(update) = inner
            .progress_scripts
            .get_mut(session_id)
            .and_then(VecDeque::pop_front)
        {
            inner
                .last_progress
                .insert(session_id.to_string(), update.clone());
            return Ok(update);
        }
        if let Some(last) = inner.last_progress.get(session_id) {
            return Ok(last.clone());
        }
        // Nothing scripted: report a finished run so happy-path tests
        // converge without extra setup.
        Ok(ProgressUpdate {
            completed: 1,
            total: 1,
            percent: 100.0,
            status: Some("completed".into()),
            message: None,
        })
    }

    async fn download(&self, session_id: &str) -> Result<Bytes, ApiError> {
        self.lock().download_calls.push(session_id.to_string());
        Ok(Bytes::from_static(b"RESULT-BYTES"))
    }

    async fn upload_glossary(&self, _file: &Path) -> Result<String, ApiError> {
        let mut inner = self.lock();
        inner.glossary_uploads += 1;
        if inner.glossary_fails {
            Err(ApiError::Backend("HTTP 500: glossary rejected".into()))
        } else {
            Ok("gloss-1".into())
        }
    }

    async fn list_sessions(&self) -> Result<Vec<SessionSummary>, ApiError> {
        Ok(self.lock().sessions.clone())
    }
}

#[derive(Default)]
struct SinkLog {
    opens: u32,
    progress: Vec<f64>,
    completes: u32,
    errors: Vec<String>,
    closes: Vec<String>,
    others: u32,
}

/// Records every callback for assertions.
#[derive(Default)]
pub(crate) struct RecordingSink {
    log: Mutex<SinkLog>,
}

impl RecordingSink {
    fn lock(&self) -> std::sync::MutexGuard<'_, SinkLog> {
        self.log.lock().expect("sink log lock poisoned")
    }

    pub(crate) fn completes(&self) -> u32 {
        self.lock().completes
    }

    pub(crate) fn progress_percents(&self) -> Vec<f64> {
        self.lock().progress.clone()
    }

    pub(crate) fn total_callbacks(&self) -> usize {
        let log = self.lock();
        log.opens as usize
            + log.progress.len()
            + log.completes as usize
            + log.errors.len()
            + log.closes.len()
            + log.others as usize
    }
}

impl ProgressSink for RecordingSink {
    fn on_open(&self) {
        self.lock().opens += 1;
    }

    fn on_progress(&self, update: &ProgressUpdate) {
        self.lock().progress.push(update.percent);
    }

    fn on_complete(&self, _payload: &serde_json::Value) {
        self.lock().completes += 1;
    }

    fn on_error(&self, message: &str) {
        self.lock().errors.push(message.to_string());
    }

    fn on_close(&self, reason: &str) {
        self.lock().closes.push(reason.to_string());
    }

    fn on_task_update(&self, _payload: &serde_json::Value) {
        self.lock().others += 1;
    }

    fn on_batch_complete(&self, _payload: &serde_json::Value) {
        self.lock().others += 1;
    }

    fn on_status(&self, _payload: &serde_json::Value) {
        self.lock().others += 1;
    }

    fn on_message(&self, _kind: &str, _payload: &serde_json::Value) {
        self.lock().others += 1;
    }
}

/// In-memory `SessionStore`.
#[derive(Default)]
pub(crate) struct MemoryStore {
    records: Mutex<HashMap<String, SessionRecord>>,
}

impl SessionStore for MemoryStore {
    fn save(&self, record: &SessionRecord) -> anyhow::Result<()> {
        self.records
            .lock()
            .expect("memory store lock poisoned")
            .insert(record.session_id.clone(), record.clone());
        Ok(())
    }

    fn load(&self, session_id: &str) -> anyhow::Result<Option<SessionRecord>> {
        Ok(self
            .records
            .lock()
            .expect("memory store lock poisoned")
            .get(session_id)
            .cloned())
    }

    fn remove(&self, session_id: &str) -> anyhow::Result<()> {
        self.records
            .lock()
            .expect("memory store lock poisoned")
            .remove(session_id);
        Ok(())
    }
}

/// Counts notifications instead of prompting a user.
#[derive(Default)]
pub(crate) struct CountingNotifier {
    warnings: Mutex<u32>,
    expirations: Mutex<u32>,
}

impl CountingNotifier {
    pub(crate) fn warning_count(&self) -> u32 {
        *self.warnings.lock().expect("notifier lock poisoned")
    }

    pub(crate) fn expired_count(&self) -> u32 {
        *self.expirations.lock().expect("notifier lock poisoned")
    }
}

impl ExpiryNotifier for CountingNotifier {
    fn expiry_warning(&self, _record: &SessionRecord, _remaining_secs: i64) {
        *self.warnings.lock().expect("notifier lock poisoned") += 1;
    }

    fn session_expired(&self, _record: &SessionRecord) {
        *self.expirations.lock().expect("notifier lock poisoned") += 1;
    }
}
