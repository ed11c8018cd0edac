//! End-to-end execution of one translation job.
//!
//! Sequences upload, split wait, execution, and (for workbooks carrying a
//! CAPS marker sheet) a dependent second split and transform pass, reporting
//! one unified progress percentage across stage boundaries. Exactly one of
//! {completion event, returned error} occurs per `execute` call, and an
//! error-flagged progress update always precedes the error.

use crate::api::PipelineApi;
use crate::channel::{ProgressChannels, ProgressSink};
use crate::model::{
    AnalysisSummary, ExecuteRequest, JobEvent, JobOutcome, JobPhase, PipelineConfig,
    ProgressUpdate, SplitState, Stage, WorkflowKind, PROCESSOR_CAPS, PROCESSOR_TRANSLATE,
};
use crate::orchestrator::progress::{
    ProgressReporter, StageBand, CHAINED_FINALIZE, CHAINED_STAGE_ONE, CHAINED_STAGE_TWO,
    STANDARD_FINALIZE, STANDARD_STAGE,
};
use crate::session::SessionTracker;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("split did not complete within {attempts} status polls")]
    SplitTimeout { attempts: u32 },

    #[error("{stage} stage failed: {message}")]
    StageFailed {
        stage: &'static str,
        message: String,
    },

    #[error("execution monitoring timed out after {limit:?}")]
    MonitorTimeout { limit: Duration },

    #[error("workflow cancelled")]
    Cancelled,

    #[error(transparent)]
    Api(#[from] crate::api::ApiError),
}

/// One translation job to run.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub file: PathBuf,
    pub analysis: AnalysisSummary,
    /// New glossary to upload before stage 1; failure is non-fatal.
    pub glossary_file: Option<PathBuf>,
    /// Reference to an already-uploaded glossary.
    pub glossary_id: Option<String>,
}

/// Forwards channel callbacks into the monitoring loop.
struct MonitorSink {
    tx: mpsc::UnboundedSender<MonitorMsg>,
}

enum MonitorMsg {
    Progress(ProgressUpdate),
    Complete,
    Failed(String),
}

impl ProgressSink for MonitorSink {
    fn on_progress(&self, update: &ProgressUpdate) {
        let _ = self.tx.send(MonitorMsg::Progress(update.clone()));
    }

    fn on_complete(&self, _payload: &serde_json::Value) {
        let _ = self.tx.send(MonitorMsg::Complete);
    }

    fn on_error(&self, message: &str) {
        let _ = self.tx.send(MonitorMsg::Failed(message.to_string()));
    }
}

pub struct WorkflowRunner {
    cfg: PipelineConfig,
    api: Arc<dyn PipelineApi>,
    channels: ProgressChannels,
    tracker: Arc<SessionTracker>,
    events: mpsc::UnboundedSender<JobEvent>,
    cancel: CancellationToken,
}

impl WorkflowRunner {
    pub fn new(
        cfg: PipelineConfig,
        api: Arc<dyn PipelineApi>,
        channels: ProgressChannels,
        tracker: Arc<SessionTracker>,
        events: mpsc::UnboundedSender<JobEvent>,
    ) -> Self {
        Self {
            cfg,
            api,
            channels,
            tracker,
            events,
            cancel: CancellationToken::new(),
        }
    }

    /// Token a caller may trigger to abort the job at the next suspension
    /// point.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run one job end to end.
    pub async fn execute(&self, request: JobRequest) -> Result<JobOutcome, WorkflowError> {
        let started = Instant::now();
        let mut reporter = ProgressReporter::new(self.events.clone());

        match self.run_job(&request, &mut reporter, started).await {
            Ok(outcome) => {
                reporter.completed(&outcome);
                Ok(outcome)
            }
            Err(e) => {
                tracing::error!(error = %e, file = %request.file.display(), "job failed");
                reporter.emit_error(e.to_string());
                Err(e)
            }
        }
    }

    async fn run_job(
        &self,
        request: &JobRequest,
        reporter: &mut ProgressReporter,
        started: Instant,
    ) -> Result<JobOutcome, WorkflowError> {
        let filename = request
            .file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| request.file.display().to_string());
        let kind = WorkflowKind::for_analysis(&request.analysis);

        tracing::info!(filename = %filename, ?kind, "starting translation job");

        let glossary_id = self.resolve_glossary(request, reporter).await;

        let (stage_one, stage_two, finalize) = match kind {
            WorkflowKind::Standard => (STANDARD_STAGE, None, STANDARD_FINALIZE),
            WorkflowKind::ChainedTransform => {
                (CHAINED_STAGE_ONE, Some(CHAINED_STAGE_TWO), CHAINED_FINALIZE)
            }
        };

        let mut session_chain: Vec<String> = Vec::new();

        // Stage 1: upload, split, translate.
        reporter.phase(JobPhase::Upload);
        reporter.emit(stage_one.split.start, "Uploading workbook");
        self.check_cancel()?;
        let analysis_json =
            serde_json::to_value(&request.analysis).unwrap_or(serde_json::Value::Null);
        let first_id = self.api.upload_and_split(&request.file, &analysis_json).await?;
        session_chain.push(first_id.clone());
        self.tracker
            .create_session(&first_id, &filename, &request.analysis);
        reporter.session_created(&first_id);

        reporter.phase(JobPhase::Split);
        let task_count = self
            .wait_for_split(&first_id, &stage_one.split, reporter)
            .await?;
        self.record_stage(Stage::Split);

        reporter.phase(JobPhase::Translate);
        self.api
            .execute_start(&ExecuteRequest {
                session_id: first_id.clone(),
                processor: PROCESSOR_TRANSLATE.to_string(),
                max_workers: self.cfg.max_workers,
                glossary_id,
            })
            .await?;
        self.record_stage(Stage::Executing);
        self.monitor_execution(&first_id, &stage_one.execute, reporter)
            .await?;
        self.record_stage(Stage::Completed);

        // Stage 2: dependent split and CAPS transform, inheriting context
        // from the stage-1 session instead of re-uploading the file.
        if let Some(stage_two) = stage_two {
            self.check_cancel()?;
            reporter.phase(JobPhase::CapsSplit);
            reporter.emit(stage_two.split.start, "Preparing CAPS transform");
            let second_id = self
                .api
                .split_from_parent(&first_id, PROCESSOR_CAPS)
                .await?;
            session_chain.push(second_id.clone());
            self.tracker
                .create_session(&second_id, &filename, &request.analysis);
            reporter.session_created(&second_id);

            self.wait_for_split(&second_id, &stage_two.split, reporter)
                .await?;
            self.record_stage(Stage::Split);

            reporter.phase(JobPhase::CapsTransform);
            self.api
                .execute_start(&ExecuteRequest {
                    session_id: second_id.clone(),
                    processor: PROCESSOR_CAPS.to_string(),
                    max_workers: self.cfg.max_workers,
                    glossary_id: None,
                })
                .await?;
            self.record_stage(Stage::Executing);
            self.monitor_execution(&second_id, &stage_two.execute, reporter)
                .await?;
            self.record_stage(Stage::Completed);
        }

        reporter.phase(JobPhase::Finalize);
        reporter.emit(finalize.start, "Finalizing");
        let outcome = JobOutcome {
            timestamp_utc: time::OffsetDateTime::now_utc()
                .format(&time::format_description::well_known::Rfc3339)
                .unwrap_or_else(|_| "now".into()),
            filename,
            workflow_kind: kind,
            session_chain,
            task_count,
            duration_ms: started.elapsed().as_millis() as u64,
            output_path: None,
        };
        reporter.emit(100.0, "Translation complete");
        Ok(outcome)
    }

    /// Upload a new glossary when the caller supplied one. Failure is
    /// logged and swallowed; the job proceeds without it.
    async fn resolve_glossary(
        &self,
        request: &JobRequest,
        reporter: &ProgressReporter,
    ) -> Option<String> {
        let path = match &request.glossary_file {
            Some(path) => path,
            None => return request.glossary_id.clone(),
        };
        match self.api.upload_glossary(path).await {
            Ok(id) => {
                reporter.info(format!("Glossary uploaded: {}", id));
                Some(id)
            }
            Err(e) => {
                tracing::warn!(
                    glossary = %path.display(),
                    error = %e,
                    "glossary upload failed, continuing without it"
                );
                reporter.info("Glossary upload failed, continuing without it");
                request.glossary_id.clone()
            }
        }
    }

    /// Poll the split-status endpoint until the split completes.
    ///
    /// `failed` and definitive request errors reject immediately; transient
    /// request errors ride out the attempt budget; exhausting the budget is
    /// a timeout distinct from a backend-reported failure.
    async fn wait_for_split(
        &self,
        session_id: &str,
        band: &StageBand,
        reporter: &mut ProgressReporter,
    ) -> Result<Option<u64>, WorkflowError> {
        let mut task_count = None;
        for attempt in 0..self.cfg.split_max_attempts {
            self.check_cancel()?;
            match self.api.split_status(session_id).await {
                Ok(status) => {
                    if status.task_count.is_some() {
                        task_count = status.task_count;
                    }
                    match status.status {
                        SplitState::Completed => {
                            reporter.emit(band.end, "Split complete");
                            return Ok(task_count);
                        }
                        SplitState::Failed => {
                            return Err(WorkflowError::StageFailed {
                                stage: "split",
                                message: status
                                    .message
                                    .unwrap_or_else(|| "split failed".to_string()),
                            });
                        }
                        SplitState::NotStarted | SplitState::Processing => {
                            let native = status.progress.unwrap_or(0.0);
                            reporter.emit(band.remap(native), "Splitting workbook");
                        }
                    }
                }
                Err(e) if e.is_transient() => {
                    tracing::warn!(
                        session_id,
                        attempt,
                        error = %e,
                        "split status poll failed"
                    );
                }
                Err(e) => return Err(e.into()),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.cfg.split_poll_interval) => {}
                _ = self.cancel.cancelled() => return Err(WorkflowError::Cancelled),
            }
        }
        Err(WorkflowError::SplitTimeout {
            attempts: self.cfg.split_max_attempts,
        })
    }

    /// Watch one session's execution through its progress channel, remapping
    /// native percent into the stage band.
    async fn monitor_execution(
        &self,
        session_id: &str,
        band: &StageBand,
        reporter: &mut ProgressReporter,
    ) -> Result<(), WorkflowError> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.channels
            .connect(session_id, Arc::new(MonitorSink { tx }));
        let deadline = Instant::now() + self.cfg.monitor_timeout;

        let result = loop {
            let msg = tokio::select! {
                _ = self.cancel.cancelled() => break Err(WorkflowError::Cancelled),
                _ = tokio::time::sleep_until(deadline) => {
                    tracing::warn!(
                        session_id,
                        state = ?self.channels.connection_state(session_id),
                        "execution monitoring deadline reached"
                    );
                    break Err(WorkflowError::MonitorTimeout {
                        limit: self.cfg.monitor_timeout,
                    });
                }
                msg = rx.recv() => msg,
            };
            match msg {
                Some(MonitorMsg::Progress(update)) => {
                    let message = update
                        .message
                        .clone()
                        .unwrap_or_else(|| "Executing".to_string());
                    reporter.emit(band.remap(update.percent), message);
                }
                Some(MonitorMsg::Complete) => {
                    reporter.emit(band.end, "Execution complete");
                    break Ok(());
                }
                Some(MonitorMsg::Failed(message)) => {
                    break Err(WorkflowError::StageFailed {
                        stage: "execute",
                        message,
                    });
                }
                None => {
                    break Err(WorkflowError::StageFailed {
                        stage: "execute",
                        message: "progress channel closed unexpectedly".to_string(),
                    });
                }
            }
        };

        self.channels.disconnect(session_id);
        result
    }

    /// Stage annotations are bookkeeping; persistence trouble must not fail
    /// the job.
    fn record_stage(&self, stage: Stage) {
        if let Err(e) = self.tracker.update_stage(stage) {
            tracing::warn!(error = %e, "failed to record session stage");
        }
    }

    fn check_cancel(&self) -> Result<(), WorkflowError> {
        if self.cancel.is_cancelled() {
            Err(WorkflowError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ApiError;
    use crate::channel::ChannelSettings;
    use crate::model::SplitStatus;
    use crate::testutil::{split_ok, test_config, CountingNotifier, FakeApi, MemoryStore};

    fn build_runner(
        api: Arc<FakeApi>,
    ) -> (WorkflowRunner, mpsc::UnboundedReceiver<JobEvent>) {
        let cfg = test_config();
        let channels = ProgressChannels::new(
            ChannelSettings::from_config(&cfg),
            api.clone() as Arc<dyn PipelineApi>,
        );
        let tracker = SessionTracker::new(
            Arc::new(MemoryStore::default()),
            Arc::new(CountingNotifier::default()),
            cfg.session_timeout,
            cfg.expiry_warning_threshold,
            cfg.expiry_check_interval,
        );
        let (tx, rx) = mpsc::unbounded_channel();
        (
            WorkflowRunner::new(cfg, api as Arc<dyn PipelineApi>, channels, tracker, tx),
            rx,
        )
    }

    fn running(percent: f64) -> ProgressUpdate {
        ProgressUpdate {
            completed: 0,
            total: 10,
            percent,
            status: Some("processing".into()),
            message: None,
        }
    }

    fn finished() -> ProgressUpdate {
        ProgressUpdate {
            completed: 10,
            total: 10,
            percent: 100.0,
            status: Some("completed".into()),
            message: None,
        }
    }

    fn caps_analysis() -> AnalysisSummary {
        AnalysisSummary {
            sheets: vec![
                crate::model::SheetInfo {
                    name: "report".into(),
                    row_count: 40,
                },
                crate::model::SheetInfo {
                    name: "CAPS_data".into(),
                    row_count: 8,
                },
            ],
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<JobEvent>) -> Vec<JobEvent> {
        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        events
    }

    fn progress_percents(events: &[JobEvent]) -> Vec<f64> {
        events
            .iter()
            .filter_map(|ev| match ev {
                JobEvent::Progress { percent, error: false, .. } => Some(*percent),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn standard_workflow_runs_one_split_and_one_execute() {
        let api = Arc::new(FakeApi::default());
        api.push_progress_for("sess-1", running(30.0));
        api.push_progress_for("sess-1", finished());

        let (runner, mut rx) = build_runner(api.clone());
        let outcome = runner
            .execute(JobRequest {
                file: PathBuf::from("report.xlsx"),
                analysis: AnalysisSummary::default(),
                glossary_file: None,
                glossary_id: None,
            })
            .await
            .unwrap();

        assert_eq!(outcome.workflow_kind, WorkflowKind::Standard);
        assert_eq!(outcome.session_chain, vec!["sess-1".to_string()]);
        assert_eq!(outcome.result_session_id(), "sess-1");
        assert_eq!(api.upload_files(), vec!["report.xlsx".to_string()]);
        assert!(api.parent_calls().is_empty());

        let executes = api.execute_calls();
        assert_eq!(executes.len(), 1);
        assert_eq!(executes[0].processor, PROCESSOR_TRANSLATE);
        assert_eq!(executes[0].glossary_id, None);

        let events = drain(&mut rx);
        let percents = progress_percents(&events);
        assert!(percents.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(percents.last().copied(), Some(100.0));
        let completions = events
            .iter()
            .filter(|ev| matches!(ev, JobEvent::JobCompleted { .. }))
            .count();
        assert_eq!(completions, 1);
    }

    #[tokio::test]
    async fn chained_workflow_chains_two_sessions() {
        let api = Arc::new(FakeApi::default());
        api.push_progress_for("sess-1", running(50.0));
        api.push_progress_for("sess-1", finished());
        api.push_progress_for("sess-2", running(50.0));
        api.push_progress_for("sess-2", finished());

        let (runner, mut rx) = build_runner(api.clone());
        let outcome = runner
            .execute(JobRequest {
                file: PathBuf::from("report.xlsx"),
                analysis: caps_analysis(),
                glossary_file: None,
                glossary_id: None,
            })
            .await
            .unwrap();

        assert_eq!(outcome.workflow_kind, WorkflowKind::ChainedTransform);
        assert_eq!(
            outcome.session_chain,
            vec!["sess-1".to_string(), "sess-2".to_string()]
        );
        assert_eq!(outcome.result_session_id(), "sess-2");

        // Second split inherits context from the first session.
        assert_eq!(
            api.parent_calls(),
            vec![("sess-1".to_string(), PROCESSOR_CAPS.to_string())]
        );

        let processors: Vec<String> = api
            .execute_calls()
            .into_iter()
            .map(|req| req.processor)
            .collect();
        assert_eq!(
            processors,
            vec![PROCESSOR_TRANSLATE.to_string(), PROCESSOR_CAPS.to_string()]
        );

        let events = drain(&mut rx);
        let percents = progress_percents(&events);
        assert!(percents.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(percents.last().copied(), Some(100.0));
    }

    #[tokio::test]
    async fn split_sequence_resolves_after_processing_polls() {
        let api = Arc::new(FakeApi::default());
        api.script_split(
            "sess-1",
            vec![
                split_ok(SplitState::Processing),
                split_ok(SplitState::Processing),
                split_ok(SplitState::Completed),
            ],
        );
        api.push_progress_for("sess-1", finished());

        let (runner, _rx) = build_runner(api);
        let outcome = runner
            .execute(JobRequest {
                file: PathBuf::from("report.xlsx"),
                analysis: AnalysisSummary::default(),
                glossary_file: None,
                glossary_id: None,
            })
            .await
            .unwrap();
        assert_eq!(outcome.session_chain.len(), 1);
    }

    #[tokio::test]
    async fn split_stuck_processing_times_out() {
        let api = Arc::new(FakeApi::default());
        let stuck: Vec<Result<SplitStatus, ApiError>> = (0..test_config().split_max_attempts)
            .map(|_| split_ok(SplitState::Processing))
            .collect();
        api.script_split("sess-1", stuck);

        let (runner, mut rx) = build_runner(api);
        let err = runner
            .execute(JobRequest {
                file: PathBuf::from("report.xlsx"),
                analysis: AnalysisSummary::default(),
                glossary_file: None,
                glossary_id: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::SplitTimeout { .. }));

        let events = drain(&mut rx);
        assert!(events.iter().any(|ev| matches!(
            ev,
            JobEvent::Progress { error: true, .. }
        )));
        assert!(!events
            .iter()
            .any(|ev| matches!(ev, JobEvent::JobCompleted { .. })));
    }

    #[tokio::test]
    async fn split_failure_rejects_without_exhausting_the_budget() {
        let api = Arc::new(FakeApi::default());
        api.script_split(
            "sess-1",
            vec![
                split_ok(SplitState::Processing),
                Ok(SplitStatus {
                    status: SplitState::Failed,
                    progress: None,
                    task_count: None,
                    message: Some("unreadable workbook".into()),
                }),
            ],
        );

        let (runner, _rx) = build_runner(api.clone());
        let err = runner
            .execute(JobRequest {
                file: PathBuf::from("report.xlsx"),
                analysis: AnalysisSummary::default(),
                glossary_file: None,
                glossary_id: None,
            })
            .await
            .unwrap_err();
        match err {
            WorkflowError::StageFailed { stage, message } => {
                assert_eq!(stage, "split");
                assert_eq!(message, "unreadable workbook");
            }
            other => panic!("unexpected error: {:?}", other),
        }
        // Failure short-circuits: no execution was started.
        assert!(api.execute_calls().is_empty());
    }

    #[tokio::test]
    async fn transient_split_errors_ride_out_the_budget() {
        let api = Arc::new(FakeApi::default());
        api.script_split(
            "sess-1",
            vec![
                Err(ApiError::Network("connection reset".into())),
                split_ok(SplitState::Processing),
                split_ok(SplitState::Completed),
            ],
        );
        api.push_progress_for("sess-1", finished());

        let (runner, _rx) = build_runner(api);
        assert!(runner
            .execute(JobRequest {
                file: PathBuf::from("report.xlsx"),
                analysis: AnalysisSummary::default(),
                glossary_file: None,
                glossary_id: None,
            })
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn definitive_split_errors_reject_immediately() {
        let api = Arc::new(FakeApi::default());
        api.script_split(
            "sess-1",
            vec![Err(ApiError::NotFound("session gone".into()))],
        );

        let (runner, _rx) = build_runner(api);
        let err = runner
            .execute(JobRequest {
                file: PathBuf::from("report.xlsx"),
                analysis: AnalysisSummary::default(),
                glossary_file: None,
                glossary_id: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Api(ApiError::NotFound(_))));
    }

    #[tokio::test]
    async fn glossary_upload_failure_is_not_fatal() {
        let api = Arc::new(FakeApi::default());
        api.fail_glossary_uploads();
        api.push_progress_for("sess-1", finished());

        let (runner, _rx) = build_runner(api.clone());
        let outcome = runner
            .execute(JobRequest {
                file: PathBuf::from("report.xlsx"),
                analysis: AnalysisSummary::default(),
                glossary_file: Some(PathBuf::from("glossary.csv")),
                glossary_id: None,
            })
            .await
            .unwrap();

        assert_eq!(outcome.session_chain.len(), 1);
        assert_eq!(api.glossary_uploads(), 1);
        assert_eq!(api.execute_calls()[0].glossary_id, None);
    }

    #[tokio::test]
    async fn failed_execution_rejects_with_stage_error() {
        let api = Arc::new(FakeApi::default());
        api.push_progress_for(
            "sess-1",
            ProgressUpdate {
                completed: 2,
                total: 10,
                percent: 20.0,
                status: Some("failed".into()),
                message: Some("worker pool crashed".into()),
            },
        );

        let (runner, mut rx) = build_runner(api);
        let err = runner
            .execute(JobRequest {
                file: PathBuf::from("report.xlsx"),
                analysis: AnalysisSummary::default(),
                glossary_file: None,
                glossary_id: None,
            })
            .await
            .unwrap_err();
        match err {
            WorkflowError::StageFailed { stage, message } => {
                assert_eq!(stage, "execute");
                assert_eq!(message, "worker pool crashed");
            }
            other => panic!("unexpected error: {:?}", other),
        }

        let events = drain(&mut rx);
        assert!(events.iter().any(|ev| matches!(
            ev,
            JobEvent::Progress { error: true, .. }
        )));
    }

    #[tokio::test]
    async fn cancellation_aborts_before_upload() {
        let api = Arc::new(FakeApi::default());
        let (runner, _rx) = build_runner(api.clone());
        runner.cancel_token().cancel();

        let err = runner
            .execute(JobRequest {
                file: PathBuf::from("report.xlsx"),
                analysis: AnalysisSummary::default(),
                glossary_file: None,
                glossary_id: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Cancelled));
        assert!(api.upload_files().is_empty());
    }
}
