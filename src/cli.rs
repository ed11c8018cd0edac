use crate::api::{HttpApiClient, PipelineApi};
use crate::channel::{ChannelSettings, ProgressChannels};
use crate::model::{AnalysisSummary, JobEvent, PipelineConfig, SessionRecord};
use crate::orchestrator::{process_job_completion, JobRequest, WorkflowRunner};
use crate::router::{GuardDecision, RouteContext, Router};
use crate::session::{ExpiryNotifier, SessionTracker};
use crate::storage::{self, FileSessionStore};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rand::RngCore;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Output line routing for stdout/stderr writer.
enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Spawn a blocking writer for stdout/stderr to avoid blocking async tasks.
fn spawn_output_writer() -> (
    mpsc::UnboundedSender<OutputLine>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        let mut out = std::io::LineWriter::new(stdout.lock());
        let mut err = std::io::LineWriter::new(stderr.lock());

        while let Some(line) = rx.blocking_recv() {
            match line {
                OutputLine::Stdout(msg) => {
                    let _ = writeln!(out, "{}", msg);
                }
                OutputLine::Stderr(msg) => {
                    let _ = writeln!(err, "{}", msg);
                }
            }
        }

        let _ = out.flush();
        let _ = err.flush();
    });
    (tx, handle)
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "sheetflow",
    version,
    about = "Spreadsheet translation pipeline client"
)]
pub struct Cli {
    /// Backend base URL
    #[arg(long, default_value = "http://localhost:8700")]
    pub base_url: String,

    /// WebSocket base URL; derived from --base-url when omitted
    #[arg(long)]
    pub ws_url: Option<String>,

    /// Bearer token for the backend
    #[arg(long)]
    pub token: Option<String>,

    /// Print the JSON outcome instead of a text summary
    #[arg(long)]
    pub json: bool,

    /// Parallel workers for execution
    #[arg(long, default_value_t = 4)]
    pub max_workers: u32,

    /// HTTP request timeout
    #[arg(long, default_value = "30s")]
    pub http_timeout: humantime::Duration,

    /// Split status poll interval
    #[arg(long, default_value = "1s")]
    pub split_poll_interval: humantime::Duration,

    /// Split status polls before giving up
    #[arg(long, default_value_t = 120)]
    pub split_max_attempts: u32,

    /// Execution monitoring budget per stage
    #[arg(long, default_value = "30m")]
    pub monitor_timeout: humantime::Duration,

    /// Live channel heartbeat interval
    #[arg(long, default_value = "30s")]
    pub heartbeat_interval: humantime::Duration,

    /// Base delay for live channel reconnects
    #[arg(long, default_value = "1s")]
    pub reconnect_base_delay: humantime::Duration,

    /// Live channel reconnect attempts before falling back to polling
    #[arg(long, default_value_t = 3)]
    pub max_reconnect_attempts: u32,

    /// Progress poll interval while the live channel is down
    #[arg(long, default_value = "2s")]
    pub fallback_poll_interval: humantime::Duration,

    /// Background live-channel probe interval while polling
    #[arg(long, default_value = "15s")]
    pub reconnect_probe_interval: humantime::Duration,

    /// Backend session lifetime
    #[arg(long, default_value = "2h")]
    pub session_timeout: humantime::Duration,

    /// Session expiry check interval
    #[arg(long, default_value = "60s")]
    pub expiry_check_interval: humantime::Duration,

    /// Remaining session time that triggers the one-time expiry warning
    #[arg(long, default_value = "30m")]
    pub expiry_warning: humantime::Duration,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Upload a workbook and run the translation pipeline
    Translate {
        /// Workbook to translate
        file: PathBuf,

        /// Workbook analysis JSON (sheet inventory)
        #[arg(long)]
        analysis: Option<PathBuf>,

        /// Glossary file to upload before translating
        #[arg(long)]
        glossary: Option<PathBuf>,

        /// Id of an already-uploaded glossary
        #[arg(long)]
        glossary_id: Option<String>,

        /// Where to write the translated result
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// List backend sessions
    Sessions,
    /// Download the result of a finished session
    Result {
        /// Session id
        id: String,

        /// Where to write the result
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

/// Generate a random job id for log correlation.
fn gen_job_id() -> String {
    let mut b = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut b);
    u64::from_le_bytes(b).to_string()
}

fn derive_ws_url(base_url: &str) -> String {
    if let Some(rest) = base_url.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base_url.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        format!("ws://{}", base_url)
    }
}

/// Build a `PipelineConfig` from CLI arguments.
pub fn build_config(args: &Cli) -> PipelineConfig {
    PipelineConfig {
        base_url: args.base_url.clone(),
        ws_base_url: args
            .ws_url
            .clone()
            .unwrap_or_else(|| derive_ws_url(&args.base_url)),
        job_id: gen_job_id(),
        bearer_token: args.token.clone(),
        user_agent: format!("sheetflow/{}", env!("CARGO_PKG_VERSION")),
        max_workers: args.max_workers,
        http_timeout: Duration::from(args.http_timeout),
        split_poll_interval: Duration::from(args.split_poll_interval),
        split_max_attempts: args.split_max_attempts,
        monitor_timeout: Duration::from(args.monitor_timeout),
        heartbeat_interval: Duration::from(args.heartbeat_interval),
        reconnect_base_delay: Duration::from(args.reconnect_base_delay),
        max_reconnect_attempts: args.max_reconnect_attempts,
        fallback_poll_interval: Duration::from(args.fallback_poll_interval),
        reconnect_probe_interval: Duration::from(args.reconnect_probe_interval),
        session_timeout: Duration::from(args.session_timeout),
        expiry_check_interval: Duration::from(args.expiry_check_interval),
        expiry_warning_threshold: Duration::from(args.expiry_warning),
    }
}

/// Prints expiry notifications through the output writer.
struct ConsoleNotifier {
    tx: mpsc::UnboundedSender<OutputLine>,
}

impl ExpiryNotifier for ConsoleNotifier {
    fn expiry_warning(&self, record: &SessionRecord, remaining_secs: i64) {
        let _ = self.tx.send(OutputLine::Stderr(format!(
            "Warning: session {} expires in {} min",
            record.session_id,
            remaining_secs / 60
        )));
    }

    fn session_expired(&self, record: &SessionRecord) {
        let _ = self.tx.send(OutputLine::Stderr(format!(
            "Session {} has expired. Start a new translation run.",
            record.session_id
        )));
    }
}

pub async fn run(args: Cli) -> Result<()> {
    let cfg = build_config(&args);
    let api: Arc<dyn PipelineApi> =
        Arc::new(HttpApiClient::new(&cfg).context("failed to build HTTP client")?);
    let store = Arc::new(FileSessionStore::in_data_dir()?);
    let (out_tx, out_handle) = spawn_output_writer();
    let notifier = Arc::new(ConsoleNotifier { tx: out_tx.clone() });
    let tracker = SessionTracker::new(
        store,
        notifier,
        cfg.session_timeout,
        cfg.expiry_warning_threshold,
        cfg.expiry_check_interval,
    );

    let result = match args.command.clone() {
        Command::Translate {
            file,
            analysis,
            glossary,
            glossary_id,
            output,
        } => {
            run_translate(
                &args,
                cfg,
                Arc::clone(&api),
                Arc::clone(&tracker),
                out_tx.clone(),
                TranslateArgs {
                    file,
                    analysis,
                    glossary,
                    glossary_id,
                    output,
                },
            )
            .await
        }
        Command::Sessions => {
            let router = build_router(Arc::clone(&api), Arc::clone(&tracker));
            let page = router.navigate("sessions").await;
            let _ = out_tx.send(OutputLine::Stdout(page));
            Ok(())
        }
        Command::Result { id, output } => {
            let router = build_router(Arc::clone(&api), Arc::clone(&tracker));
            let path = match output {
                Some(out) => format!("result/{}?out={}", id, out.display()),
                None => format!("result/{}", id),
            };
            let page = router.navigate(&path).await;
            let _ = out_tx.send(OutputLine::Stdout(page));
            Ok(())
        }
    };

    drop(out_tx);
    let _ = out_handle.await;
    result
}

struct TranslateArgs {
    file: PathBuf,
    analysis: Option<PathBuf>,
    glossary: Option<PathBuf>,
    glossary_id: Option<String>,
    output: Option<PathBuf>,
}

fn load_analysis(path: Option<&std::path::Path>) -> Result<AnalysisSummary> {
    let Some(path) = path else {
        return Ok(AnalysisSummary::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read analysis file {}", path.display()))?;
    serde_json::from_str(&text)
        .with_context(|| format!("invalid analysis JSON in {}", path.display()))
}

async fn run_translate(
    args: &Cli,
    cfg: PipelineConfig,
    api: Arc<dyn PipelineApi>,
    tracker: Arc<SessionTracker>,
    out_tx: mpsc::UnboundedSender<OutputLine>,
    translate: TranslateArgs,
) -> Result<()> {
    let analysis = load_analysis(translate.analysis.as_deref())?;
    let request = JobRequest {
        file: translate.file,
        analysis,
        glossary_file: translate.glossary,
        glossary_id: translate.glossary_id,
    };

    let channels = ProgressChannels::new(ChannelSettings::from_config(&cfg), Arc::clone(&api));
    let (evt_tx, mut evt_rx) = mpsc::unbounded_channel::<JobEvent>();
    let runner = Arc::new(WorkflowRunner::new(
        cfg,
        Arc::clone(&api),
        channels,
        Arc::clone(&tracker),
        evt_tx,
    ));

    // Ctrl-C aborts the job at the next suspension point.
    let cancel = runner.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let handle = {
        let runner = Arc::clone(&runner);
        tokio::spawn(async move { runner.execute(request).await })
    };
    // The event loop ends when the runner (and its sender) is gone.
    drop(runner);

    while let Some(ev) = evt_rx.recv().await {
        match ev {
            JobEvent::PhaseStarted { phase } => {
                let _ = out_tx.send(OutputLine::Stderr(format!("== {phase:?} ==")));
            }
            JobEvent::SessionCreated { session_id } => {
                let _ = out_tx.send(OutputLine::Stderr(format!("Session: {}", session_id)));
            }
            JobEvent::Progress {
                percent,
                message,
                error,
            } => {
                let line = if error {
                    format!("ERROR: {}", message)
                } else {
                    format!("[{:>5.1}%] {}", percent, message)
                };
                let _ = out_tx.send(OutputLine::Stderr(line));
            }
            JobEvent::Info(msg) => {
                let _ = out_tx.send(OutputLine::Stderr(msg));
            }
            JobEvent::JobCompleted { .. } => {}
        }
    }

    let outcome = handle.await.context("workflow task failed")??;
    let processed =
        process_job_completion(api.as_ref(), outcome, translate.output.as_deref()).await?;
    tracker.clear_session();

    if args.json {
        let _ = out_tx.send(OutputLine::Stdout(serde_json::to_string_pretty(
            &processed.outcome,
        )?));
    } else {
        for line in crate::summary::build_text_summary(&processed.outcome).lines {
            let _ = out_tx.send(OutputLine::Stdout(line));
        }
    }
    for msg in processed.messages {
        let _ = out_tx.send(OutputLine::Stderr(msg));
    }
    Ok(())
}

/// Page dispatch for the non-translate commands. The guard sends result
/// pages back to the session list when their session is not loadable.
fn build_router(api: Arc<dyn PipelineApi>, tracker: Arc<SessionTracker>) -> Router {
    let mut router = Router::new();

    {
        let api = Arc::clone(&api);
        let tracker = Arc::clone(&tracker);
        router.register("sessions", move |_ctx: RouteContext| {
            let api = Arc::clone(&api);
            let tracker = Arc::clone(&tracker);
            async move {
                let sessions = api.list_sessions().await?;
                let mut lines = if sessions.is_empty() {
                    vec!["No sessions".to_string()]
                } else {
                    let mut lines = vec![format!("{} session(s):", sessions.len())];
                    for s in sessions {
                        lines.push(format!(
                            "  {}  {}  {}",
                            s.session_id,
                            s.stage.as_deref().unwrap_or("-"),
                            s.filename.as_deref().unwrap_or("-")
                        ));
                    }
                    lines
                };
                if let Some(active) = tracker.active_session() {
                    lines.push(format!(
                        "Tracked locally: {} ({:?}, {} min left)",
                        active.session_id,
                        active.stage,
                        tracker.remaining_time().as_secs() / 60
                    ));
                }
                Ok(lines.join("\n"))
            }
        });
    }

    {
        let api = Arc::clone(&api);
        router.register("result/{id}", move |ctx: RouteContext| {
            let api = Arc::clone(&api);
            async move {
                let id = ctx.param.clone().context("missing session id")?;
                let bytes = api.download(&id).await?;
                let path = match ctx.query.get("out") {
                    Some(out) => PathBuf::from(out),
                    None => storage::default_result_path(&id)?,
                };
                storage::save_result(&path, &bytes)?;
                Ok(format!(
                    "Saved result for session {} to {}",
                    id,
                    path.display()
                ))
            }
        });
    }

    router.set_guard(move |path| {
        let Some(rest) = path.strip_prefix("result/") else {
            return GuardDecision::Allow;
        };
        let id = rest.split(['?', '/']).next().unwrap_or("");
        if tracker.load_session(id) {
            GuardDecision::Allow
        } else {
            GuardDecision::Redirect("sessions".to_string())
        }
    });

    router
}
