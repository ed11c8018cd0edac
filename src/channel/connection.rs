//! Per-session connection task.
//!
//! Owns the live WebSocket for one session: heartbeat probes while open,
//! bounded exponential-backoff reconnect on non-manual drops, and degradation
//! to fixed-interval polling of the execution-progress endpoint once the
//! reconnect budget is exhausted. While polling, a slower background probe
//! keeps testing the live URL; a successful probe is promoted to the live
//! connection and polling stops, transparently to the sink.

use crate::api::PipelineApi;
use crate::channel::events::{parse_event, ChannelEvent, ProgressSink};
use crate::channel::{ChannelSettings, ConnectionState};
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const HEARTBEAT_FRAME: &str = r#"{"type":"ping"}"#;

#[derive(Debug)]
pub(crate) enum ConnCommand {
    Send(String),
    Disconnect,
}

/// State shared between the registry and the connection task.
pub(crate) struct ConnectionShared {
    state: Mutex<ConnectionState>,
    manual_close: AtomicBool,
}

impl ConnectionShared {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(ConnectionState::Connecting),
            manual_close: AtomicBool::new(false),
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.lock().expect("connection state lock poisoned")
    }

    pub(crate) fn mark_manual_close(&self) {
        self.manual_close.store(true, Ordering::SeqCst);
    }

    fn is_manual(&self) -> bool {
        self.manual_close.load(Ordering::SeqCst)
    }
}

enum LiveExit {
    /// Terminal success/failure event was dispatched.
    Terminal,
    /// Manual disconnect.
    Manual,
    /// Transport dropped; eligible for reconnect.
    Dropped,
}

enum PollExit {
    /// Background probe reopened the live channel.
    Resume(Box<WsStream>),
    Terminal,
    Manual,
}

pub(crate) struct ConnectionTask {
    pub(crate) session_id: String,
    pub(crate) settings: ChannelSettings,
    pub(crate) api: Arc<dyn PipelineApi>,
    pub(crate) sink: Arc<dyn ProgressSink>,
    pub(crate) shared: Arc<ConnectionShared>,
    pub(crate) cmd_rx: mpsc::UnboundedReceiver<ConnCommand>,
}

impl ConnectionTask {
    pub(crate) async fn run(mut self) {
        let url = self.settings.progress_url(&self.session_id);
        let mut attempts: u32 = 0;

        'lifecycle: loop {
            if self.shared.is_manual() {
                break;
            }
            self.set_state(ConnectionState::Connecting);

            match connect_async(url.as_str()).await {
                Ok((ws, _resp)) => {
                    attempts = 0;
                    self.set_state(ConnectionState::Live);
                    self.dispatch(|s| s.on_open());
                    match self.drive_live(ws).await {
                        LiveExit::Terminal | LiveExit::Manual => break 'lifecycle,
                        LiveExit::Dropped => {}
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        session_id = %self.session_id,
                        error = %e,
                        "live channel connect failed"
                    );
                }
            }

            if self.shared.is_manual() {
                break;
            }

            if attempts >= self.settings.max_reconnect_attempts {
                self.dispatch(|s| s.on_close("live channel lost, switching to polling"));
                self.set_state(ConnectionState::DegradedPolling);
                tracing::info!(
                    session_id = %self.session_id,
                    "reconnect budget exhausted, polling execution progress"
                );
                match self.drive_polling(&url).await {
                    PollExit::Resume(ws) => {
                        attempts = 0;
                        self.set_state(ConnectionState::Live);
                        self.dispatch(|s| s.on_open());
                        match self.drive_live(*ws).await {
                            LiveExit::Terminal | LiveExit::Manual => break 'lifecycle,
                            LiveExit::Dropped => continue 'lifecycle,
                        }
                    }
                    PollExit::Terminal | PollExit::Manual => break 'lifecycle,
                }
            }

            let delay = self
                .settings
                .reconnect_base_delay
                .saturating_mul(2u32.saturating_pow(attempts));
            attempts += 1;
            tracing::info!(
                session_id = %self.session_id,
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                "scheduling live channel reconnect"
            );
            if self.sleep_or_disconnect(delay).await {
                break;
            }
        }

        self.set_state(ConnectionState::Closed);
    }

    async fn drive_live(&mut self, ws: WsStream) -> LiveExit {
        let (mut write, mut read) = ws.split();
        let period = self.settings.heartbeat_interval;
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    if write
                        .send(Message::Text(HEARTBEAT_FRAME.into()))
                        .await
                        .is_err()
                    {
                        return LiveExit::Dropped;
                    }
                }
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(ConnCommand::Send(text)) => {
                        if write.send(Message::Text(text.into())).await.is_err() {
                            return LiveExit::Dropped;
                        }
                    }
                    Some(ConnCommand::Disconnect) | None => {
                        let _ = write.send(Message::Close(None)).await;
                        return LiveExit::Manual;
                    }
                },
                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(exit) = self.handle_frame(text.as_str()) {
                            return exit;
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = write.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => return LiveExit::Dropped,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!(
                            session_id = %self.session_id,
                            error = %e,
                            "live channel read failed"
                        );
                        return LiveExit::Dropped;
                    }
                },
            }
        }
    }

    /// Dispatch one inbound frame. Returns an exit when the frame is terminal.
    fn handle_frame(&self, text: &str) -> Option<LiveExit> {
        let event = match parse_event(text) {
            Ok(ev) => ev,
            Err(e) => {
                tracing::warn!(
                    session_id = %self.session_id,
                    error = %e,
                    "dropping malformed progress frame"
                );
                return None;
            }
        };

        match event {
            ChannelEvent::Pong => None,
            ChannelEvent::Progress(update) => {
                self.dispatch(|s| s.on_progress(&update));
                None
            }
            ChannelEvent::TaskUpdate(payload) => {
                self.dispatch(|s| s.on_task_update(&payload));
                None
            }
            ChannelEvent::BatchComplete(payload) => {
                self.dispatch(|s| s.on_batch_complete(&payload));
                None
            }
            ChannelEvent::Status(payload) => {
                self.dispatch(|s| s.on_status(&payload));
                None
            }
            ChannelEvent::Complete(payload) => {
                self.dispatch(|s| s.on_complete(&payload));
                Some(LiveExit::Terminal)
            }
            ChannelEvent::Error { message } => {
                self.dispatch(|s| s.on_error(&message));
                Some(LiveExit::Terminal)
            }
            ChannelEvent::Unrecognized { kind, payload } => {
                self.dispatch(|s| s.on_message(&kind, &payload));
                None
            }
        }
    }

    async fn drive_polling(&mut self, url: &str) -> PollExit {
        let poll_period = self.settings.fallback_poll_interval;
        let mut poll = interval_at(Instant::now() + poll_period, poll_period);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let probe_period = self.settings.reconnect_probe_interval;
        let mut probe = interval_at(Instant::now() + probe_period, probe_period);
        probe.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(ConnCommand::Send(_)) => {
                        // No live channel to write to; the registry rejects
                        // sends before they get here.
                    }
                    Some(ConnCommand::Disconnect) | None => return PollExit::Manual,
                },
                _ = poll.tick() => {
                    match self.api.execution_progress(&self.session_id).await {
                        Ok(update) => {
                            self.dispatch(|s| s.on_progress(&update));
                            if update.is_failed() {
                                let message = update
                                    .message
                                    .clone()
                                    .unwrap_or_else(|| "execution failed".to_string());
                                self.dispatch(|s| s.on_error(&message));
                                return PollExit::Terminal;
                            }
                            if update.is_terminal() {
                                let payload = serde_json::to_value(&update)
                                    .unwrap_or(serde_json::Value::Null);
                                self.dispatch(|s| s.on_complete(&payload));
                                return PollExit::Terminal;
                            }
                        }
                        Err(e) if e.is_transient() => {
                            tracing::warn!(
                                session_id = %self.session_id,
                                error = %e,
                                "progress poll failed"
                            );
                        }
                        Err(e) => {
                            self.dispatch(|s| s.on_error(&e.to_string()));
                            return PollExit::Terminal;
                        }
                    }
                }
                _ = probe.tick() => {
                    if let Ok((ws, _resp)) = connect_async(url).await {
                        tracing::info!(
                            session_id = %self.session_id,
                            "live channel recovered, leaving polling mode"
                        );
                        return PollExit::Resume(Box::new(ws));
                    }
                }
            }
        }
    }

    /// Sleep out a backoff delay. Returns true when a disconnect arrived.
    async fn sleep_or_disconnect(&mut self, delay: std::time::Duration) -> bool {
        let deadline = Instant::now() + delay;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return false,
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(ConnCommand::Send(_)) => {}
                    Some(ConnCommand::Disconnect) | None => return true,
                },
            }
        }
    }

    fn set_state(&self, state: ConnectionState) {
        *self
            .shared
            .state
            .lock()
            .expect("connection state lock poisoned") = state;
    }

    /// Manual close suppresses every further callback for this id.
    fn dispatch<F: FnOnce(&dyn ProgressSink)>(&self, f: F) {
        if !self.shared.is_manual() {
            f(self.sink.as_ref());
        }
    }
}
