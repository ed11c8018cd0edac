//! Live progress channels, one per backend session.
//!
//! The registry owns at most one connection per session id. Connecting an id
//! that already has a connection retires the old one first; the caller never
//! sees events from a retired connection.

mod connection;
mod events;

pub use events::ProgressSink;

use crate::api::PipelineApi;
use crate::model::PipelineConfig;
use connection::{ConnCommand, ConnectionShared, ConnectionTask};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Live,
    DegradedPolling,
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("no open channel for session {0}")]
    NotConnected(String),
}

/// Transport tuning for one connection, extracted from the app config.
#[derive(Debug, Clone)]
pub struct ChannelSettings {
    pub ws_base_url: String,
    pub heartbeat_interval: Duration,
    pub reconnect_base_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub fallback_poll_interval: Duration,
    pub reconnect_probe_interval: Duration,
}

impl ChannelSettings {
    pub fn from_config(cfg: &PipelineConfig) -> Self {
        Self {
            ws_base_url: cfg.ws_base_url.trim_end_matches('/').to_string(),
            heartbeat_interval: cfg.heartbeat_interval,
            reconnect_base_delay: cfg.reconnect_base_delay,
            max_reconnect_attempts: cfg.max_reconnect_attempts,
            fallback_poll_interval: cfg.fallback_poll_interval,
            reconnect_probe_interval: cfg.reconnect_probe_interval,
        }
    }

    fn progress_url(&self, session_id: &str) -> String {
        format!("{}/ws/progress/{}", self.ws_base_url, session_id)
    }
}

struct ConnectionHandle {
    cmd_tx: mpsc::UnboundedSender<ConnCommand>,
    shared: Arc<ConnectionShared>,
    generation: u64,
}

/// Registry of live progress connections, keyed by session id.
///
/// Constructed once at the composition root and passed by reference; there is
/// no global instance.
pub struct ProgressChannels {
    settings: ChannelSettings,
    api: Arc<dyn PipelineApi>,
    connections: Arc<Mutex<HashMap<String, ConnectionHandle>>>,
    next_generation: std::sync::atomic::AtomicU64,
}

impl ProgressChannels {
    pub fn new(settings: ChannelSettings, api: Arc<dyn PipelineApi>) -> Self {
        Self {
            settings,
            api,
            connections: Arc::new(Mutex::new(HashMap::new())),
            next_generation: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Open a live channel for `session_id`, dispatching events to `sink`.
    /// Returns immediately; connection management runs on its own task.
    pub fn connect(&self, session_id: &str, sink: Arc<dyn ProgressSink>) {
        // Idempotent replace: retire any prior connection for this id.
        self.disconnect(session_id);

        let generation = self
            .next_generation
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(ConnectionShared::new());

        let task = ConnectionTask {
            session_id: session_id.to_string(),
            settings: self.settings.clone(),
            api: Arc::clone(&self.api),
            sink,
            shared: Arc::clone(&shared),
            cmd_rx,
        };

        {
            let mut map = self.lock_connections();
            map.insert(
                session_id.to_string(),
                ConnectionHandle {
                    cmd_tx,
                    shared,
                    generation,
                },
            );
        }

        let connections = Arc::clone(&self.connections);
        let id = session_id.to_string();
        tokio::spawn(async move {
            task.run().await;
            // Drop the registry entry unless a newer connection took the id.
            let mut map = connections.lock().expect("connection registry poisoned");
            if map.get(&id).is_some_and(|h| h.generation == generation) {
                map.remove(&id);
            }
        });
    }

    /// Tear down the channel for `session_id`. Immediate and final: no
    /// further callbacks, reconnects, or polls fire for this id.
    pub fn disconnect(&self, session_id: &str) {
        let handle = self.lock_connections().remove(session_id);
        if let Some(handle) = handle {
            handle.shared.mark_manual_close();
            let _ = handle.cmd_tx.send(ConnCommand::Disconnect);
        }
    }

    /// Send a text message over the live channel.
    pub fn send(&self, session_id: &str, message: &str) -> Result<(), ChannelError> {
        let map = self.lock_connections();
        let handle = map
            .get(session_id)
            .filter(|h| h.shared.state() == ConnectionState::Live)
            .ok_or_else(|| ChannelError::NotConnected(session_id.to_string()))?;
        handle
            .cmd_tx
            .send(ConnCommand::Send(message.to_string()))
            .map_err(|_| ChannelError::NotConnected(session_id.to_string()))
    }

    pub fn is_connected(&self, session_id: &str) -> bool {
        self.connection_state(session_id) == ConnectionState::Live
    }

    pub fn connection_state(&self, session_id: &str) -> ConnectionState {
        self.lock_connections()
            .get(session_id)
            .map(|h| h.shared.state())
            .unwrap_or(ConnectionState::Closed)
    }

    fn lock_connections(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<String, ConnectionHandle>> {
        self.connections.lock().expect("connection registry poisoned")
    }
}
