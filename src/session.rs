//! Session lifecycle tracking, independent of transport concerns.
//!
//! One tracker owns the active backend session: its expiry clock, stage
//! annotations, and persistence. Expiry produces a blocking notification
//! exactly once; a configurable threshold produces a one-time warning first.

use crate::model::{AnalysisSummary, SessionRecord, Stage};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Wall-clock now, unix seconds.
pub fn unix_now() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

/// Persistence for session records. The file-backed implementation lives in
/// `storage`; tests use an in-memory one.
pub trait SessionStore: Send + Sync {
    fn save(&self, record: &SessionRecord) -> anyhow::Result<()>;
    fn load(&self, session_id: &str) -> anyhow::Result<Option<SessionRecord>>;
    fn remove(&self, session_id: &str) -> anyhow::Result<()>;
}

/// User-facing expiry notifications. The warning is non-blocking; the
/// expired notification blocks further interaction with the session.
pub trait ExpiryNotifier: Send + Sync {
    fn expiry_warning(&self, record: &SessionRecord, remaining_secs: i64);
    fn session_expired(&self, record: &SessionRecord);
}

/// Outcome of one expiry check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryCheck {
    /// No session tracked, or plenty of time left.
    Active,
    /// Below the warning threshold.
    Warned,
    /// Clock lapsed; monitoring stops.
    Expired,
}

struct TrackerInner {
    active: Option<SessionRecord>,
    warning_shown: bool,
    expired_notified: bool,
}

pub struct SessionTracker {
    inner: Mutex<TrackerInner>,
    store: Arc<dyn SessionStore>,
    notifier: Arc<dyn ExpiryNotifier>,
    session_timeout: Duration,
    warning_threshold: Duration,
    check_interval: Duration,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl SessionTracker {
    pub fn new(
        store: Arc<dyn SessionStore>,
        notifier: Arc<dyn ExpiryNotifier>,
        session_timeout: Duration,
        warning_threshold: Duration,
        check_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(TrackerInner {
                active: None,
                warning_shown: false,
                expired_notified: false,
            }),
            store,
            notifier,
            session_timeout,
            warning_threshold,
            check_interval,
            monitor: Mutex::new(None),
        })
    }

    /// Register a freshly created backend session and start expiry
    /// monitoring. Returns the persisted record.
    pub fn create_session(
        self: &Arc<Self>,
        session_id: &str,
        filename: &str,
        analysis: &AnalysisSummary,
    ) -> SessionRecord {
        let now = unix_now();
        let record = SessionRecord {
            session_id: session_id.to_string(),
            filename: filename.to_string(),
            created_at: now,
            expires_at: now + self.session_timeout.as_secs() as i64,
            last_access: now,
            stage: Stage::Created,
            sheet_count: analysis.sheets.len() as u32,
        };

        if let Err(e) = self.store.save(&record) {
            tracing::warn!(session_id, error = %e, "failed to persist session record");
        }

        {
            let mut inner = self.lock_inner();
            inner.active = Some(record.clone());
            inner.warning_shown = false;
            inner.expired_notified = false;
        }
        self.start_monitor();

        tracing::info!(session_id, filename, "tracking new session");
        record
    }

    /// Activate tracking for a stored session. Returns false (never an
    /// error) when the record is missing, expired, or unreadable.
    pub fn load_session(self: &Arc<Self>, session_id: &str) -> bool {
        let record = match self.store.load(session_id) {
            Ok(Some(record)) => record,
            Ok(None) => return false,
            Err(e) => {
                tracing::warn!(session_id, error = %e, "failed to read session record");
                return false;
            }
        };

        let now = unix_now();
        if record.stage == Stage::Expired || record.is_expired(now) {
            return false;
        }

        let mut record = record;
        record.last_access = now;
        if let Err(e) = self.store.save(&record) {
            tracing::warn!(session_id, error = %e, "failed to persist session record");
        }

        {
            let mut inner = self.lock_inner();
            inner.active = Some(record);
            inner.warning_shown = false;
            inner.expired_notified = false;
        }
        self.start_monitor();
        true
    }

    /// Advance the active session's stage and refresh its access time.
    pub fn update_stage(&self, stage: Stage) -> anyhow::Result<()> {
        let record = {
            let mut inner = self.lock_inner();
            let active = inner
                .active
                .as_mut()
                .ok_or_else(|| anyhow::anyhow!("no active session"))?;
            if active.stage.is_terminal() {
                anyhow::bail!(
                    "session {} is {:?} and cannot change stage",
                    active.session_id,
                    active.stage
                );
            }
            active.stage = stage;
            active.last_access = unix_now();
            active.clone()
        };
        self.store.save(&record)?;
        Ok(())
    }

    /// Read-only view of the tracked session.
    pub fn active_session(&self) -> Option<SessionRecord> {
        self.lock_inner().active.clone()
    }

    pub fn remaining_time(&self) -> Duration {
        self.lock_inner()
            .active
            .as_ref()
            .map(|r| Duration::from_secs(r.remaining_secs(unix_now()) as u64))
            .unwrap_or(Duration::ZERO)
    }

    /// One expiry probe. Invoked by the monitor task on a fixed interval and
    /// directly by tests. Idempotent: the expired notification fires once.
    pub fn check_expiry(&self) -> ExpiryCheck {
        let now = unix_now();
        let (record, verdict) = {
            let mut inner = self.lock_inner();
            let Some(active) = inner.active.clone() else {
                return ExpiryCheck::Active;
            };

            if active.is_expired(now) {
                if inner.expired_notified {
                    return ExpiryCheck::Expired;
                }
                inner.expired_notified = true;
                if let Some(active) = inner.active.as_mut() {
                    active.stage = Stage::Expired;
                }
                let record = inner.active.clone().expect("active session vanished");
                (record, ExpiryCheck::Expired)
            } else if active.remaining_secs(now) <= self.warning_threshold.as_secs() as i64
                && !inner.warning_shown
            {
                inner.warning_shown = true;
                (active, ExpiryCheck::Warned)
            } else {
                return ExpiryCheck::Active;
            }
        };

        match verdict {
            ExpiryCheck::Expired => {
                if let Err(e) = self.store.save(&record) {
                    tracing::warn!(
                        session_id = %record.session_id,
                        error = %e,
                        "failed to persist expired session"
                    );
                }
                tracing::warn!(session_id = %record.session_id, "session expired");
                self.notifier.session_expired(&record);
            }
            ExpiryCheck::Warned => {
                let remaining = record.remaining_secs(now);
                tracing::info!(
                    session_id = %record.session_id,
                    remaining_secs = remaining,
                    "session expiry warning"
                );
                self.notifier.expiry_warning(&record, remaining);
            }
            ExpiryCheck::Active => {}
        }
        verdict
    }

    /// Stop monitoring, purge the persisted record, reset state.
    pub fn clear_session(&self) {
        self.stop_monitor();
        let record = {
            let mut inner = self.lock_inner();
            inner.warning_shown = false;
            inner.expired_notified = false;
            inner.active.take()
        };
        if let Some(record) = record {
            if let Err(e) = self.store.remove(&record.session_id) {
                tracing::warn!(
                    session_id = %record.session_id,
                    error = %e,
                    "failed to purge session record"
                );
            }
        }
    }

    fn start_monitor(self: &Arc<Self>) {
        self.stop_monitor();
        let tracker = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tracker.check_interval);
            // interval fires immediately; consume the first tick.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if matches!(tracker.check_expiry(), ExpiryCheck::Expired) {
                    break;
                }
            }
        });
        *self.monitor.lock().expect("monitor lock poisoned") = Some(handle);
    }

    fn stop_monitor(&self) {
        if let Some(handle) = self.monitor.lock().expect("monitor lock poisoned").take() {
            handle.abort();
        }
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, TrackerInner> {
        self.inner.lock().expect("tracker lock poisoned")
    }
}

impl Drop for SessionTracker {
    fn drop(&mut self) {
        if let Some(handle) = self.monitor.lock().expect("monitor lock poisoned").take() {
            handle.abort();
        }
    }
}
