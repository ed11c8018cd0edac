//! Percent-band bookkeeping for unified job progress.
//!
//! Each pipeline stage owns a disjoint sub-range of the job's 0–100 scale.
//! Stage-native progress is remapped into the stage's band, and the reporter
//! clamps the result so overall progress never regresses within a job.

use crate::model::{JobEvent, JobOutcome, JobPhase};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy)]
pub(crate) struct StageBand {
    pub start: f64,
    pub end: f64,
}

impl StageBand {
    pub(crate) const fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    /// Remap stage-native 0–100 progress into this band.
    pub(crate) fn remap(&self, stage_percent: f64) -> f64 {
        let fraction = (stage_percent / 100.0).clamp(0.0, 1.0);
        self.start + fraction * (self.end - self.start)
    }
}

/// Split-wait and execution bands for one pipeline stage.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BandPlan {
    pub split: StageBand,
    pub execute: StageBand,
}

pub(crate) const STANDARD_STAGE: BandPlan = BandPlan {
    split: StageBand::new(0.0, 20.0),
    execute: StageBand::new(20.0, 90.0),
};
pub(crate) const STANDARD_FINALIZE: StageBand = StageBand::new(90.0, 100.0);

pub(crate) const CHAINED_STAGE_ONE: BandPlan = BandPlan {
    split: StageBand::new(5.0, 16.0),
    execute: StageBand::new(16.0, 60.0),
};
pub(crate) const CHAINED_STAGE_TWO: BandPlan = BandPlan {
    split: StageBand::new(60.0, 70.0),
    execute: StageBand::new(70.0, 95.0),
};
pub(crate) const CHAINED_FINALIZE: StageBand = StageBand::new(95.0, 100.0);

/// Emits job events, holding full-precision percents and enforcing
/// monotonicity for the lifetime of one job.
pub(crate) struct ProgressReporter {
    tx: mpsc::UnboundedSender<JobEvent>,
    last_percent: f64,
}

impl ProgressReporter {
    pub(crate) fn new(tx: mpsc::UnboundedSender<JobEvent>) -> Self {
        Self {
            tx,
            last_percent: 0.0,
        }
    }

    pub(crate) fn emit(&mut self, percent: f64, message: impl Into<String>) {
        let percent = percent.max(self.last_percent);
        self.last_percent = percent;
        let _ = self.tx.send(JobEvent::Progress {
            percent,
            message: message.into(),
            error: false,
        });
    }

    /// Error-flagged update at the last reported percent; always precedes a
    /// rejected job.
    pub(crate) fn emit_error(&mut self, message: impl Into<String>) {
        let _ = self.tx.send(JobEvent::Progress {
            percent: self.last_percent,
            message: message.into(),
            error: true,
        });
    }

    pub(crate) fn phase(&self, phase: JobPhase) {
        let _ = self.tx.send(JobEvent::PhaseStarted { phase });
    }

    pub(crate) fn info(&self, message: impl Into<String>) {
        let _ = self.tx.send(JobEvent::Info(message.into()));
    }

    pub(crate) fn session_created(&self, session_id: &str) {
        let _ = self.tx.send(JobEvent::SessionCreated {
            session_id: session_id.to_string(),
        });
    }

    pub(crate) fn completed(&self, outcome: &JobOutcome) {
        let _ = self.tx.send(JobEvent::JobCompleted {
            outcome: Box::new(outcome.clone()),
        });
    }
}
