//! Pipeline run state
//!
//! ```text
//! Stopped -> Starting -> Running <-> Draining -> Stopped
//!               \           |           /
//!                +------> Failed <-----+
//! ```
//!
//! `Failed` is terminal and keeps the error that caused it.

use crate::error::{CdcError, Result};
use crate::monitoring::MetricsCollectorTrait;
use crate::types::Position;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum PipelineState {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Draining = 3,
    Failed = 4,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Stopped => "stopped",
            PipelineState::Starting => "starting",
            PipelineState::Running => "running",
            PipelineState::Draining => "draining",
            PipelineState::Failed => "failed",
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => PipelineState::Stopped,
            1 => PipelineState::Starting,
            2 => PipelineState::Running,
            3 => PipelineState::Draining,
            _ => PipelineState::Failed,
        }
    }

    pub fn can_transition_to(&self, next: PipelineState) -> bool {
        use PipelineState::*;
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Draining)
                | (Running, Draining)
                | (Draining, Running)
                | (Draining, Stopped)
                | (Starting, Failed)
                | (Running, Failed)
                | (Draining, Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Failed)
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot reported to operators
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineStatus {
    pub source_id: String,
    pub state: PipelineState,
    pub last_error: Option<String>,
    pub last_checkpoint: Option<Position>,
}

/// Atomic state shared between the pipeline tasks and its handles
pub struct StateCell {
    source_id: String,
    state: AtomicU8,
    last_error: Mutex<Option<String>>,
    last_checkpoint: Mutex<Option<Position>>,
    metrics: Arc<dyn MetricsCollectorTrait>,
}

impl StateCell {
    pub fn new(source_id: impl Into<String>, metrics: Arc<dyn MetricsCollectorTrait>) -> Self {
        metrics.update_pipeline_state(PipelineState::Stopped.as_str());
        Self {
            source_id: source_id.into(),
            state: AtomicU8::new(PipelineState::Stopped as u8),
            last_error: Mutex::new(None),
            last_checkpoint: Mutex::new(None),
            metrics,
        }
    }

    pub fn get(&self) -> PipelineState {
        PipelineState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move to `next`, returning the previous state
    pub fn transition(&self, next: PipelineState) -> Result<PipelineState> {
        let mut current = self.get();
        loop {
            if !current.can_transition_to(next) {
                return Err(CdcError::generic(format!(
                    "Invalid pipeline state transition {} -> {} for source {}",
                    current, next, self.source_id
                )));
            }
            match self.state.compare_exchange(
                current as u8,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    info!("Pipeline {}: {} -> {}", self.source_id, current, next);
                    self.metrics.update_pipeline_state(next.as_str());
                    return Ok(current);
                }
                Err(actual) => current = PipelineState::from_u8(actual),
            }
        }
    }

    /// Enter `Failed` and keep `err` for status reporting
    pub fn fail(&self, err: &CdcError) {
        error!("Pipeline {} failed: {}", self.source_id, err);
        self.record_error(err);
        let previous = self.state.swap(PipelineState::Failed as u8, Ordering::AcqRel);
        if previous != PipelineState::Failed as u8 {
            self.metrics.update_pipeline_state(PipelineState::Failed.as_str());
        }
    }

    pub fn record_error(&self, err: &CdcError) {
        let mut last = self.last_error.lock().unwrap_or_else(|e| e.into_inner());
        *last = Some(err.to_string());
    }

    pub fn set_checkpoint(&self, position: Position) {
        let mut last = self.last_checkpoint.lock().unwrap_or_else(|e| e.into_inner());
        *last = Some(position);
    }

    pub fn status(&self) -> PipelineStatus {
        PipelineStatus {
            source_id: self.source_id.clone(),
            state: self.get(),
            last_error: self
                .last_error
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
            last_checkpoint: *self
                .last_checkpoint
                .lock()
                .unwrap_or_else(|e| e.into_inner()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::NoopMetrics;

    fn cell() -> StateCell {
        StateCell::new("src", Arc::new(NoopMetrics))
    }

    #[test]
    fn test_normal_lifecycle() {
        let state = cell();
        assert_eq!(state.get(), PipelineState::Stopped);
        state.transition(PipelineState::Starting).unwrap();
        state.transition(PipelineState::Running).unwrap();
        state.transition(PipelineState::Draining).unwrap();
        assert_eq!(
            state.transition(PipelineState::Stopped).unwrap(),
            PipelineState::Draining
        );
    }

    #[test]
    fn test_transitions_cannot_skip_draining() {
        let state = cell();
        assert!(state.transition(PipelineState::Running).is_err());
        state.transition(PipelineState::Starting).unwrap();
        state.transition(PipelineState::Running).unwrap();
        assert!(state.transition(PipelineState::Stopped).is_err());
        assert_eq!(state.get(), PipelineState::Running);
    }

    #[test]
    fn test_failed_is_terminal_and_keeps_error() {
        let state = cell();
        state.transition(PipelineState::Starting).unwrap();
        state.fail(&CdcError::publication("publication cdc_pub does not exist"));

        let status = state.status();
        assert_eq!(status.state, PipelineState::Failed);
        assert!(status.last_error.unwrap().contains("cdc_pub"));
        assert!(state.transition(PipelineState::Starting).is_err());
        assert!(state.get().is_terminal());
    }

    #[test]
    fn test_status_reports_checkpoint() {
        let state = cell();
        state.set_checkpoint(Position::new(0x40, 2));
        assert_eq!(state.status().last_checkpoint, Some(Position::new(0x40, 2)));
    }
}
