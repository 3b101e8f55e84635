//! Events the state machine consumes from workers, and the events it
//! produces for skip/abandon propagation.
//!
//! Represented as tagged variants matched in one place (`handle_event`),
//! not as an event class hierarchy (section 9 design note).

use plan_types::{AssetKey, LogicalVersion, StepKey, StepOutputHandle};

/// One event reported back from a worker (or replayed from a log).
#[derive(Debug, Clone)]
pub enum Event {
    StepFailure { step_key: StepKey },
    ResourceInitFailure { step_key: StepKey },
    StepSuccess { step_key: StepKey },
    /// Rejected by `handle_event` with `InvariantViolation`: skip events are
    /// only ever emitted by this state machine, never consumed from it.
    StepSkipped { step_key: StepKey },
    StepUpForRetry {
        step_key: StepKey,
        seconds_to_wait: Option<f64>,
    },
    SuccessfulOutput { handle: StepOutputHandle },
    StepMaterialization {
        step_key: StepKey,
        asset_key: AssetKey,
        logical_version: Option<LogicalVersion>,
    },
}

impl Event {
    pub fn step_key(&self) -> &str {
        match self {
            Event::StepFailure { step_key }
            | Event::ResourceInitFailure { step_key }
            | Event::StepSuccess { step_key }
            | Event::StepSkipped { step_key }
            | Event::StepUpForRetry { step_key, .. }
            | Event::StepMaterialization { step_key, .. } => step_key,
            Event::SuccessfulOutput { handle } => &handle.step_key,
        }
    }
}

/// Events produced by `plan_events_iterator`: one `StepSkipped` per step
/// this run decided to skip, and one `StepAbandonLogged` per step this run
/// abandoned because an upstream dependency failed or was itself abandoned.
#[derive(Debug, Clone)]
pub enum ProducedEvent {
    StepSkipped {
        step_key: StepKey,
        skipped_deps: Vec<String>,
    },
    StepAbandonLogged {
        step_key: StepKey,
        failed_inputs: Vec<StepKey>,
        abandoned_inputs: Vec<StepKey>,
    },
}
