//! The closed error taxonomy a running execution can raise.
//!
//! Failed and abandoned steps are not errors of the state machine — they
//! are legitimate terminal statuses recovered by the abandon-propagation
//! rule. Only a broken precondition, a lost worker, or an interrupt produce
//! an `ExecutionError`.

use thiserror::Error;

use plan_types::StepKey;

/// Fatal errors raised by the state machine. None of these are meant to be
/// caught locally by the driver; they are reported up and the run ends.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// A precondition of the state machine was broken: a mark-complete call
    /// on a step that was not in flight, a `step_skipped` event arriving
    /// from outside the machine, a retry requested while retries are
    /// disabled, `release()` called while the plan is not complete, or any
    /// other broken invariant. No shared template — each call site supplies
    /// its own complete message, since "invariant violation" covers cases
    /// that have nothing to do with the plan finishing.
    #[error("{0}")]
    InvariantViolation(String),

    /// One or more in-flight steps never reported a terminal event.
    #[error(
        "execution exited with steps in an unknown state to this process: {0:?} \
         (likely caused by losing communication with the process performing step execution)"
    )]
    UnknownStepState(Vec<StepKey>),

    /// `mark_interrupted()` was called before the plan completed.
    #[error("execution was interrupted before completing the plan: {0}")]
    ExecutionInterrupted(String),

    /// A lookup by step key that the plan does not recognize.
    #[error("unknown step: {0}")]
    UnknownStep(StepKey),
}
