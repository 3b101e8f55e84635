//! The execution-plan state machine: drives a compiled [`Plan`] of steps
//! through their dependency graph, admitting steps to run, propagating
//! skips and abandons downstream, resolving dynamic fan-out, and verifying
//! that every step reaches a terminal state.
//!
//! This crate does not compile plans, execute steps, or persist anything —
//! it consumes a [`Plan`] and a stream of [`Event`]s and produces batches of
//! step keys to run next. See `execution` for the state machine itself.

mod concurrency;
mod dynamic;
mod error;
mod event;
mod execution;
mod plan;
mod provenance;
mod retry;

pub use concurrency::{TagConcurrencyCounter, TagConcurrencyRule};
pub use dynamic::{DynamicResolution, DynamicResolveError, DynamicResolver};
pub use error::ExecutionError;
pub use event::{Event, ProducedEvent};
pub use execution::{ActiveExecution, InterruptSignal, PlanEventsIterator, SortKeyFn};
pub use plan::{
    AssetProvenanceRecord, DynamicFanoutTemplate, KnownExecutionState, KnownState, OutputSpec,
    Plan, StepInput, StepSpec,
};
pub use provenance::ProvenanceChecker;
pub use retry::{RetryMode, RetryState};
