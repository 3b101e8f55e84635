//! `ActiveExecution`: the stateful driver that turns a [`Plan`] plus a
//! stream of [`Event`]s into batches of runnable step keys.
//!
//! Split the way `vwf-dag`'s `WorkflowState` splits its `impl` blocks across
//! files: this module holds construction and the small lifecycle methods,
//! `update` holds the pending -> executable/skip/abandon transition engine,
//! `batch` holds the admission-controlled issuance surface, and `events`
//! holds `handle_event` and the skip/abandon draining iterator.

mod batch;
mod events;
mod update;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use plan_types::{AssetKey, LogicalVersion, MappingKey, OutputName, StepKey, StepOutputHandle};

pub use events::PlanEventsIterator;

use crate::concurrency::TagConcurrencyRule;
use crate::error::ExecutionError;
use crate::plan::{AssetProvenanceRecord, KnownExecutionState, Plan, StepSpec};
use crate::retry::{RetryMode, RetryState};

/// A custom ordering key for batch issuance: steps sort by *descending*
/// value of this function, ties broken by ascending step key. Default is
/// `StepSpec::priority`, i.e. higher-priority steps run first.
pub type SortKeyFn = Box<dyn Fn(&StepSpec) -> i64 + Send + Sync>;

fn default_sort_key(step: &StepSpec) -> i64 {
    step.priority()
}

/// A per-execution interrupt flag. Deliberately not a process-global: a
/// host running several plans at once needs one of these per execution,
/// not one shared signal that cancels every run in the process (section 9
/// design note).
#[derive(Debug, Clone, Default)]
pub struct InterruptSignal(Arc<AtomicBool>);

impl InterruptSignal {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Read and clear the flag in one step.
    pub fn pop(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

/// Drives a [`Plan`] to completion. Holds the plan by value — the one
/// permitted mutation (dynamic fan-out growth) happens through this owned
/// handle via `Plan::register_steps`.
pub struct ActiveExecution {
    pub(super) plan: Plan,
    pub(super) retry_mode: RetryMode,
    pub(super) retry_state: RetryState,
    pub(super) sort_key_fn: SortKeyFn,
    pub(super) max_concurrent: Option<usize>,
    pub(super) tag_concurrency_rules: Vec<TagConcurrencyRule>,

    pub(super) guard_active: bool,

    pub(super) step_outputs: BTreeSet<StepOutputHandle>,
    pub(super) pending: BTreeMap<StepKey, BTreeSet<StepKey>>,
    /// Each step's last-resolved dependency set. Starts as `StepSpec::deps`
    /// for every step the plan knows about at construction, but is
    /// overwritten whenever dynamic resolution replaces a collector's
    /// placeholder dependency with its concrete instance set (`update.rs`).
    /// `mark_up_for_retry` reads from here rather than `Plan::get_step`
    /// precisely because `Plan` never edits a registered `StepSpec` in
    /// place — a collector's compile-time `deps` stays stale forever.
    pub(super) step_deps: BTreeMap<StepKey, BTreeSet<StepKey>>,

    pub(super) gathering_dynamic_outputs: BTreeMap<StepKey, BTreeMap<OutputName, Option<Vec<MappingKey>>>>,
    pub(super) completed_dynamic_outputs: BTreeMap<StepKey, BTreeMap<OutputName, Option<Vec<MappingKey>>>>,
    pub(super) new_dynamic_mappings: bool,

    pub(super) skipped_deps: BTreeMap<StepKey, Vec<String>>,

    pub(super) executable: Vec<StepKey>,
    pub(super) pending_skip: Vec<StepKey>,
    /// Reserved bucket named by the external interface; this state machine
    /// never populates it (retries land in `pending` or `waiting_to_retry`).
    pub(super) pending_retry: Vec<StepKey>,
    pub(super) pending_abandon: Vec<StepKey>,
    pub(super) waiting_to_retry: BTreeMap<StepKey, Instant>,

    pub(super) in_flight: BTreeSet<StepKey>,

    pub(super) success: BTreeSet<StepKey>,
    pub(super) failed: BTreeSet<StepKey>,
    pub(super) skipped: BTreeSet<StepKey>,
    pub(super) abandoned: BTreeSet<StepKey>,

    pub(super) unknown_state: BTreeSet<StepKey>,

    pub(super) interrupted: bool,
    pub(super) interrupt_signal: InterruptSignal,

    pub(super) runtime_asset_versions: BTreeMap<AssetKey, LogicalVersion>,
    pub(super) asset_provenance: BTreeMap<AssetKey, AssetProvenanceRecord>,
}

impl ActiveExecution {
    /// Build a new execution over `plan`. Seeds retry attempts, ready
    /// outputs, and already-resolved dynamic mappings from the plan's
    /// `KnownState`, then runs one `update()` pass to populate the initial
    /// `executable` batch.
    ///
    /// Returns `Result` rather than a bare value so a plan with a broken
    /// dependency reference surfaces as `UnknownStep` instead of a panic.
    pub fn new(
        plan: Plan,
        retry_mode: RetryMode,
        max_concurrent: Option<usize>,
        tag_concurrency_rules: Vec<TagConcurrencyRule>,
    ) -> Result<Self, ExecutionError> {
        Self::with_sort_key(
            plan,
            retry_mode,
            max_concurrent,
            tag_concurrency_rules,
            Box::new(default_sort_key),
        )
    }

    pub fn with_sort_key(
        plan: Plan,
        retry_mode: RetryMode,
        max_concurrent: Option<usize>,
        tag_concurrency_rules: Vec<TagConcurrencyRule>,
        sort_key_fn: SortKeyFn,
    ) -> Result<Self, ExecutionError> {
        let retry_state = RetryState::new(plan.known_state().previous_retry_attempts.clone());
        let step_outputs = plan.known_state().ready_outputs.clone();
        let completed_dynamic_outputs = plan.known_state().dynamic_mappings.clone();
        let asset_provenance = plan
            .known_state()
            .asset_provenance
            .iter()
            .map(|record| (record.asset_key.clone(), record.clone()))
            .collect();
        let pending = plan.get_executable_step_deps();
        let step_deps = pending.clone();

        let mut execution = Self {
            plan,
            retry_mode,
            retry_state,
            sort_key_fn,
            max_concurrent,
            tag_concurrency_rules,
            guard_active: false,
            step_outputs,
            pending,
            step_deps,
            gathering_dynamic_outputs: BTreeMap::new(),
            completed_dynamic_outputs,
            new_dynamic_mappings: false,
            skipped_deps: BTreeMap::new(),
            executable: Vec::new(),
            pending_skip: Vec::new(),
            pending_retry: Vec::new(),
            pending_abandon: Vec::new(),
            waiting_to_retry: BTreeMap::new(),
            in_flight: BTreeSet::new(),
            success: BTreeSet::new(),
            failed: BTreeSet::new(),
            skipped: BTreeSet::new(),
            abandoned: BTreeSet::new(),
            unknown_state: BTreeSet::new(),
            interrupted: false,
            interrupt_signal: InterruptSignal::new(),
            runtime_asset_versions: BTreeMap::new(),
            asset_provenance,
        };
        execution.update()?;
        Ok(execution)
    }

    /// Mark the guarded region entered. `get_steps_to_execute` and friends
    /// refuse to run outside of `acquire()`/`release()` (or `scoped`).
    pub fn acquire(&mut self) {
        self.guard_active = true;
    }

    /// Mark the guarded region exited, verifying the plan actually
    /// finished. Mirrors the source's `__exit__` check (section 6).
    pub fn release(&mut self) -> Result<(), ExecutionError> {
        self.guard_active = false;

        if !self.is_complete() {
            let state = self.describe_incomplete_state();
            return Err(if self.interrupted {
                ExecutionError::ExecutionInterrupted(state)
            } else {
                ExecutionError::InvariantViolation(format!(
                    "execution finished without completing the plan: {state}"
                ))
            });
        }

        if !self.unknown_state.is_empty() {
            let steps: Vec<StepKey> = self.unknown_state.iter().cloned().collect();
            return Err(if self.interrupted {
                ExecutionError::ExecutionInterrupted(format!(
                    "steps left in unknown state after interrupt: {steps:?}"
                ))
            } else {
                ExecutionError::UnknownStepState(steps)
            });
        }

        Ok(())
    }

    /// Run `body` inside `acquire()`/`release()`, guaranteeing `release()`
    /// runs even if `body` panics (the panic is then resumed).
    pub fn scoped<R>(&mut self, body: impl FnOnce(&mut Self) -> R) -> Result<R, ExecutionError> {
        self.acquire();
        match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| body(&mut *self))) {
            Ok(value) => {
                self.release()?;
                Ok(value)
            }
            Err(payload) => {
                self.guard_active = false;
                std::panic::resume_unwind(payload)
            }
        }
    }

    fn describe_incomplete_state(&self) -> String {
        format!(
            "pending={:?} in_flight={:?} executable={:?} pending_skip={:?} \
             pending_abandon={:?} waiting_to_retry={:?}",
            self.pending.keys().collect::<Vec<_>>(),
            self.in_flight,
            self.executable,
            self.pending_skip,
            self.pending_abandon,
            self.waiting_to_retry.keys().collect::<Vec<_>>(),
        )
    }

    /// True once every step has reached a terminal bucket and no step is
    /// pending, executable, in flight, or waiting.
    pub fn is_complete(&self) -> bool {
        self.pending.is_empty()
            && self.executable.is_empty()
            && self.in_flight.is_empty()
            && self.pending_skip.is_empty()
            && self.pending_retry.is_empty()
            && self.pending_abandon.is_empty()
            && self.waiting_to_retry.is_empty()
    }

    pub fn mark_interrupted(&mut self) {
        self.interrupted = true;
    }

    /// Poll (and clear) this execution's interrupt signal, recording it.
    pub fn check_for_interrupts(&mut self) -> bool {
        if self.interrupt_signal.pop() {
            self.interrupted = true;
        }
        self.interrupted
    }

    pub fn interrupt_signal(&self) -> InterruptSignal {
        self.interrupt_signal.clone()
    }

    pub fn retry_state(&self) -> &RetryState {
        &self.retry_state
    }

    pub fn get_step(&self, step_key: &str) -> Result<&StepSpec, ExecutionError> {
        self.plan.get_step(step_key)
    }

    pub(super) fn terminal_steps(&self) -> BTreeSet<StepKey> {
        self.success
            .union(&self.failed)
            .chain(self.skipped.iter())
            .chain(self.abandoned.iter())
            .cloned()
            .collect()
    }

    /// Snapshot of everything downstream execution needs to resume: prior
    /// retry attempts, resolved dynamic mappings, ready output handles, and
    /// whatever the plan already carried for step-output versions and
    /// parent-run linkage.
    pub fn get_known_state(&self) -> KnownExecutionState {
        KnownExecutionState {
            previous_retry_attempts: self.retry_state.snapshot_attempts(),
            dynamic_mappings: self.completed_dynamic_outputs.clone(),
            ready_outputs: self.step_outputs.clone(),
            step_output_versions: self.plan.known_state().step_output_versions.clone(),
            parent_state: self.plan.known_state().parent_state.clone(),
        }
    }
}
