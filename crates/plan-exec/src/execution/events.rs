//! Event consumption: `handle_event`'s dispatch table, the `mark_*` bucket
//! transitions it drives, terminal verification, snapshot replay, and the
//! lazy skip/abandon draining iterator. Grounded on `active.py`'s
//! `handle_event` and `plan_events_iterator` (spec sections 4.3-4.5).

use std::time::{Duration, Instant};

use plan_types::{StepKey, StepOutputHandle};

use super::ActiveExecution;
use crate::error::ExecutionError;
use crate::event::{Event, ProducedEvent};

impl ActiveExecution {
    /// Apply one event reported by a worker (or replayed from a log).
    pub fn handle_event(&mut self, event: Event) -> Result<(), ExecutionError> {
        match event {
            Event::StepFailure { step_key } | Event::ResourceInitFailure { step_key } => {
                self.mark_failed(&step_key)
            }
            Event::StepSuccess { step_key } => self.mark_success(&step_key),
            Event::StepSkipped { step_key } => Err(ExecutionError::InvariantViolation(format!(
                "step {step_key} was reported skipped from outside the state machine; \
                 skips are only ever produced by plan_events_iterator"
            ))),
            Event::StepUpForRetry {
                step_key,
                seconds_to_wait,
            } => {
                let deadline = seconds_to_wait.map(|secs| Instant::now() + Duration::from_secs_f64(secs));
                self.mark_up_for_retry(&step_key, deadline)
            }
            Event::SuccessfulOutput { handle } => {
                self.mark_step_output_produced(handle);
                Ok(())
            }
            Event::StepMaterialization {
                asset_key,
                logical_version,
                ..
            } => {
                if let Some(version) = logical_version {
                    self.runtime_asset_versions.insert(asset_key, version);
                }
                Ok(())
            }
        }
    }

    fn mark_complete(&mut self, step_key: &str) -> Result<(), ExecutionError> {
        if !self.in_flight.remove(step_key) {
            return Err(ExecutionError::InvariantViolation(format!(
                "attempted to mark step {step_key} complete but it was not in flight"
            )));
        }
        Ok(())
    }

    pub fn mark_failed(&mut self, step_key: &str) -> Result<(), ExecutionError> {
        self.failed.insert(step_key.to_string());
        self.mark_complete(step_key)
    }

    pub fn mark_success(&mut self, step_key: &str) -> Result<(), ExecutionError> {
        self.success.insert(step_key.to_string());
        self.mark_complete(step_key)?;
        self.resolve_any_dynamic_outputs(step_key);
        Ok(())
    }

    pub(crate) fn mark_skipped(&mut self, step_key: &str) -> Result<(), ExecutionError> {
        self.skipped.insert(step_key.to_string());
        self.mark_complete(step_key)?;
        self.resolve_any_dynamic_outputs(step_key);
        Ok(())
    }

    pub(crate) fn mark_abandoned(&mut self, step_key: &str) -> Result<(), ExecutionError> {
        self.abandoned.insert(step_key.to_string());
        self.mark_complete(step_key)
    }

    /// Record a retry attempt and route the step according to `retry_mode`:
    /// disabled is a hard error, enabled re-queues it (immediately, or after
    /// `deadline`), deferred abandons it outright.
    pub fn mark_up_for_retry(&mut self, step_key: &str, deadline: Option<Instant>) -> Result<(), ExecutionError> {
        if self.retry_mode.is_disabled() {
            return Err(ExecutionError::InvariantViolation(format!(
                "step {step_key} was marked up for retry but this execution's retry mode is disabled"
            )));
        }

        self.retry_state.mark_attempt(step_key);

        if self.retry_mode.is_deferred() {
            self.abandoned.insert(step_key.to_string());
        } else if let Some(deadline) = deadline {
            self.waiting_to_retry.insert(step_key.to_string(), deadline);
        } else {
            // Read from `step_deps`, not `Plan::get_step` — a dynamic-fan-out
            // collector's registered `StepSpec.deps` is the compile-time
            // placeholder and never updated in place once resolved.
            let deps = self.step_deps.get(step_key).cloned().unwrap_or_default();
            self.pending.insert(step_key.to_string(), deps);
        }

        self.mark_complete(step_key)
    }

    pub fn mark_step_output_produced(&mut self, handle: StepOutputHandle) {
        if let Some(mapping_key) = handle.mapping_key.clone() {
            if let Some(per_output) = self.gathering_dynamic_outputs.get_mut(&handle.step_key) {
                if let Some(Some(mapping_keys)) = per_output.get_mut(&handle.output_name) {
                    mapping_keys.push(mapping_key);
                }
            }
        }
        self.step_outputs.insert(handle);
    }

    fn mark_unknown_state(&mut self, step_key: &str) -> Result<(), ExecutionError> {
        self.unknown_state.insert(step_key.to_string());
        self.mark_abandoned(step_key)
    }

    /// Called by a driver that lost contact with a step's worker: if it's
    /// still in flight, logs and abandons it into `unknown_state` rather
    /// than leaving the plan stuck waiting for an event that will never
    /// arrive.
    pub fn verify_complete(&mut self, step_key: &str) -> Result<(), ExecutionError> {
        if self.in_flight.contains(step_key) {
            tracing::error!(
                step = step_key,
                "step did not post a success or failure event before the process ended; \
                 downstream steps will not execute"
            );
            self.mark_unknown_state(step_key)?;
        }
        Ok(())
    }

    fn resolve_any_dynamic_outputs(&mut self, step_key: &str) {
        let Some(gathered) = self.gathering_dynamic_outputs.remove(step_key) else {
            return;
        };
        let step = self.plan.get_step(step_key).ok();

        let resolved = gathered
            .into_iter()
            .map(|(output_name, mapping_keys)| {
                let is_required = step
                    .and_then(|step| step.has_output(&output_name))
                    .map(|output| output.is_required)
                    .unwrap_or(true);
                let value = match mapping_keys {
                    Some(keys) if keys.is_empty() && !is_required => None,
                    other => other,
                };
                (output_name, value)
            })
            .collect();

        self.completed_dynamic_outputs.insert(step_key.to_string(), resolved);
        self.new_dynamic_mappings = true;
    }

    /// Replay a fully-drained event log against a freshly-constructed
    /// execution, returning the step keys still in flight at the end. Used
    /// to resume an execution from a prior `get_known_state()` snapshot.
    pub fn rebuild_from_events(&mut self, events: impl IntoIterator<Item = Event>) -> Result<Vec<StepKey>, ExecutionError> {
        self.get_steps_to_execute(None)?;
        for event in events {
            self.handle_event(event)?;
            self.get_steps_to_execute(None)?;
        }
        Ok(self.in_flight.iter().cloned().collect())
    }

    /// A lazy sequence of `StepSkipped`/`StepAbandonLogged` events: each
    /// call to `next()` drains one more step out of `pending_skip` or
    /// `pending_abandon`, logs it the way a worker-run step's completion
    /// would be logged, and marks it terminal.
    pub fn plan_events_iterator(&mut self) -> PlanEventsIterator<'_> {
        PlanEventsIterator {
            exec: self,
            skip_batch: Vec::new(),
            abandon_batch: Vec::new(),
            phase: Phase::Skipping,
        }
    }
}

enum Phase {
    Skipping,
    Abandoning,
    Done,
}

pub struct PlanEventsIterator<'a> {
    exec: &'a mut ActiveExecution,
    skip_batch: Vec<StepKey>,
    abandon_batch: Vec<StepKey>,
    phase: Phase,
}

impl<'a> PlanEventsIterator<'a> {
    fn next_skip(&mut self) -> Option<Result<ProducedEvent, ExecutionError>> {
        if self.skip_batch.is_empty() {
            self.skip_batch = match self.exec.get_steps_to_skip() {
                Ok(batch) => batch,
                Err(err) => return Some(Err(err)),
            };
            if self.skip_batch.is_empty() {
                return None;
            }
        }

        let step_key = self.skip_batch.remove(0);
        let skipped_deps = self.exec.skipped_deps.get(&step_key).cloned().unwrap_or_default();
        tracing::info!(
            step = %step_key,
            deps = ?skipped_deps,
            "skipping step: one or more dependencies did not produce the output it needs"
        );
        if let Err(err) = self.exec.mark_skipped(&step_key) {
            return Some(Err(err));
        }
        Some(Ok(ProducedEvent::StepSkipped {
            step_key,
            skipped_deps,
        }))
    }

    fn next_abandon(&mut self) -> Option<Result<ProducedEvent, ExecutionError>> {
        if self.abandon_batch.is_empty() {
            self.abandon_batch = match self.exec.get_steps_to_abandon() {
                Ok(batch) => batch,
                Err(err) => return Some(Err(err)),
            };
            if self.abandon_batch.is_empty() {
                return None;
            }
        }

        let step_key = self.abandon_batch.remove(0);
        let step = match self.exec.plan.get_step(&step_key) {
            Ok(step) => step,
            Err(err) => return Some(Err(err)),
        };
        let failed_inputs: Vec<StepKey> = step.deps.intersection(&self.exec.failed).cloned().collect();
        let abandoned_inputs: Vec<StepKey> = step.deps.intersection(&self.exec.abandoned).cloned().collect();
        tracing::error!(
            step = %step_key,
            failed = ?failed_inputs,
            abandoned = ?abandoned_inputs,
            "abandoning step: a dependency failed or was itself abandoned"
        );
        if let Err(err) = self.exec.mark_abandoned(&step_key) {
            return Some(Err(err));
        }
        Some(Ok(ProducedEvent::StepAbandonLogged {
            step_key,
            failed_inputs,
            abandoned_inputs,
        }))
    }
}

impl<'a> Iterator for PlanEventsIterator<'a> {
    type Item = Result<ProducedEvent, ExecutionError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.phase {
                Phase::Skipping => match self.next_skip() {
                    Some(item) => return Some(item),
                    None => self.phase = Phase::Abandoning,
                },
                Phase::Abandoning => match self.next_abandon() {
                    Some(item) => return Some(item),
                    None => self.phase = Phase::Done,
                },
                Phase::Done => return None,
            }
        }
    }
}
