//! Admission-controlled batch issuance: `get_steps_to_execute`,
//! `get_next_step`, `sleep_til_ready`, and the skip/abandon draining pair
//! that back `plan_events_iterator`. Grounded on `active.py`'s
//! `get_steps_to_execute` / `get_steps_to_skip` / `get_steps_to_abandon`
//! (spec section 4.2).

use plan_types::StepKey;

use super::ActiveExecution;
use crate::concurrency::TagConcurrencyCounter;
use crate::error::ExecutionError;
use crate::plan::StepSpec;

impl ActiveExecution {
    fn require_guard(&self) -> Result<(), ExecutionError> {
        if self.guard_active {
            Ok(())
        } else {
            Err(ExecutionError::InvariantViolation(
                "must call acquire() (or use scoped()) before issuing batches".to_string(),
            ))
        }
    }

    fn sorted_by_priority(&self, keys: Vec<StepKey>) -> Result<Vec<StepKey>, ExecutionError> {
        let mut scored = Vec::with_capacity(keys.len());
        for key in keys {
            let step = self.plan.get_step(&key)?;
            scored.push((key, (self.sort_key_fn)(step)));
        }
        scored.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        Ok(scored.into_iter().map(|(key, _)| key).collect())
    }

    /// The next batch of steps ready to run, in priority order, admitted
    /// under `max_concurrent` and any tag-concurrency rules. Moves admitted
    /// keys from `executable` into `in_flight` and preps dynamic-output
    /// gathering buffers for any step with a dynamic output.
    pub fn get_steps_to_execute(&mut self, limit: Option<usize>) -> Result<Vec<StepKey>, ExecutionError> {
        self.require_guard()?;
        self.update()?;

        let ordered = self.sorted_by_priority(self.executable.clone())?;

        let mut counter = if self.tag_concurrency_rules.is_empty() {
            None
        } else {
            let mut in_flight_specs = Vec::with_capacity(self.in_flight.len());
            for key in &self.in_flight {
                in_flight_specs.push(self.plan.get_step(key)?);
            }
            Some(TagConcurrencyCounter::new(
                self.tag_concurrency_rules.clone(),
                &in_flight_specs,
            ))
        };

        let mut batch = Vec::new();
        for key in ordered {
            if let Some(limit) = limit {
                if batch.len() >= limit {
                    break;
                }
            }
            if let Some(max) = self.max_concurrent {
                if batch.len() + self.in_flight.len() >= max {
                    break;
                }
            }

            let step: &StepSpec = self.plan.get_step(&key)?;
            if let Some(counter) = counter.as_mut() {
                if counter.is_blocked(step) {
                    continue;
                }
                counter.update_counters_with_launched_item(step);
            }
            batch.push(key);
        }

        for key in &batch {
            self.executable.retain(|k| k != key);
            self.in_flight.insert(key.clone());
            self.prep_for_dynamic_outputs(key)?;
        }

        Ok(batch)
    }

    fn prep_for_dynamic_outputs(&mut self, step_key: &str) -> Result<(), ExecutionError> {
        let step = self.plan.get_step(step_key)?;
        let dynamic_outputs: Vec<_> = step
            .outputs
            .iter()
            .filter(|output| output.is_dynamic)
            .map(|output| output.name.clone())
            .collect();
        if !dynamic_outputs.is_empty() {
            let gathering = dynamic_outputs
                .into_iter()
                .map(|name| (name, Some(Vec::new())))
                .collect();
            self.gathering_dynamic_outputs
                .insert(step_key.to_string(), gathering);
        }
        Ok(())
    }

    pub(super) fn skip_for_dynamic_outputs(&mut self, step_key: &str) -> Result<(), ExecutionError> {
        let step = self.plan.get_step(step_key)?;
        let dynamic_outputs: Vec<_> = step
            .outputs
            .iter()
            .filter(|output| output.is_dynamic)
            .map(|output| output.name.clone())
            .collect();
        if !dynamic_outputs.is_empty() {
            let gathering = dynamic_outputs.into_iter().map(|name| (name, None)).collect();
            self.gathering_dynamic_outputs
                .insert(step_key.to_string(), gathering);
        }
        Ok(())
    }

    /// Drain `pending_skip`, marking each drained step `in_flight` so
    /// `plan_events_iterator` can push it through `mark_skipped` the same
    /// way a worker-run step is pushed through `mark_success`.
    pub fn get_steps_to_skip(&mut self) -> Result<Vec<StepKey>, ExecutionError> {
        self.update()?;
        let drained: Vec<StepKey> = self.pending_skip.drain(..).collect();
        for key in &drained {
            self.in_flight.insert(key.clone());
            self.skip_for_dynamic_outputs(key)?;
        }
        self.sorted_by_priority(drained)
    }

    pub fn get_steps_to_abandon(&mut self) -> Result<Vec<StepKey>, ExecutionError> {
        self.update()?;
        let drained: Vec<StepKey> = self.pending_abandon.drain(..).collect();
        for key in &drained {
            self.in_flight.insert(key.clone());
        }
        self.sorted_by_priority(drained)
    }

    /// Block until the earliest `waiting_to_retry` deadline elapses. A
    /// no-op if nothing is waiting.
    pub fn sleep_til_ready(&self) {
        if let Some(deadline) = self.waiting_to_retry.values().min() {
            let now = std::time::Instant::now();
            if *deadline > now {
                std::thread::sleep(*deadline - now);
            }
        }
    }

    /// Convenience for drivers that process one step at a time: returns the
    /// single highest-priority executable step, sleeping past any retry
    /// wait if nothing is immediately executable.
    pub fn get_next_step(&mut self) -> Result<StepKey, ExecutionError> {
        loop {
            let mut batch = self.get_steps_to_execute(Some(1))?;
            if let Some(step) = batch.pop() {
                return Ok(step);
            }
            if self.waiting_to_retry.is_empty() {
                return Err(ExecutionError::InvariantViolation(
                    "get_next_step called with nothing executable and nothing waiting to retry".to_string(),
                ));
            }
            self.sleep_til_ready();
        }
    }
}
