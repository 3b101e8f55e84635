//! The `pending` -> `executable` / `pending_skip` / `pending_abandon`
//! transition engine, plus the `waiting_to_retry` -> `executable` timer
//! check. Grounded on `active.py`'s `_update` (section 4.1 of the spec).

use plan_types::StepKey;

use super::ActiveExecution;
use crate::dynamic::DynamicResolver;
use crate::error::ExecutionError;
use crate::provenance::ProvenanceChecker;

impl ActiveExecution {
    /// Re-evaluate every pending step against the current terminal-bucket
    /// state, resolving any newly-completed dynamic mappings first. Called
    /// before every batch-issuance and skip/abandon query — it is the only
    /// place steps leave `pending`.
    pub(crate) fn update(&mut self) -> Result<(), ExecutionError> {
        self.resolve_dynamic_mappings_if_needed()?;

        let successful_or_skipped: std::collections::BTreeSet<StepKey> =
            self.success.union(&self.skipped).cloned().collect();
        let failed_or_abandoned: std::collections::BTreeSet<StepKey> =
            self.failed.union(&self.abandoned).cloned().collect();

        let mut to_execute = Vec::new();
        let mut to_skip = Vec::new();
        let mut to_abandon = Vec::new();

        for (step_key, requirements) in &self.pending {
            if !requirements.is_disjoint(&failed_or_abandoned) {
                to_abandon.push(step_key.clone());
                continue;
            }
            if !requirements.is_subset(&successful_or_skipped) {
                continue;
            }

            let step = self.plan.get_step(step_key)?;

            let mut skip_reason: Option<Vec<String>> = None;
            'inputs: for input in &step.inputs {
                let deps_for_input: Vec<_> = input
                    .source_handles
                    .iter()
                    .filter(|handle| requirements.contains(&handle.step_key))
                    .collect();
                if deps_for_input.is_empty() {
                    continue;
                }
                let missing: Vec<_> = deps_for_input
                    .iter()
                    .filter(|handle| !self.step_outputs.contains(**handle))
                    .collect();
                if missing.len() == deps_for_input.len() {
                    skip_reason = Some(
                        missing
                            .iter()
                            .map(|handle| format!("{}.{}", handle.step_key, handle.output_name))
                            .collect(),
                    );
                    break 'inputs;
                }
            }

            if skip_reason.is_none() {
                let checker =
                    ProvenanceChecker::new(&self.plan, &self.asset_provenance, &self.runtime_asset_versions);
                if !checker.is_provenance_changed(step) {
                    skip_reason = Some(Vec::new());
                }
            }

            match skip_reason {
                Some(reason) => {
                    self.skipped_deps.insert(step_key.clone(), reason);
                    to_skip.push(step_key.clone());
                }
                None => to_execute.push(step_key.clone()),
            }
        }

        for key in to_execute {
            self.pending.remove(&key);
            self.executable.push(key);
        }
        for key in to_skip {
            self.pending.remove(&key);
            self.pending_skip.push(key);
        }
        for key in to_abandon {
            self.pending.remove(&key);
            self.pending_abandon.push(key);
        }

        let now = std::time::Instant::now();
        let ready: Vec<StepKey> = self
            .waiting_to_retry
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in ready {
            self.waiting_to_retry.remove(&key);
            self.executable.push(key);
        }

        Ok(())
    }

    fn resolve_dynamic_mappings_if_needed(&mut self) -> Result<(), ExecutionError> {
        if !self.new_dynamic_mappings {
            return Ok(());
        }

        let terminal = self.terminal_steps();
        let resolution = DynamicResolver::new(self.plan.dynamic_templates(), &self.plan)
            .resolve(&self.completed_dynamic_outputs, &terminal)
            .map_err(|err| ExecutionError::InvariantViolation(err.to_string()))?;

        for step in &resolution.new_steps {
            self.step_deps.insert(step.key.clone(), step.deps.clone());
        }
        self.plan.register_steps(resolution.new_steps);
        for (key, deps) in resolution.updated_deps {
            self.step_deps.insert(key.clone(), deps.clone());
            self.pending.insert(key, deps);
        }
        self.new_dynamic_mappings = false;
        Ok(())
    }
}
