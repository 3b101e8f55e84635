//! Dynamic fan-out resolution.
//!
//! Given the mapping keys observed for a parent step's dynamic outputs,
//! expands the plan with the resulting downstream step dependencies. Plan
//! growth only ever adds keys; it never edits an existing step, and it
//! refuses to create a dependency edge that would require an
//! already-terminal step to wait on a key that didn't exist yet (section 9
//! design note: "the resolver must refuse to create an edge that points
//! back into an already-terminal step").

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;

use plan_types::{MappingKey, OutputName, StepKey};

use crate::plan::{DynamicFanoutTemplate, Plan, StepInput, StepSpec};

#[derive(Debug, Error)]
pub enum DynamicResolveError {
    #[error("dynamic output {parent}.{output_name} is required but resolved with zero mapping keys")]
    RequiredOutputEmpty {
        parent: StepKey,
        output_name: OutputName,
    },

    #[error("dynamic resolution would re-activate already-terminal step {step_key}")]
    CycleIntoTerminalStep { step_key: StepKey },
}

/// Result of one resolution pass: newly instantiated step specs to
/// register with the plan, plus the dependency sets (for those new steps
/// *and* any collectors whose dependency set just became concrete) that the
/// caller should install into its `pending` map.
#[derive(Debug, Default)]
pub struct DynamicResolution {
    pub new_steps: Vec<StepSpec>,
    pub updated_deps: BTreeMap<StepKey, BTreeSet<StepKey>>,
}

/// Resolves dynamic fan-out templates against observed mapping keys.
pub struct DynamicResolver<'a> {
    templates: &'a [DynamicFanoutTemplate],
    plan: &'a Plan,
}

impl<'a> DynamicResolver<'a> {
    pub fn new(templates: &'a [DynamicFanoutTemplate], plan: &'a Plan) -> Self {
        Self { templates, plan }
    }

    /// `completed`: step_key -> output_name -> (mapping keys | None-for-skipped).
    /// `terminal_steps`: every step key currently in a terminal bucket,
    /// used for the cycle-into-terminal-step guard.
    pub fn resolve(
        &self,
        completed: &BTreeMap<StepKey, BTreeMap<OutputName, Option<Vec<MappingKey>>>>,
        terminal_steps: &BTreeSet<StepKey>,
    ) -> Result<DynamicResolution, DynamicResolveError> {
        let mut resolution = DynamicResolution::default();

        for template in self.templates {
            let Some(per_output) = completed.get(&template.parent_step) else {
                continue;
            };
            let Some(mapping) = per_output.get(&template.output_name) else {
                continue;
            };

            match mapping {
                None => {
                    self.resolve_empty(template, &mut resolution, terminal_steps)?;
                }
                Some(mapping_keys) => {
                    if mapping_keys.is_empty() && self.output_is_required(template) {
                        return Err(DynamicResolveError::RequiredOutputEmpty {
                            parent: template.parent_step.clone(),
                            output_name: template.output_name.clone(),
                        });
                    }
                    self.resolve_instances(template, mapping_keys, &mut resolution, terminal_steps)?;
                }
            }
        }

        Ok(resolution)
    }

    fn output_is_required(&self, template: &DynamicFanoutTemplate) -> bool {
        self.plan
            .get_step(&template.parent_step)
            .ok()
            .and_then(|step| step.has_output(&template.output_name))
            .map(|output| output.is_required)
            .unwrap_or(false)
    }

    fn resolve_empty(
        &self,
        template: &DynamicFanoutTemplate,
        resolution: &mut DynamicResolution,
        terminal_steps: &BTreeSet<StepKey>,
    ) -> Result<(), DynamicResolveError> {
        for collector in &template.collectors {
            self.update_collector(template, collector, &BTreeSet::new(), resolution, terminal_steps)?;
        }
        Ok(())
    }

    fn resolve_instances(
        &self,
        template: &DynamicFanoutTemplate,
        mapping_keys: &[MappingKey],
        resolution: &mut DynamicResolution,
        terminal_steps: &BTreeSet<StepKey>,
    ) -> Result<(), DynamicResolveError> {
        let mut instance_keys = BTreeSet::new();

        for mapping_key in mapping_keys {
            let child_key = format!("{}[{}]", template.child_template, mapping_key);
            if terminal_steps.contains(&child_key) {
                return Err(DynamicResolveError::CycleIntoTerminalStep { step_key: child_key });
            }

            let mut deps = template.child_base_deps.clone();
            deps.insert(template.parent_step.clone());

            let input = StepInput {
                name: template.output_name.clone(),
                source_handles: BTreeSet::from([plan_types::StepOutputHandle::new(
                    template.parent_step.clone(),
                    template.output_name.clone(),
                )
                .with_mapping_key(mapping_key.clone())]),
            };

            let step = StepSpec::new(child_key.clone())
                .with_input(input.name.clone(), input.source_handles.clone());
            let step = deps.iter().fold(step, |s, d| s.with_dep(d.clone()));

            resolution.updated_deps.insert(child_key.clone(), deps);
            resolution.new_steps.push(step);
            instance_keys.insert(child_key);
        }

        for collector in &template.collectors {
            self.update_collector(template, collector, &instance_keys, resolution, terminal_steps)?;
        }

        Ok(())
    }

    fn update_collector(
        &self,
        template: &DynamicFanoutTemplate,
        collector: &StepKey,
        instance_keys: &BTreeSet<StepKey>,
        resolution: &mut DynamicResolution,
        terminal_steps: &BTreeSet<StepKey>,
    ) -> Result<(), DynamicResolveError> {
        if terminal_steps.contains(collector) {
            return Err(DynamicResolveError::CycleIntoTerminalStep {
                step_key: collector.clone(),
            });
        }

        let mut deps = self
            .plan
            .get_step(collector)
            .map(|s| s.deps.clone())
            .unwrap_or_default();
        deps.remove(&template.child_template);
        deps.extend(instance_keys.iter().cloned());

        resolution.updated_deps.insert(collector.clone(), deps);
        Ok(())
    }
}
