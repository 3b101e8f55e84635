//! The compiled, (mostly) immutable input to an execution: steps, their
//! dependencies, declared inputs/outputs, and whatever was already known
//! from a prior run.
//!
//! `Plan` does grow at runtime in exactly one way: dynamic fan-out
//! instantiates new steps as mapping keys are observed (see `dynamic.rs`).
//! That is the sole permitted mutation; nothing ever removes or edits an
//! already-registered `StepSpec`.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use plan_types::{AssetKey, LogicalVersion, MappingKey, OutputName, StepKey, StepOutputHandle};

use crate::error::ExecutionError;

/// One of a step's declared inputs: the set of output handles that must be
/// produced before the input is satisfied. A handle is "missing" if the
/// producing step is an upstream dependency but did not actually produce
/// it (see `ActiveExecution::update`'s skip check).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepInput {
    pub name: String,
    pub source_handles: BTreeSet<StepOutputHandle>,
}

/// One of a step's declared outputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputSpec {
    pub name: OutputName,
    pub is_required: bool,
    pub is_dynamic: bool,
    pub asset_key: Option<AssetKey>,
}

impl OutputSpec {
    pub fn new(name: impl Into<OutputName>) -> Self {
        Self {
            name: name.into(),
            is_required: true,
            is_dynamic: false,
            asset_key: None,
        }
    }

    pub fn optional(mut self) -> Self {
        self.is_required = false;
        self
    }

    pub fn dynamic(mut self) -> Self {
        self.is_dynamic = true;
        self
    }

    pub fn producing_asset(mut self, asset_key: impl Into<AssetKey>) -> Self {
        self.asset_key = Some(asset_key.into());
        self
    }
}

/// A step's static declaration: what it depends on, what it consumes, what
/// it produces, and its scheduling tags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSpec {
    pub key: StepKey,
    pub deps: BTreeSet<StepKey>,
    pub inputs: Vec<StepInput>,
    pub outputs: Vec<OutputSpec>,
    pub tags: BTreeMap<String, String>,
}

impl StepSpec {
    pub fn new(key: impl Into<StepKey>) -> Self {
        Self {
            key: key.into(),
            deps: BTreeSet::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            tags: BTreeMap::new(),
        }
    }

    pub fn with_dep(mut self, dep: impl Into<StepKey>) -> Self {
        self.deps.insert(dep.into());
        self
    }

    pub fn with_input(mut self, name: impl Into<String>, handles: BTreeSet<StepOutputHandle>) -> Self {
        self.inputs.push(StepInput {
            name: name.into(),
            source_handles: handles,
        });
        self
    }

    pub fn with_output(mut self, output: OutputSpec) -> Self {
        self.outputs.push(output);
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.tags.insert("priority".to_string(), priority.to_string());
        self
    }

    /// `priority` tag, default 0 (required tag, section 6).
    pub fn priority(&self) -> i64 {
        self.tags
            .get("priority")
            .and_then(|p| p.parse::<i64>().ok())
            .unwrap_or(0)
    }

    pub fn has_output(&self, name: &str) -> Option<&OutputSpec> {
        self.outputs.iter().find(|o| o.name == name)
    }
}

/// For one asset key, the input-asset versions that produced its last known
/// logical version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetProvenanceRecord {
    pub asset_key: AssetKey,
    pub input_logical_versions: BTreeMap<AssetKey, LogicalVersion>,
}

/// Declares the shape of one dynamic fan-out at compile time: a parent
/// step's dynamic output, the per-mapping-key step to instantiate for each
/// observed mapping key, and (optionally) collector steps whose true
/// dependency set is only known once the mapping keys are resolved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DynamicFanoutTemplate {
    pub parent_step: StepKey,
    pub output_name: OutputName,
    /// Steps instantiated as `"{child_template}[{mapping_key}]"` per
    /// observed mapping key.
    pub child_template: StepKey,
    /// Dependencies every instantiated child carries in addition to the
    /// dynamic parent.
    pub child_base_deps: BTreeSet<StepKey>,
    /// Steps that depend on the *whole* resolved set of instances (they
    /// declare `child_template` itself as a placeholder dependency, which
    /// resolution replaces with the concrete instance keys).
    pub collectors: Vec<StepKey>,
}

/// What was already known from a prior run: previously-resolved dynamic
/// mappings, already-ready output handles (for resumption), prior retry
/// attempts, prior asset-provenance records, and parent-run linkage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KnownState {
    pub previous_retry_attempts: BTreeMap<StepKey, u32>,
    pub dynamic_mappings: BTreeMap<StepKey, BTreeMap<OutputName, Option<Vec<MappingKey>>>>,
    pub ready_outputs: BTreeSet<StepOutputHandle>,
    pub asset_provenance: Vec<AssetProvenanceRecord>,
    pub step_output_versions: BTreeMap<StepOutputHandle, LogicalVersion>,
    pub parent_state: Option<String>,
}

/// The persisted snapshot `ActiveExecution::get_known_state` hands back —
/// round-trippable: feeding it into a fresh `Plan`'s `KnownState` and
/// replaying the remaining event log must yield the same bucket state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KnownExecutionState {
    pub previous_retry_attempts: BTreeMap<StepKey, u32>,
    pub dynamic_mappings: BTreeMap<StepKey, BTreeMap<OutputName, Option<Vec<MappingKey>>>>,
    pub ready_outputs: BTreeSet<StepOutputHandle>,
    pub step_output_versions: BTreeMap<StepOutputHandle, LogicalVersion>,
    pub parent_state: Option<String>,
}

/// The compiled plan: a read-mostly set of step keys plus whatever dynamic
/// fan-out shape was declared at compile time.
#[derive(Debug, Clone)]
pub struct Plan {
    steps: BTreeMap<StepKey, StepSpec>,
    dynamic_templates: Vec<DynamicFanoutTemplate>,
    known_state: KnownState,
}

impl Plan {
    pub fn new(
        steps: impl IntoIterator<Item = StepSpec>,
        dynamic_templates: Vec<DynamicFanoutTemplate>,
        known_state: KnownState,
    ) -> Self {
        Self {
            steps: steps.into_iter().map(|s| (s.key.clone(), s)).collect(),
            dynamic_templates,
            known_state,
        }
    }

    pub fn known_state(&self) -> &KnownState {
        &self.known_state
    }

    pub fn dynamic_templates(&self) -> &[DynamicFanoutTemplate] {
        &self.dynamic_templates
    }

    pub fn get_step(&self, key: &str) -> Result<&StepSpec, ExecutionError> {
        self.steps
            .get(key)
            .ok_or_else(|| ExecutionError::UnknownStep(key.to_string()))
    }

    pub fn step_keys(&self) -> impl Iterator<Item = &StepKey> {
        self.steps.keys()
    }

    /// Dependency set used for scheduling, for every step currently known
    /// to the plan (excludes dependencies pruned by compilation, which is
    /// assumed already reflected in `StepSpec::deps`).
    pub fn get_executable_step_deps(&self) -> BTreeMap<StepKey, BTreeSet<StepKey>> {
        self.steps
            .iter()
            .map(|(k, s)| (k.clone(), s.deps.clone()))
            .collect()
    }

    /// Register newly instantiated steps (dynamic fan-out growth). Panics
    /// in debug builds if a key collides with an already-registered one —
    /// plan growth only ever adds keys the resolver just invented.
    pub fn register_steps(&mut self, new_steps: impl IntoIterator<Item = StepSpec>) {
        for step in new_steps {
            debug_assert!(
                !self.steps.contains_key(&step.key),
                "dynamic resolution must not redefine step {}",
                step.key
            );
            self.steps.insert(step.key.clone(), step);
        }
    }
}
