use serde::{Deserialize, Serialize};

use super::{MappingKey, OutputName, StepKey};

/// Names one produced value: a step, one of its output names, and — for
/// dynamic outputs — the mapping key of the fan-out branch.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StepOutputHandle {
    pub step_key: StepKey,
    pub output_name: OutputName,
    pub mapping_key: Option<MappingKey>,
}

impl StepOutputHandle {
    pub fn new(step_key: impl Into<StepKey>, output_name: impl Into<OutputName>) -> Self {
        Self {
            step_key: step_key.into(),
            output_name: output_name.into(),
            mapping_key: None,
        }
    }

    pub fn with_mapping_key(mut self, mapping_key: impl Into<MappingKey>) -> Self {
        self.mapping_key = Some(mapping_key.into());
        self
    }
}
