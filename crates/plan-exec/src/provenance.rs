//! Provenance-driven skip decisions.
//!
//! A step's materialization would be byte-identical to its last run if the
//! logical versions of its upstream asset inputs match what was recorded
//! when its output assets were last produced. When that holds, the step is
//! skipped rather than re-run.
//!
//! Preserved from the source verbatim (section 9 open question): this is
//! evaluated unconditionally, even for steps with no asset outputs at all —
//! such a step always has an empty `existing` set, which this returns
//! `true` (changed, i.e. *not* skipped) for. Non-asset steps never skip for
//! provenance reasons.

use std::collections::BTreeMap;

use plan_types::{AssetKey, LogicalVersion};

use crate::plan::{AssetProvenanceRecord, Plan, StepSpec};

/// Checks whether a step's projected inputs match its recorded provenance.
pub struct ProvenanceChecker<'a> {
    plan: &'a Plan,
    asset_provenance: &'a BTreeMap<AssetKey, AssetProvenanceRecord>,
    runtime_asset_versions: &'a BTreeMap<AssetKey, LogicalVersion>,
}

impl<'a> ProvenanceChecker<'a> {
    pub fn new(
        plan: &'a Plan,
        asset_provenance: &'a BTreeMap<AssetKey, AssetProvenanceRecord>,
        runtime_asset_versions: &'a BTreeMap<AssetKey, LogicalVersion>,
    ) -> Self {
        Self {
            plan,
            asset_provenance,
            runtime_asset_versions,
        }
    }

    /// True iff there is no prior provenance for any of `step`'s output
    /// assets, or the projected input versions differ from what's
    /// recorded — i.e. the step should (re)run. False means: skip it, the
    /// output would be unchanged.
    pub fn is_provenance_changed(&self, step: &StepSpec) -> bool {
        let mut existing: BTreeMap<AssetKey, LogicalVersion> = BTreeMap::new();
        for output in &step.outputs {
            let Some(asset_key) = &output.asset_key else {
                continue;
            };
            if let Some(record) = self.asset_provenance.get(asset_key) {
                existing.extend(record.input_logical_versions.clone());
            }
        }

        let mut projected: BTreeMap<AssetKey, LogicalVersion> = BTreeMap::new();
        for input in &step.inputs {
            for handle in &input.source_handles {
                let Ok(producer) = self.plan.get_step(&handle.step_key) else {
                    continue;
                };
                let Some(output) = producer.has_output(&handle.output_name) else {
                    continue;
                };
                let Some(asset_key) = &output.asset_key else {
                    continue;
                };
                if let Some(version) = self.runtime_asset_versions.get(asset_key) {
                    projected.insert(asset_key.clone(), version.clone());
                }
            }
        }

        existing.is_empty() || existing != projected
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::plan::{KnownState, OutputSpec};
    use plan_types::StepOutputHandle;

    fn plan_with(upstream: StepSpec, downstream: StepSpec) -> Plan {
        Plan::new(vec![upstream, downstream], vec![], KnownState::default())
    }

    #[test]
    fn no_prior_provenance_means_changed() {
        let upstream = StepSpec::new("U").with_output(OutputSpec::new("out").producing_asset("k0"));
        let downstream = StepSpec::new("S")
            .with_dep("U")
            .with_input("in", BTreeSet::from([StepOutputHandle::new("U", "out")]))
            .with_output(OutputSpec::new("out").producing_asset("k1"));
        let plan = plan_with(upstream, downstream);

        let provenance = BTreeMap::new();
        let runtime = BTreeMap::new();
        let checker = ProvenanceChecker::new(&plan, &provenance, &runtime);

        assert!(checker.is_provenance_changed(plan.get_step("S").unwrap()));
    }

    #[test]
    fn matching_versions_are_unchanged() {
        let upstream = StepSpec::new("U").with_output(OutputSpec::new("out").producing_asset("k0"));
        let downstream = StepSpec::new("S")
            .with_dep("U")
            .with_input("in", BTreeSet::from([StepOutputHandle::new("U", "out")]))
            .with_output(OutputSpec::new("out").producing_asset("k1"));
        let plan = plan_with(upstream, downstream);

        let mut provenance = BTreeMap::new();
        provenance.insert(
            "k1".to_string(),
            AssetProvenanceRecord {
                asset_key: "k1".to_string(),
                input_logical_versions: BTreeMap::from([("k0".to_string(), "v1".to_string())]),
            },
        );
        let mut runtime = BTreeMap::new();
        runtime.insert("k0".to_string(), "v1".to_string());
        let checker = ProvenanceChecker::new(&plan, &provenance, &runtime);
        assert!(!checker.is_provenance_changed(plan.get_step("S").unwrap()));

        let mut runtime_changed = BTreeMap::new();
        runtime_changed.insert("k0".to_string(), "v2".to_string());
        let checker_changed = ProvenanceChecker::new(&plan, &provenance, &runtime_changed);
        assert!(checker_changed.is_provenance_changed(plan.get_step("S").unwrap()));
    }

    #[test]
    fn non_asset_step_never_skips() {
        let step = StepSpec::new("S");
        let plan = Plan::new(vec![step], vec![], KnownState::default());
        let provenance = BTreeMap::new();
        let runtime = BTreeMap::new();
        let checker = ProvenanceChecker::new(&plan, &provenance, &runtime);
        assert!(checker.is_provenance_changed(plan.get_step("S").unwrap()));
    }
}
