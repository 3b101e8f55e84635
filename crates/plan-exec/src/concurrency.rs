//! Tag-bucketed admission control.
//!
//! A rule either counts steps bearing a specific `(key, value)` tag pair,
//! or — when `value` is absent — counts steps bearing `key` at all, bucketed
//! per observed value so that e.g. `gpu=a` and `gpu=b` are tracked
//! independently against the same limit.

use std::collections::BTreeMap;

use crate::plan::StepSpec;

/// One admission-control rule.
#[derive(Debug, Clone)]
pub struct TagConcurrencyRule {
    pub key: String,
    pub value: Option<String>,
    pub limit: usize,
}

struct RuleState {
    rule: TagConcurrencyRule,
    /// Bucket key -> in-flight count. For a rule with a fixed `value`, the
    /// single bucket is keyed by that value; for an unvalued rule, one
    /// bucket per observed tag value.
    counts: BTreeMap<String, usize>,
}

/// Counts in-flight steps per `(tag-key, tag-value)` bucket for admission
/// control.
pub struct TagConcurrencyCounter {
    rules: Vec<RuleState>,
}

fn matching_bucket<'a>(rule: &'a TagConcurrencyRule, step: &'a StepSpec) -> Option<&'a str> {
    let tag_value = step.tags.get(&rule.key)?;
    match &rule.value {
        Some(expected) if expected == tag_value => Some(expected.as_str()),
        Some(_) => None,
        None => Some(tag_value.as_str()),
    }
}

impl TagConcurrencyCounter {
    /// Construct from the rule list and the steps currently in flight.
    pub fn new(rules: Vec<TagConcurrencyRule>, in_flight: &[&StepSpec]) -> Self {
        let mut rules: Vec<RuleState> = rules
            .into_iter()
            .map(|rule| RuleState {
                rule,
                counts: BTreeMap::new(),
            })
            .collect();

        for rule_state in &mut rules {
            for step in in_flight {
                if let Some(bucket) = matching_bucket(&rule_state.rule, step) {
                    *rule_state.counts.entry(bucket.to_string()).or_insert(0) += 1;
                }
            }
        }

        Self { rules }
    }

    /// Would admitting `step` push any matched rule above its limit?
    pub fn is_blocked(&self, step: &StepSpec) -> bool {
        self.rules.iter().any(|rule_state| {
            matching_bucket(&rule_state.rule, step)
                .map(|bucket| {
                    rule_state.counts.get(bucket).copied().unwrap_or(0) >= rule_state.rule.limit
                })
                .unwrap_or(false)
        })
    }

    /// Mutate counters as if `step` had just started.
    pub fn update_counters_with_launched_item(&mut self, step: &StepSpec) {
        for rule_state in &mut self.rules {
            if let Some(bucket) = matching_bucket(&rule_state.rule, step) {
                *rule_state.counts.entry(bucket.to_string()).or_insert(0) += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step_with_tag(key: &str, tag_key: &str, tag_value: &str) -> StepSpec {
        let mut step = StepSpec::new(key);
        step.tags.insert(tag_key.to_string(), tag_value.to_string());
        step
    }

    #[test]
    fn fixed_value_rule_blocks_at_limit() {
        let a = step_with_tag("a", "gpu", "x");
        let b = step_with_tag("b", "gpu", "x");
        let rules = vec![TagConcurrencyRule {
            key: "gpu".to_string(),
            value: Some("x".to_string()),
            limit: 1,
        }];
        let in_flight = vec![&a];
        let counter = TagConcurrencyCounter::new(rules, &in_flight);

        assert!(counter.is_blocked(&b));
    }

    #[test]
    fn unvalued_rule_buckets_per_value() {
        let a = step_with_tag("a", "gpu", "x");
        let rules = vec![TagConcurrencyRule {
            key: "gpu".to_string(),
            value: None,
            limit: 1,
        }];
        let in_flight = vec![&a];
        let counter = TagConcurrencyCounter::new(rules, &in_flight);

        let other_bucket = step_with_tag("b", "gpu", "y");
        let same_bucket = step_with_tag("c", "gpu", "x");

        assert!(!counter.is_blocked(&other_bucket));
        assert!(counter.is_blocked(&same_bucket));
    }

    #[test]
    fn launching_an_item_increments_its_bucket() {
        let rules = vec![TagConcurrencyRule {
            key: "gpu".to_string(),
            value: None,
            limit: 1,
        }];
        let mut counter = TagConcurrencyCounter::new(rules, &[]);

        let step = step_with_tag("a", "gpu", "x");
        assert!(!counter.is_blocked(&step));
        counter.update_counters_with_launched_item(&step);
        assert!(counter.is_blocked(&step));
    }
}
