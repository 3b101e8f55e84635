//! Boundary-scenario coverage for `ActiveExecution`, one test per scenario.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use plan_exec::{
    ActiveExecution, AssetProvenanceRecord, DynamicFanoutTemplate, Event, KnownState, OutputSpec,
    Plan, ProducedEvent, RetryMode, StepSpec,
};
use plan_types::StepOutputHandle;

fn succeed(exec: &mut ActiveExecution, step_key: &str) {
    exec.handle_event(Event::StepSuccess {
        step_key: step_key.to_string(),
    })
    .unwrap();
}

fn produce(exec: &mut ActiveExecution, step_key: &str, output_name: &str) {
    exec.handle_event(Event::SuccessfulOutput {
        handle: StepOutputHandle::new(step_key, output_name),
    })
    .unwrap();
}

#[test]
fn linear_dag_runs_in_dependency_order() {
    let a = StepSpec::new("A").with_output(OutputSpec::new("out"));
    let b = StepSpec::new("B")
        .with_dep("A")
        .with_input("in", std::collections::BTreeSet::from([StepOutputHandle::new("A", "out")]))
        .with_output(OutputSpec::new("out"));
    let c = StepSpec::new("C")
        .with_dep("B")
        .with_input("in", std::collections::BTreeSet::from([StepOutputHandle::new("B", "out")]));
    let plan = Plan::new(vec![a, b, c], vec![], KnownState::default());

    let mut exec = ActiveExecution::new(plan, RetryMode::Disabled, None, vec![]).unwrap();
    exec.acquire();

    assert_eq!(exec.get_steps_to_execute(None).unwrap(), vec!["A".to_string()]);
    produce(&mut exec, "A", "out");
    succeed(&mut exec, "A");

    assert_eq!(exec.get_steps_to_execute(None).unwrap(), vec!["B".to_string()]);
    produce(&mut exec, "B", "out");
    succeed(&mut exec, "B");

    assert_eq!(exec.get_steps_to_execute(None).unwrap(), vec!["C".to_string()]);
    succeed(&mut exec, "C");

    assert!(exec.is_complete());
    exec.release().unwrap();
}

#[test]
fn higher_priority_step_is_admitted_first_under_a_concurrency_cap() {
    let a = StepSpec::new("A").with_priority(10);
    let b = StepSpec::new("B").with_priority(20);
    let plan = Plan::new(vec![a, b], vec![], KnownState::default());

    let mut exec = ActiveExecution::new(plan, RetryMode::Disabled, Some(1), vec![]).unwrap();
    exec.acquire();

    assert_eq!(exec.get_steps_to_execute(None).unwrap(), vec!["B".to_string()]);
    succeed(&mut exec, "B");

    assert_eq!(exec.get_steps_to_execute(None).unwrap(), vec!["A".to_string()]);
    succeed(&mut exec, "A");

    exec.release().unwrap();
}

#[test]
fn step_skips_when_its_only_input_source_never_produced_output() {
    let a = StepSpec::new("A").with_output(OutputSpec::new("out"));
    let b = StepSpec::new("B")
        .with_dep("A")
        .with_input("in", std::collections::BTreeSet::from([StepOutputHandle::new("A", "out")]));
    let plan = Plan::new(vec![a, b], vec![], KnownState::default());

    let mut exec = ActiveExecution::new(plan, RetryMode::Disabled, None, vec![]).unwrap();
    exec.acquire();

    assert_eq!(exec.get_steps_to_execute(None).unwrap(), vec!["A".to_string()]);
    // A succeeds without ever emitting `successful_output` for "out".
    succeed(&mut exec, "A");

    let mut events = exec.plan_events_iterator();
    match events.next() {
        Some(Ok(ProducedEvent::StepSkipped {
            step_key,
            skipped_deps,
        })) => {
            assert_eq!(step_key, "B");
            assert_eq!(skipped_deps, vec!["A.out".to_string()]);
        }
        other => panic!("expected a StepSkipped event for B, got {other:?}"),
    }
    assert!(events.next().is_none());
    drop(events);

    assert!(exec.is_complete());
    exec.release().unwrap();
}

#[test]
fn abandon_propagates_transitively_through_a_failed_dependency() {
    let a = StepSpec::new("A");
    let b = StepSpec::new("B").with_dep("A");
    let c = StepSpec::new("C").with_dep("B");
    let plan = Plan::new(vec![a, b, c], vec![], KnownState::default());

    let mut exec = ActiveExecution::new(plan, RetryMode::Disabled, None, vec![]).unwrap();
    exec.acquire();

    assert_eq!(exec.get_steps_to_execute(None).unwrap(), vec!["A".to_string()]);
    exec.handle_event(Event::StepFailure {
        step_key: "A".to_string(),
    })
    .unwrap();

    let mut events = exec.plan_events_iterator();
    let first = events.next().unwrap().unwrap();
    match first {
        ProducedEvent::StepAbandonLogged { step_key, .. } => assert_eq!(step_key, "B"),
        other => panic!("expected B to be abandoned first, got {other:?}"),
    }
    let second = events.next().unwrap().unwrap();
    match second {
        ProducedEvent::StepAbandonLogged { step_key, .. } => assert_eq!(step_key, "C"),
        other => panic!("expected C to be abandoned next, got {other:?}"),
    }
    assert!(events.next().is_none());
    drop(events);

    assert!(exec.is_complete());
    exec.release().unwrap();
}

#[test]
fn retry_with_a_wait_reparks_the_step_until_the_deadline_elapses() {
    let a = StepSpec::new("A");
    let plan = Plan::new(vec![a], vec![], KnownState::default());

    let mut exec = ActiveExecution::new(plan, RetryMode::Enabled, None, vec![]).unwrap();
    exec.acquire();

    assert_eq!(exec.get_steps_to_execute(None).unwrap(), vec!["A".to_string()]);
    exec.handle_event(Event::StepUpForRetry {
        step_key: "A".to_string(),
        seconds_to_wait: Some(0.1),
    })
    .unwrap();

    // Nothing is immediately executable; the retry is still waiting.
    assert!(exec.get_steps_to_execute(None).unwrap().is_empty());

    let started = Instant::now();
    let next = exec.get_next_step().unwrap();
    assert_eq!(next, "A".to_string());
    assert!(started.elapsed() >= Duration::from_millis(90));

    succeed(&mut exec, "A");
    exec.release().unwrap();
}

#[test]
fn dynamic_fan_out_instantiates_one_child_per_observed_mapping_key() {
    let parent = StepSpec::new("P").with_output(OutputSpec::new("out").dynamic());
    let collector = StepSpec::new("D").with_dep("C");
    let template = DynamicFanoutTemplate {
        parent_step: "P".to_string(),
        output_name: "out".to_string(),
        child_template: "C".to_string(),
        child_base_deps: Default::default(),
        collectors: vec!["D".to_string()],
    };
    let plan = Plan::new(vec![parent, collector], vec![template], KnownState::default());

    let mut exec = ActiveExecution::new(plan, RetryMode::Disabled, None, vec![]).unwrap();
    exec.acquire();

    assert_eq!(exec.get_steps_to_execute(None).unwrap(), vec!["P".to_string()]);
    exec.handle_event(Event::SuccessfulOutput {
        handle: StepOutputHandle::new("P", "out").with_mapping_key("x"),
    })
    .unwrap();
    exec.handle_event(Event::SuccessfulOutput {
        handle: StepOutputHandle::new("P", "out").with_mapping_key("y"),
    })
    .unwrap();
    succeed(&mut exec, "P");

    let batch = exec.get_steps_to_execute(None).unwrap();
    assert_eq!(batch, vec!["C[x]".to_string(), "C[y]".to_string()]);

    succeed(&mut exec, "C[x]");
    succeed(&mut exec, "C[y]");

    assert_eq!(exec.get_steps_to_execute(None).unwrap(), vec!["D".to_string()]);
    succeed(&mut exec, "D");

    assert!(exec.is_complete());
    exec.release().unwrap();
}

#[test]
fn matching_provenance_skips_but_a_changed_input_version_forces_a_rerun() {
    let make_plan = || {
        let u = StepSpec::new("U").with_output(OutputSpec::new("out").producing_asset("k0"));
        let s = StepSpec::new("S")
            .with_dep("U")
            .with_input("in", std::collections::BTreeSet::from([StepOutputHandle::new("U", "out")]))
            .with_output(OutputSpec::new("out").producing_asset("k1"));
        let known_state = KnownState {
            asset_provenance: vec![AssetProvenanceRecord {
                asset_key: "k1".to_string(),
                input_logical_versions: BTreeMap::from([("k0".to_string(), "v1".to_string())]),
            }],
            ..KnownState::default()
        };
        Plan::new(vec![u, s], vec![], known_state)
    };

    // Matching versions: S is skipped, not executed.
    let mut exec = ActiveExecution::new(make_plan(), RetryMode::Disabled, None, vec![]).unwrap();
    exec.acquire();
    assert_eq!(exec.get_steps_to_execute(None).unwrap(), vec!["U".to_string()]);
    produce(&mut exec, "U", "out");
    exec.handle_event(Event::StepMaterialization {
        step_key: "U".to_string(),
        asset_key: "k0".to_string(),
        logical_version: Some("v1".to_string()),
    })
    .unwrap();
    succeed(&mut exec, "U");

    let skipped = exec.get_steps_to_skip().unwrap();
    assert_eq!(skipped, vec!["S".to_string()]);
    assert!(exec.get_steps_to_execute(None).unwrap().is_empty());

    // Changed runtime version: S executes instead.
    let mut exec = ActiveExecution::new(make_plan(), RetryMode::Disabled, None, vec![]).unwrap();
    exec.acquire();
    assert_eq!(exec.get_steps_to_execute(None).unwrap(), vec!["U".to_string()]);
    produce(&mut exec, "U", "out");
    exec.handle_event(Event::StepMaterialization {
        step_key: "U".to_string(),
        asset_key: "k0".to_string(),
        logical_version: Some("v2".to_string()),
    })
    .unwrap();
    succeed(&mut exec, "U");

    assert_eq!(exec.get_steps_to_execute(None).unwrap(), vec!["S".to_string()]);
}

/// Snapshot -> new instance -> replay = original state (spec section 8's
/// round-trip property), exercised across both a retry count and a
/// resolved dynamic mapping so a regression in either is caught.
#[test]
fn get_known_state_round_trips_through_rebuild_from_events() {
    fn make_plan(known_state: KnownState) -> Plan {
        let parent = StepSpec::new("P").with_output(OutputSpec::new("out").dynamic());
        let collector = StepSpec::new("D").with_dep("C");
        let template = DynamicFanoutTemplate {
            parent_step: "P".to_string(),
            output_name: "out".to_string(),
            child_template: "C".to_string(),
            child_base_deps: Default::default(),
            collectors: vec!["D".to_string()],
        };
        Plan::new(vec![parent, collector], vec![template], known_state)
    }

    let mut exec = ActiveExecution::new(make_plan(KnownState::default()), RetryMode::Enabled, None, vec![]).unwrap();
    exec.acquire();

    let mut history = Vec::new();
    let mut apply = |exec: &mut ActiveExecution, event: Event| {
        exec.handle_event(event.clone()).unwrap();
        history.push(event);
    };

    assert_eq!(exec.get_steps_to_execute(None).unwrap(), vec!["P".to_string()]);
    apply(
        &mut exec,
        Event::SuccessfulOutput {
            handle: StepOutputHandle::new("P", "out").with_mapping_key("x"),
        },
    );
    apply(
        &mut exec,
        Event::SuccessfulOutput {
            handle: StepOutputHandle::new("P", "out").with_mapping_key("y"),
        },
    );
    apply(
        &mut exec,
        Event::StepSuccess {
            step_key: "P".to_string(),
        },
    );

    let children = exec.get_steps_to_execute(None).unwrap();
    assert_eq!(children, vec!["C[x]".to_string(), "C[y]".to_string()]);
    apply(
        &mut exec,
        Event::StepSuccess {
            step_key: "C[x]".to_string(),
        },
    );
    apply(
        &mut exec,
        Event::StepSuccess {
            step_key: "C[y]".to_string(),
        },
    );

    assert_eq!(exec.get_steps_to_execute(None).unwrap(), vec!["D".to_string()]);
    apply(
        &mut exec,
        Event::StepUpForRetry {
            step_key: "D".to_string(),
            seconds_to_wait: None,
        },
    );

    // This is the regression the fix for the stale-deps bug covers: without
    // it, "D" would stay parked waiting on the placeholder "C" forever.
    assert_eq!(exec.get_steps_to_execute(None).unwrap(), vec!["D".to_string()]);
    apply(
        &mut exec,
        Event::StepSuccess {
            step_key: "D".to_string(),
        },
    );
    assert!(exec.is_complete());

    let snapshot = exec.get_known_state();
    assert_eq!(exec.retry_state().attempts("D"), 1);

    // Replaying the full event log (including the one `StepUpForRetry`
    // already in `history`) is what actually recounts the attempt, so the
    // rebuilt plan starts from an empty attempt count, the same baseline
    // `exec` itself started from, rather than the post-completion snapshot
    // (seeding both would double-count the single retry).
    let rebuilt_plan = make_plan(KnownState {
        previous_retry_attempts: BTreeMap::new(),
        dynamic_mappings: snapshot.dynamic_mappings.clone(),
        ready_outputs: snapshot.ready_outputs.clone(),
        asset_provenance: Vec::new(),
        step_output_versions: snapshot.step_output_versions.clone(),
        parent_state: snapshot.parent_state.clone(),
    });
    let mut rebuilt = ActiveExecution::new(rebuilt_plan, RetryMode::Enabled, None, vec![]).unwrap();
    rebuilt.acquire();
    let in_flight = rebuilt.rebuild_from_events(history).unwrap();
    assert!(in_flight.is_empty());

    assert_eq!(rebuilt.retry_state().attempts("D"), exec.retry_state().attempts("D"));
    assert_eq!(rebuilt.get_known_state().dynamic_mappings, snapshot.dynamic_mappings);
    assert!(rebuilt.is_complete());
    rebuilt.release().unwrap();

    exec.release().unwrap();
}
