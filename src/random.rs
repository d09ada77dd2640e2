//! Seeded generation of random machines, mostly for stress tests and benchmarks.

use fastrand::Rng;
use tracing::debug;

use crate::prelude::*;

/// Generates a random machine of the given size by drawing transitions. The algorithm is as
/// follows:
/// 1. Create `states` states, each carrying a payload drawn from `0..4` so that payloads
///    repeat and minimization has something to work with.
/// 2. For each state and each label, draw a target state uniformly and add the transition,
///    so the machine is total over `labels`.
///
/// Note that depending on the drawn targets, some states may be unreachable from the initial
/// state `0`.
pub fn random_machine(states: usize, labels: &[&str], seed: u64) -> Machine<u8> {
    let mut rng = Rng::with_seed(seed);
    let payloads: Vec<u8> = (0..states).map(|_| rng.u8(..4)).collect();
    let mut transitions = Vec::with_capacity(states * labels.len());
    for state in 0..states as StateId {
        for label in labels {
            transitions.push((state, *label, rng.u32(..states as u32)));
        }
    }
    debug!(
        "generated a random machine with {states} states over {} labels",
        labels.len()
    );
    MachineBuilder::default()
        .with_payloads(payloads)
        .with_transitions(transitions)
        .build(0)
}

/// Generates a machine with planted redundancy: `groups` behavioral groups of `copies`
/// interchangeable states each, so its minimal form has exactly `groups` states. The
/// algorithm is as follows:
/// 1. Create `groups * copies` states where state `g * copies + i` is copy `i` of group `g`
///    and carries `g` as its payload.
/// 2. For each group and each label, draw a target group once; the first label always leads
///    to the next group so that every group is reachable from the initial state.
/// 3. For each state, point its transition for that label at a randomly drawn copy of the
///    target group. Copies of a group therefore differ in their concrete targets but agree
///    on the target group, which makes them equivalent.
pub fn redundant_machine(groups: usize, copies: usize, labels: &[&str], seed: u64) -> Machine<u8> {
    assert!(groups > 0 && copies > 0, "need at least one state");
    let mut rng = Rng::with_seed(seed);
    let payloads: Vec<u8> = (0..groups * copies).map(|id| (id / copies) as u8).collect();

    let mut group_targets = Vec::with_capacity(groups);
    for group in 0..groups {
        let targets: Vec<usize> = labels
            .iter()
            .enumerate()
            .map(|(position, _)| {
                if position == 0 {
                    (group + 1) % groups
                } else {
                    rng.usize(..groups)
                }
            })
            .collect();
        group_targets.push(targets);
    }

    let mut transitions = Vec::with_capacity(groups * copies * labels.len());
    for group in 0..groups {
        for copy in 0..copies {
            let state = (group * copies + copy) as StateId;
            for (position, label) in labels.iter().enumerate() {
                let target_group = group_targets[group][position];
                let target = (target_group * copies + rng.usize(..copies)) as StateId;
                transitions.push((state, *label, target));
            }
        }
    }
    debug!(
        "planted {} redundant states across {groups} groups",
        groups * copies
    );
    MachineBuilder::default()
        .with_payloads(payloads)
        .with_transitions(transitions)
        .build(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_generation_is_deterministic() {
        let first = random_machine(12, &["a", "b"], 7);
        let second = random_machine(12, &["a", "b"], 7);
        assert_eq!(first, second);
        assert_eq!(first.state_count(), 12);
        assert_eq!(first.transition_count(), 24);
    }

    #[test]
    fn planted_redundancy_collapses_to_the_group_count() {
        let machine = redundant_machine(3, 5, &["x", "y"], 11);
        assert_eq!(machine.state_count(), 15);
        let reduced = minimize(&machine);
        assert_eq!(reduced.machine.state_count(), 3);
        assert_eq!(reduced.states_removed, 12);
    }

    #[test]
    fn redundant_machines_are_total_over_their_labels() {
        let machine = redundant_machine(4, 3, &["p", "q", "r"], 23);
        for state in machine.states() {
            assert_eq!(state.transition_count(), 3);
        }
    }

    #[test]
    fn same_class_states_agree_label_for_label() {
        let mut machine = redundant_machine(6, 4, &["a", "b"], 29);
        // Punch holes so agreement on omitted labels is exercised as well.
        machine.remove_transition(3, "b");
        machine.remove_transition(20, "a");
        let classes = classify(&machine, machine.initial());

        let reachable: Vec<StateId> = machine
            .state_ids()
            .filter(|id| classes.class_of(*id).is_some())
            .collect();
        for (position, &left) in reachable.iter().enumerate() {
            for &right in &reachable[position + 1..] {
                if classes.class_of(left) != classes.class_of(right) {
                    continue;
                }
                for label in ["a", "b"] {
                    match (machine.target(left, label), machine.target(right, label)) {
                        (None, None) => {}
                        (Some(first), Some(second)) => assert_eq!(
                            classes.class_of(first),
                            classes.class_of(second),
                            "states {left} and {right} reach different classes under `{label}`"
                        ),
                        _ => panic!("states {left} and {right} disagree on defining `{label}`"),
                    }
                }
            }
        }
    }

    #[test]
    fn replays_agree_on_the_final_class() {
        let original = redundant_machine(10, 5, &["a", "b"], 17);
        assert_eq!(original.state_count(), 50);
        let reduced = minimize(&original);
        assert!(reduced.machine.state_count() < 50);

        let sequences: [[&str; 10]; 3] = [
            ["a", "a", "a", "a", "a", "a", "a", "a", "a", "a"],
            ["a", "b", "a", "b", "a", "b", "a", "b", "a", "b"],
            ["b", "b", "a", "b", "a", "a", "b", "a", "b", "b"],
        ];
        for sequence in sequences {
            let mut walked = original.clone();
            let mut quotient = reduced.machine.clone();
            walked.restart();
            quotient.restart();
            for label in sequence {
                // Payloads agree step for step since both machines are total.
                let reached = walked.transition(label).unwrap();
                let class = quotient.transition(label).unwrap();
                assert_eq!(
                    walked.state(reached).unwrap().payload(),
                    quotient.state(class).unwrap().payload()
                );
            }
            // The original's final state lands exactly in the quotient's final class.
            let reached = walked.current().unwrap();
            assert_eq!(reduced.classes.class_of(reached), quotient.current());
        }
    }
}
