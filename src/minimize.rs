use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bit_set::BitSet;
use tracing::{debug, warn};

use crate::{math::Bijection, prelude::*};

/// The result of minimizing a machine, bundling the quotient with the class map it was built
/// from and some figures about how much was gained.
#[derive(Debug, Clone)]
pub struct Minimized<P> {
    /// The quotient machine. Its state handles coincide with the class handles of `classes`,
    /// i.e. state `c` of the quotient represents class `c` of the input.
    pub machine: Machine<P>,
    /// The class map the quotient was built from.
    pub classes: ClassMap<StateId>,
    /// Maps the representative (smallest) original state of each class to the corresponding
    /// quotient state and back.
    pub representatives: Bijection<StateId, StateId>,
    /// How many states the input lost, this includes unreachable ones.
    pub states_removed: usize,
    /// The fraction of states that was removed, `0.0` for an already minimal machine.
    pub reduction: f64,
    /// How long classification and quotient construction took.
    pub duration: Duration,
}

/// Minimizes `machine` by collapsing every equivalence class into a single state. Transitions
/// are rewritten through the class assignment, so the quotient is transition for transition
/// indistinguishable from the input: feeding both the same label sequence from their initial
/// states yields the same sequence of payloads. States that are unreachable from the initial
/// state do not survive, minimization subsumes [`prune_unreachable`].
pub fn minimize<P: Payload>(machine: &Machine<P>) -> Minimized<P> {
    let start = Instant::now();
    let before = machine.state_count();
    let classes = classify(machine, machine.initial());

    let mut payloads = Vec::with_capacity(classes.class_count());
    let mut transitions = Vec::new();
    let mut representatives = Bijection::new();
    for class in 0..classes.class_count() as ClassId {
        let representative = classes
            .representative(class)
            .expect("class handles are dense");
        representatives.insert(representative, class);
        let state = machine
            .state(representative)
            .expect("representatives are states of the input machine");
        payloads.push(state.payload().clone());
        for (label, target) in state.transitions() {
            match classes.class_of(target) {
                Some(target_class) => transitions.push((class, label.clone(), target_class)),
                None => {
                    warn!(
                        "dropping transition from q{representative} under `{label}`: target q{target} has no class"
                    );
                }
            }
        }
    }

    let initial_class = classes
        .class_of(machine.initial())
        .expect("the initial state is always classified");
    let mut quotient = MachineBuilder::default()
        .with_payloads(payloads)
        .with_transitions(transitions)
        .build(initial_class);

    // Carry the cursor over into the quotient.
    match machine.current() {
        Some(old) => match classes.class_of(old) {
            Some(class) => {
                quotient.set_current(class);
            }
            None => {
                warn!("current state q{old} did not survive minimization, restarting");
                quotient.restart();
            }
        },
        None => quotient.clear_current(),
    }

    let after = quotient.state_count();
    let states_removed = before - after;
    let reduction = if before == 0 {
        0.0
    } else {
        states_removed as f64 / before as f64
    };
    debug!(
        "minimized {before} states to {after} in {} passes",
        classes.passes()
    );

    Minimized {
        machine: quotient,
        classes,
        representatives,
        states_removed,
        reduction,
        duration: start.elapsed(),
    }
}

/// Removes all states that cannot be reached from the initial state, returning how many were
/// dropped. This is the cheap alternative to [`minimize`] for machines that accumulated garbage
/// through mutation but whose reachable part is already minimal enough.
pub fn prune_unreachable<P: Payload>(machine: &mut Machine<P>) -> usize {
    let mut reachable = BitSet::new();
    let mut queue = VecDeque::from([machine.initial()]);
    reachable.insert(machine.initial() as usize);
    while let Some(id) = queue.pop_front() {
        let state = machine.state(id).expect("traversal only visits states");
        for (_, target) in state.transitions() {
            if reachable.insert(target as usize) {
                queue.push_back(target);
            }
        }
    }

    let doomed: Vec<StateId> = machine
        .state_ids()
        .filter(|id| !reachable.contains(*id as usize))
        .collect();
    for id in &doomed {
        machine.remove_state(*id);
    }
    if !doomed.is_empty() {
        debug!("pruned {} unreachable states", doomed.len());
    }
    doomed.len()
}

#[cfg(test)]
mod tests {
    use crate::prelude::*;
    use crate::tests::collapse_machine;

    fn observed<P: Payload>(machine: &mut Machine<P>, labels: &[&str]) -> Vec<P> {
        let mut seen = Vec::new();
        for label in labels {
            let id = machine.transition(label).unwrap();
            seen.push(machine.state(id).unwrap().payload().clone());
        }
        seen
    }

    #[test]
    fn quotient_rewrites_transitions_through_classes() {
        let reduced = minimize(&collapse_machine());
        let machine = &reduced.machine;

        assert_eq!(machine.state_count(), 3);
        assert_eq!(machine.initial(), 0);
        assert_eq!(machine.target(0, "a"), Some(0));
        assert_eq!(machine.target(0, "b"), Some(1));
        assert_eq!(machine.target(1, "a"), Some(1));
        assert_eq!(machine.target(1, "b"), Some(2));
        assert_eq!(machine.target(2, "a"), Some(2));
        assert_eq!(machine.target(2, "b"), Some(2));
        assert_eq!(machine.state(0).map(|s| *s.payload()), Some(false));
        assert_eq!(machine.state(1).map(|s| *s.payload()), Some(true));
        assert_eq!(machine.state(2).map(|s| *s.payload()), Some(false));

        assert_eq!(reduced.states_removed, 3);
        assert_eq!(reduced.reduction, 0.5);
        assert_eq!(reduced.representatives.get_by_left(&0), Some(&0));
        assert_eq!(reduced.representatives.get_by_left(&2), Some(&1));
        assert_eq!(reduced.representatives.get_by_left(&5), Some(&2));
    }

    #[test]
    fn quotient_preserves_observable_behavior() {
        let mut original = collapse_machine();
        let mut reduced = minimize(&original).machine;

        let labels = [
            "a", "b", "a", "b", "b", "a", "a", "b", "b", "b", "a", "b", "a", "a", "b", "a",
            "b", "b", "a", "a",
        ];
        assert_eq!(observed(&mut original, &labels), observed(&mut reduced, &labels));
    }

    #[test]
    fn pairwise_identical_states_collapse_to_two() {
        // States 0/2 and 1/3 carry the same payloads and mirror each other's targets.
        let machine = MachineBuilder::default()
            .with_payloads([0u8, 1, 0, 1])
            .with_transitions([
                (0, "x", 1),
                (0, "y", 3),
                (1, "x", 2),
                (1, "y", 0),
                (2, "x", 3),
                (2, "y", 1),
                (3, "x", 0),
                (3, "y", 2),
            ])
            .build(0);

        let reduced = minimize(&machine);
        assert_eq!(reduced.machine.state_count(), 2);
        assert_eq!(reduced.machine.transition_count(), 4);
        assert_eq!(reduced.classes.class_count(), 2);
        assert_eq!(reduced.classes.class_of(0), reduced.classes.class_of(2));
        assert_eq!(reduced.classes.class_of(1), reduced.classes.class_of(3));
        // Both classes cross over into the other under either label.
        assert_eq!(reduced.machine.target(0, "x"), Some(1));
        assert_eq!(reduced.machine.target(0, "y"), Some(1));
        assert_eq!(reduced.machine.target(1, "x"), Some(0));
        assert_eq!(reduced.machine.target(1, "y"), Some(0));
    }

    #[test]
    fn minimization_is_idempotent() {
        let once = minimize(&collapse_machine());
        let twice = minimize(&once.machine);
        assert_eq!(twice.states_removed, 0);
        assert_eq!(twice.reduction, 0.0);
        assert_eq!(twice.machine.state_count(), once.machine.state_count());
    }

    #[test]
    fn minimal_machines_stay_untouched() {
        let ring = MachineBuilder::default()
            .with_payloads([0u8, 1, 2])
            .with_transitions([(0, "n", 1), (1, "n", 2), (2, "n", 0)])
            .build(0);
        let reduced = minimize(&ring);
        assert_eq!(reduced.states_removed, 0);
        assert_eq!(reduced.machine.state_count(), 3);
    }

    #[test]
    fn pruning_drops_exactly_the_unreachable_part() {
        let mut machine = MachineBuilder::default()
            .with_payloads([1u32, 2, 3, 4, 5])
            .with_transitions([(0, "a", 1), (1, "a", 0), (2, "a", 3), (3, "a", 4)])
            .build(0);
        machine.set_current(3);

        assert_eq!(prune_unreachable(&mut machine), 3);
        assert_eq!(machine.state_count(), 2);
        assert!(machine.contains_state(0) && machine.contains_state(1));
        // The cursor pointed into the removed part.
        assert_eq!(machine.current(), None);
        assert_eq!(prune_unreachable(&mut machine), 0);
    }

    #[test]
    fn minimize_subsumes_pruning() {
        let machine = MachineBuilder::default()
            .default_payload(())
            .with_transitions([(0, "a", 0), (1, "a", 2), (2, "a", 1)])
            .build(0);
        let reduced = minimize(&machine);
        assert_eq!(reduced.machine.state_count(), 1);
        assert_eq!(reduced.states_removed, 2);
    }

    #[test]
    fn cursor_survives_minimization_in_its_class() {
        let mut machine = collapse_machine();
        machine.set_current(3);
        let reduced = minimize(&machine);
        // State 3 belongs to the class that became quotient state 1.
        assert_eq!(reduced.machine.current(), Some(1));
    }
}
