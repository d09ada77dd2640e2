use itertools::Itertools;

use crate::{math::Map, prelude::*};

/// The handle type for machine states.
pub type StateId = DefaultIdType;

/// Rough per-state and per-transition heap costs used by [`Machine::estimated_size`]. These are
/// deliberately coarse, the estimate feeds a budget check and not an allocator.
const STATE_OVERHEAD: usize = 64;
const TRANSITION_OVERHEAD: usize = 48;

/// Emitted when a transition cannot be taken.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    /// The machine has no active state, so there is nothing to transition from. This happens
    /// after the cursor was cleared or the state it pointed to was removed.
    NoCurrentState,
    /// The current state has no outgoing transition with the requested label. The cursor is
    /// left unchanged, only the failed call is affected.
    UndefinedTransition {
        /// The state the machine was in when the lookup failed.
        state: StateId,
        /// The label that no transition exists for.
        label: Label,
    },
}

impl std::fmt::Display for TransitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransitionError::NoCurrentState => {
                write!(f, "no current state to transition from")
            }
            TransitionError::UndefinedTransition { state, label } => {
                write!(f, "state q{} has no transition labeled `{label}`", state)
            }
        }
    }
}

/// A single state of a [`Machine`]. Apart from its handle, a state owns a payload (which doubles
/// as the structural signature during classification) and its outgoing transitions, at most one
/// per label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct State<P> {
    id: StateId,
    payload: P,
    transitions: Map<Label, StateId>,
}

impl<P> State<P> {
    fn new(id: StateId, payload: P) -> Self {
        Self {
            id,
            payload,
            transitions: Map::default(),
        }
    }

    /// The handle of this state.
    pub fn id(&self) -> StateId {
        self.id
    }

    /// Borrows the payload of this state.
    pub fn payload(&self) -> &P {
        &self.payload
    }

    /// Iterates over the outgoing transitions in no particular order.
    pub fn transitions(&self) -> impl Iterator<Item = (&'_ Label, StateId)> {
        self.transitions.iter().map(|(l, t)| (l, *t))
    }

    /// The number of outgoing transitions.
    pub fn transition_count(&self) -> usize {
        self.transitions.len()
    }

    /// Returns the target of the transition with the given label, if it exists.
    pub fn target(&self, label: &str) -> Option<StateId> {
        self.transitions.get(label).copied()
    }
}

/// A deterministic state machine over string labels. States are identified by [`StateId`]
/// handles, carry a payload of type `P` and have at most one outgoing transition per label,
/// which makes lookups and the quotient construction unambiguous.
///
/// A machine always has an initial state and it keeps a cursor (the current state) which is
/// advanced by [`Machine::transition`]. Removed state handles are never reused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Machine<P> {
    states: Map<StateId, State<P>>,
    initial: StateId,
    current: Option<StateId>,
    next_id: StateId,
}

impl<P: Payload> Machine<P> {
    /// Returns a builder for constructing a machine in one go.
    pub fn builder() -> MachineBuilder<P> {
        MachineBuilder::default()
    }

    /// Creates a machine with a single state which is both initial and current.
    pub fn with_initial(payload: P) -> Self {
        let mut states = Map::default();
        states.insert(0, State::new(0, payload));
        Self {
            states,
            initial: 0,
            current: Some(0),
            next_id: 1,
        }
    }

    /// The number of states.
    pub fn state_count(&self) -> usize {
        self.states.len()
    }

    /// The total number of transitions over all states.
    pub fn transition_count(&self) -> usize {
        self.states.values().map(|s| s.transitions.len()).sum()
    }

    /// Returns true if `id` refers to a state of this machine.
    pub fn contains_state(&self, id: StateId) -> bool {
        self.states.contains_key(&id)
    }

    /// Borrows the state with the given handle, if it exists.
    pub fn state(&self, id: StateId) -> Option<&State<P>> {
        self.states.get(&id)
    }

    /// Iterates over all states in no particular order.
    pub fn states(&self) -> impl Iterator<Item = &'_ State<P>> {
        self.states.values()
    }

    /// Iterates over the handles of all states in no particular order.
    pub fn state_ids(&self) -> impl Iterator<Item = StateId> + '_ {
        self.states.keys().copied()
    }

    /// The handle of the initial state.
    pub fn initial(&self) -> StateId {
        self.initial
    }

    /// The handle of the current state, if the machine has one.
    pub fn current(&self) -> Option<StateId> {
        self.current
    }

    /// Moves the cursor back to the initial state.
    pub fn restart(&mut self) {
        self.current = Some(self.initial);
    }

    /// Points the cursor at `id`. Returns false and leaves the cursor untouched if no such
    /// state exists.
    pub fn set_current(&mut self, id: StateId) -> bool {
        if self.contains_state(id) {
            self.current = Some(id);
            true
        } else {
            false
        }
    }

    /// Clears the cursor. Subsequent transitions fail with [`TransitionError::NoCurrentState`]
    /// until the machine is restarted.
    pub fn clear_current(&mut self) {
        self.current = None;
    }

    /// Takes the transition with the given label from the current state, advancing the cursor.
    /// On failure the cursor stays where it was, an undefined transition is fatal only to the
    /// call itself.
    pub fn transition(&mut self, label: &str) -> Result<StateId, TransitionError> {
        let current = self.current.ok_or(TransitionError::NoCurrentState)?;
        let target = self
            .states
            .get(&current)
            .and_then(|s| s.target(label))
            .ok_or_else(|| TransitionError::UndefinedTransition {
                state: current,
                label: label.to_string(),
            })?;
        self.current = Some(target);
        Ok(target)
    }

    /// Adds a state with the given payload and returns its handle.
    pub fn add_state(&mut self, payload: P) -> StateId {
        let id = self.next_id;
        self.next_id += 1;
        self.states.insert(id, State::new(id, payload));
        id
    }

    /// Inserts a transition from `from` to `to` under `label`. An existing transition with the
    /// same label is overwritten, a state has at most one successor per label.
    pub fn add_transition(&mut self, from: StateId, label: impl Into<Label>, to: StateId) {
        assert!(
            self.contains_state(from) && self.contains_state(to),
            "Source {} or target {} state does not exist in the machine.",
            from.show(),
            to.show()
        );
        self.states
            .get_mut(&from)
            .expect("presence checked above")
            .transitions
            .insert(label.into(), to);
    }

    /// Removes the transition from `from` under `label`, returning its former target.
    pub fn remove_transition(&mut self, from: StateId, label: &str) -> Option<StateId> {
        self.states.get_mut(&from)?.transitions.remove(label)
    }

    /// Removes the state with handle `id` together with all transitions into it, returning its
    /// payload. If the cursor pointed at the removed state it is cleared. The initial state
    /// cannot be removed.
    pub fn remove_state(&mut self, id: StateId) -> Option<P> {
        assert!(id != self.initial, "cannot remove the initial state");
        let state = self.states.remove(&id)?;
        for remaining in self.states.values_mut() {
            remaining.transitions.retain(|_, target| *target != id);
        }
        if self.current == Some(id) {
            self.current = None;
        }
        Some(state.payload)
    }

    /// Replaces the payload of the state with handle `id`.
    pub fn set_payload(&mut self, id: StateId, payload: P) {
        let Some(state) = self.states.get_mut(&id) else {
            tracing::error!("cannot set payload of state that does not exist");
            return;
        };
        state.payload = payload;
    }

    /// Returns the distinct transition labels of the machine in sorted order.
    pub fn labels_sorted(&self) -> Vec<&Label> {
        self.states
            .values()
            .flat_map(|s| s.transitions.keys())
            .unique()
            .sorted()
            .collect()
    }

    /// Estimates the heap footprint of the machine in bytes. Payload sizes are approximated by
    /// their stack size, label costs by their length.
    pub fn estimated_size(&self) -> usize {
        let label_bytes: usize = self
            .states
            .values()
            .flat_map(|s| s.transitions.keys())
            .map(|l| l.len())
            .sum();
        self.state_count() * (STATE_OVERHEAD + std::mem::size_of::<P>())
            + self.transition_count() * TRANSITION_OVERHEAD
            + label_bytes
    }

    /// Renders the machine as a transition table with one row per state and one column per
    /// label. The initial state is printed bold, the current one blue.
    pub fn build_transition_table(&self) -> String {
        use owo_colors::OwoColorize;
        let labels = self.labels_sorted();
        let mut builder = tabled::builder::Builder::default();
        builder.push_record(
            std::iter::once("State".to_string()).chain(labels.iter().map(|l| l.to_string())),
        );
        for id in self.state_ids().sorted() {
            let state = &self.states[&id];
            let name = format!("q{}|{}", id, state.payload.show());
            let mut row = vec![if id == self.initial {
                name.bold().to_string()
            } else if Some(id) == self.current {
                name.blue().to_string()
            } else {
                name
            }];
            for label in &labels {
                match state.target(label) {
                    Some(target) => row.push(format!("q{target}")),
                    None => row.push("-".to_string()),
                }
            }
            builder.push_record(row);
        }
        builder
            .build()
            .with(tabled::settings::Style::rounded())
            .to_string()
    }

    /// Inserts a fully formed state, used when rebuilding machines with explicit handles.
    pub(crate) fn insert_raw(&mut self, id: StateId, payload: P) {
        self.states.insert(id, State::new(id, payload));
        self.next_id = self.next_id.max(id + 1);
    }

    /// Creates an empty shell with the given initial handle. The caller is responsible for
    /// inserting the initial state before the machine is used.
    pub(crate) fn shell(initial: StateId) -> Self {
        Self {
            states: Map::default(),
            initial,
            current: Some(initial),
            next_id: 0,
        }
    }
}

impl<P: Payload> LabeledGraph for Machine<P> {
    type NodeId = StateId;
    type Signature = P;

    fn signature(&self, node: StateId) -> Result<P, StructuralError<StateId>> {
        self.states
            .get(&node)
            .map(|s| s.payload.clone())
            .ok_or_else(|| StructuralError::new(node, "not in machine"))
    }

    fn labels(&self, node: StateId) -> impl Iterator<Item = &'_ Label> {
        self.states
            .get(&node)
            .into_iter()
            .flat_map(|s| s.transitions.keys())
    }

    fn target(&self, node: StateId, label: &str) -> Option<StateId> {
        self.states.get(&node)?.target(label)
    }
}

/// A builder for [`Machine`]s. Payloads are assigned positionally, i.e. the `i`-th payload
/// passed to [`MachineBuilder::with_payloads`] belongs to state `i`. If transitions refer to
/// states beyond the given payloads, a default payload must be set or building panics.
#[derive(Debug, Clone)]
pub struct MachineBuilder<P> {
    payloads: Vec<P>,
    default: Option<P>,
    transitions: Vec<(StateId, Label, StateId)>,
}

impl<P> Default for MachineBuilder<P> {
    fn default() -> Self {
        Self {
            payloads: Vec::new(),
            default: None,
            transitions: Vec::new(),
        }
    }
}

impl<P: Payload> MachineBuilder<P> {
    /// Assigns payloads to the states `0..n` in the order they are yielded.
    pub fn with_payloads<I: IntoIterator<Item = P>>(mut self, iter: I) -> Self {
        self.payloads.extend(iter);
        self
    }

    /// Sets the payload used for states that were not covered by
    /// [`MachineBuilder::with_payloads`].
    pub fn default_payload(mut self, payload: P) -> Self {
        self.default = Some(payload);
        self
    }

    /// Adds the given transitions.
    pub fn with_transitions<L, I>(mut self, iter: I) -> Self
    where
        L: Into<Label>,
        I: IntoIterator<Item = (StateId, L, StateId)>,
    {
        self.transitions
            .extend(iter.into_iter().map(|(p, l, q)| (p, l.into(), q)));
        self
    }

    /// Builds the machine with `initial` as initial (and current) state. Panics if a state has
    /// no payload and no default was given, or if `initial` does not exist.
    pub fn build(self, initial: StateId) -> Machine<P> {
        let highest = self
            .transitions
            .iter()
            .flat_map(|(p, _, q)| [*p, *q])
            .chain(std::iter::once(initial))
            .max()
            .expect("We know this is nonempty") as usize;
        let count = self.payloads.len().max(highest + 1);

        let mut machine = Machine::shell(initial);
        let mut payloads = self.payloads.into_iter();
        for id in 0..count {
            let payload = payloads.next().or_else(|| self.default.clone());
            let Some(payload) = payload else {
                panic!("state {id} has no payload and no default payload was given")
            };
            machine.insert_raw(id as StateId, payload);
        }
        for (from, label, to) in self.transitions {
            machine.add_transition(from, label, to);
        }
        machine
    }
}

#[cfg(test)]
mod tests {
    use crate::prelude::*;

    fn traffic_light() -> Machine<&'static str> {
        MachineBuilder::default()
            .with_payloads(["stop", "go", "caution"])
            .with_transitions([(0, "tick", 1), (1, "tick", 2), (2, "tick", 0)])
            .build(0)
    }

    #[test]
    fn cursor_walk_and_undefined_transitions() {
        let mut machine = traffic_light();
        assert_eq!(machine.current(), Some(0));
        assert_eq!(machine.transition("tick"), Ok(1));
        assert_eq!(machine.transition("tick"), Ok(2));

        let err = machine.transition("jump").unwrap_err();
        assert_eq!(
            err,
            TransitionError::UndefinedTransition {
                state: 2,
                label: "jump".to_string()
            }
        );
        // The failed call did not move the cursor.
        assert_eq!(machine.current(), Some(2));
        assert_eq!(machine.transition("tick"), Ok(0));

        machine.clear_current();
        assert_eq!(machine.transition("tick"), Err(TransitionError::NoCurrentState));
        machine.restart();
        assert_eq!(machine.transition("tick"), Ok(1));
    }

    #[test]
    fn removing_a_state_drops_incoming_transitions() {
        let mut machine = traffic_light();
        machine.set_current(2);
        assert_eq!(machine.remove_state(2), Some("caution"));
        assert_eq!(machine.state_count(), 2);
        assert_eq!(machine.target(1, "tick"), None);
        assert_eq!(machine.current(), None);
        // Handles of removed states are not reused.
        assert_eq!(machine.add_state("detour"), 3);
    }

    #[test]
    #[should_panic(expected = "does not exist in the machine")]
    fn transitions_to_unknown_states_are_rejected() {
        let mut machine = traffic_light();
        machine.add_transition(0, "warp", 9);
    }

    #[test]
    fn default_payload_fills_gaps() {
        let machine = MachineBuilder::default()
            .with_payloads([1u32])
            .default_payload(0)
            .with_transitions([(0, "a", 1), (1, "a", 2), (2, "a", 0)])
            .build(0);
        assert_eq!(machine.state_count(), 3);
        assert_eq!(machine.state(2).map(|s| *s.payload()), Some(0));
    }

    #[test]
    fn machines_answer_graph_queries() {
        let machine = traffic_light();
        assert_eq!(machine.signature(1), Ok("go"));
        assert!(machine.signature(9).is_err());
        assert_eq!(machine.target(0, "tick"), Some(1));
        assert_eq!(machine.labels(1).count(), 1);
    }

    #[test]
    fn transition_table_lists_all_states() {
        let machine = traffic_light();
        let table = machine.build_transition_table();
        for needle in ["q0", "q1", "q2", "tick", "stop", "go", "caution"] {
            assert!(table.contains(needle), "missing {needle} in\n{table}");
        }
    }
}
