use tracing::debug;

use crate::{
    math::{Map, Set},
    prelude::*,
};

/// A table of precomputed `(state, label) -> target` transitions, sitting in front of both the
/// [`TransitionCache`] and the machine itself. Lookups are plain map reads with no bookkeeping,
/// which is what makes this the fastest of the three lookup stages.
///
/// Entries can go stale when the machine is mutated underneath the table. A stale hit is
/// handled by [`DispatchTable::invalidate`], which removes the entry and blacklists the pair so
/// it is not recompiled until the table is [`DispatchTable::reset`] by the next optimization
/// pass. Sweeping after a pass goes through [`DispatchTable::retain_valid`] instead, which does
/// not blacklist: those entries were not wrong, the state handles simply changed.
#[derive(Debug, Clone, Default)]
pub struct DispatchTable {
    entries: Map<StateId, Map<Label, StateId>>,
    disabled: Set<(StateId, Label)>,
    len: usize,
}

impl DispatchTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of compiled transitions.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if nothing is compiled.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the compiled target for the transition from `state` under `label`.
    pub fn lookup(&self, state: StateId, label: &str) -> Option<StateId> {
        self.entries.get(&state)?.get(label).copied()
    }

    /// Compiles the transition from `state` under `label`. Returns false if the pair is
    /// blacklisted and was therefore skipped.
    pub fn compile(&mut self, state: StateId, label: impl Into<Label>, target: StateId) -> bool {
        let label = label.into();
        if self.disabled.contains(&(state, label.clone())) {
            return false;
        }
        let previous = self.entries.entry(state).or_default().insert(label, target);
        if previous.is_none() {
            self.len += 1;
        }
        true
    }

    /// Removes the entry for the given pair and blacklists it for the current session. This is
    /// the reaction to a stale hit, the caller falls back to the slower lookup stages.
    pub fn invalidate(&mut self, state: StateId, label: &str) {
        if let Some(per_state) = self.entries.get_mut(&state) {
            if per_state.remove(label).is_some() {
                self.len -= 1;
                if per_state.is_empty() {
                    self.entries.remove(&state);
                }
            }
        }
        debug!("disabling compiled dispatch for (q{state}, `{label}`)");
        self.disabled.insert((state, label.to_string()));
    }

    /// Returns true if the pair is blacklisted from compilation.
    pub fn is_disabled(&self, state: StateId, label: &str) -> bool {
        // Probing with a borrowed label would need an owned pair anyway, so build it once.
        self.disabled.contains(&(state, label.to_string()))
    }

    /// Drops every entry whose source or target state does not exist in `machine`, returning
    /// how many were removed. Swept pairs stay compilable.
    pub fn retain_valid<P: Payload>(&mut self, machine: &Machine<P>) -> usize {
        let mut removed = 0;
        self.entries.retain(|state, per_state| {
            if !machine.contains_state(*state) {
                removed += per_state.len();
                return false;
            }
            let before = per_state.len();
            per_state.retain(|_, target| machine.contains_state(*target));
            removed += before - per_state.len();
            !per_state.is_empty()
        });
        self.len -= removed;
        if removed > 0 {
            debug!("swept {removed} dangling dispatch entries");
        }
        removed
    }

    /// Drops all compiled entries but keeps the blacklist.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.len = 0;
    }

    /// Drops all compiled entries and the blacklist. An optimization pass calls this before
    /// recompiling, the rebuilt table starts a fresh session.
    pub fn reset(&mut self) {
        self.clear();
        self.disabled.clear();
    }

    /// Iterates over all compiled transitions.
    pub fn entries(&self) -> impl Iterator<Item = (StateId, &'_ Label, StateId)> {
        self.entries.iter().flat_map(|(state, per_state)| {
            per_state.iter().map(move |(label, target)| (*state, label, *target))
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::prelude::*;

    #[test]
    fn compile_then_lookup() {
        let mut table = DispatchTable::new();
        assert!(table.compile(0, "a", 1));
        assert!(table.compile(1, "b", 0));
        assert!(table.compile(0, "a", 2));

        assert_eq!(table.len(), 2);
        assert_eq!(table.lookup(0, "a"), Some(2));
        assert_eq!(table.lookup(1, "b"), Some(0));
        assert_eq!(table.lookup(2, "a"), None);
    }

    #[test]
    fn invalidation_blacklists_for_the_session() {
        let mut table = DispatchTable::new();
        table.compile(0, "a", 1);
        table.invalidate(0, "a");

        assert_eq!(table.lookup(0, "a"), None);
        assert!(table.is_disabled(0, "a"));
        // Recompilation is refused until the next reset.
        assert!(!table.compile(0, "a", 1));
        assert_eq!(table.lookup(0, "a"), None);

        table.reset();
        assert!(table.compile(0, "a", 1));
        assert_eq!(table.lookup(0, "a"), Some(1));
    }

    #[test]
    fn sweeping_drops_dangling_entries_without_blacklisting() {
        let mut machine = MachineBuilder::default()
            .default_payload(())
            .with_transitions([(0, "a", 1), (1, "a", 2), (2, "a", 0)])
            .build(0);
        let mut table = DispatchTable::new();
        table.compile(0, "a", 1);
        table.compile(1, "a", 2);
        table.compile(2, "a", 0);

        machine.remove_state(2);
        assert_eq!(table.retain_valid(&machine), 2);
        assert_eq!(table.len(), 1);
        assert_eq!(table.lookup(0, "a"), Some(1));
        // The swept pairs were never wrong, they may be compiled again.
        assert!(table.compile(1, "a", 0));
    }

    #[test]
    fn clearing_spares_the_blacklist() {
        let mut table = DispatchTable::new();
        table.compile(0, "a", 1);
        table.invalidate(5, "x");
        table.clear();

        assert!(table.is_empty());
        assert!(table.is_disabled(5, "x"));
        assert!(!table.compile(5, "x", 1));
    }
}
