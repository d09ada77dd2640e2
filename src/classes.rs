use std::collections::{BTreeMap, BTreeSet, VecDeque};

use tracing::{trace, warn};

use crate::{
    math::{Map, Partition, Set},
    prelude::*,
};

/// The handle type for equivalence classes. Class handles are dense, i.e. a map with `n` classes
/// uses exactly the handles `0..n`.
pub type ClassId = DefaultIdType;

/// The resolved class of a transition target. Targets whose node could not be classified, for
/// example because it was excluded after a [`StructuralError`], resolve to [`ClassRef::Unknown`].
/// The sentinel is distinct from every known class, so two nodes that differ only in whether a
/// transition leads to a classified node end up in different classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ClassRef {
    /// The target belongs to the class with this handle.
    Known(ClassId),
    /// The target has no class.
    Unknown,
}

impl Show for ClassRef {
    fn show(&self) -> String {
        match self {
            ClassRef::Known(c) => format!("c{c}"),
            ClassRef::Unknown => "c?".to_string(),
        }
    }
}

/// The result of classifying a graph: an assignment of nodes to equivalence classes, the
/// partition view of that assignment and whatever structural errors were encountered on the way.
///
/// Two nodes share a class precisely if they carry the same structural signature and no sequence
/// of labels distinguishes where their transitions lead. Nodes that were unreachable from the
/// classification root, as well as malformed ones, are absent from the map.
#[derive(Debug, Clone)]
pub struct ClassMap<Id: IdType> {
    assignment: Map<Id, ClassId>,
    partition: Partition<Id>,
    passes: usize,
    errors: Vec<StructuralError<Id>>,
}

impl<Id: IdType> ClassMap<Id> {
    /// The number of equivalence classes.
    pub fn class_count(&self) -> usize {
        self.partition.size()
    }

    /// The number of classified nodes.
    pub fn node_count(&self) -> usize {
        self.assignment.len()
    }

    /// Returns the class handle of `node`, if the node was classified.
    pub fn class_of(&self, node: Id) -> Option<ClassId> {
        self.assignment.get(&node).copied()
    }

    /// Resolves `node` to a [`ClassRef`], mapping unclassified nodes to the unknown sentinel.
    pub fn resolve(&self, node: Id) -> ClassRef {
        match self.class_of(node) {
            Some(class) => ClassRef::Known(class),
            None => ClassRef::Unknown,
        }
    }

    /// The members of the class with the given handle.
    pub fn members(&self, class: ClassId) -> Option<&BTreeSet<Id>> {
        self.partition.get(class as usize)
    }

    /// The representative of a class, which is its smallest member. Representatives are stable
    /// under repeated classification of the same graph.
    pub fn representative(&self, class: ClassId) -> Option<Id> {
        self.members(class)?.first().copied()
    }

    /// A view of the classes as a [`Partition`], indexed by class handle.
    pub fn partition(&self) -> &Partition<Id> {
        &self.partition
    }

    /// Iterates over all `(node, class)` assignments in no particular order.
    pub fn assignments(&self) -> impl Iterator<Item = (Id, ClassId)> + '_ {
        self.assignment.iter().map(|(n, c)| (*n, *c))
    }

    /// The number of refinement passes that were needed to reach the fixed point.
    pub fn passes(&self) -> usize {
        self.passes
    }

    /// The structural errors encountered during classification. Each error names a node that
    /// was excluded from the map.
    pub fn errors(&self) -> &[StructuralError<Id>] {
        &self.errors
    }
}

/// Computes the equivalence classes of all nodes reachable from `root` by partition refinement.
/// The algorithm is as follows:
/// 1. Collect the reachable nodes by a breadth first traversal. A seen set makes this safe on
///    cyclic graphs, every node is expanded exactly once.
/// 2. Group the collected nodes by structural signature, which yields the initial partition.
///    Nodes whose signature computation fails are excluded and recorded as errors.
/// 3. Repeatedly split classes whose members disagree on their transition signature, i.e. on
///    the list of `(label, class of target)` pairs. When a class splits, the sub-group
///    containing its first collected member keeps the class handle and all other sub-groups
///    get fresh handles, which keeps handles stable across refinements.
/// 4. Stop once a full pass splits nothing. Since every splitting pass increases the number of
///    classes and classes cannot outnumber nodes, this happens after at most `|V|` passes.
pub fn classify<G: LabeledGraph>(graph: &G, root: G::NodeId) -> ClassMap<G::NodeId> {
    // Stage 1: cycle safe reachability. Successor lists are snapshotted and sorted by label
    // here so refinement passes need neither re-query the graph nor re-sort.
    let mut queue = VecDeque::from([root]);
    let mut seen: Set<G::NodeId> = Set::default();
    seen.insert(root);
    let mut order = Vec::new();
    let mut successors: Map<G::NodeId, Vec<(Label, G::NodeId)>> = Map::default();

    while let Some(node) = queue.pop_front() {
        order.push(node);
        let mut out: Vec<(Label, G::NodeId)> = graph
            .labels(node)
            .filter_map(|label| graph.target(node, label).map(|t| (label.clone(), t)))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        for (_, target) in &out {
            if seen.insert(*target) {
                queue.push_back(*target);
            }
        }
        successors.insert(node, out);
    }

    // Stage 2: seed the partition by structural signature. Sorting groups by signature makes
    // the handle assignment deterministic.
    let mut errors = Vec::new();
    let mut by_signature: BTreeMap<G::Signature, Vec<G::NodeId>> = BTreeMap::new();
    for &node in &order {
        match graph.signature(node) {
            Ok(signature) => by_signature.entry(signature).or_default().push(node),
            Err(error) => {
                warn!("excluding node from classification: {error}");
                errors.push(error);
            }
        }
    }
    let mut blocks: Vec<Vec<G::NodeId>> = by_signature.into_values().collect();
    let mut assignment: Map<G::NodeId, ClassId> = Map::default();
    for (class, block) in blocks.iter().enumerate() {
        for &node in block {
            assignment.insert(node, class as ClassId);
        }
    }

    // Stage 3: refine until no class splits anymore.
    let mut passes = 0;
    loop {
        passes += 1;
        let mut splits = 0usize;

        for idx in 0..blocks.len() {
            if blocks[idx].len() < 2 {
                continue;
            }
            let mut groups: BTreeMap<Vec<(&Label, ClassRef)>, Vec<G::NodeId>> = BTreeMap::new();
            for &node in &blocks[idx] {
                let transition_signature = successors[&node]
                    .iter()
                    .map(|(label, target)| {
                        (
                            label,
                            assignment
                                .get(target)
                                .map_or(ClassRef::Unknown, |c| ClassRef::Known(*c)),
                        )
                    })
                    .collect();
                groups
                    .entry(transition_signature)
                    .or_default()
                    .push(node);
            }
            if groups.len() < 2 {
                continue;
            }
            splits += groups.len() - 1;

            // The sub-group containing the first collected member retains the handle, everyone
            // else moves out.
            let anchor = blocks[idx][0];
            let mut retained = None;
            for (_, group) in groups {
                if group.contains(&anchor) {
                    retained = Some(group);
                } else {
                    let fresh = blocks.len() as ClassId;
                    for &node in &group {
                        assignment.insert(node, fresh);
                    }
                    blocks.push(group);
                }
            }
            blocks[idx] = retained.expect("the anchor is in one of the groups");
        }

        trace!("refinement pass {passes} split off {splits} classes");
        if splits == 0 {
            break;
        }
        debug_assert!(
            passes <= order.len(),
            "refinement must reach a fixed point after at most |V| passes"
        );
    }

    ClassMap {
        assignment,
        partition: Partition::new(blocks),
        passes,
        errors,
    }
}
