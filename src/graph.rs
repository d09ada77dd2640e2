use std::fmt::Debug;
use std::hash::Hash;

use crate::Show;

/// Encapsulates the types which may be used as handles for the nodes of a labeled graph. By
/// default this is [`DefaultIdType`].
pub trait IdType: Copy + Eq + Hash + Ord + Debug + Show {}

macro_rules! impl_integer_id_type {
    ($($t:ty),*) => {
        $(
            impl IdType for $t {}
        )*
    }
}

impl_integer_id_type!(u8, u16, u32, u64, usize);

/// The default type for node and state handles.
pub type DefaultIdType = u32;

/// The type of transition labels. Labels are plain strings, matching the event or symbol names
/// that drive a machine.
pub type Label = String;

/// Emitted when a node cannot participate in classification because it is malformed, the
/// canonical example being a node without a structural signature. Structural errors are
/// collected rather than propagated, so a single bad node never aborts a classification run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructuralError<Id> {
    node: Id,
    reason: String,
}

impl<Id: IdType> StructuralError<Id> {
    /// Creates a new structural error for the given node.
    pub fn new(node: Id, reason: impl Into<String>) -> Self {
        Self {
            node,
            reason: reason.into(),
        }
    }

    /// The handle of the offending node.
    pub fn node(&self) -> Id {
        self.node
    }

    /// Describes what is malformed about the node.
    pub fn reason(&self) -> &str {
        &self.reason
    }
}

impl<Id: IdType> std::fmt::Display for StructuralError<Id> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "node {} is malformed: {}", self.node.show(), self.reason)
    }
}

/// Abstracts over cyclic, labeled graphs whose nodes can be grouped into equivalence classes.
/// Implementors hand out stable handles of type [`IdType`] instead of references, which is what
/// makes traversal of cyclic structures safe and cheap.
///
/// Classification only ever needs three queries: the structural signature of a node, the labels
/// on its outgoing transitions and the target reached by following one label. Neither query is
/// required to return labels in any particular order, callers that need determinism sort
/// themselves.
pub trait LabeledGraph {
    /// The handle type by which nodes are identified.
    type NodeId: IdType;
    /// The structural signature of a node. Two nodes can only be equivalent if their signatures
    /// are equal, so this is what seeds the initial partition.
    type Signature: Clone + Eq + Hash + Ord + Debug;

    /// Computes the structural signature of `node`. Returns a [`StructuralError`] if the node
    /// is malformed, for example because it has no signature at all.
    fn signature(&self, node: Self::NodeId)
        -> Result<Self::Signature, StructuralError<Self::NodeId>>;

    /// Iterates over the labels of the outgoing transitions of `node`. Nodes that are not part
    /// of the graph yield an empty iterator.
    fn labels(&self, node: Self::NodeId) -> impl Iterator<Item = &'_ Label>;

    /// Returns the node reached from `node` by following the transition with the given label,
    /// if such a transition exists.
    fn target(&self, node: Self::NodeId, label: &str) -> Option<Self::NodeId>;
}

/// A single node stored in a [`NodeArena`]. Nodes without a signature are called opaque, they
/// take part in traversal but classification reports a [`StructuralError`] for them.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ArenaNode {
    signature: Option<String>,
    edges: Vec<(Label, DefaultIdType)>,
}

/// An arena backed implementation of [`LabeledGraph`] which owns all of its nodes in a single
/// vector and identifies them by position. This is the natural representation for syntax-tree
/// shaped data: interior references become plain indices, so cycles introduced by sharing or
/// back edges need no special treatment.
#[derive(Debug, Clone, Default)]
pub struct NodeArena {
    nodes: Vec<ArenaNode>,
}

impl NodeArena {
    /// Creates an empty arena.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a builder for constructing an arena in one go.
    pub fn builder() -> ArenaBuilder {
        ArenaBuilder::default()
    }

    /// The number of nodes in the arena.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the arena holds no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Returns true if `node` is a valid handle into this arena.
    pub fn contains(&self, node: DefaultIdType) -> bool {
        (node as usize) < self.nodes.len()
    }

    /// Adds a node with the given structural signature and returns its handle.
    pub fn add_node(&mut self, signature: impl Into<String>) -> DefaultIdType {
        self.nodes.push(ArenaNode {
            signature: Some(signature.into()),
            edges: Vec::new(),
        });
        (self.nodes.len() - 1) as DefaultIdType
    }

    /// Adds an opaque node, i.e. one without a structural signature. Classifying a graph that
    /// contains such a node records a [`StructuralError`] for it.
    pub fn add_opaque(&mut self) -> DefaultIdType {
        self.nodes.push(ArenaNode {
            signature: None,
            edges: Vec::new(),
        });
        (self.nodes.len() - 1) as DefaultIdType
    }

    /// Inserts a transition from `from` to `to` under `label`. Since a node has at most one
    /// successor per label, an existing transition with the same label is overwritten.
    pub fn link(&mut self, from: DefaultIdType, label: impl Into<Label>, to: DefaultIdType) {
        assert!(self.contains(from), "source node {from} not in arena");
        assert!(self.contains(to), "target node {to} not in arena");
        let label = label.into();
        let edges = &mut self.nodes[from as usize].edges;
        if let Some(edge) = edges.iter_mut().find(|(l, _)| *l == label) {
            edge.1 = to;
        } else {
            edges.push((label, to));
        }
    }

    /// Removes the transition from `from` under `label`, returning its former target.
    pub fn unlink(&mut self, from: DefaultIdType, label: &str) -> Option<DefaultIdType> {
        let edges = &mut self.nodes.get_mut(from as usize)?.edges;
        let pos = edges.iter().position(|(l, _)| l == label)?;
        Some(edges.remove(pos).1)
    }

    /// Iterates over the handles of all nodes in the arena.
    pub fn node_ids(&self) -> impl Iterator<Item = DefaultIdType> + '_ {
        (0..self.nodes.len()).map(|i| i as DefaultIdType)
    }
}

impl LabeledGraph for NodeArena {
    type NodeId = DefaultIdType;
    type Signature = String;

    fn signature(&self, node: DefaultIdType) -> Result<String, StructuralError<DefaultIdType>> {
        let Some(stored) = self.nodes.get(node as usize) else {
            return Err(StructuralError::new(node, "not in arena"));
        };
        stored
            .signature
            .clone()
            .ok_or_else(|| StructuralError::new(node, "no signature"))
    }

    fn labels(&self, node: DefaultIdType) -> impl Iterator<Item = &'_ Label> {
        self.nodes
            .get(node as usize)
            .into_iter()
            .flat_map(|n| n.edges.iter().map(|(l, _)| l))
    }

    fn target(&self, node: DefaultIdType, label: &str) -> Option<DefaultIdType> {
        self.nodes
            .get(node as usize)?
            .edges
            .iter()
            .find(|(l, _)| l == label)
            .map(|(_, t)| *t)
    }
}

/// A builder for [`NodeArena`]s. Signatures are assigned positionally, i.e. the `i`-th signature
/// passed to [`ArenaBuilder::with_signatures`] belongs to node `i`. Opaque nodes are appended
/// after all signed ones.
#[derive(Debug, Clone, Default)]
pub struct ArenaBuilder {
    signatures: Vec<String>,
    opaque: usize,
    edges: Vec<(DefaultIdType, Label, DefaultIdType)>,
}

impl ArenaBuilder {
    /// Assigns structural signatures to the nodes `0..n` in the order they are yielded.
    pub fn with_signatures<S: Into<String>, I: IntoIterator<Item = S>>(mut self, iter: I) -> Self {
        self.signatures.extend(iter.into_iter().map(Into::into));
        self
    }

    /// Appends `count` opaque nodes after the signed ones.
    pub fn with_opaque(mut self, count: usize) -> Self {
        self.opaque += count;
        self
    }

    /// Adds the given transitions. Endpoints must refer to nodes that exist once the arena is
    /// built, otherwise [`ArenaBuilder::build`] panics.
    pub fn with_edges<L, I>(mut self, iter: I) -> Self
    where
        L: Into<Label>,
        I: IntoIterator<Item = (DefaultIdType, L, DefaultIdType)>,
    {
        self.edges
            .extend(iter.into_iter().map(|(p, l, q)| (p, l.into(), q)));
        self
    }

    /// Builds the arena. Panics if an edge refers to a node that was neither given a signature
    /// nor declared opaque.
    pub fn build(self) -> NodeArena {
        let mut arena = NodeArena::new();
        for signature in self.signatures {
            arena.add_node(signature);
        }
        for _ in 0..self.opaque {
            arena.add_opaque();
        }
        for (from, label, to) in self.edges {
            assert!(
                arena.contains(from) && arena.contains(to),
                "edge ({from}, {label}, {to}) refers to an undeclared node"
            );
            arena.link(from, label, to);
        }
        arena
    }
}
