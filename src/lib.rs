//! Library for computing equivalence classes and minimal quotients of state machines in Rust.
//!
//! In essence, this crate deals with finite state machines viewed as labeled graphs. A machine consists of a finite collection of states (the set of all states is denoted $Q$) which are connected by directed, labeled transitions. Every state carries precisely one payload, which acts as its structural signature: two states can only ever be identified with each other if their payloads agree. Transitions are deterministic in the sense that a state has at most one successor per label, which is what makes the quotient construction well defined.
//!
//! The central operation is the computation of a [`classes::ClassMap`] through partition refinement: starting from the coarse partition that groups states by payload, blocks are split until no two states in the same block can be distinguished by where their transitions lead. The refinement is cycle safe (membership in the reachable set is established once, up front, by a breadth first traversal) and it terminates after at most $|Q|$ passes. From a class map, [`minimize::minimize`] builds the quotient machine in which every equivalence class is collapsed into a single state and all transitions are rewritten through the class assignment. States that became unreachable through mutation can be stripped separately and more cheaply via [`minimize::prune_unreachable`].
//!
//! Classification is not tied to the concrete [`machine::Machine`] representation. The [`graph::LabeledGraph`] trait abstracts over anything that can hand out stable node handles, per node structural signatures and labeled successors; [`graph::NodeArena`] is the second implementation and exists mostly so that syntax-tree shaped data can be classified without first being converted into a machine. Implementations are queried through handles rather than references, which sidesteps ownership questions in cyclic graphs entirely.
//!
//! On top of the static algorithms sits the adaptive layer. A [`runtime::Runtime`] owns a machine behind a read-write lock, serves transitions through a three stage lookup (compiled dispatch table, then [`cache::TransitionCache`], then the machine itself) and re-minimizes the machine in the background when enough mutation or traffic has accumulated. Optimization passes work on a private copy and publish the result with a brief write lock, so readers are never blocked for the duration of a pass. How aggressive a pass is follows a graduated [`runtime::OptimizationLevel`].
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

/// The prelude is supposed to make using this package easier. Including everything, i.e.
/// `use quotient::prelude::*;` should be enough to use the package.
pub mod prelude {
    pub use super::{
        cache::{CacheConfig, CacheStats, CacheStrategy, CacheTier, TransitionCache},
        classes::{classify, ClassId, ClassMap, ClassRef},
        dispatch::DispatchTable,
        graph::{
            ArenaBuilder, DefaultIdType, IdType, Label, LabeledGraph, NodeArena, StructuralError,
        },
        machine::{Machine, MachineBuilder, State, StateId, TransitionError},
        math,
        math::Partition,
        minimize::{minimize, prune_unreachable, Minimized},
        runtime::{
            OptimizationLevel, OptimizationStats, OptimizerPhase, PassSummary, Runtime,
            RuntimeConfig, StatsSnapshot,
        },
        snapshot::{MachineSnapshot, SnapshotError, SNAPSHOT_VERSION},
        Payload, Show,
    };
    #[cfg(feature = "random")]
    pub use super::random;
}

/// This module contains some definitions of mathematical objects which are used throughout the crate and
/// do not really fit to the top level.
pub mod math;

/// Defines the [`graph::LabeledGraph`] abstraction over cyclic labeled graphs together with the
/// arena backed [`graph::NodeArena`] implementation.
pub mod graph;

/// Defines state machines, their states and the builder for constructing them.
pub mod machine;

/// Implements the computation of equivalence classes through cycle safe partition refinement.
pub mod classes;

/// Implements quotient construction and unreachable state removal on top of class maps.
pub mod minimize;

/// A multi-tier transition cache with expiry, promotion and strategy driven eviction.
pub mod cache;

/// The compiled dispatch table used as the fastest transition lookup stage.
pub mod dispatch;

/// The adaptive runtime which owns a machine and re-minimizes it in the background.
pub mod runtime;

/// Serialization of machines into a versioned, plain representation.
pub mod snapshot;

/// Implements the generation of random machines. This is feature gated behind the `random` feature.
#[cfg(feature = "random")]
pub mod random;

use itertools::Itertools;
use std::{fmt::Debug, hash::Hash};

/// A payload is simply a type that can be attached to the states of a machine. It doubles as the
/// structural signature during classification, meaning states with distinct payloads are never
/// placed in the same equivalence class.
pub trait Payload: Clone + Eq + Ord + Hash + Debug + Show {}

impl<T: Clone + Eq + Ord + Hash + Debug + Show> Payload for T {}

/// Helper trait which can be used to display states, transitions and such.
pub trait Show {
    /// Returns a human readable representation of `self`, for a state index that should be
    /// for example q0, q1, q2, ... and for a transition (q0, a, q1) it should be (q0, a, q1).
    /// Just use something that makes sense. This is mainly used for debugging purposes.
    fn show(&self) -> String;
    /// Show a collection of the thing, for a collection of states this should be {q0, q1, q2, ...}
    /// and for a collection of transitions it should be {(q0, a, q1), (q1, b, q2), ...}.
    /// By default this is unimplemented.
    fn show_collection<'a, I>(_iter: I) -> String
    where
        Self: 'a,
        I: IntoIterator<Item = &'a Self>,
        I::IntoIter: DoubleEndedIterator,
    {
        unimplemented!("This operation makes no sense.")
    }
}

macro_rules! impl_show_for_integer {
    ($($t:ty),*) => {
        $(
            impl Show for $t {
                fn show(&self) -> String {
                    self.to_string()
                }
                fn show_collection<'a, I: IntoIterator<Item = &'a Self>>(iter: I) -> String
                where
                    Self: 'a,
                    I::IntoIter: DoubleEndedIterator,
                {
                    format!(
                        "[{}]",
                        itertools::Itertools::join(&mut iter.into_iter().map(|x| x.show()), ", ")
                    )
                }
            }
        )*
    };
}

impl_show_for_integer!(u8, u16, u32, u64, usize);

impl<S: Show> Show for Option<S> {
    fn show(&self) -> String {
        match self {
            None => "".to_string(),
            Some(x) => x.show(),
        }
    }
}

impl Show for String {
    fn show(&self) -> String {
        self.clone()
    }
}

impl Show for str {
    fn show(&self) -> String {
        self.to_string()
    }
}

impl Show for () {
    fn show(&self) -> String {
        "-".into()
    }
    fn show_collection<'a, I: IntoIterator<Item = &'a Self>>(_iter: I) -> String
    where
        Self: 'a,
        I::IntoIter: DoubleEndedIterator,
    {
        "-".to_string()
    }
}

impl<S: Show> Show for [S] {
    fn show(&self) -> String {
        format!(
            "\"{}\"",
            itertools::Itertools::join(&mut self.iter().map(|x| x.show()), "")
        )
    }

    fn show_collection<'a, I: IntoIterator<Item = &'a Self>>(iter: I) -> String
    where
        Self: 'a,
        I::IntoIter: DoubleEndedIterator,
    {
        format!(
            "{{{}}}",
            itertools::Itertools::join(&mut iter.into_iter().map(|x| x.show()), ", ")
        )
    }
}

impl<S: Show> Show for Vec<S> {
    fn show(&self) -> String {
        S::show_collection(self.iter())
    }
}

impl<S: Show, T: Show> Show for (S, T) {
    fn show(&self) -> String {
        format!("({}, {})", self.0.show(), self.1.show())
    }
}

impl Show for bool {
    fn show(&self) -> String {
        match self {
            true => "+",
            false => "-",
        }
        .to_string()
    }

    fn show_collection<'a, I: IntoIterator<Item = &'a Self>>(iter: I) -> String
    where
        Self: 'a,
        I::IntoIter: DoubleEndedIterator,
    {
        format!("{{{}}}", iter.into_iter().map(Show::show).join(", "))
    }
}

impl<S: Show + ?Sized> Show for &S {
    fn show(&self) -> String {
        S::show(*self)
    }
}
