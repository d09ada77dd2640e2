use std::{collections::BTreeSet, hash::Hash};

/// Type alias for sets, we use this to hide which type of `HashSet` we are actually using.
pub type Set<S> = fxhash::FxHashSet<S>;
/// Type alias for maps, we use this to hide which type of `HashMap` we are actually using.
pub type Map<K, V> = fxhash::FxHashMap<K, V>;

/// Represents a bijective mapping between `L` and `R`, that is a mapping which associates
/// each `L` with precisely one `R` and vice versa.
pub type Bijection<L, R> = bimap::BiBTreeMap<L, R>;

/// A partition is a different view on an equivalence relation, by grouping elements of
/// type `I` into their respective classes under the relation.
#[derive(Debug, Clone)]
pub struct Partition<I: Hash + Eq>(Vec<BTreeSet<I>>);

impl<I: Hash + Eq> std::ops::Deref for Partition<I> {
    type Target = Vec<BTreeSet<I>>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<'a, I: Hash + Eq> IntoIterator for &'a Partition<I> {
    type Item = &'a BTreeSet<I>;
    type IntoIter = std::slice::Iter<'a, BTreeSet<I>>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl<I: Hash + Eq> PartialEq for Partition<I> {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().all(|o| other.contains(o))
    }
}
impl<I: Hash + Eq> Eq for Partition<I> {}

impl<I: Hash + Eq + Ord> Partition<I> {
    /// Returns the size of the partition, i.e. the number of classes.
    pub fn size(&self) -> usize {
        self.0.len()
    }

    /// Builds a new partition from an iterator that yields iterators
    /// which yield elements of type `I`.
    pub fn new<X: IntoIterator<Item = I>, Y: IntoIterator<Item = X>>(iter: Y) -> Self {
        Self(
            iter.into_iter()
                .map(|it| it.into_iter().collect::<BTreeSet<_>>())
                .collect(),
        )
    }

    /// Returns the index of the class containing `elem`, if any.
    pub fn class_containing(&self, elem: &I) -> Option<usize> {
        self.0.iter().position(|class| class.contains(elem))
    }

    /// Returns true if every class of `self` is fully contained in some class of `coarser`,
    /// i.e. if `self` arose from `coarser` by splitting classes (or is equal to it).
    pub fn refines(&self, coarser: &Partition<I>) -> bool {
        self.0.iter().all(|class| {
            coarser
                .iter()
                .any(|sup| class.iter().all(|elem| sup.contains(elem)))
        })
    }
}

impl<I: Hash + Eq + Ord> From<Vec<BTreeSet<I>>> for Partition<I> {
    fn from(value: Vec<BTreeSet<I>>) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::Partition;

    #[test]
    fn partition_refinement_relation() {
        let coarse = Partition::new([vec![0, 1, 2], vec![3, 4]]);
        let fine = Partition::new([vec![0, 1], vec![2], vec![3, 4]]);
        assert!(fine.refines(&coarse));
        assert!(!coarse.refines(&fine));
        assert_eq!(fine.class_containing(&2), Some(1));
        assert_eq!(fine.class_containing(&7), None);
    }
}
