//! Set difference between the mirrored state and a new snapshot.

use std::collections::HashSet;
use std::hash::Hash;

/// Entries to remove from and add to an old set to obtain a new set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diff<T> {
    pub added: Vec<T>,
    pub removed: Vec<T>,
}

impl<T> Diff<T> {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

impl<T> Default for Diff<T> {
    fn default() -> Self {
        Self {
            added: Vec::new(),
            removed: Vec::new(),
        }
    }
}

/// Compute `removed = old - new` and `added = new - old` by value equality.
///
/// Duplicates collapse. Output follows the input order of the first
/// occurrence, so identical inputs always give identical outputs.
pub fn diff<'a, T, O, N>(old: O, new: N) -> Diff<T>
where
    T: Eq + Hash + Clone + 'a,
    O: IntoIterator<Item = &'a T>,
    N: IntoIterator<Item = &'a T>,
{
    let old: Vec<&T> = dedup(old);
    let new: Vec<&T> = dedup(new);
    let old_set: HashSet<&T> = old.iter().copied().collect();
    let new_set: HashSet<&T> = new.iter().copied().collect();

    Diff {
        added: new
            .into_iter()
            .filter(|item| !old_set.contains(item))
            .cloned()
            .collect(),
        removed: old
            .into_iter()
            .filter(|item| !new_set.contains(item))
            .cloned()
            .collect(),
    }
}

fn dedup<'a, T, I>(items: I) -> Vec<&'a T>
where
    T: Eq + Hash + 'a,
    I: IntoIterator<Item = &'a T>,
{
    let mut seen = HashSet::new();
    items.into_iter().filter(|item| seen.insert(*item)).collect()
}
