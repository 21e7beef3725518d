//! Quad indexes. A [`TupleTable`] keeps the same set of tuples in several
//! permuted orders so any pattern with bound positions can be answered by a
//! prefix range scan over one of them. The sets are persistent (`im`), so
//! cloning a table is O(1) and clones share structure: a snapshot is a clone.

use crate::errors::{Result, StoreError};
use crate::node::{NodeId, Tuple};
use im::OrdSet;
use std::fmt;

/// Bound/unbound positions in canonical S, P, O, G order.
pub type TuplePattern = [Option<NodeId>; 4];

pub const MATCH_ALL: TuplePattern = [None, None, None, None];

/// A permutation of the four quad positions, e.g. `GSPO`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexOrder {
    perm: [usize; 4],
}

impl IndexOrder {
    pub fn parse(name: &str) -> Result<Self> {
        let name_upper = name.to_ascii_uppercase();
        let chars: Vec<char> = name_upper.chars().collect();
        if chars.len() != 4 {
            return Err(StoreError::Config(format!(
                "index name {name:?} must have exactly four letters"
            )));
        }
        let mut perm = [0usize; 4];
        let mut seen = [false; 4];
        for (i, c) in chars.iter().enumerate() {
            let pos = match c {
                'S' => 0,
                'P' => 1,
                'O' => 2,
                'G' => 3,
                _ => {
                    return Err(StoreError::Config(format!(
                        "index name {name:?} contains {c:?}; expected S, P, O, G"
                    )))
                }
            };
            if seen[pos] {
                return Err(StoreError::Config(format!(
                    "index name {name:?} repeats {c:?}"
                )));
            }
            seen[pos] = true;
            perm[i] = pos;
        }
        Ok(Self { perm })
    }

    fn to_key(self, tuple: &Tuple) -> Tuple {
        [
            tuple[self.perm[0]],
            tuple[self.perm[1]],
            tuple[self.perm[2]],
            tuple[self.perm[3]],
        ]
    }

    fn from_key(self, key: &Tuple) -> Tuple {
        let mut tuple = [NodeId::MIN; 4];
        for (i, pos) in self.perm.iter().enumerate() {
            tuple[*pos] = key[i];
        }
        tuple
    }

    /// Number of leading key positions bound by the pattern.
    pub fn prefix_len(self, pattern: &TuplePattern) -> usize {
        self.perm
            .iter()
            .take_while(|pos| pattern[**pos].is_some())
            .count()
    }
}

impl fmt::Display for IndexOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for pos in self.perm {
            let c = ['S', 'P', 'O', 'G'][pos];
            write!(f, "{c}")?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct TupleIndex {
    order: IndexOrder,
    keys: OrdSet<Tuple>,
}

impl TupleIndex {
    pub fn new(order: IndexOrder) -> Self {
        Self {
            order,
            keys: OrdSet::new(),
        }
    }

    pub fn order(&self) -> IndexOrder {
        self.order
    }

    fn add(&mut self, tuple: &Tuple) -> bool {
        self.keys.insert(self.order.to_key(tuple)).is_none()
    }

    fn delete(&mut self, tuple: &Tuple) -> bool {
        self.keys.remove(&self.order.to_key(tuple)).is_some()
    }

    fn contains(&self, tuple: &Tuple) -> bool {
        self.keys.contains(&self.order.to_key(tuple))
    }

    fn len(&self) -> usize {
        self.keys.len()
    }

    /// Range-scans the bound prefix, then filters the remaining positions.
    fn scan<'a>(&'a self, pattern: TuplePattern) -> impl Iterator<Item = Tuple> + 'a {
        let prefix = self.order.prefix_len(&pattern);
        let mut lo = [NodeId::MIN; 4];
        let mut hi = [NodeId::MAX; 4];
        for i in 0..prefix {
            if let Some(id) = pattern[self.order.perm[i]] {
                lo[i] = id;
                hi[i] = id;
            }
        }
        let order = self.order;
        self.keys
            .range(lo..=hi)
            .map(move |key| order.from_key(key))
            .filter(move |tuple| matches(&pattern, tuple))
    }
}

fn matches(pattern: &TuplePattern, tuple: &Tuple) -> bool {
    pattern
        .iter()
        .zip(tuple.iter())
        .all(|(p, t)| p.map_or(true, |id| id == *t))
}

/// All indexes of one quad table. The first index is primary and is used for
/// full scans.
#[derive(Clone, Debug)]
pub struct TupleTable {
    indexes: Vec<TupleIndex>,
}

impl TupleTable {
    pub fn new(orders: &[IndexOrder]) -> Result<Self> {
        if orders.is_empty() {
            return Err(StoreError::Config(
                "a quad table needs at least one index".to_string(),
            ));
        }
        Ok(Self {
            indexes: orders.iter().copied().map(TupleIndex::new).collect(),
        })
    }

    pub fn orders(&self) -> Vec<IndexOrder> {
        self.indexes.iter().map(|i| i.order()).collect()
    }

    /// Returns `false` if the tuple was already present.
    pub fn add(&mut self, tuple: Tuple) -> bool {
        let mut added = false;
        for index in self.indexes.iter_mut() {
            added |= index.add(&tuple);
        }
        added
    }

    /// Returns `false` if the tuple was not present.
    pub fn delete(&mut self, tuple: &Tuple) -> bool {
        let mut removed = false;
        for index in self.indexes.iter_mut() {
            removed |= index.delete(tuple);
        }
        removed
    }

    pub fn contains(&self, tuple: &Tuple) -> bool {
        self.indexes[0].contains(tuple)
    }

    pub fn len(&self) -> usize {
        self.indexes[0].len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Picks the index with the longest bound prefix for the pattern.
    pub fn best_index(&self, pattern: &TuplePattern) -> &TupleIndex {
        let mut best = &self.indexes[0];
        let mut best_len = best.order().prefix_len(pattern);
        for index in &self.indexes[1..] {
            let len = index.order().prefix_len(pattern);
            if len > best_len {
                best = index;
                best_len = len;
            }
        }
        best
    }

    pub fn find(&self, pattern: TuplePattern) -> Box<dyn Iterator<Item = Tuple> + '_> {
        Box::new(self.best_index(&pattern).scan(pattern))
    }

    pub fn iter(&self) -> Box<dyn Iterator<Item = Tuple> + '_> {
        self.find(MATCH_ALL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u64) -> NodeId {
        NodeId::new(n)
    }

    fn orders(names: &[&str]) -> Vec<IndexOrder> {
        names.iter().map(|n| IndexOrder::parse(n).unwrap()).collect()
    }

    #[test]
    fn parse_rejects_bad_names() {
        assert!(IndexOrder::parse("SPO").is_err());
        assert!(IndexOrder::parse("SPOS").is_err());
        assert!(IndexOrder::parse("SPOX").is_err());
        assert_eq!(IndexOrder::parse("gspo").unwrap().to_string(), "GSPO");
    }

    #[test]
    fn prefix_selection() {
        let table = TupleTable::new(&orders(&["SPOG", "POSG", "OSPG", "GSPO"])).unwrap();
        let p = id(2);
        let pattern = [None, Some(p), None, None];
        assert_eq!(table.best_index(&pattern).order().to_string(), "POSG");
        let pattern = [None, None, None, Some(p)];
        assert_eq!(table.best_index(&pattern).order().to_string(), "GSPO");
        assert_eq!(table.best_index(&MATCH_ALL).order().to_string(), "SPOG");
    }

    #[test]
    fn add_delete_find() {
        let (a, b, c, d) = (id(1), id(2), id(3), id(4));
        let mut table = TupleTable::new(&orders(&["SPOG", "POSG", "GSPO"])).unwrap();
        assert!(table.add([a, b, c, NodeId::DEFAULT_GRAPH]));
        assert!(!table.add([a, b, c, NodeId::DEFAULT_GRAPH]));
        assert!(table.add([a, b, d, NodeId::DEFAULT_GRAPH]));
        assert!(table.add([c, b, a, d]));
        assert_eq!(table.len(), 3);

        assert_eq!(table.find([Some(a), None, None, None]).count(), 2);
        assert_eq!(table.find([None, Some(b), None, None]).count(), 3);
        assert_eq!(table.find([None, None, Some(a), None]).count(), 1);
        assert_eq!(table.find([None, None, None, Some(d)]).count(), 1);
        assert_eq!(table.find([Some(a), None, Some(d), None]).count(), 1);

        assert!(table.delete(&[a, b, c, NodeId::DEFAULT_GRAPH]));
        assert!(!table.delete(&[a, b, c, NodeId::DEFAULT_GRAPH]));
        assert!(!table.contains(&[a, b, c, NodeId::DEFAULT_GRAPH]));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn clone_is_an_isolated_snapshot() {
        let (a, b, c) = (id(1), id(2), id(3));
        let mut table = TupleTable::new(&orders(&["SPOG"])).unwrap();
        table.add([a, b, c, NodeId::DEFAULT_GRAPH]);
        let snapshot = table.clone();
        table.add([c, b, a, NodeId::DEFAULT_GRAPH]);
        table.delete(&[a, b, c, NodeId::DEFAULT_GRAPH]);
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.contains(&[a, b, c, NodeId::DEFAULT_GRAPH]));
        assert_eq!(table.iter().collect::<Vec<_>>(), vec![[c, b, a, NodeId::DEFAULT_GRAPH]]);
    }
}
