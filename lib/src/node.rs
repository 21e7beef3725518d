//! Term interning. Every RDF term stored in a generation is given a compact
//! [`NodeId`]; tuple indexes only ever hold ids.

use crate::errors::{Result, StoreError};
use oxigraph::model::{
    GraphName, GraphNameRef, NamedNode, NamedOrBlankNode, Quad, QuadRef, Term,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(u64);

impl NodeId {
    pub const MIN: NodeId = NodeId(0);
    pub const MAX: NodeId = NodeId(u64::MAX);
    /// The default graph is not a term; it is always id 0.
    pub const DEFAULT_GRAPH: NodeId = NodeId(0);

    #[cfg(test)]
    pub(crate) const fn new(value: u64) -> Self {
        NodeId(value)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A quad as stored: subject, predicate, object, graph.
pub type Tuple = [NodeId; 4];

#[derive(Default)]
struct Inner {
    ids: HashMap<Term, NodeId>,
    terms: Vec<Term>,
}

/// Append-only, shared term table of one generation. Ids handed out by an
/// aborted writer are simply never referenced.
#[derive(Default)]
pub struct NodeTable {
    inner: RwLock<Inner>,
}

impl NodeTable {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: RwLock::new(Inner {
                ids: HashMap::with_capacity(capacity),
                terms: Vec::with_capacity(capacity),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().terms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get_or_alloc(&self, term: &Term) -> NodeId {
        if let Some(id) = self.inner.read().ids.get(term) {
            return *id;
        }
        let mut inner = self.inner.write();
        if let Some(id) = inner.ids.get(term) {
            return *id;
        }
        inner.terms.push(term.clone());
        let id = NodeId(inner.terms.len() as u64);
        inner.ids.insert(term.clone(), id);
        id
    }

    pub fn get_id(&self, term: &Term) -> Option<NodeId> {
        self.inner.read().ids.get(term).copied()
    }

    pub fn term(&self, id: NodeId) -> Option<Term> {
        if id == NodeId::DEFAULT_GRAPH {
            return None;
        }
        self.inner.read().terms.get((id.0 - 1) as usize).cloned()
    }

    /// Encodes a quad, allocating ids for unseen terms.
    pub fn encode(&self, quad: QuadRef<'_>) -> Tuple {
        let s = self.get_or_alloc(&subject_term(quad.subject.into_owned()));
        let p = self.get_or_alloc(&predicate_term(quad.predicate.into_owned()));
        let o = self.get_or_alloc(&quad.object.into_owned());
        let g = match graph_term(quad.graph_name) {
            Some(t) => self.get_or_alloc(&t),
            None => NodeId::DEFAULT_GRAPH,
        };
        [s, p, o, g]
    }

    /// Encodes a quad without allocating; `None` if any term is unknown, in
    /// which case the quad cannot be stored.
    pub fn lookup(&self, quad: QuadRef<'_>) -> Option<Tuple> {
        let s = self.get_id(&subject_term(quad.subject.into_owned()))?;
        let p = self.get_id(&predicate_term(quad.predicate.into_owned()))?;
        let o = self.get_id(&quad.object.into_owned())?;
        let g = match graph_term(quad.graph_name) {
            Some(t) => self.get_id(&t)?,
            None => NodeId::DEFAULT_GRAPH,
        };
        Some([s, p, o, g])
    }

    pub fn decode(&self, tuple: &Tuple) -> Result<Quad> {
        let inner = self.inner.read();
        let get = |id: NodeId| -> Result<Term> {
            inner
                .terms
                .get((id.0.wrapping_sub(1)) as usize)
                .cloned()
                .ok_or_else(|| StoreError::Parse(format!("dangling node id {id}")))
        };
        let subject = match get(tuple[0])? {
            Term::NamedNode(n) => NamedOrBlankNode::NamedNode(n),
            Term::BlankNode(b) => NamedOrBlankNode::BlankNode(b),
            other => {
                return Err(StoreError::Parse(format!(
                    "node {} is not a valid subject: {other}",
                    tuple[0]
                )))
            }
        };
        let predicate = match get(tuple[1])? {
            Term::NamedNode(n) => n,
            other => {
                return Err(StoreError::Parse(format!(
                    "node {} is not a valid predicate: {other}",
                    tuple[1]
                )))
            }
        };
        let object = get(tuple[2])?;
        let graph = if tuple[3] == NodeId::DEFAULT_GRAPH {
            GraphName::DefaultGraph
        } else {
            match get(tuple[3])? {
                Term::NamedNode(n) => GraphName::NamedNode(n),
                Term::BlankNode(b) => GraphName::BlankNode(b),
                other => {
                    return Err(StoreError::Parse(format!(
                        "node {} is not a valid graph name: {other}",
                        tuple[3]
                    )))
                }
            }
        };
        Ok(Quad::new(subject, predicate, object, graph))
    }
}

pub(crate) fn subject_term(subject: NamedOrBlankNode) -> Term {
    match subject {
        NamedOrBlankNode::NamedNode(n) => Term::NamedNode(n),
        NamedOrBlankNode::BlankNode(b) => Term::BlankNode(b),
    }
}

pub(crate) fn predicate_term(predicate: NamedNode) -> Term {
    Term::NamedNode(predicate)
}

/// `None` for the default graph.
pub(crate) fn graph_term(graph: GraphNameRef<'_>) -> Option<Term> {
    match graph.into_owned() {
        GraphName::NamedNode(n) => Some(Term::NamedNode(n)),
        GraphName::BlankNode(b) => Some(Term::BlankNode(b)),
        GraphName::DefaultGraph => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oxigraph::model::{Literal, NamedNodeRef};

    fn quad(s: &str, o: &str, g: Option<&str>) -> Quad {
        let graph = match g {
            Some(g) => GraphName::NamedNode(NamedNode::new_unchecked(g)),
            None => GraphName::DefaultGraph,
        };
        Quad::new(
            NamedNode::new_unchecked(s),
            NamedNodeRef::new_unchecked("http://example.org/p"),
            Literal::new_simple_literal(o),
            graph,
        )
    }

    #[test]
    fn encode_is_stable_and_reversible() {
        let table = NodeTable::default();
        let q = quad("http://example.org/s", "v", Some("http://example.org/g"));
        let t1 = table.encode(q.as_ref());
        let t2 = table.encode(q.as_ref());
        assert_eq!(t1, t2);
        assert_eq!(table.len(), 4);
        assert_eq!(table.decode(&t1).unwrap(), q);
    }

    #[test]
    fn default_graph_is_reserved() {
        let table = NodeTable::default();
        let q = quad("http://example.org/s", "v", None);
        let t = table.encode(q.as_ref());
        assert_eq!(t[3], NodeId::DEFAULT_GRAPH);
        assert_eq!(table.len(), 3);
        assert_eq!(table.decode(&t).unwrap(), q);
    }

    #[test]
    fn lookup_does_not_allocate() {
        let table = NodeTable::default();
        let q = quad("http://example.org/s", "v", None);
        assert!(table.lookup(q.as_ref()).is_none());
        assert!(table.is_empty());
        let t = table.encode(q.as_ref());
        assert_eq!(table.lookup(q.as_ref()), Some(t));
    }

    #[test]
    fn literal_in_subject_position_is_rejected() {
        let table = NodeTable::default();
        let lit = table.get_or_alloc(&Term::Literal(Literal::new_simple_literal("x")));
        let p = table.get_or_alloc(&predicate_term(NamedNode::new_unchecked(
            "http://example.org/p",
        )));
        assert!(table.decode(&[lit, p, lit, NodeId::DEFAULT_GRAPH]).is_err());
    }
}
