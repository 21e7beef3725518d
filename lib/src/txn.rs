//! Transactions over one generation.

use crate::coordinator::TransactionCoordinator;
use crate::errors::{Result, StoreError};
use crate::generation::{Generation, GenerationId};
use crate::index::{TuplePattern, TupleTable};
use crate::journal::Change;
use crate::node::{graph_term, predicate_term, subject_term, NodeId, NodeTable, Tuple};
use crate::options::PromoteMode;
use oxigraph::model::{GraphNameRef, NamedNodeRef, NamedOrBlankNodeRef, Quad, QuadRef, TermRef};
use std::sync::Arc;

pub type TxnId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxnMode {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Active,
    Committed,
    Aborted,
    Ended,
}

/// Coordinator-facing part of a transaction: identity, lifecycle state, the
/// private snapshot and the changes pending against it.
#[derive(Debug)]
pub struct TxnCore {
    pub(crate) id: TxnId,
    pub(crate) mode: TxnMode,
    pub(crate) state: TxnState,
    pub(crate) data_version: u64,
    pub(crate) view: TupleTable,
    pub(crate) changes: Vec<Change>,
}

impl TxnCore {
    pub(crate) fn new(id: TxnId, mode: TxnMode, data_version: u64, view: TupleTable) -> Self {
        Self {
            id,
            mode,
            state: TxnState::Active,
            data_version,
            view,
            changes: Vec::new(),
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn mode(&self) -> TxnMode {
        self.mode
    }

    pub fn state(&self) -> TxnState {
        self.state
    }

    pub fn data_version(&self) -> u64 {
        self.data_version
    }

    pub(crate) fn discard(&mut self) {
        self.changes.clear();
    }
}

/// A transaction bound to the generation it began on. Dropping it ends it.
pub struct Transaction {
    core: TxnCore,
    generation: Arc<Generation>,
}

impl Transaction {
    pub(crate) fn new(core: TxnCore, generation: Arc<Generation>) -> Self {
        Self { core, generation }
    }

    pub fn id(&self) -> TxnId {
        self.core.id
    }

    pub fn mode(&self) -> TxnMode {
        self.core.mode
    }

    pub fn state(&self) -> TxnState {
        self.core.state
    }

    /// Commit sequence number of the snapshot this transaction reads.
    pub fn data_version(&self) -> u64 {
        self.core.data_version
    }

    pub fn generation_id(&self) -> GenerationId {
        self.generation.id()
    }

    pub fn generation(&self) -> &Arc<Generation> {
        &self.generation
    }

    fn coordinator(&self) -> &TransactionCoordinator {
        self.generation.coordinator()
    }

    fn nodes(&self) -> &NodeTable {
        self.generation.nodes()
    }

    fn require_active(&self, op: &str) -> Result<()> {
        if self.core.state != TxnState::Active {
            return Err(StoreError::ProtocolViolation(format!(
                "{op} on txn {} in state {:?}",
                self.core.id, self.core.state
            )));
        }
        Ok(())
    }

    fn require_writable(&self, op: &str) -> Result<()> {
        self.require_active(op)?;
        if self.core.mode != TxnMode::Write {
            return Err(StoreError::ProtocolViolation(format!(
                "{op} requires a write transaction (txn {} is {:?})",
                self.core.id, self.core.mode
            )));
        }
        if self.coordinator().is_retired() {
            return Err(StoreError::Retired(self.generation.id()));
        }
        Ok(())
    }

    /// Returns `false` if the quad was already present.
    pub fn add<'a>(&mut self, quad: impl Into<QuadRef<'a>>) -> Result<bool> {
        self.require_writable("add")?;
        let quad = quad.into();
        let tuple = self.nodes().encode(quad);
        let added = self.core.view.add(tuple);
        if added {
            self.core.changes.push(Change::Add(quad.into_owned()));
        }
        Ok(added)
    }

    /// Returns `false` if the quad was not present.
    pub fn delete<'a>(&mut self, quad: impl Into<QuadRef<'a>>) -> Result<bool> {
        self.require_writable("delete")?;
        let quad = quad.into();
        let Some(tuple) = self.nodes().lookup(quad) else {
            return Ok(false);
        };
        let removed = self.core.view.delete(&tuple);
        if removed {
            self.core.changes.push(Change::Delete(quad.into_owned()));
        }
        Ok(removed)
    }

    pub fn extend<I>(&mut self, quads: I) -> Result<usize>
    where
        I: IntoIterator<Item = Quad>,
    {
        let mut added = 0;
        for quad in quads {
            if self.add(&quad)? {
                added += 1;
            }
        }
        Ok(added)
    }

    pub fn contains<'a>(&self, quad: impl Into<QuadRef<'a>>) -> Result<bool> {
        self.require_active("contains")?;
        Ok(self
            .nodes()
            .lookup(quad.into())
            .is_some_and(|t| self.core.view.contains(&t)))
    }

    pub fn len(&self) -> Result<usize> {
        self.require_active("len")?;
        Ok(self.core.view.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Quads matching the pattern; `None` matches anything.
    pub fn find(
        &self,
        subject: Option<NamedOrBlankNodeRef<'_>>,
        predicate: Option<NamedNodeRef<'_>>,
        object: Option<TermRef<'_>>,
        graph_name: Option<GraphNameRef<'_>>,
    ) -> Result<QuadIter<'_>> {
        self.require_active("find")?;
        let nodes = self.nodes();
        let mut pattern: TuplePattern = [None; 4];
        let mut unknown = false;
        if let Some(s) = subject {
            pattern[0] = nodes.get_id(&subject_term(s.into_owned()));
            unknown |= pattern[0].is_none();
        }
        if let Some(p) = predicate {
            pattern[1] = nodes.get_id(&predicate_term(p.into_owned()));
            unknown |= pattern[1].is_none();
        }
        if let Some(o) = object {
            pattern[2] = nodes.get_id(&o.into_owned());
            unknown |= pattern[2].is_none();
        }
        if let Some(g) = graph_name {
            pattern[3] = match graph_term(g) {
                Some(t) => nodes.get_id(&t),
                None => Some(NodeId::DEFAULT_GRAPH),
            };
            unknown |= pattern[3].is_none();
        }
        let tuples: Box<dyn Iterator<Item = Tuple> + '_> = if unknown {
            Box::new(std::iter::empty())
        } else {
            self.core.view.find(pattern)
        };
        Ok(QuadIter { tuples, nodes })
    }

    pub fn quads(&self) -> Result<QuadIter<'_>> {
        self.find(None, None, None, None)
    }

    pub fn promote(&mut self) -> Result<()> {
        self.promote_with(PromoteMode::Isolated)
    }

    pub fn promote_with(&mut self, mode: PromoteMode) -> Result<()> {
        self.generation.coordinator().promote(&mut self.core, mode)
    }

    pub fn commit(&mut self) -> Result<()> {
        let generation = &self.generation;
        generation
            .coordinator()
            .commit(&mut self.core, |version, changes| {
                generation.storage().persist(version, changes)
            })
    }

    pub fn abort(&mut self) -> Result<()> {
        self.generation.coordinator().abort(&mut self.core)
    }

    pub fn end(&mut self) -> Result<()> {
        self.generation.coordinator().end(&mut self.core)
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.core.state != TxnState::Ended {
            let _ = self.generation.coordinator().end(&mut self.core);
        }
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.core.id)
            .field("mode", &self.core.mode)
            .field("state", &self.core.state)
            .field("generation", &self.generation.id())
            .finish()
    }
}

/// Decodes matching tuples of a transaction's snapshot.
pub struct QuadIter<'a> {
    tuples: Box<dyn Iterator<Item = Tuple> + 'a>,
    nodes: &'a NodeTable,
}

impl Iterator for QuadIter<'_> {
    type Item = Result<Quad>;

    fn next(&mut self) -> Option<Self::Item> {
        self.tuples.next().map(|t| self.nodes.decode(&t))
    }
}
