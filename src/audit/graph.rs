use std::collections::{BTreeMap, BTreeSet};

use crate::catalog::snapshot::{ForeignKeyEdge, Snapshot, TableRef};

/// Directed referential graph over a snapshot's foreign keys.
///
/// Edges are referenced by their index in [`Snapshot::foreign_keys`]; parallel
/// edges and self references stay distinct.
#[derive(Debug, Clone)]
pub struct ReferentialGraph<'s> {
    schema: &'s str,
    edges: &'s [ForeignKeyEdge],
    outgoing: BTreeMap<&'s TableRef, Vec<usize>>,
    incoming: BTreeMap<&'s TableRef, Vec<usize>>,
}

impl<'s> ReferentialGraph<'s> {
    /// Build the graph from every edge of `snapshot`.
    pub fn build(snapshot: &'s Snapshot) -> Self {
        let edges = snapshot.foreign_keys();
        let mut outgoing: BTreeMap<&TableRef, Vec<usize>> = BTreeMap::new();
        let mut incoming: BTreeMap<&TableRef, Vec<usize>> = BTreeMap::new();
        for (index, edge) in edges.iter().enumerate() {
            outgoing.entry(&edge.child).or_default().push(index);
            incoming.entry(&edge.parent).or_default().push(index);
        }
        Self {
            schema: snapshot.schema(),
            edges,
            outgoing,
            incoming,
        }
    }

    /// Schema of the snapshot the graph was built from.
    pub fn schema(&self) -> &'s str {
        self.schema
    }

    /// Edge by index.
    pub fn edge(&self, index: usize) -> Option<&'s ForeignKeyEdge> {
        self.edges.get(index)
    }

    /// All edges with their indices.
    pub fn edges(&self) -> impl Iterator<Item = (usize, &'s ForeignKeyEdge)> + '_ {
        self.edges.iter().enumerate()
    }

    /// Number of edges.
    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Edges whose child is `table`.
    pub fn outgoing(&self, table: &TableRef) -> &[usize] {
        self.outgoing.get(table).map(Vec::as_slice).unwrap_or_default()
    }

    /// Edges whose parent is `table`.
    pub fn incoming(&self, table: &TableRef) -> &[usize] {
        self.incoming.get(table).map(Vec::as_slice).unwrap_or_default()
    }

    /// Tables with at least one self-referencing constraint.
    pub fn self_referencing_tables(&self) -> BTreeSet<&'s TableRef> {
        self.edges
            .iter()
            .filter(|e| e.is_self_reference())
            .map(|e| &e.child)
            .collect()
    }
}
