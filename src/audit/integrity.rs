use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::thread;

use tracing::{debug, info, warn};

use crate::audit::findings::AuditFinding;
use crate::audit::graph::ReferentialGraph;
use crate::catalog::snapshot::ForeignKeyEdge;
use crate::classifier::classification::ClassificationMap;
use crate::error::ProbeError;
use crate::parser::names::quote_ident;

/// Counts orphaned child rows for one foreign key. Implementations must be
/// strictly read-only.
pub trait OrphanProbe {
    /// Number of child rows whose key columns are all non-null and match no
    /// parent row.
    fn count_orphans(&mut self, edge: &ForeignKeyEdge) -> Result<u64, ProbeError>;
}

impl<P: OrphanProbe + ?Sized> OrphanProbe for &mut P {
    fn count_orphans(&mut self, edge: &ForeignKeyEdge) -> Result<u64, ProbeError> {
        (**self).count_orphans(edge)
    }
}

/// Opens one independent probe per worker.
pub trait ProbeFactory: Sync {
    /// Probe type owned by a worker.
    type Probe: OrphanProbe;

    /// Open a fresh probe (for PostgreSQL, a fresh read-only connection).
    fn open_probe(&self) -> Result<Self::Probe, ProbeError>;
}

/// `WHERE` condition selecting orphans of `edge`, with the child table
/// aliased `c` and the parent `p`.
///
/// Composite keys use MATCH SIMPLE semantics: a row with any NULL key column
/// is never an orphan.
pub fn orphan_predicate(edge: &ForeignKeyEdge) -> String {
    let not_null = edge
        .child_columns
        .iter()
        .map(|c| format!("c.{} IS NOT NULL", quote_ident(c)))
        .collect::<Vec<_>>()
        .join(" AND ");
    let join = edge
        .parent_columns
        .iter()
        .zip(&edge.child_columns)
        .map(|(p, c)| format!("p.{} = c.{}", quote_ident(p), quote_ident(c)))
        .collect::<Vec<_>>()
        .join(" AND ");
    format!(
        "{not_null} AND NOT EXISTS (SELECT 1 FROM {} p WHERE {join})",
        edge.parent.quoted()
    )
}

/// Anti-join counting orphans of `edge`.
pub fn orphan_count_sql(edge: &ForeignKeyEdge) -> String {
    format!(
        "SELECT count(*) AS orphans FROM {} c WHERE {}",
        edge.child.quoted(),
        orphan_predicate(edge)
    )
}

/// Edges to probe, with their snapshot indices. Edges pointing at an
/// excluded parent are skipped.
pub fn audited_edges<'s>(
    graph: &ReferentialGraph<'s>,
    map: &ClassificationMap,
) -> Vec<(usize, &'s ForeignKeyEdge)> {
    graph
        .edges()
        .filter(|(_, edge)| {
            let excluded = map.is_excluded_parent(&edge.parent, graph.schema());
            if excluded {
                debug!(constraint = %edge.constraint_name, parent = %edge.parent, "parent excluded from orphan probes");
            }
            !excluded
        })
        .collect()
}

fn to_finding(edge: &ForeignKeyEdge, result: Result<u64, ProbeError>) -> Option<AuditFinding> {
    match result {
        Ok(0) => {
            debug!(constraint = %edge.constraint_name, "no orphans");
            None
        }
        Ok(count) => {
            debug!(constraint = %edge.constraint_name, count, "orphaned rows");
            Some(AuditFinding::orphaned_rows(edge, count))
        }
        Err(error) => {
            warn!(constraint = %edge.constraint_name, %error, "orphan probe failed");
            Some(AuditFinding::auditor_error(
                edge,
                error.failure(),
                error.to_string(),
            ))
        }
    }
}

/// Probe every audited edge on one probe, in edge order.
pub fn audit_sequential<P>(
    graph: &ReferentialGraph<'_>,
    map: &ClassificationMap,
    probe: &mut P,
) -> Vec<AuditFinding>
where
    P: OrphanProbe + ?Sized,
{
    let edges = audited_edges(graph, map);
    info!(edges = edges.len(), "probing foreign keys for orphans");
    edges
        .into_iter()
        .filter_map(|(_, edge)| to_finding(edge, probe.count_orphans(edge)))
        .collect()
}

/// Probe every audited edge on a bounded pool of `workers` scoped threads,
/// each owning its own probe. Findings come back in edge order.
pub fn audit_pooled<F>(
    graph: &ReferentialGraph<'_>,
    map: &ClassificationMap,
    factory: &F,
    workers: usize,
) -> Vec<AuditFinding>
where
    F: ProbeFactory,
{
    let edges = audited_edges(graph, map);
    let workers = workers.clamp(1, edges.len().max(1));
    info!(edges = edges.len(), workers, "probing foreign keys for orphans");

    let next = AtomicUsize::new(0);
    let results: Mutex<Vec<(usize, Result<u64, ProbeError>)>> = Mutex::new(Vec::new());
    let open_failure: Mutex<Option<ProbeError>> = Mutex::new(None);

    thread::scope(|scope| {
        for worker in 0..workers {
            let (edges, next, results, open_failure) = (&edges, &next, &results, &open_failure);
            scope.spawn(move || {
                let mut probe = match factory.open_probe() {
                    Ok(probe) => probe,
                    Err(error) => {
                        warn!(worker, %error, "could not open orphan probe");
                        open_failure
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .get_or_insert(error);
                        return;
                    }
                };
                loop {
                    let slot = next.fetch_add(1, Ordering::Relaxed);
                    let Some((_, edge)) = edges.get(slot) else {
                        break;
                    };
                    let result = probe.count_orphans(edge);
                    results
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push((slot, result));
                }
            });
        }
    });

    let mut results = results.into_inner().unwrap_or_else(PoisonError::into_inner);
    let open_failure = open_failure
        .into_inner()
        .unwrap_or_else(PoisonError::into_inner)
        .unwrap_or_else(|| ProbeError::ConnectionLost("no probe available".to_string()));

    let mut probed = vec![false; edges.len()];
    for (slot, _) in &results {
        probed[*slot] = true;
    }
    for (slot, was_probed) in probed.into_iter().enumerate() {
        if !was_probed {
            results.push((slot, Err(open_failure.clone())));
        }
    }
    results.sort_by_key(|(slot, _)| *slot);

    results
        .into_iter()
        .filter_map(|(slot, result)| to_finding(edges[slot].1, result))
        .collect()
}
