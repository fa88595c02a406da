use std::collections::BTreeMap;

use tracing::{debug, info};

use crate::audit::findings::AuditFinding;
use crate::audit::graph::ReferentialGraph;
use crate::catalog::snapshot::{Snapshot, TableRef};
use crate::classifier::classification::ClassificationMap;
use crate::parser::names::{bounded_identifier, identifier_fragment, name_digest, suffixed_identifier};

fn name_stem(table: &TableRef, columns: &[String]) -> String {
    let columns = columns
        .iter()
        .map(|c| identifier_fragment(c))
        .collect::<Vec<_>>()
        .join("_");
    format!("idx_{}_{columns}", identifier_fragment(&table.name))
}

/// Deterministic name for an index over `columns` of `table`.
pub fn index_name(table: &TableRef, columns: &[String]) -> String {
    bounded_identifier(&name_stem(table, columns))
}

/// [`index_name`] with a digest of the exact schema, table and column names.
///
/// `_` both joins fragments and occurs inside them, so `a_b(c)` and `a(b_c)`
/// share a plain name. The digest tells them apart.
pub fn qualified_index_name(table: &TableRef, columns: &[String]) -> String {
    let mut parts = vec![table.schema.as_str(), table.name.as_str()];
    parts.extend(columns.iter().map(String::as_str));
    suffixed_identifier(&name_stem(table, columns), &name_digest(parts))
}

/// Flag foreign keys whose child columns lead no index of the child table.
///
/// Parallel edges over the same columns collapse into one finding naming every
/// constraint. A suggested name shared by two findings, or already used by an
/// index of the schema, is replaced by its [`qualified_index_name`].
pub fn advise_indexes(
    snapshot: &Snapshot,
    graph: &ReferentialGraph<'_>,
    map: &ClassificationMap,
) -> Vec<AuditFinding> {
    let mut uncovered: BTreeMap<(&TableRef, &[String]), Vec<String>> = BTreeMap::new();
    let mut order: Vec<(&TableRef, &[String])> = Vec::new();

    for (_, edge) in graph.edges() {
        let skip = map
            .classification_for(&edge.child, snapshot.schema())
            .is_some_and(|c| c.skip_index_advice);
        if skip {
            continue;
        }
        let covered = snapshot
            .indexes_on(&edge.child)
            .any(|index| index.covers_prefix(&edge.child_columns));
        if covered {
            debug!(constraint = %edge.constraint_name, "foreign key is indexed");
            continue;
        }
        let key = (&edge.child, edge.child_columns.as_slice());
        let constraints = uncovered.entry(key).or_insert_with(|| {
            order.push(key);
            Vec::new()
        });
        constraints.push(edge.constraint_name.clone());
    }

    let keyed: Vec<((&TableRef, &[String]), Vec<String>)> = order
        .into_iter()
        .filter_map(|key| uncovered.remove(&key).map(|constraints| (key, constraints)))
        .collect();

    let mut plain_names: BTreeMap<String, usize> = BTreeMap::new();
    for ((table, columns), _) in &keyed {
        *plain_names.entry(index_name(table, columns)).or_default() += 1;
    }

    keyed
        .into_iter()
        .map(|((table, columns), constraints)| {
            let plain = index_name(table, columns);
            let shared = plain_names.get(&plain).is_some_and(|count| *count > 1);
            let existing = snapshot
                .indexes()
                .iter()
                .any(|index| index.table.schema == table.schema && index.name == plain);
            let name = if shared || existing {
                let qualified = qualified_index_name(table, columns);
                info!(table = %table, plain = %plain, name = %qualified, "index name taken; qualified");
                qualified
            } else {
                plain
            };
            AuditFinding::missing_index(table, columns, constraints, name)
        })
        .collect()
}
