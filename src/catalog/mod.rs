/// `CatalogSource` contract and snapshot assembly.
pub mod introspect;
/// Live PostgreSQL catalog access (requires the `db` feature).
#[cfg(feature = "db")]
pub mod postgres;
/// Immutable catalog snapshot and its descriptors.
pub mod snapshot;
/// JSON catalog exports, used offline and in tests.
pub mod static_catalog;
