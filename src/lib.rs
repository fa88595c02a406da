//! Audit a `PostgreSQL` schema for referential integrity, foreign-key index
//! coverage and row-level security, and synthesize an idempotent remediation
//! script.
#![warn(missing_docs)]

/// Findings, graph building and the per-stage auditors.
pub mod audit;
/// Catalog snapshot model and its sources.
pub mod catalog;
/// Classification map, policy purposes and predicate recognition.
pub mod classifier;
/// Connection and run settings.
pub mod config;
/// Typed errors per layer.
pub mod error;
/// Remediation synthesis and DDL templates.
pub mod generator;
/// Report, summary and artifact writing.
pub mod output;
/// SQL identifier and expression helpers.
pub mod parser;
