//! Database layer.
//!
//! The orchestrator writes through the `DurableStore` port of vidquiz-core;
//! [`sqlite::SqliteStore`] is the implementation this server ships with. It
//! also carries the server-only maintenance queries (startup recovery and
//! row deletion) that the port does not model.

pub mod sqlite;
