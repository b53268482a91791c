//! rollcall-store: SQLite persistence for reference embeddings, attendance
//! records and the audit log.

mod attendance;
mod audit;
mod database;
mod references;

pub use database::Database;
