//! Storage layer for docqa
//!
//! The corpus itself lives in snapshots (see `index`); SQLite keeps the
//! auxiliary state: unanswered questions and monthly usage.

pub mod database;

pub use database::{Database, DbPool, NewUnanswered, UnansweredQuestion};
