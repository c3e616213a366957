//! Job ledger and the background maintenance worker for hookd.
//!
//! Jobs are claimed with a compare-and-set on their status so only one
//! worker ever runs a given job; outcomes are recorded as terminal
//! `success`/`error` transitions.

mod sqlite;
mod store;

pub mod scheduler;
pub mod types;
pub mod worker;

pub use scheduler::*;
pub use sqlite::SqliteJobStore;
pub use store::*;
pub use types::*;
pub use worker::*;
