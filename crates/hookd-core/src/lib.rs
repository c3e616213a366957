//! Shared domain types for the hookd plugin runtime.
//!
//! Exposes the per-request hook context, the hook catalog with its dispatch
//! policies, and clock helpers reused by the RPC, plugin, and job crates.

pub mod context;
pub mod hooks;
pub mod time_utils;

pub use context::*;
pub use hooks::*;
pub use time_utils::*;
