//! Plugin bundles, process supervision, the active plugin set and hook
//! dispatch for hookd.
//!
//! Each active plugin runs as its own subprocess behind a [`Supervisor`];
//! [`PluginEnvironment`] owns the active set and [`HookDispatcher`] fans hook
//! invocations out across it.

pub mod api;
pub mod bundle;
pub mod dispatcher;
pub mod environment;
pub mod error;
pub mod kv_store;
pub mod supervisor;

pub use api::*;
pub use bundle::*;
pub use dispatcher::*;
pub use environment::*;
pub use error::*;
pub use kv_store::*;
pub use supervisor::*;

#[cfg(test)]
mod tests;
