//! Newline-delimited JSON RPC bridge between the host and plugin processes.
//!
//! Provides the frame codec and startup handshake, a duplex peer that
//! multiplexes calls in both directions over one byte stream, and the
//! plugin-side SDK that extensions link against.

pub mod error;
pub mod frame;
pub mod methods;
pub mod peer;
pub mod sdk;

pub use error::*;
pub use frame::*;
pub use methods::*;
pub use peer::*;
pub use sdk::*;
