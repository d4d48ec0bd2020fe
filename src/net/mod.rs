//! Consumer-side helpers built on the engine's two primitives: "give me the
//! next event" and "send or receive on this peer".
//!
//! # Example
//!
//! ```rust,no_run
//! use mill_socket::net::patterns::Replier;
//! use mill_socket::EngineConfig;
//!
//! # fn main() -> mill_socket::error::Result<()> {
//! let replier = Replier::bind("tcp://127.0.0.1:5555", EngineConfig::default())?;
//! replier.run(|request| Some(request.to_vec()))?;
//! # Ok(())
//! # }
//! ```

pub mod address;
pub mod patterns;
