//! Stagescript: embedded Lua scripting for a real-time graphics host.
//!
//! Scripts observe and mutate the host's object graph, react to attribute
//! changes, and read rendered frames, each on its own update loop.
//!
//! - [`value`] - host-side dynamic values
//! - [`host`] - the host collaborator traits and an in-memory host
//! - [`lua`] - runtime supervisor, script instances, callbacks, primitives
//! - [`config`] - runner configuration
//! - [`error`] - error taxonomy

pub mod config;
pub mod error;
pub mod host;
pub mod lua;
pub mod value;

pub use config::ScriptConfig;
pub use error::{BridgeError, BridgeResult, ScriptFault};
pub use host::{CaptureEndpoint, Host, MemoryHost, SharedHost};
pub use lua::{CallbackRegistry, Outcome, RuntimeSupervisor, ScriptInstance};
pub use value::Value;
