//! Lua scripting bridge.
//!
//! Each [`ScriptInstance`] runs one Lua module in its own isolated context
//! on its own thread. A single global execution lock, owned by the
//! [`RuntimeSupervisor`], serializes every entry into any context.
//!
//! # Architecture
//!
//! ```text
//! RuntimeSupervisor (process-wide)
//!  ├── GlobalState (lazy, torn down with the last instance)
//!  ├── execution lock ──► current context register
//!  └── ScriptInstance × N
//!       ├── IsolatedContext (mlua::Lua)
//!       ├── loop thread "script-<module>"
//!       ├── Inbox ◄── CallbackRegistry::dispatch ◄── Host change notification
//!       ├── SinkTracker ──► FrameSink ──► CaptureEndpoint
//!       └── Primitives
//!            ├── log (error, warn, info, debug, trace)
//!            └── stage (graph queries, writes, callbacks, Sink)
//! ```
//!
//! # Configuration
//!
//! - `STAGE_SCRIPT_STRICT` - If "1", errors in attribute callbacks end the instance
//! - `STAGE_UPDATE_RATE` - Default ticks per second
//!
//! # Usage
//!
//! ```ignore
//! let host: SharedHost = Arc::new(MemoryHost::new());
//! let registry = CallbackRegistry::new(host);
//! let mut script = ScriptInstance::new(registry);
//! script.set_script_file("scripts/spin.lua");
//! if script.run() {
//!     // ...
//!     script.stop();
//! }
//! ```

pub mod callbacks;
pub mod codec;
pub mod instance;
pub mod primitives;
pub mod supervisor;

pub use callbacks::{CallbackRegistry, Inbox, InstanceId, Pending, RegistrationId};
pub use codec::{from_lua, to_lua, LuaBuffer};
pub use instance::{Outcome, ScriptInstance};
pub use primitives::{FrameSinkState, SinkTracker};
pub use supervisor::{ContextId, ExecGuard, GlobalState, IsolatedContext, RuntimeSupervisor};
