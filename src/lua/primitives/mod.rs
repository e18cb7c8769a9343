//! Lua primitive functions exposed to scripts.
//!
//! Primitives are registered into every isolated context when its script
//! instance starts, before the script module is loaded.
//!
//! # Available Primitives
//!
//! - `log` - Logging functions (error, warn, info, debug, trace)
//! - `stage` - Host object graph queries, attribute writes and change callbacks
//! - `stage.Sink` - Frame sinks bound to host capture endpoints
//!
//! # Adding New Primitives
//!
//! 1. Create a new module (e.g., `foo.rs`)
//! 2. Implement a `register(lua: &Lua, ...) -> Result<()>` function
//! 3. Add `pub mod foo;` here
//! 4. Call `foo::register(...)?;` in `register_all`

pub mod log;
pub mod sink;
pub mod stage;

use anyhow::Result;
use mlua::Lua;

pub use sink::{FrameSinkState, LuaFrameSink, SinkTracker};
pub use stage::StageContext;

/// Register all primitives with the Lua state.
///
/// # Errors
///
/// Returns an error if any primitive registration fails.
pub fn register_all(lua: &Lua, ctx: &StageContext) -> Result<()> {
    log::register(lua, &ctx.module)?;
    stage::register(lua, ctx)?;

    ::log::debug!("Registered Lua primitives for '{}'", ctx.module);
    Ok(())
}
