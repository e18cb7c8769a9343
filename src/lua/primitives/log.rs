//! Logging primitive for Lua scripts.
//!
//! Exposes the `log` crate through a global `log` table:
//!
//! ```lua
//! log.info("scene loaded")
//! log.warn("camera not found, using defaults")
//! log.debug("zoom is", stage.get_object_attribute("camera", "zoom"))
//! ```
//!
//! Every message goes to target `lua` and is prefixed with the script's
//! module name, so output from several instances stays attributable.
//! Non-string arguments are rendered through the value codec.

use anyhow::{anyhow, Result};
use mlua::prelude::*;

use crate::lua::codec::from_lua;

fn render(args: &LuaMultiValue) -> String {
    args.iter()
        .map(|value| match value {
            LuaValue::String(s) => s.to_string_lossy().to_string(),
            other => from_lua(other).to_string(),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Register the global `log` table for the script `module`.
///
/// # Errors
///
/// Returns an error if Lua table or function creation fails.
pub fn register(lua: &Lua, module: &str) -> Result<()> {
    let log_table = lua
        .create_table()
        .map_err(|e| anyhow!("Failed to create log table: {e}"))?;

    let levels = [
        ("error", log::Level::Error),
        ("warn", log::Level::Warn),
        ("info", log::Level::Info),
        ("debug", log::Level::Debug),
        ("trace", log::Level::Trace),
    ];

    for (name, level) in levels {
        let module = module.to_string();
        let func = lua
            .create_function(move |_, args: LuaMultiValue| {
                log::log!(target: "lua", level, "[{}] {}", module, render(&args));
                Ok(())
            })
            .map_err(|e| anyhow!("Failed to create log.{name} function: {e}"))?;
        log_table
            .set(name, func)
            .map_err(|e| anyhow!("Failed to set log.{name}: {e}"))?;
    }

    lua.globals()
        .set("log", log_table)
        .map_err(|e| anyhow!("Failed to register log table: {e}"))?;

    Ok(())
}
