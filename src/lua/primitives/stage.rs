//! The `stage` table: host graph access for Lua scripts.
//!
//! # Usage in Lua
//!
//! ```lua
//! local cams = stage.get_objects_of_type("camera")
//! local zoom = stage.get_object_attribute(cams[1], "zoom")
//! stage.set_object_attribute(cams[1], "zoom", zoom * 2)
//!
//! local id = stage.register_attribute_callback("camera", "zoom", function(obj, attr, value)
//!     log.info(obj .. "." .. attr .. " is now " .. tostring(value))
//! end)
//! stage.unregister_attribute_callback(id)
//! ```
//!
//! Lookups that fail return `nil`, writes that fail return `false`. Nothing
//! here raises for a missing object or attribute.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use mlua::prelude::*;

use crate::host::SharedHost;
use crate::lua::callbacks::{CallbackRegistry, HandlerTable, Inbox, InstanceId, RegistrationId};
use crate::lua::codec::{from_lua, mapping, to_lua};
use crate::lua::primitives::sink::{self, SinkTracker};
use crate::value::Value;

/// Everything the `stage` primitives need from their instance.
#[derive(Debug, Clone)]
pub struct StageContext {
    /// Owning instance.
    pub instance_id: InstanceId,
    /// Script module name.
    pub module: String,
    /// Shared callback registry (also gives access to the host).
    pub registry: Arc<CallbackRegistry>,
    /// The instance's inbox, target of callback dispatch.
    pub inbox: Inbox,
    /// Lua handlers of this instance by registration id.
    pub handlers: HandlerTable,
    /// Sinks created by this instance.
    pub sinks: SinkTracker,
    /// Launch arguments.
    pub args: Vec<Value>,
}

impl StageContext {
    fn host(&self) -> SharedHost {
        Arc::clone(self.registry.host())
    }
}

fn add_fn<A, R, F>(lua: &Lua, table: &LuaTable, name: &str, func: F) -> Result<()>
where
    A: FromLuaMulti,
    R: IntoLuaMulti,
    F: Fn(&Lua, A) -> LuaResult<R> + Send + 'static,
{
    let function = lua
        .create_function(func)
        .map_err(|e| anyhow!("Failed to create stage.{name} function: {e}"))?;
    table
        .set(name, function)
        .map_err(|e| anyhow!("Failed to set stage.{name}: {e}"))?;
    Ok(())
}

fn names_to_lua(lua: &Lua, names: Option<Vec<String>>) -> LuaResult<LuaValue> {
    match names {
        Some(names) => lua.create_sequence_from(names).map(LuaValue::Table),
        None => Ok(LuaValue::Nil),
    }
}

/// Register the global `stage` table.
///
/// # Errors
///
/// Returns an error if Lua table or function creation fails.
pub fn register(lua: &Lua, ctx: &StageContext) -> Result<()> {
    let stage = lua
        .create_table()
        .map_err(|e| anyhow!("Failed to create stage table: {e}"))?;

    register_queries(lua, &stage, ctx)?;
    register_writes(lua, &stage, ctx)?;
    register_callbacks(lua, &stage, ctx)?;
    sink::register(lua, &stage, ctx.host(), ctx.sinks.clone())?;

    let args = to_lua(lua, &Value::Seq(ctx.args.clone()), false)
        .map_err(|e| anyhow!("Failed to convert launch arguments: {e}"))?;
    stage
        .set("args", args)
        .map_err(|e| anyhow!("Failed to set stage.args: {e}"))?;
    stage
        .set("instance_id", ctx.instance_id)
        .map_err(|e| anyhow!("Failed to set stage.instance_id: {e}"))?;

    lua.globals()
        .set("stage", stage)
        .map_err(|e| anyhow!("Failed to register stage table: {e}"))?;

    Ok(())
}

fn register_queries(lua: &Lua, stage: &LuaTable, ctx: &StageContext) -> Result<()> {
    let module = ctx.module.clone();
    add_fn(lua, stage, "get_interpreter_name", move |_, ()| Ok(module.clone()))?;

    let host = ctx.host();
    add_fn(lua, stage, "get_logs", move |lua, ()| to_lua(lua, &host.logs(), false))?;

    let host = ctx.host();
    add_fn(lua, stage, "get_timings", move |lua, ()| to_lua(lua, &host.timings(), true))?;

    let host = ctx.host();
    add_fn(lua, stage, "get_master_clock", move |lua, ()| {
        to_lua(lua, &host.master_clock(), true)
    })?;

    let host = ctx.host();
    add_fn(lua, stage, "get_object_list", move |lua, ()| {
        lua.create_sequence_from(host.list_objects())
    })?;

    // stage.get_object_types() -> { name = type, ... }
    let host = ctx.host();
    add_fn(lua, stage, "get_object_types", move |lua, ()| {
        let types = host
            .object_types()
            .into_iter()
            .map(|(name, type_name)| (name, Value::Str(type_name)))
            .collect();
        to_lua(lua, &mapping(types), true)
    })?;

    let host = ctx.host();
    add_fn(lua, stage, "get_object_type", move |_, object: String| {
        Ok(host.object_type(&object))
    })?;

    let host = ctx.host();
    add_fn(lua, stage, "get_objects_of_type", move |lua, type_name: String| {
        lua.create_sequence_from(host.objects_of_type(&type_name))
    })?;

    let host = ctx.host();
    add_fn(lua, stage, "get_object_description", move |_, object: String| {
        Ok(host.describe_object(&object))
    })?;

    let host = ctx.host();
    add_fn(
        lua,
        stage,
        "get_object_attribute_description",
        move |_, (object, attribute): (String, String)| {
            Ok(host.describe_attribute(&object, &attribute))
        },
    )?;

    let host = ctx.host();
    add_fn(
        lua,
        stage,
        "get_object_attribute",
        move |lua, (object, attribute): (String, String)| match host.get_attribute(&object, &attribute) {
            Some(value) => to_lua(lua, &value, false),
            None => Ok(LuaValue::Nil),
        },
    )?;

    // stage.get_object_attributes(name) -> { attr = value, ... } or nil
    let host = ctx.host();
    add_fn(lua, stage, "get_object_attributes", move |lua, object: String| {
        match host.get_attributes(&object) {
            Some(attributes) => to_lua(lua, &mapping(attributes), true),
            None => Ok(LuaValue::Nil),
        }
    })?;

    let host = ctx.host();
    add_fn(lua, stage, "get_object_links", move |lua, object: String| {
        names_to_lua(lua, host.list_links(&object))
    })?;

    let host = ctx.host();
    add_fn(lua, stage, "get_object_reversed_links", move |lua, object: String| {
        names_to_lua(lua, host.list_reverse_links(&object))
    })?;

    let host = ctx.host();
    add_fn(lua, stage, "get_types_from_category", move |lua, category: String| {
        lua.create_sequence_from(host.types_in_category(&category))
    })?;

    Ok(())
}

fn register_writes(lua: &Lua, stage: &LuaTable, ctx: &StageContext) -> Result<()> {
    let host = ctx.host();
    add_fn(
        lua,
        stage,
        "set_global",
        move |_, (attribute, value): (String, LuaValue)| {
            Ok(host.set_global(&attribute, from_lua(&value)))
        },
    )?;

    let host = ctx.host();
    add_fn(
        lua,
        stage,
        "set_object_attribute",
        move |_, (object, attribute, value): (String, String, LuaValue)| {
            Ok(host.set_attribute(&object, &attribute, from_lua(&value)))
        },
    )?;

    // stage.set_objects_of_type(type, attr, value) -> true if every object took it
    let host = ctx.host();
    add_fn(
        lua,
        stage,
        "set_objects_of_type",
        move |_, (type_name, attribute, value): (String, String, LuaValue)| {
            let value = from_lua(&value);
            let objects = host.objects_of_type(&type_name);
            let mut all = !objects.is_empty();
            for object in &objects {
                all &= host.set_attribute(object, &attribute, value.clone());
            }
            Ok(all)
        },
    )?;

    let host = ctx.host();
    add_fn(
        lua,
        stage,
        "add_custom_attribute",
        move |_, (object, attribute, default): (String, String, LuaValue)| {
            Ok(host.add_custom_attribute(&object, &attribute, from_lua(&default)))
        },
    )?;

    Ok(())
}

fn register_callbacks(lua: &Lua, stage: &LuaTable, ctx: &StageContext) -> Result<()> {
    // stage.register_attribute_callback(object, attribute, fn) -> id or nil
    let registering = ctx.clone();
    add_fn(
        lua,
        stage,
        "register_attribute_callback",
        move |lua, (object, attribute, handler): (String, String, LuaFunction)| {
            let ctx = &registering;
            let key = lua.create_registry_value(handler)?;
            let handlers = Arc::clone(&ctx.handlers);
            // The handler is in place before dispatch can see the registration.
            let registered = ctx.registry.register_with(
                &object,
                &attribute,
                ctx.instance_id,
                &ctx.inbox,
                move |id| {
                    handlers
                        .lock()
                        .expect("handler table mutex poisoned")
                        .insert(id, key);
                },
            );
            match registered {
                Ok(id) => Ok(Some(id)),
                Err(e) => {
                    log::warn!("[{}] register_attribute_callback: {}", ctx.module, e);
                    Ok(None)
                }
            }
        },
    )?;

    // stage.unregister_attribute_callback(id) -> bool
    let unregistering = ctx.clone();
    add_fn(
        lua,
        stage,
        "unregister_attribute_callback",
        move |lua, id: RegistrationId| {
            let ctx = &unregistering;
            let key = ctx
                .handlers
                .lock()
                .expect("handler table mutex poisoned")
                .remove(&id);
            let Some(key) = key else {
                return Ok(false);
            };
            lua.remove_registry_value(key)?;
            Ok(ctx.registry.unregister(id))
        },
    )?;

    Ok(())
}
