//! Value marshaling between the host and Lua.
//!
//! [`to_lua`] and [`from_lua`] are total: every [`Value`] has a Lua form and
//! every Lua value has a host form (unsupported kinds become
//! [`Value::None`]). Byte buffers travel as [`LuaBuffer`] userdata so that
//! they stay distinguishable from strings.
//!
//! Mappings are represented on the host side as a sequence of `[key, value]`
//! pairs. When converting with `collapse_to_mapping`, such a sequence becomes
//! a keyed Lua table whose metatable remembers the key order, so iterating it
//! with `pairs` and converting it back both follow the original order.

use std::cmp::Ordering;

use bytes::Bytes;
use mlua::prelude::*;

use crate::value::Value;

/// Nesting depth past which tables convert to `None` (guards cyclic tables).
const MAX_DEPTH: usize = 64;

/// Metatable field holding the ordered key list of a mapping table.
const ORDER_FIELD: &str = "__keys";

/// Named registry slot caching the ordered `__pairs` implementation.
const ORDERED_PAIRS_KEY: &str = "stage.ordered_pairs";

/// `__pairs` for mapping tables: recorded keys first, then any keys the
/// script added afterwards.
const ORDERED_PAIRS_SRC: &str = r"
return function(t)
    local order = getmetatable(t).__keys
    local seen, i, k, tail = {}, 0, nil, false
    local function iter()
        while not tail do
            i = i + 1
            local key = order[i]
            if key == nil then
                tail = true
                break
            end
            local v = rawget(t, key)
            if v ~= nil then
                seen[key] = true
                return key, v
            end
        end
        repeat
            k = next(t, k)
        until k == nil or not seen[k]
        if k ~= nil then
            return k, rawget(t, k)
        end
        return nil
    end
    return iter, t, nil
end
";

/// Byte buffer exposed to scripts (frames, binary attributes).
///
/// Holds a shared [`Bytes`] handle, so passing a frame to a script does not
/// copy the pixel data.
///
/// ```lua
/// local frame = sink:grab()
/// if frame then
///     log.info("frame of " .. #frame .. " bytes, first byte " .. frame:byte(1))
///     local raw = frame:bytes()   -- copy into a Lua string
/// end
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LuaBuffer(pub Bytes);

impl LuaUserData for LuaBuffer {
    fn add_methods<M: LuaUserDataMethods<Self>>(methods: &mut M) {
        methods.add_meta_method(LuaMetaMethod::Len, |_, this, ()| Ok(this.0.len()));

        methods.add_meta_method(LuaMetaMethod::ToString, |_, this, ()| {
            Ok(format!("buffer({} bytes)", this.0.len()))
        });

        methods.add_method("len", |_, this, ()| Ok(this.0.len()));

        // buffer:byte(i) -> integer or nil (1-based, like string.byte)
        methods.add_method("byte", |_, this, index: usize| {
            Ok(index
                .checked_sub(1)
                .and_then(|i| this.0.get(i))
                .copied())
        });

        // buffer:bytes() -> string (copies)
        methods.add_method("bytes", |lua, this, ()| lua.create_string(this.0.as_ref()));
    }
}

/// Convert a host value into a Lua value.
///
/// With `collapse_to_mapping`, a non-empty sequence made only of
/// `[scalar_key, value]` pairs becomes a keyed table instead of an array.
/// Values inside the mapping are converted without collapsing. When a key
/// repeats (including `1` and `1.0`, which Lua treats as one key), the last
/// value wins at the position of the first occurrence. NaN keys are dropped.
///
/// # Errors
///
/// Fails only when Lua cannot allocate.
pub fn to_lua(lua: &Lua, value: &Value, collapse_to_mapping: bool) -> LuaResult<LuaValue> {
    match value {
        Value::None => Ok(LuaValue::Nil),
        Value::Bool(b) => Ok(LuaValue::Boolean(*b)),
        Value::Int(i) => Ok(LuaValue::Integer(*i)),
        Value::Float(x) => Ok(LuaValue::Number(*x)),
        Value::Str(s) => lua.create_string(s).map(LuaValue::String),
        Value::Buffer(b) => lua
            .create_userdata(LuaBuffer(b.clone()))
            .map(LuaValue::UserData),
        Value::Seq(items) => {
            if collapse_to_mapping && !items.is_empty() && items.iter().all(Value::is_pair) {
                mapping_to_lua(lua, items)
            } else {
                sequence_to_lua(lua, items)
            }
        }
    }
}

/// Element form of a value: `None` becomes the `NULL` sentinel so the slot
/// survives inside a table.
fn element_to_lua(lua: &Lua, value: &Value) -> LuaResult<LuaValue> {
    match to_lua(lua, value, false)? {
        LuaValue::Nil => Ok(LuaValue::NULL),
        other => Ok(other),
    }
}

fn sequence_to_lua(lua: &Lua, items: &[Value]) -> LuaResult<LuaValue> {
    let table = lua.create_table_with_capacity(items.len(), 0)?;
    for (i, item) in items.iter().enumerate() {
        table.raw_set(i + 1, element_to_lua(lua, item)?)?;
    }
    Ok(LuaValue::Table(table))
}

fn mapping_to_lua(lua: &Lua, pairs: &[Value]) -> LuaResult<LuaValue> {
    let table = lua.create_table_with_capacity(0, pairs.len())?;
    let order = lua.create_table_with_capacity(pairs.len(), 0)?;
    let mut next_slot = 1;

    for pair in pairs {
        let Value::Seq(kv) = pair else { continue };
        if matches!(kv[0], Value::Float(x) if x.is_nan()) {
            log::debug!("NaN mapping key dropped");
            continue;
        }
        let key = to_lua(lua, &kv[0], false)?;
        // Lua stores 1.0 and 1 under the same key; raw_get sees both.
        if table.raw_get::<LuaValue>(key.clone())?.is_nil() {
            order.raw_set(next_slot, key.clone())?;
            next_slot += 1;
        } else {
            log::debug!("Duplicate mapping key {}, keeping the last value", kv[0]);
        }
        table.raw_set(key, element_to_lua(lua, &kv[1])?)?;
    }

    let metatable = lua.create_table()?;
    metatable.raw_set(ORDER_FIELD, order)?;
    metatable.raw_set("__pairs", ordered_pairs(lua)?)?;
    table.set_metatable(Some(metatable));
    Ok(LuaValue::Table(table))
}

fn ordered_pairs(lua: &Lua) -> LuaResult<LuaFunction> {
    if let Ok(func) = lua.named_registry_value::<LuaFunction>(ORDERED_PAIRS_KEY) {
        return Ok(func);
    }
    let func: LuaFunction = lua
        .load(ORDERED_PAIRS_SRC)
        .set_name("=ordered_pairs")
        .eval()?;
    lua.set_named_registry_value(ORDERED_PAIRS_KEY, func.clone())?;
    Ok(func)
}

/// Convert a Lua value into a host value. Never fails.
///
/// Mapping tables built by [`to_lua`] come back as `[key, value]` pairs in
/// their recorded order. Other tables whose keys are exactly `1..=n` become
/// [`Value::Seq`]; the rest become pairs in sorted key order. Functions,
/// threads, foreign userdata and the like become [`Value::None`].
#[must_use]
pub fn from_lua(value: &LuaValue) -> Value {
    convert(value, 0)
}

fn convert(value: &LuaValue, depth: usize) -> Value {
    match value {
        LuaValue::Nil => Value::None,
        LuaValue::Boolean(b) => Value::Bool(*b),
        LuaValue::Integer(i) => Value::Int(*i),
        LuaValue::Number(x) => Value::Float(*x),
        LuaValue::String(s) => match s.to_str() {
            Ok(text) => Value::Str((*text).to_owned()),
            Err(_) => Value::Buffer(Bytes::copy_from_slice(&s.as_bytes())),
        },
        LuaValue::Table(table) => {
            if depth >= MAX_DEPTH {
                log::debug!("Lua table nested deeper than {} converted to none", MAX_DEPTH);
                return Value::None;
            }
            table_to_value(table, depth + 1)
        }
        LuaValue::UserData(ud) => match ud.borrow::<LuaBuffer>() {
            Ok(buffer) => Value::Buffer(buffer.0.clone()),
            Err(_) => unsupported(value),
        },
        _ => unsupported(value),
    }
}

fn unsupported(value: &LuaValue) -> Value {
    if *value != LuaValue::NULL {
        log::debug!("Unsupported Lua value '{}' converted to none", value.type_name());
    }
    Value::None
}

fn table_to_value(table: &LuaTable, depth: usize) -> Value {
    let entries: Vec<(LuaValue, LuaValue)> = table
        .clone()
        .pairs::<LuaValue, LuaValue>()
        .filter_map(Result::ok)
        .collect();

    // Mappings produced by to_lua stay mappings, whatever their keys.
    let mut pairs: Vec<(Value, Value)> = Vec::with_capacity(entries.len());
    let mut seen: Vec<Value> = Vec::new();
    if let Some(order) = recorded_order(table) {
        for key in order {
            let host_key = convert(&key, depth);
            let identity = key_identity(&host_key);
            if seen.contains(&identity) {
                continue;
            }
            let Ok(value) = table.raw_get::<LuaValue>(key) else {
                continue;
            };
            if value.is_nil() {
                continue;
            }
            seen.push(identity);
            pairs.push((host_key, convert(&value, depth)));
        }
    } else if let Some(items) = as_sequence(&entries, depth) {
        return Value::Seq(items);
    }

    let mut rest: Vec<(Value, Value)> = entries
        .iter()
        .map(|(k, v)| (convert(k, depth), v))
        .filter(|(k, _)| !seen.contains(&key_identity(k)))
        .map(|(k, v)| (k, convert(v, depth)))
        .collect();
    rest.sort_by(|(a, _), (b, _)| compare_keys(a, b));
    pairs.extend(rest);

    pairs
        .into_iter()
        .map(|(k, v)| Value::Seq(vec![k, v]))
        .collect()
}

/// The key as Lua stores it: floats with an integral value are integers.
fn key_identity(key: &Value) -> Value {
    match key {
        Value::Float(x) if x.fract() == 0.0 && *x >= i64::MIN as f64 && *x < i64::MAX as f64 => {
            Value::Int(*x as i64)
        }
        other => other.clone(),
    }
}

/// Returns the elements if the table's keys are exactly `1..=n`.
fn as_sequence(entries: &[(LuaValue, LuaValue)], depth: usize) -> Option<Vec<Value>> {
    let n = entries.len();
    let mut slots: Vec<Option<Value>> = vec![None; n];
    for (key, value) in entries {
        let LuaValue::Integer(i) = key else {
            return None;
        };
        let idx = usize::try_from(*i).ok()?.checked_sub(1)?;
        if idx >= n {
            return None;
        }
        slots[idx] = Some(convert(value, depth));
    }
    slots.into_iter().collect()
}

fn recorded_order(table: &LuaTable) -> Option<Vec<LuaValue>> {
    let metatable = table.metatable()?;
    let order = metatable.raw_get::<Option<LuaTable>>(ORDER_FIELD).ok()??;
    Some(
        order
            .sequence_values::<LuaValue>()
            .filter_map(Result::ok)
            .collect(),
    )
}

/// Deterministic ordering for keys of tables without a recorded order:
/// booleans, then numbers, then strings, then anything else.
fn compare_keys(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Bool(_) => 0,
            Value::Int(_) | Value::Float(_) => 1,
            Value::Str(_) => 2,
            _ => 3,
        }
    }
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Str(x), Value::Str(y)) => x.cmp(y),
        _ if rank(a) == 1 && rank(b) == 1 => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            _ => Ordering::Equal,
        },
        _ => rank(a).cmp(&rank(b)),
    }
}

/// Build a host mapping value from named entries.
#[must_use]
pub fn mapping(entries: Vec<(String, Value)>) -> Value {
    entries
        .into_iter()
        .map(|(k, v)| Value::Seq(vec![Value::Str(k), v]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(lua: &Lua, value: &Value) -> Value {
        let lua_value = to_lua(lua, value, false).unwrap();
        from_lua(&lua_value)
    }

    #[test]
    fn test_scalars_round_trip() {
        let lua = Lua::new();
        for value in [
            Value::Int(42),
            Value::Int(-7),
            Value::Float(0.5),
            Value::Float(2.0),
            Value::Bool(true),
            Value::Bool(false),
            Value::from("hello"),
            Value::from(""),
            Value::None,
        ] {
            assert_eq!(round_trip(&lua, &value), value);
        }
    }

    #[test]
    fn test_buffer_round_trip_keeps_tag() {
        let lua = Lua::new();
        let text_like = Value::Buffer(Bytes::from_static(b"plain ascii"));
        assert_eq!(round_trip(&lua, &text_like), text_like);
    }

    #[test]
    fn test_nested_sequence_round_trip() {
        let lua = Lua::new();
        let value = Value::Seq(vec![
            Value::from(1),
            Value::Seq(vec![Value::from("a"), Value::from(2.5), Value::Seq(vec![])]),
            Value::None,
            Value::Buffer(Bytes::from_static(&[0, 255, 3])),
            Value::pair("k", "v"),
        ]);
        assert_eq!(round_trip(&lua, &value), value);
    }

    #[test]
    fn test_mapping_round_trip_preserves_order() {
        let lua = Lua::new();
        let value = Value::Seq(vec![
            Value::pair("zeta", 1),
            Value::pair("alpha", Value::Seq(vec![Value::from(1), Value::from(2)])),
            Value::pair("mid", "x"),
            Value::pair(7, true),
        ]);
        let lua_value = to_lua(&lua, &value, true).unwrap();
        let LuaValue::Table(ref table) = lua_value else {
            panic!("expected a table");
        };
        let zeta: i64 = table.get("zeta").unwrap();
        assert_eq!(zeta, 1);
        assert_eq!(from_lua(&lua_value), value);
    }

    #[test]
    fn test_mapping_pairs_iterates_in_order() {
        let lua = Lua::new();
        let value = Value::Seq(vec![
            Value::pair("c", 1),
            Value::pair("a", 2),
            Value::pair("b", 3),
        ]);
        let mapping = to_lua(&lua, &value, true).unwrap();
        lua.globals().set("m", mapping).unwrap();
        let keys: String = lua
            .load(
                r#"
            local out = {}
            for k, _ in pairs(m) do out[#out + 1] = k end
            return table.concat(out, ",")
        "#,
            )
            .eval()
            .unwrap();
        assert_eq!(keys, "c,a,b");
    }

    #[test]
    fn test_mapping_with_integer_keys_stays_a_mapping() {
        let lua = Lua::new();
        let value = Value::Seq(vec![Value::pair(2, "b"), Value::pair(1, "a")]);
        let lua_value = to_lua(&lua, &value, true).unwrap();
        assert_eq!(from_lua(&lua_value), value);
    }

    #[test]
    fn test_mapping_with_integral_float_key() {
        let lua = Lua::new();
        let value = Value::Seq(vec![Value::pair(1.0, "a"), Value::pair("k", 1)]);
        let lua_value = to_lua(&lua, &value, true).unwrap();
        let LuaValue::Table(ref table) = lua_value else {
            panic!("expected a table");
        };
        // Lua normalises the key to the integer 1.
        let stored: String = table.raw_get(1).unwrap();
        assert_eq!(stored, "a");
        assert_eq!(from_lua(&lua_value), value);
    }

    #[test]
    fn test_duplicate_mapping_keys_keep_last_value() {
        let lua = Lua::new();
        let value = Value::Seq(vec![
            Value::pair("a", 1),
            Value::pair("b", 2),
            Value::pair("a", 3),
            Value::pair(1.0, "x"),
            Value::pair(1, "y"),
        ]);
        let lua_value = to_lua(&lua, &value, true).unwrap();
        assert_eq!(
            from_lua(&lua_value),
            Value::Seq(vec![
                Value::pair("a", 3),
                Value::pair("b", 2),
                Value::pair(1.0, "y"),
            ])
        );
    }

    #[test]
    fn test_collapse_falls_back_to_array() {
        let lua = Lua::new();
        let value = Value::Seq(vec![Value::pair("a", 1), Value::from(3)]);
        let lua_value = to_lua(&lua, &value, true).unwrap();
        let LuaValue::Table(table) = &lua_value else {
            panic!("expected a table");
        };
        assert_eq!(table.raw_len(), 2);
        assert_eq!(from_lua(&lua_value), value);
    }

    #[test]
    fn test_script_table_becomes_sorted_pairs() {
        let lua = Lua::new();
        let value: LuaValue = lua.load("return { b = 2, a = 1, [3] = 'x' }").eval().unwrap();
        assert_eq!(
            from_lua(&value),
            Value::Seq(vec![
                Value::pair(3, "x"),
                Value::pair("a", 1),
                Value::pair("b", 2),
            ])
        );
    }

    #[test]
    fn test_script_array_becomes_sequence() {
        let lua = Lua::new();
        let value: LuaValue = lua.load("return { 10, 20, { 'x' } }").eval().unwrap();
        assert_eq!(
            from_lua(&value),
            Value::Seq(vec![
                Value::from(10),
                Value::from(20),
                Value::Seq(vec![Value::from("x")]),
            ])
        );
    }

    #[test]
    fn test_unsupported_kinds_become_none() {
        let lua = Lua::new();
        let func: LuaValue = lua.load("return function() end").eval().unwrap();
        assert_eq!(from_lua(&func), Value::None);

        let co: LuaValue = lua
            .load("return coroutine.create(function() end)")
            .eval()
            .unwrap();
        assert_eq!(from_lua(&co), Value::None);
    }

    #[test]
    fn test_non_utf8_string_becomes_buffer() {
        let lua = Lua::new();
        let s = lua.create_string([0xff_u8, 0xfe, 0x00]).unwrap();
        assert_eq!(
            from_lua(&LuaValue::String(s)),
            Value::Buffer(Bytes::from_static(&[0xff, 0xfe, 0x00]))
        );
    }

    #[test]
    fn test_cyclic_table_terminates() {
        let lua = Lua::new();
        let value: LuaValue = lua
            .load("local t = {} t.self = t return t")
            .eval()
            .unwrap();
        // Must not overflow the stack; the innermost level degrades to none.
        let converted = from_lua(&value);
        assert!(matches!(converted, Value::Seq(_)));
    }

    #[test]
    fn test_buffer_userdata_methods() {
        let lua = Lua::new();
        let buf = to_lua(&lua, &Value::Buffer(Bytes::from_static(b"abc")), false).unwrap();
        lua.globals().set("buf", buf).unwrap();
        let (len, first, missing, copy): (usize, u8, Option<u8>, String) = lua
            .load("return #buf, buf:byte(1), buf:byte(9), buf:bytes()")
            .eval()
            .unwrap();
        assert_eq!(len, 3);
        assert_eq!(first, b'a');
        assert_eq!(missing, None);
        assert_eq!(copy, "abc");
    }

    #[test]
    fn test_mapping_helper() {
        let value = mapping(vec![("w".to_string(), Value::from(4))]);
        assert_eq!(value, Value::Seq(vec![Value::pair("w", 4)]));
    }
}
