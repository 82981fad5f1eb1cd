//! JSON encode/decode for plugin code.
//!
//! ```lua
//! local text, err = json.encode({ method = "Runtime.evaluate", params = { expression = "1+1" } })
//! local value, err = json.decode('{"id":1,"result":{}}')
//! ```
//!
//! Failures return `nil, message` instead of raising.

use anyhow::{anyhow, Result};
use mlua::{IntoLua, Lua, LuaSerdeExt, Value};

/// Convert JSON into a Lua value with JSON `null` as real `nil`.
///
/// `LuaSerdeExt::to_value` would produce the `null` light userdata
/// sentinel, which is truthy in Lua. Object members that are `null`
/// are left out of the table.
pub fn json_to_lua(lua: &Lua, v: &serde_json::Value) -> mlua::Result<Value> {
    Ok(match v {
        serde_json::Value::Null => Value::Nil,
        serde_json::Value::Bool(b) => Value::Boolean(*b),
        serde_json::Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => Value::Integer(i),
            (None, Some(f)) => Value::Number(f),
            (None, None) => Value::Nil,
        },
        serde_json::Value::String(s) => Value::String(lua.create_string(s)?),
        serde_json::Value::Array(items) => {
            let table = lua.create_table_with_capacity(items.len(), 0)?;
            for (i, item) in items.iter().enumerate() {
                table.raw_set(i + 1, json_to_lua(lua, item)?)?;
            }
            Value::Table(table)
        }
        serde_json::Value::Object(map) => {
            let table = lua.create_table_with_capacity(0, map.len())?;
            for (key, item) in map.iter().filter(|(_, item)| !item.is_null()) {
                table.raw_set(key.as_str(), json_to_lua(lua, item)?)?;
            }
            Value::Table(table)
        }
    })
}

/// Convert a Lua value into JSON.
pub fn lua_to_json(lua: &Lua, value: Value) -> mlua::Result<serde_json::Value> {
    lua.from_value(value)
}

/// `value, nil` on success, `nil, message` on failure.
fn lua_pair<T: IntoLua>(lua: &Lua, result: std::result::Result<T, String>) -> mlua::Result<(Value, Value)> {
    match result {
        Ok(value) => Ok((value.into_lua(lua)?, Value::Nil)),
        Err(message) => Ok((Value::Nil, message.into_lua(lua)?)),
    }
}

/// Register the `json` table.
pub fn register(lua: &Lua) -> Result<()> {
    let json_table = lua
        .create_table()
        .map_err(|e| anyhow!("Failed to create json table: {e}"))?;

    let encode_fn = lua
        .create_function(|lua, value: Value| {
            let encoded = lua_to_json(lua, value)
                .map_err(|e| format!("Failed to convert Lua value: {e}"))
                .and_then(|json| serde_json::to_string(&json).map_err(|e| format!("Failed to encode JSON: {e}")));
            lua_pair(lua, encoded)
        })
        .map_err(|e| anyhow!("Failed to create json.encode function: {e}"))?;

    let decode_fn = lua
        .create_function(|lua, text: String| {
            let decoded = match serde_json::from_str::<serde_json::Value>(&text) {
                Ok(json) => Ok(json_to_lua(lua, &json)?),
                Err(e) => Err(format!("Failed to decode JSON: {e}")),
            };
            lua_pair(lua, decoded)
        })
        .map_err(|e| anyhow!("Failed to create json.decode function: {e}"))?;

    json_table
        .set("encode", encode_fn)
        .map_err(|e| anyhow!("Failed to set json.encode: {e}"))?;
    json_table
        .set("decode", decode_fn)
        .map_err(|e| anyhow!("Failed to set json.decode: {e}"))?;

    lua.globals()
        .set("json", json_table)
        .map_err(|e| anyhow!("Failed to register json table globally: {e}"))?;

    Ok(())
}
