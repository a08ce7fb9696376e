//! Serialized Methods
//!
//! A map value shaped `{"args": [...], "body": "..."}` is a method. Bodies
//! are Lua chunks run in a sandboxed VM owned by the map. A method only
//! sees `this` (the calling reference) and its arguments.

use crate::error::{Result, SharingError};
use crate::map::reference::MapRef;
use mlua::{Function, Lua, LuaOptions, LuaSerdeExt, StdLib, Table, Value as LuaValue, Variadic};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Globals removed from the VM after creation.
const BLOCKED_GLOBALS: &[&str] = &[
    "load",
    "loadstring",
    "dofile",
    "loadfile",
    "require",
    "collectgarbage",
];

const LUA_KEYWORDS: &[&str] = &[
    "and", "break", "do", "else", "elseif", "end", "false", "for", "function", "goto", "if", "in",
    "local", "nil", "not", "or", "repeat", "return", "then", "true", "until", "while",
];

/// Stored shape of a serialized method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodSpec {
    pub args: Vec<String>,
    pub body: String,
}

impl MethodSpec {
    /// Build a method descriptor, rejecting argument names that are not
    /// plain identifiers.
    pub fn new(args: &[&str], body: &str) -> Result<Self> {
        for arg in args {
            if !is_identifier(arg) || *arg == "this" {
                return Err(SharingError::InvalidState(format!(
                    "invalid method argument name: {:?}",
                    arg
                )));
            }
        }
        Ok(Self {
            args: args.iter().map(|a| a.to_string()).collect(),
            body: body.to_string(),
        })
    }

    fn cache_key(&self) -> String {
        format!("{}\n{}", self.args.join(","), self.body)
    }

    fn source(&self) -> String {
        let mut params = String::from("this");
        for arg in &self.args {
            params.push_str(", ");
            params.push_str(arg);
        }
        format!("return function({})\n{}\nend", params, self.body)
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_') && !LUA_KEYWORDS.contains(&name)
}

#[derive(Default)]
struct RuntimeState {
    lua: Option<Lua>,
    compiled: HashMap<String, Function>,
}

/// Per-map method evaluator with a bounded compile cache.
pub(crate) struct MethodRuntime {
    no_exec: bool,
    capacity: usize,
    state: Mutex<RuntimeState>,
}

impl MethodRuntime {
    pub(crate) fn new(capacity: usize, no_exec: bool) -> Self {
        Self {
            no_exec,
            capacity: capacity.max(1),
            state: Mutex::new(RuntimeState::default()),
        }
    }

    /// Drop every compiled method.
    pub(crate) fn clear(&self) {
        self.state.lock().compiled.clear();
    }

    #[cfg(test)]
    pub(crate) fn cached(&self) -> usize {
        self.state.lock().compiled.len()
    }

    /// Invoke method `name` with `this` bound to `reference`.
    pub(crate) fn call(&self, reference: &MapRef, name: &str, args: &[Value]) -> Result<Value> {
        if self.no_exec {
            return Err(SharingError::ExecutionDisabled);
        }
        let spec = lookup(reference, name)?;
        let (lua, function) = self.compiled(&spec)?;

        lua.scope(|scope| {
            let this = lua.create_table()?;
            this.set(
                "get",
                scope.create_function(move |lua, (_this, key): (Table, String)| {
                    match reference.get(&key) {
                        Some(value) => lua.to_value(value),
                        None => Ok(LuaValue::Nil),
                    }
                })?,
            )?;
            this.set(
                "has",
                scope.create_function(move |_, (_this, key): (Table, String)| {
                    Ok(reference.has(&key))
                })?,
            )?;
            this.set(
                "apply_method",
                scope.create_function(
                    move |_, (this, name, args): (Table, String, Option<Table>)| {
                        let spec = lookup(reference, &name).map_err(mlua::Error::external)?;
                        let (_, function) = self.compiled(&spec).map_err(mlua::Error::external)?;
                        let mut call_args = Vec::new();
                        if let Some(args) = args {
                            for value in args.sequence_values::<LuaValue>() {
                                call_args.push(value?);
                            }
                        }
                        function.call::<LuaValue>((this, Variadic::from_iter(call_args)))
                    },
                )?,
            )?;

            let mut call_args = Vec::with_capacity(args.len());
            for arg in args {
                call_args.push(lua.to_value(arg)?);
            }
            let ret = function.call::<LuaValue>((this, Variadic::from_iter(call_args)))?;
            lua.from_value::<Value>(ret)
        })
        .map_err(|e| SharingError::MethodFailed(e.to_string()))
    }

    /// Compiled function for `spec`, compiling and caching it on a miss.
    ///
    /// The lock is released before the function runs, so methods may call
    /// other methods.
    fn compiled(&self, spec: &MethodSpec) -> Result<(Lua, Function)> {
        let mut state = self.state.lock();
        let lua = match &state.lua {
            Some(lua) => lua.clone(),
            None => {
                let lua = sandboxed_lua()?;
                state.lua = Some(lua.clone());
                lua
            }
        };

        let key = spec.cache_key();
        if let Some(function) = state.compiled.get(&key) {
            return Ok((lua, function.clone()));
        }

        let function = lua
            .load(spec.source())
            .set_name("method")
            .eval::<Function>()
            .map_err(|e| SharingError::MethodFailed(format!("compile: {}", e)))?;

        if state.compiled.len() >= self.capacity {
            tracing::debug!("method cache full, clearing size={}", state.compiled.len());
            state.compiled.clear();
        }
        state.compiled.insert(key, function.clone());
        Ok((lua, function))
    }
}

fn lookup(reference: &MapRef, name: &str) -> Result<MethodSpec> {
    reference
        .get(name)
        .and_then(|value| serde_json::from_value::<MethodSpec>(value.clone()).ok())
        .ok_or_else(|| SharingError::UnknownMethod(name.to_string()))
}

fn sandboxed_lua() -> Result<Lua> {
    let lua = Lua::new_with(
        StdLib::TABLE | StdLib::STRING | StdLib::MATH,
        LuaOptions::default(),
    )
    .map_err(|e| SharingError::MethodFailed(format!("vm init: {}", e)))?;

    let globals = lua.globals();
    for name in BLOCKED_GLOBALS {
        globals
            .set(*name, LuaValue::Nil)
            .map_err(|e| SharingError::MethodFailed(format!("sandbox: {}", e)))?;
    }
    Ok(lua)
}
