//! Luau evaluation for `${{ expr }}` placeholders.
//!
//! One `LuaEvaluator` lives for the whole worker so that the `global` table
//! persists across evaluations. Each interpolation pass builds a fresh
//! environment table exposing read-only `env` and `argv`.

use mlua::{Lua, Result as LuaResult, Table, Value};
use std::collections::HashMap;

/// Parameter namespace visible to expressions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvalContext {
    /// Process environment merged with the config directory's env files
    pub env: HashMap<String, String>,
    /// Extra worker arguments
    pub argv: Vec<String>,
}

pub struct LuaEvaluator {
    lua: Lua,
}

impl LuaEvaluator {
    /// Create a new Lua evaluator with a fresh Lua state.
    pub fn new() -> LuaResult<Self> {
        let lua = Lua::new();

        // Create the shared `global` table for cross-expression state
        let global_table = lua.create_table()?;
        lua.globals().set("global", global_table)?;

        Ok(Self { lua })
    }

    /// Build the environment table for one interpolation pass.
    ///
    /// Contains:
    /// - `env`: read-only table of environment variables
    /// - `argv`: read-only array of extra worker arguments
    /// - `global`: shared mutable table
    /// - the standard library through an `__index` fallback
    pub fn prepare_env(&self, ctx: &EvalContext) -> LuaResult<Table> {
        let env_table = self.lua.create_table()?;

        let vars = self.lua.create_table()?;
        for (k, v) in &ctx.env {
            vars.raw_set(k.as_str(), v.as_str())?;
        }
        env_table.raw_set("env", self.freeze_table(&vars, "env")?)?;

        let argv = self.lua.create_sequence_from(ctx.argv.iter().map(String::as_str))?;
        env_table.raw_set("argv", self.freeze_table(&argv, "argv")?)?;

        let global: Table = self.lua.globals().get("global")?;
        env_table.raw_set("global", global)?;

        let meta = self.lua.create_table()?;
        meta.set("__index", self.lua.globals())?;
        env_table.set_metatable(Some(meta));

        Ok(env_table)
    }

    /// Evaluate a single expression (the text between the delimiters).
    pub fn eval_expr_with_env(
        &self,
        expr: &str,
        env_table: &Table,
        chunk_name: &str,
    ) -> LuaResult<Value> {
        let code = format!("return {}", expr);
        let func = self
            .lua
            .load(&code)
            .set_name(chunk_name)
            .set_environment(env_table.clone())
            .into_function()?;
        func.call(())
    }

    /// Evaluate a single expression against a freshly built environment.
    pub fn eval_expr(&self, expr: &str, ctx: &EvalContext) -> LuaResult<Value> {
        let env_table = self.prepare_env(ctx)?;
        self.eval_expr_with_env(expr, &env_table, "expr")
    }

    /// Freeze a table using the proxy pattern: reads are forwarded to the
    /// original, writes raise an error.
    fn freeze_table(&self, table: &Table, name: &str) -> LuaResult<Table> {
        let name_for_newindex = name.to_string();

        let proxy = self.lua.create_table()?;

        let meta = self.lua.create_table()?;
        meta.set("__index", table.clone())?;
        meta.set("__len", self.lua.create_function({
            let table = table.clone();
            move |_, _: Value| Ok(table.raw_len())
        })?)?;
        meta.set(
            "__newindex",
            self.lua
                .create_function(move |_, _: (Value, Value, Value)| -> LuaResult<()> {
                    Err(mlua::Error::RuntimeError(format!("{} is read-only", name_for_newindex)))
                })?,
        )?;
        meta.set("__metatable", format!("{} is read-only", name))?;

        proxy.set_metatable(Some(meta));
        Ok(proxy)
    }
}

#[cfg(test)]
mod tests;
