//! `${{ expr }}` placeholder expansion over config value trees.

use serde_yaml::Value;

use crate::errors::{LoaderError, Result};
use crate::lua_eval::{EvalContext, LuaEvaluator};

/// A token from parsing a `${{ expr }}` expression string.
#[derive(Debug, Clone, PartialEq)]
pub enum ExprToken<'a> {
    /// Literal text outside any `${{ }}` marker.
    String(&'a str),
    /// Lua expression content (trimmed text between `${{` and `}}`).
    Expression(&'a str),
}

/// Parse a string into a sequence of literal and expression tokens.
///
/// The expression ends at the first `}}` after the opening marker. An
/// unclosed `${{` is emitted as literal text.
pub fn parse_expr_tokens(s: &str) -> Vec<ExprToken<'_>> {
    let mut tokens = Vec::new();
    let mut remaining = s;
    let mut offset = 0;

    while let Some(start) = remaining.find("${{") {
        if start > 0 {
            tokens.push(ExprToken::String(&s[offset..offset + start]));
        }

        let after_open = &remaining[start + 3..];
        if let Some(end) = after_open.find("}}") {
            let expr = after_open[..end].trim();
            tokens.push(ExprToken::Expression(expr));
            offset += start + 3 + end + 2; // "${{" + content + "}}"
            remaining = &s[offset..];
        } else {
            tokens.push(ExprToken::String(&s[offset..offset + start + 3]));
            offset += start + 3;
            remaining = &s[offset..];
        }
    }

    if offset < s.len() {
        tokens.push(ExprToken::String(&s[offset..]));
    }

    tokens
}

/// The expression of a string that is exactly one `${{ expr }}` with only
/// surrounding whitespace, if it is one.
pub fn standalone_expr<'a>(tokens: &[ExprToken<'a>]) -> Option<&'a str> {
    let mut found = None;
    for token in tokens {
        match token {
            ExprToken::Expression(expr) => {
                if found.is_some() {
                    return None;
                }
                found = Some(*expr);
            }
            ExprToken::String(s) => {
                if !s.trim().is_empty() {
                    return None;
                }
            }
        }
    }
    found
}

/// Convert a Lua value to a string representation for interpolation.
pub(crate) fn lua_value_to_string(value: &mlua::Value) -> String {
    match value {
        mlua::Value::Nil => String::new(),
        mlua::Value::Boolean(b) => b.to_string(),
        mlua::Value::Integer(i) => i.to_string(),
        mlua::Value::Number(n) => n.to_string(),
        mlua::Value::String(s) => s.to_string_lossy(),
        other => format!("<{}>", other.type_name()),
    }
}

fn lua_error(message: impl Into<String>) -> LoaderError {
    LoaderError::Lua {
        message: message.into(),
    }
}

/// Convert a Lua value to a YAML value.
pub(crate) fn lua_to_yaml(lua_value: mlua::Value) -> Result<Value> {
    match lua_value {
        mlua::Value::Nil => Ok(Value::Null),
        mlua::Value::Boolean(b) => Ok(Value::Bool(b)),
        mlua::Value::Integer(i) => Ok(Value::Number(serde_yaml::Number::from(i as i64))),
        // Luau has no integer subtype
        mlua::Value::Number(n) if n.fract() == 0.0 && n.abs() < i64::MAX as f64 => {
            Ok(Value::Number(serde_yaml::Number::from(n as i64)))
        }
        mlua::Value::Number(n) => Ok(Value::Number(serde_yaml::Number::from(n))),
        mlua::Value::String(s) => {
            let s = s
                .to_str()
                .map_err(|e| lua_error(format!("Invalid UTF-8 string: {}", e)))?;
            Ok(Value::String(s.to_string()))
        }
        mlua::Value::Table(table) => {
            // Sequential positive integer keys make an array, anything else a map
            let mut is_array = true;
            let mut max_index: i64 = 0;
            let mut count = 0usize;

            for pair in table.clone().pairs::<mlua::Value, mlua::Value>() {
                let (k, _) = pair.map_err(|e| lua_error(format!("Error iterating table: {}", e)))?;
                count += 1;
                match k {
                    mlua::Value::Integer(i) if i > 0 => {
                        max_index = max_index.max(i as i64);
                    }
                    _ => {
                        is_array = false;
                    }
                }
            }

            if count == 0 || (is_array && max_index as usize == count) {
                let mut seq = Vec::with_capacity(count);
                for i in 1..=max_index {
                    let v: mlua::Value = table
                        .raw_get(i)
                        .map_err(|e| lua_error(format!("Error getting array element {}: {}", i, e)))?;
                    seq.push(lua_to_yaml(v)?);
                }
                Ok(Value::Sequence(seq))
            } else {
                let mut map = serde_yaml::Mapping::new();
                for pair in table.pairs::<mlua::Value, mlua::Value>() {
                    let (k, v) =
                        pair.map_err(|e| lua_error(format!("Error iterating table: {}", e)))?;

                    let key = match k {
                        mlua::Value::String(s) => {
                            let s = s
                                .to_str()
                                .map_err(|e| lua_error(format!("Invalid UTF-8 key: {}", e)))?;
                            Value::String(s.to_string())
                        }
                        mlua::Value::Integer(i) => Value::Number(serde_yaml::Number::from(i as i64)),
                        other => {
                            return Err(lua_error(format!(
                                "Table key must be string or integer, got {}",
                                other.type_name()
                            )));
                        }
                    };

                    map.insert(key, lua_to_yaml(v)?);
                }
                Ok(Value::Mapping(map))
            }
        }
        other => Err(lua_error(format!(
            "Cannot convert Lua {} to a config value",
            other.type_name()
        ))),
    }
}

/// Lua truthiness of an already-interpolated value: only null and `false`
/// are false.
pub fn is_truthy(value: &Value) -> bool {
    !matches!(value, Value::Null | Value::Bool(false))
}

/// Expands placeholders in config values.
///
/// Owns the Lua state, so the `global` table is shared by every value this
/// interpolator ever expands.
pub struct Interpolator {
    evaluator: LuaEvaluator,
}

impl Interpolator {
    pub fn new() -> Result<Self> {
        let evaluator = LuaEvaluator::new().map_err(|e| lua_error(e.to_string()))?;
        Ok(Self { evaluator })
    }

    /// Expand every placeholder in `value`.
    ///
    /// Strings that are a single placeholder take the expression's type;
    /// strings with embedded placeholders stay strings. Sequences and
    /// mappings are walked (keys are left alone). Other values pass
    /// through unchanged. The first failing expression fails the call.
    pub fn interpolate(&self, value: &Value, ctx: &EvalContext) -> Result<Value> {
        let mut out = value.clone();
        let mut cached_env = None;
        self.interpolate_in_place(&mut out, ctx, &mut cached_env)?;
        Ok(out)
    }

    /// Evaluate a `when` gate.
    ///
    /// Absent or null is always active. A bool, number or string is treated
    /// as expression text; strings already containing placeholders are
    /// expanded as a template instead. The result is coerced with Lua
    /// truthiness. Sequences and mappings are rejected.
    pub fn is_truthy_like(&self, when: Option<&Value>, ctx: &EvalContext) -> Result<bool> {
        let expr = match when {
            None | Some(Value::Null) => return Ok(true),
            Some(Value::Bool(b)) => b.to_string(),
            Some(Value::Number(n)) => n.to_string(),
            Some(Value::String(s)) if s.contains("${{") => {
                return Ok(is_truthy(&self.interpolate(&Value::String(s.clone()), ctx)?));
            }
            Some(Value::String(s)) => s.clone(),
            Some(other) => {
                return Err(LoaderError::Config(format!(
                    "`when` must be a boolean, number or expression string, got {:?}",
                    other
                )));
            }
        };
        let env_table = self.env_table(ctx)?;
        let result = self.eval(&expr, &env_table)?;
        Ok(!matches!(
            result,
            mlua::Value::Nil | mlua::Value::Boolean(false)
        ))
    }

    fn env_table(&self, ctx: &EvalContext) -> Result<mlua::Table> {
        self.evaluator
            .prepare_env(ctx)
            .map_err(|e| lua_error(format!("Error building Lua environment: {}", e)))
    }

    fn eval(&self, expr: &str, env_table: &mlua::Table) -> Result<mlua::Value> {
        self.evaluator
            .eval_expr_with_env(expr, env_table, expr)
            .map_err(|e| LoaderError::Expression {
                expr: expr.to_string(),
                message: e.to_string(),
            })
    }

    fn interpolate_in_place(
        &self,
        value: &mut Value,
        ctx: &EvalContext,
        cached_env: &mut Option<mlua::Table>,
    ) -> Result<()> {
        match value {
            Value::String(s) if s.contains("${{") => {
                let tokens = parse_expr_tokens(s);
                if !tokens.iter().any(|t| matches!(t, ExprToken::Expression(_))) {
                    return Ok(());
                }
                let env_table = match cached_env {
                    Some(table) => table.clone(),
                    None => {
                        let table = self.env_table(ctx)?;
                        *cached_env = Some(table.clone());
                        table
                    }
                };

                if let Some(expr) = standalone_expr(&tokens) {
                    let result = self.eval(expr, &env_table)?;
                    *value = lua_to_yaml(result)?;
                } else {
                    let mut expanded = String::with_capacity(s.len());
                    for token in &tokens {
                        match token {
                            ExprToken::String(text) => expanded.push_str(text),
                            ExprToken::Expression(expr) => {
                                let result = self.eval(expr, &env_table)?;
                                expanded.push_str(&lua_value_to_string(&result));
                            }
                        }
                    }
                    *value = Value::String(expanded);
                }
            }
            Value::Sequence(seq) => {
                for item in seq.iter_mut() {
                    self.interpolate_in_place(item, ctx, cached_env)?;
                }
            }
            Value::Mapping(map) => {
                for (_, item) in map.iter_mut() {
                    self.interpolate_in_place(item, ctx, cached_env)?;
                }
            }
            Value::Tagged(tagged) => {
                self.interpolate_in_place(&mut tagged.value, ctx, cached_env)?;
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests;
