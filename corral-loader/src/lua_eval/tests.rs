use mlua::FromLua;

use super::*;

fn as_string(eval: &LuaEvaluator, value: Value) -> String {
    String::from_lua(value, &eval.lua).unwrap()
}

fn as_int(eval: &LuaEvaluator, value: Value) -> i64 {
    i64::from_lua(value, &eval.lua).unwrap()
}

fn ctx_with(vars: &[(&str, &str)]) -> EvalContext {
    EvalContext {
        env: vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        argv: Vec::new(),
    }
}

#[test]
fn test_expr_env_access() {
    let eval = LuaEvaluator::new().unwrap();
    let ctx = ctx_with(&[("PORT", "8080")]);

    let result = eval.eval_expr("env.PORT", &ctx).unwrap();
    assert_eq!(as_string(&eval, result), "8080");
}

#[test]
fn test_expr_missing_env_is_nil() {
    let eval = LuaEvaluator::new().unwrap();
    let result = eval.eval_expr("env.NOPE", &EvalContext::default()).unwrap();
    assert!(result.is_nil());
}

#[test]
fn test_env_readonly() {
    let eval = LuaEvaluator::new().unwrap();
    let env_table = eval.prepare_env(&EvalContext::default()).unwrap();

    let result = eval.eval_expr_with_env("(function() env.NEW = 'x' end)()", &env_table, "test");
    let err = result.unwrap_err().to_string();
    assert!(err.contains("read-only"), "Error should mention read-only: {}", err);
}

#[test]
fn test_argv_access() {
    let eval = LuaEvaluator::new().unwrap();
    let ctx = EvalContext {
        env: HashMap::new(),
        argv: vec!["--verbose".to_string(), "extra".to_string()],
    };

    let first = eval.eval_expr("argv[1]", &ctx).unwrap();
    assert_eq!(as_string(&eval, first), "--verbose");
    let len = eval.eval_expr("#argv", &ctx).unwrap();
    assert_eq!(as_int(&eval, len), 2);
}

#[test]
fn test_global_persists_between_passes() {
    let eval = LuaEvaluator::new().unwrap();
    let ctx = EvalContext::default();

    eval.eval_expr("(function() global.count = 41 end)()", &ctx).unwrap();
    let count = eval.eval_expr("global.count + 1", &ctx).unwrap();
    assert_eq!(as_int(&eval, count), 42);
}

#[test]
fn test_standard_library_available() {
    let eval = LuaEvaluator::new().unwrap();
    let ctx = ctx_with(&[("NAME", "corral")]);

    let result = eval.eval_expr("string.upper(env.NAME)", &ctx).unwrap();
    assert_eq!(as_string(&eval, result), "CORRAL");
}

#[test]
fn test_syntax_error() {
    let eval = LuaEvaluator::new().unwrap();
    assert!(eval.eval_expr("1 +", &EvalContext::default()).is_err());
}
