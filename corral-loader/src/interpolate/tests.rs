use std::collections::HashMap;

use super::*;

fn ctx() -> EvalContext {
    let mut env = HashMap::new();
    env.insert("HOST".to_string(), "localhost".to_string());
    env.insert("PORT".to_string(), "8080".to_string());
    env.insert("ENABLED".to_string(), "yes".to_string());
    EvalContext {
        env,
        argv: vec!["--flag".to_string()],
    }
}

fn yaml(s: &str) -> Value {
    serde_yaml::from_str(s).unwrap()
}

#[test]
fn tokenize_mixed_string() {
    let tokens = parse_expr_tokens("http://${{ env.HOST }}:${{env.PORT}}/");
    assert_eq!(
        tokens,
        vec![
            ExprToken::String("http://"),
            ExprToken::Expression("env.HOST"),
            ExprToken::String(":"),
            ExprToken::Expression("env.PORT"),
            ExprToken::String("/"),
        ]
    );
}

#[test]
fn unclosed_marker_is_literal() {
    let tokens = parse_expr_tokens("cost: ${{ 5");
    assert_eq!(
        tokens,
        vec![ExprToken::String("cost: "), ExprToken::String("${{"), ExprToken::String(" 5")]
    );
    assert_eq!(standalone_expr(&tokens), None);
}

#[test]
fn standalone_detection() {
    assert_eq!(standalone_expr(&parse_expr_tokens("  ${{ 1 + 1 }} ")), Some("1 + 1"));
    assert_eq!(standalone_expr(&parse_expr_tokens("x${{ 1 }}")), None);
    assert_eq!(standalone_expr(&parse_expr_tokens("${{ 1 }}${{ 2 }}")), None);
    assert_eq!(standalone_expr(&parse_expr_tokens("plain")), None);
}

#[test]
fn embedded_placeholders_are_stringified() {
    let interp = Interpolator::new().unwrap();
    let out = interp
        .interpolate(&yaml(r#""http://${{ env.HOST }}:${{ env.PORT }}""#), &ctx())
        .unwrap();
    assert_eq!(out, Value::String("http://localhost:8080".to_string()));
}

#[test]
fn nil_embeds_as_empty_string() {
    let interp = Interpolator::new().unwrap();
    let out = interp
        .interpolate(&yaml(r#""[${{ env.MISSING }}]""#), &ctx())
        .unwrap();
    assert_eq!(out, Value::String("[]".to_string()));
}

#[test]
fn standalone_keeps_type() {
    let interp = Interpolator::new().unwrap();
    let c = ctx();
    assert_eq!(
        interp.interpolate(&yaml(r#""${{ tonumber(env.PORT) }}""#), &c).unwrap(),
        yaml("8080")
    );
    assert_eq!(
        interp.interpolate(&yaml(r#""${{ env.PORT == '8080' }}""#), &c).unwrap(),
        Value::Bool(true)
    );
    assert_eq!(
        interp.interpolate(&yaml(r#""${{ { 'a', 'b' } }}""#), &c).unwrap(),
        yaml("[a, b]")
    );
    assert_eq!(
        interp.interpolate(&yaml(r#""${{ env.MISSING }}""#), &c).unwrap(),
        Value::Null
    );
}

#[test]
fn containers_are_walked_and_keys_preserved() {
    let interp = Interpolator::new().unwrap();
    let input = yaml(
        r#"
host: "${{ env.HOST }}"
ports: ["${{ env.PORT }}", 9090]
"${{ env.HOST }}": literal-key
nested:
  flag: "${{ argv[1] }}"
"#,
    );
    let out = interp.interpolate(&input, &ctx()).unwrap();
    let expected = yaml(
        r#"
host: localhost
ports: ["8080", 9090]
"${{ env.HOST }}": literal-key
nested:
  flag: "--flag"
"#,
    );
    assert_eq!(out, expected);
}

#[test]
fn scalars_pass_through() {
    let interp = Interpolator::new().unwrap();
    for v in [yaml("42"), yaml("true"), Value::Null, yaml("plain text")] {
        assert_eq!(interp.interpolate(&v, &ctx()).unwrap(), v);
    }
}

#[test]
fn malformed_expression_fails_whole_call() {
    let interp = Interpolator::new().unwrap();
    let input = yaml(r#"[ok, "${{ 1 + }}"]"#);
    let err = interp.interpolate(&input, &ctx()).unwrap_err();
    assert!(matches!(err, LoaderError::Expression { .. }), "{err}");
}

#[test]
fn truthy_like_absent_and_null_are_active() {
    let interp = Interpolator::new().unwrap();
    assert!(interp.is_truthy_like(None, &ctx()).unwrap());
    assert!(interp.is_truthy_like(Some(&Value::Null), &ctx()).unwrap());
}

#[test]
fn truthy_like_uses_lua_truthiness() {
    let interp = Interpolator::new().unwrap();
    let c = ctx();
    assert!(interp.is_truthy_like(Some(&yaml("true")), &c).unwrap());
    assert!(!interp.is_truthy_like(Some(&yaml("false")), &c).unwrap());
    // 0 is truthy in Lua
    assert!(interp.is_truthy_like(Some(&yaml("0")), &c).unwrap());
    assert!(interp.is_truthy_like(Some(&yaml("env.ENABLED")), &c).unwrap());
    assert!(!interp.is_truthy_like(Some(&yaml("env.MISSING")), &c).unwrap());
    assert!(
        !interp
            .is_truthy_like(Some(&yaml(r#""env.ENABLED == 'no'""#)), &c)
            .unwrap()
    );
}

#[test]
fn truthy_like_accepts_wrapped_expression() {
    let interp = Interpolator::new().unwrap();
    let c = ctx();
    assert!(!interp.is_truthy_like(Some(&yaml(r#""${{ false }}""#)), &c).unwrap());
    assert!(interp.is_truthy_like(Some(&yaml(r#""${{ env.HOST }}""#)), &c).unwrap());
}

#[test]
fn truthy_like_rejects_containers_and_bad_syntax() {
    let interp = Interpolator::new().unwrap();
    assert!(interp.is_truthy_like(Some(&yaml("[1]")), &ctx()).is_err());
    assert!(interp.is_truthy_like(Some(&yaml(r#""env.X =""#)), &ctx()).is_err());
}

#[test]
fn global_table_is_shared_across_calls() {
    let interp = Interpolator::new().unwrap();
    let c = ctx();
    interp
        .interpolate(&yaml(r#""${{ (function() global.n = 3 end)() }}""#), &c)
        .unwrap();
    assert_eq!(interp.interpolate(&yaml(r#""${{ global.n }}""#), &c).unwrap(), yaml("3"));
}
