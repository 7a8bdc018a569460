use futures::future::BoxFuture;

use weft_core::template::is_identifier;
use weft_core::traits::ConditionInterpreter;
use weft_core::ConditionContext;

use crate::vars::is_truthy;

/// Default interpreter for literal conditions.
///
/// Supported forms, checked in order:
/// - `key contains "substr"`, `key != "value"`, `key == "value"`, where
///   `key` is a variable name or `output` (the triggering node's output)
/// - a bare name of an existing variable: its truthiness
/// - anything else: case-insensitive containment in the output
pub struct ExpressionInterpreter;

impl ConditionInterpreter for ExpressionInterpreter {
    fn evaluate(&self, condition: String, ctx: ConditionContext) -> BoxFuture<'_, bool> {
        Box::pin(async move { evaluate_expression(&condition, &ctx) })
    }
}

/// Evaluate a literal condition against a context.
pub fn evaluate_expression(expr: &str, ctx: &ConditionContext) -> bool {
    let expr = expr.trim();
    let lookup = |key: &str| -> Option<&str> {
        if key == "output" {
            Some(ctx.last_output.as_str())
        } else {
            ctx.vars.get(key).map(String::as_str)
        }
    };

    // key contains "value"
    if let Some((key, substr)) = parse_operator(expr, " contains ") {
        return lookup(key).is_some_and(|s| s.contains(substr));
    }

    // key != "value"
    if let Some((key, value)) = parse_operator(expr, "!=") {
        return lookup(key).is_some_and(|s| s.trim() != value);
    }

    // key == "value"
    if let Some((key, value)) = parse_operator(expr, "==") {
        return lookup(key).is_some_and(|s| s.trim() == value);
    }

    if is_identifier(expr) {
        if let Some(value) = ctx.vars.get(expr) {
            return is_truthy(value);
        }
    }

    ctx.last_output
        .to_lowercase()
        .contains(&expr.to_lowercase())
}

/// Parse `key OP "value"` expressions, returning (key, value).
fn parse_operator<'a>(expr: &'a str, op: &str) -> Option<(&'a str, &'a str)> {
    let (key, val) = expr.split_once(op)?;
    let key = key.trim();
    if !is_identifier(key) {
        return None;
    }
    Some((key, val.trim().trim_matches('"')))
}
