//! Condition Evaluator (C2, spec §4.2): a pure `(rule, context) -> bool`
//! function plus `validate_rule`. Context is threaded explicitly through
//! every call — no process-wide "current context" (design note §9) — which
//! mirrors the explicit-context seam on
//! `llm-orchestrator-core::context::evaluate_condition`.

use regex::Regex;
use serde_json::{json, Map, Value};

use crate::error::EngineError;

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ConditionMeta {
    #[serde(rename = "flowId", skip_serializing_if = "Option::is_none")]
    pub flow_id: Option<String>,
    #[serde(rename = "executionId", skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    #[serde(rename = "stepId", skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
}

/// Evaluation context (spec §4.2): `{inputs, variables, stepOutputs,
/// currentStep?, orgId?, userId?, meta}`.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ConditionContext {
    pub inputs: Value,
    pub variables: Value,
    #[serde(rename = "stepOutputs")]
    pub step_outputs: Value,
    #[serde(rename = "currentStep", skip_serializing_if = "Option::is_none")]
    pub current_step: Option<Value>,
    #[serde(rename = "orgId", skip_serializing_if = "Option::is_none")]
    pub org_id: Option<String>,
    #[serde(rename = "userId", skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub meta: ConditionMeta,
}

impl ConditionContext {
    /// A `with_inputs` substituted into `stepOutput` custom-DSL evaluation
    /// (spec §4.2: "recurses with `stepOutputs[stepId]` substituted into
    /// `context.inputs`").
    fn with_inputs(&self, inputs: Value) -> Self {
        let mut clone = self.clone();
        clone.inputs = inputs;
        clone
    }

    fn as_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

pub struct ValidationResult {
    pub valid: bool,
    pub error: Option<String>,
}

const LOGIC_OPERATORS: &[&str] = &[
    "==", "!=", "===", "!==", "<", "<=", ">", ">=", "and", "or", "not", "!", "if", "?:", "var",
    "missing", "missing_some", "in", "cat", "substr", "merge", "+", "-", "*", "/", "%", "min",
    "max", "reduce", "map", "filter", "all", "none", "some", "exists", "isEmpty", "regex",
];

const SIMPLE_OPERATORS: &[&str] = &[
    "==", "!=", "===", "!==", "<", "<=", ">", ">=", "contains", "startsWith", "endsWith", "in",
    "notIn", "exists", "notExists",
];

const CUSTOM_OPERATIONS: &[&str] = &["timeWindow", "userRole", "stepOutput"];

/// Returns `true` when `rule` is absent/empty — "steps with no guard always
/// run" (spec §4.2). Otherwise dispatches on the rule's shape.
pub fn evaluate(rule: &Option<Value>, ctx: &ConditionContext) -> Result<bool, EngineError> {
    let rule = match rule {
        None => return Ok(true),
        Some(Value::Null) => return Ok(true),
        Some(Value::Object(obj)) if obj.is_empty() => return Ok(true),
        Some(v) => v,
    };

    if let Value::Object(obj) = rule {
        if obj.get("type").and_then(Value::as_str) == Some("custom") {
            return evaluate_custom(obj, ctx);
        }
        if obj.contains_key("field") && obj.contains_key("operator") {
            return evaluate_simple(obj, ctx);
        }
    }

    let result = eval_logic(rule, ctx)?;
    Ok(truthy(&result))
}

/// Structural validation: every operator key used anywhere in the rule must
/// be in the closed operator set (spec §4.2). Does not evaluate the rule
/// against any context.
/// Evaluates `rule` as a general-purpose expression (not coerced to bool),
/// reused by the Dispatcher's `data_transform`/`conditional` direct-
/// evaluation fallback so there is one expression engine rather than two
/// (spec §4.7 design note).
pub fn eval_expression(rule: &Value, ctx: &ConditionContext) -> Result<Value, EngineError> {
    eval_logic(rule, ctx)
}

pub fn validate_rule(rule: &Value) -> ValidationResult {
    match validate_inner(rule) {
        Ok(()) => ValidationResult {
            valid: true,
            error: None,
        },
        Err(e) => ValidationResult {
            valid: false,
            error: Some(e),
        },
    }
}

fn validate_inner(rule: &Value) -> Result<(), String> {
    match rule {
        Value::Null => Ok(()),
        Value::Object(obj) if obj.is_empty() => Ok(()),
        Value::Object(obj) => {
            if obj.get("type").and_then(Value::as_str) == Some("custom") {
                let op = obj
                    .get("operation")
                    .and_then(Value::as_str)
                    .ok_or_else(|| "custom rule missing 'operation'".to_string())?;
                if !CUSTOM_OPERATIONS.contains(&op) {
                    return Err(format!("unknown custom operation '{op}'"));
                }
                return Ok(());
            }
            if obj.contains_key("field") && obj.contains_key("operator") {
                let op = obj
                    .get("operator")
                    .and_then(Value::as_str)
                    .ok_or_else(|| "simple rule 'operator' must be a string".to_string())?;
                if !SIMPLE_OPERATORS.contains(&op) {
                    return Err(format!("unknown simple comparison operator '{op}'"));
                }
                return Ok(());
            }
            if obj.len() != 1 {
                return Err("logic tree node must have exactly one operator key".to_string());
            }
            let (op, args) = obj.iter().next().unwrap();
            if !LOGIC_OPERATORS.contains(&op.as_str()) {
                return Err(format!("unknown operator '{op}'"));
            }
            for arg in as_arg_list(args) {
                validate_inner(&arg)?;
            }
            Ok(())
        }
        Value::Array(items) => {
            for item in items {
                validate_inner(item)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn as_arg_list(v: &Value) -> Vec<Value> {
    match v {
        Value::Array(items) => items.clone(),
        other => vec![other.clone()],
    }
}

/// JS-ish truthiness, following the jsonlogic convention that an empty array
/// is falsy (unlike real JS) since that is the convention the operator set
/// in spec §4.2 is modeled on.
fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(_) => true,
    }
}

fn as_f64(v: &Value) -> f64 {
    match v {
        Value::Number(n) => n.as_f64().unwrap_or(f64::NAN),
        Value::String(s) => s.parse().unwrap_or(f64::NAN),
        Value::Bool(b) => {
            if *b {
                1.0
            } else {
                0.0
            }
        }
        Value::Null => 0.0,
        _ => f64::NAN,
    }
}

fn as_str(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Loose equality: numeric coercion across types, otherwise structural
/// equality (spec's `==`/`!=` vs. `===`/`!==` distinction).
fn loose_eq(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Number(_), _) | (_, Value::Number(_)) => as_f64(a) == as_f64(b),
        (Value::Bool(_), _) | (_, Value::Bool(_)) => truthy(a) == truthy(b),
        _ => as_str(a) == as_str(b),
    }
}

/// Resolves a dotted path (`a.b.0.c`) against a JSON value. Array indices are
/// numeric path segments.
pub fn get_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(root);
    }
    let mut current = root;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => {
                let idx: usize = segment.parse().ok()?;
                items.get(idx)?
            }
            _ => return None,
        };
    }
    Some(current)
}

fn eval_logic(node: &Value, ctx: &ConditionContext) -> Result<Value, EngineError> {
    match node {
        Value::Object(obj) => {
            if obj.is_empty() {
                return Ok(Value::Bool(true));
            }
            if obj.len() != 1 {
                return Err(EngineError::InvalidConditionRule(
                    "logic tree node must have exactly one operator key".to_string(),
                ));
            }
            let (op, raw_args) = obj.iter().next().unwrap();
            apply_operator(op, raw_args, ctx)
        }
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(eval_logic(item, ctx)?);
            }
            Ok(Value::Array(out))
        }
        other => Ok(other.clone()),
    }
}

fn eval_args(raw: &Value, ctx: &ConditionContext) -> Result<Vec<Value>, EngineError> {
    match raw {
        Value::Array(items) => items.iter().map(|v| eval_logic(v, ctx)).collect(),
        other => Ok(vec![eval_logic(other, ctx)?]),
    }
}

fn apply_operator(op: &str, raw_args: &Value, ctx: &ConditionContext) -> Result<Value, EngineError> {
    match op {
        "var" => {
            let args = eval_args(raw_args, ctx)?;
            let path = args.first().map(as_str).unwrap_or_default();
            let default = args.get(1).cloned().unwrap_or(Value::Null);
            let root = ctx.as_value();
            Ok(get_path(&root, &path).cloned().unwrap_or(default))
        }
        "missing" => {
            let args = eval_args(raw_args, ctx)?;
            let root = ctx.as_value();
            let missing: Vec<Value> = args
                .iter()
                .filter(|p| get_path(&root, &as_str(p)).is_none())
                .cloned()
                .collect();
            Ok(Value::Array(missing))
        }
        "missing_some" => {
            let args = eval_args(raw_args, ctx)?;
            let min_required = args.first().map(as_f64).unwrap_or(0.0) as usize;
            let paths = args.get(1).cloned().unwrap_or(Value::Array(vec![]));
            let root = ctx.as_value();
            let paths = match paths {
                Value::Array(p) => p,
                _ => vec![],
            };
            let present = paths
                .iter()
                .filter(|p| get_path(&root, &as_str(p)).is_some())
                .count();
            if present >= min_required {
                Ok(Value::Array(vec![]))
            } else {
                let missing: Vec<Value> = paths
                    .iter()
                    .filter(|p| get_path(&root, &as_str(p)).is_none())
                    .cloned()
                    .collect();
                Ok(Value::Array(missing))
            }
        }
        "==" => {
            let a = eval_args(raw_args, ctx)?;
            Ok(Value::Bool(loose_eq(&a[0], &a[1])))
        }
        "!=" => {
            let a = eval_args(raw_args, ctx)?;
            Ok(Value::Bool(!loose_eq(&a[0], &a[1])))
        }
        "===" => {
            let a = eval_args(raw_args, ctx)?;
            Ok(Value::Bool(a[0] == a[1]))
        }
        "!==" => {
            let a = eval_args(raw_args, ctx)?;
            Ok(Value::Bool(a[0] != a[1]))
        }
        "<" | "<=" | ">" | ">=" => {
            let a = eval_args(raw_args, ctx)?;
            if a.len() < 2 {
                return Err(EngineError::InvalidConditionRule(format!(
                    "'{op}' requires at least two arguments"
                )));
            }
            let mut ok = true;
            for w in a.windows(2) {
                let (x, y) = (as_f64(&w[0]), as_f64(&w[1]));
                ok &= match op {
                    "<" => x < y,
                    "<=" => x <= y,
                    ">" => x > y,
                    ">=" => x >= y,
                    _ => unreachable!(),
                };
            }
            Ok(Value::Bool(ok))
        }
        "and" => {
            let items = as_arg_list(raw_args);
            let mut last = Value::Bool(true);
            for item in items {
                last = eval_logic(&item, ctx)?;
                if !truthy(&last) {
                    return Ok(last);
                }
            }
            Ok(last)
        }
        "or" => {
            let items = as_arg_list(raw_args);
            let mut last = Value::Bool(false);
            for item in items {
                last = eval_logic(&item, ctx)?;
                if truthy(&last) {
                    return Ok(last);
                }
            }
            Ok(last)
        }
        "not" | "!" => {
            let args = eval_args(raw_args, ctx)?;
            Ok(Value::Bool(!truthy(args.first().unwrap_or(&Value::Null))))
        }
        "if" | "?:" => {
            let items = as_arg_list(raw_args);
            let mut i = 0;
            while i + 1 < items.len() {
                let cond = eval_logic(&items[i], ctx)?;
                if truthy(&cond) {
                    return eval_logic(&items[i + 1], ctx);
                }
                i += 2;
            }
            if i < items.len() {
                eval_logic(&items[i], ctx)
            } else {
                Ok(Value::Null)
            }
        }
        "in" => {
            let a = eval_args(raw_args, ctx)?;
            let needle = a.first().cloned().unwrap_or(Value::Null);
            match a.get(1) {
                Some(Value::Array(items)) => Ok(Value::Bool(items.iter().any(|v| loose_eq(v, &needle)))),
                Some(Value::String(s)) => Ok(Value::Bool(s.contains(&as_str(&needle)))),
                _ => Ok(Value::Bool(false)),
            }
        }
        "cat" => {
            let args = eval_args(raw_args, ctx)?;
            Ok(Value::String(args.iter().map(as_str).collect()))
        }
        "substr" => {
            let args = eval_args(raw_args, ctx)?;
            let s = args.first().map(as_str).unwrap_or_default();
            let chars: Vec<char> = s.chars().collect();
            let len = chars.len() as i64;
            let mut start = args.get(1).map(as_f64).unwrap_or(0.0) as i64;
            if start < 0 {
                start = (len + start).max(0);
            }
            let start = start.min(len) as usize;
            let count = match args.get(2) {
                Some(v) => {
                    let raw = as_f64(v) as i64;
                    if raw < 0 {
                        ((len - start as i64) + raw).max(0) as usize
                    } else {
                        raw as usize
                    }
                }
                None => chars.len() - start,
            };
            let end = (start + count).min(chars.len());
            Ok(Value::String(chars[start..end].iter().collect()))
        }
        "merge" => {
            let args = eval_args(raw_args, ctx)?;
            let mut out = Vec::new();
            for a in args {
                match a {
                    Value::Array(items) => out.extend(items),
                    other => out.push(other),
                }
            }
            Ok(Value::Array(out))
        }
        "+" => {
            let args = eval_args(raw_args, ctx)?;
            Ok(json!(args.iter().map(as_f64).sum::<f64>()))
        }
        "-" => {
            let args = eval_args(raw_args, ctx)?;
            if args.len() == 1 {
                Ok(json!(-as_f64(&args[0])))
            } else {
                let mut it = args.iter();
                let first = it.next().map(as_f64).unwrap_or(0.0);
                Ok(json!(it.fold(first, |acc, v| acc - as_f64(v))))
            }
        }
        "*" => {
            let args = eval_args(raw_args, ctx)?;
            Ok(json!(args.iter().map(as_f64).product::<f64>()))
        }
        "/" => {
            let args = eval_args(raw_args, ctx)?;
            if args.len() < 2 {
                return Err(EngineError::InvalidConditionRule(
                    "'/' requires two arguments".to_string(),
                ));
            }
            Ok(json!(as_f64(&args[0]) / as_f64(&args[1])))
        }
        "%" => {
            let args = eval_args(raw_args, ctx)?;
            if args.len() < 2 {
                return Err(EngineError::InvalidConditionRule(
                    "'%' requires two arguments".to_string(),
                ));
            }
            Ok(json!(as_f64(&args[0]) % as_f64(&args[1])))
        }
        "min" => {
            let args = eval_args(raw_args, ctx)?;
            Ok(json!(args
                .iter()
                .map(as_f64)
                .fold(f64::INFINITY, f64::min)))
        }
        "max" => {
            let args = eval_args(raw_args, ctx)?;
            Ok(json!(args
                .iter()
                .map(as_f64)
                .fold(f64::NEG_INFINITY, f64::max)))
        }
        "reduce" => {
            let items = as_arg_list(raw_args);
            let (array_rule, expr, initial_rule) = (
                items.first().cloned().unwrap_or(Value::Null),
                items.get(1).cloned().unwrap_or(Value::Null),
                items.get(2).cloned().unwrap_or(Value::Null),
            );
            let array = eval_logic(&array_rule, ctx)?;
            let initial = eval_logic(&initial_rule, ctx)?;
            let array = match array {
                Value::Array(a) => a,
                _ => vec![],
            };
            let mut accumulator = initial;
            for current in array {
                let mut inner = Map::new();
                inner.insert("current".to_string(), current);
                inner.insert("accumulator".to_string(), accumulator);
                let sub_ctx = ctx.with_inputs(Value::Object(inner));
                accumulator = eval_logic(&expr, &sub_ctx)?;
            }
            Ok(accumulator)
        }
        "map" | "filter" | "all" | "none" | "some" => {
            let items = as_arg_list(raw_args);
            let array_rule = items.first().cloned().unwrap_or(Value::Null);
            let expr = items.get(1).cloned().unwrap_or(Value::Null);
            let array = eval_logic(&array_rule, ctx)?;
            let array = match array {
                Value::Array(a) => a,
                _ => vec![],
            };
            match op {
                "map" => {
                    let mut out = Vec::with_capacity(array.len());
                    for el in array {
                        let sub_ctx = ctx.with_inputs(el);
                        out.push(eval_logic(&expr, &sub_ctx)?);
                    }
                    Ok(Value::Array(out))
                }
                "filter" => {
                    let mut out = Vec::new();
                    for el in array {
                        let sub_ctx = ctx.with_inputs(el.clone());
                        if truthy(&eval_logic(&expr, &sub_ctx)?) {
                            out.push(el);
                        }
                    }
                    Ok(Value::Array(out))
                }
                "all" => {
                    if array.is_empty() {
                        return Ok(Value::Bool(false));
                    }
                    for el in array {
                        let sub_ctx = ctx.with_inputs(el);
                        if !truthy(&eval_logic(&expr, &sub_ctx)?) {
                            return Ok(Value::Bool(false));
                        }
                    }
                    Ok(Value::Bool(true))
                }
                "none" => {
                    for el in array {
                        let sub_ctx = ctx.with_inputs(el);
                        if truthy(&eval_logic(&expr, &sub_ctx)?) {
                            return Ok(Value::Bool(false));
                        }
                    }
                    Ok(Value::Bool(true))
                }
                "some" => {
                    for el in array {
                        let sub_ctx = ctx.with_inputs(el);
                        if truthy(&eval_logic(&expr, &sub_ctx)?) {
                            return Ok(Value::Bool(true));
                        }
                    }
                    Ok(Value::Bool(false))
                }
                _ => unreachable!(),
            }
        }
        "exists" => {
            let args = eval_args(raw_args, ctx)?;
            let path = args.first().map(as_str).unwrap_or_default();
            let root = ctx.as_value();
            Ok(Value::Bool(get_path(&root, &path).is_some()))
        }
        "isEmpty" => {
            let args = eval_args(raw_args, ctx)?;
            let v = args.first().cloned().unwrap_or(Value::Null);
            let empty = match &v {
                Value::Null => true,
                Value::String(s) => s.is_empty(),
                Value::Array(a) => a.is_empty(),
                Value::Object(o) => o.is_empty(),
                _ => false,
            };
            Ok(Value::Bool(empty))
        }
        "regex" => {
            let args = eval_args(raw_args, ctx)?;
            let value = args.first().map(as_str).unwrap_or_default();
            let pattern = args.get(1).map(as_str).unwrap_or_default();
            let re = Regex::new(&pattern)
                .map_err(|e| EngineError::InvalidConditionRule(format!("bad regex: {e}")))?;
            Ok(Value::Bool(re.is_match(&value)))
        }
        other => Err(EngineError::InvalidConditionRule(format!(
            "unknown operator '{other}'"
        ))),
    }
}

fn evaluate_simple(obj: &Map<String, Value>, ctx: &ConditionContext) -> Result<bool, EngineError> {
    let field = obj
        .get("field")
        .and_then(Value::as_str)
        .ok_or_else(|| EngineError::InvalidConditionRule("missing 'field'".to_string()))?;
    let operator = obj
        .get("operator")
        .and_then(Value::as_str)
        .ok_or_else(|| EngineError::InvalidConditionRule("missing 'operator'".to_string()))?;
    let expected = obj.get("value").cloned().unwrap_or(Value::Null);

    let root = ctx.as_value();
    let actual = get_path(&root, field).cloned();

    let result = match operator {
        "exists" => actual.is_some(),
        "notExists" => actual.is_none(),
        "==" => actual.as_ref().map(|a| loose_eq(a, &expected)).unwrap_or(false),
        "!=" => !actual.as_ref().map(|a| loose_eq(a, &expected)).unwrap_or(false),
        "===" => actual.as_ref() == Some(&expected),
        "!==" => actual.as_ref() != Some(&expected),
        "<" => actual.as_ref().map(|a| as_f64(a) < as_f64(&expected)).unwrap_or(false),
        "<=" => actual.as_ref().map(|a| as_f64(a) <= as_f64(&expected)).unwrap_or(false),
        ">" => actual.as_ref().map(|a| as_f64(a) > as_f64(&expected)).unwrap_or(false),
        ">=" => actual.as_ref().map(|a| as_f64(a) >= as_f64(&expected)).unwrap_or(false),
        "contains" => actual
            .as_ref()
            .map(|a| match a {
                Value::String(s) => s.contains(&as_str(&expected)),
                Value::Array(items) => items.iter().any(|v| loose_eq(v, &expected)),
                _ => false,
            })
            .unwrap_or(false),
        "startsWith" => actual
            .as_ref()
            .map(|a| as_str(a).starts_with(&as_str(&expected)))
            .unwrap_or(false),
        "endsWith" => actual
            .as_ref()
            .map(|a| as_str(a).ends_with(&as_str(&expected)))
            .unwrap_or(false),
        "in" => match &expected {
            Value::Array(items) => actual
                .as_ref()
                .map(|a| items.iter().any(|v| loose_eq(v, a)))
                .unwrap_or(false),
            Value::String(s) => actual.as_ref().map(|a| s.contains(&as_str(a))).unwrap_or(false),
            _ => false,
        },
        "notIn" => match &expected {
            Value::Array(items) => !actual
                .as_ref()
                .map(|a| items.iter().any(|v| loose_eq(v, a)))
                .unwrap_or(false),
            Value::String(s) => !actual.as_ref().map(|a| s.contains(&as_str(a))).unwrap_or(false),
            _ => true,
        },
        other => {
            return Err(EngineError::InvalidConditionRule(format!(
                "unknown simple comparison operator '{other}'"
            )))
        }
    };
    Ok(result)
}

fn evaluate_custom(obj: &Map<String, Value>, ctx: &ConditionContext) -> Result<bool, EngineError> {
    let operation = obj
        .get("operation")
        .and_then(Value::as_str)
        .ok_or_else(|| EngineError::InvalidConditionRule("missing 'operation'".to_string()))?;

    match operation {
        "timeWindow" => {
            let start = obj.get("startTime").and_then(Value::as_str).unwrap_or("00:00");
            let end = obj.get("endTime").and_then(Value::as_str).unwrap_or("23:59");
            Ok(time_in_window(start, end, current_minutes_utc()))
        }
        "userRole" => {
            let expected_role = obj.get("role").and_then(Value::as_str).unwrap_or("");
            let actual_role = ctx
                .inputs
                .get("userRole")
                .or_else(|| ctx.inputs.get("role"))
                .and_then(Value::as_str)
                .unwrap_or("");
            Ok(actual_role == expected_role)
        }
        "stepOutput" => {
            let step_id = obj
                .get("stepId")
                .and_then(Value::as_str)
                .ok_or_else(|| EngineError::InvalidConditionRule("missing 'stepId'".to_string()))?;
            let rule = obj
                .get("rule")
                .cloned()
                .ok_or_else(|| EngineError::InvalidConditionRule("missing 'rule'".to_string()))?;
            let output = get_path(&ctx.step_outputs, step_id)
                .cloned()
                .unwrap_or(Value::Null);
            let sub_ctx = ctx.with_inputs(output);
            evaluate(&Some(rule), &sub_ctx)
        }
        other => Err(EngineError::InvalidConditionRule(format!(
            "unknown custom operation '{other}'"
        ))),
    }
}

/// Minutes since UTC midnight, allowing `timeWindow` to be evaluated
/// deterministically without pulling in a timezone database (the teacher's
/// `CONDITIONAL_TIME` step type used a fixed `America::Mexico_City` zone;
/// this core generalizes it to UTC since org-local timezone is outside this
/// crate's scope).
fn current_minutes_utc() -> u32 {
    use chrono::Timelike;
    let now = chrono::Utc::now();
    now.hour() * 60 + now.minute()
}

fn parse_hhmm(s: &str) -> Option<u32> {
    let mut parts = s.split(':');
    let h: u32 = parts.next()?.parse().ok()?;
    let m: u32 = parts.next()?.parse().ok()?;
    Some(h * 60 + m)
}

/// Midnight-crossing-aware window check, grounded on the teacher's
/// `CONDITIONAL_TIME` branch logic in `processors.rs`.
fn time_in_window(start: &str, end: &str, now_minutes: u32) -> bool {
    match (parse_hhmm(start), parse_hhmm(end)) {
        (Some(s), Some(e)) if s < e => now_minutes >= s && now_minutes < e,
        (Some(s), Some(e)) => now_minutes >= s || now_minutes < e,
        _ => false,
    }
}
