//! Template and expression evaluator for step configs and conditions.
//!
//! Wraps `jexl_eval::Evaluator` with a small safe transform set and adds the
//! `{{ ... }}` template layer on top:
//!
//! - Strings without `{{` pass through unchanged.
//! - A string that is exactly one `{{ ... }}` template resolves to a typed value.
//! - Mixed text interpolates each template as a string.
//!
//! Plain dot-paths (`steps.fetch.items`) are walked directly, retrying each
//! missing segment with `_` and `-` swapped. Anything with operators, brackets
//! or transforms is handed to JEXL. Resolution failures are logged and the
//! original text is returned, so one bad template never fails an execution.
//!
//! **Security note:** values are always passed as the JEXL context object,
//! NEVER interpolated into expression strings.

use serde_json::{Map, Number, Value, json};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during expression evaluation.
#[derive(Debug, thiserror::Error)]
pub enum ExpressionError {
    #[error("unresolved reference: {0}")]
    Unresolved(String),

    #[error("expression evaluation failed: {0}")]
    EvalFailed(String),

    #[error("invalid context: {0}")]
    InvalidContext(String),
}

// ---------------------------------------------------------------------------
// ExpressionEvaluator
// ---------------------------------------------------------------------------

/// JEXL evaluator with the template layer and safe transforms pre-registered.
///
/// Available transforms: `not`, `len`/`length`, `min`, `max`, `int`, `float`,
/// `str`, `bool`, `lower`, `upper`, `trim`, `split`, `contains`,
/// `startsWith`, `endsWith`.
pub struct ExpressionEvaluator {
    evaluator: jexl_eval::Evaluator<'static>,
}

impl ExpressionEvaluator {
    /// Create a new evaluator with all transforms registered.
    pub fn new() -> Self {
        let evaluator = jexl_eval::Evaluator::new()
            // Boolean
            .with_transform("not", |args: &[Value]| {
                let val = args.first().cloned().unwrap_or(Value::Null);
                Ok(json!(!is_truthy(&val)))
            })
            .with_transform("bool", |args: &[Value]| {
                let val = args.first().cloned().unwrap_or(Value::Null);
                Ok(json!(is_truthy(&val)))
            })
            // Size
            .with_transform("len", |args: &[Value]| Ok(json!(length_of(args.first()))))
            .with_transform("length", |args: &[Value]| {
                Ok(json!(length_of(args.first())))
            })
            // Numeric
            .with_transform("min", |args: &[Value]| Ok(fold_numbers(args, f64::min)))
            .with_transform("max", |args: &[Value]| Ok(fold_numbers(args, f64::max)))
            .with_transform("int", |args: &[Value]| {
                Ok(as_number(args.first())
                    .map(|n| json!(n.trunc()))
                    .unwrap_or(Value::Null))
            })
            .with_transform("float", |args: &[Value]| {
                Ok(as_number(args.first()).map(|n| json!(n)).unwrap_or(Value::Null))
            })
            // String
            .with_transform("str", |args: &[Value]| {
                let val = args.first().cloned().map(restore_integers);
                Ok(json!(val.as_ref().map(value_to_string).unwrap_or_default()))
            })
            .with_transform("lower", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_lowercase()))
            })
            .with_transform("upper", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_uppercase()))
            })
            .with_transform("trim", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.trim()))
            })
            .with_transform("split", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let delimiter = args.get(1).and_then(|v| v.as_str()).unwrap_or(",");
                let parts: Vec<&str> = s.split(delimiter).collect();
                Ok(json!(parts))
            })
            .with_transform("contains", |args: &[Value]| {
                let found = match (args.first(), args.get(1)) {
                    (Some(Value::String(s)), Some(Value::String(needle))) => s.contains(needle.as_str()),
                    (Some(Value::Array(items)), Some(needle)) => items.contains(needle),
                    _ => false,
                };
                Ok(json!(found))
            })
            .with_transform("startsWith", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let prefix = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.starts_with(prefix)))
            })
            .with_transform("endsWith", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let suffix = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.ends_with(suffix)))
            });

        Self { evaluator }
    }

    /// Resolve a literal, template, or mixed string against `namespace`.
    ///
    /// Never fails: unresolvable templates are logged and returned verbatim.
    pub fn evaluate(&self, expression: &str, namespace: &Value) -> Value {
        if !expression.contains("{{") {
            return Value::String(expression.to_string());
        }

        if let Some(inner) = whole_template(expression) {
            return match self.resolve_inner(inner, namespace) {
                Ok(value) => value,
                Err(e) => {
                    tracing::warn!(expression, error = %e, "expression resolution failed, leaving literal");
                    Value::String(expression.to_string())
                }
            };
        }

        Value::String(self.interpolate(expression, namespace))
    }

    /// Recursively resolve every string leaf of a config value.
    ///
    /// Non-string leaves and the overall structure are preserved.
    pub fn resolve_config(&self, config: &Value, namespace: &Value) -> Value {
        match config {
            Value::String(s) => self.evaluate(s, namespace),
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.resolve_config(item, namespace))
                    .collect(),
            ),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.resolve_config(v, namespace)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// Evaluate a condition to a boolean.
    ///
    /// Accepts `{{ ... }}` templates or bare expressions. A condition that
    /// cannot be resolved is logged and treated as false.
    pub fn evaluate_condition(&self, expression: &str, namespace: &Value) -> bool {
        let resolved = if !expression.contains("{{") {
            self.resolve_inner(expression.trim(), namespace)
        } else if let Some(inner) = whole_template(expression) {
            self.resolve_inner(inner, namespace)
        } else {
            Ok(Value::String(self.interpolate(expression, namespace)))
        };

        match resolved {
            Ok(value) => is_truthy(&value),
            Err(e) => {
                tracing::warn!(expression, error = %e, "condition could not be evaluated, treating as false");
                false
            }
        }
    }

    /// Resolve the inside of one template (without the braces).
    pub fn resolve_inner(&self, inner: &str, namespace: &Value) -> Result<Value, ExpressionError> {
        if !namespace.is_object() {
            return Err(ExpressionError::InvalidContext(
                "namespace must be a JSON object".to_string(),
            ));
        }

        let inner = inner.trim();
        if inner.is_empty() {
            return Err(ExpressionError::EvalFailed("empty expression".to_string()));
        }

        if is_simple_path(inner) {
            return resolve_path(namespace, inner)
                .cloned()
                .ok_or_else(|| ExpressionError::Unresolved(inner.to_string()));
        }

        let rewritten = rewrite_operators(inner);
        let context = jexl_context(namespace);
        self.evaluator
            .eval_in_context(&rewritten, &context)
            .map(restore_integers)
            .map_err(|e| ExpressionError::EvalFailed(e.to_string()))
    }

    fn interpolate(&self, template: &str, namespace: &Value) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(start) = rest.find("{{") {
            let Some(len) = rest[start..].find("}}") else {
                break;
            };
            let end = start + len + 2;
            out.push_str(&rest[..start]);

            let segment = &rest[start..end];
            match self.resolve_inner(&segment[2..segment.len() - 2], namespace) {
                Ok(value) => out.push_str(&value_to_string(&value)),
                Err(e) => {
                    tracing::warn!(template = segment, error = %e, "template resolution failed, leaving literal");
                    out.push_str(segment);
                }
            }
            rest = &rest[end..];
        }

        out.push_str(rest);
        out
    }
}

impl Default for ExpressionEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Value helpers
// ---------------------------------------------------------------------------

/// Truthiness used for conditions and `when` guards.
///
/// Strings `"false"`, `"0"`, `"none"`, `"null"` (any case) and `""` are falsy,
/// as are empty arrays and objects.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => {
            let s = s.trim().to_ascii_lowercase();
            !matches!(s.as_str(), "" | "false" | "0" | "none" | "null")
        }
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Render a value for string interpolation: strings raw, everything else as JSON.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Walk a dot-path through `root`.
///
/// Object segments retry with `_`/`-` swapped; array segments are indices.
pub fn resolve_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map
                .get(segment)
                .or_else(|| map.get(&swap_separators(segment)))?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn swap_separators(segment: &str) -> String {
    segment
        .chars()
        .map(|c| match c {
            '_' => '-',
            '-' => '_',
            other => other,
        })
        .collect()
}

/// `Some(inner)` when the whole string is exactly one `{{ ... }}` template.
fn whole_template(expression: &str) -> Option<&str> {
    let inner = expression
        .trim()
        .strip_prefix("{{")?
        .strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    Some(inner)
}

const LITERALS: &[&str] = &["true", "false", "null", "True", "False", "None"];

/// Identifier segments joined by dots, with no operator syntax.
fn is_simple_path(expr: &str) -> bool {
    if LITERALS.contains(&expr) {
        return false;
    }
    let mut chars = expr.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    expr.split('.').all(|seg| {
        !seg.is_empty()
            && seg
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    })
}

/// Rewrite Python-style keywords outside string literals into JEXL syntax.
///
/// `and`/`or` become `&&`/`||`, `True`/`False`/`None` become literals, and a
/// leading `not` wraps the rest of the expression in the `not` transform.
fn rewrite_operators(expr: &str) -> String {
    let mut out = String::with_capacity(expr.len());
    let mut word = String::new();
    let mut quote: Option<char> = None;
    let mut prev = '\0';

    let flush = |word: &mut String, out: &mut String, prev: char| {
        if word.is_empty() {
            return;
        }
        let replacement = if prev == '.' {
            None
        } else {
            match word.as_str() {
                "and" => Some("&&"),
                "or" => Some("||"),
                "True" => Some("true"),
                "False" => Some("false"),
                "None" => Some("null"),
                _ => None,
            }
        };
        out.push_str(replacement.unwrap_or(word.as_str()));
        word.clear();
    };

    let mut word_prev = '\0';
    for c in expr.chars() {
        if let Some(q) = quote {
            out.push(c);
            if c == q {
                quote = None;
            }
        } else if c == '\'' || c == '"' {
            flush(&mut word, &mut out, word_prev);
            quote = Some(c);
            out.push(c);
        } else if c.is_ascii_alphanumeric() || c == '_' {
            if word.is_empty() {
                word_prev = prev;
            }
            word.push(c);
        } else {
            flush(&mut word, &mut out, word_prev);
            out.push(c);
        }
        prev = c;
    }
    flush(&mut word, &mut out, word_prev);

    match out.trim_start().strip_prefix("not ") {
        Some(rest) => format!("({})|not", rest.trim()),
        None => out,
    }
}

/// Prepare the namespace for JEXL.
///
/// JEXL compares numbers as floats, so integers are widened. Hyphenated keys
/// get an underscore alias since `-` is an operator in dotted access.
fn jexl_context(value: &Value) -> Value {
    match value {
        Value::Number(n) if !n.is_f64() => n
            .as_f64()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Value::Array(items) => Value::Array(items.iter().map(jexl_context).collect()),
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (k, v) in map {
                let converted = jexl_context(v);
                if k.contains('-') {
                    let alias = k.replace('-', "_");
                    if !map.contains_key(&alias) {
                        out.insert(alias, converted.clone());
                    }
                }
                out.insert(k.clone(), converted);
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

/// Turn whole floats produced by JEXL back into integers.
fn restore_integers(value: Value) -> Value {
    const MAX_EXACT: f64 = 9_007_199_254_740_992.0;
    match value {
        Value::Number(n) => match n.as_f64() {
            Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() < MAX_EXACT => json!(f as i64),
            _ => Value::Number(n),
        },
        Value::Array(items) => Value::Array(items.into_iter().map(restore_integers).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, restore_integers(v)))
                .collect(),
        ),
        other => other,
    }
}

fn length_of(value: Option<&Value>) -> f64 {
    let len = match value {
        Some(Value::String(s)) => s.chars().count(),
        Some(Value::Array(a)) => a.len(),
        Some(Value::Object(o)) => o.len(),
        _ => 0,
    };
    len as f64
}

fn as_number(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

/// `items|max` over an array, or `a|max(b, ...)` over arguments.
fn fold_numbers(args: &[Value], pick: fn(f64, f64) -> f64) -> Value {
    let numbers: Vec<f64> = match args {
        [Value::Array(items)] => items.iter().filter_map(|v| v.as_f64()).collect(),
        _ => args.iter().filter_map(|v| v.as_f64()).collect(),
    };
    numbers
        .into_iter()
        .reduce(pick)
        .map(|n| json!(n))
        .unwrap_or(Value::Null)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
