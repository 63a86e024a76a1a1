//! Template rendering for response bodies and stream items.
//!
//! Only string leaves are scanned; arrays and objects recurse. A leaf that
//! is exactly one `{{expr}}` keeps the evaluated JSON type; expressions
//! embedded in larger strings are stringified in place. The renderer is
//! total: any evaluation error preserves the original `{{...}}` text.

use std::collections::BTreeMap;

use rand::Rng;
use serde_json::Value;

use crate::rules::matcher::string_form;
use crate::rules::select::resolve_path;

/// Per-item stream position exposed to templates as `stream.*`.
#[derive(Debug, Clone, Copy)]
pub struct StreamCtx {
    pub index: usize,
    pub total: usize,
    pub is_first: bool,
    pub is_last: bool,
}

impl StreamCtx {
    pub fn new(index: usize, total: usize) -> Self {
        StreamCtx {
            index,
            total,
            is_first: index == 0,
            is_last: index + 1 == total,
        }
    }
}

/// Evaluation context for one render pass.
#[derive(Debug, Clone)]
pub struct RenderCtx<'a> {
    pub request: &'a Value,
    pub metadata: &'a BTreeMap<String, String>,
    pub stream: Option<StreamCtx>,
}

impl<'a> RenderCtx<'a> {
    pub fn new(request: &'a Value, metadata: &'a BTreeMap<String, String>) -> Self {
        RenderCtx {
            request,
            metadata,
            stream: None,
        }
    }

    pub fn with_stream(mut self, stream: StreamCtx) -> Self {
        self.stream = Some(stream);
        self
    }
}

/// Substitute `{{...}}` expressions throughout a JSON tree.
pub fn render(value: &Value, ctx: &RenderCtx) -> Value {
    match value {
        Value::String(s) => render_string(s, ctx),
        Value::Array(items) => Value::Array(items.iter().map(|v| render(v, ctx)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render(v, ctx)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn render_string(input: &str, ctx: &RenderCtx) -> Value {
    // Fast path: a leaf that is exactly one expression keeps its JSON type.
    let trimmed = input.trim();
    if trimmed.starts_with("{{") && trimmed.ends_with("}}") && trimmed == input {
        let inner = &trimmed[2..trimmed.len() - 2];
        if !inner.contains("{{") {
            return match eval(inner.trim(), ctx) {
                Ok(value) => value,
                Err(_) => Value::String(input.to_string()),
            };
        }
    }

    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let expr = &after[..end];
                match eval(expr.trim(), ctx) {
                    Ok(value) => out.push_str(&string_form(&value)),
                    // Preserve the source text on any evaluation error.
                    Err(_) => {
                        out.push_str("{{");
                        out.push_str(expr);
                        out.push_str("}}");
                    }
                }
                rest = &after[end + 2..];
            }
            None => {
                // Unterminated marker: keep the remainder verbatim.
                out.push_str("{{");
                rest = after;
                break;
            }
        }
    }
    out.push_str(rest);
    Value::String(out)
}

/// Evaluate one expression: a function call or an identifier path.
fn eval(expr: &str, ctx: &RenderCtx) -> Result<Value, String> {
    if expr.is_empty() {
        return Err("empty expression".to_string());
    }
    if let Some(open) = expr.find('(') {
        if expr.ends_with(')') {
            let name = expr[..open].trim();
            let args_src = &expr[open + 1..expr.len() - 1];
            let args = split_args(args_src)?
                .into_iter()
                .map(|arg| eval_arg(&arg, ctx))
                .collect::<Result<Vec<Value>, String>>()?;
            return call(name, &args);
        }
    }
    eval_path(expr, ctx)
}

/// An argument is a literal (quoted string, number, boolean, null) or a
/// nested expression.
fn eval_arg(arg: &str, ctx: &RenderCtx) -> Result<Value, String> {
    let arg = arg.trim();
    if arg.len() >= 2
        && ((arg.starts_with('\'') && arg.ends_with('\''))
            || (arg.starts_with('"') && arg.ends_with('"')))
    {
        return Ok(Value::String(arg[1..arg.len() - 1].to_string()));
    }
    match arg {
        "true" => return Ok(Value::Bool(true)),
        "false" => return Ok(Value::Bool(false)),
        "null" => return Ok(Value::Null),
        _ => {}
    }
    if let Ok(n) = arg.parse::<i64>() {
        return Ok(Value::from(n));
    }
    if let Ok(f) = arg.parse::<f64>() {
        return Ok(Value::from(f));
    }
    eval(arg, ctx)
}

/// Split a call's argument list on top-level commas, respecting quoted
/// strings and nested parentheses.
fn split_args(src: &str) -> Result<Vec<String>, String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;

    for ch in src.chars() {
        match quote {
            Some(q) => {
                current.push(ch);
                if ch == q {
                    quote = None;
                }
            }
            None => match ch {
                '\'' | '"' => {
                    quote = Some(ch);
                    current.push(ch);
                }
                '(' => {
                    depth += 1;
                    current.push(ch);
                }
                ')' => {
                    depth = depth.checked_sub(1).ok_or("unbalanced parentheses")?;
                    current.push(ch);
                }
                ',' if depth == 0 => {
                    args.push(current.trim().to_string());
                    current.clear();
                }
                _ => current.push(ch),
            },
        }
    }
    if quote.is_some() {
        return Err("unterminated string literal".to_string());
    }
    if depth != 0 {
        return Err("unbalanced parentheses".to_string());
    }
    let last = current.trim();
    if !last.is_empty() {
        args.push(last.to_string());
    } else if !args.is_empty() {
        return Err("trailing comma in argument list".to_string());
    }
    Ok(args)
}

fn call(name: &str, args: &[Value]) -> Result<Value, String> {
    match name {
        "utils.now" => {
            if !args.is_empty() {
                return Err("utils.now takes no arguments".to_string());
            }
            Ok(Value::String(
                chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            ))
        }
        "utils.uuid" => {
            if !args.is_empty() {
                return Err("utils.uuid takes no arguments".to_string());
            }
            Ok(Value::String(uuid::Uuid::new_v4().to_string()))
        }
        "utils.random" => {
            let (min, max) = match args {
                [min, max] => (
                    as_number(min).ok_or("utils.random: min is not a number")?,
                    as_number(max).ok_or("utils.random: max is not a number")?,
                ),
                _ => return Err("utils.random takes (min, max)".to_string()),
            };
            if min > max {
                return Err("utils.random: min exceeds max".to_string());
            }
            let mut rng = rand::thread_rng();
            if min.fract() == 0.0 && max.fract() == 0.0 {
                let n = rng.gen_range(min as i64..=max as i64);
                Ok(Value::from(n))
            } else {
                Ok(Value::from(rng.gen_range(min..=max)))
            }
        }
        "utils.format" => {
            let Some((fmt, rest)) = args.split_first() else {
                return Err("utils.format takes (fmt, args...)".to_string());
            };
            let fmt = fmt
                .as_str()
                .ok_or("utils.format: fmt must be a string")?;
            let mut out = String::new();
            let mut values = rest.iter();
            let mut src = fmt;
            while let Some(pos) = src.find("{}") {
                out.push_str(&src[..pos]);
                match values.next() {
                    Some(value) => out.push_str(&string_form(value)),
                    None => out.push_str("{}"),
                }
                src = &src[pos + 2..];
            }
            out.push_str(src);
            Ok(Value::String(out))
        }
        other => Err(format!("unknown function '{other}'")),
    }
}

fn as_number(value: &Value) -> Option<f64> {
    crate::rules::matcher::coerce_number(value)
}

fn eval_path(path: &str, ctx: &RenderCtx) -> Result<Value, String> {
    if !path
        .chars()
        .all(|c| c.is_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        return Err(format!("invalid identifier path '{path}'"));
    }

    if let Some(field) = path.strip_prefix("stream.") {
        let stream = ctx.stream.ok_or("no stream context")?;
        return match field {
            "index" => Ok(Value::from(stream.index)),
            "total" => Ok(Value::from(stream.total)),
            "isFirst" => Ok(Value::Bool(stream.is_first)),
            "isLast" => Ok(Value::Bool(stream.is_last)),
            other => Err(format!("unknown stream field '{other}'")),
        };
    }

    resolve_path(path, ctx.request, ctx.metadata)
        .ok_or_else(|| format!("path '{path}' did not resolve"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meta(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn identity_on_trees_without_markers() {
        let request = json!({});
        let metadata = meta(&[]);
        let ctx = RenderCtx::new(&request, &metadata);
        let tree = json!({"a": [1, 2, {"b": "plain text"}], "c": true});
        assert_eq!(render(&tree, &ctx), tree);
    }

    #[test]
    fn substitutes_request_and_metadata_paths() {
        let request = json!({"name": "Tom", "age": 30});
        let metadata = meta(&[("x-user-id", "42")]);
        let ctx = RenderCtx::new(&request, &metadata);

        let tree = json!({"greeting": "Hello {{request.name}} ({{metadata.x-user-id}})"});
        assert_eq!(
            render(&tree, &ctx),
            json!({"greeting": "Hello Tom (42)"})
        );
    }

    #[test]
    fn whole_string_expression_keeps_json_type() {
        let request = json!({"age": 30, "tags": ["a"]});
        let metadata = meta(&[]);
        let ctx = RenderCtx::new(&request, &metadata);

        assert_eq!(render(&json!("{{request.age}}"), &ctx), json!(30));
        assert_eq!(render(&json!("{{request.tags}}"), &ctx), json!(["a"]));
        // Embedded in a larger string it stringifies instead.
        assert_eq!(
            render(&json!("age={{request.age}}"), &ctx),
            json!("age=30")
        );
    }

    #[test]
    fn stream_context_fields() {
        let request = json!({});
        let metadata = meta(&[]);
        let ctx = RenderCtx::new(&request, &metadata).with_stream(StreamCtx::new(1, 3));

        assert_eq!(render(&json!("{{stream.index}}"), &ctx), json!(1));
        assert_eq!(render(&json!("{{stream.total}}"), &ctx), json!(3));
        assert_eq!(render(&json!("{{stream.isFirst}}"), &ctx), json!(false));
        assert_eq!(render(&json!("{{stream.isLast}}"), &ctx), json!(false));
    }

    #[test]
    fn errors_preserve_source_text() {
        let request = json!({});
        let metadata = meta(&[]);
        let ctx = RenderCtx::new(&request, &metadata);

        assert_eq!(
            render(&json!("{{request.missing}}"), &ctx),
            json!("{{request.missing}}")
        );
        assert_eq!(
            render(&json!("a {{nope.x}} b"), &ctx),
            json!("a {{nope.x}} b")
        );
        assert_eq!(
            render(&json!("{{utils.bogus()}}"), &ctx),
            json!("{{utils.bogus()}}")
        );
        // Unterminated markers stay as-is.
        assert_eq!(render(&json!("oops {{foo"), &ctx), json!("oops {{foo"));
    }

    #[test]
    fn uuid_and_now_produce_values() {
        let request = json!({});
        let metadata = meta(&[]);
        let ctx = RenderCtx::new(&request, &metadata);

        let uuid = render(&json!("{{utils.uuid()}}"), &ctx);
        let uuid = uuid.as_str().unwrap();
        assert_eq!(uuid.len(), 36);
        assert_eq!(uuid.matches('-').count(), 4);

        let now = render(&json!("{{utils.now()}}"), &ctx);
        assert!(now.as_str().unwrap().contains('T'));
    }

    #[test]
    fn random_respects_bounds() {
        let request = json!({});
        let metadata = meta(&[]);
        let ctx = RenderCtx::new(&request, &metadata);

        for _ in 0..50 {
            let n = render(&json!("{{utils.random(1, 6)}}"), &ctx);
            let n = n.as_i64().unwrap();
            assert!((1..=6).contains(&n));
        }
    }

    #[test]
    fn format_with_nested_expressions_and_quoted_commas() {
        let request = json!({"name": "Tom"});
        let metadata = meta(&[]);
        let ctx = RenderCtx::new(&request, &metadata);

        // The comma inside the quoted literal must not split arguments,
        // and the nested expression evaluates before formatting.
        let out = render(
            &json!("{{utils.format('Hi, {} and {}', request.name, 'bye')}}"),
            &ctx,
        );
        assert_eq!(out, json!("Hi, Tom and bye"));
    }

    #[test]
    fn nested_calls_in_arguments() {
        let request = json!({});
        let metadata = meta(&[]);
        let ctx = RenderCtx::new(&request, &metadata);

        let out = render(&json!("{{utils.format('n={}', utils.random(3, 3))}}"), &ctx);
        assert_eq!(out, json!("n=3"));
    }
}
