use regex::Regex;
use serde_json::Value;

/// A condition compared against a decoded request field or metadata header.
///
/// Rule files express matchers either as literals (string equality against
/// the decoded value) or as single-operator objects. Parsing happens once at
/// rule load; evaluation against live values is allocation-light.
#[derive(Debug, Clone)]
pub enum Matcher {
    /// Bare literal: string equality against the decoded value.
    Literal(Value),
    /// `{regex: "...", flags: "i"}`; tested against the string form.
    Regex { regex: Regex },
    /// `{contains: v}`: substring for strings, membership for arrays.
    Contains(Value),
    /// `{in: [...]}`: membership by string equality.
    In(Vec<Value>),
    /// `{exists: bool}`: present and non-null (or the negation).
    Exists(bool),
    /// `{gt|gte|lt|lte: n}`: both sides must coerce to finite numbers.
    Numeric { op: NumericOp, rhs: Value },
    /// `{eq: v}` / `{ne: v}`: string-equality semantics.
    Eq(Value),
    Ne(Value),
    /// `{not: matcher}`: logical negation of the inner matcher.
    Not(Box<Matcher>),
    /// Operator object with no recognized key: compared by the string form
    /// of the whole object.
    Unknown(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumericOp {
    Gt,
    Gte,
    Lt,
    Lte,
}

impl Matcher {
    /// Parse a rule-file value into a matcher. Invalid regexes are load
    /// errors so the author hears about them instead of silently never
    /// matching.
    pub fn parse(raw: &Value) -> Result<Matcher, String> {
        let obj = match raw {
            Value::Object(map) => map,
            other => return Ok(Matcher::Literal(other.clone())),
        };

        if let Some(pattern) = obj.get("regex") {
            let pattern = pattern
                .as_str()
                .ok_or_else(|| "regex operator requires a string pattern".to_string())?;
            let flags = obj.get("flags").and_then(Value::as_str).unwrap_or("");
            let regex = compile_regex(pattern, flags)?;
            return Ok(Matcher::Regex { regex });
        }
        if let Some(needle) = obj.get("contains") {
            return Ok(Matcher::Contains(needle.clone()));
        }
        if let Some(list) = obj.get("in") {
            if let Value::Array(items) = list {
                return Ok(Matcher::In(items.clone()));
            }
            return Ok(Matcher::Unknown(compact_string(raw)));
        }
        if let Some(flag) = obj.get("exists") {
            if let Value::Bool(expected) = flag {
                return Ok(Matcher::Exists(*expected));
            }
            return Ok(Matcher::Unknown(compact_string(raw)));
        }
        for (key, op) in [
            ("gt", NumericOp::Gt),
            ("gte", NumericOp::Gte),
            ("lt", NumericOp::Lt),
            ("lte", NumericOp::Lte),
        ] {
            if let Some(rhs) = obj.get(key) {
                return Ok(Matcher::Numeric {
                    op,
                    rhs: rhs.clone(),
                });
            }
        }
        if let Some(expected) = obj.get("eq") {
            return Ok(Matcher::Eq(expected.clone()));
        }
        if let Some(expected) = obj.get("ne") {
            return Ok(Matcher::Ne(expected.clone()));
        }
        if let Some(inner) = obj.get("not") {
            return Ok(Matcher::Not(Box::new(Matcher::parse(inner)?)));
        }

        Ok(Matcher::Unknown(compact_string(raw)))
    }

    /// Evaluate this matcher against a resolved value (`None` when the path
    /// did not resolve).
    pub fn matches(&self, value: Option<&Value>) -> bool {
        match self {
            Matcher::Exists(expected) => {
                let present = matches!(value, Some(v) if !v.is_null());
                present == *expected
            }
            Matcher::Not(inner) => !inner.matches(value),
            Matcher::Ne(expected) => match value {
                Some(v) => string_form(v) != string_form(expected),
                None => true,
            },
            _ => {
                let Some(value) = value else { return false };
                match self {
                    Matcher::Literal(expected) | Matcher::Eq(expected) => {
                        string_form(value) == string_form(expected)
                    }
                    Matcher::Regex { regex } => regex.is_match(&string_form(value)),
                    Matcher::Contains(needle) => match value {
                        Value::String(s) => s.contains(&string_form(needle)),
                        Value::Array(items) => items
                            .iter()
                            .any(|item| string_form(item) == string_form(needle)),
                        _ => false,
                    },
                    Matcher::In(allowed) => allowed
                        .iter()
                        .any(|candidate| string_form(candidate) == string_form(value)),
                    Matcher::Numeric { op, rhs } => {
                        match (coerce_number(value), coerce_number(rhs)) {
                            (Some(lhs), Some(rhs)) => match op {
                                NumericOp::Gt => lhs > rhs,
                                NumericOp::Gte => lhs >= rhs,
                                NumericOp::Lt => lhs < rhs,
                                NumericOp::Lte => lhs <= rhs,
                            },
                            _ => false,
                        }
                    }
                    Matcher::Unknown(expected) => string_form(value) == *expected,
                    // Handled in the outer match.
                    Matcher::Exists(_) | Matcher::Not(_) | Matcher::Ne(_) => unreachable!(),
                }
            }
        }
    }
}

/// The string form used for equality comparisons: strings are taken as-is,
/// scalars use their JSON rendering, and composites use compact JSON.
pub fn string_form(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => compact_string(other),
    }
}

fn compact_string(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

/// Coerce a JSON value to a finite number. Strings parse numerically,
/// booleans count as 0/1; anything else fails the coercion.
pub fn coerce_number(value: &Value) -> Option<f64> {
    let n = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        Value::Bool(b) => {
            if *b {
                1.0
            } else {
                0.0
            }
        }
        _ => return None,
    };
    n.is_finite().then_some(n)
}

/// Translate a JavaScript-style flag string into an inline-flag prefix the
/// regex crate understands. `g` and `y` have no matching-per-call meaning
/// here and are dropped; `u` is the crate's default behavior.
fn compile_regex(pattern: &str, flags: &str) -> Result<Regex, String> {
    let mut inline = String::new();
    for flag in flags.chars() {
        match flag {
            'i' => inline.push('i'),
            'm' => inline.push('m'),
            's' => inline.push('s'),
            'x' => inline.push('x'),
            'g' | 'y' | 'u' => {}
            other => return Err(format!("unsupported regex flag '{other}'")),
        }
    }
    let full = if inline.is_empty() {
        pattern.to_string()
    } else {
        format!("(?{inline}){pattern}")
    };
    Regex::new(&full).map_err(|e| format!("invalid regex '{pattern}': {e}"))
}
