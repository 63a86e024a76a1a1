//! Evaluation of extracted constraints against decoded messages.
//!
//! Fields are checked in declaration order, then message-level CEL; all
//! violations are collected without short-circuiting so callers can surface
//! the complete list.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::rules::matcher::{coerce_number, string_form};
use crate::validation::cel::CelEnv;
use crate::validation::ir::{FieldConstraint, MessageIr, Ops};

/// One failed constraint.
#[derive(Debug, Clone, serde::Serialize, PartialEq, Eq)]
pub struct Violation {
    pub field: String,
    pub rule: String,
    pub description: String,
}

/// Result of validating one message. `ok` holds iff `violations` is empty.
#[derive(Debug, Clone, Default)]
pub struct Outcome {
    pub violations: Vec<Violation>,
}

impl Outcome {
    pub fn ok(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Validate a decoded message against its IR.
pub fn validate_value(ir: &MessageIr, message: &Value, cel_message_enabled: bool) -> Outcome {
    let mut outcome = Outcome::default();

    for constraint in &ir.fields {
        check_field(constraint, message, &mut outcome.violations);
    }

    if cel_message_enabled {
        for rule in &ir.message_cel {
            let env = CelEnv {
                this: message,
                message,
            };
            match rule.expr.eval_bool(&env) {
                Ok(true) => {}
                Ok(false) => outcome.violations.push(Violation {
                    field: "(message)".to_string(),
                    rule: "cel".to_string(),
                    description: rule
                        .message
                        .clone()
                        .unwrap_or_else(|| format!("expression failed: {}", rule.source_text)),
                }),
                Err(err) => outcome.violations.push(Violation {
                    field: "(message)".to_string(),
                    rule: "cel".to_string(),
                    description: format!("{}: {err}", rule.source_text),
                }),
            }
        }
    }

    outcome
}

fn check_field(constraint: &FieldConstraint, message: &Value, violations: &mut Vec<Violation>) {
    let value = message.get(&constraint.field);

    if constraint.ops.ignore_empty && value.map(is_zero_value).unwrap_or(true) {
        return;
    }

    if constraint.ops.get("required").is_some() && is_unset(value) {
        violations.push(violation(constraint, "required", "value is required"));
    }

    let Some(value) = value else { return };
    if value.is_null() {
        return;
    }

    for rule in &constraint.ops.cel {
        let env = CelEnv {
            this: value,
            message,
        };
        match rule.expr.eval_bool(&env) {
            Ok(true) => {}
            Ok(false) => violations.push(violation(
                constraint,
                "cel",
                rule.message
                    .as_deref()
                    .unwrap_or(&format!("expression failed: {}", rule.source_text)),
            )),
            Err(err) => violations.push(violation(
                constraint,
                "cel",
                &format!("{}: {err}", rule.source_text),
            )),
        }
    }

    match value {
        Value::String(s) => {
            check_string(constraint, &constraint.ops, s, violations);
            check_enum_string(constraint, s, violations);
            check_number(constraint, &constraint.ops, value, violations);
        }
        Value::Number(_) => {
            check_number(constraint, &constraint.ops, value, violations);
            check_enum_number(constraint, value, violations);
        }
        Value::Array(items) => check_repeated(constraint, items, violations),
        _ => {}
    }
}

fn violation(constraint: &FieldConstraint, rule: &str, description: &str) -> Violation {
    Violation {
        field: constraint.field.clone(),
        rule: rule.to_string(),
        description: description.to_string(),
    }
}

fn is_unset(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(Value::Number(n)) => n.as_f64() == Some(0.0),
        _ => false,
    }
}

/// The zero value of a field's JSON decoding: empty string, zero number,
/// false, empty list/object, or null.
pub fn is_zero_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
    }
}

// -- String rules -------------------------------------------------------------

static EMAIL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("email regex is valid"));
static UUID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$")
        .expect("uuid regex is valid")
});
static HOSTNAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9]([A-Za-z0-9-]{0,61}[A-Za-z0-9])?(\.[A-Za-z0-9]([A-Za-z0-9-]{0,61}[A-Za-z0-9])?)*$")
        .expect("hostname regex is valid")
});
static URI_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9+.-]*:\S*$").expect("uri regex is valid"));

fn check_string(
    constraint: &FieldConstraint,
    ops: &Ops,
    s: &str,
    violations: &mut Vec<Violation>,
) {
    let chars = s.chars().count();
    let bytes = s.len();

    if let Some(regex) = &ops.pattern {
        if !regex.is_match(s) {
            violations.push(violation(
                constraint,
                "pattern",
                &format!("value does not match pattern {}", regex.as_str()),
            ));
        }
    }
    if let Some(min) = ops.get("min_len").and_then(as_usize) {
        if chars < min {
            violations.push(violation(
                constraint,
                "min_len",
                &format!("length {chars} is less than {min}"),
            ));
        }
    }
    if let Some(max) = ops.get("max_len").and_then(as_usize) {
        if chars > max {
            violations.push(violation(
                constraint,
                "max_len",
                &format!("length {chars} exceeds {max}"),
            ));
        }
    }
    if let Some(min) = ops.get("min_bytes").and_then(as_usize) {
        if bytes < min {
            violations.push(violation(
                constraint,
                "min_bytes",
                &format!("byte length {bytes} is less than {min}"),
            ));
        }
    }
    if let Some(max) = ops.get("max_bytes").and_then(as_usize) {
        if bytes > max {
            violations.push(violation(
                constraint,
                "max_bytes",
                &format!("byte length {bytes} exceeds {max}"),
            ));
        }
    }
    if let Some(prefix) = ops.get("prefix").and_then(Value::as_str) {
        if !s.starts_with(prefix) {
            violations.push(violation(
                constraint,
                "prefix",
                &format!("value does not start with '{prefix}'"),
            ));
        }
    }
    if let Some(suffix) = ops.get("suffix").and_then(Value::as_str) {
        if !s.ends_with(suffix) {
            violations.push(violation(
                constraint,
                "suffix",
                &format!("value does not end with '{suffix}'"),
            ));
        }
    }
    if let Some(needle) = ops.get("contains").and_then(Value::as_str) {
        if !s.contains(needle) {
            violations.push(violation(
                constraint,
                "contains",
                &format!("value does not contain '{needle}'"),
            ));
        }
    }
    if let Some(needle) = ops.get("not_contains").and_then(Value::as_str) {
        if s.contains(needle) {
            violations.push(violation(
                constraint,
                "not_contains",
                &format!("value must not contain '{needle}'"),
            ));
        }
    }
    check_membership(constraint, ops, &Value::String(s.to_string()), violations);

    for (op, regex) in [
        ("email", &*EMAIL_RE),
        ("uuid", &*UUID_RE),
        ("hostname", &*HOSTNAME_RE),
        ("uri", &*URI_RE),
    ] {
        if ops.get(op).is_some() && !regex.is_match(s) {
            violations.push(violation(constraint, op, &format!("value is not a valid {op}")));
        }
    }
    if ops.get("hostname").is_some() && s.len() > 253 {
        violations.push(violation(constraint, "hostname", "hostname exceeds 253 bytes"));
    }
    if ops.get("ipv4").is_some() && s.parse::<std::net::Ipv4Addr>().is_err() {
        violations.push(violation(constraint, "ipv4", "value is not a valid ipv4 address"));
    }
    if ops.get("ipv6").is_some() && s.parse::<std::net::Ipv6Addr>().is_err() {
        violations.push(violation(constraint, "ipv6", "value is not a valid ipv6 address"));
    }
}

// -- Numeric rules ------------------------------------------------------------

fn check_number(
    constraint: &FieldConstraint,
    ops: &Ops,
    value: &Value,
    violations: &mut Vec<Violation>,
) {
    let has_numeric_op = ["const", "gt", "gte", "lt", "lte"]
        .iter()
        .any(|op| ops.get(op).is_some());
    if !has_numeric_op {
        return;
    }
    let Some(n) = coerce_number(value) else {
        violations.push(violation(constraint, "type", "value is not numeric"));
        return;
    };

    if let Some(expected) = ops.get("const").and_then(coerce_number_ref) {
        if n != expected {
            violations.push(violation(
                constraint,
                "const",
                &format!("value {n} is not the constant {expected}"),
            ));
        }
    }
    for (op, check) in [
        ("gt", (|a: f64, b: f64| a > b) as fn(f64, f64) -> bool),
        ("gte", |a, b| a >= b),
        ("lt", |a, b| a < b),
        ("lte", |a, b| a <= b),
    ] {
        if let Some(bound) = ops.get(op).and_then(coerce_number_ref) {
            if !check(n, bound) {
                violations.push(violation(
                    constraint,
                    op,
                    &format!("value {n} fails {op} {bound}"),
                ));
            }
        }
    }
    check_membership(constraint, ops, value, violations);
}

fn coerce_number_ref(value: &Value) -> Option<f64> {
    coerce_number(value)
}

fn check_membership(
    constraint: &FieldConstraint,
    ops: &Ops,
    value: &Value,
    violations: &mut Vec<Violation>,
) {
    if let Some(Value::Array(allowed)) = ops.get("in") {
        if !allowed
            .iter()
            .any(|candidate| string_form(candidate) == string_form(value))
        {
            violations.push(violation(constraint, "in", "value is not in the allowed set"));
        }
    }
    if let Some(Value::Array(denied)) = ops.get("not_in") {
        if denied
            .iter()
            .any(|candidate| string_form(candidate) == string_form(value))
        {
            violations.push(violation(constraint, "not_in", "value is in the denied set"));
        }
    }
}

// -- Enum rules ---------------------------------------------------------------

fn check_enum_string(constraint: &FieldConstraint, name: &str, violations: &mut Vec<Violation>) {
    if constraint.enum_names.is_empty() {
        return;
    }
    if constraint.ops.get("defined_only").is_some() && !constraint.enum_names.contains_key(name) {
        violations.push(violation(
            constraint,
            "defined_only",
            &format!("'{name}' is not a defined enum value"),
        ));
    }
    // in/not_in on enums are authored as numbers; translate the name.
    if let Some(number) = constraint.enum_names.get(name) {
        check_membership(constraint, &constraint.ops, &Value::from(*number), violations);
    }
}

fn check_enum_number(constraint: &FieldConstraint, value: &Value, violations: &mut Vec<Violation>) {
    if constraint.enum_names.is_empty() {
        return;
    }
    if constraint.ops.get("defined_only").is_some() {
        let known = value
            .as_i64()
            .is_some_and(|n| constraint.enum_names.values().any(|v| *v == n));
        if !known {
            violations.push(violation(
                constraint,
                "defined_only",
                &format!("{value} is not a defined enum value"),
            ));
        }
    }
}

// -- Repeated rules -----------------------------------------------------------

fn check_repeated(
    constraint: &FieldConstraint,
    items: &[Value],
    violations: &mut Vec<Violation>,
) {
    let ops = &constraint.ops;
    if let Some(min) = ops.get("min_items").and_then(as_usize) {
        if items.len() < min {
            violations.push(violation(
                constraint,
                "min_items",
                &format!("{} items is fewer than {min}", items.len()),
            ));
        }
    }
    if let Some(max) = ops.get("max_items").and_then(as_usize) {
        if items.len() > max {
            violations.push(violation(
                constraint,
                "max_items",
                &format!("{} items exceeds {max}", items.len()),
            ));
        }
    }
    if ops.get("unique").is_some() {
        let mut seen = std::collections::HashSet::new();
        for item in items {
            if !seen.insert(string_form(item)) {
                violations.push(violation(constraint, "unique", "items are not unique"));
                break;
            }
        }
    }
    if let Some(item_ops) = &ops.items {
        for (idx, item) in items.iter().enumerate() {
            let mut item_violations = Vec::new();
            match item {
                Value::String(s) => check_string(constraint, item_ops, s, &mut item_violations),
                Value::Number(_) => {
                    check_number(constraint, item_ops, item, &mut item_violations)
                }
                _ => {}
            }
            for mut v in item_violations {
                v.field = format!("{}[{idx}]", constraint.field);
                violations.push(v);
            }
        }
    }
}

fn as_usize(value: &Value) -> Option<usize> {
    coerce_number(value).and_then(|n| {
        if n >= 0.0 && n.fract() == 0.0 {
            Some(n as usize)
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ValidationSource;
    use crate::validation::ir::{extract_field_from_blob, MessageIr};
    use serde_json::json;

    fn string_constraint(rules: Value) -> FieldConstraint {
        extract_field_from_blob("name", &json!({"string": rules}), ValidationSource::Auto)
            .expect("constraint")
    }

    fn ir_with(fields: Vec<FieldConstraint>) -> MessageIr {
        MessageIr {
            type_name: "test.Sample".to_string(),
            fields,
            message_cel: Vec::new(),
            errors: Vec::new(),
        }
    }

    #[test]
    fn ok_iff_no_violations() {
        let ir = ir_with(vec![string_constraint(json!({"min_len": 2}))]);
        let good = validate_value(&ir, &json!({"name": "hello"}), false);
        assert!(good.ok());
        assert!(good.violations.is_empty());

        let bad = validate_value(&ir, &json!({"name": "h"}), false);
        assert!(!bad.ok());
        assert_eq!(bad.violations.len(), 1);
        assert_eq!(bad.violations[0].field, "name");
        assert_eq!(bad.violations[0].rule, "min_len");
    }

    #[test]
    fn all_violations_are_collected() {
        let ir = ir_with(vec![string_constraint(
            json!({"min_len": 5, "prefix": "ab", "contains": "zz"}),
        )]);
        let outcome = validate_value(&ir, &json!({"name": "xy"}), false);
        let rules: Vec<&str> = outcome
            .violations
            .iter()
            .map(|v| v.rule.as_str())
            .collect();
        assert_eq!(rules.len(), 3);
        assert!(rules.contains(&"min_len"));
        assert!(rules.contains(&"prefix"));
        assert!(rules.contains(&"contains"));
    }

    #[test]
    fn ignore_empty_skips_zero_values() {
        let ir = ir_with(vec![string_constraint(
            json!({"min_len": 5, "ignore_empty": true}),
        )]);
        assert!(validate_value(&ir, &json!({"name": ""}), false).ok());
        assert!(!validate_value(&ir, &json!({"name": "ab"}), false).ok());
    }

    #[test]
    fn well_known_string_predicates() {
        let email = ir_with(vec![string_constraint(json!({"email": true}))]);
        assert!(validate_value(&email, &json!({"name": "a@b.com"}), false).ok());
        assert!(!validate_value(&email, &json!({"name": "nope"}), false).ok());

        let uuid = ir_with(vec![string_constraint(json!({"uuid": true}))]);
        assert!(validate_value(
            &uuid,
            &json!({"name": "550e8400-e29b-41d4-a716-446655440000"}),
            false
        )
        .ok());
        assert!(!validate_value(&uuid, &json!({"name": "xyz"}), false).ok());

        let ipv4 = ir_with(vec![string_constraint(json!({"ipv4": true}))]);
        assert!(validate_value(&ipv4, &json!({"name": "10.0.0.1"}), false).ok());
        assert!(!validate_value(&ipv4, &json!({"name": "999.0.0.1"}), false).ok());
    }

    #[test]
    fn numeric_bounds() {
        let constraint = extract_field_from_blob(
            "age",
            &json!({"int32": {"gt": 0, "lte": 130}}),
            ValidationSource::Auto,
        )
        .unwrap();
        let ir = ir_with(vec![constraint]);
        assert!(validate_value(&ir, &json!({"age": 30}), false).ok());
        assert!(!validate_value(&ir, &json!({"age": 0}), false).ok());
        assert!(!validate_value(&ir, &json!({"age": 200}), false).ok());
        // 64-bit values decode as strings; coercion still applies.
        assert!(validate_value(&ir, &json!({"age": "25"}), false).ok());
    }

    #[test]
    fn repeated_rules_with_items() {
        let constraint = extract_field_from_blob(
            "tags",
            &json!({"repeated": {
                "min_items": 1,
                "unique": true,
                "items": {"string": {"min_len": 2}}
            }}),
            ValidationSource::Auto,
        )
        .unwrap();
        let ir = ir_with(vec![constraint]);

        assert!(validate_value(&ir, &json!({"tags": ["ab", "cd"]}), false).ok());

        let dup = validate_value(&ir, &json!({"tags": ["ab", "ab"]}), false);
        assert_eq!(dup.violations[0].rule, "unique");

        let short = validate_value(&ir, &json!({"tags": ["ab", "x"]}), false);
        assert_eq!(short.violations[0].field, "tags[1]");
        assert_eq!(short.violations[0].rule, "min_len");

        let empty = validate_value(&ir, &json!({"tags": []}), false);
        assert_eq!(empty.violations[0].rule, "min_items");
    }

    #[test]
    fn field_cel_rules() {
        let constraint = extract_field_from_blob(
            "age",
            &json!({"cel": [{"expression": "this >= 18", "message": "must be an adult"}]}),
            ValidationSource::Auto,
        )
        .unwrap();
        let ir = ir_with(vec![constraint]);

        assert!(validate_value(&ir, &json!({"age": 21}), false).ok());
        let outcome = validate_value(&ir, &json!({"age": 10}), false);
        assert_eq!(outcome.violations[0].rule, "cel");
        assert_eq!(outcome.violations[0].description, "must be an adult");
    }

    #[test]
    fn undefined_cel_identifier_counts_as_violation() {
        let constraint = extract_field_from_blob(
            "age",
            &json!({"cel": [{"expression": "age >= other_field"}]}),
            ValidationSource::Auto,
        )
        .unwrap();
        let ir = ir_with(vec![constraint]);
        let outcome = validate_value(&ir, &json!({"age": 10}), false);
        assert!(!outcome.ok());
        assert_eq!(outcome.violations[0].rule, "cel");
    }

    #[test]
    fn required_fields() {
        let constraint = extract_field_from_blob(
            "name",
            &json!({"required": true}),
            ValidationSource::Auto,
        )
        .unwrap();
        let ir = ir_with(vec![constraint]);
        assert!(!validate_value(&ir, &json!({}), false).ok());
        assert!(!validate_value(&ir, &json!({"name": ""}), false).ok());
        assert!(validate_value(&ir, &json!({"name": "x"}), false).ok());
    }
}
