//! Extraction of validation constraints into an intermediate representation.
//!
//! The schema loader preserves field option blobs as opaque trees; this
//! module walks them looking for PGV (`(validate.rules)`) and protovalidate
//! (`(buf.validate.field)` / `(buf.validate.message)`) annotations and
//! produces at most one `FieldConstraint` per field, pre-parsed (regexes
//! compiled, CEL expressions parsed) so request-time evaluation does no
//! re-interpretation.

use std::collections::BTreeMap;

use base64::Engine as _;
use prost_reflect::{FieldDescriptor, MessageDescriptor};
use regex::Regex;
use serde_json::{json, Value};
use tracing::debug;

use crate::config::ValidationSource;
use crate::validation::cel::CelExpr;

/// Which annotation family a constraint came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintSource {
    Pgv,
    Protovalidate,
}

/// Constraint kind, chosen by field type and cardinality.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintKind {
    String,
    Number,
    Repeated,
    Enum,
    Presence,
    Cel,
}

impl ConstraintKind {
    /// Metrics bucket label.
    pub fn label(&self) -> &'static str {
        match self {
            ConstraintKind::String => "string",
            ConstraintKind::Number => "number",
            ConstraintKind::Repeated => "repeated",
            ConstraintKind::Enum => "enum",
            ConstraintKind::Presence => "presence",
            ConstraintKind::Cel => "cel",
        }
    }
}

/// A parsed CEL constraint attached to a field or message.
#[derive(Debug, Clone)]
pub struct CelRule {
    pub expr: CelExpr,
    pub source_text: String,
    pub message: Option<String>,
}

/// The recognized operations for one field, as a bag keyed by canonical op
/// name plus pre-compiled artifacts.
#[derive(Debug, Clone, Default)]
pub struct Ops {
    /// Canonical op name -> parameter (e.g. `min_len` -> 5, `in` -> [...]).
    pub map: BTreeMap<String, Value>,
    /// Compiled `pattern`, when present and valid.
    pub pattern: Option<Regex>,
    /// Element rules for repeated fields (`items.*`).
    pub items: Option<Box<Ops>>,
    /// Field-level CEL expressions.
    pub cel: Vec<CelRule>,
    /// Skip the whole constraint when the field holds its zero value.
    pub ignore_empty: bool,
    /// Constraints that failed to compile (invalid regex, unparseable
    /// CEL). A type carrying any of these is served as an engine error
    /// rather than silently under-validating.
    pub invalid: Vec<String>,
}

impl Ops {
    pub fn is_empty(&self) -> bool {
        self.map.is_empty() && self.cel.is_empty() && self.items.is_none() && self.invalid.is_empty()
    }

    pub fn get(&self, op: &str) -> Option<&Value> {
        self.map.get(op)
    }
}

/// One extracted constraint: at most one per field.
#[derive(Debug, Clone)]
pub struct FieldConstraint {
    /// Field name, as addressed in decoded messages.
    pub field: String,
    pub kind: ConstraintKind,
    pub source: ConstraintSource,
    pub ops: Ops,
    /// Known enum values, captured for `defined_only` checks.
    pub enum_names: BTreeMap<String, i64>,
}

/// Extracted IR for one message type: field constraints in declaration
/// order, message-level CEL rules, and any constraints that failed to
/// compile.
#[derive(Debug, Clone)]
pub struct MessageIr {
    pub type_name: String,
    pub fields: Vec<FieldConstraint>,
    pub message_cel: Vec<CelRule>,
    /// Build errors: the annotations existed but could not be compiled.
    pub errors: Vec<String>,
}

impl MessageIr {
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.message_cel.is_empty() && self.errors.is_empty()
    }

    /// Whether the type has constraints that can actually run.
    pub fn has_evaluable_constraints(&self) -> bool {
        !self.fields.is_empty() || !self.message_cel.is_empty()
    }
}

// -- Option blob access -------------------------------------------------------

/// The raw option blobs of a field, keyed by extension name (e.g.
/// `(validate.rules)`), each holding the nested JSON form of the extension
/// message.
pub fn field_option_blobs(field: &FieldDescriptor) -> BTreeMap<String, Value> {
    let options = field.options();
    let mut blobs = BTreeMap::new();
    for (ext, value) in options.extensions() {
        blobs.insert(
            format!("({})", ext.full_name()),
            reflect_to_json(&value),
        );
    }
    blobs
}

fn message_option_blobs(message: &MessageDescriptor) -> BTreeMap<String, Value> {
    let options = message.options();
    let mut blobs = BTreeMap::new();
    for (ext, value) in options.extensions() {
        blobs.insert(
            format!("({})", ext.full_name()),
            reflect_to_json(&value),
        );
    }
    blobs
}

/// Flatten a nested option tree into `path -> scalar` entries, e.g.
/// `(validate.rules).string.min_len -> 5`. Both this and the nested form in
/// `field_option_blobs` describe the same data; extraction consumes the
/// nested form.
pub fn flatten_blob(prefix: &str, tree: &Value, out: &mut BTreeMap<String, Value>) {
    match tree {
        Value::Object(map) => {
            for (key, value) in map {
                flatten_blob(&format!("{prefix}.{key}"), value, out);
            }
        }
        Value::Array(items) => {
            for (idx, value) in items.iter().enumerate() {
                flatten_blob(&format!("{prefix}.{idx}"), value, out);
            }
        }
        scalar => {
            out.insert(prefix.to_string(), scalar.clone());
        }
    }
}

fn reflect_to_json(value: &prost_reflect::Value) -> Value {
    use prost_reflect::Value as V;
    match value {
        V::Bool(b) => json!(b),
        V::I32(n) => json!(n),
        V::I64(n) => json!(n),
        V::U32(n) => json!(n),
        V::U64(n) => json!(n),
        V::F32(f) => json!(f),
        V::F64(f) => json!(f),
        V::String(s) => json!(s),
        V::Bytes(b) => json!(base64::engine::general_purpose::STANDARD.encode(b)),
        V::EnumNumber(n) => json!(n),
        V::Message(msg) => {
            let options = prost_reflect::SerializeOptions::new()
                .use_proto_field_name(true)
                .skip_default_fields(true);
            msg.serialize_with_options(serde_json::value::Serializer, &options)
                .unwrap_or(Value::Null)
        }
        V::List(items) => Value::Array(items.iter().map(reflect_to_json).collect()),
        V::Map(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (map_key_string(k), reflect_to_json(v)))
                .collect(),
        ),
    }
}

fn map_key_string(key: &prost_reflect::MapKey) -> String {
    use prost_reflect::MapKey as K;
    match key {
        K::Bool(b) => b.to_string(),
        K::I32(n) => n.to_string(),
        K::I64(n) => n.to_string(),
        K::U32(n) => n.to_string(),
        K::U64(n) => n.to_string(),
        K::String(s) => s.clone(),
    }
}

// -- Extraction ---------------------------------------------------------------

/// Extract the IR for one message type. Returns `None` when no field or
/// message carries a recognized constraint.
pub fn extract_message(
    message: &MessageDescriptor,
    source_filter: ValidationSource,
) -> Option<MessageIr> {
    let mut ir = MessageIr {
        type_name: message.full_name().to_string(),
        fields: Vec::new(),
        message_cel: Vec::new(),
        errors: Vec::new(),
    };

    for field in message.fields() {
        let blobs = field_option_blobs(&field);
        if let Some(constraint) = extract_field(&field, &blobs, source_filter) {
            for err in &constraint.ops.invalid {
                ir.errors.push(format!("{}: {err}", constraint.field));
            }
            if let Some(items) = &constraint.ops.items {
                for err in &items.invalid {
                    ir.errors.push(format!("{}.items: {err}", constraint.field));
                }
            }
            ir.fields.push(constraint);
        }
    }

    // Message-level CEL comes only from protovalidate.
    if source_filter != ValidationSource::Pgv {
        let blobs = message_option_blobs(message);
        if let Some(tree) = blobs.get("(buf.validate.message)") {
            let mut invalid = Vec::new();
            ir.message_cel = parse_cel_list(tree.get("cel"), &mut invalid);
            ir.errors.extend(invalid);
        }
    }

    if ir.is_empty() {
        None
    } else {
        debug!(
            type_name = %ir.type_name,
            fields = ir.fields.len(),
            "extracted validation constraints"
        );
        Some(ir)
    }
}

/// Extract the constraint for one field from its option blobs. PGV and
/// protovalidate trees are merged when `source_filter` is `Auto`, with the
/// source recorded as whichever contributed (protovalidate wins the label
/// when both do).
pub fn extract_field(
    field: &FieldDescriptor,
    blobs: &BTreeMap<String, Value>,
    source_filter: ValidationSource,
) -> Option<FieldConstraint> {
    let mut ops = Ops::default();
    let mut source = None;

    if source_filter != ValidationSource::Protovalidate {
        if let Some(tree) = blobs.get("(validate.rules)") {
            collect_ops(tree, &mut ops);
            source = Some(ConstraintSource::Pgv);
        }
    }
    if source_filter != ValidationSource::Pgv {
        if let Some(tree) = blobs.get("(buf.validate.field)") {
            collect_ops(tree, &mut ops);
            source = Some(ConstraintSource::Protovalidate);
        }
    }

    let source = source?;
    if ops.is_empty() {
        return None;
    }

    let kind = kind_for(field, &ops);
    let enum_names = match field.kind() {
        prost_reflect::Kind::Enum(e) => e
            .values()
            .map(|v| (v.name().to_string(), i64::from(v.number())))
            .collect(),
        _ => BTreeMap::new(),
    };

    Some(FieldConstraint {
        field: field.name().to_string(),
        kind,
        source,
        ops,
        enum_names,
    })
}

/// Walk a rules tree (`StringRules`, `Int64Rules`, `RepeatedRules`, ... or
/// the whole `FieldConstraints`) collecting canonical ops.
fn collect_ops(tree: &Value, ops: &mut Ops) {
    let Some(obj) = tree.as_object() else { return };

    for (key, value) in obj {
        // protovalidate names its oneof members `string`, `int32`, ... but
        // authored rules sometimes appear with a `_val` suffix; normalize.
        let type_key = key.strip_suffix("_val").unwrap_or(key);
        match type_key {
            // Typed sub-rules: recurse into the rule group.
            "string" | "bytes" => collect_scalar_ops(value, ops),
            "int32" | "int64" | "uint32" | "uint64" | "sint32" | "sint64" | "fixed32"
            | "fixed64" | "sfixed32" | "sfixed64" | "double" | "float" => {
                collect_scalar_ops(value, ops)
            }
            "enum" => collect_scalar_ops(value, ops),
            "repeated" => collect_repeated_ops(value, ops),
            // PGV message rules hold `required`.
            "message" => {
                if value.get("required").and_then(Value::as_bool) == Some(true) {
                    ops.map.insert("required".to_string(), json!(true));
                }
            }
            "required" => {
                if value.as_bool() == Some(true) {
                    ops.map.insert("required".to_string(), json!(true));
                }
            }
            "cel" => {
                let mut invalid = Vec::new();
                let rules = parse_cel_list(Some(value), &mut invalid);
                ops.cel.extend(rules);
                ops.invalid.extend(invalid);
            }
            "ignore_empty" => {
                if value.as_bool() == Some(true) {
                    ops.ignore_empty = true;
                }
            }
            // protovalidate's `ignore` enum subsumes ignore_empty.
            "ignore" => {
                let text = crate::rules::matcher::string_form(value);
                if text.contains("UNPOPULATED") || text.contains("ZERO") {
                    ops.ignore_empty = true;
                }
            }
            _ => {}
        }
    }
}

const SCALAR_OPS: &[&str] = &[
    "pattern",
    "min_len",
    "max_len",
    "min_bytes",
    "max_bytes",
    "prefix",
    "suffix",
    "contains",
    "not_contains",
    "in",
    "not_in",
    "email",
    "uuid",
    "hostname",
    "ipv4",
    "ipv6",
    "uri",
    "const",
    "gt",
    "gte",
    "lt",
    "lte",
    "defined_only",
];

fn collect_scalar_ops(tree: &Value, ops: &mut Ops) {
    let Some(obj) = tree.as_object() else { return };
    for (key, value) in obj {
        if key == "ignore_empty" {
            if value.as_bool() == Some(true) {
                ops.ignore_empty = true;
            }
            continue;
        }
        if SCALAR_OPS.contains(&key.as_str()) {
            // Well-known predicates are booleans; skip explicit `false`.
            if matches!(
                key.as_str(),
                "email" | "uuid" | "hostname" | "ipv4" | "ipv6" | "uri" | "defined_only"
            ) && value.as_bool() != Some(true)
            {
                continue;
            }
            if key == "pattern" {
                if let Some(pattern) = value.as_str() {
                    match Regex::new(pattern) {
                        Ok(regex) => ops.pattern = Some(regex),
                        Err(err) => {
                            ops.invalid.push(format!("invalid pattern '{pattern}': {err}"));
                            continue;
                        }
                    }
                }
            }
            ops.map.insert(key.clone(), value.clone());
        }
    }
}

fn collect_repeated_ops(tree: &Value, ops: &mut Ops) {
    let Some(obj) = tree.as_object() else { return };
    for (key, value) in obj {
        match key.as_str() {
            "min_items" | "max_items" => {
                ops.map.insert(key.clone(), value.clone());
            }
            "unique" => {
                if value.as_bool() == Some(true) {
                    ops.map.insert(key.clone(), json!(true));
                }
            }
            "items" => {
                let mut item_ops = Ops::default();
                collect_ops(value, &mut item_ops);
                // `items` may also be a bare rule group rather than a typed
                // wrapper; try the scalar ops directly in that case.
                if item_ops.is_empty() {
                    collect_scalar_ops(value, &mut item_ops);
                }
                if !item_ops.is_empty() {
                    ops.items = Some(Box::new(item_ops));
                }
            }
            "ignore_empty" => {
                if value.as_bool() == Some(true) {
                    ops.ignore_empty = true;
                }
            }
            _ => {}
        }
    }
}

fn parse_cel_list(tree: Option<&Value>, invalid: &mut Vec<String>) -> Vec<CelRule> {
    let mut rules = Vec::new();
    let Some(tree) = tree else { return rules };
    let items: Vec<&Value> = match tree {
        Value::Array(items) => items.iter().collect(),
        single @ Value::Object(_) => vec![single],
        _ => return rules,
    };
    for item in items {
        let Some(expression) = item.get("expression").and_then(Value::as_str) else {
            continue;
        };
        match CelExpr::parse(expression) {
            Ok(expr) => rules.push(CelRule {
                expr,
                source_text: expression.to_string(),
                message: item
                    .get("message")
                    .and_then(Value::as_str)
                    .map(String::from),
            }),
            Err(err) => {
                debug!(expression, error = %err, "unparseable CEL expression");
                invalid.push(format!("invalid CEL expression '{expression}': {err}"));
            }
        }
    }
    rules
}

/// Build a constraint directly from a rules tree, without a descriptor.
///
/// Used where the schema side is not available (tests, pre-flattened
/// blobs); kind is inferred from the recognized ops instead of the field
/// type.
pub fn extract_field_from_blob(
    field_name: &str,
    tree: &Value,
    source_filter: ValidationSource,
) -> Option<FieldConstraint> {
    let mut ops = Ops::default();
    collect_ops(tree, &mut ops);
    if ops.is_empty() {
        return None;
    }
    let kind = kind_from_ops(&ops);
    Some(FieldConstraint {
        field: field_name.to_string(),
        kind,
        source: if source_filter == ValidationSource::Pgv {
            ConstraintSource::Pgv
        } else {
            ConstraintSource::Protovalidate
        },
        ops,
        enum_names: BTreeMap::new(),
    })
}

fn kind_from_ops(ops: &Ops) -> ConstraintKind {
    if ops.map.is_empty() && ops.items.is_none() && !ops.cel.is_empty() {
        return ConstraintKind::Cel;
    }
    if ops.items.is_some()
        || ["min_items", "max_items", "unique"]
            .iter()
            .any(|op| ops.get(op).is_some())
    {
        return ConstraintKind::Repeated;
    }
    if ops.get("defined_only").is_some() {
        return ConstraintKind::Enum;
    }
    if ops.pattern.is_some()
        || [
            "min_len",
            "max_len",
            "min_bytes",
            "max_bytes",
            "prefix",
            "suffix",
            "contains",
            "not_contains",
            "email",
            "uuid",
            "hostname",
            "ipv4",
            "ipv6",
            "uri",
        ]
        .iter()
        .any(|op| ops.get(op).is_some())
    {
        return ConstraintKind::String;
    }
    if ["const", "gt", "gte", "lt", "lte"]
        .iter()
        .any(|op| ops.get(op).is_some())
    {
        return ConstraintKind::Number;
    }
    if ops.get("required").is_some() {
        return ConstraintKind::Presence;
    }
    ConstraintKind::Cel
}

/// Kind selection by field type and cardinality. A constraint whose only
/// content is CEL expressions is `cel`; a message field can only carry
/// `presence`.
fn kind_for(field: &FieldDescriptor, ops: &Ops) -> ConstraintKind {
    if ops.map.is_empty() && ops.items.is_none() && !ops.cel.is_empty() {
        return ConstraintKind::Cel;
    }
    if field.is_list() {
        return ConstraintKind::Repeated;
    }
    match field.kind() {
        prost_reflect::Kind::String | prost_reflect::Kind::Bytes => ConstraintKind::String,
        prost_reflect::Kind::Enum(_) => ConstraintKind::Enum,
        prost_reflect::Kind::Message(_) => ConstraintKind::Presence,
        prost_reflect::Kind::Bool => ConstraintKind::Presence,
        _ => ConstraintKind::Number,
    }
}
