//! Rule documents: the per-method mock behavior descriptions.
//!
//! One file per method under the rule directory, named
//! `<package.service.method>.{yaml,json}`. Files parse once at load into
//! fully typed documents (matchers included), so request-time evaluation
//! never re-interprets raw JSON shapes.

pub mod matcher;
pub mod select;

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

pub use matcher::Matcher;

/// Default inter-item delay for streamed responses, in milliseconds.
pub const DEFAULT_STREAM_DELAY_MS: u64 = 100;

/// A parsed rule document for one method.
#[derive(Debug, Clone, Default)]
pub struct RuleDoc {
    /// Optional top-level gate. When it fails, only fallback responses
    /// (those without `when`) are candidates.
    pub gate: Option<MatchGate>,
    pub responses: Vec<ResponseOption>,
    /// Unknown top-level keys, preserved as parsed.
    pub extra: BTreeMap<String, Value>,
}

/// The top-level `match` section: request-field and metadata conditions,
/// all AND-joined.
#[derive(Debug, Clone, Default)]
pub struct MatchGate {
    pub request: Vec<(String, Matcher)>,
    pub metadata: Vec<(String, Matcher)>,
}

/// One candidate response for selection.
#[derive(Debug, Clone)]
pub struct ResponseOption {
    /// Dotted path -> matcher, AND-joined. Empty means fallback.
    pub when: Vec<(String, Matcher)>,
    pub body: Option<Value>,
    pub stream_items: Option<Vec<Value>>,
    pub stream_delay_ms: u64,
    pub delay_ms: u64,
    pub stream_loop: bool,
    pub stream_random_order: bool,
    pub trailers: BTreeMap<String, Value>,
    pub priority: i64,
}

impl Default for ResponseOption {
    fn default() -> Self {
        ResponseOption {
            when: Vec::new(),
            body: None,
            stream_items: None,
            stream_delay_ms: DEFAULT_STREAM_DELAY_MS,
            delay_ms: 0,
            stream_loop: false,
            stream_random_order: false,
            trailers: BTreeMap::new(),
            priority: 0,
        }
    }
}

impl ResponseOption {
    /// The numeric `grpc-status` trailer, if authored.
    pub fn grpc_status(&self) -> Option<i64> {
        self.trailers.get("grpc-status").and_then(scalar_to_i64)
    }

    /// The `grpc-message` trailer as a string, if authored.
    pub fn grpc_message(&self) -> Option<String> {
        self.trailers
            .get("grpc-message")
            .map(matcher::string_form)
    }

    /// Trailers with the two reserved error-driving keys removed.
    pub fn user_trailers(&self) -> BTreeMap<String, String> {
        self.trailers
            .iter()
            .filter(|(k, _)| k.as_str() != "grpc-status" && k.as_str() != "grpc-message")
            .map(|(k, v)| (k.clone(), matcher::string_form(v)))
            .collect()
    }
}

fn scalar_to_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

impl RuleDoc {
    /// Build a document from a parsed YAML/JSON tree.
    pub fn from_value(root: &Value) -> Result<RuleDoc, String> {
        let obj = root
            .as_object()
            .ok_or_else(|| "rule document must be a mapping".to_string())?;

        let mut doc = RuleDoc::default();

        for (key, value) in obj {
            match key.as_str() {
                "match" => doc.gate = Some(parse_gate(value)?),
                "responses" => {
                    let list = value
                        .as_array()
                        .ok_or_else(|| "'responses' must be a sequence".to_string())?;
                    for (idx, item) in list.iter().enumerate() {
                        let option = parse_response(item)
                            .map_err(|e| format!("responses[{idx}]: {e}"))?;
                        doc.responses.push(option);
                    }
                }
                other => {
                    doc.extra.insert(other.to_string(), value.clone());
                }
            }
        }

        Ok(doc)
    }
}

fn parse_gate(value: &Value) -> Result<MatchGate, String> {
    let obj = value
        .as_object()
        .ok_or_else(|| "'match' must be a mapping".to_string())?;
    let mut gate = MatchGate::default();
    if let Some(request) = obj.get("request") {
        gate.request = parse_condition_map(request, "match.request")?;
    }
    if let Some(metadata) = obj.get("metadata") {
        gate.metadata = parse_condition_map(metadata, "match.metadata")?
            .into_iter()
            .map(|(header, matcher)| (header.to_lowercase(), matcher))
            .collect();
    }
    Ok(gate)
}

fn parse_condition_map(value: &Value, context: &str) -> Result<Vec<(String, Matcher)>, String> {
    let obj = value
        .as_object()
        .ok_or_else(|| format!("'{context}' must be a mapping"))?;
    let mut conditions = Vec::with_capacity(obj.len());
    for (path, raw) in obj {
        let matcher =
            Matcher::parse(raw).map_err(|e| format!("{context}.{path}: {e}"))?;
        conditions.push((path.clone(), matcher));
    }
    Ok(conditions)
}

/// Parse one `responses` entry. Unknown keys are ignored.
fn parse_response(value: &Value) -> Result<ResponseOption, String> {
    let obj = value
        .as_object()
        .ok_or_else(|| "response option must be a mapping".to_string())?;

    let mut option = ResponseOption::default();

    if let Some(when) = obj.get("when") {
        option.when = parse_condition_map(when, "when")?;
    }
    option.body = obj.get("body").cloned();
    if let Some(items) = obj.get("stream_items") {
        let list = items
            .as_array()
            .ok_or_else(|| "'stream_items' must be a sequence".to_string())?;
        option.stream_items = Some(list.clone());
    }
    if let Some(delay) = obj.get("stream_delay_ms") {
        option.stream_delay_ms = scalar_to_i64(delay).map(|n| n.max(0) as u64).unwrap_or(
            DEFAULT_STREAM_DELAY_MS,
        );
    }
    if let Some(delay) = obj.get("delay_ms") {
        option.delay_ms = scalar_to_i64(delay).map(|n| n.max(0) as u64).unwrap_or(0);
    }
    option.stream_loop = obj
        .get("stream_loop")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    option.stream_random_order = obj
        .get("stream_random_order")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if let Some(trailers) = obj.get("trailers") {
        let map = trailers
            .as_object()
            .ok_or_else(|| "'trailers' must be a mapping of scalars".to_string())?;
        for (k, v) in map {
            if !matches!(v, Value::String(_) | Value::Number(_) | Value::Bool(_)) {
                return Err(format!("trailer '{k}' must be a scalar"));
            }
            option.trailers.insert(k.clone(), v.clone());
        }
    }
    // Missing or non-numeric priority counts as 0.
    option.priority = obj.get("priority").and_then(scalar_to_i64).unwrap_or(0);

    Ok(option)
}

/// One rule file that failed to load, surfaced in the status report.
#[derive(Debug, Clone, Serialize)]
pub struct RuleLoadError {
    pub file: String,
    pub error: String,
}

/// The immutable-per-reload rule index: lower-cased rule key -> document.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: BTreeMap<String, RuleDoc>,
    errors: Vec<RuleLoadError>,
}

impl RuleSet {
    pub fn empty() -> Self {
        RuleSet::default()
    }

    pub fn get(&self, rule_key: &str) -> Option<&RuleDoc> {
        self.rules.get(rule_key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.rules.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn errors(&self) -> &[RuleLoadError] {
        &self.errors
    }
}

/// Load every rule file in `rule_dir`. The rule key is the file name minus
/// its extension, lower-cased. Invalid files are recorded and skipped;
/// duplicate keys reject the later file. A missing directory yields an
/// empty set.
pub fn load_dir(rule_dir: &Path) -> RuleSet {
    let mut set = RuleSet::default();

    let entries = match fs::read_dir(rule_dir) {
        Ok(entries) => entries,
        Err(err) => {
            debug!(dir = %rule_dir.display(), error = %err, "rule directory not readable");
            return set;
        }
    };

    let mut files: Vec<_> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file()
                && path
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| matches!(ext, "yaml" | "yml" | "json"))
        })
        .collect();
    files.sort();

    for path in files {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        match load_file(&path) {
            Ok((key, doc)) => {
                if set.rules.contains_key(&key) {
                    warn!(file = %file_name, key = %key, "duplicate rule key, file rejected");
                    set.errors.push(RuleLoadError {
                        file: file_name,
                        error: format!("duplicate rule key '{key}'"),
                    });
                } else {
                    debug!(file = %file_name, key = %key, "loaded rule");
                    set.rules.insert(key, doc);
                }
            }
            Err(err) => {
                warn!(file = %file_name, error = %err, "invalid rule file skipped");
                set.errors.push(RuleLoadError {
                    file: file_name,
                    error: err,
                });
            }
        }
    }

    set
}

fn load_file(path: &Path) -> Result<(String, RuleDoc), String> {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| "file name is not valid UTF-8".to_string())?;
    let key = stem.to_lowercase();

    let raw = fs::read_to_string(path).map_err(|e| format!("read failed: {e}"))?;

    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext == "json");
    let tree: Value = if is_json {
        serde_json::from_str(&raw).map_err(|e| format!("invalid JSON: {e}"))?
    } else {
        serde_yaml::from_str(&raw).map_err(|e| format!("invalid YAML: {e}"))?
    };

    let doc = RuleDoc::from_value(&tree)?;
    Ok((key, doc))
}
