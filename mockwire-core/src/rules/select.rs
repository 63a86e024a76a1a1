//! Response selection: gate evaluation, candidate filtering, priority pick.

use std::collections::BTreeMap;

use serde_json::Value;

use super::{MatchGate, Matcher, ResponseOption, RuleDoc};

/// Resolve a dotted path against the decoded request and the normalized
/// (lower-cased) metadata.
///
/// `request.a.b` indexes into the request tree, `metadata.k` reads header
/// `k`, and bare paths traverse a `{request, metadata}` composite. Numeric
/// segments index into arrays, so aggregated paths like `items.0.name`
/// resolve too.
pub fn resolve_path(
    path: &str,
    request: &Value,
    metadata: &BTreeMap<String, String>,
) -> Option<Value> {
    let mut segments = path.split('.');
    let first = segments.next()?;
    let rest: Vec<&str> = segments.collect();

    match first {
        "request" => traverse(request, &rest),
        "metadata" => {
            if rest.is_empty() {
                return None;
            }
            // Header names may themselves contain dots, so rejoin.
            let header = rest.join(".").to_lowercase();
            metadata.get(&header).map(|v| Value::String(v.clone()))
        }
        _ => {
            // Bare path: traverse {request, metadata} from the top.
            let composite = Value::Object(
                [
                    ("request".to_string(), request.clone()),
                    (
                        "metadata".to_string(),
                        Value::Object(
                            metadata
                                .iter()
                                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                                .collect(),
                        ),
                    ),
                ]
                .into_iter()
                .collect(),
            );
            let mut all = vec![first];
            all.extend(rest);
            traverse(&composite, &all)
        }
    }
}

fn traverse(root: &Value, segments: &[&str]) -> Option<Value> {
    let mut current = root;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(*segment)?,
            Value::Array(items) => {
                let idx: usize = segment.parse().ok()?;
                items.get(idx)?
            }
            _ => return None,
        };
    }
    Some(current.clone())
}

fn conditions_hold(
    conditions: &[(String, Matcher)],
    request: &Value,
    metadata: &BTreeMap<String, String>,
) -> bool {
    conditions.iter().all(|(path, matcher)| {
        let value = resolve_path(path, request, metadata);
        matcher.matches(value.as_ref())
    })
}

/// Evaluate the top-level gate: request conditions resolve against the
/// request tree, metadata conditions against the headers. All AND.
pub fn gate_passes(
    gate: &MatchGate,
    request: &Value,
    metadata: &BTreeMap<String, String>,
) -> bool {
    let request_ok = gate.request.iter().all(|(path, matcher)| {
        let value = traverse(request, &path.split('.').collect::<Vec<_>>());
        matcher.matches(value.as_ref())
    });
    if !request_ok {
        return false;
    }
    gate.metadata.iter().all(|(header, matcher)| {
        let value = metadata.get(header).map(|v| Value::String(v.clone()));
        matcher.matches(value.as_ref())
    })
}

/// Pick the response option for a request.
///
/// Candidates are the options whose `when` conditions all hold (or the
/// fallback set when the gate fails or nothing matched). The winner is the
/// highest priority; ties go to the earliest declared.
pub fn select<'a>(
    doc: &'a RuleDoc,
    request: &Value,
    metadata: &BTreeMap<String, String>,
) -> Option<&'a ResponseOption> {
    let gate_ok = doc
        .gate
        .as_ref()
        .map(|gate| gate_passes(gate, request, metadata))
        .unwrap_or(true);

    let matched: Vec<&ResponseOption> = if gate_ok {
        doc.responses
            .iter()
            .filter(|option| conditions_hold(&option.when, request, metadata))
            .collect()
    } else {
        Vec::new()
    };

    let candidates = if matched.is_empty() {
        // Fallback set: options with no `when` at all.
        doc.responses
            .iter()
            .filter(|option| option.when.is_empty())
            .collect()
    } else {
        matched
    };

    // Highest priority wins; max_by_key keeps the LAST max, so iterate in
    // reverse to make the earliest declared win ties.
    candidates
        .into_iter()
        .rev()
        .max_by_key(|option| option.priority)
}
