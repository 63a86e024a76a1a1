//! Validation runtime: constraint extraction into IR at reload time,
//! evaluation against decoded messages at request time.

pub mod cel;
pub mod engine;
pub mod ir;

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

use crate::config::ValidationSettings;
use crate::schema::SchemaSet;

pub use engine::{Outcome, Violation};
pub use ir::MessageIr;

/// Validation coverage, reported by the status endpoint.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct Coverage {
    pub total_message_types: usize,
    pub validated_message_types: usize,
}

/// Outcome of asking the validator set about one inbound message.
///
/// The three cases map to the failure taxonomy: no constraints means skip,
/// a checked outcome with violations is INVALID_ARGUMENT at the handler
/// boundary, and an engine error (the type's annotations exist but could
/// not be compiled) is INTERNAL.
#[derive(Debug, Clone)]
pub enum ValidationCheck {
    /// The type carries no constraints; nothing ran.
    NoConstraints,
    /// Constraints ran; the outcome lists any violations.
    Checked(Outcome),
    /// The type's constraints could not be compiled at build time.
    EngineError(String),
}

/// All extracted message IRs for one schema generation.
///
/// Built once per reload and swapped atomically together with the schema
/// and rule sets; request handlers only read.
#[derive(Debug, Clone, Default)]
pub struct ValidatorSet {
    messages: BTreeMap<String, MessageIr>,
    /// Types whose annotations failed to compile; served as engine errors.
    broken: BTreeMap<String, String>,
    total_types: usize,
    cel_message_enabled: bool,
}

impl ValidatorSet {
    pub fn empty() -> Self {
        ValidatorSet::default()
    }

    /// Walk every message type in the schema and extract constraints.
    pub fn build(schema: &SchemaSet, settings: &ValidationSettings) -> Self {
        let mut messages = BTreeMap::new();
        let mut broken = BTreeMap::new();
        let mut total_types = 0;
        for message in schema.pool().all_messages() {
            total_types += 1;
            if let Some(ir) = ir::extract_message(&message, settings.source) {
                if !ir.errors.is_empty() {
                    broken.insert(ir.type_name.clone(), ir.errors.join("; "));
                }
                if ir.has_evaluable_constraints() {
                    messages.insert(ir.type_name.clone(), ir);
                }
            }
        }
        ValidatorSet {
            messages,
            broken,
            total_types,
            cel_message_enabled: settings.cel_message,
        }
    }

    /// The IR for a message type, if any of its fields carry constraints.
    pub fn validator_for(&self, type_name: &str) -> Option<&MessageIr> {
        self.messages.get(type_name)
    }

    /// Validate a decoded message. A broken validator wins over a partial
    /// run: under-validating silently would defeat the point of the
    /// annotations.
    pub fn validate(&self, type_name: &str, message: &Value) -> ValidationCheck {
        if let Some(error) = self.broken.get(type_name) {
            return ValidationCheck::EngineError(error.clone());
        }
        match self.validator_for(type_name) {
            Some(ir) => ValidationCheck::Checked(engine::validate_value(
                ir,
                message,
                self.cel_message_enabled,
            )),
            None => ValidationCheck::NoConstraints,
        }
    }

    pub fn coverage(&self) -> Coverage {
        Coverage {
            total_message_types: self.total_types,
            validated_message_types: self.messages.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ValidationMode, ValidationSource};
    use serde_json::json;

    fn settings() -> ValidationSettings {
        ValidationSettings {
            enabled: true,
            source: ValidationSource::Auto,
            mode: ValidationMode::PerMessage,
            cel_message: false,
        }
    }

    #[test]
    fn empty_set_validates_nothing() {
        let set = ValidatorSet::empty();
        assert!(matches!(
            set.validate("any.Type", &json!({})),
            ValidationCheck::NoConstraints
        ));
        assert_eq!(set.coverage().validated_message_types, 0);
    }

    #[test]
    fn broken_type_is_an_engine_error() {
        let mut set = ValidatorSet::empty();
        set.broken.insert(
            "test.Broken".to_string(),
            "name: invalid pattern '(': unclosed group".to_string(),
        );

        match set.validate("test.Broken", &json!({"name": "x"})) {
            ValidationCheck::EngineError(message) => {
                assert!(message.contains("invalid pattern"));
            }
            other => panic!("expected engine error, got {other:?}"),
        }
        // Other types are unaffected.
        assert!(matches!(
            set.validate("test.Fine", &json!({})),
            ValidationCheck::NoConstraints
        ));
    }

    #[test]
    fn coverage_counts_types_without_constraints() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("plain.proto"),
            "syntax = \"proto3\";\npackage p;\nmessage A { string x = 1; }\nmessage B { int32 y = 1; }\n",
        )
        .unwrap();
        let schema = crate::schema::load_dir(dir.path());
        let set = ValidatorSet::build(&schema, &settings());
        let coverage = set.coverage();
        assert_eq!(coverage.total_message_types, 2);
        assert_eq!(coverage.validated_message_types, 0);
    }
}
