use prost_reflect::{DeserializeOptions, DynamicMessage, MessageDescriptor, SerializeOptions};
use serde_json::Value;

use crate::error::{MockwireError, Result};

/// Decode a dynamic message into a schemaless JSON tree.
///
/// Proto field names are kept as written in the schema (no camelCasing) so
/// rule paths like `request.user_id` match the proto source. Default values
/// are emitted so every declared field is addressable from `when`
/// conditions and templates.
pub fn message_to_value(msg: &DynamicMessage) -> Result<Value> {
    let options = SerializeOptions::new()
        .use_proto_field_name(true)
        .skip_default_fields(false);
    msg.serialize_with_options(serde_json::value::Serializer, &options)
        .map_err(|e| MockwireError::Proto(format!("failed to decode message to JSON: {e}")))
}

/// Marshal a user-authored JSON tree into a message of the given type.
///
/// This is the reflective descriptor-guided path used for rule bodies and
/// stream items: field names map to field numbers, scalars are coerced per
/// proto3 JSON rules, enums accept both names and numbers. Unknown keys in
/// the tree are ignored rather than rejected, since rule authors often
/// carry annotations alongside payload fields.
pub fn value_to_message(desc: &MessageDescriptor, value: &Value) -> Result<DynamicMessage> {
    let options = DeserializeOptions::new().deny_unknown_fields(false);
    DynamicMessage::deserialize_with_options(desc.clone(), value.clone(), &options).map_err(|e| {
        MockwireError::Proto(format!(
            "failed to marshal JSON into {}: {e}",
            desc.full_name()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost_reflect::DescriptorPool;
    use serde_json::json;

    fn test_pool() -> DescriptorPool {
        let fds = prost_types::FileDescriptorSet {
            file: vec![prost_types::FileDescriptorProto {
                name: Some("test.proto".into()),
                package: Some("test".into()),
                message_type: vec![prost_types::DescriptorProto {
                    name: Some("Sample".into()),
                    field: vec![
                        prost_types::FieldDescriptorProto {
                            name: Some("user_name".into()),
                            number: Some(1),
                            r#type: Some(9), // TYPE_STRING
                            label: Some(1),
                            ..Default::default()
                        },
                        prost_types::FieldDescriptorProto {
                            name: Some("age".into()),
                            number: Some(2),
                            r#type: Some(5), // TYPE_INT32
                            label: Some(1),
                            ..Default::default()
                        },
                        prost_types::FieldDescriptorProto {
                            name: Some("tags".into()),
                            number: Some(3),
                            r#type: Some(9),
                            label: Some(3), // LABEL_REPEATED
                            ..Default::default()
                        },
                        prost_types::FieldDescriptorProto {
                            name: Some("color".into()),
                            number: Some(4),
                            r#type: Some(14), // TYPE_ENUM
                            type_name: Some(".test.Color".into()),
                            label: Some(1),
                            ..Default::default()
                        },
                    ],
                    ..Default::default()
                }],
                enum_type: vec![prost_types::EnumDescriptorProto {
                    name: Some("Color".into()),
                    value: vec![
                        prost_types::EnumValueDescriptorProto {
                            name: Some("RED".into()),
                            number: Some(0),
                            ..Default::default()
                        },
                        prost_types::EnumValueDescriptorProto {
                            name: Some("BLUE".into()),
                            number: Some(1),
                            ..Default::default()
                        },
                    ],
                    ..Default::default()
                }],
                syntax: Some("proto3".into()),
                ..Default::default()
            }],
        };
        DescriptorPool::from_file_descriptor_set(fds).unwrap()
    }

    fn sample_desc() -> MessageDescriptor {
        test_pool().get_message_by_name("test.Sample").unwrap()
    }

    #[test]
    fn round_trip_preserves_proto_field_names() {
        let desc = sample_desc();
        let msg = value_to_message(
            &desc,
            &json!({"user_name": "Tom", "age": 30, "tags": ["a", "b"]}),
        )
        .unwrap();
        let value = message_to_value(&msg).unwrap();
        assert_eq!(value["user_name"], "Tom");
        assert_eq!(value["age"], 30);
        assert_eq!(value["tags"], json!(["a", "b"]));
    }

    #[test]
    fn defaults_are_emitted() {
        let desc = sample_desc();
        let msg = value_to_message(&desc, &json!({"user_name": "x"})).unwrap();
        let value = message_to_value(&msg).unwrap();
        assert_eq!(value["age"], 0);
        assert_eq!(value["tags"], json!([]));
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let desc = sample_desc();
        let msg = value_to_message(&desc, &json!({"user_name": "x", "nope": true})).unwrap();
        let value = message_to_value(&msg).unwrap();
        assert_eq!(value["user_name"], "x");
        assert!(value.get("nope").is_none());
    }

    #[test]
    fn enums_accept_name_and_number() {
        let desc = sample_desc();
        let by_name = value_to_message(&desc, &json!({"color": "BLUE"})).unwrap();
        let by_number = value_to_message(&desc, &json!({"color": 1})).unwrap();
        assert_eq!(
            message_to_value(&by_name).unwrap()["color"],
            message_to_value(&by_number).unwrap()["color"]
        );
    }

    #[test]
    fn type_mismatch_is_an_error() {
        let desc = sample_desc();
        let result = value_to_message(&desc, &json!({"age": {"nested": true}}));
        assert!(result.is_err());
    }
}
