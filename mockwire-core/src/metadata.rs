use std::collections::BTreeMap;

use base64::Engine;
use tonic::metadata::{AsciiMetadataValue, MetadataMap};

/// Normalize gRPC metadata into the lower-cased string map the matcher and
/// template layers work with.
///
/// Binary headers (`-bin` suffix) are base64-encoded so rule conditions can
/// still compare them; reserved transport headers are dropped.
pub fn normalize_metadata(md: &MetadataMap) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for kv in md.iter() {
        match kv {
            tonic::metadata::KeyAndValueRef::Ascii(key, value) => {
                let name = key.as_str().to_lowercase();
                if is_transport_header(&name) {
                    continue;
                }
                if let Ok(text) = value.to_str() {
                    out.insert(name, text.to_string());
                }
            }
            tonic::metadata::KeyAndValueRef::Binary(key, value) => {
                let name = key.as_str().to_lowercase();
                let encoded =
                    base64::engine::general_purpose::STANDARD.encode(value.as_encoded_bytes());
                out.insert(name, encoded);
            }
        }
    }
    out
}

/// Normalize plain HTTP headers (Connect / gRPC-Web requests) the same way.
pub fn normalize_headers(headers: &http::HeaderMap) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for (key, value) in headers.iter() {
        let name = key.as_str().to_lowercase();
        if is_transport_header(&name) {
            continue;
        }
        if let Ok(text) = value.to_str() {
            out.insert(name, text.to_string());
        }
    }
    out
}

/// Build a tonic metadata map from user-authored trailer values. Keys or
/// values that are not valid metadata are dropped rather than failing the
/// response.
pub fn metadata_from_pairs(pairs: &BTreeMap<String, String>) -> MetadataMap {
    let mut map = MetadataMap::new();
    for (name, value) in pairs {
        let name = name.to_lowercase();
        match (
            tonic::metadata::AsciiMetadataKey::from_bytes(name.as_bytes()),
            value.parse::<AsciiMetadataValue>(),
        ) {
            (Ok(key), Ok(val)) => {
                map.append(key, val);
            }
            _ => {
                tracing::warn!(header = %name, "dropping invalid trailer");
            }
        }
    }
    map
}

/// Headers that belong to the transport, not to rule matching.
fn is_transport_header(name: &str) -> bool {
    matches!(
        name,
        "content-type" | "content-length" | "te" | "grpc-encoding" | "grpc-accept-encoding"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_metadata_is_lowercased() {
        let mut md = MetadataMap::new();
        md.insert("X-User-Id", "42".parse().unwrap());
        md.insert("authorization", "Bearer abc".parse().unwrap());

        let normalized = normalize_metadata(&md);
        assert_eq!(normalized["x-user-id"], "42");
        assert_eq!(normalized["authorization"], "Bearer abc");
    }

    #[test]
    fn transport_headers_are_dropped() {
        let mut headers = http::HeaderMap::new();
        headers.insert("content-type", "application/grpc".parse().unwrap());
        headers.insert("x-env", "prod".parse().unwrap());

        let normalized = normalize_headers(&headers);
        assert!(!normalized.contains_key("content-type"));
        assert_eq!(normalized["x-env"], "prod");
    }

    #[test]
    fn pairs_round_trip_into_metadata() {
        let pairs: BTreeMap<String, String> = [
            ("x-mock".to_string(), "yes".to_string()),
            ("Bad Key".to_string(), "dropped".to_string()),
        ]
        .into_iter()
        .collect();

        let md = metadata_from_pairs(&pairs);
        assert_eq!(md.get("x-mock").unwrap(), "yes");
        assert_eq!(md.len(), 1);
    }
}
