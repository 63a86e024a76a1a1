//! gRPC status code tables shared by the handler and the adapters.
//!
//! The numeric code <-> canonical name mapping is a bijection over the 17
//! defined codes; anything outside that range maps to `UNKNOWN`. The
//! Connect protocol additionally needs a lower_snake code string and an
//! HTTP status per code.

/// The 17 canonical gRPC status codes, in numeric order.
const CODE_NAMES: [&str; 17] = [
    "OK",
    "CANCELLED",
    "UNKNOWN",
    "INVALID_ARGUMENT",
    "DEADLINE_EXCEEDED",
    "NOT_FOUND",
    "ALREADY_EXISTS",
    "PERMISSION_DENIED",
    "RESOURCE_EXHAUSTED",
    "FAILED_PRECONDITION",
    "ABORTED",
    "OUT_OF_RANGE",
    "UNIMPLEMENTED",
    "INTERNAL",
    "UNAVAILABLE",
    "DATA_LOSS",
    "UNAUTHENTICATED",
];

/// Map a numeric gRPC status code to its canonical uppercase name.
///
/// Unknown numeric values map to `UNKNOWN`.
pub fn code_name(code: i32) -> &'static str {
    match usize::try_from(code) {
        Ok(idx) if idx < CODE_NAMES.len() => CODE_NAMES[idx],
        _ => "UNKNOWN",
    }
}

/// Map a canonical uppercase name back to its numeric code.
///
/// Unrecognized names map to 2 (`UNKNOWN`).
pub fn name_code(name: &str) -> i32 {
    CODE_NAMES
        .iter()
        .position(|n| *n == name)
        .map(|idx| idx as i32)
        .unwrap_or(2)
}

/// The Connect protocol's lower_snake code string (e.g. `permission_denied`).
pub fn connect_code(code: i32) -> String {
    code_name(code).to_ascii_lowercase()
}

/// Map a gRPC status code to the HTTP status used by the Connect protocol
/// for unary error responses.
pub fn connect_http_status(code: i32) -> u16 {
    match code {
        0 => 200,
        1 => 499,  // CANCELLED
        2 => 500,  // UNKNOWN
        3 => 400,  // INVALID_ARGUMENT
        4 => 504,  // DEADLINE_EXCEEDED
        5 => 404,  // NOT_FOUND
        6 => 409,  // ALREADY_EXISTS
        7 => 403,  // PERMISSION_DENIED
        8 => 429,  // RESOURCE_EXHAUSTED
        9 => 400,  // FAILED_PRECONDITION
        10 => 409, // ABORTED
        11 => 400, // OUT_OF_RANGE
        12 => 501, // UNIMPLEMENTED
        13 => 500, // INTERNAL
        14 => 503, // UNAVAILABLE
        15 => 500, // DATA_LOSS
        16 => 401, // UNAUTHENTICATED
        _ => 500,
    }
}

/// Convert a numeric code to `tonic::Code`, mapping out-of-range values to
/// `Unknown` rather than panicking.
pub fn tonic_code(code: i32) -> tonic::Code {
    if (0..=16).contains(&code) {
        tonic::Code::from(code)
    } else {
        tonic::Code::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapping_is_bijective_over_defined_codes() {
        for code in 0..17 {
            let name = code_name(code);
            assert_eq!(name_code(name), code, "round trip failed for {name}");
        }
    }

    #[test]
    fn unknown_values_collapse_to_unknown() {
        assert_eq!(code_name(-1), "UNKNOWN");
        assert_eq!(code_name(17), "UNKNOWN");
        assert_eq!(code_name(999), "UNKNOWN");
        assert_eq!(name_code("NO_SUCH_CODE"), 2);
    }

    #[test]
    fn connect_codes_are_lower_snake() {
        assert_eq!(connect_code(7), "permission_denied");
        assert_eq!(connect_code(3), "invalid_argument");
        assert_eq!(connect_code(16), "unauthenticated");
    }

    #[test]
    fn connect_http_statuses() {
        assert_eq!(connect_http_status(3), 400);
        assert_eq!(connect_http_status(16), 401);
        assert_eq!(connect_http_status(7), 403);
        assert_eq!(connect_http_status(12), 501);
        assert_eq!(connect_http_status(14), 503);
        assert_eq!(connect_http_status(42), 500);
    }

    #[test]
    fn tonic_code_conversion() {
        assert_eq!(tonic_code(7), tonic::Code::PermissionDenied);
        assert_eq!(tonic_code(99), tonic::Code::Unknown);
    }
}
