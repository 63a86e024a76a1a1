use std::fmt;

/// All error types produced by the mockwire library.
///
/// Load-time failures (protos, rules, TLS material) are recoverable by
/// design: they end up in the status report rather than crashing the
/// process. Request-time failures are converted to gRPC statuses at the
/// handler boundary.
#[derive(Debug)]
pub enum MockwireError {
    /// The requested symbol (service, method, message type) was not found
    /// in the loaded schema.
    NotFound(String),

    /// An invalid argument was provided (malformed path, bad port, ...).
    InvalidArgument(String),

    /// An I/O error (file read, bind, ...).
    Io(std::io::Error),

    /// A protobuf compilation/encoding/decoding error.
    Proto(String),

    /// A rule file could not be parsed or is structurally invalid.
    Rule { file: String, message: String },

    /// A configuration value could not be interpreted.
    Config(String),

    /// TLS material could not be loaded or the TLS stack rejected it.
    Tls(String),

    /// A gRPC status produced while serving a call.
    GrpcStatus(tonic::Status),

    /// Any other error.
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl fmt::Display for MockwireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MockwireError::NotFound(name) => write!(f, "Symbol not found: {name}"),
            MockwireError::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            MockwireError::Io(err) => write!(f, "I/O error: {err}"),
            MockwireError::Proto(msg) => write!(f, "proto error: {msg}"),
            MockwireError::Rule { file, message } => {
                write!(f, "rule file '{file}': {message}")
            }
            MockwireError::Config(msg) => write!(f, "configuration error: {msg}"),
            MockwireError::Tls(msg) => write!(f, "TLS error: {msg}"),
            MockwireError::GrpcStatus(status) => {
                write!(f, "gRPC error: {} - {}", status.code(), status.message())
            }
            MockwireError::Other(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for MockwireError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MockwireError::Io(err) => Some(err),
            MockwireError::Other(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for MockwireError {
    fn from(err: std::io::Error) -> Self {
        MockwireError::Io(err)
    }
}

impl From<tonic::Status> for MockwireError {
    fn from(status: tonic::Status) -> Self {
        MockwireError::GrpcStatus(status)
    }
}

/// Convenience type alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, MockwireError>;
