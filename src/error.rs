//! Error taxonomy shared by every shell-exposed object.
//!
//! Every failure raised by a wrapped call is a [`ShellError`]. Its
//! [`ErrorKind`] tells a cancellation apart from a data failure, and
//! [`ErrorInfo`] is the structured value handed to the display layer or sent
//! across an execution-context boundary.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable error codes attached to user-visible failures.
pub mod codes {
    /// A malformed or missing argument.
    pub const INVALID_ARGUMENT: &str = "COMMON-10001";
    /// A value could not be (de)serialized.
    pub const SERIALIZATION: &str = "COMMON-10002";
    /// Misuse of a live resource, for example reading a closed stream.
    pub const INVALID_OPERATION: &str = "SHAPI-10001";
    /// A replay record that does not match the target cursor.
    pub const RECONSTRUCTION: &str = "SHAPI-10002";
    /// The operation was abandoned because of an interrupt.
    pub const INTERRUPTED: &str = "SHAPI-10003";
    /// Unexpected internal state.
    pub const INTERNAL: &str = "COMMON-90001";
    /// The operation is meaningless for the receiving variant.
    pub const NOT_IMPLEMENTED: &str = "COMMON-90002";
}

/// Result alias used across the crate.
pub type ShellResult<T> = Result<T, ShellError>;

/// Every failure a shell-exposed call can raise.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ShellError {
    /// Malformed or missing argument. Raised synchronously, never retried.
    #[error("[{code}] {message}")]
    InvalidInput { code: String, message: String },

    /// The operation has no meaning for this object.
    #[error("[{code}] Cannot call {operation} on a {variant}", code = codes::NOT_IMPLEMENTED)]
    Unimplemented { variant: String, operation: String },

    /// The call lost the race against the session interrupt.
    #[error("[{code}] execution was interrupted", code = codes::INTERRUPTED)]
    Interrupted,

    /// The underlying native resource or service raised.
    #[error("{}", render_resource(.code, .message, .annotations))]
    Resource {
        code: Option<String>,
        message: String,
        annotations: Vec<String>,
    },

    /// A live resource was used in a way its current state forbids.
    #[error("[{code}] {message}")]
    Runtime { code: String, message: String },

    /// A replay record could not be applied.
    #[error("[{code}] {0}", code = codes::RECONSTRUCTION)]
    Reconstruction(String),

    /// Unexpected internal state.
    #[error("[{code}] {0}", code = codes::INTERNAL)]
    Internal(String),
}

fn render_resource(code: &Option<String>, message: &str, annotations: &[String]) -> String {
    let mut out = match code {
        Some(code) => format!("[{code}] {message}"),
        None => message.to_string(),
    };
    for note in annotations {
        out.push_str(" (");
        out.push_str(note);
        out.push(')');
    }
    out
}

impl ShellError {
    /// Invalid-input error with the generic argument code.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            code: codes::INVALID_ARGUMENT.to_string(),
            message: message.into(),
        }
    }

    /// Unimplemented-for-variant error naming the receiving class.
    pub fn unimplemented(variant: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::Unimplemented {
            variant: variant.into(),
            operation: operation.into(),
        }
    }

    /// Failure raised by the service boundary.
    pub fn resource(message: impl Into<String>) -> Self {
        Self::Resource {
            code: None,
            message: message.into(),
            annotations: Vec::new(),
        }
    }

    /// Failure raised by the service boundary carrying a server code.
    pub fn resource_with_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Resource {
            code: Some(code.into()),
            message: message.into(),
            annotations: Vec::new(),
        }
    }

    /// Misuse of a live resource.
    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime {
            code: codes::INVALID_OPERATION.to_string(),
            message: message.into(),
        }
    }

    /// Replay failure.
    pub fn reconstruction(message: impl Into<String>) -> Self {
        Self::Reconstruction(message.into())
    }

    /// The kind tag of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidInput { .. } => ErrorKind::InvalidInput,
            Self::Unimplemented { .. } => ErrorKind::Unimplemented,
            Self::Interrupted => ErrorKind::Interrupted,
            Self::Resource { .. } => ErrorKind::Resource,
            Self::Runtime { .. } => ErrorKind::Runtime,
            Self::Reconstruction(_) => ErrorKind::Reconstruction,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// The error code, if the error carries one.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::InvalidInput { code, .. } | Self::Runtime { code, .. } => Some(code),
            Self::Unimplemented { .. } => Some(codes::NOT_IMPLEMENTED),
            Self::Interrupted => Some(codes::INTERRUPTED),
            Self::Resource { code, .. } => code.as_deref(),
            Self::Reconstruction(_) => Some(codes::RECONSTRUCTION),
            Self::Internal(_) => Some(codes::INTERNAL),
        }
    }

    /// Whether this error is the cancellation failure.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted)
    }

    /// Attach context to a resource failure. Other kinds are returned as is.
    pub fn annotate(self, note: impl Into<String>) -> Self {
        match self {
            Self::Resource {
                code,
                message,
                mut annotations,
            } => {
                annotations.push(note.into());
                Self::Resource {
                    code,
                    message,
                    annotations,
                }
            }
            other => other,
        }
    }

    /// Structured, serializable form of this error.
    pub fn to_info(&self) -> ErrorInfo {
        let mut details = BTreeMap::new();
        let message = match self {
            Self::InvalidInput { message, .. } | Self::Runtime { message, .. } => message.clone(),
            Self::Unimplemented { variant, operation } => {
                details.insert("variant".to_string(), variant.clone());
                details.insert("operation".to_string(), operation.clone());
                format!("Cannot call {operation} on a {variant}")
            }
            Self::Interrupted => "execution was interrupted".to_string(),
            Self::Resource {
                message,
                annotations,
                ..
            } => {
                for (i, note) in annotations.iter().enumerate() {
                    details.insert(format!("annotation.{i}"), note.clone());
                }
                message.clone()
            }
            Self::Reconstruction(message) | Self::Internal(message) => message.clone(),
        };
        ErrorInfo {
            kind: self.kind(),
            code: self.code().map(str::to_string),
            message,
            details,
        }
    }
}

impl From<serde_json::Error> for ShellError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidInput {
            code: codes::SERIALIZATION.to_string(),
            message: err.to_string(),
        }
    }
}

impl From<serde_yaml::Error> for ShellError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::InvalidInput {
            code: codes::SERIALIZATION.to_string(),
            message: err.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// ErrorKind / ErrorInfo
// ---------------------------------------------------------------------------

/// Category of a [`ShellError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    InvalidInput,
    Unimplemented,
    Interrupted,
    Resource,
    Runtime,
    Reconstruction,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::InvalidInput => "InvalidInput",
            Self::Unimplemented => "Unimplemented",
            Self::Interrupted => "Interrupted",
            Self::Resource => "Resource",
            Self::Runtime => "Runtime",
            Self::Reconstruction => "Reconstruction",
            Self::Internal => "Internal",
        };
        f.write_str(name)
    }
}

/// User-visible form of a failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, String>,
}

impl ErrorInfo {
    /// Rebuild an equivalent [`ShellError`], e.g. after crossing a context boundary.
    pub fn into_error(self) -> ShellError {
        match self.kind {
            ErrorKind::InvalidInput => ShellError::InvalidInput {
                code: self
                    .code
                    .unwrap_or_else(|| codes::INVALID_ARGUMENT.to_string()),
                message: self.message,
            },
            ErrorKind::Unimplemented => ShellError::Unimplemented {
                variant: self.details.get("variant").cloned().unwrap_or_default(),
                operation: self.details.get("operation").cloned().unwrap_or_default(),
            },
            ErrorKind::Interrupted => ShellError::Interrupted,
            ErrorKind::Resource => ShellError::Resource {
                code: self.code,
                message: self.message,
                annotations: self
                    .details
                    .into_iter()
                    .filter(|(k, _)| k.starts_with("annotation."))
                    .map(|(_, v)| v)
                    .collect(),
            },
            ErrorKind::Runtime => ShellError::Runtime {
                code: self
                    .code
                    .unwrap_or_else(|| codes::INVALID_OPERATION.to_string()),
                message: self.message,
            },
            ErrorKind::Reconstruction => ShellError::Reconstruction(self.message),
            ErrorKind::Internal => ShellError::Internal(self.message),
        }
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{}: [{}] {}", self.kind, code, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_code() {
        let err = ShellError::invalid_input("bad flag");
        assert_eq!(err.to_string(), "[COMMON-10001] bad flag");
        assert_eq!(
            ShellError::unimplemented("ChangeStreamCursor", "toArray").to_string(),
            "[COMMON-90002] Cannot call toArray on a ChangeStreamCursor"
        );
    }

    #[test]
    fn test_interrupted_is_distinguishable() {
        let err = ShellError::Interrupted;
        assert!(err.is_interrupted());
        assert_eq!(err.kind(), ErrorKind::Interrupted);
        assert!(!ShellError::resource("boom").is_interrupted());
    }

    #[test]
    fn test_annotate_resource_only() {
        let err = ShellError::resource_with_code("11000", "duplicate key").annotate("insertOne");
        assert_eq!(err.to_string(), "[11000] duplicate key (insertOne)");

        let untouched = ShellError::Interrupted.annotate("ignored");
        assert_eq!(untouched, ShellError::Interrupted);
    }

    #[test]
    fn test_info_survives_serialization() {
        let errors = vec![
            ShellError::invalid_input("missing filter"),
            ShellError::unimplemented("ChangeStreamCursor", "batchSize"),
            ShellError::Interrupted,
            ShellError::resource("socket closed").annotate("find"),
            ShellError::runtime("Cannot call tryNext on closed cursor"),
            ShellError::reconstruction("unknown chain method"),
            ShellError::Internal("poisoned".into()),
        ];
        for err in errors {
            let json = serde_json::to_string(&err.to_info()).unwrap();
            let info: ErrorInfo = serde_json::from_str(&json).unwrap();
            assert_eq!(info.into_error(), err);
        }
    }

    #[test]
    fn test_serde_errors_are_invalid_input() {
        let err: ShellError = serde_json::from_str::<u32>("\"x\"").unwrap_err().into();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert_eq!(err.code(), Some(codes::SERIALIZATION));
    }
}
