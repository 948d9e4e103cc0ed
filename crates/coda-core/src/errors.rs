//! Canonical error taxonomy for coda components.
//!
//! Every failure surfaced by the session store, tool registry, tool handlers
//! and the orchestration loop is a [`CodaError`]: a machine-checkable
//! [`ErrorCode`], a human message, an optional wrapped cause, free-form
//! diagnostic context and an optional remediation hint.

use std::{collections::BTreeMap, error::Error as StdError, fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

/// Boxed cause stored inside a [`CodaError`].
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Result alias used by coda library crates.
pub type CodaResult<T> = Result<T, CodaError>;

/// Enumerates supported `ErrorCode` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    FileNotFound,
    PermissionDenied,
    PathTraversal,
    SymlinkEscape,
    NotADirectory,
    InvalidInput,
    ValidationError,
    ExecutionFailed,
    Timeout,
    Cancelled,
    MissingCredential,
    ModelNotFound,
    ProviderError,
    PatchFailed,
    #[serde(rename = "INTERNAL_ERROR")]
    Internal,
    NotSupported,
}

impl ErrorCode {
    pub const ALL: [ErrorCode; 16] = [
        ErrorCode::FileNotFound,
        ErrorCode::PermissionDenied,
        ErrorCode::PathTraversal,
        ErrorCode::SymlinkEscape,
        ErrorCode::NotADirectory,
        ErrorCode::InvalidInput,
        ErrorCode::ValidationError,
        ErrorCode::ExecutionFailed,
        ErrorCode::Timeout,
        ErrorCode::Cancelled,
        ErrorCode::MissingCredential,
        ErrorCode::ModelNotFound,
        ErrorCode::ProviderError,
        ErrorCode::PatchFailed,
        ErrorCode::Internal,
        ErrorCode::NotSupported,
    ];

    /// Stable wire representation, also used in persisted events.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::FileNotFound => "FILE_NOT_FOUND",
            ErrorCode::PermissionDenied => "PERMISSION_DENIED",
            ErrorCode::PathTraversal => "PATH_TRAVERSAL",
            ErrorCode::SymlinkEscape => "SYMLINK_ESCAPE",
            ErrorCode::NotADirectory => "NOT_A_DIRECTORY",
            ErrorCode::InvalidInput => "INVALID_INPUT",
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::ExecutionFailed => "EXECUTION_FAILED",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::Cancelled => "CANCELLED",
            ErrorCode::MissingCredential => "MISSING_CREDENTIAL",
            ErrorCode::ModelNotFound => "MODEL_NOT_FOUND",
            ErrorCode::ProviderError => "PROVIDER_ERROR",
            ErrorCode::PatchFailed => "PATCH_FAILED",
            ErrorCode::Internal => "INTERNAL_ERROR",
            ErrorCode::NotSupported => "NOT_SUPPORTED",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorCode {
    type Err = CodaError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim();
        ErrorCode::ALL
            .into_iter()
            .find(|code| code.as_str().eq_ignore_ascii_case(normalized))
            .ok_or_else(|| {
                CodaError::invalid_input(format!("unknown error code '{normalized}'"))
            })
    }
}

/// Public struct `CodaError` used across coda components.
///
/// # Examples
///
/// ```
/// use coda_core::{is_code, CodaError, ErrorCode};
///
/// let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
/// let error = CodaError::wrap(ErrorCode::Internal, "failed to append event", io)
///     .with_context("session_id", "sess-1")
///     .with_suggestion("free some disk space and retry");
///
/// assert!(is_code(&error, ErrorCode::Internal));
/// assert_eq!(error.context_value("session_id"), Some("sess-1"));
/// assert_eq!(error.to_string(), "[INTERNAL_ERROR] failed to append event: disk full");
/// ```
#[derive(Debug, Error)]
#[error("[{code}] {message}{}", render_cause(.source.as_deref()))]
pub struct CodaError {
    code: ErrorCode,
    message: String,
    #[source]
    source: Option<BoxError>,
    context: BTreeMap<String, String>,
    suggestion: Option<String>,
}

fn render_cause(source: Option<&(dyn StdError + Send + Sync + 'static)>) -> String {
    match source {
        Some(cause) => format!(": {cause}"),
        None => String::new(),
    }
}

impl CodaError {
    /// Constructs a fresh error without a cause.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
            context: BTreeMap::new(),
            suggestion: None,
        }
    }

    /// Constructs an error that preserves `cause` for inspection through `source()`.
    pub fn wrap(
        code: ErrorCode,
        message: impl Into<String>,
        cause: impl Into<BoxError>,
    ) -> Self {
        Self {
            source: Some(cause.into()),
            ..Self::new(code, message)
        }
    }

    /// Attaches a diagnostic key/value pair. Later values replace earlier ones.
    pub fn with_context(mut self, key: impl Into<String>, value: impl fmt::Display) -> Self {
        self.context.insert(key.into(), value.to_string());
        self
    }

    /// Attaches a user-facing remediation hint.
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn context(&self) -> &BTreeMap<String, String> {
        &self.context
    }

    pub fn context_value(&self, key: &str) -> Option<&str> {
        self.context.get(key).map(String::as_str)
    }

    pub fn suggestion(&self) -> Option<&str> {
        self.suggestion.as_deref()
    }

    /// Returns true when this error or any wrapped cause carries `code`.
    pub fn is(&self, code: ErrorCode) -> bool {
        is_code(self, code)
    }

    /// Renders the error as the structured payload fed back to the model.
    pub fn to_payload(&self) -> Value {
        let mut payload = Map::new();
        payload.insert("code".to_string(), json!(self.code.as_str()));
        payload.insert("message".to_string(), json!(self.message));
        if let Some(source) = self.source.as_ref() {
            payload.insert("cause".to_string(), json!(source.to_string()));
        }
        if !self.context.is_empty() {
            payload.insert("context".to_string(), json!(self.context));
        }
        if let Some(suggestion) = self.suggestion.as_ref() {
            payload.insert("suggestion".to_string(), json!(suggestion));
        }
        Value::Object(payload)
    }

    pub fn file_not_found(path: impl fmt::Display) -> Self {
        Self::new(ErrorCode::FileNotFound, format!("file not found: {path}"))
            .with_context("path", path)
    }

    pub fn permission_denied(path: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::PermissionDenied,
            format!("permission denied: {path}"),
        )
        .with_context("path", path)
    }

    pub fn path_traversal(path: impl fmt::Display, base_path: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::PathTraversal,
            format!("path traversal detected: {path} is outside {base_path}"),
        )
        .with_context("path", path)
        .with_context("base_path", base_path)
    }

    pub fn symlink_escape(
        path: impl fmt::Display,
        real_path: impl fmt::Display,
        base_path: impl fmt::Display,
    ) -> Self {
        Self::new(
            ErrorCode::SymlinkEscape,
            format!(
                "symlink points outside base directory: {path} -> {real_path} (base: {base_path})"
            ),
        )
        .with_context("path", path)
        .with_context("real_path", real_path)
        .with_context("base_path", base_path)
    }

    pub fn not_a_directory(path: impl fmt::Display) -> Self {
        Self::new(ErrorCode::NotADirectory, format!("not a directory: {path}"))
            .with_context("path", path)
    }

    pub fn invalid_input(message: impl fmt::Display) -> Self {
        Self::new(ErrorCode::InvalidInput, format!("invalid input: {message}"))
    }

    pub fn execution_failed(command: impl fmt::Display, cause: impl Into<BoxError>) -> Self {
        Self::wrap(
            ErrorCode::ExecutionFailed,
            format!("execution failed: {command}"),
            cause,
        )
        .with_context("command", command)
    }

    pub fn timeout(operation: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::Timeout,
            format!("operation timed out: {operation}"),
        )
        .with_context("operation", operation)
    }

    pub fn cancelled(operation: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::Cancelled,
            format!("operation cancelled: {operation}"),
        )
        .with_context("operation", operation)
    }

    pub fn missing_credential(provider: impl fmt::Display, env_var: &str) -> Self {
        Self::new(
            ErrorCode::MissingCredential,
            format!("{provider} API key not configured or invalid"),
        )
        .with_context("provider", provider)
        .with_suggestion(format!("set the {env_var} environment variable"))
    }

    pub fn model_not_found(model_id: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::ModelNotFound,
            format!("model not found: {model_id}"),
        )
        .with_context("model_id", model_id)
    }

    pub fn provider_error(provider: impl fmt::Display, cause: impl Into<BoxError>) -> Self {
        Self::wrap(
            ErrorCode::ProviderError,
            format!("{provider} provider error"),
            cause,
        )
        .with_context("provider", provider)
    }

    pub fn patch_failed(reason: impl fmt::Display) -> Self {
        Self::new(ErrorCode::PatchFailed, format!("patch failed: {reason}"))
    }

    pub fn internal(message: impl fmt::Display) -> Self {
        Self::new(ErrorCode::Internal, format!("internal error: {message}"))
    }

    pub fn not_supported(feature: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::NotSupported,
            format!("not supported: {feature}"),
        )
        .with_context("feature", feature)
    }
}

/// Structural code check across any wrapping depth.
///
/// Walks the `source()` chain and matches every [`CodaError`] link, so the
/// check also works through `anyhow::Error` (pass `&*error`).
pub fn is_code(error: &(dyn StdError + 'static), code: ErrorCode) -> bool {
    chain(error).any(|coda| coda.code == code)
}

/// Returns the outermost taxonomy code found in `error`'s chain.
pub fn code_of(error: &(dyn StdError + 'static)) -> Option<ErrorCode> {
    chain(error).next().map(CodaError::code)
}

fn chain<'a>(error: &'a (dyn StdError + 'static)) -> impl Iterator<Item = &'a CodaError> + 'a {
    std::iter::successors(Some(error), |&current| current.source())
        .filter_map(|link| link.downcast_ref::<CodaError>())
}

/// Extension trait mirroring `anyhow::Context` for taxonomy codes.
pub trait ResultExt<T> {
    /// Wraps the error with `code` and a static message.
    fn with_code(self, code: ErrorCode, message: impl Into<String>) -> CodaResult<T>;

    /// Wraps the error with `code` and a lazily built message.
    fn with_code_lazy<F, M>(self, code: ErrorCode, message: F) -> CodaResult<T>
    where
        F: FnOnce() -> M,
        M: Into<String>;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: StdError + Send + Sync + 'static,
{
    fn with_code(self, code: ErrorCode, message: impl Into<String>) -> CodaResult<T> {
        self.map_err(|error| CodaError::wrap(code, message, error))
    }

    fn with_code_lazy<F, M>(self, code: ErrorCode, message: F) -> CodaResult<T>
    where
        F: FnOnce() -> M,
        M: Into<String>,
    {
        self.map_err(|error| CodaError::wrap(code, message(), error))
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error as _;

    use super::{code_of, is_code, CodaError, ErrorCode, ResultExt};

    #[test]
    fn unit_new_error_renders_code_and_message() {
        let error = CodaError::new(ErrorCode::InvalidInput, "bad arguments");
        assert_eq!(error.code(), ErrorCode::InvalidInput);
        assert_eq!(error.to_string(), "[INVALID_INPUT] bad arguments");
        assert!(error.source().is_none());
        assert!(error.suggestion().is_none());
    }

    #[test]
    fn unit_wrap_preserves_cause_for_inspection() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only fs");
        let error = CodaError::wrap(ErrorCode::Internal, "failed to write event", io);
        let cause = error.source().expect("cause");
        let io = cause
            .downcast_ref::<std::io::Error>()
            .expect("io error cause");
        assert_eq!(io.kind(), std::io::ErrorKind::PermissionDenied);
        assert_eq!(
            error.to_string(),
            "[INTERNAL_ERROR] failed to write event: read-only fs"
        );
    }

    #[test]
    fn functional_is_code_matches_at_any_wrapping_depth() {
        let inner = CodaError::file_not_found("/tmp/missing.txt");
        let middle = CodaError::wrap(ErrorCode::ExecutionFailed, "tool failed", inner);
        let outer = anyhow::Error::new(middle).context("turn aborted");

        assert!(is_code(&*outer, ErrorCode::FileNotFound));
        assert!(is_code(&*outer, ErrorCode::ExecutionFailed));
        assert!(!is_code(&*outer, ErrorCode::Timeout));
        assert_eq!(code_of(&*outer), Some(ErrorCode::ExecutionFailed));
    }

    #[test]
    fn unit_context_and_suggestion_chain_and_render_payload() {
        let error = CodaError::missing_credential("openai", "OPENAI_API_KEY")
            .with_context("model", "gpt-4o-mini");
        assert_eq!(error.context_value("provider"), Some("openai"));
        assert_eq!(error.context_value("model"), Some("gpt-4o-mini"));
        assert_eq!(
            error.suggestion(),
            Some("set the OPENAI_API_KEY environment variable")
        );

        let payload = error.to_payload();
        assert_eq!(payload["code"], "MISSING_CREDENTIAL");
        assert_eq!(payload["context"]["provider"], "openai");
        assert_eq!(
            payload["suggestion"],
            "set the OPENAI_API_KEY environment variable"
        );
    }

    #[test]
    fn unit_helper_constructors_attach_expected_context() {
        let traversal = CodaError::path_traversal("../etc/passwd", "/work");
        assert_eq!(traversal.code(), ErrorCode::PathTraversal);
        assert_eq!(traversal.context_value("base_path"), Some("/work"));

        let escape = CodaError::symlink_escape("/work/link", "/etc/passwd", "/work");
        assert_eq!(escape.code(), ErrorCode::SymlinkEscape);
        assert_eq!(escape.context_value("real_path"), Some("/etc/passwd"));

        let exec = CodaError::execution_failed(
            "make build",
            std::io::Error::new(std::io::ErrorKind::NotFound, "make: not found"),
        );
        assert_eq!(exec.context_value("command"), Some("make build"));
        assert!(exec.to_string().ends_with("make: not found"));
    }

    #[test]
    fn unit_error_code_round_trips_through_wire_strings() {
        for code in ErrorCode::ALL {
            let parsed: ErrorCode = code.as_str().parse().expect("parse");
            assert_eq!(parsed, code);
            let serialized = serde_json::to_value(code).expect("serialize");
            assert_eq!(serialized, serde_json::json!(code.as_str()));
        }
        assert!("NOPE".parse::<ErrorCode>().is_err());
    }

    #[test]
    fn functional_result_ext_wraps_foreign_errors() {
        let result: Result<(), std::io::Error> = Err(std::io::Error::new(
            std::io::ErrorKind::Other,
            "database is locked",
        ));
        let error = result
            .with_code_lazy(ErrorCode::Internal, || {
                format!("failed to open store {}", "sessions.sqlite")
            })
            .expect_err("wrapped");
        assert!(error.is(ErrorCode::Internal));
        assert_eq!(
            error.to_string(),
            "[INTERNAL_ERROR] failed to open store sessions.sqlite: database is locked"
        );
    }
}
