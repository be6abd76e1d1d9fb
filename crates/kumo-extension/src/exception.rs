//! Host/script error boundary.
//!
//! Host functions raise [`HostError`] values into the script as thrown
//! values. When script execution fails, [`normalize_exception`] turns the
//! Rhai error back into host error semantics.

use rhai::{Dynamic, EvalAltResult, Map, Position};
use thiserror::Error;

use crate::error::ExtensionError;

/// Field under which a script-side error record may carry a host error,
/// e.g. `throw #{ message: "wrapped", value: err }`.
pub const EMBEDDED_ERROR_FIELD: &str = "value";

/// An error produced by a host capability while serving a script call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{function}: {message}")]
pub struct HostError {
    pub function: String,
    pub message: String,
}

impl HostError {
    pub fn new(function: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            function: function.into(),
            message: message.into(),
        }
    }

    /// Raise this error inside the script as a thrown value.
    pub fn into_script_error(self) -> Box<EvalAltResult> {
        Box::new(EvalAltResult::ErrorRuntime(Dynamic::from(self), Position::NONE))
    }
}

impl From<ExtensionError> for HostError {
    fn from(err: ExtensionError) -> Self {
        match err {
            ExtensionError::Host(host) => host,
            other => HostError::new("host", other.to_string()),
        }
    }
}

/// Convert an error surfaced by script execution into host error semantics.
///
/// Rhai wraps errors raised inside script functions in call-stack layers;
/// those are peeled to reach the thrown value. A thrown [`HostError`] is
/// returned directly, as is one embedded in an error record under
/// [`EMBEDDED_ERROR_FIELD`]. Anything else comes back unchanged as
/// [`ExtensionError::Script`].
pub fn normalize_exception(err: Box<EvalAltResult>) -> ExtensionError {
    if let EvalAltResult::ErrorRuntime(value, _) = innermost(&err) {
        if let Some(host) = exported_host_error(value) {
            return ExtensionError::Host(host);
        }
    }
    ExtensionError::Script(err)
}

/// Extract a host error from a value returned or thrown by a script.
pub(crate) fn exported_host_error(value: &Dynamic) -> Option<HostError> {
    if value.is::<HostError>() {
        return value.clone().try_cast::<HostError>();
    }
    if value.is_map() {
        let record = value.clone().try_cast::<Map>()?;
        let embedded = record.get(EMBEDDED_ERROR_FIELD)?;
        if embedded.is::<HostError>() {
            return embedded.clone().try_cast::<HostError>();
        }
    }
    None
}

fn innermost(err: &EvalAltResult) -> &EvalAltResult {
    match err {
        EvalAltResult::ErrorInFunctionCall(_, _, inner, _) => innermost(inner),
        EvalAltResult::ErrorInModule(_, inner, _) => innermost(inner),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thrown(value: Dynamic) -> Box<EvalAltResult> {
        Box::new(EvalAltResult::ErrorRuntime(value, Position::NONE))
    }

    #[test]
    fn test_normalize_thrown_host_error() {
        let err = thrown(Dynamic::from(HostError::new("http::get", "denied")));
        match normalize_exception(err) {
            ExtensionError::Host(host) => {
                assert_eq!(host.function, "http::get");
                assert_eq!(host.message, "denied");
            }
            other => panic!("expected host error, got {other:?}"),
        }
    }

    #[test]
    fn test_normalize_plain_value_returns_wrapper() {
        let err = thrown(Dynamic::from("just a string"));
        match normalize_exception(err) {
            ExtensionError::Script(inner) => {
                assert!(matches!(*inner, EvalAltResult::ErrorRuntime(..)));
            }
            other => panic!("expected script error, got {other:?}"),
        }
    }

    #[test]
    fn test_normalize_embedded_host_error() {
        let mut record = Map::new();
        record.insert("message".into(), Dynamic::from("wrapped"));
        record.insert(
            EMBEDDED_ERROR_FIELD.into(),
            Dynamic::from(HostError::new("store::set", "full")),
        );
        let err = thrown(Dynamic::from_map(record));
        match normalize_exception(err) {
            ExtensionError::Host(host) => assert_eq!(host.function, "store::set"),
            other => panic!("expected host error, got {other:?}"),
        }
    }

    #[test]
    fn test_normalize_record_without_host_error() {
        let mut record = Map::new();
        record.insert(EMBEDDED_ERROR_FIELD.into(), Dynamic::from(42_i64));
        let err = thrown(Dynamic::from_map(record));
        assert!(matches!(normalize_exception(err), ExtensionError::Script(_)));
    }

    #[test]
    fn test_normalize_non_runtime_error_unchanged() {
        let err = Box::new(EvalAltResult::ErrorTooManyOperations(Position::NONE));
        match normalize_exception(err) {
            ExtensionError::Script(inner) => {
                assert!(matches!(*inner, EvalAltResult::ErrorTooManyOperations(_)));
            }
            other => panic!("expected script error, got {other:?}"),
        }
    }

    #[test]
    fn test_normalize_peels_function_call_layers() {
        let inner = thrown(Dynamic::from(HostError::new("util::uuid", "nope")));
        let wrapped = Box::new(EvalAltResult::ErrorInFunctionCall(
            "search".into(),
            String::new(),
            inner,
            Position::NONE,
        ));
        assert!(matches!(normalize_exception(wrapped), ExtensionError::Host(_)));
    }

    #[test]
    fn test_normalize_from_script_throw() {
        let mut engine = rhai::Engine::new();
        engine.register_fn("fail", || -> Result<(), Box<EvalAltResult>> {
            Err(HostError::new("fail", "from host").into_script_error())
        });
        let err = engine
            .run("fn inner() { fail() } inner();")
            .unwrap_err();
        match normalize_exception(err) {
            ExtensionError::Host(host) => assert_eq!(host.message, "from host"),
            other => panic!("expected host error, got {other:?}"),
        }
    }

    #[test]
    fn test_host_error_from_extension_error() {
        let host: HostError = ExtensionError::NotFound("no".into()).into();
        assert_eq!(host.function, "host");
        assert!(host.message.contains("extension not found"));
    }
}
