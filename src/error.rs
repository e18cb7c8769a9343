//! Error taxonomy for the scripting bridge.
//!
//! No error crosses the host/script boundary as an exception: `NotFound`
//! and `InvalidState` collapse to `false`/`nil` at the boundary,
//! `ConversionUnsupported` degrades to [`Value::None`](crate::Value::None),
//! and `ScriptFault` ends only the offending instance.

/// An uncaught error raised by script code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptFault {
    /// Error message as raised by the script.
    pub message: String,
    /// Stack traceback, empty when the runtime did not provide one.
    pub traceback: String,
}

impl ScriptFault {
    /// Split a Lua error into message and traceback.
    ///
    /// Runtime errors from `mlua` carry the traceback appended to the message
    /// after a `stack traceback:` marker.
    #[must_use]
    pub fn from_lua_error(err: &mlua::Error) -> Self {
        let full = err.to_string();
        match full.find("stack traceback:") {
            Some(idx) => Self {
                message: full[..idx].trim_end().to_string(),
                traceback: full[idx..].trim_end().to_string(),
            },
            None => Self {
                message: full,
                traceback: String::new(),
            },
        }
    }
}

impl std::fmt::Display for ScriptFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.traceback.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{}\n{}", self.message, self.traceback)
        }
    }
}

/// Errors surfaced by the bridge.
#[derive(Debug, Clone)]
pub enum BridgeError {
    /// Missing script file, host object, attribute or capture source.
    NotFound(String),
    /// An operation's precondition is not met (e.g. grab before open).
    InvalidState(String),
    /// A runtime object kind has no host representation.
    ConversionUnsupported(String),
    /// Uncaught error during script execution.
    ScriptFault(ScriptFault),
    /// The runtime could not allocate. Unrecoverable.
    AllocationFailure(String),
}

impl BridgeError {
    /// Shorthand for [`BridgeError::NotFound`].
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Shorthand for [`BridgeError::InvalidState`].
    pub fn invalid_state(what: impl Into<String>) -> Self {
        Self::InvalidState(what.into())
    }
}

impl std::fmt::Display for BridgeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound(what) => write!(f, "Not found: {what}"),
            Self::InvalidState(what) => write!(f, "Invalid state: {what}"),
            Self::ConversionUnsupported(kind) => write!(f, "Conversion unsupported: {kind}"),
            Self::ScriptFault(fault) => write!(f, "Script fault: {fault}"),
            Self::AllocationFailure(what) => write!(f, "Allocation failure: {what}"),
        }
    }
}

impl std::error::Error for BridgeError {}

impl From<ScriptFault> for BridgeError {
    fn from(fault: ScriptFault) -> Self {
        Self::ScriptFault(fault)
    }
}

impl From<mlua::Error> for BridgeError {
    fn from(err: mlua::Error) -> Self {
        match err {
            mlua::Error::MemoryError(msg) => Self::AllocationFailure(msg),
            other => Self::ScriptFault(ScriptFault::from_lua_error(&other)),
        }
    }
}

/// Abort the process on an unrecoverable allocation failure.
///
/// Logged first so the reason survives in the host log.
pub fn abort_on_allocation_failure(what: &str) -> ! {
    log::error!("Unrecoverable allocation failure: {}", what);
    std::process::abort()
}

/// Convenience alias used across the bridge.
pub type BridgeResult<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_splits_traceback() {
        let err = mlua::Error::RuntimeError(
            "main.lua:3: boom\nstack traceback:\n\t[C]: in ?".to_string(),
        );
        let fault = ScriptFault::from_lua_error(&err);
        assert!(fault.message.ends_with("boom"));
        assert!(fault.traceback.starts_with("stack traceback:"));
    }

    #[test]
    fn test_fault_without_traceback() {
        let err = mlua::Error::RuntimeError("plain".to_string());
        let fault = ScriptFault::from_lua_error(&err);
        assert!(fault.message.contains("plain"));
        assert!(fault.traceback.is_empty());
    }

    #[test]
    fn test_memory_error_maps_to_allocation_failure() {
        let err: BridgeError = mlua::Error::MemoryError("oom".to_string()).into();
        assert!(matches!(err, BridgeError::AllocationFailure(_)));
    }

    #[test]
    fn test_display() {
        assert_eq!(
            BridgeError::not_found("object 'cam'").to_string(),
            "Not found: object 'cam'"
        );
    }
}
