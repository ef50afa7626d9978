use thiserror::Error;

/// Failures surfaced by the engine, transports and dispatcher. Transport
/// level failures are turned into link changes before they reach the
/// reconciler; the variants here are what callers actually observe.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("no transport is connected")]
    TransportUnavailable,

    #[error("request failed: {0}")]
    RequestFailed(String),

    #[error("command rejected: {0}")]
    CommandRejected(String),

    #[error("profile '{0}' not found")]
    NotFound(String),

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("auto mode is active; manual relay control is disabled")]
    AutoModeActive,

    #[error("command timed out after {0} ms")]
    Timeout(u64),

    #[error("a command for {0} is already in flight")]
    AxisBusy(String),

    #[error("engine stopped")]
    EngineStopped,
}

impl EngineError {
    /// True for failures that the next poll tick or reconnect may clear.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::TransportUnavailable
                | EngineError::RequestFailed(_)
                | EngineError::Timeout(_)
        )
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            return EngineError::MalformedMessage(e.to_string());
        }
        match e.status() {
            Some(status) if status.is_client_error() => {
                EngineError::CommandRejected(format!("backend returned {status}"))
            }
            _ => EngineError::RequestFailed(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(EngineError::Timeout(5000).is_transient());
        assert!(EngineError::RequestFailed("503".into()).is_transient());
        assert!(!EngineError::NotFound("7".into()).is_transient());
        assert!(!EngineError::AutoModeActive.is_transient());
    }

    #[test]
    fn display_includes_detail() {
        let e = EngineError::NotFound("42".into());
        assert_eq!(e.to_string(), "profile '42' not found");
    }
}
