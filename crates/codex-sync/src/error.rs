use codex_client::AppServerError;

/// Failures of lifecycle operations, reported to the caller that triggered them.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OperationError {
    #[error("server {0} is not connected")]
    NoConnection(String),
    #[error("unknown thread {0}")]
    UnknownThread(String),
    #[error("no active thread")]
    NoActiveThread,
    #[error("a turn is still running on this thread")]
    TurnActive,
    #[error("message has no turn provenance")]
    MissingTurnProvenance,
    #[error("thread has no known turns")]
    NoTurns,
    #[error("turn index {index} is out of range for {turn_count} turns")]
    TurnIndexOutOfRange { index: usize, turn_count: usize },
    #[error("message is not a user message at a turn boundary")]
    NotTurnBoundary,
    #[error("{0} must not be empty")]
    EmptyField(&'static str),
    #[error("no pending approval {0}")]
    UnknownApproval(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("connection error: {0}")]
    Connection(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error(transparent)]
    Operation(#[from] OperationError),
    #[error("server rejected request ({code}): {message}")]
    ServerRejection { code: i64, message: String },
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("config error: {0}")]
    Config(String),
}

impl SyncError {
    /// Classify a transport-level failure from a request round trip.
    pub fn from_rpc(err: &anyhow::Error) -> Self {
        if let Some(rejection) = err.downcast_ref::<AppServerError>() {
            return Self::ServerRejection {
                code: rejection.code,
                message: rejection.message.clone(),
            };
        }
        if err
            .chain()
            .any(|cause| cause.downcast_ref::<serde_json::Error>().is_some())
        {
            return Self::Protocol(format!("{err:#}"));
        }
        Self::Connection(format!("{err:#}"))
    }

    /// Server-provided error text, else the display form.
    pub fn reason(&self) -> String {
        match self {
            Self::ServerRejection { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_rejections_keep_code_and_message() {
        let err = anyhow::Error::new(AppServerError {
            code: -32000,
            message: "missing codex-linux-sandbox executable path".to_string(),
        });
        match SyncError::from_rpc(&err) {
            SyncError::ServerRejection { code, message } => {
                assert_eq!(code, -32000);
                assert!(message.contains("codex-linux-sandbox"));
            }
            other => panic!("unexpected classification: {other:?}"),
        }
    }

    #[test]
    fn decode_failures_are_protocol_errors() {
        let decode = serde_json::from_str::<u32>("\"nope\"").map_err(anyhow::Error::from);
        let err = match decode {
            Ok(_) => panic!("decode should fail"),
            Err(err) => err.context("App-server response parse failed for thread/start"),
        };
        assert!(matches!(SyncError::from_rpc(&err), SyncError::Protocol(_)));

        let closed = anyhow::anyhow!("App-server connection closed");
        assert!(matches!(
            SyncError::from_rpc(&closed),
            SyncError::Connection(_)
        ));
    }
}
