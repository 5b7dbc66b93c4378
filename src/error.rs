use serde::{Deserialize, Serialize};

/// Stable error taxonomy shared by the wire protocol and the operation
/// pipeline.
///
/// Every failure that crosses the wire boundary is normalized into one of
/// these kinds before serialization; raw transport errors are never placed in
/// a response. `ServerNotFound` is derived by the pipeline layer when a
/// non-preferred peer produced a retryable failure — the protocol layer never
/// emits it directly.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, thiserror::Error,
)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    #[error("request was malformed")]
    InvalidRequest,

    #[error("response was malformed")]
    InvalidResponse,

    #[error("connection to the peer was lost")]
    LostConnection,

    #[error("target device not found")]
    DeviceNotFound,

    #[error("request kind is not recognised")]
    UnknownRequest,

    #[error("unknown error")]
    Unknown,

    #[error("operation was cancelled")]
    Cancelled,

    #[error("no usable installation server was found")]
    ServerNotFound,
}

impl ErrorKind {
    /// Whether the pipeline should remap this error to [`ErrorKind::ServerNotFound`]
    /// when the located peer is not the caller's preferred one.
    pub fn is_retryable_on_other_peer(self) -> bool {
        matches!(self, ErrorKind::DeviceNotFound | ErrorKind::LostConnection)
    }
}
