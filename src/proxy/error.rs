// Failure kinds surfaced by the proxy pipeline

use thiserror::Error;

use super::credentials::NoCredentialAvailable;
use crate::api::gemini::UpstreamError;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum ProxyError {
    /// The client body could not be parsed; upstream is never contacted.
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("no upstream credential available")]
    NoCredentialAvailable,

    /// Network error, timeout or non-2xx status from upstream.
    #[error("upstream failure: {0}")]
    UpstreamFailure(#[from] UpstreamError),

    /// Upstream answered 2xx with a payload we could not understand.
    #[error("unexpected upstream payload: {0}")]
    TranslationFailure(String),

    #[error("conversation store failure: {0}")]
    Store(#[from] StoreError),
}

impl From<NoCredentialAvailable> for ProxyError {
    fn from(_: NoCredentialAvailable) -> Self {
        ProxyError::NoCredentialAvailable
    }
}
