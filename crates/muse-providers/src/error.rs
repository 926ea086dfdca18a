use thiserror::Error;

/// Classified outcome of an outbound provider call. The adapters translate
/// raw transport results into these variants so the string-matching
/// heuristics stay out of the handlers; the API layer maps each variant to
/// an HTTP status.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The call exceeded its deadline. Retrying later may help.
    #[error("provider request timed out")]
    Timeout,

    /// Rate or quota pushback from the provider (HTTP 429/403 or quota
    /// wording in the response).
    #[error("provider throttled the request: {0}")]
    Throttled(String),

    /// The provider answered, but the feature is disabled or still being
    /// provisioned. Retrying immediately will not help.
    #[error("provider feature not ready: {0}")]
    NotReady(String),

    /// Missing credentials, or a response no correctly configured provider
    /// would produce.
    #[error("provider misconfigured: {0}")]
    Misconfigured(String),

    /// Asset storage refused the upload for quota reasons.
    #[error("storage quota exceeded: {0}")]
    StorageQuota(String),

    /// Catch-all transport failure.
    #[error("provider transport error: {0}")]
    Transport(String),
}
