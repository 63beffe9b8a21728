use thiserror::Error;

/// Failures surfaced to callers of `AgentRegistry::get_or_create`.
///
/// Duplicate-creation races are not errors; they resolve silently through
/// the pending-set protocol.
#[derive(Debug, Error)]
pub enum StartError {
    /// A required credential is missing. Fatal to agent construction, no retry.
    #[error("generation provider is not configured: {0}")]
    MissingCredential(#[source] anyhow::Error),

    /// Agent construction or channel handshake failed.
    #[error("agent creation failed: {0}")]
    CreationFailed(#[source] anyhow::Error),
}
