use std::path::PathBuf;
use thiserror::Error;

/// Failure taxonomy for every peer and traffic operation.
///
/// Parse-time anomalies never surface here: malformed peer blocks are
/// dropped and reported through [`crate::conf::ParseReport`].
#[derive(Debug, Error)]
pub enum KeeperError {
    #[error("client name {0:?} is empty after removing unsupported characters")]
    InvalidName(String),

    #[error("client name \"{0}\" already exists, choose another name")]
    DuplicateName(String),

    #[error("public key {0} is already configured for another peer")]
    DuplicatePublicKey(String),

    #[error("no saved profile for client \"{0}\"; it was added by hand or its profile was removed")]
    MissingProfile(String),

    #[error("no free address left in {subnet}")]
    SubnetExhausted { subnet: String },

    #[error("cannot determine VPN subnet: {0}")]
    InvalidInterface(String),

    #[error("WireGuard is not fully initialized yet (placeholder configuration)")]
    NotInitialized,

    #[error("client \"{target}\" not found; configured peers: {}", render_known(.known))]
    NotFound { target: String, known: Vec<String> },

    #[error("configuration would be left invalid ({}); nothing was written", .problems.join(", "))]
    StructuralCorruption { problems: Vec<String> },

    #[error("failed to apply configuration: {reason} ({})", rollback_note(.rolled_back))]
    ApplyFailure { reason: String, rolled_back: bool },

    #[error("`{command}` did not finish within {seconds}s")]
    Timeout { command: String, seconds: u64 },

    #[error("invalid transfer size {0:?}")]
    InvalidSize(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("traffic store {path:?} is corrupt: {source}")]
    CorruptStore {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

fn rollback_note(rolled_back: &bool) -> &'static str {
    if *rolled_back {
        "backup restored"
    } else {
        "backup could NOT be restored"
    }
}

fn render_known(known: &[String]) -> String {
    if known.is_empty() {
        "none".to_string()
    } else {
        known.join(", ")
    }
}

impl KeeperError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

pub type Result<T, E = KeeperError> = std::result::Result<T, E>;
