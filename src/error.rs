//! # Error Taxonomy
//!
//! Typed errors for the synchronization engine.
//!
//! - [`RpcError`]: failures at the chain-client boundary. Transient variants are recovered
//!   locally by the batch fetcher; permanent variants (decode, revert) bubble up to the unit of
//!   work that issued the query.
//! - [`SyncError`]: everything the engine itself can raise. [`SyncError::is_fatal`] decides
//!   whether a run must abort or can continue with the next unit of work.

use ethers::types::Address;

/// Errors raised by a [`crate::chain_client::ChainClient`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RpcError {
    #[error("rate limited by endpoint: {0}")]
    RateLimited(String),
    #[error("block range rejected by endpoint: {0}")]
    RangeTooLarge(String),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("failed to decode {what}: {message}")]
    Decode { what: String, message: String },
    #[error("call reverted: {0}")]
    Reverted(String),
}

impl RpcError {
    /// Classifies a raw provider error message the same way for every call site.
    pub fn from_provider_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        if lower.contains("429") || lower.contains("too many requests") || lower.contains("limit exceeded") {
            RpcError::RateLimited(message)
        } else if lower.contains("block range")
            || lower.contains("query returned more than")
            || lower.contains("response size")
        {
            RpcError::RangeTooLarge(message)
        } else if lower.contains("revert") {
            RpcError::Reverted(message)
        } else {
            RpcError::Transport(message)
        }
    }

    /// Transient errors are worth retrying with a smaller range.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RpcError::RateLimited(_) | RpcError::RangeTooLarge(_) | RpcError::Transport(_)
        )
    }
}

/// Errors raised by the synchronization engine.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// A required setting is missing or invalid. Raised before any network call.
    #[error("configuration error: {message} (set `{setting}`)")]
    Configuration { setting: String, message: String },

    #[error(transparent)]
    Rpc(#[from] RpcError),

    /// Failure scoped to one entity; recorded on the entity record, never aborts a run.
    #[error("entity {entity:?}: {message}")]
    EntityProcessing { entity: Address, message: String },

    /// Writing the progress state failed; resumability is compromised.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// A save would move a checkpoint backwards.
    #[error("checkpoint regression for {key}: committed {committed}, attempted {attempted}")]
    CheckpointRegression {
        key: String,
        committed: u64,
        attempted: u64,
    },

    #[error("registry error: {0}")]
    Registry(String),
}

impl SyncError {
    pub fn missing_setting(setting: impl Into<String>, message: impl Into<String>) -> Self {
        SyncError::Configuration {
            setting: setting.into(),
            message: message.into(),
        }
    }

    /// Fatal errors abort the whole run; the rest are logged and the run moves on.
    /// RPC errors are scoped by the caller (source or entity), so they are never fatal here.
    pub fn is_fatal(&self) -> bool {
        match self {
            SyncError::Configuration { .. }
            | SyncError::Persistence(_)
            | SyncError::CheckpointRegression { .. } => true,
            SyncError::Rpc(_) | SyncError::EntityProcessing { .. } | SyncError::Registry(_) => false,
        }
    }
}

impl From<std::io::Error> for SyncError {
    fn from(e: std::io::Error) -> Self {
        SyncError::Persistence(e.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Persistence(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_message_classification() {
        assert!(matches!(
            RpcError::from_provider_message("HTTP 429 Too Many Requests"),
            RpcError::RateLimited(_)
        ));
        assert!(matches!(
            RpcError::from_provider_message("query returned more than 10000 results"),
            RpcError::RangeTooLarge(_)
        ));
        assert!(matches!(
            RpcError::from_provider_message("execution reverted"),
            RpcError::Reverted(_)
        ));
        assert!(matches!(
            RpcError::from_provider_message("connection reset by peer"),
            RpcError::Transport(_)
        ));
    }

    #[test]
    fn test_fatal_classes() {
        assert!(SyncError::missing_setting("factories.x.start_block", "missing").is_fatal());
        assert!(SyncError::Persistence("disk full".into()).is_fatal());
        assert!(!SyncError::EntityProcessing {
            entity: Address::zero(),
            message: "decode".into()
        }
        .is_fatal());
        assert!(!SyncError::Rpc(RpcError::Transport("eof".into())).is_fatal());
        assert!(!SyncError::Rpc(RpcError::Decode {
            what: "ConfigSet".into(),
            message: "short data".into()
        })
        .is_fatal());
    }
}
