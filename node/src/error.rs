use thiserror::Error;

/// Terminal conditions of the node process.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("connection error: {0:#}")]
    Connection(anyhow::Error),

    #[error("failed to initialize resource: {0:#}")]
    ResourceInit(anyhow::Error),

    #[error("wallet error: {0:#}")]
    Wallet(anyhow::Error),

    #[error("must submit inbox address via --inbox if not running in forwarder or sequencer mode")]
    MissingInboxAddress,

    #[error("background failure: {0:#}")]
    Background(anyhow::Error),

    #[error("shutdown requested")]
    Cancelled,
}

impl NodeError {
    /// Process exit code for this terminal condition.
    pub fn exit_code(&self) -> i32 {
        match self {
            NodeError::Cancelled => 0,
            _ => 1,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, NodeError::Cancelled)
    }
}

pub type NodeResult<T> = Result<T, NodeError>;

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn only_cancellation_exits_cleanly() {
        assert_eq!(NodeError::Cancelled.exit_code(), 0);
        assert_eq!(NodeError::Configuration("x".into()).exit_code(), 1);
        assert_eq!(NodeError::Background(anyhow!("db")).exit_code(), 1);
        assert_eq!(NodeError::MissingInboxAddress.exit_code(), 1);
    }

    #[test]
    fn messages_keep_the_context_chain() {
        let err = NodeError::Connection(anyhow!("refused").context("error getting chain ID"));
        assert_eq!(
            err.to_string(),
            "connection error: error getting chain ID: refused"
        );
    }
}
