use std::io;
use std::path::PathBuf;

use crate::ids::NodeId;

pub type HiveResult<T> = Result<T, HiveError>;

/// Error taxonomy for the orchestrator.
///
/// The router never surfaces these to its caller: routing failures become
/// bounces, dead-letters, and events. Gateway operations raise them
/// synchronously, and the CLI maps each kind to a stable exit code.
#[derive(Debug, thiserror::Error)]
pub enum HiveError {
    #[error("no route from '{from}' to '{to}'")]
    NoRoute { from: NodeId, to: NodeId },

    #[error("unknown node: {0}")]
    UnknownNode(NodeId),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("corrupt mail file {path}: {reason}")]
    MailCorrupt { path: PathBuf, reason: String },

    #[error("container runtime error: {0}")]
    ContainerRuntime(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("busy: {0}")]
    Busy(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("operation cancelled")]
    Cancelled,
}

impl HiveError {
    pub fn validation(field: &str, message: &str) -> Self {
        Self::Validation(format!("{field}: {message}"))
    }

    /// Short machine-readable kind tag, used in wire error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NoRoute { .. } => "no_route",
            Self::UnknownNode(_) => "unknown_node",
            Self::Validation(_) => "validation",
            Self::MailCorrupt { .. } => "mail_corrupt",
            Self::ContainerRuntime(_) => "container_runtime",
            Self::AlreadyExists(_) => "already_exists",
            Self::NotFound(_) => "not_found",
            Self::Busy(_) => "busy",
            Self::Io(_) => "io",
            Self::Cancelled => "cancelled",
        }
    }

    /// Stable process exit code for CLI front-ends. 0 is reserved for success.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::NoRoute { .. } => 10,
            Self::UnknownNode(_) => 11,
            Self::Validation(_) => 12,
            Self::MailCorrupt { .. } => 13,
            Self::ContainerRuntime(_) => 14,
            Self::AlreadyExists(_) => 15,
            Self::NotFound(_) => 16,
            Self::Busy(_) => 17,
            Self::Io(_) => 18,
            Self::Cancelled => 19,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_are_stable_and_nonzero() {
        let errors = [
            HiveError::NoRoute {
                from: NodeId::human(),
                to: NodeId::from("x"),
            },
            HiveError::UnknownNode(NodeId::from("x")),
            HiveError::Validation("v".into()),
            HiveError::MailCorrupt {
                path: PathBuf::from("/tmp/x.json"),
                reason: "bad".into(),
            },
            HiveError::ContainerRuntime("c".into()),
            HiveError::AlreadyExists("a".into()),
            HiveError::NotFound("n".into()),
            HiveError::Busy("b".into()),
            HiveError::Io(io::Error::other("io")),
            HiveError::Cancelled,
        ];
        let codes: Vec<u8> = errors.iter().map(|e| e.exit_code()).collect();
        assert_eq!(codes, vec![10, 11, 12, 13, 14, 15, 16, 17, 18, 19]);
        assert!(codes.iter().all(|&c| c != 0));
    }

    #[test]
    fn test_no_route_message_names_both_endpoints() {
        let err = HiveError::NoRoute {
            from: NodeId::from("a"),
            to: NodeId::from("b"),
        };
        let msg = err.to_string();
        assert!(msg.contains("'a'") && msg.contains("'b'"), "got: {msg}");
    }
}
