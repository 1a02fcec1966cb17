pub mod ssh;

pub use ssh::SshTransport;

use thiserror::Error;

/// Connection details with credentials already decrypted. Built by the
/// dispatcher from a server record plus the secret store; never persisted.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub auth: ResolvedAuth,
}

#[derive(Clone)]
pub enum ResolvedAuth {
    Password(String),
    KeyData(String),
    KeyFile(String),
    Agent,
}

// Keep key material and passwords out of Debug output.
impl std::fmt::Debug for ResolvedAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolvedAuth::Password(_) => f.write_str("Password(<redacted>)"),
            ResolvedAuth::KeyData(_) => f.write_str("KeyData(<redacted>)"),
            ResolvedAuth::KeyFile(path) => write!(f, "KeyFile({path})"),
            ResolvedAuth::Agent => f.write_str("Agent"),
        }
    }
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    #[error("SSH error: {0}")]
    Ssh(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Ships one command line to a remote host and returns whatever text came
/// back, stdout and stderr combined.
///
/// Calls block for the whole remote round trip and enforce no timeout of
/// their own; a caller wanting one must wrap the call externally. The
/// transport never retries, and no exit-code channel is assumed: success is
/// inferred from output content by the classifier.
pub trait Transport: Send + Sync {
    fn execute(&self, conn: &ConnectionInfo, command_text: &str)
    -> Result<String, TransportError>;
}
