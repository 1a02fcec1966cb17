use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// How we authenticate against a managed server.
///
/// `Password` and `KeyData` hold ciphertext produced by
/// [`crate::secrets::SecretStore`]; plaintext credentials never touch disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AuthMethod {
    Password(String),
    KeyData(String),
    KeyFile(String),
    Agent,
}

/// One managed remote host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub id: Uuid,
    pub name: String,
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub auth: AuthMethod,
    pub provider: String,
    pub size: String,
    pub web_server: String,
    pub created_at: DateTime<Utc>,
}

/// Action families that share one in-flight marker slot. Two actions of the
/// same class cannot run against the same server at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionClass {
    Git,
    Firewall,
    Resize,
    SshKeys,
    Users,
    Tweaks,
    Statistics,
    Console,
}

impl ActionClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionClass::Git => "git",
            ActionClass::Firewall => "firewall",
            ActionClass::Resize => "resize",
            ActionClass::SshKeys => "ssh_keys",
            ActionClass::Users => "users",
            ActionClass::Tweaks => "tweaks",
            ActionClass::Statistics => "statistics",
            ActionClass::Console => "console",
        }
    }

    /// Map a completion-signal verb back to its class so the inbound handler
    /// knows which marker to clear.
    pub fn for_verb(verb: &str) -> Option<ActionClass> {
        match verb {
            "git_install" | "git_version" => Some(ActionClass::Git),
            "ufw_open_port" | "ufw_close_port" => Some(ActionClass::Firewall),
            "server-resize" => Some(ActionClass::Resize),
            "ssh_key_add" | "ssh_key_remove" => Some(ActionClass::SshKeys),
            "user_add" | "user_remove" => Some(ActionClass::Users),
            "gzip_toggle" => Some(ActionClass::Tweaks),
            "collect_statistics" => Some(ActionClass::Statistics),
            "console_command" => Some(ActionClass::Console),
            _ => None,
        }
    }
}

impl fmt::Display for ActionClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("invalid value for '{field}': {reason}")]
pub struct ValidationError {
    pub field: &'static str,
    pub reason: String,
}

impl ValidationError {
    fn new(field: &'static str, reason: impl Into<String>) -> Self {
        ValidationError {
            field,
            reason: reason.into(),
        }
    }
}

/// One parameter substituted into a script template. Values are
/// shell-escaped at render time unless `raw` is set.
#[derive(Debug, Clone)]
pub struct ScriptParam {
    pub name: &'static str,
    pub value: String,
    pub raw: bool,
}

impl ScriptParam {
    pub fn escaped(name: &'static str, value: impl Into<String>) -> Self {
        ScriptParam {
            name,
            value: value.into(),
            raw: false,
        }
    }

    pub fn raw(name: &'static str, value: impl Into<String>) -> Self {
        ScriptParam {
            name,
            value: value.into(),
            raw: true,
        }
    }
}

/// Every remote action the orchestrator can dispatch, with the parameters it
/// needs. Adding an action means adding a variant here and a script (plus
/// success marker) to the script repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ServerAction {
    GitInstall { email: String, name: String },
    GitVersion,
    ResizeServer { new_size: String },
    OpenPort { port: u16 },
    ClosePort { port: u16 },
    AddSshKey { user: String, public_key: String },
    RemoveSshKey { user: String, fingerprint: String },
    AddSystemUser { username: String, password: String },
    RemoveSystemUser { username: String },
    ToggleGzip { enabled: bool },
    CollectStatistics,
    ConsoleCommand { command: String },
}

impl ServerAction {
    pub fn verb(&self) -> &'static str {
        match self {
            ServerAction::GitInstall { .. } => "git_install",
            ServerAction::GitVersion => "git_version",
            ServerAction::ResizeServer { .. } => "server-resize",
            ServerAction::OpenPort { .. } => "ufw_open_port",
            ServerAction::ClosePort { .. } => "ufw_close_port",
            ServerAction::AddSshKey { .. } => "ssh_key_add",
            ServerAction::RemoveSshKey { .. } => "ssh_key_remove",
            ServerAction::AddSystemUser { .. } => "user_add",
            ServerAction::RemoveSystemUser { .. } => "user_remove",
            ServerAction::ToggleGzip { .. } => "gzip_toggle",
            ServerAction::CollectStatistics => "collect_statistics",
            ServerAction::ConsoleCommand { .. } => "console_command",
        }
    }

    pub fn script_id(&self) -> &'static str {
        match self {
            ServerAction::GitInstall { .. } => "git-install",
            ServerAction::GitVersion => "git-version",
            ServerAction::ResizeServer { .. } => "server-resize",
            ServerAction::OpenPort { .. } => "ufw-open-port",
            ServerAction::ClosePort { .. } => "ufw-close-port",
            ServerAction::AddSshKey { .. } => "ssh-key-add",
            ServerAction::RemoveSshKey { .. } => "ssh-key-remove",
            ServerAction::AddSystemUser { .. } => "user-add",
            ServerAction::RemoveSystemUser { .. } => "user-remove",
            ServerAction::ToggleGzip { .. } => "gzip-toggle",
            ServerAction::CollectStatistics => "collect-statistics",
            ServerAction::ConsoleCommand { .. } => "console-command",
        }
    }

    pub fn action_class(&self) -> ActionClass {
        match self {
            ServerAction::GitInstall { .. } | ServerAction::GitVersion => ActionClass::Git,
            ServerAction::ResizeServer { .. } => ActionClass::Resize,
            ServerAction::OpenPort { .. } | ServerAction::ClosePort { .. } => {
                ActionClass::Firewall
            }
            ServerAction::AddSshKey { .. } | ServerAction::RemoveSshKey { .. } => {
                ActionClass::SshKeys
            }
            ServerAction::AddSystemUser { .. } | ServerAction::RemoveSystemUser { .. } => {
                ActionClass::Users
            }
            ServerAction::ToggleGzip { .. } => ActionClass::Tweaks,
            ServerAction::CollectStatistics => ActionClass::Statistics,
            ServerAction::ConsoleCommand { .. } => ActionClass::Console,
        }
    }

    /// Parameters handed to the template engine. The console command is the
    /// one deliberate raw field: the operator's text goes through verbatim.
    pub fn params(&self) -> Vec<ScriptParam> {
        match self {
            ServerAction::GitInstall { email, name } => vec![
                ScriptParam::escaped("email", email.clone()),
                ScriptParam::escaped("name", name.clone()),
            ],
            ServerAction::GitVersion => vec![],
            ServerAction::ResizeServer { new_size } => {
                vec![ScriptParam::escaped("new_size", new_size.clone())]
            }
            ServerAction::OpenPort { port } | ServerAction::ClosePort { port } => {
                vec![ScriptParam::escaped("port", port.to_string())]
            }
            ServerAction::AddSshKey { user, public_key } => vec![
                ScriptParam::escaped("user", user.clone()),
                ScriptParam::escaped("public_key", public_key.clone()),
            ],
            ServerAction::RemoveSshKey { user, fingerprint } => vec![
                ScriptParam::escaped("user", user.clone()),
                ScriptParam::escaped("fingerprint", fingerprint.clone()),
            ],
            ServerAction::AddSystemUser { username, password } => vec![
                ScriptParam::escaped("username", username.clone()),
                ScriptParam::escaped("password", password.clone()),
            ],
            ServerAction::RemoveSystemUser { username } => {
                vec![ScriptParam::escaped("username", username.clone())]
            }
            ServerAction::ToggleGzip { enabled } => vec![ScriptParam::escaped(
                "state",
                if *enabled { "on" } else { "off" },
            )],
            ServerAction::CollectStatistics => vec![],
            ServerAction::ConsoleCommand { command } => {
                vec![ScriptParam::raw("command", command.clone())]
            }
        }
    }

    /// Action-specific parameter checks, run before any network call.
    pub fn validate(&self, server: &Server) -> Result<(), ValidationError> {
        match self {
            ServerAction::GitInstall { email, name } => {
                if email.trim().is_empty() {
                    return Err(ValidationError::new("email", "must not be empty"));
                }
                if name.trim().is_empty() {
                    return Err(ValidationError::new("name", "must not be empty"));
                }
            }
            ServerAction::ResizeServer { new_size } => {
                if new_size.trim().is_empty() {
                    return Err(ValidationError::new("new_size", "must not be empty"));
                }
                if *new_size == server.size {
                    return Err(ValidationError::new(
                        "new_size",
                        format!("server is already size '{}'", server.size),
                    ));
                }
            }
            ServerAction::OpenPort { port } | ServerAction::ClosePort { port } => {
                // Port 22 carries the SSH session we manage the server over.
                if *port == 22 {
                    return Err(ValidationError::new(
                        "port",
                        "port 22 is reserved for SSH and cannot be managed",
                    ));
                }
                if *port == 0 {
                    return Err(ValidationError::new("port", "port must be 1-65535"));
                }
            }
            ServerAction::AddSshKey { user, public_key } => {
                if user.trim().is_empty() {
                    return Err(ValidationError::new("user", "must not be empty"));
                }
                if public_key.trim().is_empty() {
                    return Err(ValidationError::new("public_key", "must not be empty"));
                }
            }
            ServerAction::RemoveSshKey { user, fingerprint } => {
                if user.trim().is_empty() {
                    return Err(ValidationError::new("user", "must not be empty"));
                }
                if fingerprint.trim().is_empty() {
                    return Err(ValidationError::new("fingerprint", "must not be empty"));
                }
            }
            ServerAction::AddSystemUser { username, password } => {
                if username.trim().is_empty() {
                    return Err(ValidationError::new("username", "must not be empty"));
                }
                if password.is_empty() {
                    return Err(ValidationError::new("password", "must not be empty"));
                }
            }
            ServerAction::RemoveSystemUser { username } => {
                if username.trim().is_empty() {
                    return Err(ValidationError::new("username", "must not be empty"));
                }
                if username == "root" {
                    return Err(ValidationError::new("username", "refusing to remove root"));
                }
            }
            ServerAction::ConsoleCommand { command } => {
                if command.trim().is_empty() {
                    return Err(ValidationError::new("command", "must not be empty"));
                }
            }
            ServerAction::GitVersion
            | ServerAction::ToggleGzip { .. }
            | ServerAction::CollectStatistics => {}
        }
        Ok(())
    }

    /// Whether a success means cached UI state for this server is now stale.
    pub fn refreshes_state(&self) -> bool {
        !matches!(self, ServerAction::GitVersion)
    }
}

/// Delimiter shared with the asynchronous completion callback, which splits
/// command names into exactly three fields.
pub const COMMAND_ID_DELIMITER: &str = "---";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CommandIdError {
    #[error("'{0}' contains the reserved delimiter '---'")]
    ReservedDelimiter(String),
    #[error("command id '{0}' does not split into verb---domain---nonce")]
    Malformed(String),
}

/// Correlates a dispatched command with its completion signal.
///
/// Format: `<verb>---<target_ref>---<unix_seconds>`. The nonce has second
/// granularity, so two identical verbs against the same target within the
/// same second produce the same id. Collisions are tolerable because the id
/// is only used for correlation, never as a storage key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandId(String);

impl CommandId {
    pub fn new(verb: &str, target_ref: &str) -> Result<Self, CommandIdError> {
        if verb.contains(COMMAND_ID_DELIMITER) {
            return Err(CommandIdError::ReservedDelimiter(verb.to_string()));
        }
        if target_ref.contains(COMMAND_ID_DELIMITER) {
            return Err(CommandIdError::ReservedDelimiter(target_ref.to_string()));
        }
        Ok(CommandId(format!(
            "{verb}{COMMAND_ID_DELIMITER}{target_ref}{COMMAND_ID_DELIMITER}{}",
            Utc::now().timestamp()
        )))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Split a wire command name into `(verb, domain, nonce)`.
    pub fn parse(raw: &str) -> Result<(String, String, String), CommandIdError> {
        let parts: Vec<&str> = raw.split(COMMAND_ID_DELIMITER).collect();
        match parts.as_slice() {
            [verb, domain, nonce] => {
                Ok((verb.to_string(), domain.to_string(), nonce.to_string()))
            }
            _ => Err(CommandIdError::Malformed(raw.to_string())),
        }
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Ephemeral per-dispatch record. Built by the orchestrator, echoed back in
/// remote output for correlation, never persisted.
#[derive(Debug, Clone)]
pub struct CommandDescriptor {
    pub command_id: CommandId,
    pub verb: &'static str,
    pub target_ref: String,
    pub created_at: DateTime<Utc>,
    pub rendered_payload: String,
}

/// Structured result handed back to callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outcome {
    pub success: bool,
    pub raw_output: String,
    pub structured_message: Option<String>,
    /// Hint that cached UI state for the target is now stale.
    pub refresh: bool,
}
