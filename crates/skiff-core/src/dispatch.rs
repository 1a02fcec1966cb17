use crate::history::{CommandHistory, HistoryError};
use crate::models::{
    ActionClass, AuthMethod, CommandDescriptor, CommandId, CommandIdError, Outcome, ScriptParam,
    Server, ServerAction, ValidationError,
};
use crate::pending::PendingTracker;
use crate::scripts::{self, ScriptRepository, TemplateError};
use crate::secrets::{SecretError, SecretStore};
use crate::store::{ServerStore, StoreError};
use crate::transport::{ConnectionInfo, ResolvedAuth, Transport, TransportError};
use chrono::Utc;
use log::{info, warn};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use uuid::Uuid;

/// Feature-data metadata keys, preserved verbatim from the legacy contract.
pub const META_GIT_DATA: &str = "git_data";
pub const META_FIREWALL_MANAGED_PORTS: &str = "firewall_managed_ports";
pub const META_TWEAKS_DATA: &str = "tweaks_data";
pub const META_STATS_DATA: &str = "stats_data";
pub const META_USERS_DATA: &str = "users_data";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GitMeta {
    pub installed: bool,
    pub version: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TweaksMeta {
    pub gzip_enabled: bool,
}

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("target resolution failed: {0}")]
    TargetResolution(String),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("action class '{class}' is already in progress for this server")]
    Conflict { class: ActionClass },
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error("transport failed while running '{verb}': {source}")]
    Transport {
        verb: &'static str,
        #[source]
        source: TransportError,
    },
    #[error("remote command reported no success marker:\n{raw_output}")]
    CommandFailed { raw_output: String },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Secret(#[from] SecretError),
    #[error(transparent)]
    History(#[from] HistoryError),
    #[error(transparent)]
    CommandId(#[from] CommandIdError),
}

/// The façade callers use to run a logical action against a managed server.
///
/// Resolves the target record, validates parameters, renders the script,
/// ships it over the transport, classifies the output, applies the
/// action-specific state mutation and maintains the in-flight marker.
///
/// A per-server mutex serializes the read-modify-write around each server's
/// metadata bag, so the dispatcher is safe to call concurrently for
/// different servers. A second action of the same class against a server
/// that is already pending is rejected with [`DispatchError::Conflict`].
pub struct Dispatcher {
    store: ServerStore,
    secrets: SecretStore,
    scripts: Box<dyn ScriptRepository>,
    transport: Box<dyn Transport>,
    locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl Dispatcher {
    pub fn new(
        store: ServerStore,
        secrets: SecretStore,
        scripts: Box<dyn ScriptRepository>,
        transport: Box<dyn Transport>,
    ) -> Self {
        Dispatcher {
            store,
            secrets,
            scripts,
            transport,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &ServerStore {
        &self.store
    }

    pub fn history(&self) -> CommandHistory<'_> {
        CommandHistory::new(&self.store, &self.secrets)
    }

    pub fn run(&self, server_id: &Uuid, action: ServerAction) -> Result<Outcome, DispatchError> {
        let lock = self.lock_for(server_id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let server = self
            .store
            .get_server(server_id)?
            .ok_or_else(|| DispatchError::TargetResolution(format!("no record for {server_id}")))?;

        action.validate(&server)?;

        let tracker = PendingTracker::new(&self.store);
        let class = action.action_class();
        if tracker.is_pending(server_id, class)? {
            return Err(DispatchError::Conflict { class });
        }

        let descriptor = self.describe(&server, &action)?;
        let conn = self.connection_info(&server)?;

        tracker.mark_pending(server_id, class)?;
        let args = serde_json::to_string(&action).unwrap_or_default();
        tracker.record_context(server_id, action.verb(), &args)?;

        info!(
            "dispatching {} to {} ({})",
            descriptor.command_id, server.name, server.hostname
        );

        // A transport failure leaves the marker set: only the out-of-band
        // completion signal or an explicit cleanup clears it, because the
        // remote side may still be running the script.
        let raw_output = self
            .transport
            .execute(&conn, &descriptor.rendered_payload)
            .map_err(|source| DispatchError::Transport {
                verb: action.verb(),
                source,
            })?;

        if !scripts::is_successful(&raw_output, action.script_id()) {
            return Err(DispatchError::CommandFailed { raw_output });
        }

        let structured_message = self.apply_success(&server, &action, &raw_output)?;
        tracker.clear_pending(server_id, class)?;
        tracker.mark_context_done(server_id)?;

        Ok(Outcome {
            success: true,
            raw_output,
            structured_message,
            refresh: action.refreshes_state(),
        })
    }

    /// First-class recovery path for a stuck in-flight marker: drop every
    /// pending marker on the server, regardless of which action set it.
    pub fn cleanup(&self, server_id: &Uuid) -> Result<(), DispatchError> {
        let lock = self.lock_for(server_id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        PendingTracker::new(&self.store).clear_all(server_id)?;
        Ok(())
    }

    /// Clear the pending marker named by a completion-signal verb, under the
    /// same per-server lock the dispatch path holds, so an inbound signal
    /// cannot interleave with a concurrent dispatch's read-modify-write on
    /// the marker map. Verbs without an action class are a no-op.
    pub fn acknowledge_completion(
        &self,
        server_id: &Uuid,
        verb: &str,
    ) -> Result<(), StoreError> {
        let lock = self.lock_for(server_id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(class) = ActionClass::for_verb(verb) {
            PendingTracker::new(&self.store).clear_pending(server_id, class)?;
        }
        Ok(())
    }

    /// Remove a server record, its metadata bag and its dispatch lock.
    pub fn remove_server(&self, server_id: &Uuid) -> Result<(), DispatchError> {
        let lock = self.lock_for(server_id);
        let guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        self.store.remove_server(server_id)?;
        drop(guard);

        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.remove(server_id);
        Ok(())
    }

    fn lock_for(&self, server_id: &Uuid) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(*server_id).or_default().clone()
    }

    fn describe(
        &self,
        server: &Server,
        action: &ServerAction,
    ) -> Result<CommandDescriptor, DispatchError> {
        // Server-scoped actions correlate on the server name; a nameless
        // record gets a stable placeholder so the id still has three fields.
        let target_ref = if server.name.trim().is_empty() {
            "server".to_string()
        } else {
            server.name.clone()
        };
        let command_id = CommandId::new(action.verb(), &target_ref)?;

        // Every script gets the command id as an implicit parameter: the
        // remote side echoes it back in the completion callback, and this is
        // the only place it can learn the name.
        let mut params = action.params();
        params.push(ScriptParam::escaped("command_id", command_id.as_str()));
        let rendered_payload =
            scripts::render(self.scripts.as_ref(), action.script_id(), &params)?;
        Ok(CommandDescriptor {
            command_id,
            verb: action.verb(),
            target_ref,
            created_at: Utc::now(),
            rendered_payload,
        })
    }

    fn connection_info(&self, server: &Server) -> Result<ConnectionInfo, DispatchError> {
        let auth = match &server.auth {
            AuthMethod::Password(ciphertext) => {
                ResolvedAuth::Password(self.secrets.decrypt(ciphertext).map_err(|e| {
                    DispatchError::TargetResolution(format!(
                        "cannot decrypt password for {}: {e}",
                        server.name
                    ))
                })?)
            }
            AuthMethod::KeyData(ciphertext) => {
                ResolvedAuth::KeyData(self.secrets.decrypt(ciphertext).map_err(|e| {
                    DispatchError::TargetResolution(format!(
                        "cannot decrypt private key for {}: {e}",
                        server.name
                    ))
                })?)
            }
            AuthMethod::KeyFile(path) => ResolvedAuth::KeyFile(path.clone()),
            AuthMethod::Agent => ResolvedAuth::Agent,
        };
        Ok(ConnectionInfo {
            hostname: server.hostname.clone(),
            port: server.port,
            username: server.username.clone(),
            auth,
        })
    }

    fn apply_success(
        &self,
        server: &Server,
        action: &ServerAction,
        raw_output: &str,
    ) -> Result<Option<String>, DispatchError> {
        match action {
            ServerAction::GitInstall { .. } => {
                let meta = GitMeta {
                    installed: true,
                    version: extract_git_version(raw_output),
                };
                self.write_json_meta(&server.id, META_GIT_DATA, &meta)?;
                Ok(Some("git installed".into()))
            }
            ServerAction::GitVersion => {
                let mut meta: GitMeta = self.read_json_meta(&server.id, META_GIT_DATA)?;
                meta.version = extract_git_version(raw_output);
                let message = meta.version.clone();
                self.write_json_meta(&server.id, META_GIT_DATA, &meta)?;
                Ok(message)
            }
            ServerAction::ResizeServer { new_size } => {
                let mut updated = server.clone();
                updated.size = new_size.clone();
                self.store.upsert_server(&updated)?;
                Ok(Some(format!("server resized to {new_size}")))
            }
            ServerAction::OpenPort { port } => {
                let mut ports: Vec<u16> =
                    self.read_json_meta(&server.id, META_FIREWALL_MANAGED_PORTS)?;
                if !ports.contains(port) {
                    ports.push(*port);
                    ports.sort_unstable();
                }
                self.write_json_meta(&server.id, META_FIREWALL_MANAGED_PORTS, &ports)?;
                Ok(Some(format!("port {port} opened")))
            }
            ServerAction::ClosePort { port } => {
                let mut ports: Vec<u16> =
                    self.read_json_meta(&server.id, META_FIREWALL_MANAGED_PORTS)?;
                ports.retain(|p| p != port);
                self.write_json_meta(&server.id, META_FIREWALL_MANAGED_PORTS, &ports)?;
                Ok(Some(format!("port {port} closed")))
            }
            ServerAction::AddSshKey { user, .. } => {
                Ok(Some(format!("key added for {user}")))
            }
            ServerAction::RemoveSshKey { user, .. } => {
                Ok(Some(format!("key removed for {user}")))
            }
            ServerAction::AddSystemUser { username, password } => {
                let mut users: BTreeMap<String, String> =
                    self.read_json_meta(&server.id, META_USERS_DATA)?;
                users.insert(username.clone(), self.secrets.encrypt(password)?);
                self.write_json_meta(&server.id, META_USERS_DATA, &users)?;
                Ok(Some(format!("user {username} added")))
            }
            ServerAction::RemoveSystemUser { username } => {
                let mut users: BTreeMap<String, String> =
                    self.read_json_meta(&server.id, META_USERS_DATA)?;
                users.remove(username);
                self.write_json_meta(&server.id, META_USERS_DATA, &users)?;
                Ok(Some(format!("user {username} removed")))
            }
            ServerAction::ToggleGzip { enabled } => {
                let mut meta: TweaksMeta = self.read_json_meta(&server.id, META_TWEAKS_DATA)?;
                meta.gzip_enabled = *enabled;
                self.write_json_meta(&server.id, META_TWEAKS_DATA, &meta)?;
                Ok(Some(format!(
                    "gzip {}",
                    if *enabled { "enabled" } else { "disabled" }
                )))
            }
            ServerAction::CollectStatistics => {
                self.store
                    .set_meta(&server.id, META_STATS_DATA, raw_output.trim())?;
                Ok(Some("statistics collected".into()))
            }
            ServerAction::ConsoleCommand { command } => {
                self.history().record(&server.id, command)?;
                Ok(None)
            }
        }
    }

    fn read_json_meta<T: DeserializeOwned + Default>(
        &self,
        id: &Uuid,
        key: &str,
    ) -> Result<T, StoreError> {
        read_typed(&self.store, id, key)
    }

    fn write_json_meta<T: Serialize>(
        &self,
        id: &Uuid,
        key: &str,
        value: &T,
    ) -> Result<(), StoreError> {
        let raw = serde_json::to_string(value).unwrap_or_default();
        self.store.set_meta(id, key, &raw)
    }
}

/// Typed read of a server's git state; preserves the legacy `git_data` key.
pub fn git_meta(store: &ServerStore, id: &Uuid) -> Result<GitMeta, StoreError> {
    read_typed(store, id, META_GIT_DATA)
}

pub fn tweaks_meta(store: &ServerStore, id: &Uuid) -> Result<TweaksMeta, StoreError> {
    read_typed(store, id, META_TWEAKS_DATA)
}

pub fn managed_ports(store: &ServerStore, id: &Uuid) -> Result<Vec<u16>, StoreError> {
    read_typed(store, id, META_FIREWALL_MANAGED_PORTS)
}

fn read_typed<T: DeserializeOwned + Default>(
    store: &ServerStore,
    id: &Uuid,
    key: &str,
) -> Result<T, StoreError> {
    Ok(match store.get_meta(id, key)? {
        Some(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
            warn!("discarding corrupt metadata under '{key}' for {id}: {e}");
            T::default()
        }),
        None => T::default(),
    })
}

fn extract_git_version(raw_output: &str) -> Option<String> {
    raw_output
        .lines()
        .find(|line| line.contains("git version"))
        .map(|line| line.trim().to_string())
}
