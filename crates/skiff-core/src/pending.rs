use crate::models::ActionClass;
use crate::store::{ServerStore, StoreError};
use chrono::Utc;
use log::warn;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Metadata keys, preserved verbatim from the legacy key contract.
pub const META_COMMAND_MUTEX: &str = "command_mutex";
pub const META_ACTION: &str = "action";
pub const META_ACTION_ARGS: &str = "action_args";
pub const META_ACTION_STATUS: &str = "action_status";

/// In-flight markers per server, stored under `command_mutex` as a map of
/// action class to the unix second it was set.
///
/// A marker is cleared by the success path, by the asynchronous completion
/// signal, or by the administrative [`clear_all`](PendingTracker::clear_all).
/// There is no timeout: if a completion signal is lost the marker stays
/// stuck until cleanup. Known operational gap, inherited from the script
/// contract.
pub struct PendingTracker<'a> {
    store: &'a ServerStore,
}

impl<'a> PendingTracker<'a> {
    pub fn new(store: &'a ServerStore) -> Self {
        PendingTracker { store }
    }

    pub fn is_pending(&self, id: &Uuid, class: ActionClass) -> Result<bool, StoreError> {
        Ok(self.read_markers(id)?.contains_key(class.as_str()))
    }

    /// Idempotent set. Re-marking an already pending class refreshes its
    /// timestamp.
    pub fn mark_pending(&self, id: &Uuid, class: ActionClass) -> Result<(), StoreError> {
        let mut markers = self.read_markers(id)?;
        markers.insert(class.as_str().to_string(), Utc::now().timestamp());
        self.write_markers(id, &markers)
    }

    /// Idempotent unset; a second call is a no-op.
    pub fn clear_pending(&self, id: &Uuid, class: ActionClass) -> Result<(), StoreError> {
        let mut markers = self.read_markers(id)?;
        if markers.remove(class.as_str()).is_some() {
            self.write_markers(id, &markers)?;
        }
        Ok(())
    }

    /// The administrative cleanup: unconditionally drop every pending marker
    /// and the dispatch context keys, regardless of which action set them.
    /// This is the only recovery path for a marker whose completion signal
    /// never arrived.
    pub fn clear_all(&self, id: &Uuid) -> Result<(), StoreError> {
        let markers = self.read_markers(id)?;
        if !markers.is_empty() {
            let stuck: Vec<&str> = markers.keys().map(String::as_str).collect();
            warn!("clearing pending markers for {id}: {}", stuck.join(", "));
        }
        self.store.delete_meta(id, META_COMMAND_MUTEX)?;
        self.store.delete_meta(id, META_ACTION)?;
        self.store.delete_meta(id, META_ACTION_ARGS)?;
        self.store.delete_meta(id, META_ACTION_STATUS)?;
        Ok(())
    }

    /// Mirror the dispatched action into the legacy context keys so an
    /// operator can see what is (or was) running against the server.
    pub fn record_context(&self, id: &Uuid, verb: &str, args: &str) -> Result<(), StoreError> {
        self.store.set_meta(id, META_ACTION, verb)?;
        self.store.set_meta(id, META_ACTION_ARGS, args)?;
        self.store.set_meta(id, META_ACTION_STATUS, "in-progress")?;
        Ok(())
    }

    pub fn mark_context_done(&self, id: &Uuid) -> Result<(), StoreError> {
        self.store.set_meta(id, META_ACTION_STATUS, "done")
    }

    fn read_markers(&self, id: &Uuid) -> Result<BTreeMap<String, i64>, StoreError> {
        let raw = self.store.get_meta(id, META_COMMAND_MUTEX)?;
        Ok(raw
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default())
    }

    fn write_markers(&self, id: &Uuid, markers: &BTreeMap<String, i64>) -> Result<(), StoreError> {
        if markers.is_empty() {
            self.store.delete_meta(id, META_COMMAND_MUTEX)
        } else {
            // Marker maps are tiny; serialization cannot realistically fail.
            let raw = serde_json::to_string(markers).unwrap_or_else(|_| "{}".into());
            self.store.set_meta(id, META_COMMAND_MUTEX, &raw)
        }
    }
}
