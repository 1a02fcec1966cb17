use crate::models::Server;
use log::warn;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] sled::Error),
    #[error("failed to decode record: {0}")]
    Codec(#[from] bincode::Error),
}

/// Persistence for server records and their metadata bags.
///
/// Records live under `server:{id}`; metadata entries are individual keys
/// under `meta:{id}:{key}` so each key can be read and written on its own,
/// the way the upstream per-key metadata API worked. Bag values that hold
/// collections (pending markers, console history, managed ports) are still
/// read-modify-write as a whole; the dispatcher serializes those per server.
#[derive(Clone)]
pub struct ServerStore {
    db: sled::Db,
}

impl ServerStore {
    pub fn open() -> Result<Self, StoreError> {
        use directories::ProjectDirs;

        // macOS: ~/Library/Application Support/io.skiff.skiff
        // Linux: ~/.local/share/skiff
        let db_path = if let Some(proj_dirs) = ProjectDirs::from("io", "skiff", "skiff") {
            let data_dir = proj_dirs.data_dir();
            if let Err(e) = std::fs::create_dir_all(data_dir) {
                warn!("failed to create data directory ({e}), falling back to cwd");
                std::path::PathBuf::from("skiff.db")
            } else {
                data_dir.join("skiff.db")
            }
        } else {
            warn!("could not determine data directory, falling back to cwd");
            std::path::PathBuf::from("skiff.db")
        };

        let db = sled::open(&db_path)?;
        Ok(ServerStore { db })
    }

    pub fn new_test() -> Self {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .expect("temporary sled tree");
        ServerStore { db }
    }

    pub fn upsert_server(&self, server: &Server) -> Result<Uuid, StoreError> {
        let key = format!("server:{}", server.id);
        let value = bincode::serialize(server)?;
        self.db.insert(key.as_bytes(), value)?;
        Ok(server.id)
    }

    pub fn get_server(&self, id: &Uuid) -> Result<Option<Server>, StoreError> {
        let key = format!("server:{id}");
        match self.db.get(key.as_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn list_servers(&self) -> Result<Vec<Server>, StoreError> {
        let mut servers = Vec::new();
        for entry in self.db.scan_prefix(b"server:") {
            let (_, value) = entry?;
            servers.push(bincode::deserialize(&value)?);
        }
        Ok(servers)
    }

    /// Removes the record and its entire metadata bag.
    pub fn remove_server(&self, id: &Uuid) -> Result<(), StoreError> {
        let key = format!("server:{id}");
        self.db.remove(key.as_bytes())?;

        let prefix = format!("meta:{id}:");
        let stale: Vec<sled::IVec> = self
            .db
            .scan_prefix(prefix.as_bytes())
            .filter_map(|entry| entry.ok())
            .map(|(k, _)| k)
            .collect();
        for k in stale {
            self.db.remove(k)?;
        }
        Ok(())
    }

    pub fn get_meta(&self, id: &Uuid, key: &str) -> Result<Option<String>, StoreError> {
        let db_key = format!("meta:{id}:{key}");
        Ok(self
            .db
            .get(db_key.as_bytes())?
            .map(|bytes| String::from_utf8_lossy(&bytes).to_string()))
    }

    pub fn set_meta(&self, id: &Uuid, key: &str, value: &str) -> Result<(), StoreError> {
        let db_key = format!("meta:{id}:{key}");
        self.db.insert(db_key.as_bytes(), value.as_bytes())?;
        Ok(())
    }

    pub fn delete_meta(&self, id: &Uuid, key: &str) -> Result<(), StoreError> {
        let db_key = format!("meta:{id}:{key}");
        self.db.remove(db_key.as_bytes())?;
        Ok(())
    }
}
